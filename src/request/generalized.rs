//! Generalized requests
//!
//! A generalized request tracks an operation the runtime does not perform itself, e.g. one driven
//! by an external I/O library or a helper thread.  The caller supplies the behaviour through
//! [`GeneralizedOps`](trait.GeneralizedOps.html), either by implementing the trait or by handing
//! plain functions and an opaque state to [`Callbacks`](struct.Callbacks.html), and reports the
//! end of the operation through `generalized_request_complete`.  From then on the request behaves
//! like any other: it can be waited on, tested and cancelled through its handle.
//!
//! Callbacks run outside the runtime's critical section, one at a time per request.  They may
//! call back into the runtime, e.g. `cancel` may complete or free its own request, but must not
//! wait on it.  A request is never released while one of its callbacks runs; if a callback drops
//! the last reference, `free` runs on the same thread right after the callback returns.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use log::{debug, trace, warn};

use crate::environment::Universe;
use crate::error::{Callback, Error, ErrorClass, Result};
use crate::handle::RawRequest;
use crate::point_to_point::Status;
use crate::request::object::{Payload, RequestKind, RequestObject, SharedOps};
use crate::runtime::Runtime;

/// Result of a callback.  An `Err` is attached to the request and reported to its waiter.
pub type CallbackResult = std::result::Result<(), ErrorClass>;

/// The behaviour of a generalized request.
///
/// # Standard section(s)
///
/// 13.2
pub trait GeneralizedOps: Send {
    /// Fills in `status` as if a native operation had completed.
    ///
    /// Called on every wait, test or status query that finds the request complete, so it may run
    /// several times and must not consume anything.
    fn query(&mut self, status: &mut Status) -> CallbackResult;

    /// Releases the resources of the operation.  Called exactly once, after the request is
    /// complete and the last reference to it has been released.
    fn free(&mut self) -> CallbackResult;

    /// Asks the operation to stop.  `complete` tells whether the request was already completed
    /// when cancellation was requested.  The operation still has to be completed afterwards.
    fn cancel(&mut self, complete: bool) -> CallbackResult;

    /// Lets the operation make progress without a thread of its own.  Returns `Ok(true)` once the
    /// operation has finished, which completes the request.  Must not block.
    fn poll(&mut self) -> std::result::Result<bool, ErrorClass> {
        Ok(false)
    }

    /// Whether `poll` does anything.  Requests that cannot be polled are skipped by the progress
    /// engine.
    fn is_pollable(&self) -> bool {
        false
    }
}

/// Query callback
pub type QueryFn<S> = fn(&mut S, &mut Status) -> CallbackResult;
/// Free callback
pub type FreeFn<S> = fn(&mut S) -> CallbackResult;
/// Cancel callback
pub type CancelFn<S> = fn(&mut S, bool) -> CallbackResult;
/// Poll callback
pub type PollFn<S> = fn(&mut S) -> std::result::Result<bool, ErrorClass>;

/// Generalized request behaviour assembled from plain functions and an opaque state.
///
/// The runtime never looks at `extra_state`; it only hands it to the callbacks.
///
/// # Examples
///
/// ```
/// use mpi_request::request::generalized::{CallbackResult, Callbacks};
/// use mpi_request::point_to_point::Status;
///
/// fn query(bytes: &mut usize, status: &mut Status) -> CallbackResult {
///     status.set_count(*bytes);
///     Ok(())
/// }
///
/// fn free(_: &mut usize) -> CallbackResult {
///     Ok(())
/// }
///
/// fn cancel(_: &mut usize, _complete: bool) -> CallbackResult {
///     Ok(())
/// }
///
/// let callbacks = Callbacks::new(query, free, cancel, 42usize);
/// # drop(callbacks);
/// ```
pub struct Callbacks<S> {
    query_fn: QueryFn<S>,
    free_fn: FreeFn<S>,
    cancel_fn: CancelFn<S>,
    poll_fn: Option<PollFn<S>>,
    extra_state: S,
}

impl<S> Callbacks<S> {
    /// Callbacks without a poll function.
    pub fn new(
        query_fn: QueryFn<S>,
        free_fn: FreeFn<S>,
        cancel_fn: CancelFn<S>,
        extra_state: S,
    ) -> Self {
        Self {
            query_fn,
            free_fn,
            cancel_fn,
            poll_fn: None,
            extra_state,
        }
    }

    /// Adds a poll function, invoked by the progress engine.
    pub fn poll(mut self, poll_fn: PollFn<S>) -> Self {
        self.poll_fn = Some(poll_fn);
        self
    }
}

impl<S> fmt::Debug for Callbacks<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("pollable", &self.poll_fn.is_some())
            .finish()
    }
}

impl<S: Send> GeneralizedOps for Callbacks<S> {
    fn query(&mut self, status: &mut Status) -> CallbackResult {
        (self.query_fn)(&mut self.extra_state, status)
    }

    fn free(&mut self) -> CallbackResult {
        (self.free_fn)(&mut self.extra_state)
    }

    fn cancel(&mut self, complete: bool) -> CallbackResult {
        (self.cancel_fn)(&mut self.extra_state, complete)
    }

    fn poll(&mut self) -> std::result::Result<bool, ErrorClass> {
        match self.poll_fn {
            Some(poll_fn) => poll_fn(&mut self.extra_state),
            None => Ok(false),
        }
    }

    fn is_pollable(&self) -> bool {
        self.poll_fn.is_some()
    }
}

/// Runs `f` on the callbacks of one request, holding its operations lock.  The caller must have
/// pinned the request (see `RequestObject::begin_callback`) or removed it from the registry.
pub(crate) fn with_ops<R>(ops: &SharedOps, f: impl FnOnce(&mut dyn GeneralizedOps) -> R) -> R {
    let mut guard = ops.lock();
    f(&mut **guard)
}

/// Maps a failed callback onto the error attached to its request.
pub(crate) fn callback_error(
    request: RawRequest,
    callback: Callback,
    result: CallbackResult,
) -> Result<()> {
    result.map_err(|class| {
        warn!("{} callback of request {:#x} failed: {}", callback, request, class);
        Error::Callback {
            request,
            callback,
            class,
        }
    })
}

impl Runtime {
    pub(crate) fn generalized_start(&self, ops: Box<dyn GeneralizedOps>) -> Result<RawRequest> {
        let pollable = ops.is_pollable();
        let object = RequestObject::new(
            RequestKind::Generalized,
            1,
            Payload::Generalized {
                ops: Arc::new(Mutex::new(ops)),
                pollable,
            },
        );

        let request = self.enter().insert(object)?;
        debug!("started generalized request {:#x} (pollable: {})", request, pollable);
        Ok(request)
    }

    /// Marks a generalized request complete.  The caller's handle may already have been freed.
    pub(crate) fn generalized_complete(&self, request: RawRequest) -> Result<()> {
        let reclaimed = {
            let mut registry = self.enter();
            let object = registry.lookup_object(request)?;
            if object.kind() != RequestKind::Generalized {
                return Err(Error::NotGeneralized(request));
            }
            registry.mark_complete(request, 1)?
        };
        self.notify_completion();
        trace!("generalized request {:#x} complete", request);

        match reclaimed {
            Some(object) => self.reclaim(request, object),
            None => Ok(()),
        }
    }
}

impl Universe {
    /// Starts a generalized request with the given behaviour.
    ///
    /// No callback runs before this returns.  The request stays active until
    /// [`generalized_request_complete`](#method.generalized_request_complete) is called for it or
    /// its `poll` callback reports that the operation finished.
    ///
    /// # Errors
    ///
    /// `Exhausted` if no request slot is available.  Nothing is left behind in that case and the
    /// callbacks are dropped without being called.
    ///
    /// # Standard section(s)
    ///
    /// 13.2
    pub fn generalized_request_start<O>(&self, ops: O) -> Result<RawRequest>
    where
        O: GeneralizedOps + 'static,
    {
        self.runtime.generalized_start(Box::new(ops))
    }

    /// Notifies the runtime that the operation behind a generalized request has finished.
    ///
    /// Wakes every thread waiting for the request.  If the caller's handle was already freed, the
    /// request is released right away and its `free` callback runs on this thread.
    ///
    /// # Errors
    ///
    /// - `InvalidHandle` if `request` does not name a live request,
    /// - `NotGeneralized` if it names a request of another kind, which is left untouched,
    /// - `AlreadyCompleted` if it was completed before.
    ///
    /// Validation errors are wrapped in a `Context` naming this operation.
    ///
    /// # Standard section(s)
    ///
    /// 13.2
    pub fn generalized_request_complete(&self, request: RawRequest) -> Result<()> {
        self.runtime.generalized_complete(request).map_err(|err| match err {
            Error::Callback { .. } => err,
            err => err.context("generalized_request_complete", request),
        })
    }
}
