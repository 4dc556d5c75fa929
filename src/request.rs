//! Request objects for non-blocking operations
//!
//! Non-blocking operations return raw request handles (`RawRequest`).  This module wraps them in
//! typed objects that tie a handle to the `Universe` that issued it and make sure every handle is
//! eventually given back:
//!
//! - [`Request`](struct.Request.html) owns one handle.  A completion operation such as
//! [`wait()`](struct.Request.html#method.wait) or [`test()`](struct.Request.html#method.test)
//! consumes it.
//! - [`RequestCollection`](struct.RequestCollection.html) owns a set of handles and offers the
//! `wait_any`/`wait_some`/`wait_all` family and its `test_*` counterparts.
//! - [`Completer`](struct.Completer.html) is the other end of a generalized request: the side
//! that carries out the operation and reports its completion.
//!
//! **Note:** If a `Request` is dropped without being completed, its handle is freed as with
//! [`Universe::request_free`](../environment/struct.Universe.html#method.request_free): the
//! operation carries on and its resources are released once it completes.
//!
//! To handle request completion in an RAII style, a request can be wrapped in either
//! [`WaitGuard`](struct.WaitGuard.html) or [`CancelGuard`](struct.CancelGuard.html), which will
//! follow the respective policy for completing the operation.

use std::fmt;
use std::mem;
use std::ptr;

use log::{debug, warn};

use crate::completion::TestAny;
use crate::environment::Universe;
use crate::error::Result;
use crate::handle::{RawRequest, REQUEST_NULL};
use crate::point_to_point::Status;
use crate::raw::traits::*;

pub mod generalized;
pub mod object;

use self::generalized::GeneralizedOps;

/// Request traits
pub mod traits {
    pub use super::CollectRequests;
}

/// A request object for a non-blocking operation.
///
/// Dropping an uncompleted `Request` frees its handle without waiting for the operation.
///
/// # Examples
///
/// ```
/// use mpi_request::environment::{InitOptions, Universe};
/// use mpi_request::request::generalized::{CallbackResult, Callbacks};
/// use mpi_request::Status;
///
/// fn query(_: &mut (), status: &mut Status) -> CallbackResult {
///     status.set_count(42);
///     Ok(())
/// }
///
/// fn free(_: &mut ()) -> CallbackResult {
///     Ok(())
/// }
///
/// fn cancel(_: &mut (), _complete: bool) -> CallbackResult {
///     Ok(())
/// }
///
/// let universe = Universe::with_options(InitOptions::new());
/// let (request, completer) = universe
///     .generalized_request(Callbacks::new(query, free, cancel, ()))
///     .unwrap();
///
/// completer.complete().unwrap();
/// assert_eq!(request.wait().unwrap().count(), 42);
/// ```
///
/// # Standard section(s)
///
/// 3.7.1
#[must_use]
pub struct Request<'u> {
    request: RawRequest,
    universe: &'u Universe,
}

impl<'u> fmt::Debug for Request<'u> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("request", &format_args!("{:#x}", self.request))
            .finish()
    }
}

impl<'u> AsRaw for Request<'u> {
    type Raw = RawRequest;
    fn as_raw(&self) -> Self::Raw {
        self.request
    }
}

impl<'u> Drop for Request<'u> {
    fn drop(&mut self) {
        debug!("request {:#x} dropped without being completed", self.request);
        if let Err(err) = self.universe.request_free(self.request) {
            warn!("freeing dropped request {:#x} failed: {}", self.request, err);
        }
    }
}

impl<'u> Request<'u> {
    /// Takes ownership of a raw handle issued by `universe`.
    ///
    /// # Panics
    ///
    /// If `request` is `REQUEST_NULL`.
    pub fn from_raw(request: RawRequest, universe: &'u Universe) -> Self {
        assert_ne!(request, REQUEST_NULL, "cannot wrap the null request");
        Self { request, universe }
    }

    /// Gives up ownership of the handle without completing or freeing it.
    pub fn into_raw(self) -> RawRequest {
        let request = self.request;
        mem::forget(self);
        request
    }

    /// The universe the request belongs to.
    pub fn universe(&self) -> &'u Universe {
        self.universe
    }

    /// Wait for an operation to finish.
    ///
    /// Will block execution of the calling thread until the associated operation has finished.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn wait(self) -> Result<Status> {
        let universe = self.universe;
        universe.wait(self.into_raw())
    }

    /// Wait for an operation to finish, but don’t bother retrieving the `Status` information.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn wait_without_status(self) -> Result<()> {
        self.wait().map(|_| ())
    }

    /// Test whether an operation has finished.
    ///
    /// If the operation has finished, the outcome of completing it is returned.  Otherwise returns
    /// the unfinished `Request`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn test(self) -> std::result::Result<Result<Status>, Self> {
        match self.universe.test(&[self.request]) {
            Ok(true) => Ok(self.wait()),
            Ok(false) => Err(self),
            Err(err) => {
                mem::forget(self);
                Ok(Err(err))
            }
        }
    }

    /// The status of the finished operation, without completing the request.  `None` while the
    /// operation is still running.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn get_status(&self) -> Result<Option<Status>> {
        self.universe.get_status(self.request)
    }

    /// Initiate cancellation of the request.
    ///
    /// Cancellation may or may not succeed; the status returned by the completion operation tells.
    ///
    /// # Standard section(s)
    ///
    /// 3.8.4
    pub fn cancel(&self) -> Result<()> {
        self.universe.cancel(self.request)
    }

    /// A handle for completing this request from another thread.  Only meaningful for generalized
    /// requests; completing any other kind of request fails with `NotGeneralized`.
    pub fn completer(&self) -> Completer<'u> {
        Completer {
            request: self.request,
            universe: self.universe,
        }
    }
}

/// The completing side of a generalized request.
///
/// `Completer` is `Copy` and may be sent to the thread that carries out the operation.
///
/// # Standard section(s)
///
/// 13.2
#[derive(Copy, Clone)]
pub struct Completer<'u> {
    request: RawRequest,
    universe: &'u Universe,
}

impl<'u> fmt::Debug for Completer<'u> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("request", &format_args!("{:#x}", self.request))
            .finish()
    }
}

impl<'u> AsRaw for Completer<'u> {
    type Raw = RawRequest;
    fn as_raw(&self) -> Self::Raw {
        self.request
    }
}

impl<'u> Completer<'u> {
    /// Reports that the operation has finished.
    ///
    /// # Errors
    ///
    /// As for `Universe::generalized_request_complete()`.
    pub fn complete(self) -> Result<()> {
        self.universe.generalized_request_complete(self.request)
    }

    /// Requests cancellation of the operation, as `Request::cancel()` does.
    ///
    /// # Standard section(s)
    ///
    /// 3.8.4
    pub fn cancel(self) -> Result<()> {
        self.universe.cancel(self.request)
    }
}

impl Universe {
    /// Starts a generalized request and returns both of its ends.
    ///
    /// # Standard section(s)
    ///
    /// 13.2
    pub fn generalized_request<O>(&self, ops: O) -> Result<(Request<'_>, Completer<'_>)>
    where
        O: GeneralizedOps + 'static,
    {
        let request = Request::from_raw(self.generalized_request_start(ops)?, self);
        let completer = request.completer();
        Ok((request, completer))
    }
}

/// Collects an iterator of `Request` objects into a `RequestCollection` object
pub trait CollectRequests<'u>: IntoIterator<Item = Request<'u>> {
    /// Consumes and converts an iterator of `Request` objects into a `RequestCollection` object.
    fn collect_requests(self, universe: &'u Universe) -> RequestCollection<'u>;
}

impl<'u, T> CollectRequests<'u> for T
where
    T: IntoIterator<Item = Request<'u>>,
{
    fn collect_requests(self, universe: &'u Universe) -> RequestCollection<'u> {
        let iter = self.into_iter();
        let (lbound, _) = iter.size_hint();
        let mut collection = RequestCollection::with_capacity(universe, lbound);
        for request in iter {
            collection.push(request);
        }
        collection
    }
}

/// A collection of request objects of one universe.
///
/// Completed requests leave a `REQUEST_NULL` behind, so indices stay stable for the lifetime of
/// the collection.  Requests still outstanding when the collection is dropped are freed.
///
/// # Standard section(s)
///
/// 3.7.5
#[must_use]
#[derive(Debug)]
pub struct RequestCollection<'u> {
    universe: &'u Universe,
    requests: Vec<RawRequest>,
    /// Tracks how many entries of `requests` are not null.
    outstanding: usize,
}

impl<'u> Drop for RequestCollection<'u> {
    fn drop(&mut self) {
        if self.outstanding != 0 {
            debug!(
                "request collection dropped with {} outstanding request(s)",
                self.outstanding
            );
        }
        for &request in self.requests.iter().filter(|&&r| r != REQUEST_NULL) {
            if let Err(err) = self.universe.request_free(request) {
                warn!("freeing dropped request {:#x} failed: {}", request, err);
            }
        }
    }
}

impl<'u> RequestCollection<'u> {
    /// Constructs a new, empty `RequestCollection` object.
    pub fn new(universe: &'u Universe) -> Self {
        Self::with_capacity(universe, 0)
    }

    /// Constructs a new, empty `RequestCollection` with reserved space for `capacity` requests.
    pub fn with_capacity(universe: &'u Universe, capacity: usize) -> Self {
        Self {
            universe,
            requests: Vec::with_capacity(capacity),
            outstanding: 0,
        }
    }

    /// Pushes a new request into the collection.
    ///
    /// # Panics
    ///
    /// If the request belongs to another universe.
    pub fn push(&mut self, request: Request<'u>) {
        assert!(
            ptr::eq(request.universe, self.universe),
            "cannot collect requests of another universe"
        );
        self.requests.push(request.into_raw());
        self.outstanding += 1;
    }

    /// `outstanding` returns the number of requests in the collection that haven't been completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Returns the number of request slots in the collection.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the collection has no request slots at all.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// The raw handles, with `REQUEST_NULL` in the slots of completed requests.
    pub fn as_raw_slice(&self) -> &[RawRequest] {
        &self.requests
    }

    fn recount(&mut self) {
        self.outstanding = self
            .requests
            .iter()
            .filter(|&&request| request != REQUEST_NULL)
            .count();
    }

    /// `wait_any` blocks until any active request in the collection completes.
    ///
    /// Returns `Some((idx, status))` for the completed request, whose slot is cleared, or `None`
    /// if there are no active requests.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn wait_any(&mut self) -> Result<Option<(usize, Status)>> {
        let result = self.universe.wait_any(&mut self.requests);
        self.recount();
        result
    }

    /// `wait_some` blocks until at least one active request completes and completes all requests
    /// that are finished by then.
    ///
    /// Returns `None` if there are no active requests.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn wait_some(&mut self) -> Result<Option<Vec<(usize, Status)>>> {
        let result = self.universe.wait_some(&mut self.requests);
        self.recount();
        result
    }

    /// `wait_all` blocks until all requests in the collection are complete.  The status of
    /// cleared slots is empty.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn wait_all(&mut self) -> Result<Vec<Status>> {
        let result = self.universe.wait_all(&mut self.requests);
        self.recount();
        result
    }

    /// `test_any` checks if any requests in the collection are completed. It does not block.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn test_any(&mut self) -> Result<TestAny> {
        let result = self.universe.test_any(&mut self.requests);
        self.recount();
        result
    }

    /// `test_some` completes every request that is finished.  It does not block.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn test_some(&mut self) -> Result<Option<Vec<(usize, Status)>>> {
        let result = self.universe.test_some(&mut self.requests);
        self.recount();
        result
    }

    /// `test_all` completes all requests if every one of them is finished, and leaves the
    /// collection unchanged otherwise.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn test_all(&mut self) -> Result<Option<Vec<Status>>> {
        let result = self.universe.test_all(&mut self.requests);
        self.recount();
        result
    }
}

/// Guard object that waits for the completion of an operation when it is dropped
///
/// The guard can be constructed or deconstructed using the `From` and `Into` traits.  Errors of
/// the wait are logged.
#[derive(Debug)]
pub struct WaitGuard<'u>(Option<Request<'u>>);

impl<'u> Drop for WaitGuard<'u> {
    fn drop(&mut self) {
        if let Some(request) = self.0.take() {
            let raw = request.as_raw();
            if let Err(err) = request.wait() {
                warn!("waiting for guarded request {:#x} failed: {}", raw, err);
            }
        }
    }
}

impl<'u> From<WaitGuard<'u>> for Request<'u> {
    fn from(mut guard: WaitGuard<'u>) -> Self {
        guard
            .0
            .take()
            .unwrap_or_else(|| unreachable!("a wait guard always holds its request"))
    }
}

impl<'u> From<Request<'u>> for WaitGuard<'u> {
    fn from(request: Request<'u>) -> Self {
        WaitGuard(Some(request))
    }
}

impl<'u> WaitGuard<'u> {
    fn cancel(&self) {
        if let Some(ref request) = self.0 {
            if let Err(err) = request.cancel() {
                warn!("cancelling guarded request {:#x} failed: {}", request.as_raw(), err);
            }
        }
    }
}

/// Guard object that tries to cancel and waits for the completion of an operation when it is
/// dropped
///
/// The guard can be constructed or deconstructed using the `From` and `Into` traits.
#[derive(Debug)]
pub struct CancelGuard<'u>(WaitGuard<'u>);

impl<'u> Drop for CancelGuard<'u> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl<'u> From<CancelGuard<'u>> for WaitGuard<'u> {
    fn from(mut guard: CancelGuard<'u>) -> Self {
        WaitGuard(guard.0 .0.take())
    }
}

impl<'u> From<WaitGuard<'u>> for CancelGuard<'u> {
    fn from(guard: WaitGuard<'u>) -> Self {
        CancelGuard(guard)
    }
}

impl<'u> From<Request<'u>> for CancelGuard<'u> {
    fn from(request: Request<'u>) -> Self {
        CancelGuard(WaitGuard::from(request))
    }
}
