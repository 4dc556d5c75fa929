//! Shared runtime state and the critical-section discipline
//!
//! All request state lives in the `Registry`, guarded by a single mutex: the global critical
//! section.  Every public entry point holds it while it validates handles and mutates request
//! state, and releases it before any caller callback runs.  Blocking waits park on the
//! `completion` condition variable, which atomically releases the critical section, so the thread
//! that completes the awaited request can get in.
//!
//! The transport keeps its matching queues behind channel locks (see `point_to_point`).  A thread
//! that needs both takes the channel lock first and the global critical section second, never the
//! other way around.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::environment::InitOptions;
use crate::error::{Callback, Error, Result};
use crate::handle::{HandleTable, RawRequest};
use crate::point_to_point::Transport;
use crate::request::generalized::{callback_error, with_ops};
use crate::request::object::RequestObject;

/// Every live request, indexed by handle.
#[derive(Debug)]
pub(crate) struct Registry {
    table: HandleTable<RequestObject>,
}

impl Registry {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            table: HandleTable::with_capacity(capacity),
        }
    }

    /// Stores a new request.  On failure nothing is kept.
    pub fn insert(&mut self, object: RequestObject) -> Result<RawRequest> {
        let capacity = self.table.capacity();
        self.table
            .allocate(object)
            .map_err(|_| Error::Exhausted(capacity))
    }

    /// Resolves a handle the caller still owns.
    pub fn lookup(&self, request: RawRequest) -> Result<&RequestObject> {
        match self.table.get(request) {
            Some(object) if object.handle_live() => Ok(object),
            _ => Err(Error::InvalidHandle(request)),
        }
    }

    /// Mutable counterpart of [`lookup`](#method.lookup).
    pub fn lookup_mut(&mut self, request: RawRequest) -> Result<&mut RequestObject> {
        match self.table.get_mut(request) {
            Some(object) if object.handle_live() => Ok(object),
            _ => Err(Error::InvalidHandle(request)),
        }
    }

    /// Resolves any live request object, including those whose handle the caller already freed.
    pub fn lookup_object(&self, request: RawRequest) -> Result<&RequestObject> {
        self.table
            .get(request)
            .ok_or(Error::InvalidHandle(request))
    }

    /// Mutable counterpart of [`lookup_object`](#method.lookup_object).
    pub fn lookup_object_mut(&mut self, request: RawRequest) -> Result<&mut RequestObject> {
        self.table
            .get_mut(request)
            .ok_or(Error::InvalidHandle(request))
    }

    /// Records `partial` completed sub-events of a request.
    ///
    /// If this completes a request nobody references any more, the object is removed from the
    /// table and handed back so the caller can run its release hook outside the critical section.
    pub fn mark_complete(
        &mut self,
        request: RawRequest,
        partial: usize,
    ) -> Result<Option<RequestObject>> {
        let object = self.lookup_object_mut(request)?;
        let completed = object.decrement(request, partial)?;
        trace!(
            "request {:#x}: {} sub-event(s) left, {} reference(s)",
            request,
            object.completion_count(),
            object.ref_count()
        );
        if completed && object.is_reclaimable() {
            Ok(self.table.release(request))
        } else {
            Ok(None)
        }
    }

    /// Adds an internal reference, held by the transport until it completes the request.
    pub fn add_ref(&mut self, request: RawRequest) -> Result<()> {
        self.lookup_object_mut(request)?.add_ref();
        Ok(())
    }

    /// Drops an internal reference.
    pub fn release_ref(&mut self, request: RawRequest) -> Option<RequestObject> {
        let reclaim = match self.table.get_mut(request) {
            Some(object) => object.drop_ref(),
            None => {
                debug_assert!(false, "internal reference to a reclaimed request");
                false
            }
        };
        if reclaim {
            self.table.release(request)
        } else {
            None
        }
    }

    /// Drops the caller's handle.  The handle does not resolve any more afterwards.
    pub fn release_handle(&mut self, request: RawRequest) -> Result<Option<RequestObject>> {
        if self.lookup_mut(request)?.drop_handle() {
            Ok(self.table.release(request))
        } else {
            Ok(None)
        }
    }

    /// Unpins a request after one of its callbacks returned.  Hands the object back if the
    /// callback dropped the last reference or completed an already freed request.
    pub fn end_callback(&mut self, request: RawRequest) -> Option<RequestObject> {
        let reclaim = match self.table.get_mut(request) {
            Some(object) => object.end_callback(),
            None => {
                debug_assert!(false, "callback of a reclaimed request");
                false
            }
        };
        if reclaim {
            self.table.release(request)
        } else {
            None
        }
    }

    /// Number of request objects in the table, including those whose handle was freed.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Handles of every live request object.
    pub fn handles(&self) -> Vec<RawRequest> {
        self.table.handles()
    }

    fn drain(&mut self) -> Vec<(RawRequest, RequestObject)> {
        self.table
            .handles()
            .into_iter()
            .filter_map(|request| self.table.release(request).map(|object| (request, object)))
            .collect()
    }
}

/// One instance of the request-completion core.
#[derive(Debug)]
pub(crate) struct Runtime {
    options: InitOptions,
    registry: Mutex<Registry>,
    completion: Condvar,
    finalized: AtomicBool,
    pub transport: Transport,
}

impl Runtime {
    pub fn new(options: InitOptions) -> Self {
        debug!("initializing runtime with {:?}", options);
        Self {
            registry: Mutex::new(Registry::with_capacity(options.max_request_count())),
            completion: Condvar::new(),
            finalized: AtomicBool::new(false),
            transport: Transport::new(&options),
            options,
        }
    }

    /// Options the runtime was initialized with.
    pub fn options(&self) -> &InitOptions {
        &self.options
    }

    /// Enters the global critical section.
    ///
    /// # Panics
    ///
    /// If the runtime has been finalized.  Using a runtime outside of its lifetime is a fatal
    /// usage error.
    pub fn enter(&self) -> MutexGuard<'_, Registry> {
        assert!(
            !self.finalized.load(Ordering::Acquire),
            "the runtime was used after it was finalized"
        );
        self.registry.lock()
    }

    /// Leaves the critical section until a request completes (or `timeout` elapses) and enters
    /// it again.  Wakeups may be spurious; callers re-check their condition.
    pub fn park(&self, registry: &mut MutexGuard<'_, Registry>, timeout: Option<Duration>) {
        match timeout {
            Some(timeout) => {
                self.completion.wait_for(registry, timeout);
            }
            None => self.completion.wait(registry),
        }
    }

    /// Wakes every parked waiter so it can re-evaluate its wait set.
    pub fn notify_completion(&self) {
        self.completion.notify_all();
    }

    /// Releases a request nobody references any more.  Runs the `free` callback of generalized
    /// requests; its outcome is the outcome of the release.
    pub fn reclaim(&self, request: RawRequest, object: RequestObject) -> Result<()> {
        trace!("reclaiming {} request {:#x}", object.kind(), request);
        match object.ops() {
            Some(ops) => callback_error(request, Callback::Free, with_ops(ops, |ops| ops.free())),
            None => Ok(()),
        }
    }

    /// Unpins a request after one of its callbacks returned on this thread, with the operations
    /// lock already dropped.  Runs `free` if the request became releasable meanwhile.
    pub fn end_callback(&self, request: RawRequest) -> Result<()> {
        let reclaimed = self.enter().end_callback(request);
        match reclaimed {
            Some(object) => self.reclaim(request, object),
            None => Ok(()),
        }
    }

    /// Tears the runtime down.  Complete requests are released as if their handles had been
    /// freed; requests that are still active are dropped without their `free` callback.
    pub fn finalize(&self) {
        let objects = {
            let mut registry = self.enter();
            self.finalized.store(true, Ordering::Release);
            registry.drain()
        };
        self.notify_completion();

        let mut active = 0;
        for (request, object) in objects {
            if object.is_complete() {
                if let Err(err) = self.reclaim(request, object) {
                    warn!("releasing request {:#x} at finalize failed: {}", request, err);
                }
            } else {
                active += 1;
            }
        }
        if active > 0 {
            warn!("finalized with {} active request(s)", active);
        }
        debug!("runtime finalized");
    }
}
