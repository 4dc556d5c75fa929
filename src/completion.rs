//! Completion of requests
//!
//! A request is *active* while its completion count is above zero, *complete* once the count
//! reaches zero and *released* once, in addition, no reference to it is left.  The operations in
//! this module observe that state machine through request handles:
//!
//! - `wait` and friends block until requests complete, then query their status and retire the
//!   handles,
//! - `test` reports whether a set of requests is complete without retiring anything,
//! - `test_any`, `test_some` and `test_all` retire what they find complete, without blocking,
//! - `cancel` asks a request to stop, `request_free` gives up a handle without waiting.
//!
//! Blocking waits leave the global critical section while parked, so other threads can complete
//! the requests being waited for.  If a wait set contains generalized requests with a `poll`
//! callback, the waiter wakes up periodically to poll them.
//!
//! `REQUEST_NULL` entries in a wait set are inactive and complete immediately with an empty status.
//! Retired handles are overwritten with `REQUEST_NULL`.

use log::{trace, warn};

use crate::environment::Universe;
use crate::error::{Callback, Error, Result};
use crate::handle::{RawRequest, REQUEST_NULL};
use crate::point_to_point::{Rank, Status};
use crate::request::generalized::{callback_error, with_ops};
use crate::request::object::{Payload, RequestKind, SharedOps};
use crate::runtime::{Registry, Runtime};

/// Result type for `test_any`.
#[derive(Clone, Debug, PartialEq)]
pub enum TestAny {
    /// Indicates that there are no active requests in the set.
    NoneActive,
    /// Indicates that, while there are active requests in the set, none of them were completed.
    NoneComplete,
    /// Indicates which request in the set was completed.
    Completed(usize, Status),
}

/// State of a wait set at one point in time.
#[derive(Debug, Default)]
struct Scan {
    /// indices of complete requests
    complete: Vec<usize>,
    /// number of active requests
    active: usize,
    /// whether any active request has a poll callback
    pollable: bool,
}

impl Scan {
    fn is_inactive(&self) -> bool {
        self.complete.is_empty() && self.active == 0
    }
}

fn scan(registry: &Registry, requests: &[RawRequest]) -> Result<Scan> {
    let mut scan = Scan::default();
    for (index, &request) in requests.iter().enumerate() {
        if request == REQUEST_NULL {
            continue;
        }
        let object = registry.lookup(request)?;
        if object.is_complete() {
            scan.complete.push(index);
        } else {
            scan.active += 1;
            if let Payload::Generalized { pollable: true, .. } = object.payload {
                scan.pollable = true;
            }
        }
    }
    Ok(scan)
}

/// Status reported for a request whose completion failed.
fn failure_status(err: &Error) -> Status {
    match *err {
        Error::Status { status, .. } => status,
        ref err => {
            let mut status = Status::empty();
            status.set_error(Some(err.class()));
            status
        }
    }
}

enum CancelAction {
    Generalized(SharedOps, bool),
    Native(Rank),
    Nothing,
}

impl Runtime {
    fn validate(&self, requests: &[RawRequest]) -> Result<()> {
        let registry = self.enter();
        for &request in requests.iter().filter(|&&request| request != REQUEST_NULL) {
            registry.lookup(request)?;
        }
        Ok(())
    }

    /// Runs the `poll` callbacks of active generalized requests, either those in `requests` or
    /// all of them.
    pub(crate) fn poll(&self, requests: Option<&[RawRequest]>) {
        let targets: Vec<(RawRequest, SharedOps)> = {
            let mut registry = self.enter();
            let candidates = match requests {
                Some(requests) => requests.to_vec(),
                None => registry.handles(),
            };
            candidates
                .into_iter()
                .filter_map(|request| {
                    let object = registry.lookup_object_mut(request).ok()?;
                    let pollable = matches!(
                        object.payload,
                        Payload::Generalized { pollable: true, .. }
                    );
                    if pollable && !object.is_complete() {
                        object.begin_callback().map(|ops| (request, ops))
                    } else {
                        None
                    }
                })
                .collect()
        };

        for (request, ops) in targets {
            match with_ops(&ops, |ops| ops.poll()) {
                Ok(false) => {}
                Ok(true) => self.complete_polled(request, None),
                Err(class) => {
                    warn!("poll callback of request {:#x} failed: {}", request, class);
                    let err = Error::Callback {
                        request,
                        callback: Callback::Poll,
                        class,
                    };
                    self.complete_polled(request, Some(err));
                }
            }
            if let Err(err) = self.end_callback(request) {
                warn!("releasing request {:#x} failed: {}", request, err);
            }
        }
    }

    /// Completes a request on behalf of its `poll` callback.  A request that was completed in the
    /// meantime is left alone.
    fn complete_polled(&self, request: RawRequest, err: Option<Error>) {
        let reclaimed = {
            let mut registry = self.enter();
            let pending = match registry.lookup_object_mut(request) {
                Ok(object) if !object.is_complete() => {
                    if let Some(err) = err {
                        object.record_error(err);
                    }
                    true
                }
                _ => false,
            };
            if !pending {
                return;
            }
            match registry.mark_complete(request, 1) {
                Ok(reclaimed) => reclaimed,
                Err(err) => {
                    warn!("completing polled request {:#x} failed: {}", request, err);
                    None
                }
            }
        };
        self.notify_completion();
        trace!("request {:#x} completed by its poll callback", request);

        if let Some(object) = reclaimed {
            if let Err(err) = self.reclaim(request, object) {
                warn!("releasing request {:#x} failed: {}", request, err);
            }
        }
    }

    /// Blocks until `ready` holds for the wait set.
    fn block_until(&self, requests: &[RawRequest], ready: impl Fn(&Scan) -> bool) -> Result<Scan> {
        loop {
            self.poll(Some(requests));

            let mut registry = self.enter();
            let scan = scan(&registry, requests)?;
            if ready(&scan) {
                return Ok(scan);
            }
            let timeout = if scan.pollable {
                Some(self.options().poll_interval_duration())
            } else {
                None
            };
            self.park(&mut registry, timeout);
        }
    }

    /// Queries the status of a complete request, running the `query` callback of generalized
    /// requests.  Returns `None` while the request is active.
    ///
    /// Errors attached to the request are not looked at: a `cancel` callback running on another
    /// thread may still attach one until this returns.
    fn query(&self, request: RawRequest) -> Result<Option<(Status, Result<()>)>> {
        let (mut status, ops) = {
            let mut registry = self.enter();
            let object = registry.lookup_mut(request)?;
            if !object.is_complete() {
                return Ok(None);
            }
            (object.status, object.begin_callback())
        };

        let queried = match ops {
            Some(ops) => {
                let queried = callback_error(
                    request,
                    Callback::Query,
                    with_ops(&ops, |ops| ops.query(&mut status)),
                );
                let released = self.end_callback(request);
                queried.and(released)
            }
            None => Ok(()),
        };
        Ok(Some((status, queried)))
    }

    /// Queries a complete request and retires the caller's handle.
    fn finish(&self, request: RawRequest) -> Result<Status> {
        let queried = self.query(request);

        // the attached error is read in the same critical section that retires the handle, so a
        // failing cancel either lands here or is returned by `cancel` itself
        let (attached, reclaimed) = {
            let mut registry = self.enter();
            let attached = registry.lookup(request)?.error_state.clone();
            (attached, registry.release_handle(request)?)
        };
        let released = match reclaimed {
            Some(object) => self.reclaim(request, object),
            None => Ok(()),
        };
        trace!("retired request {:#x}", request);

        let (status, queried) = queried?.ok_or(Error::InvalidHandle(request))?;
        if let Some(err) = attached {
            return Err(err);
        }
        queried?;
        released?;
        match status.error() {
            Some(_) => Err(Error::Status { request, status }),
            None => Ok(status),
        }
    }

    /// Retires the requests at `indices`, collecting their statuses.
    fn finish_some(
        &self,
        requests: &mut [RawRequest],
        indices: &[usize],
    ) -> Result<Vec<(usize, Status)>> {
        let mut failed = false;
        let mut completed = Vec::with_capacity(indices.len());
        for &index in indices {
            let status = match self.finish(requests[index]) {
                Ok(status) => status,
                Err(err) => {
                    failed = true;
                    failure_status(&err)
                }
            };
            requests[index] = REQUEST_NULL;
            completed.push((index, status));
        }
        if failed {
            Err(Error::InStatus(completed))
        } else {
            Ok(completed)
        }
    }

    pub(crate) fn wait_all(&self, requests: &mut [RawRequest]) -> Result<Vec<Status>> {
        self.validate(requests)?;
        let scan = self.block_until(requests, |scan| scan.active == 0)?;

        let (completed, failed) = match self.finish_some(requests, &scan.complete) {
            Ok(completed) => (completed, false),
            Err(Error::InStatus(completed)) => (completed, true),
            Err(err) => return Err(err),
        };
        let mut statuses = vec![Status::empty(); requests.len()];
        for (index, status) in completed {
            statuses[index] = status;
        }
        if failed {
            Err(Error::InStatus(statuses.into_iter().enumerate().collect()))
        } else {
            Ok(statuses)
        }
    }

    pub(crate) fn wait(&self, request: RawRequest) -> Result<Status> {
        if request == REQUEST_NULL {
            return Ok(Status::empty());
        }
        self.validate(&[request])?;
        self.block_until(&[request], |scan| scan.active == 0)?;
        self.finish(request)
    }

    pub(crate) fn wait_any(&self, requests: &mut [RawRequest]) -> Result<Option<(usize, Status)>> {
        self.validate(requests)?;
        let scan = self.block_until(requests, |scan| !scan.complete.is_empty() || scan.is_inactive())?;
        match scan.complete.first() {
            Some(&index) => {
                let status = self.finish(requests[index]);
                requests[index] = REQUEST_NULL;
                status.map(|status| Some((index, status)))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn wait_some(
        &self,
        requests: &mut [RawRequest],
    ) -> Result<Option<Vec<(usize, Status)>>> {
        self.validate(requests)?;
        let scan = self.block_until(requests, |scan| !scan.complete.is_empty() || scan.is_inactive())?;
        if scan.is_inactive() {
            return Ok(None);
        }
        self.finish_some(requests, &scan.complete).map(Some)
    }

    /// Scans a set without blocking, after giving pollable requests one chance to progress.
    fn scan_now(&self, requests: &[RawRequest]) -> Result<Scan> {
        self.validate(requests)?;
        self.poll(Some(requests));
        let registry = self.enter();
        scan(&registry, requests)
    }

    pub(crate) fn test(&self, requests: &[RawRequest]) -> Result<bool> {
        Ok(self.scan_now(requests)?.active == 0)
    }

    pub(crate) fn test_any(&self, requests: &mut [RawRequest]) -> Result<TestAny> {
        let scan = self.scan_now(requests)?;
        match scan.complete.first() {
            Some(&index) => {
                let status = self.finish(requests[index]);
                requests[index] = REQUEST_NULL;
                Ok(TestAny::Completed(index, status?))
            }
            None if scan.active == 0 => Ok(TestAny::NoneActive),
            None => Ok(TestAny::NoneComplete),
        }
    }

    pub(crate) fn test_some(
        &self,
        requests: &mut [RawRequest],
    ) -> Result<Option<Vec<(usize, Status)>>> {
        let scan = self.scan_now(requests)?;
        if scan.is_inactive() {
            return Ok(None);
        }
        self.finish_some(requests, &scan.complete).map(Some)
    }

    pub(crate) fn test_all(&self, requests: &mut [RawRequest]) -> Result<Option<Vec<Status>>> {
        if self.scan_now(requests)?.active == 0 {
            self.wait_all(requests).map(Some)
        } else {
            Ok(None)
        }
    }

    pub(crate) fn get_status(&self, request: RawRequest) -> Result<Option<Status>> {
        if request == REQUEST_NULL {
            return Ok(Some(Status::empty()));
        }
        self.validate(&[request])?;
        self.poll(Some(&[request]));
        let (status, queried) = match self.query(request)? {
            Some(queried) => queried,
            None => return Ok(None),
        };
        let attached = self.enter().lookup(request)?.error_state.clone();
        if let Some(err) = attached {
            return Err(err);
        }
        queried?;
        Ok(Some(status))
    }

    pub(crate) fn wait_receive(&self, request: RawRequest) -> Result<(Vec<u8>, Status)> {
        match self.enter().lookup(request)?.kind() {
            RequestKind::Receive => {}
            _ => {
                return Err(Error::WrongKind {
                    request,
                    expected: RequestKind::Receive.name(),
                })
            }
        }
        self.block_until(&[request], |scan| scan.active == 0)?;

        let data = match self.enter().lookup_mut(request)?.payload {
            Payload::Receive { ref mut data, .. } => data.take(),
            _ => None,
        };
        let status = self.finish(request)?;
        Ok((data.unwrap_or_default(), status))
    }

    pub(crate) fn request_free(&self, request: RawRequest) -> Result<()> {
        let reclaimed = self.enter().release_handle(request)?;
        trace!("freed handle {:#x}", request);
        match reclaimed {
            Some(object) => self.reclaim(request, object),
            None => Ok(()),
        }
    }

    pub(crate) fn cancel(&self, request: RawRequest) -> Result<()> {
        let action = {
            let mut registry = self.enter();
            let object = registry.lookup_mut(request)?;
            let complete = object.is_complete();
            if object.cancel_pending {
                // the first cancellation is authoritative
                return Ok(());
            }
            let action = match object.begin_callback() {
                Some(ops) => CancelAction::Generalized(ops, complete),
                None => match object.payload {
                    Payload::Send { dest } | Payload::Receive { dest, .. } if !complete => {
                        CancelAction::Native(dest)
                    }
                    _ => CancelAction::Nothing,
                },
            };
            if !complete {
                object.cancel_pending = true;
            }
            action
        };
        trace!("cancel requested for {:#x}", request);

        match action {
            CancelAction::Generalized(ops, complete) => {
                let unreported = with_ops(&ops, |ops| {
                    let outcome = ops.cancel(complete);
                    let err = callback_error(request, Callback::Cancel, outcome).err()?;
                    // attach before the operations lock lets a waiter query the request
                    let mut registry = self.enter();
                    match registry.lookup_object_mut(request) {
                        Ok(object) if object.handle_live() => {
                            object.record_error(err);
                            None
                        }
                        _ => Some(err),
                    }
                });
                let released = self.end_callback(request);
                match unreported {
                    Some(err) => Err(err),
                    None => released,
                }
            }
            CancelAction::Native(dest) => self.cancel_native(request, dest),
            CancelAction::Nothing => Ok(()),
        }
    }
}

impl Universe {
    /// Waits for a request to complete and retires its handle.
    ///
    /// Returns the status of the completed operation.  For generalized requests the status is
    /// produced by the `query` callback.
    ///
    /// # Errors
    ///
    /// - `InvalidHandle` if `request` does not name a live request,
    /// - `Status` if the operation completed with an error in its status,
    /// - `Callback` if a callback of a generalized request failed.
    ///
    /// The handle is retired in every case but the first.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn wait(&self, request: RawRequest) -> Result<Status> {
        self.runtime.wait(request)
    }

    /// Waits for every request in the set to complete and retires them all.
    ///
    /// `statuses[i]` is the status of `requests[i]`.  If any request failed, `InStatus` carries
    /// the index and status of every request, with the failed ones holding their error class.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn wait_all(&self, requests: &mut [RawRequest]) -> Result<Vec<Status>> {
        self.runtime.wait_all(requests)
    }

    /// Waits for any one request of the set to complete and retires it.
    ///
    /// Returns `None` if the set holds no active request.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn wait_any(&self, requests: &mut [RawRequest]) -> Result<Option<(usize, Status)>> {
        self.runtime.wait_any(requests)
    }

    /// Waits until at least one request of the set completes and retires every complete request.
    ///
    /// Returns `None` if the set holds no active request.  If a retired request failed,
    /// `InStatus` carries the index and status of every request retired by this call.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn wait_some(&self, requests: &mut [RawRequest]) -> Result<Option<Vec<(usize, Status)>>> {
        self.runtime.wait_some(requests)
    }

    /// Reports whether every request of the set is complete.
    ///
    /// Neither blocks nor retires handles, so no `free` callback runs.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn test(&self, requests: &[RawRequest]) -> Result<bool> {
        self.runtime.test(requests)
    }

    /// Retires one complete request of the set, if there is one.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn test_any(&self, requests: &mut [RawRequest]) -> Result<TestAny> {
        self.runtime.test_any(requests)
    }

    /// Retires every complete request of the set.  Returns `None` if the set holds no active
    /// request.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn test_some(&self, requests: &mut [RawRequest]) -> Result<Option<Vec<(usize, Status)>>> {
        self.runtime.test_some(requests)
    }

    /// Retires the whole set if every request in it is complete.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn test_all(&self, requests: &mut [RawRequest]) -> Result<Option<Vec<Status>>> {
        self.runtime.test_all(requests)
    }

    /// Returns the status of a complete request without retiring it, or `None` while the request
    /// is active.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn get_status(&self, request: RawRequest) -> Result<Option<Status>> {
        self.runtime.get_status(request)
    }

    /// Waits for a receive to complete and hands out the received message.
    ///
    /// # Errors
    ///
    /// `WrongKind` if `request` is not a receive.
    pub fn wait_receive(&self, request: RawRequest) -> Result<(Vec<u8>, Status)> {
        self.runtime.wait_receive(request)
    }

    /// Gives up the handle without waiting for the request.  The operation carries on and its
    /// resources are released once it completes.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn request_free(&self, request: RawRequest) -> Result<()> {
        self.runtime.request_free(request)
    }

    /// Requests cancellation of an operation.
    ///
    /// Cancellation is advisory: the request still has to complete, and its status tells whether
    /// the cancellation took effect.  Only the first cancellation of an active request has an
    /// effect.
    ///
    /// Generalized requests get their `cancel` callback invoked on this thread.  The callback may
    /// complete or free its own request; the request is released, and its `free` callback run,
    /// only once `cancel` returns.  A failure of the callback is attached to the request before
    /// any waiter can retire it and is reported by the retiring wait.  If the handle was already
    /// freed or retired when the callback failed, nobody is left to report to and `cancel`
    /// returns the `Callback` error itself.
    ///
    /// # Standard section(s)
    ///
    /// 3.8.4
    pub fn cancel(&self, request: RawRequest) -> Result<()> {
        self.runtime.cancel(request)
    }

    /// Polls every active generalized request that has a `poll` callback once.
    pub fn progress(&self) {
        self.runtime.poll(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::environment::InitOptions;
    use crate::error::ErrorClass;
    use crate::request::generalized::{CallbackResult, GeneralizedOps};

    fn universe() -> Universe {
        let _ = env_logger::builder().is_test(true).try_init();
        Universe::with_options(InitOptions::new().endpoints(2))
    }

    #[derive(Default)]
    struct Tally {
        queries: AtomicUsize,
        frees: AtomicUsize,
        cancels: AtomicUsize,
    }

    struct Ops {
        tally: Arc<Tally>,
        bytes: usize,
        query_error: Option<ErrorClass>,
    }

    impl GeneralizedOps for Ops {
        fn query(&mut self, status: &mut Status) -> CallbackResult {
            self.tally.queries.fetch_add(1, Ordering::SeqCst);
            status.set_count(self.bytes);
            match self.query_error {
                Some(class) => Err(class),
                None => Ok(()),
            }
        }

        fn free(&mut self) -> CallbackResult {
            self.tally.frees.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn cancel(&mut self, _complete: bool) -> CallbackResult {
            self.tally.cancels.fetch_add(1, Ordering::SeqCst);
            Err(ErrorClass::User(3))
        }
    }

    fn start(universe: &Universe, bytes: usize) -> (RawRequest, Arc<Tally>) {
        let tally = Arc::new(Tally::default());
        let request = universe
            .generalized_request_start(Ops {
                tally: tally.clone(),
                bytes,
                query_error: None,
            })
            .unwrap();
        (request, tally)
    }

    #[test]
    fn null_requests_are_inactive() {
        let universe = universe();
        assert_eq!(universe.wait(REQUEST_NULL).unwrap(), Status::empty());
        assert_eq!(universe.wait_any(&mut [REQUEST_NULL]).unwrap(), None);
        assert_eq!(universe.wait_some(&mut [REQUEST_NULL]).unwrap(), None);
        assert_eq!(universe.test_any(&mut [REQUEST_NULL]).unwrap(), TestAny::NoneActive);
        assert!(universe.test(&[REQUEST_NULL]).unwrap());
        assert_eq!(universe.get_status(REQUEST_NULL).unwrap(), Some(Status::empty()));
        assert_eq!(
            universe.request_free(REQUEST_NULL).unwrap_err(),
            Error::InvalidHandle(REQUEST_NULL)
        );
    }

    #[test]
    fn get_status_queries_without_retiring() {
        let universe = universe();
        let (request, tally) = start(&universe, 11);
        assert_eq!(universe.get_status(request).unwrap(), None);
        assert_eq!(tally.queries.load(Ordering::SeqCst), 0);

        universe.generalized_request_complete(request).unwrap();
        assert_eq!(universe.get_status(request).unwrap().unwrap().count(), 11);
        assert_eq!(universe.get_status(request).unwrap().unwrap().count(), 11);
        assert_eq!(tally.frees.load(Ordering::SeqCst), 0);

        assert_eq!(universe.wait(request).unwrap().count(), 11);
        assert_eq!(tally.queries.load(Ordering::SeqCst), 3);
        assert_eq!(tally.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_cancel_is_reported_by_wait() {
        let universe = universe();
        let (request, tally) = start(&universe, 0);
        universe.cancel(request).unwrap();
        universe.cancel(request).unwrap();
        assert_eq!(tally.cancels.load(Ordering::SeqCst), 1);

        universe.generalized_request_complete(request).unwrap();
        let err = universe.wait(request).unwrap_err();
        assert_eq!(
            err,
            Error::Callback {
                request,
                callback: Callback::Cancel,
                class: ErrorClass::User(3)
            }
        );
        assert_eq!(tally.frees.load(Ordering::SeqCst), 1);
        assert_eq!(universe.wait(request).unwrap_err(), Error::InvalidHandle(request));
    }

    #[test]
    fn failing_query_is_reported_in_status() {
        let universe = universe();
        let tally = Arc::new(Tally::default());
        let failing = universe
            .generalized_request_start(Ops {
                tally: tally.clone(),
                bytes: 1,
                query_error: Some(ErrorClass::Other),
            })
            .unwrap();
        let (fine, _) = start(&universe, 2);
        universe.generalized_request_complete(failing).unwrap();
        universe.generalized_request_complete(fine).unwrap();

        let mut requests = [fine, REQUEST_NULL, failing];
        match universe.wait_all(&mut requests).unwrap_err() {
            Error::InStatus(statuses) => {
                assert_eq!(
                    statuses.iter().map(|&(index, _)| index).collect::<Vec<_>>(),
                    vec![0, 1, 2]
                );
                assert_eq!(statuses[0].1.count(), 2);
                assert_eq!(statuses[0].1.error(), None);
                assert_eq!(statuses[1].1, Status::empty());
                assert_eq!(statuses[2].1.error(), Some(ErrorClass::Other));
            }
            err => panic!("unexpected error {}", err),
        }
        assert_eq!(requests, [REQUEST_NULL; 3]);
        assert_eq!(tally.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_some_reports_failures_by_index() {
        let universe = universe();
        let tally = Arc::new(Tally::default());
        let failing = universe
            .generalized_request_start(Ops {
                tally: tally.clone(),
                bytes: 1,
                query_error: Some(ErrorClass::User(5)),
            })
            .unwrap();
        let (idle, _) = start(&universe, 0);
        let (fine, _) = start(&universe, 4);
        universe.generalized_request_complete(failing).unwrap();
        universe.generalized_request_complete(fine).unwrap();

        let mut requests = [idle, fine, failing];
        match universe.wait_some(&mut requests).unwrap_err() {
            Error::InStatus(statuses) => {
                assert_eq!(statuses.len(), 2);
                assert_eq!(statuses[0].0, 1);
                assert_eq!(statuses[0].1.count(), 4);
                assert_eq!(statuses[1].0, 2);
                assert_eq!(statuses[1].1.error(), Some(ErrorClass::User(5)));
            }
            err => panic!("unexpected error {}", err),
        }
        assert_eq!(requests, [idle, REQUEST_NULL, REQUEST_NULL]);

        universe.generalized_request_complete(idle).unwrap();
        universe.wait(idle).unwrap();
    }

    #[test]
    fn test_any_and_test_some_retire_complete_requests() {
        let universe = universe();
        let (a, _) = start(&universe, 1);
        let (b, _) = start(&universe, 2);
        let (c, _) = start(&universe, 3);
        let mut requests = [a, b, c];

        assert_eq!(universe.test_any(&mut requests).unwrap(), TestAny::NoneComplete);
        assert_eq!(universe.test_some(&mut requests).unwrap(), Some(vec![]));

        universe.generalized_request_complete(b).unwrap();
        match universe.test_any(&mut requests).unwrap() {
            TestAny::Completed(1, status) => assert_eq!(status.count(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(requests[1], REQUEST_NULL);

        universe.generalized_request_complete(a).unwrap();
        universe.generalized_request_complete(c).unwrap();
        let completed = universe.test_some(&mut requests).unwrap().unwrap();
        assert_eq!(
            completed.iter().map(|&(index, _)| index).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(universe.test_some(&mut requests).unwrap(), None);
    }

    #[test]
    fn test_all_retires_only_a_complete_set() {
        let universe = universe();
        let (a, _) = start(&universe, 1);
        let send = universe.immediate_send(0, 1, 0, vec![1, 2]).unwrap();
        let mut requests = [a, send];

        assert_eq!(universe.test_all(&mut requests).unwrap(), None);
        assert_eq!(requests, [a, send]);

        universe.generalized_request_complete(a).unwrap();
        let statuses = universe.test_all(&mut requests).unwrap().unwrap();
        assert_eq!(statuses[0].count(), 1);
        assert_eq!(statuses[1].count(), 2);
    }

    #[test]
    fn wait_receive_rejects_other_kinds() {
        let universe = universe();
        let (request, _) = start(&universe, 0);
        assert_eq!(
            universe.wait_receive(request).unwrap_err(),
            Error::WrongKind {
                request,
                expected: "receive"
            }
        );
        universe.generalized_request_complete(request).unwrap();
        universe.wait(request).unwrap();
    }

    #[test]
    fn invalid_handle_in_set_short_circuits() {
        let universe = universe();
        let (request, tally) = start(&universe, 0);
        universe.generalized_request_complete(request).unwrap();

        let bogus = request ^ (1 << 40);
        let mut requests = [request, bogus];
        assert_eq!(
            universe.wait_all(&mut requests).unwrap_err(),
            Error::InvalidHandle(bogus)
        );
        assert_eq!(tally.queries.load(Ordering::SeqCst), 0);
        assert_eq!(requests, [request, bogus]);
        assert!(universe.test(&[bogus]).is_err());
        universe.wait(request).unwrap();
    }
}
