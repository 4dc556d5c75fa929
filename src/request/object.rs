//! The request object behind every handle

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::handle::RawRequest;
use crate::point_to_point::{Rank, Status, Tag};
use crate::request::generalized::GeneralizedOps;

/// Kind of operation a request tracks.  Fixed when the request is created.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Point-to-point send
    Send,
    /// Point-to-point receive
    Receive,
    /// Collective operation
    Collective,
    /// Partitioned send, complete once every partition is ready
    Partitioned,
    /// Operation driven by caller supplied callbacks
    Generalized,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl RequestKind {
    /// Lower case name, as used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            RequestKind::Send => "send",
            RequestKind::Receive => "receive",
            RequestKind::Collective => "collective",
            RequestKind::Partitioned => "partitioned",
            RequestKind::Generalized => "generalized",
        }
    }
}

/// Callbacks of a generalized request.  The lock serializes callback invocations of one request.
pub(crate) type SharedOps = Arc<Mutex<Box<dyn GeneralizedOps>>>;

/// Kind specific part of a request.
pub(crate) enum Payload {
    Send {
        /// endpoint whose mailbox holds the message until it is matched
        dest: Rank,
    },
    Receive {
        /// endpoint that posted the receive
        dest: Rank,
        data: Option<Vec<u8>>,
    },
    Collective,
    Partitioned {
        source: Rank,
        dest: Rank,
        tag: Tag,
        parts: Vec<Option<Vec<u8>>>,
    },
    Generalized {
        ops: SharedOps,
        pollable: bool,
    },
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Payload::Send { dest } => f.debug_struct("Send").field("dest", &dest).finish(),
            Payload::Receive { dest, ref data } => f
                .debug_struct("Receive")
                .field("dest", &dest)
                .field("received", &data.as_ref().map(Vec::len))
                .finish(),
            Payload::Collective => f.write_str("Collective"),
            Payload::Partitioned { ref parts, .. } => f
                .debug_struct("Partitioned")
                .field("partitions", &parts.len())
                .finish(),
            Payload::Generalized { pollable, .. } => f
                .debug_struct("Generalized")
                .field("pollable", &pollable)
                .finish(),
        }
    }
}

/// One outstanding operation.
///
/// The object is complete once `completion_count` reaches zero and is reclaimed once, in
/// addition, `ref_count` reaches zero and none of its callbacks is running.  References are held
/// by the caller's handle and by any transport structure (posted receive, unmatched synchronous
/// send, barrier) that will later complete the request.
///
/// A callback may complete or free its own request.  Reclaiming would then run `free` under the
/// operations lock the callback still holds, so the thread that started the callback reclaims
/// the object once the callback has returned.
#[derive(Debug)]
pub(crate) struct RequestObject {
    kind: RequestKind,
    completion_count: usize,
    ref_count: usize,
    handle_live: bool,
    callbacks_running: usize,
    pub status: Status,
    pub error_state: Option<Error>,
    pub cancel_pending: bool,
    pub payload: Payload,
}

impl RequestObject {
    /// A fresh, active request referenced by its handle only.
    pub fn new(kind: RequestKind, completion_count: usize, payload: Payload) -> Self {
        debug_assert!(completion_count > 0, "requests start active");
        Self {
            kind,
            completion_count,
            ref_count: 1,
            handle_live: true,
            callbacks_running: 0,
            status: Status::empty(),
            error_state: None,
            cancel_pending: false,
            payload,
        }
    }

    /// Kind fixed at creation.
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Whether every sub-event of the request has been recorded.
    pub fn is_complete(&self) -> bool {
        self.completion_count == 0
    }

    /// Sub-events still outstanding.
    pub fn completion_count(&self) -> usize {
        self.completion_count
    }

    /// References held by the handle and by the transport.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Whether a callback of this request is running on some thread.
    pub fn in_callback(&self) -> bool {
        self.callbacks_running > 0
    }

    /// Whether the caller still holds the handle.
    pub fn handle_live(&self) -> bool {
        self.handle_live
    }

    /// Records `partial` sub-events.  Returns `true` if this call completed the request.
    pub fn decrement(&mut self, request: RawRequest, partial: usize) -> Result<bool> {
        if self.completion_count == 0 {
            return Err(Error::AlreadyCompleted(request));
        }
        if partial == 0 || partial > self.completion_count {
            return Err(Error::InvalidArgument("completion count would underflow"));
        }
        self.completion_count -= partial;
        Ok(self.completion_count == 0)
    }

    /// Adds a transport reference.
    pub fn add_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Drops one reference.  Returns `true` if the object may now be reclaimed.
    pub fn drop_ref(&mut self) -> bool {
        debug_assert!(self.ref_count > 0, "reference count underflow");
        self.ref_count = self.ref_count.saturating_sub(1);
        self.is_reclaimable()
    }

    /// Drops the reference held by the caller's handle.  The handle stops resolving.
    pub fn drop_handle(&mut self) -> bool {
        debug_assert!(self.handle_live, "handle released twice");
        self.handle_live = false;
        self.drop_ref()
    }

    /// Complete, unreferenced and not inside a callback.
    pub fn is_reclaimable(&self) -> bool {
        self.ref_count == 0 && self.completion_count == 0 && self.callbacks_running == 0
    }

    /// Pins the object for a callback about to run outside the critical section and hands out
    /// its callbacks.  `None` for native requests.
    pub fn begin_callback(&mut self) -> Option<SharedOps> {
        let ops = self.ops()?.clone();
        self.callbacks_running += 1;
        Some(ops)
    }

    /// Unpins the object after a callback returned.  Returns `true` if it may now be reclaimed.
    pub fn end_callback(&mut self) -> bool {
        debug_assert!(self.callbacks_running > 0, "callback ended twice");
        self.callbacks_running = self.callbacks_running.saturating_sub(1);
        self.is_reclaimable()
    }

    /// Records the first error reported for this request.
    pub fn record_error(&mut self, err: Error) {
        if self.error_state.is_none() {
            self.error_state = Some(err);
        }
    }

    /// Callbacks of a generalized request.
    pub fn ops(&self) -> Option<&SharedOps> {
        match self.payload {
            Payload::Generalized { ref ops, .. } => Some(ops),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::generalized::CallbackResult;

    fn partitioned(parts: usize) -> RequestObject {
        RequestObject::new(
            RequestKind::Partitioned,
            parts,
            Payload::Partitioned {
                source: 0,
                dest: 1,
                tag: 0,
                parts: vec![None; parts],
            },
        )
    }

    #[test]
    fn multi_part_completion() {
        let mut req = partitioned(3);
        assert_eq!(req.decrement(1, 1), Ok(false));
        assert_eq!(req.decrement(1, 1), Ok(false));
        assert!(!req.is_complete());
        assert_eq!(req.decrement(1, 1), Ok(true));
        assert!(req.is_complete());
        assert_eq!(req.decrement(1, 1), Err(Error::AlreadyCompleted(1)));
    }

    #[test]
    fn completion_count_never_goes_negative() {
        let mut req = partitioned(2);
        assert!(req.decrement(5, 3).is_err());
        assert_eq!(req.completion_count(), 2);
    }

    #[test]
    fn reclaimable_only_when_complete_and_unreferenced() {
        let mut req = RequestObject::new(RequestKind::Collective, 1, Payload::Collective);
        req.add_ref();
        assert!(!req.drop_handle());
        assert!(!req.handle_live());
        req.decrement(9, 1).unwrap();
        assert!(!req.is_reclaimable());
        assert!(req.drop_ref());
    }

    struct Quiet;

    impl GeneralizedOps for Quiet {
        fn query(&mut self, _status: &mut Status) -> CallbackResult {
            Ok(())
        }

        fn free(&mut self) -> CallbackResult {
            Ok(())
        }

        fn cancel(&mut self, _complete: bool) -> CallbackResult {
            Ok(())
        }
    }

    #[test]
    fn running_callback_keeps_the_object() {
        let ops: SharedOps = Arc::new(Mutex::new(Box::new(Quiet)));
        let mut req = RequestObject::new(
            RequestKind::Generalized,
            1,
            Payload::Generalized {
                ops,
                pollable: false,
            },
        );
        assert!(req.begin_callback().is_some());
        assert!(req.in_callback());
        req.decrement(4, 1).unwrap();
        assert!(!req.drop_handle());
        assert!(req.end_callback());
        assert!(!req.in_callback());
    }

    #[test]
    fn native_requests_have_no_callbacks() {
        let mut req = RequestObject::new(RequestKind::Send, 1, Payload::Send { dest: 0 });
        assert!(req.begin_callback().is_none());
        assert!(!req.in_callback());
    }

    #[test]
    fn first_error_sticks() {
        let mut req = RequestObject::new(RequestKind::Send, 1, Payload::Send { dest: 0 });
        req.record_error(Error::InvalidArgument("first"));
        req.record_error(Error::InvalidArgument("second"));
        assert_eq!(req.error_state, Some(Error::InvalidArgument("first")));
    }
}
