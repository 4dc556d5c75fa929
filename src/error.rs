//! Error reporting
//!
//! Every fallible operation returns an [`Error`](enum.Error.html).  Errors fall into three groups:
//!
//! - usage errors (invalid handle, wrong request kind, completing twice), detected while the
//!   handle is validated and before any caller callback runs,
//! - callback errors, reported by a `query`, `free`, `cancel` or `poll` callback of a generalized
//!   request and attached to that request until somebody waits on it,
//! - resource errors, raised when a new request cannot be allocated.
//!
//! None of them is fatal to the runtime.  Each error maps onto an [`ErrorClass`], the value stored
//! in a `Status` and handed to callbacks.

use std::fmt;

use thiserror::Error;

use crate::handle::RawRequest;
use crate::point_to_point::Status;

/// Error classes shared by the runtime and caller callbacks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Invalid argument
    Arg,
    /// Invalid request handle
    Request,
    /// Known error not in this list
    Other,
    /// Internal runtime error
    Intern,
    /// Out of memory or out of request slots
    NoMem,
    /// Error code is in the status of one of several requests
    InStatus,
    /// Message truncated on receive
    Truncate,
    /// Operation was cancelled
    Cancelled,
    /// Error class defined by a caller callback
    User(i32),
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ErrorClass::Arg => f.write_str("invalid argument"),
            ErrorClass::Request => f.write_str("invalid request"),
            ErrorClass::Other => f.write_str("other error"),
            ErrorClass::Intern => f.write_str("internal error"),
            ErrorClass::NoMem => f.write_str("out of resources"),
            ErrorClass::InStatus => f.write_str("error in status"),
            ErrorClass::Truncate => f.write_str("message truncated"),
            ErrorClass::Cancelled => f.write_str("operation cancelled"),
            ErrorClass::User(code) => write!(f, "user error {}", code),
        }
    }
}

/// Callback slot of a generalized request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Callback {
    /// Status query
    Query,
    /// Resource release
    Free,
    /// Cancellation
    Cancel,
    /// Progress poll
    Poll,
}

impl fmt::Display for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Callback::Query => "query",
            Callback::Free => "free",
            Callback::Cancel => "cancel",
            Callback::Poll => "poll",
        })
    }
}

/// Errors raised by the request-completion core
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The handle does not name a live request.
    #[error("invalid request handle {0:#x}")]
    InvalidHandle(RawRequest),

    /// The handle names a request that was not created by a generalized request start.
    #[error("request {0:#x} is not a generalized request")]
    NotGeneralized(RawRequest),

    /// The handle names a request of a kind the operation does not accept.
    #[error("request {request:#x} is not a {expected} request")]
    WrongKind {
        /// offending handle
        request: RawRequest,
        /// kind the operation expects
        expected: &'static str,
    },

    /// Completion was signalled for a request that is already complete.
    #[error("request {0:#x} is already complete")]
    AlreadyCompleted(RawRequest),

    /// The handle table has no free slot left.
    #[error("request table exhausted ({0} slots)")]
    Exhausted(usize),

    /// A caller supplied callback reported a failure.
    #[error("{callback} callback of request {request:#x} failed: {class}")]
    Callback {
        /// request the callback belongs to
        request: RawRequest,
        /// which callback failed
        callback: Callback,
        /// class the callback reported
        class: ErrorClass,
    },

    /// The request completed, but its status carries an error.
    #[error("request {request:#x} completed with error: {}", .status.error().unwrap_or(ErrorClass::Other))]
    Status {
        /// completed request
        request: RawRequest,
        /// final status of the request
        status: Status,
    },

    /// Several requests were completed and at least one of them failed.  Carries the index in
    /// the request set and the status of every request the call retired.
    #[error("error in status of {} request(s)", .0.iter().filter(|(_, s)| s.error().is_some()).count())]
    InStatus(Vec<(usize, Status)>),

    /// A partition was marked ready twice or is out of range.
    #[error("partition {partition} of request {request:#x} is invalid or already ready")]
    Partition {
        /// partitioned request
        request: RawRequest,
        /// offending partition index
        partition: usize,
    },

    /// An argument outside of any handle is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A validation error, tagged with the public operation that detected it.
    #[error("{op}({request:#x}) failed: {source}")]
    Context {
        /// public operation
        op: &'static str,
        /// handle passed to the operation
        request: RawRequest,
        /// underlying error
        #[source]
        source: Box<Error>,
    },
}

/// Result type of the request-completion core
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Error class of this error, as it would be stored in a `Status`.
    pub fn class(&self) -> ErrorClass {
        match *self {
            Error::InvalidHandle(_) | Error::AlreadyCompleted(_) => ErrorClass::Request,
            Error::NotGeneralized(_)
            | Error::WrongKind { .. }
            | Error::Partition { .. }
            | Error::InvalidArgument(_) => ErrorClass::Arg,
            Error::Exhausted(_) => ErrorClass::NoMem,
            Error::Callback { class, .. } => class,
            Error::Status { ref status, .. } => status.error().unwrap_or(ErrorClass::Other),
            Error::InStatus(_) => ErrorClass::InStatus,
            Error::Context { ref source, .. } => source.class(),
        }
    }

    /// Wraps the error with the name of the public operation that reports it.
    pub(crate) fn context(self, op: &'static str, request: RawRequest) -> Self {
        Error::Context {
            op,
            request,
            source: Box::new(self),
        }
    }

    /// The innermost error, with all `Context` layers removed.
    pub fn root(&self) -> &Error {
        match *self {
            Error::Context { ref source, .. } => source.root(),
            ref other => other,
        }
    }
}
