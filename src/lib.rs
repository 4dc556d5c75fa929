#![deny(missing_debug_implementations)]
#![warn(missing_copy_implementations)]
#![warn(trivial_casts)]
#![warn(trivial_numeric_casts)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_qualifications)]

//! Request completion for a message-passing runtime
//!
//! Every non-blocking operation of the runtime (sends, receives, the non-blocking barrier,
//! partitioned sends and user-defined *generalized requests*) is represented by a request.  This
//! crate provides the request machinery and a small in-process transport that exercises it:
//!
//! - a table that maps opaque `RawRequest` handles to request objects and detects stale handles,
//! - the request state machine (active, complete, released) with reference counting,
//! - the completion engine: `wait`, `test`, their `any`/`some`/`all` variants, cancellation and
//! polling,
//! - generalized requests, whose behaviour is supplied by the caller through
//! [`GeneralizedOps`](request/generalized/trait.GeneralizedOps.html),
//! - a critical-section discipline that lets any number of threads issue, complete and wait for
//! requests at the same time.
//!
//! # Usage
//!
//! Obtain a [`Universe`](environment/struct.Universe.html) with
//! [`initialize()`](environment/fn.initialize.html) or `Universe::with_options()`; every
//! operation is a method on it.  The typed wrappers of the [`request`](request/index.html) module
//! make sure handles are given back.
//!
//! ```
//! let universe = mpi_request::initialize().unwrap();
//!
//! let receive = universe.immediate_receive(1, Some(0), Some(7)).unwrap();
//! let send = universe.immediate_send(0, 1, 7, b"hello".to_vec()).unwrap();
//!
//! let (data, status) = universe.wait_receive(receive).unwrap();
//! assert_eq!(data, b"hello".to_vec());
//! assert_eq!(status.source_rank(), Some(0));
//! universe.wait(send).unwrap();
//! ```
//!
//! # Logging
//!
//! The crate logs through the `log` facade: request life cycle events at `trace`, runtime set
//! up and tear down at `debug`, failed callbacks and leaked requests at `warn`.
//!
//! # Configuration
//!
//! See [`InitOptions`](environment/struct.InitOptions.html).  `initialize()` reads overrides from
//! the `MPI_REQUEST_*` environment variables.

pub mod collective;
mod completion;
pub mod environment;
pub mod error;
pub mod handle;
pub mod point_to_point;
pub mod raw;
pub mod request;
mod runtime;

/// Re-exports all traits.
pub mod traits {
    pub use crate::raw::traits::*;
    pub use crate::request::generalized::GeneralizedOps;
    pub use crate::request::traits::*;
}

pub use crate::completion::TestAny;
pub use crate::environment::{
    initialize, initialize_with_options, InitOptions, LockingMode, Universe,
};
pub use crate::error::{Error, ErrorClass, Result};
pub use crate::handle::{RawRequest, REQUEST_NULL};
pub use crate::point_to_point::{Rank, Status, Tag};
pub use crate::request::generalized::{CallbackResult, Callbacks, GeneralizedOps};
pub use crate::request::object::RequestKind;
pub use crate::request::{Completer, Request, RequestCollection};
