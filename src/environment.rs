//! Environmental management
//!
//! A runtime instance is represented by a `Universe`.  Creating one initializes the
//! request-completion core, dropping it finalizes the core.  The process-wide instance is obtained
//! through [`initialize()`](fn.initialize.html); further, independent instances can be created with
//! [`Universe::with_options()`](struct.Universe.html#method.with_options).
//!
//! Every request operation is reached through a `Universe`, so no operation can run before
//! initialization.  Using a runtime after it was finalized is a fatal error.
//!
//! # Unfinished features
//!
//! - **8.1**: Implementation information, `MPI_Get_version()`, `MPI_Get_library_version()`
//! - **8.6**: Startup, `MPI_Query_thread()`, `MPI_Is_thread_main()`

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};

use crate::runtime::Runtime;

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static FINALIZED: AtomicBool = AtomicBool::new(false);

/// How request and transport state is locked.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LockingMode {
    /// A single lock serializes all transport operations, in addition to the global critical
    /// section that guards request state.
    Global,
    /// Transport operations only take the lock of the channel serving the target endpoint, so
    /// operations on different channels proceed in parallel.
    PerChannel,
}

impl FromStr for LockingMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(LockingMode::Global),
            "per-channel" | "per_channel" | "channel" | "vci" => Ok(LockingMode::PerChannel),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LockingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            LockingMode::Global => "global",
            LockingMode::PerChannel => "per-channel",
        })
    }
}

/// Runtime configuration
///
/// Use the builder methods to deviate from the defaults:
///
/// ```
/// use mpi_request::environment::{InitOptions, LockingMode};
///
/// let options = InitOptions::new()
///     .locking(LockingMode::PerChannel)
///     .channels(8)
///     .endpoints(4);
/// # assert_eq!(options.channel_count(), 8);
/// ```
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct InitOptions {
    locking: LockingMode,
    channels: usize,
    endpoints: usize,
    max_requests: usize,
    poll_interval: Duration,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl InitOptions {
    /// Default options
    pub fn new() -> Self {
        Self {
            locking: LockingMode::Global,
            channels: 4,
            endpoints: 2,
            max_requests: 1 << 16,
            poll_interval: Duration::from_millis(1),
        }
    }

    /// Default options, overridden by the environment variables `MPI_REQUEST_LOCKING`,
    /// `MPI_REQUEST_CHANNELS`, `MPI_REQUEST_ENDPOINTS` and `MPI_REQUEST_MAX_REQUESTS`.
    /// Values that do not parse are ignored.
    pub fn from_env() -> Self {
        Self::new().overlay(|name| env::var(name).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: FromStr>(name: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.parse() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    warn!("ignoring {}={:?}: not a valid value", name, value);
                    None
                }
            }
        }

        if let Some(locking) = parse("MPI_REQUEST_LOCKING", lookup("MPI_REQUEST_LOCKING")) {
            self.locking = locking;
        }
        if let Some(channels) = parse("MPI_REQUEST_CHANNELS", lookup("MPI_REQUEST_CHANNELS")) {
            self = self.channels(channels);
        }
        if let Some(endpoints) = parse("MPI_REQUEST_ENDPOINTS", lookup("MPI_REQUEST_ENDPOINTS")) {
            self = self.endpoints(endpoints);
        }
        if let Some(max) = parse("MPI_REQUEST_MAX_REQUESTS", lookup("MPI_REQUEST_MAX_REQUESTS")) {
            self = self.max_requests(max);
        }
        self
    }

    /// Set the locking mode (default: `Global`)
    pub fn locking(mut self, locking: LockingMode) -> Self {
        self.locking = locking;
        self
    }

    /// Set the number of channel locks used with `LockingMode::PerChannel` (default: 4)
    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = channels.max(1);
        self
    }

    /// Set the number of local endpoints (default: 2)
    pub fn endpoints(mut self, endpoints: usize) -> Self {
        self.endpoints = endpoints.max(1);
        self
    }

    /// Set the maximum number of live requests (default: 65536)
    pub fn max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Set how long a blocked wait sleeps before polling generalized requests again
    /// (default: 1 ms)
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Locking mode in effect
    pub fn locking_mode(&self) -> LockingMode {
        self.locking
    }

    /// Number of channel locks in effect.  Always 1 with `LockingMode::Global`.
    pub fn channel_count(&self) -> usize {
        match self.locking {
            LockingMode::Global => 1,
            LockingMode::PerChannel => self.channels,
        }
    }

    /// Number of endpoints the transport serves
    pub fn endpoint_count(&self) -> usize {
        self.endpoints
    }

    /// Maximum number of live requests
    pub fn max_request_count(&self) -> usize {
        self.max_requests
    }

    /// How long a blocked wait on pollable requests sleeps between polls
    pub fn poll_interval_duration(&self) -> Duration {
        self.poll_interval
    }
}

/// A runtime instance
///
/// Owns the request table, the transport and the locks protecting them.  `Universe` is `Sync`:
/// share it by reference between the threads that issue, complete and wait for requests.
///
/// # Standard section(s)
///
/// 8.7
pub struct Universe {
    pub(crate) runtime: Runtime,
    process_wide: bool,
}

impl fmt::Debug for Universe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Universe")
            .field("options", self.runtime.options())
            .field("process_wide", &self.process_wide)
            .finish()
    }
}

impl Universe {
    /// Creates an independent runtime instance.
    pub fn with_options(options: InitOptions) -> Self {
        Universe {
            runtime: Runtime::new(options),
            process_wide: false,
        }
    }

    /// The options the runtime was created with.
    pub fn options(&self) -> &InitOptions {
        self.runtime.options()
    }

    /// Number of requests the runtime currently tracks, including those whose handle was freed.
    pub fn live_requests(&self) -> usize {
        self.runtime.enter().len()
    }
}

impl Drop for Universe {
    fn drop(&mut self) {
        self.runtime.finalize();
        if self.process_wide {
            FINALIZED.store(true, Ordering::SeqCst);
            debug!("process-wide runtime finalized");
        }
    }
}

/// Initialize the process-wide runtime with default options.
///
/// Returns `None` if the process-wide runtime has already been initialized.
///
/// # Examples
///
/// ```
/// let universe = mpi_request::initialize().unwrap();
/// assert!(mpi_request::environment::is_initialized());
/// # drop(universe);
/// ```
///
/// # Standard section(s)
///
/// 8.7
pub fn initialize() -> Option<Universe> {
    initialize_with_options(InitOptions::from_env())
}

/// Initialize the process-wide runtime with the given options.
///
/// Returns `None` if the process-wide runtime has already been initialized.
pub fn initialize_with_options(options: InitOptions) -> Option<Universe> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return None;
    }
    debug!("initializing process-wide runtime");
    Some(Universe {
        runtime: Runtime::new(options),
        process_wide: true,
    })
}

/// Whether the process-wide runtime has been initialized.
///
/// # Standard section(s)
///
/// 8.7
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

/// Whether the process-wide runtime has been finalized.
///
/// # Standard section(s)
///
/// 8.7
pub fn is_finalized() -> bool {
    FINALIZED.load(Ordering::SeqCst)
}
