//! Collective communication
//!
//! Only the nonblocking barrier is provided.  Its requests are of kind `Collective` and are
//! completed by the endpoint that enters the barrier last.
//!
//! # Unfinished features
//!
//! - Every other collective, blocking or not

use log::trace;
use parking_lot::Mutex;

use crate::environment::Universe;
use crate::error::{Error, Result};
use crate::handle::RawRequest;
use crate::point_to_point::Rank;
use crate::request::object::{Payload, RequestKind, RequestObject};
use crate::runtime::Runtime;

/// Endpoints that entered the current barrier epoch, with their requests.
#[derive(Debug, Default)]
pub(crate) struct Barrier {
    arrived: Mutex<Vec<(Rank, RawRequest)>>,
}

impl Runtime {
    fn barrier(&self, rank: Rank) -> Result<RawRequest> {
        self.transport.check_rank(rank)?;

        let mut arrived = self.transport.barrier.arrived.lock();
        if arrived.iter().any(|&(entered, _)| entered == rank) {
            return Err(Error::InvalidArgument("endpoint already entered the barrier"));
        }

        let mut registry = self.enter();
        let request = registry.insert(RequestObject::new(
            RequestKind::Collective,
            1,
            Payload::Collective,
        ))?;
        // the barrier's reference, dropped when the epoch ends
        registry.add_ref(request)?;
        arrived.push((rank, request));
        trace!("endpoint {} entered barrier ({}/{})", rank, arrived.len(), self.transport.endpoints());

        if arrived.len() == self.transport.endpoints() {
            for (_, member) in arrived.drain(..) {
                registry.mark_complete(member, 1)?;
                registry.release_ref(member);
            }
            drop(registry);
            self.notify_completion();
        }
        Ok(request)
    }
}

impl Universe {
    /// Enters a nonblocking barrier on behalf of endpoint `rank`.
    ///
    /// The returned request completes once every endpoint of the universe has entered the
    /// barrier.  An endpoint may enter the next barrier only after the current one completed.
    ///
    /// # Standard section(s)
    ///
    /// 5.12.1
    pub fn immediate_barrier(&self, rank: Rank) -> Result<RawRequest> {
        self.runtime.barrier(rank)
    }
}
