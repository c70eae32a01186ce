//! Ports connecting the cache to its neighbours.

use crate::{engine::Scheduler, packet::Packet};

/// Memory side port of a cache.
pub trait RequestPort: std::fmt::Debug {
    /// Offers a request to the level below.
    ///
    /// Returns false if the request was refused. The port schedules
    /// [`crate::engine::Event::MemRequestRetry`] once it accepts again.
    fn send_timing_req(&mut self, pkt: Packet, sched: &mut dyn Scheduler) -> bool;
}

/// Caches (or the CPU) above a cache, reachable for snoops and probes.
pub trait UpperLevel: std::fmt::Debug {
    /// Delivers a snoop.
    ///
    /// The upper level updates the packet flags, and supplies data if it
    /// responds.
    fn snoop(&mut self, pkt: &mut Packet);
}
