//! Events: deferred actions delivered at a simulated time to one host.

use std::cmp::Ordering;
use std::fmt;

use sim_packet::Packet;
use sim_time::SimTime;

use crate::{Fd, HostId, ProcessId, syscall::SyscallCtx};

/// A deferred closure run on the destination host.
pub type Task = Box<dyn FnOnce(&mut SyscallCtx<'_, '_>) + Send>;

/// Deterministic tiebreak for events that share a delivery time.
///
/// The counter is per *source* host and each host's execution is
/// serialized, so the key is reproducible no matter how worker threads
/// interleave — a global insertion counter would not be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub src: HostId,
    pub seq: u64,
}

pub enum EventPayload {
    /// A packet reached the destination host's interface.
    PacketArrival(Packet),
    /// Re-check a descriptor's readiness and fire application callbacks.
    DescriptorReady { fd: Fd },
    /// Run a scheduled closure (plug-in callbacks, timer expirations).
    Callback(Task),
    ProcessStart(ProcessId),
    ProcessStop(ProcessId),
    /// A transport timer (RTO, TIME_WAIT) may be due on this socket.
    TransportTimer { fd: Fd },
    /// Periodic per-host status log; re-arms itself.
    Heartbeat,
}

impl fmt::Debug for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPayload::PacketArrival(packet) => write!(f, "PacketArrival({packet})"),
            EventPayload::DescriptorReady { fd } => write!(f, "DescriptorReady({fd})"),
            EventPayload::Callback(_) => write!(f, "Callback"),
            EventPayload::ProcessStart(pid) => write!(f, "ProcessStart({pid:?})"),
            EventPayload::ProcessStop(pid) => write!(f, "ProcessStop({pid:?})"),
            EventPayload::TransportTimer { fd } => write!(f, "TransportTimer({fd})"),
            EventPayload::Heartbeat => write!(f, "Heartbeat"),
        }
    }
}

#[derive(Debug)]
pub struct Event {
    pub time: SimTime,
    pub dst: HostId,
    pub key: EventKey,
    pub payload: EventPayload,
}

impl Event {
    /// Strict lexicographic delivery order: `(time, dst, key)`.
    pub fn order(&self) -> (SimTime, HostId, EventKey) {
        (self.time, self.dst, self.key)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.order() == other.order()
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order().cmp(&other.order())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(time: u64, src: u32, seq: u64) -> Event {
        Event {
            time: SimTime::from_nanos(time),
            dst: HostId(1),
            key: EventKey {
                src: HostId(src),
                seq,
            },
            payload: EventPayload::Heartbeat,
        }
    }

    #[test]
    fn time_dominates_ordering() {
        assert!(event(1, 9, 9) < event(2, 0, 0));
    }

    #[test]
    fn source_then_sequence_break_ties() {
        assert!(event(5, 1, 7) < event(5, 2, 0));
        assert!(event(5, 1, 0) < event(5, 1, 1));
    }
}
