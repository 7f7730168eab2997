//! The simulation core.
//!
//! Everything here revolves around one loop: workers pull events off the
//! shared queue, lock the destination host, and dispatch. Hosts own their
//! descriptors, interfaces and CPU model; the virtual syscall surface
//! mutates them synchronously on behalf of application code. All
//! cross-host traffic travels through the event queue, never through
//! direct calls, which is what makes the per-host lock sufficient for
//! parallel execution.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod cpu;
mod descriptor;
mod event;
mod host;
mod interface;
mod process;
mod queue;
mod scheduler;
pub mod syscall;
mod worker;

pub use cpu::{BLOCK_THRESHOLD, Cpu};
pub use descriptor::{
    Descriptor, DescriptorKind, DescriptorTable, Epoll, EpollEvents, EpollInterest, FileStatus,
    Pipe, PipeRole, ReadyEvent, Timer,
};
pub use event::{Event, EventKey, EventPayload, Task};
pub use host::{Host, HostCell, HostConfig, LOOPBACK, Tracker};
pub use interface::{MIN_EPHEMERAL_PORT, NetworkInterface, QDisc};
pub use process::{Application, Process, ProcessId};
pub use queue::{EventQueue, InvalidSchedule};
pub use scheduler::Scheduler;
pub use syscall::{AddressFamily, EpollOp, Errno, SockType, SyscallCtx};
pub use worker::Worker;

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use resolver::Resolver;
use sim_time::{SimDuration, SimTime};
use topology::Topology;
use transport::TcpConfig;

/// Identifies one simulated host. Id 0 is reserved for the controller
/// (the source of boot-time events).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(pub u32);

pub const CONTROLLER_ID: HostId = HostId(0);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host{}", self.0)
    }
}

/// A descriptor handle, a small integer scoped to one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fd(pub i32);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

/// Simulation-wide knobs, resolved from CLI and scenario configuration.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub seed: u64,
    pub stop_time: SimTime,
    pub tcp: TcpConfig,
    pub autotune: bool,
    pub qdisc: QDisc,
    pub interface_buffer: usize,
    pub heartbeat_interval: Option<SimDuration>,
    /// Level heartbeat counter lines are emitted at.
    pub heartbeat_level: tracing::Level,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            stop_time: SimTime::from_nanos(u64::MAX),
            tcp: TcpConfig::default(),
            autotune: true,
            qdisc: QDisc::Fifo,
            interface_buffer: 1024 * 1024,
            heartbeat_interval: Some(SimDuration::from_secs(1)),
            heartbeat_level: tracing::Level::INFO,
        }
    }
}

/// Shared, read-mostly simulation state: everything a worker needs besides
/// the host it currently holds.
pub struct Sim {
    pub config: SimConfig,
    pub queue: EventQueue,
    pub resolver: Arc<Resolver>,
    pub topology: Arc<Topology>,
    hosts: Vec<Arc<HostCell>>,
    by_ip: HashMap<Ipv4Addr, HostId>,
}

impl Sim {
    pub fn new(
        config: SimConfig,
        resolver: Arc<Resolver>,
        topology: Arc<Topology>,
    ) -> Self {
        let queue = EventQueue::new(topology.min_latency());

        Self {
            config,
            queue,
            resolver,
            topology,
            hosts: Vec::new(),
            by_ip: HashMap::new(),
        }
    }

    /// Register a host. Ids are handed out sequentially starting at 1.
    pub fn add_host(&mut self, config: HostConfig) -> Arc<HostCell> {
        let id = HostId(self.hosts.len() as u32 + 1);
        let ip = config.ip;
        let cell = Arc::new(HostCell::new(id, config, self.config.seed));

        self.hosts.push(cell.clone());
        self.by_ip.insert(ip, id);

        cell
    }

    pub fn host_id_by_ip(&self, ip: Ipv4Addr) -> Option<HostId> {
        self.by_ip.get(&ip).copied()
    }

    pub fn host(&self, id: HostId) -> Option<&Arc<HostCell>> {
        let index = id.0.checked_sub(1)? as usize;

        self.hosts.get(index)
    }

    pub fn hosts(&self) -> &[Arc<HostCell>] {
        &self.hosts
    }
}
