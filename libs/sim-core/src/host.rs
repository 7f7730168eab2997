//! The host: one simulated network node and everything it owns.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use parking_lot::{Mutex, MutexGuard};
use rand::SeedableRng as _;
use rand::rngs::StdRng;
use sim_packet::Protocol;
use transport::{PrioritySource, TcpConfig};

use crate::cpu::Cpu;
use crate::descriptor::DescriptorTable;
use crate::interface::{NetworkInterface, QDisc};
use crate::process::{Process, ProcessId};
use crate::{HostId, SimConfig};

pub const LOOPBACK: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Loopback is effectively free; model it as a 10 Gbit link.
const LOOPBACK_KBPS: u64 = 10_000_000;

/// Per-host settings, resolved from scenario attributes with CLI defaults.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub hostname: String,
    pub ip: Ipv4Addr,
    pub kbps_down: u64,
    pub kbps_up: u64,
    /// Zero disables CPU-delay modelling for this host.
    pub cpu_khz: u64,
    pub interface_buffer: usize,
    pub tcp: TcpConfig,
    pub autotune: bool,
    pub qdisc: QDisc,
    pub data_dir: Option<PathBuf>,
    /// Per-host log filter override, e.g. `debug`.
    pub log_level: Option<String>,
}

impl HostConfig {
    pub fn new(hostname: impl Into<String>, ip: Ipv4Addr, sim: &SimConfig) -> Self {
        Self {
            hostname: hostname.into(),
            ip,
            kbps_down: 10_240,
            kbps_up: 10_240,
            cpu_khz: 0,
            interface_buffer: sim.interface_buffer,
            tcp: sim.tcp.clone(),
            autotune: sim.autotune,
            qdisc: sim.qdisc,
            data_dir: None,
            log_level: None,
        }
    }
}

/// Byte and packet counters reported by the heartbeat.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tracker {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_dropped: u64,
    pub syscalls: u64,
}

#[derive(Debug)]
pub struct Host {
    pub id: HostId,
    pub hostname: String,
    pub default_ip: Ipv4Addr,
    pub interfaces: BTreeMap<Ipv4Addr, NetworkInterface>,
    pub descriptors: DescriptorTable,
    /// Abstract unix paths mapped to synthetic loopback ports.
    pub unix_ports: BTreeMap<String, u16>,
    pub processes: BTreeMap<ProcessId, Process>,
    pub cpu: Cpu,
    pub tracker: Tracker,
    pub rng: StdRng,
    /// Stamps outbound packets for QDisc fairness.
    pub prio: PrioritySource,
    /// Per-source event sequence, the deterministic tiebreak for events
    /// this host schedules.
    event_seq: u64,
    pub config: HostConfig,
}

impl Host {
    pub fn new(id: HostId, config: HostConfig, seed: u64) -> Self {
        let mut interfaces = BTreeMap::new();

        interfaces.insert(
            LOOPBACK,
            NetworkInterface::new(LOOPBACK, LOOPBACK_KBPS, LOOPBACK_KBPS, usize::MAX),
        );
        interfaces.insert(
            config.ip,
            NetworkInterface::new(
                config.ip,
                config.kbps_down,
                config.kbps_up,
                config.interface_buffer,
            ),
        );

        // Every host draws from its own stream so event interleaving
        // across hosts cannot perturb anyone's randomness.
        let rng = StdRng::seed_from_u64(seed.wrapping_add(u64::from(id.0).wrapping_mul(0x9E37_79B9_7F4A_7C15)));

        Self {
            id,
            hostname: config.hostname.clone(),
            default_ip: config.ip,
            interfaces,
            descriptors: DescriptorTable::new(),
            unix_ports: BTreeMap::new(),
            processes: BTreeMap::new(),
            cpu: Cpu::new(config.cpu_khz),
            tracker: Tracker::default(),
            rng,
            prio: PrioritySource::default(),
            event_seq: 0,
            config,
        }
    }

    pub fn next_event_seq(&mut self) -> u64 {
        let seq = self.event_seq;
        self.event_seq += 1;

        seq
    }

    /// The local interface a packet to `dst` leaves from.
    pub fn egress_ip(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if dst.is_loopback() || dst == self.default_ip {
            LOOPBACK
        } else {
            self.default_ip
        }
    }

    pub fn interface(&self, ip: Ipv4Addr) -> Option<&NetworkInterface> {
        self.interfaces.get(&ip)
    }

    pub fn interface_mut(&mut self, ip: Ipv4Addr) -> Option<&mut NetworkInterface> {
        self.interfaces.get_mut(&ip)
    }

    /// Whether `(protocol, port)` is free on every interface, the test an
    /// ANY-address bind must pass.
    pub fn port_free_everywhere(&self, protocol: Protocol, port: u16) -> bool {
        self.interfaces
            .values()
            .all(|i| i.is_port_free(protocol, port))
    }

    pub fn add_process(&mut self, name: impl Into<String>, args: Vec<String>, app: Box<dyn crate::Application>) -> ProcessId {
        let id = ProcessId(self.processes.len() as u32 + 1);

        self.processes
            .insert(id, Process::new(id, name, args, app));

        id
    }
}

/// The shareable wrapper around a host: immutable identity plus the
/// exclusive lock every worker serializes on.
#[derive(Debug)]
pub struct HostCell {
    id: HostId,
    hostname: String,
    ip: Ipv4Addr,
    state: Mutex<Host>,
}

impl HostCell {
    pub fn new(id: HostId, config: HostConfig, seed: u64) -> Self {
        Self {
            id,
            hostname: config.hostname.clone(),
            ip: config.ip,
            state: Mutex::new(Host::new(id, config, seed)),
        }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// Exclusive access to the host state. Workers hold this across the
    /// processing of one event; nothing ever takes two host locks at once.
    pub fn lock(&self) -> MutexGuard<'_, Host> {
        self.state.lock()
    }
}
