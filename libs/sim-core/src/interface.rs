//! Network interfaces.
//!
//! An interface owns the association table mapping `(protocol, port)` to
//! the socket bound there, stages outbound packets in a batch buffer that
//! the queuing discipline orders, and paces transmission against the
//! link's upstream bandwidth with a serialization clock.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use rand::Rng;
use rand::rngs::StdRng;
use sim_packet::{Packet, Protocol};
use sim_time::{SimDuration, SimTime};

use crate::Fd;

pub const MIN_EPHEMERAL_PORT: u16 = 10_000;

/// Queuing discipline for interface egress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QDisc {
    /// Strict send order, using the per-host monotonic packet priority.
    #[default]
    Fifo,
    /// One packet per socket per turn.
    RoundRobin,
}

impl std::str::FromStr for QDisc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(QDisc::Fifo),
            "rr" => Ok(QDisc::RoundRobin),
            other => Err(format!("unknown qdisc `{other}` (expected fifo|rr)")),
        }
    }
}

/// Everything bound to one `(protocol, port)` pair.
///
/// UDP sockets and TCP listeners own the port; accepted TCP children are
/// demultiplexed by peer address on top of the same port.
#[derive(Debug, Default)]
pub struct PortBinding {
    pub owner: Option<Fd>,
    pub connections: BTreeMap<SocketAddrV4, Fd>,
}

impl PortBinding {
    fn is_empty(&self) -> bool {
        self.owner.is_none() && self.connections.is_empty()
    }
}

#[derive(Debug)]
struct Staged {
    fd: Fd,
    packet: Packet,
}

#[derive(Debug)]
pub struct NetworkInterface {
    ip: Ipv4Addr,
    kbps_up: u64,
    kbps_down: u64,
    associations: BTreeMap<(Protocol, u16), PortBinding>,
    batch: Vec<Staged>,
    /// Egress serialization clock: the instant the link is next idle.
    next_free_tx: SimTime,
    /// Bound on how far transmissions may be queued ahead of `now`,
    /// expressed in bytes of link backlog.
    buffer_bytes: usize,
    rr_cursor: usize,
}

impl NetworkInterface {
    pub fn new(ip: Ipv4Addr, kbps_down: u64, kbps_up: u64, buffer_bytes: usize) -> Self {
        Self {
            ip,
            kbps_up: kbps_up.max(1),
            kbps_down: kbps_down.max(1),
            associations: BTreeMap::new(),
            batch: Vec::new(),
            next_free_tx: SimTime::ZERO,
            buffer_bytes,
            rr_cursor: 0,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn kbps_up(&self) -> u64 {
        self.kbps_up
    }

    pub fn kbps_down(&self) -> u64 {
        self.kbps_down
    }

    // --- Associations ----------------------------------------------------

    pub fn is_port_free(&self, protocol: Protocol, port: u16) -> bool {
        !self.associations.contains_key(&(protocol, port))
    }

    /// Bind a socket as the owner of `(protocol, port)`.
    pub fn associate(&mut self, protocol: Protocol, port: u16, fd: Fd) {
        let binding = self.associations.entry((protocol, port)).or_default();

        debug_assert!(binding.owner.is_none(), "port owner already set");
        binding.owner = Some(fd);
    }

    /// Register an accepted TCP child under its peer address.
    pub fn associate_connection(
        &mut self,
        protocol: Protocol,
        port: u16,
        peer: SocketAddrV4,
        fd: Fd,
    ) {
        self.associations
            .entry((protocol, port))
            .or_default()
            .connections
            .insert(peer, fd);
    }

    pub fn disassociate(&mut self, protocol: Protocol, port: u16, fd: Fd) {
        let Some(binding) = self.associations.get_mut(&(protocol, port)) else {
            return;
        };

        if binding.owner == Some(fd) {
            binding.owner = None;
        }
        binding.connections.retain(|_, owner| *owner != fd);

        if binding.is_empty() {
            self.associations.remove(&(protocol, port));
        }
    }

    /// Route an inbound packet to a socket: an exact peer match wins over
    /// the port owner.
    pub fn lookup(&self, protocol: Protocol, dst_port: u16, src: SocketAddrV4) -> Option<Fd> {
        let binding = self.associations.get(&(protocol, dst_port))?;

        binding.connections.get(&src).copied().or(binding.owner)
    }

    pub fn bound_fds(&self) -> impl Iterator<Item = Fd> + '_ {
        self.associations
            .values()
            .flat_map(|b| b.owner.into_iter().chain(b.connections.values().copied()))
    }

    // --- Egress ----------------------------------------------------------

    /// Stage an outbound packet popped from a socket.
    pub fn stage(&mut self, fd: Fd, packet: Packet) {
        self.batch.push(Staged { fd, packet });
    }

    pub fn has_staged(&self) -> bool {
        !self.batch.is_empty()
    }

    /// Order the batch buffer per the queuing discipline and hand the
    /// packets back for transmission.
    pub fn drain_batch(&mut self, qdisc: QDisc) -> Vec<Packet> {
        let staged = std::mem::take(&mut self.batch);

        match qdisc {
            QDisc::Fifo => {
                let mut staged = staged;
                // The priority stamp is host-monotonic, so this recovers
                // global send order across sockets.
                staged.sort_by(|a, b| {
                    a.packet
                        .priority()
                        .partial_cmp(&b.packet.priority())
                        .expect("priorities are never NaN")
                });

                staged.into_iter().map(|s| s.packet).collect()
            }
            QDisc::RoundRobin => self.round_robin(staged),
        }
    }

    fn round_robin(&mut self, staged: Vec<Staged>) -> Vec<Packet> {
        let mut by_fd: BTreeMap<Fd, Vec<Packet>> = BTreeMap::new();

        for s in staged {
            by_fd.entry(s.fd).or_default().push(s.packet);
        }
        for queue in by_fd.values_mut() {
            queue.sort_by(|a, b| {
                a.priority()
                    .partial_cmp(&b.priority())
                    .expect("priorities are never NaN")
            });
            queue.reverse(); // pop from the back
        }

        let fds: Vec<Fd> = by_fd.keys().copied().collect();
        let mut out = Vec::new();
        let mut cursor = self.rr_cursor;

        while by_fd.values().any(|q| !q.is_empty()) {
            let fd = fds[cursor % fds.len()];
            cursor += 1;

            if let Some(packet) = by_fd.get_mut(&fd).and_then(Vec::pop) {
                out.push(packet);
            }
        }

        self.rr_cursor = cursor % fds.len().max(1);

        out
    }

    /// Reserve link time for `bytes` and return the instant transmission
    /// completes, or `None` when the backlog exceeds the interface buffer
    /// (the packet should stay with its socket).
    pub fn reserve_tx(&mut self, now: SimTime, bytes: usize) -> Option<SimTime> {
        let backlog = self.next_free_tx.saturating_sub(now);
        let backlog_bytes = (backlog.as_secs_f64() * self.kbps_up as f64 * 1000.0 / 8.0) as usize;

        if backlog_bytes > self.buffer_bytes {
            return None;
        }

        let start = self.next_free_tx.max(now);
        let done = start + self.transmission_delay(bytes);
        self.next_free_tx = done;

        Some(done)
    }

    pub fn transmission_delay(&self, bytes: usize) -> SimDuration {
        SimDuration::from_secs_f64(bytes as f64 * 8.0 / (self.kbps_up as f64 * 1000.0))
    }
}

/// Pick a free port in `[MIN_EPHEMERAL_PORT, 65535]`.
///
/// With more than 1% of the range free, random probes (bounded by the
/// number of free ports) almost surely land; otherwise a linear scan
/// guarantees any remaining port is found.
pub fn pick_ephemeral_port(
    rng: &mut StdRng,
    mut is_free: impl FnMut(u16) -> bool,
) -> Option<u16> {
    let total = usize::from(u16::MAX - MIN_EPHEMERAL_PORT) + 1;
    let free = (MIN_EPHEMERAL_PORT..=u16::MAX)
        .filter(|p| is_free(*p))
        .count();

    if free == 0 {
        return None;
    }

    if free * 100 > total {
        for _ in 0..free {
            let candidate = rng.gen_range(MIN_EPHEMERAL_PORT..=u16::MAX);

            if is_free(candidate) {
                return Some(candidate);
            }
        }
    }

    (MIN_EPHEMERAL_PORT..=u16::MAX).find(|p| is_free(*p))
}
