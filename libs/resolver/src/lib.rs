//! Name service for the simulated network.
//!
//! Every host registers its hostname and IPv4 address here at boot, together
//! with the bandwidth of its access link. Lookups come from two directions:
//! the controller resolves scenario hostnames while wiring hosts up, and
//! plug-ins resolve names at runtime through the `getaddrinfo` surface.
//! Reads vastly outnumber writes, so the table sits behind a single
//! reader-writer lock.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::collections::HashMap;
use std::net::Ipv4Addr;

use bimap::BiMap;
use parking_lot::RwLock;

/// Hostname used when a caller registers with an empty name.
pub const DEFAULT_HOSTNAME: &str = "default.umbra";

/// First address handed out when a registration does not request one.
const AUTO_IP_BASE: u32 = u32::from_be_bytes([11, 0, 0, 1]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bandwidth {
    pub kbps_down: u64,
    pub kbps_up: u64,
}

impl Bandwidth {
    /// The lower of the two directions, the effective floor of the link.
    pub fn floor(&self) -> u64 {
        self.kbps_down.min(self.kbps_up)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub hostname: String,
    pub ip: Ipv4Addr,
    pub bandwidth: Bandwidth,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("no addresses left to assign")]
    AddressSpaceExhausted,
}

#[derive(Debug, Default)]
struct Inner {
    names: BiMap<String, Ipv4Addr>,
    bandwidth: HashMap<Ipv4Addr, Bandwidth>,
    next_unique_id: u32,
    next_auto_ip: u32,
}

/// Bidirectional hostname <-> address map, shared across all workers.
#[derive(Debug, Default)]
pub struct Resolver {
    inner: RwLock<Inner>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host.
    ///
    /// An empty `hostname` is rewritten to [`DEFAULT_HOSTNAME`] and always
    /// receives a unique-id prefix. With `unique_prefix`, repeated
    /// registrations of the same name yield `0.web`, `1.web`, ... so a
    /// scenario can stamp out many copies of one host definition.
    ///
    /// A registration that reuses an existing hostname or address overwrites
    /// it; the displaced back-mapping is removed in the same critical
    /// section so the map never aliases.
    pub fn register(
        &self,
        hostname: &str,
        requested_ip: Option<Ipv4Addr>,
        unique_prefix: bool,
        bandwidth: Bandwidth,
    ) -> Result<Entry, Error> {
        let mut inner = self.inner.write();

        let base = if hostname.is_empty() {
            DEFAULT_HOSTNAME
        } else {
            hostname
        };

        let hostname = if unique_prefix || hostname.is_empty() {
            let id = inner.next_unique_id;
            inner.next_unique_id += 1;

            format!("{id}.{base}")
        } else {
            base.to_owned()
        };

        let ip = match requested_ip {
            Some(ip) => ip,
            None => next_free_ip(&mut inner)?,
        };

        for (_, displaced) in displaced_pairs(inner.names.insert(hostname.clone(), ip)) {
            inner.bandwidth.remove(&displaced);
        }
        inner.bandwidth.insert(ip, bandwidth);

        tracing::debug!(%hostname, %ip, "Registered host");

        Ok(Entry {
            hostname,
            ip,
            bandwidth,
        })
    }

    pub fn remove_by_name(&self, hostname: &str) -> Option<Entry> {
        let mut inner = self.inner.write();

        let (hostname, ip) = inner.names.remove_by_left(hostname)?;
        let bandwidth = inner.bandwidth.remove(&ip)?;

        Some(Entry {
            hostname,
            ip,
            bandwidth,
        })
    }

    pub fn remove_by_addr(&self, ip: Ipv4Addr) -> Option<Entry> {
        let mut inner = self.inner.write();

        let (hostname, ip) = inner.names.remove_by_right(&ip)?;
        let bandwidth = inner.bandwidth.remove(&ip)?;

        Some(Entry {
            hostname,
            ip,
            bandwidth,
        })
    }

    /// Exact, case-sensitive hostname lookup.
    pub fn resolve_by_name(&self, hostname: &str) -> Option<Ipv4Addr> {
        self.inner.read().names.get_by_left(hostname).copied()
    }

    pub fn resolve_by_addr(&self, ip: Ipv4Addr) -> Option<String> {
        self.inner.read().names.get_by_right(&ip).cloned()
    }

    pub fn bandwidth(&self, ip: Ipv4Addr) -> Option<Bandwidth> {
        self.inner.read().bandwidth.get(&ip).copied()
    }

    /// Minimum of all four directions between two hosts, the most a flow
    /// between them can sustain.
    pub fn bandwidth_floor(&self, a: Ipv4Addr, b: Ipv4Addr) -> Option<u64> {
        let inner = self.inner.read();

        let a = inner.bandwidth.get(&a)?;
        let b = inner.bandwidth.get(&b)?;

        Some(a.floor().min(b.floor()))
    }

    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().names.is_empty()
    }
}

fn next_free_ip(inner: &mut Inner) -> Result<Ipv4Addr, Error> {
    loop {
        let candidate = AUTO_IP_BASE
            .checked_add(inner.next_auto_ip)
            .ok_or(Error::AddressSpaceExhausted)?;
        inner.next_auto_ip += 1;

        let candidate = Ipv4Addr::from(candidate);

        if !inner.names.contains_right(&candidate) {
            return Ok(candidate);
        }
    }
}

fn displaced_pairs(overwritten: bimap::Overwritten<String, Ipv4Addr>) -> Vec<(String, Ipv4Addr)> {
    match overwritten {
        bimap::Overwritten::Neither => vec![],
        bimap::Overwritten::Left(name, ip)
        | bimap::Overwritten::Right(name, ip)
        | bimap::Overwritten::Pair(name, ip) => vec![(name, ip)],
        bimap::Overwritten::Both(left, right) => vec![left, right],
    }
}
