//! The routing graph.
//!
//! Hosts attach to points of presence; edges carry latency and a packet-loss
//! fraction. The graph answers three questions for the core: is a peer
//! routable, what is the path latency, and what is the smallest latency
//! anywhere in the graph. The last one doubles as the scheduler's safety
//! horizon: no cross-host event may be scheduled closer than one
//! minimum-latency hop into the future, which is what makes it safe for
//! workers to run different hosts in parallel below that horizon.
//!
//! Parsing GraphML into vertices and edges happens upstream; this crate
//! consumes the already-parsed lists.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::collections::HashMap;
use std::net::Ipv4Addr;

use parking_lot::RwLock;
use petgraph::Undirected;
use petgraph::algo::astar;
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef as _;
use sim_time::SimDuration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Link {
    pub latency: SimDuration,
    /// Fraction of packets lost on this link, in `[0, 1)`.
    pub packet_loss: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Path {
    pub latency: SimDuration,
    pub packet_loss: f64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown vertex `{0}`")]
    UnknownVertex(String),
    #[error("duplicate vertex `{0}`")]
    DuplicateVertex(String),
    #[error("link latency must be greater than zero")]
    ZeroLatency,
    #[error("graph has no links")]
    NoLinks,
}

#[derive(Debug, Default)]
pub struct Builder {
    graph: Graph<String, Link, Undirected>,
    by_key: HashMap<String, NodeIndex>,
}

impl Builder {
    pub fn vertex(&mut self, key: &str) -> Result<(), Error> {
        if self.by_key.contains_key(key) {
            return Err(Error::DuplicateVertex(key.to_owned()));
        }

        let index = self.graph.add_node(key.to_owned());
        self.by_key.insert(key.to_owned(), index);

        Ok(())
    }

    pub fn link(
        &mut self,
        a: &str,
        b: &str,
        latency: SimDuration,
        packet_loss: f64,
    ) -> Result<(), Error> {
        if latency.is_zero() {
            return Err(Error::ZeroLatency);
        }

        let a = self.resolve(a)?;
        let b = self.resolve(b)?;

        self.graph.add_edge(
            a,
            b,
            Link {
                latency,
                packet_loss: packet_loss.clamp(0.0, 1.0),
            },
        );

        Ok(())
    }

    pub fn build(self) -> Result<Topology, Error> {
        let min_latency = self
            .graph
            .edge_weights()
            .map(|l| l.latency)
            .min()
            .ok_or(Error::NoLinks)?;
        let max_link_latency = self
            .graph
            .edge_weights()
            .map(|l| l.latency)
            .max()
            .ok_or(Error::NoLinks)?;

        Ok(Topology {
            graph: self.graph,
            by_key: self.by_key,
            attachments: RwLock::new(HashMap::new()),
            paths: RwLock::new(HashMap::new()),
            min_latency,
            max_link_latency,
        })
    }

    fn resolve(&self, key: &str) -> Result<NodeIndex, Error> {
        self.by_key
            .get(key)
            .copied()
            .ok_or_else(|| Error::UnknownVertex(key.to_owned()))
    }
}

/// An immutable routing graph plus the mutable host-attachment table.
///
/// Shared read-only across workers; path lookups memoise shortest paths
/// under a write lock on first use.
#[derive(Debug)]
pub struct Topology {
    graph: Graph<String, Link, Undirected>,
    by_key: HashMap<String, NodeIndex>,
    attachments: RwLock<HashMap<Ipv4Addr, NodeIndex>>,
    paths: RwLock<HashMap<(NodeIndex, NodeIndex), Option<Path>>>,
    min_latency: SimDuration,
    max_link_latency: SimDuration,
}

impl Topology {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// A single-vertex graph where every host reaches every other at the
    /// given latency. Used by scenarios without an explicit graph and by
    /// tests.
    pub fn fully_connected(latency: SimDuration) -> Self {
        let mut builder = Builder::default();
        builder.vertex("net").expect("fresh builder");
        builder
            .link("net", "net", latency, 0.0)
            .expect("latency is checked by the caller");

        builder.build().expect("graph has one link")
    }

    /// All vertex keys, sorted. Controllers use this to spread hosts over
    /// the graph.
    pub fn vertices(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.by_key.keys().cloned().collect();
        keys.sort();

        keys
    }

    pub fn has_vertex(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// Attach a host address to a vertex.
    pub fn attach(&self, ip: Ipv4Addr, vertex: &str) -> Result<(), Error> {
        let index = self
            .by_key
            .get(vertex)
            .copied()
            .ok_or_else(|| Error::UnknownVertex(vertex.to_owned()))?;

        self.attachments.write().insert(ip, index);

        tracing::debug!(%ip, %vertex, "Attached host to topology");

        Ok(())
    }

    pub fn detach(&self, ip: Ipv4Addr) {
        self.attachments.write().remove(&ip);
    }

    pub fn is_attached(&self, ip: Ipv4Addr) -> bool {
        self.attachments.read().contains_key(&ip)
    }

    pub fn is_routable(&self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        self.path(src, dst).is_some()
    }

    pub fn latency(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<SimDuration> {
        Some(self.path(src, dst)?.latency)
    }

    pub fn packet_loss(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<f64> {
        Some(self.path(src, dst)?.packet_loss)
    }

    /// Smallest link latency anywhere in the graph. Strictly positive.
    pub fn min_latency(&self) -> SimDuration {
        self.min_latency
    }

    /// Largest link latency anywhere in the graph; the pessimistic one-hop
    /// delay used for receive-buffer autotuning.
    pub fn max_latency(&self) -> SimDuration {
        self.max_link_latency
    }

    /// Shortest-path lookup, memoised per ordered vertex pair.
    pub fn path(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<Path> {
        let (a, b) = {
            let attachments = self.attachments.read();

            (*attachments.get(&src)?, *attachments.get(&dst)?)
        };

        if let Some(cached) = self.paths.read().get(&(a, b)) {
            return *cached;
        }

        let path = self.compute_path(a, b);
        self.paths.write().insert((a, b), path);

        path
    }

    fn compute_path(&self, a: NodeIndex, b: NodeIndex) -> Option<Path> {
        if a == b {
            // Hosts on the same vertex talk via the vertex's self-loop if it
            // has one, otherwise via the cheapest link anywhere.
            let latency = self
                .graph
                .edges(a)
                .filter(|e| e.source() == e.target())
                .map(|e| e.weight().latency)
                .min()
                .unwrap_or(self.min_latency);

            return Some(Path {
                latency,
                packet_loss: 0.0,
            });
        }

        let (latency, nodes) = astar(
            &self.graph,
            a,
            |n| n == b,
            |e| e.weight().latency,
            |_| SimDuration::ZERO,
        )?;

        let mut delivery = 1.0;
        for pair in nodes.windows(2) {
            let loss = self
                .graph
                .edges_connecting(pair[0], pair[1])
                .map(|e| e.weight().packet_loss)
                .fold(f64::INFINITY, f64::min);
            delivery *= 1.0 - loss;
        }

        Some(Path {
            latency,
            packet_loss: 1.0 - delivery,
        })
    }
}
