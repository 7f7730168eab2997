//! Virtual UDP.
//!
//! Almost stateless: a datagram socket keeps a bounded send queue that the
//! interface drains and a bounded receive queue the application drains.
//! There is no flow control; a datagram that does not fit in either queue
//! is dropped whole, never truncated or corrupted.

use std::collections::VecDeque;
use std::net::SocketAddrV4;

use bytes::Bytes;
use sim_packet::Packet;

use crate::{PrioritySource, SocketState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UdpError {
    #[error("no datagram available")]
    WouldBlock,
    #[error("destination required for unconnected socket")]
    NotConnected,
}

#[derive(Debug)]
pub struct UdpSocket {
    local: Option<SocketAddrV4>,
    /// Default peer, set by `connect`.
    peer: Option<SocketAddrV4>,

    send_capacity: usize,
    send_used: usize,
    send_queue: VecDeque<Packet>,

    recv_capacity: usize,
    recv_used: usize,
    recv_queue: VecDeque<Packet>,

    dropped_tx: u64,
    dropped_rx: u64,
}

impl UdpSocket {
    pub fn new(send_capacity: usize, recv_capacity: usize) -> Self {
        Self {
            local: None,
            peer: None,
            send_capacity,
            send_used: 0,
            send_queue: VecDeque::new(),
            recv_capacity,
            recv_used: 0,
            recv_queue: VecDeque::new(),
            dropped_tx: 0,
            dropped_rx: 0,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.local
    }

    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.peer
    }

    pub fn bind(&mut self, local: SocketAddrV4) {
        self.local = Some(local);
    }

    pub fn is_bound(&self) -> bool {
        self.local.is_some()
    }

    /// Set the default peer. UDP `connect` is just a filter/default, there
    /// is no handshake.
    pub fn connect(&mut self, peer: SocketAddrV4) {
        self.peer = Some(peer);
    }

    /// Queue one datagram. Returns the payload length even when the
    /// datagram is dropped for lack of buffer space; UDP gives no delivery
    /// feedback.
    pub fn send_to(
        &mut self,
        dst: Option<SocketAddrV4>,
        payload: &[u8],
        prio: &mut PrioritySource,
    ) -> Result<usize, UdpError> {
        let local = self.local.expect("caller binds before sending");
        let dst = dst.or(self.peer).ok_or(UdpError::NotConnected)?;

        if self.send_used + payload.len() > self.send_capacity {
            self.dropped_tx += 1;

            tracing::trace!(%dst, len = payload.len(), "Send queue full, dropping datagram");

            return Ok(payload.len());
        }

        let packet = Packet::udp(local, dst, Bytes::copy_from_slice(payload), prio.next());

        self.send_used += packet.len();
        self.send_queue.push_back(packet);

        Ok(payload.len())
    }

    /// Dequeue one whole datagram.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), UdpError> {
        let packet = self.recv_queue.pop_front().ok_or(UdpError::WouldBlock)?;

        self.recv_used = self.recv_used.saturating_sub(packet.len());

        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet.payload()[..n]);

        Ok((n, packet.source()))
    }

    /// Inbound datagram from the interface.
    pub fn push_packet(&mut self, packet: &Packet) {
        // A connected socket only accepts its peer.
        if let Some(peer) = self.peer
            && packet.source() != peer
        {
            return;
        }

        if self.recv_used + packet.len() > self.recv_capacity {
            self.dropped_rx += 1;

            tracing::trace!(src = %packet.source(), len = packet.len(), "Receive queue full, dropping datagram");

            return;
        }

        self.recv_used += packet.len();
        self.recv_queue.push_back(packet.clone());
    }

    /// Next outbound datagram for the interface.
    pub fn pop_packet(&mut self) -> Option<Packet> {
        let packet = self.send_queue.pop_front()?;
        self.send_used = self.send_used.saturating_sub(packet.len());

        Some(packet)
    }

    pub fn has_outbound(&self) -> bool {
        !self.send_queue.is_empty()
    }

    pub fn poll(&self) -> SocketState {
        SocketState {
            readable: !self.recv_queue.is_empty(),
            writable: self.send_used < self.send_capacity,
            hangup: false,
            error: false,
        }
    }

    pub fn has_buffered_input(&self) -> bool {
        !self.recv_queue.is_empty()
    }

    pub fn dropped(&self) -> (u64, u64) {
        (self.dropped_tx, self.dropped_rx)
    }

    /// Drain the drop counters. The owning host folds these into its
    /// per-host accounting after every operation that may shed datagrams.
    pub fn take_dropped(&mut self) -> u64 {
        let total = self.dropped_tx + self.dropped_rx;

        self.dropped_tx = 0;
        self.dropped_rx = 0;

        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    fn bound() -> (UdpSocket, PrioritySource) {
        let mut s = UdpSocket::new(128, 128);
        s.bind(sock("10.0.0.1:5000"));

        (s, PrioritySource::default())
    }

    #[test]
    fn unconnected_send_requires_destination() {
        let (mut s, mut prio) = bound();

        assert_eq!(s.send_to(None, b"x", &mut prio), Err(UdpError::NotConnected));
    }

    #[test]
    fn connect_sets_default_peer_and_filters_input() {
        let (mut s, mut prio) = bound();
        s.connect(sock("10.0.0.2:53"));

        s.send_to(None, b"query", &mut prio).unwrap();
        let out = s.pop_packet().unwrap();
        assert_eq!(out.destination(), sock("10.0.0.2:53"));

        // Datagram from a third party is ignored.
        let stray = Packet::udp(sock("10.0.0.9:1"), sock("10.0.0.1:5000"), Bytes::from_static(b"spoof"), 0.0);
        s.push_packet(&stray);
        assert!(!s.poll().readable);
    }

    #[test]
    fn overflow_drops_whole_datagrams() {
        let (mut s, mut prio) = bound();

        // 128-byte queue: two 64-byte datagrams fit, the third is dropped.
        for _ in 0..3 {
            s.send_to(Some(sock("10.0.0.2:9")), &[0u8; 64], &mut prio)
                .unwrap();
        }

        assert_eq!(s.dropped(), (1, 0));
        assert_eq!(s.pop_packet().unwrap().len(), 64);
        assert_eq!(s.pop_packet().unwrap().len(), 64);
        assert!(s.pop_packet().is_none());

        // Draining hands the count to the owner exactly once.
        assert_eq!(s.take_dropped(), 1);
        assert_eq!(s.dropped(), (0, 0));
    }

    #[test]
    fn recv_returns_whole_datagram_with_source() {
        let (mut s, _) = bound();
        let incoming = Packet::udp(
            sock("10.0.0.2:53"),
            sock("10.0.0.1:5000"),
            Bytes::from_static(b"answer"),
            0.0,
        );

        s.push_packet(&incoming);

        let mut buf = [0u8; 32];
        let (n, from) = s.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"answer");
        assert_eq!(from, sock("10.0.0.2:53"));
        assert_eq!(s.recv_from(&mut buf), Err(UdpError::WouldBlock));
    }
}
