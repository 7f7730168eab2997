//! Socket buffers.
//!
//! The send side keeps three queues: `pending` (accepted from the
//! application, not yet on the wire), `retransmit` (on the wire, unacked)
//! and `control` (pure ACK/RST segments that are never retransmitted).
//! Both `pending` and `retransmit` are kept in sequence order by
//! construction, so cumulative-ACK processing is a pop-from-front loop.
//!
//! The receive side separates `delivered` (in-order, readable) data from
//! the out-of-order reassembly set and tracks a byte offset into the head
//! packet so applications may read in arbitrary chunk sizes.

use std::collections::VecDeque;

use sim_packet::{Packet, TcpFlags};

use crate::seq::Seq;

/// Sequence space consumed by a segment: payload plus SYN/FIN.
pub fn seq_len(packet: &Packet) -> u32 {
    let header = packet.as_tcp().expect("only tcp segments occupy seq space");
    let mut len = packet.len() as u32;

    if header.flags.contains(TcpFlags::SYN) {
        len += 1;
    }
    if header.flags.contains(TcpFlags::FIN) {
        len += 1;
    }

    len
}

fn seq_of(packet: &Packet) -> Seq {
    Seq(packet.as_tcp().expect("only tcp segments are buffered").seq)
}

#[derive(Debug)]
pub struct SendBuffer {
    capacity: usize,
    used: usize,
    pending: VecDeque<Packet>,
    retransmit: VecDeque<Packet>,
    control: VecDeque<Packet>,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            pending: VecDeque::new(),
            retransmit: VecDeque::new(),
            control: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn space(&self) -> usize {
        self.capacity.saturating_sub(self.used)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn has_unacked(&self) -> bool {
        !self.retransmit.is_empty()
    }

    /// Queue application data. The caller has already checked `space()`.
    pub fn push_pending(&mut self, packet: Packet) {
        self.used += packet.len();
        self.pending.push_back(packet);
    }

    pub fn peek_pending(&self) -> Option<&Packet> {
        self.pending.front()
    }

    /// Move the front pending segment onto the wire (into the retransmit
    /// queue) and return a clone to transmit.
    pub fn send_front_pending(&mut self) -> Option<Packet> {
        let packet = self.pending.pop_front()?;
        self.retransmit.push_back(packet.clone());

        Some(packet)
    }

    /// Track an already-built control-with-sequence segment (SYN/FIN) as
    /// unacked.
    pub fn track_retransmittable(&mut self, packet: Packet) {
        self.retransmit.push_back(packet);
    }

    /// The earliest unacked segment, for retransmission.
    pub fn earliest_unacked(&self) -> Option<&Packet> {
        self.retransmit.front()
    }

    /// Drop every segment fully covered by the cumulative ACK `una`.
    /// Returns the number of segments removed.
    pub fn ack_through(&mut self, una: Seq) -> usize {
        let mut removed = 0;

        while let Some(front) = self.retransmit.front() {
            let end = seq_of(front) + seq_len(front);

            if end.at_or_before(una) {
                self.used = self.used.saturating_sub(front.len());
                self.retransmit.pop_front();
                removed += 1;
            } else {
                break;
            }
        }

        removed
    }

    pub fn push_control(&mut self, packet: Packet) {
        self.control.push_back(packet);
    }

    pub fn pop_control(&mut self) -> Option<Packet> {
        self.control.pop_front()
    }

    pub fn has_control(&self) -> bool {
        !self.control.is_empty()
    }

    /// Every buffered segment must sit inside `[una, nxt)`.
    #[cfg(test)]
    pub fn assert_retransmit_window(&self, una: Seq, nxt: Seq) {
        for packet in &self.retransmit {
            let seq = seq_of(packet);
            assert!(seq.at_or_after(una), "segment {seq} below snd_una {una}");
            assert!(seq.before(nxt), "segment {seq} at or above snd_nxt {nxt}");
        }
    }
}

#[derive(Debug)]
pub struct ReceiveBuffer {
    capacity: usize,
    used: usize,
    delivered: VecDeque<Packet>,
    /// Byte offset into the head of `delivered` consumed by partial reads.
    read_offset: usize,
    /// Sorted by distance from `rcv_nxt`; windows are < 2^31 so the order
    /// is total within the buffer.
    out_of_order: Vec<Packet>,
}

impl ReceiveBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            delivered: VecDeque::new(),
            read_offset: 0,
            out_of_order: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub fn space(&self) -> usize {
        self.capacity.saturating_sub(self.used)
    }

    pub fn readable_bytes(&self) -> usize {
        self.delivered
            .iter()
            .map(Packet::len)
            .sum::<usize>()
            .saturating_sub(self.read_offset)
    }

    pub fn has_readable(&self) -> bool {
        self.readable_bytes() > 0
    }

    /// Accept the next in-order segment. Returns false (dropping the
    /// segment) when it does not fit; the peer will retransmit.
    pub fn push_delivered(&mut self, packet: Packet) -> bool {
        if packet.len() > self.space() {
            return false;
        }

        self.used += packet.len();
        if !packet.is_empty() {
            self.delivered.push_back(packet);
        }

        true
    }

    /// Stash a segment that arrived ahead of `rcv_nxt`.
    pub fn push_out_of_order(&mut self, rcv_nxt: Seq, packet: Packet) -> bool {
        if packet.len() > self.space() {
            return false;
        }

        let seq = seq_of(&packet);

        if self.out_of_order.iter().any(|p| seq_of(p) == seq) {
            return true; // duplicate
        }

        self.used += packet.len();
        let at = self
            .out_of_order
            .partition_point(|p| seq_of(p).distance(rcv_nxt) < seq.distance(rcv_nxt));
        self.out_of_order.insert(at, packet);

        true
    }

    /// Pull segments out of the reassembly set that have become in-order.
    /// Returns the new `rcv_nxt` after absorbing them.
    pub fn reassemble(&mut self, mut rcv_nxt: Seq) -> Seq {
        while let Some(front) = self.out_of_order.first() {
            let seq = seq_of(front);

            if seq.after(rcv_nxt) {
                break;
            }

            let packet = self.out_of_order.remove(0);
            let len = seq_len(&packet);

            if seq == rcv_nxt {
                rcv_nxt = rcv_nxt + len;
                if !packet.is_empty() {
                    self.delivered.push_back(packet);
                }
            } else {
                // Stale duplicate below rcv_nxt.
                self.used = self.used.saturating_sub(packet.len());
            }
        }

        rcv_nxt
    }

    /// Copy up to `buf.len()` readable bytes out, consuming them.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;

        while copied < buf.len() {
            let Some(head) = self.delivered.front() else {
                break;
            };

            let available = &head.payload()[self.read_offset..];
            let n = available.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&available[..n]);
            copied += n;
            self.read_offset += n;
            self.used = self.used.saturating_sub(n);

            if self.read_offset == head.len() {
                self.delivered.pop_front();
                self.read_offset = 0;
            }
        }

        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sim_packet::TcpSegment;

    fn segment(seq: u32, payload: &'static [u8]) -> Packet {
        Packet::tcp(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
            TcpSegment {
                seq,
                ack: 0,
                window: 0,
                flags: TcpFlags::ACK,
            },
            Bytes::from_static(payload),
            0.0,
        )
    }

    #[test]
    fn cumulative_ack_pops_covered_segments() {
        let mut buf = SendBuffer::new(1024);
        buf.push_pending(segment(0, b"aaaa"));
        buf.push_pending(segment(4, b"bbbb"));
        buf.send_front_pending().unwrap();
        buf.send_front_pending().unwrap();

        assert_eq!(buf.ack_through(Seq(4)), 1);
        assert_eq!(buf.used(), 4);
        assert_eq!(buf.ack_through(Seq(8)), 1);
        assert_eq!(buf.used(), 0);
    }

    #[test]
    fn partial_ack_keeps_segment() {
        let mut buf = SendBuffer::new(1024);
        buf.push_pending(segment(0, b"aaaa"));
        buf.send_front_pending().unwrap();

        assert_eq!(buf.ack_through(Seq(2)), 0);
        assert!(buf.has_unacked());
    }

    #[test]
    fn read_spans_packets_with_partial_head() {
        let mut buf = ReceiveBuffer::new(1024);
        assert!(buf.push_delivered(segment(0, b"hello ")));
        assert!(buf.push_delivered(segment(6, b"world")));

        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(&out, b"hell");

        let mut rest = [0u8; 16];
        let n = buf.read(&mut rest);
        assert_eq!(&rest[..n], b"o world");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut buf = ReceiveBuffer::new(8);
        assert!(buf.push_delivered(segment(0, b"aaaa")));

        assert!(!buf.push_delivered(segment(4, b"toolong")));
        assert_eq!(buf.readable_bytes(), 4);
    }

    #[test]
    fn reassembly_absorbs_contiguous_runs() {
        let mut buf = ReceiveBuffer::new(1024);
        let rcv_nxt = Seq(4);

        assert!(buf.push_out_of_order(rcv_nxt, segment(8, b"cccc")));
        assert!(buf.push_out_of_order(rcv_nxt, segment(4, b"bbbb")));

        let advanced = buf.reassemble(rcv_nxt);

        assert_eq!(advanced, Seq(12));
        assert_eq!(buf.readable_bytes(), 8);
    }

    #[test]
    fn reassembly_stops_at_gap() {
        let mut buf = ReceiveBuffer::new(1024);
        let rcv_nxt = Seq(0);

        assert!(buf.push_out_of_order(rcv_nxt, segment(8, b"cccc")));

        assert_eq!(buf.reassemble(rcv_nxt), Seq(0));
        assert_eq!(buf.readable_bytes(), 0);
    }
}
