//! The virtual TCP state machine.
//!
//! Sans-IO: the socket consumes segments via [`TcpSocket::push_packet`],
//! produces them via [`TcpSocket::pop_packet`] and learns about time via
//! [`TcpSocket::handle_timeout`] / [`TcpSocket::poll_timeout`]. It never
//! talks to an interface or a clock itself; the owning host drives it.
//!
//! Reliability follows the classic recipe: cumulative ACKs, fast retransmit
//! on the third duplicate ACK, Reno congestion control and an RFC 6298
//! retransmission timer. Listening sockets own their children until
//! `accept` transfers them out; a child only ever keeps its parent's
//! descriptor handle as a plain integer.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddrV4;

use bytes::Bytes;
use sim_packet::{Packet, TcpFlags, TcpSegment};
use sim_time::{SimDuration, SimTime};

use crate::buffer::{ReceiveBuffer, SendBuffer, seq_len};
use crate::congestion::Reno;
use crate::rtt::RttEstimator;
use crate::seq::Seq;
use crate::{PrioritySource, SocketState};

pub const DEFAULT_MSS: usize = 1460;

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub mss: usize,
    /// Initial congestion window, in segments.
    pub initial_window: u32,
    /// Initial slow-start threshold, in bytes.
    pub ssthresh: u32,
    pub send_buffer: usize,
    pub recv_buffer: usize,
    /// Upper bound for autotuned buffers.
    pub buffer_ceiling: usize,
    /// Maximum segment lifetime; TIME_WAIT lasts twice this.
    pub msl: SimDuration,
    pub max_syn_retries: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            initial_window: 10,
            ssthresh: 64 * 1024,
            send_buffer: 128 * 1024,
            recv_buffer: 128 * 1024,
            buffer_ceiling: 8 * 1024 * 1024,
            msl: SimDuration::from_secs(60),
            max_syn_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TcpError {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection timed out")]
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("send buffer is full")]
    WouldBlock,
    #[error(transparent)]
    Connection(TcpError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("no data available")]
    WouldBlock,
    #[error(transparent)]
    Connection(TcpError),
}

/// Sender/receiver internals, exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy)]
pub struct TcpInfo {
    pub state: State,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub rcv_nxt: u32,
    pub cwnd: u32,
    pub ssthresh: u32,
    pub srtt: Option<SimDuration>,
    pub rto: SimDuration,
}

#[derive(Debug)]
struct Listener {
    backlog: usize,
    /// SYN received, SYN-ACK sent, handshake not yet complete.
    incomplete: BTreeMap<SocketAddrV4, TcpSocket>,
    /// Handshake complete, waiting for `accept`.
    pending: VecDeque<TcpSocket>,
    next_child_iss: u32,
}

impl Listener {
    fn new(backlog: usize) -> Self {
        Self {
            backlog: backlog.max(1),
            incomplete: BTreeMap::new(),
            pending: VecDeque::new(),
            next_child_iss: 64_000,
        }
    }

    fn occupancy(&self) -> usize {
        self.incomplete.len() + self.pending.len()
    }
}

#[derive(Debug)]
pub struct TcpSocket {
    config: TcpConfig,
    state: State,
    local: Option<SocketAddrV4>,
    peer: Option<SocketAddrV4>,

    send_buf: SendBuffer,
    recv_buf: ReceiveBuffer,

    iss: Seq,
    snd_una: Seq,
    snd_nxt: Seq,
    /// Sequence number for the next byte accepted from the application.
    snd_queued: Seq,
    peer_window: u32,
    dup_acks: u32,
    retransmit_due: bool,

    rcv_nxt: Seq,
    fin_seen: bool,

    congestion: Reno,
    rtt: RttEstimator,
    /// One in-flight RTT measurement: (sequence end awaited, send time).
    /// Cleared on retransmission so only first transmissions are sampled.
    rtt_probe: Option<(Seq, SimTime)>,
    rto_started: Option<SimTime>,
    syn_retries: u32,
    time_wait_until: Option<SimTime>,

    /// Application has closed; the FIN goes out once pending data drains.
    fin_queued: bool,
    fin_sent_seq: Option<Seq>,

    error: Option<TcpError>,
    ack_pending: bool,
    /// Echo a congestion mark on the next ACK.
    con_pending: bool,

    listener: Option<Box<Listener>>,
    /// The parent listener's descriptor handle, as a plain integer.
    pub parent_handle: Option<i32>,
}

impl TcpSocket {
    pub fn new(config: TcpConfig) -> Self {
        let congestion = Reno::new(config.mss as u32, config.initial_window, config.ssthresh);
        let send_buf = SendBuffer::new(config.send_buffer);
        let recv_buf = ReceiveBuffer::new(config.recv_buffer);

        Self {
            config,
            state: State::Closed,
            local: None,
            peer: None,
            send_buf,
            recv_buf,
            iss: Seq(0),
            snd_una: Seq(0),
            snd_nxt: Seq(0),
            snd_queued: Seq(0),
            peer_window: u32::from(u16::MAX),
            dup_acks: 0,
            retransmit_due: false,
            rcv_nxt: Seq(0),
            fin_seen: false,
            congestion,
            rtt: RttEstimator::default(),
            rtt_probe: None,
            rto_started: None,
            syn_retries: 0,
            time_wait_until: None,
            fin_queued: false,
            fin_sent_seq: None,
            error: None,
            ack_pending: false,
            con_pending: false,
            listener: None,
            parent_handle: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
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

    pub fn take_error(&mut self) -> Option<TcpError> {
        self.error.take()
    }

    pub fn info(&self) -> TcpInfo {
        TcpInfo {
            state: self.state,
            snd_una: self.snd_una.0,
            snd_nxt: self.snd_nxt.0,
            rcv_nxt: self.rcv_nxt.0,
            cwnd: self.congestion.window(),
            ssthresh: self.congestion.ssthresh(),
            srtt: self.rtt.srtt(),
            rto: self.rtt.rto(),
        }
    }

    /// Resize buffers, e.g. from delay-bandwidth-product autotuning.
    pub fn set_buffer_sizes(&mut self, send: Option<usize>, recv: Option<usize>) {
        if let Some(send) = send {
            self.send_buf
                .set_capacity(send.min(self.config.buffer_ceiling));
        }
        if let Some(recv) = recv {
            self.recv_buf
                .set_capacity(recv.min(self.config.buffer_ceiling));
        }
    }

    pub fn send_buffer_capacity(&self) -> usize {
        self.send_buf.capacity()
    }

    pub fn recv_buffer_capacity(&self) -> usize {
        self.recv_buf.capacity()
    }

    // --- Active open -----------------------------------------------------

    /// Start the three-way handshake. `local` must already be bound by the
    /// caller; `iss` is the caller-chosen initial sequence number.
    pub fn connect(&mut self, local: SocketAddrV4, peer: SocketAddrV4, iss: u32, now: SimTime) {
        debug_assert_eq!(self.state, State::Closed);

        self.local = Some(local);
        self.peer = Some(peer);
        self.iss = Seq(iss);
        self.snd_una = Seq(iss);
        self.snd_nxt = Seq(iss) + 1;
        self.snd_queued = Seq(iss) + 1;
        self.state = State::SynSent;

        let syn = self.build_segment(TcpFlags::SYN, Seq(iss), Bytes::new());
        self.send_buf.track_retransmittable(syn);
        self.retransmit_due = true;
        self.rto_started = Some(now);

        tracing::debug!(%local, %peer, iss, "Opening connection");
    }

    // --- Passive open ----------------------------------------------------

    /// Move a bound socket into LISTEN.
    pub fn listen(&mut self, backlog: usize) {
        debug_assert_eq!(self.state, State::Closed);
        debug_assert!(self.local.is_some(), "listen requires a bound socket");

        self.state = State::Listen;
        self.listener = Some(Box::new(Listener::new(backlog)));
    }

    /// Dequeue a fully established child connection.
    pub fn accept(&mut self) -> Option<TcpSocket> {
        self.listener.as_mut()?.pending.pop_front()
    }

    pub fn pending_connections(&self) -> usize {
        self.listener.as_ref().map_or(0, |l| l.pending.len())
    }

    // --- Application data ------------------------------------------------

    pub fn send(&mut self, data: &[u8]) -> Result<usize, SendError> {
        if let Some(error) = self.error {
            return Err(SendError::Connection(error));
        }

        match self.state {
            State::Established | State::CloseWait => {}
            State::SynSent | State::SynReceived => return Err(SendError::WouldBlock),
            _ => return Err(SendError::NotConnected),
        }

        let space = self.send_buf.space();
        if space == 0 {
            return Err(SendError::WouldBlock);
        }

        let accepted = space.min(data.len());
        let mut offset = 0;

        while offset < accepted {
            let chunk = (accepted - offset).min(self.config.mss);
            let payload = Bytes::copy_from_slice(&data[offset..offset + chunk]);
            let segment =
                self.build_segment(TcpFlags::ACK, self.snd_queued, payload);

            self.snd_queued += chunk as u32;
            self.send_buf.push_pending(segment);
            offset += chunk;
        }

        Ok(accepted)
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RecvError> {
        if self.recv_buf.has_readable() {
            let n = self.recv_buf.read(buf);
            // Freed space widens the advertised window.
            self.ack_pending = true;

            return Ok(n);
        }

        if self.fin_seen {
            return Ok(0);
        }

        if let Some(error) = self.error {
            return Err(RecvError::Connection(error));
        }

        match self.state {
            State::Closed | State::Listen => Err(RecvError::NotConnected),
            _ => Err(RecvError::WouldBlock),
        }
    }

    // --- Close -----------------------------------------------------------

    /// Orderly close. The FIN is emitted once buffered data has drained.
    pub fn close(&mut self) {
        match self.state {
            State::Listen => {
                // Closing the parent closes every un-accepted child.
                if let Some(listener) = self.listener.take() {
                    for (_, mut child) in listener.incomplete {
                        child.abort();
                    }
                    for mut child in listener.pending {
                        child.abort();
                    }
                }
                self.state = State::Closed;
            }
            State::Closed | State::SynSent => {
                self.state = State::Closed;
            }
            State::SynReceived | State::Established => {
                self.state = State::FinWait1;
                self.fin_queued = true;
            }
            State::CloseWait => {
                self.state = State::LastAck;
                self.fin_queued = true;
            }
            // Already closing.
            State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::TimeWait
            | State::LastAck => {}
        }
    }

    /// Hard close: RST to the peer, local state dropped.
    pub fn abort(&mut self) {
        if matches!(self.state, State::Closed | State::Listen | State::SynSent) {
            self.state = State::Closed;
            return;
        }

        let rst = self.build_segment(TcpFlags::RST | TcpFlags::ACK, self.snd_nxt, Bytes::new());
        self.send_buf.push_control(rst);
        self.state = State::Closed;
    }

    // --- Wire input ------------------------------------------------------

    /// Feed one segment addressed to this socket.
    pub fn push_packet(&mut self, packet: &Packet, now: SimTime) {
        let Some(header) = packet.as_tcp() else {
            return;
        };
        let flags = header.flags;

        if self.state == State::Listen {
            self.listener_input(packet, now);
            return;
        }

        if flags.contains(TcpFlags::RST) {
            self.on_rst();
            return;
        }

        if flags.contains(TcpFlags::ACK) {
            self.peer_window = header.window;
        }

        match self.state {
            State::Closed => {
                // Late arrival on a dead socket; tell the peer.
                self.abort_reply(packet);
            }
            State::SynSent => self.syn_sent_input(packet, now),
            State::SynReceived => self.syn_received_input(packet, now),
            _ => self.established_input(packet, now),
        }
    }

    fn on_rst(&mut self) {
        let error = match self.state {
            State::SynSent | State::SynReceived => TcpError::ConnectionRefused,
            _ => TcpError::ConnectionReset,
        };

        tracing::debug!(state = %self.state, "Connection reset");

        self.error = Some(error);
        self.state = State::Closed;
        self.rto_started = None;
        self.time_wait_until = None;
    }

    fn syn_sent_input(&mut self, packet: &Packet, now: SimTime) {
        let header = packet.as_tcp().expect("checked by caller");
        let flags = header.flags;

        if flags.contains(TcpFlags::SYN | TcpFlags::ACK) {
            if Seq(header.ack) != self.iss + 1 {
                self.abort_reply(packet);
                return;
            }

            self.snd_una = Seq(header.ack);
            self.rcv_nxt = Seq(header.seq) + 1;
            self.send_buf.ack_through(self.snd_una);
            self.rto_started = None;
            self.retransmit_due = false;
            self.state = State::Established;
            self.ack_pending = true;

            tracing::debug!(peer = ?self.peer, "Connection established");
        } else if flags.contains(TcpFlags::SYN) {
            // Simultaneous open.
            self.rcv_nxt = Seq(header.seq) + 1;
            self.state = State::SynReceived;
            self.ack_pending = true;
            self.retransmit_due = true;
            self.rto_started = Some(now);
        }
    }

    fn syn_received_input(&mut self, packet: &Packet, now: SimTime) {
        let header = packet.as_tcp().expect("checked by caller");
        let flags = header.flags;

        if flags.contains(TcpFlags::SYN) {
            // Our SYN-ACK was lost; re-send it.
            self.retransmit_due = true;
            return;
        }

        if flags.contains(TcpFlags::ACK) && Seq(header.ack) == self.snd_nxt {
            self.snd_una = Seq(header.ack);
            self.send_buf.ack_through(self.snd_una);
            self.rto_started = None;
            self.retransmit_due = false;
            self.state = State::Established;

            tracing::debug!(peer = ?self.peer, "Connection established (passive)");

            // The handshake ACK may already carry data.
            if !packet.is_empty() || flags.contains(TcpFlags::FIN) {
                self.established_input(packet, now);
            }
        }
    }

    fn established_input(&mut self, packet: &Packet, now: SimTime) {
        let header = packet.as_tcp().expect("checked by caller");
        let flags = header.flags;

        if flags.contains(TcpFlags::ACK) {
            self.process_ack(packet, now);
        }

        if !packet.is_empty() || flags.contains(TcpFlags::FIN) {
            self.process_data(packet, now);
        }
    }

    fn process_ack(&mut self, packet: &Packet, now: SimTime) {
        let header = packet.as_tcp().expect("checked by caller");
        let ack = Seq(header.ack);

        if ack.after(self.snd_una) && ack.at_or_before(self.snd_nxt) {
            let acked = ack.distance(self.snd_una);

            self.snd_una = ack;
            self.send_buf.ack_through(ack);
            self.dup_acks = 0;
            self.congestion.on_ack(acked);

            if let Some((probe_end, sent_at)) = self.rtt_probe
                && probe_end.at_or_before(ack)
            {
                self.rtt.sample(now.duration_since(sent_at));
                self.rtt_probe = None;
            }

            if self.send_buf.has_unacked() {
                self.rto_started = Some(now);
            } else {
                self.rto_started = None;
            }

            self.on_fin_acked(now);
        } else if ack == self.snd_una
            && self.send_buf.has_unacked()
            && packet.is_empty()
            && !header.flags.intersects(TcpFlags::SYN | TcpFlags::FIN)
        {
            self.dup_acks += 1;

            if self.dup_acks == 3 {
                tracing::debug!(seq = %self.snd_una, "Fast retransmit");

                self.congestion.on_triple_dup_ack();
                self.retransmit_due = true;
                self.rtt_probe = None;
            } else if self.dup_acks > 3 {
                self.congestion.on_dup_ack_in_recovery();
            }
        }

        if header.flags.contains(TcpFlags::CON) {
            // The peer dropped data for lack of buffer space; treat it like
            // a loss signal without waiting for the timer.
            self.congestion.on_triple_dup_ack();
        }
    }

    fn on_fin_acked(&mut self, now: SimTime) {
        let Some(fin_seq) = self.fin_sent_seq else {
            return;
        };

        if !(fin_seq + 1).at_or_before(self.snd_una) {
            return;
        }

        match self.state {
            State::FinWait1 => self.state = State::FinWait2,
            State::Closing => self.enter_time_wait(now),
            State::LastAck => {
                self.state = State::Closed;
                self.rto_started = None;
            }
            _ => {}
        }
    }

    fn process_data(&mut self, packet: &Packet, now: SimTime) {
        let header = packet.as_tcp().expect("checked by caller");
        let seq = Seq(header.seq);
        let len = seq_len(packet);

        self.ack_pending = true;

        if seq == self.rcv_nxt {
            if self.recv_buf.push_delivered(packet.clone()) {
                self.rcv_nxt = self.rcv_nxt + len;
                self.rcv_nxt = self.recv_buf.reassemble(self.rcv_nxt);

                if header.flags.contains(TcpFlags::FIN) {
                    self.on_fin_received(now);
                }
            } else {
                tracing::trace!(%seq, len, "Receive buffer full, dropping segment");

                self.con_pending = true;
            }
        } else if seq.after(self.rcv_nxt) {
            if !self.recv_buf.push_out_of_order(self.rcv_nxt, packet.clone()) {
                self.con_pending = true;
            }
        }
        // seq before rcv_nxt: stale duplicate; the pending ACK re-announces
        // our position.
    }

    fn on_fin_received(&mut self, now: SimTime) {
        self.fin_seen = true;

        match self.state {
            State::Established => self.state = State::CloseWait,
            State::FinWait1 => self.state = State::Closing,
            State::FinWait2 => self.enter_time_wait(now),
            _ => {}
        }
    }

    fn enter_time_wait(&mut self, now: SimTime) {
        self.state = State::TimeWait;
        self.time_wait_until = Some(now + self.config.msl * 2);
        self.rto_started = None;
    }

    fn abort_reply(&mut self, packet: &Packet) {
        let Some(header) = packet.as_tcp() else {
            return;
        };

        // Reply with swapped addresses; the socket itself may never have
        // been bound (late segment to a dead connection).
        let rst = Packet::tcp(
            packet.destination(),
            packet.source(),
            TcpSegment {
                seq: header.ack,
                ack: header.seq.wrapping_add(1),
                window: 0,
                flags: TcpFlags::RST | TcpFlags::ACK,
            },
            Bytes::new(),
            0.0,
        );
        self.send_buf.push_control(rst);
    }

    // --- Listener input --------------------------------------------------

    fn listener_input(&mut self, packet: &Packet, now: SimTime) {
        let header = packet.as_tcp().expect("checked by caller");
        let peer = packet.source();
        let listener = self.listener.as_mut().expect("state is Listen");

        if let Some(child) = listener.incomplete.get_mut(&peer) {
            child.push_packet(packet, now);

            if child.state == State::Established {
                let child = listener
                    .incomplete
                    .remove(&peer)
                    .expect("child was just borrowed");
                listener.pending.push_back(child);
            } else if child.state == State::Closed {
                listener.incomplete.remove(&peer);
            }

            return;
        }

        // A completed-but-not-yet-accepted child may already receive data.
        if let Some(child) = listener
            .pending
            .iter_mut()
            .find(|c| c.peer == Some(peer))
        {
            child.push_packet(packet, now);
            return;
        }

        if header.flags.contains(TcpFlags::SYN) && !header.flags.contains(TcpFlags::ACK) {
            if listener.occupancy() >= listener.backlog {
                tracing::debug!(%peer, "Backlog full, ignoring SYN");
                return;
            }

            let iss = listener.next_child_iss;
            listener.next_child_iss = listener.next_child_iss.wrapping_add(64_000);

            let mut child = TcpSocket::new(self.config.clone());
            child.local = Some(packet.destination());
            child.peer = Some(peer);
            child.peer_window = header.window;
            child.iss = Seq(iss);
            child.snd_una = Seq(iss);
            child.snd_nxt = Seq(iss) + 1;
            child.snd_queued = Seq(iss) + 1;
            child.rcv_nxt = Seq(header.seq) + 1;
            child.state = State::SynReceived;

            let syn_ack =
                child.build_segment(TcpFlags::SYN | TcpFlags::ACK, Seq(iss), Bytes::new());
            child.send_buf.track_retransmittable(syn_ack);
            child.retransmit_due = true;
            child.rto_started = Some(now);

            tracing::debug!(%peer, "Accepted SYN, child in handshake");

            listener.incomplete.insert(peer, child);
        }
    }

    // --- Wire output -----------------------------------------------------

    /// Produce the next segment to transmit, if any. `prio` stamps fresh
    /// segments with the host's monotonic QDisc priority.
    pub fn pop_packet(&mut self, now: SimTime, prio: &mut PrioritySource) -> Option<Packet> {
        if let Some(listener) = self.listener.as_mut() {
            for child in listener.incomplete.values_mut() {
                if let Some(packet) = child.pop_packet(now, prio) {
                    return Some(packet);
                }
            }
            for child in listener.pending.iter_mut() {
                if let Some(packet) = child.pop_packet(now, prio) {
                    return Some(packet);
                }
            }

            return self.send_buf.pop_control();
        }

        if let Some(rst) = self.send_buf.pop_control() {
            return Some(rst);
        }

        if self.retransmit_due {
            self.retransmit_due = false;

            if let Some(segment) = self.send_buf.earliest_unacked().cloned() {
                self.rto_started = Some(now);
                self.rtt_probe = None;

                return Some(self.restamp(segment, prio));
            }
        }

        // New data, if the flow- and congestion-windows allow.
        if self.can_transmit()
            && let Some(next_len) = self.send_buf.peek_pending().map(|p| p.len() as u32)
        {
            let inflight = self.snd_nxt.distance(self.snd_una);
            let allowed = self.congestion.window().min(self.effective_peer_window());

            if inflight == 0 || inflight + next_len <= allowed {
                let segment = self
                    .send_buf
                    .send_front_pending()
                    .expect("pending was non-empty");
                let end = Seq(segment.as_tcp().expect("tcp segment").seq) + seq_len(&segment);

                self.snd_nxt = end;
                if self.rto_started.is_none() {
                    self.rto_started = Some(now);
                }
                if self.rtt_probe.is_none() {
                    self.rtt_probe = Some((end, now));
                }
                // Data carries the cumulative ACK; nothing separate needed.
                self.ack_pending = false;

                return Some(self.restamp(segment, prio));
            }
        }

        // FIN once everything queued before it has gone out.
        if self.fin_queued && !self.send_buf.has_pending() && self.fin_sent_seq.is_none() {
            let fin_seq = self.snd_queued;
            let fin = self.build_segment(TcpFlags::FIN | TcpFlags::ACK, fin_seq, Bytes::new());

            self.send_buf.track_retransmittable(fin.clone());
            self.fin_sent_seq = Some(fin_seq);
            self.snd_nxt = fin_seq + 1;
            self.snd_queued = fin_seq + 1;
            if self.rto_started.is_none() {
                self.rto_started = Some(now);
            }
            self.ack_pending = false;

            return Some(self.restamp(fin, prio));
        }

        if self.ack_pending {
            self.ack_pending = false;

            let mut flags = TcpFlags::ACK;
            if self.con_pending {
                self.con_pending = false;
                flags |= TcpFlags::CON;
            }

            return Some(self.restamp(self.build_segment(flags, self.snd_nxt, Bytes::new()), prio));
        }

        None
    }

    fn can_transmit(&self) -> bool {
        matches!(
            self.state,
            State::Established | State::CloseWait | State::FinWait1 | State::Closing
        )
    }

    fn effective_peer_window(&self) -> u32 {
        // A zero peer window would deadlock without window probes; always
        // allow one segment when nothing is in flight (see `pop_packet`).
        self.peer_window
    }

    /// Current advertised receive window.
    fn advertised_window(&self) -> u32 {
        self.recv_buf.space() as u32
    }

    fn build_segment(&self, flags: TcpFlags, seq: Seq, payload: Bytes) -> Packet {
        let local = self.local.expect("segments require a bound socket");
        let peer = self.peer.expect("segments require a connected socket");

        Packet::tcp(
            local,
            peer,
            TcpSegment {
                seq: seq.0,
                ack: self.rcv_nxt.0,
                window: self.advertised_window(),
                flags,
            },
            payload,
            0.0,
        )
    }

    /// Re-create a segment with a fresh QDisc priority; headers are
    /// otherwise unchanged.
    fn restamp(&self, packet: Packet, prio: &mut PrioritySource) -> Packet {
        let header = *packet.as_tcp().expect("tcp segment");

        Packet::tcp(
            packet.source(),
            packet.destination(),
            TcpSegment {
                seq: header.seq,
                ack: header.ack,
                window: header.window,
                flags: header.flags,
            },
            packet.payload().clone(),
            prio.next(),
        )
    }

    // --- Time ------------------------------------------------------------

    /// The next instant at which [`TcpSocket::handle_timeout`] must run.
    pub fn poll_timeout(&self) -> Option<SimTime> {
        if let Some(listener) = self.listener.as_ref() {
            return listener
                .incomplete
                .values()
                .chain(listener.pending.iter())
                .filter_map(TcpSocket::poll_timeout)
                .min();
        }

        let rto = self
            .rto_started
            .map(|started| started + self.rtt.rto());

        match (rto, self.time_wait_until) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }

    pub fn handle_timeout(&mut self, now: SimTime) {
        if let Some(listener) = self.listener.as_mut() {
            let mut closed = Vec::new();

            for (peer, child) in listener.incomplete.iter_mut() {
                child.handle_timeout(now);
                if child.state == State::Closed {
                    closed.push(*peer);
                }
            }
            for peer in closed {
                listener.incomplete.remove(&peer);
            }
            for child in listener.pending.iter_mut() {
                child.handle_timeout(now);
            }

            return;
        }

        if let Some(expiry) = self.time_wait_until
            && now >= expiry
        {
            self.time_wait_until = None;
            self.state = State::Closed;

            tracing::debug!("TIME_WAIT expired");
        }

        let Some(started) = self.rto_started else {
            return;
        };

        if now < started + self.rtt.rto() {
            return;
        }

        if matches!(self.state, State::SynSent | State::SynReceived) {
            self.syn_retries += 1;

            if self.syn_retries > self.config.max_syn_retries {
                tracing::debug!(peer = ?self.peer, "Handshake timed out");

                self.error = Some(TcpError::TimedOut);
                self.state = State::Closed;
                self.rto_started = None;
                return;
            }
        } else {
            self.congestion.on_rto();
        }

        tracing::debug!(seq = %self.snd_una, rto = %self.rtt.rto(), "Retransmission timeout");

        self.rtt.backoff();
        self.rtt_probe = None;
        self.retransmit_due = true;
        self.rto_started = Some(now);
        self.dup_acks = 0;
    }

    // --- Readiness -------------------------------------------------------

    pub fn poll(&self) -> SocketState {
        if self.listener.is_some() {
            return SocketState {
                readable: self.pending_connections() > 0,
                writable: false,
                hangup: false,
                error: false,
            };
        }

        let readable = self.recv_buf.has_readable() || self.fin_seen;
        let writable = matches!(self.state, State::Established | State::CloseWait)
            && self.send_buf.space() > 0;

        SocketState {
            readable: readable || self.error.is_some(),
            writable,
            hangup: self.state == State::Closed && self.error.is_none(),
            error: self.error.is_some(),
        }
    }

    pub fn has_buffered_input(&self) -> bool {
        self.recv_buf.has_readable()
    }

    /// Every unacked segment must sit inside `[snd_una, snd_nxt)`.
    #[cfg(test)]
    pub(crate) fn assert_retransmit_window(&self) {
        self.send_buf
            .assert_retransmit_window(self.snd_una, self.snd_nxt);
    }
}
