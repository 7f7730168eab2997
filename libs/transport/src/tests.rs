//! End-to-end exercises of the TCP state machine: two sockets wired
//! back-to-back through a lossy two-way pipe with a controllable clock.

use std::net::SocketAddrV4;

use sim_time::{SimDuration, SimTime};

use crate::{PrioritySource, State, TcpConfig, TcpSocket};

const ONE_WAY: SimDuration = SimDuration::from_millis(5);

struct Net {
    now: SimTime,
    prio: PrioritySource,
}

impl Net {
    fn new() -> Self {
        Self {
            now: SimTime::ZERO,
            prio: PrioritySource::default(),
        }
    }

    /// Move every queued segment from `a` to `b`, advancing the clock by
    /// one propagation delay per direction. Returns the number of segments
    /// moved.
    fn flush(&mut self, a: &mut TcpSocket, b: &mut TcpSocket) -> usize {
        let mut moved = 0;

        loop {
            let Some(packet) = a.pop_packet(self.now, &mut self.prio) else {
                break;
            };

            self.now += ONE_WAY;
            b.push_packet(&packet, self.now);
            moved += 1;
        }

        moved
    }

    /// Exchange segments until both directions are idle.
    fn settle(&mut self, a: &mut TcpSocket, b: &mut TcpSocket) {
        for _ in 0..64 {
            let moved = self.flush(a, b) + self.flush(b, a);

            if moved == 0 {
                return;
            }
        }

        panic!("connection did not settle");
    }

    /// Run the socket's due timers.
    fn expire(&mut self, socket: &mut TcpSocket) {
        let deadline = socket.poll_timeout().expect("a timer must be armed");

        self.now = self.now.max(deadline);
        socket.handle_timeout(self.now);
    }
}

fn addr(s: &str) -> SocketAddrV4 {
    s.parse().unwrap()
}

fn client_server(config: TcpConfig) -> (TcpSocket, TcpSocket, Net) {
    let net = Net::new();

    let mut server = TcpSocket::new(config.clone());
    server.bind(addr("10.0.0.2:80"));
    server.listen(4);

    let mut client = TcpSocket::new(config);
    client.connect(addr("10.0.0.1:49000"), addr("10.0.0.2:80"), 1_000, SimTime::ZERO);

    (client, server, net)
}

fn established_pair(config: TcpConfig) -> (TcpSocket, TcpSocket, Net) {
    let (mut client, mut listener, mut net) = client_server(config);

    net.settle(&mut client, &mut listener);

    let server = listener.accept().expect("handshake completed");
    assert_eq!(client.state(), State::Established);
    assert_eq!(server.state(), State::Established);

    (client, server, net)
}

#[test]
fn three_way_handshake() {
    let (mut client, mut server, mut net) = client_server(TcpConfig::default());

    // SYN
    let syn = client.pop_packet(net.now, &mut net.prio).unwrap();
    assert!(syn.as_tcp().unwrap().flags.contains(sim_packet::TcpFlags::SYN));
    net.now += ONE_WAY;
    server.push_packet(&syn, net.now);

    // SYN-ACK
    let syn_ack = server.pop_packet(net.now, &mut net.prio).unwrap();
    let flags = syn_ack.as_tcp().unwrap().flags;
    assert!(flags.contains(sim_packet::TcpFlags::SYN | sim_packet::TcpFlags::ACK));
    net.now += ONE_WAY;
    client.push_packet(&syn_ack, net.now);
    assert_eq!(client.state(), State::Established);

    // ACK completes the server side.
    let ack = client.pop_packet(net.now, &mut net.prio).unwrap();
    net.now += ONE_WAY;
    server.push_packet(&ack, net.now);

    assert_eq!(server.pending_connections(), 1);
}

#[test]
fn accepted_child_reports_peer() {
    let (client, server, _) = established_pair(TcpConfig::default());

    assert_eq!(server.peer_addr(), Some(addr("10.0.0.1:49000")));
    assert_eq!(client.peer_addr(), Some(addr("10.0.0.2:80")));
    assert_eq!(server.local_addr(), Some(addr("10.0.0.2:80")));
}

#[test]
fn byte_stream_round_trips() {
    let (mut client, mut server, mut net) = established_pair(TcpConfig::default());

    let sent: Vec<u8> = (0..10_000u32).flat_map(u32::to_le_bytes).collect();
    let mut offset = 0;
    let mut received = Vec::new();

    while received.len() < sent.len() {
        if offset < sent.len() {
            if let Ok(n) = client.send(&sent[offset..]) {
                offset += n;
            }
        }

        net.settle(&mut client, &mut server);

        let mut buf = [0u8; 4096];
        while let Ok(n) = server.recv(&mut buf) {
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }

        client.assert_retransmit_window();
        server.assert_retransmit_window();
    }

    assert_eq!(received, sent);
}

#[test]
fn echo_comes_back_intact() {
    let (mut client, mut server, mut net) = established_pair(TcpConfig::default());

    client.send(b"hello").unwrap();
    net.settle(&mut client, &mut server);

    let mut buf = [0u8; 16];
    let n = server.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");

    server.send(&buf[..n]).unwrap();
    net.settle(&mut client, &mut server);

    let n = client.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");
}

#[test]
fn lost_segment_is_retransmitted_after_rto() {
    let (mut client, mut server, mut net) = established_pair(TcpConfig::default());

    client.send(b"important").unwrap();

    // The segment falls on the floor.
    let lost = client.pop_packet(net.now, &mut net.prio).unwrap();
    assert_eq!(lost.len(), 9);
    assert!(client.pop_packet(net.now, &mut net.prio).is_none());

    // Nothing arrives until the retransmission timer fires.
    net.expire(&mut client);
    net.settle(&mut client, &mut server);

    let mut buf = [0u8; 16];
    let n = server.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"important");
}

#[test]
fn rto_collapses_congestion_window() {
    let (mut client, mut server, mut net) = established_pair(TcpConfig::default());

    client.send(b"payload").unwrap();
    let _lost = client.pop_packet(net.now, &mut net.prio).unwrap();

    let cwnd_before = client.info().cwnd;
    net.expire(&mut client);

    let info = client.info();
    assert_eq!(info.cwnd, 1460);
    assert!(info.ssthresh >= 2 * 1460);
    assert!(cwnd_before > info.cwnd);

    net.settle(&mut client, &mut server);
}

#[test]
fn triple_dup_ack_triggers_fast_retransmit() {
    let config = TcpConfig {
        mss: 100,
        ..TcpConfig::default()
    };
    let (mut client, mut server, mut net) = established_pair(config);

    client.send(&[0xaa; 500]).unwrap();

    // Five 100-byte segments; the first is lost.
    let mut segments = Vec::new();
    while let Some(segment) = client.pop_packet(net.now, &mut net.prio) {
        segments.push(segment);
    }
    assert_eq!(segments.len(), 5);

    let lost_seq = segments[0].as_tcp().unwrap().seq;

    for segment in &segments[1..] {
        net.now += ONE_WAY;
        server.push_packet(segment, net.now);

        // Each out-of-order arrival produces an immediate duplicate ACK.
        let dup_ack = server.pop_packet(net.now, &mut net.prio).unwrap();
        assert_eq!(dup_ack.as_tcp().unwrap().ack, lost_seq);
        net.now += ONE_WAY;
        client.push_packet(&dup_ack, net.now);
    }

    // Third duplicate ACK re-sends the missing segment without an RTO.
    let retransmit = client.pop_packet(net.now, &mut net.prio).unwrap();
    assert_eq!(retransmit.as_tcp().unwrap().seq, lost_seq);

    net.settle(&mut client, &mut server);

    let mut buf = [0u8; 600];
    let mut total = 0;
    while let Ok(n) = server.recv(&mut buf[total..]) {
        if n == 0 {
            break;
        }
        total += n;
    }
    assert_eq!(total, 500);
}

#[test]
fn orderly_close_walks_the_fin_states() {
    let (mut client, mut server, mut net) = established_pair(TcpConfig::default());

    client.close();
    assert_eq!(client.state(), State::FinWait1);

    net.settle(&mut client, &mut server);
    assert_eq!(client.state(), State::FinWait2);
    assert_eq!(server.state(), State::CloseWait);

    // EOF on the server side.
    let mut buf = [0u8; 8];
    assert_eq!(server.recv(&mut buf).unwrap(), 0);

    server.close();
    assert_eq!(server.state(), State::LastAck);

    net.settle(&mut client, &mut server);
    assert_eq!(server.state(), State::Closed);
    assert_eq!(client.state(), State::TimeWait);

    // 2*MSL later the socket is gone.
    net.expire(&mut client);
    assert_eq!(client.state(), State::Closed);
}

#[test]
fn simultaneous_close_reaches_time_wait_via_closing() {
    let (mut client, mut server, mut net) = established_pair(TcpConfig::default());

    client.close();
    server.close();

    // Both FINs cross on the wire.
    let client_fin = client.pop_packet(net.now, &mut net.prio).unwrap();
    let server_fin = server.pop_packet(net.now, &mut net.prio).unwrap();
    net.now += ONE_WAY;
    client.push_packet(&server_fin, net.now);
    server.push_packet(&client_fin, net.now);

    assert_eq!(client.state(), State::Closing);
    assert_eq!(server.state(), State::Closing);

    net.settle(&mut client, &mut server);

    assert_eq!(client.state(), State::TimeWait);
    assert_eq!(server.state(), State::TimeWait);
}

#[test]
fn rst_surfaces_as_connection_reset() {
    let (mut client, mut server, mut net) = established_pair(TcpConfig::default());

    server.abort();
    net.settle(&mut server, &mut client);

    assert_eq!(client.state(), State::Closed);
    assert_eq!(
        client.take_error(),
        Some(crate::TcpError::ConnectionReset)
    );
}

#[test]
fn handshake_gives_up_after_max_retries() {
    let mut client = TcpSocket::new(TcpConfig::default());
    let mut net = Net::new();
    client.connect(addr("10.0.0.1:49000"), addr("10.0.0.9:80"), 7, SimTime::ZERO);

    // The peer never answers.
    loop {
        while client.pop_packet(net.now, &mut net.prio).is_some() {}

        if client.state() == State::Closed {
            break;
        }

        net.expire(&mut client);
    }

    assert_eq!(client.take_error(), Some(crate::TcpError::TimedOut));
}

#[test]
fn backlog_limits_embryonic_connections() {
    let mut net = Net::new();
    let mut server = TcpSocket::new(TcpConfig::default());
    server.bind(addr("10.0.0.2:80"));
    server.listen(2);

    let mut clients: Vec<_> = (0..4)
        .map(|i| {
            let mut c = TcpSocket::new(TcpConfig::default());
            c.connect(
                addr(&format!("10.0.0.1:{}", 40_000 + i)),
                addr("10.0.0.2:80"),
                100 * i,
                net.now,
            );
            c
        })
        .collect();

    for client in &mut clients {
        net.settle(client, &mut server);
    }

    let established = clients
        .iter()
        .filter(|c| c.state() == State::Established)
        .count();

    assert_eq!(established, 2);
    assert_eq!(server.pending_connections(), 2);
}

#[test]
fn flow_control_respects_peer_window() {
    let config = TcpConfig {
        mss: 100,
        recv_buffer: 300,
        ..TcpConfig::default()
    };
    let (mut client, mut server, mut net) = established_pair(config);

    // More data than the peer can buffer.
    client.send(&[0x55; 1_000]).unwrap();
    net.settle(&mut client, &mut server);

    let info = client.info();
    let unacked = info.snd_nxt.wrapping_sub(info.snd_una);
    assert!(unacked <= 300, "sender overran the advertised window");

    // Draining the receiver opens the window again. Segments dropped at the
    // full window come back via the retransmission timer.
    let mut buf = [0u8; 1_000];
    let mut received = 0;
    while received < 1_000 {
        match server.recv(&mut buf) {
            Ok(n) => received += n,
            Err(_) => {
                net.settle(&mut client, &mut server);

                if !server.poll().readable {
                    net.expire(&mut client);
                    net.settle(&mut client, &mut server);
                }
            }
        }
    }
}
