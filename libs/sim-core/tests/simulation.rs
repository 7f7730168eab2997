//! Whole-simulation scenarios: hosts with application processes wired
//! through the event queue, run by the real scheduler.

#![allow(clippy::unwrap_used)]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use parking_lot::Mutex;
use resolver::{Bandwidth, Resolver};
use sim_core::{
    AddressFamily, Application, CONTROLLER_ID, EpollEvents, EpollInterest, EpollOp, Errno, Event,
    EventKey, EventPayload, Fd, HostCell, HostConfig, ProcessId, Scheduler, Sim, SimConfig,
    SockType, SyscallCtx, Worker,
};
use sim_time::{SimDuration, SimTime};
use topology::Topology;

const MS: SimDuration = SimDuration::MILLISECOND;

struct TestNet {
    sim: Sim,
    seq: u64,
}

impl TestNet {
    /// A fully connected network with the given one-way latency.
    fn new(latency: SimDuration, seed: u64) -> Self {
        let resolver = Arc::new(Resolver::new());
        let topology = Arc::new(Topology::fully_connected(latency));
        let config = SimConfig {
            seed,
            heartbeat_interval: None,
            ..SimConfig::default()
        };

        Self {
            sim: Sim::new(config, resolver, topology),
            seq: 0,
        }
    }

    fn add_host(&mut self, name: &str, ip: &str, kbps: u64) -> Arc<HostCell> {
        let ip: Ipv4Addr = ip.parse().unwrap();

        self.sim
            .resolver
            .register(
                name,
                Some(ip),
                false,
                Bandwidth {
                    kbps_down: kbps,
                    kbps_up: kbps,
                },
            )
            .unwrap();
        self.sim.topology.attach(ip, "net").unwrap();

        let mut config = HostConfig::new(name, ip, &self.sim.config);
        config.kbps_down = kbps;
        config.kbps_up = kbps;

        self.sim.add_host(config)
    }

    fn spawn(&mut self, cell: &Arc<HostCell>, name: &str, app: Box<dyn Application>) -> ProcessId {
        let pid = cell.lock().add_process(name, vec![], app);

        self.sim.queue.push(Event {
            time: SimTime::ZERO,
            dst: cell.id(),
            key: EventKey {
                src: CONTROLLER_ID,
                seq: self.seq,
            },
            payload: EventPayload::ProcessStart(pid),
        });
        self.seq += 1;

        pid
    }

    fn run(&self, workers: usize) {
        Scheduler::new(workers).run(&self.sim);
    }
}

fn sock(s: &str) -> SocketAddrV4 {
    s.parse().unwrap()
}

// --- TCP echo ("hello" ping) ---------------------------------------------

#[derive(Default)]
struct EchoServer {
    listener: Option<Fd>,
    accepted_peer: Arc<Mutex<Option<SocketAddrV4>>>,
}

impl Application for EchoServer {
    fn start(&mut self, ctx: &mut SyscallCtx<'_, '_>) {
        let fd = ctx
            .socket(AddressFamily::Inet, SockType::Stream, true)
            .unwrap();
        ctx.bind(fd, sock("0.0.0.0:80")).unwrap();
        ctx.listen(fd, 10).unwrap();

        self.listener = Some(fd);
    }

    fn readable(&mut self, ctx: &mut SyscallCtx<'_, '_>, fd: Fd) {
        if Some(fd) == self.listener {
            let (_child, peer) = ctx.accept(fd).unwrap();
            *self.accepted_peer.lock() = Some(peer);

            return;
        }

        let mut buf = [0u8; 256];
        loop {
            match ctx.recv(fd, &mut buf) {
                Ok(0) => {
                    // EOF; a later spurious wakeup on the closed handle is
                    // harmless.
                    ctx.close(fd).ok();
                    break;
                }
                Ok(n) => {
                    ctx.send(fd, &buf[..n]).unwrap();
                }
                Err(Errno::WouldBlock) => break,
                Err(e) => panic!("server recv failed: {e}"),
            }
        }
    }
}

struct PingClient {
    server: SocketAddrV4,
    payload: &'static [u8],
    fd: Option<Fd>,
    sent: bool,
    reply: Arc<Mutex<Vec<u8>>>,
}

impl Application for PingClient {
    fn start(&mut self, ctx: &mut SyscallCtx<'_, '_>) {
        let fd = ctx
            .socket(AddressFamily::Inet, SockType::Stream, true)
            .unwrap();
        ctx.connect(fd, self.server).unwrap();

        self.fd = Some(fd);
    }

    fn writable(&mut self, ctx: &mut SyscallCtx<'_, '_>, fd: Fd) {
        if !self.sent {
            assert_eq!(ctx.send(fd, self.payload), Ok(self.payload.len()));
            self.sent = true;
        }
    }

    fn readable(&mut self, ctx: &mut SyscallCtx<'_, '_>, fd: Fd) {
        if self.fd.is_none() {
            return;
        }

        let mut buf = [0u8; 256];
        while let Ok(n) = ctx.recv(fd, &mut buf) {
            if n == 0 {
                break;
            }
            self.reply.lock().extend_from_slice(&buf[..n]);
        }

        if self.reply.lock().len() == self.payload.len() {
            ctx.close(fd).unwrap();
            self.fd = None;
        }
    }
}

#[test]
fn tcp_ping_echoes_hello() {
    let mut net = TestNet::new(MS * 5, 7);
    let a = net.add_host("alice", "10.0.0.1", 10_240);
    let b = net.add_host("bob", "10.0.0.2", 10_240);

    let reply = Arc::new(Mutex::new(Vec::new()));
    let accepted_peer = Arc::new(Mutex::new(None));

    net.spawn(
        &b,
        "echo-server",
        Box::new(EchoServer {
            listener: None,
            accepted_peer: accepted_peer.clone(),
        }),
    );
    net.spawn(
        &a,
        "ping-client",
        Box::new(PingClient {
            server: sock("10.0.0.2:80"),
            payload: b"hello",
            fd: None,
            sent: false,
            reply: reply.clone(),
        }),
    );

    net.run(1);

    assert_eq!(reply.lock().as_slice(), b"hello");

    let peer = accepted_peer.lock().expect("server accepted a connection");
    assert_eq!(*peer.ip(), "10.0.0.1".parse::<Ipv4Addr>().unwrap());
    assert!(peer.port() >= sim_core::MIN_EPHEMERAL_PORT);
}

// --- UDP flood over a thin link -------------------------------------------

struct UdpFlood {
    dst: SocketAddrV4,
    count: u32,
}

impl Application for UdpFlood {
    fn start(&mut self, ctx: &mut SyscallCtx<'_, '_>) {
        let fd = ctx
            .socket(AddressFamily::Inet, SockType::Dgram, true)
            .unwrap();

        for i in 0..self.count {
            let mut datagram = [0xAB_u8; 64];
            datagram[..4].copy_from_slice(&i.to_be_bytes());

            ctx.sendto(fd, &datagram, Some(self.dst)).unwrap();
        }
    }
}

#[derive(Default)]
struct UdpSink {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Application for UdpSink {
    fn start(&mut self, ctx: &mut SyscallCtx<'_, '_>) {
        let fd = ctx
            .socket(AddressFamily::Inet, SockType::Dgram, true)
            .unwrap();
        ctx.bind(fd, sock("0.0.0.0:9000")).unwrap();
    }

    fn readable(&mut self, ctx: &mut SyscallCtx<'_, '_>, fd: Fd) {
        let mut buf = [0u8; 128];
        while let Ok((n, _from)) = ctx.recvfrom(fd, &mut buf) {
            self.received.lock().push(buf[..n].to_vec());
        }
    }
}

#[test]
fn udp_above_capacity_drops_but_never_corrupts() {
    let mut net = TestNet::new(MS * 5, 11);
    let a = net.add_host("sender", "10.0.0.1", 100);
    let b = net.add_host("sink", "10.0.0.2", 100);

    // A thin interface buffer so the 100 kbps link sheds load.
    {
        // 1000 datagrams of 92 wire bytes exceed this many times over.
        let mut host = a.lock();
        host.config.interface_buffer = 8 * 1024;
        let ip = host.default_ip;
        *host.interface_mut(ip).unwrap() = sim_core::NetworkInterface::new(ip, 100, 100, 8 * 1024);
    }

    let received = Arc::new(Mutex::new(Vec::new()));

    net.spawn(
        &b,
        "sink",
        Box::new(UdpSink {
            received: received.clone(),
        }),
    );
    net.spawn(
        &a,
        "flood",
        Box::new(UdpFlood {
            dst: sock("10.0.0.2:9000"),
            count: 1000,
        }),
    );

    net.run(1);

    let received = received.lock();

    assert!(!received.is_empty(), "at least one datagram must arrive");
    assert!(received.len() < 1000, "at least one datagram must drop");

    for datagram in received.iter() {
        assert_eq!(datagram.len(), 64);
        assert!(
            datagram[4..].iter().all(|b| *b == 0xAB),
            "payload corrupted"
        );
    }
}

/// Binds a datagram socket and then never reads from it.
struct MuteSink;

impl Application for MuteSink {
    fn start(&mut self, ctx: &mut SyscallCtx<'_, '_>) {
        let fd = ctx
            .socket(AddressFamily::Inet, SockType::Dgram, true)
            .unwrap();
        ctx.bind(fd, sock("0.0.0.0:9000")).unwrap();
    }
}

#[test]
fn socket_receive_overflow_reaches_the_tracker() {
    let mut net = TestNet::new(MS * 5, 13);
    let a = net.add_host("blaster", "10.0.0.1", 10_240);
    let b = net.add_host("mute", "10.0.0.2", 10_240);

    {
        // The sink's datagram sockets get a 256-byte receive queue; the
        // link itself is wide open, so any drop is the socket's.
        let mut host = b.lock();
        host.config.tcp.recv_buffer = 256;
    }

    net.spawn(&b, "mute-sink", Box::new(MuteSink));
    net.spawn(
        &a,
        "flood",
        Box::new(UdpFlood {
            dst: sock("10.0.0.2:9000"),
            count: 20,
        }),
    );

    net.run(1);

    let tracker = b.lock().tracker;

    // All twenty 64-byte datagrams arrive; four fill the queue exactly
    // and the rest shed at the socket, counted by the host.
    assert_eq!(tracker.packets_received, 20);
    assert_eq!(tracker.packets_dropped, 16);

    // The sender's interface never refused anything.
    assert_eq!(a.lock().tracker.packets_dropped, 0);
}

// --- Epoll level-triggered semantics --------------------------------------

struct EpollChecker;

impl Application for EpollChecker {
    fn start(&mut self, ctx: &mut SyscallCtx<'_, '_>) {
        let (a, b) = ctx.socketpair().unwrap();
        let epfd = ctx.epoll_create().unwrap();

        ctx.epoll_ctl(
            epfd,
            EpollOp::Add,
            a,
            EpollInterest {
                events: EpollEvents::IN,
                data: 42,
            },
        )
        .unwrap();

        // Nothing to read yet.
        assert_eq!(ctx.epoll_wait(epfd, 8, 0).unwrap(), vec![]);

        // One byte from the peer: exactly one EPOLLIN event.
        ctx.write(b, b"!").unwrap();
        let ready = ctx.epoll_wait(epfd, 8, 0).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].data, 42);
        assert!(ready[0].events.contains(EpollEvents::IN));

        // Level-triggered: still readable until drained.
        assert_eq!(ctx.epoll_wait(epfd, 8, 0).unwrap().len(), 1);

        let mut buf = [0u8; 4];
        assert_eq!(ctx.read(a, &mut buf), Ok(1));

        assert_eq!(ctx.epoll_wait(epfd, 8, 0).unwrap(), vec![]);

        // A nonzero timeout cannot block; it returns 0 immediately.
        assert_eq!(ctx.epoll_wait(epfd, 8, 500).unwrap(), vec![]);
    }
}

#[test]
fn epoll_is_level_triggered() {
    let mut net = TestNet::new(MS * 5, 3);
    let host = net.add_host("solo", "10.0.0.1", 10_240);

    net.spawn(&host, "epoll-checker", Box::new(EpollChecker));
    net.run(1);
}

// --- CPU backpressure ------------------------------------------------------

struct CpuHog {
    chunk: usize,
    log: Arc<Mutex<Vec<(SimTime, &'static str)>>>,
    write_fd: Option<Fd>,
}

impl Application for CpuHog {
    fn start(&mut self, ctx: &mut SyscallCtx<'_, '_>) {
        let (_read, write) = ctx.pipe().unwrap();
        self.write_fd = Some(write);

        let chunk = vec![0u8; self.chunk];

        assert_eq!(ctx.write(write, &chunk), Ok(self.chunk));
        self.log.lock().push((ctx.now(), "first-ok"));

        // The first write left more than the threshold of unabsorbed
        // delay; the next one must bounce.
        assert_eq!(ctx.write(write, &chunk), Err(Errno::WouldBlock));
        self.log.lock().push((ctx.now(), "second-blocked"));
    }

    fn writable(&mut self, ctx: &mut SyscallCtx<'_, '_>, fd: Fd) {
        if Some(fd) != self.write_fd {
            return;
        }

        let chunk = vec![0u8; self.chunk];
        if ctx.write(fd, &chunk).is_ok() {
            self.log.lock().push((ctx.now(), "retry-ok"));
        }
    }
}

#[test]
fn cpu_blocked_write_retries_after_absorption() {
    let mut net = TestNet::new(MS * 5, 5);
    let host = net.add_host("busy", "10.0.0.1", 10_240);

    {
        // 100 MHz: 60ns of write cost per byte, so 32 KiB ≈ 1.97ms of delay.
        let mut h = host.lock();
        h.cpu = sim_core::Cpu::new(100_000);
    }

    let log = Arc::new(Mutex::new(Vec::new()));

    net.spawn(
        &host,
        "cpu-hog",
        Box::new(CpuHog {
            chunk: 32 * 1024,
            log: log.clone(),
            write_fd: None,
        }),
    );
    net.run(1);

    let log = log.lock();
    let labels: Vec<&str> = log.iter().map(|(_, l)| *l).collect();

    assert_eq!(labels, vec!["first-ok", "second-blocked", "retry-ok"]);

    let (blocked_at, _) = log[1];
    let (retried_at, _) = log[2];
    let waited = retried_at.duration_since(blocked_at);

    // The retry fires once the ~1.97ms backlog has been absorbed.
    assert!(waited >= SimDuration::MILLISECOND, "retried too early: {waited}");
    assert!(waited < MS * 10, "retried too late: {waited}");
}

// --- Boundary behavior ------------------------------------------------------

#[test]
fn boundary_errors_match_posix_shape() {
    let mut net = TestNet::new(MS * 5, 1);
    let cell = net.add_host("edge", "10.0.0.1", 10_240);
    net.add_host("peer", "10.0.0.2", 10_240);

    let worker = Worker::new(&net.sim, 0);
    let mut host = cell.lock();
    let mut ctx = SyscallCtx {
        worker: &worker,
        host: &mut host,
        process: None,
    };

    // accept on an empty pending queue.
    let listener = ctx
        .socket(AddressFamily::Inet, SockType::Stream, true)
        .unwrap();
    ctx.bind(listener, sock("0.0.0.0:80")).unwrap();
    ctx.listen(listener, 4).unwrap();
    assert_eq!(ctx.accept(listener), Err(Errno::WouldBlock));

    // bind to ANY on a port some interface already holds.
    let other = ctx
        .socket(AddressFamily::Inet, SockType::Stream, true)
        .unwrap();
    assert_eq!(ctx.bind(other, sock("0.0.0.0:80")), Err(Errno::AddressInUse));

    // connect to an address outside the topology.
    let stray = ctx
        .socket(AddressFamily::Inet, SockType::Stream, true)
        .unwrap();
    assert_eq!(
        ctx.connect(stray, sock("203.0.113.7:80")),
        Err(Errno::ConnectionRefused)
    );

    // Blocking sockets are rejected outright.
    assert_eq!(
        ctx.socket(AddressFamily::Inet, SockType::Stream, false),
        Err(Errno::ProtocolNotSupported)
    );

    // A specific-interface bind only needs that one interface free.
    let on_loopback = ctx
        .socket(AddressFamily::Inet, SockType::Stream, true)
        .unwrap();
    ctx.bind(on_loopback, sock("127.0.0.1:8080")).unwrap();
    let on_public = ctx
        .socket(AddressFamily::Inet, SockType::Stream, true)
        .unwrap();
    ctx.bind(on_public, sock("10.0.0.1:8080")).unwrap();

    // recvfrom on an unbound datagram socket binds it implicitly.
    let udp = ctx
        .socket(AddressFamily::Inet, SockType::Dgram, true)
        .unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(ctx.recvfrom(udp, &mut buf), Err(Errno::WouldBlock));
    let local = ctx.getsockname(udp).unwrap();
    assert_eq!(*local.ip(), "10.0.0.1".parse::<Ipv4Addr>().unwrap());
    assert!(local.port() >= sim_core::MIN_EPHEMERAL_PORT);

    // Closed descriptors stop resolving.
    ctx.close(listener).unwrap();
    assert_eq!(ctx.accept(listener), Err(Errno::BadDescriptor));
}

#[test]
fn name_resolution_round_trips() {
    let mut net = TestNet::new(MS * 5, 2);
    let cell = net.add_host("server", "10.0.0.7", 10_240);

    let worker = Worker::new(&net.sim, 0);
    let mut host = cell.lock();
    let mut ctx = SyscallCtx {
        worker: &worker,
        host: &mut host,
        process: None,
    };

    let by_name = ctx.getaddrinfo("server").unwrap();
    assert_eq!(by_name, "10.0.0.7".parse::<Ipv4Addr>().unwrap());

    // Dotted-quad input resolves to itself.
    assert_eq!(ctx.getaddrinfo("10.0.0.7"), Ok(by_name));

    assert_eq!(ctx.getaddrinfo("nonesuch"), Err(Errno::ResolveNoName));
    assert_eq!(ctx.gethostname(), "server");
}

// --- Determinism -----------------------------------------------------------

struct RecordingSink {
    log: Arc<Mutex<Vec<String>>>,
}

impl Application for RecordingSink {
    fn start(&mut self, ctx: &mut SyscallCtx<'_, '_>) {
        let fd = ctx
            .socket(AddressFamily::Inet, SockType::Dgram, true)
            .unwrap();
        ctx.bind(fd, sock("0.0.0.0:9000")).unwrap();
    }

    fn readable(&mut self, ctx: &mut SyscallCtx<'_, '_>, fd: Fd) {
        let mut buf = [0u8; 128];
        while let Ok((n, from)) = ctx.recvfrom(fd, &mut buf) {
            let from = from.expect("datagram sockets report the sender");

            self.log
                .lock()
                .push(format!("{} {} {:?}", ctx.now(), from, &buf[..n.min(4)]));
        }
    }
}

fn run_contended_scenario(workers: usize, seed: u64) -> Vec<String> {
    let mut net = TestNet::new(MS * 5, seed);
    let a = net.add_host("alpha", "10.0.0.1", 1_024);
    let b = net.add_host("beta", "10.0.0.2", 1_024);
    let sink = net.add_host("sink", "10.0.0.3", 1_024);

    let log = Arc::new(Mutex::new(Vec::new()));

    net.spawn(&sink, "sink", Box::new(RecordingSink { log: log.clone() }));
    net.spawn(
        &a,
        "flood-a",
        Box::new(UdpFlood {
            dst: sock("10.0.0.3:9000"),
            count: 50,
        }),
    );
    net.spawn(
        &b,
        "flood-b",
        Box::new(UdpFlood {
            dst: sock("10.0.0.3:9000"),
            count: 50,
        }),
    );

    net.run(workers);

    let result = log.lock().clone();

    result
}

#[test]
fn packet_order_is_identical_across_worker_counts() {
    let single = run_contended_scenario(1, 99);
    let repeat = run_contended_scenario(1, 99);
    let parallel = run_contended_scenario(4, 99);

    assert!(!single.is_empty());
    assert_eq!(single, repeat, "same seed, same workers must reproduce");
    assert_eq!(single, parallel, "worker count must not affect results");
}

// --- Timers ----------------------------------------------------------------

struct TickCounter {
    ticks: Arc<Mutex<u64>>,
    fd: Option<Fd>,
}

impl Application for TickCounter {
    fn start(&mut self, ctx: &mut SyscallCtx<'_, '_>) {
        let fd = ctx.timerfd_create().unwrap();
        ctx.timerfd_settime(fd, MS * 10, Some(MS * 10)).unwrap();

        self.fd = Some(fd);
    }

    fn readable(&mut self, ctx: &mut SyscallCtx<'_, '_>, fd: Fd) {
        if Some(fd) != self.fd {
            return;
        }

        let mut buf = [0u8; 8];
        if ctx.read(fd, &mut buf) == Ok(8) {
            *self.ticks.lock() += u64::from_ne_bytes(buf);
        }
    }
}

#[test]
fn persistent_timer_rearms_until_stop() {
    let mut net = TestNet::new(MS * 5, 4);
    net.sim.config.stop_time = SimTime::ZERO + MS * 105;
    let host = net.add_host("ticker", "10.0.0.1", 10_240);

    let ticks = Arc::new(Mutex::new(0));

    net.spawn(
        &host,
        "tick-counter",
        Box::new(TickCounter {
            ticks: ticks.clone(),
            fd: None,
        }),
    );
    net.run(1);

    // Fires at 10, 20, ..., 100ms simulated.
    assert_eq!(*ticks.lock(), 10);
}
