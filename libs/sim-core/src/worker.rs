//! Workers: one per OS thread, each draining events for one host at a
//! time.
//!
//! A worker holds the destination host's lock for the whole of an event:
//! clock update, CPU absorption, dispatch, any application callbacks the
//! event triggers, and the outbound network flush. Cross-host effects
//! leave only through the event queue.

use std::cell::Cell;
use std::net::Ipv4Addr;

use rand::Rng as _;
use sim_packet::Packet;
use sim_time::{SimDuration, SimTime};

use crate::descriptor::{DescriptorKind, FileStatus};
use crate::event::{Event, EventPayload};
use crate::host::{Host, LOOPBACK};
use crate::process::ProcessId;
use crate::syscall::SyscallCtx;
use crate::{Fd, HostId, Sim};

pub struct Worker<'a> {
    pub sim: &'a Sim,
    pub index: usize,
    now: Cell<SimTime>,
}

impl<'a> Worker<'a> {
    pub fn new(sim: &'a Sim, index: usize) -> Self {
        Self {
            sim,
            index,
            now: Cell::new(SimTime::ZERO),
        }
    }

    pub fn now(&self) -> SimTime {
        self.now.get()
    }

    pub fn set_now(&self, now: SimTime) {
        self.now.set(now);
        logging::set_sim_time(now);
    }

    /// Schedule an event for the host currently being processed. Same-host
    /// events may be arbitrarily close; they are drained within the
    /// current round, preserving per-host order.
    pub fn schedule_local(&self, host: &mut Host, delay: SimDuration, payload: EventPayload) {
        let seq = host.next_event_seq();

        self.sim
            .queue
            .schedule(self.now(), delay, host.id, host.id, seq, payload)
            .expect("same-host scheduling never violates the latency floor");
    }

    /// Schedule an event for another host. Panics on a latency-floor
    /// violation: that bug breaks parallel safety and must not be papered
    /// over.
    pub fn schedule_to(
        &self,
        src: &mut Host,
        dst: HostId,
        delay: SimDuration,
        payload: EventPayload,
    ) {
        let seq = src.next_event_seq();

        #[allow(clippy::expect_used)]
        self.sim
            .queue
            .schedule(self.now(), delay, src.id, dst, seq, payload)
            .expect("cross-host event scheduled below the minimum latency");
    }

    // --- Event dispatch --------------------------------------------------

    /// Process one event on the (already locked) destination host.
    pub fn deliver(&self, host: &mut Host, event: Event) {
        self.set_now(event.time);
        host.cpu.absorb(event.time);

        tracing::trace!(host = %host.hostname, time = %event.time, payload = ?event.payload, "Delivering event");

        match event.payload {
            EventPayload::PacketArrival(packet) => self.on_packet(host, packet),
            EventPayload::DescriptorReady { fd } => {
                // Force a fresh notification even if the status bits never
                // went down (CPU-block retries).
                if let Some(descriptor) = host.descriptors.get_mut(fd) {
                    descriptor.last_notified = FileStatus::empty();
                }
            }
            EventPayload::Callback(task) => {
                let mut ctx = SyscallCtx {
                    worker: self,
                    host,
                    process: None,
                };
                task(&mut ctx);
            }
            EventPayload::ProcessStart(pid) => self.on_process_start(host, pid),
            EventPayload::ProcessStop(pid) => self.on_process_stop(host, pid),
            EventPayload::TransportTimer { fd } => self.on_transport_timer(host, fd),
            EventPayload::Heartbeat => self.on_heartbeat(host),
        }

        self.flush_host(host);
        self.notify_ready(host);
    }

    fn on_packet(&self, host: &mut Host, packet: Packet) {
        let now = self.now();
        let dst = packet.destination();
        let ingress = if dst.ip().is_loopback() {
            LOOPBACK
        } else {
            host.default_ip
        };

        host.tracker.packets_received += 1;
        host.tracker.bytes_received += packet.total_len() as u64;

        let Some(fd) = host
            .interface(ingress)
            .and_then(|i| i.lookup(packet.protocol(), dst.port(), packet.source()))
        else {
            tracing::trace!(%packet, "No socket bound, dropping");
            host.tracker.packets_dropped += 1;

            return;
        };

        let Some(descriptor) = host.descriptors.get_mut(fd) else {
            // Raced with a close; delivery filters it out.
            host.tracker.packets_dropped += 1;

            return;
        };

        let dropped = match &mut descriptor.kind {
            DescriptorKind::Tcp(socket) => {
                socket.push_packet(&packet, now);
                0
            }
            DescriptorKind::Udp(socket) => {
                socket.push_packet(&packet);
                // Receive-queue overflow sheds whole datagrams.
                socket.take_dropped()
            }
            _ => {
                tracing::error!(%fd, "Packet routed to a non-socket descriptor");
                host.tracker.packets_dropped += 1;

                return;
            }
        };

        host.tracker.packets_dropped += dropped;
        host.cpu.add_read(packet.len());
    }

    fn on_process_start(&self, host: &mut Host, pid: ProcessId) {
        self.with_app(host, pid, |app, ctx| {
            tracing::debug!("Starting process");
            app.start(ctx);
        });

        if let Some(process) = host.processes.get_mut(&pid) {
            process.started = true;
        }
    }

    fn on_process_stop(&self, host: &mut Host, pid: ProcessId) {
        self.with_app(host, pid, |app, ctx| {
            tracing::debug!("Stopping process");
            app.stop(ctx);
        });

        if let Some(process) = host.processes.get_mut(&pid) {
            process.stopped = true;
        }
    }

    fn on_transport_timer(&self, host: &mut Host, fd: Fd) {
        let now = self.now();

        let Some(descriptor) = host.descriptors.get_mut(fd) else {
            return; // Closed and reaped; stale timer.
        };

        if let Some(due) = descriptor.timer_at
            && due <= now
        {
            descriptor.timer_at = None;
        }

        if let Some(socket) = descriptor.as_tcp_mut() {
            socket.handle_timeout(now);
        }

        let mut ctx = SyscallCtx {
            worker: self,
            host,
            process: None,
        };
        ctx.reap_if_drained(fd);
    }

    fn on_heartbeat(&self, host: &mut Host) {
        let t = host.tracker;

        macro_rules! heartbeat_line {
            ($level:ident) => {
                tracing::$level!(
                    host = %host.hostname,
                    packets_sent = t.packets_sent,
                    bytes_sent = t.bytes_sent,
                    packets_received = t.packets_received,
                    bytes_received = t.bytes_received,
                    packets_dropped = t.packets_dropped,
                    syscalls = t.syscalls,
                    "heartbeat"
                )
            };
        }

        let level = self.sim.config.heartbeat_level;
        if level == tracing::Level::ERROR {
            heartbeat_line!(error);
        } else if level == tracing::Level::WARN {
            heartbeat_line!(warn);
        } else if level == tracing::Level::DEBUG {
            heartbeat_line!(debug);
        } else if level == tracing::Level::TRACE {
            heartbeat_line!(trace);
        } else {
            heartbeat_line!(info);
        }

        if let Some(interval) = self.sim.config.heartbeat_interval {
            self.schedule_local(host, interval, EventPayload::Heartbeat);
        }
    }

    fn with_app(
        &self,
        host: &mut Host,
        pid: ProcessId,
        f: impl FnOnce(&mut dyn crate::Application, &mut SyscallCtx<'_, '_>),
    ) {
        // The application is taken out for the duration of the callback so
        // it can re-enter the host through the syscall surface.
        let Some(mut app) = host.processes.get_mut(&pid).and_then(|p| p.app.take()) else {
            return;
        };

        let span = tracing::debug_span!("process", host = %host.hostname, %pid);
        {
            let _enter = span.enter();
            let mut ctx = SyscallCtx {
                worker: self,
                host,
                process: Some(pid),
            };

            f(app.as_mut(), &mut ctx);
        }

        if let Some(process) = host.processes.get_mut(&pid) {
            process.app = Some(app);
        }
    }

    // --- Readiness callbacks ---------------------------------------------

    /// Compare each descriptor's status to what its owner last saw and
    /// fire readable/writable callbacks for newly risen bits.
    pub fn notify_ready(&self, host: &mut Host) {
        let mut wakeups: Vec<(Fd, ProcessId, FileStatus)> = Vec::new();

        for (fd, descriptor) in host.descriptors.iter_mut() {
            descriptor.refresh_status();

            let interesting = FileStatus::READABLE | FileStatus::WRITABLE;
            let risen = (descriptor.status - descriptor.last_notified) & interesting;
            descriptor.last_notified = descriptor.status & interesting;

            if !risen.is_empty()
                && let Some(owner) = descriptor.owner
            {
                wakeups.push((fd, owner, risen));
            }
        }

        for (fd, owner, risen) in wakeups {
            let running = host
                .processes
                .get(&owner)
                .is_some_and(|p| p.started && !p.stopped);

            if !running {
                continue;
            }

            self.with_app(host, owner, |app, ctx| {
                if risen.contains(FileStatus::READABLE) {
                    app.readable(ctx, fd);
                }
                if risen.contains(FileStatus::WRITABLE) {
                    app.writable(ctx, fd);
                }
            });
        }
    }

    // --- Outbound network ------------------------------------------------

    /// Drain every socket's outbound packets through the interfaces:
    /// stage, order by QDisc, pace against link bandwidth, sample loss,
    /// and schedule the arrival events.
    pub fn flush_host(&self, host: &mut Host) {
        let now = self.now();

        // Stage: pull packets out of sockets onto their egress interface.
        let fds: Vec<Fd> = host.descriptors.fds().collect();
        for fd in fds {
            loop {
                let Some(descriptor) = host.descriptors.get_mut(fd) else {
                    break;
                };

                let packet = match &mut descriptor.kind {
                    DescriptorKind::Tcp(socket) => socket.pop_packet(now, &mut host.prio),
                    DescriptorKind::Udp(socket) => socket.pop_packet(),
                    _ => None,
                };

                let Some(packet) = packet else {
                    break;
                };

                let egress = host.egress_ip(packet.destination_ip());
                if let Some(interface) = host.interface_mut(egress) {
                    interface.stage(fd, packet);
                }
            }
        }

        // Transmit: pace each interface's ordered batch onto the wire.
        let qdisc = host.config.qdisc;
        let interface_ips: Vec<Ipv4Addr> = host.interfaces.keys().copied().collect();

        for ip in interface_ips {
            let Some(interface) = host.interface_mut(ip) else {
                continue;
            };

            if !interface.has_staged() {
                continue;
            }

            for packet in interface.drain_batch(qdisc) {
                self.transmit(host, ip, packet);
            }
        }

        self.arm_transport_timers(host);
    }

    fn transmit(&self, host: &mut Host, egress: Ipv4Addr, packet: Packet) {
        let now = self.now();
        let bytes = packet.total_len();

        let Some(interface) = host.interface_mut(egress) else {
            return;
        };

        let Some(tx_done) = interface.reserve_tx(now, bytes) else {
            tracing::trace!(%packet, "Interface buffer full, dropping");
            host.tracker.packets_dropped += 1;

            return;
        };

        let tx_delay = tx_done.duration_since(now);
        let dst_ip = packet.destination_ip();

        host.tracker.packets_sent += 1;
        host.tracker.bytes_sent += bytes as u64;

        // Local traffic loops straight back into our own queue.
        if dst_ip.is_loopback() || dst_ip == host.default_ip {
            self.schedule_local(host, tx_delay, EventPayload::PacketArrival(packet));

            return;
        }

        let Some(dst_host) = self.sim.host_id_by_ip(dst_ip) else {
            // Sockets check routability before sending; an unknown
            // destination here is an invariant breach, not user error.
            panic!("packet addressed to unknown host {dst_ip}");
        };

        let Some(path) = self.sim.topology.path(host.default_ip, dst_ip) else {
            panic!("packet addressed to unroutable host {dst_ip}");
        };

        if path.packet_loss > 0.0 && host.rng.r#gen::<f64>() < path.packet_loss {
            tracing::trace!(%packet, "Lost on the wire");
            host.tracker.packets_dropped += 1;

            return;
        }

        self.schedule_to(
            host,
            dst_host,
            tx_delay + path.latency,
            EventPayload::PacketArrival(packet),
        );
    }

    /// Make sure a transport-timer event exists for every socket with a
    /// pending deadline.
    fn arm_transport_timers(&self, host: &mut Host) {
        let now = self.now();
        let mut due: Vec<(Fd, SimTime)> = Vec::new();

        for (fd, descriptor) in host.descriptors.iter_mut() {
            let DescriptorKind::Tcp(socket) = &descriptor.kind else {
                continue;
            };

            let Some(deadline) = socket.poll_timeout() else {
                continue;
            };

            if descriptor.timer_at.is_none_or(|at| deadline < at) {
                descriptor.timer_at = Some(deadline);
                due.push((fd, deadline));
            }
        }

        for (fd, deadline) in due {
            let delay = deadline.saturating_sub(now);

            self.schedule_local(host, delay, EventPayload::TransportTimer { fd });
        }
    }
}
