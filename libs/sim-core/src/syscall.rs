//! The virtual syscall surface.
//!
//! Application code never touches hosts directly; it goes through these
//! calls, which mutate the descriptor table synchronously and may schedule
//! events (packet departures, readiness retries) as side effects. Every
//! call takes an explicit [`SyscallCtx`] — the active worker plus the
//! locked host — so there is no ambient "current context" anywhere in the
//! core.
//!
//! All sockets are non-blocking. Anything that would block in a real
//! kernel returns [`Errno::WouldBlock`] and the caller is woken by a
//! readiness callback or epoll once the condition clears.

use std::net::{Ipv4Addr, SocketAddrV4};

use rand::Rng as _;
use sim_packet::Protocol;
use sim_time::{SimDuration, SimTime};
use transport::{RecvError, SendError, TcpError, TcpSocket, UdpError, UdpSocket};

use crate::descriptor::{
    Descriptor, DescriptorKind, Epoll, EpollEvents, EpollInterest, FileStatus, Pipe, ReadyEvent,
    Timer,
};
use crate::event::EventPayload;
use crate::host::{Host, LOOPBACK};
use crate::interface::pick_ephemeral_port;
use crate::process::ProcessId;
use crate::worker::Worker;
use crate::Fd;

/// The simulated errno surface handed back to applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Errno {
    #[error("bad descriptor")]
    BadDescriptor,
    #[error("not a socket")]
    NotASocket,
    #[error("socket is not connected")]
    NotConnected,
    #[error("socket is already connected")]
    AlreadyConnected,
    #[error("address already in use")]
    AddressInUse,
    #[error("address not available")]
    AddressNotAvailable,
    #[error("address family not supported")]
    FamilyNotSupported,
    #[error("protocol not supported")]
    ProtocolNotSupported,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    #[error("operation would block")]
    WouldBlock,
    #[error("operation timed out")]
    TimedOut,
    #[error("buffer full")]
    BufferFull,
    #[error("invalid argument")]
    Invalid,
    #[error("name resolution failed")]
    ResolveFail,
    #[error("unknown hostname")]
    ResolveNoName,
    #[error("resolver system failure")]
    ResolveSystem,
    #[error("internal invariant violated")]
    Internal,
}

impl From<TcpError> for Errno {
    fn from(e: TcpError) -> Self {
        match e {
            TcpError::ConnectionRefused => Errno::ConnectionRefused,
            TcpError::ConnectionReset => Errno::ConnectionReset,
            TcpError::TimedOut => Errno::TimedOut,
        }
    }
}

impl From<SendError> for Errno {
    fn from(e: SendError) -> Self {
        match e {
            SendError::NotConnected => Errno::NotConnected,
            SendError::WouldBlock => Errno::WouldBlock,
            SendError::Connection(c) => c.into(),
        }
    }
}

impl From<RecvError> for Errno {
    fn from(e: RecvError) -> Self {
        match e {
            RecvError::NotConnected => Errno::NotConnected,
            RecvError::WouldBlock => Errno::WouldBlock,
            RecvError::Connection(c) => c.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Unix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Dgram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpollOp {
    Add,
    Mod,
    Del,
}

/// The explicit context of one syscall: the worker driving the event and
/// the exclusively locked host it runs on.
pub struct SyscallCtx<'w, 'h> {
    pub worker: &'w Worker<'w>,
    pub host: &'h mut Host,
    /// The process issuing the call, for descriptor ownership.
    pub process: Option<ProcessId>,
}

impl SyscallCtx<'_, '_> {
    pub fn now(&self) -> SimTime {
        self.worker.now()
    }

    // --- Creation --------------------------------------------------------

    pub fn socket(
        &mut self,
        family: AddressFamily,
        sock_type: SockType,
        nonblocking: bool,
    ) -> Result<Fd, Errno> {
        self.count_syscall();

        // The simulator cannot suspend a plug-in mid-call; blocking
        // sockets are unsupported by construction.
        if !nonblocking {
            return Err(Errno::ProtocolNotSupported);
        }

        let kind = match (family, sock_type) {
            (AddressFamily::Inet, SockType::Stream) | (AddressFamily::Unix, SockType::Stream) => {
                DescriptorKind::Tcp(TcpSocket::new(self.host.config.tcp.clone()))
            }
            (AddressFamily::Inet, SockType::Dgram) => DescriptorKind::Udp(UdpSocket::new(
                self.host.config.tcp.send_buffer,
                self.host.config.tcp.recv_buffer,
            )),
            (AddressFamily::Unix, SockType::Dgram) => return Err(Errno::ProtocolNotSupported),
        };

        let fd = self
            .host
            .descriptors
            .insert(Descriptor::new(kind, self.process));

        tracing::trace!(%fd, ?family, ?sock_type, "Created socket");

        Ok(fd)
    }

    pub fn socketpair(&mut self) -> Result<(Fd, Fd), Errno> {
        self.count_syscall();

        let (a, b) = Pipe::socket_pair();
        let fd_a = self
            .host
            .descriptors
            .insert(Descriptor::new(DescriptorKind::Pipe(a), self.process));
        let fd_b = self
            .host
            .descriptors
            .insert(Descriptor::new(DescriptorKind::Pipe(b), self.process));

        self.fix_pipe_peer(fd_a, fd_b);
        self.fix_pipe_peer(fd_b, fd_a);

        Ok((fd_a, fd_b))
    }

    pub fn pipe(&mut self) -> Result<(Fd, Fd), Errno> {
        self.count_syscall();

        let (read, write) = Pipe::pair();
        let fd_read = self
            .host
            .descriptors
            .insert(Descriptor::new(DescriptorKind::Pipe(read), self.process));
        let fd_write = self
            .host
            .descriptors
            .insert(Descriptor::new(DescriptorKind::Pipe(write), self.process));

        self.fix_pipe_peer(fd_read, fd_write);
        self.fix_pipe_peer(fd_write, fd_read);

        Ok((fd_read, fd_write))
    }

    fn fix_pipe_peer(&mut self, fd: Fd, peer: Fd) {
        if let Some(DescriptorKind::Pipe(pipe)) =
            self.host.descriptors.get_mut(fd).map(|d| &mut d.kind)
        {
            pipe.peer = peer;
        }
    }

    pub fn epoll_create(&mut self) -> Result<Fd, Errno> {
        self.count_syscall();

        Ok(self
            .host
            .descriptors
            .insert(Descriptor::new(
                DescriptorKind::Epoll(Epoll::default()),
                self.process,
            )))
    }

    pub fn timerfd_create(&mut self) -> Result<Fd, Errno> {
        self.count_syscall();

        Ok(self
            .host
            .descriptors
            .insert(Descriptor::new(
                DescriptorKind::Timer(Timer::default()),
                self.process,
            )))
    }

    // --- Binding ---------------------------------------------------------

    pub fn bind(&mut self, fd: Fd, addr: SocketAddrV4) -> Result<(), Errno> {
        self.count_syscall();

        let protocol = self.socket_protocol(fd)?;

        if self.socket_local_addr(fd)?.is_some() {
            return Err(Errno::Invalid);
        }

        let ip = *addr.ip();
        if !ip.is_unspecified() && !ip.is_loopback() && ip != self.host.default_ip {
            return Err(Errno::AddressNotAvailable);
        }

        let port = if addr.port() == 0 {
            self.pick_port(protocol, ip)?
        } else {
            let free = if ip.is_unspecified() {
                self.host.port_free_everywhere(protocol, addr.port())
            } else {
                self.host
                    .interface(ip)
                    .is_some_and(|i| i.is_port_free(protocol, addr.port()))
            };

            if !free {
                return Err(Errno::AddressInUse);
            }

            addr.port()
        };

        self.associate(fd, protocol, ip, port);
        self.set_socket_local_addr(fd, SocketAddrV4::new(ip, port))?;

        tracing::trace!(%fd, %ip, port, "Bound socket");

        Ok(())
    }

    /// Bind a stream socket to an abstract unix path: the path maps to a
    /// synthetic port on loopback.
    pub fn bind_unix(&mut self, fd: Fd, path: &str) -> Result<(), Errno> {
        self.count_syscall();

        if self.host.unix_ports.contains_key(path) {
            return Err(Errno::AddressInUse);
        }

        let protocol = self.socket_protocol(fd)?;
        let port = self.pick_port(protocol, LOOPBACK)?;

        self.associate(fd, protocol, LOOPBACK, port);
        self.set_socket_local_addr(fd, SocketAddrV4::new(LOOPBACK, port))?;
        self.host.unix_ports.insert(path.to_owned(), port);

        if let Some(descriptor) = self.host.descriptors.get_mut(fd) {
            descriptor.unix_path = Some(path.to_owned());
        }

        Ok(())
    }

    fn pick_port(&mut self, protocol: Protocol, ip: Ipv4Addr) -> Result<u16, Errno> {
        let Host {
            rng, interfaces, ..
        } = &mut *self.host;

        let port = if ip.is_unspecified() {
            pick_ephemeral_port(rng, |p| interfaces.values().all(|i| i.is_port_free(protocol, p)))
        } else {
            let interface = interfaces.get(&ip).ok_or(Errno::AddressNotAvailable)?;
            pick_ephemeral_port(rng, |p| interface.is_port_free(protocol, p))
        };

        port.ok_or(Errno::AddressNotAvailable)
    }

    fn associate(&mut self, fd: Fd, protocol: Protocol, ip: Ipv4Addr, port: u16) {
        if ip.is_unspecified() {
            for interface in self.host.interfaces.values_mut() {
                interface.associate(protocol, port, fd);
            }
        } else if let Some(interface) = self.host.interface_mut(ip) {
            interface.associate(protocol, port, fd);
        }
    }

    /// Bind an unbound socket to an ephemeral port on the interface facing
    /// `dst`.
    fn implicit_bind(&mut self, fd: Fd, dst: Ipv4Addr) -> Result<SocketAddrV4, Errno> {
        let ip = self.host.egress_ip(dst);

        self.bind_ephemeral_on(fd, ip)
    }

    fn bind_ephemeral_on(&mut self, fd: Fd, ip: Ipv4Addr) -> Result<SocketAddrV4, Errno> {
        let protocol = self.socket_protocol(fd)?;
        let port = self.pick_port(protocol, ip)?;

        self.associate(fd, protocol, ip, port);

        let local = SocketAddrV4::new(ip, port);
        self.set_socket_local_addr(fd, local)?;

        Ok(local)
    }

    // --- Connection setup ------------------------------------------------

    pub fn connect(&mut self, fd: Fd, peer: SocketAddrV4) -> Result<(), Errno> {
        self.count_syscall();

        match self.descriptor_kind(fd)? {
            Protocol::Tcp => self.connect_tcp(fd, peer),
            Protocol::Udp => self.connect_udp(fd, peer),
        }
    }

    pub fn connect_unix(&mut self, fd: Fd, path: &str) -> Result<(), Errno> {
        self.count_syscall();

        let port = *self
            .host
            .unix_ports
            .get(path)
            .ok_or(Errno::ConnectionRefused)?;

        if let Some(descriptor) = self.host.descriptors.get_mut(fd) {
            descriptor.unix_path = Some(path.to_owned());
        }

        self.connect_tcp(fd, SocketAddrV4::new(LOOPBACK, port))
    }

    fn connect_tcp(&mut self, fd: Fd, peer: SocketAddrV4) -> Result<(), Errno> {
        let local = match self.socket_local_addr(fd)? {
            Some(local) => local,
            None => self.implicit_bind(fd, *peer.ip())?,
        };

        // Reachability is checked up front; an unroutable peer can never
        // answer the handshake.
        if !peer.ip().is_loopback() && *peer.ip() != self.host.default_ip {
            let routable = self
                .worker
                .sim
                .topology
                .is_routable(self.host.default_ip, *peer.ip());

            if !routable {
                return Err(Errno::ConnectionRefused);
            }
        }

        let iss: u32 = self.host.rng.r#gen();
        let now = self.now();
        let autotune = self.autotune_sizes(*peer.ip());

        let socket = self.tcp_mut(fd)?;

        if socket.peer_addr().is_some() || socket.is_listening() {
            return Err(Errno::AlreadyConnected);
        }

        if let Some((send, recv)) = autotune {
            socket.set_buffer_sizes(Some(send), Some(recv));
        }

        socket.connect(local, peer, iss, now);

        // The connection is registered for demux under its peer, so
        // concurrent outbound connections can share a port.
        let ip = *local.ip();
        if let Some(interface) = self.host.interface_mut(ip) {
            interface.associate_connection(Protocol::Tcp, local.port(), peer, fd);
        }

        self.worker.flush_host(self.host);

        Ok(())
    }

    fn connect_udp(&mut self, fd: Fd, peer: SocketAddrV4) -> Result<(), Errno> {
        if self.socket_local_addr(fd)?.is_none() {
            self.implicit_bind(fd, *peer.ip())?;
        }

        self.udp_mut(fd)?.connect(peer);

        Ok(())
    }

    pub fn listen(&mut self, fd: Fd, backlog: usize) -> Result<(), Errno> {
        self.count_syscall();

        let socket = self.tcp_mut(fd)?;

        if socket.local_addr().is_none() {
            return Err(Errno::Invalid);
        }
        if socket.peer_addr().is_some() {
            return Err(Errno::AlreadyConnected);
        }

        socket.listen(backlog);

        Ok(())
    }

    pub fn accept(&mut self, fd: Fd) -> Result<(Fd, SocketAddrV4), Errno> {
        self.count_syscall();

        let autotune_peer;
        let child = {
            let listener = self.tcp_mut(fd)?;

            if !listener.is_listening() {
                return Err(Errno::Invalid);
            }

            let Some(child) = listener.accept() else {
                return Err(Errno::WouldBlock);
            };

            autotune_peer = child.peer_addr().map(|p| *p.ip());
            child
        };

        let peer = child.peer_addr().ok_or(Errno::Internal)?;
        let local = child.local_addr().ok_or(Errno::Internal)?;

        let mut descriptor = Descriptor::new(DescriptorKind::Tcp(child), self.process);
        if let DescriptorKind::Tcp(socket) = &mut descriptor.kind {
            socket.parent_handle = Some(fd.0);

            if let Some(peer_ip) = autotune_peer
                && let Some((send, recv)) = self.autotune_sizes(peer_ip)
            {
                socket.set_buffer_sizes(Some(send), Some(recv));
            }
        }

        let child_fd = self.host.descriptors.insert(descriptor);

        if let Some(interface) = self.host.interface_mut(*local.ip()) {
            interface.associate_connection(Protocol::Tcp, local.port(), peer, child_fd);
        }

        tracing::debug!(listener = %fd, child = %child_fd, %peer, "Accepted connection");

        Ok((child_fd, peer))
    }

    /// Receive/send buffer sizes from the delay-bandwidth product of the
    /// path to `peer`: the *peer's* upstream bandwidth bounds what can
    /// arrive here.
    fn autotune_sizes(&self, peer: Ipv4Addr) -> Option<(usize, usize)> {
        if !self.host.config.autotune {
            return None;
        }

        let delay = self.worker.sim.topology.max_latency();
        let peer_bw = self.worker.sim.resolver.bandwidth(peer)?;
        let own_bw = self.worker.sim.resolver.bandwidth(self.host.default_ip)?;

        let dbp = |kbps: u64| -> usize {
            let bytes = kbps as f64 * 1000.0 / 8.0 * delay.as_secs_f64() * 2.0;

            (bytes as usize).max(self.host.config.tcp.recv_buffer)
        };

        Some((dbp(own_bw.kbps_up), dbp(peer_bw.kbps_up)))
    }

    // --- Names -----------------------------------------------------------

    pub fn getsockname(&mut self, fd: Fd) -> Result<SocketAddrV4, Errno> {
        self.count_syscall();

        self.socket_local_addr(fd)?.ok_or(Errno::NotConnected)
    }

    pub fn getpeername(&mut self, fd: Fd) -> Result<SocketAddrV4, Errno> {
        self.count_syscall();

        match &self.lookup(fd)?.kind {
            DescriptorKind::Tcp(socket) => socket.peer_addr().ok_or(Errno::NotConnected),
            DescriptorKind::Udp(socket) => socket.peer_addr().ok_or(Errno::NotConnected),
            _ => Err(Errno::NotASocket),
        }
    }

    /// The peer path of a unix-domain socket, NUL-terminated.
    pub fn getpeername_unix(&mut self, fd: Fd) -> Result<Vec<u8>, Errno> {
        self.count_syscall();

        let peer_port = match &self.lookup(fd)?.kind {
            DescriptorKind::Tcp(socket) => {
                socket.peer_addr().ok_or(Errno::NotConnected)?.port()
            }
            _ => return Err(Errno::NotASocket),
        };

        let path = self
            .host
            .unix_ports
            .iter()
            .find(|(_, port)| **port == peer_port)
            .map(|(path, _)| path.clone())
            .ok_or(Errno::NotConnected)?;

        let mut bytes = path.into_bytes();
        bytes.push(0);

        Ok(bytes)
    }

    pub fn gethostname(&mut self) -> String {
        self.count_syscall();

        self.host.hostname.clone()
    }

    /// Name or dotted-quad to a registered address.
    pub fn getaddrinfo(&mut self, name: &str) -> Result<Ipv4Addr, Errno> {
        self.count_syscall();

        if let Ok(ip) = name.parse::<Ipv4Addr>() {
            return Ok(ip);
        }

        self.worker
            .sim
            .resolver
            .resolve_by_name(name)
            .ok_or(Errno::ResolveNoName)
    }

    pub fn clock_gettime(&mut self) -> SimTime {
        self.count_syscall();

        self.now()
    }

    // --- Data transfer ---------------------------------------------------

    pub fn send(&mut self, fd: Fd, data: &[u8]) -> Result<usize, Errno> {
        self.sendto(fd, data, None)
    }

    pub fn sendto(
        &mut self,
        fd: Fd,
        data: &[u8],
        dst: Option<SocketAddrV4>,
    ) -> Result<usize, Errno> {
        self.count_syscall();
        self.cpu_gate(fd)?;

        let n = match self.descriptor_kind(fd)? {
            Protocol::Tcp => {
                let socket = self.tcp_mut(fd)?;

                socket.send(data).map_err(Errno::from)?
            }
            Protocol::Udp => {
                if self.socket_local_addr(fd)?.is_none() {
                    let dst_ip = dst.map(|d| *d.ip()).unwrap_or(self.host.default_ip);
                    self.implicit_bind(fd, dst_ip)?;
                }

                let Host {
                    descriptors,
                    prio,
                    tracker,
                    ..
                } = &mut *self.host;
                let socket = descriptors
                    .get_mut(fd)
                    .and_then(Descriptor::as_udp_mut)
                    .ok_or(Errno::BadDescriptor)?;

                let n = socket.send_to(dst, data, prio).map_err(|e| match e {
                    UdpError::NotConnected => Errno::NotConnected,
                    UdpError::WouldBlock => Errno::WouldBlock,
                })?;

                // A datagram the queue could not take still reports its
                // length to the application; the drop is the host's to
                // account.
                tracker.packets_dropped += socket.take_dropped();

                n
            }
        };

        self.host.cpu.add_write(n);
        self.worker.flush_host(self.host);

        Ok(n)
    }

    pub fn recv(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, Errno> {
        Ok(self.recvfrom(fd, buf)?.0)
    }

    pub fn recvfrom(
        &mut self,
        fd: Fd,
        buf: &mut [u8],
    ) -> Result<(usize, Option<SocketAddrV4>), Errno> {
        self.count_syscall();
        self.cpu_gate(fd)?;

        let result = match self.descriptor_kind(fd)? {
            Protocol::Tcp => {
                let socket = self.tcp_mut(fd)?;

                socket.recv(buf).map(|n| (n, None)).map_err(Errno::from)
            }
            Protocol::Udp => {
                // An unbound datagram socket binds implicitly, on the
                // default interface, so replies have somewhere to land.
                if self.socket_local_addr(fd)?.is_none() {
                    let ip = self.host.default_ip;
                    self.bind_ephemeral_on(fd, ip)?;
                }

                self.udp_mut(fd)?
                    .recv_from(buf)
                    .map(|(n, from)| (n, Some(from)))
                    .map_err(|e| match e {
                        UdpError::WouldBlock => Errno::WouldBlock,
                        UdpError::NotConnected => Errno::NotConnected,
                    })
            }
        };

        if let Ok((n, _)) = result {
            self.host.cpu.add_read(n);
            // Draining may have freed window; let ACKs out.
            self.worker.flush_host(self.host);
            self.reap_if_drained(fd);
        }

        result
    }

    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, Errno> {
        if self.host.descriptors.is_random(fd) {
            self.count_syscall();
            self.host.rng.fill(buf);
            return Ok(buf.len());
        }

        // Sockets delegate to recv (which does its own accounting).
        if matches!(
            self.lookup(fd)?.kind,
            DescriptorKind::Tcp(_) | DescriptorKind::Udp(_)
        ) {
            return self.recv(fd, buf);
        }

        self.count_syscall();

        match &mut self.lookup(fd)?.kind {
            DescriptorKind::Pipe(pipe) => match pipe.read(buf) {
                Some(n) => Ok(n),
                None => Err(Errno::WouldBlock),
            },
            DescriptorKind::Timer(timer) => {
                // timerfd semantics: eight bytes carrying the expiration
                // count since the previous read.
                if timer.expirations == 0 {
                    return Err(Errno::WouldBlock);
                }
                if buf.len() < 8 {
                    return Err(Errno::Invalid);
                }

                buf[..8].copy_from_slice(&timer.expirations.to_ne_bytes());
                timer.expirations = 0;

                Ok(8)
            }
            DescriptorKind::Epoll(_) => Err(Errno::Invalid),
            DescriptorKind::Tcp(_) | DescriptorKind::Udp(_) => unreachable!("handled above"),
        }
    }

    pub fn write(&mut self, fd: Fd, data: &[u8]) -> Result<usize, Errno> {
        if matches!(
            self.lookup(fd)?.kind,
            DescriptorKind::Tcp(_) | DescriptorKind::Udp(_)
        ) {
            return self.send(fd, data);
        }

        self.count_syscall();
        self.cpu_gate(fd)?;

        let written = match &mut self.lookup(fd)?.kind {
            DescriptorKind::Pipe(pipe) => match pipe.write(data) {
                Some(0) => Err(Errno::WouldBlock),
                Some(n) => Ok(n),
                None => Err(Errno::ConnectionReset),
            },
            _ => Err(Errno::Invalid),
        }?;

        self.host.cpu.add_write(written);

        Ok(written)
    }

    // --- Close -----------------------------------------------------------

    pub fn close(&mut self, fd: Fd) -> Result<(), Errno> {
        self.count_syscall();

        enum Teardown {
            /// The wire side lives on until the FIN exchange finishes; the
            /// reaper tears the association down at terminal state.
            TcpDeferred,
            Udp(Option<SocketAddrV4>),
            Immediate,
        }

        let teardown = {
            let descriptor = self
                .host
                .descriptors
                .get_mut(fd)
                .ok_or(Errno::BadDescriptor)?;

            if descriptor.is_closed() {
                return Err(Errno::BadDescriptor);
            }

            descriptor.status.insert(FileStatus::CLOSED);
            descriptor.status.remove(FileStatus::ACTIVE);

            match &mut descriptor.kind {
                DescriptorKind::Tcp(socket) => {
                    socket.close();
                    Teardown::TcpDeferred
                }
                DescriptorKind::Udp(socket) => Teardown::Udp(socket.local_addr()),
                DescriptorKind::Pipe(pipe) => {
                    pipe.hang_up();
                    Teardown::Immediate
                }
                DescriptorKind::Timer(timer) => {
                    // Outstanding expiry events become stale.
                    timer.generation += 1;
                    timer.armed = None;
                    Teardown::Immediate
                }
                DescriptorKind::Epoll(_) => Teardown::Immediate,
            }
        };

        match teardown {
            Teardown::TcpDeferred => {
                self.drop_epoll_links(fd);
                self.worker.flush_host(self.host);
                self.reap_if_drained(fd);
            }
            Teardown::Udp(local) => {
                if let Some(local) = local {
                    self.disassociate_everywhere(fd, Protocol::Udp, local);
                }
                self.drop_epoll_links(fd);
                self.host.descriptors.remove(fd);
            }
            Teardown::Immediate => {
                self.drop_epoll_links(fd);
                self.host.descriptors.remove(fd);
            }
        }

        tracing::trace!(%fd, "Closed descriptor");

        Ok(())
    }

    fn drop_epoll_links(&mut self, fd: Fd) {
        let watchers = match self.host.descriptors.get_mut(fd) {
            Some(descriptor) => std::mem::take(&mut descriptor.watchers),
            None => return,
        };

        for watcher in watchers {
            if let Some(DescriptorKind::Epoll(epoll)) = self
                .host
                .descriptors
                .get_mut(watcher)
                .map(|d| &mut d.kind)
            {
                epoll.interests.remove(&fd);
            }
        }
    }

    fn disassociate_everywhere(&mut self, fd: Fd, protocol: Protocol, local: SocketAddrV4) {
        // ANY binds associate on every interface; walking them all is also
        // harmless for a specific bind.
        for interface in self.host.interfaces.values_mut() {
            interface.disassociate(protocol, local.port(), fd);
        }
    }

    /// Tear down a closed TCP descriptor whose socket has reached its
    /// terminal state and whose buffers are drained. After this, lookups
    /// fail with `BadDescriptor`.
    pub(crate) fn reap_if_drained(&mut self, fd: Fd) {
        let Some(descriptor) = self.host.descriptors.get(fd) else {
            return;
        };

        if !descriptor.is_closed() {
            return;
        }

        let DescriptorKind::Tcp(socket) = &descriptor.kind else {
            return;
        };

        if socket.state() == transport::State::Closed && !socket.has_buffered_input() {
            let local = socket.local_addr();

            if let Some(local) = local {
                self.disassociate_everywhere(fd, Protocol::Tcp, local);
            }
            self.host.descriptors.remove(fd);

            tracing::trace!(%fd, "Reaped socket");
        }
    }

    // --- Socket options --------------------------------------------------

    /// `getsockopt(SO_ERROR)`: the pending connection error, consumed.
    pub fn so_error(&mut self, fd: Fd) -> Result<Option<Errno>, Errno> {
        self.count_syscall();

        Ok(self.tcp_mut(fd)?.take_error().map(Errno::from))
    }

    pub fn set_buffer_sizes(
        &mut self,
        fd: Fd,
        send: Option<usize>,
        recv: Option<usize>,
    ) -> Result<(), Errno> {
        self.count_syscall();

        self.tcp_mut(fd)?.set_buffer_sizes(send, recv);

        Ok(())
    }

    // --- Epoll -----------------------------------------------------------

    pub fn epoll_ctl(
        &mut self,
        epfd: Fd,
        op: EpollOp,
        target: Fd,
        interest: EpollInterest,
    ) -> Result<(), Errno> {
        self.count_syscall();

        if epfd == target {
            return Err(Errno::Invalid);
        }
        if !self.host.descriptors.contains(target) {
            return Err(Errno::BadDescriptor);
        }

        {
            let epoll = self.epoll_mut(epfd)?;

            match op {
                EpollOp::Add => {
                    if epoll.interests.contains_key(&target) {
                        return Err(Errno::Invalid);
                    }
                    epoll.interests.insert(target, interest);
                }
                EpollOp::Mod => {
                    if !epoll.interests.contains_key(&target) {
                        return Err(Errno::BadDescriptor);
                    }
                    epoll.interests.insert(target, interest);
                }
                EpollOp::Del => {
                    if epoll.interests.remove(&target).is_none() {
                        return Err(Errno::BadDescriptor);
                    }
                }
            }
        }

        let watched = self
            .host
            .descriptors
            .get_mut(target)
            .ok_or(Errno::BadDescriptor)?;

        match op {
            EpollOp::Add | EpollOp::Mod => {
                watched.watchers.insert(epfd);
            }
            EpollOp::Del => {
                watched.watchers.remove(&epfd);
            }
        }

        Ok(())
    }

    /// Level-triggered readiness of everything the epoll watches.
    ///
    /// Never blocks: with a zero timeout this is the plain poll the API
    /// promises, and with a nonzero timeout and nothing ready it still
    /// returns immediately — once per epoll, a warning records that a
    /// plug-in expected to sleep here. Entries for closed descriptors are
    /// pruned, never reported.
    pub fn epoll_wait(
        &mut self,
        epfd: Fd,
        max_events: usize,
        timeout_ms: i64,
    ) -> Result<Vec<ReadyEvent>, Errno> {
        self.count_syscall();

        let interests: Vec<(Fd, EpollInterest)> = {
            let epoll = self.epoll_mut(epfd)?;

            epoll.interests.iter().map(|(fd, i)| (*fd, *i)).collect()
        };

        let mut ready = Vec::new();
        let mut stale = Vec::new();

        for (fd, interest) in interests {
            let Some(descriptor) = self.host.descriptors.get_mut(fd) else {
                stale.push(fd);
                continue;
            };

            descriptor.refresh_status();
            let mut events = descriptor.status.to_epoll()
                & (interest.events | EpollEvents::ERR | EpollEvents::HUP);

            if descriptor.is_closed() && !descriptor.status.contains(FileStatus::READABLE) {
                stale.push(fd);
                continue;
            }

            if descriptor.status.contains(FileStatus::ERROR) {
                events |= EpollEvents::ERR;
            }

            if !events.is_empty() && ready.len() < max_events {
                ready.push(ReadyEvent {
                    data: interest.data,
                    events,
                });
            }
        }

        for fd in stale {
            let epoll = self.epoll_mut(epfd)?;
            epoll.interests.remove(&fd);

            if let Some(descriptor) = self.host.descriptors.get_mut(fd) {
                descriptor.watchers.remove(&epfd);
            }
        }

        if ready.is_empty() && timeout_ms != 0 {
            let epoll = self.epoll_mut(epfd)?;

            if !epoll.warned_busy_wait {
                epoll.warned_busy_wait = true;

                tracing::warn!(
                    %epfd,
                    timeout_ms,
                    "epoll_wait with a timeout cannot block in simulation; returning 0 immediately"
                );
            }
        }

        Ok(ready)
    }

    // --- Timers ----------------------------------------------------------

    /// Arm (or disarm, with a zero `initial`) a timer descriptor.
    pub fn timerfd_settime(
        &mut self,
        fd: Fd,
        initial: SimDuration,
        interval: Option<SimDuration>,
    ) -> Result<(), Errno> {
        self.count_syscall();

        let now = self.now();
        let timer = self.timer_mut(fd)?;

        timer.generation += 1;
        let generation = timer.generation;

        if initial.is_zero() {
            timer.armed = None;
            timer.interval = None;

            return Ok(());
        }

        let expiry = now + initial;
        timer.armed = Some(expiry);
        timer.interval = interval;

        self.worker.schedule_local(
            self.host,
            initial,
            EventPayload::Callback(Box::new(move |ctx| {
                ctx.on_timer_expiry(fd, generation);
            })),
        );

        Ok(())
    }

    /// Deferred timer expiry. Stale generations (re-armed or closed
    /// timers) are ignored; persistent timers re-arm themselves.
    fn on_timer_expiry(&mut self, fd: Fd, generation: u64) {
        let now = self.now();

        let Ok(timer) = self.timer_mut(fd) else {
            return;
        };

        if timer.generation != generation || timer.armed.is_none() {
            return;
        }

        timer.expirations += 1;

        match timer.interval {
            Some(interval) if !interval.is_zero() => {
                timer.armed = Some(now + interval);

                self.worker.schedule_local(
                    self.host,
                    interval,
                    EventPayload::Callback(Box::new(move |ctx| {
                        ctx.on_timer_expiry(fd, generation);
                    })),
                );
            }
            _ => {
                // One-shot timers become inert after firing.
                timer.armed = None;
            }
        }
    }

    // --- Internals -------------------------------------------------------

    fn count_syscall(&mut self) {
        self.host.tracker.syscalls += 1;
    }

    /// When the host owes more than the blocking threshold of CPU delay,
    /// fail with `WouldBlock` and schedule a readiness retry for when the
    /// backlog will have been absorbed.
    fn cpu_gate(&mut self, fd: Fd) -> Result<(), Errno> {
        if !self.host.cpu.is_blocked() {
            return Ok(());
        }

        let delay = self.host.cpu.unabsorbed();

        tracing::trace!(%fd, %delay, "CPU blocked, deferring syscall");

        self.worker
            .schedule_local(self.host, delay, EventPayload::DescriptorReady { fd });

        Err(Errno::WouldBlock)
    }

    fn lookup(&mut self, fd: Fd) -> Result<&mut Descriptor, Errno> {
        self.host
            .descriptors
            .get_mut(fd)
            .ok_or(Errno::BadDescriptor)
    }

    fn descriptor_kind(&mut self, fd: Fd) -> Result<Protocol, Errno> {
        match &self.lookup(fd)?.kind {
            DescriptorKind::Tcp(_) => Ok(Protocol::Tcp),
            DescriptorKind::Udp(_) => Ok(Protocol::Udp),
            _ => Err(Errno::NotASocket),
        }
    }

    fn socket_protocol(&mut self, fd: Fd) -> Result<Protocol, Errno> {
        self.descriptor_kind(fd)
    }

    fn socket_local_addr(&mut self, fd: Fd) -> Result<Option<SocketAddrV4>, Errno> {
        match &self.lookup(fd)?.kind {
            DescriptorKind::Tcp(socket) => Ok(socket.local_addr()),
            DescriptorKind::Udp(socket) => Ok(socket.local_addr()),
            _ => Err(Errno::NotASocket),
        }
    }

    fn set_socket_local_addr(&mut self, fd: Fd, addr: SocketAddrV4) -> Result<(), Errno> {
        match &mut self.lookup(fd)?.kind {
            DescriptorKind::Tcp(socket) => {
                socket.bind(addr);
                Ok(())
            }
            DescriptorKind::Udp(socket) => {
                socket.bind(addr);
                Ok(())
            }
            _ => Err(Errno::NotASocket),
        }
    }

    fn tcp_mut(&mut self, fd: Fd) -> Result<&mut TcpSocket, Errno> {
        match &mut self.lookup(fd)?.kind {
            DescriptorKind::Tcp(socket) => Ok(socket),
            DescriptorKind::Udp(_) => Err(Errno::ProtocolNotSupported),
            _ => Err(Errno::NotASocket),
        }
    }

    fn udp_mut(&mut self, fd: Fd) -> Result<&mut UdpSocket, Errno> {
        match &mut self.lookup(fd)?.kind {
            DescriptorKind::Udp(socket) => Ok(socket),
            DescriptorKind::Tcp(_) => Err(Errno::ProtocolNotSupported),
            _ => Err(Errno::NotASocket),
        }
    }

    fn epoll_mut(&mut self, fd: Fd) -> Result<&mut Epoll, Errno> {
        match &mut self.lookup(fd)?.kind {
            DescriptorKind::Epoll(epoll) => Ok(epoll),
            _ => Err(Errno::Invalid),
        }
    }

    fn timer_mut(&mut self, fd: Fd) -> Result<&mut Timer, Errno> {
        match &mut self.lookup(fd)?.kind {
            DescriptorKind::Timer(timer) => Ok(timer),
            _ => Err(Errno::Invalid),
        }
    }
}
