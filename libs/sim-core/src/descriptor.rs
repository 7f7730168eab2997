//! Per-host descriptor table and the kernel-like objects behind it.
//!
//! Handles are small integers starting at 3 (0-2 are stdio pass-through).
//! Released handles return to an ordered free set and are reused smallest
//! first. Handles never alias across hosts; the table lives inside the
//! host and is only touched under the host lock.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use sim_time::{SimDuration, SimTime};
use transport::{SocketState, TcpSocket, UdpSocket};

use crate::{Fd, ProcessId};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileStatus: u8 {
        const ACTIVE = 1 << 0;
        const CLOSED = 1 << 1;
        const READABLE = 1 << 2;
        const WRITABLE = 1 << 3;
        const ERROR = 1 << 4;
    }
}

bitflags::bitflags! {
    /// The epoll event mask, mirroring the kernel constants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EpollEvents: u32 {
        const IN = 0x001;
        const OUT = 0x004;
        const ERR = 0x008;
        const HUP = 0x010;
    }
}

impl FileStatus {
    pub fn to_epoll(self) -> EpollEvents {
        let mut events = EpollEvents::empty();

        if self.contains(FileStatus::READABLE) {
            events |= EpollEvents::IN;
        }
        if self.contains(FileStatus::WRITABLE) {
            events |= EpollEvents::OUT;
        }
        if self.contains(FileStatus::ERROR) {
            events |= EpollEvents::ERR;
        }

        events
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EpollInterest {
    pub events: EpollEvents,
    pub data: u64,
}

/// One entry of an `epoll_wait` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub data: u64,
    pub events: EpollEvents,
}

#[derive(Debug, Default)]
pub struct Epoll {
    pub interests: BTreeMap<Fd, EpollInterest>,
    /// Warn only once when a plug-in passes a nonzero timeout; the
    /// simulator never blocks.
    pub warned_busy_wait: bool,
}

/// A timerfd-style timer descriptor.
#[derive(Debug, Default)]
pub struct Timer {
    /// Re-arm period; `None` makes the timer one-shot.
    pub interval: Option<SimDuration>,
    /// Next expiry, if armed.
    pub armed: Option<SimTime>,
    /// Expirations since the last read.
    pub expirations: u64,
    /// Bumped on every settime/close; outstanding expiry events compare
    /// this to know they are stale.
    pub generation: u64,
}

#[derive(Debug)]
struct PipeBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    /// The writing side has gone away.
    closed: bool,
}

impl PipeBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            capacity,
            closed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    ReadEnd,
    WriteEnd,
    /// One side of a socketpair.
    Duplex,
}

/// One end of a pipe or socketpair. The byte queues are shared with the
/// peer end through the host-local `Arc`s.
#[derive(Debug)]
pub struct Pipe {
    pub role: PipeRole,
    pub peer: Fd,
    read_buf: Option<Arc<Mutex<PipeBuffer>>>,
    write_buf: Option<Arc<Mutex<PipeBuffer>>>,
}

pub const PIPE_CAPACITY: usize = 64 * 1024;

impl Pipe {
    /// Create the two ends of a unidirectional pipe. Returns (read, write);
    /// `peer` fields must be fixed up by the table after insertion.
    pub fn pair() -> (Pipe, Pipe) {
        let buf = Arc::new(Mutex::new(PipeBuffer::new(PIPE_CAPACITY)));

        let read = Pipe {
            role: PipeRole::ReadEnd,
            peer: Fd(-1),
            read_buf: Some(buf.clone()),
            write_buf: None,
        };
        let write = Pipe {
            role: PipeRole::WriteEnd,
            peer: Fd(-1),
            read_buf: None,
            write_buf: Some(buf),
        };

        (read, write)
    }

    /// Create both ends of a bidirectional socketpair.
    pub fn socket_pair() -> (Pipe, Pipe) {
        let a_to_b = Arc::new(Mutex::new(PipeBuffer::new(PIPE_CAPACITY)));
        let b_to_a = Arc::new(Mutex::new(PipeBuffer::new(PIPE_CAPACITY)));

        let a = Pipe {
            role: PipeRole::Duplex,
            peer: Fd(-1),
            read_buf: Some(b_to_a.clone()),
            write_buf: Some(a_to_b.clone()),
        };
        let b = Pipe {
            role: PipeRole::Duplex,
            peer: Fd(-1),
            read_buf: Some(a_to_b),
            write_buf: Some(b_to_a),
        };

        (a, b)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Option<usize> {
        let shared = self.read_buf.as_ref()?;
        let mut inner = shared.lock();

        if inner.data.is_empty() {
            // EOF once the writer is gone.
            return inner.closed.then_some(0);
        }

        let n = buf.len().min(inner.data.len());
        for slot in buf.iter_mut().take(n) {
            *slot = inner.data.pop_front().expect("length was checked");
        }

        Some(n)
    }

    /// Returns the number of bytes accepted, `Some(0)` when full, `None`
    /// when this end cannot write or the reader is gone.
    pub fn write(&mut self, data: &[u8]) -> Option<usize> {
        let shared = self.write_buf.as_ref()?;
        let mut inner = shared.lock();

        if inner.closed {
            return None;
        }

        let space = inner.capacity.saturating_sub(inner.data.len());
        let n = space.min(data.len());
        inner.data.extend(&data[..n]);

        Some(n)
    }

    /// Mark the shared buffers as orphaned when this end closes.
    pub fn hang_up(&mut self) {
        if let Some(buf) = self.write_buf.take() {
            buf.lock().closed = true;
        }
        if let Some(buf) = self.read_buf.take() {
            buf.lock().closed = true;
        }
    }

    pub fn poll(&self) -> SocketState {
        let readable = self.read_buf.as_ref().is_some_and(|b| {
            let inner = b.lock();
            !inner.data.is_empty() || inner.closed
        });
        let writable = self.write_buf.as_ref().is_some_and(|b| {
            let inner = b.lock();
            !inner.closed && inner.data.len() < inner.capacity
        });

        SocketState {
            readable,
            writable,
            hangup: false,
            error: false,
        }
    }

    pub fn has_buffered_input(&self) -> bool {
        self.read_buf
            .as_ref()
            .is_some_and(|b| !b.lock().data.is_empty())
    }
}

#[derive(Debug)]
pub enum DescriptorKind {
    Tcp(TcpSocket),
    Udp(UdpSocket),
    Pipe(Pipe),
    Epoll(Epoll),
    Timer(Timer),
}

#[derive(Debug)]
pub struct Descriptor {
    pub status: FileStatus,
    /// Status bits already reported to the owning application; the delta
    /// against `status` drives readable/writable callbacks.
    pub last_notified: FileStatus,
    /// Epoll descriptors watching this one.
    pub watchers: BTreeSet<Fd>,
    pub owner: Option<ProcessId>,
    /// Delivery time of the earliest scheduled transport-timer event, so
    /// the same deadline is not scheduled twice.
    pub timer_at: Option<SimTime>,
    /// Abstract unix path, for sockets bound/connected via a path.
    pub unix_path: Option<String>,
    pub kind: DescriptorKind,
}

impl Descriptor {
    pub fn new(kind: DescriptorKind, owner: Option<ProcessId>) -> Self {
        Self {
            status: FileStatus::ACTIVE,
            last_notified: FileStatus::empty(),
            watchers: BTreeSet::new(),
            owner,
            timer_at: None,
            unix_path: None,
            kind,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status.contains(FileStatus::CLOSED)
    }

    /// Recompute READABLE/WRITABLE/ERROR from the underlying object.
    pub fn refresh_status(&mut self) {
        let poll = match &self.kind {
            DescriptorKind::Tcp(socket) => socket.poll(),
            DescriptorKind::Udp(socket) => socket.poll(),
            DescriptorKind::Pipe(pipe) => pipe.poll(),
            DescriptorKind::Epoll(_) => SocketState::default(),
            DescriptorKind::Timer(timer) => SocketState {
                readable: timer.expirations > 0,
                writable: false,
                hangup: false,
                error: false,
            },
        };

        self.status.set(FileStatus::READABLE, poll.readable);
        // A closed descriptor may still drain input but never write again.
        self.status.set(
            FileStatus::WRITABLE,
            poll.writable && !self.is_closed(),
        );
        self.status.set(FileStatus::ERROR, poll.error);
    }

    pub fn as_tcp_mut(&mut self) -> Option<&mut TcpSocket> {
        match &mut self.kind {
            DescriptorKind::Tcp(socket) => Some(socket),
            _ => None,
        }
    }

    pub fn as_udp_mut(&mut self) -> Option<&mut UdpSocket> {
        match &mut self.kind {
            DescriptorKind::Udp(socket) => Some(socket),
            _ => None,
        }
    }
}

/// Smallest application-visible handle; 0-2 are stdio.
const FIRST_FD: i32 = 3;

#[derive(Debug, Default)]
pub struct DescriptorTable {
    slots: BTreeMap<Fd, Descriptor>,
    free: BTreeSet<i32>,
    next: i32,
    /// Simulated handle -> host-OS handle for files opened against the
    /// real filesystem. Stdio (0-2) is an implicit identity mapping.
    virtual_to_os: BTreeMap<Fd, i32>,
    os_to_virtual: BTreeMap<i32, Fd>,
    /// Handles that read from the host's deterministic random stream.
    random_fds: BTreeSet<Fd>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self {
            next: FIRST_FD,
            ..Self::default()
        }
    }

    /// Allocate the smallest unused handle >= 3.
    pub fn insert(&mut self, descriptor: Descriptor) -> Fd {
        let fd = match self.free.pop_first() {
            Some(reused) => Fd(reused),
            None => {
                let fd = Fd(self.next);
                self.next += 1;
                fd
            }
        };

        self.slots.insert(fd, descriptor);

        fd
    }

    pub fn get(&self, fd: Fd) -> Option<&Descriptor> {
        self.slots.get(&fd)
    }

    pub fn get_mut(&mut self, fd: Fd) -> Option<&mut Descriptor> {
        self.slots.get_mut(&fd)
    }

    /// Remove a descriptor, recycling its handle and dropping every epoll
    /// relationship in both directions.
    pub fn remove(&mut self, fd: Fd) -> Option<Descriptor> {
        let descriptor = self.slots.remove(&fd)?;

        for watcher in &descriptor.watchers {
            if let Some(DescriptorKind::Epoll(epoll)) =
                self.slots.get_mut(watcher).map(|d| &mut d.kind)
            {
                epoll.interests.remove(&fd);
            }
        }

        if let DescriptorKind::Epoll(ref epoll) = descriptor.kind {
            for target in epoll.interests.keys() {
                if let Some(target) = self.slots.get_mut(target) {
                    target.watchers.remove(&fd);
                }
            }
        }

        self.random_fds.remove(&fd);
        if let Some(os) = self.virtual_to_os.remove(&fd) {
            self.os_to_virtual.remove(&os);
        }

        self.free.insert(fd.0);

        Some(descriptor)
    }

    pub fn contains(&self, fd: Fd) -> bool {
        self.slots.contains_key(&fd)
    }

    pub fn fds(&self) -> impl Iterator<Item = Fd> + '_ {
        self.slots.keys().copied()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Fd, &mut Descriptor)> {
        self.slots.iter_mut().map(|(fd, d)| (*fd, d))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Record an OS-level handle backing a simulated one.
    pub fn map_os_fd(&mut self, fd: Fd, os: i32) {
        self.virtual_to_os.insert(fd, os);
        self.os_to_virtual.insert(os, fd);
    }

    pub fn os_fd(&self, fd: Fd) -> Option<i32> {
        // Stdio passes through unchanged.
        if (0..FIRST_FD).contains(&fd.0) {
            return Some(fd.0);
        }

        self.virtual_to_os.get(&fd).copied()
    }

    pub fn virtual_fd(&self, os: i32) -> Option<Fd> {
        if (0..FIRST_FD).contains(&os) {
            return Some(Fd(os));
        }

        self.os_to_virtual.get(&os).copied()
    }

    pub fn mark_random(&mut self, fd: Fd) {
        self.random_fds.insert(fd);
    }

    pub fn is_random(&self, fd: Fd) -> bool {
        self.random_fds.contains(&fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> DescriptorTable {
        DescriptorTable::new()
    }

    fn timer_descriptor() -> Descriptor {
        Descriptor::new(DescriptorKind::Timer(Timer::default()), None)
    }

    #[test]
    fn handles_start_at_three() {
        let mut t = table();

        assert_eq!(t.insert(timer_descriptor()), Fd(3));
        assert_eq!(t.insert(timer_descriptor()), Fd(4));
    }

    #[test]
    fn released_handles_are_reused_smallest_first() {
        let mut t = table();
        let a = t.insert(timer_descriptor());
        let b = t.insert(timer_descriptor());
        let c = t.insert(timer_descriptor());

        t.remove(b);
        t.remove(a);

        assert_eq!(t.insert(timer_descriptor()), a);
        assert_eq!(t.insert(timer_descriptor()), b);
        assert_eq!(t.insert(timer_descriptor()), Fd(c.0 + 1));
    }

    #[test]
    fn stdio_passes_through_identically() {
        let t = table();

        assert_eq!(t.os_fd(Fd(0)), Some(0));
        assert_eq!(t.virtual_fd(2), Some(Fd(2)));
        assert_eq!(t.os_fd(Fd(3)), None);
    }

    #[test]
    fn removing_descriptor_clears_epoll_links() {
        let mut t = table();
        let target = t.insert(timer_descriptor());
        let epfd = t.insert(Descriptor::new(
            DescriptorKind::Epoll(Epoll::default()),
            None,
        ));

        // Wire the interest by hand, both directions.
        match &mut t.get_mut(epfd).unwrap().kind {
            DescriptorKind::Epoll(e) => {
                e.interests.insert(
                    target,
                    EpollInterest {
                        events: EpollEvents::IN,
                        data: 7,
                    },
                );
            }
            _ => unreachable!(),
        }
        t.get_mut(target).unwrap().watchers.insert(epfd);

        t.remove(target);

        match &t.get(epfd).unwrap().kind {
            DescriptorKind::Epoll(e) => assert!(e.interests.is_empty()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn pipe_round_trip_with_eof() {
        let (mut read, mut write) = Pipe::pair();

        assert_eq!(write.write(b"data"), Some(4));
        assert!(read.poll().readable);

        let mut buf = [0u8; 8];
        assert_eq!(read.read(&mut buf), Some(4));
        assert_eq!(&buf[..4], b"data");

        // Empty and still open: no EOF yet.
        assert!(read.read(&mut buf).is_none());

        write.hang_up();
        assert_eq!(read.read(&mut buf), Some(0));
    }

    #[test]
    fn socketpair_is_bidirectional() {
        let (mut a, mut b) = Pipe::socket_pair();

        a.write(b"ping").unwrap();
        b.write(b"pong").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf), Some(4));
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(a.read(&mut buf), Some(4));
        assert_eq!(&buf[..4], b"pong");
    }

    #[test]
    fn pipe_write_blocks_at_capacity() {
        let (_read, mut write) = Pipe::pair();

        assert_eq!(write.write(&vec![0; PIPE_CAPACITY]), Some(PIPE_CAPACITY));
        assert_eq!(write.write(b"x"), Some(0));
    }
}
