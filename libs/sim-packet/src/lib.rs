//! The wire object of the simulation.
//!
//! A [`Packet`] is created once, by the sending socket, and from then on only
//! its refcount changes: the interface queues it, the event queue carries it
//! to the destination host and the receiving socket buffers it, all through
//! the same `Arc`. Headers and payload are immutable after construction.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use bytes::Bytes;

/// Fixed header overhead charged against link bandwidth, per protocol.
///
/// 20 bytes IPv4 plus 20 bytes TCP or 8 bytes UDP. Options are not modelled.
pub const IPV4_HEADER_SIZE: usize = 20;
pub const TCP_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

bitflags::bitflags! {
    /// TCP header flags.
    ///
    /// `CON` is the congestion-experienced echo used by the virtual transport;
    /// it takes the place of a real ECN codepoint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 1 << 0;
        const SYN = 1 << 1;
        const RST = 1 << 2;
        const ACK = 1 << 3;
        const CON = 1 << 4;
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for (name, flag) in [
            ("SYN", TcpFlags::SYN),
            ("ACK", TcpFlags::ACK),
            ("FIN", TcpFlags::FIN),
            ("RST", TcpFlags::RST),
            ("CON", TcpFlags::CON),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }

        if first {
            write!(f, "-")?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub window: u32,
    pub flags: TcpFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

#[derive(Debug)]
struct Inner {
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    transport: TransportHeader,
    payload: Bytes,
    /// Host-monotonic send order, the QDisc fairness tiebreaker.
    priority: f64,
}

/// A refcounted simulated packet. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Packet(Arc<Inner>);

impl Packet {
    pub fn tcp(
        src: SocketAddrV4,
        dst: SocketAddrV4,
        header: TcpSegment,
        payload: Bytes,
        priority: f64,
    ) -> Self {
        Packet(Arc::new(Inner {
            src_ip: *src.ip(),
            dst_ip: *dst.ip(),
            transport: TransportHeader::Tcp(TcpHeader {
                src_port: src.port(),
                dst_port: dst.port(),
                seq: header.seq,
                ack: header.ack,
                window: header.window,
                flags: header.flags,
            }),
            payload,
            priority,
        }))
    }

    pub fn udp(src: SocketAddrV4, dst: SocketAddrV4, payload: Bytes, priority: f64) -> Self {
        Packet(Arc::new(Inner {
            src_ip: *src.ip(),
            dst_ip: *dst.ip(),
            transport: TransportHeader::Udp(UdpHeader {
                src_port: src.port(),
                dst_port: dst.port(),
            }),
            payload,
            priority,
        }))
    }

    pub fn protocol(&self) -> Protocol {
        match self.0.transport {
            TransportHeader::Tcp(_) => Protocol::Tcp,
            TransportHeader::Udp(_) => Protocol::Udp,
        }
    }

    pub fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.0.src_ip, self.src_port())
    }

    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.0.dst_ip, self.dst_port())
    }

    pub fn source_ip(&self) -> Ipv4Addr {
        self.0.src_ip
    }

    pub fn destination_ip(&self) -> Ipv4Addr {
        self.0.dst_ip
    }

    pub fn src_port(&self) -> u16 {
        match self.0.transport {
            TransportHeader::Tcp(ref h) => h.src_port,
            TransportHeader::Udp(ref h) => h.src_port,
        }
    }

    pub fn dst_port(&self) -> u16 {
        match self.0.transport {
            TransportHeader::Tcp(ref h) => h.dst_port,
            TransportHeader::Udp(ref h) => h.dst_port,
        }
    }

    pub fn as_tcp(&self) -> Option<&TcpHeader> {
        match self.0.transport {
            TransportHeader::Tcp(ref h) => Some(h),
            TransportHeader::Udp(_) => None,
        }
    }

    pub fn as_udp(&self) -> Option<&UdpHeader> {
        match self.0.transport {
            TransportHeader::Udp(ref h) => Some(h),
            TransportHeader::Tcp(_) => None,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.0.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.0.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.payload.is_empty()
    }

    /// Bytes charged against link bandwidth: payload plus header overhead.
    pub fn total_len(&self) -> usize {
        let transport = match self.0.transport {
            TransportHeader::Tcp(_) => TCP_HEADER_SIZE,
            TransportHeader::Udp(_) => UDP_HEADER_SIZE,
        };

        IPV4_HEADER_SIZE + transport + self.0.payload.len()
    }

    pub fn priority(&self) -> f64 {
        self.0.priority
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.transport {
            TransportHeader::Tcp(ref h) => write!(
                f,
                "{} -> {} tcp {} seq={} ack={} win={} len={}",
                self.source(),
                self.destination(),
                h.flags,
                h.seq,
                h.ack,
                h.window,
                self.len(),
            ),
            TransportHeader::Udp(_) => write!(
                f,
                "{} -> {} udp len={}",
                self.source(),
                self.destination(),
                self.len(),
            ),
        }
    }
}

/// The TCP-specific portion of a packet, filled in by the transport.
///
/// Addresses and ports come from the socket's binding and are supplied
/// separately to [`Packet::tcp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpSegment {
    pub seq: u32,
    pub ack: u32,
    pub window: u32,
    pub flags: TcpFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[test]
    fn clone_shares_payload() {
        let payload = Bytes::from_static(b"hello");
        let a = Packet::udp(sock("10.0.0.1:5000"), sock("10.0.0.2:80"), payload, 0.0);
        let b = a.clone();

        assert_eq!(a.payload().as_ptr(), b.payload().as_ptr());
    }

    #[test]
    fn total_len_includes_header_overhead() {
        let tcp = Packet::tcp(
            sock("10.0.0.1:5000"),
            sock("10.0.0.2:80"),
            TcpSegment::default(),
            Bytes::from_static(&[0; 100]),
            0.0,
        );
        let udp = Packet::udp(
            sock("10.0.0.1:5000"),
            sock("10.0.0.2:80"),
            Bytes::from_static(&[0; 100]),
            0.0,
        );

        assert_eq!(tcp.total_len(), 140);
        assert_eq!(udp.total_len(), 128);
    }

    #[test]
    fn display_renders_flags() {
        let p = Packet::tcp(
            sock("10.0.0.1:5000"),
            sock("10.0.0.2:80"),
            TcpSegment {
                seq: 1,
                ack: 0,
                window: 65535,
                flags: TcpFlags::SYN,
            },
            Bytes::new(),
            0.0,
        );

        assert_eq!(
            p.to_string(),
            "10.0.0.1:5000 -> 10.0.0.2:80 tcp SYN seq=1 ack=0 win=65535 len=0"
        );
    }
}
