//! Datagram carriers.
//!
//! Sessions and listeners speak to the network through [`PacketConn`], an
//! address-oriented datagram endpoint. Two carriers are provided: plain UDP,
//! and ICMP echo where each datagram rides as the payload of an echo
//! request/reply pair. Both make `close()` observable to blocked readers by
//! polling with a short socket timeout against a closed flag.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::error::err_invalid_operation;

/// Largest datagram any carrier will move.
pub const MTU_LIMIT: usize = 1500;

/// Echo identifier tagging our traffic. Obfuscation, not authentication:
/// peers are told apart by source IP alone.
pub const ICMP_ECHO_ID: u16 = 420;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_HEADER_SIZE: usize = 8;

/// Poll granularity that lets blocked reads notice `close()`.
const READ_POLL: Duration = Duration::from_millis(500);

/// A bidirectional, MTU-bounded datagram endpoint with peer addresses.
///
/// `read_from` blocks; after `close()` it returns an error promptly. Socket
/// options default to unsupported so carriers that cannot express them (or
/// sessions that do not own their carrier) refuse them uniformly.
pub trait PacketConn: Send + Sync {
    fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn close(&self) -> io::Result<()>;

    fn set_read_buffer(&self, _bytes: usize) -> io::Result<()> {
        Err(err_invalid_operation())
    }
    fn set_write_buffer(&self, _bytes: usize) -> io::Result<()> {
        Err(err_invalid_operation())
    }
    fn set_dscp(&self, _dscp: u32) -> io::Result<()> {
        Err(err_invalid_operation())
    }
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

// =============================================================================
// UDP
// =============================================================================

/// The trivial carrier: one UDP socket.
pub struct UdpConn {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl UdpConn {
    pub fn bind(addr: &str) -> io::Result<Self> {
        Self::from_socket(UdpSocket::bind(addr)?)
    }

    pub fn from_socket(socket: UdpSocket) -> io::Result<Self> {
        socket.set_read_timeout(Some(READ_POLL))?;
        Ok(UdpConn {
            socket,
            closed: AtomicBool::new(false),
        })
    }
}

impl PacketConn for UdpConn {
    fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(closed_err());
            }
            match self.socket.recv_from(buf) {
                Ok(r) => return Ok(r),
                Err(e) if is_poll_timeout(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_err());
        }
        self.socket.send_to(buf, addr)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_read_buffer(&self, bytes: usize) -> io::Result<()> {
        SockRef::from(&self.socket).set_recv_buffer_size(bytes)
    }

    fn set_write_buffer(&self, bytes: usize) -> io::Result<()> {
        SockRef::from(&self.socket).set_send_buffer_size(bytes)
    }

    fn set_dscp(&self, dscp: u32) -> io::Result<()> {
        SockRef::from(&self.socket).set_tos(dscp << 2)
    }
}

// =============================================================================
// ICMP echo
// =============================================================================

/// Builds an echo packet: type/code/checksum/id/seq + payload.
fn encode_echo(typ: u8, id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(ICMP_HEADER_SIZE + payload.len());
    pkt.push(typ);
    pkt.push(0);
    pkt.extend_from_slice(&[0, 0]);
    pkt.extend_from_slice(&id.to_be_bytes());
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(payload);
    let ck = icmp_checksum(&pkt);
    pkt[2..4].copy_from_slice(&ck.to_be_bytes());
    pkt
}

/// Parsed echo message: (type, code, id, seq, payload offset).
fn parse_echo(icmp: &[u8]) -> Option<(u8, u8, u16, u16, usize)> {
    if icmp.len() < ICMP_HEADER_SIZE {
        return None;
    }
    let typ = icmp[0];
    let code = icmp[1];
    let id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    Some((typ, code, id, seq, ICMP_HEADER_SIZE))
}

/// RFC 1071 ones'-complement checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Datagrams tunneled through ICMP echo.
///
/// Clients send echo requests and read replies; a listener built with
/// `send_replies` does the reverse, so the traffic resembles ordinary ping.
/// Requires a raw socket (CAP_NET_RAW or root).
pub struct IcmpConn {
    socket: UdpSocket,
    remote: Option<IpAddr>,
    send_replies: bool,
    seq: AtomicU16,
    closed: AtomicBool,
}

impl IcmpConn {
    /// Opens a raw ICMP socket, optionally bound to interface `dev` and
    /// filtered to one remote address.
    pub fn open(remote: Option<IpAddr>, send_replies: bool, dev: &str) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        #[cfg(target_os = "linux")]
        if !dev.is_empty() {
            socket.bind_device(Some(dev.as_bytes()))?;
        }
        #[cfg(not(target_os = "linux"))]
        let _ = dev;
        socket.set_read_timeout(Some(READ_POLL))?;
        Ok(IcmpConn {
            socket: socket.into(),
            remote,
            send_replies,
            seq: AtomicU16::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn accepts(&self, typ: u8, code: u8, id: u16, src: IpAddr) -> bool {
        if code != 0 || id != ICMP_ECHO_ID {
            return false;
        }
        let expected = if self.send_replies {
            ICMP_ECHO_REQUEST
        } else {
            ICMP_ECHO_REPLY
        };
        if typ != expected {
            return false;
        }
        match self.remote {
            Some(remote) => src == remote,
            None => true,
        }
    }
}

impl PacketConn for IcmpConn {
    fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        // Raw IPv4 sockets deliver the IP header too.
        let mut raw = [0u8; 2048];
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(closed_err());
            }
            let (n, from) = match self.socket.recv_from(&mut raw) {
                Ok(r) => r,
                Err(e) if is_poll_timeout(&e) => continue,
                Err(e) => return Err(e),
            };
            if n < 20 || raw[0] >> 4 != 4 {
                continue;
            }
            let ihl = ((raw[0] & 0x0f) as usize) * 4;
            if n < ihl + ICMP_HEADER_SIZE {
                continue;
            }
            let Some((typ, code, id, _seq, off)) = parse_echo(&raw[ihl..n]) else {
                continue;
            };
            if !self.accepts(typ, code, id, from.ip()) {
                continue;
            }
            let payload = &raw[ihl + off..n];
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            return Ok((len, SocketAddr::new(from.ip(), 0)));
        }
    }

    fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_err());
        }
        let typ = if self.send_replies {
            ICMP_ECHO_REPLY
        } else {
            ICMP_ECHO_REQUEST
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let pkt = encode_echo(typ, ICMP_ECHO_ID, seq, buf);
        self.socket.send_to(&pkt, SocketAddr::new(addr.ip(), 0))?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_read_buffer(&self, bytes: usize) -> io::Result<()> {
        SockRef::from(&self.socket).set_recv_buffer_size(bytes)
    }

    fn set_write_buffer(&self, bytes: usize) -> io::Result<()> {
        SockRef::from(&self.socket).set_send_buffer_size(bytes)
    }

    fn set_dscp(&self, dscp: u32) -> io::Result<()> {
        SockRef::from(&self.socket).set_tos(dscp << 2)
    }
}
