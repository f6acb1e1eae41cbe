//! Raw sending sockets and the socket pool.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::error::{Error, Result};

/// Address families the pool can lend sockets for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn domain(self) -> Domain {
        match self {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        }
    }

    /// Family of a destination address.
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// Wire protocols a probe can be forged over.
///
/// The pool keys on this together with the family so distinct probe
/// kinds never share a sending endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireProtocol {
    Icmp,
    Udp,
    Tcp,
}

impl WireProtocol {
    fn for_family(self, family: Family) -> Protocol {
        match (self, family) {
            (WireProtocol::Icmp, Family::V4) => Protocol::ICMPV4,
            (WireProtocol::Icmp, Family::V6) => Protocol::ICMPV6,
            (WireProtocol::Udp, _) => Protocol::UDP,
            (WireProtocol::Tcp, _) => Protocol::TCP,
        }
    }
}

/// A non-blocking raw sending socket.
///
/// Sends complete IP datagrams (header included); the codec forges the
/// whole packet, so the socket never rewrites anything but the source
/// address the kernel fills in when left zero.
pub struct RawSocket {
    socket: Socket,
}

impl RawSocket {
    /// Open a raw socket for the given family and protocol.
    pub fn new(family: Family, protocol: WireProtocol) -> Result<Self> {
        let socket = Socket::new(
            family.domain(),
            Type::RAW,
            Some(protocol.for_family(family)),
        )
        .map_err(|e| Error::from_io(e, "creating raw socket"))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::from_io(e, "setting raw socket non-blocking"))?;
        if family == Family::V4 {
            // The codec forges the IPv4 header itself.
            socket
                .set_header_included_v4(true)
                .map_err(|e| Error::from_io(e, "enabling IP_HDRINCL"))?;
        }
        Ok(Self { socket })
    }

    /// Write one forged datagram toward `dst`.
    ///
    /// Non-blocking; a send that would block is reported as a transient
    /// error for the engine to retry.
    pub fn send_to(&self, packet: &[u8], dst: IpAddr) -> Result<()> {
        let addr = SockAddr::from(SocketAddr::new(dst, 0));
        self.socket
            .send_to(packet, &addr)
            .map_err(|e| Error::from_io(e, "sendto"))?;
        Ok(())
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// What the engine writes probes through.
///
/// The production implementation is [`SocketPool`]; tests substitute a
/// scripted transport so scenarios run without privileges or a network.
pub trait Transport: Send {
    /// Write one forged datagram toward `dst`. A single attempt; the
    /// engine handles the retry policy.
    fn transmit(&mut self, packet: &[u8], dst: IpAddr) -> Result<()>;
}

/// Pool of raw sending endpoints keyed by family and protocol.
///
/// Sockets are created lazily on first lend, cached for the engine's
/// lifetime, and closed when the pool drops. Creation failures surface
/// to the caller; permission errors are fatal to the engine.
pub struct SocketPool {
    sockets: HashMap<(Family, WireProtocol), RawSocket>,
}

impl SocketPool {
    pub fn new() -> Self {
        Self {
            sockets: HashMap::new(),
        }
    }

    /// Borrow the sending endpoint for a family/protocol pair,
    /// creating it on first use.
    pub fn lend(&mut self, family: Family, protocol: WireProtocol) -> Result<&RawSocket> {
        use std::collections::hash_map::Entry;
        match self.sockets.entry((family, protocol)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(RawSocket::new(family, protocol)?)),
        }
    }
}

impl Default for SocketPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SocketPool {
    fn transmit(&mut self, packet: &[u8], dst: IpAddr) -> Result<()> {
        let socket = self.lend(Family::of(dst), WireProtocol::Icmp)?;
        socket.send_to(packet, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_of() {
        assert_eq!(Family::of("10.0.0.1".parse().unwrap()), Family::V4);
        assert_eq!(Family::of("::1".parse().unwrap()), Family::V6);
    }

    #[test]
    fn test_pool_lend_unprivileged() {
        // Without CAP_NET_RAW socket creation fails with EPERM, which
        // must map to the fatal permission error. With privileges the
        // lend succeeds and the socket is cached.
        let mut pool = SocketPool::new();
        match pool.lend(Family::V4, WireProtocol::Icmp) {
            Ok(_) => {
                assert!(pool.sockets.contains_key(&(Family::V4, WireProtocol::Icmp)));
            }
            Err(e) => assert!(e.is_permission_denied()),
        }
    }
}
