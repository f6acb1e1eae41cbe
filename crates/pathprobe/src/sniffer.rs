//! Reply capture.
//!
//! The engine treats the sniffer as an opaque producer: it is started
//! with a [`ReplySink`], pushes every candidate reply it captures, and
//! is stopped on engine shutdown. [`IcmpSniffer`] is the reference
//! implementation; tests push replies through the sink directly.

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use crate::engine::{Error, Reply, ReplySink, Result};

/// A capture source feeding the engine's receive queue.
pub trait Sniffer: Send {
    /// Start capturing; every captured frame that could possibly answer
    /// a probe is pushed into `sink`.
    fn start(&mut self, sink: ReplySink) -> Result<()>;

    /// Stop capturing. Idempotent.
    fn stop(&mut self);
}

/// Raw-socket ICMPv4 capture.
///
/// The coarse filter is the socket itself: a raw `ICMPV4` socket
/// receives every inbound ICMP datagram (IP header included), which is a
/// superset of all possible replies to echo probes. Finer discrimination
/// is the matcher's job.
pub struct IcmpSniffer {
    task: Option<JoinHandle<()>>,
}

impl IcmpSniffer {
    pub fn new() -> Self {
        Self { task: None }
    }
}

impl Default for IcmpSniffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sniffer for IcmpSniffer {
    fn start(&mut self, sink: ReplySink) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }
        let socket = open_capture()?;
        let fd = AsyncFd::new(socket)?;
        self.task = Some(tokio::spawn(capture_loop(fd, sink)));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for IcmpSniffer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Non-blocking raw ICMP receive socket.
fn open_capture() -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
        .map_err(|e| Error::from_io(e, "creating capture socket"))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::from_io(e, "setting capture socket non-blocking"))?;
    Ok(socket)
}

async fn capture_loop(fd: AsyncFd<Socket>, sink: ReplySink) {
    let mut buf = [0u8; 2048];
    loop {
        let mut guard = match fd.ready(Interest::READABLE).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("capture socket failed: {e}");
                return;
            }
        };
        match guard.try_io(|inner| {
            let mut socket = inner.get_ref();
            socket.read(&mut buf)
        }) {
            Ok(Ok(len)) => {
                let bytes = Bytes::copy_from_slice(&buf[..len]);
                let Some(from) = source_address(&bytes) else {
                    continue;
                };
                sink.push(Reply::new(bytes, from, Instant::now()));
            }
            Ok(Err(e)) => {
                warn!("capture read failed: {e}");
            }
            Err(_would_block) => continue,
        }
    }
}

/// Source address of a captured IPv4 datagram.
fn source_address(packet: &[u8]) -> Option<IpAddr> {
    let octets: [u8; 4] = packet.get(12..16)?.try_into().ok()?;
    Some(IpAddr::V4(Ipv4Addr::from(octets)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_address() {
        let mut packet = vec![0x45, 0, 0, 28, 0, 0, 0, 0, 64, 1, 0, 0];
        packet.extend_from_slice(&[192, 0, 2, 7]);
        packet.extend_from_slice(&[10, 0, 0, 1]);
        packet.extend_from_slice(&[0; 8]);
        assert_eq!(
            source_address(&packet),
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)))
        );
        assert_eq!(source_address(&packet[..10]), None);
    }
}
