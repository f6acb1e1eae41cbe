//! Probe and reply records.
//!
//! A [`Probe`] is a crafted outbound packet registered with the engine for
//! reply correlation. It is built by an algorithm instance, queued, and
//! becomes read-only once transmitted: the engine stamps the tag and the
//! timestamps at transmit time and after that the record only moves between
//! the in-flight list and the completion event that consumes it.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::engine::instance::InstanceId;
use crate::packet::ProbeFields;

/// Engine-internal probe identity.
///
/// A monotonically increasing 64-bit counter, distinct from whatever
/// identifier is embedded in the probe's wire bytes. Exhaustion of the
/// space is a fatal engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeTag(pub u64);

impl fmt::Display for ProbeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A crafted outbound packet awaiting transmission or a reply.
#[derive(Debug)]
pub struct Probe {
    /// Engine tag, assigned at transmit time.
    tag: Option<ProbeTag>,
    /// Typed header fields, used for fingerprint matching.
    fields: ProbeFields,
    /// The forged wire bytes (full IP packet).
    packet: Bytes,
    /// Destination endpoint.
    dst: IpAddr,
    /// Originating algorithm instance. Weak by construction: the
    /// instance may terminate before the reply arrives, in which case
    /// the completion event is dropped.
    origin: InstanceId,
    /// Stamped when the packet is written to the wire.
    sent_at: Option<Instant>,
    /// `sent_at` plus the engine-wide timeout.
    deadline: Option<Instant>,
}

impl Probe {
    /// Create a pending probe from forged bytes and their field summary.
    pub fn new(fields: ProbeFields, packet: Bytes, dst: IpAddr, origin: InstanceId) -> Self {
        Self {
            tag: None,
            fields,
            packet,
            dst,
            origin,
            sent_at: None,
            deadline: None,
        }
    }

    /// Engine tag, present once the probe has been transmitted.
    pub fn tag(&self) -> Option<ProbeTag> {
        self.tag
    }

    /// Typed field summary of the forged packet.
    pub fn fields(&self) -> &ProbeFields {
        &self.fields
    }

    /// The forged wire bytes.
    pub fn packet(&self) -> &Bytes {
        &self.packet
    }

    /// Destination endpoint.
    pub fn dst(&self) -> IpAddr {
        self.dst
    }

    /// Originating instance.
    pub fn origin(&self) -> InstanceId {
        self.origin
    }

    /// Transmission timestamp.
    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    /// Timeout deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Round-trip time against a captured reply.
    pub fn rtt(&self, reply: &Reply) -> Option<Duration> {
        self.sent_at
            .map(|sent| reply.received_at.saturating_duration_since(sent))
    }

    /// Stamp the probe as transmitted. Called exactly once by the engine.
    pub(crate) fn mark_sent(&mut self, tag: ProbeTag, sent_at: Instant, deadline: Instant) {
        debug_assert!(self.tag.is_none(), "probe transmitted twice");
        self.tag = Some(tag);
        self.sent_at = Some(sent_at);
        self.deadline = Some(deadline);
    }
}

/// A captured inbound packet that may match an in-flight probe.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Captured network-layer bytes (IP header included).
    bytes: Bytes,
    /// Source address, as parsed by the sniffer.
    from: IpAddr,
    /// Capture timestamp.
    received_at: Instant,
}

impl Reply {
    /// Create a reply record from captured bytes.
    pub fn new(bytes: Bytes, from: IpAddr, received_at: Instant) -> Self {
        Self {
            bytes,
            from,
            received_at,
        }
    }

    /// Captured bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Source address of the captured packet.
    pub fn from(&self) -> IpAddr {
        self.from
    }

    /// Capture timestamp.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn fields() -> ProbeFields {
        ProbeFields {
            dst: Ipv4Addr::new(10, 0, 0, 5),
            ttl: 1,
            identifier: 7,
            sequence: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_sent_stamps_once() {
        let dst = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let mut probe = Probe::new(fields(), Bytes::from_static(b"xx"), dst, InstanceId(1));
        assert!(probe.tag().is_none());
        assert!(probe.sent_at().is_none());

        let now = Instant::now();
        probe.mark_sent(ProbeTag(42), now, now + Duration::from_secs(3));
        assert_eq!(probe.tag(), Some(ProbeTag(42)));
        assert_eq!(probe.deadline(), Some(now + Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt() {
        let dst = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let mut probe = Probe::new(fields(), Bytes::from_static(b"xx"), dst, InstanceId(1));
        let sent = Instant::now();
        probe.mark_sent(ProbeTag(1), sent, sent + Duration::from_secs(3));

        tokio::time::advance(Duration::from_millis(12)).await;
        let reply = Reply::new(Bytes::new(), dst, Instant::now());
        assert_eq!(probe.rtt(&reply), Some(Duration::from_millis(12)));
    }
}
