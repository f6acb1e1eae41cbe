//! Packet forging and reply matching.
//!
//! The engine never parses wire bytes itself; it consumes this interface.
//! A codec forges probe packets from a typed field summary and extracts
//! the echoed [`Fingerprint`] from captured replies, which is all the
//! engine needs to correlate a reply with an in-flight probe.

mod icmp;

pub use icmp::IcmpCodec;

use std::net::{IpAddr, Ipv4Addr};

use bytes::Bytes;

use crate::engine::{Probe, Reply, Result};

/// Typed header fields a probe is forged from.
///
/// This is the mutable face of a probe: algorithms fill it in, the codec
/// turns it into wire bytes, and the matching fingerprint is derived from
/// it. Distinct from the engine tag, which never appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeFields {
    /// Destination address.
    pub dst: Ipv4Addr,
    /// Time-to-live for the outer IP header.
    pub ttl: u8,
    /// Echo identifier; one per instance in practice.
    pub identifier: u16,
    /// Echo sequence number; incremented per probe.
    pub sequence: u16,
}

/// The field subset that must echo in a reply for it to match a probe.
///
/// For ICMP echo probes this is the identifier/sequence pair, returned
/// verbatim in echo replies and inside the quoted packet of time-exceeded
/// and destination-unreachable errors (the RFC 792 discipline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub identifier: u16,
    pub sequence: u16,
}

/// Packet layer consumed by the engine.
pub trait PacketCodec: Send + Sync {
    /// Forge the full wire bytes (IP header included) for a probe.
    fn forge(&self, fields: &ProbeFields) -> Result<Bytes>;

    /// The fingerprint a reply must echo to match these fields.
    fn fingerprint(&self, fields: &ProbeFields) -> Fingerprint;

    /// Extract the echoed fingerprint from a captured reply, if the
    /// reply is of a shape that could match a probe at all.
    fn reply_fingerprint(&self, reply: &Reply) -> Option<Fingerprint>;

    /// Source address of a captured reply.
    fn source_address(&self, reply: &Reply) -> Option<IpAddr>;

    /// Whether `reply` answers `probe`. Fingerprint equality.
    fn matches(&self, probe: &Probe, reply: &Reply) -> bool {
        self.reply_fingerprint(reply) == Some(self.fingerprint(probe.fields()))
    }
}
