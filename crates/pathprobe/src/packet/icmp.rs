//! ICMPv4 echo codec.
//!
//! Forges full IPv4+ICMP echo-request frames (the sending socket runs
//! with the header included) and recovers the echoed identifier/sequence
//! pair from echo replies and from the quoted original packet inside
//! time-exceeded and destination-unreachable errors.

use std::net::IpAddr;

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{Fingerprint, PacketCodec, ProbeFields};
use crate::engine::{Error, Reply, Result};

/// ICMP message types this codec understands.
const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_TIME_EXCEEDED: u8 = 11;

/// IP protocol number for ICMP.
const IPPROTO_ICMP: u8 = 1;

/// Fixed echo payload appended after the ICMP header.
const PAYLOAD_LEN: usize = 8;

/// IPv4 header without options (mirrors struct iphdr).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct Ipv4Header {
    /// Version (4) in the high nibble, header length in 32-bit words in
    /// the low nibble.
    version_ihl: u8,
    tos: u8,
    total_len: U16,
    identification: U16,
    flags_fragment: U16,
    ttl: u8,
    protocol: u8,
    checksum: U16,
    src: [u8; 4],
    dst: [u8; 4],
}

/// Size of an option-less IPv4 header.
const IPV4_HDRLEN: usize = std::mem::size_of::<Ipv4Header>();

impl Ipv4Header {
    /// Header length in bytes, honoring options.
    fn header_len(&self) -> usize {
        usize::from(self.version_ihl & 0x0f) * 4
    }

    fn is_icmp(&self) -> bool {
        self.protocol == IPPROTO_ICMP
    }
}

/// ICMP header in its echo layout (mirrors struct icmphdr).
///
/// For non-echo messages the identifier/sequence words are the unused
/// part of the header and are ignored.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct IcmpHeader {
    kind: u8,
    code: u8,
    checksum: U16,
    identifier: U16,
    sequence: U16,
}

/// Size of the ICMP header.
const ICMP_HDRLEN: usize = std::mem::size_of::<IcmpHeader>();

/// RFC 1071 internet checksum.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Reference ICMPv4 echo codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct IcmpCodec;

impl IcmpCodec {
    pub fn new() -> Self {
        Self
    }

    /// Parse the outer IP header and return the ICMP portion.
    fn icmp_part<'a>(&self, packet: &'a [u8]) -> Option<(&'a Ipv4Header, &'a [u8])> {
        let (ip, _) = Ipv4Header::ref_from_prefix(packet).ok()?;
        if !ip.is_icmp() {
            return None;
        }
        let hdr_len = ip.header_len();
        if hdr_len < IPV4_HDRLEN || packet.len() < hdr_len + ICMP_HDRLEN {
            return None;
        }
        Some((ip, &packet[hdr_len..]))
    }

    /// Fingerprint of the echo request quoted inside an ICMP error.
    fn quoted_fingerprint(&self, quoted: &[u8]) -> Option<Fingerprint> {
        let (inner_ip, _) = Ipv4Header::ref_from_prefix(quoted).ok()?;
        if !inner_ip.is_icmp() {
            return None;
        }
        let inner = quoted.get(inner_ip.header_len()..)?;
        let (echo, _) = IcmpHeader::ref_from_prefix(inner).ok()?;
        if echo.kind != ICMP_ECHO_REQUEST {
            return None;
        }
        Some(Fingerprint {
            identifier: echo.identifier.get(),
            sequence: echo.sequence.get(),
        })
    }
}

impl PacketCodec for IcmpCodec {
    fn forge(&self, fields: &ProbeFields) -> Result<Bytes> {
        if fields.ttl == 0 {
            return Err(Error::MalformedPacket("ttl must be non-zero".into()));
        }
        let total_len = IPV4_HDRLEN + ICMP_HDRLEN + PAYLOAD_LEN;

        let mut icmp = IcmpHeader {
            kind: ICMP_ECHO_REQUEST,
            code: 0,
            checksum: U16::new(0),
            identifier: U16::new(fields.identifier),
            sequence: U16::new(fields.sequence),
        };
        let payload = [0u8; PAYLOAD_LEN];
        let mut sum_input = Vec::with_capacity(ICMP_HDRLEN + PAYLOAD_LEN);
        sum_input.extend_from_slice(icmp.as_bytes());
        sum_input.extend_from_slice(&payload);
        icmp.checksum = U16::new(internet_checksum(&sum_input));

        let mut ip = Ipv4Header {
            version_ihl: 0x45,
            tos: 0,
            total_len: U16::new(total_len as u16),
            identification: U16::new(fields.identifier),
            flags_fragment: U16::new(0),
            ttl: fields.ttl,
            protocol: IPPROTO_ICMP,
            checksum: U16::new(0),
            // Source left zero: the kernel fills it in for raw sockets
            // with the header included.
            src: [0; 4],
            dst: fields.dst.octets(),
        };
        ip.checksum = U16::new(internet_checksum(ip.as_bytes()));

        let mut buf = BytesMut::with_capacity(total_len);
        buf.put_slice(ip.as_bytes());
        buf.put_slice(icmp.as_bytes());
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    fn fingerprint(&self, fields: &ProbeFields) -> Fingerprint {
        Fingerprint {
            identifier: fields.identifier,
            sequence: fields.sequence,
        }
    }

    fn reply_fingerprint(&self, reply: &Reply) -> Option<Fingerprint> {
        let (_, icmp_bytes) = self.icmp_part(reply.bytes())?;
        let (icmp, rest) = IcmpHeader::ref_from_prefix(icmp_bytes).ok()?;
        match icmp.kind {
            ICMP_ECHO_REPLY => Some(Fingerprint {
                identifier: icmp.identifier.get(),
                sequence: icmp.sequence.get(),
            }),
            ICMP_TIME_EXCEEDED | ICMP_DEST_UNREACHABLE => self.quoted_fingerprint(rest),
            _ => None,
        }
    }

    fn source_address(&self, reply: &Reply) -> Option<IpAddr> {
        let (ip, _) = Ipv4Header::ref_from_prefix(reply.bytes().as_ref()).ok()?;
        Some(IpAddr::V4(ip.src.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::time::Instant;

    fn fields() -> ProbeFields {
        ProbeFields {
            dst: Ipv4Addr::new(10, 0, 0, 5),
            ttl: 3,
            identifier: 0x4242,
            sequence: 7,
        }
    }

    fn reply_from(bytes: Vec<u8>, from: Ipv4Addr) -> Reply {
        Reply::new(Bytes::from(bytes), IpAddr::V4(from), Instant::now())
    }

    /// Wrap a forged request in a time-exceeded error the way an
    /// intermediate router would: outer IP, ICMP type 11, then the
    /// quoted original IP header + 8 bytes (or more) of its payload.
    fn time_exceeded(original: &[u8], router: Ipv4Addr) -> Vec<u8> {
        let quoted = &original[..(IPV4_HDRLEN + ICMP_HDRLEN).min(original.len())];
        let mut icmp = vec![ICMP_TIME_EXCEEDED, 0, 0, 0, 0, 0, 0, 0];
        icmp.extend_from_slice(quoted);
        let sum = internet_checksum(&icmp);
        icmp[2..4].copy_from_slice(&sum.to_be_bytes());

        let total = IPV4_HDRLEN + icmp.len();
        let mut ip = vec![
            0x45,
            0,
            (total >> 8) as u8,
            total as u8,
            0,
            0,
            0,
            0,
            64,
            IPPROTO_ICMP,
            0,
            0,
        ];
        ip.extend_from_slice(&router.octets());
        ip.extend_from_slice(&[10, 0, 0, 99]);
        let sum = internet_checksum(&ip);
        ip[10..12].copy_from_slice(&sum.to_be_bytes());
        ip.extend_from_slice(&icmp);
        ip
    }

    #[test]
    fn test_forge_shape_and_checksums() {
        let codec = IcmpCodec::new();
        let packet = codec.forge(&fields()).unwrap();
        assert_eq!(packet.len(), IPV4_HDRLEN + ICMP_HDRLEN + PAYLOAD_LEN);

        let (ip, _) = Ipv4Header::ref_from_prefix(packet.as_ref()).unwrap();
        assert_eq!(ip.version_ihl, 0x45);
        assert_eq!(ip.ttl, 3);
        assert_eq!(ip.protocol, IPPROTO_ICMP);
        assert_eq!(ip.dst, [10, 0, 0, 5]);
        // A valid header sums to zero.
        assert_eq!(internet_checksum(&packet[..IPV4_HDRLEN]), 0);
        assert_eq!(internet_checksum(&packet[IPV4_HDRLEN..]), 0);
    }

    #[test]
    fn test_forge_rejects_zero_ttl() {
        let codec = IcmpCodec::new();
        let mut f = fields();
        f.ttl = 0;
        assert!(codec.forge(&f).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_exceeded_fingerprint() {
        let codec = IcmpCodec::new();
        let request = codec.forge(&fields()).unwrap();
        let router = Ipv4Addr::new(192, 0, 2, 1);
        let reply = reply_from(time_exceeded(&request, router), router);

        assert_eq!(
            codec.reply_fingerprint(&reply),
            Some(Fingerprint {
                identifier: 0x4242,
                sequence: 7,
            })
        );
        assert_eq!(codec.source_address(&reply), Some(IpAddr::V4(router)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_reply_fingerprint() {
        let codec = IcmpCodec::new();
        // An echo reply mirrors the request with type 0.
        let mut bytes = codec.forge(&fields()).unwrap().to_vec();
        bytes[IPV4_HDRLEN] = ICMP_ECHO_REPLY;
        bytes[..4].copy_from_slice(&[0x45, 0, 0, 36]);
        let target = fields().dst;
        bytes[12..16].copy_from_slice(&target.octets());

        let reply = reply_from(bytes, target);
        let got = codec.reply_fingerprint(&reply).unwrap();
        assert_eq!(got.identifier, 0x4242);
        assert_eq!(got.sequence, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_and_foreign_replies_ignored() {
        let codec = IcmpCodec::new();

        // Too short for an IP header.
        let reply = reply_from(vec![0x45, 0, 0], Ipv4Addr::LOCALHOST);
        assert_eq!(codec.reply_fingerprint(&reply), None);

        // Valid IP header but a non-ICMP protocol.
        let mut tcp = vec![0x45, 0, 0, 40, 0, 0, 0, 0, 64, 6, 0, 0];
        tcp.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        tcp.extend_from_slice(&[0; 20]);
        let reply = reply_from(tcp, Ipv4Addr::LOCALHOST);
        assert_eq!(codec.reply_fingerprint(&reply), None);

        // ICMP error quoting a non-echo packet.
        let mut quoted = vec![0x45, 0, 0, 28, 0, 0, 0, 0, 64, 6, 0, 0];
        quoted.extend_from_slice(&[0; 8]);
        let wrapped = time_exceeded_like(&quoted);
        let reply = reply_from(wrapped, Ipv4Addr::LOCALHOST);
        assert_eq!(codec.reply_fingerprint(&reply), None);
    }

    fn time_exceeded_like(quoted: &[u8]) -> Vec<u8> {
        let mut icmp = vec![ICMP_TIME_EXCEEDED, 0, 0, 0, 0, 0, 0, 0];
        icmp.extend_from_slice(quoted);
        let total = IPV4_HDRLEN + icmp.len();
        let mut ip = vec![
            0x45,
            0,
            (total >> 8) as u8,
            total as u8,
            0,
            0,
            0,
            0,
            64,
            IPPROTO_ICMP,
            0,
            0,
        ];
        ip.extend_from_slice(&[192, 0, 2, 9]);
        ip.extend_from_slice(&[10, 0, 0, 99]);
        ip.extend_from_slice(&icmp);
        ip
    }
}
