//! IPv4 header (RFC 791), fixed 20-byte form.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version|  IHL  |Type of Service|          Total Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Identification        |Flags|      Fragment Offset    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Time to Live |    Protocol   |         Header Checksum       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Source Address                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Destination Address                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Fields are kept in host order; [`IpHeader::encode`] and
//! [`IpHeader::decode`] do the conversion.  Options (IHL > 5) are skipped on
//! decode and never emitted.

use std::fmt;
use std::net::Ipv4Addr;

use crate::checksum::{internet_checksum, Accumulator, PROTO_TCP};
use crate::packet::PacketError;

/// Length of an option-less IPv4 header.
pub const IP_HEADER_LEN: usize = 20;

const OFF_VER_IHL: usize = 0;
const OFF_TOS: usize = 1;
const OFF_TOTAL_LEN: usize = 2;
const OFF_ID: usize = 4;
const OFF_FRAG: usize = 6;
const OFF_TTL: usize = 8;
const OFF_PROTO: usize = 9;
const OFF_CHECKSUM: usize = 10;
const OFF_SRC: usize = 12;
const OFF_DST: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpHeader {
    pub version: u8,
    /// Header length in 32-bit words.
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    /// Flags (top 3 bits) and fragment offset.
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Default for IpHeader {
    fn default() -> Self {
        Self {
            version: 4,
            ihl: (IP_HEADER_LEN / 4) as u8,
            tos: 0,
            total_length: IP_HEADER_LEN as u16,
            identification: 0,
            flags_fragment: 0x4000, // DF
            ttl: 64,
            protocol: PROTO_TCP,
            checksum: 0,
            source: Ipv4Addr::UNSPECIFIED,
            destination: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl IpHeader {
    /// Header for a TCP datagram from `source` to `destination` carrying
    /// `segment_len` bytes of TCP header and payload.
    pub fn for_segment(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        segment_len: usize,
        ttl: u8,
    ) -> Self {
        Self {
            total_length: (IP_HEADER_LEN + segment_len) as u16,
            ttl,
            source,
            destination,
            ..Self::default()
        }
    }

    /// Header length in bytes as declared by the IHL field.
    pub fn header_len(&self) -> usize {
        usize::from(self.ihl) * 4
    }

    /// Encode into network order, writing `self.checksum` verbatim.
    pub fn encode(&self) -> [u8; IP_HEADER_LEN] {
        let mut buf = [0u8; IP_HEADER_LEN];
        buf[OFF_VER_IHL] = (self.version << 4) | (self.ihl & 0x0f);
        buf[OFF_TOS] = self.tos;
        buf[OFF_TOTAL_LEN..OFF_TOTAL_LEN + 2].copy_from_slice(&self.total_length.to_be_bytes());
        buf[OFF_ID..OFF_ID + 2].copy_from_slice(&self.identification.to_be_bytes());
        buf[OFF_FRAG..OFF_FRAG + 2].copy_from_slice(&self.flags_fragment.to_be_bytes());
        buf[OFF_TTL] = self.ttl;
        buf[OFF_PROTO] = self.protocol;
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&self.checksum.to_be_bytes());
        buf[OFF_SRC..OFF_SRC + 4].copy_from_slice(&self.source.octets());
        buf[OFF_DST..OFF_DST + 4].copy_from_slice(&self.destination.octets());
        buf
    }

    /// Recompute the header checksum over the encoded header with the
    /// checksum field zeroed, and store it.
    pub fn fill_checksum(&mut self) {
        self.checksum = 0;
        self.checksum = internet_checksum(&self.encode());
    }

    /// Encode with a freshly computed checksum.
    pub fn encode_checked(&mut self) -> [u8; IP_HEADER_LEN] {
        self.fill_checksum();
        self.encode()
    }

    /// Parse the first [`IP_HEADER_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < IP_HEADER_LEN {
            return Err(PacketError::TooShort {
                needed: IP_HEADER_LEN,
                got: buf.len(),
            });
        }
        let header = Self {
            version: buf[OFF_VER_IHL] >> 4,
            ihl: buf[OFF_VER_IHL] & 0x0f,
            tos: buf[OFF_TOS],
            total_length: be16(buf, OFF_TOTAL_LEN),
            identification: be16(buf, OFF_ID),
            flags_fragment: be16(buf, OFF_FRAG),
            ttl: buf[OFF_TTL],
            protocol: buf[OFF_PROTO],
            checksum: be16(buf, OFF_CHECKSUM),
            source: Ipv4Addr::from(be32(buf, OFF_SRC)),
            destination: Ipv4Addr::from(be32(buf, OFF_DST)),
        };
        if header.version != 4 {
            return Err(PacketError::NotIpv4(header.version));
        }
        if header.header_len() < IP_HEADER_LEN {
            return Err(PacketError::BadHeaderLength(header.header_len()));
        }
        Ok(header)
    }

    /// `true` when the sum over the raw header bytes, checksum included,
    /// folds to all ones.
    pub fn verify(raw: &[u8]) -> bool {
        raw.len() >= IP_HEADER_LEN && Accumulator::new().add(raw).sum() == 0xffff
    }
}

pub(crate) fn be16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn be32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

impl fmt::Display for IpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "IPv4 Header")?;
        writeln!(f, "  Version: {}", self.version)?;
        writeln!(f, "  Header Length: {} bytes", self.header_len())?;
        writeln!(f, "  Type of Service: {:#04x}", self.tos)?;
        writeln!(f, "  Total Length: {} bytes", self.total_length)?;
        writeln!(f, "  Identification: {:#06x}", self.identification)?;
        writeln!(f, "  Flags and Fragment Offset: {:#06x}", self.flags_fragment)?;
        writeln!(f, "  Time to Live: {}", self.ttl)?;
        writeln!(f, "  Protocol: {}", self.protocol)?;
        writeln!(f, "  Header Checksum: {:#06x}", self.checksum)?;
        writeln!(f, "  Source Address: {}", self.source)?;
        write!(f, "  Destination Address: {}", self.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IpHeader {
        IpHeader {
            version: 4,
            ihl: 5,
            tos: 0x10,
            total_length: 1500,
            identification: 0xbeef,
            flags_fragment: 0x4000,
            ttl: 17,
            protocol: PROTO_TCP,
            checksum: 0x1234,
            source: Ipv4Addr::new(192, 168, 1, 20),
            destination: Ipv4Addr::new(10, 126, 0, 2),
        }
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let header = sample();
        assert_eq!(IpHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn multi_byte_fields_are_big_endian() {
        let bytes = sample().encode();
        assert_eq!(bytes[0], 0x45);
        assert_eq!(&bytes[2..4], &1500u16.to_be_bytes());
        assert_eq!(&bytes[12..16], &[192, 168, 1, 20]);
    }

    #[test]
    fn computed_checksum_resums_to_all_ones() {
        let mut header = sample();
        let bytes = header.encode_checked();
        assert!(IpHeader::verify(&bytes));
        assert_eq!(Accumulator::new().add(&bytes).sum(), 0xffff);
    }

    #[test]
    fn corrupted_header_fails_verification() {
        let mut bytes = sample().encode_checked();
        bytes[8] ^= 0x01;
        assert!(!IpHeader::verify(&bytes));
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(matches!(
            IpHeader::decode(&[0x45; 19]),
            Err(PacketError::TooShort { needed: 20, got: 19 })
        ));
    }

    #[test]
    fn non_ipv4_version_is_rejected() {
        let mut bytes = sample().encode();
        bytes[0] = 0x65;
        assert_eq!(IpHeader::decode(&bytes), Err(PacketError::NotIpv4(6)));
    }
}
