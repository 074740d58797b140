//! IP datagrams carrying one TCP segment.
//!
//! A [`Packet`] is what crosses the [`crate::channel::Channel`] boundary:
//! - inbound, the channel yields full IP datagrams and
//!   [`Packet::deserialise`] splits them into headers and payload;
//! - outbound, [`Packet::serialise`] produces the TCP segment (and
//!   optionally the IP header, when the channel expects the caller to supply
//!   it).
//!
//! No I/O happens here.
//!
//! # Layout
//!
//! ```text
//! +-----------------+------------------+-------------------------+
//! | IP header (20)  | TCP header (20)  | payload                 |
//! +-----------------+------------------+-------------------------+
//! |<------------------ ip.total_length ------------------------->|
//! ```

use std::fmt;

use thiserror::Error;

use crate::checksum::{tcp_checksum, verify_tcp};
use crate::ip_header::{IpHeader, IP_HEADER_LEN};
use crate::tcp_header::{TcpHeader, OFF_CHECKSUM, TCP_HEADER_LEN};

/// Size of the IP and TCP fixed headers together.
pub const COMBINED_HEADER_LEN: usize = IP_HEADER_LEN + TCP_HEADER_LEN;

/// Errors that can arise when parsing a raw datagram.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer too short: need {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },
    #[error("declared length {declared} does not match IP total length {total}")]
    LengthMismatch { declared: usize, total: usize },
    #[error("not an IPv4 datagram (version {0})")]
    NotIpv4(u8),
    #[error("invalid header length {0}")]
    BadHeaderLength(usize),
}

/// One IP header, one TCP header and the segment payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub ip: IpHeader,
    pub tcp: TcpHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Parse a packet from the first `declared_len` bytes of `buf`.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than both fixed headers,
    /// - the IP total length disagrees with `declared_len`, or
    /// - `declared_len` runs past the end of `buf`.
    ///
    /// Checksums are not verified here; see [`Packet::checksums_valid`].
    pub fn deserialise(buf: &[u8], declared_len: usize) -> Result<Self, PacketError> {
        if buf.len() < COMBINED_HEADER_LEN {
            return Err(PacketError::TooShort {
                needed: COMBINED_HEADER_LEN,
                got: buf.len(),
            });
        }

        let ip = IpHeader::decode(buf)?;
        let total = usize::from(ip.total_length);
        if total != declared_len {
            return Err(PacketError::LengthMismatch {
                declared: declared_len,
                total,
            });
        }
        if total > buf.len() {
            return Err(PacketError::TooShort {
                needed: total,
                got: buf.len(),
            });
        }

        let tcp_start = ip.header_len();
        let tcp = TcpHeader::decode(buf.get(tcp_start..total).unwrap_or_default())?;
        let payload_start = tcp_start + tcp.header_len();
        if payload_start > total {
            return Err(PacketError::BadHeaderLength(tcp.header_len()));
        }

        Ok(Self {
            ip,
            tcp,
            payload: buf[payload_start..total].to_vec(),
        })
    }

    /// Verify the IP header checksum and the TCP checksum of the datagram
    /// `raw` that this packet was parsed from.
    pub fn checksums_valid(&self, raw: &[u8]) -> bool {
        let ip_len = self.ip.header_len();
        let total = usize::from(self.ip.total_length);
        if raw.len() < total || total < ip_len {
            return false;
        }
        IpHeader::verify(&raw[..ip_len])
            && verify_tcp(self.ip.source, self.ip.destination, &raw[ip_len..total])
    }

    /// Serialise the TCP segment (header, then payload), with the TCP
    /// checksum computed over the pseudo-header built from `self.ip`.
    ///
    /// When `include_ip_header` is set the IP header is prepended with its
    /// total length and checksum filled in.
    pub fn serialise(&mut self, include_ip_header: bool) -> Vec<u8> {
        let segment_len = TCP_HEADER_LEN + self.payload.len();
        self.tcp.data_offset = (TCP_HEADER_LEN / 4) as u8;
        self.tcp.checksum = 0;

        let mut segment = Vec::with_capacity(segment_len);
        segment.extend_from_slice(&self.tcp.encode());
        segment.extend_from_slice(&self.payload);

        let csum = tcp_checksum(self.ip.source, self.ip.destination, &segment);
        segment[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());
        self.tcp.checksum = csum;

        if !include_ip_header {
            return segment;
        }

        self.ip.ihl = (IP_HEADER_LEN / 4) as u8;
        self.ip.total_length = (IP_HEADER_LEN + segment_len) as u16;
        let mut buf = Vec::with_capacity(IP_HEADER_LEN + segment_len);
        buf.extend_from_slice(&self.ip.encode_checked());
        buf.extend_from_slice(&segment);
        buf
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.ip)?;
        writeln!(f, "{}", self.tcp)?;
        if !self.payload.is_empty() {
            writeln!(f, "Payload ({} bytes)", self.payload.len())?;
            write!(f, "  {}", String::from_utf8_lossy(&self.payload))?;
        }
        Ok(())
    }
}
