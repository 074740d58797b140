//! TCP header (RFC 9293 §3.1), fixed 20-byte form.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Data |       |C|E|U|A|P|R|S|F|                               |
//! | Offset| Rsrvd |W|C|R|C|S|S|Y|I|            Window             |
//! |       |       |R|E|G|K|H|T|N|N|                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |         Urgent Pointer        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::fmt;

use crate::ip_header::{be16, be32};
use crate::packet::PacketError;

/// Bit-flag constants for the control byte.
pub mod flags {
    /// No more data from sender.
    pub const FIN: u8 = 0b0000_0001;
    /// Synchronise sequence numbers.
    pub const SYN: u8 = 0b0000_0010;
    /// Reset the connection.
    pub const RST: u8 = 0b0000_0100;
    /// Push function.
    pub const PSH: u8 = 0b0000_1000;
    /// Acknowledgment field is significant.
    pub const ACK: u8 = 0b0001_0000;
    /// Urgent pointer field is significant.
    pub const URG: u8 = 0b0010_0000;
}

/// Length of an option-less TCP header.
pub const TCP_HEADER_LEN: usize = 20;

const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_DOFF: usize = 12;
const OFF_FLAGS: usize = 13;
const OFF_WINDOW: usize = 14;
pub(crate) const OFF_CHECKSUM: usize = 16;
const OFF_URG_PTR: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in 32-bit words.
    pub data_offset: u8,
    /// Bitmask of [`flags`] constants.  The two high bits (CWR/ECE) are
    /// carried through but never interpreted.
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl Default for TcpHeader {
    fn default() -> Self {
        Self {
            source_port: 0,
            destination_port: 0,
            seq: 0,
            ack: 0,
            data_offset: (TCP_HEADER_LEN / 4) as u8,
            flags: 0,
            window: 0,
            checksum: 0,
            urgent_ptr: 0,
        }
    }
}

impl TcpHeader {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    pub fn syn(&self) -> bool {
        self.has(flags::SYN)
    }

    pub fn ack_set(&self) -> bool {
        self.has(flags::ACK)
    }

    pub fn rst(&self) -> bool {
        self.has(flags::RST)
    }

    pub fn fin(&self) -> bool {
        self.has(flags::FIN)
    }

    /// Header length in bytes as declared by the data offset.
    pub fn header_len(&self) -> usize {
        usize::from(self.data_offset) * 4
    }

    /// Encode into network order, writing `self.checksum` verbatim.
    pub fn encode(&self) -> [u8; TCP_HEADER_LEN] {
        let mut buf = [0u8; TCP_HEADER_LEN];
        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&self.source_port.to_be_bytes());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&self.destination_port.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        buf[OFF_DOFF] = self.data_offset << 4;
        buf[OFF_FLAGS] = self.flags;
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&self.window.to_be_bytes());
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&self.checksum.to_be_bytes());
        buf[OFF_URG_PTR..OFF_URG_PTR + 2].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        buf
    }

    /// Parse the fixed part of a TCP header from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < TCP_HEADER_LEN {
            return Err(PacketError::TooShort {
                needed: TCP_HEADER_LEN,
                got: buf.len(),
            });
        }
        let header = Self {
            source_port: be16(buf, OFF_SRC_PORT),
            destination_port: be16(buf, OFF_DST_PORT),
            seq: be32(buf, OFF_SEQ),
            ack: be32(buf, OFF_ACK),
            data_offset: buf[OFF_DOFF] >> 4,
            flags: buf[OFF_FLAGS],
            window: be16(buf, OFF_WINDOW),
            checksum: be16(buf, OFF_CHECKSUM),
            urgent_ptr: be16(buf, OFF_URG_PTR),
        };
        if header.header_len() < TCP_HEADER_LEN {
            return Err(PacketError::BadHeaderLength(header.header_len()));
        }
        Ok(header)
    }
}

impl fmt::Display for TcpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TCP Header")?;
        writeln!(f, "  Source Port: {}", self.source_port)?;
        writeln!(f, "  Destination Port: {}", self.destination_port)?;
        writeln!(f, "  Sequence Number: {}", self.seq)?;
        writeln!(f, "  Acknowledgment Number: {}", self.ack)?;
        writeln!(f, "  Data Offset: {} (words)", self.data_offset)?;
        let names = [
            (flags::FIN, "FIN"),
            (flags::SYN, "SYN"),
            (flags::RST, "RST"),
            (flags::PSH, "PSH"),
            (flags::ACK, "ACK"),
            (flags::URG, "URG"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.has(*bit))
            .map(|(_, name)| *name)
            .collect();
        writeln!(f, "  Flags: [{}]", set.join(", "))?;
        writeln!(f, "  Window Size: {}", self.window)?;
        writeln!(f, "  Checksum: {:#06x}", self.checksum)?;
        write!(f, "  Urgent Pointer: {}", self.urgent_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TcpHeader {
        TcpHeader {
            source_port: 8100,
            destination_port: 8101,
            seq: 0xdead_beef,
            ack: 0x0102_0304,
            data_offset: 5,
            flags: flags::SYN | flags::ACK,
            window: 5840,
            checksum: 0xabcd,
            urgent_ptr: 7,
        }
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let header = sample();
        assert_eq!(TcpHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn every_flag_survives_the_wire() {
        for flag in [flags::FIN, flags::SYN, flags::RST, flags::PSH, flags::ACK, flags::URG] {
            let header = TcpHeader {
                flags: flag,
                ..sample()
            };
            let decoded = TcpHeader::decode(&header.encode()).unwrap();
            assert!(decoded.has(flag));
            assert_eq!(decoded.flags, flag);
        }
    }

    #[test]
    fn flag_bits_sit_at_rfc_positions() {
        let header = TcpHeader {
            flags: flags::SYN | flags::ACK,
            ..sample()
        };
        let bytes = header.encode();
        assert_eq!(bytes[13], 0x12);
        assert_eq!(bytes[12], 0x50);
    }

    #[test]
    fn seq_ack_big_endian_on_wire() {
        let bytes = sample().encode();
        assert_eq!(&bytes[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&bytes[8..12], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn data_offset_below_five_is_rejected() {
        let mut bytes = sample().encode();
        bytes[12] = 4 << 4;
        assert_eq!(TcpHeader::decode(&bytes), Err(PacketError::BadHeaderLength(16)));
    }

    #[test]
    fn display_lists_set_flags() {
        let text = sample().to_string();
        assert!(text.contains("Flags: [SYN, ACK]"));
    }
}
