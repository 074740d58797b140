//! Internet checksum (RFC 1071).
//!
//! Used for the IPv4 header checksum and, together with the TCP
//! pseudo-header, for the TCP segment checksum.

use std::net::Ipv4Addr;

/// IP protocol number for TCP.
pub const PROTO_TCP: u8 = 6;

/// One's-complement accumulator over 16-bit big-endian words.
///
/// Feeding data in several chunks gives the same result as one contiguous
/// slice only when every chunk but the last has even length, which holds for
/// the pseudo-header and the fixed headers.
#[derive(Debug, Default, Clone, Copy)]
pub struct Accumulator {
    sum: u32,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, data: &[u8]) -> &mut Self {
        let mut chunks = data.chunks_exact(2);
        for word in &mut chunks {
            self.sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
            self.fold();
        }
        // Odd trailing byte, padded with a zero byte on the right.
        if let [last] = chunks.remainder() {
            self.sum += u32::from(*last) << 8;
            self.fold();
        }
        self
    }

    /// Folded 16-bit sum before complementing.  `0xFFFF` for data that
    /// already contains a correct checksum.
    pub fn sum(&self) -> u16 {
        let mut sum = self.sum;
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    pub fn checksum(&self) -> u16 {
        !self.sum()
    }

    fn fold(&mut self) {
        while self.sum >> 16 != 0 {
            self.sum = (self.sum & 0xffff) + (self.sum >> 16);
        }
    }
}

/// Checksum of `data`.  Any checksum field inside `data` must be zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    Accumulator::new().add(data).checksum()
}

/// Checksum of a TCP segment (header + payload) prefixed by the IPv4
/// pseudo-header.
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let len = segment.len() as u16;
    Accumulator::new()
        .add(&src.octets())
        .add(&dst.octets())
        .add(&[0, PROTO_TCP])
        .add(&len.to_be_bytes())
        .add(segment)
        .checksum()
}

/// `true` when `segment`'s embedded checksum matches the pseudo-header.
pub fn verify_tcp(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> bool {
    tcp_checksum(src, dst, segment) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1071_worked_example() {
        // RFC 1071 §3: 0001 f203 f4f5 f6f7 sums to ddf2.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(Accumulator::new().add(&data).sum(), 0xddf2);
        assert_eq!(internet_checksum(&data), !0xddf2);
    }

    #[test]
    fn odd_length_is_padded() {
        assert_eq!(internet_checksum(&[0xab]), !0xab00);
    }

    #[test]
    fn embedded_checksum_sums_to_all_ones() {
        let mut data = vec![0x45, 0x00, 0x00, 0x3c, 0x1c, 0x46, 0x40, 0x00, 0x00, 0x00];
        let csum = internet_checksum(&data);
        data[8..10].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(Accumulator::new().add(&data).sum(), 0xffff);
        assert_eq!(internet_checksum(&data), 0);
    }

    #[test]
    fn tcp_checksum_verifies_after_insertion() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut segment = vec![0u8; 20];
        segment[0..2].copy_from_slice(&8100u16.to_be_bytes());
        segment[12] = 5 << 4;
        segment.extend_from_slice(b"odd");
        let csum = tcp_checksum(src, dst, &segment);
        segment[16..18].copy_from_slice(&csum.to_be_bytes());
        assert!(verify_tcp(src, dst, &segment));
        assert!(!verify_tcp(dst, Ipv4Addr::new(10, 0, 0, 3), &segment));
    }
}
