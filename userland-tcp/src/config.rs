//! Tunable connection parameters.
//!
//! [`Config`] is built with [`Default`] in library code and tests, and from
//! command-line flags in `main.rs`.

use std::time::Duration;

/// RFC 1122 §4.2.2.6: default send MSS when no MSS option is received.
pub const DEFAULT_MSS: usize = 536;

/// RFC 9293 suggests an MSL of two minutes; TIME-WAIT lasts 2×MSL.
pub const DEFAULT_MSL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the send ring buffer in bytes.
    pub send_buffer: usize,
    /// Capacity of the receive ring buffer in bytes.  Also the initial
    /// advertised window (clamped to 65535).
    pub recv_buffer: usize,
    /// Largest payload placed in one outbound segment.
    pub mss: usize,
    /// TTL for IP headers this crate builds itself.
    pub ttl: u8,
    /// How long TIME-WAIT lingers before the connection is released.
    pub time_wait: Duration,
    /// Hand full IP datagrams (IP_HDRINCL) to the channel instead of letting
    /// the kernel build the IP header.
    pub include_ip_header: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            send_buffer: 64 * 1024,
            recv_buffer: 64 * 1024,
            mss: DEFAULT_MSS,
            ttl: 64,
            time_wait: DEFAULT_MSL * 2,
            include_ip_header: false,
        }
    }
}
