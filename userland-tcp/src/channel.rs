//! Duplex datagram channel between the engine and the network.
//!
//! The engine only ever talks to a [`Channel`]: it receives whole IPv4
//! datagrams (IP header, TCP header, payload) and sends TCP segments to a
//! destination address, optionally with an IP header already in front.
//!
//! Two implementations ship with the crate:
//! - [`crate::socket::RawSocket`], a raw IPv4 socket for real traffic;
//! - [`MemoryChannel`], an in-process pair used by the tests, which builds
//!   IP headers the way the kernel does for a raw socket.

use std::future::Future;
use std::net::Ipv4Addr;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::ip_header::IpHeader;

/// Largest datagram either implementation will hand back.
pub const MAX_DATAGRAM: usize = 65_535;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("short write: sent {sent} of {expected} bytes")]
    ShortWrite { expected: usize, sent: usize },
    #[error("channel closed")]
    Closed,
}

pub trait Channel: Send + 'static {
    /// Wait for the next inbound IP datagram.
    ///
    /// Must be cancel-safe: the engine races it against other wake-ups and
    /// drops it when they win.
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, ChannelError>> + Send;

    /// Transmit one datagram to `destination`.  Fails with
    /// [`ChannelError::ShortWrite`] if fewer bytes went out than requested.
    fn send(
        &mut self,
        destination: Ipv4Addr,
        datagram: &[u8],
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

/// One end of an in-memory link.
///
/// Datagrams sent on one end arrive on the other.  Unless the sender says
/// it already included an IP header, the sending end prepends one with its
/// own address as the source, like a raw socket without `IP_HDRINCL`.
#[derive(Debug)]
pub struct MemoryChannel {
    local: Ipv4Addr,
    header_included: bool,
    ttl: u8,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryChannel {
    /// Two connected ends with addresses `a` and `b`.
    pub fn pair(a: Ipv4Addr, b: Ipv4Addr) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let end = |local, tx, rx| Self {
            local,
            header_included: false,
            ttl: 64,
            tx,
            rx,
        };
        (end(a, a_tx, a_rx), end(b, b_tx, b_rx))
    }

    /// Treat outbound bytes as complete datagrams (`IP_HDRINCL`).
    pub fn with_header_included(mut self, included: bool) -> Self {
        self.header_included = included;
        self
    }

    /// Non-blocking receive, for tests that assert nothing was sent.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

impl Channel for MemoryChannel {
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, ChannelError>> + Send {
        async move { self.rx.recv().await.ok_or(ChannelError::Closed) }
    }

    fn send(
        &mut self,
        destination: Ipv4Addr,
        datagram: &[u8],
    ) -> impl Future<Output = Result<(), ChannelError>> + Send {
        let framed = if self.header_included {
            datagram.to_vec()
        } else {
            let mut header =
                IpHeader::for_segment(self.local, destination, datagram.len(), self.ttl);
            let mut framed = header.encode_checked().to_vec();
            framed.extend_from_slice(datagram);
            framed
        };
        let result = self.tx.send(framed).map_err(|_| ChannelError::Closed);
        async move { result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use crate::tcp_header::{flags, TcpHeader};

    #[tokio::test]
    async fn pair_prepends_ip_header() {
        let a = Ipv4Addr::new(10, 0, 0, 1);
        let b = Ipv4Addr::new(10, 0, 0, 2);
        let (mut left, mut right) = MemoryChannel::pair(a, b);

        let mut pkt = Packet {
            ip: IpHeader {
                source: a,
                destination: b,
                ..IpHeader::default()
            },
            tcp: TcpHeader {
                flags: flags::SYN,
                ..TcpHeader::default()
            },
            payload: vec![],
        };
        left.send(b, &pkt.serialise(false)).await.unwrap();

        let datagram = right.recv().await.unwrap();
        let decoded = Packet::deserialise(&datagram, datagram.len()).unwrap();
        assert_eq!(decoded.ip.source, a);
        assert_eq!(decoded.ip.destination, b);
        assert!(decoded.tcp.syn());
        assert!(decoded.checksums_valid(&datagram));
    }

    #[tokio::test]
    async fn dropped_peer_closes_channel() {
        let (mut left, right) = MemoryChannel::pair(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST);
        drop(right);
        assert!(matches!(left.recv().await, Err(ChannelError::Closed)));
        assert!(matches!(
            left.send(Ipv4Addr::LOCALHOST, b"x").await,
            Err(ChannelError::Closed)
        ));
    }
}
