//! Transmission Control Block and its shared handle.
//!
//! A [`Tcb`] holds everything one connection knows: identity, state, and
//! the two streams.  It is plain data; the engine mutates it through the
//! handlers in [`crate::engine`] and the application reaches it through
//! [`crate::connection::Connection`].  Both go through [`Shared::lock`].

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::config::Config;
use crate::ip_header::IpHeader;
use crate::packet::Packet;
use crate::state::ConnectionState;
use crate::stream::{RecvStream, SendStream};
use crate::tcp_header::{flags, TcpHeader};

/// How the connection was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    Active,
    Passive,
}

#[derive(Debug)]
pub struct Tcb {
    pub local: SocketAddrV4,
    /// Peer identity.  Unspecified while a wildcard listener waits for its
    /// first SYN.
    pub remote: SocketAddrV4,
    pub state: ConnectionState,
    pub snd: SendStream,
    pub rcv: RecvStream,
    pub open_kind: OpenKind,
    /// Passive open without a fixed peer; LISTEN accepts a SYN from anyone.
    pub listen_any: bool,
    /// Application asked to close; FIN goes out once queued data is sent.
    pub close_requested: bool,
    /// Sequence number of our FIN, once sent.
    pub fin_seq: Option<u32>,
    /// Peer's FIN has been received; readers see end of stream after the
    /// buffer drains.
    pub peer_fin: bool,
    /// Connection was aborted by a RST.
    pub reset: bool,
    /// The application freed receive space; advertise it.
    pub window_update: bool,
    pub mss: usize,
    pub ttl: u8,
}

impl Tcb {
    /// TCB for an active open: starts in CLOSED, the engine emits the SYN.
    pub fn active(config: &Config, local: SocketAddrV4, remote: SocketAddrV4, iss: u32) -> Self {
        Self::new(config, local, remote, iss, ConnectionState::Closed, OpenKind::Active)
    }

    /// TCB for a passive open.  `remote = None` listens for any peer.
    pub fn passive(
        config: &Config,
        local: SocketAddrV4,
        remote: Option<SocketAddrV4>,
        iss: u32,
    ) -> Self {
        let mut tcb = Self::new(
            config,
            local,
            remote.unwrap_or(unspecified()),
            iss,
            ConnectionState::Listen,
            OpenKind::Passive,
        );
        tcb.listen_any = remote.is_none();
        tcb
    }

    fn new(
        config: &Config,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        iss: u32,
        state: ConnectionState,
        open_kind: OpenKind,
    ) -> Self {
        Self {
            local,
            remote,
            state,
            snd: SendStream::new(iss, config.send_buffer),
            rcv: RecvStream::new(config.recv_buffer),
            open_kind,
            listen_any: false,
            close_requested: false,
            fin_seq: None,
            peer_fin: false,
            reset: false,
            window_update: false,
            mss: config.mss.max(1),
            ttl: config.ttl,
        }
    }

    /// Does `pkt` belong to this connection?  Compares the IP addresses and
    /// TCP ports against the expected peer identity.
    pub fn matches(&self, pkt: &Packet) -> bool {
        let to_us = pkt.ip.destination == *self.local.ip()
            && pkt.tcp.destination_port == self.local.port();
        if self.state == ConnectionState::Listen && self.listen_any {
            return to_us;
        }
        to_us && pkt.ip.source == *self.remote.ip() && pkt.tcp.source_port == self.remote.port()
    }

    /// `true` once our FIN has been sent and acknowledged.
    pub fn fin_acked(&self) -> bool {
        self.fin_seq.is_some_and(|fin| self.snd.una == fin.wrapping_add(1))
    }

    /// Outbound segment to the connection's peer.
    pub fn segment(&self, flags: u8, seq: u32, ack: u32, payload: Vec<u8>) -> Packet {
        self.segment_to(self.remote, flags, seq, ack, payload)
    }

    /// Outbound segment to an explicit destination, for replies to segments
    /// that arrive before the peer is bound.
    pub fn segment_to(
        &self,
        dest: SocketAddrV4,
        flags: u8,
        seq: u32,
        ack: u32,
        payload: Vec<u8>,
    ) -> Packet {
        Packet {
            ip: IpHeader::for_segment(*self.local.ip(), *dest.ip(), 0, self.ttl),
            tcp: TcpHeader {
                source_port: self.local.port(),
                destination_port: dest.port(),
                seq,
                ack,
                flags,
                window: self.rcv.advertised_window(),
                ..TcpHeader::default()
            },
            payload,
        }
    }

    /// Pure ACK for the current send/receive positions.
    pub fn ack_segment(&self) -> Packet {
        self.segment(flags::ACK, self.snd.nxt, self.rcv.nxt, Vec::new())
    }
}

pub(crate) fn unspecified() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

/// A [`Tcb`] shared between the engine task and the application.
///
/// The mutex is never held across an `.await`.
#[derive(Debug)]
pub struct Shared {
    tcb: Mutex<Tcb>,
    /// Received bytes, end of stream, or termination.
    pub readable: Notify,
    /// Send buffer space freed by an acknowledgment.
    pub writable: Notify,
    /// Application work for the engine: queued bytes, close, window update.
    pub outbound: Notify,
    /// Any state transition.
    pub state_changed: Notify,
}

impl Shared {
    pub fn new(tcb: Tcb) -> Self {
        Self {
            tcb: Mutex::new(tcb),
            readable: Notify::new(),
            writable: Notify::new(),
            outbound: Notify::new(),
            state_changed: Notify::new(),
        }
    }

    /// Lock the TCB.  A panic elsewhere while holding the lock leaves plain
    /// data behind, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, Tcb> {
        self.tcb.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake every application-side waiter.
    pub fn wake_all(&self) {
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        self.state_changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    fn inbound(src: SocketAddrV4, dst: SocketAddrV4) -> Packet {
        Packet {
            ip: IpHeader {
                source: *src.ip(),
                destination: *dst.ip(),
                ..IpHeader::default()
            },
            tcp: TcpHeader {
                source_port: src.port(),
                destination_port: dst.port(),
                ..TcpHeader::default()
            },
            payload: vec![],
        }
    }

    #[test]
    fn matches_exact_peer_only() {
        let tcb = Tcb::active(&Config::default(), addr(1, 8100), addr(2, 8101), 0);
        assert!(tcb.matches(&inbound(addr(2, 8101), addr(1, 8100))));
        assert!(!tcb.matches(&inbound(addr(3, 8101), addr(1, 8100))));
        assert!(!tcb.matches(&inbound(addr(2, 9999), addr(1, 8100))));
        assert!(!tcb.matches(&inbound(addr(2, 8101), addr(1, 8200))));
        assert!(!tcb.matches(&inbound(addr(2, 8101), addr(4, 8100))));
    }

    #[test]
    fn wildcard_listener_accepts_any_peer() {
        let tcb = Tcb::passive(&Config::default(), addr(1, 8101), None, 0);
        assert!(tcb.matches(&inbound(addr(7, 40000), addr(1, 8101))));
        assert!(!tcb.matches(&inbound(addr(7, 40000), addr(1, 8102))));
    }

    #[test]
    fn segments_carry_identity_and_window() {
        let config = Config {
            recv_buffer: 4096,
            ..Config::default()
        };
        let tcb = Tcb::active(&config, addr(1, 8100), addr(2, 8101), 77);
        let pkt = tcb.segment(flags::SYN, 77, 0, vec![]);
        assert_eq!(pkt.ip.source, *addr(1, 0).ip());
        assert_eq!(pkt.ip.destination, *addr(2, 0).ip());
        assert_eq!(pkt.tcp.source_port, 8100);
        assert_eq!(pkt.tcp.destination_port, 8101);
        assert_eq!(pkt.tcp.window, 4096);
    }
}
