//! Connection engine: the TCP state machine and its receive loop.
//!
//! # Architecture
//!
//! ```text
//!   Channel ──datagram──▶ Engine::handle_datagram
//!                             │  deserialise, checksum, identity gate
//!                             ▼
//!                        on_segment(&mut Tcb, &Packet) ──▶ replies
//!                             │
//!   Connection ──notify──▶ poll_output(&mut Tcb)      ──▶ data / FIN
//!                             │
//!   Channel ◀──segments── Engine::transmit
//! ```
//!
//! The handlers ([`open`], [`on_segment`], [`poll_output`]) are plain
//! functions over a [`Tcb`]: they mutate it and return the segments to
//! send, which keeps every transition testable without a channel.
//! [`Engine`] owns the channel and runs them under the TCB lock.
//!
//! RST generation, challenge ACKs and teardown follow RFC 9293 and
//! RFC 5961.  There are no retransmission timers: every segment is sent
//! once.  Unacknowledged bytes stay in the send buffer.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep_until, Instant};

use crate::channel::{Channel, ChannelError};
use crate::config::Config;
use crate::packet::Packet;
use crate::state::ConnectionState::{self, *};
use crate::stream::{seq_ge, seq_gt, seq_lt};
use crate::tcb::{unspecified, OpenKind, Shared, Tcb};
use crate::tcp_header::flags;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("connection reset by peer")]
    Reset,
    #[error("no handler for inbound segments in state {0}")]
    InvalidState(ConnectionState),
}

/// Segments a handler wants sent, in order.
pub type Replies = Vec<Packet>;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// CLOSED: emit the opening SYN carrying ISS and the local window.
pub fn open(tcb: &mut Tcb) -> Result<Packet, EngineError> {
    if tcb.state != Closed {
        return Err(EngineError::InvalidState(tcb.state));
    }
    let mut syn = tcb.segment(flags::SYN, tcb.snd.iss, 0, Vec::new());
    syn.tcp.window = tcb.rcv.wnd;
    tcb.snd.nxt = tcb.snd.iss.wrapping_add(1);
    tcb.state = SynSent;
    log::debug!("{} -> {}: SYN seq={}", tcb.local, tcb.remote, tcb.snd.iss);
    Ok(syn)
}

/// Apply one inbound segment that already passed the identity gate.
pub fn on_segment(tcb: &mut Tcb, seg: &Packet) -> Result<Replies, EngineError> {
    match tcb.state {
        Closed => Err(EngineError::InvalidState(Closed)),
        Listen => Ok(listen(tcb, seg)),
        SynSent => syn_sent(tcb, seg),
        SynReceived => syn_received(tcb, seg),
        Established | CloseWait | FinWait1 | FinWait2 | Closing | LastAck | TimeWait => {
            synchronized(tcb, seg)
        }
    }
}

fn listen(tcb: &mut Tcb, seg: &Packet) -> Replies {
    let h = &seg.tcp;
    let from = SocketAddrV4::new(seg.ip.source, h.source_port);

    if h.rst() {
        return Vec::new();
    }
    if h.ack_set() {
        log::debug!("LISTEN: ACK from {from} without a connection, sending RST");
        return vec![tcb.segment_to(from, flags::RST, h.ack, 0, Vec::new())];
    }
    if !h.syn() {
        return Vec::new();
    }

    if tcb.listen_any {
        tcb.remote = from;
    }
    tcb.rcv.irs = h.seq;
    tcb.rcv.nxt = h.seq.wrapping_add(1);
    tcb.rcv.wnd = h.window;
    tcb.snd.wnd = h.window;

    let syn_ack = syn_ack(tcb);
    tcb.snd.nxt = tcb.snd.iss.wrapping_add(1);
    tcb.state = SynReceived;
    log::debug!("LISTEN: SYN from {from} seq={}, sending SYN-ACK", h.seq);
    vec![syn_ack]
}

fn syn_sent(tcb: &mut Tcb, seg: &Packet) -> Result<Replies, EngineError> {
    let h = &seg.tcp;
    // Nothing but the SYN has been sent, so SEG.ACK == SND.NXT == ISS + 1.
    let ack_ok = h.ack == tcb.snd.nxt && h.ack == tcb.snd.iss.wrapping_add(1);

    if h.ack_set() && !ack_ok {
        if h.rst() {
            return Ok(Vec::new());
        }
        log::debug!(
            "SYN-SENT: bad ack {} (expected {}), sending RST",
            h.ack,
            tcb.snd.nxt
        );
        return Ok(vec![tcb.segment(flags::RST, h.ack, 0, Vec::new())]);
    }

    if h.rst() {
        if h.ack_set() {
            log::warn!("connection refused by {}", tcb.remote);
            abort(tcb);
            return Err(EngineError::Reset);
        }
        return Ok(Vec::new());
    }

    if !h.syn() {
        return Ok(Vec::new());
    }

    tcb.rcv.irs = h.seq;
    tcb.rcv.nxt = h.seq.wrapping_add(1);
    tcb.rcv.wnd = h.window;
    tcb.snd.wnd = h.window;

    if h.ack_set() {
        tcb.snd.una = h.ack;
        tcb.snd.set_window(h.seq, h.ack, h.window);
        tcb.state = Established;
        log::debug!("SYN-SENT: SYN-ACK from {}, connection established", tcb.remote);
        Ok(vec![tcb.ack_segment()])
    } else {
        // Simultaneous open.
        tcb.state = SynReceived;
        log::debug!("SYN-SENT: SYN from {}, simultaneous open", tcb.remote);
        Ok(vec![syn_ack(tcb)])
    }
}

fn syn_received(tcb: &mut Tcb, seg: &Packet) -> Result<Replies, EngineError> {
    let h = &seg.tcp;

    if h.rst() {
        if !in_window(tcb, h.seq) {
            return Ok(Vec::new());
        }
        return match tcb.open_kind {
            OpenKind::Passive => {
                log::debug!("SYN-RECEIVED: RST from {}, back to LISTEN", tcb.remote);
                tcb.snd.una = tcb.snd.iss;
                tcb.snd.nxt = tcb.snd.iss;
                if tcb.listen_any {
                    tcb.remote = unspecified();
                }
                tcb.state = Listen;
                Ok(Vec::new())
            }
            OpenKind::Active => {
                abort(tcb);
                Err(EngineError::Reset)
            }
        };
    }

    if !h.ack_set() {
        return Ok(Vec::new());
    }
    if !(h.ack == tcb.snd.nxt && h.ack == tcb.snd.iss.wrapping_add(1)) {
        log::debug!(
            "SYN-RECEIVED: bad ack {} (expected {}), sending RST",
            h.ack,
            tcb.snd.nxt
        );
        return Ok(vec![tcb.segment(flags::RST, h.ack, 0, Vec::new())]);
    }

    tcb.snd.una = h.ack;
    tcb.snd.set_window(h.seq, h.ack, h.window);
    tcb.state = Established;
    log::debug!("SYN-RECEIVED: ACK from {}, connection established", tcb.remote);

    // The completing ACK may already carry data or a FIN.
    synchronized(tcb, seg)
}

/// ESTABLISHED and every teardown state.
fn synchronized(tcb: &mut Tcb, seg: &Packet) -> Result<Replies, EngineError> {
    let h = &seg.tcp;

    if h.rst() {
        // RFC 5961 §3.2: only an exact RST aborts.
        if h.seq == tcb.rcv.nxt {
            log::warn!("{}: connection reset by {}", tcb.state, tcb.remote);
            abort(tcb);
            return Err(EngineError::Reset);
        }
        if in_window(tcb, h.seq) {
            return Ok(vec![tcb.ack_segment()]);
        }
        return Ok(Vec::new());
    }

    if h.syn() {
        // RFC 5961 §4.2 challenge ACK.
        log::debug!("{}: SYN from {}, sending challenge ACK", tcb.state, tcb.remote);
        return Ok(vec![tcb.ack_segment()]);
    }

    if !h.ack_set() {
        return Ok(Vec::new());
    }

    if process_ack(tcb, h.seq, h.ack, h.window) == AckOutcome::Unsent {
        return Ok(vec![tcb.ack_segment()]);
    }

    if tcb.fin_acked() {
        match tcb.state {
            FinWait1 => tcb.state = FinWait2,
            Closing => tcb.state = TimeWait,
            LastAck => {
                tcb.state = Closed;
                return Ok(Vec::new());
            }
            _ => {}
        }
    }

    let mut need_ack = false;
    if !seg.payload.is_empty() && tcb.state.can_receive() && process_payload(tcb, seg) {
        need_ack = true;
    }

    if h.fin() {
        // In order once any payload in front of it has been accepted.
        let fin_seq = h.seq.wrapping_add(seg.payload.len() as u32);
        if !tcb.peer_fin && fin_seq == tcb.rcv.nxt && tcb.state.can_receive() {
            tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(1);
            tcb.peer_fin = true;
            need_ack = true;
            tcb.state = match tcb.state {
                Established => CloseWait,
                FinWait1 => Closing,
                FinWait2 => TimeWait,
                other => other,
            };
            log::debug!("FIN from {}, now {}", tcb.remote, tcb.state);
        } else if tcb.peer_fin && fin_seq.wrapping_add(1) == tcb.rcv.nxt {
            // Our ACK of the FIN was lost.
            need_ack = true;
        }
    }

    Ok(if need_ack {
        vec![tcb.ack_segment()]
    } else {
        Vec::new()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckOutcome {
    /// `ack < UNA`: already seen, ignored.
    Stale,
    /// `ack > NXT`: acknowledges something never sent.
    Unsent,
    Accepted,
}

fn process_ack(tcb: &mut Tcb, seq: u32, ack: u32, window: u16) -> AckOutcome {
    let snd = &mut tcb.snd;
    if seq_lt(ack, snd.una) {
        return AckOutcome::Stale;
    }
    if seq_gt(ack, snd.nxt) {
        log::debug!("ack {} beyond SND.NXT {}, re-acking", ack, snd.nxt);
        return AckOutcome::Unsent;
    }

    // The FIN occupies sequence space but not buffer space.
    let fin_covered = tcb
        .fin_seq
        .is_some_and(|fin| seq_ge(fin, snd.una) && seq_lt(fin, ack));
    let acked = ack.wrapping_sub(snd.una) as usize - usize::from(fin_covered);
    let acked = acked.min(snd.buffer.bytes_readable());
    if let Err(e) = snd.buffer.consume(acked) {
        log::warn!("send buffer out of step with SND.UNA: {e}");
    }
    snd.una = ack;
    snd.update_window(seq, ack, window);
    AckOutcome::Accepted
}

/// Strict in-order delivery.  Returns `true` when the payload was buffered
/// and `RCV.NXT` advanced.
fn process_payload(tcb: &mut Tcb, seg: &Packet) -> bool {
    if seg.tcp.seq != tcb.rcv.nxt {
        log::debug!(
            "out-of-order segment seq={} (expected {}), dropped",
            seg.tcp.seq,
            tcb.rcv.nxt
        );
        return false;
    }
    match tcb.rcv.accept(&seg.payload) {
        Ok(()) => true,
        Err(e) => {
            log::debug!("receive buffer full, segment seq={} dropped: {e}", seg.tcp.seq);
            false
        }
    }
}

/// Segments the engine owes the peer outside of replies: queued data, a
/// pending FIN, a window update.  Also completes a close requested before
/// the connection was synchronized.
pub fn poll_output(tcb: &mut Tcb) -> Replies {
    let mut out = Vec::new();

    if tcb.close_requested && matches!(tcb.state, Listen | SynSent) {
        log::debug!("{}: closed by application", tcb.state);
        tcb.state = Closed;
        return out;
    }

    if matches!(tcb.state, Established | CloseWait) {
        let mut unsent;
        loop {
            let in_flight = tcb.snd.in_flight() as usize;
            unsent = tcb.snd.unsent(in_flight);
            let usable = usize::from(tcb.snd.wnd).saturating_sub(in_flight);
            let n = unsent.min(usable).min(tcb.mss);
            if n == 0 {
                break;
            }
            let payload = match tcb.snd.buffer.peek_at(in_flight, n) {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("send buffer out of step with SND.NXT: {e}");
                    break;
                }
            };
            out.push(tcb.segment(flags::ACK, tcb.snd.nxt, tcb.rcv.nxt, payload));
            tcb.snd.nxt = tcb.snd.nxt.wrapping_add(n as u32);
        }

        if tcb.close_requested && tcb.fin_seq.is_none() && unsent == 0 {
            out.push(tcb.segment(flags::FIN | flags::ACK, tcb.snd.nxt, tcb.rcv.nxt, Vec::new()));
            tcb.fin_seq = Some(tcb.snd.nxt);
            tcb.snd.nxt = tcb.snd.nxt.wrapping_add(1);
            tcb.state = if tcb.state == Established { FinWait1 } else { LastAck };
            log::debug!("FIN sent to {}, now {}", tcb.remote, tcb.state);
        }
    }

    if tcb.window_update {
        tcb.window_update = false;
        if out.is_empty() && tcb.state.is_synchronized() && tcb.state != TimeWait {
            out.push(tcb.ack_segment());
        }
    }

    out
}

fn syn_ack(tcb: &Tcb) -> Packet {
    tcb.segment(flags::SYN | flags::ACK, tcb.snd.iss, tcb.rcv.nxt, Vec::new())
}

/// `RCV.NXT <= seq < RCV.NXT + RCV.WND`, with a zero window accepting only
/// `RCV.NXT` itself.
fn in_window(tcb: &Tcb, seq: u32) -> bool {
    let wnd = u32::from(tcb.rcv.advertised_window()).max(1);
    seq_ge(seq, tcb.rcv.nxt) && seq_lt(seq, tcb.rcv.nxt.wrapping_add(wnd))
}

fn abort(tcb: &mut Tcb) {
    tcb.state = Closed;
    tcb.reset = true;
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

enum Wake {
    Datagram(Result<Vec<u8>, ChannelError>),
    Outbound,
    TimeWaitExpired,
}

/// Runs one connection: owns its channel, shares its TCB.
pub struct Engine<C> {
    shared: Arc<Shared>,
    channel: C,
    /// Sent before the first receive; the opening SYN of an active open.
    pending: Replies,
    include_ip_header: bool,
    time_wait: Duration,
}

impl<C: Channel> Engine<C> {
    pub fn new(shared: Arc<Shared>, channel: C, config: &Config) -> Self {
        Self {
            shared,
            channel,
            pending: Vec::new(),
            include_ip_header: config.include_ip_header,
            time_wait: config.time_wait,
        }
    }

    /// Segments to transmit as soon as the engine starts.
    pub fn with_pending(mut self, segments: Replies) -> Self {
        self.pending = segments;
        self
    }

    /// Drive the connection until it closes, is reset, or the channel fails.
    /// The TCB is left in CLOSED and every waiter is woken on return.
    pub async fn run(mut self) -> Result<(), EngineError> {
        let result = self.drive().await;
        self.shared.lock().state = Closed;
        match &result {
            Ok(()) => log::debug!("engine finished"),
            Err(EngineError::Reset) => log::warn!("engine stopped: connection reset"),
            Err(e) => log::error!("engine terminated: {e}"),
        }
        self.shared.wake_all();
        result
    }

    async fn drive(&mut self) -> Result<(), EngineError> {
        let pending = std::mem::take(&mut self.pending);
        self.transmit(pending).await;

        let mut time_wait_deadline: Option<Instant> = None;
        loop {
            let (out, state) = {
                let mut tcb = self.shared.lock();
                let out = poll_output(&mut tcb);
                (out, tcb.state)
            };
            self.transmit(out).await;
            self.shared.wake_all();

            match state {
                Closed => return Ok(()),
                TimeWait if time_wait_deadline.is_none() => {
                    time_wait_deadline = Some(Instant::now() + self.time_wait);
                }
                _ => {}
            }

            let deadline = time_wait_deadline.unwrap_or_else(Instant::now);
            let wake = tokio::select! {
                res = self.channel.recv() => Wake::Datagram(res),
                _ = self.shared.outbound.notified() => Wake::Outbound,
                _ = sleep_until(deadline), if time_wait_deadline.is_some() => Wake::TimeWaitExpired,
            };

            match wake {
                Wake::Datagram(Err(ChannelError::Closed)) if state == TimeWait => {
                    log::debug!("channel closed during TIME-WAIT");
                    self.shared.lock().state = Closed;
                    return Ok(());
                }
                Wake::Datagram(res) => {
                    let datagram = res?;
                    let replied_in_time_wait = self.handle_datagram(&datagram).await?;
                    if replied_in_time_wait {
                        time_wait_deadline = Some(Instant::now() + self.time_wait);
                    }
                }
                Wake::Outbound => {}
                Wake::TimeWaitExpired => {
                    log::debug!("TIME-WAIT expired");
                    self.shared.lock().state = Closed;
                    return Ok(());
                }
            }
        }
    }

    /// Validate and dispatch one datagram.  Returns `true` when it was a
    /// retransmission answered in TIME-WAIT, which restarts the 2×MSL wait.
    async fn handle_datagram(&mut self, datagram: &[u8]) -> Result<bool, EngineError> {
        let pkt = match Packet::deserialise(datagram, datagram.len()) {
            Ok(pkt) => pkt,
            Err(e) => {
                log::debug!("dropping malformed datagram: {e}");
                return Ok(false);
            }
        };
        if !pkt.checksums_valid(datagram) {
            log::debug!(
                "dropping segment from {}:{} with bad checksum",
                pkt.ip.source,
                pkt.tcp.source_port
            );
            return Ok(false);
        }

        let (result, was_time_wait) = {
            let mut tcb = self.shared.lock();
            if !tcb.matches(&pkt) {
                log::trace!(
                    "ignoring segment {}:{} -> {}:{}",
                    pkt.ip.source,
                    pkt.tcp.source_port,
                    pkt.ip.destination,
                    pkt.tcp.destination_port
                );
                return Ok(false);
            }
            log::trace!("inbound segment\n{pkt}");
            let before = tcb.state;
            let result = on_segment(&mut tcb, &pkt);
            if tcb.state != before {
                log::debug!("{before} -> {}", tcb.state);
            }
            (result, before == TimeWait)
        };

        let replies = result?;
        let restart = was_time_wait && !replies.is_empty();
        self.transmit(replies).await;
        Ok(restart)
    }

    /// Send segments in order.  A failed send loses that segment only.
    async fn transmit(&mut self, packets: Replies) {
        for mut pkt in packets {
            let bytes = pkt.serialise(self.include_ip_header);
            log::trace!("outbound segment\n{pkt}");
            if let Err(e) = self.channel.send(pkt.ip.destination, &bytes).await {
                log::warn!("failed to send segment seq={}: {e}", pkt.tcp.seq);
            }
        }
    }
}
