//! Application handle for one connection.
//!
//! A [`Connection`] spawns an [`Engine`] task and talks to it only through
//! the shared TCB: bytes go into the send buffer, come out of the receive
//! buffer, and a close flag asks for a FIN.  Blocking calls wait on the
//! [`Shared`] notifiers.
//!
//! ```ignore
//! let local = "10.126.0.2:8100".parse()?;
//! let remote = "10.126.0.3:8101".parse()?;
//! let conn = Connection::open(Config::default(), local, Some(remote))?;
//! conn.wait_established().await?;
//! conn.send_all(b"hello").await?;
//! conn.close();
//! conn.join().await?;
//! ```

use std::net::SocketAddrV4;
use std::pin::pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};

use crate::buffer::BufferError;
use crate::channel::{Channel, ChannelError};
use crate::config::Config;
use crate::engine::{self, Engine, EngineError};
use crate::socket::RawSocket;
use crate::state::ConnectionState;
use crate::stream::IsnGenerator;
use crate::tcb::{unspecified, Shared, Tcb};

#[derive(Error, Debug)]
pub enum ConnError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("connection reset by peer")]
    Reset,
    #[error("connection closed")]
    Closed,
    #[error("engine task failed: {0}")]
    Join(#[from] JoinError),
}

pub struct Connection {
    shared: Arc<Shared>,
    engine: JoinHandle<Result<(), EngineError>>,
}

impl Connection {
    /// Open a connection over a raw socket bound to `local`'s address.
    /// `remote = Some(peer)` is an active open; `None` listens for any peer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        config: Config,
        local: SocketAddrV4,
        remote: Option<SocketAddrV4>,
    ) -> Result<Self, ConnError> {
        let socket = RawSocket::bind(*local.ip(), config.include_ip_header)?;
        Self::with_channel(config, socket, local, remote)
    }

    /// Like [`Connection::open`] over a caller-supplied channel.
    pub fn with_channel<C: Channel>(
        config: Config,
        channel: C,
        local: SocketAddrV4,
        remote: Option<SocketAddrV4>,
    ) -> Result<Self, ConnError> {
        let iss = IsnGenerator::new().generate(local, remote.unwrap_or(unspecified()));

        let mut pending = Vec::new();
        let tcb = match remote {
            Some(remote) => {
                let mut tcb = Tcb::active(&config, local, remote, iss);
                pending.push(engine::open(&mut tcb)?);
                tcb
            }
            None => {
                log::info!("listening on {local}");
                Tcb::passive(&config, local, None, iss)
            }
        };

        let shared = Arc::new(Shared::new(tcb));
        let engine = Engine::new(Arc::clone(&shared), channel, &config).with_pending(pending);
        let engine = tokio::spawn(engine.run());
        Ok(Self { shared, engine })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.shared.lock().local
    }

    /// Peer address; unspecified while a wildcard listener has no peer.
    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.shared.lock().remote
    }

    /// Run `f` against the TCB under its lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&Tcb) -> R) -> R {
        f(&self.shared.lock())
    }

    /// Wait until the handshake completes.
    pub async fn wait_established(&self) -> Result<(), ConnError> {
        loop {
            let mut changed = pin!(self.shared.state_changed.notified());
            changed.as_mut().enable();
            {
                let tcb = self.shared.lock();
                if tcb.state.is_synchronized() {
                    return Ok(());
                }
                if tcb.state == ConnectionState::Closed {
                    return Err(if tcb.reset { ConnError::Reset } else { ConnError::Closed });
                }
            }
            changed.await;
        }
    }

    /// Queue as much of `data` as the send buffer holds, waiting for room
    /// if it is full.  Returns the number of bytes queued.
    pub async fn send(&self, data: &[u8]) -> Result<usize, ConnError> {
        if data.is_empty() {
            return Ok(0);
        }
        loop {
            let mut writable = pin!(self.shared.writable.notified());
            writable.as_mut().enable();
            {
                let mut tcb = self.shared.lock();
                if tcb.reset {
                    return Err(ConnError::Reset);
                }
                let open = tcb.state == ConnectionState::Listen || tcb.state.can_send();
                if tcb.close_requested || !open {
                    return Err(ConnError::Closed);
                }
                let n = data.len().min(tcb.snd.buffer.bytes_writable());
                if n > 0 {
                    tcb.snd.enqueue(&data[..n])?;
                    drop(tcb);
                    self.shared.outbound.notify_one();
                    return Ok(n);
                }
            }
            writable.await;
        }
    }

    /// Queue all of `data`.
    pub async fn send_all(&self, mut data: &[u8]) -> Result<(), ConnError> {
        while !data.is_empty() {
            let n = self.send(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Read received bytes into `buf`, waiting until some arrive.  Returns
    /// `0` at end of stream: the peer sent FIN or the connection closed.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let mut readable = pin!(self.shared.readable.notified());
            readable.as_mut().enable();
            {
                let mut tcb = self.shared.lock();
                let available = tcb.rcv.buffer.bytes_readable();
                if available > 0 {
                    let before = tcb.rcv.advertised_window();
                    let n = available.min(buf.len());
                    let bytes = tcb.rcv.buffer.read(n)?;
                    buf[..n].copy_from_slice(&bytes);

                    // The peer stops sending once it sees a window too small
                    // for a segment; tell it about the space we just freed.
                    let update = usize::from(before) < tcb.mss;
                    tcb.window_update |= update;
                    drop(tcb);
                    if update {
                        self.shared.outbound.notify_one();
                    }
                    return Ok(n);
                }
                if tcb.reset {
                    return Err(ConnError::Reset);
                }
                if tcb.peer_fin || tcb.state == ConnectionState::Closed {
                    return Ok(0);
                }
            }
            readable.await;
        }
    }

    /// Ask for an orderly close.  Queued bytes are sent first, then a FIN.
    /// Returns immediately; [`Connection::join`] waits for the teardown.
    pub fn close(&self) {
        let mut tcb = self.shared.lock();
        if tcb.state == ConnectionState::Closed || tcb.close_requested {
            return;
        }
        tcb.close_requested = true;
        drop(tcb);
        log::debug!("close requested");
        self.shared.outbound.notify_one();
    }

    /// Wait for the engine task to finish and report how it ended.
    pub async fn join(mut self) -> Result<(), ConnError> {
        match (&mut self.engine).await? {
            Ok(()) => Ok(()),
            Err(EngineError::Reset) => Err(ConnError::Reset),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Connection {
    /// A dropped handle closes the connection: a listener or a pending
    /// active open ends at once, a synchronized connection sends its FIN.
    /// Either way the engine task and its channel are released once the
    /// teardown completes.
    fn drop(&mut self) {
        self.close();
    }
}
