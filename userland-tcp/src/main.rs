//! Entry point for `userland-tcp`.
//!
//! Opens one connection over a raw socket, copies stdin to the peer and the
//! peer's bytes to stdout.  All protocol work is delegated to the library;
//! `main.rs` owns only process setup (logging, signal handling, argument
//! parsing).
//!
//! Raw sockets need `CAP_NET_RAW`, and the host kernel must be kept from
//! answering the chosen port with RST, e.g.
//! `iptables -A OUTPUT -p tcp --tcp-flags RST RST --sport 8100 -j DROP`.

use std::net::SocketAddrV4;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use userland_tcp::config::{Config, DEFAULT_MSS};
use userland_tcp::connection::Connection;

/// TCP endpoint in user space over a raw IPv4 socket.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
    #[command(flatten)]
    tuning: Tuning,
}

#[derive(Subcommand)]
enum Mode {
    /// Actively open a connection to a peer.
    Connect {
        /// Local address and port (e.g. 10.126.0.2:8100).
        #[arg(short, long)]
        local: SocketAddrV4,
        /// Remote address and port (e.g. 10.126.0.3:8101).
        #[arg(short, long)]
        remote: SocketAddrV4,
    },
    /// Wait for a peer to connect.
    Listen {
        /// Local address and port to accept on.
        #[arg(short, long)]
        local: SocketAddrV4,
    },
}

#[derive(Args)]
struct Tuning {
    /// Send buffer capacity in bytes.
    #[arg(long, global = true, default_value_t = 64 * 1024)]
    send_buffer: usize,
    /// Receive buffer capacity in bytes.
    #[arg(long, global = true, default_value_t = 64 * 1024)]
    recv_buffer: usize,
    /// Largest payload per segment.
    #[arg(long, global = true, default_value_t = DEFAULT_MSS)]
    mss: usize,
    /// TTL for IP headers we build ourselves.
    #[arg(long, global = true, default_value_t = 64)]
    ttl: u8,
    /// TIME-WAIT duration in seconds.
    #[arg(long, global = true, default_value_t = 240)]
    time_wait: u64,
    /// Build IP headers in user space (IP_HDRINCL).
    #[arg(long, global = true)]
    header_included: bool,
}

impl Tuning {
    fn config(&self) -> Config {
        Config {
            send_buffer: self.send_buffer,
            recv_buffer: self.recv_buffer,
            mss: self.mss,
            ttl: self.ttl,
            time_wait: Duration::from_secs(self.time_wait),
            include_ip_header: self.header_included,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.tuning.config();

    let (local, remote) = match cli.mode {
        Mode::Connect { local, remote } => {
            log::info!("connecting {local} -> {remote}");
            (local, Some(remote))
        }
        Mode::Listen { local } => (local, None),
    };

    let conn = Connection::open(config, local, remote).context("failed to open raw socket")?;
    conn.wait_established().await.context("handshake failed")?;
    log::info!("connection established with {}", conn.remote_addr());

    tokio::select! {
        res = pump(&conn) => res?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, closing");
            conn.close();
        }
    }

    conn.join().await.context("connection ended abnormally")?;
    log::info!("connection closed");
    Ok(())
}

/// stdin → peer until EOF, then FIN; peer → stdout until its FIN.
async fn pump(conn: &Connection) -> anyhow::Result<()> {
    let upload = async {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = stdin.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            conn.send_all(&buf[..n]).await?;
        }
        conn.close();
        anyhow::Ok(())
    };

    let download = async {
        let mut stdout = tokio::io::stdout();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = conn.recv(&mut buf).await?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n]).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    };

    tokio::try_join!(upload, download)?;
    Ok(())
}
