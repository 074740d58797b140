//! `userland-tcp`: a TCP endpoint implemented in user space over raw IPv4.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │  send / recv / close
//!  ┌───▼───────────────────────────────┐
//!  │           Connection              │  waits on Shared notifiers
//!  └───┬───────────────────────────────┘
//!      │ Arc<Shared>  (Mutex<Tcb>)
//!  ┌───▼───────────────────────────────┐
//!  │             Engine                │  state machine, one task
//!  │   Tcb ── SendStream ── RingBuffer │
//!  │       └─ RecvStream ── RingBuffer │
//!  └───┬───────────────────────────────┘
//!      │ IPv4 datagrams (Packet codec)
//!  ┌───▼───────┐
//!  │  Channel  │  RawSocket, or MemoryChannel in tests
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`buffer`]: fixed-capacity byte ring
//! - [`checksum`]: RFC 1071 Internet checksum and the TCP pseudo-header
//! - [`ip_header`]: IPv4 header codec
//! - [`tcp_header`]: TCP header codec and flag bits
//! - [`packet`]: full datagram codec
//! - [`stream`]: send/receive sequence spaces and ISS generation
//! - [`state`]: connection states
//! - [`tcb`]: per-connection record and its shared handle
//! - [`engine`]: segment handlers and the receive loop
//! - [`channel`]: datagram I/O abstraction and the in-memory pair
//! - [`socket`]: raw IPv4 socket channel
//! - [`connection`]: application API
//! - [`config`]: tunables

pub mod buffer;
pub mod channel;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod engine;
pub mod ip_header;
pub mod packet;
pub mod socket;
pub mod state;
pub mod stream;
pub mod tcb;
pub mod tcp_header;
