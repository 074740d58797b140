//! Integration tests for data transfer and teardown between two engines.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use userland_tcp::{
    channel::MemoryChannel,
    config::Config,
    connection::{ConnError, Connection},
    state::ConnectionState,
};

const CLIENT: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 126, 0, 2), 8100);
const SERVER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 126, 0, 3), 8101);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn within<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("timed out")
}

/// Client and server joined by a memory link, both established.
async fn established_pair(config: Config) -> (Connection, Connection) {
    let (a, b) = MemoryChannel::pair(*CLIENT.ip(), *SERVER.ip());
    let server = Connection::with_channel(config.clone(), b, SERVER, None).unwrap();
    let client = Connection::with_channel(config, a, CLIENT, Some(SERVER)).unwrap();
    within(client.wait_established()).await.unwrap();
    within(server.wait_established()).await.unwrap();
    (client, server)
}

fn small_buffers() -> Config {
    Config {
        send_buffer: 4096,
        recv_buffer: 4096,
        time_wait: Duration::from_millis(50),
        ..Config::default()
    }
}

async fn read_exact(conn: &Connection, n: usize) -> Result<Vec<u8>, ConnError> {
    let mut out = Vec::with_capacity(n);
    let mut buf = [0u8; 1024];
    while out.len() < n {
        let want = (n - out.len()).min(buf.len());
        let got = conn.recv(&mut buf[..want]).await?;
        if got == 0 {
            break;
        }
        out.extend_from_slice(&buf[..got]);
    }
    Ok(out)
}

async fn read_to_end(conn: &Connection) -> Result<Vec<u8>, ConnError> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let got = conn.recv(&mut buf).await?;
        if got == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..got]);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bytes_flow_both_ways() {
    let (client, server) = established_pair(small_buffers()).await;

    within(client.send_all(b"ping")).await.unwrap();
    assert_eq!(within(read_exact(&server, 4)).await.unwrap(), b"ping");

    within(server.send_all(b"pong!")).await.unwrap();
    assert_eq!(within(read_exact(&client, 5)).await.unwrap(), b"pong!");

    // The server acknowledged "ping" before it sent "pong!".
    let (iss, una, nxt) = client.inspect(|tcb| (tcb.snd.iss, tcb.snd.una, tcb.snd.nxt));
    assert_eq!(nxt, iss.wrapping_add(5));
    assert_eq!(una, nxt);
    assert!(client.inspect(|tcb| tcb.snd.buffer.is_empty()));
}

/// A transfer many times larger than either buffer completes intact, so
/// flow control and window updates keep both sides moving.
#[tokio::test]
async fn bulk_transfer_through_small_buffers() {
    let (client, server) = established_pair(small_buffers()).await;
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    let upload = async {
        client.send_all(&data).await?;
        client.close();
        Ok::<_, ConnError>(())
    };
    let (sent, received) = within(async { tokio::join!(upload, read_to_end(&server)) }).await;
    sent.unwrap();
    let received = received.unwrap();

    assert_eq!(received.len(), data.len());
    assert!(received == data, "payload corrupted in transit");
    assert_eq!(server.state(), ConnectionState::CloseWait);
}

#[tokio::test]
async fn orderly_close_from_client() {
    let (client, server) = established_pair(small_buffers()).await;

    within(client.send_all(b"bye")).await.unwrap();
    client.close();

    // Data first, then end of stream.
    assert_eq!(within(read_to_end(&server)).await.unwrap(), b"bye");
    assert_eq!(server.state(), ConnectionState::CloseWait);

    // The half-closed server may still send.
    within(server.send_all(b"ok")).await.unwrap();
    server.close();

    assert_eq!(within(read_to_end(&client)).await.unwrap(), b"ok");

    within(server.join()).await.unwrap();
    within(client.join()).await.unwrap();
}

#[tokio::test]
async fn simultaneous_close_completes() {
    let (client, server) = established_pair(small_buffers()).await;

    client.close();
    server.close();

    assert!(within(read_to_end(&client)).await.unwrap().is_empty());
    assert!(within(read_to_end(&server)).await.unwrap().is_empty());
    within(client.join()).await.unwrap();
    within(server.join()).await.unwrap();
}

#[tokio::test]
async fn send_after_close_is_rejected() {
    let (client, _server) = established_pair(small_buffers()).await;

    client.close();
    assert!(matches!(
        within(client.send(b"late")).await,
        Err(ConnError::Closed)
    ));
}

/// With `include_ip_header` the engines build their own IP headers and the
/// link carries the datagrams untouched.
#[tokio::test]
async fn header_included_link_carries_data() {
    let config = Config {
        include_ip_header: true,
        ..small_buffers()
    };
    let (a, b) = MemoryChannel::pair(*CLIENT.ip(), *SERVER.ip());
    let a = a.with_header_included(true);
    let b = b.with_header_included(true);
    let server = Connection::with_channel(config.clone(), b, SERVER, None).unwrap();
    let client = Connection::with_channel(config, a, CLIENT, Some(SERVER)).unwrap();
    within(client.wait_established()).await.unwrap();
    within(server.wait_established()).await.unwrap();

    within(client.send_all(b"raw")).await.unwrap();
    assert_eq!(within(read_exact(&server, 3)).await.unwrap(), b"raw");

    client.close();
    assert!(within(read_to_end(&server)).await.unwrap().is_empty());
    server.close();
    within(server.join()).await.unwrap();
    within(client.join()).await.unwrap();
}
