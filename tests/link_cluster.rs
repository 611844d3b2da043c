//! Client links against a real socket pool standing in for the relay.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use common::{eventually, init_tracing, within};
use tunnel_relay::client::{LocalTarget, LocalTls, RetryPolicy, TunnelError, TunnelInfo, TunnelSession};
use tunnel_relay::server::SocketPool;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn tunnel_info(remote_port: u16, local_port: u16, links: usize) -> TunnelInfo {
    TunnelInfo {
        client_id: "links".to_string(),
        url: "http://links.example.com".to_string(),
        max_conn_count: links,
        remote_host: "127.0.0.1".to_string(),
        remote_ip: None,
        remote_port,
        local_host: None,
        local_port,
    }
}

fn quick_retry(max_attempts: Option<u32>) -> RetryPolicy {
    RetryPolicy {
        delay: Duration::from_millis(50),
        max_attempts,
    }
}

/// A local target that accepts and holds every connection.
async fn holding_target() -> (u16, Arc<Mutex<Vec<TcpStream>>>) {
    let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let held = Arc::new(Mutex::new(Vec::new()));
    let sink = held.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            sink.lock().unwrap().push(stream);
        }
    });
    (port, held)
}

/// A port nothing listens on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn cluster_keeps_the_link_count_until_closed() {
    init_tracing();
    let pool = SocketPool::new("links", 3, LOOPBACK);
    let remote_port = pool.listen().await.unwrap();
    let (local_port, _held) = holding_target().await;

    let session = within(
        "first link",
        TunnelSession::establish(
            tunnel_info(remote_port, local_port, 3),
            LocalTarget::plain("127.0.0.1", local_port),
            quick_retry(None),
        ),
    )
    .await
    .unwrap();

    eventually("three links", || {
        pool.stats().connected_sockets == 3 && session.tunnel_count() == 3
    })
    .await;

    // Take every link, kill one, give the rest back.
    let mut lent = Vec::new();
    for _ in 0..3 {
        lent.push(within("acquire", pool.acquire()).await.unwrap());
    }
    let first_ids: Vec<u64> = lent.iter().map(|s| s.id()).collect();
    drop(lent.pop());
    for socket in lent {
        pool.release(socket);
    }

    // The replacement shows up as a socket the pool has not seen before.
    let mut again = Vec::new();
    for _ in 0..3 {
        again.push(within("acquire after replacement", pool.acquire()).await.unwrap());
    }
    assert!(again.iter().any(|s| !first_ids.contains(&s.id())));
    for socket in again {
        pool.release(socket);
    }
    eventually("back to three", || session.tunnel_count() == 3).await;

    session.close();
    assert!(session.is_closed());
    eventually("links torn down", || {
        pool.stats().connected_sockets == 0 && session.tunnel_count() == 0
    })
    .await;

    sleep(Duration::from_millis(300)).await;
    assert_eq!(pool.stats().connected_sockets, 0);
    assert_eq!(session.tunnel_count(), 0);
}

#[tokio::test]
async fn unreachable_relay_exhausts_retries() {
    init_tracing();
    let remote_port = closed_port().await;
    let (local_port, _held) = holding_target().await;

    let result = within(
        "giving up",
        TunnelSession::establish(
            tunnel_info(remote_port, local_port, 3),
            LocalTarget::plain("127.0.0.1", local_port),
            quick_retry(Some(2)),
        ),
    )
    .await;

    match result {
        Err(TunnelError::RetriesExhausted { attempts, .. }) => assert!(attempts >= 2),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("connected to a closed port"),
    }
}

#[tokio::test]
async fn link_waits_for_the_local_target() {
    init_tracing();
    let pool = SocketPool::new("links", 1, LOOPBACK);
    let remote_port = pool.listen().await.unwrap();
    let local_port = closed_port().await;

    let session = within(
        "link connected",
        TunnelSession::establish(
            tunnel_info(remote_port, local_port, 1),
            LocalTarget::plain("127.0.0.1", local_port),
            quick_retry(None),
        ),
    )
    .await
    .unwrap();
    assert_eq!(session.tunnel_count(), 1);

    // Let a few local dials fail first.
    sleep(Duration::from_millis(200)).await;
    let listener = TcpListener::bind((LOOPBACK, local_port)).await.unwrap();

    let mut relay_side = within("acquire", pool.acquire()).await.unwrap();
    relay_side.write_all(b"hello").await.unwrap();

    let (mut local_side, _) = within("local accept", listener.accept()).await.unwrap();
    let mut buf = [0u8; 5];
    within("local read", local_side.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"hello");

    local_side.write_all(b"world").await.unwrap();
    within("relay read", relay_side.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"world");

    // Still the one link it started with.
    assert_eq!(session.tunnel_count(), 1);
    assert_eq!(pool.stats().connected_sockets, 1);
}

#[tokio::test]
async fn failing_local_target_is_redialed_after_the_retry_delay() {
    init_tracing();
    let pool = SocketPool::new("links", 1, LOOPBACK);
    let remote_port = pool.listen().await.unwrap();

    // Accepts and hangs up at once, so every TLS handshake fails.
    let local = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let local_port = local.local_addr().unwrap().port();
    let dials = Arc::new(AtomicUsize::new(0));
    let counted = dials.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = local.accept().await {
            counted.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let tls = LocalTls {
        allow_invalid_cert: true,
        ..Default::default()
    };
    let target = LocalTarget::new(Some("127.0.0.1"), local_port, Some(&tls)).unwrap();
    let _session = within(
        "link connected",
        TunnelSession::establish(
            tunnel_info(remote_port, local_port, 1),
            target,
            RetryPolicy {
                delay: Duration::from_millis(400),
                max_attempts: None,
            },
        ),
    )
    .await
    .unwrap();

    sleep(Duration::from_millis(1000)).await;
    let seen = dials.load(Ordering::SeqCst);
    assert!(seen >= 2, "local target dialed {} times", seen);
    assert!(seen <= 4, "local target dialed {} times in one second", seen);
}
