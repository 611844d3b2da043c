//! Session lifecycle: id assignment, grace period, removal.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;

use common::{eventually, init_tracing};
use tunnel_relay::server::{PoolError, RegistryError, RegistryOptions, SessionRegistry};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn registry(grace: Duration) -> SessionRegistry {
    SessionRegistry::new(RegistryOptions {
        max_sockets: 2,
        grace_period: grace,
        bind_addr: LOOPBACK,
    })
}

#[tokio::test]
async fn requested_id_is_honored_once() {
    init_tracing();
    let registry = registry(Duration::from_secs(5));

    let first = registry.create_session(Some("foo-bar")).await.unwrap();
    assert_eq!(first.id, "foo-bar");
    assert_eq!(first.max_conn_count, 2);
    assert_ne!(first.port, 0);

    let second = registry.create_session(Some("foo-bar")).await.unwrap();
    assert_ne!(second.id, "foo-bar");
    assert_ne!(second.port, first.port);

    assert!(registry.contains("foo-bar"));
    assert!(registry.contains(&second.id));
    assert_eq!(registry.tunnel_count(), 2);
}

#[tokio::test]
async fn generated_ids_are_distinct() {
    init_tracing();
    let registry = registry(Duration::from_secs(5));
    let a = registry.create_session(None).await.unwrap();
    let b = registry.create_session(None).await.unwrap();
    assert_ne!(a.id, b.id);
    assert!(registry.get(&a.id).is_some());
}

#[tokio::test]
async fn session_without_links_expires() {
    init_tracing();
    let registry = registry(Duration::from_millis(200));
    let created = registry.create_session(Some("never-connects")).await.unwrap();
    assert!(registry.contains(&created.id));

    eventually("session removed", || !registry.contains(&created.id)).await;
    assert_eq!(registry.tunnel_count(), 0);
}

#[tokio::test]
async fn reconnect_within_grace_keeps_the_session() {
    init_tracing();
    let registry = registry(Duration::from_millis(400));
    let created = registry.create_session(Some("flaky")).await.unwrap();
    let session = registry.get("flaky").unwrap();

    let link = TcpStream::connect((LOOPBACK, created.port)).await.unwrap();
    eventually("link counted", || session.stats().connected_sockets == 1).await;

    drop(link);
    eventually("link gone", || session.stats().connected_sockets == 0).await;
    sleep(Duration::from_millis(150)).await;
    let _back = TcpStream::connect((LOOPBACK, created.port)).await.unwrap();
    eventually("link back", || session.stats().connected_sockets == 1).await;

    // Well past the original window.
    sleep(Duration::from_millis(600)).await;
    assert!(registry.contains("flaky"));
    assert!(!session.pool().is_closed());
}

#[tokio::test]
async fn offline_past_grace_frees_the_id() {
    init_tracing();
    let registry = registry(Duration::from_millis(200));
    let created = registry.create_session(Some("gone")).await.unwrap();
    let session = registry.get("gone").unwrap();

    let link = TcpStream::connect((LOOPBACK, created.port)).await.unwrap();
    eventually("link counted", || session.stats().connected_sockets == 1).await;
    drop(link);

    eventually("session removed", || !registry.contains("gone")).await;
    assert!(session.pool().is_closed());

    let again = registry.create_session(Some("gone")).await.unwrap();
    assert_eq!(again.id, "gone");
}

#[tokio::test]
async fn remove_session_is_idempotent() {
    init_tracing();
    let registry = registry(Duration::from_secs(5));
    let created = registry.create_session(None).await.unwrap();
    let session = registry.get(&created.id).unwrap();

    registry.remove_session(&created.id);
    registry.remove_session(&created.id);
    registry.remove_session("never-existed");

    assert!(!registry.contains(&created.id));
    assert!(session.pool().is_closed());
    assert_eq!(registry.tunnel_count(), 0);
}

#[tokio::test]
async fn concurrent_requests_for_one_id_get_distinct_sessions() {
    init_tracing();
    let registry = registry(Duration::from_secs(5));

    let (a, b) = tokio::join!(
        registry.create_session(Some("foo-bar")),
        registry.create_session(Some("foo-bar"))
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.id, b.id);
    assert!(a.id == "foo-bar" || b.id == "foo-bar");
    assert_ne!(a.port, b.port);
    assert_eq!(registry.tunnel_count(), 2);
}

#[tokio::test]
async fn failed_bind_releases_the_id() {
    init_tracing();
    // TEST-NET-1 is never a local address, so binding to it fails.
    let registry = SessionRegistry::new(RegistryOptions {
        max_sockets: 2,
        grace_period: Duration::from_secs(5),
        bind_addr: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
    });

    let err = registry.create_session(Some("no-bind")).await.unwrap_err();
    assert!(matches!(err, RegistryError::Pool(PoolError::Bind(_))), "{:?}", err);
    assert!(!registry.contains("no-bind"));
    assert_eq!(registry.tunnel_count(), 0);
}
