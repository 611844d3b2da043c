//! Registry counters as rendered by the Prometheus exporter.
//!
//! Installs the global recorder, so it lives in its own test binary.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use common::init_tracing;
use tunnel_relay::server::metrics::{init_metrics, names};
use tunnel_relay::server::{RegistryOptions, SessionRegistry};

fn registry(bind_addr: IpAddr) -> SessionRegistry {
    SessionRegistry::new(RegistryOptions {
        max_sockets: 1,
        grace_period: Duration::from_secs(5),
        bind_addr,
    })
}

fn counter(rendered: &str, name: &str) -> Option<u64> {
    rendered
        .lines()
        .find(|line| line.split_whitespace().next() == Some(name))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v as u64)
}

#[tokio::test]
async fn tunnels_are_counted_only_once_bound() {
    init_tracing();
    let handle = init_metrics().unwrap();

    let unbindable = registry(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
    assert!(unbindable.create_session(Some("custom-one")).await.is_err());
    let rendered = handle.render();
    assert_eq!(counter(&rendered, names::TOTAL_CUSTOM_SUBDOMAIN_TUNNELS).unwrap_or(0), 0);
    assert_eq!(counter(&rendered, names::TOTAL_CREATED_TUNNELS).unwrap_or(0), 0);

    let local = registry(IpAddr::V4(Ipv4Addr::LOCALHOST));
    local.create_session(Some("custom-one")).await.unwrap();
    local.create_session(Some("custom-one")).await.unwrap();
    let rendered = handle.render();
    assert_eq!(counter(&rendered, names::TOTAL_CUSTOM_SUBDOMAIN_TUNNELS), Some(1));
    assert_eq!(counter(&rendered, names::TOTAL_CREATED_TUNNELS), Some(2));
}
