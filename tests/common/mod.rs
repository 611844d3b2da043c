//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One-time tracing initialization. Use RUST_LOG=debug for verbose output.
pub fn init_tracing() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Polls `condition` until it holds, panicking after [`TEST_TIMEOUT`].
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Awaits `fut`, panicking after [`TEST_TIMEOUT`].
pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    match timeout(TEST_TIMEOUT, fut).await {
        Ok(out) => out,
        Err(_) => panic!("timed out waiting for {}", what),
    }
}
