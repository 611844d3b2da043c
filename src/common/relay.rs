//! Bidirectional byte relaying between two streams.

use crate::common::errors::is_peer_churn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};

pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Copies `reader` into `writer` until EOF or an error, then half-closes
/// `writer` so the far end observes the end of this direction.
pub async fn pump<R, W>(direction: &str, mut reader: R, mut writer: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total_bytes: u64 = 0;

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                debug!("{}: source closed", direction);
                break;
            }
            Ok(n) => {
                if let Err(e) = writer.write_all(&buffer[..n]).await {
                    log_io_error(direction, "write", &e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    log_io_error(direction, "flush", &e);
                    break;
                }
                total_bytes += n as u64;
            }
            Err(e) => {
                log_io_error(direction, "read", &e);
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    total_bytes
}

pub(crate) fn log_io_error(direction: &str, op: &str, e: &std::io::Error) {
    if is_peer_churn(e) {
        debug!("{}: {} ended by peer: {}", direction, op, e);
    } else {
        error!("{}: {} error: {}", direction, op, e);
    }
}

/// Splices two duplex streams together until both directions finish.
///
/// Returns `(a_to_b, b_to_a)` byte counts.
pub async fn splice<A, B>(session: &str, a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);

    let a_to_b = format!("{session} ->");
    let b_to_a = format!("{session} <-");
    let (up, down) = tokio::join!(pump(&a_to_b, ar, bw), pump(&b_to_a, br, aw));

    log_transfer_summary(session, "->", up);
    log_transfer_summary(session, "<-", down);
    (up, down)
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

pub fn log_transfer_summary(session_id: &str, direction: &str, bytes: u64) {
    info!(
        "Session {}: {} transferred {}",
        session_id,
        direction,
        format_bytes(bytes)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_human_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[tokio::test]
    async fn splice_moves_bytes_both_ways() {
        let (mut left, a) = tokio::io::duplex(64);
        let (b, mut right) = tokio::io::duplex(64);

        let task = tokio::spawn(async move { splice("test", a, b).await });

        left.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(left);
        drop(right);
        assert_eq!(task.await.unwrap(), (4, 5));
    }
}
