use crate::error::is_peer_closed;
use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// RELAY_BUFFER_SIZE is the per-direction copy buffer
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// DEFAULT_LINGER bounds how long the second direction may sit idle
/// after the first one has finished
pub const DEFAULT_LINGER: Duration = Duration::from_secs(2);

/// RelayOptions tunes a single relay
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub buffer_size: usize,
    pub linger: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: RELAY_BUFFER_SIZE,
            linger: DEFAULT_LINGER,
        }
    }
}

/// RelayStats holds the bytes moved in each direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// relay pumps bytes between `a` and `b` with the default options
pub async fn relay<A, B>(a: A, b: B, shutdown: &CancellationToken) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    relay_with(a, b, shutdown, RelayOptions::default()).await
}

/// relay_with runs both copy directions concurrently and always completes.
///
/// When one direction finishes, the write side of its destination is shut
/// down so the peer sees end-of-stream, and the relay waits for the other
/// direction. That wait only ends early if the remaining direction moves no
/// bytes for `opts.linger`. A shutdown signal ends the relay at once.
/// Errors are logged, never returned.
pub async fn relay_with<A, B>(
    a: A,
    b: B,
    shutdown: &CancellationToken,
    opts: RelayOptions,
) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    let forward = copy_half(&mut a_read, &mut b_write, opts.buffer_size, &a_to_b, "a->b");
    let backward = copy_half(&mut b_read, &mut a_write, opts.buffer_size, &b_to_a, "b->a");
    tokio::pin!(forward);
    tokio::pin!(backward);

    // Fan-in: whichever direction ends first, the other gets a bounded linger
    tokio::select! {
        _ = shutdown.cancelled() => {
            debug!("relay interrupted by shutdown");
        }
        _ = &mut forward => {
            linger(&mut backward, &b_to_a, shutdown, opts.linger).await;
        }
        _ = &mut backward => {
            linger(&mut forward, &a_to_b, shutdown, opts.linger).await;
        }
    }

    RelayStats {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
    }
}

/// linger waits for the remaining direction to finish, giving up once it
/// stops making progress for `idle`
async fn linger<F>(
    remaining: &mut F,
    progress: &AtomicU64,
    shutdown: &CancellationToken,
    idle: Duration,
) where
    F: Future<Output = ()> + Unpin,
{
    let mut seen = progress.load(Ordering::Relaxed);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = &mut *remaining => return,
            _ = tokio::time::sleep(idle) => {
                let moved = progress.load(Ordering::Relaxed);
                if moved == seen {
                    debug!("relay peer idle after half-close, closing both sides");
                    return;
                }
                seen = moved;
            }
        }
    }
}

/// copy_half copies until end-of-stream or error, then shuts the writer down
async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    counter: &AtomicU64,
    direction: &'static str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log_copy_error(direction, &e);
                break;
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            log_copy_error(direction, &e);
            break;
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    // Wake the peer's reader so the opposite direction can finish too
    if let Err(e) = writer.shutdown().await {
        if !is_peer_closed(&e) {
            debug!(direction, "failed to shut down relay writer: {e}");
        }
    }
}

fn log_copy_error(direction: &'static str, err: &io::Error) {
    if is_peer_closed(err) {
        debug!(direction, "relay peer closed: {err}");
    } else {
        error!(direction, "failed to copy relay data: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn fast_linger() -> RelayOptions {
        RelayOptions {
            linger: Duration::from_millis(300),
            ..RelayOptions::default()
        }
    }

    #[tokio::test]
    async fn test_relay_moves_bytes_both_ways() {
        let (mut a_outer, a_inner) = duplex(1024);
        let (mut b_outer, b_inner) = duplex(1024);
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let handle =
            tokio::spawn(async move { relay_with(a_inner, b_inner, &token, fast_linger()).await });

        a_outer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_outer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        a_outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(a_outer);
        drop(b_outer);
        let stats = handle.await.unwrap();
        assert_eq!(stats, RelayStats { a_to_b: 4, b_to_a: 5 });
    }

    #[tokio::test]
    async fn test_closing_either_side_ends_relay() {
        for close_a in [true, false] {
            let (a_outer, a_inner) = duplex(1024);
            let (b_outer, b_inner) = duplex(1024);
            let shutdown = CancellationToken::new();

            let token = shutdown.clone();
            let handle = tokio::spawn(async move {
                relay_with(a_inner, b_inner, &token, fast_linger()).await
            });

            // Close one endpoint and keep the other one open and idle
            let _kept = if close_a {
                drop(a_outer);
                b_outer
            } else {
                drop(b_outer);
                a_outer
            };

            let res = tokio::time::timeout(Duration::from_secs(2), handle).await;
            assert!(res.is_ok(), "relay did not finish (close_a = {close_a})");
        }
    }

    #[tokio::test]
    async fn test_half_close_propagates() {
        let (mut a_outer, a_inner) = duplex(1024);
        let (mut b_outer, b_inner) = duplex(1024);
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let handle =
            tokio::spawn(async move { relay_with(a_inner, b_inner, &token, fast_linger()).await });

        a_outer.write_all(b"request").await.unwrap();
        a_outer.shutdown().await.unwrap();

        // b sees the payload followed by end-of-stream
        let mut received = Vec::new();
        b_outer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");

        // The other direction keeps flowing after the half-close
        b_outer.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        a_outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        drop(b_outer);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reply_outlives_linger_after_half_close() {
        let (mut a_outer, a_inner) = duplex(1024);
        let (mut b_outer, b_inner) = duplex(1024);
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { relay(a_inner, b_inner, &token).await });

        a_outer.write_all(b"request").await.unwrap();
        a_outer.shutdown().await.unwrap();

        // One byte per second, twice as long as the idle bound
        let writer = tokio::spawn(async move {
            let mut request = Vec::new();
            b_outer.read_to_end(&mut request).await.unwrap();
            for byte in b"slow" {
                tokio::time::sleep(Duration::from_secs(1)).await;
                b_outer.write_all(&[*byte]).await.unwrap();
            }
            request
        });

        let mut response = Vec::new();
        a_outer.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"slow");
        assert_eq!(writer.await.unwrap(), b"request");

        let stats = handle.await.unwrap();
        assert_eq!(stats, RelayStats { a_to_b: 7, b_to_a: 4 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_direction_is_cut_after_linger() {
        let (mut a_outer, a_inner) = duplex(1024);
        let (_b_outer, b_inner) = duplex(1024);
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { relay(a_inner, b_inner, &token).await });

        a_outer.shutdown().await.unwrap();
        let started = tokio::time::Instant::now();
        handle.await.unwrap();
        assert!(started.elapsed() >= DEFAULT_LINGER);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_idle_relay() {
        let (_a_outer, a_inner) = duplex(1024);
        let (_b_outer, b_inner) = duplex(1024);
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { relay(a_inner, b_inner, &token).await });

        shutdown.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(res.is_ok());
    }
}
