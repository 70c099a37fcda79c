//! Bidirectional forwarding between two streams.
//!
//! Two independent pumps, one per direction, each with its own 8 KiB buffer.
//! EOF on one direction half-closes the peer's write side and lets the other
//! direction keep draining. A shared activity clock feeds the idle watchdog;
//! it is touched on every forwarded byte.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::errors::RelayError;

/// Per-direction copy buffer size.
pub const RELAY_BUF_SIZE: usize = 8 * 1024;

/// Last-activity timestamp shared by both pumps and the idle watchdog.
#[derive(Debug)]
pub struct ActivityClock {
    last: Mutex<Instant>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    pub fn last(&self) -> Instant {
        *self.last.lock()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Pump one direction until EOF, then half-close the write side.
/// Returns the number of bytes forwarded.
async fn copy_half<R, W>(mut rd: R, mut wr: W, clock: Arc<ActivityClock>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            wr.shutdown().await?;
            return Ok(total);
        }
        wr.write_all(&buf[..n]).await?;
        clock.touch();
        total += n as u64;
    }
}

/// Run both pumps to completion, bounded by the idle deadline.
///
/// Returns `(client_to_upstream, upstream_to_client)` byte counts. Any pump
/// error tears down the other direction immediately; idle expiry maps to
/// [`RelayError::Timeout`].
pub async fn relay_streams(
    client: TcpStream,
    upstream: TcpStream,
    idle_timeout: Duration,
) -> Result<(u64, u64), RelayError> {
    let clock = Arc::new(ActivityClock::new());
    let (client_rd, client_wr) = client.into_split();
    let (upstream_rd, upstream_wr) = upstream.into_split();

    let pumps = async {
        tokio::try_join!(
            copy_half(client_rd, upstream_wr, clock.clone()),
            copy_half(upstream_rd, client_wr, clock.clone()),
        )
    };
    tokio::pin!(pumps);

    let watchdog = idle_watchdog(clock.clone(), idle_timeout);
    tokio::pin!(watchdog);

    tokio::select! {
        res = &mut pumps => {
            let (up, down) = res?;
            Ok((up, down))
        }
        () = &mut watchdog => Err(RelayError::Timeout {
            after: idle_timeout,
            phase: "relay idle",
        }),
    }
}

/// Resolve once the clock has been quiet for `idle` straight.
async fn idle_watchdog(clock: Arc<ActivityClock>, idle: Duration) {
    loop {
        let deadline = clock.last() + idle;
        tokio::time::sleep_until(deadline).await;
        if clock.last() + idle <= Instant::now() {
            return;
        }
    }
}
