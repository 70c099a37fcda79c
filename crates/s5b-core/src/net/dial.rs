//! Dialing helpers: DNS → `SocketAddr` candidates → connect with a
//! per-attempt timeout; first success wins, failures are merged.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

/// Resolve `host:port` to all candidate addresses.
pub async fn resolve(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address for {host}:{port}"),
        ));
    }
    Ok(addrs)
}

/// Try each address in turn, each under its own `per_attempt` timeout.
pub async fn connect_any(addrs: &[SocketAddr], per_attempt: Duration) -> io::Result<TcpStream> {
    let mut last_err: Option<io::Error> = None;
    for sa in addrs {
        match timeout(per_attempt, TcpStream::connect(sa)).await {
            Ok(Ok(s)) => return Ok(s),
            Ok(Err(e)) => {
                last_err = Some(io::Error::new(e.kind(), format!("connect {sa}: {e}")));
            }
            Err(_) => {
                last_err = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect {sa} timed out"),
                ));
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address to dial")))
}

/// Resolve and connect in one step.
pub async fn dial(host: &str, port: u16, per_attempt: Duration) -> io::Result<TcpStream> {
    let addrs = resolve(host, port).await?;
    connect_any(&addrs, per_attempt).await
}
