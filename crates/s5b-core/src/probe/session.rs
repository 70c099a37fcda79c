//! One-shot liveness probe against a single backend.
//!
//! A session fires exactly one of its two callbacks, exactly once, then
//! releases itself from the owning [`Prober`](super::Prober). The callback
//! pair is taken out of the session immediately before invocation, so a
//! concurrent `stop()` can never produce a second call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::net::dial;
use crate::socks5;

use super::Prober;

/// Probe protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Resolve + connect + close.
    Tcp,
    /// Full SOCKS5 handshake and CONNECT to the sentinel target.
    Socks5,
    /// HTTP GET through the backend tunnel, status line checked.
    Http,
}

/// Backend endpoint a probe runs against.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    pub auth_user: Option<String>,
    pub auth_password: Option<String>,
}

/// Prober-wide probe parameters.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Budget for resolve + connect.
    pub connect_timeout: Duration,
    /// Budget for the whole probe.
    pub total_timeout: Duration,
    /// CONNECT sentinel for the SOCKS5 probe.
    pub test_remote_host: String,
    pub test_remote_port: u16,
    /// GET target for the HTTP probe.
    pub test_http_url: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(60),
            test_remote_host: "www.google.com".to_string(),
            test_remote_port: 443,
            test_http_url: String::new(),
        }
    }
}

pub(super) struct Callbacks {
    pub(super) on_ok: Box<dyn FnOnce(Duration) + Send>,
    pub(super) on_err: Box<dyn FnOnce(String) + Send>,
}

/// A single outstanding probe. Owned by [`Prober`]; holds only a weak
/// back-reference so a finished session cannot keep its owner alive.
pub struct ProbeSession {
    pub(super) id: u64,
    kind: ProbeKind,
    target: ProbeTarget,
    delay: Duration,
    settings: ProbeSettings,
    owner: Weak<Prober>,
    callbacks: Mutex<Option<Callbacks>>,
    complete: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProbeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("target", &format_args!("{}:{}", self.target.host, self.target.port))
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl ProbeSession {
    pub(super) fn new(
        id: u64,
        kind: ProbeKind,
        target: ProbeTarget,
        delay: Duration,
        settings: ProbeSettings,
        owner: Weak<Prober>,
    ) -> Self {
        Self {
            id,
            kind,
            target,
            delay,
            settings,
            owner,
            callbacks: Mutex::new(None),
            complete: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ProbeKind {
        self.kind
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Arm the callbacks and start the probe after its jitter delay.
    pub fn run(
        self: &Arc<Self>,
        on_ok: impl FnOnce(Duration) + Send + 'static,
        on_err: impl FnOnce(String) + Send + 'static,
    ) {
        *self.callbacks.lock() = Some(Callbacks {
            on_ok: Box::new(on_ok),
            on_err: Box::new(on_err),
        });
        let sess = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if !sess.delay.is_zero() {
                tokio::time::sleep(sess.delay).await;
            }
            let start = Instant::now();
            let outcome = match tokio::time::timeout(sess.settings.total_timeout, sess.execute())
                .await
            {
                Ok(Ok(())) => Ok(start.elapsed()),
                Ok(Err(msg)) => Err(msg),
                Err(_) => Err(format!(
                    "Timeout after {:?} probing {}:{}",
                    sess.settings.total_timeout, sess.target.host, sess.target.port
                )),
            };
            sess.finish(outcome);
        });
        *self.task.lock() = Some(handle);
    }

    /// Abort any in-flight I/O and suppress the callbacks.
    pub fn stop(&self) {
        drop(self.callbacks.lock().take());
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.complete.store(true, Ordering::SeqCst);
        self.release();
    }

    /// Deliver the outcome: release first, callback last.
    fn finish(&self, outcome: Result<Duration, String>) {
        let callbacks = self.callbacks.lock().take();
        self.complete.store(true, Ordering::SeqCst);
        self.release();
        match (callbacks, outcome) {
            (Some(cb), Ok(latency)) => (cb.on_ok)(latency),
            (Some(cb), Err(message)) => {
                tracing::debug!(
                    probe = self.id,
                    dest = %format_args!("{}:{}", self.target.host, self.target.port),
                    error = %message,
                    "probe failed"
                );
                (cb.on_err)(message);
            }
            (None, _) => {} // stopped mid-flight
        }
    }

    fn release(&self) {
        match self.owner.upgrade() {
            Some(prober) => prober.release(self.id),
            None => tracing::warn!(probe = self.id, "probe release: owner already gone"),
        }
    }

    async fn execute(&self) -> Result<(), String> {
        let host = self.target.host.as_str();
        let port = self.target.port;
        match self.kind {
            ProbeKind::Tcp => {
                dial::dial(host, port, self.settings.connect_timeout)
                    .await
                    .map_err(|e| format!("tcp probe {host}:{port}: {e}"))?;
                Ok(())
            }
            ProbeKind::Socks5 => {
                let mut stream = dial::dial(host, port, self.settings.connect_timeout)
                    .await
                    .map_err(|e| format!("socks5 probe {host}:{port}: {e}"))?;
                socks5::connect_through(
                    &mut stream,
                    self.target.auth_user.as_deref(),
                    self.target.auth_password.as_deref(),
                    &self.settings.test_remote_host,
                    self.settings.test_remote_port,
                )
                .await
                .map_err(|e| format!("socks5 probe {host}:{port}: {e}"))?;
                Ok(())
            }
            ProbeKind::Http => {
                let (url_host, url_port, https, path) =
                    parse_test_url(&self.settings.test_http_url)
                        .map_err(|e| format!("http probe {host}:{port}: {e}"))?;
                let mut stream = dial::dial(host, port, self.settings.connect_timeout)
                    .await
                    .map_err(|e| format!("http probe {host}:{port}: {e}"))?;
                socks5::connect_through(
                    &mut stream,
                    self.target.auth_user.as_deref(),
                    self.target.auth_password.as_deref(),
                    &url_host,
                    url_port,
                )
                .await
                .map_err(|e| format!("http probe {host}:{port}: {e}"))?;
                if https {
                    // Tunnel establishment is the whole check; the payload
                    // would be TLS and TLS is out of scope.
                    return Ok(());
                }
                let request = format!(
                    "GET {path} HTTP/1.1\r\nHost: {url_host}\r\nConnection: close\r\n\r\n"
                );
                stream
                    .write_all(request.as_bytes())
                    .await
                    .map_err(|e| format!("http probe {host}:{port}: write: {e}"))?;
                let mut buf = [0u8; 1024];
                let n = stream
                    .read(&mut buf)
                    .await
                    .map_err(|e| format!("http probe {host}:{port}: read: {e}"))?;
                check_status_line(&buf[..n])
                    .map_err(|e| format!("http probe {host}:{port}: {e}"))
            }
        }
    }
}

/// Split `http://host[:port]/path` (or https) into parts.
fn parse_test_url(url: &str) -> Result<(String, u16, bool, String), String> {
    let (rest, https, default_port) = if let Some(r) = url.strip_prefix("https://") {
        (r, true, 443)
    } else if let Some(r) = url.strip_prefix("http://") {
        (r, false, 80)
    } else {
        return Err(format!("unsupported test url {url:?}"));
    };
    let (authority, path) = rest
        .split_once('/')
        .map(|(a, p)| (a, format!("/{p}")))
        .unwrap_or((rest, "/".to_string()));
    let (host, port) = match authority.split_once(':') {
        Some((h, p)) => (
            h.to_string(),
            p.parse::<u16>()
                .map_err(|_| format!("bad port in test url {url:?}"))?,
        ),
        None => (authority.to_string(), default_port),
    };
    if host.is_empty() {
        return Err(format!("empty host in test url {url:?}"));
    }
    Ok((host, port, https, path))
}

/// Accept any parseable `HTTP/1.x <code>` status line.
fn check_status_line(buf: &[u8]) -> Result<(), String> {
    let text = std::str::from_utf8(buf).unwrap_or("");
    if !text.starts_with("HTTP/1.") {
        return Err("HTTP status-line unparseable".to_string());
    }
    match text.split_whitespace().nth(1).and_then(|c| c.parse::<u16>().ok()) {
        Some(_) => Ok(()),
        None => Err("HTTP status-line unparseable".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_http_url() {
        let (host, port, https, path) =
            parse_test_url("http://www.google.com/generate_204").unwrap();
        assert_eq!(host, "www.google.com");
        assert_eq!(port, 80);
        assert!(!https);
        assert_eq!(path, "/generate_204");
    }

    #[test]
    fn parse_https_url_with_port() {
        let (host, port, https, path) = parse_test_url("https://example.com:8443/ok").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8443);
        assert!(https);
        assert_eq!(path, "/ok");
    }

    #[test]
    fn reject_other_schemes() {
        assert!(parse_test_url("ftp://example.com/").is_err());
        assert!(parse_test_url("example.com").is_err());
    }

    #[test]
    fn status_line_parsing() {
        assert!(check_status_line(b"HTTP/1.1 204 No Content\r\n\r\n").is_ok());
        assert!(check_status_line(b"HTTP/1.0 500 Oops\r\n").is_ok());
        assert!(check_status_line(b"SSH-2.0-OpenSSH\r\n").is_err());
        assert!(check_status_line(b"HTTP/1.1 abc\r\n").is_err());
        assert!(check_status_line(b"").is_err());
    }
}
