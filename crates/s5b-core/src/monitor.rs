//! State monitor: a small HTTP/1.1 surface over the pool and the relay
//! registry.
//!
//! Endpoints:
//!   GET /            → HTML dashboard (backend table + live counts)
//!   GET /op?...      → enable=<idx> | disable=<idx> | forceNowCheck=1 |
//!                      resetLastConnectFailed=<idx>
//!   GET /per_info    → JSON snapshot per backend + live session info
//!   GET /delay_info  → JSON latency sample history per backend
//!
//! GET only, no bodies; anything else is a 404/405 JSON error. Each
//! connection gets a 60 s processing deadline.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::pool::{HealthChecker, UpstreamPool};
use crate::relay::RelayServer;

/// Per-connection processing deadline.
const CONNECTION_DEADLINE: Duration = Duration::from_secs(60);

/// HTTP monitor over pool state and relay registry.
pub struct MonitorServer {
    pool: Arc<UpstreamPool>,
    checker: Arc<HealthChecker>,
    relay: Arc<RelayServer>,
    start_time: SystemTime,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for MonitorServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl MonitorServer {
    pub async fn bind(
        pool: Arc<UpstreamPool>,
        checker: Arc<HealthChecker>,
        relay: Arc<RelayServer>,
        addr: &str,
    ) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Arc::new(Self {
            pool,
            checker,
            relay,
            start_time: SystemTime::now(),
            local_addr,
            listener: Mutex::new(Some(listener)),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn start(self: &Arc<Self>) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        tracing::info!(addr = %self.local_addr, "state monitor listening");
        let me = Arc::clone(self);
        self.tasks.lock().push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let server = Arc::clone(&me);
                        tokio::spawn(async move {
                            let res = tokio::time::timeout(
                                CONNECTION_DEADLINE,
                                server.handle(stream),
                            )
                            .await;
                            if let Ok(Err(e)) = res {
                                tracing::debug!(error = %e, "monitor request failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "monitor accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }));
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn handle(&self, mut stream: TcpStream) -> io::Result<()> {
        let (rd, mut wr) = stream.split();
        let mut reader = BufReader::new(rd);

        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;
        let (method, target) = parse_request_line(&request_line);
        // Drain headers; nothing in them matters for this surface.
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            if line.trim().is_empty() {
                break;
            }
        }

        if method != "GET" {
            return write_json(&mut wr, 405, r#"{"error":"method_not_allowed"}"#).await;
        }
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, q),
            None => (target, ""),
        };
        match path {
            "/" => {
                let page = self.dashboard();
                write_response(&mut wr, 200, "text/html; charset=utf-8", page.as_bytes()).await
            }
            "/op" => self.handle_op(&mut wr, query).await,
            "/per_info" => {
                let body = self.per_info().to_string();
                write_json(&mut wr, 200, &body).await
            }
            "/delay_info" => {
                let body = self.delay_info().to_string();
                write_json(&mut wr, 200, &body).await
            }
            _ => write_json(&mut wr, 404, r#"{"error":"not_found"}"#).await,
        }
    }

    async fn handle_op<W>(&self, wr: &mut W, query: &str) -> io::Result<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        for (key, value) in parse_query(query) {
            match key.as_str() {
                "enable" => match self.set_disable(&value, false) {
                    Ok(()) => {}
                    Err(e) => return write_json(wr, 400, &error_body(&e)).await,
                },
                "disable" => match self.set_disable(&value, true) {
                    Ok(()) => {}
                    Err(e) => return write_json(wr, 400, &error_body(&e)).await,
                },
                "forceNowCheck" => {
                    self.checker.force_check_now();
                }
                "resetLastConnectFailed" => match self.backend_for(&value) {
                    Ok(backend) => backend.reset_last_connect_failed(),
                    Err(e) => return write_json(wr, 400, &error_body(&e)).await,
                },
                _ => {} // unrecognized keys are ignored
            }
        }
        write_json(wr, 200, r#"{"ok":true}"#).await
    }

    fn backend_for(&self, value: &str) -> Result<Arc<crate::pool::Backend>, String> {
        let idx: usize = value
            .parse()
            .map_err(|_| format!("bad backend index {value:?}"))?;
        self.pool
            .backend(idx)
            .cloned()
            .ok_or_else(|| format!("backend index {idx} out of range"))
    }

    fn set_disable(&self, value: &str, disable: bool) -> Result<(), String> {
        let backend = self.backend_for(value)?;
        backend.set_manual_disable(disable);
        tracing::info!(backend = %backend.name, disable, "manual backend toggle");
        Ok(())
    }

    fn per_info(&self) -> serde_json::Value {
        let now_ms = epoch_ms(SystemTime::now());
        let start_ms = epoch_ms(self.start_time);
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "rule": self.pool.rule().to_string(),
            "lastUseUpstreamIndex": self.pool.last_use_index(),
            "upstream": self.pool.snapshot(),
            "liveSessionCount": self.relay.live_count(),
            "relayingCount": self.relay.relaying_count(),
            "sessions": self.relay.session_snapshots(),
            "startTime": start_ms,
            "uptimeMs": now_ms.saturating_sub(start_ms),
        })
    }

    fn delay_info(&self) -> serde_json::Value {
        let upstream: Vec<serde_json::Value> = self
            .pool
            .backends()
            .iter()
            .map(|b| {
                serde_json::json!({
                    "name": b.name,
                    "tcpPingHistory": b.tcp_ping_history(),
                    "connectPingHistory": b.connect_ping_history(),
                })
            })
            .collect();
        serde_json::json!({ "upstream": upstream })
    }

    fn dashboard(&self) -> String {
        let mut rows = String::new();
        for snap in self.pool.snapshot() {
            rows.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}:{}</td><td>{}</td><td>{}</td>\
                 <td>{}</td><td>{}</td><td>{}</td></tr>\n",
                snap.index,
                snap.name,
                snap.host,
                snap.port,
                if snap.is_working { "up" } else { "down" },
                snap.connect_count,
                snap.tcp_ping.map_or("-".to_string(), |v| format!("{v} ms")),
                snap.connect_ping.map_or("-".to_string(), |v| format!("{v} ms")),
                if snap.is_manual_disable { "disabled" } else { "" },
            ));
        }
        format!(
            "<!DOCTYPE html><html><head><title>socks5-balancer</title></head><body>\
             <h1>socks5-balancer</h1>\
             <p>rule: {} | live sessions: {} | relaying: {}</p>\
             <table border=\"1\"><tr><th>#</th><th>name</th><th>addr</th>\
             <th>state</th><th>conns</th><th>tcp ping</th><th>connect ping</th>\
             <th>manual</th></tr>\n{rows}</table>\
             </body></html>",
            self.pool.rule(),
            self.relay.live_count(),
            self.relay.relaying_count(),
        )
    }
}

fn epoch_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

/// "GET /path?query HTTP/1.1" → ("GET", "/path?query")
fn parse_request_line(line: &str) -> (&str, &str) {
    let mut it = line.split_whitespace();
    let method = it.next().unwrap_or("");
    let target = it.next().unwrap_or("/");
    (method, target)
}

/// Split a query string into ordered key/value pairs. No percent decoding;
/// the surface only carries indexes and flags.
fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}

async fn write_response<W>(
    wr: &mut W,
    code: u16,
    content_type: &str,
    body: &[u8],
) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let header = format!(
        "HTTP/1.1 {} OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        code,
        content_type,
        body.len()
    );
    wr.write_all(header.as_bytes()).await?;
    wr.write_all(body).await?;
    wr.flush().await
}

async fn write_json<W>(wr: &mut W, code: u16, body: &str) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    write_response(wr, code, "application/json", body.as_bytes()).await
}
