//! One client↔upstream relay session.
//!
//! Lifecycle: pick a backend, connect (with retries, excluding backends this
//! session already tried), then pump bytes until EOF/error/idle expiry. The
//! in-flight count on the chosen backend is held by an RAII guard, so a
//! session that dies anywhere past RELAY entry always gives its slot back.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::Instant;

use s5b_config::Config;

use crate::errors::RelayError;
use crate::net::dial;
use crate::pool::{Backend, UpstreamPool};

use super::copy;

/// Session state, visible to the registry and the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Init = 0,
    Pick = 1,
    Connect = 2,
    Relay = 3,
    Dead = 4,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Pick => "pick",
            Self::Connect => "connect",
            Self::Relay => "relay",
            Self::Dead => "dead",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Pick,
            2 => Self::Connect,
            3 => Self::Relay,
            _ => Self::Dead,
        }
    }
}

/// Relay knobs lifted out of the full config.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bounds pick + connect (all retries included).
    pub connect_timeout: Duration,
    /// Tears the session down after this long without a forwarded byte.
    pub idle_timeout: Duration,
    /// Additional connect attempts after the first failure.
    pub retry_times: u32,
}

impl RelayConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            connect_timeout: cfg.connect_timeout,
            idle_timeout: cfg.relay_idle_timeout,
            retry_times: cfg.retry_times,
        }
    }
}

/// Live relay session record. The I/O runs in the session's task; this
/// struct is what the registry and monitor observe.
#[derive(Debug)]
pub struct RelaySession {
    pub relay_id: u64,
    peer: SocketAddr,
    state: AtomicU8,
    backend_name: Mutex<Option<String>>,
}

/// Monitor view of one live session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySessionSnapshot {
    pub relay_id: u64,
    pub peer: String,
    pub backend: Option<String>,
    pub state: &'static str,
}

impl RelaySession {
    pub(crate) fn new(relay_id: u64, peer: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            relay_id,
            peer,
            state: AtomicU8::new(SessionState::Init as u8),
            backend_name: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn backend_name(&self) -> Option<String> {
        self.backend_name.lock().clone()
    }

    pub fn snapshot(&self) -> RelaySessionSnapshot {
        RelaySessionSnapshot {
            relay_id: self.relay_id,
            peer: self.peer.to_string(),
            backend: self.backend_name(),
            state: self.state().as_str(),
        }
    }

    fn set_state(&self, s: SessionState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    /// Run the session to completion. Always ends in `Dead`; the client and
    /// upstream sockets close when this future returns or is dropped.
    pub(crate) async fn run(
        self: &Arc<Self>,
        client: TcpStream,
        pool: Arc<UpstreamPool>,
        cfg: RelayConfig,
    ) -> Result<(u64, u64), RelayError> {
        let result = self.drive(client, pool, &cfg).await;
        self.set_state(SessionState::Dead);
        result
    }

    async fn drive(
        self: &Arc<Self>,
        client: TcpStream,
        pool: Arc<UpstreamPool>,
        cfg: &RelayConfig,
    ) -> Result<(u64, u64), RelayError> {
        let (upstream, backend) = self.pick_and_connect(&pool, cfg).await?;

        // Entering RELAY: account the slot exactly once. The guard's drop
        // gives it back no matter how the pumps end.
        let _guard = backend.acquire();
        backend.mark_relay_connected();
        self.set_state(SessionState::Relay);
        tracing::debug!(
            relay_id = self.relay_id,
            peer = %self.peer,
            backend = %backend.name,
            "relay established"
        );

        copy::relay_streams(client, upstream, cfg.idle_timeout).await
    }

    /// PICK/CONNECT loop. Failed backends are marked sticky-failed and
    /// excluded from this session's later picks.
    ///
    /// The connect deadline bounds the whole loop; the remaining budget is
    /// split over the attempts still permitted, so one backend that hangs
    /// (dropped SYN, filtered port) cannot starve the retries against the
    /// rest of the pool.
    async fn pick_and_connect(
        self: &Arc<Self>,
        pool: &UpstreamPool,
        cfg: &RelayConfig,
    ) -> Result<(TcpStream, Arc<Backend>), RelayError> {
        let deadline = Instant::now() + cfg.connect_timeout;
        let mut tried: HashSet<usize> = HashSet::new();
        let mut attempts = 0u32;
        loop {
            self.set_state(SessionState::Pick);
            let backend = match pool.select_excluding(&tried) {
                Some(b) => b,
                None if tried.is_empty() => return Err(RelayError::NoEligibleUpstream),
                None => return Err(RelayError::ExhaustedRetries { attempts }),
            };
            *self.backend_name.lock() = Some(backend.name.clone());
            self.set_state(SessionState::Connect);

            let remaining_attempts = cfg.retry_times.saturating_add(1) - attempts;
            let remaining_time = deadline.saturating_duration_since(Instant::now());
            if remaining_time.is_zero() {
                return Err(RelayError::Timeout {
                    after: cfg.connect_timeout,
                    phase: "pick+connect",
                });
            }
            let per_attempt = remaining_time / remaining_attempts;
            attempts += 1;

            match self.connect_backend(&backend, per_attempt).await {
                Ok(stream) => return Ok((stream, backend)),
                Err(err) => {
                    tracing::debug!(
                        relay_id = self.relay_id,
                        backend = %backend.name,
                        class = err.class(),
                        error = %err,
                        attempts,
                        "upstream connect failed"
                    );
                    backend.mark_relay_connect_failed();
                    tried.insert(backend.index);
                    if !err.consumes_retry() {
                        return Err(err);
                    }
                    if attempts > cfg.retry_times {
                        return Err(RelayError::ExhaustedRetries { attempts });
                    }
                }
            }
        }
    }

    async fn connect_backend(
        &self,
        backend: &Backend,
        per_attempt: Duration,
    ) -> Result<TcpStream, RelayError> {
        let addrs = dial::resolve(&backend.host, backend.port)
            .await
            .map_err(|source| RelayError::Resolve {
                host: backend.host.clone(),
                port: backend.port,
                source,
            })?;
        dial::connect_any(&addrs, per_attempt)
            .await
            .map_err(|source| RelayError::Connect {
                peer: format!("{}:{}", backend.host, backend.port),
                source,
            })
    }
}
