//! Acceptor loop and live-session registry.
//!
//! Sessions remove themselves on completion through a weak back-reference;
//! the periodic sweeper reaps anything that slipped past that (for example a
//! session that finished before its registry insert landed).

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::pool::UpstreamPool;
use crate::relay::id;

use super::session::{RelayConfig, RelaySession, RelaySessionSnapshot, SessionState};

/// How often terminated sessions are reaped from the registry.
pub const SERVER_SWEEP_PERIOD: Duration = Duration::from_secs(5);

struct SessionEntry {
    session: Arc<RelaySession>,
    handle: JoinHandle<()>,
}

/// TCP acceptor plus registry of live [`RelaySession`]s.
pub struct RelayServer {
    pool: Arc<UpstreamPool>,
    cfg: RelayConfig,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("local_addr", &self.local_addr)
            .field("live", &self.live_count())
            .finish()
    }
}

impl RelayServer {
    /// Bind the listener. A failure here is fatal to startup; the caller
    /// turns it into a non-zero exit.
    pub async fn bind(
        pool: Arc<UpstreamPool>,
        cfg: RelayConfig,
        addr: &str,
    ) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Arc::new(Self {
            pool,
            cfg,
            local_addr,
            listener: Mutex::new(Some(listener)),
            sessions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the accept loop and the registry sweeper.
    pub fn start(self: &Arc<Self>) {
        let Some(listener) = self.listener.lock().take() else {
            return; // already started
        };
        tracing::info!(addr = %self.local_addr, "relay server listening");
        let mut tasks = self.tasks.lock();

        let me = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((client, peer)) => me.spawn_session(client, peer),
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }));

        let weak = Arc::downgrade(self);
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(SERVER_SWEEP_PERIOD).await;
                match weak.upgrade() {
                    Some(server) => server.sweep(),
                    None => break,
                }
            }
        }));
    }

    fn spawn_session(self: &Arc<Self>, client: TcpStream, peer: SocketAddr) {
        let relay_id = id::next_relay_id();
        let session = RelaySession::new(relay_id, peer);
        let weak = Arc::downgrade(self);
        let pool = Arc::clone(&self.pool);
        let cfg = self.cfg.clone();
        let task_session = Arc::clone(&session);
        let handle = tokio::spawn(async move {
            tracing::debug!(relay_id, peer = %peer, "relay session accepted");
            match task_session.run(client, pool, cfg).await {
                Ok((up, down)) => {
                    tracing::debug!(relay_id, up_bytes = up, down_bytes = down, "relay session closed");
                }
                Err(e) => {
                    tracing::debug!(relay_id, class = e.class(), error = %e, "relay session ended");
                }
            }
            match weak.upgrade() {
                Some(server) => server.remove_session(relay_id),
                None => tracing::warn!(relay_id, "relay server gone before session removal"),
            }
        });
        self.sessions
            .lock()
            .insert(relay_id, SessionEntry { session, handle });
    }

    /// Opportunistic removal on completion; the sweeper covers stragglers.
    fn remove_session(&self, relay_id: u64) {
        self.sessions.lock().remove(&relay_id);
    }

    fn sweep(&self) {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, e| !e.handle.is_finished());
        let reaped = before - sessions.len();
        if reaped > 0 {
            tracing::trace!(reaped, live = sessions.len(), "relay session sweep");
        }
    }

    /// Sessions currently registered, any state.
    pub fn live_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Sessions currently in RELAY; equals the pool's summed in-flight count.
    pub fn relaying_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|e| e.session.state() == SessionState::Relay)
            .count()
    }

    pub fn session_snapshots(&self) -> Vec<RelaySessionSnapshot> {
        self.sessions
            .lock()
            .values()
            .map(|e| e.session.snapshot())
            .collect()
    }

    /// Close the acceptor, abort live sessions, drain the registry.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let mut sessions = self.sessions.lock();
        for (_, entry) in sessions.iter() {
            entry.handle.abort();
        }
        sessions.clear();
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.stop();
    }
}
