//! Upstream pool: backend identity, rolling health/latency state, and the
//! selection policies (see [`policy`]). Probe outcomes and relay accounting
//! both land here; the monitor reads consistent snapshots out.

mod policy;

pub mod checker;

pub use checker::HealthChecker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use s5b_config::{SelectRule, UpstreamConfig};

/// Samples kept per latency series for the monitor's delay history.
const PING_HISTORY_LEN: usize = 10;

/// Rolling latency series: most recent sample plus a bounded history.
#[derive(Debug, Default)]
struct PingSeries {
    samples: Mutex<VecDeque<u64>>,
}

impl PingSeries {
    fn push(&self, ping: Duration) {
        let ms = ping.as_millis().min(u128::from(u64::MAX)) as u64;
        let mut samples = self.samples.lock();
        if samples.len() == PING_HISTORY_LEN {
            samples.pop_front();
        }
        samples.push_back(ms);
    }

    fn last(&self) -> Option<u64> {
        self.samples.lock().back().copied()
    }

    fn history(&self) -> Vec<u64> {
        self.samples.lock().iter().copied().collect()
    }
}

/// One upstream SOCKS5 backend: immutable identity plus rolling state.
///
/// State fields are individually atomic; a selection sees each field either
/// pre- or post-update, never torn.
#[derive(Debug)]
pub struct Backend {
    pub index: usize,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub auth_user: Option<String>,
    pub auth_password: Option<String>,

    is_offline: AtomicBool,
    is_manual_disable: AtomicBool,
    last_connect_failed: AtomicBool,
    connect_count: AtomicUsize,

    last_online_time: Mutex<Option<SystemTime>>,
    last_connect_time: Mutex<Option<SystemTime>>,
    last_tcp_check_time: Mutex<Option<SystemTime>>,
    last_connect_check_time: Mutex<Option<SystemTime>>,

    tcp_ping: PingSeries,
    connect_ping: PingSeries,
}

impl Backend {
    fn from_config(index: usize, cfg: &UpstreamConfig) -> Self {
        let auth = cfg.auth();
        Self {
            index,
            name: cfg.name.clone(),
            host: cfg.host.clone(),
            port: cfg.port,
            auth_user: auth.as_ref().map(|(u, _)| u.clone()),
            auth_password: auth.map(|(_, p)| p),
            is_offline: AtomicBool::new(false),
            is_manual_disable: AtomicBool::new(cfg.disable),
            last_connect_failed: AtomicBool::new(false),
            connect_count: AtomicUsize::new(0),
            last_online_time: Mutex::new(None),
            last_connect_time: Mutex::new(None),
            last_tcp_check_time: Mutex::new(None),
            last_connect_check_time: Mutex::new(None),
            tcp_ping: PingSeries::default(),
            connect_ping: PingSeries::default(),
        }
    }

    /// Selectable: not manually disabled, not offline, not sticky-failed.
    pub fn eligible(&self) -> bool {
        !self.is_manual_disable.load(Ordering::Relaxed)
            && !self.is_offline.load(Ordering::Relaxed)
            && !self.last_connect_failed.load(Ordering::Relaxed)
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::Relaxed)
    }

    pub fn is_offline(&self) -> bool {
        self.is_offline.load(Ordering::Relaxed)
    }

    pub fn is_manual_disable(&self) -> bool {
        self.is_manual_disable.load(Ordering::Relaxed)
    }

    pub fn last_connect_failed(&self) -> bool {
        self.last_connect_failed.load(Ordering::Relaxed)
    }

    /// TCP probe succeeded: reachable again, latency sample recorded.
    pub fn mark_tcp_ok(&self, ping: Duration) {
        self.is_offline.store(false, Ordering::Relaxed);
        self.last_connect_failed.store(false, Ordering::Relaxed);
        self.tcp_ping.push(ping);
        let now = SystemTime::now();
        *self.last_online_time.lock() = Some(now);
        *self.last_tcp_check_time.lock() = Some(now);
    }

    /// TCP probe failed: the host itself is unreachable.
    pub fn mark_tcp_err(&self) {
        self.is_offline.store(true, Ordering::Relaxed);
        *self.last_tcp_check_time.lock() = Some(SystemTime::now());
    }

    /// SOCKS5/HTTP probe succeeded through the backend.
    pub fn mark_connect_ok(&self, ping: Duration) {
        self.is_offline.store(false, Ordering::Relaxed);
        self.last_connect_failed.store(false, Ordering::Relaxed);
        self.connect_ping.push(ping);
        let now = SystemTime::now();
        *self.last_online_time.lock() = Some(now);
        *self.last_connect_time.lock() = Some(now);
        *self.last_connect_check_time.lock() = Some(now);
    }

    /// SOCKS5/HTTP probe failed: sticky until the next successful probe.
    pub fn mark_connect_err(&self) {
        self.last_connect_failed.store(true, Ordering::Relaxed);
        *self.last_connect_check_time.lock() = Some(SystemTime::now());
    }

    /// Relay-side connect failure; same sticky flag as a failed probe.
    pub fn mark_relay_connect_failed(&self) {
        self.last_connect_failed.store(true, Ordering::Relaxed);
        *self.last_connect_check_time.lock() = Some(SystemTime::now());
    }

    /// Relay-side connect success; remembers when traffic last flowed.
    pub fn mark_relay_connected(&self) {
        *self.last_connect_time.lock() = Some(SystemTime::now());
    }

    pub fn set_manual_disable(&self, disable: bool) {
        self.is_manual_disable.store(disable, Ordering::Relaxed);
    }

    pub fn reset_last_connect_failed(&self) {
        self.last_connect_failed.store(false, Ordering::Relaxed);
    }

    /// Account one in-flight relay; the guard's drop releases it.
    pub fn acquire(self: &Arc<Self>) -> ConnectGuard {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        ConnectGuard {
            backend: Arc::clone(self),
        }
    }

    pub fn tcp_ping_history(&self) -> Vec<u64> {
        self.tcp_ping.history()
    }

    pub fn connect_ping_history(&self) -> Vec<u64> {
        self.connect_ping.history()
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        let is_manual_disable = self.is_manual_disable.load(Ordering::Relaxed);
        let connect_count = self.connect_count.load(Ordering::Relaxed);
        BackendSnapshot {
            index: self.index,
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            is_offline: self.is_offline.load(Ordering::Relaxed),
            is_manual_disable,
            last_connect_failed: self.last_connect_failed.load(Ordering::Relaxed),
            connect_count,
            is_working: self.eligible(),
            is_manual_closed: is_manual_disable && connect_count == 0,
            last_online_time: epoch_ms(*self.last_online_time.lock()),
            last_connect_time: epoch_ms(*self.last_connect_time.lock()),
            last_tcp_check_time: epoch_ms(*self.last_tcp_check_time.lock()),
            last_connect_check_time: epoch_ms(*self.last_connect_check_time.lock()),
            tcp_ping: self.tcp_ping.last(),
            connect_ping: self.connect_ping.last(),
        }
    }
}

fn epoch_ms(t: Option<SystemTime>) -> Option<u64> {
    t.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
}

/// Decrements the backend's in-flight count exactly once, on drop.
#[derive(Debug)]
pub struct ConnectGuard {
    backend: Arc<Backend>,
}

impl ConnectGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        self.backend.connect_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Point-in-time view of one backend, serialized for the monitor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSnapshot {
    pub index: usize,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub is_offline: bool,
    pub is_manual_disable: bool,
    pub last_connect_failed: bool,
    pub connect_count: usize,
    pub is_working: bool,
    pub is_manual_closed: bool,
    pub last_online_time: Option<u64>,
    pub last_connect_time: Option<u64>,
    pub last_tcp_check_time: Option<u64>,
    pub last_connect_check_time: Option<u64>,
    pub tcp_ping: Option<u64>,
    pub connect_ping: Option<u64>,
}

/// Cursor shared by the stateful policies.
#[derive(Debug, Default)]
pub(crate) struct CursorState {
    /// Index of the backend handed out last; `None` before first use.
    pub(crate) last_use: Option<usize>,
    /// When `change_by_time` last rotated.
    pub(crate) changed_at: Option<Instant>,
}

/// Ordered set of backends plus selection state.
#[derive(Debug)]
pub struct UpstreamPool {
    backends: Vec<Arc<Backend>>,
    rule: SelectRule,
    change_every: Duration,
    pub(crate) cursor: Mutex<CursorState>,
}

impl UpstreamPool {
    pub fn new(
        upstreams: &[UpstreamConfig],
        rule: SelectRule,
        change_every: Duration,
    ) -> Arc<Self> {
        let backends = upstreams
            .iter()
            .enumerate()
            .map(|(i, cfg)| Arc::new(Backend::from_config(i, cfg)))
            .collect();
        Arc::new(Self {
            backends,
            rule,
            change_every,
            cursor: Mutex::new(CursorState::default()),
        })
    }

    pub fn rule(&self) -> SelectRule {
        self.rule
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backend(&self, index: usize) -> Option<&Arc<Backend>> {
        self.backends.get(index)
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Index handed out by the previous selection, if any.
    pub fn last_use_index(&self) -> Option<usize> {
        self.cursor.lock().last_use
    }

    /// Sum of in-flight relays across all backends.
    pub fn total_connect_count(&self) -> usize {
        self.backends.iter().map(|b| b.connect_count()).sum()
    }

    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        self.backends.iter().map(|b| b.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn upstream(name: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 1080,
            auth_user: None,
            auth_password: None,
            disable: false,
        }
    }

    #[test]
    fn backend_starts_eligible_unless_disabled() {
        let mut up = upstream("a");
        let pool = UpstreamPool::new(
            std::slice::from_ref(&up),
            SelectRule::Loop,
            Duration::from_secs(300),
        );
        assert!(pool.backend(0).unwrap().eligible());

        up.disable = true;
        let pool = UpstreamPool::new(&[up], SelectRule::Loop, Duration::from_secs(300));
        assert!(!pool.backend(0).unwrap().eligible());
    }

    #[test]
    fn probe_marks_flip_state() {
        let pool = UpstreamPool::new(
            &[upstream("a")],
            SelectRule::Loop,
            Duration::from_secs(300),
        );
        let b = pool.backend(0).unwrap();

        b.mark_tcp_err();
        assert!(b.is_offline());
        assert!(!b.eligible());

        b.mark_connect_err();
        assert!(b.last_connect_failed());

        // Any successful probe restores both flags.
        b.mark_tcp_ok(Duration::from_millis(12));
        assert!(b.eligible());
        assert_eq!(b.snapshot().tcp_ping, Some(12));
        assert!(b.snapshot().last_online_time.is_some());
    }

    #[test]
    fn connect_guard_pairs_increment_and_decrement() {
        let pool = UpstreamPool::new(
            &[upstream("a")],
            SelectRule::Loop,
            Duration::from_secs(300),
        );
        let b = pool.backend(0).unwrap();
        {
            let _g1 = b.acquire();
            let _g2 = b.acquire();
            assert_eq!(b.connect_count(), 2);
        }
        assert_eq!(b.connect_count(), 0);
        assert_eq!(pool.total_connect_count(), 0);
    }

    #[test]
    fn ping_history_is_bounded() {
        let series = PingSeries::default();
        for i in 0..20 {
            series.push(Duration::from_millis(i));
        }
        let hist = series.history();
        assert_eq!(hist.len(), PING_HISTORY_LEN);
        assert_eq!(*hist.first().unwrap(), 10);
        assert_eq!(series.last(), Some(19));
    }

    #[test]
    fn manual_closed_requires_drained() {
        let pool = UpstreamPool::new(
            &[upstream("a")],
            SelectRule::Loop,
            Duration::from_secs(300),
        );
        let b = pool.backend(0).unwrap();
        b.set_manual_disable(true);
        let g = b.acquire();
        assert!(b.snapshot().is_manual_disable);
        assert!(!b.snapshot().is_manual_closed);
        drop(g);
        assert!(b.snapshot().is_manual_closed);
    }
}
