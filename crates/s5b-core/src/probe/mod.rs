//! Probe ownership and lifecycle.
//!
//! Sessions self-release on completion; the sweeper exists to reclaim any
//! session whose callback never fired and to bound memory on high-churn
//! configurations. A release that finds the session already gone is logged,
//! not fatal.

mod session;

pub use session::{ProbeKind, ProbeSession, ProbeSettings, ProbeTarget};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// How often completed sessions are swept out of the registry.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(5);

/// Factory and registry for live [`ProbeSession`]s.
pub struct Prober {
    settings: ProbeSettings,
    sessions: Mutex<HashMap<u64, Arc<ProbeSession>>>,
    next_id: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober")
            .field("sessions", &self.session_count())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl Prober {
    pub fn new(settings: ProbeSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            sweeper: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Create and register a probe session. `max_random_delay` smears the
    /// start over `[0, max_random_delay]` so a round of probes does not
    /// stampede the backends.
    pub fn create(
        self: &Arc<Self>,
        kind: ProbeKind,
        target: ProbeTarget,
        max_random_delay: Duration,
    ) -> Arc<ProbeSession> {
        self.ensure_sweeper();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let delay_ms = max_random_delay.as_millis() as u64;
        let delay = if delay_ms > 0 {
            Duration::from_millis(fastrand::u64(0..=delay_ms))
        } else {
            Duration::ZERO
        };
        let session = Arc::new(ProbeSession::new(
            id,
            kind,
            target,
            delay,
            self.settings.clone(),
            Arc::downgrade(self),
        ));
        self.sessions.lock().insert(id, Arc::clone(&session));
        session
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        *sweeper = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_PERIOD).await;
                match weak.upgrade() {
                    Some(prober) => prober.sweep(),
                    None => break,
                }
            }
        }));
    }

    fn sweep(&self) {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_complete());
        let reaped = before - sessions.len();
        if reaped > 0 {
            tracing::trace!(reaped, live = sessions.len(), "probe sweep");
        }
    }

    /// Remove a finished session; called by the session itself.
    pub(crate) fn release(&self, id: u64) {
        if self.sessions.lock().remove(&id).is_none() {
            tracing::warn!(probe = id, "probe session not found at release; double release?");
        }
    }

    /// Cancel the sweeper, stop every outstanding session, drain the set.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let outstanding: Vec<Arc<ProbeSession>> =
            self.sessions.lock().values().cloned().collect();
        for session in outstanding {
            session.stop();
        }
        self.sessions.lock().retain(|_, s| !s.is_complete());
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    fn target(port: u16) -> ProbeTarget {
        ProbeTarget {
            host: "127.0.0.1".to_string(),
            port,
            auth_user: None,
            auth_password: None,
        }
    }

    fn settings() -> ProbeSettings {
        ProbeSettings {
            connect_timeout: Duration::from_millis(500),
            total_timeout: Duration::from_secs(2),
            ..ProbeSettings::default()
        }
    }

    #[tokio::test]
    async fn tcp_probe_reports_latency_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let prober = Prober::new(settings());
        let fired = Arc::new(AtomicUsize::new(0));
        let session = prober.create(ProbeKind::Tcp, target(port), Duration::ZERO);
        let ok_fired = fired.clone();
        let err_fired = fired.clone();
        session.run(
            move |_latency| {
                ok_fired.fetch_add(1, Ordering::SeqCst);
            },
            move |msg| {
                err_fired.fetch_add(1, Ordering::SeqCst);
                panic!("unexpected probe failure: {msg}");
            },
        );

        // Session self-releases right after the callback.
        for _ in 0..100 {
            if prober.session_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(prober.session_count(), 0);
        assert!(session.is_complete());
    }

    #[tokio::test]
    async fn refused_probe_reports_error_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = Prober::new(settings());
        let (tx, rx) = tokio::sync::oneshot::channel::<String>();
        let session = prober.create(ProbeKind::Tcp, target(port), Duration::ZERO);
        session.run(
            |_| panic!("probe to a closed port succeeded"),
            move |msg| {
                let _ = tx.send(msg);
            },
        );
        let msg = rx.await.unwrap();
        assert!(msg.contains("tcp probe"), "message was {msg:?}");
        assert_eq!(prober.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_hits_the_total_budget() {
        // Backend accepts the TCP connect but never answers the SOCKS5
        // greeting; the whole-probe budget has to cut it off.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((s, _)) = listener.accept().await {
                    held.push(s);
                }
            }
        });

        let prober = Prober::new(ProbeSettings {
            connect_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(60),
            ..ProbeSettings::default()
        });
        let session = prober.create(ProbeKind::Socks5, target(port), Duration::ZERO);
        let (tx, rx) = tokio::sync::oneshot::channel::<String>();
        session.run(
            |_| panic!("stalled probe succeeded"),
            move |msg| {
                let _ = tx.send(msg);
            },
        );
        let msg = rx.await.unwrap();
        assert!(
            msg.contains("Timeout") || msg.contains("timed out"),
            "message was {msg:?}"
        );
    }

    #[tokio::test]
    async fn stop_before_fire_suppresses_callbacks() {
        let prober = Prober::new(settings());
        let fired = Arc::new(AtomicUsize::new(0));
        // Long fixed delay through the jitter path so stop() lands first.
        let session = prober.create(ProbeKind::Tcp, target(9), Duration::from_secs(30));
        let f1 = fired.clone();
        let f2 = fired.clone();
        session.run(
            move |_| {
                f1.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                f2.fetch_add(1, Ordering::SeqCst);
            },
        );
        session.stop();
        assert!(session.is_complete());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // Idempotent: a second stop is harmless.
        session.stop();
    }

    #[tokio::test]
    async fn prober_stop_cancels_outstanding_sessions() {
        // Backend accepts but never answers, so the sessions are still
        // waiting inside the handshake when stop() lands.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((s, _)) = listener.accept().await {
                    held.push(s);
                }
            }
        });

        let prober = Prober::new(ProbeSettings {
            connect_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(60),
            ..ProbeSettings::default()
        });
        for _ in 0..3 {
            let s = prober.create(ProbeKind::Socks5, target(port), Duration::ZERO);
            s.run(|_| panic!("should not fire"), |_| panic!("should not fire"));
        }
        assert_eq!(prober.session_count(), 3);
        prober.stop();
        assert_eq!(prober.session_count(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn double_release_is_logged_not_fatal() {
        let prober = Prober::new(settings());
        let s = prober.create(ProbeKind::Tcp, target(9), Duration::ZERO);
        assert_eq!(prober.session_count(), 1);
        s.stop(); // releases normally
        assert_eq!(prober.session_count(), 0);
        // The second stop warns about the missing entry and changes nothing.
        s.stop();
        assert_eq!(prober.session_count(), 0);
    }
}
