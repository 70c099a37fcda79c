//! Periodic health checking for the pool.
//!
//! Two independent rounds: a cheap TCP reachability round on
//! `tcpCheckPeriod`, and a full connect round (SOCKS5 CONNECT, or HTTP GET
//! when a test URL is configured) on `connectCheckPeriod`. Each probe gets a
//! random start delay so a round does not hit every backend at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use s5b_config::Config;

use crate::probe::{ProbeKind, Prober, ProbeSettings, ProbeTarget};

use super::{Backend, UpstreamPool};

/// Checker parameters, lifted out of the full config.
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub tcp_check_period: Duration,
    pub connect_check_period: Duration,
    pub max_random_delay: Duration,
    pub connect_timeout: Duration,
    pub test_remote_host: String,
    pub test_remote_port: u16,
    pub test_http_url: String,
}

impl CheckerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            tcp_check_period: cfg.tcp_check_period,
            connect_check_period: cfg.connect_check_period,
            max_random_delay: cfg.additional_check_period_time_random,
            connect_timeout: cfg.connect_timeout,
            test_remote_host: cfg.test_remote_host.clone(),
            test_remote_port: cfg.test_remote_port,
            test_http_url: cfg.test_remote_http_url.clone(),
        }
    }
}

/// Drives probe rounds and feeds the outcomes back into the pool.
#[derive(Debug)]
pub struct HealthChecker {
    pool: Arc<UpstreamPool>,
    prober: Arc<Prober>,
    cfg: CheckerConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl HealthChecker {
    pub fn new(pool: Arc<UpstreamPool>, cfg: CheckerConfig) -> Arc<Self> {
        let prober = Prober::new(ProbeSettings {
            connect_timeout: cfg.connect_timeout,
            total_timeout: ProbeSettings::default().total_timeout,
            test_remote_host: cfg.test_remote_host.clone(),
            test_remote_port: cfg.test_remote_port,
            test_http_url: cfg.test_http_url.clone(),
        });
        Arc::new(Self {
            pool,
            prober,
            cfg,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start both periodic rounds. Each task runs a round immediately, then
    /// sleeps its period.
    pub fn start(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock();

        let me = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            loop {
                me.run_tcp_round();
                tokio::time::sleep(me.cfg.tcp_check_period).await;
            }
        }));

        let me = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            loop {
                me.run_connect_round();
                tokio::time::sleep(me.cfg.connect_check_period).await;
            }
        }));
    }

    /// Cancel the current rounds and start fresh ones immediately.
    pub fn force_check_now(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        tracing::info!("forced health check");
        self.abort_tasks();
        self.start();
    }

    /// Cancel the timers and the owned prober. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort_tasks();
        self.prober.stop();
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn probe_target(backend: &Backend) -> ProbeTarget {
        ProbeTarget {
            host: backend.host.clone(),
            port: backend.port,
            auth_user: backend.auth_user.clone(),
            auth_password: backend.auth_password.clone(),
        }
    }

    fn run_tcp_round(self: &Arc<Self>) {
        for backend in self.pool.backends() {
            let session = self.prober.create(
                ProbeKind::Tcp,
                Self::probe_target(backend),
                self.cfg.max_random_delay,
            );
            let ok_backend = Arc::clone(backend);
            let err_backend = Arc::clone(backend);
            session.run(
                move |ping| {
                    let ping_ms = ping.as_millis() as u64;
                    tracing::trace!(backend = %ok_backend.name, ping_ms, "tcp check ok");
                    ok_backend.mark_tcp_ok(ping);
                },
                move |message| {
                    tracing::debug!(backend = %err_backend.name, error = %message, "tcp check failed");
                    err_backend.mark_tcp_err();
                },
            );
        }
    }

    fn run_connect_round(self: &Arc<Self>) {
        let kind = if self.cfg.test_http_url.is_empty() {
            ProbeKind::Socks5
        } else {
            ProbeKind::Http
        };
        for backend in self.pool.backends() {
            let session = self.prober.create(
                kind,
                Self::probe_target(backend),
                self.cfg.max_random_delay,
            );
            let ok_backend = Arc::clone(backend);
            let err_backend = Arc::clone(backend);
            session.run(
                move |ping| {
                    let ping_ms = ping.as_millis() as u64;
                    tracing::trace!(backend = %ok_backend.name, ping_ms, "connect check ok");
                    ok_backend.mark_connect_ok(ping);
                },
                move |message| {
                    tracing::debug!(backend = %err_backend.name, error = %message, "connect check failed");
                    err_backend.mark_connect_err();
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s5b_config::{SelectRule, UpstreamConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal SOCKS5 backend: no auth, CONNECT always succeeds.
    async fn mock_socks5_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut s, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    if s.read(&mut buf).await.is_err() {
                        return;
                    }
                    if s.write_all(&[0x05, 0x00]).await.is_err() {
                        return;
                    }
                    if s.read(&mut buf).await.is_err() {
                        return;
                    }
                    let _ = s
                        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                        .await;
                });
            }
        });
        port
    }

    fn pool_for(port: u16) -> Arc<UpstreamPool> {
        UpstreamPool::new(
            &[UpstreamConfig {
                name: "up".to_string(),
                host: "127.0.0.1".to_string(),
                port,
                auth_user: None,
                auth_password: None,
                disable: false,
            }],
            SelectRule::Loop,
            Duration::from_secs(300),
        )
    }

    fn checker_cfg() -> CheckerConfig {
        CheckerConfig {
            tcp_check_period: Duration::from_secs(3600),
            connect_check_period: Duration::from_secs(3600),
            max_random_delay: Duration::ZERO,
            connect_timeout: Duration::from_millis(500),
            test_remote_host: "example.com".to_string(),
            test_remote_port: 443,
            test_http_url: String::new(),
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn rounds_update_backend_state() {
        let port = mock_socks5_backend().await;
        let pool = pool_for(port);
        let checker = HealthChecker::new(Arc::clone(&pool), checker_cfg());
        checker.start();

        let b = Arc::clone(pool.backend(0).unwrap());
        wait_for(|| {
            let snap = b.snapshot();
            snap.tcp_ping.is_some() && snap.connect_ping.is_some()
        })
        .await;
        let snap = b.snapshot();
        assert!(!snap.is_offline);
        assert!(!snap.last_connect_failed);
        assert!(snap.last_online_time.is_some());
        checker.stop();
    }

    #[tokio::test]
    async fn dead_backend_goes_offline_and_sticky_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = pool_for(port);
        let checker = HealthChecker::new(Arc::clone(&pool), checker_cfg());
        checker.start();

        let b = Arc::clone(pool.backend(0).unwrap());
        wait_for(|| b.is_offline() && b.last_connect_failed()).await;
        assert!(!b.eligible());
        checker.stop();
    }

    #[tokio::test]
    async fn force_check_now_is_idempotent() {
        let port = mock_socks5_backend().await;
        let pool = pool_for(port);
        let checker = HealthChecker::new(Arc::clone(&pool), checker_cfg());
        checker.start();
        let b = Arc::clone(pool.backend(0).unwrap());
        wait_for(|| b.snapshot().tcp_ping.is_some()).await;

        b.mark_tcp_err(); // knock it down; the forced round restores it
        checker.force_check_now();
        checker.force_check_now();
        wait_for(|| !b.is_offline()).await;
        checker.stop();
    }

    #[tokio::test]
    async fn stop_silences_future_rounds() {
        let port = mock_socks5_backend().await;
        let pool = pool_for(port);
        let checker = HealthChecker::new(Arc::clone(&pool), checker_cfg());
        checker.stop();
        checker.start(); // ignored after stop
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pool.backend(0).unwrap().snapshot().tcp_ping.is_none());
        // Idempotent stop.
        checker.stop();
    }
}
