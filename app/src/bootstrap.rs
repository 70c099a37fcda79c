//! Wires the components together for `run` and tears them down in reverse
//! order on SIGINT/SIGTERM.

use std::sync::Arc;

use s5b_config::{Config, ConfigError};
use s5b_core::monitor::MonitorServer;
use s5b_core::pool::{checker::CheckerConfig, HealthChecker, UpstreamPool};
use s5b_core::relay::{RelayConfig, RelayServer};

/// Startup failures the entrypoint maps to exit codes.
#[derive(Debug)]
pub enum StartError {
    Config(ConfigError),
    Bind {
        what: &'static str,
        source: std::io::Error,
    },
}

impl From<ConfigError> for StartError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

pub async fn run(config_path: &str) -> Result<(), StartError> {
    let cfg = Config::load(config_path)?;
    tracing::info!(
        config = config_path,
        upstreams = cfg.upstream.len(),
        rule = %cfg.upstream_select_rule,
        "starting"
    );

    let pool = UpstreamPool::new(
        &cfg.upstream,
        cfg.upstream_select_rule,
        cfg.server_change_time,
    );

    let checker = HealthChecker::new(Arc::clone(&pool), CheckerConfig::from_config(&cfg));
    checker.start();

    let relay = RelayServer::bind(
        Arc::clone(&pool),
        RelayConfig::from_config(&cfg),
        &cfg.listen_addr(),
    )
    .await
    .map_err(|source| StartError::Bind {
        what: "relay listener",
        source,
    })?;
    relay.start();

    let monitor = MonitorServer::bind(
        Arc::clone(&pool),
        Arc::clone(&checker),
        Arc::clone(&relay),
        &cfg.state_server_addr(),
    )
    .await
    .map_err(|source| StartError::Bind {
        what: "state monitor",
        source,
    })?;
    monitor.start();

    wait_for_shutdown().await;
    tracing::info!("shutting down");

    monitor.stop();
    relay.stop();
    checker.stop();
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, "install signal handler failed: SIGTERM");
            None
        }
    };
    let ctrl_c = tokio::signal::ctrl_c();

    match sigterm.as_mut() {
        Some(term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        None => {
            let _ = ctrl_c.await;
        }
    }
}
