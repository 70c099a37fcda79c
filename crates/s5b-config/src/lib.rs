//! Configuration model and loader for the balancer.
//!
//! The on-disk format is a single JSON document; field names keep the
//! camelCase spelling of the deployed config files so existing configs load
//! unchanged. Durations are integer milliseconds on the wire and
//! [`std::time::Duration`] in the model.

pub mod defaults;
mod model;

pub use model::{Config, SelectRule, UpstreamConfig};

use std::path::Path;
use thiserror::Error;

/// Errors surfaced while loading or validating a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Load a config file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check structural invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.is_empty() {
            return Err(ConfigError::Invalid("upstream list is empty".into()));
        }
        if self.listen_port == 0 {
            return Err(ConfigError::Invalid("listenPort must be non-zero".into()));
        }
        if self.state_server_port == 0 {
            return Err(ConfigError::Invalid(
                "stateServerPort must be non-zero".into(),
            ));
        }
        for up in &self.upstream {
            if up.host.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "upstream {:?} has empty host",
                    up.name
                )));
            }
            if up.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "upstream {:?} has port 0",
                    up.name
                )));
            }
            if up.auth().is_none()
                && (up.auth_user.as_deref().is_some_and(|s| !s.is_empty())
                    != up.auth_password.as_deref().is_some_and(|s| !s.is_empty()))
            {
                return Err(ConfigError::Invalid(format!(
                    "upstream {:?}: authUser and authPassword must be set together",
                    up.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn minimal() -> &'static str {
        r#"{
            "upstream": [
                {"name": "up-1", "host": "127.0.0.1", "port": 3000}
            ]
        }"#
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: Config = serde_json::from_str(minimal()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.listen_host, "127.0.0.1");
        assert_eq!(cfg.listen_port, 5000);
        assert_eq!(cfg.upstream_select_rule, SelectRule::Random);
        assert_eq!(cfg.retry_times, 3);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(30));
        assert_eq!(cfg.relay_idle_timeout, Duration::from_secs(600));
        assert_eq!(cfg.server_change_time, Duration::from_secs(300));
        assert_eq!(cfg.upstream.len(), 1);
        assert!(!cfg.upstream[0].disable);
        assert!(cfg.upstream[0].auth().is_none());
    }

    #[test]
    fn full_config_round_trips() {
        let text = r#"{
            "listenHost": "0.0.0.0",
            "listenPort": 1080,
            "stateServerHost": "127.0.0.1",
            "stateServerPort": 1081,
            "upstreamSelectRule": "min_connect_count",
            "retryTimes": 1,
            "connectTimeout": 5000,
            "serverChangeTime": 60000,
            "relayIdleTimeout": 30000,
            "tcpCheckPeriod": 2000,
            "connectCheckPeriod": 10000,
            "additionalCheckPeriodTimeRandom": 1000,
            "testRemoteHost": "example.com",
            "testRemotePort": 443,
            "testRemoteHttpUrl": "http://example.com/ok",
            "upstream": [
                {"name": "a", "host": "10.0.0.1", "port": 1080,
                 "authUser": "u", "authPassword": "p", "disable": true}
            ]
        }"#;
        let cfg: Config = serde_json::from_str(text).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.upstream_select_rule, SelectRule::MinConnectCount);
        assert_eq!(cfg.connect_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.tcp_check_period, Duration::from_secs(2));
        let up = &cfg.upstream[0];
        assert!(up.disable);
        assert_eq!(
            up.auth(),
            Some(("u".to_string(), "p".to_string()))
        );

        // camelCase survives re-serialization
        let back = serde_json::to_value(&cfg).unwrap();
        assert_eq!(back["upstreamSelectRule"], "min_connect_count");
        assert_eq!(back["connectTimeout"], 5000);
    }

    #[test]
    fn unknown_rule_is_a_parse_error() {
        let text = r#"{
            "upstreamSelectRule": "fastest",
            "upstream": [{"name": "a", "host": "h", "port": 1}]
        }"#;
        assert!(serde_json::from_str::<Config>(text).is_err());
    }

    #[test]
    fn empty_upstream_rejected() {
        let cfg: Config = serde_json::from_str(r#"{"upstream": []}"#).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn lone_auth_user_rejected() {
        let text = r#"{
            "upstream": [{"name": "a", "host": "h", "port": 1, "authUser": "u"}]
        }"#;
        let cfg: Config = serde_json::from_str(text).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_auth_strings_mean_no_auth() {
        let text = r#"{
            "upstream": [{"name": "a", "host": "h", "port": 1,
                          "authUser": "", "authPassword": ""}]
        }"#;
        let cfg: Config = serde_json::from_str(text).unwrap();
        cfg.validate().unwrap();
        assert!(cfg.upstream[0].auth().is_none());
    }
}
