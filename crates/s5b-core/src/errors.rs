//! Typed errors for the relay data plane.
//!
//! Probe failures never reach this type; they collapse to a message string
//! at the probe callback boundary, and that is also where SOCKS5 handshake
//! and protocol failures live (relayed traffic is forwarded opaquely, so the
//! relay path itself never handshakes). Cancellation is a task abort, not an
//! error value. `anyhow` stays out of this crate.

use std::time::Duration;

use thiserror::Error;

/// Failure of one relay session, classified for retry policy and logging.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("connect {peer}: {source}")]
    Connect {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout after {after:?} during {phase}")]
    Timeout {
        after: Duration,
        phase: &'static str,
    },

    #[error("no upstream reachable after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    #[error("no eligible upstream")]
    NoEligibleUpstream,
}

impl RelayError {
    /// Short class label for structured log fields.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Resolve { .. } => "resolve",
            Self::Connect { .. } => "connect",
            Self::Io(_) => "io",
            Self::Timeout { .. } => "timeout",
            Self::ExhaustedRetries { .. } => "exhausted_retries",
            Self::NoEligibleUpstream => "no_eligible_upstream",
        }
    }

    /// Connect-phase failures consume a retry and move the session on to the
    /// next backend; anything later ends the session outright.
    pub fn consumes_retry(&self) -> bool {
        matches!(self, Self::Resolve { .. } | Self::Connect { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_labels() {
        assert_eq!(RelayError::NoEligibleUpstream.class(), "no_eligible_upstream");
        assert_eq!(
            RelayError::Timeout {
                after: Duration::from_secs(30),
                phase: "connect",
            }
            .class(),
            "timeout"
        );
        let connect = RelayError::Connect {
            peer: "10.0.0.1:1080".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(connect.class(), "connect");
    }

    #[test]
    fn retry_classification() {
        let resolve = RelayError::Resolve {
            host: "nowhere.invalid".into(),
            port: 1080,
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let connect = RelayError::Connect {
            peer: "10.0.0.1:1080".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(resolve.consumes_retry());
        assert!(connect.consumes_retry());
        assert!(!RelayError::Timeout {
            after: Duration::from_secs(30),
            phase: "pick+connect",
        }
        .consumes_retry());
        assert!(!RelayError::NoEligibleUpstream.consumes_retry());
    }
}
