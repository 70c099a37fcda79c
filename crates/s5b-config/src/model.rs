use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;

/// Upstream selection policy, dispatched by tag at selection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectRule {
    /// Round-robin over eligible backends.
    Loop,
    /// Uniform random among eligible backends.
    Random,
    /// Stick to one backend until it becomes ineligible.
    OneByOne,
    /// Rotate backend on a fixed interval (`serverChangeTime`).
    ChangeByTime,
    /// Eligible backend with the fewest in-flight relays; ties by index.
    MinConnectCount,
}

impl fmt::Display for SelectRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Loop => "loop",
            Self::Random => "random",
            Self::OneByOne => "one_by_one",
            Self::ChangeByTime => "change_by_time",
            Self::MinConnectCount => "min_connect_count",
        };
        f.write_str(s)
    }
}

/// One upstream SOCKS5 backend as declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Empty string is treated the same as absent.
    #[serde(default)]
    pub auth_user: Option<String>,
    #[serde(default)]
    pub auth_password: Option<String>,
    /// Seed the backend with the manual-disable flag set.
    #[serde(default)]
    pub disable: bool,
}

impl UpstreamConfig {
    /// Credentials, if both halves are present and non-empty.
    pub fn auth(&self) -> Option<(String, String)> {
        match (self.auth_user.as_deref(), self.auth_password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => {
                Some((u.to_string(), p.to_string()))
            }
            _ => None,
        }
    }
}

/// Whole-process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "defaults::listen_host")]
    pub listen_host: String,
    #[serde(default = "defaults::listen_port")]
    pub listen_port: u16,

    #[serde(default = "defaults::state_server_host")]
    pub state_server_host: String,
    #[serde(default = "defaults::state_server_port")]
    pub state_server_port: u16,

    #[serde(default = "defaults::select_rule")]
    pub upstream_select_rule: SelectRule,

    /// Additional connect attempts after the first failure.
    #[serde(default = "defaults::retry_times")]
    pub retry_times: u32,

    /// Bounds resolve + connect for one relay, and one probe's connect phase.
    #[serde(default = "defaults::connect_timeout", with = "dur_ms")]
    pub connect_timeout: Duration,

    /// `change_by_time` rotation interval.
    #[serde(default = "defaults::server_change_time", with = "dur_ms")]
    pub server_change_time: Duration,

    /// Relay teardown after this long with no byte forwarded either way.
    #[serde(default = "defaults::relay_idle_timeout", with = "dur_ms")]
    pub relay_idle_timeout: Duration,

    #[serde(default = "defaults::tcp_check_period", with = "dur_ms")]
    pub tcp_check_period: Duration,
    #[serde(default = "defaults::connect_check_period", with = "dur_ms")]
    pub connect_check_period: Duration,
    /// Upper bound of the per-probe random start delay.
    #[serde(default = "defaults::additional_check_random", with = "dur_ms")]
    pub additional_check_period_time_random: Duration,

    /// CONNECT sentinel target used by the SOCKS5 probe.
    #[serde(default = "defaults::test_remote_host")]
    pub test_remote_host: String,
    #[serde(default = "defaults::test_remote_port")]
    pub test_remote_port: u16,
    /// When non-empty, the connect round probes with an HTTP GET through the
    /// backend instead of a bare SOCKS5 CONNECT.
    #[serde(default = "defaults::test_remote_http_url")]
    pub test_remote_http_url: String,

    pub upstream: Vec<UpstreamConfig>,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn state_server_addr(&self) -> String {
        format!("{}:{}", self.state_server_host, self.state_server_port)
    }
}

/// Durations travel as integer milliseconds in JSON.
mod dur_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
