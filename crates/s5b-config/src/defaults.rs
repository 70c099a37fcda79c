//! Field defaults, matching the original deployment format.

use std::time::Duration;

use crate::SelectRule;

pub fn listen_host() -> String {
    "127.0.0.1".to_string()
}

pub fn listen_port() -> u16 {
    5000
}

pub fn state_server_host() -> String {
    "127.0.0.1".to_string()
}

pub fn state_server_port() -> u16 {
    5010
}

pub fn select_rule() -> SelectRule {
    SelectRule::Random
}

pub fn retry_times() -> u32 {
    3
}

pub fn connect_timeout() -> Duration {
    Duration::from_secs(30)
}

pub fn server_change_time() -> Duration {
    Duration::from_secs(60 * 5)
}

pub fn relay_idle_timeout() -> Duration {
    Duration::from_secs(60 * 10)
}

pub fn tcp_check_period() -> Duration {
    Duration::from_secs(5)
}

pub fn connect_check_period() -> Duration {
    Duration::from_secs(60 * 5)
}

pub fn additional_check_random() -> Duration {
    Duration::from_secs(5)
}

pub fn test_remote_host() -> String {
    "www.google.com".to_string()
}

pub fn test_remote_port() -> u16 {
    443
}

pub fn test_remote_http_url() -> String {
    String::new()
}
