use std::env;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Interval between mailbox polls.
    pub poll_interval: Duration,
    /// A record that has not connected this long after creation is re-attempted.
    pub connect_timeout: Duration,
    /// Backoff and cap for reconnecting after a transport failure.
    pub reconnect: RetryPolicy,
    /// Delay and cap for re-running a signal that found its peer busy.
    pub busy_retry: RetryPolicy,
    pub channel_label: String,
    pub ice_servers: Vec<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            reconnect: RetryPolicy::new(Duration::from_secs(1), 10),
            busy_retry: RetryPolicy::new(Duration::from_millis(500), 20),
            channel_label: "peerwire".to_string(),
            ice_servers: vec![DEFAULT_STUN_URL.to_string()],
        }
    }
}

impl MeshConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env::var("PEERWIRE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
        {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Ok(urls) = env::var("PEERWIRE_STUN_URLS") {
            config.ice_servers = parse_url_list(&urls);
        }
        let stun_disabled = env::var("PEERWIRE_DISABLE_STUN")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if stun_disabled {
            config.ice_servers.clear();
        }
        config
    }
}

fn parse_url_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_negotiation_timers() {
        let config = MeshConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect.delay, Duration::from_secs(1));
        assert_eq!(config.busy_retry.delay, Duration::from_millis(500));
    }

    #[test]
    fn url_list_skips_blanks() {
        assert_eq!(
            parse_url_list(" stun:a:3478, ,stun:b:3478 "),
            vec!["stun:a:3478".to_string(), "stun:b:3478".to_string()]
        );
    }
}
