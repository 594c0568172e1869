use std::env;
use std::time::Duration;

use peerwire_mailbox::MailboxSettings;

#[derive(Debug, Clone)]
pub struct RoadConfig {
    pub port: u16,
    pub mailbox: MailboxSettings,
}

impl RoadConfig {
    pub fn from_env() -> Self {
        let defaults = MailboxSettings::default();
        Self {
            port: env::var("PEERWIRE_ROAD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8787),
            mailbox: MailboxSettings {
                retention: env_secs("PEERWIRE_RETENTION_SECS").unwrap_or(defaults.retention),
                peer_timeout: env_secs("PEERWIRE_PEER_TIMEOUT_SECS")
                    .unwrap_or(defaults.peer_timeout),
                room_timeout: env_secs("PEERWIRE_ROOM_TIMEOUT_SECS")
                    .unwrap_or(defaults.room_timeout),
                sweep_interval: env_secs("PEERWIRE_SWEEP_INTERVAL_SECS")
                    .unwrap_or(defaults.sweep_interval),
            },
        }
    }
}

impl Default for RoadConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            mailbox: MailboxSettings::default(),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
