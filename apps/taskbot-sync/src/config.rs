use std::env;
use std::time::Duration;

use url::Url;

use crate::transport::TransportError;

const DEFAULT_URL: &str = "ws://127.0.0.1:8787/ws";

/// Runtime knobs for the sync client. Every field has an environment
/// override; unset or unparsable values fall back to the defaults.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub url: String,
    pub log_filter: String,
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub heartbeat_interval: Duration,
    /// When set, a ping left unanswered this long counts as an unclean close.
    pub pong_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub typing_idle: Duration,
    /// Refetch detail keys in addition to invalidating them.
    pub refetch_on_change: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            log_filter: "info,taskbot_sync=debug".to_string(),
            base_delay: Duration::from_millis(1_000),
            max_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: None,
            connect_timeout: Duration::from_secs(10),
            typing_idle: Duration::from_secs(3),
            refetch_on_change: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let url = env::var("TASKBOT_SYNC_URL").unwrap_or(defaults.url);
        let log_filter = env::var("RUST_LOG").unwrap_or(defaults.log_filter);
        let base_delay = env_millis("TASKBOT_SYNC_BASE_DELAY_MS").unwrap_or(defaults.base_delay);
        let max_attempts = env::var("TASKBOT_SYNC_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_attempts);
        let heartbeat_interval =
            env_millis("TASKBOT_SYNC_HEARTBEAT_MS").unwrap_or(defaults.heartbeat_interval);
        let pong_timeout = env_millis("TASKBOT_SYNC_PONG_TIMEOUT_MS").filter(|d| !d.is_zero());
        let connect_timeout =
            env_millis("TASKBOT_SYNC_CONNECT_TIMEOUT_MS").unwrap_or(defaults.connect_timeout);
        let typing_idle = env_millis("TASKBOT_SYNC_TYPING_IDLE_MS").unwrap_or(defaults.typing_idle);
        let refetch_on_change = env::var("TASKBOT_SYNC_REFETCH")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(defaults.refetch_on_change);
        Self {
            url,
            log_filter,
            base_delay,
            max_attempts,
            heartbeat_interval,
            pong_timeout,
            connect_timeout,
            typing_idle,
            refetch_on_change,
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Turns a user supplied address into a websocket URL.
///
/// Bare hosts get `ws://` when local and `wss://` otherwise; `localhost` is
/// pinned to IPv4 to dodge `::1` resolution on dual-stack machines.
pub fn normalize_url(raw: &str) -> Result<Url, TransportError> {
    let raw = raw.trim();
    let mut url = if raw.starts_with("ws://") || raw.starts_with("wss://") {
        raw.to_string()
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if raw.contains("localhost") || raw.contains("127.0.0.1") {
        format!("ws://{raw}")
    } else {
        format!("wss://{raw}")
    };
    if url.contains("://localhost") {
        url = url.replacen("://localhost", "://127.0.0.1", 1);
    }
    Url::parse(&url).map_err(|err| TransportError::InvalidUrl(format!("{raw}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variables are process-global; keep these tests serial.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "TASKBOT_SYNC_URL",
        "TASKBOT_SYNC_BASE_DELAY_MS",
        "TASKBOT_SYNC_MAX_ATTEMPTS",
        "TASKBOT_SYNC_HEARTBEAT_MS",
        "TASKBOT_SYNC_PONG_TIMEOUT_MS",
        "TASKBOT_SYNC_CONNECT_TIMEOUT_MS",
        "TASKBOT_SYNC_TYPING_IDLE_MS",
        "TASKBOT_SYNC_REFETCH",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let config = SyncConfig::default();
        assert_eq!(config.base_delay, Duration::from_millis(1_000));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.typing_idle, Duration::from_secs(3));
        assert!(config.pong_timeout.is_none());
    }

    #[test]
    fn from_env_without_overrides_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = SyncConfig::from_env();
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.max_attempts, 5);
        assert!(!config.refetch_on_change);
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("TASKBOT_SYNC_URL", "wss://sync.example.com/ws");
            env::set_var("TASKBOT_SYNC_MAX_ATTEMPTS", "3");
            env::set_var("TASKBOT_SYNC_PONG_TIMEOUT_MS", "15000");
            env::set_var("TASKBOT_SYNC_REFETCH", "yes");
            env::set_var("TASKBOT_SYNC_BASE_DELAY_MS", "not-a-number");
        }
        let config = SyncConfig::from_env();
        clear_env();

        assert_eq!(config.url, "wss://sync.example.com/ws");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.pong_timeout, Some(Duration::from_secs(15)));
        assert!(config.refetch_on_change);
        assert_eq!(config.base_delay, Duration::from_millis(1_000));
    }

    #[test]
    fn normalizes_bare_hosts() {
        assert_eq!(
            normalize_url("localhost:8787/ws").unwrap().as_str(),
            "ws://127.0.0.1:8787/ws"
        );
        assert_eq!(
            normalize_url("sync.example.com/ws").unwrap().as_str(),
            "wss://sync.example.com/ws"
        );
        assert_eq!(
            normalize_url("https://sync.example.com/ws").unwrap().as_str(),
            "wss://sync.example.com/ws"
        );
        assert!(normalize_url("ws://").is_err());
    }
}
