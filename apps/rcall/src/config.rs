use std::env;
use std::time::Duration;

use crate::media::EngineConfig;
use crate::media::config::DEFAULT_STUN_URL;
use crate::signaling::{DEFAULT_RECONNECT_DELAY, SignalingConfig, TransportError};

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Relay base url (`ws://` or `wss://`)
    pub signaling_url: String,
    /// STUN server; `None` disables it
    pub stun_url: Option<String>,
    pub turn: Option<TurnServer>,
    pub relay_only: bool,
    pub reconnect_delay: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let signaling_url = env::var("RCALL_SIGNALING_URL").unwrap_or(defaults.signaling_url);
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let signaling_url = signaling_url.replacen("://localhost", "://127.0.0.1", 1);
        let stun_url = match env::var("RCALL_STUN_URL") {
            Ok(url) if url.trim().is_empty() => None,
            Ok(url) => Some(url),
            Err(_) => defaults.stun_url,
        };
        let turn = env::var("RCALL_TURN_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(|url| TurnServer {
                url,
                username: env::var("RCALL_TURN_USER").unwrap_or_default(),
                credential: env::var("RCALL_TURN_PASS").unwrap_or_default(),
            });
        let relay_only = env_truthy("RCALL_RELAY_ONLY").unwrap_or(false);
        let reconnect_delay = env::var("RCALL_RECONNECT_DELAY_MS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.reconnect_delay);
        Self {
            signaling_url,
            stun_url,
            turn,
            relay_only,
            reconnect_delay,
        }
    }

    pub fn signaling_config(&self) -> Result<SignalingConfig, TransportError> {
        Ok(SignalingConfig::new(&self.signaling_url)?.with_reconnect_delay(self.reconnect_delay))
    }

    pub fn engine_config(&self, video: bool) -> EngineConfig {
        let mut builder = EngineConfig::builder()
            .relay_only(self.relay_only)
            .video(video);
        if let Some(stun) = &self.stun_url {
            builder = builder.add_ice_server(vec![stun.clone()]);
        }
        if let Some(turn) = &self.turn {
            builder = builder.add_ice_server_with_credentials(
                vec![turn.url.clone()],
                turn.username.clone(),
                turn.credential.clone(),
            );
        }
        builder.build()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_url: Some(DEFAULT_STUN_URL.to_string()),
            turn: None,
            relay_only: false,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

pub(crate) fn env_truthy(key: &str) -> Option<bool> {
    let value = env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const KEYS: &[&str] = &[
        "RCALL_SIGNALING_URL",
        "RCALL_STUN_URL",
        "RCALL_TURN_URL",
        "RCALL_TURN_USER",
        "RCALL_TURN_PASS",
        "RCALL_RELAY_ONLY",
        "RCALL_RECONNECT_DELAY_MS",
    ];

    fn clear_env() {
        for key in KEYS {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_config_from_env_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = Config::from_env();
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.stun_url.as_deref(), Some(DEFAULT_STUN_URL));
        assert_eq!(config.turn, None);
        assert!(!config.relay_only);
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("RCALL_SIGNALING_URL", "wss://localhost:9443/signal");
            env::set_var("RCALL_STUN_URL", "");
            env::set_var("RCALL_TURN_URL", "turn:turn.example.org:3478");
            env::set_var("RCALL_TURN_USER", "alice");
            env::set_var("RCALL_TURN_PASS", "pw");
            env::set_var("RCALL_RELAY_ONLY", "yes");
            env::set_var("RCALL_RECONNECT_DELAY_MS", "250");
        }
        let config = Config::from_env();
        clear_env();

        assert_eq!(config.signaling_url, "wss://127.0.0.1:9443/signal");
        assert_eq!(config.stun_url, None);
        assert_eq!(
            config.turn,
            Some(TurnServer {
                url: "turn:turn.example.org:3478".into(),
                username: "alice".into(),
                credential: "pw".into(),
            })
        );
        assert!(config.relay_only);
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));

        let engine = config.engine_config(false);
        assert_eq!(engine.ice_servers.len(), 1);
        assert_eq!(engine.ice_servers[0].username, "alice");
        assert!(engine.relay_only);
        assert!(!engine.video);

        let signaling = config.signaling_config().unwrap();
        assert_eq!(signaling.reconnect_delay, Duration::from_millis(250));
    }

    #[test]
    fn rejects_non_websocket_url() {
        let config = Config {
            signaling_url: "http://127.0.0.1:8080/".into(),
            ..Config::default()
        };
        assert!(matches!(
            config.signaling_config(),
            Err(TransportError::InvalidUrl(_))
        ));
    }
}
