//! Bot configuration types and loading.
//!
//! Defines [`BotConfig`] which is loaded from `~/.slackbot/config.yml`.
//! Contains the realtime API token, the webhook secret, the `Origin` header
//! value, and optional tuning for the realtime session and webhook listener.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::BotError;

/// Default handshake endpoint.
pub const DEFAULT_HANDSHAKE_URL: &str = "https://slack.com/api/rtm.start";

/// Default extension negotiation header sent when opening the channel.
pub const DEFAULT_EXTENSIONS: &str =
    "permessage-deflate; client_max_window_bits, x-webkit-deflate-frame";

/// Default fixed delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 15;

/// Top-level configuration loaded from `~/.slackbot/config.yml`.
///
/// # Examples
///
/// ```
/// use slackbot_core::config::BotConfig;
///
/// let yaml = r#"
/// slack:
///   token: "xoxb-test"
///   payload_token: "secret"
///   origin: "https://example.com"
/// "#;
///
/// let config: BotConfig = serde_yaml::from_str(yaml).unwrap();
/// assert_eq!(config.slack.token, "xoxb-test");
/// assert_eq!(config.realtime.reconnect_interval_secs, 15);
/// assert_eq!(config.webhook.path, "/");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Credentials and the origin header.
    pub slack: SlackConfig,

    /// Realtime session tuning.
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Webhook listener settings.
    #[serde(default)]
    pub webhook: WebhookConfig,
}

/// Credentials and origin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    /// Realtime API token submitted during the handshake.
    pub token: String,

    /// Shared secret every webhook request must carry in its `token` field.
    pub payload_token: String,

    /// Value of the `Origin` header sent when opening the realtime channel.
    pub origin: String,
}

/// Realtime session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Endpoint that exchanges the API token for a channel URL.
    #[serde(default = "default_handshake_url")]
    pub handshake_url: String,

    /// Fixed delay between reconnect attempts, in seconds.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,

    /// `Sec-WebSocket-Extensions` header value. Empty disables the header.
    #[serde(default = "default_extensions")]
    pub extensions: String,
}

impl RealtimeConfig {
    /// Returns the reconnect interval as a [`Duration`].
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            handshake_url: default_handshake_url(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            extensions: default_extensions(),
        }
    }
}

/// Webhook listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Address the HTTP listener binds to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Path of the single POST endpoint.
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            path: default_path(),
        }
    }
}

fn default_handshake_url() -> String {
    DEFAULT_HANDSHAKE_URL.to_string()
}

fn default_reconnect_interval_secs() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_SECS
}

fn default_extensions() -> String {
    DEFAULT_EXTENSIONS.to_string()
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_path() -> String {
    "/".to_string()
}

/// Returns the default configuration directory path (`~/.slackbot/`).
///
/// # Errors
///
/// Returns `BotError::Config` if the `HOME` environment variable is not set.
pub fn default_config_dir() -> Result<PathBuf, BotError> {
    let home = std::env::var("HOME")
        .map_err(|_| BotError::Config("HOME environment variable not set".into()))?;
    Ok(PathBuf::from(home).join(".slackbot"))
}

/// Returns the default configuration file path (`~/.slackbot/config.yml`).
///
/// # Errors
///
/// Returns `BotError::Config` if the `HOME` environment variable is not set.
pub fn default_config_path() -> Result<PathBuf, BotError> {
    Ok(default_config_dir()?.join("config.yml"))
}

impl BotConfig {
    /// Loads configuration from the given YAML file path.
    ///
    /// Validates the loaded values before returning.
    ///
    /// # Errors
    ///
    /// Returns `BotError::Config` if the file cannot be read, contains
    /// invalid YAML, or fails validation.
    pub fn load(path: &Path) -> Result<Self, BotError> {
        info!(path = %path.display(), "Loading configuration");
        let content = std::fs::read_to_string(path).map_err(|e| {
            BotError::Config(format!("Cannot read config at {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            BotError::Config(format!("Invalid YAML in config at {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates that required fields are present and well-formed.
    ///
    /// An empty `payload_token` is rejected so that the webhook token check
    /// can never be satisfied by a request that simply omits the field.
    ///
    /// # Errors
    ///
    /// Returns `BotError::Config` naming the offending field.
    pub fn validate(&self) -> Result<(), BotError> {
        if self.slack.token.trim().is_empty() {
            return Err(BotError::Config("slack.token must not be empty".into()));
        }
        if self.slack.payload_token.trim().is_empty() {
            return Err(BotError::Config(
                "slack.payload_token must not be empty".into(),
            ));
        }
        if self.slack.origin.trim().is_empty() {
            return Err(BotError::Config("slack.origin must not be empty".into()));
        }
        if !self.realtime.handshake_url.starts_with("http://")
            && !self.realtime.handshake_url.starts_with("https://")
        {
            return Err(BotError::Config(
                "realtime.handshake_url must be an http(s) URL".into(),
            ));
        }
        if self.realtime.reconnect_interval_secs == 0 {
            return Err(BotError::Config(
                "realtime.reconnect_interval_secs must be greater than zero".into(),
            ));
        }
        if !self.webhook.path.starts_with('/') {
            return Err(BotError::Config(
                "webhook.path must start with '/'".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> BotConfig {
        BotConfig {
            slack: SlackConfig {
                token: "xoxb-test".into(),
                payload_token: "secret".into(),
                origin: "https://example.com".into(),
            },
            realtime: RealtimeConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }

    #[test]
    fn test_should_deserialize_full_config() {
        let yaml = r#"
slack:
  token: "xoxb-789"
  payload_token: "hook-secret"
  origin: "https://bot.example.com"
realtime:
  handshake_url: "http://127.0.0.1:9000/rtm.start"
  reconnect_interval_secs: 5
  extensions: ""
webhook:
  bind: "0.0.0.0:3000"
  path: "/slack"
"#;
        let config: BotConfig = serde_yaml::from_str(yaml).expect("deserialize");
        assert_eq!(config.slack.payload_token, "hook-secret");
        assert_eq!(config.realtime.reconnect_interval(), Duration::from_secs(5));
        assert!(config.realtime.extensions.is_empty());
        assert_eq!(config.webhook.bind.port(), 3000);
        assert_eq!(config.webhook.path, "/slack");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_should_apply_defaults() {
        let yaml = r#"
slack:
  token: "xoxb-test"
  payload_token: "secret"
  origin: "https://example.com"
"#;
        let config: BotConfig = serde_yaml::from_str(yaml).expect("deserialize");
        assert_eq!(config.realtime.handshake_url, DEFAULT_HANDSHAKE_URL);
        assert_eq!(config.realtime.extensions, DEFAULT_EXTENSIONS);
        assert_eq!(config.realtime.reconnect_interval(), Duration::from_secs(15));
        assert_eq!(config.webhook.bind, SocketAddr::from(([127, 0, 0, 1], 8080)));
    }

    #[test]
    fn test_should_validate_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_should_reject_empty_token() {
        let mut config = valid_config();
        config.slack.token = String::new();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("slack.token"));
    }

    #[test]
    fn test_should_reject_empty_payload_token() {
        let mut config = valid_config();
        config.slack.payload_token = "  ".into();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("payload_token"));
    }

    #[test]
    fn test_should_reject_empty_origin() {
        let mut config = valid_config();
        config.slack.origin = String::new();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("origin"));
    }

    #[test]
    fn test_should_reject_zero_reconnect_interval() {
        let mut config = valid_config();
        config.realtime.reconnect_interval_secs = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("reconnect_interval_secs"));
    }

    #[test]
    fn test_should_reject_non_http_handshake_url() {
        let mut config = valid_config();
        config.realtime.handshake_url = "wss://slack.com".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_should_reject_relative_webhook_path() {
        let mut config = valid_config();
        config.webhook.path = "slack".into();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("webhook.path"));
    }

    #[test]
    fn test_should_load_from_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("config.yml");
        std::fs::write(
            &path,
            r#"
slack:
  token: "xoxb-test"
  payload_token: "secret"
  origin: "https://example.com"
"#,
        )
        .expect("write config");

        let config = BotConfig::load(&path).expect("load");
        assert_eq!(config.slack.origin, "https://example.com");
    }

    #[test]
    fn test_should_reject_invalid_file_contents() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("config.yml");
        std::fs::write(&path, "slack: [not, a, map]").expect("write config");

        let err = BotConfig::load(&path).unwrap_err().to_string();
        assert!(err.contains("Invalid YAML"));
    }

    #[test]
    fn test_should_error_on_missing_file() {
        let result = BotConfig::load(Path::new("/nonexistent/config.yml"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Cannot read"));
    }

    #[test]
    fn test_should_round_trip_yaml() {
        let config = valid_config();
        let yaml = serde_yaml::to_string(&config).expect("serialize");
        let deserialized: BotConfig = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(deserialized.slack.token, config.slack.token);
        assert_eq!(deserialized.webhook.bind, config.webhook.bind);
    }
}
