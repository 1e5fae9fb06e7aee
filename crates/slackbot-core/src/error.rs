//! Error types for the slackbot runtime.
//!
//! Defines [`BotError`] as the primary error type for the realtime session
//! and its supporting pieces. Uses `thiserror` for ergonomic error
//! definitions following the project convention.

use thiserror::Error;

/// Error type for slackbot-core operations.
///
/// Only [`Auth`](Self::Auth) and [`Transport`](Self::Transport) are fatal to
/// the event loop. [`UnexpectedDisconnect`](Self::UnexpectedDisconnect)
/// triggers a reconnect and [`Decode`](Self::Decode) skips a single frame.
///
/// # Examples
///
/// ```
/// use slackbot_core::BotError;
///
/// let err = BotError::Auth("invalid_auth".into());
/// assert!(err.to_string().contains("invalid_auth"));
/// assert!(!err.is_reconnectable());
/// ```
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BotError {
    /// The handshake completed but the backend reported `ok: false`.
    #[error("Auth error: {0}")]
    Auth(String),

    /// A non-recoverable HTTP or WebSocket failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The realtime channel closed underneath us; the session must be
    /// re-established.
    #[error("Unexpected disconnect")]
    UnexpectedDisconnect,

    /// A frame could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A configuration error (missing or invalid config file/values).
    #[error("Config error: {0}")]
    Config(String),

    /// An I/O error from file system or socket operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl BotError {
    /// Returns `true` when the event loop should reconnect instead of
    /// terminating.
    pub fn is_reconnectable(&self) -> bool {
        matches!(self, Self::UnexpectedDisconnect)
    }
}
