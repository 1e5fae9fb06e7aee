//! Slackbot Core Runtime
//!
//! Keeps a realtime session to the messaging backend open, dispatches
//! inbound events to handlers by kind, and routes inbound slash commands
//! and webhook triggers behind a shared-secret check.
//!
//! # Architecture
//!
//! - [`ConnectionManager`] performs the token handshake and owns the WebSocket session
//! - [`Bot`] runs the event loop, reconnecting on unexpected disconnects
//! - [`HandlerRegistry`] maps each [`EventKind`] to one handler
//! - [`Outbox`] queues outbound messages for the event loop from anywhere
//! - [`codec`] classifies frames and decodes [`Message`](codec::Message) and friends
//! - [`WebhookRouter`] applies command > trigger word > channel name precedence
//! - [`BotConfig`] holds settings from `~/.slackbot/config.yml`

mod bot;
pub mod codec;
pub mod config;
pub mod connection;
mod error;
mod handler;
pub mod webhook;

pub use bot::{Bot, BotHandle, ConnectionState};
pub use codec::{EventKind, Frame, Message, Timestamp};
pub use config::BotConfig;
pub use connection::{ConnectionManager, Transport};
pub use error::BotError;
pub use handler::{EventHandler, HandlerRegistry, HandlerResult, Outbox, OutboxReceiver};
pub use webhook::{CommandContext, WebhookRejection, WebhookRouter};
