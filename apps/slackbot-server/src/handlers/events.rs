//! Realtime event handlers.
//!
//! Answers `ping` with `pong` in the channel it came from and logs the
//! server greeting. Messages posted by bots, including this one, are
//! ignored.

use slackbot_core::codec::{self, Frame, Message};
use slackbot_core::{EventKind, HandlerRegistry, HandlerResult, Outbox};
use tracing::{debug, info};

/// Installs the server's realtime handlers.
pub fn register(handlers: &mut HandlerRegistry) {
    handlers
        .on(EventKind::Hello, on_hello)
        .on(EventKind::PresenceChange, on_presence_change)
        .on_message(on_message);
}

async fn on_hello(_outbox: Outbox, _frame: Frame) -> HandlerResult {
    info!("Realtime session greeted by server");
    Ok(())
}

async fn on_presence_change(_outbox: Outbox, frame: Frame) -> HandlerResult {
    let envelope = codec::decode_envelope(&frame)?;
    debug!(user = envelope.user, "Presence changed");
    Ok(())
}

async fn on_message(outbox: Outbox, message: Message) -> HandlerResult {
    if message.is_from_bot() || message.channel.is_empty() {
        return Ok(());
    }

    if message.text.trim().eq_ignore_ascii_case("ping") {
        let id = outbox.say(&message.channel, "pong")?;
        info!(channel = message.channel, user = message.user, id, "Answered ping");
    }
    Ok(())
}
