//! Slash commands and webhook hooks.
//!
//! - `/ping` answers `pong`
//! - `/say <text>` posts the text into the invoking channel over the
//!   realtime session
//! - the `echo` trigger word repeats the message back as an outgoing
//!   webhook response

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use slackbot_core::{CommandContext, Outbox, WebhookRouter};
use tracing::warn;

/// Body of an outgoing webhook response.
#[derive(Debug, Serialize)]
struct HookReply {
    text: String,
}

/// Installs the server's commands and hooks.
pub fn register(router: &mut WebhookRouter, outbox: Outbox) {
    router
        .command("/ping", |_ctx: CommandContext| async { "pong" })
        .command("/say", move |ctx: CommandContext| {
            let outbox = outbox.clone();
            async move { say(&outbox, ctx) }
        })
        .hook("echo", |ctx: CommandContext| async move { echo(ctx) });
}

fn say(outbox: &Outbox, ctx: CommandContext) -> Response {
    let text = ctx.text.trim();
    if text.is_empty() {
        return (StatusCode::OK, "Usage: /say <text>").into_response();
    }

    match outbox.say(ctx.channel_id.as_str(), text) {
        Ok(_) => (StatusCode::OK, "Sent").into_response(),
        Err(e) => {
            warn!(error = %e, channel = ctx.channel_id, "Cannot post, bot is offline");
            (StatusCode::SERVICE_UNAVAILABLE, "Bot is offline").into_response()
        }
    }
}

fn echo(ctx: CommandContext) -> Json<HookReply> {
    let rest = ctx
        .text
        .strip_prefix(ctx.trigger_word.as_str())
        .unwrap_or(&ctx.text)
        .trim();
    Json(HookReply {
        text: format!("{}: {rest}", ctx.user_name),
    })
}
