//! Inbound webhook routing.
//!
//! [`WebhookRouter`] serves a single POST endpoint that receives slash
//! commands and outgoing-webhook triggers as form posts. Every request must
//! carry the shared secret in its `token` field. Authenticated requests are
//! routed by precedence:
//!
//! 1. `command` matching a registered command
//! 2. `trigger_word` matching a registered hook
//! 3. `channel_name` matching a registered hook
//!
//! Anything else is answered with `404 Not Found`.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::FormRejection;
use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::BotError;

type RouteHandler = Arc<dyn Fn(CommandContext) -> BoxFuture<'static, Response> + Send + Sync>;

/// Form fields of one webhook request. Missing fields are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandContext {
    pub token: String,
    pub team_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub user_id: String,
    pub user_name: String,
    /// Slash command name including the leading `/`.
    pub command: String,
    /// Word that fired an outgoing webhook.
    pub trigger_word: String,
    pub text: String,
}

/// Why a request was refused before reaching a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookRejection {
    /// The `token` field did not match the shared secret.
    TokenMismatch,
    /// No command or hook matched the request.
    UnknownRoute,
}

impl WebhookRejection {
    pub fn status(self) -> StatusCode {
        match self {
            Self::TokenMismatch => StatusCode::UNAUTHORIZED,
            Self::UnknownRoute => StatusCode::NOT_FOUND,
        }
    }
}

impl std::fmt::Display for WebhookRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TokenMismatch => f.write_str("token mismatch"),
            Self::UnknownRoute => f.write_str("unknown route"),
        }
    }
}

impl std::error::Error for WebhookRejection {}

impl IntoResponse for WebhookRejection {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Which rule matched a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Command,
    TriggerWord,
    ChannelName,
}

impl Route {
    fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::TriggerWord => "trigger_word",
            Self::ChannelName => "channel_name",
        }
    }
}

/// Command and hook registries behind a token check.
///
/// # Examples
///
/// ```
/// use slackbot_core::webhook::{CommandContext, Route, WebhookRouter};
///
/// let mut router = WebhookRouter::new("secret");
/// router
///     .command("/weather", |ctx: CommandContext| async move {
///         format!("forecast for {}", ctx.text)
///     })
///     .hook("weather", |_ctx: CommandContext| async { "hook" });
///
/// let ctx = CommandContext {
///     token: "secret".into(),
///     command: "/weather".into(),
///     trigger_word: "weather".into(),
///     ..Default::default()
/// };
/// assert_eq!(router.resolve(&ctx), Ok(Route::Command));
/// ```
#[derive(Clone)]
pub struct WebhookRouter {
    secret: String,
    commands: HashMap<String, RouteHandler>,
    hooks: HashMap<String, RouteHandler>,
}

impl WebhookRouter {
    /// Creates a router that accepts requests carrying `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            commands: HashMap::new(),
            hooks: HashMap::new(),
        }
    }

    /// Registers a slash command handler, keyed by the command name
    /// including its leading `/`. Registering a name twice keeps the last.
    pub fn command<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: IntoResponse,
    {
        self.commands.insert(name.into(), boxed(handler));
        self
    }

    /// Registers a hook handler, keyed by a trigger word or a channel name.
    /// Registering a name twice keeps the last.
    pub fn hook<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: IntoResponse,
    {
        self.hooks.insert(name.into(), boxed(handler));
        self
    }

    /// Decides how a request would be routed without running a handler.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookRejection::TokenMismatch`] if the token does not
    /// match, or [`WebhookRejection::UnknownRoute`] if nothing matches.
    pub fn resolve(&self, ctx: &CommandContext) -> Result<Route, WebhookRejection> {
        self.lookup(ctx).map(|(route, _)| route)
    }

    /// Authenticates and routes one request, returning the handler's
    /// response or the rejection status.
    pub async fn handle(&self, ctx: CommandContext) -> Response {
        let (route, handler) = match self.lookup(&ctx) {
            Ok(found) => found,
            Err(rejection) => {
                warn!(
                    user_id = ctx.user_id,
                    channel = ctx.channel_name,
                    command = ctx.command,
                    trigger_word = ctx.trigger_word,
                    text = ctx.text,
                    outcome = %rejection,
                    "Webhook request rejected"
                );
                return rejection.into_response();
            }
        };

        info!(
            user_id = ctx.user_id,
            channel = ctx.channel_name,
            command = ctx.command,
            trigger_word = ctx.trigger_word,
            text = ctx.text,
            outcome = route.as_str(),
            "Webhook request routed"
        );
        handler(ctx).await
    }

    /// Freezes the registries into an axum router serving `path`.
    pub fn into_router(self, path: &str) -> Router {
        Router::new()
            .route(path, post(handle_request))
            .with_state(Arc::new(self))
    }

    /// Binds `addr` and serves until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns `BotError::Io` if the address cannot be bound or the server
    /// fails.
    #[instrument(skip(self, shutdown))]
    pub async fn serve<S>(self, addr: SocketAddr, path: &str, shutdown: S) -> Result<(), BotError>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let app = self.into_router(path);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Webhook listener started");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Webhook listener stopped");
        Ok(())
    }

    fn lookup(&self, ctx: &CommandContext) -> Result<(Route, &RouteHandler), WebhookRejection> {
        if ctx.token != self.secret {
            return Err(WebhookRejection::TokenMismatch);
        }

        let candidates = [
            (Route::Command, &self.commands, ctx.command.as_str()),
            (Route::TriggerWord, &self.hooks, ctx.trigger_word.as_str()),
            (Route::ChannelName, &self.hooks, ctx.channel_name.as_str()),
        ];

        candidates
            .into_iter()
            .filter(|(_, _, key)| !key.is_empty())
            .find_map(|(route, registry, key)| registry.get(key).map(|h| (route, h)))
            .ok_or(WebhookRejection::UnknownRoute)
    }
}

impl std::fmt::Debug for WebhookRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookRouter")
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn boxed<F, Fut>(handler: F) -> RouteHandler
where
    F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: IntoResponse,
{
    Arc::new(move |ctx| handler(ctx).map(IntoResponse::into_response).boxed())
}

async fn handle_request(
    State(router): State<Arc<WebhookRouter>>,
    form: Result<Form<CommandContext>, FormRejection>,
) -> Response {
    // An unreadable body fails the token check like any tokenless request.
    let ctx = match form {
        Ok(Form(ctx)) => ctx,
        Err(rejection) => {
            debug!(error = %rejection, "Could not parse webhook body");
            CommandContext::default()
        }
    };
    router.handle(ctx).await
}
