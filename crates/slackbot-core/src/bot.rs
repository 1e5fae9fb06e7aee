//! The event loop.
//!
//! [`Bot`] owns the realtime connection and the handler registry. Its loop
//! reads one frame at a time, looks up the handler for the frame's kind and
//! awaits it to completion before reading again. Outbound messages queued on
//! the [`Outbox`] are written between reads.
//!
//! An unexpected disconnect parks the loop in [`Transport::reconnect`] until
//! a new session is up, and the outbox refuses sends in the meantime. A
//! frame the transport cannot read is skipped. Any other transport error
//! stops the loop.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{self, Frame, Inbound, Message, Reply};
use crate::config::BotConfig;
use crate::connection::{ConnectionManager, Transport};
use crate::error::BotError;
use crate::handler::{HandlerRegistry, Outbound, Outbox, OutboxReceiver};

/// Upper bound on sent messages still waiting for a reply.
const MAX_PENDING_REPLIES: usize = 1024;

/// Connection state published by the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// A session is open and the loop is reading.
    Connected,
    /// The session dropped and the loop is waiting for a new one.
    Reconnecting,
    /// The loop stopped on a fatal error.
    Failed(String),
}

enum Step {
    Outbound(Outbound),
    Inbound(Result<Frame, BotError>),
}

/// A connected bot, ready to run its event loop.
///
/// # Examples
///
/// ```no_run
/// use slackbot_core::config::BotConfig;
/// use slackbot_core::{Bot, HandlerRegistry};
///
/// # async fn example(config: BotConfig) -> Result<(), slackbot_core::BotError> {
/// let mut handlers = HandlerRegistry::new();
/// handlers.on_message(|outbox, message| async move {
///     if !message.is_from_bot() {
///         outbox.say(message.channel, message.text)?;
///     }
///     Ok(())
/// });
///
/// let bot = Bot::connect(&config, handlers).await?;
/// bot.run().await
/// # }
/// ```
pub struct Bot<T: Transport = ConnectionManager> {
    transport: T,
    handlers: HandlerRegistry,
    outbox: Outbox,
    outbound: OutboxReceiver,
    state: watch::Sender<ConnectionState>,
    pending: BTreeMap<u64, Message>,
}

impl Bot<ConnectionManager> {
    /// Performs the handshake and opens the realtime channel.
    ///
    /// # Errors
    ///
    /// Returns `BotError::Auth` if the token is rejected, or
    /// `BotError::Transport` if the backend cannot be reached.
    pub async fn connect(config: &BotConfig, handlers: HandlerRegistry) -> Result<Self, BotError> {
        let mut connection = ConnectionManager::new(
            config.slack.token.clone(),
            config.slack.origin.clone(),
            config.realtime.clone(),
        );
        connection.connect().await?;
        Ok(Self::with_transport(connection, handlers))
    }
}

impl<T: Transport> Bot<T> {
    /// Wraps an already connected transport.
    pub fn with_transport(transport: T, handlers: HandlerRegistry) -> Self {
        let (outbox, outbound) = Outbox::detached();
        let (state, _) = watch::channel(ConnectionState::Connected);
        Self {
            transport,
            handlers,
            outbox,
            outbound,
            state,
            pending: BTreeMap::new(),
        }
    }

    /// Returns a handle for queuing outbound messages.
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Subscribes to connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Runs the event loop until a fatal transport error.
    ///
    /// # Errors
    ///
    /// Returns the first error from the transport that is not an unexpected
    /// disconnect.
    pub async fn run(mut self) -> Result<(), BotError> {
        info!(handlers = self.handlers.len(), "Event loop started");
        self.state.send_replace(ConnectionState::Connected);

        loop {
            let step = tokio::select! {
                biased;
                Some(outbound) = self.outbound.0.recv() => Step::Outbound(outbound),
                received = self.transport.next_frame() => Step::Inbound(received),
            };

            match step {
                Step::Outbound(outbound) => self.write(outbound).await,
                Step::Inbound(Ok(frame)) => self.dispatch(frame).await,
                Step::Inbound(Err(e)) if e.is_reconnectable() => self.reconnect().await,
                Step::Inbound(Err(BotError::Decode(reason))) => {
                    warn!(error = reason, "Skipping unreadable frame");
                }
                Step::Inbound(Err(e)) => {
                    error!(error = %e, "Event loop stopped");
                    self.state.send_replace(ConnectionState::Failed(e.to_string()));
                    return Err(e);
                }
            }
        }
    }

    /// Runs the event loop on a new task.
    pub fn spawn(self) -> BotHandle
    where
        T: 'static,
    {
        let outbox = self.outbox();
        let state = self.state();
        let task = tokio::spawn(self.run());
        BotHandle {
            task,
            outbox,
            state,
        }
    }

    async fn dispatch(&mut self, frame: Frame) {
        let kind = match codec::classify(&frame) {
            Ok(Inbound::Event(kind)) => kind,
            Ok(Inbound::Reply(reply)) => {
                self.acknowledge(reply);
                return;
            }
            Err(e) => {
                warn!(error = %e, frame = frame.preview(), "Skipping undecodable frame");
                return;
            }
        };

        let Some(handler) = self.handlers.get(&kind).cloned() else {
            debug!(kind = %kind, "No handler registered");
            return;
        };

        debug!(kind = %kind, "Dispatching event");
        let result = AssertUnwindSafe(handler.call(self.outbox.clone(), frame))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(kind = %kind, error = %e, "Event handler failed"),
            Err(panic_info) => {
                let panic_msg = panic_info
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| panic_info.downcast_ref::<&str>().copied())
                    .unwrap_or("unknown panic");
                warn!(kind = %kind, error = panic_msg, "Event handler panicked");
            }
        }
    }

    async fn write(&mut self, outbound: Outbound) {
        let (message, frame) = match outbound {
            Outbound::Message(message) => match codec::encode(&message) {
                Ok(frame) => (Some(message), frame),
                Err(e) => {
                    warn!(id = message.id, error = %e, "Dropping unencodable message");
                    return;
                }
            },
            Outbound::Frame(frame) => (None, frame),
        };

        // A failed write is not acted on here. If the channel is gone the
        // next read reports it and drives the reconnect.
        if let Err(e) = self.transport.send_frame(frame).await {
            warn!(
                id = message.as_ref().map(|m| m.id),
                error = %e,
                "Failed to send outbound frame"
            );
            return;
        }

        if let Some(message) = message {
            debug!(id = message.id, channel = message.channel, "Message sent");
            self.pending.insert(message.id, message);
            while self.pending.len() > MAX_PENDING_REPLIES {
                self.pending.pop_first();
            }
        }
    }

    fn acknowledge(&mut self, reply: Reply) {
        let sent = self.pending.remove(&reply.reply_to);
        let channel = sent.as_ref().map(|m| m.channel.as_str()).unwrap_or_default();

        if reply.is_ok() {
            debug!(reply_to = reply.reply_to, channel, ts = ?reply.ts, "Message acknowledged");
        } else {
            let error = reply.error.as_ref().map(|e| e.msg.as_str()).unwrap_or("unknown");
            warn!(reply_to = reply.reply_to, channel, error, "Message rejected");
        }
    }

    async fn reconnect(&mut self) {
        self.outbox.set_online(false);
        self.state.send_replace(ConnectionState::Reconnecting);
        // Replies for the old session will never arrive.
        self.pending.clear();

        let dropped = self.outbound.discard();
        if dropped > 0 {
            warn!(dropped, "Discarded messages queued for the lost session");
        }

        self.transport.reconnect().await;
        self.outbox.set_online(true);
        self.state.send_replace(ConnectionState::Connected);
    }
}

impl<T: Transport> std::fmt::Debug for Bot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("handlers", &self.handlers)
            .field("state", &*self.state.borrow())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Handle to an event loop running on its own task.
#[derive(Debug)]
pub struct BotHandle {
    task: JoinHandle<Result<(), BotError>>,
    outbox: Outbox,
    state: watch::Receiver<ConnectionState>,
}

impl BotHandle {
    /// Returns a handle for queuing outbound messages.
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Subscribes to connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Returns `true` once the event loop task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the event loop.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Waits for the event loop to finish. A cancelled loop counts as a
    /// clean stop.
    ///
    /// # Errors
    ///
    /// Returns the loop's fatal error, or `BotError::Transport` if the task
    /// panicked.
    pub async fn join(&mut self) -> Result<(), BotError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(BotError::Transport(format!("event loop task failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::codec::EventKind;

    /// Replays a fixed script of reads and records writes and reconnects.
    /// Reports a fatal error once the script runs out.
    #[derive(Default)]
    struct ScriptedTransport {
        script: VecDeque<Result<Frame, BotError>>,
        sent: Arc<Mutex<Vec<Frame>>>,
        reconnects: Arc<AtomicUsize>,
        /// Tried from inside `reconnect`; each result is recorded.
        outbox: Option<Outbox>,
        sends_while_reconnecting: Arc<Mutex<Vec<Result<u64, BotError>>>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<Frame, BotError>>) -> Self {
            Self {
                script: script.into(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn next_frame(&mut self) -> Result<Frame, BotError> {
            self.script
                .pop_front()
                .unwrap_or_else(|| Err(BotError::Transport("script exhausted".into())))
        }

        async fn send_frame(&mut self, frame: Frame) -> Result<(), BotError> {
            self.sent.lock().expect("lock").push(frame);
            Ok(())
        }

        async fn reconnect(&mut self) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            if let Some(outbox) = &self.outbox {
                let result = outbox.say("C1", "during outage");
                self.sends_while_reconnecting.lock().expect("lock").push(result);
            }
        }
    }

    fn frame(json: &str) -> Result<Frame, BotError> {
        Ok(Frame::new(json))
    }

    /// Registers a handler per kind that appends the kind to a shared log.
    fn recording(kinds: &[EventKind]) -> (HandlerRegistry, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handlers = HandlerRegistry::new();
        for kind in kinds {
            let log = Arc::clone(&log);
            let name = kind.to_string();
            handlers.on(kind.clone(), move |_, _| {
                let log = Arc::clone(&log);
                let name = name.clone();
                async move {
                    log.lock().expect("lock").push(name);
                    Ok(())
                }
            });
        }
        (handlers, log)
    }

    #[tokio::test]
    async fn test_should_dispatch_each_frame_to_its_handler() {
        let transport = ScriptedTransport::new(vec![
            frame(r#"{"type":"hello"}"#),
            frame(r#"{"type":"message","channel":"C1","text":"hi"}"#),
            frame(r#"{"type":"hello"}"#),
        ]);
        let (handlers, log) = recording(&[EventKind::Hello, EventKind::Message]);

        let err = Bot::with_transport(transport, handlers).run().await.unwrap_err();

        assert!(err.to_string().contains("script exhausted"));
        assert_eq!(*log.lock().expect("lock"), vec!["hello", "message", "hello"]);
    }

    #[tokio::test]
    async fn test_should_skip_unregistered_and_malformed_frames() {
        let transport = ScriptedTransport::new(vec![
            frame(r#"{"type":"presence_change","user":"U1"}"#),
            frame("not json"),
            frame(r#"{"text":"no type"}"#),
            frame(r#"{"type":"hello"}"#),
        ]);
        let (handlers, log) = recording(&[EventKind::Hello]);

        let _ = Bot::with_transport(transport, handlers).run().await;

        assert_eq!(*log.lock().expect("lock"), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_should_reconnect_only_on_unexpected_disconnect() {
        let transport = ScriptedTransport::new(vec![
            frame(r#"{"type":"hello"}"#),
            Err(BotError::UnexpectedDisconnect),
            frame(r#"{"type":"hello"}"#),
            Err(BotError::UnexpectedDisconnect),
            Err(BotError::Transport("boom".into())),
        ]);
        let reconnects = Arc::clone(&transport.reconnects);
        let (handlers, log) = recording(&[EventKind::Hello]);

        let err = Bot::with_transport(transport, handlers).run().await.unwrap_err();

        assert!(matches!(err, BotError::Transport(ref msg) if msg == "boom"));
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);
        assert_eq!(log.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn test_should_continue_after_handler_error_and_panic() {
        let transport = ScriptedTransport::new(vec![
            frame(r#"{"type":"presence_change"}"#),
            frame(r#"{"type":"team_join"}"#),
            frame(r#"{"type":"hello"}"#),
        ]);
        let (mut handlers, log) = recording(&[EventKind::Hello]);
        handlers
            .on(EventKind::PresenceChange, |_, _| async {
                Err(anyhow::anyhow!("handler failed"))
            })
            .on(EventKind::TeamJoin, |_, frame: Frame| async move {
                if !frame.is_blank() {
                    panic!("handler panicked");
                }
                Ok(())
            });

        let _ = Bot::with_transport(transport, handlers).run().await;

        assert_eq!(*log.lock().expect("lock"), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_should_write_messages_queued_by_handlers() {
        let transport = ScriptedTransport::new(vec![frame(
            r#"{"type":"message","channel":"C9","text":"ping"}"#,
        )]);
        let sent = Arc::clone(&transport.sent);
        let mut handlers = HandlerRegistry::new();
        handlers.on_message(|outbox, message| async move {
            outbox.say(message.channel, "pong")?;
            Ok(())
        });

        let _ = Bot::with_transport(transport, handlers).run().await;

        let sent = sent.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        let reply = codec::decode_message(&sent[0]).expect("decode");
        assert_eq!(reply.id, 1);
        assert_eq!(reply.kind, "message");
        assert_eq!(reply.channel, "C9");
        assert_eq!(reply.text, "pong");
    }

    #[tokio::test]
    async fn test_should_write_messages_queued_from_outside() {
        let transport = ScriptedTransport::new(Vec::new());
        let sent = Arc::clone(&transport.sent);
        let bot = Bot::with_transport(transport, HandlerRegistry::new());
        let outbox = bot.outbox();
        outbox.say("C1", "first").expect("queue");
        outbox
            .send_frame(Frame::new(r#"{"type":"ping","id":99}"#))
            .expect("queue");

        let _ = bot.run().await;

        let sent = sent.lock().expect("lock");
        assert_eq!(sent.len(), 2);
        assert!(sent[0].as_str().contains("first"));
        assert!(sent[1].as_str().contains("ping"));
    }

    #[tokio::test]
    async fn test_should_fail_outbox_after_loop_stops() {
        let bot = Bot::with_transport(ScriptedTransport::default(), HandlerRegistry::new());
        let outbox = bot.outbox();

        assert!(bot.run().await.is_err());
        assert!(matches!(outbox.say("C1", "late"), Err(BotError::Transport(_))));
    }

    #[tokio::test]
    async fn test_should_track_and_acknowledge_sent_messages() {
        let mut bot = Bot::with_transport(ScriptedTransport::default(), HandlerRegistry::new());
        let outbox = bot.outbox();
        let first = outbox.new_message("C1", "one");
        let second = outbox.new_message("C1", "two");

        bot.write(Outbound::Message(first)).await;
        bot.write(Outbound::Message(second)).await;
        assert_eq!(bot.pending.len(), 2);

        bot.dispatch(Frame::new(r#"{"ok":true,"reply_to":1,"ts":"1.000001","text":"one"}"#))
            .await;
        assert!(!bot.pending.contains_key(&1));
        assert!(bot.pending.contains_key(&2));

        bot.dispatch(Frame::new(
            r#"{"ok":false,"reply_to":2,"error":{"code":2,"msg":"message text is missing"}}"#,
        ))
        .await;
        assert!(bot.pending.is_empty());
    }

    #[tokio::test]
    async fn test_should_clear_pending_replies_on_reconnect() {
        let mut bot = Bot::with_transport(ScriptedTransport::default(), HandlerRegistry::new());
        let message = bot.outbox().new_message("C1", "lost");
        bot.write(Outbound::Message(message)).await;
        assert_eq!(bot.pending.len(), 1);

        bot.reconnect().await;

        assert!(bot.pending.is_empty());
        assert_eq!(bot.transport.reconnects.load(Ordering::SeqCst), 1);
        assert_eq!(*bot.state().borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_should_discard_backlog_and_refuse_sends_while_reconnecting() {
        let mut bot = Bot::with_transport(ScriptedTransport::default(), HandlerRegistry::new());
        let outbox = bot.outbox();
        bot.transport.outbox = Some(outbox.clone());
        outbox.say("C1", "stale").expect("queue");
        outbox
            .send_frame(Frame::new(r#"{"type":"ping"}"#))
            .expect("queue");

        bot.reconnect().await;

        let attempts = bot.transport.sends_while_reconnecting.lock().expect("lock");
        assert_eq!(attempts.len(), 1);
        assert!(matches!(attempts[0], Err(BotError::Transport(_))));
        drop(attempts);

        assert!(bot.outbound.try_next_message().is_none());
        assert!(bot.transport.sent.lock().expect("lock").is_empty());

        outbox.say("C1", "fresh").expect("queue after reconnect");
        assert_eq!(bot.outbound.try_next_message().expect("queued").text, "fresh");
    }

    #[tokio::test]
    async fn test_should_skip_unreadable_frames() {
        let transport = ScriptedTransport::new(vec![
            Err(BotError::Decode("frame has reserved bits set".into())),
            frame(r#"{"type":"hello"}"#),
        ]);
        let reconnects = Arc::clone(&transport.reconnects);
        let (handlers, log) = recording(&[EventKind::Hello]);

        let err = Bot::with_transport(transport, handlers).run().await.unwrap_err();

        assert!(err.to_string().contains("script exhausted"));
        assert_eq!(*log.lock().expect("lock"), vec!["hello"]);
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_should_publish_failed_state_on_fatal_error() {
        let bot = Bot::with_transport(ScriptedTransport::default(), HandlerRegistry::new());
        let state = bot.state();

        let _ = bot.run().await;

        assert!(matches!(
            &*state.borrow(),
            ConnectionState::Failed(reason) if reason.contains("script exhausted")
        ));
    }

    #[tokio::test]
    async fn test_should_join_spawned_loop() {
        let transport = ScriptedTransport::new(vec![frame(r#"{"type":"hello"}"#)]);
        let (handlers, log) = recording(&[EventKind::Hello]);
        let mut handle = Bot::with_transport(transport, handlers).spawn();

        let err = handle.join().await.unwrap_err();

        assert!(matches!(err, BotError::Transport(_)));
        assert!(handle.is_finished());
        assert_eq!(log.lock().expect("lock").len(), 1);
    }
}
