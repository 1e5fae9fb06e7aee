//! Event handlers, their registry, and the outbound queue they write to.
//!
//! A [`HandlerRegistry`] maps each [`EventKind`] to one [`EventHandler`]. It
//! is filled in before the event loop starts and moved into the
//! [`Bot`](crate::Bot), after which nothing can change it.
//!
//! Handlers never touch the connection directly. They receive an [`Outbox`],
//! a cloneable handle that queues messages for the event loop, which owns the
//! connection and performs the actual writes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::debug;

use crate::codec::{self, EventKind, Frame, Message};
use crate::error::BotError;

/// Result type returned by event handlers.
pub type HandlerResult = anyhow::Result<()>;

type BoxedHandler = Arc<dyn Fn(Outbox, Frame) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Something queued for the event loop to write.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    /// A message, tracked until the server replies to its id.
    Message(Message),
    /// A pre-encoded frame, written as is.
    Frame(Frame),
}

/// Cloneable handle for sending on the realtime channel.
///
/// Sends are queued and written by the event loop in order. Queuing never
/// blocks, so handlers may send from inside the loop.
///
/// While the event loop is reconnecting, sends are refused. Anything still
/// queued when the session dropped is discarded rather than replayed into
/// the new session.
///
/// # Examples
///
/// ```
/// use slackbot_core::Outbox;
///
/// let (outbox, _rx) = Outbox::detached();
/// let first = outbox.new_message("C123", "hello");
/// let second = outbox.new_message("C123", "again");
/// assert_eq!(first.id, 1);
/// assert_eq!(second.id, 2);
/// assert_eq!(first.kind, "message");
/// ```
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
    next_id: Arc<AtomicU64>,
    online: Arc<AtomicBool>,
}

/// Receiving half of an [`Outbox`], held by the event loop.
#[derive(Debug)]
pub struct OutboxReceiver(pub(crate) mpsc::UnboundedReceiver<Outbound>);

impl Outbox {
    /// Creates an outbox and its receiving half.
    ///
    /// The bot creates its own; this is for driving handlers in isolation.
    pub fn detached() -> (Self, OutboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbox = Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            online: Arc::new(AtomicBool::new(true)),
        };
        (outbox, OutboxReceiver(rx))
    }

    /// Reserves the next message id. Ids start at 1.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Marks the session up or down for every clone of this outbox.
    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn enqueue(&self, outbound: Outbound) -> Result<(), BotError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(BotError::Transport("realtime session is reconnecting".into()));
        }
        self.tx
            .send(outbound)
            .map_err(|_| BotError::Transport("event loop is not running".into()))
    }

    /// Builds a `message` entity with a fresh id.
    pub fn new_message(&self, channel: impl Into<String>, text: impl Into<String>) -> Message {
        Message {
            id: self.next_id(),
            kind: EventKind::Message.as_str().to_string(),
            channel: channel.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    /// Queues a message, assigning an id if it has none and the `message`
    /// type if it has no type. Returns the id.
    ///
    /// # Errors
    ///
    /// Returns `BotError::Transport` if the event loop has stopped or is
    /// reconnecting.
    pub fn send(&self, mut message: Message) -> Result<u64, BotError> {
        if message.id == 0 {
            message.id = self.next_id();
        }
        if message.kind.is_empty() {
            message.kind = EventKind::Message.as_str().to_string();
        }
        let id = message.id;
        self.enqueue(Outbound::Message(message))?;
        Ok(id)
    }

    /// Queues a text message to a channel. Returns the message id.
    ///
    /// # Errors
    ///
    /// Returns `BotError::Transport` if the event loop has stopped or is
    /// reconnecting.
    pub fn say(&self, channel: impl Into<String>, text: impl Into<String>) -> Result<u64, BotError> {
        self.send(self.new_message(channel, text))
    }

    /// Queues a pre-encoded frame.
    ///
    /// # Errors
    ///
    /// Returns `BotError::Transport` if the event loop has stopped or is
    /// reconnecting.
    pub fn send_frame(&self, frame: Frame) -> Result<(), BotError> {
        self.enqueue(Outbound::Frame(frame))
    }
}

impl OutboxReceiver {
    /// Takes the next queued message without waiting, if any.
    ///
    /// Raw frames queued ahead of it are consumed and skipped.
    pub fn try_next_message(&mut self) -> Option<Message> {
        loop {
            match self.0.try_recv().ok()? {
                Outbound::Message(message) => return Some(message),
                Outbound::Frame(_) => continue,
            }
        }
    }

    /// Drops everything queued so far. Returns how many items were dropped.
    pub(crate) fn discard(&mut self) -> usize {
        let mut dropped = 0;
        while self.0.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// A handler for one event kind.
///
/// Receives the raw frame; use [`EventHandler::message`] for a handler that
/// wants a decoded [`Message`].
#[derive(Clone)]
pub struct EventHandler(BoxedHandler);

impl EventHandler {
    /// Wraps an async function of the outbox and the raw frame.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Outbox, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self(Arc::new(move |outbox, frame| handler(outbox, frame).boxed()))
    }

    /// Wraps an async function that receives the frame decoded as a
    /// [`Message`]. A frame that does not decode fails the handler.
    pub fn message<F, Fut>(handler: F) -> Self
    where
        F: Fn(Outbox, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(move |outbox, frame| {
            let handler = Arc::clone(&handler);
            async move {
                let message = codec::decode_message(&frame)?;
                handler(outbox, message).await
            }
        })
    }

    /// Invokes the handler.
    pub fn call(&self, outbox: Outbox, frame: Frame) -> BoxFuture<'static, HandlerResult> {
        (self.0)(outbox, frame)
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventHandler")
    }
}

/// Maps event kinds to handlers. Registering a kind twice keeps the last
/// handler.
///
/// # Examples
///
/// ```
/// use slackbot_core::{EventKind, HandlerRegistry};
///
/// let mut handlers = HandlerRegistry::new();
/// handlers
///     .on(EventKind::Hello, |_outbox, _frame| async { Ok(()) })
///     .on_message(|outbox, message| async move {
///         if message.text == "ping" {
///             outbox.say(message.channel, "pong")?;
///         }
///         Ok(())
///     });
///
/// assert!(handlers.contains(&EventKind::Message));
/// assert_eq!(handlers.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, EventHandler>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, returning the one it replaced.
    pub fn insert(
        &mut self,
        kind: impl Into<EventKind>,
        handler: EventHandler,
    ) -> Option<EventHandler> {
        // Route through the wire name so `Other("message")` lands on `Message`.
        let kind = EventKind::parse(kind.into().as_str());
        let replaced = self.handlers.insert(kind.clone(), handler);
        if replaced.is_some() {
            debug!(kind = %kind, "Replaced existing handler");
        }
        replaced
    }

    /// Registers an async function for a kind.
    pub fn on<K, F, Fut>(&mut self, kind: K, handler: F) -> &mut Self
    where
        K: Into<EventKind>,
        F: Fn(Outbox, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(kind, EventHandler::new(handler));
        self
    }

    /// Registers a typed handler for `message` events.
    pub fn on_message<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Outbox, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(EventKind::Message, EventHandler::message(handler));
        self
    }

    /// Looks up the handler for a kind.
    pub fn get(&self, kind: &EventKind) -> Option<&EventHandler> {
        self.handlers.get(kind)
    }

    pub fn contains(&self, kind: &EventKind) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn test_should_keep_last_registered_handler() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerRegistry::new();

        let counter = Arc::clone(&first);
        handlers.on(EventKind::Hello, move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let counter = Arc::clone(&second);
        handlers.on("hello", move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert_eq!(handlers.len(), 1);
        let (outbox, _rx) = Outbox::detached();
        handlers
            .get(&EventKind::Hello)
            .expect("handler")
            .call(outbox, Frame::new(r#"{"type":"hello"}"#))
            .await
            .expect("handler ok");

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_should_normalize_other_kind_names() {
        let mut handlers = HandlerRegistry::new();
        handlers.on(EventKind::Other("message".into()), |_, _| async { Ok(()) });
        assert!(handlers.contains(&EventKind::Message));
        assert!(!handlers.is_empty());
    }

    #[tokio::test]
    async fn test_should_decode_message_for_typed_handler() {
        let mut handlers = HandlerRegistry::new();
        handlers.on_message(|outbox, message| async move {
            outbox.say(message.channel, format!("echo: {}", message.text))?;
            Ok(())
        });

        let (outbox, mut rx) = Outbox::detached();
        let frame = Frame::new(r#"{"type":"message","channel":"C1","text":"hi"}"#);
        handlers
            .get(&EventKind::Message)
            .expect("handler")
            .call(outbox, frame)
            .await
            .expect("handler ok");

        let reply = rx.try_next_message().expect("queued reply");
        assert_eq!(reply.channel, "C1");
        assert_eq!(reply.text, "echo: hi");
        assert_eq!(reply.id, 1);
    }

    #[tokio::test]
    async fn test_should_fail_typed_handler_on_undecodable_message() {
        let handler = EventHandler::message(|_, _| async { Ok(()) });
        let (outbox, _rx) = Outbox::detached();
        let result = handler
            .call(outbox, Frame::new(r#"{"type":"message","ts":12}"#))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_should_assign_id_on_send() {
        let (outbox, mut rx) = Outbox::detached();
        let id = outbox
            .send(Message {
                channel: "C1".into(),
                text: "no id".into(),
                ..Default::default()
            })
            .expect("send");
        assert_eq!(id, 1);

        let queued = rx.try_next_message().expect("queued message");
        assert_eq!(queued.id, 1);
        let frame = codec::encode(&queued).expect("encode");
        assert_eq!(
            codec::discriminant(&frame).expect("outbound frame has a type"),
            EventKind::Message
        );
    }

    #[test]
    fn test_should_keep_explicit_kind_on_send() {
        let (outbox, mut rx) = Outbox::detached();
        outbox
            .send(Message {
                kind: "typing".into(),
                channel: "C1".into(),
                ..Default::default()
            })
            .expect("send");
        assert_eq!(rx.try_next_message().expect("queued").kind, "typing");
    }

    #[test]
    fn test_should_skip_raw_frames_when_taking_messages() {
        let (outbox, mut rx) = Outbox::detached();
        outbox
            .send_frame(Frame::new(r#"{"type":"ping","id":7}"#))
            .expect("queue frame");
        outbox.say("C1", "after frame").expect("queue message");

        let message = rx.try_next_message().expect("message behind frame");
        assert_eq!(message.text, "after frame");
        assert!(rx.try_next_message().is_none());
    }

    #[test]
    fn test_should_refuse_sends_while_offline() {
        let (outbox, mut rx) = Outbox::detached();
        outbox.say("C1", "queued").expect("queue");
        let clone = outbox.clone();

        outbox.set_online(false);
        let err = clone.say("C1", "refused").unwrap_err();
        assert!(matches!(err, BotError::Transport(ref msg) if msg.contains("reconnecting")));
        assert!(clone.send_frame(Frame::new(r#"{"type":"ping"}"#)).is_err());
        assert_eq!(rx.discard(), 1);

        outbox.set_online(true);
        clone.say("C1", "accepted").expect("queue");
        assert_eq!(rx.try_next_message().expect("queued").text, "accepted");
    }

    #[test]
    fn test_should_keep_existing_id_on_send() {
        let (outbox, _rx) = Outbox::detached();
        let message = outbox.new_message("C1", "hi");
        let id = outbox.send(message).expect("send");
        assert_eq!(id, 1);
        assert_eq!(outbox.next_id(), 2);
    }

    #[test]
    fn test_should_fail_send_after_receiver_dropped() {
        let (outbox, rx) = Outbox::detached();
        drop(rx);
        let err = outbox.say("C1", "hi").unwrap_err();
        assert!(matches!(err, BotError::Transport(_)));
    }

    #[test]
    fn test_should_share_ids_across_clones() {
        let (outbox, _rx) = Outbox::detached();
        let clone = outbox.clone();
        assert_eq!(outbox.next_id(), 1);
        assert_eq!(clone.next_id(), 2);
    }
}
