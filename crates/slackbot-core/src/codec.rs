//! Wire codec for realtime frames.
//!
//! Every frame on the realtime channel is a JSON object carrying a `type`
//! discriminant. This module turns raw frames into either a generic field map
//! (enough to pick a handler) or a typed [`Event`], and encodes outbound
//! entities back into frames.
//!
//! Decoding is permissive: unknown fields are ignored and missing fields take
//! their defaults. A frame that is not a JSON object, or that has no usable
//! `type`, fails with [`BotError::Decode`].
//!
//! Timestamps use a single wire form, a JSON string holding decimal seconds
//! since the Unix epoch (`"1355517523.000005"`). See [`Timestamp`].

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::BotError;

/// Maximum number of characters of a frame included in log lines.
const PREVIEW_CHARS: usize = 200;

/// One discrete unit read from or written to the realtime channel.
///
/// # Examples
///
/// ```
/// use slackbot_core::codec::Frame;
///
/// let frame = Frame::new(r#"{"type":"hello"}"#);
/// assert_eq!(frame.as_str(), r#"{"type":"hello"}"#);
/// assert!(!frame.is_blank());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(String);

impl Frame {
    /// Wraps raw frame text.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Returns the raw frame text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the frame and returns its text.
    pub fn into_string(self) -> String {
        self.0
    }

    /// Returns `true` when the frame is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Returns a prefix of the frame suitable for logging.
    pub fn preview(&self) -> &str {
        match self.0.char_indices().nth(PREVIEW_CHARS) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Self(text)
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Self(text.to_string())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! event_kinds {
    ($($variant:ident => $wire:literal,)+) => {
        /// Discriminant of a realtime event, taken from its `type` field.
        ///
        /// Known RTM event types have their own variant; anything else is
        /// kept verbatim in [`EventKind::Other`].
        ///
        /// # Examples
        ///
        /// ```
        /// use slackbot_core::EventKind;
        ///
        /// assert_eq!(EventKind::parse("message"), EventKind::Message);
        /// assert_eq!(EventKind::ChannelJoined.as_str(), "channel_joined");
        /// assert_eq!(
        ///     EventKind::parse("reaction_added"),
        ///     EventKind::Other("reaction_added".into())
        /// );
        /// ```
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum EventKind {
            $($variant,)+
            /// An event type without a dedicated variant.
            Other(String),
        }

        impl EventKind {
            /// Returns the wire name of this kind.
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $wire,)+
                    Self::Other(name) => name.as_str(),
                }
            }

            /// Maps a wire name to its kind.
            pub fn parse(name: &str) -> Self {
                match name {
                    $($wire => Self::$variant,)+
                    other => Self::Other(other.to_string()),
                }
            }
        }
    };
}

event_kinds! {
    Message => "message",
    Hello => "hello",
    ChannelMarked => "channel_marked",
    ChannelCreated => "channel_created",
    ChannelJoined => "channel_joined",
    ChannelLeft => "channel_left",
    ChannelDeleted => "channel_deleted",
    ChannelRename => "channel_rename",
    ChannelArchive => "channel_archive",
    ChannelUnarchive => "channel_unarchive",
    ChannelHistoryChanged => "channel_history_changed",
    ImCreated => "im_created",
    ImOpen => "im_open",
    ImClose => "im_close",
    ImMarked => "im_marked",
    ImHistoryChanged => "im_history_changed",
    GroupJoined => "group_joined",
    GroupLeft => "group_left",
    GroupOpen => "group_open",
    GroupClose => "group_close",
    GroupArchive => "group_archive",
    GroupUnarchive => "group_unarchive",
    GroupRename => "group_rename",
    GroupMarked => "group_marked",
    GroupHistoryChanged => "group_history_changed",
    FileCreated => "file_created",
    FileShared => "file_shared",
    FileUnshared => "file_unshared",
    FilePublic => "file_public",
    FilePrivate => "file_private",
    FileChange => "file_change",
    FileDeleted => "file_deleted",
    FileCommentAdded => "file_comment_added",
    FileCommentEdited => "file_comment_edited",
    FileCommentDeleted => "file_comment_deleted",
    PresenceChange => "presence_change",
    ManualPresenceChange => "manual_presence_change",
    PrefChange => "pref_change",
    UserChange => "user_change",
    TeamJoin => "team_join",
    StarAdded => "star_added",
    StarRemoved => "star_removed",
    EmojiChanged => "emoji_changed",
    CommandsChanged => "commands_changed",
    TeamPrefChange => "team_pref_change",
    TeamRename => "team_rename",
    TeamDomainChange => "team_domain_change",
    EmailDomainChanged => "email_domain_changed",
    BotAdded => "bot_added",
    BotChanged => "bot_changed",
    AccountsChanged => "accounts_changed",
    TeamMigrationStarted => "team_migration_started",
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl From<String> for EventKind {
    fn from(name: String) -> Self {
        Self::parse(&name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point in time as carried in `ts` fields.
///
/// The wire form is a JSON string of decimal seconds since the Unix epoch
/// with an optional fraction of up to nine digits. Parsing is exact: the
/// fraction is read as an integer, never through a float. Encoding writes
/// six fraction digits when the value has microsecond precision (the form the
/// backend issues, so message timestamps survive a round trip unchanged) and
/// nine digits otherwise.
///
/// JSON numbers, binary floats and RFC 3339 strings are rejected.
///
/// # Examples
///
/// ```
/// use slackbot_core::Timestamp;
///
/// let ts: Timestamp = "1355517523.000005".parse().unwrap();
/// assert_eq!(ts.secs(), 1_355_517_523);
/// assert_eq!(ts.nanos(), 5_000);
/// assert_eq!(ts.to_string(), "1355517523.000005");
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    secs: i64,
    nanos: u32,
}

impl Timestamp {
    /// Creates a timestamp, returning `None` if `secs` is negative or `nanos`
    /// is not below one second. The wire form has no sign.
    pub fn new(secs: i64, nanos: u32) -> Option<Self> {
        (secs >= 0 && nanos < 1_000_000_000).then_some(Self { secs, nanos })
    }

    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX),
            nanos: elapsed.subsec_nanos(),
        }
    }

    /// Whole seconds since the Unix epoch.
    pub fn secs(&self) -> i64 {
        self.secs
    }

    /// Nanoseconds past [`secs`](Self::secs).
    pub fn nanos(&self) -> u32 {
        self.nanos
    }
}

impl FromStr for Timestamp {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BotError::Decode(format!("invalid timestamp: {s:?}"));

        let (whole, fraction) = match s.split_once('.') {
            Some((whole, fraction)) => (whole, Some(fraction)),
            None => (s, None),
        };

        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let secs: i64 = whole.parse().map_err(|_| invalid())?;

        let nanos = match fraction {
            None => 0,
            Some(digits) => {
                if digits.is_empty()
                    || digits.len() > 9
                    || !digits.bytes().all(|b| b.is_ascii_digit())
                {
                    return Err(invalid());
                }
                let value: u32 = digits.parse().map_err(|_| invalid())?;
                // Right-pad to nine digits: "5" is 500_000_000ns.
                value * 10u32.pow(9 - digits.len() as u32)
            }
        };

        Ok(Self { secs, nanos })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nanos % 1_000 == 0 {
            write!(f, "{}.{:06}", self.secs, self.nanos / 1_000)
        } else {
            write!(f, "{}.{:09}", self.secs, self.nanos)
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A chat message, inbound or outbound.
///
/// Empty strings, zero ids, a missing timestamp and an empty attachment list
/// are all omitted on the wire.
///
/// # Examples
///
/// ```
/// use slackbot_core::codec::{self, Message};
///
/// let frame = r#"{"type":"message","channel":"C1","user":"U1","text":"hi","ts":"1.000001"}"#;
/// let msg = codec::decode_message(&frame.into()).unwrap();
/// assert_eq!(msg.channel, "C1");
/// assert_eq!(msg.text, "hi");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    /// Client-assigned id, used to match server replies.
    #[serde(skip_serializing_if = "is_zero")]
    pub id: u64,

    /// Always `"message"` for well-formed messages.
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub bot_id: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<Timestamp>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Returns `true` if the message was posted by a bot.
    pub fn is_from_bot(&self) -> bool {
        !self.bot_id.is_empty()
    }
}

/// A message attachment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attachment {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fallback: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub image_width: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub image_height: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub image_bytes: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author_name: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub id: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title_link: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub from_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author_link: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subtype: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Common header fields shared by most events.
///
/// Extraction is best effort: `channel` and `user` are only filled when the
/// frame carries them as plain strings (some events nest objects there), and
/// an unparsable `ts` is dropped rather than failing the frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub id: u64,
    pub kind: Option<EventKind>,
    pub channel: String,
    pub user: String,
    pub ts: Option<Timestamp>,
}

impl Envelope {
    /// Builds the header from a decoded field map.
    pub fn from_fields(fields: &Map<String, Value>) -> Self {
        let string = |key: &str| {
            fields
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Self {
            id: fields.get("id").and_then(Value::as_u64).unwrap_or_default(),
            kind: fields
                .get("type")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(EventKind::parse),
            channel: string("channel"),
            user: string("user"),
            ts: fields
                .get("ts")
                .and_then(Value::as_str)
                .and_then(|raw| raw.parse().ok()),
        }
    }
}

/// Server acknowledgement of a message the bot sent.
///
/// Reply frames carry `reply_to` instead of a `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reply {
    /// Id of the outbound message being acknowledged.
    pub reply_to: u64,

    #[serde(default)]
    pub ok: Option<bool>,

    #[serde(default)]
    pub ts: Option<Timestamp>,

    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub error: Option<ReplyError>,
}

impl Reply {
    /// Returns `true` unless the server explicitly rejected the message.
    pub fn is_ok(&self) -> bool {
        self.ok != Some(false) && self.error.is_none()
    }
}

/// Error detail attached to a failed [`Reply`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplyError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

/// Classification of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// An event to dispatch by kind.
    Event(EventKind),
    /// An acknowledgement for an outbound message.
    Reply(Reply),
}

/// A fully decoded event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The server greeting sent right after the channel opens.
    Hello,
    /// A chat message.
    Message(Message),
    /// Any other kind, with its raw fields.
    Other {
        kind: EventKind,
        fields: Map<String, Value>,
    },
}

impl Event {
    /// Returns the discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Hello => EventKind::Hello,
            Self::Message(_) => EventKind::Message,
            Self::Other { kind, .. } => kind.clone(),
        }
    }
}

/// Decodes a frame into a generic field map.
///
/// # Errors
///
/// Returns `BotError::Decode` if the frame is not a JSON object.
pub fn decode_fields(frame: &Frame) -> Result<Map<String, Value>, BotError> {
    match serde_json::from_str::<Value>(frame.as_str()) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(BotError::Decode(format!(
            "frame is not a JSON object: {}",
            json_type_name(&other)
        ))),
        Err(e) => Err(BotError::Decode(format!("bad JSON: {e}"))),
    }
}

/// Extracts the event discriminant from a frame.
///
/// # Errors
///
/// Returns `BotError::Decode` if the frame is not a JSON object or has no
/// non-empty string `type` field.
pub fn discriminant(frame: &Frame) -> Result<EventKind, BotError> {
    kind_of(&decode_fields(frame)?)
}

/// Classifies a frame as an event or a reply to an outbound message.
///
/// # Errors
///
/// Returns `BotError::Decode` for frames that are neither.
pub fn classify(frame: &Frame) -> Result<Inbound, BotError> {
    let fields = decode_fields(frame)?;

    if fields.contains_key("reply_to") && !fields.contains_key("type") {
        let reply: Reply = serde_json::from_value(Value::Object(fields))
            .map_err(|e| BotError::Decode(format!("bad reply: {e}")))?;
        return Ok(Inbound::Reply(reply));
    }

    kind_of(&fields).map(Inbound::Event)
}

/// Decodes a frame into a typed [`Event`].
///
/// # Errors
///
/// Returns `BotError::Decode` if the frame has no discriminant or if the
/// kind-specific fields do not decode.
pub fn decode_event(frame: &Frame) -> Result<Event, BotError> {
    let fields = decode_fields(frame)?;
    match kind_of(&fields)? {
        EventKind::Hello => Ok(Event::Hello),
        EventKind::Message => message_from_fields(fields).map(Event::Message),
        kind => Ok(Event::Other { kind, fields }),
    }
}

/// Decodes a frame into a [`Message`].
///
/// # Errors
///
/// Returns `BotError::Decode` if the frame is not a message-shaped object.
pub fn decode_message(frame: &Frame) -> Result<Message, BotError> {
    message_from_fields(decode_fields(frame)?)
}

/// Decodes the common header of a frame.
///
/// # Errors
///
/// Returns `BotError::Decode` if the frame is not a JSON object.
pub fn decode_envelope(frame: &Frame) -> Result<Envelope, BotError> {
    Ok(Envelope::from_fields(&decode_fields(frame)?))
}

/// Encodes an outbound entity into a frame.
///
/// # Errors
///
/// Returns `BotError::Json` if the entity cannot be serialized.
pub fn encode<T: Serialize>(entity: &T) -> Result<Frame, BotError> {
    Ok(Frame(serde_json::to_string(entity)?))
}

fn message_from_fields(fields: Map<String, Value>) -> Result<Message, BotError> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| BotError::Decode(format!("bad message: {e}")))
}

fn kind_of(fields: &Map<String, Value>) -> Result<EventKind, BotError> {
    match fields.get("type") {
        Some(Value::String(name)) if !name.is_empty() => Ok(EventKind::parse(name)),
        Some(Value::String(_)) => Err(BotError::Decode("empty type field".into())),
        Some(other) => Err(BotError::Decode(format!(
            "type field is a {}, expected a string",
            json_type_name(other)
        ))),
        None => Err(BotError::Decode("missing type field".into())),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
