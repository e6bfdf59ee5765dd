//! Transport Trait Abstractions
//!
//! The protocol library (handshake, end-to-end encryption, wire format) lives
//! behind these traits. The session manager only consumes the event stream a
//! session emits and calls the handful of primitives exposed here.
//! `MockNetwork` replaces the real library in tests.

use super::events::EventStream;
use crate::store::credentials::Credentials;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Managed instance identifier (one authenticated device identity)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key addressing one message inside one conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    /// Conversation the message belongs to
    pub conversation: String,
    /// Message id, unique within the conversation
    pub id: String,
    /// Whether this instance authored the message
    #[serde(default)]
    pub from_me: bool,
    /// Author inside a group conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
}

impl MessageKey {
    pub fn new(conversation: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            conversation: conversation.into(),
            id: id.into(),
            from_me: false,
            participant: None,
        }
    }
}

/// A message as stored and forwarded by the session manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub key: MessageKey,
    /// Sender timestamp (milliseconds)
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    pub content: MessageContent,
    /// Per-message secret embedded by the sender (poll vote encryption key)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::webhook::base64_opt"
    )]
    pub message_secret: Option<Vec<u8>>,
    /// Decrypted votes accumulated on a poll-creation message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poll_updates: Vec<PollVoteRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

/// Delivery status reported by the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    ServerAck,
    Delivered,
    Read,
    Played,
}

/// Message content types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageContent {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quoted: Option<MessageKey>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        mentions: Vec<String>,
    },
    Media {
        kind: MediaKind,
        mimetype: String,
        #[serde(with = "crate::webhook::base64_bytes")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quoted: Option<MessageKey>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        mentions: Vec<String>,
    },
    PollCreation(PollCreation),
    PollUpdate(PollUpdateMessage),
    Reaction {
        target: MessageKey,
        emoji: String,
    },
    /// Revoked (deleted for everyone)
    Revoke {
        target: MessageKey,
    },
}

/// Media message kind, chosen from the mimetype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    /// `image/*`, `video/*` and `audio/*` map to their kind; anything else is a document.
    pub fn from_mimetype(mimetype: &str) -> Self {
        let top = mimetype.split('/').next().unwrap_or_default();
        match top.trim().to_ascii_lowercase().as_str() {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::Document,
        }
    }
}

/// Poll structure: a question with named options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollCreation {
    pub name: String,
    pub options: Vec<String>,
    /// How many options one voter may select (0 = unlimited)
    #[serde(default)]
    pub selectable_count: u32,
}

/// Encrypted vote referencing a poll-creation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollUpdateMessage {
    pub creation_key: MessageKey,
    pub vote: EncryptedVote,
    pub sender_timestamp_ms: u64,
}

/// Opaque encrypted vote payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedVote {
    #[serde(with = "crate::webhook::base64_bytes")]
    pub enc_payload: Vec<u8>,
    #[serde(with = "crate::webhook::base64_bytes")]
    pub enc_iv: Vec<u8>,
}

/// Identities and secret required to decrypt one vote
#[derive(Debug, Clone)]
pub struct VoteContext<'a> {
    pub poll_message_id: &'a str,
    pub poll_creator: &'a str,
    pub voter: &'a str,
    pub secret: &'a [u8],
}

/// Result of decrypting a vote: SHA-256 hashes of the selected option labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedVote {
    pub selected_options: Vec<[u8; 32]>,
}

/// One decrypted vote recorded on a poll-creation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollVoteRecord {
    pub vote_key: MessageKey,
    pub voter: String,
    #[serde(with = "crate::webhook::base64_hashes")]
    pub selected_options: Vec<[u8; 32]>,
    pub sender_timestamp_ms: u64,
}

/// Record `record` in `votes`, replacing an earlier record with the same vote key.
pub fn merge_vote(votes: &mut Vec<PollVoteRecord>, record: PollVoteRecord) {
    match votes
        .iter_mut()
        .find(|v| v.vote_key.id == record.vote_key.id)
    {
        Some(existing) => *existing = record,
        None => votes.push(record),
    }
}

/// Fields merged into an existing stored message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_updates: Option<Vec<PollVoteRecord>>,
}

/// `messages.update` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub key: MessageKey,
    pub update: MessagePatch,
}

/// Conversation metadata (`chats.upsert`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
}

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

/// Why the transport closed a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    LoggedOut,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    BadSession,
    RestartRequired,
    Other(u16),
}

impl DisconnectReason {
    /// Status code carried on the wire
    pub fn status_code(&self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::ConnectionClosed => 428,
            Self::ConnectionLost => 408,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::RestartRequired => 515,
            Self::Other(code) => *code,
        }
    }

    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            428 => Self::ConnectionClosed,
            408 => Self::ConnectionLost,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }
}

/// `connection.update` payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionState>,
    /// Pairing code / QR payload the operator must enter on the primary device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    #[serde(default)]
    pub is_new_login: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_disconnect: Option<DisconnectReason>,
}

impl ConnectionUpdate {
    pub fn open() -> Self {
        Self {
            connection: Some(ConnectionState::Open),
            ..Default::default()
        }
    }

    pub fn close(reason: DisconnectReason) -> Self {
        Self {
            connection: Some(ConnectionState::Close),
            last_disconnect: Some(reason),
            ..Default::default()
        }
    }

    pub fn pairing(code: impl Into<String>) -> Self {
        Self {
            qr: Some(code.into()),
            ..Default::default()
        }
    }
}

/// How an upsert batch reached the instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    /// Live message
    Notify,
    /// History sync
    Append,
}

/// Typed event stream emitted by one transport session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionUpdate(ConnectionUpdate),
    CredsUpdate(Credentials),
    MessagesUpsert {
        messages: Vec<WireMessage>,
        kind: UpsertKind,
    },
    MessagesUpdate(Vec<MessageUpdate>),
    ChatsUpsert(Vec<Chat>),
    /// Any other native event, forwarded verbatim
    Other {
        name: String,
        data: serde_json::Value,
    },
}

impl TransportEvent {
    /// Event type tag used on the webhook
    pub fn event_type(&self) -> &str {
        match self {
            Self::ConnectionUpdate(_) => "connection.update",
            Self::CredsUpdate(_) => "creds.update",
            Self::MessagesUpsert { .. } => "messages.upsert",
            Self::MessagesUpdate(_) => "messages.update",
            Self::ChatsUpsert(_) => "chats.upsert",
            Self::Other { name, .. } => name,
        }
    }

    /// JSON payload forwarded to the callback target
    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            Self::ConnectionUpdate(update) => serde_json::to_value(update),
            Self::CredsUpdate(creds) => serde_json::to_value(creds),
            Self::MessagesUpsert { messages, kind } => Ok(serde_json::json!({
                "messages": messages,
                "type": kind,
            })),
            Self::MessagesUpdate(updates) => serde_json::to_value(updates),
            Self::ChatsUpsert(chats) => serde_json::to_value(chats),
            Self::Other { data, .. } => Ok(data.clone()),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// Content handed to `Transport::send`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutgoingContent {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quoted_id: Option<String>,
        /// Mention the recipient without visible text
        #[serde(default)]
        mention: bool,
    },
    /// Binary media; the kind is derived from `mimetype`
    Media {
        mimetype: String,
        #[serde(with = "crate::webhook::base64_bytes")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quoted_id: Option<String>,
        #[serde(default)]
        mention: bool,
    },
    Poll {
        name: String,
        options: Vec<String>,
        #[serde(default)]
        selectable_count: u32,
    },
    Reaction {
        target: MessageKey,
        emoji: String,
    },
    Delete {
        target: MessageKey,
    },
}

/// Key categories -> key id -> key material
pub type KeyMap = HashMap<String, HashMap<String, Option<Vec<u8>>>>;

/// Key material interface handed to the transport (Credential Store)
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Look up key ids within one category; missing ids map to `None`
    async fn get_keys(&self, category: &str, ids: &[String]) -> HashMap<String, Option<Vec<u8>>>;

    /// Merge key material; a `None` value removes that key id
    async fn set_keys(&self, data: KeyMap);
}

/// Message lookup the transport uses to answer re-send requests
#[async_trait]
pub trait MessageLookup: Send + Sync {
    async fn get_message(&self, key: &MessageKey) -> Option<MessageContent>;
}

/// Everything a transport session needs at open time
#[derive(Clone)]
pub struct SessionParams {
    pub instance: InstanceId,
    pub credentials: Credentials,
    pub keys: Arc<dyn KeyStore>,
    pub messages: Arc<dyn MessageLookup>,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Connection closed")]
    Closed,

    #[error("Not supported: {0}")]
    NotSupported(String),
}

/// One live protocol session
#[async_trait]
pub trait Transport: Send + Sync {
    /// This session's own identity, once registered
    fn own_id(&self) -> Option<String>;

    /// Identity that authored the message addressed by `key`
    fn key_author(&self, key: &MessageKey) -> String {
        if key.from_me {
            return self.own_id().unwrap_or_default();
        }
        key.participant
            .clone()
            .unwrap_or_else(|| key.conversation.clone())
    }

    /// Ask the network for a pairing code bound to `phone`
    async fn request_pairing_code(&self, phone: &str) -> TransportResult<String>;

    /// Send content to a conversation, returning the message as sent
    async fn send(&self, conversation: &str, content: OutgoingContent)
        -> TransportResult<WireMessage>;

    /// Fetch a message from the network by key
    async fn fetch_message(&self, key: &MessageKey) -> TransportResult<Option<WireMessage>>;

    /// Decrypt one vote fragment
    fn decrypt_poll_vote(
        &self,
        vote: &EncryptedVote,
        ctx: &VoteContext<'_>,
    ) -> TransportResult<DecryptedVote>;

    /// Close the connection without invalidating credentials
    async fn close(&self);

    /// Log out, invalidating credentials on the network
    async fn logout(&self) -> TransportResult<()>;
}

/// Opens transport sessions
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, params: SessionParams)
        -> TransportResult<(Arc<dyn Transport>, EventStream)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_status_codes() {
        for reason in [
            DisconnectReason::LoggedOut,
            DisconnectReason::ConnectionClosed,
            DisconnectReason::ConnectionLost,
            DisconnectReason::ConnectionReplaced,
            DisconnectReason::BadSession,
            DisconnectReason::RestartRequired,
        ] {
            assert_eq!(DisconnectReason::from_status_code(reason.status_code()), reason);
        }
        assert_eq!(
            DisconnectReason::from_status_code(499),
            DisconnectReason::Other(499)
        );
    }

    #[test]
    fn test_event_type_tags() {
        let event = TransportEvent::ConnectionUpdate(ConnectionUpdate::open());
        assert_eq!(event.event_type(), "connection.update");

        let event = TransportEvent::Other {
            name: "presence.update".to_string(),
            data: serde_json::json!({"id": "x"}),
        };
        assert_eq!(event.event_type(), "presence.update");
        assert_eq!(event.payload(), serde_json::json!({"id": "x"}));
    }

    #[test]
    fn test_media_kind_from_mimetype() {
        assert_eq!(MediaKind::from_mimetype("image/png"), MediaKind::Image);
        assert_eq!(MediaKind::from_mimetype("video/mp4"), MediaKind::Video);
        assert_eq!(MediaKind::from_mimetype("Audio/ogg; codecs=opus"), MediaKind::Audio);
        assert_eq!(MediaKind::from_mimetype("application/pdf"), MediaKind::Document);
        assert_eq!(MediaKind::from_mimetype(""), MediaKind::Document);
    }

    #[test]
    fn test_message_payload_encodes_secret_as_base64() {
        let message = WireMessage {
            key: MessageKey::new("chat-1", "m1"),
            timestamp: 1,
            push_name: None,
            content: MessageContent::Text {
                text: "hi".to_string(),
                quoted: None,
                mentions: Vec::new(),
            },
            message_secret: Some(vec![0xff, 0x00, 0x10]),
            poll_updates: vec![],
            status: None,
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["messageSecret"], "/wAQ");
        assert_eq!(json["key"]["conversation"], "chat-1");
        assert_eq!(json["content"]["type"], "text");
    }

    #[test]
    fn test_key_author_rule() {
        struct Fixed;

        #[async_trait]
        impl Transport for Fixed {
            fn own_id(&self) -> Option<String> {
                Some("me@net".to_string())
            }
            async fn request_pairing_code(&self, _phone: &str) -> TransportResult<String> {
                unreachable!()
            }
            async fn send(
                &self,
                _conversation: &str,
                _content: OutgoingContent,
            ) -> TransportResult<WireMessage> {
                unreachable!()
            }
            async fn fetch_message(
                &self,
                _key: &MessageKey,
            ) -> TransportResult<Option<WireMessage>> {
                unreachable!()
            }
            fn decrypt_poll_vote(
                &self,
                _vote: &EncryptedVote,
                _ctx: &VoteContext<'_>,
            ) -> TransportResult<DecryptedVote> {
                unreachable!()
            }
            async fn close(&self) {}
            async fn logout(&self) -> TransportResult<()> {
                Ok(())
            }
        }

        let mut key = MessageKey::new("group@g", "m1");
        assert_eq!(Fixed.key_author(&key), "group@g");

        key.participant = Some("alice@net".to_string());
        assert_eq!(Fixed.key_author(&key), "alice@net");

        key.from_me = true;
        assert_eq!(Fixed.key_author(&key), "me@net");
    }
}
