// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered user as seen by other clients. The `is_online` flag is
/// derived from the session registry (≥1 live connection), never taken
/// from client state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UserIdentity {
    pub id: String,
    pub username: String,
    pub avatar: String,
    #[serde(default)]
    pub is_online: bool,
}

/// File metadata produced by the attachment store. Opaque to the
/// distribution core; it travels inside messages untouched.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AttachmentDescriptor {
    pub url: String,
    #[serde(rename = "type")]
    pub mime: String,
    pub name: String,
}

/// An outgoing message as submitted by a client. `time` is the client's
/// display timestamp; the server assigns its own `created_at` on append.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MessagePayload {
    pub text: Option<String>,
    pub attachment: Option<AttachmentDescriptor>,
    pub channel: String,
    pub sender: String,
    pub time: String,
}

impl MessagePayload {
    /// A message must carry non-empty text or an attachment.
    pub fn has_content(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty()) || self.attachment.is_some()
    }
}

/// A message after persistence: the stored payload plus the
/// server-assigned per-channel insertion order and timestamp.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub text: Option<String>,
    pub attachment: Option<AttachmentDescriptor>,
    pub channel: String,
    pub sender: String,
    pub time: String,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn from_payload(id: i64, payload: MessagePayload, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            text: payload.text,
            attachment: payload.attachment,
            channel: payload.channel,
            sender: payload.sender,
            time: payload.time,
            created_at,
        }
    }
}

/// An event sent from a client to the server.
/// Deserialized from incoming JSON text.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Identify { user_id: String },
    JoinChannel { channel: String },
    SendMessage { message: MessagePayload },
    Typing { channel: String },
    StopTyping { channel: String },
}

/// An event sent from the server to a client.
/// Serialized into JSON text for sending.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    HistoryLoaded { messages: Vec<StoredMessage> },
    MessageReceived { message: StoredMessage },
    TypingStatus { channel: String, typing: bool },
    OnlineUsersUpdated { users: Vec<UserIdentity> },
    SendFailed { reason: String },
    Error { code: String, message: String },
}
