use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Attachment, Channel, Content, Identity, MessageId, MessageKind, UserId},
    error::ApiError,
};

/// Events a connected client may send, framed as `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    Message {
        body: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        attachment: Option<Attachment>,
    },
    PrivateMessage {
        #[serde(default)]
        target_identity: Option<UserId>,
        body: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        attachment: Option<Attachment>,
    },
    GetGroupMessages {},
    GetPrivateMessages {
        other_identity: UserId,
    },
    GetPrivateChatsList {},
    RecallMessage {
        message_id: MessageId,
    },
    Typing {
        is_typing: bool,
        #[serde(default)]
        target_identity: Option<UserId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub sender_identity: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_identity: Option<Identity>,
    pub body: String,
    #[serde(flatten)]
    pub content: Content,
    pub created_at: DateTime<Utc>,
    pub is_private: bool,
}

impl MessagePayload {
    pub fn channel(&self) -> Channel {
        match &self.recipient_identity {
            Some(recipient) => Channel::Direct(recipient.id),
            None => Channel::Group,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub identity: UserId,
    pub display_name: String,
    pub connections: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub identity: UserId,
    pub display_name: String,
}

impl From<&Identity> for PresenceNotice {
    fn from(identity: &Identity) -> Self {
        Self {
            identity: identity.id,
            display_name: identity.display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub other_identity: UserId,
    pub other_display_name: String,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    Message(MessagePayload),
    PrivateMessage(MessagePayload),
    MessageHistory(Vec<MessagePayload>),
    PrivateMessageHistory(Vec<MessagePayload>),
    PrivateChatsList(Vec<ThreadSummary>),
    UsersList(Vec<RosterEntry>),
    UserJoined(PresenceNotice),
    UserLeft(PresenceNotice),
    MessageRecalled {
        message_id: MessageId,
    },
    RecallError {
        reason: ApiError,
    },
    Typing {
        identity: UserId,
        display_name: String,
        is_typing: bool,
    },
    Error(ApiError),
}

impl ServerEvent {
    /// Wraps a delivered message in the event matching its channel.
    pub fn delivered(message: MessagePayload) -> Self {
        if message.is_private {
            ServerEvent::PrivateMessage(message)
        } else {
            ServerEvent::Message(message)
        }
    }
}
