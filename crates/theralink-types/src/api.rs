use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    Attachment, Conversation, Message, MessageKind, ProfileSummary, ReactionGroup, UserId,
};

// -- JWT Claims --

/// Claims of a session token issued by the external identity provider.
/// Shared by the REST middleware and the WebSocket identify handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    #[serde(default)]
    pub email: Option<String>,
    /// Role granted by the identity provider; `moderator` unlocks moderation routes.
    #[serde(default)]
    pub role: Option<String>,
    pub exp: usize,
}

impl Claims {
    pub const MODERATOR_ROLE: &'static str = "moderator";

    pub fn is_moderator(&self) -> bool {
        self.role.as_deref() == Some(Self::MODERATOR_ROLE)
    }
}

// -- Profiles --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpsertProfileRequest {
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

// -- Conversations --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    /// Everyone besides the caller; the caller is always a participant.
    pub participant_ids: Vec<UserId>,
}

/// A conversation annotated for list display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub other_participant: Option<ProfileSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationReadResponse {
    pub conversation_id: Uuid,
    pub message_ids: Vec<Uuid>,
}

// -- Messages --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub kind: MessageKind,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    /// Opaque id chosen by the sending client to match its optimistic entry
    /// against the broadcast of the persisted message.
    #[serde(default)]
    pub client_nonce: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    #[serde(flatten)]
    pub message: Message,
    pub sender: ProfileSummary,
    #[serde(default)]
    pub reactions: Vec<ReactionGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatusResponse {
    pub message_id: Uuid,
    pub delivered: bool,
    pub read: bool,
    pub changed: bool,
}

// -- Reactions --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionResponse {
    pub message_id: Uuid,
    pub emoji: String,
    pub changed: bool,
}

// -- Errors --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Query for `GET /conversations/{id}/messages`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MessageQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    /// Cursor: `created_at` of the oldest message already held. Only older
    /// messages are returned.
    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
    /// Id of that message. Breaks ties between messages sharing `before`.
    #[serde(default)]
    pub before_id: Option<Uuid>,
}

impl MessageQuery {
    pub fn page(limit: Option<u32>, cursor: Option<PageCursor>) -> Self {
        Self {
            limit,
            before: cursor.map(|c| c.created_at),
            before_id: cursor.and_then(|c| c.message_id),
        }
    }

    pub fn cursor(&self) -> Option<PageCursor> {
        self.before.map(|created_at| PageCursor {
            created_at,
            message_id: self.before_id,
        })
    }
}

/// Position of the oldest message held by a client. A page starting from it
/// holds only messages strictly older in `(created_at, insertion order)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    /// Without an id, every message sharing `created_at` is excluded.
    pub message_id: Option<Uuid>,
}

impl PageCursor {
    pub fn at(message: &Message) -> Self {
        Self {
            created_at: message.created_at,
            message_id: Some(message.id),
        }
    }
}
