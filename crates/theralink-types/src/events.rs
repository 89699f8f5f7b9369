use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::MessageResponse;
use crate::models::UserId;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Server confirms successful identification
    Ready { user_id: UserId },

    /// Acknowledges a subscribe command with the conversations actually joined
    Subscribed { conversation_ids: Vec<Uuid> },

    /// A message was persisted
    NewMessage(MessageResponse),

    /// A message was hard-deleted
    MessageDeleted {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    /// Delivery/read flags of a message moved forward
    MessageStatus {
        conversation_id: Uuid,
        message_id: Uuid,
        delivered: bool,
        read: bool,
    },

    ReactionAdd {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: UserId,
        emoji: String,
    },

    ReactionRemove {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: UserId,
        emoji: String,
    },

    TypingStart {
        conversation_id: Uuid,
        user_id: UserId,
    },

    TypingStop {
        conversation_id: Uuid,
        user_id: UserId,
    },

    /// Sent only to the former participants
    ConversationDeleted { conversation_id: Uuid },

    /// Full snapshot of online users as of `revision`
    PresenceSync { revision: u64, users: Vec<UserId> },

    /// A user's first tracked connection came up
    PresenceJoin { revision: u64, user_id: UserId },

    /// A user's last tracked connection went away
    PresenceLeave { revision: u64, user_id: UserId },
}

impl GatewayEvent {
    /// Returns the conversation this event is scoped to. Events that return
    /// `None` are delivered to every connected client.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::NewMessage(msg) => Some(msg.message.conversation_id),
            Self::MessageDeleted { conversation_id, .. }
            | Self::MessageStatus { conversation_id, .. }
            | Self::ReactionAdd { conversation_id, .. }
            | Self::ReactionRemove { conversation_id, .. }
            | Self::TypingStart { conversation_id, .. }
            | Self::TypingStop { conversation_id, .. }
            | Self::ConversationDeleted { conversation_id } => Some(*conversation_id),
            Self::Ready { .. }
            | Self::Subscribed { .. }
            | Self::PresenceSync { .. }
            | Self::PresenceJoin { .. }
            | Self::PresenceLeave { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Announce this connection as present once subscribed
    Track { at: DateTime<Utc> },

    /// Replace the set of conversations this connection receives events for
    Subscribe { conversation_ids: Vec<Uuid> },

    TypingStart { conversation_id: Uuid },

    TypingStop { conversation_id: Uuid },

    /// The client received the `new_message` broadcast
    MarkDelivered { message_id: Uuid },

    /// The client rendered the message in the focused conversation
    MarkRead { message_id: Uuid },
}
