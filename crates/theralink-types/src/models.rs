use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Users are issued by the external identity provider; the core only holds references.
pub type UserId = Uuid;

/// Longest accepted message body, in characters.
pub const MAX_BODY_CHARS: usize = 10_000;

/// Longest accepted reaction emoji, in bytes (covers ZWJ sequences and skin tones).
pub const MAX_EMOJI_BYTES: usize = 32;

/// Display summary mirrored from the identity/profile provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl ProfileSummary {
    pub const UNKNOWN_NAME: &'static str = "Unknown user";

    /// Placeholder for users whose profile has not been mirrored yet.
    pub fn unknown(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: Self::UNKNOWN_NAME.to_string(),
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Vec<UserId>,
    pub last_message_text: Option<String>,
    pub last_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participants.contains(&user_id)
    }

    /// First participant that is not `viewer`, by id order.
    pub fn other_participant(&self, viewer: UserId) -> Option<UserId> {
        self.participants.iter().copied().filter(|p| *p != viewer).min()
    }
}

/// Canonical key of a participant set: sorted, deduplicated ids joined by `:`.
/// Two conversations with the same participant set always share a key.
pub fn participant_key(participants: &[UserId]) -> String {
    let mut ids: Vec<UserId> = participants.to_vec();
    ids.sort();
    ids.dedup();
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }

    pub fn requires_attachment(&self) -> bool {
        !matches!(self, Self::Text)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = DraftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            other => Err(DraftError::UnknownKind(other.to_string())),
        }
    }
}

/// Reference to an object already uploaded to external storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    pub mime_type: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Why a message draft was rejected before persistence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DraftError {
    #[error("unknown message kind '{0}'")]
    UnknownKind(String),
    #[error("text messages need a non-empty body")]
    EmptyBody,
    #[error("message body exceeds {} characters", MAX_BODY_CHARS)]
    BodyTooLong,
    #[error("{0} messages need an attachment")]
    MissingAttachment(MessageKind),
    #[error("attachment url and filename must not be empty")]
    IncompleteAttachment,
    #[error("image attachments need an image/* MIME type, got '{0}'")]
    NotAnImage(String),
}

/// Message content as submitted by a sender, before the server assigns identity and time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub kind: MessageKind,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

impl MessageDraft {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            body: Some(body.into()),
            attachment: None,
        }
    }

    /// An image or file message. The kind follows the attachment's MIME type.
    pub fn with_attachment(attachment: Attachment, caption: Option<String>) -> Self {
        let kind = if attachment.is_image() {
            MessageKind::Image
        } else {
            MessageKind::File
        };
        Self {
            kind,
            body: caption,
            attachment: Some(attachment),
        }
    }

    pub fn validate(&self) -> Result<(), DraftError> {
        let body = self.body.as_deref().map(str::trim).filter(|b| !b.is_empty());

        if let Some(body) = body {
            if body.chars().count() > MAX_BODY_CHARS {
                return Err(DraftError::BodyTooLong);
            }
        }

        match self.kind {
            MessageKind::Text => {
                if body.is_none() {
                    return Err(DraftError::EmptyBody);
                }
            }
            kind => {
                let attachment = self
                    .attachment
                    .as_ref()
                    .ok_or(DraftError::MissingAttachment(kind))?;
                if attachment.url.trim().is_empty() || attachment.filename.trim().is_empty() {
                    return Err(DraftError::IncompleteAttachment);
                }
                if kind == MessageKind::Image && !attachment.is_image() {
                    return Err(DraftError::NotAnImage(attachment.mime_type.clone()));
                }
            }
        }

        Ok(())
    }

    /// Text used for the parent conversation's last-message summary.
    pub fn summary(&self) -> Option<String> {
        summarize(self.kind, self.body.as_deref(), self.attachment.as_ref())
    }
}

fn summarize(kind: MessageKind, body: Option<&str>, attachment: Option<&Attachment>) -> Option<String> {
    let body = body.map(str::trim).filter(|b| !b.is_empty()).map(str::to_string);
    let filename = attachment.map(|a| a.filename.clone());

    match kind {
        MessageKind::Text => body,
        MessageKind::Image => body.or(filename),
        MessageKind::File => filename.or(body),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
    pub read: bool,
}

impl Message {
    pub fn summary(&self) -> Option<String> {
        summarize(self.kind, self.body.as_deref(), self.attachment.as_ref())
    }

    pub fn status(&self) -> DeliveryStatus {
        DeliveryStatus::from_flags(self.delivered, self.read)
    }

    /// Raise the delivery flags to at least `status`. Flags never go back down.
    pub fn advance_status(&mut self, status: DeliveryStatus) {
        let merged = self.status().max(status);
        self.delivered = merged >= DeliveryStatus::Delivered;
        self.read = merged == DeliveryStatus::Read;
    }
}

/// Server-side delivery state of a persisted message. Ordered: `Sent < Delivered < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// Read implies delivered, so `read` alone is enough to reach `Read`.
    pub fn from_flags(delivered: bool, read: bool) -> Self {
        if read {
            Self::Read
        } else if delivered {
            Self::Delivered
        } else {
            Self::Sent
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: Uuid,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<UserId>,
}

impl ReactionGroup {
    pub fn contains(&self, user_id: UserId) -> bool {
        self.user_ids.contains(&user_id)
    }
}

/// Group raw reactions by message, then by emoji. Groups keep the order in which
/// each emoji first appears in `reactions`.
pub fn group_reactions(reactions: &[Reaction]) -> HashMap<Uuid, Vec<ReactionGroup>> {
    let mut grouped: HashMap<Uuid, Vec<ReactionGroup>> = HashMap::new();

    for r in reactions {
        let groups = grouped.entry(r.message_id).or_default();
        match groups.iter_mut().find(|g| g.emoji == r.emoji) {
            Some(group) => {
                if !group.user_ids.contains(&r.user_id) {
                    group.user_ids.push(r.user_id);
                    group.count = group.user_ids.len();
                }
            }
            None => groups.push(ReactionGroup {
                emoji: r.emoji.clone(),
                count: 1,
                user_ids: vec![r.user_id],
            }),
        }
    }

    grouped
}
