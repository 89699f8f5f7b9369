//! Database row types. These map directly to SQLite rows and are converted
//! into theralink-types models at the edge of each query.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::Row;
use uuid::Uuid;

use theralink_types::models::{
    Attachment, Conversation, DeliveryStatus, Message, MessageKind, ProfileSummary, Reaction,
};

use crate::{Result, StoreError};

const FALLBACK_MIME: &str = "application/octet-stream";

pub(crate) const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.sender_id, m.kind, m.body, \
     m.attachment_url, m.attachment_filename, m.attachment_mime, m.created_at, m.delivered, m.read";

// -- Timestamps and ids --

/// Current time at the millisecond precision stored in the database.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Fixed-width RFC 3339 in UTC, so text order equals time order.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

pub(crate) fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("id '{}': {}", raw, e)))
}

// -- Rows --

pub struct ConversationRow {
    pub id: String,
    pub last_message_text: Option<String>,
    pub last_updated_at: String,
    pub created_at: String,
}

impl ConversationRow {
    /// Expects `id, last_message_text, last_updated_at, created_at` in that order.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            last_message_text: row.get(1)?,
            last_updated_at: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    pub fn into_conversation(self, mut participants: Vec<Uuid>) -> Result<Conversation> {
        participants.sort();
        Ok(Conversation {
            id: parse_id(&self.id)?,
            participants,
            last_message_text: self.last_message_text,
            last_updated_at: parse_ts(&self.last_updated_at)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub kind: String,
    pub body: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_filename: Option<String>,
    pub attachment_mime: Option<String>,
    pub created_at: String,
    pub delivered: bool,
    pub read: bool,
}

impl MessageRow {
    /// Expects the `MESSAGE_COLUMNS` layout starting at column 0.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            kind: row.get(3)?,
            body: row.get(4)?,
            attachment_url: row.get(5)?,
            attachment_filename: row.get(6)?,
            attachment_mime: row.get(7)?,
            created_at: row.get(8)?,
            delivered: row.get(9)?,
            read: row.get(10)?,
        })
    }

    pub fn into_message(self) -> Result<Message> {
        let kind: MessageKind = self
            .kind
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("message '{}': {}", self.id, e)))?;

        let attachment = match (self.attachment_url, self.attachment_filename) {
            (Some(url), Some(filename)) => Some(Attachment {
                url,
                filename,
                mime_type: self.attachment_mime.unwrap_or_else(|| FALLBACK_MIME.to_string()),
            }),
            _ => None,
        };

        Ok(Message {
            id: parse_id(&self.id)?,
            conversation_id: parse_id(&self.conversation_id)?,
            sender_id: parse_id(&self.sender_id)?,
            kind,
            body: self.body,
            attachment,
            created_at: parse_ts(&self.created_at)?,
            // read implies delivered even for rows written before that rule held
            delivered: self.delivered || self.read,
            read: self.read,
        })
    }
}

pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

impl ReactionRow {
    pub fn into_reaction(self) -> Result<Reaction> {
        Ok(Reaction {
            message_id: parse_id(&self.message_id)?,
            user_id: parse_id(&self.user_id)?,
            emoji: self.emoji,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub struct ProfileRow {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl ProfileRow {
    pub fn into_profile(self) -> Result<ProfileSummary> {
        Ok(ProfileSummary {
            user_id: parse_id(&self.user_id)?,
            display_name: self.display_name,
            avatar_url: self.avatar_url,
        })
    }
}

// -- Operation results --

/// Outcome of a delivered/read transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub delivered: bool,
    pub read: bool,
    /// False when the flags were already at (or past) the requested state.
    pub changed: bool,
}

impl StatusChange {
    pub fn status(&self) -> DeliveryStatus {
        DeliveryStatus::from_flags(self.delivered, self.read)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionChange {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    /// The conversation's last-message summary after repair.
    pub last_message_text: Option<String>,
}
