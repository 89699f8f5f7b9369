use std::collections::HashSet;

use tracing::debug;
use uuid::Uuid;

use theralink_types::api::{MessageResponse, PageCursor};
use theralink_types::events::GatewayEvent;
use theralink_types::models::{DeliveryStatus, ReactionGroup, UserId};

use crate::error::{ClientError, Result};

/// An acknowledgement the session owes the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Receipt {
    Delivered(Uuid),
    Read(Uuid),
}

impl Receipt {
    pub fn message_id(&self) -> Uuid {
        match self {
            Self::Delivered(id) | Self::Read(id) => *id,
        }
    }
}

/// What toggling an emoji on a message should do for the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionAction {
    Add,
    Remove,
}

/// Client-side state of one open conversation, reconciled from history
/// pages and gateway events.
///
/// Messages stay in server order (`created_at`, then arrival), each id at
/// most once, and a message's status only ever moves forward.
pub struct ConversationView {
    conversation_id: Uuid,
    viewer: UserId,
    messages: Vec<MessageResponse>,
    focused: bool,
    deleted: bool,
    sent_receipts: HashSet<Receipt>,
}

impl ConversationView {
    pub fn new(conversation_id: Uuid, viewer: UserId) -> Self {
        Self {
            conversation_id,
            viewer,
            messages: Vec::new(),
            focused: false,
            deleted: false,
            sent_receipts: HashSet::new(),
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn messages(&self) -> &[MessageResponse] {
        &self.messages
    }

    pub fn get(&self, message_id: Uuid) -> Option<&MessageResponse> {
        self.messages.iter().find(|m| m.message.id == message_id)
    }

    pub fn contains(&self, message_id: Uuid) -> bool {
        self.get(message_id).is_some()
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    /// The conversation was deleted while open.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// The oldest message held, the cursor for the next page.
    pub fn oldest_cursor(&self) -> Option<PageCursor> {
        self.messages.first().map(|m| PageCursor::at(&m.message))
    }

    /// Merge a page of history. Rows from the server replace the held
    /// reactions and sender, while status still only moves forward.
    pub fn load_history(&mut self, page: Vec<MessageResponse>) -> Vec<Receipt> {
        let mut receipts = Vec::new();
        for message in page {
            if message.message.conversation_id != self.conversation_id {
                continue;
            }
            let id = message.message.id;
            self.upsert(message, true);
            receipts.extend(self.receipt_for(id));
        }
        receipts
    }

    /// Merge a page refetched after a reconnect, then drop held messages
    /// that fall strictly inside the page's time range but are missing from
    /// it, having been deleted while the session was down.
    pub fn resync_history(&mut self, page: Vec<MessageResponse>) -> Vec<Receipt> {
        let page: Vec<MessageResponse> = page
            .into_iter()
            .filter(|m| m.message.conversation_id == self.conversation_id)
            .collect();
        let (Some(first), Some(last)) = (page.first(), page.last()) else {
            return vec![];
        };
        let (from, to) = (first.message.created_at, last.message.created_at);
        let fetched: HashSet<Uuid> = page.iter().map(|m| m.message.id).collect();

        let before = self.messages.len();
        self.messages.retain(|m| {
            let at = m.message.created_at;
            fetched.contains(&m.message.id) || at <= from || at >= to
        });
        if self.messages.len() != before {
            debug!(
                "Dropped {} messages deleted while offline from {}",
                before - self.messages.len(),
                self.conversation_id
            );
        }

        self.load_history(page)
    }

    /// Whether toggling `emoji` on a held message adds or removes the
    /// viewer's reaction.
    pub fn toggle_reaction(&self, message_id: Uuid, emoji: &str) -> Result<ReactionAction> {
        let message = self
            .get(message_id)
            .ok_or_else(|| ClientError::NotFound(format!("message {}", message_id)))?;
        let emoji = emoji.trim();
        let reacted = message
            .reactions
            .iter()
            .any(|g| g.emoji == emoji && g.contains(self.viewer));
        Ok(if reacted {
            ReactionAction::Remove
        } else {
            ReactionAction::Add
        })
    }

    /// Apply a gateway event. Returns the receipts it makes due.
    pub fn apply(&mut self, event: &GatewayEvent) -> Vec<Receipt> {
        if self.deleted || event.conversation_id() != Some(self.conversation_id) {
            return vec![];
        }

        match event {
            GatewayEvent::NewMessage(message) => {
                let id = message.message.id;
                self.upsert(message.clone(), false);
                return self.receipt_for(id).into_iter().collect();
            }
            GatewayEvent::MessageDeleted { message_id, .. } => {
                self.messages.retain(|m| m.message.id != *message_id);
            }
            GatewayEvent::MessageStatus {
                message_id,
                delivered,
                read,
                ..
            } => {
                if let Some(entry) = self.get_mut(*message_id) {
                    entry
                        .message
                        .advance_status(DeliveryStatus::from_flags(*delivered, *read));
                }
            }
            GatewayEvent::ReactionAdd {
                message_id,
                user_id,
                emoji,
                ..
            } => {
                if let Some(entry) = self.get_mut(*message_id) {
                    add_reaction(&mut entry.reactions, *user_id, emoji);
                }
            }
            GatewayEvent::ReactionRemove {
                message_id,
                user_id,
                emoji,
                ..
            } => {
                if let Some(entry) = self.get_mut(*message_id) {
                    remove_reaction(&mut entry.reactions, *user_id, emoji);
                }
            }
            GatewayEvent::ConversationDeleted { .. } => {
                self.deleted = true;
                self.messages.clear();
            }
            _ => {}
        }
        vec![]
    }

    /// Focus or blur the conversation. Focusing makes every incoming unread
    /// message due for a read receipt.
    pub fn set_focused(&mut self, focused: bool) -> Vec<Receipt> {
        self.focused = focused;
        if !focused {
            return vec![];
        }

        let ids: Vec<Uuid> = self.messages.iter().map(|m| m.message.id).collect();
        ids.into_iter().filter_map(|id| self.receipt_for(id)).collect()
    }

    /// Incoming messages not yet read.
    pub fn unread_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.message.sender_id != self.viewer && !m.message.read)
            .count()
    }

    fn get_mut(&mut self, message_id: Uuid) -> Option<&mut MessageResponse> {
        self.messages.iter_mut().find(|m| m.message.id == message_id)
    }

    /// Insert or merge one message. `from_history` rows carry the server's
    /// current reaction set; broadcasts only carry the message as sent.
    fn upsert(&mut self, incoming: MessageResponse, from_history: bool) {
        if let Some(existing) = self.get_mut(incoming.message.id) {
            existing.message.advance_status(incoming.message.status());
            if existing.client_nonce.is_none() {
                existing.client_nonce = incoming.client_nonce;
            }
            if from_history {
                existing.reactions = incoming.reactions;
                existing.sender = incoming.sender;
            }
            return;
        }

        let at = incoming.message.created_at;
        let pos = self
            .messages
            .partition_point(|m| m.message.created_at <= at);
        self.messages.insert(pos, incoming);
    }

    /// The receipt this message is owed by the viewer, at most once each.
    fn receipt_for(&mut self, message_id: Uuid) -> Option<Receipt> {
        let message = &self.get(message_id)?.message;
        if message.sender_id == self.viewer {
            return None;
        }

        let receipt = if self.focused {
            if message.read {
                return None;
            }
            Receipt::Read(message_id)
        } else {
            if message.delivered || message.read {
                return None;
            }
            Receipt::Delivered(message_id)
        };

        self.sent_receipts.insert(receipt).then_some(receipt)
    }
}

fn add_reaction(groups: &mut Vec<ReactionGroup>, user: UserId, emoji: &str) {
    match groups.iter_mut().find(|g| g.emoji == emoji) {
        Some(group) if group.contains(user) => {}
        Some(group) => {
            group.user_ids.push(user);
            group.count += 1;
        }
        None => groups.push(ReactionGroup {
            emoji: emoji.to_string(),
            count: 1,
            user_ids: vec![user],
        }),
    }
}

fn remove_reaction(groups: &mut Vec<ReactionGroup>, user: UserId, emoji: &str) {
    if let Some(group) = groups.iter_mut().find(|g| g.emoji == emoji) {
        if group.contains(user) {
            group.user_ids.retain(|u| *u != user);
            group.count = group.user_ids.len();
        }
    }
    groups.retain(|g| g.count > 0);
}
