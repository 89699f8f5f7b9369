use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use theralink_types::api::{MessageResponse, SendMessageRequest};
use theralink_types::models::{DraftError, MessageDraft};

use crate::view::ConversationView;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
    Sending,
    /// The server accepted it; waiting for the broadcast to show it.
    Persisted { message_id: Uuid },
    /// Shown with a failed marker until the user resends or discards it.
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub nonce: Uuid,
    pub conversation_id: Uuid,
    pub draft: MessageDraft,
    pub queued_at: DateTime<Utc>,
    pub state: PendingState,
}

impl PendingMessage {
    pub fn request(&self) -> SendMessageRequest {
        SendMessageRequest {
            kind: self.draft.kind,
            body: self.draft.body.clone(),
            attachment: self.draft.attachment.clone(),
            client_nonce: Some(self.nonce),
        }
    }
}

/// Optimistic sends, keyed by client nonce. Nothing here is retried
/// automatically; a failed entry waits for an explicit `resend`.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Vec<PendingMessage>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and queue a draft. Invalid drafts are never queued.
    pub fn enqueue(
        &mut self,
        conversation_id: Uuid,
        draft: MessageDraft,
    ) -> Result<SendMessageRequest, DraftError> {
        draft.validate()?;
        let entry = PendingMessage {
            nonce: Uuid::new_v4(),
            conversation_id,
            draft,
            queued_at: Utc::now(),
            state: PendingState::Sending,
        };
        let req = entry.request();
        self.pending.push(entry);
        Ok(req)
    }

    /// The REST call returned the persisted message.
    pub fn persisted(&mut self, nonce: Uuid, message_id: Uuid) {
        if let Some(entry) = self.get_mut(nonce) {
            entry.state = PendingState::Persisted { message_id };
        }
    }

    pub fn fail(&mut self, nonce: Uuid, error: impl Into<String>) {
        if let Some(entry) = self.get_mut(nonce) {
            entry.state = PendingState::Failed {
                error: error.into(),
            };
        }
    }

    /// Put a failed entry back to sending. Returns the request to resubmit.
    pub fn resend(&mut self, nonce: Uuid) -> Option<SendMessageRequest> {
        let entry = self.get_mut(nonce)?;
        if !matches!(entry.state, PendingState::Failed { .. }) {
            return None;
        }
        entry.state = PendingState::Sending;
        Some(entry.request())
    }

    pub fn discard(&mut self, nonce: Uuid) -> Option<PendingMessage> {
        let pos = self.pending.iter().position(|p| p.nonce == nonce)?;
        Some(self.pending.remove(pos))
    }

    /// A `new_message` broadcast arrived. Drops the entry it stands for.
    pub fn acknowledge(&mut self, message: &MessageResponse) -> bool {
        let id = message.message.id;
        let before = self.pending.len();
        self.pending.retain(|p| {
            let by_nonce = message.client_nonce == Some(p.nonce);
            let by_id = p.state == PendingState::Persisted { message_id: id };
            !(by_nonce || by_id)
        });

        let acknowledged = self.pending.len() != before;
        if acknowledged {
            debug!("Outbox entry for message {} acknowledged", id);
        }
        acknowledged
    }

    /// Drop persisted entries whose message the view already shows, e.g.
    /// after history was refetched on reconnect.
    pub fn reconcile(&mut self, view: &ConversationView) {
        self.pending.retain(|p| match p.state {
            PendingState::Persisted { message_id } => {
                p.conversation_id != view.conversation_id() || !view.contains(message_id)
            }
            _ => true,
        });
    }

    /// Pending entries of a conversation, in the order they were queued.
    pub fn pending(&self, conversation_id: Uuid) -> impl Iterator<Item = &PendingMessage> {
        self.pending
            .iter()
            .filter(move |p| p.conversation_id == conversation_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn get_mut(&mut self, nonce: Uuid) -> Option<&mut PendingMessage> {
        self.pending.iter_mut().find(|p| p.nonce == nonce)
    }
}
