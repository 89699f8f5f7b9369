use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use theralink_types::events::GatewayEvent;
use theralink_types::models::UserId;

/// A typing user disappears this long after their last `typing_start`
/// unless a `typing_stop` comes first.
pub const TYPING_EXPIRY: Duration = Duration::from_secs(6);

/// Who is typing where, from the viewer's point of view.
pub struct TypingIndicator {
    viewer: UserId,
    expiry: Duration,
    typing: HashMap<Uuid, HashMap<UserId, Instant>>,
}

impl TypingIndicator {
    pub fn new(viewer: UserId) -> Self {
        Self::with_expiry(viewer, TYPING_EXPIRY)
    }

    pub fn with_expiry(viewer: UserId, expiry: Duration) -> Self {
        Self {
            viewer,
            expiry,
            typing: HashMap::new(),
        }
    }

    pub fn apply(&mut self, event: &GatewayEvent, now: Instant) {
        match event {
            GatewayEvent::TypingStart {
                conversation_id,
                user_id,
            } => self.start(*conversation_id, *user_id, now),
            GatewayEvent::TypingStop {
                conversation_id,
                user_id,
            } => self.stop(*conversation_id, *user_id),
            GatewayEvent::NewMessage(message) => {
                self.stop(message.message.conversation_id, message.message.sender_id)
            }
            GatewayEvent::ConversationDeleted { conversation_id } => {
                self.typing.remove(conversation_id);
            }
            _ => {}
        }
    }

    pub fn start(&mut self, conversation_id: Uuid, user: UserId, now: Instant) {
        if user == self.viewer {
            return;
        }
        self.typing
            .entry(conversation_id)
            .or_default()
            .insert(user, now);
    }

    pub fn stop(&mut self, conversation_id: Uuid, user: UserId) {
        if let Some(users) = self.typing.get_mut(&conversation_id) {
            users.remove(&user);
            if users.is_empty() {
                self.typing.remove(&conversation_id);
            }
        }
    }

    /// Users currently typing in a conversation, sorted by id.
    pub fn typing_users(&self, conversation_id: Uuid, now: Instant) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .typing
            .get(&conversation_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, since)| now.saturating_duration_since(**since) < self.expiry)
                    .map(|(user, _)| *user)
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Forget expired entries.
    pub fn prune(&mut self, now: Instant) {
        let expiry = self.expiry;
        self.typing.retain(|_, users| {
            users.retain(|_, since| now.saturating_duration_since(*since) < expiry);
            !users.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_expires_without_stop() {
        let (me, them, conv) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut typing = TypingIndicator::new(me);
        let t0 = Instant::now();

        typing.apply(
            &GatewayEvent::TypingStart {
                conversation_id: conv,
                user_id: them,
            },
            t0,
        );
        assert_eq!(typing.typing_users(conv, t0 + Duration::from_secs(5)), vec![them]);
        assert!(typing.typing_users(conv, t0 + TYPING_EXPIRY).is_empty());

        typing.prune(t0 + TYPING_EXPIRY);
        assert!(typing.typing.is_empty());
    }

    #[test]
    fn stop_and_message_clear_typing() {
        let (me, them, conv) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut typing = TypingIndicator::new(me);
        let now = Instant::now();

        typing.start(conv, them, now);
        typing.stop(conv, them);
        assert!(typing.typing_users(conv, now).is_empty());

        typing.start(conv, them, now);
        let sent = crate::view::tests::message(conv, them, "done", 0);
        typing.apply(&GatewayEvent::NewMessage(sent), now);
        assert!(typing.typing_users(conv, now).is_empty());
    }

    #[test]
    fn own_typing_is_not_shown() {
        let (me, conv) = (Uuid::new_v4(), Uuid::new_v4());
        let mut typing = TypingIndicator::new(me);
        let now = Instant::now();
        typing.start(conv, me, now);
        assert!(typing.typing_users(conv, now).is_empty());
    }
}
