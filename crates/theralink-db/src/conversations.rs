use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use theralink_types::api::ConversationSummary;
use theralink_types::models::{Conversation, participant_key};

use crate::models::{ConversationRow, format_ts, now, parse_id};
use crate::profiles::profile_or_unknown;
use crate::{Database, Result, StoreError};

impl Database {
    /// Return the conversation whose participant set is exactly
    /// `{creator} ∪ others`, creating it if none exists.
    ///
    /// The lookup, the conversation insert and every participant insert run in
    /// one transaction behind the writer lock, and `participant_key` is UNIQUE,
    /// so a participant set never maps to two conversations. A failed
    /// participant insert rolls the whole creation back and returns `Conflict`.
    ///
    /// The boolean is `true` when a new conversation was created.
    pub fn find_or_create_conversation(
        &self,
        creator: Uuid,
        others: &[Uuid],
    ) -> Result<(Conversation, bool)> {
        let mut participants = Vec::with_capacity(others.len() + 1);
        participants.push(creator);
        participants.extend_from_slice(others);
        participants.sort();
        participants.dedup();

        if participants.len() < 2 {
            return Err(StoreError::Validation(
                "a conversation needs at least two distinct participants".into(),
            ));
        }

        let key = participant_key(&participants);

        self.with_tx(|tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM conversations WHERE participant_key = ?1",
                    [&key],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(id) = existing {
                let id = parse_id(&id)?;
                let conversation = load_conversation(tx, id)?
                    .ok_or_else(|| StoreError::NotFound(format!("conversation {}", id)))?;
                debug!("Found existing conversation {}", id);
                return Ok((conversation, false));
            }

            let id = Uuid::new_v4();
            let created_at = now();
            let ts = format_ts(&created_at);

            tx.execute(
                "INSERT INTO conversations (id, participant_key, last_message_text, last_updated_at, created_at)
                 VALUES (?1, ?2, NULL, ?3, ?3)",
                rusqlite::params![id.to_string(), key, ts],
            )
            .map_err(|e| StoreError::conflict_on_constraint(e, "conversation already exists"))?;

            for user_id in &participants {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![id.to_string(), user_id.to_string(), ts],
                )
                .map_err(|e| {
                    StoreError::Conflict(format!("adding participant {} failed: {}", user_id, e))
                })?;
            }

            info!(
                "Created conversation {} with {} participants",
                id,
                participants.len()
            );

            Ok((
                Conversation {
                    id,
                    participants: participants.clone(),
                    last_message_text: None,
                    last_updated_at: created_at,
                    created_at,
                },
                true,
            ))
        })
    }

    /// Fetch a conversation the viewer participates in. Non-participants get
    /// `NotFound`, the same as for a missing conversation.
    pub fn get_conversation(&self, id: Uuid, viewer: Uuid) -> Result<Conversation> {
        self.with_conn(|conn| {
            let conversation = load_conversation(conn, id)?
                .filter(|c| c.has_participant(viewer))
                .ok_or_else(|| StoreError::NotFound(format!("conversation {}", id)))?;
            Ok(conversation)
        })
    }

    /// Conversations of `user`, most recently updated first, each annotated
    /// with the other participant's profile.
    pub fn list_conversations_for_user(&self, user: Uuid) -> Result<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.last_message_text, c.last_updated_at, c.created_at
                 FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.last_updated_at DESC, c.rowid DESC",
            )?;
            let rows = stmt
                .query_map([user.to_string()], ConversationRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            // One pass over every participant of every conversation the user is in
            let mut stmt = conn.prepare(
                "SELECT conversation_id, user_id FROM conversation_participants
                 WHERE conversation_id IN (
                    SELECT conversation_id FROM conversation_participants WHERE user_id = ?1
                 )",
            )?;
            let mut members: HashMap<String, Vec<Uuid>> = HashMap::new();
            let pairs = stmt
                .query_map([user.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for (conversation_id, user_id) in pairs {
                members
                    .entry(conversation_id)
                    .or_default()
                    .push(parse_id(&user_id)?);
            }

            let mut summaries = Vec::with_capacity(rows.len());
            for row in rows {
                let participants = members.remove(&row.id).unwrap_or_default();
                let conversation = row.into_conversation(participants)?;
                let other_participant = conversation
                    .other_participant(user)
                    .map(|other| profile_or_unknown(conn, other))
                    .transpose()?;
                summaries.push(ConversationSummary {
                    conversation,
                    other_participant,
                });
            }

            Ok(summaries)
        })
    }

    /// Delete a conversation and, by cascade, its participants, messages and
    /// reactions. Returns the former participants.
    pub fn delete_conversation(&self, id: Uuid, requester: Uuid) -> Result<Vec<Uuid>> {
        self.with_tx(|tx| {
            let participants = query_participants(tx, id)?;
            if !participants.contains(&requester) {
                return Err(StoreError::NotFound(format!("conversation {}", id)));
            }

            tx.execute("DELETE FROM conversations WHERE id = ?1", [id.to_string()])?;
            info!("Deleted conversation {}", id);
            Ok(participants)
        })
    }

    pub fn participants(&self, id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| query_participants(conn, id))
    }

    pub fn is_participant(&self, id: Uuid, user: Uuid) -> Result<bool> {
        self.with_conn(|conn| query_is_participant(conn, id, user))
    }

    /// Keep only the conversations `user` participates in, preserving order.
    pub fn filter_participating(&self, user: Uuid, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut kept = Vec::with_capacity(ids.len());
            for id in ids {
                if query_is_participant(conn, *id, user)? && !kept.contains(id) {
                    kept.push(*id);
                }
            }
            Ok(kept)
        })
    }
}

pub(crate) fn load_conversation(conn: &Connection, id: Uuid) -> Result<Option<Conversation>> {
    let row = conn
        .query_row(
            "SELECT id, last_message_text, last_updated_at, created_at
             FROM conversations WHERE id = ?1",
            [id.to_string()],
            ConversationRow::from_row,
        )
        .optional()?;

    match row {
        Some(row) => {
            let participants = query_participants(conn, id)?;
            Ok(Some(row.into_conversation(participants)?))
        }
        None => Ok(None),
    }
}

pub(crate) fn query_participants(conn: &Connection, id: Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1 ORDER BY user_id",
    )?;
    let ids = stmt
        .query_map([id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    ids.iter().map(|raw| parse_id(raw)).collect()
}

pub(crate) fn query_is_participant(conn: &Connection, id: Uuid, user: Uuid) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
            [id.to_string(), user.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// `NotFound` unless `user` participates in conversation `id`.
pub(crate) fn require_participant(conn: &Connection, id: Uuid, user: Uuid) -> Result<()> {
    if query_is_participant(conn, id, user)? {
        Ok(())
    } else {
        Err(StoreError::NotFound(format!("conversation {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use theralink_types::models::MessageDraft;

    #[test]
    fn find_or_create_is_deterministic() {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let (first, created) = db.find_or_create_conversation(a, &[b]).unwrap();
        assert!(created);
        let (second, created_again) = db.find_or_create_conversation(a, &[b]).unwrap();
        assert!(!created_again);
        assert_eq!(first.id, second.id);

        // Participant order does not matter
        let (reversed, _) = db.find_or_create_conversation(b, &[a]).unwrap();
        assert_eq!(first.id, reversed.id);

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(first.participants, expected);
    }

    #[test]
    fn concurrent_creation_yields_one_conversation() {
        let db = std::sync::Arc::new(Database::open_in_memory().unwrap());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                std::thread::spawn(move || {
                    let (creator, other) = if i % 2 == 0 { (a, b) } else { (b, a) };
                    db.find_or_create_conversation(creator, &[other]).unwrap().0.id
                })
            })
            .collect();

        let ids: Vec<Uuid> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(db.list_conversations_for_user(a).unwrap().len(), 1);
    }

    #[test]
    fn self_conversation_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let err = db.find_or_create_conversation(a, &[a]).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn list_orders_by_last_update_and_annotates_other_participant() {
        let db = Database::open_in_memory().unwrap();
        let me = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        db.upsert_profile(b, "Bea", None).unwrap();

        let (with_b, _) = db.find_or_create_conversation(me, &[b]).unwrap();
        let (with_c, _) = db.find_or_create_conversation(me, &[c]).unwrap();

        // Timestamps are millisecond precision
        std::thread::sleep(std::time::Duration::from_millis(5));
        db.append_message(with_b.id, me, &MessageDraft::text("latest"))
            .unwrap();

        let list = db.list_conversations_for_user(me).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].conversation.id, with_b.id);
        assert_eq!(list[0].conversation.last_message_text.as_deref(), Some("latest"));
        assert_eq!(list[0].other_participant.as_ref().unwrap().display_name, "Bea");
        assert_eq!(list[1].conversation.id, with_c.id);
        assert_eq!(
            list[1].other_participant.as_ref().unwrap().display_name,
            theralink_types::models::ProfileSummary::UNKNOWN_NAME
        );
    }

    #[test]
    fn delete_cascades_to_messages() {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (conv, _) = db.find_or_create_conversation(a, &[b]).unwrap();
        let msg = db.append_message(conv.id, a, &MessageDraft::text("bye")).unwrap();

        let outsider = Uuid::new_v4();
        assert!(matches!(
            db.delete_conversation(conv.id, outsider),
            Err(StoreError::NotFound(_))
        ));

        let former = db.delete_conversation(conv.id, b).unwrap();
        assert_eq!(former.len(), 2);
        assert!(db.get_message(msg.id).unwrap().is_none());
        assert!(db.list_conversations_for_user(a).unwrap().is_empty());
    }

    #[test]
    fn filter_participating_drops_foreign_conversations() {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let (ab, _) = db.find_or_create_conversation(a, &[b]).unwrap();
        let (bc, _) = db.find_or_create_conversation(b, &[c]).unwrap();

        let kept = db.filter_participating(a, &[ab.id, bc.id, ab.id]).unwrap();
        assert_eq!(kept, vec![ab.id]);
    }
}
