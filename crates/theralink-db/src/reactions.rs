use rusqlite::Connection;
use uuid::Uuid;

use theralink_types::models::{MAX_EMOJI_BYTES, Reaction};

use crate::messages::recipient_message;
use crate::models::{ReactionRow, format_ts, now};
use crate::{Database, ReactionChange, Result, StoreError};

fn validate_emoji(emoji: &str) -> Result<&str> {
    let emoji = emoji.trim();
    if emoji.is_empty() {
        return Err(StoreError::Validation("emoji must not be empty".into()));
    }
    if emoji.len() > MAX_EMOJI_BYTES {
        return Err(StoreError::Validation(format!(
            "emoji exceeds {} bytes",
            MAX_EMOJI_BYTES
        )));
    }
    Ok(emoji)
}

impl Database {
    /// Record `(user, emoji)` on a message. A pair that already exists is left
    /// alone and reported as unchanged.
    pub fn add_reaction(&self, message_id: Uuid, user: Uuid, emoji: &str) -> Result<ReactionChange> {
        let emoji = validate_emoji(emoji)?;

        self.with_tx(|tx| {
            let message = recipient_message(tx, message_id, user)?;
            let changed = tx.execute(
                "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    message_id.to_string(),
                    user.to_string(),
                    emoji,
                    format_ts(&now())
                ],
            )? > 0;

            Ok(ReactionChange {
                message_id,
                conversation_id: message.conversation_id,
                changed,
            })
        })
    }

    /// Remove `(user, emoji)` from a message if present.
    pub fn remove_reaction(
        &self,
        message_id: Uuid,
        user: Uuid,
        emoji: &str,
    ) -> Result<ReactionChange> {
        let emoji = validate_emoji(emoji)?;

        self.with_tx(|tx| {
            let message = recipient_message(tx, message_id, user)?;
            let changed = tx.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                rusqlite::params![message_id.to_string(), user.to_string(), emoji],
            )? > 0;

            Ok(ReactionChange {
                message_id,
                conversation_id: message.conversation_id,
                changed,
            })
        })
    }

    /// Batch-fetch reactions for a set of message IDs, oldest first.
    pub fn reactions_for_messages(&self, message_ids: &[Uuid]) -> Result<Vec<Reaction>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| query_reactions(conn, message_ids))
    }
}

fn query_reactions(conn: &Connection, message_ids: &[Uuid]) -> Result<Vec<Reaction>> {
    let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT message_id, user_id, emoji, created_at FROM reactions
         WHERE message_id IN ({})
         ORDER BY created_at ASC, rowid ASC",
        placeholders.join(", ")
    );

    let ids: Vec<String> = message_ids.iter().map(|id| id.to_string()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            Ok(ReactionRow {
                message_id: row.get(0)?,
                user_id: row.get(1)?,
                emoji: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(ReactionRow::into_reaction).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use theralink_types::models::{MessageDraft, group_reactions};

    fn setup() -> (Database, Uuid, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        let (conv, _) = db.find_or_create_conversation(x, &[y]).unwrap();
        let msg = db.append_message(conv.id, x, &MessageDraft::text("hi")).unwrap();
        (db, x, y, msg.id)
    }

    #[test]
    fn adding_twice_is_a_noop() {
        let (db, x, _, msg) = setup();

        assert!(db.add_reaction(msg, x, "👍").unwrap().changed);
        assert!(!db.add_reaction(msg, x, "👍").unwrap().changed);

        let reactions = db.reactions_for_messages(&[msg]).unwrap();
        assert_eq!(reactions.len(), 1);
    }

    #[test]
    fn removing_missing_pair_is_a_noop() {
        let (db, x, y, msg) = setup();
        db.add_reaction(msg, x, "👍").unwrap();

        assert!(!db.remove_reaction(msg, y, "👍").unwrap().changed);
        assert!(!db.remove_reaction(msg, x, "❤️").unwrap().changed);
        assert_eq!(db.reactions_for_messages(&[msg]).unwrap().len(), 1);

        assert!(db.remove_reaction(msg, x, "👍").unwrap().changed);
        assert!(db.reactions_for_messages(&[msg]).unwrap().is_empty());
    }

    #[test]
    fn aggregation_counts_per_emoji() {
        let (db, x, y, msg) = setup();
        db.add_reaction(msg, x, "❤️").unwrap();
        db.add_reaction(msg, y, "❤️").unwrap();
        db.add_reaction(msg, x, "👍").unwrap();

        let grouped = group_reactions(&db.reactions_for_messages(&[msg]).unwrap());
        let groups = &grouped[&msg];
        assert_eq!(groups.len(), 2);
        assert_eq!((groups[0].emoji.as_str(), groups[0].count), ("❤️", 2));
        assert_eq!((groups[1].emoji.as_str(), groups[1].count), ("👍", 1));
        assert!(groups[1].contains(x) && !groups[1].contains(y));
    }

    #[test]
    fn outsiders_cannot_react() {
        let (db, _, _, msg) = setup();
        assert!(matches!(
            db.add_reaction(msg, Uuid::new_v4(), "👍"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn blank_emoji_is_rejected() {
        let (db, x, _, msg) = setup();
        assert!(matches!(db.add_reaction(msg, x, " "), Err(StoreError::Validation(_))));
    }

    #[test]
    fn reactions_go_with_their_message() {
        let (db, x, _, msg) = setup();
        db.add_reaction(msg, x, "👍").unwrap();
        db.delete_message(msg, x).unwrap();
        assert!(db.reactions_for_messages(&[msg]).unwrap().is_empty());
    }
}
