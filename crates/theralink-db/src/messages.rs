use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use theralink_types::api::PageCursor;
use theralink_types::models::{Message, MessageDraft, ProfileSummary};

use crate::conversations::require_participant;
use crate::models::{MESSAGE_COLUMNS, MessageRow, StatusChange, format_ts, now, parse_id, parse_ts};
use crate::{Database, DeleteOutcome, Result, StoreError};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

impl Database {
    /// Persist a message and refresh the parent conversation's summary in the
    /// same transaction.
    ///
    /// `created_at` never falls behind the newest message already in the
    /// conversation, so the per-conversation order is non-decreasing even when
    /// the wall clock steps backwards.
    pub fn append_message(
        &self,
        conversation_id: Uuid,
        sender: Uuid,
        draft: &MessageDraft,
    ) -> Result<Message> {
        draft.validate()?;

        self.with_tx(|tx| {
            require_participant(tx, conversation_id, sender)?;

            let latest: Option<String> = tx.query_row(
                "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
                [conversation_id.to_string()],
                |row| row.get(0),
            )?;
            let mut created_at = now();
            if let Some(latest) = latest {
                let latest = parse_ts(&latest)?;
                if latest > created_at {
                    created_at = latest;
                }
            }

            let message = Message {
                id: Uuid::new_v4(),
                conversation_id,
                sender_id: sender,
                kind: draft.kind,
                body: draft
                    .body
                    .clone()
                    .filter(|b| !b.trim().is_empty()),
                attachment: draft.attachment.clone(),
                created_at,
                delivered: false,
                read: false,
            };
            let ts = format_ts(&created_at);

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, kind, body,
                    attachment_url, attachment_filename, attachment_mime, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    message.id.to_string(),
                    conversation_id.to_string(),
                    sender.to_string(),
                    message.kind.as_str(),
                    message.body,
                    message.attachment.as_ref().map(|a| a.url.as_str()),
                    message.attachment.as_ref().map(|a| a.filename.as_str()),
                    message.attachment.as_ref().map(|a| a.mime_type.as_str()),
                    ts,
                ],
            )?;

            tx.execute(
                "UPDATE conversations SET last_message_text = ?1, last_updated_at = ?2 WHERE id = ?3",
                rusqlite::params![draft.summary(), ts, conversation_id.to_string()],
            )?;

            debug!(
                "Appended {} message {} to conversation {}",
                message.kind, message.id, conversation_id
            );
            Ok(message)
        })
    }

    /// Messages of a conversation in ascending creation order, each with its
    /// sender's profile. Returns the newest `limit` messages strictly older
    /// than `cursor` (or the newest overall when `cursor` is `None`).
    ///
    /// Messages sharing the cursor's `created_at` are ordered by insertion,
    /// so a page boundary inside a burst of same-millisecond messages loses
    /// nothing. A cursor message deleted since it was fetched keeps all of
    /// its timestamp's messages in the next page.
    pub fn list_messages(
        &self,
        conversation_id: Uuid,
        viewer: Uuid,
        limit: u32,
        cursor: Option<PageCursor>,
    ) -> Result<Vec<(Message, ProfileSummary)>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);

        self.with_conn(|conn| {
            require_participant(conn, conversation_id, viewer)?;

            let (before, before_seq) = match cursor {
                None => (None, 0),
                Some(cursor) => {
                    let seq = match cursor.message_id {
                        Some(id) => conn
                            .query_row(
                                "SELECT rowid FROM messages WHERE id = ?1 AND conversation_id = ?2",
                                [id.to_string(), conversation_id.to_string()],
                                |row| row.get::<_, i64>(0),
                            )
                            .optional()?
                            .unwrap_or(i64::MAX),
                        // rowids start at 1, so ties are all excluded
                        None => 0,
                    };
                    (Some(format_ts(&cursor.created_at)), seq)
                }
            };

            // Newest page first, then flipped back to ascending order
            let sql = format!(
                "SELECT * FROM (
                    SELECT {MESSAGE_COLUMNS}, p.display_name, p.avatar_url, m.rowid AS seq
                    FROM messages m
                    LEFT JOIN profiles p ON p.user_id = m.sender_id
                    WHERE m.conversation_id = ?1
                      AND (?2 IS NULL OR (m.created_at, m.rowid) < (?2, ?3))
                    ORDER BY m.created_at DESC, m.rowid DESC
                    LIMIT ?4
                 ) ORDER BY created_at ASC, seq ASC"
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![conversation_id.to_string(), before, before_seq, limit],
                    |row| {
                        let message = MessageRow::from_row(row)?;
                        let display_name: Option<String> = row.get(11)?;
                        let avatar_url: Option<String> = row.get(12)?;
                        Ok((message, display_name, avatar_url))
                    },
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(row, display_name, avatar_url)| {
                    let message = row.into_message()?;
                    let sender = match display_name {
                        Some(display_name) => ProfileSummary {
                            user_id: message.sender_id,
                            display_name,
                            avatar_url,
                        },
                        None => ProfileSummary::unknown(message.sender_id),
                    };
                    Ok((message, sender))
                })
                .collect()
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| load_message(conn, id))
    }

    /// Hard-delete a message on behalf of its sender.
    pub fn delete_message(&self, id: Uuid, requester: Uuid) -> Result<DeleteOutcome> {
        self.with_tx(|tx| delete_in_tx(tx, id, Some(requester)))
    }

    /// Hard-delete any message, for moderator actions.
    pub fn delete_message_as_moderator(&self, id: Uuid) -> Result<DeleteOutcome> {
        self.with_tx(|tx| delete_in_tx(tx, id, None))
    }

    /// Mark a message delivered on behalf of a recipient. Idempotent; the
    /// sender's own calls leave the flags untouched.
    pub fn mark_delivered(&self, message_id: Uuid, viewer: Uuid) -> Result<StatusChange> {
        self.with_tx(|tx| {
            let message = recipient_message(tx, message_id, viewer)?;
            if message.sender_id == viewer {
                return Ok(unchanged(&message));
            }

            let changed = tx.execute(
                "UPDATE messages SET delivered = 1 WHERE id = ?1 AND delivered = 0 AND read = 0",
                [message_id.to_string()],
            )? > 0;

            Ok(StatusChange {
                message_id,
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                delivered: true,
                read: message.read,
                changed,
            })
        })
    }

    /// Mark a message read on behalf of a recipient. Read implies delivered.
    pub fn mark_read(&self, message_id: Uuid, viewer: Uuid) -> Result<StatusChange> {
        self.with_tx(|tx| {
            let message = recipient_message(tx, message_id, viewer)?;
            if message.sender_id == viewer {
                return Ok(unchanged(&message));
            }

            let changed = tx.execute(
                "UPDATE messages SET delivered = 1, read = 1 WHERE id = ?1 AND read = 0",
                [message_id.to_string()],
            )? > 0;

            Ok(StatusChange {
                message_id,
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                delivered: true,
                read: true,
                changed,
            })
        })
    }

    /// Mark every unread message the viewer received in a conversation as
    /// read. Returns the ids that changed, oldest first.
    pub fn mark_conversation_read(&self, conversation_id: Uuid, viewer: Uuid) -> Result<Vec<Uuid>> {
        self.with_tx(|tx| {
            require_participant(tx, conversation_id, viewer)?;

            let mut stmt = tx.prepare(
                "SELECT id FROM messages
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND read = 0
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let ids = stmt
                .query_map([conversation_id.to_string(), viewer.to_string()], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            tx.execute(
                "UPDATE messages SET delivered = 1, read = 1
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND read = 0",
                [conversation_id.to_string(), viewer.to_string()],
            )?;

            ids.iter().map(|raw| parse_id(raw)).collect()
        })
    }
}

pub(crate) fn load_message(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1");
    let row = conn
        .query_row(&sql, [id.to_string()], MessageRow::from_row)
        .optional()?;
    row.map(MessageRow::into_message).transpose()
}

/// Load a message the viewer may see, as `NotFound` otherwise.
pub(crate) fn recipient_message(conn: &Connection, id: Uuid, viewer: Uuid) -> Result<Message> {
    let message =
        load_message(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("message {}", id)))?;
    require_participant(conn, message.conversation_id, viewer)
        .map_err(|_| StoreError::NotFound(format!("message {}", id)))?;
    Ok(message)
}

fn unchanged(message: &Message) -> StatusChange {
    StatusChange {
        message_id: message.id,
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        delivered: message.delivered,
        read: message.read,
        changed: false,
    }
}

fn delete_in_tx(conn: &Connection, id: Uuid, requester: Option<Uuid>) -> Result<DeleteOutcome> {
    let message =
        load_message(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("message {}", id)))?;

    if let Some(requester) = requester {
        if message.sender_id != requester {
            require_participant(conn, message.conversation_id, requester)
                .map_err(|_| StoreError::NotFound(format!("message {}", id)))?;
            return Err(StoreError::Forbidden(
                "only the sender can delete a message".into(),
            ));
        }
    }

    conn.execute("DELETE FROM messages WHERE id = ?1", [id.to_string()])?;
    let last_message_text = repair_summary(conn, message.conversation_id)?;

    info!("Deleted message {} from conversation {}", id, message.conversation_id);
    Ok(DeleteOutcome {
        message_id: id,
        conversation_id: message.conversation_id,
        last_message_text,
    })
}

/// Recompute the conversation's summary from its newest remaining message,
/// or reset it to the creation state when none remain.
fn repair_summary(conn: &Connection, conversation_id: Uuid) -> Result<Option<String>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m
         WHERE m.conversation_id = ?1
         ORDER BY m.created_at DESC, m.rowid DESC
         LIMIT 1"
    );
    let newest = conn
        .query_row(&sql, [conversation_id.to_string()], MessageRow::from_row)
        .optional()?
        .map(MessageRow::into_message)
        .transpose()?;

    match newest {
        Some(message) => {
            let summary = message.summary();
            conn.execute(
                "UPDATE conversations SET last_message_text = ?1, last_updated_at = ?2 WHERE id = ?3",
                rusqlite::params![
                    summary,
                    format_ts(&message.created_at),
                    conversation_id.to_string()
                ],
            )?;
            Ok(summary)
        }
        None => {
            conn.execute(
                "UPDATE conversations SET last_message_text = NULL, last_updated_at = created_at WHERE id = ?1",
                [conversation_id.to_string()],
            )?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use theralink_types::models::{Attachment, DeliveryStatus, MessageKind};

    fn setup() -> (Database, Uuid, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (conv, _) = db.find_or_create_conversation(a, &[b]).unwrap();
        (db, a, b, conv.id)
    }

    #[test]
    fn first_text_message_updates_summary() {
        let (db, a, b, conv) = setup();

        let msg = db.append_message(conv, a, &MessageDraft::text("Hello")).unwrap();
        assert_eq!(msg.kind, MessageKind::Text);
        assert_eq!(msg.body.as_deref(), Some("Hello"));
        assert!(!msg.delivered && !msg.read);

        let conversation = db.get_conversation(conv, b).unwrap();
        assert_eq!(conversation.last_message_text.as_deref(), Some("Hello"));
        assert_eq!(conversation.last_updated_at, msg.created_at);
        assert_eq!(conversation.participants.len(), 2);
    }

    #[test]
    fn file_message_keeps_attachment_metadata() {
        let (db, a, b, conv) = setup();
        let draft = MessageDraft::with_attachment(
            Attachment {
                url: "https://storage.example/u/report.pdf".into(),
                filename: "report.pdf".into(),
                mime_type: "application/pdf".into(),
            },
            None,
        );

        db.append_message(conv, a, &draft).unwrap();

        let listed = db.list_messages(conv, b, DEFAULT_PAGE_SIZE, None).unwrap();
        let (msg, _) = &listed[0];
        assert_eq!(msg.kind, MessageKind::File);
        let attachment = msg.attachment.as_ref().unwrap();
        assert_eq!(attachment.filename, "report.pdf");
        assert_eq!(attachment.mime_type, "application/pdf");
        assert_eq!(
            db.get_conversation(conv, a).unwrap().last_message_text.as_deref(),
            Some("report.pdf")
        );
    }

    #[test]
    fn invalid_drafts_are_rejected_before_writing() {
        let (db, a, b, conv) = setup();
        let draft = MessageDraft {
            kind: MessageKind::Image,
            body: Some("caption".into()),
            attachment: None,
        };

        assert!(matches!(
            db.append_message(conv, a, &draft),
            Err(StoreError::Validation(_))
        ));
        assert!(db.list_messages(conv, b, 10, None).unwrap().is_empty());
    }

    #[test]
    fn non_participant_cannot_append() {
        let (db, _, _, conv) = setup();
        let outsider = Uuid::new_v4();
        assert!(matches!(
            db.append_message(conv, outsider, &MessageDraft::text("hi")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn interleaved_appends_list_in_creation_order() {
        let (db, a, b, conv) = setup();
        let db = Arc::new(db);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let db = db.clone();
                let sender = if t % 2 == 0 { a } else { b };
                std::thread::spawn(move || {
                    for i in 0..10 {
                        db.append_message(conv, sender, &MessageDraft::text(format!("{t}-{i}")))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let listed = db.list_messages(conv, a, MAX_PAGE_SIZE, None).unwrap();
        assert_eq!(listed.len(), 40);
        assert!(
            listed
                .windows(2)
                .all(|w| w[0].0.created_at <= w[1].0.created_at)
        );
    }

    #[test]
    fn pagination_returns_older_page_ascending() {
        let (db, a, b, conv) = setup();
        for i in 0..5 {
            db.append_message(conv, a, &MessageDraft::text(format!("m{i}")))
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let newest = db.list_messages(conv, b, 2, None).unwrap();
        let bodies: Vec<_> = newest.iter().map(|(m, _)| m.body.clone().unwrap()).collect();
        assert_eq!(bodies, vec!["m3", "m4"]);

        let cursor = PageCursor::at(&newest[0].0);
        let older = db.list_messages(conv, b, 2, Some(cursor)).unwrap();
        let bodies: Vec<_> = older.iter().map(|(m, _)| m.body.clone().unwrap()).collect();
        assert_eq!(bodies, vec!["m1", "m2"]);
    }

    fn bodies(page: &[(Message, ProfileSummary)]) -> Vec<String> {
        page.iter().map(|(m, _)| m.body.clone().unwrap()).collect()
    }

    fn share_timestamp(db: &Database, conv: Uuid) {
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET created_at = '2025-03-01T09:00:00.000Z' WHERE conversation_id = ?1",
                [conv.to_string()],
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn paging_through_a_same_millisecond_burst_loses_nothing() {
        let (db, a, b, conv) = setup();
        for i in 0..5 {
            db.append_message(conv, a, &MessageDraft::text(format!("m{i}")))
                .unwrap();
        }
        share_timestamp(&db, conv);

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = db.list_messages(conv, b, 2, cursor).unwrap();
            if page.is_empty() {
                break;
            }
            cursor = Some(PageCursor::at(&page[0].0));
            let mut older = bodies(&page);
            older.extend(seen);
            seen = older;
        }
        assert_eq!(seen, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn deleted_cursor_keeps_its_timestamp_in_the_next_page() {
        let (db, a, b, conv) = setup();
        for i in 0..3 {
            db.append_message(conv, a, &MessageDraft::text(format!("m{i}")))
                .unwrap();
        }
        share_timestamp(&db, conv);

        let newest = db.list_messages(conv, b, 1, None).unwrap();
        assert_eq!(bodies(&newest), vec!["m2"]);
        db.delete_message(newest[0].0.id, a).unwrap();

        let older = db
            .list_messages(conv, b, 10, Some(PageCursor::at(&newest[0].0)))
            .unwrap();
        assert_eq!(bodies(&older), vec!["m0", "m1"]);

        // A bare timestamp excludes the whole millisecond
        let bare = PageCursor {
            created_at: newest[0].0.created_at,
            message_id: None,
        };
        assert!(db.list_messages(conv, b, 10, Some(bare)).unwrap().is_empty());
    }

    #[test]
    fn list_joins_sender_profile() {
        let (db, a, b, conv) = setup();
        db.upsert_profile(a, "Alex Rivera", None).unwrap();
        db.append_message(conv, a, &MessageDraft::text("hi")).unwrap();
        db.append_message(conv, b, &MessageDraft::text("hey")).unwrap();

        let listed = db.list_messages(conv, a, 10, None).unwrap();
        assert_eq!(listed[0].1.display_name, "Alex Rivera");
        assert_eq!(listed[1].1.display_name, ProfileSummary::UNKNOWN_NAME);
    }

    #[test]
    fn status_only_moves_forward() {
        let (db, a, b, conv) = setup();
        let msg = db.append_message(conv, a, &MessageDraft::text("Hello")).unwrap();

        let read = db.mark_read(msg.id, b).unwrap();
        assert!(read.changed);
        assert_eq!(read.status(), DeliveryStatus::Read);

        // A late delivery acknowledgement must not regress the message
        let delivered = db.mark_delivered(msg.id, b).unwrap();
        assert!(!delivered.changed);
        let again = db.mark_read(msg.id, b).unwrap();
        assert!(!again.changed);

        let stored = db.get_message(msg.id).unwrap().unwrap();
        assert!(stored.delivered && stored.read);
    }

    #[test]
    fn sender_cannot_mark_own_message() {
        let (db, a, _, conv) = setup();
        let msg = db.append_message(conv, a, &MessageDraft::text("mine")).unwrap();

        let change = db.mark_read(msg.id, a).unwrap();
        assert!(!change.changed);
        assert_eq!(change.status(), DeliveryStatus::Sent);
    }

    #[test]
    fn opening_a_conversation_marks_incoming_read() {
        let (db, a, b, conv) = setup();
        let first = db.append_message(conv, a, &MessageDraft::text("one")).unwrap();
        let second = db.append_message(conv, a, &MessageDraft::text("two")).unwrap();
        db.append_message(conv, b, &MessageDraft::text("reply")).unwrap();

        let changed = db.mark_conversation_read(conv, b).unwrap();
        assert_eq!(changed, vec![first.id, second.id]);
        assert!(db.mark_conversation_read(conv, b).unwrap().is_empty());

        let listed = db.list_messages(conv, b, 10, None).unwrap();
        assert!(listed[0].0.read && listed[1].0.read);
        assert!(!listed[2].0.read);
    }

    #[test]
    fn deleting_newest_message_repairs_summary() {
        let (db, a, b, conv) = setup();
        db.append_message(conv, a, &MessageDraft::text("first")).unwrap();
        let last = db.append_message(conv, a, &MessageDraft::text("second")).unwrap();

        let outcome = db.delete_message(last.id, a).unwrap();
        assert_eq!(outcome.last_message_text.as_deref(), Some("first"));
        assert_eq!(
            db.get_conversation(conv, b).unwrap().last_message_text.as_deref(),
            Some("first")
        );
    }

    #[test]
    fn only_sender_deletes_unless_moderator() {
        let (db, a, b, conv) = setup();
        let msg = db.append_message(conv, a, &MessageDraft::text("oops")).unwrap();

        assert!(matches!(db.delete_message(msg.id, b), Err(StoreError::Forbidden(_))));

        let outcome = db.delete_message_as_moderator(msg.id).unwrap();
        assert_eq!(outcome.last_message_text, None);
        assert!(db.get_message(msg.id).unwrap().is_none());
        assert!(matches!(db.delete_message(msg.id, a), Err(StoreError::NotFound(_))));
    }
}
