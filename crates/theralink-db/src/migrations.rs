use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (messaging schema)");
        conn.execute_batch(
            "
            BEGIN;

            -- Mirror of the identity provider's profile summary
            CREATE TABLE profiles (
                user_id       TEXT PRIMARY KEY,
                display_name  TEXT NOT NULL,
                avatar_url    TEXT,
                updated_at    TEXT NOT NULL
            );

            CREATE TABLE conversations (
                id                 TEXT PRIMARY KEY,
                participant_key    TEXT NOT NULL UNIQUE,
                last_message_text  TEXT,
                last_updated_at    TEXT NOT NULL,
                created_at         TEXT NOT NULL
            );

            CREATE INDEX idx_conversations_updated
                ON conversations(last_updated_at);

            CREATE TABLE conversation_participants (
                conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                user_id          TEXT NOT NULL,
                joined_at        TEXT NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_participants_user
                ON conversation_participants(user_id);

            CREATE TABLE messages (
                id                   TEXT PRIMARY KEY,
                conversation_id      TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender_id            TEXT NOT NULL,
                kind                 TEXT NOT NULL CHECK (kind IN ('text', 'image', 'file')),
                body                 TEXT,
                attachment_url       TEXT,
                attachment_filename  TEXT,
                attachment_mime      TEXT,
                created_at           TEXT NOT NULL,
                delivered            INTEGER NOT NULL DEFAULT 0,
                read                 INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at);

            CREATE TABLE reactions (
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL,
                emoji       TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                UNIQUE(message_id, user_id, emoji)
            );

            CREATE INDEX idx_reactions_message
                ON reactions(message_id);

            INSERT INTO schema_version (version) VALUES (1);

            COMMIT;
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
