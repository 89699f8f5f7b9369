use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use theralink_types::models::ProfileSummary;

use crate::models::{ProfileRow, format_ts, now};
use crate::{Database, Result, StoreError};

const MAX_DISPLAY_NAME_CHARS: usize = 100;

impl Database {
    /// Record the identity provider's view of a user. The core never owns the
    /// user's lifecycle; this only keeps display data close to the messages.
    pub fn upsert_profile(
        &self,
        user_id: Uuid,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<ProfileSummary> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(StoreError::Validation("display name must not be empty".into()));
        }
        if display_name.chars().count() > MAX_DISPLAY_NAME_CHARS {
            return Err(StoreError::Validation(format!(
                "display name exceeds {} characters",
                MAX_DISPLAY_NAME_CHARS
            )));
        }
        let avatar_url = avatar_url.map(str::trim).filter(|u| !u.is_empty());

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (user_id, display_name, avatar_url, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    avatar_url = excluded.avatar_url,
                    updated_at = excluded.updated_at",
                rusqlite::params![user_id.to_string(), display_name, avatar_url, format_ts(&now())],
            )?;
            Ok(())
        })?;

        Ok(ProfileSummary {
            user_id,
            display_name: display_name.to_string(),
            avatar_url: avatar_url.map(str::to_string),
        })
    }

    pub fn get_profile(&self, user_id: Uuid) -> Result<Option<ProfileSummary>> {
        self.with_conn(|conn| query_profile(conn, user_id))
    }
}

pub(crate) fn query_profile(conn: &Connection, user_id: Uuid) -> Result<Option<ProfileSummary>> {
    let row = conn
        .query_row(
            "SELECT user_id, display_name, avatar_url FROM profiles WHERE user_id = ?1",
            [user_id.to_string()],
            |row| {
                Ok(ProfileRow {
                    user_id: row.get(0)?,
                    display_name: row.get(1)?,
                    avatar_url: row.get(2)?,
                })
            },
        )
        .optional()?;

    row.map(ProfileRow::into_profile).transpose()
}

/// Profile for display, falling back to a placeholder for unmirrored users.
pub(crate) fn profile_or_unknown(conn: &Connection, user_id: Uuid) -> Result<ProfileSummary> {
    Ok(query_profile(conn, user_id)?.unwrap_or_else(|| ProfileSummary::unknown(user_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_overwrites_existing_profile() {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4();

        db.upsert_profile(user, "Dana Scully", None).unwrap();
        db.upsert_profile(user, "  Dr. Scully ", Some("https://cdn.example/d.png"))
            .unwrap();

        let profile = db.get_profile(user).unwrap().unwrap();
        assert_eq!(profile.display_name, "Dr. Scully");
        assert_eq!(profile.avatar_url.as_deref(), Some("https://cdn.example/d.png"));
    }

    #[test]
    fn blank_display_name_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let err = db.upsert_profile(Uuid::new_v4(), "   ", None).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn unknown_profile_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_profile(Uuid::new_v4()).unwrap().is_none());
    }
}
