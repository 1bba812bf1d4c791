//! Accounts and access tokens.
//!
//! Token issuance belongs to the account service; the relay only resolves
//! tokens. `issue_token` exists for provisioning scripts and tests.

use chrono::{DateTime, Utc};
use murmur_shared::UserId;
use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::User;

impl Database {
    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub fn create_user(&self, username: &str, public_key: Option<&str>) -> Result<User> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO users (username, public_key, created_at) VALUES (?1, ?2, ?3)",
            params![username, public_key, now.to_rfc3339()],
        )?;

        Ok(User {
            id: UserId(self.conn().last_insert_rowid()),
            username: username.to_string(),
            public_key: public_key.map(str::to_string),
            created_at: now,
        })
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, username, public_key, created_at FROM users WHERE id = ?1",
                params![id.0],
                row_to_user,
            )
            .map_err(not_found)
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, username, public_key, created_at FROM users WHERE username = ?1",
                params![username],
                row_to_user,
            )
            .map_err(not_found)
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    pub fn issue_token(&self, user_id: UserId) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        self.conn().execute(
            "INSERT INTO auth_tokens (token, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![token, user_id.0, Utc::now().to_rfc3339()],
        )?;
        Ok(token)
    }

    /// Resolve a token to its owner. Unknown tokens yield [`StoreError::NotFound`].
    pub fn user_for_token(&self, token: &str) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT u.id, u.username, u.public_key, u.created_at
                 FROM auth_tokens t JOIN users u ON u.id = t.user_id
                 WHERE t.token = ?1",
                params![token],
                row_to_user,
            )
            .map_err(not_found)
    }

    pub fn revoke_token(&self, token: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM auth_tokens WHERE token = ?1", params![token])?;
        Ok(affected > 0)
    }
}

fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: i64 = row.get(0)?;
    let username: String = row.get(1)?;
    let public_key: Option<String> = row.get(2)?;
    let created_str: String = row.get(3)?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(User {
        id: UserId(id),
        username,
        public_key,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_resolves_to_owner() {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", Some("pk-a")).unwrap();
        let token = db.issue_token(alice.id).unwrap();

        let resolved = db.user_for_token(&token).unwrap();
        assert_eq!(resolved.id, alice.id);
        assert_eq!(resolved.username, "alice");
        assert_eq!(resolved.public_key.as_deref(), Some("pk-a"));
    }

    #[test]
    fn unknown_and_revoked_tokens_are_not_found() {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", None).unwrap();
        let token = db.issue_token(alice.id).unwrap();

        assert!(matches!(db.user_for_token("nope"), Err(StoreError::NotFound)));

        assert!(db.revoke_token(&token).unwrap());
        assert!(matches!(db.user_for_token(&token), Err(StoreError::NotFound)));
    }

    #[test]
    fn usernames_are_unique() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("alice", None).unwrap();
        assert!(db.create_user("alice", None).is_err());
        assert_eq!(db.get_user_by_username("alice").unwrap().username, "alice");
    }
}
