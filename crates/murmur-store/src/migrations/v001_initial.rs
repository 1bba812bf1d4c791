//! v001 -- Initial schema creation.
//!
//! Creates `users`, `auth_tokens`, `rooms` and `messages`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    username    TEXT NOT NULL UNIQUE,
    public_key  TEXT UNIQUE,                  -- client-held key, opaque here
    created_at  TEXT NOT NULL                 -- RFC-3339
);

-- ----------------------------------------------------------------
-- Access tokens (issued elsewhere, resolved at socket connect)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS auth_tokens (
    token      TEXT PRIMARY KEY NOT NULL,
    user_id    INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Rooms: exactly two participants, fixed at creation
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rooms (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    user1_id          INTEGER NOT NULL,
    user2_id          INTEGER NOT NULL,
    user1_last_online TEXT,
    user2_last_online TEXT,
    num_messages      INTEGER NOT NULL DEFAULT 0,
    last_message_time TEXT,

    CHECK (user1_id <> user2_id),
    FOREIGN KEY (user1_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (user2_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_rooms_user1 ON rooms(user1_id);
CREATE INDEX IF NOT EXISTS idx_rooms_user2 ON rooms(user2_id);

-- ----------------------------------------------------------------
-- Messages (append-only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id         INTEGER NOT NULL,
    sender_id       INTEGER NOT NULL,
    sender_username TEXT NOT NULL,
    content         TEXT,                     -- opaque ciphertext
    file_path       TEXT,                     -- reference returned by the file store
    file_name       TEXT,
    is_file         INTEGER NOT NULL DEFAULT 0,
    signature       TEXT NOT NULL,
    iv              TEXT NOT NULL,
    timestamp       TEXT NOT NULL,

    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE,
    FOREIGN KEY (sender_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_room_ts
    ON messages(room_id, timestamp DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
