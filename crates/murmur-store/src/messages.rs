//! Message history.

use chrono::Utc;
use murmur_shared::{RoomId, UserId};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, NewMessage};
use crate::rooms::parse_timestamp;

impl Database {
    /// Store a message and bump the room's counters in one transaction.
    ///
    /// The sender must be one of the room's participants.
    pub fn insert_message(&self, msg: &NewMessage) -> Result<Message> {
        let room = self.get_room(msg.room_id)?;
        if room.slot_of(msg.sender_id).is_none() {
            return Err(StoreError::NotParticipant {
                room: msg.room_id,
                user: msg.sender_id,
            });
        }

        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let (file_path, file_name) = match &msg.file {
            Some(f) => (Some(f.path.as_str()), Some(f.name.as_str())),
            None => (None, None),
        };

        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO messages
                (room_id, sender_id, sender_username, content, file_path, file_name,
                 is_file, signature, iv, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                msg.room_id.0,
                msg.sender_id.0,
                msg.sender_username,
                msg.content,
                file_path,
                file_name,
                msg.file.is_some(),
                msg.signature,
                msg.iv,
                now_str,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE rooms SET num_messages = num_messages + 1, last_message_time = ?1
             WHERE id = ?2",
            params![now_str, msg.room_id.0],
        )?;
        tx.commit()?;

        Ok(Message {
            id,
            room_id: msg.room_id,
            sender_id: msg.sender_id,
            sender_username: msg.sender_username.clone(),
            content: msg.content.clone(),
            file_path: file_path.map(str::to_string),
            file_name: file_name.map(str::to_string),
            is_file: msg.file.is_some(),
            signature: msg.signature.clone(),
            iv: msg.iv.clone(),
            timestamp: now,
        })
    }

    /// Page through a room's history, newest first.
    pub fn messages_for_room(&self, room: RoomId, limit: u32, offset: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, room_id, sender_id, sender_username, content, file_path, file_name,
                    is_file, signature, iv, timestamp
             FROM messages
             WHERE room_id = ?1
             ORDER BY id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![room.0, limit, offset], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn message_count(&self, room: RoomId) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE room_id = ?1",
            params![room.0],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let ts: String = row.get(10)?;
    Ok(Message {
        id: row.get(0)?,
        room_id: RoomId(row.get(1)?),
        sender_id: UserId(row.get(2)?),
        sender_username: row.get(3)?,
        content: row.get(4)?,
        file_path: row.get(5)?,
        file_name: row.get(6)?,
        is_file: row.get(7)?,
        signature: row.get(8)?,
        iv: row.get(9)?,
        timestamp: parse_timestamp(10, &ts)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileAttachment;

    fn setup() -> (Database, RoomId, UserId, UserId) {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("alice", None).unwrap().id;
        let b = db.create_user("bob", None).unwrap().id;
        let room = db.create_room(a, b).unwrap().id;
        (db, room, a, b)
    }

    fn text(room: RoomId, sender: UserId, body: &str) -> NewMessage {
        NewMessage {
            room_id: room,
            sender_id: sender,
            sender_username: "alice".into(),
            content: Some(body.into()),
            file: None,
            signature: "sig".into(),
            iv: "iv".into(),
        }
    }

    #[test]
    fn insert_bumps_room_counters() {
        let (db, room, a, _) = setup();

        db.insert_message(&text(room, a, "one")).unwrap();
        let stored = db.insert_message(&text(room, a, "two")).unwrap();

        let room_row = db.get_room(room).unwrap();
        assert_eq!(room_row.num_messages, 2);
        assert_eq!(
            room_row.last_message_time.map(|t| t.timestamp()),
            Some(stored.timestamp.timestamp())
        );
        assert_eq!(db.message_count(room).unwrap(), 2);
    }

    #[test]
    fn file_messages_keep_their_reference() {
        let (db, room, _, b) = setup();
        let msg = NewMessage {
            file: Some(FileAttachment {
                path: "uploads/file.png".into(),
                name: "file.png".into(),
            }),
            content: None,
            sender_username: "bob".into(),
            ..text(room, b, "")
        };

        let stored = db.insert_message(&msg).unwrap();
        assert!(stored.is_file);

        let page = db.messages_for_room(room, 10, 0).unwrap();
        assert_eq!(page.len(), 1);
        assert!(page[0].is_file);
        assert_eq!(page[0].file_path.as_deref(), Some("uploads/file.png"));
        assert_eq!(page[0].file_name.as_deref(), Some("file.png"));
        assert!(page[0].content.is_none());
    }

    #[test]
    fn outsiders_cannot_post() {
        let (db, room, _, _) = setup();
        let carol = db.create_user("carol", None).unwrap().id;

        let err = db.insert_message(&text(room, carol, "hi")).unwrap_err();
        assert!(matches!(err, StoreError::NotParticipant { .. }));
        assert_eq!(db.get_room(room).unwrap().num_messages, 0);
    }

    #[test]
    fn history_is_newest_first() {
        let (db, room, a, _) = setup();
        for body in ["one", "two", "three"] {
            db.insert_message(&text(room, a, body)).unwrap();
        }

        let page = db.messages_for_room(room, 2, 0).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content.as_deref(), Some("three"));
        assert_eq!(page[1].content.as_deref(), Some("two"));

        let rest = db.messages_for_room(room, 2, 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].content.as_deref(), Some("one"));
    }
}
