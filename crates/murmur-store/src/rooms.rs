//! Two-party rooms and per-participant last-online stamps.

use chrono::{DateTime, Utc};
use murmur_shared::{RoomId, UserId};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{ParticipantSlot, Room};

const ROOM_COLUMNS: &str = "id, user1_id, user2_id, user1_last_online, user2_last_online,
     num_messages, last_message_time";

impl Database {
    pub fn create_room(&self, a: UserId, b: UserId) -> Result<Room> {
        if a == b {
            return Err(StoreError::InvalidRoom(format!(
                "user {a} cannot share a room with themselves"
            )));
        }

        self.conn().execute(
            "INSERT INTO rooms (user1_id, user2_id) VALUES (?1, ?2)",
            params![a.0, b.0],
        )?;
        let id = RoomId(self.conn().last_insert_rowid());
        tracing::debug!(room = %id, user1 = %a, user2 = %b, "room created");
        self.get_room(id)
    }

    /// Return the room shared by `a` and `b` in either column order, creating
    /// it if none exists.
    pub fn find_or_create_room(&self, a: UserId, b: UserId) -> Result<Room> {
        let existing = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {ROOM_COLUMNS} FROM rooms
                     WHERE (user1_id = ?1 AND user2_id = ?2)
                        OR (user1_id = ?2 AND user2_id = ?1)
                     ORDER BY id LIMIT 1"
                ),
                params![a.0, b.0],
                row_to_room,
            )
            .optional()?;

        match existing {
            Some(room) => Ok(room),
            None => self.create_room(a, b),
        }
    }

    pub fn get_room(&self, id: RoomId) -> Result<Room> {
        self.conn()
            .query_row(
                &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?1"),
                params![id.0],
                row_to_room,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// Rooms the user takes part in, most recently active first.
    pub fn rooms_for_user(&self, user: UserId) -> Result<Vec<Room>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms
             WHERE user1_id = ?1 OR user2_id = ?1
             ORDER BY last_message_time IS NULL, last_message_time DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![user.0], row_to_room)?;

        let mut rooms = Vec::new();
        for row in rows {
            rooms.push(row?);
        }
        Ok(rooms)
    }

    pub fn room_participants(&self, id: RoomId) -> Result<(UserId, UserId)> {
        Ok(self.get_room(id)?.participants())
    }

    /// Stamp the participant column belonging to `user`.
    pub fn update_last_online(&self, room: RoomId, user: UserId, at: DateTime<Utc>) -> Result<()> {
        let slot = self
            .get_room(room)?
            .slot_of(user)
            .ok_or(StoreError::NotParticipant { room, user })?;

        let column = match slot {
            ParticipantSlot::First => "user1_last_online",
            ParticipantSlot::Second => "user2_last_online",
        };
        self.conn().execute(
            &format!("UPDATE rooms SET {column} = ?1 WHERE id = ?2"),
            params![at.to_rfc3339(), room.0],
        )?;
        Ok(())
    }

    pub fn last_online_of(&self, room: RoomId, user: UserId) -> Result<Option<DateTime<Utc>>> {
        let room_row = self.get_room(room)?;
        if room_row.slot_of(user).is_none() {
            return Err(StoreError::NotParticipant { room, user });
        }
        Ok(room_row.last_online_of(user))
    }
}

pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn optional_timestamp(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_timestamp(idx, &s)).transpose()
}

fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<Room> {
    Ok(Room {
        id: RoomId(row.get(0)?),
        user1: UserId(row.get(1)?),
        user2: UserId(row.get(2)?),
        user1_last_online: optional_timestamp(3, row.get(3)?)?,
        user2_last_online: optional_timestamp(4, row.get(4)?)?,
        num_messages: row.get(5)?,
        last_message_time: optional_timestamp(6, row.get(6)?)?,
    })
}
