use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use palaver_shared::ids::{sanitize_field_name, valid_object_id, valid_user_id};
use palaver_shared::{constants, ids};

use crate::database::{fmt_ts, parse_ts, parse_ts_col, Database};
use crate::error::{Result, StoreError};
use crate::models::{Room, RoomMember, RoomSettings};

const ROOM_COLUMNS: &str = "id, name, type, owner_id, allow_invite, allow_edit_messages, \
     allow_delete_messages, allow_pin_messages, max_members, welcome_message, \
     created_at, updated_at, last_message_at, last_message, last_message_time";

impl Database {
    /// Insert a new room together with its member rows.
    ///
    /// Assigns the id and the `created_at` / `updated_at` / `last_message_at`
    /// timestamps; the caller provides name, type, owner, settings and the
    /// member list.
    pub fn create_room(&self, room: &mut Room) -> Result<()> {
        let now = Utc::now();
        room.id = ids::new_object_id();
        room.created_at = now;
        room.updated_at = now;
        room.last_message_at = now;

        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO chat_rooms (id, name, type, owner_id, allow_invite,
                 allow_edit_messages, allow_delete_messages, allow_pin_messages,
                 max_members, welcome_message, created_at, updated_at,
                 last_message_at, last_message, last_message_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, '', NULL)",
            params![
                room.id,
                room.name,
                room.room_type,
                room.owner_id,
                room.settings.allow_invite,
                room.settings.allow_edit_messages,
                room.settings.allow_delete_messages,
                room.settings.allow_pin_messages,
                room.settings.max_members,
                room.settings.welcome_message,
                fmt_ts(room.created_at),
                fmt_ts(room.updated_at),
                fmt_ts(room.last_message_at),
            ],
        )?;

        for member in &mut room.members {
            member.joined_at = now;
            member.last_seen = now;
            member.last_read_at = now;
            tx.execute(
                "INSERT INTO room_members (room_id, user_id, display_name, role,
                     status, joined_at, last_seen, last_read_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    room.id,
                    member.user_id,
                    member.display_name,
                    member.role,
                    member.status,
                    fmt_ts(member.joined_at),
                    fmt_ts(member.last_seen),
                    fmt_ts(member.last_read_at),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Fetch a room with its members, or `NotFound`.
    pub fn get_room(&self, id: &str) -> Result<Room> {
        if !valid_object_id(id) {
            return Err(StoreError::InvalidId);
        }

        let mut room = self
            .conn()
            .query_row(
                &format!("SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE id = ?1"),
                params![id],
                row_to_room,
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;

        room.members = self.get_members(id)?;
        Ok(room)
    }

    /// Apply a string-field patch to a room. Field names are sanitized and
    /// `updated_at` is always refreshed.
    pub fn update_room(&self, id: &str, patch: &[(&str, String)]) -> Result<()> {
        if !valid_object_id(id) {
            return Err(StoreError::InvalidId);
        }

        let mut assignments = vec!["updated_at = ?1".to_string()];
        let mut values: Vec<String> = vec![fmt_ts(Utc::now())];

        for (field, value) in patch {
            let field = sanitize_field_name(field);
            values.push(value.clone());
            assignments.push(format!("{} = ?{}", field, values.len()));
        }

        let sql = format!(
            "UPDATE chat_rooms SET {} WHERE id = ?{}",
            assignments.join(", "),
            values.len() + 1
        );

        let mut bound: Vec<&dyn rusqlite::ToSql> =
            values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        bound.push(&id as &dyn rusqlite::ToSql);

        let affected = self.conn().execute(&sql, bound.as_slice())?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Record the room's most recent message preview. The preview string is
    /// stored as given (ciphertext envelope or plaintext system sentinel);
    /// `last_message_at` drives the room-list ordering.
    pub fn update_room_preview(
        &self,
        room_id: &str,
        preview: &str,
        at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.update_room(
            room_id,
            &[
                ("last_message", preview.to_string()),
                ("last_message_time", fmt_ts(at)),
                ("last_message_at", fmt_ts(at)),
            ],
        )
    }

    /// Page through the rooms a user belongs to, most recently active first.
    ///
    /// The cursor is the `last_message_at` of the previous page's final room;
    /// one extra row is fetched to decide `has_more`, and a `next_cursor` is
    /// produced only when there is one.
    pub fn list_user_rooms(
        &self,
        user_id: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<(Vec<Room>, Option<String>, bool)> {
        if !valid_user_id(user_id) {
            return Err(StoreError::InvalidUserId);
        }

        let limit = clamp_limit(limit, constants::MAX_QUERY_LIMIT);

        let cursor_ts = match cursor {
            Some(c) if !c.is_empty() => Some(fmt_ts(parse_ts(c)?)),
            _ => None,
        };

        let mut rooms = match &cursor_ts {
            Some(before) => {
                let mut stmt = self.conn().prepare(&format!(
                    "SELECT {ROOM_COLUMNS} FROM chat_rooms r
                     WHERE r.last_message_at < ?3
                       AND EXISTS (SELECT 1 FROM room_members m
                                   WHERE m.room_id = r.id AND m.user_id = ?1)
                     ORDER BY r.last_message_at DESC
                     LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![user_id, limit + 1, before], row_to_room)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn().prepare(&format!(
                    "SELECT {ROOM_COLUMNS} FROM chat_rooms r
                     WHERE EXISTS (SELECT 1 FROM room_members m
                                   WHERE m.room_id = r.id AND m.user_id = ?1)
                     ORDER BY r.last_message_at DESC
                     LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![user_id, limit + 1], row_to_room)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        let has_more = rooms.len() as u32 > limit;
        if has_more {
            rooms.truncate(limit as usize);
        }

        for room in &mut rooms {
            room.members = self.get_members(&room.id)?;
        }

        let next_cursor = if has_more {
            rooms.last().map(|r| fmt_ts(r.last_message_at))
        } else {
            None
        };

        Ok((rooms, next_cursor, has_more))
    }

    /// Existence check on the member table.
    pub fn is_member(&self, room_id: &str, user_id: &str) -> Result<bool> {
        if !valid_object_id(room_id) {
            return Err(StoreError::InvalidId);
        }
        if !valid_user_id(user_id) {
            return Err(StoreError::InvalidUserId);
        }

        let exists: bool = self.conn().query_row(
            "SELECT EXISTS (SELECT 1 FROM room_members WHERE room_id = ?1 AND user_id = ?2)",
            params![room_id, user_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Add a member to a room. Returns `false` when the user was already a
    /// member (nothing changed). Fails with `NotFound` for a missing room.
    pub fn add_member(&self, room_id: &str, member: &RoomMember) -> Result<bool> {
        if !valid_object_id(room_id) {
            return Err(StoreError::InvalidId);
        }
        if !valid_user_id(&member.user_id) {
            return Err(StoreError::InvalidUserId);
        }

        let room_exists: bool = self.conn().query_row(
            "SELECT EXISTS (SELECT 1 FROM chat_rooms WHERE id = ?1)",
            params![room_id],
            |row| row.get(0),
        )?;
        if !room_exists {
            return Err(StoreError::NotFound);
        }

        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO room_members (room_id, user_id, display_name,
                 role, status, joined_at, last_seen, last_read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                room_id,
                member.user_id,
                member.display_name,
                member.role,
                member.status,
                fmt_ts(member.joined_at),
                fmt_ts(member.last_seen),
                fmt_ts(member.last_read_at),
            ],
        )?;

        if affected > 0 {
            self.conn().execute(
                "UPDATE chat_rooms SET updated_at = ?2 WHERE id = ?1",
                params![room_id, fmt_ts(Utc::now())],
            )?;
        }

        Ok(affected > 0)
    }

    /// Remove a member. Returns `false` when the user was not a member.
    pub fn remove_member(&self, room_id: &str, user_id: &str) -> Result<bool> {
        if !valid_object_id(room_id) {
            return Err(StoreError::InvalidId);
        }
        if !valid_user_id(user_id) {
            return Err(StoreError::InvalidUserId);
        }

        let affected = self.conn().execute(
            "DELETE FROM room_members WHERE room_id = ?1 AND user_id = ?2",
            params![room_id, user_id],
        )?;

        if affected > 0 {
            self.conn().execute(
                "UPDATE chat_rooms SET updated_at = ?2 WHERE id = ?1",
                params![room_id, fmt_ts(Utc::now())],
            )?;
        }

        Ok(affected > 0)
    }

    /// All members of a room, oldest join first.
    pub fn get_members(&self, room_id: &str) -> Result<Vec<RoomMember>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, display_name, role, status, joined_at, last_seen, last_read_at
             FROM room_members WHERE room_id = ?1 ORDER BY joined_at ASC, user_id ASC",
        )?;
        let rows = stmt.query_map(params![room_id], row_to_member)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn member_count(&self, room_id: &str) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM room_members WHERE room_id = ?1",
            params![room_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

/// Clamp a requested page size: zero means the default, anything above the
/// cap is reduced to it.
pub(crate) fn clamp_limit(limit: u32, max: u32) -> u32 {
    if limit == 0 {
        constants::DEFAULT_PAGE_SIZE.min(max)
    } else {
        limit.min(max)
    }
}

fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<Room> {
    let created_str: String = row.get(10)?;
    let updated_str: String = row.get(11)?;
    let last_message_at_str: String = row.get(12)?;
    let last_message_time_str: Option<String> = row.get(14)?;

    let last_message_time = last_message_time_str
        .map(|s| parse_ts_col(14, &s))
        .transpose()?;

    Ok(Room {
        id: row.get(0)?,
        name: row.get(1)?,
        room_type: row.get(2)?,
        owner_id: row.get(3)?,
        settings: RoomSettings {
            allow_invite: row.get(4)?,
            allow_edit_messages: row.get(5)?,
            allow_delete_messages: row.get(6)?,
            allow_pin_messages: row.get(7)?,
            max_members: row.get(8)?,
            welcome_message: row.get(9)?,
        },
        created_at: parse_ts_col(10, &created_str)?,
        updated_at: parse_ts_col(11, &updated_str)?,
        last_message_at: parse_ts_col(12, &last_message_at_str)?,
        last_message: row.get(13)?,
        last_message_time,
        members: Vec::new(),
    })
}

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomMember> {
    let joined_str: String = row.get(4)?;
    let seen_str: String = row.get(5)?;
    let read_str: String = row.get(6)?;

    Ok(RoomMember {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        role: row.get(2)?,
        status: row.get(3)?,
        joined_at: parse_ts_col(4, &joined_str)?,
        last_seen: parse_ts_col(5, &seen_str)?,
        last_read_at: parse_ts_col(6, &read_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_room(owner: &str, members: &[&str]) -> Room {
        let now = Utc::now();
        Room {
            id: String::new(),
            name: "test room".to_string(),
            room_type: "group".to_string(),
            owner_id: owner.to_string(),
            settings: RoomSettings::default(),
            created_at: now,
            updated_at: now,
            last_message_at: now,
            last_message: String::new(),
            last_message_time: None,
            members: members.iter().map(|m| RoomMember::new(m, now)).collect(),
        }
    }

    #[test]
    fn create_and_get_room() {
        let db = Database::open_in_memory().unwrap();

        let mut room = test_room("u_alice", &["u_alice", "u_bob"]);
        db.create_room(&mut room).unwrap();
        assert_eq!(room.id.len(), 24);

        let fetched = db.get_room(&room.id).unwrap();
        assert_eq!(fetched.name, "test room");
        assert_eq!(fetched.members.len(), 2);
        assert!(fetched.members.iter().all(|m| m.role == "member"));
    }

    #[test]
    fn get_room_rejects_bad_id() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.get_room("nope"), Err(StoreError::InvalidId)));
    }

    #[test]
    fn get_room_not_found() {
        let db = Database::open_in_memory().unwrap();
        let id = palaver_shared::ids::new_object_id();
        assert!(matches!(db.get_room(&id), Err(StoreError::NotFound)));
    }

    #[test]
    fn membership_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let mut room = test_room("u_alice", &["u_alice"]);
        db.create_room(&mut room).unwrap();

        assert!(db.is_member(&room.id, "u_alice").unwrap());
        assert!(!db.is_member(&room.id, "u_bob").unwrap());

        let bob = RoomMember::new("u_bob", Utc::now());
        assert!(db.add_member(&room.id, &bob).unwrap());
        // Second add is a no-op.
        assert!(!db.add_member(&room.id, &bob).unwrap());
        assert!(db.is_member(&room.id, "u_bob").unwrap());
        assert_eq!(db.member_count(&room.id).unwrap(), 2);

        assert!(db.remove_member(&room.id, "u_bob").unwrap());
        assert!(!db.remove_member(&room.id, "u_bob").unwrap());
        assert!(!db.is_member(&room.id, "u_bob").unwrap());
    }

    #[test]
    fn add_member_missing_room() {
        let db = Database::open_in_memory().unwrap();
        let member = RoomMember::new("u_bob", Utc::now());
        let id = palaver_shared::ids::new_object_id();
        assert!(matches!(
            db.add_member(&id, &member),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn list_user_rooms_orders_and_paginates() {
        let db = Database::open_in_memory().unwrap();

        let mut ids = Vec::new();
        for i in 0..3 {
            let mut room = test_room("u_alice", &["u_alice"]);
            room.name = format!("room-{i}");
            db.create_room(&mut room).unwrap();
            ids.push(room.id.clone());
        }

        // Activity bumps: room-1 most recent, then room-2, then room-0.
        let base = Utc::now();
        db.update_room_preview(&ids[0], "a", base + chrono::Duration::seconds(1))
            .unwrap();
        db.update_room_preview(&ids[2], "b", base + chrono::Duration::seconds(2))
            .unwrap();
        db.update_room_preview(&ids[1], "c", base + chrono::Duration::seconds(3))
            .unwrap();

        let (page, cursor, has_more) = db.list_user_rooms("u_alice", 2, None).unwrap();
        assert_eq!(page.len(), 2);
        assert!(has_more);
        assert_eq!(page[0].id, ids[1]);
        assert_eq!(page[1].id, ids[2]);
        let cursor = cursor.expect("cursor expected when has_more");

        let (rest, next, more) = db.list_user_rooms("u_alice", 2, Some(&cursor)).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, ids[0]);
        assert!(!more);
        assert!(next.is_none());
    }

    #[test]
    fn list_user_rooms_excludes_non_member() {
        let db = Database::open_in_memory().unwrap();
        let mut room = test_room("u_alice", &["u_alice"]);
        db.create_room(&mut room).unwrap();

        let (page, _, _) = db.list_user_rooms("u_bob", 10, None).unwrap();
        assert!(page.is_empty());
    }

    #[test]
    fn update_room_sanitizes_field_names() {
        let db = Database::open_in_memory().unwrap();
        let mut room = test_room("u_alice", &["u_alice"]);
        db.create_room(&mut room).unwrap();

        // "$name" is sanitized down to the legitimate column.
        db.update_room(&room.id, &[("$name", "renamed".to_string())])
            .unwrap();
        assert_eq!(db.get_room(&room.id).unwrap().name, "renamed");
    }
}
