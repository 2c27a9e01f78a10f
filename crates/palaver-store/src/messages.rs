use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter};

use palaver_shared::ids::{valid_object_id, valid_user_id};
use palaver_shared::{constants, ids};

use crate::database::{fmt_ts, parse_ts, parse_ts_col, Database};
use crate::error::{Result, StoreError};
use crate::models::{DeliveryReceipt, Message, MessageMetadata, ReadReceipt};
use crate::rooms::clamp_limit;

/// Fixed column list for message reads; everything else stays out of the
/// result set.
const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, content, type, status, \
     created_at, updated_at, key_version, metadata, reply_to, forwarded_from";

impl Database {
    /// Insert a message. Assigns id and timestamps, forces status `sent`,
    /// and leaves the receipt sets empty.
    pub fn create_message(&self, message: &mut Message) -> Result<()> {
        if !valid_object_id(&message.room_id) {
            return Err(StoreError::InvalidId);
        }

        let now = Utc::now();
        message.id = ids::new_object_id();
        message.created_at = now;
        message.updated_at = now;
        message.status = "sent".to_string();
        message.read_by.clear();
        message.delivered_to.clear();

        let metadata_json = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn().execute(
            "INSERT INTO messages (id, room_id, sender_id, content, type, status,
                 created_at, updated_at, key_version, metadata, reply_to, forwarded_from)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                message.id,
                message.room_id,
                message.sender_id,
                message.content,
                message.message_type,
                message.status,
                fmt_ts(message.created_at),
                fmt_ts(message.updated_at),
                message.key_version,
                metadata_json,
                message.reply_to,
                message.forwarded_from,
            ],
        )?;

        Ok(())
    }

    /// Page through a room's messages, newest first.
    ///
    /// The cursor is the `created_at` of the previous page's final message;
    /// one extra row is fetched to decide `has_more`. Optional `since` /
    /// `until` bound the window.
    pub fn get_messages(
        &self,
        room_id: &str,
        limit: u32,
        cursor: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Message>, Option<String>, bool)> {
        if !valid_object_id(room_id) {
            return Err(StoreError::InvalidId);
        }

        let limit = clamp_limit(limit, constants::MAX_PAGE_SIZE);

        let mut conditions = vec!["room_id = ?1".to_string()];
        let mut values = vec![room_id.to_string()];

        if let Some(since) = since {
            values.push(fmt_ts(since));
            conditions.push(format!("created_at >= ?{}", values.len()));
        }
        if let Some(until) = until {
            values.push(fmt_ts(until));
            conditions.push(format!("created_at <= ?{}", values.len()));
        }
        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            values.push(fmt_ts(parse_ts(cursor)?));
            conditions.push(format!("created_at < ?{}", values.len()));
        }

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE {}
             ORDER BY created_at DESC
             LIMIT {}",
            conditions.join(" AND "),
            limit + 1
        );

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_message)?;
        let mut messages = rows.collect::<std::result::Result<Vec<_>, _>>()?;

        let has_more = messages.len() as u32 > limit;
        if has_more {
            messages.truncate(limit as usize);
        }

        for message in &mut messages {
            self.load_receipts(message)?;
        }

        let next_cursor = if has_more {
            messages.last().map(|m| fmt_ts(m.created_at))
        } else {
            None
        };

        Ok((messages, next_cursor, has_more))
    }

    /// Page through a room's history, oldest first, excluding system
    /// messages. Uses the stricter history cap.
    pub fn get_history(
        &self,
        room_id: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<(Vec<Message>, Option<String>, bool)> {
        if !valid_object_id(room_id) {
            return Err(StoreError::InvalidId);
        }

        let limit = clamp_limit(limit, constants::MAX_HISTORY_PAGE_SIZE);

        let mut conditions = vec!["room_id = ?1".to_string(), "type != 'system'".to_string()];
        let mut values = vec![room_id.to_string()];

        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            values.push(fmt_ts(parse_ts(cursor)?));
            conditions.push(format!("created_at > ?{}", values.len()));
        }

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE {}
             ORDER BY created_at ASC
             LIMIT {}",
            conditions.join(" AND "),
            limit + 1
        );

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_message)?;
        let mut messages = rows.collect::<std::result::Result<Vec<_>, _>>()?;

        let has_more = messages.len() as u32 > limit;
        if has_more {
            messages.truncate(limit as usize);
        }

        for message in &mut messages {
            self.load_receipts(message)?;
        }

        let next_cursor = if has_more {
            messages.last().map(|m| fmt_ts(m.created_at))
        } else {
            None
        };

        Ok((messages, next_cursor, has_more))
    }

    /// Record a read mark for `user_id` on one message or on every message
    /// in the room.
    ///
    /// The receipt table's primary key makes the operation idempotent: a
    /// user who already read a message is simply skipped, so repeated calls
    /// never produce a second entry.
    pub fn mark_as_read(
        &self,
        room_id: &str,
        user_id: &str,
        message_id: Option<&str>,
    ) -> Result<()> {
        if !valid_object_id(room_id) {
            return Err(StoreError::InvalidId);
        }
        if !valid_user_id(user_id) {
            return Err(StoreError::InvalidUserId);
        }

        let now = fmt_ts(Utc::now());

        match message_id {
            Some(message_id) => {
                if !valid_object_id(message_id) {
                    return Err(StoreError::InvalidId);
                }
                self.conn().execute(
                    "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                     SELECT m.id, ?1, ?2 FROM messages m
                     WHERE m.room_id = ?3 AND m.id = ?4",
                    params![user_id, now, room_id, message_id],
                )?;
            }
            None => {
                self.conn().execute(
                    "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                     SELECT m.id, ?1, ?2 FROM messages m
                     WHERE m.room_id = ?3",
                    params![user_id, now, room_id],
                )?;
            }
        }

        Ok(())
    }

    /// Record a delivery mark, same shape and idempotence as read marks.
    pub fn mark_as_delivered(
        &self,
        room_id: &str,
        user_id: &str,
        message_id: Option<&str>,
    ) -> Result<()> {
        if !valid_object_id(room_id) {
            return Err(StoreError::InvalidId);
        }
        if !valid_user_id(user_id) {
            return Err(StoreError::InvalidUserId);
        }

        let now = fmt_ts(Utc::now());

        match message_id {
            Some(message_id) => {
                if !valid_object_id(message_id) {
                    return Err(StoreError::InvalidId);
                }
                self.conn().execute(
                    "INSERT OR IGNORE INTO message_deliveries (message_id, user_id, delivered_at)
                     SELECT m.id, ?1, ?2 FROM messages m
                     WHERE m.room_id = ?3 AND m.id = ?4",
                    params![user_id, now, room_id, message_id],
                )?;
            }
            None => {
                self.conn().execute(
                    "INSERT OR IGNORE INTO message_deliveries (message_id, user_id, delivered_at)
                     SELECT m.id, ?1, ?2 FROM messages m
                     WHERE m.room_id = ?3",
                    params![user_id, now, room_id],
                )?;
            }
        }

        Ok(())
    }

    /// Count messages in a room the user has neither sent nor read.
    ///
    /// The inner query is bounded to the most recent rows so the cost per
    /// call stays fixed regardless of room size.
    pub fn unread_count(&self, room_id: &str, user_id: &str) -> Result<u32> {
        if !valid_object_id(room_id) {
            return Err(StoreError::InvalidId);
        }
        if !valid_user_id(user_id) {
            return Err(StoreError::InvalidUserId);
        }

        let count: u32 = self.conn().query_row(
            &format!(
                "SELECT COUNT(*) FROM (
                     SELECT m.id FROM messages m
                     WHERE m.room_id = ?1
                       AND m.sender_id != ?2
                       AND NOT EXISTS (SELECT 1 FROM message_reads r
                                       WHERE r.message_id = m.id AND r.user_id = ?2)
                     ORDER BY m.created_at DESC
                     LIMIT {}
                 )",
                constants::UNREAD_SCAN_LIMIT
            ),
            params![room_id, user_id],
            |row| row.get(0),
        )?;

        Ok(count)
    }

    fn load_receipts(&self, message: &mut Message) -> Result<()> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, read_at FROM message_reads
             WHERE message_id = ?1 ORDER BY read_at ASC",
        )?;
        let rows = stmt.query_map(params![message.id], |row| {
            let at: String = row.get(1)?;
            Ok(ReadReceipt {
                user_id: row.get(0)?,
                read_at: parse_ts_col(1, &at)?,
            })
        })?;
        message.read_by = rows.collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = self.conn().prepare(
            "SELECT user_id, delivered_at FROM message_deliveries
             WHERE message_id = ?1 ORDER BY delivered_at ASC",
        )?;
        let rows = stmt.query_map(params![message.id], |row| {
            let at: String = row.get(1)?;
            Ok(DeliveryReceipt {
                user_id: row.get(0)?,
                delivered_at: parse_ts_col(1, &at)?,
            })
        })?;
        message.delivered_to = rows.collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(())
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let created_str: String = row.get(6)?;
    let updated_str: String = row.get(7)?;
    let metadata_json: Option<String> = row.get(9)?;

    let metadata: Option<MessageMetadata> = metadata_json
        .map(|json| {
            serde_json::from_str(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    9,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        })
        .transpose()?;

    Ok(Message {
        id: row.get(0)?,
        room_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        message_type: row.get(4)?,
        status: row.get(5)?,
        created_at: parse_ts_col(6, &created_str)?,
        updated_at: parse_ts_col(7, &updated_str)?,
        key_version: row.get(8)?,
        metadata,
        reply_to: row.get(10)?,
        forwarded_from: row.get(11)?,
        read_by: Vec::new(),
        delivered_to: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Room, RoomMember, RoomSettings};

    fn seeded_room(db: &Database) -> String {
        let now = Utc::now();
        let mut room = Room {
            id: String::new(),
            name: "r".to_string(),
            room_type: "group".to_string(),
            owner_id: "u_alice".to_string(),
            settings: RoomSettings::default(),
            created_at: now,
            updated_at: now,
            last_message_at: now,
            last_message: String::new(),
            last_message_time: None,
            members: vec![
                RoomMember::new("u_alice", now),
                RoomMember::new("u_bob", now),
            ],
        };
        db.create_room(&mut room).unwrap();
        room.id
    }

    fn text_message(room_id: &str, sender: &str, content: &str) -> Message {
        Message {
            id: String::new(),
            room_id: room_id.to_string(),
            sender_id: sender.to_string(),
            content: content.to_string(),
            message_type: "text".to_string(),
            status: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            key_version: None,
            metadata: None,
            reply_to: None,
            forwarded_from: None,
            read_by: Vec::new(),
            delivered_to: Vec::new(),
        }
    }

    /// Insert a message with a small pause so stored timestamps are strictly
    /// increasing (storage precision is microseconds).
    fn put(db: &Database, room_id: &str, sender: &str, content: &str) -> Message {
        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut msg = text_message(room_id, sender, content);
        db.create_message(&mut msg).unwrap();
        msg
    }

    #[test]
    fn create_assigns_id_and_status() {
        let db = Database::open_in_memory().unwrap();
        let room_id = seeded_room(&db);

        let mut msg = text_message(&room_id, "u_alice", "hello");
        db.create_message(&mut msg).unwrap();

        assert_eq!(msg.id.len(), 24);
        assert_eq!(msg.status, "sent");
        assert!(msg.read_by.is_empty());
        assert!(msg.delivered_to.is_empty());
    }

    #[test]
    fn get_messages_newest_first_with_cursor() {
        let db = Database::open_in_memory().unwrap();
        let room_id = seeded_room(&db);

        for i in 0..5 {
            put(&db, &room_id, "u_alice", &format!("m{i}"));
        }

        let (page, cursor, has_more) = db.get_messages(&room_id, 3, None, None, None).unwrap();
        assert_eq!(page.len(), 3);
        assert!(has_more);
        assert_eq!(page[0].content, "m4");
        assert_eq!(page[2].content, "m2");

        let cursor = cursor.unwrap();
        let (rest, next, more) = db
            .get_messages(&room_id, 3, Some(&cursor), None, None)
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].content, "m1");
        assert_eq!(rest[1].content, "m0");
        assert!(!more);
        assert!(next.is_none());
    }

    #[test]
    fn get_messages_rejects_bad_cursor() {
        let db = Database::open_in_memory().unwrap();
        let room_id = seeded_room(&db);
        assert!(matches!(
            db.get_messages(&room_id, 3, Some("not-a-time"), None, None),
            Err(StoreError::InvalidCursor(_))
        ));
    }

    #[test]
    fn limit_zero_uses_default() {
        let db = Database::open_in_memory().unwrap();
        let room_id = seeded_room(&db);

        for i in 0..25 {
            let mut msg = text_message(&room_id, "u_alice", &format!("m{i}"));
            db.create_message(&mut msg).unwrap();
        }

        let (page, _, has_more) = db.get_messages(&room_id, 0, None, None, None).unwrap();
        assert_eq!(page.len(), constants::DEFAULT_PAGE_SIZE as usize);
        assert!(has_more);
    }

    #[test]
    fn history_is_ascending_and_skips_system() {
        let db = Database::open_in_memory().unwrap();
        let room_id = seeded_room(&db);

        put(&db, &room_id, "u_alice", "first");

        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut system = text_message(&room_id, "system", "u_bob joined the group");
        system.message_type = "system".to_string();
        db.create_message(&mut system).unwrap();

        put(&db, &room_id, "u_bob", "second");

        let (page, _, has_more) = db.get_history(&room_id, 10, None).unwrap();
        assert_eq!(page.len(), 2);
        assert!(!has_more);
        assert_eq!(page[0].content, "first");
        assert_eq!(page[1].content, "second");
    }

    #[test]
    fn mark_as_read_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let room_id = seeded_room(&db);

        let mut msg = text_message(&room_id, "u_alice", "hello");
        db.create_message(&mut msg).unwrap();

        db.mark_as_read(&room_id, "u_bob", None).unwrap();
        db.mark_as_read(&room_id, "u_bob", None).unwrap();

        let (page, _, _) = db.get_messages(&room_id, 10, None, None, None).unwrap();
        let read_by = &page[0].read_by;
        assert_eq!(read_by.len(), 1);
        assert_eq!(read_by[0].user_id, "u_bob");
    }

    #[test]
    fn mark_single_message_as_read() {
        let db = Database::open_in_memory().unwrap();
        let room_id = seeded_room(&db);

        let mut first = text_message(&room_id, "u_alice", "one");
        db.create_message(&mut first).unwrap();
        let mut second = text_message(&room_id, "u_alice", "two");
        db.create_message(&mut second).unwrap();

        db.mark_as_read(&room_id, "u_bob", Some(&first.id)).unwrap();

        let (page, _, _) = db.get_messages(&room_id, 10, None, None, None).unwrap();
        let by_id = |id: &str| page.iter().find(|m| m.id == id).unwrap();
        assert_eq!(by_id(&first.id).read_by.len(), 1);
        assert!(by_id(&second.id).read_by.is_empty());
    }

    #[test]
    fn mark_as_delivered_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let room_id = seeded_room(&db);

        let mut msg = text_message(&room_id, "u_alice", "hello");
        db.create_message(&mut msg).unwrap();

        db.mark_as_delivered(&room_id, "u_bob", None).unwrap();
        db.mark_as_delivered(&room_id, "u_bob", None).unwrap();

        let (page, _, _) = db.get_messages(&room_id, 10, None, None, None).unwrap();
        assert_eq!(page[0].delivered_to.len(), 1);
    }

    #[test]
    fn unread_count_excludes_own_and_read() {
        let db = Database::open_in_memory().unwrap();
        let room_id = seeded_room(&db);

        let mut from_alice = text_message(&room_id, "u_alice", "hi bob");
        db.create_message(&mut from_alice).unwrap();
        let mut from_bob = text_message(&room_id, "u_bob", "hi alice");
        db.create_message(&mut from_bob).unwrap();

        // Bob has one unread (Alice's); his own message does not count.
        assert_eq!(db.unread_count(&room_id, "u_bob").unwrap(), 1);

        db.mark_as_read(&room_id, "u_bob", None).unwrap();
        assert_eq!(db.unread_count(&room_id, "u_bob").unwrap(), 0);
    }

    #[test]
    fn since_until_bound_the_window() {
        let db = Database::open_in_memory().unwrap();
        let room_id = seeded_room(&db);

        let first = put(&db, &room_id, "u_alice", "early");
        let second = put(&db, &room_id, "u_alice", "middle");
        let third = put(&db, &room_id, "u_alice", "late");

        let (page, _, _) = db
            .get_messages(&room_id, 10, None, Some(second.created_at), None)
            .unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|m| m.id != first.id));

        let (page, _, _) = db
            .get_messages(&room_id, 10, None, None, Some(second.created_at))
            .unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|m| m.id != third.id));
    }

    #[test]
    fn metadata_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let room_id = seeded_room(&db);

        let mut msg = text_message(&room_id, "u_alice", "see attachment");
        msg.message_type = "image".to_string();
        msg.metadata = Some(MessageMetadata {
            image_url: Some("https://cdn.example/img.png".to_string()),
            image_width: Some(640),
            image_height: Some(480),
            ..Default::default()
        });
        db.create_message(&mut msg).unwrap();

        let (page, _, _) = db.get_messages(&room_id, 1, None, None, None).unwrap();
        let metadata = page[0].metadata.as_ref().unwrap();
        assert_eq!(metadata.image_width, Some(640));
    }
}
