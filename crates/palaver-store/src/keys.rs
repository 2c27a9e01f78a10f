//! Persistence for wrapped room keys.
//!
//! Each room accumulates versioned DEKs wrapped under the master key. At most
//! one version per room is active; [`Database::save_key`] demotes the others
//! inside the same transaction, and the read path tolerates a demotion that
//! never landed by preferring the highest active version and lazily demoting
//! the rest.

use chrono::{Duration, Utc};
use rusqlite::params;

use palaver_shared::ids::valid_object_id;

use crate::database::{fmt_ts, parse_ts_col, Database};
use crate::error::{Result, StoreError};
use crate::models::RoomKeyRecord;

const KEY_COLUMNS: &str =
    "room_id, key_version, wrapped_key, created_at, rotated_at, is_active, expires_at";

impl Database {
    /// Upsert a wrapped key by `(room_id, key_version)`.
    ///
    /// When the record is active, every other version of the same room is
    /// demoted in the same transaction, so an interrupted save can never
    /// leave two active versions behind.
    pub fn save_key(&self, record: &RoomKeyRecord) -> Result<()> {
        if !valid_object_id(&record.room_id) {
            return Err(StoreError::InvalidId);
        }

        let tx = self.conn().unchecked_transaction()?;

        if record.is_active {
            tx.execute(
                "UPDATE encryption_keys SET is_active = 0
                 WHERE room_id = ?1 AND key_version != ?2 AND is_active = 1",
                params![record.room_id, record.key_version],
            )?;
        }

        tx.execute(
            "INSERT OR REPLACE INTO encryption_keys
                 (room_id, key_version, wrapped_key, created_at, rotated_at,
                  is_active, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.room_id,
                record.key_version,
                record.wrapped_key,
                fmt_ts(record.created_at),
                fmt_ts(record.rotated_at),
                record.is_active,
                fmt_ts(record.expires_at),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// The room's active key, if any.
    ///
    /// Should more than one active version exist (a demotion that never
    /// committed on a less capable engine), the highest version wins and the
    /// others are demoted on the spot.
    pub fn get_active_key(&self, room_id: &str) -> Result<Option<RoomKeyRecord>> {
        if !valid_object_id(room_id) {
            return Err(StoreError::InvalidId);
        }

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {KEY_COLUMNS} FROM encryption_keys
             WHERE room_id = ?1 AND is_active = 1
             ORDER BY key_version DESC"
        ))?;
        let rows = stmt.query_map(params![room_id], row_to_key)?;
        let actives = rows.collect::<std::result::Result<Vec<_>, _>>()?;

        let winner = match actives.first() {
            Some(winner) => winner.clone(),
            None => return Ok(None),
        };

        if actives.len() > 1 {
            tracing::warn!(
                room_id,
                count = actives.len(),
                winner_version = winner.key_version,
                "multiple active keys found, demoting stale versions"
            );
            self.conn().execute(
                "UPDATE encryption_keys SET is_active = 0
                 WHERE room_id = ?1 AND key_version != ?2",
                params![room_id, winner.key_version],
            )?;
        }

        Ok(Some(winner))
    }

    /// Look up one version of a room's key.
    pub fn get_key_by_version(
        &self,
        room_id: &str,
        version: i64,
    ) -> Result<Option<RoomKeyRecord>> {
        if !valid_object_id(room_id) {
            return Err(StoreError::InvalidId);
        }

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {KEY_COLUMNS} FROM encryption_keys
             WHERE room_id = ?1 AND key_version = ?2"
        ))?;
        let mut rows = stmt.query_map(params![room_id, version], row_to_key)?;
        rows.next().transpose().map_err(StoreError::Sqlite)
    }

    /// Every key version for a room, newest first.
    pub fn get_all_keys(&self, room_id: &str) -> Result<Vec<RoomKeyRecord>> {
        if !valid_object_id(room_id) {
            return Err(StoreError::InvalidId);
        }

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {KEY_COLUMNS} FROM encryption_keys
             WHERE room_id = ?1 ORDER BY key_version DESC"
        ))?;
        let rows = stmt.query_map(params![room_id], row_to_key)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Delete inactive keys whose retention window has passed. Returns the
    /// number deleted.
    pub fn delete_expired_keys(&self) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM encryption_keys WHERE is_active = 0 AND expires_at < ?1",
            params![fmt_ts(Utc::now())],
        )?;
        Ok(affected)
    }

    /// Active keys whose last rotation is older than `interval`.
    pub fn keys_due_for_rotation(&self, interval: Duration) -> Result<Vec<RoomKeyRecord>> {
        let threshold = Utc::now() - interval;

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {KEY_COLUMNS} FROM encryption_keys
             WHERE is_active = 1 AND rotated_at < ?1"
        ))?;
        let rows = stmt.query_map(params![fmt_ts(threshold)], row_to_key)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomKeyRecord> {
    let created_str: String = row.get(3)?;
    let rotated_str: String = row.get(4)?;
    let expires_str: String = row.get(6)?;

    Ok(RoomKeyRecord {
        room_id: row.get(0)?,
        key_version: row.get(1)?,
        wrapped_key: row.get(2)?,
        created_at: parse_ts_col(3, &created_str)?,
        rotated_at: parse_ts_col(4, &rotated_str)?,
        is_active: row.get(5)?,
        expires_at: parse_ts_col(6, &expires_str)?,
    })
}
