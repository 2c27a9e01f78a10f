//! v001 -- Initial schema creation.
//!
//! Creates the three durable collections (`chat_rooms`, `messages`,
//! `encryption_keys`) plus the child tables that render the embedded
//! member and receipt arrays relationally.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Chat rooms
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_rooms (
    id                    TEXT PRIMARY KEY NOT NULL,  -- 24-hex object id
    name                  TEXT NOT NULL,
    type                  TEXT NOT NULL,              -- 'direct' | 'group'
    owner_id              TEXT NOT NULL,
    allow_invite          INTEGER NOT NULL DEFAULT 1,
    allow_edit_messages   INTEGER NOT NULL DEFAULT 1,
    allow_delete_messages INTEGER NOT NULL DEFAULT 1,
    allow_pin_messages    INTEGER NOT NULL DEFAULT 1,
    max_members           INTEGER NOT NULL DEFAULT 1000,
    welcome_message       TEXT NOT NULL DEFAULT '',
    created_at            TEXT NOT NULL,              -- RFC-3339, micros
    updated_at            TEXT NOT NULL,
    last_message_at       TEXT NOT NULL,
    last_message          TEXT NOT NULL DEFAULT '',   -- envelope or plaintext sentinel
    last_message_time     TEXT
);

CREATE INDEX IF NOT EXISTS idx_rooms_type ON chat_rooms(type);
CREATE INDEX IF NOT EXISTS idx_rooms_owner ON chat_rooms(owner_id);
CREATE INDEX IF NOT EXISTS idx_rooms_last_message_at ON chat_rooms(last_message_at DESC);
CREATE INDEX IF NOT EXISTS idx_rooms_created_at ON chat_rooms(created_at DESC);

-- ----------------------------------------------------------------
-- Room members (embedded array rendered as a child table)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS room_members (
    room_id      TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    display_name TEXT NOT NULL DEFAULT '',
    role         TEXT NOT NULL DEFAULT 'member',
    status       TEXT NOT NULL DEFAULT 'active',
    joined_at    TEXT NOT NULL,
    last_seen    TEXT NOT NULL,
    last_read_at TEXT NOT NULL,

    PRIMARY KEY (room_id, user_id),
    FOREIGN KEY (room_id) REFERENCES chat_rooms(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_room_members_user ON room_members(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id             TEXT PRIMARY KEY NOT NULL,  -- 24-hex object id
    room_id        TEXT NOT NULL,
    sender_id      TEXT NOT NULL,              -- 'system' for membership events
    content        TEXT NOT NULL,              -- ciphertext except for system messages
    type           TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'sent',
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    key_version    INTEGER,                    -- DEK version the content is sealed under
    metadata       TEXT,                       -- JSON, file/image/location payload
    reply_to       TEXT,
    forwarded_from TEXT,

    FOREIGN KEY (room_id) REFERENCES chat_rooms(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_room_created ON messages(room_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_messages_sender_created ON messages(sender_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_messages_type ON messages(type);

-- ----------------------------------------------------------------
-- Read / delivery receipts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_reads (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    read_at    TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_message_reads_user ON message_reads(user_id);

CREATE TABLE IF NOT EXISTS message_deliveries (
    message_id   TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    delivered_at TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_message_deliveries_user ON message_deliveries(user_id);

-- ----------------------------------------------------------------
-- Wrapped room keys
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS encryption_keys (
    room_id     TEXT NOT NULL,
    key_version INTEGER NOT NULL,
    wrapped_key TEXT NOT NULL,                 -- base64(IV || DEK under KEK)
    created_at  TEXT NOT NULL,
    rotated_at  TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 0,
    expires_at  TEXT NOT NULL,

    PRIMARY KEY (room_id, key_version)
);

CREATE INDEX IF NOT EXISTS idx_keys_room_active ON encryption_keys(room_id, is_active);
CREATE INDEX IF NOT EXISTS idx_keys_expires ON encryption_keys(expires_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
