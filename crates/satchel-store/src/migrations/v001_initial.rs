//! v001 -- Initial schema creation.
//!
//! Creates the two core tables: `conversations` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    thread_id         TEXT PRIMARY KEY NOT NULL,  -- peer address hex (1:1) or group id hex
    recipient         TEXT NOT NULL,              -- JSON snapshot of the Recipient
    updated_at        TEXT NOT NULL,              -- ISO-8601 / RFC-3339
    unread_count      INTEGER NOT NULL DEFAULT 0,
    is_accepted       INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    is_muted          INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    latest_message_id TEXT                        -- nullable, recomputed on delete
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated
    ON conversations(updated_at DESC);

CREATE INDEX IF NOT EXISTS idx_conversations_unread
    ON conversations(unread_count);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT, -- insertion order, never reused
    id         TEXT NOT NULL UNIQUE,              -- UUID v4
    thread_id  TEXT NOT NULL,                     -- FK -> conversations(thread_id)
    sender     TEXT NOT NULL,                     -- hex-encoded 32-byte address
    payload    TEXT NOT NULL,                     -- JSON message body
    send_state INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,                     -- ISO-8601

    FOREIGN KEY (thread_id) REFERENCES conversations(thread_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_thread_seq
    ON messages(thread_id, seq);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
