//! Conversation and message persistence.
//!
//! Low-level SQL for the `conversations` and `messages` tables. Write paths
//! take a plain [`Connection`] so several of them can compose inside one
//! transaction; read-only entry points are exposed as [`Database`] methods.
//!
//! Message ordering is the `seq` column (insertion order), never the message
//! timestamp, so clock skew between devices cannot reorder a thread.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use satchel_shared::payload::Payload;
use satchel_shared::{Address, ThreadId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{ChatMessage, Conversation, ConversationStatus, Recipient, SendState};

impl Database {
    /// Load one conversation, or `None` if the thread does not exist.
    pub fn conversation(&self, thread_id: &ThreadId) -> Result<Option<Conversation>> {
        find_conversation(self.conn(), thread_id)
    }

    /// All messages of a thread, in insertion order.
    pub fn conversation_messages(&self, thread_id: &ThreadId) -> Result<Vec<ChatMessage>> {
        messages_for_thread(self.conn(), thread_id)
    }

    /// Load a single message by id.
    pub fn message_by_id(&self, id: &Uuid) -> Result<ChatMessage> {
        find_message(self.conn(), id)?.ok_or(StoreError::NotFound)
    }

    /// The thread a message belongs to.
    pub fn thread_for_message(&self, id: &Uuid) -> Result<ThreadId> {
        thread_for_message(self.conn(), id)
    }

    /// Accepted conversations with at least one message, most recently
    /// updated first.
    pub fn accepted_conversations(&self) -> Result<Vec<Conversation>> {
        list_conversations(self.conn(), true)
    }

    /// Unaccepted ("message request") conversations with at least one
    /// message, most recently updated first.
    pub fn unaccepted_conversations(&self) -> Result<Vec<Conversation>> {
        list_conversations(self.conn(), false)
    }

    /// Whether any conversation has unread messages.
    pub fn has_unread_messages(&self) -> Result<bool> {
        let unread: i64 = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM conversations WHERE unread_count > 0)",
            [],
            |row| row.get(0),
        )?;
        Ok(unread != 0)
    }
}

// ---------------------------------------------------------------------------
// Write helpers, composable inside a transaction
// ---------------------------------------------------------------------------

pub(crate) fn find_conversation(
    conn: &Connection,
    thread_id: &ThreadId,
) -> Result<Option<Conversation>> {
    let row = conn.query_row(
        "SELECT thread_id, recipient, updated_at, unread_count, is_accepted, is_muted, latest_message_id
         FROM conversations WHERE thread_id = ?1",
        params![thread_id.as_str()],
        row_to_conversation_row,
    );
    match row {
        Ok(raw) => Ok(Some(hydrate_conversation(conn, raw)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn list_conversations(conn: &Connection, accepted: bool) -> Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT c.thread_id, c.recipient, c.updated_at, c.unread_count, c.is_accepted, c.is_muted, c.latest_message_id
         FROM conversations c
         WHERE c.is_accepted = ?1
           AND EXISTS (SELECT 1 FROM messages m WHERE m.thread_id = c.thread_id)
         ORDER BY c.updated_at DESC",
    )?;
    let rows = stmt.query_map(params![accepted], row_to_conversation_row)?;

    let mut raw_rows = Vec::new();
    for row in rows {
        raw_rows.push(row?);
    }

    let mut conversations = Vec::new();
    for raw in raw_rows {
        conversations.push(hydrate_conversation(conn, raw)?);
    }
    Ok(conversations)
}

/// Insert a conversation, or overwrite every mutable field if the thread
/// already exists.
pub(crate) fn upsert_conversation(conn: &Connection, conversation: &Conversation) -> Result<()> {
    let recipient_json = serde_json::to_string(&conversation.recipient)?;
    conn.execute(
        "INSERT INTO conversations
             (thread_id, recipient, updated_at, unread_count, is_accepted, is_muted, latest_message_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(thread_id) DO UPDATE SET
             recipient = excluded.recipient,
             updated_at = excluded.updated_at,
             unread_count = excluded.unread_count,
             is_accepted = excluded.is_accepted,
             is_muted = excluded.is_muted,
             latest_message_id = excluded.latest_message_id",
        params![
            conversation.thread_id.as_str(),
            recipient_json,
            conversation.updated_at.to_rfc3339(),
            conversation.unread_count as i64,
            conversation.status.is_accepted,
            conversation.status.is_muted,
            conversation.latest_message.as_ref().map(|m| m.id.to_string()),
        ],
    )?;
    Ok(())
}

/// Insert a message, keeping its original `seq` if the id already exists.
pub(crate) fn insert_message(
    conn: &Connection,
    thread_id: &ThreadId,
    message: &ChatMessage,
) -> Result<()> {
    let payload_json = serde_json::to_string(&message.payload)?;
    conn.execute(
        "INSERT INTO messages (id, thread_id, sender, payload, send_state, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
             payload = excluded.payload,
             send_state = excluded.send_state",
        params![
            message.id.to_string(),
            thread_id.as_str(),
            message.sender.to_hex(),
            payload_json,
            message.send_state as u8,
            message.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Overwrite an existing message by identity.
pub(crate) fn update_message_row(conn: &Connection, message: &ChatMessage) -> Result<()> {
    let payload_json = serde_json::to_string(&message.payload)?;
    let affected = conn.execute(
        "UPDATE messages SET payload = ?2, send_state = ?3 WHERE id = ?1",
        params![
            message.id.to_string(),
            payload_json,
            message.send_state as u8
        ],
    )?;
    if affected == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

pub(crate) fn find_message(conn: &Connection, id: &Uuid) -> Result<Option<ChatMessage>> {
    let row = conn.query_row(
        "SELECT id, sender, payload, send_state, created_at
         FROM messages WHERE id = ?1",
        params![id.to_string()],
        row_to_message,
    );
    match row {
        Ok(message) => Ok(Some(message)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn thread_for_message(conn: &Connection, id: &Uuid) -> Result<ThreadId> {
    conn.query_row(
        "SELECT thread_id FROM messages WHERE id = ?1",
        params![id.to_string()],
        |row| row.get::<_, String>(0),
    )
    .map(ThreadId)
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    })
}

/// The last message of a thread in insertion order, if any.
pub(crate) fn tail_message(conn: &Connection, thread_id: &ThreadId) -> Result<Option<ChatMessage>> {
    let row = conn.query_row(
        "SELECT id, sender, payload, send_state, created_at
         FROM messages WHERE thread_id = ?1
         ORDER BY seq DESC LIMIT 1",
        params![thread_id.as_str()],
        row_to_message,
    );
    match row {
        Ok(message) => Ok(Some(message)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn messages_for_thread(
    conn: &Connection,
    thread_id: &ThreadId,
) -> Result<Vec<ChatMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, sender, payload, send_state, created_at
         FROM messages WHERE thread_id = ?1
         ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![thread_id.as_str()], row_to_message)?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

pub(crate) fn delete_message_row(conn: &Connection, id: &Uuid) -> Result<bool> {
    let affected = conn.execute(
        "DELETE FROM messages WHERE id = ?1",
        params![id.to_string()],
    )?;
    Ok(affected > 0)
}

/// Delete a conversation; its messages go with it via the FK cascade.
pub(crate) fn delete_conversation_row(conn: &Connection, thread_id: &ThreadId) -> Result<bool> {
    let affected = conn.execute(
        "DELETE FROM conversations WHERE thread_id = ?1",
        params![thread_id.as_str()],
    )?;
    Ok(affected > 0)
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

struct ConversationRow {
    thread_id: String,
    recipient_json: String,
    updated_at: DateTime<Utc>,
    unread_count: i64,
    is_accepted: bool,
    is_muted: bool,
    latest_message_id: Option<String>,
}

fn row_to_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    let ts_str: String = row.get(2)?;
    let updated_at = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(ConversationRow {
        thread_id: row.get(0)?,
        recipient_json: row.get(1)?,
        updated_at,
        unread_count: row.get(3)?,
        is_accepted: row.get(4)?,
        is_muted: row.get(5)?,
        latest_message_id: row.get(6)?,
    })
}

fn hydrate_conversation(conn: &Connection, raw: ConversationRow) -> Result<Conversation> {
    let recipient: Recipient = serde_json::from_str(&raw.recipient_json)?;
    let latest_message = match raw.latest_message_id {
        Some(id_str) => find_message(conn, &Uuid::parse_str(&id_str)?)?,
        None => None,
    };

    Ok(Conversation {
        thread_id: ThreadId(raw.thread_id),
        recipient,
        updated_at: raw.updated_at,
        unread_count: raw.unread_count.max(0) as u32,
        status: ConversationStatus {
            is_accepted: raw.is_accepted,
            is_muted: raw.is_muted,
        },
        latest_message,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let id_str: String = row.get(0)?;
    let sender_hex: String = row.get(1)?;
    let payload_json: String = row.get(2)?;
    let state_byte: i64 = row.get(3)?;
    let ts_str: String = row.get(4)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let sender = Address::from_hex(&sender_hex).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let payload: Payload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let send_state = SendState::from_byte(state_byte as u8).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Integer,
            format!("unknown send state {state_byte}").into(),
        )
    })?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(ChatMessage {
        id,
        sender,
        created_at,
        send_state,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db"), &[0u8; 32]).unwrap();
        (dir, db)
    }

    fn user_recipient(byte: u8) -> Recipient {
        Recipient::User(User::new(Address([byte; 32])))
    }

    fn text(sender: u8, body: &str) -> ChatMessage {
        ChatMessage::new(
            Address([sender; 32]),
            Payload::Text {
                body: body.to_string(),
            },
        )
    }

    #[test]
    fn conversation_upsert_round_trip() {
        let (_dir, db) = test_db();
        let recipient = user_recipient(1);
        let mut conversation = Conversation::new(recipient);

        upsert_conversation(db.conn(), &conversation).unwrap();
        conversation.unread_count = 3;
        conversation.status.is_accepted = true;
        upsert_conversation(db.conn(), &conversation).unwrap();

        let loaded = db.conversation(&conversation.thread_id).unwrap().unwrap();
        assert_eq!(loaded.unread_count, 3);
        assert!(loaded.status.is_accepted);
        assert_eq!(loaded.recipient, conversation.recipient);
        assert!(loaded.latest_message.is_none());
    }

    #[test]
    fn messages_keep_insertion_order_despite_timestamps() {
        let (_dir, db) = test_db();
        let conversation = Conversation::new(user_recipient(1));
        upsert_conversation(db.conn(), &conversation).unwrap();

        let now = Utc::now();
        let first = text(1, "first").with_created_at(now);
        // Skewed clock: later insert carries an earlier timestamp.
        let second = text(1, "second").with_created_at(now - chrono::Duration::hours(2));

        insert_message(db.conn(), &conversation.thread_id, &first).unwrap();
        insert_message(db.conn(), &conversation.thread_id, &second).unwrap();

        let messages = db.conversation_messages(&conversation.thread_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, first.id);
        assert_eq!(messages[1].id, second.id);

        let tail = tail_message(db.conn(), &conversation.thread_id)
            .unwrap()
            .unwrap();
        assert_eq!(tail.id, second.id);
    }

    #[test]
    fn reinserting_a_message_keeps_its_seq() {
        let (_dir, db) = test_db();
        let conversation = Conversation::new(user_recipient(1));
        upsert_conversation(db.conn(), &conversation).unwrap();

        let first = text(1, "first");
        let second = text(1, "second");
        insert_message(db.conn(), &conversation.thread_id, &first).unwrap();
        insert_message(db.conn(), &conversation.thread_id, &second).unwrap();

        // Upserting the first message again must not move it to the tail.
        let updated = first.clone().with_state(SendState::Sent);
        insert_message(db.conn(), &conversation.thread_id, &updated).unwrap();

        let messages = db.conversation_messages(&conversation.thread_id).unwrap();
        assert_eq!(messages[0].id, first.id);
        assert_eq!(messages[0].send_state, SendState::Sent);
        assert_eq!(messages[1].id, second.id);
    }

    #[test]
    fn deleting_a_conversation_cascades_to_messages() {
        let (_dir, db) = test_db();
        let conversation = Conversation::new(user_recipient(1));
        upsert_conversation(db.conn(), &conversation).unwrap();

        let message = text(1, "soon gone");
        insert_message(db.conn(), &conversation.thread_id, &message).unwrap();

        assert!(delete_conversation_row(db.conn(), &conversation.thread_id).unwrap());
        assert!(db.conversation(&conversation.thread_id).unwrap().is_none());
        assert!(matches!(
            db.message_by_id(&message.id),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn update_missing_message_is_not_found() {
        let (_dir, db) = test_db();
        let message = text(1, "never inserted");
        assert!(matches!(
            update_message_row(db.conn(), &message),
            Err(StoreError::NotFound)
        ));
    }
}
