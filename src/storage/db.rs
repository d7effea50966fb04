use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ChatError, ChatResult};
use crate::model::{Chat, Message, Role, StreamRecord};

/// SQLite-backed message store and stream registry.
///
/// Every read and write is scoped by the owning user id.
pub struct Database {
    pub conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn initialize(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY NOT NULL,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '(New Chat)',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY NOT NULL,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                parts TEXT NOT NULL,
                annotations TEXT NOT NULL,
                attachments TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS streams (
                id TEXT PRIMARY KEY NOT NULL,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                email TEXT UNIQUE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS webhook_events (
                id TEXT PRIMARY KEY NOT NULL,
                event_type TEXT NOT NULL,
                processed_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chats_user_updated
             ON chats(user_id, updated_at);

            CREATE INDEX IF NOT EXISTS idx_messages_chat_user
             ON messages(chat_id, user_id, created_at);

            CREATE INDEX IF NOT EXISTS idx_streams_chat_user
             ON streams(chat_id, user_id, created_at);",
        )?;

        Ok(())
    }

    /// Run `f` inside an immediate transaction. Any error rolls back.
    pub(crate) fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> ChatResult<T>,
    ) -> ChatResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn insert_chat(&self, chat: &Chat) -> ChatResult<()> {
        let conn = self.conn.lock();
        insert_chat(&conn, chat)
    }

    /// Return the caller's chat, creating it with `title` when no chat with
    /// this id exists. A chat owned by someone else reads as not found.
    pub fn ensure_chat(&self, chat_id: &str, user_id: &str, title: &str) -> ChatResult<Chat> {
        self.with_transaction(|tx| {
            match chat_owner(tx, chat_id)? {
                Some(owner) if owner != user_id => Err(ChatError::not_found("Chat not found")),
                Some(_) => select_chat(tx, chat_id, user_id)?
                    .ok_or_else(|| ChatError::not_found("Chat not found")),
                None => {
                    let chat = Chat::new(chat_id, user_id, title);
                    insert_chat(tx, &chat)?;
                    Ok(chat)
                }
            }
        })
    }

    pub fn get_chat(&self, chat_id: &str, user_id: &str) -> ChatResult<Option<Chat>> {
        let conn = self.conn.lock();
        select_chat(&conn, chat_id, user_id)
    }

    /// The caller's chats, most recently updated first.
    pub fn list_chats(&self, user_id: &str, limit: usize) -> ChatResult<Vec<Chat>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, created_at, updated_at
             FROM chats
             WHERE user_id = ?1
             ORDER BY updated_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let chats = stmt
            .query_map(params![user_id, limit as i64], chat_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chats)
    }

    /// Messages of a chat in creation order.
    pub fn load_messages(&self, chat_id: &str, user_id: &str) -> ChatResult<Vec<Message>> {
        let conn = self.conn.lock();
        select_messages(&conn, chat_id, user_id)
    }

    /// Every chat with its messages, across all users. Used to rebuild
    /// derived state such as the search index.
    pub fn all_conversations(&self) -> ChatResult<Vec<(Chat, Vec<Message>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, created_at, updated_at
             FROM chats ORDER BY rowid ASC",
        )?;
        let chats = stmt
            .query_map([], chat_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        chats
            .into_iter()
            .map(|chat| {
                let messages = select_messages(&conn, &chat.id, &chat.user_id)?;
                Ok((chat, messages))
            })
            .collect()
    }

    pub fn insert_stream(&self, stream: &StreamRecord) -> ChatResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO streams (id, chat_id, user_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                stream.id,
                stream.chat_id,
                stream.user_id,
                timestamp_to_db(&stream.created_at),
            ],
        )?;
        Ok(())
    }

    /// Stream ids of a chat, oldest first. The last one is the resume candidate.
    pub fn stream_ids(&self, chat_id: &str, user_id: &str) -> ChatResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM streams
             WHERE chat_id = ?1 AND user_id = ?2
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let ids = stmt
            .query_map(params![chat_id, user_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

pub(crate) fn chat_owner(conn: &Connection, chat_id: &str) -> ChatResult<Option<String>> {
    let owner = conn
        .query_row(
            "SELECT user_id FROM chats WHERE id = ?1",
            params![chat_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(owner)
}

pub(crate) fn select_chat(conn: &Connection, chat_id: &str, user_id: &str) -> ChatResult<Option<Chat>> {
    let chat = conn
        .query_row(
            "SELECT id, user_id, title, created_at, updated_at
             FROM chats WHERE id = ?1 AND user_id = ?2",
            params![chat_id, user_id],
            chat_from_row,
        )
        .optional()?;
    Ok(chat)
}

pub(crate) fn insert_chat(conn: &Connection, chat: &Chat) -> ChatResult<()> {
    conn.execute(
        "INSERT INTO chats (id, user_id, title, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            chat.id,
            chat.user_id,
            chat.title,
            timestamp_to_db(&chat.created_at),
            timestamp_to_db(&chat.updated_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn select_messages(conn: &Connection, chat_id: &str, user_id: &str) -> ChatResult<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, role, content, parts, annotations, attachments, created_at
         FROM messages
         WHERE chat_id = ?1 AND user_id = ?2
         ORDER BY created_at ASC, rowid ASC",
    )?;
    let messages = stmt
        .query_map(params![chat_id, user_id], message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: timestamp_from_db(row, 3)?,
        updated_at: timestamp_from_db(row, 4)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(1)?;
    let role = Role::parse(&role).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown role '{role}'").into(),
        )
    })?;

    Ok(Message {
        id: row.get(0)?,
        role,
        content: json_from_db(row, 2)?,
        parts: json_from_db(row, 3)?,
        annotations: json_from_db(row, 4)?,
        attachments: json_from_db(row, 5)?,
        created_at: timestamp_from_db(row, 6)?,
    })
}

/// Fixed-width RFC 3339 so lexical order matches chronological order.
pub(crate) fn timestamp_to_db(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn timestamp_from_db(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
        })
}

pub(crate) fn json_to_db<T: Serialize + ?Sized>(value: &T) -> ChatResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn json_from_db<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Attachment;

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn ensure_chat_creates_once() {
        let db = db();
        let first = db.ensure_chat("chat_a", "alice", "(New Chat)").unwrap();
        let second = db.ensure_chat("chat_a", "alice", "other").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.title, "(New Chat)");
    }

    #[test]
    fn ensure_chat_hides_foreign_chats() {
        let db = db();
        db.ensure_chat("chat_a", "alice", "mine").unwrap();
        let err = db.ensure_chat("chat_a", "mallory", "theirs").unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert!(db.get_chat("chat_a", "mallory").unwrap().is_none());
    }

    #[test]
    fn stream_ids_are_scoped_and_ordered() {
        let db = db();
        db.ensure_chat("chat_a", "alice", "t").unwrap();

        let base = Utc::now();
        for (offset, id) in [(0, "stream_1"), (1, "stream_2")] {
            db.insert_stream(&StreamRecord {
                id: id.into(),
                chat_id: "chat_a".into(),
                user_id: "alice".into(),
                created_at: base + chrono::Duration::seconds(offset),
            })
            .unwrap();
        }

        assert_eq!(db.stream_ids("chat_a", "alice").unwrap(), vec!["stream_1", "stream_2"]);
        assert!(db.stream_ids("chat_a", "mallory").unwrap().is_empty());
    }

    #[test]
    fn messages_round_trip_through_json_columns() {
        let db = db();
        db.ensure_chat("chat_a", "alice", "t").unwrap();

        let mut message = Message::new("m1", Role::User, "hello");
        message.attachments.push(Attachment {
            name: Some("a.txt".into()),
            content_type: Some("text/plain".into()),
            url: "https://bucket/a.txt".into(),
        });
        message.annotations.push(serde_json::json!({"aiModel": "echo"}));

        db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO messages (id, chat_id, user_id, role, content, parts, annotations, attachments, created_at)
                 VALUES (?1, 'chat_a', 'alice', 'user', ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id,
                    json_to_db(&message.content)?,
                    json_to_db(&message.parts)?,
                    json_to_db(&message.annotations)?,
                    json_to_db(&message.attachments)?,
                    timestamp_to_db(&message.created_at),
                ],
            )?;
            Ok(())
        })
        .unwrap();

        let loaded = db.load_messages("chat_a", "alice").unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].differs_from(&message));
        assert!(db.load_messages("chat_a", "mallory").unwrap().is_empty());
    }

    #[test]
    fn list_chats_orders_by_update() {
        let db = db();
        let mut older = Chat::new("chat_old", "alice", "old");
        older.updated_at = Utc::now() - chrono::Duration::minutes(5);
        db.insert_chat(&older).unwrap();
        db.insert_chat(&Chat::new("chat_new", "alice", "new")).unwrap();
        db.insert_chat(&Chat::new("chat_other", "bob", "bob's")).unwrap();

        let chats = db.list_chats("alice", 10).unwrap();
        let ids: Vec<_> = chats.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["chat_new", "chat_old"]);
    }
}
