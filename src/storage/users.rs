//! Users mirrored from identity-provider webhooks.
//!
//! Every event is applied at most once: its id is claimed in
//! `webhook_events` inside the same transaction as the user write, so a
//! failed event leaves no claim behind and a redelivered one is skipped.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;

use super::db::{timestamp_from_db, timestamp_to_db, Database};
use crate::error::{ChatError, ChatResult};
use crate::model::User;

/// Claims older than this are forgotten, so a very late redelivery is
/// applied again.
pub const EVENT_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    Created(UserProfile),
    Updated(UserProfile),
    Deleted { user_id: String },
    /// Any other event type; recorded and otherwise ignored.
    Unhandled(String),
}

#[derive(Deserialize)]
struct WebhookBody {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: WebhookUser,
}

#[derive(Default, Deserialize)]
struct WebhookUser {
    id: Option<String>,
    #[serde(default)]
    email_addresses: Vec<EmailAddress>,
    first_name: Option<String>,
    last_name: Option<String>,
    /// Milliseconds since the epoch.
    created_at: Option<i64>,
    updated_at: Option<i64>,
}

#[derive(Deserialize)]
struct EmailAddress {
    email_address: String,
}

impl UserEvent {
    /// Parse an identity-provider webhook body.
    pub fn from_payload(body: &[u8]) -> ChatResult<Self> {
        let body: WebhookBody = serde_json::from_slice(body)
            .map_err(|err| ChatError::validation(format!("Invalid webhook data: {err}")))?;

        let user_id = || {
            body.data
                .id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| ChatError::validation("Missing user ID in webhook data"))
        };

        Ok(match body.event_type.as_str() {
            "user.created" => UserEvent::Created(body.data.profile(user_id()?)),
            "user.updated" => UserEvent::Updated(body.data.profile(user_id()?)),
            "user.deleted" => UserEvent::Deleted { user_id: user_id()? },
            other => UserEvent::Unhandled(other.to_string()),
        })
    }

    pub fn event_type(&self) -> &str {
        match self {
            UserEvent::Created(_) => "user.created",
            UserEvent::Updated(_) => "user.updated",
            UserEvent::Deleted { .. } => "user.deleted",
            UserEvent::Unhandled(kind) => kind,
        }
    }
}

impl WebhookUser {
    fn profile(&self, id: String) -> UserProfile {
        let first = self.first_name.as_deref().unwrap_or("");
        let last = self.last_name.as_deref().unwrap_or("");
        let name = if last.is_empty() {
            first.trim().to_string()
        } else {
            format!("{first} {last}").trim().to_string()
        };

        UserProfile {
            id,
            name,
            email: self
                .email_addresses
                .first()
                .map(|address| address.email_address.clone())
                .filter(|email| !email.is_empty()),
            created_at: self.created_at.and_then(DateTime::from_timestamp_millis),
            updated_at: self.updated_at.and_then(DateTime::from_timestamp_millis),
        }
    }
}

/// What a user deletion removed, so derived state can follow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgedUser {
    pub user_id: String,
    pub chat_ids: Vec<String>,
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserChange {
    Created,
    Updated,
    Deleted(PurgedUser),
    /// Nothing written; the reason is logged by the caller.
    Skipped(&'static str),
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// The event id was already processed.
    Duplicate,
    Applied(UserChange),
}

impl Database {
    pub fn get_user(&self, user_id: &str) -> ChatResult<Option<User>> {
        let conn = self.conn.lock();
        select_user(&conn, user_id)
    }

    /// Apply `event` unless `event_id` was already processed.
    pub fn apply_user_event(&self, event_id: &str, event: &UserEvent) -> ChatResult<EventOutcome> {
        let now = Utc::now();
        self.with_transaction(|tx| {
            tx.execute(
                "DELETE FROM webhook_events WHERE processed_at < ?1",
                params![timestamp_to_db(&(now - Duration::days(EVENT_RETENTION_DAYS)))],
            )?;
            let claimed = tx.execute(
                "INSERT OR IGNORE INTO webhook_events (id, event_type, processed_at)
                 VALUES (?1, ?2, ?3)",
                params![event_id, event.event_type(), timestamp_to_db(&now)],
            )?;
            if claimed == 0 {
                return Ok(EventOutcome::Duplicate);
            }

            let change = match event {
                UserEvent::Created(profile) => create_user(tx, profile, now)?,
                UserEvent::Updated(profile) => update_user(tx, profile, now)?,
                UserEvent::Deleted { user_id } => purge_user(tx, user_id)?,
                UserEvent::Unhandled(_) => UserChange::Ignored,
            };
            Ok(EventOutcome::Applied(change))
        })
    }
}

fn create_user(conn: &Connection, profile: &UserProfile, now: DateTime<Utc>) -> ChatResult<UserChange> {
    if select_user(conn, &profile.id)?.is_some() {
        return Ok(UserChange::Skipped("user already exists"));
    }
    if let Some(email) = &profile.email {
        if email_owner(conn, email)?.is_some() {
            return Ok(UserChange::Skipped("email already in use"));
        }
    }
    insert_user(conn, profile, now)?;
    Ok(UserChange::Created)
}

fn update_user(conn: &Connection, profile: &UserProfile, now: DateTime<Utc>) -> ChatResult<UserChange> {
    let owner = match &profile.email {
        Some(email) => email_owner(conn, email)?,
        None => None,
    };

    if select_user(conn, &profile.id)?.is_none() {
        if owner.is_some() {
            return Ok(UserChange::Skipped("email already in use"));
        }
        insert_user(conn, profile, now)?;
        return Ok(UserChange::Created);
    }

    // The email moves only if nobody else holds it.
    let email = profile
        .email
        .as_deref()
        .filter(|_| owner.as_deref().map_or(true, |owner| owner == profile.id));
    conn.execute(
        "UPDATE users SET name = ?2, email = COALESCE(?3, email), updated_at = ?4 WHERE id = ?1",
        params![
            profile.id,
            profile.name,
            email,
            timestamp_to_db(&profile.updated_at.unwrap_or(now)),
        ],
    )?;
    Ok(UserChange::Updated)
}

/// Remove the user together with every chat, message and stream they own.
fn purge_user(conn: &Connection, user_id: &str) -> ChatResult<UserChange> {
    let ids = |sql: &str| -> ChatResult<Vec<String>> {
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    };
    let purged = PurgedUser {
        user_id: user_id.to_string(),
        chat_ids: ids("SELECT id FROM chats WHERE user_id = ?1 ORDER BY rowid")?,
        message_ids: ids("SELECT id FROM messages WHERE user_id = ?1 ORDER BY rowid")?,
    };

    conn.execute("DELETE FROM messages WHERE user_id = ?1", params![user_id])?;
    conn.execute("DELETE FROM streams WHERE user_id = ?1", params![user_id])?;
    conn.execute("DELETE FROM chats WHERE user_id = ?1", params![user_id])?;
    let users = conn.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;

    if users == 0 && purged.chat_ids.is_empty() {
        return Ok(UserChange::Skipped("user not found"));
    }
    Ok(UserChange::Deleted(purged))
}

fn insert_user(conn: &Connection, profile: &UserProfile, now: DateTime<Utc>) -> ChatResult<()> {
    conn.execute(
        "INSERT INTO users (id, name, email, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            profile.id,
            profile.name,
            profile.email,
            timestamp_to_db(&profile.created_at.unwrap_or(now)),
            timestamp_to_db(&profile.updated_at.unwrap_or(now)),
        ],
    )?;
    Ok(())
}

fn email_owner(conn: &Connection, email: &str) -> ChatResult<Option<String>> {
    let owner = conn
        .query_row("SELECT id FROM users WHERE email = ?1", params![email], |row| {
            row.get::<_, String>(0)
        })
        .optional()?;
    Ok(owner)
}

fn select_user(conn: &Connection, user_id: &str) -> ChatResult<Option<User>> {
    let user = conn
        .query_row(
            "SELECT id, name, email, created_at, updated_at FROM users WHERE id = ?1",
            params![user_id],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        created_at: timestamp_from_db(row, 3)?,
        updated_at: timestamp_from_db(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::{Message, Role, StreamRecord};
    use crate::storage::Reconciler;

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn profile(id: &str, name: &str, email: Option<&str>) -> UserProfile {
        UserProfile {
            id: id.into(),
            name: name.into(),
            email: email.map(str::to_string),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn parses_identity_provider_payloads() {
        let body = br#"{
            "type": "user.created",
            "data": {
                "id": "user_1",
                "email_addresses": [{"email_address": "ada@example.com"}],
                "first_name": "Ada",
                "last_name": "Lovelace",
                "created_at": 1700000000000,
                "updated_at": 1700000000000
            }
        }"#;
        let UserEvent::Created(profile) = UserEvent::from_payload(body).unwrap() else {
            panic!("expected user.created");
        };
        assert_eq!(profile.name, "Ada Lovelace");
        assert_eq!(profile.email.as_deref(), Some("ada@example.com"));
        assert_eq!(profile.created_at.unwrap().timestamp(), 1_700_000_000);

        let first_only = br#"{"type":"user.updated","data":{"id":"u","first_name":" Ada "}}"#;
        let UserEvent::Updated(profile) = UserEvent::from_payload(first_only).unwrap() else {
            panic!("expected user.updated");
        };
        assert_eq!(profile.name, "Ada");
        assert_eq!(profile.email, None);

        let other = br#"{"type":"session.created","data":{}}"#;
        assert_eq!(
            UserEvent::from_payload(other).unwrap(),
            UserEvent::Unhandled("session.created".into())
        );
    }

    #[test]
    fn user_events_require_an_id() {
        let body = br#"{"type":"user.deleted","data":{}}"#;
        assert!(matches!(
            UserEvent::from_payload(body),
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            UserEvent::from_payload(b"not json"),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn events_are_applied_once() {
        let db = db();
        let event = UserEvent::Created(profile("alice", "Alice", Some("a@example.com")));

        assert_eq!(
            db.apply_user_event("evt_1", &event).unwrap(),
            EventOutcome::Applied(UserChange::Created)
        );
        assert_eq!(db.apply_user_event("evt_1", &event).unwrap(), EventOutcome::Duplicate);
        assert_eq!(
            db.apply_user_event("evt_2", &event).unwrap(),
            EventOutcome::Applied(UserChange::Skipped("user already exists"))
        );
        assert_eq!(db.get_user("alice").unwrap().unwrap().name, "Alice");
    }

    #[test]
    fn duplicate_email_is_skipped_on_create() {
        let db = db();
        db.apply_user_event("e1", &UserEvent::Created(profile("alice", "A", Some("x@example.com"))))
            .unwrap();
        let outcome = db
            .apply_user_event("e2", &UserEvent::Created(profile("bob", "B", Some("x@example.com"))))
            .unwrap();
        assert_eq!(outcome, EventOutcome::Applied(UserChange::Skipped("email already in use")));
        assert!(db.get_user("bob").unwrap().is_none());
    }

    #[test]
    fn update_creates_missing_users_and_keeps_taken_emails() {
        let db = db();
        assert_eq!(
            db.apply_user_event("e1", &UserEvent::Updated(profile("alice", "Alice", Some("a@example.com"))))
                .unwrap(),
            EventOutcome::Applied(UserChange::Created)
        );
        db.apply_user_event("e2", &UserEvent::Created(profile("bob", "Bob", Some("b@example.com"))))
            .unwrap();

        let outcome = db
            .apply_user_event("e3", &UserEvent::Updated(profile("bob", "Robert", Some("a@example.com"))))
            .unwrap();
        assert_eq!(outcome, EventOutcome::Applied(UserChange::Updated));
        let bob = db.get_user("bob").unwrap().unwrap();
        assert_eq!(bob.name, "Robert");
        assert_eq!(bob.email.as_deref(), Some("b@example.com"));

        db.apply_user_event("e4", &UserEvent::Updated(profile("bob", "Robert", Some("r@example.com"))))
            .unwrap();
        assert_eq!(
            db.get_user("bob").unwrap().unwrap().email.as_deref(),
            Some("r@example.com")
        );
    }

    #[tokio::test]
    async fn deleting_a_user_removes_only_their_data() {
        let db = Arc::new(db());
        db.apply_user_event("e1", &UserEvent::Created(profile("alice", "Alice", None)))
            .unwrap();

        let reconciler = Reconciler::new(db.clone());
        reconciler
            .reconcile("chat_a", "alice", vec![Message::new("m1", Role::User, "hi")])
            .await
            .unwrap();
        reconciler
            .reconcile("chat_b", "bob", vec![Message::new("m2", Role::User, "hey")])
            .await
            .unwrap();
        db.insert_stream(&StreamRecord::generated("chat_a", "alice")).unwrap();

        let outcome = db
            .apply_user_event("e2", &UserEvent::Deleted { user_id: "alice".into() })
            .unwrap();
        let EventOutcome::Applied(UserChange::Deleted(purged)) = outcome else {
            panic!("expected a deletion, got {outcome:?}");
        };
        assert_eq!(purged.chat_ids, vec!["chat_a"]);
        assert_eq!(purged.message_ids, vec!["m1"]);

        assert!(db.get_user("alice").unwrap().is_none());
        assert!(db.get_chat("chat_a", "alice").unwrap().is_none());
        assert!(db.stream_ids("chat_a", "alice").unwrap().is_empty());
        assert_eq!(db.load_messages("chat_b", "bob").unwrap().len(), 1);

        assert_eq!(
            db.apply_user_event("e3", &UserEvent::Deleted { user_id: "alice".into() })
                .unwrap(),
            EventOutcome::Applied(UserChange::Skipped("user not found"))
        );
    }

    #[test]
    fn expired_claims_are_forgotten() {
        let db = db();
        let old = Utc::now() - Duration::days(EVENT_RETENTION_DAYS + 1);
        db.conn
            .lock()
            .execute(
                "INSERT INTO webhook_events (id, event_type, processed_at) VALUES ('e1', 'user.created', ?1)",
                params![timestamp_to_db(&old)],
            )
            .unwrap();

        let outcome = db
            .apply_user_event("e1", &UserEvent::Unhandled("email.created".into()))
            .unwrap();
        assert_eq!(outcome, EventOutcome::Applied(UserChange::Ignored));
    }
}
