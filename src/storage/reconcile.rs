//! Chat history reconciliation.
//!
//! The client proposes the full conversation after a model turn; the store is
//! brought into agreement with it inside one transaction. Planning is a pure
//! function over the persisted and incoming lists so it can be tested without
//! a database.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Transaction};

use super::db::{self, json_to_db, timestamp_to_db, Database};
use crate::error::{ChatError, ChatResult};
use crate::model::{Chat, Message};
use crate::title::generate_title;

/// Writes needed to turn the persisted message set into the incoming one.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub deletes: Vec<String>,
    pub inserts: Vec<Message>,
    pub updates: Vec<Message>,
}

impl ReconcilePlan {
    /// Diff `incoming` against `persisted` by message id.
    ///
    /// Incoming ids must be unique; duplicates are rejected rather than
    /// silently collapsed. An id keeps the role it was stored with.
    pub fn compute(persisted: &[Message], incoming: &[Message]) -> ChatResult<Self> {
        let mut seen = HashSet::with_capacity(incoming.len());
        for message in incoming {
            if message.id.trim().is_empty() {
                return Err(ChatError::validation("Message id is required"));
            }
            if !seen.insert(message.id.as_str()) {
                return Err(ChatError::validation(format!(
                    "Duplicate message id '{}'",
                    message.id
                )));
            }
        }

        let existing: HashMap<&str, &Message> =
            persisted.iter().map(|m| (m.id.as_str(), m)).collect();

        let deletes = persisted
            .iter()
            .filter(|m| !seen.contains(m.id.as_str()))
            .map(|m| m.id.clone())
            .collect();

        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for message in incoming {
            match existing.get(message.id.as_str()) {
                None => inserts.push(message.clone()),
                Some(stored) if stored.role != message.role => {
                    return Err(ChatError::validation(format!(
                        "Message '{}' cannot change role from {} to {}",
                        message.id, stored.role, message.role
                    )));
                }
                Some(stored) if message.differs_from(stored) => updates.push(message.clone()),
                Some(_) => {}
            }
        }

        Ok(Self {
            deletes,
            inserts,
            updates,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn write_count(&self) -> usize {
        self.deletes.len() + self.inserts.len() + self.updates.len()
    }
}

/// Outcome of one reconciliation, consumed by side effects (search index,
/// invalidation events).
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub chat_id: String,
    /// Chat row after the transaction. `None` only for an empty input.
    pub chat: Option<Chat>,
    pub chat_created: bool,
    pub plan: ReconcilePlan,
    pub message_count: usize,
}

impl ReconcileReport {
    fn noop(chat_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            chat: None,
            chat_created: false,
            plan: ReconcilePlan::default(),
            message_count: 0,
        }
    }

    pub fn changed(&self) -> bool {
        self.chat_created || !self.plan.is_empty()
    }
}

#[derive(Clone)]
pub struct Reconciler {
    db: Arc<Database>,
}

impl Reconciler {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Make the persisted messages of `chat_id` equal `messages`.
    ///
    /// The caller has authenticated `user_id`; every query is scoped by it,
    /// and a chat id owned by another user fails as not found.
    pub async fn reconcile(
        &self,
        chat_id: &str,
        user_id: &str,
        messages: Vec<Message>,
    ) -> ChatResult<ReconcileReport> {
        if messages.is_empty() {
            return Ok(ReconcileReport::noop(chat_id));
        }

        let db = self.db.clone();
        let chat_id = chat_id.to_string();
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || {
            db.with_transaction(|tx| apply(tx, &chat_id, &user_id, &messages))
        })
        .await?
    }
}

fn apply(
    tx: &Transaction<'_>,
    chat_id: &str,
    user_id: &str,
    messages: &[Message],
) -> ChatResult<ReconcileReport> {
    let owner = db::chat_owner(tx, chat_id)?;
    if matches!(&owner, Some(owner) if owner != user_id) {
        return Err(ChatError::not_found("Chat not found"));
    }

    let persisted = db::select_messages(tx, chat_id, user_id)?;
    let plan = ReconcilePlan::compute(&persisted, messages)?;

    tracing::debug!(
        chat_id,
        deletes = plan.deletes.len(),
        inserts = plan.inserts.len(),
        updates = plan.updates.len(),
        "reconciling chat messages"
    );

    if !plan.deletes.is_empty() {
        let mut stmt =
            tx.prepare("DELETE FROM messages WHERE chat_id = ?1 AND user_id = ?2 AND id = ?3")?;
        for id in &plan.deletes {
            stmt.execute(params![chat_id, user_id, id])?;
        }
    }

    let title = generate_title(messages);
    let now = Utc::now();

    // The chat row must exist before messages reference it.
    let chat_created = owner.is_none();
    if chat_created {
        let mut chat = Chat::new(chat_id, user_id, title.clone());
        chat.created_at = now;
        chat.updated_at = now;
        db::insert_chat(tx, &chat)?;
    }

    if !plan.inserts.is_empty() {
        let mut stmt = tx.prepare(
            "INSERT INTO messages (id, chat_id, user_id, role, content, parts, annotations, attachments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for message in &plan.inserts {
            stmt.execute(params![
                message.id,
                chat_id,
                user_id,
                message.role.as_str(),
                json_to_db(&message.content)?,
                json_to_db(&message.parts)?,
                json_to_db(&message.annotations)?,
                json_to_db(&message.attachments)?,
                timestamp_to_db(&message.created_at),
            ])?;
        }
    }

    if !plan.updates.is_empty() {
        let mut stmt = tx.prepare(
            "UPDATE messages
             SET content = ?1, parts = ?2, annotations = ?3, attachments = ?4
             WHERE chat_id = ?5 AND user_id = ?6 AND id = ?7",
        )?;
        for message in &plan.updates {
            stmt.execute(params![
                json_to_db(&message.content)?,
                json_to_db(&message.parts)?,
                json_to_db(&message.annotations)?,
                json_to_db(&message.attachments)?,
                chat_id,
                user_id,
                message.id,
            ])?;
        }
    }

    if !chat_created {
        let current = db::select_chat(tx, chat_id, user_id)?
            .ok_or_else(|| ChatError::not_found("Chat not found"))?;
        // A repeat of the same list must not write anything.
        if !plan.is_empty() || current.title != title {
            tx.execute(
                "UPDATE chats SET updated_at = ?1, title = ?2 WHERE id = ?3 AND user_id = ?4",
                params![timestamp_to_db(&now), title, chat_id, user_id],
            )?;
        }
    }

    let chat = db::select_chat(tx, chat_id, user_id)?;

    Ok(ReconcileReport {
        chat_id: chat_id.to_string(),
        chat,
        chat_created,
        plan,
        message_count: messages.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessagePart, Role};

    fn msg(id: &str, role: Role, text: &str) -> Message {
        Message::new(id, role, text)
    }

    #[test]
    fn plan_splits_into_three_sets() {
        let a = msg("a", Role::User, "hi");
        let b = msg("b", Role::Assistant, "hello");
        let c = msg("c", Role::User, "bye");
        let mut c_edited = c.clone();
        c_edited.content = "bye now".into();
        let d = msg("d", Role::Assistant, "see you");

        let plan = ReconcilePlan::compute(
            &[a.clone(), b.clone(), c.clone()],
            &[a.clone(), c_edited.clone(), d.clone()],
        )
        .unwrap();

        assert_eq!(plan.deletes, vec!["b".to_string()]);
        assert_eq!(plan.inserts, vec![d]);
        assert_eq!(plan.updates, vec![c_edited]);
    }

    #[test]
    fn role_change_is_rejected() {
        let stored = msg("a", Role::Assistant, "answer");
        let incoming = msg("a", Role::User, "answer");
        let err = ReconcilePlan::compute(&[stored], &[incoming]).unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[test]
    fn identical_lists_plan_nothing() {
        let list = vec![msg("a", Role::User, "hi"), msg("b", Role::Assistant, "yo")];
        let plan = ReconcilePlan::compute(&list, &list).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.write_count(), 0);
    }

    #[test]
    fn parts_changes_are_updates() {
        let stored = msg("a", Role::Assistant, "answer");
        let incoming = stored.clone().with_parts(vec![MessagePart::Reasoning {
            reasoning: "thinking".into(),
            details: vec![],
        }]);
        let plan = ReconcilePlan::compute(&[stored], &[incoming]).unwrap();
        assert_eq!(plan.updates.len(), 1);
    }

    #[test]
    fn duplicate_incoming_ids_are_rejected() {
        let err = ReconcilePlan::compute(
            &[],
            &[msg("a", Role::User, "x"), msg("a", Role::User, "y")],
        )
        .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }
}
