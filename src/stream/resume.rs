//! Reattaching a client to a model response after it lost its connection.
//!
//! Evaluated fresh per request:
//!
//! | state              | condition                                                   | answer              |
//! |--------------------|-------------------------------------------------------------|---------------------|
//! | `NoStream`         | no stream registered for the chat                           | not found           |
//! | `Active`           | backend still holds the latest stream                       | replay/live output  |
//! | `RecentlyFinished` | backend has nothing, last message is an assistant message inside the grace window | one append event |
//! | `StaleFinished`    | anything else                                               | empty body          |
//!
//! The model is never called again from here.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};

use super::hub::{ChunkStream, ResumableBackend};
use super::wire::append_message_part;
use crate::error::{ChatError, ChatResult};
use crate::model::{Message, Role};
use crate::storage::Database;

pub const DEFAULT_GRACE_WINDOW_SECS: i64 = 15;

pub enum ResumeOutcome {
    NoStream,
    Active(ChunkStream),
    RecentlyFinished(Message),
    StaleFinished,
}

impl ResumeOutcome {
    pub fn state(&self) -> &'static str {
        match self {
            ResumeOutcome::NoStream => "no-stream",
            ResumeOutcome::Active(_) => "active",
            ResumeOutcome::RecentlyFinished(_) => "recently-finished",
            ResumeOutcome::StaleFinished => "stale-finished",
        }
    }

    /// Response body in the data-stream wire format. `None` for `NoStream`,
    /// which has no body to send.
    pub fn into_body(self) -> ChatResult<Option<ChunkStream>> {
        match self {
            ResumeOutcome::NoStream => Ok(None),
            ResumeOutcome::Active(stream) => Ok(Some(stream)),
            ResumeOutcome::RecentlyFinished(message) => {
                let chunk: Bytes = append_message_part(&message)?.encode();
                Ok(Some(stream::iter([chunk]).boxed()))
            }
            ResumeOutcome::StaleFinished => Ok(Some(stream::empty().boxed())),
        }
    }
}

impl std::fmt::Debug for ResumeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResumeOutcome::RecentlyFinished(message) => f
                .debug_tuple("RecentlyFinished")
                .field(&message.id)
                .finish(),
            other => f.write_str(other.state()),
        }
    }
}

#[derive(Clone)]
pub struct ResumeCoordinator {
    db: Arc<Database>,
    backend: Arc<dyn ResumableBackend>,
    grace_window: Duration,
}

impl ResumeCoordinator {
    pub fn new(db: Arc<Database>, backend: Arc<dyn ResumableBackend>, grace_window: Duration) -> Self {
        Self {
            db,
            backend,
            grace_window,
        }
    }

    pub async fn resume(&self, chat_id: &str, user_id: &str) -> ChatResult<ResumeOutcome> {
        self.resume_at(chat_id, user_id, Utc::now()).await
    }

    /// Decide the outcome for a resume requested at `requested_at`.
    ///
    /// A chat owned by someone else has no streams visible to `user_id` and
    /// therefore answers `NoStream`, exactly like a missing chat.
    pub async fn resume_at(
        &self,
        chat_id: &str,
        user_id: &str,
        requested_at: DateTime<Utc>,
    ) -> ChatResult<ResumeOutcome> {
        let stream_ids = {
            let db = self.db.clone();
            let (chat_id, user_id) = (chat_id.to_string(), user_id.to_string());
            tokio::task::spawn_blocking(move || db.stream_ids(&chat_id, &user_id))
                .await?
                .map_err(|err| match err {
                    ChatError::Store(err) => ChatError::Transient(err),
                    other => other,
                })?
        };

        let Some(latest) = stream_ids.last() else {
            return Ok(ResumeOutcome::NoStream);
        };

        match self.backend.resume(latest).await {
            Ok(Some(stream)) => {
                tracing::debug!(chat_id, stream_id = %latest, "resuming active stream");
                return Ok(ResumeOutcome::Active(stream));
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(chat_id, stream_id = %latest, "resumable backend lookup failed: {err:#}");
            }
        }

        let messages = {
            let db = self.db.clone();
            let (chat_id, user_id) = (chat_id.to_string(), user_id.to_string());
            tokio::task::spawn_blocking(move || db.load_messages(&chat_id, &user_id)).await?
        };

        let messages = match messages {
            Ok(messages) => messages,
            Err(err) => {
                tracing::warn!(chat_id, "could not load messages for resume: {err}");
                return Ok(ResumeOutcome::StaleFinished);
            }
        };

        Ok(classify_finished(messages.last(), requested_at, self.grace_window))
    }
}

/// Outcome once the backend holds nothing for the latest stream.
pub fn classify_finished(
    latest: Option<&Message>,
    requested_at: DateTime<Utc>,
    grace_window: Duration,
) -> ResumeOutcome {
    match latest {
        Some(message)
            if message.role == Role::Assistant
                && requested_at - message.created_at <= grace_window =>
        {
            ResumeOutcome::RecentlyFinished(message.clone())
        }
        _ => ResumeOutcome::StaleFinished,
    }
}
