//! The chat service: everything a request handler needs, wired together.
//!
//! Sending a message opens a resumable stream, runs the model in a detached
//! task and reconciles the finished turn. The HTTP response is only a
//! subscription to that stream, so a client that disconnects loses nothing
//! and can reattach through [`ChatService::resume`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::error::{with_retry, ChatError, ChatResult, RetryPolicy};
use crate::events::{EventBus, Invalidation};
use crate::ids::{generate_id, IdPrefix};
use crate::model::{Chat, Message, MessagePart, Role, Source, StreamRecord};
use crate::provider::{smooth_words, LanguageModel, ModelEvent, ModelRegistry};
use crate::search::{
    chat_document_id, message_document_id, rebuild_index, search_chats, search_messages,
    ChatSearchResult, IndexUpdate, MemoryIndex, MessageSearchResult, SearchDocument, SearchIndex,
};
use crate::storage::{Database, EventOutcome, ReconcileReport, Reconciler, UserChange, UserEvent};
use crate::stream::wire::{StreamPart, Usage};
use crate::stream::{ChunkStream, ResumeCoordinator, ResumeOutcome, StreamHub, StreamWriter};
use crate::title::PLACEHOLDER_TITLE;

pub const DEFAULT_CHAT_LIMIT: usize = 20;
pub const MAX_CHAT_LIMIT: usize = 100;

/// Shown to the client when generation fails; details stay in the logs.
const GENERATION_ERROR: &str = "Oops, an error occurred!";

/// Body of a send-message request. Every field is required; they are
/// optional here so a missing one is a validation error, not a parse error.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub message: Option<Message>,
    pub chat_id: Option<String>,
    pub model: Option<String>,
}

#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
    reconciler: Reconciler,
    hub: Arc<StreamHub>,
    resume: ResumeCoordinator,
    models: Arc<ModelRegistry>,
    search: Arc<dyn SearchIndex>,
    events: EventBus,
    retry: RetryPolicy,
    smooth_delay: Duration,
}

impl ChatService {
    pub fn new(
        db: Arc<Database>,
        hub: Arc<StreamHub>,
        models: ModelRegistry,
        grace_window: chrono::Duration,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(db.clone()),
            resume: ResumeCoordinator::new(db.clone(), hub.clone(), grace_window),
            db,
            hub,
            models: Arc::new(models),
            search: Arc::new(MemoryIndex::new()),
            events: EventBus::new(),
            retry: RetryPolicy::default(),
            smooth_delay: Duration::ZERO,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Pause between words of streamed text. Zero passes provider chunks
    /// through as they arrive.
    pub fn with_smooth_delay(mut self, delay: Duration) -> Self {
        self.smooth_delay = delay;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn hub(&self) -> &Arc<StreamHub> {
        &self.hub
    }

    /// Run a blocking store call off the async workers.
    async fn blocking<T, F>(&self, f: F) -> ChatResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> ChatResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    /// Start a model turn and return its response stream.
    pub async fn send_message(&self, user_id: &str, request: SendRequest) -> ChatResult<ChunkStream> {
        let (Some(message), Some(chat_id), Some(model_id)) = (
            request.message,
            request.chat_id.filter(|id| !id.trim().is_empty()),
            request.model.filter(|id| !id.trim().is_empty()),
        ) else {
            return Err(ChatError::validation(
                "Message and chat ID and model are required",
            ));
        };
        if message.id.trim().is_empty() {
            return Err(ChatError::validation("Message id is required"));
        }
        if message.role != Role::User {
            return Err(ChatError::validation("Only user messages can be sent"));
        }
        let model = self
            .models
            .get(&model_id)
            .ok_or_else(|| ChatError::validation(format!("Unknown model: {model_id}")))?;

        let user = user_id.to_string();
        let (chat, history, stream) = {
            let (chat_id, user, sent) = (chat_id.clone(), user.clone(), message.clone());
            self.blocking(move |db| {
                let chat = db.ensure_chat(&chat_id, &user, PLACEHOLDER_TITLE)?;
                let history = db.load_messages(&chat_id, &user)?;
                check_sent_message(&history, &sent)?;
                let stream = StreamRecord::generated(&chat_id, &user);
                db.insert_stream(&stream)?;
                Ok((chat, history, stream))
            })
            .await?
        };
        if history.is_empty() && chat.title == PLACEHOLDER_TITLE {
            self.events.publish(Invalidation::chats(&user));
        }

        let messages = append_client_message(history, message);

        let writer = self.hub.create(&stream.id);
        let body = self
            .hub
            .subscribe(&stream.id)
            .ok_or_else(|| ChatError::Transient(anyhow::anyhow!("stream {} vanished", stream.id)))?;

        tracing::info!(
            chat_id = %chat_id,
            stream_id = %stream.id,
            model = %model_id,
            history = messages.len(),
            "starting generation"
        );

        let turn = Turn {
            chat_id,
            user_id: user,
            model_id,
            messages,
        };
        let service = self.clone();
        tokio::spawn(async move { service.generate(turn, model, writer).await });

        Ok(body)
    }

    async fn generate(self, turn: Turn, model: Arc<dyn LanguageModel>, writer: StreamWriter) {
        writer.write(&StreamPart::MessageAnnotations(vec![
            json!({ "aiModel": turn.model_id }),
        ]));

        let mut reply = ReplyBuilder::new(generate_id(IdPrefix::Message));
        writer.write(&StreamPart::StartStep {
            message_id: reply.id.clone(),
        });

        let mut events = match model.stream(&turn.messages).await {
            Ok(events) if self.smooth_delay.is_zero() => events,
            Ok(events) => smooth_words(events, self.smooth_delay),
            Err(err) => {
                tracing::error!(chat_id = %turn.chat_id, "model request failed: {err:#}");
                writer.write(&StreamPart::Error(GENERATION_ERROR.to_string()));
                writer.finish();
                return;
            }
        };

        while let Some(event) = events.next().await {
            match event {
                Ok(ModelEvent::TextDelta(text)) => {
                    writer.write(&StreamPart::Text(text.clone()));
                    reply.text.push_str(&text);
                }
                Ok(ModelEvent::ReasoningDelta(text)) => {
                    writer.write(&StreamPart::Reasoning(text.clone()));
                    reply.reasoning.push_str(&text);
                }
                Ok(ModelEvent::Source(source)) => {
                    writer.write(&StreamPart::Source(source.clone()));
                    reply.sources.push(source);
                }
                Ok(ModelEvent::Finish { reason, usage }) => {
                    reply.finish = Some((reason, usage));
                }
                Err(err) => {
                    tracing::error!(chat_id = %turn.chat_id, "model stream failed: {err:#}");
                    writer.write(&StreamPart::Error(GENERATION_ERROR.to_string()));
                    writer.finish();
                    return;
                }
            }
        }

        let (finish_reason, usage) = reply
            .finish
            .clone()
            .unwrap_or_else(|| ("unknown".to_string(), Usage::default()));
        writer.write(&StreamPart::FinishStep {
            finish_reason: finish_reason.clone(),
            usage,
            is_continued: false,
        });
        writer.write(&StreamPart::FinishMessage {
            finish_reason,
            usage,
        });

        let mut messages = turn.messages;
        messages.push(reply.into_message(&turn.model_id));

        // The client already has the answer; a failed save only shows up
        // on the next history load.
        if let Err(err) = self.save(&turn.chat_id, &turn.user_id, messages).await {
            tracing::error!(chat_id = %turn.chat_id, "failed to save chat messages: {err}");
        }
        writer.finish();
    }

    /// Index every stored conversation. Run once at startup; the index lives
    /// in memory while the store survives restarts.
    pub async fn rebuild_search_index(&self) -> ChatResult<usize> {
        rebuild_index(self.db.clone(), self.search.as_ref()).await
    }

    /// Reconcile `messages` as the full history of the chat, then update the
    /// search index and notify subscribers.
    pub async fn save(
        &self,
        chat_id: &str,
        user_id: &str,
        messages: Vec<Message>,
    ) -> ChatResult<ReconcileReport> {
        let report = self.reconciler.reconcile(chat_id, user_id, messages).await?;
        self.after_reconcile(user_id, &report).await;
        Ok(report)
    }

    async fn after_reconcile(&self, user_id: &str, report: &ReconcileReport) {
        if report.chat.is_none() {
            return;
        }

        let update = IndexUpdate::from_report(report);
        let update = &update;
        let index = self.search.clone();
        let result = with_retry(&self.retry, move || {
            let index = index.clone();
            async move { update.apply(index.as_ref()).await }
        })
        .await;
        if let Err(err) = result {
            tracing::warn!(chat_id = %report.chat_id, "failed to update search index: {err:#}");
        }

        if report.changed() {
            self.events
                .publish(Invalidation::messages(user_id, &report.chat_id));
            self.events.publish(Invalidation::chats(user_id));
        }
    }

    pub async fn resume(&self, user_id: &str, chat_id: Option<&str>) -> ChatResult<ResumeOutcome> {
        let chat_id = chat_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ChatError::validation("id is required"))?;
        let outcome = self.resume.resume(chat_id, user_id).await?;
        tracing::debug!(chat_id, state = outcome.state(), "resume requested");
        Ok(outcome)
    }

    pub async fn create_chat(&self, user_id: &str) -> ChatResult<Chat> {
        let chat = Chat::generated(user_id, PLACEHOLDER_TITLE);
        {
            let chat = chat.clone();
            self.blocking(move |db| db.insert_chat(&chat)).await?;
        }
        tracing::info!(chat_id = %chat.id, user_id, "created chat");

        let doc = SearchDocument::for_chat(&chat, 0);
        if let Err(err) = self.search.upsert(vec![doc]).await {
            tracing::warn!(chat_id = %chat.id, "failed to index chat: {err:#}");
        }
        self.events.publish(Invalidation::chats(user_id));
        Ok(chat)
    }

    pub async fn list_chats(&self, user_id: &str, limit: Option<usize>) -> ChatResult<Vec<Chat>> {
        let limit = validate_limit(limit)?;
        let user = user_id.to_string();
        self.blocking(move |db| db.list_chats(&user, limit)).await
    }

    pub async fn get_chat(&self, user_id: &str, chat_id: &str) -> ChatResult<Chat> {
        let (user, chat) = (user_id.to_string(), chat_id.to_string());
        self.blocking(move |db| db.get_chat(&chat, &user))
            .await?
            .ok_or_else(|| ChatError::not_found("Chat not found"))
    }

    pub async fn messages(&self, user_id: &str, chat_id: &str) -> ChatResult<Vec<Message>> {
        self.get_chat(user_id, chat_id).await?;
        let (user, chat) = (user_id.to_string(), chat_id.to_string());
        self.blocking(move |db| db.load_messages(&chat, &user)).await
    }

    pub async fn stream_ids(&self, user_id: &str, chat_id: &str) -> ChatResult<Vec<String>> {
        self.get_chat(user_id, chat_id).await?;
        let (user, chat) = (user_id.to_string(), chat_id.to_string());
        self.blocking(move |db| db.stream_ids(&chat, &user)).await
    }

    pub async fn search_chats(
        &self,
        user_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> ChatResult<Vec<ChatSearchResult>> {
        let limit = validate_limit(limit)?;
        search_chats(self.search.as_ref(), user_id, query, limit)
            .await
            .map_err(ChatError::Transient)
    }

    pub async fn search_messages(
        &self,
        user_id: &str,
        query: &str,
        limit: Option<usize>,
        chat_id: Option<&str>,
    ) -> ChatResult<Vec<MessageSearchResult>> {
        let limit = validate_limit(limit)?;
        search_messages(self.search.as_ref(), user_id, query, limit, chat_id)
            .await
            .map_err(ChatError::Transient)
    }

    /// Apply an identity-provider event. Deleting a user also drops their
    /// search documents and tells their open feeds to refetch.
    pub async fn handle_user_event(&self, event_id: &str, event: UserEvent) -> ChatResult<EventOutcome> {
        if event_id.trim().is_empty() {
            return Err(ChatError::validation("Invalid webhook data"));
        }
        let event_type = event.event_type().to_string();
        let outcome = {
            let event_id = event_id.to_string();
            self.blocking(move |db| db.apply_user_event(&event_id, &event))
                .await?
        };

        match &outcome {
            EventOutcome::Duplicate => {
                tracing::info!(event_id, event_type = %event_type, "webhook already processed");
            }
            EventOutcome::Applied(UserChange::Skipped(reason)) => {
                tracing::warn!(event_id, event_type = %event_type, reason, "webhook skipped");
            }
            EventOutcome::Applied(UserChange::Ignored) => {
                tracing::warn!(event_id, event_type = %event_type, "unhandled webhook event type");
            }
            EventOutcome::Applied(UserChange::Deleted(purged)) => {
                let ids = purged
                    .chat_ids
                    .iter()
                    .map(|id| chat_document_id(id))
                    .chain(purged.message_ids.iter().map(|id| message_document_id(id)))
                    .collect::<Vec<_>>();
                let index = self.search.clone();
                let result = with_retry(&self.retry, || {
                    let (index, ids) = (index.clone(), ids.clone());
                    async move { index.delete(ids).await }
                })
                .await;
                if let Err(err) = result {
                    tracing::warn!(user_id = %purged.user_id, "failed to drop search documents: {err:#}");
                }
                self.events.publish(Invalidation::chats(&purged.user_id));
                tracing::info!(
                    event_id,
                    user_id = %purged.user_id,
                    chats = purged.chat_ids.len(),
                    messages = purged.message_ids.len(),
                    "deleted user"
                );
            }
            EventOutcome::Applied(change) => {
                tracing::info!(event_id, event_type = %event_type, ?change, "webhook applied");
            }
        }
        Ok(outcome)
    }
}

fn validate_limit(limit: Option<usize>) -> ChatResult<usize> {
    match limit.unwrap_or(DEFAULT_CHAT_LIMIT) {
        limit @ 1..=MAX_CHAT_LIMIT => Ok(limit),
        other => Err(ChatError::validation(format!(
            "limit must be between 1 and {MAX_CHAT_LIMIT}, got {other}"
        ))),
    }
}

/// Reject a sent message whose id is already stored, unless it is the
/// trailing user message that a client retry resends.
pub fn check_sent_message(history: &[Message], message: &Message) -> ChatResult<()> {
    match history.iter().position(|stored| stored.id == message.id) {
        None => Ok(()),
        Some(pos) if pos + 1 == history.len() && history[pos].role == Role::User => Ok(()),
        Some(_) => Err(ChatError::validation(format!(
            "Message id '{}' is already used in this chat",
            message.id
        ))),
    }
}

/// Append the client's message to the stored history. A retry resends the
/// same message, which then replaces the trailing copy.
pub fn append_client_message(mut history: Vec<Message>, message: Message) -> Vec<Message> {
    if history
        .last()
        .is_some_and(|last| last.id == message.id && last.role == Role::User)
    {
        history.pop();
    }
    history.push(message);
    history
}

struct Turn {
    chat_id: String,
    user_id: String,
    model_id: String,
    messages: Vec<Message>,
}

/// Assistant message accumulated from model events.
struct ReplyBuilder {
    id: String,
    text: String,
    reasoning: String,
    sources: Vec<Source>,
    finish: Option<(String, Usage)>,
}

impl ReplyBuilder {
    fn new(id: String) -> Self {
        Self {
            id,
            text: String::new(),
            reasoning: String::new(),
            sources: Vec::new(),
            finish: None,
        }
    }

    fn into_message(self, model_id: &str) -> Message {
        let mut parts = vec![MessagePart::StepStart];
        if !self.reasoning.is_empty() {
            parts.push(MessagePart::Reasoning {
                reasoning: self.reasoning,
                details: Vec::new(),
            });
        }
        parts.extend(
            self.sources
                .into_iter()
                .map(|source| MessagePart::Source { source }),
        );
        if !self.text.is_empty() {
            parts.push(MessagePart::Text {
                text: self.text.clone(),
            });
        }

        let mut message = Message::new(self.id, Role::Assistant, self.text)
            .with_parts(parts)
            .with_created_at(Utc::now());
        message.annotations = vec![json!({ "aiModel": model_id })];
        message
    }
}
