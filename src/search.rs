//! Full-text search over chats and messages.
//!
//! Reconciliation feeds the index; queries are always filtered by the
//! requesting user. [`SearchIndex`] is the seam a hosted search service plugs
//! into; [`MemoryIndex`] is the in-process default.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};
use crate::model::{Chat, Message};
use crate::storage::{Database, ReconcileReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Chat,
    Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocument {
    pub id: String,
    pub kind: DocumentKind,
    pub user_id: String,
    pub chat_id: String,
    /// Searchable text: the title for chats, canonical text for messages.
    pub content: String,
    pub chat_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn chat_document_id(chat_id: &str) -> String {
    format!("chat_{chat_id}")
}

pub fn message_document_id(message_id: &str) -> String {
    format!("msg_{message_id}")
}

impl SearchDocument {
    pub fn for_chat(chat: &Chat, message_count: usize) -> Self {
        Self {
            id: chat_document_id(&chat.id),
            kind: DocumentKind::Chat,
            user_id: chat.user_id.clone(),
            chat_id: chat.id.clone(),
            content: chat.title.clone(),
            chat_title: chat.title.clone(),
            message_id: None,
            role: None,
            message_count: Some(message_count),
            created_at: chat.created_at,
            updated_at: chat.updated_at,
        }
    }

    pub fn for_message(message: &Message, chat: &Chat) -> Self {
        Self {
            id: message_document_id(&message.id),
            kind: DocumentKind::Message,
            user_id: chat.user_id.clone(),
            chat_id: chat.id.clone(),
            content: message.canonical_text(),
            chat_title: chat.title.clone(),
            message_id: Some(message.id.clone()),
            role: Some(message.role.as_str().to_string()),
            message_count: None,
            created_at: message.created_at,
            updated_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub user_id: String,
    pub kind: Option<DocumentKind>,
    pub chat_id: Option<String>,
}

impl SearchFilter {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    fn matches(&self, doc: &SearchDocument) -> bool {
        doc.user_id == self.user_id
            && self.kind.map_or(true, |kind| doc.kind == kind)
            && self
                .chat_id
                .as_deref()
                .map_or(true, |chat_id| doc.chat_id == chat_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub document: SearchDocument,
    pub score: f32,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, documents: Vec<SearchDocument>) -> anyhow::Result<()>;

    async fn delete(&self, ids: Vec<String>) -> anyhow::Result<()>;

    /// Hits with a positive score, best first.
    async fn search(
        &self,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<SearchHit>>;

    /// Documents matching `filter`, most recently updated first.
    async fn list(&self, filter: &SearchFilter, limit: usize) -> anyhow::Result<Vec<SearchDocument>>;
}

/// Term-overlap index held in memory.
#[derive(Default)]
pub struct MemoryIndex {
    documents: RwLock<BTreeMap<String, SearchDocument>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<SearchDocument> {
        self.documents.read().get(id).cloned()
    }
}

fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of query terms present in the document, plus a bonus when the
/// whole query appears verbatim.
fn score(query: &str, query_terms: &[String], doc: &SearchDocument) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let haystack = format!("{} {}", doc.content, doc.chat_title).to_lowercase();
    let doc_terms = terms(&haystack);
    let matched = query_terms
        .iter()
        .filter(|term| doc_terms.iter().any(|t| t.starts_with(term.as_str())))
        .count();
    if matched == 0 {
        return 0.0;
    }
    let mut score = matched as f32 / query_terms.len() as f32;
    if haystack.contains(&query.trim().to_lowercase()) {
        score += 0.5;
    }
    score
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn upsert(&self, documents: Vec<SearchDocument>) -> anyhow::Result<()> {
        let mut store = self.documents.write();
        for doc in documents {
            store.insert(doc.id.clone(), doc);
        }
        Ok(())
    }

    async fn delete(&self, ids: Vec<String>) -> anyhow::Result<()> {
        let mut store = self.documents.write();
        for id in ids {
            store.remove(&id);
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let query_terms = terms(query);
        let store = self.documents.read();
        let mut hits: Vec<SearchHit> = store
            .values()
            .filter(|doc| filter.matches(doc))
            .filter_map(|doc| {
                let score = score(query, &query_terms, doc);
                (score > 0.0).then(|| SearchHit {
                    document: doc.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.document.updated_at.cmp(&a.document.updated_at))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn list(&self, filter: &SearchFilter, limit: usize) -> anyhow::Result<Vec<SearchDocument>> {
        let store = self.documents.read();
        let mut docs: Vec<SearchDocument> = store
            .values()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        docs.truncate(limit);
        Ok(docs)
    }
}

/// Every document for one stored conversation.
pub fn conversation_documents(chat: &Chat, messages: &[Message]) -> Vec<SearchDocument> {
    let mut docs = vec![SearchDocument::for_chat(chat, messages.len())];
    docs.extend(
        messages
            .iter()
            .filter(|message| !message.canonical_text().trim().is_empty())
            .map(|message| SearchDocument::for_message(message, chat)),
    );
    docs
}

/// Load every stored conversation into `index`. Returns the number of
/// documents written.
pub async fn rebuild_index(db: Arc<Database>, index: &dyn SearchIndex) -> ChatResult<usize> {
    let conversations = tokio::task::spawn_blocking(move || db.all_conversations()).await??;

    let mut written = 0;
    for (chat, messages) in &conversations {
        let docs = conversation_documents(chat, messages);
        written += docs.len();
        index.upsert(docs).await.map_err(ChatError::Transient)?;
    }
    Ok(written)
}

/// Remove every document owned by `user_id`.
pub async fn purge_user(index: &dyn SearchIndex, user_id: &str) -> anyhow::Result<usize> {
    let docs = index.list(&SearchFilter::user(user_id), usize::MAX).await?;
    let ids: Vec<String> = docs.into_iter().map(|doc| doc.id).collect();
    let removed = ids.len();
    if removed > 0 {
        index.delete(ids).await?;
    }
    Ok(removed)
}

/// Index writes implied by one reconciliation.
#[derive(Debug, Default)]
pub struct IndexUpdate {
    pub upserts: Vec<SearchDocument>,
    pub deletes: Vec<String>,
}

impl IndexUpdate {
    pub fn from_report(report: &ReconcileReport) -> Self {
        let Some(chat) = &report.chat else {
            return Self::default();
        };

        let mut upserts = vec![SearchDocument::for_chat(chat, report.message_count)];
        upserts.extend(
            report
                .plan
                .inserts
                .iter()
                .chain(&report.plan.updates)
                .filter(|message| !message.canonical_text().trim().is_empty())
                .map(|message| SearchDocument::for_message(message, chat)),
        );

        let deletes = report
            .plan
            .deletes
            .iter()
            .map(|id| message_document_id(id))
            .collect();

        Self { upserts, deletes }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    pub async fn apply(&self, index: &dyn SearchIndex) -> anyhow::Result<()> {
        if !self.deletes.is_empty() {
            index.delete(self.deletes.clone()).await?;
        }
        if !self.upserts.is_empty() {
            index.upsert(self.upserts.clone()).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSearchResult {
    pub chat_id: String,
    pub title: String,
    /// Message text that matched, when the best hit was a message.
    pub matched_content: Option<String>,
    pub matched_role: Option<String>,
    pub score: f32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSearchResult {
    pub message_id: Option<String>,
    pub chat_id: String,
    pub chat_title: String,
    pub content: String,
    pub role: Option<String>,
    pub created_at: DateTime<Utc>,
    pub score: f32,
}

/// Search the caller's chats and messages, keeping the best hit per chat.
/// An empty query lists chat documents instead.
pub async fn search_chats(
    index: &dyn SearchIndex,
    user_id: &str,
    query: &str,
    limit: usize,
) -> anyhow::Result<Vec<ChatSearchResult>> {
    if query.trim().is_empty() {
        let filter = SearchFilter {
            kind: Some(DocumentKind::Chat),
            ..SearchFilter::user(user_id)
        };
        let docs = index.list(&filter, limit).await?;
        return Ok(docs
            .into_iter()
            .map(|doc| ChatSearchResult {
                chat_id: doc.chat_id,
                title: doc.chat_title,
                matched_content: None,
                matched_role: None,
                score: 0.0,
                updated_at: doc.updated_at,
            })
            .collect());
    }

    // Over-fetch so grouping still leaves `limit` chats.
    let hits = index
        .search(query, &SearchFilter::user(user_id), limit.saturating_mul(3))
        .await?;

    let mut best: HashMap<String, ChatSearchResult> = HashMap::new();
    for hit in hits {
        let doc = hit.document;
        let is_message = doc.kind == DocumentKind::Message;
        let candidate = ChatSearchResult {
            chat_id: doc.chat_id.clone(),
            title: doc.chat_title,
            matched_content: is_message.then(|| doc.content.clone()),
            matched_role: if is_message { doc.role } else { None },
            score: hit.score,
            updated_at: doc.updated_at,
        };
        match best.get(&doc.chat_id) {
            Some(existing) if existing.score >= candidate.score => {}
            _ => {
                best.insert(doc.chat_id, candidate);
            }
        }
    }

    let mut results: Vec<ChatSearchResult> = best.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
    });
    results.truncate(limit);
    Ok(results)
}

pub async fn search_messages(
    index: &dyn SearchIndex,
    user_id: &str,
    query: &str,
    limit: usize,
    chat_id: Option<&str>,
) -> anyhow::Result<Vec<MessageSearchResult>> {
    let filter = SearchFilter {
        kind: Some(DocumentKind::Message),
        chat_id: chat_id.map(str::to_string),
        ..SearchFilter::user(user_id)
    };

    let hits = index.search(query, &filter, limit).await?;
    Ok(hits
        .into_iter()
        .map(|hit| MessageSearchResult {
            message_id: hit.document.message_id,
            chat_id: hit.document.chat_id,
            chat_title: hit.document.chat_title,
            content: hit.document.content,
            role: hit.document.role,
            created_at: hit.document.created_at,
            score: hit.score,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    async fn seeded() -> MemoryIndex {
        let index = MemoryIndex::new();
        let rust = Chat::new("chat_rust", "alice", "Rust lifetimes");
        let cooking = Chat::new("chat_cook", "alice", "Dinner ideas");
        let foreign = Chat::new("chat_bob", "bob", "Rust for bob");

        index
            .upsert(vec![
                SearchDocument::for_chat(&rust, 2),
                SearchDocument::for_message(
                    &Message::new("m1", Role::User, "explain borrow checker lifetimes"),
                    &rust,
                ),
                SearchDocument::for_message(
                    &Message::new("m2", Role::Assistant, "lifetimes name regions of borrows"),
                    &rust,
                ),
                SearchDocument::for_chat(&cooking, 1),
                SearchDocument::for_message(&Message::new("m3", Role::User, "pasta with garlic"), &cooking),
                SearchDocument::for_chat(&foreign, 0),
            ])
            .await
            .unwrap();
        index
    }

    #[tokio::test]
    async fn chat_search_groups_by_chat() {
        let index = seeded().await;
        let results = search_chats(&index, "alice", "lifetimes", 10).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chat_id, "chat_rust");
    }

    #[tokio::test]
    async fn chat_search_is_scoped_to_the_user() {
        let index = seeded().await;
        let results = search_chats(&index, "alice", "bob", 10).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn empty_query_lists_chats() {
        let index = seeded().await;
        let results = search_chats(&index, "alice", "  ", 10).await.unwrap();
        let mut ids: Vec<_> = results.iter().map(|r| r.chat_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["chat_cook", "chat_rust"]);
    }

    #[tokio::test]
    async fn message_search_can_target_one_chat() {
        let index = seeded().await;
        let hits = search_messages(&index, "alice", "garlic", 10, Some("chat_rust"))
            .await
            .unwrap();
        assert!(hits.is_empty());

        let hits = search_messages(&index, "alice", "garlic", 10, Some("chat_cook"))
            .await
            .unwrap();
        assert_eq!(hits[0].message_id.as_deref(), Some("m3"));
        assert_eq!(hits[0].role.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn purge_removes_only_that_users_documents() {
        let index = seeded().await;
        assert_eq!(purge_user(&index, "alice").await.unwrap(), 5);
        assert!(search_chats(&index, "alice", "", 10).await.unwrap().is_empty());
        assert_eq!(search_chats(&index, "bob", "rust", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rebuild_indexes_stored_conversations() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db.ensure_chat("chat_a", "alice", "Borrowing").unwrap();
        db.ensure_chat("chat_empty", "bob", "(New Chat)").unwrap();

        let index = MemoryIndex::new();
        assert_eq!(rebuild_index(Arc::new(db), &index).await.unwrap(), 2);
        assert_eq!(search_chats(&index, "alice", "borrow", 10).await.unwrap()[0].chat_id, "chat_a");
    }

    #[tokio::test]
    async fn deletes_remove_documents() {
        let index = seeded().await;
        index.delete(vec![message_document_id("m3")]).await.unwrap();
        assert!(index.get("msg_m3").is_none());
        assert!(index.get(&chat_document_id("chat_cook")).is_some());
    }
}
