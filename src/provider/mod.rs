//! Language-model providers.
//!
//! The chat flow only sees [`LanguageModel`]: a conversation in, a stream of
//! [`ModelEvent`]s out. Models are looked up by `provider:model` id in a
//! [`ModelRegistry`] built at startup and injected into the service.

pub mod echo;
pub mod openai;
pub mod smooth;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::model::{Message, Source};
use crate::stream::wire::Usage;

pub use echo::EchoModel;
pub use openai::{OpenAiCompatibleModel, OpenAiConfig};
pub use smooth::smooth_words;

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ReasoningDelta(String),
    Source(Source),
    Finish { reason: String, usage: Usage },
}

pub type ModelEventStream = BoxStream<'static, anyhow::Result<ModelEvent>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn id(&self) -> &str;

    /// Start generating a reply to `messages`. Connection-level failures
    /// surface here; failures mid-generation arrive as stream items.
    async fn stream(&self, messages: &[Message]) -> anyhow::Result<ModelEventStream>;
}

/// Models available to clients, keyed by id.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<dyn LanguageModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: Arc<dyn LanguageModel>) {
        self.models.insert(model.id().to_string(), model);
    }

    pub fn with(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.register(model);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LanguageModel>> {
        self.models.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup_by_id() {
        let registry = ModelRegistry::new()
            .with(Arc::new(EchoModel::new("echo")))
            .with(Arc::new(EchoModel::new("echo:slow")));

        assert!(registry.get("echo").is_some());
        assert!(registry.get("google:gemini").is_none());
        assert_eq!(registry.ids(), vec!["echo", "echo:slow"]);
    }
}
