use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use super::{LanguageModel, ModelEvent, ModelEventStream};
use crate::model::{Message, Role};
use crate::stream::wire::Usage;

/// Offline model that answers by quoting the last user message, one word at
/// a time. Used for local development and tests.
pub struct EchoModel {
    id: String,
    delay: Duration,
    reasoning: bool,
}

impl EchoModel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            delay: Duration::ZERO,
            reasoning: false,
        }
    }

    /// Pause before every emitted event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Emit a reasoning delta before the answer.
    pub fn with_reasoning(mut self) -> Self {
        self.reasoning = true;
        self
    }

    pub fn reply_to(messages: &[Message]) -> String {
        let question = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(Message::canonical_text)
            .unwrap_or_default();
        format!("You said: {}", question.trim())
    }
}

#[async_trait]
impl LanguageModel for EchoModel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stream(&self, messages: &[Message]) -> anyhow::Result<ModelEventStream> {
        let reply = Self::reply_to(messages);
        let prompt_tokens: usize = messages
            .iter()
            .map(|m| m.canonical_text().split_whitespace().count())
            .sum();

        let mut events = Vec::new();
        if self.reasoning {
            events.push(ModelEvent::ReasoningDelta("Repeating the question.".into()));
        }
        let words: Vec<&str> = reply.split_inclusive(' ').collect();
        let completion_tokens = words.len();
        events.extend(words.into_iter().map(|w| ModelEvent::TextDelta(w.to_string())));
        events.push(ModelEvent::Finish {
            reason: "stop".into(),
            usage: Usage {
                prompt_tokens: prompt_tokens as u64,
                completion_tokens: completion_tokens as u64,
            },
        });

        let delay = self.delay;
        Ok(stream::iter(events)
            .then(move |event| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, anyhow::Error>(event)
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_last_user_message() {
        let model = EchoModel::new("echo");
        let messages = vec![
            Message::new("1", Role::User, "first"),
            Message::new("2", Role::Assistant, "You said: first"),
            Message::new("3", Role::User, "hello there"),
        ];

        let events: Vec<ModelEvent> = model
            .stream(&messages)
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                ModelEvent::TextDelta(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "You said: hello there");
        assert!(matches!(events.last(), Some(ModelEvent::Finish { reason, .. }) if reason == "stop"));
    }
}
