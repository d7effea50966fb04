//! Streaming client for OpenAI-compatible `/chat/completions` endpoints.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{LanguageModel, ModelEvent, ModelEventStream};
use crate::model::{Message, Role};
use crate::stream::wire::Usage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub api_key: String,
    /// Upstream model names; each is registered as `openai:<name>`.
    pub models: Vec<String>,
}

pub struct OpenAiCompatibleModel {
    id: String,
    model: String,
    base_url: String,
    api_key: String,
    system_prompt: Option<String>,
    client: Client,
}

impl OpenAiCompatibleModel {
    pub fn new(config: &OpenAiConfig, model: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            id: format!("openai:{model}"),
            model: model.to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            system_prompt: None,
            client,
        })
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    fn request_body(&self, messages: &[Message]) -> Value {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            wire.push(json!({ "role": "system", "content": prompt }));
        }
        wire.extend(messages.iter().map(to_wire_message));

        json!({
            "model": self.model,
            "messages": wire,
            "stream": true,
            "stream_options": { "include_usage": true },
        })
    }
}

fn to_wire_message(message: &Message) -> Value {
    let text = message.canonical_text();
    let images: Vec<&str> = message
        .attachments
        .iter()
        .filter(|a| {
            a.content_type
                .as_deref()
                .is_some_and(|ct| ct.starts_with("image/"))
        })
        .map(|a| a.url.as_str())
        .collect();

    if message.role != Role::User || images.is_empty() {
        return json!({ "role": message.role.as_str(), "content": text });
    }

    let mut content = vec![json!({ "type": "text", "text": text })];
    content.extend(
        images
            .into_iter()
            .map(|url| json!({ "type": "image_url", "image_url": { "url": url } })),
    );
    json!({ "role": "user", "content": content })
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stream(&self, messages: &[Message]) -> Result<ModelEventStream> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(messages))
            .send()
            .await
            .context("model provider connection failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("model provider returned {}: {}", status, body);
        }

        Ok(sse_events(response.bytes_stream().boxed()))
    }
}

/// Accumulates a server-sent-event body into model events.
///
/// Network chunks can end inside a multi-byte character, so bytes are
/// buffered and only complete lines are decoded.
#[derive(Default)]
struct SseParser {
    buffer: Vec<u8>,
    finish_reason: Option<String>,
    usage: Usage,
    finished: bool,
}

impl SseParser {
    /// Feed a chunk; returns the events completed by it.
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<ModelEvent>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = decode_line(&line[..pos])?;
            events.extend(self.line(line.trim())?);
        }
        Ok(events)
    }

    /// Flush at end of body.
    fn end(&mut self) -> Result<Vec<ModelEvent>> {
        let trailing = std::mem::take(&mut self.buffer);
        let trailing = decode_line(&trailing)?;
        let mut events = self.line(trailing.trim())?;
        if !self.finished {
            events.push(self.finish());
        }
        Ok(events)
    }

    fn finish(&mut self) -> ModelEvent {
        self.finished = true;
        ModelEvent::Finish {
            reason: self.finish_reason.clone().unwrap_or_else(|| "unknown".into()),
            usage: self.usage,
        }
    }

    fn line(&mut self, line: &str) -> Result<Vec<ModelEvent>> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(Vec::new());
        };
        let data = data.trim();
        if self.finished {
            return Ok(Vec::new());
        }
        if data == "[DONE]" {
            return Ok(vec![self.finish()]);
        }

        let chunk: Value =
            serde_json::from_str(data).with_context(|| format!("invalid stream chunk: {data}"))?;
        if let Some(error) = chunk.get("error") {
            anyhow::bail!("model provider error: {error}");
        }

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = Usage {
                prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
                completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            };
        }

        let mut events = Vec::new();
        let Some(choice) = chunk["choices"].get(0) else {
            return Ok(events);
        };
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }
        let delta = &choice["delta"];
        for key in ["reasoning_content", "reasoning"] {
            if let Some(text) = delta[key].as_str().filter(|t| !t.is_empty()) {
                events.push(ModelEvent::ReasoningDelta(text.to_string()));
            }
        }
        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            events.push(ModelEvent::TextDelta(text.to_string()));
        }
        Ok(events)
    }
}

fn decode_line(line: &[u8]) -> Result<&str> {
    std::str::from_utf8(line).context("invalid UTF-8 in streaming response")
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    parser: SseParser,
    pending: VecDeque<ModelEvent>,
    done: bool,
}

fn sse_events(body: BoxStream<'static, reqwest::Result<Bytes>>) -> ModelEventStream {
    let state = SseState {
        body,
        parser: SseParser::default(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }

            let parsed = match state.body.next().await {
                Some(Ok(chunk)) => state.parser.push(&chunk),
                Some(Err(err)) => Err(anyhow::Error::new(err).context("model stream interrupted")),
                None => {
                    state.done = true;
                    state.parser.end()
                }
            };

            match parsed {
                Ok(events) => state.pending.extend(events),
                Err(err) => {
                    state.done = true;
                    state.pending.clear();
                    return Some((Err(err), state));
                }
            }
        }
    })
    .boxed()
}
