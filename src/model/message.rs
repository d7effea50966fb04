use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A citation attached to an assistant answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default = "default_source_type")]
    pub source_type: String,
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

fn default_source_type() -> String {
    "url".to_string()
}

/// One typed element of a structured message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Reasoning {
        reasoning: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        details: Vec<serde_json::Value>,
    },
    Source {
        source: Source,
    },
    File {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
    },
    StepStart,
    ToolInvocation {
        #[serde(rename = "toolInvocation")]
        tool_invocation: serde_json::Value,
    },
}

impl MessagePart {
    pub fn text(&self) -> Option<&str> {
        match self {
            MessagePart::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Message body: either a plain string or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    PlainText(String),
    Structured(Vec<MessagePart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::PlainText(String::new())
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        MessageContent::PlainText(value.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        MessageContent::PlainText(value)
    }
}

impl MessageContent {
    /// Canonical text of the body. Structured bodies contribute only their
    /// text parts, concatenated in order.
    pub fn canonical_text(&self) -> String {
        match self {
            MessageContent::PlainText(text) => text.clone(),
            MessageContent::Structured(parts) => join_text_parts(parts),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.canonical_text().trim().is_empty()
    }
}

pub(crate) fn join_text_parts(parts: &[MessagePart]) -> String {
    parts.iter().filter_map(MessagePart::text).collect()
}

/// File attached to a user message, usually an object-storage URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    #[serde(default)]
    pub annotations: Vec<serde_json::Value>,
    #[serde(
        default,
        rename = "experimental_attachments",
        alias = "attachments"
    )]
    pub attachments: Vec<Attachment>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            parts: Vec::new(),
            annotations: Vec::new(),
            attachments: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_parts(mut self, parts: Vec<MessagePart>) -> Self {
        self.parts = parts;
        self
    }

    /// Text used for titles and search documents. Falls back to the text
    /// parts when the body itself is empty.
    pub fn canonical_text(&self) -> String {
        let text = self.content.canonical_text();
        if text.trim().is_empty() {
            join_text_parts(&self.parts)
        } else {
            text
        }
    }

    /// True when the mutable fields differ. Role and ownership are not
    /// mutable; the reconciler rejects an id that comes back with another
    /// role.
    pub fn differs_from(&self, other: &Message) -> bool {
        self.content != other.content
            || self.parts != other.parts
            || self.annotations != other.annotations
            || self.attachments != other.attachments
    }
}
