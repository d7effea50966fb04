//! Data-stream wire format.
//!
//! A response body is a sequence of lines `<code>:<json>\n`. Live model
//! output, replayed output and the synthetic resume event all share it, so a
//! client parses every response the same way.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::{Message, Source};

pub const CONTENT_TYPE: &str = "text/plain; charset=utf-8";
pub const STREAM_HEADER: &str = "x-vercel-ai-data-stream";
pub const STREAM_HEADER_VALUE: &str = "v1";

/// Data event type announcing a finished message the client never saw.
pub const APPEND_MESSAGE: &str = "append-message";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamPart {
    Text(String),
    Data(Vec<Value>),
    Error(String),
    MessageAnnotations(Vec<Value>),
    Reasoning(String),
    Source(Source),
    StartStep { message_id: String },
    FinishStep {
        finish_reason: String,
        usage: Usage,
        is_continued: bool,
    },
    FinishMessage { finish_reason: String, usage: Usage },
}

impl StreamPart {
    pub fn code(&self) -> char {
        match self {
            StreamPart::Text(_) => '0',
            StreamPart::Data(_) => '2',
            StreamPart::Error(_) => '3',
            StreamPart::MessageAnnotations(_) => '8',
            StreamPart::Reasoning(_) => 'g',
            StreamPart::Source(_) => 'h',
            StreamPart::StartStep { .. } => 'f',
            StreamPart::FinishStep { .. } => 'e',
            StreamPart::FinishMessage { .. } => 'd',
        }
    }

    fn payload(&self) -> Value {
        match self {
            StreamPart::Text(text) | StreamPart::Error(text) | StreamPart::Reasoning(text) => {
                Value::String(text.clone())
            }
            StreamPart::Data(values) | StreamPart::MessageAnnotations(values) => {
                Value::Array(values.clone())
            }
            StreamPart::Source(source) => json!(source),
            StreamPart::StartStep { message_id } => json!({ "messageId": message_id }),
            StreamPart::FinishStep {
                finish_reason,
                usage,
                is_continued,
            } => json!({
                "finishReason": finish_reason,
                "usage": usage,
                "isContinued": is_continued,
            }),
            StreamPart::FinishMessage {
                finish_reason,
                usage,
            } => json!({ "finishReason": finish_reason, "usage": usage }),
        }
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(format!("{}:{}\n", self.code(), self.payload()))
    }

    /// Parse one line (without the trailing newline).
    pub fn decode(line: &str) -> Option<StreamPart> {
        let (code, raw) = line.split_once(':')?;
        let value: Value = serde_json::from_str(raw).ok()?;

        let as_string = |value: Value| value.as_str().map(str::to_string);
        let as_array = |value: Value| match value {
            Value::Array(values) => Some(values),
            _ => None,
        };
        let usage = |value: &Value| {
            value
                .get("usage")
                .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
                .unwrap_or_default()
        };
        let finish_reason = |value: &Value| {
            value
                .get("finishReason")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()
        };

        match code {
            "0" => as_string(value).map(StreamPart::Text),
            "2" => as_array(value).map(StreamPart::Data),
            "3" => as_string(value).map(StreamPart::Error),
            "8" => as_array(value).map(StreamPart::MessageAnnotations),
            "g" => as_string(value).map(StreamPart::Reasoning),
            "h" => serde_json::from_value(value).ok().map(StreamPart::Source),
            "f" => value
                .get("messageId")
                .and_then(Value::as_str)
                .map(|id| StreamPart::StartStep {
                    message_id: id.to_string(),
                }),
            "e" => Some(StreamPart::FinishStep {
                finish_reason: finish_reason(&value),
                usage: usage(&value),
                is_continued: value
                    .get("isContinued")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            "d" => Some(StreamPart::FinishMessage {
                finish_reason: finish_reason(&value),
                usage: usage(&value),
            }),
            _ => None,
        }
    }
}

/// Parse a whole body, skipping lines that are not valid parts.
pub fn decode_body(body: &str) -> Vec<StreamPart> {
    body.lines().filter_map(StreamPart::decode).collect()
}

/// The single event a resume answers with when the response finished while
/// the client was away. The message travels as a JSON string.
pub fn append_message_part(message: &Message) -> serde_json::Result<StreamPart> {
    Ok(StreamPart::Data(vec![json!({
        "type": APPEND_MESSAGE,
        "message": serde_json::to_string(message)?,
    })]))
}

/// Extract the message of an append-message event.
pub fn appended_message(part: &StreamPart) -> Option<Message> {
    let StreamPart::Data(values) = part else {
        return None;
    };
    let event = values.first()?;
    if event.get("type")?.as_str()? != APPEND_MESSAGE {
        return None;
    }
    serde_json::from_str(event.get("message")?.as_str()?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    #[test]
    fn text_parts_are_json_strings() {
        let part = StreamPart::Text("he said \"hi\"\n".into());
        assert_eq!(&part.encode()[..], b"0:\"he said \\\"hi\\\"\\n\"\n");
    }

    #[test]
    fn finish_message_shape() {
        let part = StreamPart::FinishMessage {
            finish_reason: "stop".into(),
            usage: Usage {
                prompt_tokens: 3,
                completion_tokens: 5,
            },
        };
        let line = String::from_utf8(part.encode().to_vec()).unwrap();
        assert!(line.starts_with("d:{"));
        assert!(line.contains("\"promptTokens\":3"));
        assert_eq!(StreamPart::decode(line.trim_end()), Some(part));
    }

    #[test]
    fn decode_body_skips_garbage() {
        let body = "0:\"a\"\nnot a part\ng:\"think\"\nz:1\n";
        assert_eq!(
            decode_body(body),
            vec![
                StreamPart::Text("a".into()),
                StreamPart::Reasoning("think".into())
            ]
        );
    }

    #[test]
    fn append_message_event_carries_the_message() {
        let message = Message::new("msgs_1", Role::Assistant, "done");
        let part = append_message_part(&message).unwrap();
        let line = String::from_utf8(part.encode().to_vec()).unwrap();
        assert!(line.starts_with("2:[{"));

        let decoded = StreamPart::decode(line.trim_end()).unwrap();
        assert_eq!(appended_message(&decoded), Some(message));
    }
}
