use crate::model::{Message, Role};

/// Title used when no user message carries any text.
pub const PLACEHOLDER_TITLE: &str = "(New Chat)";

pub const MAX_TITLE_CHARS: usize = 30;

const ELLIPSIS: &str = "...";

/// Derive a chat title from the first user message of a conversation.
pub fn generate_title(messages: &[Message]) -> String {
    messages
        .iter()
        .find(|message| message.role == Role::User)
        .map(|message| title_from_text(&message.canonical_text()))
        .unwrap_or_else(|| PLACEHOLDER_TITLE.to_string())
}

/// Truncate `text` to [`MAX_TITLE_CHARS`] characters, marking truncation
/// with an ellipsis. The text is cut as written, surrounding whitespace
/// included. Blank text yields the placeholder.
pub fn title_from_text(text: &str) -> String {
    if text.trim().is_empty() {
        return PLACEHOLDER_TITLE.to_string();
    }

    let mut chars = text.char_indices();
    match chars.nth(MAX_TITLE_CHARS) {
        Some((cut, _)) => format!("{}{}", &text[..cut], ELLIPSIS),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessagePart;

    #[test]
    fn uses_first_user_message() {
        let messages = vec![
            Message::new("a", Role::Assistant, "Welcome back"),
            Message::new("u", Role::User, "Hello world, this is a long message"),
            Message::new("v", Role::User, "second"),
        ];
        assert_eq!(generate_title(&messages), "Hello world, this is a long me...");
    }

    #[test]
    fn short_text_is_kept() {
        let messages = vec![Message::new("u", Role::User, "Short question")];
        assert_eq!(generate_title(&messages), "Short question");
    }

    #[test]
    fn exactly_thirty_chars_is_not_truncated() {
        let text = "a".repeat(MAX_TITLE_CHARS);
        assert_eq!(title_from_text(&text), text);
    }

    #[test]
    fn no_user_message_yields_placeholder() {
        let messages = vec![Message::new("s", Role::System, "You are helpful")];
        assert_eq!(generate_title(&messages), PLACEHOLDER_TITLE);
        assert_eq!(generate_title(&[]), PLACEHOLDER_TITLE);
    }

    #[test]
    fn blank_user_message_yields_placeholder() {
        let messages = vec![Message::new("u", Role::User, "   ")];
        assert_eq!(generate_title(&messages), PLACEHOLDER_TITLE);
    }

    #[test]
    fn structured_content_uses_text_parts() {
        let content = crate::model::MessageContent::Structured(vec![
            MessagePart::Text { text: "Plan a ".into() },
            MessagePart::StepStart,
            MessagePart::Text { text: "trip".into() },
        ]);
        let messages = vec![Message::new("u", Role::User, content)];
        assert_eq!(generate_title(&messages), "Plan a trip");
    }

    #[test]
    fn leading_whitespace_counts_toward_the_limit() {
        let text = format!("   {}", "b".repeat(MAX_TITLE_CHARS));
        assert_eq!(
            title_from_text(&text),
            format!("   {}...", "b".repeat(MAX_TITLE_CHARS - 3))
        );
        assert_eq!(title_from_text(" hi "), " hi ");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(40);
        let title = title_from_text(&text);
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS + ELLIPSIS.len());
    }
}
