//! System prompt and message assembly

use crate::services::llm::{ChatContent, ChatMessage};
use crate::types::ConversationTurn;

/// Exchanges kept in the sliding window (user+assistant pairs)
pub const HISTORY_EXCHANGES: usize = 10;

/// Fixed instruction for spoken replies.
///
/// Forbids markdown, bounds spoken length, and mandates the emotion tag
/// grammar the per-sentence emitter parses back out.
pub const SYSTEM_PROMPT: &str = "\
You are a helpful voice assistant in a live spoken conversation. You \
understand and answer in Spanish or English, matching the language of the \
user. Keep replies short: one to three spoken sentences unless the user \
explicitly asks for more. Never use markdown, bullet points, or headings; \
your words are read aloud.

Immediately before every sentence, emit exactly one emotion tag of the form \
[[emotion:label]] where label is one of: happy, sad, surprised, thinking, \
confused, laughing, neutral, angry, love. Never emit two consecutive \
sentences with the same tag. For code, use a triple-backtick fenced block. \
To offer quick choices, end the reply with a single [[buttons:option one|\
option two]] tag.";

/// Build the submission list: system prompt, sliding window, current turn.
pub fn build_messages(history: &[ConversationTurn], user_content: ChatContent) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(SYSTEM_PROMPT));

    let window_start = history.len().saturating_sub(HISTORY_EXCHANGES * 2);
    for turn in &history[window_start..] {
        messages.push(ChatMessage {
            role: turn.role.as_openai_str().to_string(),
            content: ChatContent::Text(turn.content.clone()),
        });
    }

    messages.push(ChatMessage { role: "user".to_string(), content: user_content });
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_order_and_window() {
        let mut history = Vec::new();
        for i in 0..30 {
            history.push(ConversationTurn::user(format!("u{}", i)));
            history.push(ConversationTurn::assistant(format!("a{}", i)));
        }

        let messages = build_messages(&history, ChatContent::Text("now".into()));
        // system + 2*HISTORY_EXCHANGES + current
        assert_eq!(messages.len(), 1 + HISTORY_EXCHANGES * 2 + 1);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages.last().unwrap().content.as_display_text(), "now");
        // Oldest retained turn is u20 (the last 10 exchanges of 30)
        assert_eq!(messages[1].content.as_display_text(), "u20");
    }

    #[test]
    fn prompt_names_all_nine_emotions() {
        for label in [
            "happy", "sad", "surprised", "thinking", "confused", "laughing", "neutral", "angry",
            "love",
        ] {
            assert!(SYSTEM_PROMPT.contains(label), "missing {}", label);
        }
    }
}
