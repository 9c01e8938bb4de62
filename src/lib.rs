//! Voxbridge - real-time voice-assistant bridge
//!
//! A long-lived server that accepts persistent duplex connections from
//! clients and meeting-bot workers, and orchestrates a streaming
//! ASR -> LLM -> TTS pipeline with:
//! - at-most-once delivery across reconnects (sequence stamping + replay)
//! - cancellation and barge-in semantics
//! - ambient wake-word triggering with per-speaker context
//! - one isolated worker process per external meeting

// Core modules (leaves first)
pub mod types;
pub mod audio;
pub mod media;
pub mod protocol;
pub mod config;
pub mod services;
pub mod ambient;
pub mod pipeline;
pub mod session;
pub mod server;
pub mod worker;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;
pub use protocol::{ClientEnvelope, Emotion, ServerEnvelope};
pub use session::SessionManager;
pub use worker::MeetingOrchestrator;

/// Truncate a string to at most `max` chars without splitting a code point
pub fn truncate_safe(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max).collect();
        format!("{}…", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_safe("hola", 10), "hola");
        assert_eq!(truncate_safe("¿qué tal estás?", 5), "¿qué …");
    }
}
