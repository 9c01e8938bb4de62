//! Streaming sentence boundary detection
//!
//! Pure functions from (buffer, incoming delta) to (emitted sentences, new
//! buffer). A sentence ends at `.`, `!` or `?` followed by whitespace or by
//! the start of an emotion tag; the tail is kept until the stream ends.

/// Result of feeding a delta into the rolling buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitResult {
    /// Complete sentences ready for emission, in order
    pub sentences: Vec<String>,
    /// Remaining tail to carry into the next call
    pub rest: String,
}

/// Append `delta` to `buffer` and split off every complete sentence.
pub fn push_delta(buffer: &str, delta: &str) -> SplitResult {
    let mut text = String::with_capacity(buffer.len() + delta.len());
    text.push_str(buffer);
    text.push_str(delta);

    let mut sentences = Vec::new();

    loop {
        match find_boundary(&text) {
            Some(end) => {
                let sentence = text[..end].trim().to_string();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                text = text[end..].trim_start().to_string();
            }
            None => break,
        }
    }

    SplitResult { sentences, rest: text }
}

/// Flush the tail once the stream has ended.
pub fn flush(buffer: &str) -> Option<String> {
    let tail = buffer.trim();
    if tail.is_empty() { None } else { Some(tail.to_string()) }
}

/// Find the byte index just past the first sentence terminator whose
/// follower qualifies as a boundary. A terminator at the very end of the
/// buffer is not a boundary yet: the next delta may continue the token
/// (e.g. "3.14", an ellipsis, or a URL).
fn find_boundary(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if !matches!(b, b'.' | b'!' | b'?') {
            continue;
        }
        let after = &text[i + 1..];
        if after.is_empty() {
            return None;
        }
        if after.starts_with(char::is_whitespace) || after.starts_with("[[") {
            // Skip over runs of terminators ("!?", "...") as one boundary
            let run_end = i + 1
                + after
                    .bytes()
                    .take_while(|c| matches!(c, b'.' | b'!' | b'?'))
                    .count();
            if run_end >= text.len() {
                return None;
            }
            return Some(run_end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminator_plus_space() {
        let r = push_delta("", "Hola. ¿Cómo estás? Bien");
        assert_eq!(r.sentences, vec!["Hola.", "¿Cómo estás?"]);
        assert_eq!(r.rest, "Bien");
    }

    #[test]
    fn terminator_at_end_waits_for_more() {
        let r = push_delta("", "Pi is 3.");
        assert!(r.sentences.is_empty());
        assert_eq!(r.rest, "Pi is 3.");

        let r = push_delta(&r.rest, "14 exactly. Done");
        assert_eq!(r.sentences, vec!["Pi is 3.14 exactly."]);
        assert_eq!(r.rest, "Done");
    }

    #[test]
    fn emotion_tag_counts_as_boundary() {
        let r = push_delta("", "[[emotion:happy]] First one.[[emotion:sad]] Second");
        assert_eq!(r.sentences, vec!["[[emotion:happy]] First one."]);
        assert_eq!(r.rest, "[[emotion:sad]] Second");
    }

    #[test]
    fn decimal_numbers_do_not_split() {
        let r = push_delta("", "It costs 3.50 dollars. Cheap");
        assert_eq!(r.sentences, vec!["It costs 3.50 dollars."]);
        assert_eq!(r.rest, "Cheap");
    }

    #[test]
    fn incremental_deltas_accumulate() {
        let mut buffer = String::new();
        let mut out = Vec::new();
        for delta in ["Hel", "lo the", "re. How are ", "you? I am", " fine"] {
            let r = push_delta(&buffer, delta);
            out.extend(r.sentences);
            buffer = r.rest;
        }
        assert_eq!(out, vec!["Hello there.", "How are you?"]);
        assert_eq!(flush(&buffer), Some("I am fine".to_string()));
    }

    #[test]
    fn punctuation_runs_stay_together() {
        let r = push_delta("", "What?! Really. ok");
        assert_eq!(r.sentences, vec!["What?!", "Really."]);
        assert_eq!(r.rest, "ok");
    }

    #[test]
    fn flush_empty_is_none() {
        assert_eq!(flush("   "), None);
        assert_eq!(flush(""), None);
    }
}
