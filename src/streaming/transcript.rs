//! Output transcript accumulation
//!
//! Collects the agent's output-transcription fragments for the current
//! session. Append-only: fragments are never corrected, only reset when a
//! new session opens.

/// Append-only transcript of what the agent has said
#[derive(Debug, Clone, Default)]
pub struct TranscriptBuffer {
    text: String,
    fragment_count: u64,
    turns_completed: u64,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return the accumulated text.
    ///
    /// Empty fragments are ignored.
    pub fn append(&mut self, fragment: &str) -> &str {
        if !fragment.is_empty() {
            self.text.push_str(fragment);
            self.fragment_count += 1;

            if self.fragment_count % 10 == 0 {
                log::debug!(
                    "TranscriptBuffer: {} fragments, {} chars accumulated",
                    self.fragment_count,
                    self.text.chars().count()
                );
            }
        }
        &self.text
    }

    /// Note that the agent finished a turn
    pub fn mark_turn_complete(&mut self) {
        self.turns_completed += 1;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The last `max_chars` characters of the transcript
    pub fn tail(&self, max_chars: usize) -> &str {
        if max_chars == 0 {
            return "";
        }
        match self.text.char_indices().rev().nth(max_chars - 1) {
            Some((start, _)) => &self.text[start..],
            None => &self.text,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn fragment_count(&self) -> u64 {
        self.fragment_count
    }

    pub fn turns_completed(&self) -> u64 {
        self.turns_completed
    }

    /// Character count (not bytes)
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    /// Clear for a new session
    pub fn reset(&mut self) {
        self.text.clear();
        self.fragment_count = 0;
        self.turns_completed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_empty() {
        let buffer = TranscriptBuffer::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.text(), "");
        assert_eq!(buffer.tail(150), "");
        assert_eq!(buffer.fragment_count(), 0);
    }

    #[test]
    fn test_fragments_are_appended_in_order() {
        let mut buffer = TranscriptBuffer::new();
        buffer.append("Welcome ");
        buffer.append("back to ");
        let text = buffer.append("the show.");
        assert_eq!(text, "Welcome back to the show.");
        assert_eq!(buffer.fragment_count(), 3);
    }

    #[test]
    fn test_empty_fragment_ignored() {
        let mut buffer = TranscriptBuffer::new();
        buffer.append("Hi");
        buffer.append("");
        assert_eq!(buffer.text(), "Hi");
        assert_eq!(buffer.fragment_count(), 1);
    }

    #[test]
    fn test_tail_keeps_last_chars() {
        let mut buffer = TranscriptBuffer::new();
        buffer.append("abcdefghij");
        assert_eq!(buffer.tail(3), "hij");
        assert_eq!(buffer.tail(10), "abcdefghij");
        assert_eq!(buffer.tail(150), "abcdefghij");
        assert_eq!(buffer.tail(0), "");
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let mut buffer = TranscriptBuffer::new();
        buffer.append("héllo wörld");
        assert_eq!(buffer.tail(5), "wörld");
        assert_eq!(buffer.char_count(), 11);
    }

    #[test]
    fn test_reset() {
        let mut buffer = TranscriptBuffer::new();
        buffer.append("Some text");
        buffer.mark_turn_complete();

        buffer.reset();

        assert!(buffer.is_empty());
        assert_eq!(buffer.fragment_count(), 0);
        assert_eq!(buffer.turns_completed(), 0);
    }
}
