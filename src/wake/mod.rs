//! Wake-word gate
//!
//! Decides whether recognized text is assistant-directed. Detection runs on
//! already-recognized text rather than raw audio features, which keeps the
//! gate provider-agnostic at the cost of a full recognition pass before
//! trigger detection.

/// Matches recognized text against a configured keyword set
#[derive(Debug, Clone)]
pub struct WakeWordGate {
    words: Vec<String>,
}

impl WakeWordGate {
    /// Create a gate over the given keywords, normalized to lowercase
    #[must_use]
    pub fn new(words: Vec<String>) -> Self {
        let normalized: Vec<String> = words
            .into_iter()
            .map(|w| w.to_lowercase().trim().to_string())
            .filter(|w| !w.is_empty())
            .collect();

        tracing::debug!(wake_words = ?normalized, "wake word gate initialized");
        Self { words: normalized }
    }

    /// Evaluate recognized text, returning the earliest-matching keyword
    ///
    /// Substring containment, case-insensitive. When several keywords occur,
    /// the one appearing earliest in the text wins.
    #[must_use]
    pub fn evaluate(&self, text: &str) -> Option<&str> {
        let normalized = text.to_lowercase();

        self.words
            .iter()
            .filter_map(|word| normalized.find(word.as_str()).map(|pos| (pos, word)))
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, word)| word.as_str())
    }

    /// The configured keywords
    #[must_use]
    pub fn words(&self) -> &[String] {
        &self.words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> WakeWordGate {
        WakeWordGate::new(vec!["hello lantern".to_string(), "lantern".to_string()])
    }

    #[test]
    fn no_match_on_ordinary_speech() {
        assert!(gate().evaluate("what's the weather like").is_none());
    }

    #[test]
    fn case_insensitive_containment() {
        assert_eq!(
            gate().evaluate("HELLO LANTERN, lights on"),
            Some("hello lantern")
        );
    }

    #[test]
    fn earliest_match_wins() {
        let gate = WakeWordGate::new(vec!["lights".to_string(), "lantern".to_string()]);
        assert_eq!(gate.evaluate("lantern, turn on the lights"), Some("lantern"));
        assert_eq!(gate.evaluate("lights please, lantern"), Some("lights"));
    }

    #[test]
    fn keywords_normalized_at_construction() {
        let gate = WakeWordGate::new(vec!["  Hey Lantern  ".to_string(), String::new()]);
        assert_eq!(gate.words(), &["hey lantern"]);
    }
}
