//! Fast-path user intent shortcuts.
//!
//! Runs on the transcript before any chat round. A handled intent skips the
//! model entirely: exit phrases close the conversation with a goodbye
//! instead of burning an LLM turn on "bye". Device-control style intents
//! ride the function-calling path instead of this recognizer.

use crate::config::IntentConfig;

/// Intent the recognizer resolved without the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentOutcome {
    /// User asked to end the conversation.
    Exit,
}

/// Keyword intent recognizer.
pub struct IntentRecognizer {
    exit_commands: Vec<String>,
}

impl IntentRecognizer {
    pub fn new(config: &IntentConfig) -> Self {
        Self {
            exit_commands: config
                .exit_commands
                .iter()
                .map(|c| normalize(c))
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }

    /// Recognize a transcript. `None` means the text goes to chat.
    pub fn recognize(&self, text: &str) -> Option<IntentOutcome> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return None;
        }
        if self.exit_commands.iter().any(|cmd| normalized == *cmd) {
            return Some(IntentOutcome::Exit);
        }
        None
    }
}

/// Lowercase and drop everything that is not a letter, digit, or ideograph,
/// so "Goodbye!" and "goodbye" compare equal.
fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recognizer() -> IntentRecognizer {
        IntentRecognizer::new(&IntentConfig::default())
    }

    #[test]
    fn exit_phrases_are_recognized_despite_punctuation() {
        assert_eq!(recognizer().recognize("Goodbye!"), Some(IntentOutcome::Exit));
        assert_eq!(recognizer().recognize("再见。"), Some(IntentOutcome::Exit));
    }

    #[test]
    fn ordinary_text_is_not_an_intent() {
        assert_eq!(recognizer().recognize("what time is it"), None);
        assert_eq!(recognizer().recognize("tell me about goodbyes"), None);
    }

    #[test]
    fn empty_text_is_not_an_intent() {
        assert_eq!(recognizer().recognize("   "), None);
    }
}
