//! Dialogue history: the ordered turn log, private to the controller.

use crate::llm::ChatMessage;
use std::collections::VecDeque;

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    System,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }
}

/// One completed turn.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub started_at: f64,
    pub ended_at: f64,
    /// Set when the turn was cut short by a barge-in or adapter failure.
    pub interrupted: bool,
}

/// Ordered sequence of turns, trimmed to a fixed length.
#[derive(Debug, Clone)]
pub struct DialogueHistory {
    turns: VecDeque<Turn>,
    max_turns: usize,
}

impl DialogueHistory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_turns: max_turns.max(1),
        }
    }

    /// Append a turn, dropping the oldest beyond the retention window.
    pub fn push(&mut self, turn: Turn) {
        if turn.text.trim().is_empty() {
            return;
        }
        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    pub fn push_user(&mut self, text: &str, started_at: f64, ended_at: f64) {
        self.push(Turn {
            role: Role::User,
            text: text.trim().to_owned(),
            started_at,
            ended_at,
            interrupted: false,
        });
    }

    pub fn push_system(&mut self, text: &str, started_at: f64, ended_at: f64, interrupted: bool) {
        self.push(Turn {
            role: Role::System,
            text: text.trim().to_owned(),
            started_at,
            ended_at,
            interrupted,
        });
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// The last `max_messages` turns as chat messages for the LLM context.
    pub fn context_messages(&self, max_messages: usize) -> Vec<ChatMessage> {
        let skip = self.turns.len().saturating_sub(max_messages);
        self.turns
            .iter()
            .skip(skip)
            .map(|turn| match turn.role {
                Role::User => ChatMessage::user(turn.text.clone()),
                Role::System => ChatMessage::assistant(turn.text.clone()),
            })
            .collect()
    }

    /// One-line-per-turn rendering for prompt templates.
    pub fn render(&self) -> String {
        self.turns
            .iter()
            .map(|t| format!("{}: {}", t.role.as_str(), t.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_trims_to_retention_window() {
        let mut history = DialogueHistory::new(3);
        for i in 0..5 {
            history.push_user(&format!("utterance {i}"), 0.0, 1.0);
        }
        assert_eq!(history.len(), 3);
        let texts: Vec<_> = history.iter().map(|t| t.text.clone()).collect();
        assert_eq!(texts, vec!["utterance 2", "utterance 3", "utterance 4"]);
    }

    #[test]
    fn empty_text_is_not_recorded() {
        let mut history = DialogueHistory::new(3);
        history.push_user("   ", 0.0, 1.0);
        assert!(history.is_empty());
    }

    #[test]
    fn context_messages_take_the_tail() {
        let mut history = DialogueHistory::new(10);
        history.push_user("one", 0.0, 1.0);
        history.push_system("two", 1.0, 2.0, false);
        history.push_user("three", 2.0, 3.0);
        let messages = history.context_messages(2);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "assistant");
        assert_eq!(messages[0].content, "two");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, "three");
    }

    #[test]
    fn render_labels_roles() {
        let mut history = DialogueHistory::new(10);
        history.push_user("hi", 0.0, 1.0);
        history.push_system("hello", 1.0, 2.0, false);
        assert_eq!(history.render(), "user: hi\nsystem: hello");
    }
}
