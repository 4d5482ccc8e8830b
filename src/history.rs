//! Bounded conversation history shared by the ask endpoint.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_MAX_MESSAGES: usize = 25;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// FIFO of the most recent messages; the oldest are dropped past `max`.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    messages: VecDeque<ChatMessage>,
    max: usize,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}

impl ConversationHistory {
    pub fn new(max: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(max),
            max: max.max(1),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        if self.messages.len() == self.max {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Record one question/answer exchange.
    pub fn record_exchange(&mut self, question: &str, answer: &str) {
        self.push(ChatMessage::user(question));
        self.push(ChatMessage::assistant(answer));
    }

    /// The last `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ChatMessage> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let mut h = ConversationHistory::default();
        for i in 0..30 {
            h.push(ChatMessage::user(format!("m{}", i)));
        }
        assert_eq!(h.len(), 25);
        assert_eq!(h.recent(1)[0].content, "m29");
        assert_eq!(h.recent(100)[0].content, "m5");
    }

    #[test]
    fn test_recent_and_clear() {
        let mut h = ConversationHistory::new(10);
        h.record_exchange("q1", "a1");
        h.record_exchange("q2", "a2");
        let last = h.recent(2);
        assert_eq!(last[0], ChatMessage::user("q2"));
        assert_eq!(last[1], ChatMessage::assistant("a2"));
        h.clear();
        assert!(h.is_empty());
    }
}
