// ABOUTME: Conversation log — the append-only, ordered message sequence owned by one session.
// ABOUTME: Assigns message ids and monotonic timestamps at append time; no removal or reordering.

use chrono::{DateTime, Utc};

use crate::session::types::{Message, MessageId, Role};

/// Ordered message log. Insertion order is display order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a conversation from persisted messages, keeping their order.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Append a message stamped with the current time.
    pub fn append(
        &mut self,
        role: Role,
        content: String,
        metadata: Option<serde_json::Value>,
    ) -> &Message {
        self.append_at(role, content, metadata, Utc::now())
    }

    /// Append a message stamped with `now`, clamped so timestamps never go backwards.
    pub fn append_at(
        &mut self,
        role: Role,
        content: String,
        metadata: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> &Message {
        let timestamp = match self.messages.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        self.messages.push(Message {
            id: MessageId::new_v4(),
            role,
            content,
            timestamp,
            metadata,
        });
        &self.messages[self.messages.len() - 1]
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// True when timestamps never decrease along the log.
    pub fn is_monotonic(&self) -> bool {
        self.messages
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp)
    }
}

impl<'a> IntoIterator for &'a Conversation {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
