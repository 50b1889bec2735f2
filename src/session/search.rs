// ABOUTME: Message search across loaded conversations.
// ABOUTME: ASCII case-insensitive substring matching with <mark>-highlighted snippets.

use chrono::{DateTime, Utc};

use crate::session::types::{Message, MessageId, Role, SessionId};

/// Characters of context kept on each side of a match.
const SNIPPET_CONTEXT: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    pub highlight: String,
}

/// Match `query` against one message, returning a hit when it occurs.
pub fn match_message(session_id: SessionId, message: &Message, query: &str) -> Option<SearchHit> {
    let (start, end) = find_ignore_ascii_case(&message.content, query)?;
    Some(SearchHit {
        session_id,
        message_id: message.id,
        role: message.role,
        timestamp: message.timestamp,
        highlight: highlight(&message.content, start, end),
    })
}

/// Byte range of the first match. ASCII lowercasing keeps byte offsets intact.
fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    if needle.is_empty() {
        return None;
    }
    let start = haystack
        .to_ascii_lowercase()
        .find(&needle.to_ascii_lowercase())?;
    Some((start, start + needle.len()))
}

fn highlight(content: &str, start: usize, end: usize) -> String {
    let before = &content[..start];
    let after = &content[end..];

    let before_chars = before.chars().count();
    let lead = if before_chars > SNIPPET_CONTEXT {
        let skip = before_chars - SNIPPET_CONTEXT;
        let cut = before.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
        format!("...{}", &before[cut..])
    } else {
        before.to_string()
    };

    let tail = match after.char_indices().nth(SNIPPET_CONTEXT) {
        Some((cut, _)) => format!("{}...", &after[..cut]),
        None => after.to_string(),
    };

    format!("{}<mark>{}</mark>{}", lead, &content[start..end], tail)
}
