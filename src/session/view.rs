// ABOUTME: Read-only projection of the session store published to UI consumers.
// ABOUTME: Snapshot of the session list, the current session, and its conversation.

use crate::session::types::{Message, Session};

/// What UI collaborators observe. Rebuilt after every mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreView {
    pub session_list: Vec<Session>,
    pub current_session: Option<Session>,
    pub current_conversation: Vec<Message>,
}

impl StoreView {
    pub fn has_active_session(&self) -> bool {
        self.current_session.is_some()
    }
}
