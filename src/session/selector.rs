// ABOUTME: Active session selector — tracks which single session the UI currently shows.
// ABOUTME: Two-state machine (no session / active session) driven by store operations.

use crate::session::types::SessionId;

/// The current selection among loaded sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActiveSession {
    #[default]
    NoSession,
    HasActiveSession(SessionId),
}

impl ActiveSession {
    pub fn current(&self) -> Option<SessionId> {
        match self {
            ActiveSession::NoSession => None,
            ActiveSession::HasActiveSession(id) => Some(*id),
        }
    }

    pub fn is_active(&self, id: &SessionId) -> bool {
        self.current().as_ref() == Some(id)
    }

    pub fn select(&mut self, id: SessionId) {
        *self = ActiveSession::HasActiveSession(id);
    }

    pub fn clear(&mut self) {
        *self = ActiveSession::NoSession;
    }

    /// Drop the selection if `id` is the active session. Returns whether it was.
    pub fn release(&mut self, id: &SessionId) -> bool {
        if self.is_active(id) {
            self.clear();
            true
        } else {
            false
        }
    }

    /// Clear the selection when it no longer points at a present session.
    pub fn retain(&mut self, present: impl Fn(&SessionId) -> bool) {
        if let ActiveSession::HasActiveSession(id) = self {
            if !present(id) {
                self.clear();
            }
        }
    }
}
