// ABOUTME: Persistence gateway — the async interface to durable session storage.
// ABOUTME: Ships a JSON-file backend and an in-memory backend with injectable latency and failures.

pub mod json_file;
pub mod memory;

use async_trait::async_trait;

use crate::error::PersistenceResult;
use crate::session::types::{Message, Session, SessionId, SessionSnapshot};

pub use json_file::JsonFileGateway;
pub use memory::MemoryGateway;

/// Durable storage for sessions and their conversations.
///
/// Every call may fail; a rejected call is the only failure signal the store
/// relies on.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Prepare the backing storage. Safe to call more than once.
    async fn init_database(&self) -> PersistenceResult<()>;

    /// All sessions of a project with their messages, most recently updated first.
    async fn load_sessions(&self, project_id: &str) -> PersistenceResult<Vec<SessionSnapshot>>;

    /// Insert or replace a session record.
    async fn save_session(&self, session: &Session) -> PersistenceResult<()>;

    /// Append a message to a session's durable log.
    async fn save_message(&self, session_id: &SessionId, message: &Message)
    -> PersistenceResult<()>;

    /// Remove a session and its messages. Unknown ids are not an error.
    async fn delete_session(&self, session_id: &SessionId) -> PersistenceResult<()>;
}

/// Order snapshots the way every backend returns them: newest activity first,
/// ties broken by creation time and then id so repeated loads are identical.
pub(crate) fn sort_snapshots(snapshots: &mut [SessionSnapshot]) {
    snapshots.sort_by(|a, b| {
        b.session
            .updated_at
            .cmp(&a.session.updated_at)
            .then_with(|| b.session.created_at.cmp(&a.session.created_at))
            .then_with(|| a.session.id.cmp(&b.session.id))
    });
}
