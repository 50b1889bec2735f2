// ABOUTME: Session store — the single authoritative owner of loaded sessions and conversations.
// ABOUTME: Mutates memory optimistically, then hands one persistence call per mutation to the queue.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::export::{self, ExportFormat};
use crate::gateway::PersistenceGateway;
use crate::session::conversation::Conversation;
use crate::session::queue::{PersistCommand, PersistPolicy, PersistenceEvent, PersistenceQueue};
use crate::session::search::{self, SearchHit};
use crate::session::selector::ActiveSession;
use crate::session::types::{Message, NewMessage, Role, Session, SessionId};
use crate::session::view::StoreView;

/// Tuning for the store's persistence side.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub policy: PersistPolicy,
    /// Capacity of the persistence outcome channel; slow subscribers lag past this.
    pub event_buffer: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            policy: PersistPolicy::default(),
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone)]
struct SessionEntry {
    session: Session,
    conversation: Conversation,
}

/// Owns every loaded session and is the only place they are mutated.
///
/// Mutations take `&mut self` and complete synchronously in memory; the
/// matching durable write is queued on the session's persistence worker and
/// its outcome is broadcast through [`SessionStore::subscribe_persistence`].
/// Must be used from within a Tokio runtime.
pub struct SessionStore {
    gateway: Arc<dyn PersistenceGateway>,
    scope: String,
    entries: Vec<SessionEntry>,
    active: ActiveSession,
    queue: PersistenceQueue,
    view_tx: watch::Sender<StoreView>,
}

impl SessionStore {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        scope: impl Into<String>,
        options: StoreOptions,
    ) -> Self {
        let queue = PersistenceQueue::new(gateway.clone(), options.policy, options.event_buffer);
        let (view_tx, _) = watch::channel(StoreView::default());
        Self {
            gateway,
            scope: scope.into(),
            entries: Vec::new(),
            active: ActiveSession::default(),
            queue,
            view_tx,
        }
    }

    /// Prepare the backing storage.
    pub async fn initialize(&self) -> SessionResult<()> {
        self.gateway.init_database().await?;
        Ok(())
    }

    /// Replace the in-memory collection with what storage holds for the scope.
    ///
    /// On failure nothing in memory changes. The current selection survives
    /// only if its session is still present.
    pub async fn load_sessions(&mut self) -> SessionResult<usize> {
        let snapshots = self.gateway.load_sessions(&self.scope).await?;

        let mut seen = HashSet::with_capacity(snapshots.len());
        let mut entries = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            if !seen.insert(snapshot.session.id) {
                warn!(session_id = %snapshot.session.id, "storage returned a duplicate session; keeping the first");
                continue;
            }
            entries.push(SessionEntry {
                session: snapshot.session,
                conversation: Conversation::from_messages(snapshot.messages),
            });
        }

        self.entries = entries;
        let entries = &self.entries;
        self.active
            .retain(|id| entries.iter().any(|entry| entry.session.id == *id));
        // Workers for sessions storage no longer returns drain their queue and stop.
        self.queue
            .retire_absent(|id| entries.iter().any(|entry| entry.session.id == *id));

        info!(scope = %self.scope, count = self.entries.len(), "loaded sessions");
        self.publish();
        Ok(self.entries.len())
    }

    /// Create an empty session, make it current, and queue its save.
    pub fn create_session(&mut self, project_id: &str, runtime_id: &str) -> SessionResult<Session> {
        let project_id = non_empty("project_id", project_id)?;
        let runtime_id = non_empty("runtime_id", runtime_id)?;

        let mut id = SessionId::new_v4();
        while self.position(&id).is_some() {
            id = SessionId::new_v4();
        }
        let now = Utc::now();
        let session = Session {
            id,
            project_id,
            runtime_id,
            title: format!("Session {}", self.entries.len() + 1),
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
        };

        self.entries.insert(
            0,
            SessionEntry {
                session: session.clone(),
                conversation: Conversation::new(),
            },
        );
        self.active.select(id);
        self.queue
            .enqueue(id, PersistCommand::SaveSession(session.clone()));

        info!(session_id = %id, runtime_id = %session.runtime_id, "created session");
        self.publish();
        Ok(session)
    }

    /// Append a message to a session's conversation and queue its save.
    pub fn add_message(&mut self, session_id: &SessionId, input: NewMessage) -> SessionResult<Message> {
        let index = self
            .position(session_id)
            .ok_or_else(|| SessionError::not_found(session_id))?;
        let role: Role = input.role.parse()?;

        let entry = &mut self.entries[index];
        let message = entry
            .conversation
            .append(role, input.content, input.metadata)
            .clone();
        if message.timestamp > entry.session.updated_at {
            entry.session.updated_at = message.timestamp;
        }
        debug_assert!(entry.conversation.is_monotonic());

        self.queue
            .enqueue(*session_id, PersistCommand::SaveMessage(message.clone()));

        debug!(%session_id, message_id = %message.id, role = %role, "appended message");
        self.publish();
        Ok(message)
    }

    /// Make an existing session current. Unknown ids leave the selection alone.
    pub fn set_current_session(&mut self, session_id: &SessionId) -> SessionResult<()> {
        if self.position(session_id).is_none() {
            return Err(SessionError::not_found(session_id));
        }
        self.active.select(*session_id);
        self.publish();
        Ok(())
    }

    pub fn clear_current_session(&mut self) {
        self.active.clear();
        self.publish();
    }

    /// Change a session's title and queue a save of the full record.
    pub fn rename_session(&mut self, session_id: &SessionId, title: &str) -> SessionResult<Session> {
        let index = self
            .position(session_id)
            .ok_or_else(|| SessionError::not_found(session_id))?;
        let title = non_empty("title", title)?;

        let session = &mut self.entries[index].session;
        session.title = title;
        session.updated_at = Utc::now().max(session.updated_at);
        let session = session.clone();

        self.queue
            .enqueue(*session_id, PersistCommand::SaveSession(session.clone()));
        self.publish();
        Ok(session)
    }

    /// Replace a session's tags and queue a save of the full record.
    ///
    /// Tags are trimmed; blanks and repeats are dropped. An empty list clears them.
    pub fn set_session_tags<I, S>(&mut self, session_id: &SessionId, tags: I) -> SessionResult<Session>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let index = self
            .position(session_id)
            .ok_or_else(|| SessionError::not_found(session_id))?;

        let mut normalized: Vec<String> = Vec::new();
        for tag in tags {
            let tag = tag.as_ref().trim();
            if !tag.is_empty() && !normalized.iter().any(|t| t == tag) {
                normalized.push(tag.to_string());
            }
        }

        let session = &mut self.entries[index].session;
        session.tags = normalized;
        session.updated_at = Utc::now().max(session.updated_at);
        let session = session.clone();

        self.queue
            .enqueue(*session_id, PersistCommand::SaveSession(session.clone()));
        debug!(%session_id, tags = ?session.tags, "tagged session");
        self.publish();
        Ok(session)
    }

    /// Remove a session locally and queue its deletion.
    ///
    /// The local removal stands even if storage later rejects the delete.
    /// Deleting the current session clears the selection; there is no fallback.
    pub fn delete_session(&mut self, session_id: &SessionId) -> SessionResult<()> {
        let index = self
            .position(session_id)
            .ok_or_else(|| SessionError::not_found(session_id))?;
        self.entries.remove(index);
        let was_active = self.active.release(session_id);

        self.queue
            .enqueue(*session_id, PersistCommand::DeleteSession);
        self.queue.retire(session_id);

        info!(%session_id, was_active, "deleted session");
        self.publish();
        Ok(())
    }

    /// Search every loaded conversation, in session-list then message order.
    pub fn search_messages(&self, query: &str) -> Vec<SearchHit> {
        let query = query.trim();
        self.entries
            .iter()
            .flat_map(|entry| {
                entry
                    .conversation
                    .iter()
                    .filter_map(move |message| search::match_message(entry.session.id, message, query))
            })
            .collect()
    }

    pub fn export_session(&self, session_id: &SessionId, format: ExportFormat) -> SessionResult<String> {
        let entry = self
            .entry(session_id)
            .ok_or_else(|| SessionError::not_found(session_id))?;
        export::render(&entry.session, entry.conversation.messages(), format)
    }

    /// Wait for every queued persistence call to finish.
    pub async fn flush(&mut self) {
        self.queue.flush().await;
    }

    pub fn subscribe_persistence(&self) -> broadcast::Receiver<PersistenceEvent> {
        self.queue.subscribe()
    }

    pub fn watch_view(&self) -> watch::Receiver<StoreView> {
        self.view_tx.subscribe()
    }

    /// The reactive view as a stream, starting with the current value.
    pub fn view_stream(&self) -> WatchStream<StoreView> {
        WatchStream::new(self.view_tx.subscribe())
    }

    pub fn view(&self) -> StoreView {
        let current = self.current_entry();
        StoreView {
            session_list: self.entries.iter().map(|e| e.session.clone()).collect(),
            current_session: current.map(|e| e.session.clone()),
            current_conversation: current
                .map(|e| e.conversation.messages().to_vec())
                .unwrap_or_default(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Point subsequent loads at another project. The loaded collection is kept until then.
    pub fn set_scope(&mut self, scope: impl Into<String>) {
        self.scope = scope.into();
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.entries.iter().map(|e| &e.session)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn session(&self, session_id: &SessionId) -> Option<&Session> {
        self.entry(session_id).map(|e| &e.session)
    }

    pub fn conversation(&self, session_id: &SessionId) -> Option<&Conversation> {
        self.entry(session_id).map(|e| &e.conversation)
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.active.current()
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.current_entry().map(|e| &e.session)
    }

    pub fn current_conversation(&self) -> Option<&Conversation> {
        self.current_entry().map(|e| &e.conversation)
    }

    fn position(&self, session_id: &SessionId) -> Option<usize> {
        self.entries.iter().position(|e| e.session.id == *session_id)
    }

    fn entry(&self, session_id: &SessionId) -> Option<&SessionEntry> {
        self.entries.iter().find(|e| e.session.id == *session_id)
    }

    fn current_entry(&self) -> Option<&SessionEntry> {
        self.active.current().and_then(|id| self.entry(&id))
    }

    fn invariants_hold(&self) -> bool {
        let mut ids = HashSet::with_capacity(self.entries.len());
        let unique = self.entries.iter().all(|e| ids.insert(e.session.id));
        let selection_valid = self
            .active
            .current()
            .is_none_or(|id| ids.contains(&id));
        unique && selection_valid
    }

    fn publish(&self) {
        debug_assert!(self.invariants_hold(), "session store invariants violated");
        self.view_tx.send_replace(self.view());
    }
}

fn non_empty(field: &'static str, value: &str) -> SessionResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SessionError::validation(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}
