// ABOUTME: In-memory persistence gateway for tests and ephemeral runs.
// ABOUTME: Supports scripted per-call latency and injected failures, and records completed calls.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{PersistenceGateway, sort_snapshots};
use crate::error::{PersistenceError, PersistenceResult};
use crate::session::types::{Message, MessageId, Session, SessionId, SessionSnapshot};

/// The gateway operation a call corresponds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayCall {
    InitDatabase,
    LoadSessions,
    SaveSession,
    SaveMessage,
    DeleteSession,
}

impl fmt::Display for GatewayCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatewayCall::InitDatabase => "init_database",
            GatewayCall::LoadSessions => "load_sessions",
            GatewayCall::SaveSession => "save_session",
            GatewayCall::SaveMessage => "save_message",
            GatewayCall::DeleteSession => "delete_session",
        };
        f.write_str(name)
    }
}

/// A call that ran to completion (successfully or not), in completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCall {
    pub call: GatewayCall,
    pub session_id: Option<SessionId>,
    pub message_id: Option<MessageId>,
    pub succeeded: bool,
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<SessionId, SessionSnapshot>,
    latencies: VecDeque<Duration>,
    session_latencies: HashMap<SessionId, Duration>,
    failures: HashMap<GatewayCall, u32>,
    completed: Vec<CompletedCall>,
}

#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with previously persisted sessions.
    pub fn with_snapshots(snapshots: impl IntoIterator<Item = SessionSnapshot>) -> Self {
        let gateway = Self::new();
        {
            let mut state = gateway.lock();
            for snapshot in snapshots {
                state.sessions.insert(snapshot.session.id, snapshot);
            }
        }
        gateway
    }

    /// Queue delays consumed one per call, in call-start order.
    pub fn push_latencies(&self, latencies: impl IntoIterator<Item = Duration>) {
        self.lock().latencies.extend(latencies);
    }

    /// Delay every call touching `session_id`, ahead of any queued latencies.
    pub fn delay_session(&self, session_id: SessionId, latency: Duration) {
        self.lock().session_latencies.insert(session_id, latency);
    }

    /// Make the next `times` calls of `call` fail.
    pub fn fail_next(&self, call: GatewayCall, times: u32) {
        self.lock().failures.insert(call, times);
    }

    /// Make every call of `call` fail until `heal` is called.
    pub fn fail_always(&self, call: GatewayCall) {
        self.fail_next(call, u32::MAX);
    }

    pub fn heal(&self) {
        self.lock().failures.clear();
    }

    pub fn completed_calls(&self) -> Vec<CompletedCall> {
        self.lock().completed.clone()
    }

    pub fn stored(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        self.lock().sessions.get(session_id).cloned()
    }

    pub fn stored_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panicking test thread must not wedge every other assertion.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn delay(&self, session_id: Option<&SessionId>) {
        let latency = {
            let mut state = self.lock();
            match session_id.and_then(|id| state.session_latencies.get(id).copied()) {
                Some(latency) => Some(latency),
                None => state.latencies.pop_front(),
            }
        };
        if let Some(latency) = latency.filter(|d| !d.is_zero()) {
            tokio::time::sleep(latency).await;
        }
    }

    fn injected_failure(state: &mut MemoryState, call: GatewayCall) -> PersistenceResult<()> {
        match state.failures.get_mut(&call) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                Err(PersistenceError::Unavailable {
                    reason: format!("injected {} failure", call),
                })
            }
            _ => Ok(()),
        }
    }

    fn record(
        state: &mut MemoryState,
        call: GatewayCall,
        session_id: Option<SessionId>,
        message_id: Option<MessageId>,
        succeeded: bool,
    ) {
        state.completed.push(CompletedCall {
            call,
            session_id,
            message_id,
            succeeded,
        });
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn init_database(&self) -> PersistenceResult<()> {
        self.delay(None).await;
        let mut state = self.lock();
        let result = Self::injected_failure(&mut state, GatewayCall::InitDatabase);
        Self::record(&mut state, GatewayCall::InitDatabase, None, None, result.is_ok());
        result
    }

    async fn load_sessions(&self, project_id: &str) -> PersistenceResult<Vec<SessionSnapshot>> {
        self.delay(None).await;
        let mut state = self.lock();
        let result = Self::injected_failure(&mut state, GatewayCall::LoadSessions);
        Self::record(&mut state, GatewayCall::LoadSessions, None, None, result.is_ok());
        result?;

        let mut snapshots: Vec<SessionSnapshot> = state
            .sessions
            .values()
            .filter(|s| s.session.project_id == project_id)
            .cloned()
            .collect();
        sort_snapshots(&mut snapshots);
        Ok(snapshots)
    }

    async fn save_session(&self, session: &Session) -> PersistenceResult<()> {
        self.delay(Some(&session.id)).await;
        let mut state = self.lock();
        let result = Self::injected_failure(&mut state, GatewayCall::SaveSession);
        Self::record(
            &mut state,
            GatewayCall::SaveSession,
            Some(session.id),
            None,
            result.is_ok(),
        );
        result?;

        state
            .sessions
            .entry(session.id)
            .and_modify(|existing| existing.session = session.clone())
            .or_insert_with(|| SessionSnapshot {
                session: session.clone(),
                messages: Vec::new(),
            });
        Ok(())
    }

    async fn save_message(
        &self,
        session_id: &SessionId,
        message: &Message,
    ) -> PersistenceResult<()> {
        self.delay(Some(session_id)).await;
        let mut state = self.lock();
        let mut result = Self::injected_failure(&mut state, GatewayCall::SaveMessage);
        if result.is_ok() && !state.sessions.contains_key(session_id) {
            result = Err(PersistenceError::SessionNotFound {
                session_id: *session_id,
            });
        }
        Self::record(
            &mut state,
            GatewayCall::SaveMessage,
            Some(*session_id),
            Some(message.id),
            result.is_ok(),
        );
        result?;

        if let Some(snapshot) = state.sessions.get_mut(session_id) {
            if message.timestamp > snapshot.session.updated_at {
                snapshot.session.updated_at = message.timestamp;
            }
            if !snapshot.messages.iter().any(|m| m.id == message.id) {
                snapshot.messages.push(message.clone());
            }
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &SessionId) -> PersistenceResult<()> {
        self.delay(Some(session_id)).await;
        let mut state = self.lock();
        let result = Self::injected_failure(&mut state, GatewayCall::DeleteSession);
        Self::record(
            &mut state,
            GatewayCall::DeleteSession,
            Some(*session_id),
            None,
            result.is_ok(),
        );
        result?;

        state.sessions.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::Role;
    use chrono::Utc;

    fn session(project_id: &str) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::new_v4(),
            project_id: project_id.to_string(),
            runtime_id: "codex".to_string(),
            title: "Session 1".to_string(),
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn fail_next_expires_after_count() {
        let gateway = MemoryGateway::new();
        gateway.fail_next(GatewayCall::SaveSession, 1);
        let s = session("p");

        assert!(gateway.save_session(&s).await.is_err());
        assert!(gateway.save_session(&s).await.is_ok());
        assert_eq!(gateway.stored_count(), 1);
    }

    #[tokio::test]
    async fn save_message_requires_known_session() {
        let gateway = MemoryGateway::new();
        let message = Message {
            id: MessageId::new_v4(),
            role: Role::User,
            content: "hello".to_string(),
            timestamp: Utc::now(),
            metadata: None,
        };
        let err = gateway
            .save_message(&SessionId::new_v4(), &message)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::SessionNotFound { .. }));

        let calls = gateway.completed_calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].succeeded);
    }

    #[tokio::test]
    async fn repeated_save_message_is_stored_once() {
        let gateway = MemoryGateway::new();
        let s = session("p");
        gateway.save_session(&s).await.unwrap();
        let message = Message {
            id: MessageId::new_v4(),
            role: Role::User,
            content: "hello".to_string(),
            timestamp: Utc::now(),
            metadata: None,
        };
        gateway.save_message(&s.id, &message).await.unwrap();
        gateway.save_message(&s.id, &message).await.unwrap();

        assert_eq!(gateway.stored(&s.id).unwrap().messages, vec![message]);
    }

    #[tokio::test]
    async fn load_filters_seeded_sessions_by_project() {
        let a = SessionSnapshot {
            session: session("a"),
            messages: Vec::new(),
        };
        let b = SessionSnapshot {
            session: session("b"),
            messages: Vec::new(),
        };
        let gateway = MemoryGateway::with_snapshots(vec![a.clone(), b]);

        let loaded = gateway.load_sessions("a").await.unwrap();
        assert_eq!(loaded, vec![a]);
    }
}
