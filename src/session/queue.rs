// ABOUTME: Per-session persistence queue — one sequential worker task per session id.
// ABOUTME: Runs gateway calls in enqueue order with timeout/retry and broadcasts each outcome.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{PersistenceError, PersistenceResult};
use crate::gateway::PersistenceGateway;
use crate::session::types::{Message, MessageId, Session, SessionId};

/// Which durable write an outcome refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistOperation {
    SaveSession,
    SaveMessage,
    DeleteSession,
}

impl PersistOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistOperation::SaveSession => "save_session",
            PersistOperation::SaveMessage => "save_message",
            PersistOperation::DeleteSession => "delete_session",
        }
    }
}

impl fmt::Display for PersistOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Out-of-band notification of how an optimistic mutation fared in storage.
#[derive(Debug, Clone)]
pub enum PersistenceEvent {
    Persisted {
        session_id: SessionId,
        operation: PersistOperation,
        message_id: Option<MessageId>,
    },
    Failed {
        session_id: SessionId,
        operation: PersistOperation,
        message_id: Option<MessageId>,
        error: Arc<PersistenceError>,
    },
}

impl PersistenceEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            PersistenceEvent::Persisted { session_id, .. }
            | PersistenceEvent::Failed { session_id, .. } => *session_id,
        }
    }

    pub fn operation(&self) -> PersistOperation {
        match self {
            PersistenceEvent::Persisted { operation, .. }
            | PersistenceEvent::Failed { operation, .. } => *operation,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, PersistenceEvent::Failed { .. })
    }
}

/// Timeout and retry behaviour applied to every gateway call.
#[derive(Debug, Clone)]
pub struct PersistPolicy {
    pub timeout: Duration,
    /// Extra attempts after a failed call. Zero means each mutation makes exactly one call.
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_attempts: 0,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// A durable write for one session.
#[derive(Debug, Clone)]
pub enum PersistCommand {
    SaveSession(Session),
    SaveMessage(Message),
    DeleteSession,
}

impl PersistCommand {
    pub fn operation(&self) -> PersistOperation {
        match self {
            PersistCommand::SaveSession(_) => PersistOperation::SaveSession,
            PersistCommand::SaveMessage(_) => PersistOperation::SaveMessage,
            PersistCommand::DeleteSession => PersistOperation::DeleteSession,
        }
    }

    fn message_id(&self) -> Option<MessageId> {
        match self {
            PersistCommand::SaveMessage(message) => Some(message.id),
            _ => None,
        }
    }
}

enum PersistJob {
    Run(PersistCommand),
    Flush(oneshot::Sender<()>),
}

struct Worker {
    tx: mpsc::UnboundedSender<PersistJob>,
    handle: JoinHandle<()>,
}

/// Dispatches persistence commands to per-session workers.
///
/// Commands for one session run strictly one after another in enqueue order;
/// commands for different sessions run concurrently. Workers are spawned on
/// the current Tokio runtime the first time a session is enqueued.
///
/// A call abandoned by the timeout may still complete in the background, for
/// example a file write already handed to the blocking pool. Its effect can
/// then land after later commands for the same session, so order is only
/// guaranteed for calls that resolved before the timeout. Timed-out message
/// saves are never retried, and both gateways ignore a repeated message id.
pub struct PersistenceQueue {
    gateway: Arc<dyn PersistenceGateway>,
    policy: PersistPolicy,
    events: broadcast::Sender<PersistenceEvent>,
    workers: HashMap<SessionId, Worker>,
    retired: Vec<JoinHandle<()>>,
}

impl PersistenceQueue {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, policy: PersistPolicy, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            gateway,
            policy,
            events,
            workers: HashMap::new(),
            retired: Vec::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PersistenceEvent> {
        self.events.subscribe()
    }

    /// Queue a command behind every earlier command for the same session.
    pub fn enqueue(&mut self, session_id: SessionId, command: PersistCommand) {
        debug!(%session_id, operation = %command.operation(), "queueing persistence call");
        let job = PersistJob::Run(command);
        let job = match self.workers.get(&session_id) {
            Some(worker) => match worker.tx.send(job) {
                Ok(()) => return,
                // The worker died (a gateway call panicked); fall through and replace it.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let worker = self.spawn_worker(session_id);
        if worker.tx.send(job).is_err() {
            warn!(%session_id, "persistence worker exited before accepting a job");
        }
        if let Some(old) = self.workers.insert(session_id, worker) {
            self.retired.push(old.handle);
        }
    }

    /// Stop accepting work for a session. Its worker drains what is queued, then exits.
    pub fn retire(&mut self, session_id: &SessionId) {
        if let Some(worker) = self.workers.remove(session_id) {
            drop(worker.tx);
            self.retired.push(worker.handle);
        }
    }

    /// Retire every worker whose session fails `present`.
    pub fn retire_absent(&mut self, present: impl Fn(&SessionId) -> bool) {
        let absent: Vec<SessionId> = self
            .workers
            .keys()
            .filter(|id| !present(id))
            .copied()
            .collect();
        for session_id in absent {
            debug!(%session_id, "retiring worker for session absent from storage");
            self.retire(&session_id);
        }
    }

    /// Wait until every command queued so far has finished.
    pub async fn flush(&mut self) {
        let mut acks = Vec::with_capacity(self.workers.len());
        for worker in self.workers.values() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if worker.tx.send(PersistJob::Flush(ack_tx)).is_ok() {
                acks.push(ack_rx);
            }
        }
        let retired: Vec<JoinHandle<()>> = self.retired.drain(..).collect();

        futures::future::join_all(acks).await;
        for handle in retired {
            if let Err(e) = handle.await {
                warn!(error = %e, "persistence worker ended abnormally");
            }
        }
    }

    /// Number of sessions with a live worker.
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    fn spawn_worker(&self, session_id: SessionId) -> Worker {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(
            session_id,
            self.gateway.clone(),
            self.policy.clone(),
            self.events.clone(),
            rx,
        ));
        Worker { tx, handle }
    }
}

async fn run_worker(
    session_id: SessionId,
    gateway: Arc<dyn PersistenceGateway>,
    policy: PersistPolicy,
    events: broadcast::Sender<PersistenceEvent>,
    mut rx: mpsc::UnboundedReceiver<PersistJob>,
) {
    while let Some(job) = rx.recv().await {
        let command = match job {
            PersistJob::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
            PersistJob::Run(command) => command,
        };

        let operation = command.operation();
        let message_id = command.message_id();
        let event = match execute(session_id, &command, gateway.as_ref(), &policy).await {
            Ok(()) => {
                debug!(%session_id, %operation, "persisted");
                PersistenceEvent::Persisted {
                    session_id,
                    operation,
                    message_id,
                }
            }
            Err(error) => {
                warn!(%session_id, %operation, %error, "persistence call failed");
                PersistenceEvent::Failed {
                    session_id,
                    operation,
                    message_id,
                    error: Arc::new(error),
                }
            }
        };
        // No subscribers is fine; the outcome has already been logged.
        let _ = events.send(event);
    }
    debug!(%session_id, "persistence worker stopped");
}

async fn execute(
    session_id: SessionId,
    command: &PersistCommand,
    gateway: &dyn PersistenceGateway,
    policy: &PersistPolicy,
) -> PersistenceResult<()> {
    let mut attempt = 0;
    loop {
        match call_once(session_id, command, gateway, policy.timeout).await {
            Ok(()) => return Ok(()),
            Err(error) if attempt < policy.retry_attempts && is_retryable(command, &error) => {
                attempt += 1;
                warn!(
                    %session_id,
                    operation = %command.operation(),
                    %error,
                    attempt,
                    "retrying persistence call"
                );
                tokio::time::sleep(policy.retry_backoff).await;
            }
            Err(error) => return Err(error),
        }
    }
}

async fn call_once(
    session_id: SessionId,
    command: &PersistCommand,
    gateway: &dyn PersistenceGateway,
    timeout: Duration,
) -> PersistenceResult<()> {
    let call = match command {
        PersistCommand::SaveSession(session) => gateway.save_session(session),
        PersistCommand::SaveMessage(message) => gateway.save_message(&session_id, message),
        PersistCommand::DeleteSession => gateway.delete_session(&session_id),
    };
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(PersistenceError::TimedOut {
            operation: command.operation().as_str(),
            after: timeout,
        }),
    }
}

/// The backend not knowing a session will not change by asking again, and a
/// timed-out append may still land, so appending again could reorder the log.
fn is_retryable(command: &PersistCommand, error: &PersistenceError) -> bool {
    match error {
        PersistenceError::SessionNotFound { .. } => false,
        PersistenceError::TimedOut { .. } => !matches!(command, PersistCommand::SaveMessage(_)),
        _ => true,
    }
}
