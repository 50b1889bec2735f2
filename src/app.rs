// ABOUTME: App orchestrator — wires config, gateway, and session store for one CLI command.
// ABOUTME: Loads the project's sessions, runs the command, flushes persistence, reports failures.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::warn;

use crate::config::Config;
use crate::export::ExportFormat;
use crate::gateway::{JsonFileGateway, MemoryGateway, PersistenceGateway};
use crate::session::{NewMessage, PersistenceEvent, SessionId, SessionStore};

/// One operation against the project's sessions.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create a session for a tool runtime.
    New {
        /// Runtime the session talks to (e.g. claude-cli, codex).
        #[arg(long)]
        runtime: String,
        /// Title instead of the generated "Session N".
        #[arg(long)]
        title: Option<String>,
    },
    /// List sessions, most recently updated first.
    List,
    /// Append a message to a session.
    Send {
        session: String,
        content: String,
        #[arg(long, default_value = "user")]
        role: String,
    },
    /// Print a session's conversation.
    Show { session: String },
    /// Change a session's title.
    Rename { session: String, title: String },
    /// Replace a session's tags. No tags clears them.
    Tag { session: String, tags: Vec<String> },
    /// Delete a session and its messages.
    Delete { session: String },
    /// Search message content across the project's sessions.
    Search { query: String },
    /// Export a session as markdown or json.
    Export {
        session: String,
        #[arg(long, default_value = "markdown")]
        format: String,
        /// Write to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// Top-level application for a single invocation.
pub struct App {
    config: Config,
    project: String,
    ephemeral: bool,
}

impl App {
    pub fn new(config: Config, project: impl Into<String>, ephemeral: bool) -> Self {
        Self {
            config,
            project: project.into(),
            ephemeral,
        }
    }

    /// Run a command, writing human-readable output to stdout.
    pub async fn run(self, command: Command) -> anyhow::Result<()> {
        let mut out = std::io::stdout();
        self.run_with_output(command, &mut out).await
    }

    /// Run a command against a fresh store, writing output to `out`.
    pub async fn run_with_output(self, command: Command, out: &mut dyn Write) -> anyhow::Result<()> {
        let gateway: Arc<dyn PersistenceGateway> = if self.ephemeral {
            Arc::new(MemoryGateway::new())
        } else {
            Arc::new(JsonFileGateway::new(self.config.data_dir()))
        };

        let mut store = SessionStore::new(
            gateway,
            self.project.clone(),
            self.config.persistence.store_options(),
        );
        let mut events = store.subscribe_persistence();

        store
            .initialize()
            .await
            .context("failed to initialize session storage")?;
        store
            .load_sessions()
            .await
            .context("failed to load sessions")?;

        let result = execute(&mut store, &self.project, command, out);

        // Optimistic changes are already applied; wait for their durable writes either way.
        store.flush().await;
        let failures = drain_failures(&mut events);
        result?;

        if failures > 0 {
            anyhow::bail!("{} persistence call(s) failed; see log for details", failures);
        }
        Ok(())
    }
}

fn execute(
    store: &mut SessionStore,
    project: &str,
    command: Command,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    match command {
        Command::New { runtime, title } => {
            let mut session = store.create_session(project, &runtime)?;
            if let Some(title) = title {
                session = store.rename_session(&session.id, &title)?;
            }
            writeln!(out, "{}\t{}", session.id, session.title)?;
        }
        Command::List => {
            for session in store.sessions() {
                let count = store.conversation(&session.id).map_or(0, |c| c.len());
                writeln!(
                    out,
                    "{}\t{}\t{}\t{} messages\t{}",
                    session.id,
                    session.title,
                    session.runtime_id,
                    count,
                    session.updated_at.format("%Y-%m-%d %H:%M")
                )?;
            }
        }
        Command::Send {
            session,
            content,
            role,
        } => {
            let id = resolve_session(store, &session)?;
            let message = store.add_message(&id, NewMessage::new(role, content))?;
            writeln!(out, "{}", message.id)?;
        }
        Command::Show { session } => {
            let id = resolve_session(store, &session)?;
            store.set_current_session(&id)?;
            if let Some(conversation) = store.current_conversation() {
                for message in conversation {
                    writeln!(
                        out,
                        "[{}] {}: {}",
                        message.timestamp.format("%H:%M:%S"),
                        message.role,
                        message.content
                    )?;
                }
            }
        }
        Command::Rename { session, title } => {
            let id = resolve_session(store, &session)?;
            let renamed = store.rename_session(&id, &title)?;
            writeln!(out, "{}\t{}", renamed.id, renamed.title)?;
        }
        Command::Tag { session, tags } => {
            let id = resolve_session(store, &session)?;
            let tagged = store.set_session_tags(&id, &tags)?;
            writeln!(out, "{}\t{}", tagged.id, tagged.tags.join(","))?;
        }
        Command::Delete { session } => {
            let id = resolve_session(store, &session)?;
            store.delete_session(&id)?;
            writeln!(out, "deleted {}", id)?;
        }
        Command::Search { query } => {
            for hit in store.search_messages(&query) {
                writeln!(out, "{}\t{}\t{}", hit.session_id, hit.role, hit.highlight)?;
            }
        }
        Command::Export {
            session,
            format,
            output,
        } => {
            let id = resolve_session(store, &session)?;
            let format: ExportFormat = format.parse()?;
            let rendered = store.export_session(&id, format)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    writeln!(out, "exported {} to {}", id, path.display())?;
                }
                None => write!(out, "{}", rendered)?,
            }
        }
    }
    Ok(())
}

/// Accept a full session id or an unambiguous prefix of one.
fn resolve_session(store: &SessionStore, raw: &str) -> anyhow::Result<SessionId> {
    if let Ok(id) = SessionId::parse(raw) {
        return Ok(id);
    }
    let prefix = raw.trim().to_ascii_lowercase();
    if prefix.is_empty() {
        anyhow::bail!("session id must not be empty");
    }
    let mut matches = store
        .sessions()
        .map(|s| s.id)
        .filter(|id| id.to_string().starts_with(&prefix));
    match (matches.next(), matches.next()) {
        (Some(id), None) => Ok(id),
        (None, _) => anyhow::bail!("no session matches '{}'", raw),
        (Some(_), Some(_)) => anyhow::bail!("'{}' matches more than one session", raw),
    }
}

/// Count failed persistence outcomes delivered so far.
fn drain_failures(events: &mut tokio::sync::broadcast::Receiver<PersistenceEvent>) -> usize {
    let mut failures = 0;
    loop {
        match events.try_recv() {
            Ok(PersistenceEvent::Failed {
                session_id,
                operation,
                error,
                ..
            }) => {
                eprintln!("Warning: {} for session {} failed: {}", operation, session_id, error);
                failures += 1;
            }
            Ok(PersistenceEvent::Persisted { .. }) => {}
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "persistence outcomes dropped before they were read");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    failures
}
