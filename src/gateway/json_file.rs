// ABOUTME: JSON-file persistence gateway — one directory per session under a data root.
// ABOUTME: session.json is replaced atomically (tmp + rename); messages.jsonl is append-only.

use std::collections::HashSet;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use super::{PersistenceGateway, sort_snapshots};
use crate::error::{PersistenceError, PersistenceResult};
use crate::session::types::{Message, Session, SessionId, SessionSnapshot};

const SESSION_FILE: &str = "session.json";
const MESSAGES_FILE: &str = "messages.jsonl";

/// A single JSONL log line: when it was written and the message itself.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub logged_at: String,
    pub message: Message,
}

/// Stores each session at `{root}/{session_id}/`.
#[derive(Debug, Clone)]
pub struct JsonFileGateway {
    root: PathBuf,
}

impl JsonFileGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one session's files.
    pub fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(session_id.to_string())
    }

    async fn load_dir(&self, dir: &Path, project_id: &str) -> PersistenceResult<Option<SessionSnapshot>> {
        let session_path = dir.join(SESSION_FILE);
        let mut session = match read_session(&session_path).await {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(None),
            // The record's project is unreadable too, so skip it rather than block every load.
            Err(PersistenceError::Corrupt { reason, .. }) => {
                warn!(path = %session_path.display(), %reason, "skipping unreadable session record");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if session.project_id != project_id {
            return Ok(None);
        }
        let messages = read_messages(&dir.join(MESSAGES_FILE)).await?;
        // Appends don't rewrite session.json, so fold the newest message into updated_at.
        if let Some(last) = messages.last() {
            if last.timestamp > session.updated_at {
                session.updated_at = last.timestamp;
            }
        }
        Ok(Some(SessionSnapshot { session, messages }))
    }
}

#[async_trait]
impl PersistenceGateway for JsonFileGateway {
    async fn init_database(&self) -> PersistenceResult<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| PersistenceError::io(&self.root, e))
    }

    async fn load_sessions(&self, project_id: &str) -> PersistenceResult<Vec<SessionSnapshot>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(&self.root, e)),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PersistenceError::io(&self.root, e))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| PersistenceError::io(&path, e))?;
            if !file_type.is_dir() {
                continue;
            }
            if let Some(snapshot) = self.load_dir(&path, project_id).await? {
                snapshots.push(snapshot);
            }
        }

        sort_snapshots(&mut snapshots);
        Ok(snapshots)
    }

    async fn save_session(&self, session: &Session) -> PersistenceResult<()> {
        let dir = self.session_dir(&session.id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| PersistenceError::io(&dir, e))?;

        let path = dir.join(SESSION_FILE);
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(session)?;
        fs::write(&tmp_path, &content)
            .await
            .map_err(|e| PersistenceError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| PersistenceError::io(&path, e))?;
        Ok(())
    }

    async fn save_message(
        &self,
        session_id: &SessionId,
        message: &Message,
    ) -> PersistenceResult<()> {
        let dir = self.session_dir(session_id);
        let session_path = dir.join(SESSION_FILE);
        let known = fs::try_exists(&session_path)
            .await
            .map_err(|e| PersistenceError::io(&session_path, e))?;
        if !known {
            return Err(PersistenceError::SessionNotFound {
                session_id: *session_id,
            });
        }

        let entry = LogEntry {
            logged_at: Utc::now().to_rfc3339(),
            message: message.clone(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let path = dir.join(MESSAGES_FILE);
        trim_torn_tail(&path).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| PersistenceError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| PersistenceError::io(&path, e))?;
        file.flush()
            .await
            .map_err(|e| PersistenceError::io(&path, e))?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &SessionId) -> PersistenceResult<()> {
        let dir = self.session_dir(session_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::io(&dir, e)),
        }
    }
}

/// Read a session record, returning `None` when the file is missing.
async fn read_session(path: &Path) -> PersistenceResult<Option<Session>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PersistenceError::io(path, e)),
    };
    let session = serde_json::from_str(&content).map_err(|e| PersistenceError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(Some(session))
}

/// Cut an interrupted append back to the last complete line so the next
/// entry starts on a line of its own.
async fn trim_torn_tail(path: &Path) -> PersistenceResult<()> {
    let mut file = match fs::OpenOptions::new().read(true).write(true).open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PersistenceError::io(path, e)),
    };
    let len = file
        .metadata()
        .await
        .map_err(|e| PersistenceError::io(path, e))?
        .len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))
        .await
        .map_err(|e| PersistenceError::io(path, e))?;
    file.read_exact(&mut last)
        .await
        .map_err(|e| PersistenceError::io(path, e))?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let content = fs::read(path)
        .await
        .map_err(|e| PersistenceError::io(path, e))?;
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);
    warn!(
        path = %path.display(),
        dropped_bytes = content.len() - keep,
        "trimming torn final log line before append"
    );
    file.set_len(keep as u64)
        .await
        .map_err(|e| PersistenceError::io(path, e))
}

/// Read the message log in append order. A missing log means no messages yet.
///
/// An unparseable final line is what an interrupted append leaves behind and is
/// skipped; anything unparseable before it is corruption. Repeated message ids
/// keep their first entry, so re-appending a message is harmless.
async fn read_messages(path: &Path) -> PersistenceResult<Vec<Message>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PersistenceError::io(path, e)),
    };

    let lines: Vec<(usize, &str)> = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();
    let mut messages = Vec::with_capacity(lines.len());
    let mut seen = HashSet::with_capacity(lines.len());
    for (position, (index, line)) in lines.iter().enumerate() {
        let entry: LogEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) if position + 1 == lines.len() => {
                warn!(path = %path.display(), line = index + 1, error = %e, "skipping torn final log line");
                break;
            }
            Err(e) => {
                return Err(PersistenceError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("line {}: {}", index + 1, e),
                });
            }
        };
        if !seen.insert(entry.message.id) {
            warn!(path = %path.display(), message_id = %entry.message.id, "ignoring repeated message entry");
            continue;
        }
        messages.push(entry.message);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{MessageId, Role};
    use chrono::Duration;

    fn sample_session(project_id: &str) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::new_v4(),
            project_id: project_id.to_string(),
            runtime_id: "claude-cli".to_string(),
            title: "Session 1".to_string(),
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
        }
    }

    fn sample_message(role: Role, content: &str) -> Message {
        Message {
            id: MessageId::new_v4(),
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn load_from_missing_root_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path().join("does_not_exist"));
        let loaded = gateway.load_sessions("p").await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn session_and_messages_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path());
        gateway.init_database().await.unwrap();

        let session = sample_session("project-a");
        gateway.save_session(&session).await.unwrap();
        let first = sample_message(Role::User, "Hello AI");
        let second = sample_message(Role::Assistant, "Hi there");
        gateway.save_message(&session.id, &first).await.unwrap();
        gateway.save_message(&session.id, &second).await.unwrap();

        let loaded = gateway.load_sessions("project-a").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].session.id, session.id);
        assert_eq!(loaded[0].messages, vec![first, second]);
    }

    #[tokio::test]
    async fn load_filters_by_project() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path());
        gateway.save_session(&sample_session("project-a")).await.unwrap();
        gateway.save_session(&sample_session("project-b")).await.unwrap();

        let loaded = gateway.load_sessions("project-b").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].session.project_id, "project-b");
    }

    #[tokio::test]
    async fn load_orders_by_most_recent_update() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path());

        let mut older = sample_session("p");
        older.updated_at = Utc::now() - Duration::hours(1);
        let newer = sample_session("p");
        gateway.save_session(&older).await.unwrap();
        gateway.save_session(&newer).await.unwrap();

        let loaded = gateway.load_sessions("p").await.unwrap();
        let ids: Vec<SessionId> = loaded.iter().map(|s| s.session.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn save_message_for_unknown_session_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path());
        let id = SessionId::new_v4();

        let err = gateway
            .save_message(&id, &sample_message(Role::User, "orphan"))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::SessionNotFound { session_id } if session_id == id));
    }

    #[tokio::test]
    async fn save_session_is_atomic_and_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path());

        let mut session = sample_session("p");
        gateway.save_session(&session).await.unwrap();
        session.title = "Renamed".to_string();
        gateway.save_session(&session).await.unwrap();

        let path = gateway.session_dir(&session.id).join(SESSION_FILE);
        assert!(path.exists(), "session.json should exist after save");
        assert!(
            !path.with_extension("json.tmp").exists(),
            "session.json.tmp should not exist after a successful save"
        );

        let loaded = gateway.load_sessions("p").await.unwrap();
        assert_eq!(loaded[0].session.title, "Renamed");
    }

    #[tokio::test]
    async fn delete_removes_session_and_tolerates_unknown_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path());

        let session = sample_session("p");
        gateway.save_session(&session).await.unwrap();
        gateway
            .save_message(&session.id, &sample_message(Role::User, "bye"))
            .await
            .unwrap();
        gateway.delete_session(&session.id).await.unwrap();

        assert!(!gateway.session_dir(&session.id).exists());
        assert!(gateway.load_sessions("p").await.unwrap().is_empty());
        gateway.delete_session(&SessionId::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_line_inside_log_reports_location() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path());
        let session = sample_session("p");
        gateway.save_session(&session).await.unwrap();
        std::fs::write(
            gateway.session_dir(&session.id).join(MESSAGES_FILE),
            "{not json}\n",
        )
        .unwrap();
        gateway
            .save_message(&session.id, &sample_message(Role::User, "after"))
            .await
            .unwrap();

        let err = gateway.load_sessions("p").await.unwrap_err();
        match err {
            PersistenceError::Corrupt { reason, .. } => assert!(reason.starts_with("line 1")),
            other => panic!("expected Corrupt, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn torn_final_log_line_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path());
        let session = sample_session("p");
        gateway.save_session(&session).await.unwrap();
        let first = sample_message(Role::User, "Hello AI");
        gateway.save_message(&session.id, &first).await.unwrap();

        let log = gateway.session_dir(&session.id).join(MESSAGES_FILE);
        let mut content = std::fs::read_to_string(&log).unwrap();
        content.push_str(r#"{"logged_at":"2026-01-01T00:00:00Z","message":{"id":"#);
        std::fs::write(&log, content).unwrap();

        let loaded = gateway.load_sessions("p").await.unwrap();
        assert_eq!(loaded[0].messages, vec![first]);
    }

    #[tokio::test]
    async fn append_after_torn_tail_starts_a_clean_line() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path());
        let session = sample_session("p");
        gateway.save_session(&session).await.unwrap();
        let first = sample_message(Role::User, "before crash");
        gateway.save_message(&session.id, &first).await.unwrap();

        let log = gateway.session_dir(&session.id).join(MESSAGES_FILE);
        let mut content = std::fs::read_to_string(&log).unwrap();
        content.push_str(r#"{"logged_at":"#);
        std::fs::write(&log, content).unwrap();

        let second = sample_message(Role::User, "after restart");
        gateway.save_message(&session.id, &second).await.unwrap();
        let third = sample_message(Role::Assistant, "welcome back");
        gateway.save_message(&session.id, &third).await.unwrap();

        let loaded = gateway.load_sessions("p").await.unwrap();
        assert_eq!(loaded[0].messages, vec![first, second, third]);
    }

    #[tokio::test]
    async fn unreadable_session_record_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path());
        let session = sample_session("project-a");
        gateway.save_session(&session).await.unwrap();

        let broken = tmp.path().join("other");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(SESSION_FILE), r#"{"id":"#).unwrap();

        let loaded = gateway.load_sessions("project-a").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].session.id, session.id);
    }

    #[tokio::test]
    async fn repeated_message_append_loads_once() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path());
        let session = sample_session("p");
        gateway.save_session(&session).await.unwrap();
        let first = sample_message(Role::User, "once");
        let second = sample_message(Role::Assistant, "twice");
        gateway.save_message(&session.id, &first).await.unwrap();
        gateway.save_message(&session.id, &first).await.unwrap();
        gateway.save_message(&session.id, &second).await.unwrap();

        let loaded = gateway.load_sessions("p").await.unwrap();
        assert_eq!(loaded[0].messages, vec![first, second]);
    }

    #[tokio::test]
    async fn tags_roundtrip_and_default_to_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path());

        let mut tagged = sample_session("p");
        tagged.tags = vec!["bug".to_string(), "parser".to_string()];
        gateway.save_session(&tagged).await.unwrap();

        // Records written before tags existed have no "tags" key.
        let untagged = sample_session("p");
        let mut value = serde_json::to_value(&untagged).unwrap();
        value.as_object_mut().unwrap().remove("tags");
        let dir = gateway.session_dir(&untagged.id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(SESSION_FILE), value.to_string()).unwrap();

        let loaded = gateway.load_sessions("p").await.unwrap();
        let tags_of = |id: SessionId| {
            loaded
                .iter()
                .find(|s| s.session.id == id)
                .map(|s| s.session.tags.clone())
                .unwrap()
        };
        assert_eq!(tags_of(tagged.id), vec!["bug", "parser"]);
        assert!(tags_of(untagged.id).is_empty());
    }

    #[tokio::test]
    async fn appended_message_advances_loaded_updated_at() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::new(tmp.path());

        let mut session = sample_session("p");
        session.updated_at = Utc::now() - Duration::minutes(10);
        gateway.save_session(&session).await.unwrap();
        let message = sample_message(Role::User, "later");
        gateway.save_message(&session.id, &message).await.unwrap();

        let loaded = gateway.load_sessions("p").await.unwrap();
        assert_eq!(loaded[0].session.updated_at, message.timestamp);
    }
}
