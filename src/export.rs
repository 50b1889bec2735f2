// ABOUTME: Session export — renders a session and its conversation as Markdown or JSON.
// ABOUTME: Formats are parsed from user input; unknown formats are validation errors.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{SessionError, SessionResult};
use crate::session::types::{Message, Role, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Markdown,
    Json,
}

impl FromStr for ExportFormat {
    type Err = SessionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "json" => Ok(ExportFormat::Json),
            other => Err(SessionError::validation(
                "format",
                format!("unsupported export format '{}', expected markdown or json", other),
            )),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Markdown => f.write_str("markdown"),
            ExportFormat::Json => f.write_str("json"),
        }
    }
}

pub fn render(session: &Session, messages: &[Message], format: ExportFormat) -> SessionResult<String> {
    match format {
        ExportFormat::Markdown => Ok(to_markdown(session, messages)),
        ExportFormat::Json => to_json(session, messages),
    }
}

fn to_markdown(session: &Session, messages: &[Message]) -> String {
    let mut output = String::new();
    output.push_str(&format!("# {}\n\n", session.title));
    output.push_str(&format!("**Session ID:** {}\n", session.id));
    output.push_str(&format!("**Project ID:** {}\n", session.project_id));
    output.push_str(&format!("**Runtime ID:** {}\n", session.runtime_id));
    output.push_str(&format!("**Created:** {}\n", format_timestamp(&session.created_at)));
    output.push_str(&format!("**Updated:** {}\n\n", format_timestamp(&session.updated_at)));
    if !session.tags.is_empty() {
        output.push_str(&format!("**Tags:** {}\n\n", session.tags.join(", ")));
    }
    output.push_str("---\n\n");

    for message in messages {
        let label = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        output.push_str(&format!("## {} - {}\n\n", label, format_timestamp(&message.timestamp)));
        output.push_str(&message.content);
        output.push_str("\n\n---\n\n");
    }
    output
}

fn to_json(session: &Session, messages: &[Message]) -> SessionResult<String> {
    #[derive(Serialize)]
    struct ExportData<'a> {
        session: &'a Session,
        messages: &'a [Message],
    }

    serde_json::to_string_pretty(&ExportData { session, messages })
        .map_err(|e| SessionError::Persistence(e.into()))
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
