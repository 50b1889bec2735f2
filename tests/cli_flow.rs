// ABOUTME: End-to-end tests for the convoy command flow against an on-disk data dir.
// ABOUTME: Each command runs in a fresh App, so state must round-trip through storage.

use std::path::Path;

use convoy::app::{App, Command};
use convoy::config::Config;

fn config_for(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = Some(dir.to_path_buf());
    config
}

async fn run(dir: &Path, command: Command) -> anyhow::Result<String> {
    let mut out = Vec::new();
    App::new(config_for(dir), "project-p", false)
        .run_with_output(command, &mut out)
        .await?;
    Ok(String::from_utf8(out).unwrap())
}

fn first_field(line: &str) -> String {
    line.split('\t').next().unwrap().trim().to_string()
}

#[tokio::test]
async fn new_send_show_round_trip() {
    let tmp = tempfile::tempdir().unwrap();

    let created = run(
        tmp.path(),
        Command::New {
            runtime: "claude-cli".to_string(),
            title: None,
        },
    )
    .await
    .unwrap();
    let id = first_field(&created);
    assert!(created.trim_end().ends_with("Session 1"));

    for (role, content) in [("user", "Hello AI"), ("assistant", "Hi there")] {
        run(
            tmp.path(),
            Command::Send {
                session: id.clone(),
                content: content.to_string(),
                role: role.to_string(),
            },
        )
        .await
        .unwrap();
    }

    let shown = run(tmp.path(), Command::Show { session: id.clone() })
        .await
        .unwrap();
    let lines: Vec<&str> = shown.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("user: Hello AI"));
    assert!(lines[1].ends_with("assistant: Hi there"));

    let listed = run(tmp.path(), Command::List).await.unwrap();
    assert!(listed.contains("2 messages"));
}

#[tokio::test]
async fn send_with_unknown_role_fails_without_writing() {
    let tmp = tempfile::tempdir().unwrap();
    let created = run(
        tmp.path(),
        Command::New {
            runtime: "codex".to_string(),
            title: None,
        },
    )
    .await
    .unwrap();
    let id = first_field(&created);

    let err = run(
        tmp.path(),
        Command::Send {
            session: id.clone(),
            content: "ls".to_string(),
            role: "tool".to_string(),
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("role"));

    let shown = run(tmp.path(), Command::Show { session: id }).await.unwrap();
    assert!(shown.is_empty());
}

#[tokio::test]
async fn rename_search_export_and_delete() {
    let tmp = tempfile::tempdir().unwrap();
    let created = run(
        tmp.path(),
        Command::New {
            runtime: "codex".to_string(),
            title: Some("Parser work".to_string()),
        },
    )
    .await
    .unwrap();
    let id = first_field(&created);
    let prefix = id[..8].to_string();

    run(
        tmp.path(),
        Command::Send {
            session: prefix.clone(),
            content: "Please fix the tokenizer".to_string(),
            role: "user".to_string(),
        },
    )
    .await
    .unwrap();

    let renamed = run(
        tmp.path(),
        Command::Rename {
            session: prefix.clone(),
            title: "Tokenizer fix".to_string(),
        },
    )
    .await
    .unwrap();
    assert!(renamed.trim_end().ends_with("Tokenizer fix"));

    let tagged = run(
        tmp.path(),
        Command::Tag {
            session: prefix.clone(),
            tags: vec!["lexer".to_string(), "bug".to_string()],
        },
    )
    .await
    .unwrap();
    assert!(tagged.trim_end().ends_with("lexer,bug"));

    let hits = run(
        tmp.path(),
        Command::Search {
            query: "TOKENIZER".to_string(),
        },
    )
    .await
    .unwrap();
    assert!(hits.contains("<mark>tokenizer</mark>"));

    let exported = run(
        tmp.path(),
        Command::Export {
            session: prefix.clone(),
            format: "markdown".to_string(),
            output: None,
        },
    )
    .await
    .unwrap();
    assert!(exported.starts_with("# Tokenizer fix"));
    assert!(exported.contains("Please fix the tokenizer"));
    assert!(exported.contains("**Tags:** lexer, bug"));

    let out_file = tmp.path().join("export.json");
    run(
        tmp.path(),
        Command::Export {
            session: prefix.clone(),
            format: "json".to_string(),
            output: Some(out_file.clone()),
        },
    )
    .await
    .unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out_file).unwrap()).unwrap();
    assert_eq!(json["session"]["title"], "Tokenizer fix");
    assert_eq!(json["messages"].as_array().unwrap().len(), 1);

    run(tmp.path(), Command::Delete { session: prefix.clone() })
        .await
        .unwrap();
    let listed = run(tmp.path(), Command::List).await.unwrap();
    assert!(listed.is_empty());
    assert!(run(tmp.path(), Command::Show { session: prefix }).await.is_err());
}
