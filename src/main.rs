// ABOUTME: Entry point for convoy — manages per-project AI conversation sessions from the shell.
// ABOUTME: Parses CLI args, loads config, installs logging, and runs one command.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use convoy::app::{App, Command};
use convoy::config::Config;

#[derive(Debug, Parser)]
#[command(name = "convoy", version, about = "Conversation sessions per project and runtime")]
struct Cli {
    /// Project the sessions belong to (defaults to the current directory).
    #[arg(long, global = true)]
    project: Option<String>,

    /// Config file to use instead of ~/.convoy/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Keep sessions in memory only; nothing is written to disk.
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let _ = dotenvy::from_path(Config::env_path());

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let project = match cli.project {
        Some(project) => project,
        None => std::env::current_dir()?.to_string_lossy().to_string(),
    };

    App::new(config, project, cli.memory).run(cli.command).await
}
