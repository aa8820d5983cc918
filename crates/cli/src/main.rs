//! Quill CLI: the main entry point.
//!
//! - `quill "<prompt>"`: start a writing run
//! - `quill --recover <file>`: continue from a context summary or checkpoint
//! - `quill config show|path|init`: inspect or create the config file

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "quill",
    about = "Quill: an autonomous writing agent for novels, books and story collections",
    version,
    args_conflicts_with_subcommands = true,
    after_help = "Examples:\n  \
        quill \"Create a collection of sci-fi short stories\"\n  \
        quill --recover output/My_Story/.context_summary_20250107_143022_512.md"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    write: commands::write::WriteArgs,

    /// Config file (defaults to ~/.quill/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Write a default config file if none exists
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so streamed model output on stdout stays clean.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Config { action }) => match action {
            ConfigAction::Show => commands::config_cmd::show(cli.config.as_deref())?,
            ConfigAction::Path => commands::config_cmd::path(cli.config.as_deref()),
            ConfigAction::Init => commands::config_cmd::init(cli.config.as_deref())?,
        },
        None => commands::write::run(cli.write, cli.config.as_deref()).await?,
    }

    Ok(())
}
