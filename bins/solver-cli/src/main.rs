mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "solver-cli")]
#[command(about = "Solver CLI - Run code in sessions and manage session storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run code files (or stdin) against one session, in order
    Run {
        /// Session id
        #[arg(short, long)]
        session: String,

        /// Per-submission timeout in seconds (0 = configured default)
        #[arg(short, long, default_value = "0")]
        timeout: u64,

        /// Print each result as JSON
        #[arg(long, default_value = "false")]
        json: bool,

        /// Code files; each one is a separate submission
        files: Vec<PathBuf>,
    },

    /// Admit a local file into a session's inputs
    Upload {
        /// Session id
        #[arg(short, long)]
        session: String,

        /// File to upload
        #[arg(short, long)]
        file: PathBuf,

        /// Name inside the session (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show a session's storage usage
    Usage {
        /// Session id
        #[arg(short, long)]
        session: String,
    },

    /// Delete all data of a session
    Cleanup {
        /// Session id
        #[arg(short, long)]
        session: String,
    },

    /// Remove sessions idle for longer than the retention window
    Reap {
        /// Override the configured retention window
        #[arg(long)]
        retention_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = commands::Context::from_env().await?;

    match cli.command {
        Commands::Run { session, timeout, json, files } => {
            commands::run(&ctx, &session, timeout, json, &files).await?;
        }
        Commands::Upload { session, file, name } => {
            commands::upload(&ctx, &session, &file, name.as_deref()).await?;
        }
        Commands::Usage { session } => {
            commands::usage(&ctx, &session).await?;
        }
        Commands::Cleanup { session } => {
            commands::cleanup(&ctx, &session).await;
        }
        Commands::Reap { retention_secs } => {
            commands::reap(&ctx, retention_secs).await;
        }
    }

    ctx.coordinator.shutdown().await;
    Ok(())
}
