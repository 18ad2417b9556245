//! Frontdesk sync daemon - command-line access to the hotel-ops realtime store.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use frontdesk_config_and_utils::{init_logging, Config, Paths};

/// Frontdesk sync command-line interface.
#[derive(Parser)]
#[command(name = "frontdesk-syncd")]
#[command(about = "Realtime sync for arrivals, presence and chat")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (config, logs, flags). Defaults to ~/.frontdesk
    #[arg(long, global = true, env = "FRONTDESK_HOME")]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for the realtime connection and report it
    Status,
    /// Write a session document from a JSON file
    Import {
        file: PathBuf,
        /// Overwrite even if the remote copy is newer
        #[arg(long)]
        force: bool,
    },
    /// List sessions, most recently modified first
    Sessions,
    /// Stream guest list changes of one session until Ctrl-C
    Watch {
        session_id: String,
        /// Name shown to other viewers
        #[arg(long, default_value = "frontdesk-syncd")]
        user: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let mut config = Config::load(&paths)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_logging(&paths, &config.log_level);

    let app = app::App::start(config, paths).await?;
    match cli.command {
        Commands::Status => app.status().await,
        Commands::Import { file, force } => app.import(&file, force).await,
        Commands::Sessions => app.sessions().await,
        Commands::Watch { session_id, user } => app.watch(&session_id, &user).await,
    }
}
