//! Stubvault CLI

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stubvault::config::{Config, Mode};
use stubvault::network::NetworkHandler;
use stubvault::App;

#[derive(Debug, Parser)]
#[command(name = "stubvault", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the admin and mock listeners.
    Serve {
        /// Path to config TOML. Defaults apply when omitted.
        #[arg(long, env = "STUBVAULT_CONFIG")]
        config: Option<PathBuf>,
        /// Override the configured mode.
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Override log filter (e.g. `debug`, `stubvault=trace`).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Validate a config file and exit.
    Check {
        /// Path to config TOML.
        #[arg(long, env = "STUBVAULT_CONFIG")]
        config: PathBuf,
    },
    /// Manage stored snapshots.
    Snapshots {
        /// Path to config TOML. Defaults apply when omitted.
        #[arg(long, env = "STUBVAULT_CONFIG")]
        config: Option<PathBuf>,
        #[command(subcommand)]
        action: SnapshotCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    /// List stored snapshot names.
    List,
    /// Delete a stored snapshot.
    Delete { name: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Stub,
    Record,
    Replay,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Stub => Self::Stub,
            ModeArg::Record => Self::Record,
            ModeArg::Replay => Self::Replay,
        }
    }
}

fn init_logging(level_override: Option<&str>) -> anyhow::Result<()> {
    let filter = match level_override {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("invalid log level `{level}`"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize logging: {err}"))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("load config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!(
        "Starting {} v{} in {:?} mode",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.mode
    );

    let app = Arc::new(App::from_config(config)?);
    app.initialize().await?;
    info!("Snapshot backend: {}", app.snapshots.backend());

    NetworkHandler::new(app).run().await?;
    Ok(())
}

async fn run_snapshot_command(config: Config, action: SnapshotCommand) -> anyhow::Result<()> {
    let app = App::from_config(config)?;

    match action {
        SnapshotCommand::List => {
            for snapshot in app.snapshots.list().await? {
                println!("{snapshot}");
            }
        }
        SnapshotCommand::Delete { name } => {
            if app.snapshots.delete(&name).await? {
                println!("deleted {name}");
            } else {
                anyhow::bail!("snapshot `{name}` not found");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            mode,
            log_level,
        } => {
            init_logging(log_level.as_deref())?;
            let mut config = load_config(config.as_deref())?;
            if let Some(mode) = mode {
                config.mode = mode.into();
            }
            serve(config).await
        }
        Command::Check { config } => {
            let config = load_config(Some(&config))?;
            println!("config ok ({:?} mode, storage: {:?})", config.mode, config.storage.storage_type);
            Ok(())
        }
        Command::Snapshots { config, action } => {
            init_logging(Some("warn"))?;
            let config = load_config(config.as_deref())?;
            run_snapshot_command(config, action).await
        }
    }
}
