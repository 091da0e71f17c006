//! # Catalog Refresh CLI (`catalog`)
//!
//! The `catalog` binary drives the refresh engine: it initializes the
//! database, runs entity providers, processes due entities and inspects the
//! resulting state.
//!
//! ## Usage
//!
//! ```bash
//! catalog --config ./config/catalog.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `catalog init` | Create the SQLite database and run schema migrations |
//! | `catalog sync` | Run every configured provider once |
//! | `catalog process` | Process one batch of due entities |
//! | `catalog run` | Run providers and the engine until Ctrl-C |
//! | `catalog get <ref>` | Show an entity and its refresh state |
//! | `catalog ancestors <ref>` | List the entities that led to an entity |
//! | `catalog refresh <ref>` | Schedule an entity and its ancestors now |
//! | `catalog stats` | Summarize the refresh state |
//! | `catalog completions <shell>` | Print shell completions |
//!
//! Log output is controlled with `RUST_LOG` (default `info`).

use catalog_refresh::{config, get, ingest, migrate, stats};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Catalog Refresh CLI: ingest, process and stitch catalog entities.
///
/// All commands except `completions` accept a `--config` flag pointing to a
/// TOML configuration file.
#[derive(Parser)]
#[command(
    name = "catalog",
    about = "Catalog Refresh: an ingestion and refresh engine for a software catalog",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/catalog.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Run every configured entity provider once.
    Sync,

    /// Process entities that are due.
    Process {
        /// Keep processing batches until nothing is due.
        #[arg(long)]
        until_idle: bool,
    },

    /// Run providers and the processing engine until interrupted.
    Run,

    /// Show an entity, its refresh state and its parents.
    Get {
        /// Entity ref, e.g. `component:default/billing`.
        entity_ref: String,
    },

    /// List the ancestors of an entity, nearest first.
    Ancestors {
        entity_ref: String,
    },

    /// Schedule an entity and its ancestors for immediate processing.
    Refresh {
        entity_ref: String,
    },

    /// Show refresh state statistics.
    Stats,

    /// Print shell completions to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "catalog", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync => {
            ingest::run_sync(&cfg).await?;
        }
        Commands::Process { until_idle } => {
            ingest::run_process(&cfg, until_idle).await?;
        }
        Commands::Run => {
            ingest::run_service(&cfg).await?;
        }
        Commands::Get { entity_ref } => {
            get::run_get(&cfg, &entity_ref).await?;
        }
        Commands::Ancestors { entity_ref } => {
            get::run_ancestors(&cfg, &entity_ref).await?;
        }
        Commands::Refresh { entity_ref } => {
            get::run_refresh(&cfg, &entity_ref).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
