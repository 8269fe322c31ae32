//! catalogd: the catalog daemon.
//!
//! Opens the catalog store described by a `catalog.toml`, applies its seed
//! registrations and then either dumps the catalog or performs a blocking
//! watch on one table.
//!
//! # Usage
//!
//! ```text
//! catalogd dump --config catalog.toml
//! catalogd watch --config catalog.toml --table nodes --index 12 --wait 30s
//! ```

mod dump;
mod watch;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;

use catalog_state::{CatalogConfig, StateStore, Table};

#[derive(Parser)]
#[command(name = "catalogd", about = "Service catalog daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every node with its services, checks and the table indices.
    Dump {
        /// Path to catalog.toml.
        #[arg(long)]
        config: PathBuf,
    },
    /// Block until a table moves past an index, then print the new index.
    Watch {
        /// Path to catalog.toml.
        #[arg(long)]
        config: PathBuf,

        /// Table to watch: nodes, services, checks or kvs.
        #[arg(long)]
        table: String,

        /// Return only once the table index exceeds this value.
        #[arg(long, default_value = "0")]
        index: u64,

        /// How long to wait ("30s", "5m"). Zero uses the configured default.
        #[arg(long, default_value = "0")]
        wait: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,catalogd=debug,catalog_state=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Dump { config } => {
            let (_, store) = open(&config)?;
            let snapshot = dump::snapshot(&store)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Command::Watch {
            config,
            table,
            index,
            wait,
        } => {
            let (config, store) = open(&config)?;
            let table: Table = table.parse()?;
            let wait = watch::requested_wait(&config, &wait)?;
            let result = watch::run(&store, table, index, wait).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

/// Load the config, open its store and apply the seed registrations.
fn open(path: &Path) -> anyhow::Result<(CatalogConfig, StateStore)> {
    let config = CatalogConfig::from_file(path)?;
    let store = config.open_store()?;
    config.apply_seeds(&store)?;
    info!(
        config = ?path,
        seeds = config.register.len(),
        persistent = config.store.path.is_some(),
        "catalog store ready"
    );
    Ok((config, store))
}
