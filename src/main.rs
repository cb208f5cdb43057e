//! # Atlas Relay CLI (`atlas`)
//!
//! The `atlas` binary runs the chat relay server and its small set of
//! operational commands.
//!
//! ## Usage
//!
//! ```bash
//! atlas --config ./config/atlas.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `atlas init` | Create the SQLite database and run schema migrations |
//! | `atlas serve` | Start the relay HTTP server |
//! | `atlas resolve "<title>"` | Resolve a citation title against the file mapping |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! atlas init --config ./config/atlas.toml
//!
//! # Start the relay
//! ATLAS_UPSTREAM_API_KEY=... atlas serve --config ./config/atlas.toml
//!
//! # Check what a citation title would link to
//! atlas resolve "Q3 Report.pdf" --config ./config/atlas.toml
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use atlas_relay::resolver::{CitationResolver, HttpMappingFetcher, SystemClock};
use atlas_relay::{config, db, migrate, server};

/// Atlas Relay — a retrieval-augmented chat relay with streaming citations.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/atlas.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "atlas",
    about = "Atlas Relay — a retrieval-augmented chat relay with streaming citations",
    version,
    long_about = "Atlas Relay forwards chat turns to a hosted model/retrieval gateway, \
    streams the incremental answer to clients over a framed event protocol, resolves \
    citation titles to stable document links, and persists conversations in SQLite."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/atlas.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the conversations/messages
    /// tables. Idempotent — running it multiple times is safe.
    Init,

    /// Start the relay HTTP server.
    ///
    /// Binds to `[server].bind` and serves the streaming chat endpoint
    /// plus conversation CRUD. Requires `atlas init` to have run.
    Serve,

    /// Resolve a citation title against the file mapping.
    ///
    /// Fetches the mapping document and applies the same matching
    /// strategies the relay uses, printing the resolved URL or nothing.
    Resolve {
        /// Citation title as the upstream model would report it.
        title: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized at {}", config.db.path.display());
        }
        Commands::Serve => {
            server::run_server(&config).await?;
        }
        Commands::Resolve { title } => {
            let fetcher = HttpMappingFetcher::new(&config.mapping)?;
            let resolver = CitationResolver::new(
                Box::new(fetcher),
                Box::new(SystemClock),
                Duration::from_secs(config.mapping.ttl_secs),
            );
            match resolver.resolve(&title).await {
                Some(url) => println!("{}", url),
                None => println!("(no match)"),
            }
        }
    }

    Ok(())
}
