//! # Docgate CLI
//!
//! The `docgate` binary wraps the gateway: database initialization, the
//! HTTP server, and a corpus overview.
//!
//! ## Usage
//!
//! ```bash
//! docgate --config ./config/docgate.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docgate init` | Create the SQLite database and run schema migrations |
//! | `docgate serve` | Start the HTTP server and admission drain loop |
//! | `docgate stats` | Print document/chunk/embedding counts |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docgate::{config, db, migrate, server, stats};

/// Docgate — a document upload and query gateway with admission control
/// and LLM-backed analysis.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docgate.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docgate",
    about = "Docgate — a document upload and query gateway with admission control",
    version,
    long_about = "Docgate accepts file uploads (CSV, text, PDF, DOCX), extracts and chunks \
    their content into a SQLite store with optional embeddings, and answers natural-language \
    queries over the corpus through an LLM provider. All inbound work passes a leaky-bucket \
    admission controller with bounded queuing."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, document_chunks, chunks_fts, tags, document_tags).
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Start the HTTP server.
    ///
    /// Binds to the address configured in `[server].bind`, spawns the
    /// admission drain loop, and serves until terminated.
    Serve,

    /// Print corpus statistics.
    ///
    /// Shows document, chunk, and embedding counts with a per-file-type
    /// breakdown.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
