//! # BGG Harvest CLI (`bgg`)
//!
//! ## Usage
//!
//! ```bash
//! bgg --config ./config/bgg.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bgg init` | Create the SQLite database and both collections |
//! | `bgg run` | Scrape, fetch, and publish one harvest |
//! | `bgg ids` | Scrape ranking pages and print item ids |
//! | `bgg stats` | Show live/staging counts and last publish |
//! | `bgg serve` | Start the read API |
//!
//! ## Examples
//!
//! ```bash
//! # Nightly harvest from cron, giving up after six hours
//! bgg run --timeout-secs 21600 --progress json
//!
//! # Inspect the top 200 ids by number of voters
//! bgg ids --first-page 1 --pages 2
//! ```

use bgg_harvest::progress::{ProgressMode, ProgressReporter};
use bgg_harvest::{config, migrate, pipeline, server, stats};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// BGG Harvest: keeps a local dataset of BoardGameGeek board games fresh.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/bgg.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "bgg",
    about = "BGG Harvest — scrape, fetch, and atomically publish BoardGameGeek metadata",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/bgg.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a TTY, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite file, the publish log, and empty live and staging
    /// collections. Safe to run repeatedly.
    Init,

    /// Run one harvest: scrape ranking pages, fetch metadata, publish.
    ///
    /// The live dataset is replaced only if every step succeeds.
    Run {
        /// Abort the run after this many seconds; live is left untouched.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Scrape ranking pages and print the item ids found, one per line.
    Ids {
        /// First ranking page (1-based). Defaults to `[scraper].first_page`.
        #[arg(long)]
        first_page: Option<u32>,

        /// Number of pages. Defaults to `[scraper].pages`.
        #[arg(long)]
        pages: Option<u32>,
    },

    /// Show document counts and the last publish time.
    Stats,

    /// Start the read API on `[server].bind`.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;
    let mode = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let progress: Arc<dyn ProgressReporter> = Arc::from(mode.reporter());

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Run { timeout_secs } => {
            pipeline::run_harvest(&cfg, progress, timeout_secs.map(Duration::from_secs)).await?;
        }
        Commands::Ids { first_page, pages } => {
            pipeline::run_ids(&cfg, first_page, pages).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
