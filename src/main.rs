//! # Corpus CLI (`corpus`)
//!
//! ## Usage
//!
//! ```bash
//! corpus --config ./config/corpus.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `corpus ingest <paths...>` | Chunk and index files (directories are walked) |
//! | `corpus search "<query>"` | Hybrid retrieval with citations |
//! | `corpus ask "<message>"` | Run one agent turn |
//! | `corpus chat` | Interactive agent session on stdin |
//! | `corpus memory show` | Print the USER and COMPANY memory logs |
//!
//! Logs go to stderr; set `RUST_LOG` to change the level (default `info`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use corpus_agent::{agent, config, ingest, memory, retrieval};

/// Corpus: hybrid retrieval and a tool-calling agent over local documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "corpus",
    about = "Hybrid retrieval and a tool-calling agent over local documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/corpus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chunk and index documents.
    ///
    /// Supports `.txt`, `.md`, `.pdf` and `.docx`. A file that fails to load
    /// is reported and skipped.
    Ingest {
        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Search the indexed corpus.
    Search {
        /// The search query string.
        query: String,

        /// Candidates kept after fusion and passed to the reranker.
        #[arg(long)]
        k_fusion: Option<usize>,

        /// Results returned after reranking.
        #[arg(long)]
        k_final: Option<usize>,
    },

    /// Run a single agent turn and print its events.
    Ask {
        message: String,

        /// Conversation thread id. A fresh one is generated when omitted.
        #[arg(long)]
        thread: Option<String>,
    },

    /// Interactive agent session, one turn per line. `exit` quits.
    Chat {
        #[arg(long)]
        thread: Option<String>,
    },

    /// Inspect the memory logs.
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Print both memory logs.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config_or_default(&cli.config)?;

    match cli.command {
        Commands::Ingest { paths } => {
            ingest::run_ingest(&cfg, &paths).await?;
        }
        Commands::Search {
            query,
            k_fusion,
            k_final,
        } => {
            retrieval::run_search(&cfg, &query, k_fusion, k_final).await?;
        }
        Commands::Ask { message, thread } => {
            agent::run_ask(&cfg, &message, thread).await?;
        }
        Commands::Chat { thread } => {
            agent::run_chat(&cfg, thread).await?;
        }
        Commands::Memory { action } => match action {
            MemoryAction::Show => {
                memory::run_memory_show(&cfg.memory)?;
            }
        },
    }

    Ok(())
}
