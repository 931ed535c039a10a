//! # Summary Tree CLI (`sumtree`)
//!
//! Splits documents into token-bounded chunks, summarizes them through a
//! language model and merges the summaries level by level into a single
//! root, persisting the whole provenance tree in SQLite.
//!
//! ## Usage
//!
//! ```bash
//! sumtree --config ./config/sumtree.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sumtree init` | Create the SQLite database and schema |
//! | `sumtree run` | Summarize a file, a directory, `--text` or stdin |
//! | `sumtree status <batch>` | Show a batch's processing status |
//! | `sumtree batches` | List all batches |
//! | `sumtree tree <batch>` | Print a batch's tree |
//! | `sumtree final <batch>` | Print a batch's root summary |
//! | `sumtree node <id>` | Show a node with its path and siblings |
//! | `sumtree serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! sumtree init
//! sumtree run --input ./docs --progress human
//! sumtree run --text "Dr. Smith met Mr. Jones. They signed." --token-budget 256
//! sumtree tree 5b1f... --max-depth 3
//! RUST_LOG=summary_tree=debug sumtree serve
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use summary_tree::config::{self, Config};
use summary_tree::engine::{Engine, SummarizeRequest};
use summary_tree::input::load_documents;
use summary_tree::migrate;
use summary_tree::progress::ProgressMode;
use summary_tree::server;
use summary_tree::sqlite_store::SqliteStore;
use summary_tree::tree::{self, TreeOptions};

/// Summary Tree: hierarchical document summarization with a persisted
/// provenance tree.
#[derive(Parser)]
#[command(
    name = "sumtree",
    about = "Hierarchical document summarization with a persisted provenance tree",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/sumtree.toml`. When the file does not exist the
    /// built-in defaults are used.
    #[arg(long, global = true, default_value = "./config/sumtree.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Summarize input into a new batch.
    ///
    /// Reads `--input` (a file or a directory), `--text`, or stdin when
    /// neither is given.
    Run {
        /// File or directory to summarize.
        #[arg(long, conflicts_with = "text")]
        input: Option<PathBuf>,

        /// Literal text to summarize.
        #[arg(long)]
        text: Option<String>,

        /// Batch id to use instead of a generated one.
        #[arg(long)]
        batch_id: Option<String>,

        /// Total token budget per model call.
        #[arg(long)]
        token_budget: Option<usize>,

        #[arg(long)]
        summary_prompt: Option<String>,

        #[arg(long)]
        context_prompt: Option<String>,

        /// Progress output on stderr. Defaults to human on a TTY, off otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Print the response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show a batch's processing status.
    Status { batch_id: String },

    /// List all batches, newest first.
    Batches,

    /// Print a batch's tree.
    Tree {
        batch_id: String,

        /// Levels shown below and including each root (1-20).
        #[arg(long, default_value_t = tree::DEFAULT_MAX_DEPTH)]
        max_depth: u32,

        /// Include full summaries and content (JSON output only).
        #[arg(long)]
        include_content: bool,

        #[arg(long)]
        json: bool,
    },

    /// Print the root summary of a completed batch.
    Final { batch_id: String },

    /// Show a node with its breadcrumb path.
    Node {
        id: String,

        /// Also list the node's siblings.
        #[arg(long)]
        siblings: bool,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("summary_tree=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::info!(path = %path.display(), "config file not found; using defaults");
        let cfg = Config::minimal();
        config::validate(&cfg)?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Run {
            input,
            text,
            batch_id,
            token_budget,
            summary_prompt,
            context_prompt,
            progress,
            json,
        } => {
            let mut request = match (input, text) {
                (Some(path), _) => {
                    let documents = load_documents(&path, &cfg.input)?;
                    SummarizeRequest::documents(documents)
                }
                (None, Some(text)) => SummarizeRequest::text(text),
                (None, None) => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("Failed to read stdin")?;
                    SummarizeRequest::text(buf)
                }
            };
            request.batch_id = batch_id;
            request.token_budget = token_budget;
            request.summary_prompt = summary_prompt;
            request.context_prompt = context_prompt;

            let store = Arc::new(SqliteStore::open(&cfg).await?);
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let engine = Engine::from_config(&cfg, store.clone())?.with_progress(mode.reporter());

            let cancel = engine.cancel_token();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("cancelling batch...");
                    on_signal.cancel();
                }
            });

            let response = engine.summarize_with_cancel(request, cancel).await;
            store.close().await;
            let response = response?;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("batch:     {}", response.batch_id);
                println!("chunks:    {}", response.total_documents);
                println!("depth:     {}", response.hierarchy_depth);
                println!("fallbacks: {}", response.fallback_count);
                println!();
                println!("{}", response.final_summary);
            }
        }
        Commands::Status { batch_id } => {
            let store = SqliteStore::open(&cfg).await?;
            tree::run_status(&store, &batch_id).await?;
        }
        Commands::Batches => {
            let store = SqliteStore::open(&cfg).await?;
            tree::run_batches(&store).await?;
        }
        Commands::Tree {
            batch_id,
            max_depth,
            include_content,
            json,
        } => {
            let store = SqliteStore::open(&cfg).await?;
            let options = TreeOptions {
                max_depth,
                include_content,
            };
            tree::run_tree(&store, &batch_id, options, json).await?;
        }
        Commands::Final { batch_id } => {
            let store = SqliteStore::open(&cfg).await?;
            tree::run_final(&store, &batch_id).await?;
        }
        Commands::Node { id, siblings } => {
            let store = SqliteStore::open(&cfg).await?;
            tree::run_node(&store, &id, siblings).await?;
        }
        Commands::Serve => {
            let store = Arc::new(SqliteStore::open(&cfg).await?);
            let engine = Engine::from_config(&cfg, store)?;
            server::run_server(&cfg, Arc::new(engine)).await?;
        }
    }

    Ok(())
}
