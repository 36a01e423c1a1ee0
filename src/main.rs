//! # Knowbridge CLI (`kb`)
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite database and run schema migrations |
//! | `kb validate` | Check config and prompt templates without touching providers |
//! | `kb index --all` | Index every document under `[documents].root` |
//! | `kb index <path>…` | Index specific files |
//! | `kb search "<query>"` | Hybrid search, printing ranked chunks |
//! | `kb ask "<question>"` | Answer a question (optionally continuing a conversation) |
//! | `kb history <id>` | Print a conversation transcript |
//! | `kb serve` | Start the REST API server |

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use knowbridge::app::App;
use knowbridge::config::{self, Config};
use knowbridge::prompt::PromptAssembler;
use knowbridge::sources::FsDocumentSource;
use knowbridge::{db, logging, migrate, server};
use knowbridge_core::store::SearchFilters;

/// Knowbridge: answers questions about your organization's documents.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "Knowbridge: hybrid retrieval plus grounded answers over internal documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Validate the config file and every prompt template.
    Validate,

    /// Index documents from `[documents].root`.
    Index {
        /// Index every document the source lists.
        #[arg(long, conflicts_with = "paths")]
        all: bool,

        /// Files to index (must lie under `[documents].root`).
        paths: Vec<PathBuf>,
    },

    /// Search the index.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long, default_value = "10")]
        limit: usize,

        /// Restrict to one document id.
        #[arg(long)]
        document: Option<String>,
    },

    /// Ask a question.
    Ask {
        question: String,

        /// Continue an existing conversation.
        #[arg(long)]
        conversation: Option<String>,

        #[arg(long)]
        user: Option<String>,

        /// Prompt template (e.g. `knowledge`, `code`).
        #[arg(long)]
        template: Option<String>,
    },

    /// Print a conversation transcript, oldest first.
    History {
        conversation_id: String,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Start the REST API server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Validate => {
            let prompts = PromptAssembler::from_config(&cfg)?;
            println!(
                "Config OK. Templates: {}",
                prompts.template_names().join(", ")
            );
        }
        Commands::Index { all, paths } => run_index(cfg, all, paths).await?,
        Commands::Search {
            query,
            limit,
            document,
        } => {
            let app = App::build(cfg).await?;
            let filters = SearchFilters {
                document_id: document,
                ..Default::default()
            };
            let response = app.retriever.search(&query, filters, limit).await?;
            if response.degraded {
                println!("(degraded: one search channel was unavailable)");
            }
            if response.results.is_empty() {
                println!("No results.");
            }
            for (i, r) in response.results.iter().enumerate() {
                println!(
                    "{}. [{:.3}] doc={} chunk={} ({:?})",
                    i + 1,
                    r.score,
                    r.document_id,
                    r.chunk_id,
                    r.match_type
                );
                println!("   {}", r.snippet.replace('\n', " "));
            }
        }
        Commands::Ask {
            question,
            conversation,
            user,
            template,
        } => {
            let app = App::build(cfg).await?;
            let response = app
                .orchestrator
                .ask(
                    &question,
                    conversation.as_deref(),
                    user.as_deref(),
                    template.as_deref(),
                )
                .await?;
            println!("{}", response.answer);
            if !response.citations.is_empty() {
                println!();
                for (i, c) in response.citations.iter().enumerate() {
                    println!("[{}] {} ({:.3})", i + 1, c.source, c.score);
                }
            }
            println!();
            println!("conversation: {}", response.conversation_id);
        }
        Commands::History {
            conversation_id,
            limit,
        } => {
            let app = App::build(cfg).await?;
            let messages = app.orchestrator.get_history(&conversation_id, limit).await?;
            for m in messages {
                println!(
                    "[{}] {}: {}",
                    m.created_at.format("%Y-%m-%d %H:%M:%S"),
                    m.role,
                    m.content
                );
            }
        }
        Commands::Serve => {
            let app = Arc::new(App::build(cfg).await?);
            server::run_server(app).await?;
        }
    }

    Ok(())
}

async fn run_index(cfg: Config, all: bool, paths: Vec<PathBuf>) -> Result<()> {
    let docs = match &cfg.documents {
        Some(d) => d.clone(),
        None => bail!("No [documents] section in config; nothing to index"),
    };
    if !all && paths.is_empty() {
        bail!("Pass --all or at least one path");
    }

    let fs = FsDocumentSource::new(&docs, cfg.chunking.max_tokens)?;
    let ids = paths
        .iter()
        .map(|p| fs.document_id_for(p))
        .collect::<Result<Vec<_>>>()?;

    let app = App::build(cfg).await?;
    let results = if all {
        app.indexer.index_all().await?
    } else {
        app.indexer.index_many(&ids).await
    };

    let mut failed = 0;
    for (id, result) in results {
        match result {
            Ok(r) => println!(
                "{}: {} chunks ({} embedded, {} unchanged, {} pruned, {} failed)",
                id,
                r.chunks_indexed,
                r.embedded,
                r.unchanged,
                r.pruned,
                r.failures.len()
            ),
            Err(e) => {
                failed += 1;
                println!("{}: error: {}", id, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} document(s) failed to index", failed);
    }
    Ok(())
}
