//! # askdata CLI
//!
//! ## Usage
//!
//! ```bash
//! askdata --config ./config/askdata.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `askdata init` | Create the SQLite database and the collection table |
//! | `askdata load <file>` | Import documents from a JSON array or JSON Lines file |
//! | `askdata query "<expr>"` | Run a query expression directly, without the model |
//! | `askdata ask "<question>"` | Answer a question end to end |
//! | `askdata schema` | Print the schema block sent to the model |
//! | `askdata serve` | Start the HTTP server |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use askdata::config::{self, Config};
use askdata::executor::{QueryExecutor, StoreExecutor};
use askdata::ingest;
use askdata::models::{ChatRequest, GeneratedQuery, Message, ModelRef};
use askdata::pipeline::Pipeline;
use askdata::sanitize::extract_fenced;
use askdata::server;
use askdata::store::{DocumentStore, SqliteStore};

/// askdata: ask questions of a document collection in plain English.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/askdata.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "askdata",
    about = "Ask questions of a document collection in plain English",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/askdata.toml`. A missing file is an error;
    /// every setting in it is optional.
    #[arg(long, global = true, default_value = "./config/askdata.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and the collection table.
    ///
    /// Idempotent: running it again is safe.
    Init,

    /// Import documents.
    ///
    /// Reads a JSON array of objects or JSON Lines. Every document is checked
    /// against the schema first; one bad document aborts the load. Documents
    /// whose `_id` already exists are replaced.
    Load {
        /// File to import.
        file: PathBuf,

        /// Validate only; write nothing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a query expression against the collection.
    ///
    /// Accepts what the model would write, fenced or not, e.g.
    /// `db._test.find({channel: "Retail"}).limit(5)`. The expression goes
    /// through the same sanitizer and grammar as generated queries.
    Query {
        /// The query expression.
        expr: String,
    },

    /// Answer a question end to end and print the model's answer.
    Ask {
        /// The question.
        question: String,

        /// Model id; defaults to `llm.default_model`.
        #[arg(long)]
        model: Option<String>,
    },

    /// Print the schema block embedded in the generation prompt.
    Schema,

    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` and serves `POST /api/query` until Ctrl-C.
    Serve,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
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

    match cli.command {
        Commands::Init => {
            let store = SqliteStore::connect(&cfg).await?;
            println!(
                "Collection '{}' ready ({} documents) at {}",
                cfg.collection.name,
                store.count().await?,
                cfg.database_url()
            );
            store.close().await;
        }
        Commands::Load { file, dry_run } => {
            let store = SqliteStore::connect(&cfg).await?;
            let stats =
                ingest::run_load(&store, &cfg.collection.schema(), &file, dry_run).await;
            store.close().await;
            let stats = stats?;
            if dry_run {
                println!("{} documents are valid (dry run, nothing written)", stats.read);
            } else {
                println!(
                    "Loaded {} documents ({} in collection)",
                    stats.written, stats.total
                );
            }
        }
        Commands::Query { expr } => {
            run_query(&cfg, &expr).await?;
        }
        Commands::Ask { question, model } => {
            let store = Arc::new(SqliteStore::connect(&cfg).await?);
            let pipeline = Pipeline::from_config(&cfg, store.clone())?;
            let request = ChatRequest {
                messages: vec![Message::user(question)],
                key: None,
                model: model.map(|id| ModelRef {
                    id,
                    extra: Default::default(),
                }),
            };
            let answer = pipeline.run(&request).await;
            store.close().await;
            println!("{}", answer?.answer);
        }
        Commands::Schema => {
            println!("{}", cfg.collection.schema().describe());
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

async fn run_query(cfg: &Config, expr: &str) -> anyhow::Result<()> {
    let sanitizer = cfg.collection.sanitizer();
    let sanitized = match extract_fenced(expr) {
        Some(_) => sanitizer.sanitize(expr)?,
        None => sanitizer.neutralize(expr),
    };

    let store = Arc::new(SqliteStore::connect(cfg).await?);
    let executor = StoreExecutor::new(store.clone(), cfg.collection.schema(), &cfg.execution);
    let result = executor
        .execute(&GeneratedQuery {
            raw: expr.to_string(),
            sanitized,
        })
        .await;
    store.close().await;

    let result = result?;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to render result")?
    );
    eprintln!("{} documents", result.len());
    Ok(())
}
