//! # docrag CLI
//!
//! Runs the HTTP API or performs the same operations from the command line.
//! Every command except `serve` prints the JSON body the matching HTTP
//! endpoint would return.
//!
//! ## Usage
//!
//! ```bash
//! docrag --config ./config/docrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docrag serve` | Start the HTTP API |
//! | `docrag documents` | List stored documents |
//! | `docrag upload <FILE>... --classification HR` | Ingest files |
//! | `docrag delete <NAME>...` | Delete documents and reindex |
//! | `docrag reindex` | Trigger an indexer run |
//! | `docrag ask "<question>"` | Answer a question from stored documents |

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use docrag::chat::{self, ChatSettings};
use docrag::config::{self, Config};
use docrag::documents;
use docrag::ingest::{self, IngestSettings, UploadFile};
use docrag::models::{ChatMessage, DocumentList, IndexerRun};
use docrag::server;
use docrag::services::Services;

/// Retrieval-augmented question answering over classified documents.
#[derive(Parser)]
#[command(name = "docrag", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API on `server.bind`.
    Serve,

    /// List stored documents with their classification.
    Documents,

    /// Extract, chunk and store files, then trigger one indexer run.
    Upload {
        /// Files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Classification applied to every file.
        #[arg(long, default_value = "other", conflicts_with = "classifications")]
        classification: String,

        /// One classification per file, comma-separated, in file order.
        #[arg(long, value_delimiter = ',')]
        classifications: Option<Vec<String>>,
    },

    /// Delete documents by base name, then trigger one indexer run.
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Trigger an indexer run.
    Reindex,

    /// Answer a question from stored documents.
    Ask { question: String },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Pair each path with its classification.
fn classify_files(
    files: &[PathBuf],
    classification: &str,
    classifications: Option<&[String]>,
) -> Result<Vec<(PathBuf, String)>> {
    match classifications {
        Some(list) => {
            if list.len() != files.len() {
                bail!(
                    "got {} files but {} classifications",
                    files.len(),
                    list.len()
                );
            }
            Ok(files.iter().cloned().zip(list.iter().cloned()).collect())
        }
        None => Ok(files
            .iter()
            .map(|f| (f.clone(), classification.to_string()))
            .collect()),
    }
}

/// Turn a refused indexer run into a non-zero exit.
fn ensure_triggered(run: &IndexerRun) -> Result<()> {
    if !run.is_success() {
        bail!("indexer run failed: {}", run.message);
    }
    Ok(())
}

async fn upload(
    config: &Config,
    services: &Services,
    files: Vec<(PathBuf, String)>,
) -> Result<()> {
    let mut uploads = Vec::with_capacity(files.len());
    for (path, classification) in files {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;
        uploads.push(UploadFile::new(&filename, classification, bytes));
    }

    let report = ingest::upload_batch(
        services.store.as_ref(),
        services.search.as_ref(),
        services.layout.as_deref(),
        uploads,
        IngestSettings::from(config),
    )
    .await?;
    print_json(&report)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;
    let services = Services::from_config(&cfg)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(cfg, services).await?;
        }
        Commands::Documents => {
            let documents = documents::list_documents(services.store.as_ref()).await?;
            print_json(&DocumentList { documents })?;
        }
        Commands::Upload {
            files,
            classification,
            classifications,
        } => {
            let files = classify_files(&files, &classification, classifications.as_deref())?;
            upload(&cfg, &services, files).await?;
        }
        Commands::Delete { names } => {
            let report = documents::delete_and_reindex(
                services.store.as_ref(),
                services.search.as_ref(),
                &names,
                cfg.documents.delete_match,
            )
            .await?;
            print_json(&report)?;
        }
        Commands::Reindex => {
            let run = services.search.run_indexer().await;
            print_json(&run)?;
            ensure_triggered(&run)?;
        }
        Commands::Ask { question } => {
            let reply = chat::answer(
                services.search.as_ref(),
                services.completion.as_ref(),
                &[ChatMessage::new("user", question)],
                ChatSettings::from(&cfg),
            )
            .await?;
            print_json(&reply)?;
        }
    }

    Ok(())
}
