//! # Medsum CLI
//!
//! The `medsum` binary drives the summarization backend. All commands read
//! settings from a TOML configuration file passed via `--config`.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `medsum serve` | Start the HTTP server (index builds in the background) |
//! | `medsum index` | Build or load the KB index once and print its status |
//! | `medsum search "<query>"` | Query the KB index |
//! | `medsum fingerprint` | Print the KB corpus fingerprint |
//! | `medsum validate` | Run the grounding validator on an answer file |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use medsum::config::{load_config, Config};
use medsum::embedding::create_embedder;
use medsum::fingerprint::fingerprint;
use medsum::index::build_or_load;
use medsum::kb::load_kb_docs;
use medsum::server::run_server;
use medsum::validator::{
    format_validation_report, GroundingValidator, ValidationRequest,
};

/// Medsum — a medical-report summarization backend with KB retrieval and
/// grounded-answer validation.
#[derive(Parser)]
#[command(
    name = "medsum",
    about = "Medical report summarization backend with KB retrieval and grounded-answer validation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/medsum.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// The KB index builds in a background task; `/health` reports
    /// readiness and the latest index status.
    Serve,

    /// Build or load the KB index once and print the status report.
    Index,

    /// Query the KB index for the nearest chunks.
    Search {
        /// Query text.
        query: String,

        /// Number of chunks to return (defaults to retrieval.top_k).
        #[arg(long)]
        k: Option<usize>,
    },

    /// Print the KB corpus fingerprint.
    Fingerprint,

    /// Validate an answer against a report using the configured mode.
    Validate {
        /// File containing the answer text to validate.
        #[arg(long)]
        answer: PathBuf,

        /// File containing the ground-truth report.
        #[arg(long)]
        report: PathBuf,
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
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => run_server(&config).await,
        Commands::Index => run_index(&config).await,
        Commands::Search { query, k } => run_search(&config, &query, k).await,
        Commands::Fingerprint => run_fingerprint(&config),
        Commands::Validate { answer, report } => run_validate(&config, &answer, &report).await,
    }
}

async fn run_index(config: &Config) -> Result<()> {
    let docs = load_kb_docs(&config.kb.glob)?;
    let embedder = create_embedder(&config.embedding)?;
    let outcome = build_or_load(
        &docs,
        &config.kb.glob,
        &config.kb.index_dir,
        &config.chunking,
        embedder,
        config.retrieval.top_k,
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    Ok(())
}

async fn run_search(config: &Config, query: &str, k: Option<usize>) -> Result<()> {
    let docs = load_kb_docs(&config.kb.glob)?;
    let embedder = create_embedder(&config.embedding)?;
    let k = k.unwrap_or(config.retrieval.top_k);
    let outcome = build_or_load(
        &docs,
        &config.kb.glob,
        &config.kb.index_dir,
        &config.chunking,
        embedder,
        k,
    )
    .await?;

    let retriever = match outcome.retriever {
        Some(r) => r,
        None => {
            println!("KB is empty — nothing to search.");
            return Ok(());
        }
    };

    for (i, chunk) in retriever.retrieve(query).await?.iter().enumerate() {
        let page = chunk
            .page
            .map(|p| format!(":p{}", p))
            .unwrap_or_default();
        println!(
            "{}. [{:.4}] {}{} #{}",
            i + 1,
            chunk.score,
            chunk.source,
            page,
            chunk.chunk_index
        );
        println!("   {}", chunk.text.replace('\n', " "));
    }
    Ok(())
}

fn run_fingerprint(config: &Config) -> Result<()> {
    println!("{}", fingerprint(&config.kb.glob)?);
    Ok(())
}

async fn run_validate(config: &Config, answer_path: &PathBuf, report_path: &PathBuf) -> Result<()> {
    let answer = std::fs::read_to_string(answer_path)?;
    let report = std::fs::read_to_string(report_path)?;

    let validator = Arc::new(GroundingValidator::new(&config.validation));
    let request = ValidationRequest::from_config(
        &config.validation,
        answer,
        Vec::new(),
        report,
        None,
    );
    let result = validator.validate(&request).await;

    println!("{}", format_validation_report(&result));
    Ok(())
}
