// ==============================================================================
// main.rs - Annotation Indexer Entry Point
// ==============================================================================
// Description: Command-line front end for indexing and querying remote
//              BGZF-compressed GFF3 annotations
// Author: Matt Barham
// Created: 2026-09-28
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use annotation_indexer::batcher::DEFAULT_BATCH_SIZE;
use annotation_indexer::bgzf::DEFAULT_CHUNK_SIZE;
use annotation_indexer::query::DEFAULT_PAGE_SIZE;
use annotation_indexer::{
    AnnotationCategory, ContigQuery, Filter, IndexMetadata, Indexer, IngestEvent, IngestOutcome,
    IngestRequest,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SQLite index database path
    #[arg(long, env = "ANNOTATION_INDEX_DB", default_value = "annotation_index.sqlite", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index a BGZF-compressed GFF3 file (http(s) URL or local path)
    Index {
        source_url: String,

        /// Block index location (defaults to SOURCE_URL.gzi)
        #[arg(long)]
        index_url: Option<String>,

        /// Attribute categories to index, comma separated (default: all)
        #[arg(long, value_delimiter = ',')]
        attrs: Vec<AnnotationCategory>,

        /// Records per store transaction
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Decompressed bytes per read
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,

        /// Rebuild even if the index already matches SOURCE_URL
        #[arg(long)]
        force: bool,
    },

    /// Query indexed contigs (filters combine with AND)
    Query {
        /// category=term, e.g. interpros=IPR000001 or pfams=*
        #[arg(long = "filter")]
        filters: Vec<Filter>,

        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: usize,
    },

    /// Show which source the index reflects
    Status,

    /// Clear the index
    Reset,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    database: PathBuf,
    index_metadata: Option<IndexMetadata>,
    contigs_count: usize,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn status(indexer: &Indexer, db: PathBuf) -> Result<()> {
    print_json(&StatusReport {
        database: db,
        index_metadata: indexer.index_metadata()?,
        contigs_count: indexer.contig_count()?,
    })
}

async fn run_index(indexer: &Indexer, request: IngestRequest, force: bool) -> Result<()> {
    if !force && !indexer.needs_rebuild(&request.source_url)? {
        info!("Index already reflects {}; use --force to rebuild", request.source_url);
        return Ok(());
    }

    indexer.reset().context("Failed to reset index before ingestion")?;
    let mut handle = indexer
        .start(request)
        .context("Failed to start ingestion")?;

    let mut listening = true;
    loop {
        tokio::select! {
            event = handle.recv() => match event {
                Some(IngestEvent::Begin { run_id, source_url }) => {
                    info!("Ingestion {} started for {}", run_id, source_url);
                }
                Some(IngestEvent::Progress(progress)) => match progress.percent {
                    Some(percent) => info!("{:.1}% ({} bytes)", percent, progress.processed_bytes),
                    None => info!("{} bytes processed", progress.processed_bytes),
                },
                Some(IngestEvent::End(_)) => {}
                Some(IngestEvent::Error(message)) => warn!("Ingestion error: {}", message),
                None => break,
            },
            signal = tokio::signal::ctrl_c(), if listening => {
                listening = false;
                match signal {
                    Ok(()) => {
                        warn!("Interrupt received, cancelling ingestion");
                        handle.cancel();
                    }
                    Err(e) => warn!("Unable to listen for Ctrl-C: {}", e),
                }
            }
        }
    }

    match handle.wait().await? {
        IngestOutcome::Completed(summary) => print_json(&summary),
        IngestOutcome::Cancelled => {
            anyhow::bail!("Ingestion cancelled; the index is partial and must be reset or rebuilt")
        }
        IngestOutcome::Failed(message) => anyhow::bail!("Ingestion failed: {}", message),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing (stderr, so JSON output stays clean)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "annotation_indexer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let indexer = Indexer::open(&args.db)
        .with_context(|| format!("Failed to open index database {:?}", args.db))?;

    match args.command {
        Command::Index {
            source_url,
            index_url,
            attrs,
            batch_size,
            chunk_size,
            force,
        } => {
            let mut request = IngestRequest::new(source_url)
                .with_batch_size(batch_size)
                .with_chunk_size(chunk_size);
            if let Some(index_url) = index_url {
                request = request.with_index_url(index_url);
            }
            if !attrs.is_empty() {
                request = request.with_attrs(&attrs);
            }
            run_index(&indexer, request, force).await
        }
        Command::Query {
            filters,
            page,
            page_size,
        } => {
            let query = ContigQuery::new(filters).page(page).page_size(page_size);
            print_json(&indexer.query(&query)?)
        }
        Command::Status => status(&indexer, args.db),
        Command::Reset => {
            indexer.reset()?;
            info!("Index cleared: {:?}", args.db);
            Ok(())
        }
    }
}
