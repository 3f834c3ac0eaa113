// ==============================================================================
// lib.rs - Annotation Indexer Library
// ==============================================================================
// Description: Library interface for the remote GFF3 annotation indexer
// Author: Matt Barham
// Created: 2026-09-28
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================

pub mod models;
pub mod fetch;
pub mod bgzf;
pub mod parsers;
pub mod batcher;
pub mod store;
pub mod query;
pub mod ingest;

pub use ingest::{IngestEvent, IngestHandle, IngestOutcome, IngestRequest, IngestState, Indexer};
pub use models::{AnnotationCategory, Contig, IndexMetadata};
pub use query::{ContigQuery, Filter, QueryPage, Term};
pub use store::ContigStore;
