// ==============================================================================
// ingest.rs - Ingestion Orchestrator
// ==============================================================================
// Description: Streams a remote BGZF GFF3 file into the contig index on a
//              background task, with progress events and cancellation
// Author: Matt Barham
// Created: 2026-10-04
// Modified: 2026-10-17
// Version: 1.3.1
// ==============================================================================
// Pipeline (one tokio task per run):
//   ChunkCursor -> LineDecoder -> RecordParser -> Batcher -> StoreSink
// The batcher is settled before every chunk read; cancellation is checked
// right after, so a cancelled run never issues another read or delivery.
// ==============================================================================

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batcher::{BatchError, BatchSink, Batcher, DEFAULT_BATCH_SIZE};
use crate::bgzf::{BgzfError, BgzfFile, ChunkCursor, DEFAULT_CHUNK_SIZE};
use crate::fetch::{open_resource, FetchError, RangeFetch};
use crate::models::{AnnotationCategory, Contig, FeatureRecord, IndexMetadata};
use crate::parsers::{LineDecoder, RecordParser};
use crate::query::{ContigQuery, QueryPage};
use crate::store::{ContigStore, StoreError};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("An ingestion is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Bgzf(#[from] BgzfError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Ingestion task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Parameters for one ingestion run
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRequest {
    pub source_url: String,
    pub index_url: String,
    pub attrs_to_index: Vec<AnnotationCategory>,
    pub batch_size: usize,
    pub chunk_size: u64,
}

impl IngestRequest {
    /// Request with the `.gzi` next to the source and every category indexed
    pub fn new(source_url: impl Into<String>) -> Self {
        let source_url = source_url.into();
        Self {
            index_url: format!("{}.gzi", source_url),
            source_url,
            attrs_to_index: AnnotationCategory::ALL.to_vec(),
            batch_size: DEFAULT_BATCH_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_index_url(mut self, index_url: impl Into<String>) -> Self {
        self.index_url = index_url.into();
        self
    }

    pub fn with_attrs(mut self, attrs: &[AnnotationCategory]) -> Self {
        self.attrs_to_index = attrs.to_vec();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub processed_bytes: u64,
    pub total_bytes: Option<u64>,
    /// 0-100, None while the total is unknown
    pub percent: Option<f64>,
}

impl Progress {
    pub fn new(processed_bytes: u64, total_bytes: Option<u64>) -> Self {
        let percent = total_bytes.map(|total| {
            if total == 0 {
                100.0
            } else {
                (processed_bytes as f64 / total as f64 * 100.0).min(100.0)
            }
        });
        Self {
            processed_bytes,
            total_bytes,
            percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub source_url: String,
    pub contigs_count: usize,
    pub elapsed_seconds: f64,
    pub records: usize,
    pub skipped_lines: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Begin { run_id: Uuid, source_url: String },
    Progress(Progress),
    End(IngestSummary),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Completed(IngestSummary),
    Cancelled,
    Failed(String),
}

fn lock_store(store: &Mutex<ContigStore>) -> Result<MutexGuard<'_, ContigStore>, StoreError> {
    store.lock().map_err(|_| StoreError::Poisoned)
}

/// Lock plain bookkeeping state; a poisoned flag is still meaningful
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Group a batch by seqid into contig aggregates, in first-seen order
pub fn aggregate_by_contig(records: &[FeatureRecord]) -> Vec<Contig> {
    let mut contigs: Vec<Contig> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for record in records {
        let position = *positions.entry(record.seqid.as_str()).or_insert_with(|| {
            contigs.push(Contig::new(record.seqid.as_str()));
            contigs.len() - 1
        });
        contigs[position].absorb(record);
    }

    contigs
}

/// Batch sink merging each batch into the SQLite index off the async runtime
pub struct StoreSink {
    store: Arc<Mutex<ContigStore>>,
}

impl StoreSink {
    pub fn new(store: Arc<Mutex<ContigStore>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchSink for StoreSink {
    async fn deliver(&self, batch: Vec<FeatureRecord>) -> Result<(), BatchError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let contigs = aggregate_by_contig(&batch);
            let mut guard = lock_store(&store)?;
            let inserted = guard.merge_contigs(&contigs)?;
            debug!(
                "Stored batch of {} records across {} contigs ({} new values)",
                batch.len(),
                contigs.len(),
                inserted
            );
            Ok::<(), StoreError>(())
        })
        .await??;
        Ok(())
    }
}

/// Drives ingestion runs against one contig index
///
/// Cheap to clone; clones share the store and run state.
#[derive(Debug, Clone)]
pub struct Indexer {
    store: Arc<Mutex<ContigStore>>,
    state: Arc<Mutex<IngestState>>,
    current_source: Arc<Mutex<Option<String>>>,
}

impl Indexer {
    pub fn new(store: ContigStore) -> Result<Self, StoreError> {
        let current_source = store.load_index_metadata()?.map(|m| m.source_url);
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
            state: Arc::new(Mutex::new(IngestState::Idle)),
            current_source: Arc::new(Mutex::new(current_source)),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::new(ContigStore::open(path)?)
    }

    pub fn store(&self) -> Arc<Mutex<ContigStore>> {
        Arc::clone(&self.store)
    }

    pub fn state(&self) -> IngestState {
        *lock(&self.state)
    }

    /// Source the index fully reflects, if any
    pub fn current_source(&self) -> Option<String> {
        lock(&self.current_source).clone()
    }

    pub fn query(&self, query: &ContigQuery) -> Result<QueryPage, StoreError> {
        lock_store(&self.store)?.query(query)
    }

    pub fn contig_count(&self) -> Result<usize, StoreError> {
        lock_store(&self.store)?.contig_count()
    }

    pub fn index_metadata(&self) -> Result<Option<IndexMetadata>, StoreError> {
        lock_store(&self.store)?.load_index_metadata()
    }

    /// True unless a completed index of `source_url` is already stored
    pub fn needs_rebuild(&self, source_url: &str) -> Result<bool, StoreError> {
        Ok(match self.index_metadata()? {
            Some(metadata) => metadata.source_url != source_url,
            None => true,
        })
    }

    /// Clear the index; refused while a run is in progress
    pub fn reset(&self) -> Result<(), IngestError> {
        let mut state = lock(&self.state);
        if *state == IngestState::Running {
            return Err(IngestError::AlreadyRunning);
        }
        lock_store(&self.store)?.reset()?;
        *lock(&self.current_source) = None;
        *state = IngestState::Idle;
        Ok(())
    }

    /// Start ingesting `request.source_url`, opening both resources by URL
    ///
    /// The store is not reset; see `needs_rebuild` and `reset`.
    pub fn start(&self, request: IngestRequest) -> Result<IngestHandle, IngestError> {
        let data = open_resource(&request.source_url)?;
        let index = open_resource(&request.index_url)?;
        self.start_with_resources(request, data, index)
    }

    /// Start a run over already-opened resources
    pub fn start_with_resources(
        &self,
        request: IngestRequest,
        data: Arc<dyn RangeFetch>,
        index: Arc<dyn RangeFetch>,
    ) -> Result<IngestHandle, IngestError> {
        {
            let mut state = lock(&self.state);
            if *state == IngestState::Running {
                return Err(IngestError::AlreadyRunning);
            }
            *state = IngestState::Running;
        }
        // The store stops reflecting any source until this run completes
        *lock(&self.current_source) = None;

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let run = IngestRun {
            run_id,
            request,
            data,
            index,
            store: Arc::clone(&self.store),
            events: events_tx,
            cancel: cancel.clone(),
        };
        let state = Arc::clone(&self.state);
        let current_source = Arc::clone(&self.current_source);
        let task = tokio::spawn(run.supervise(state, current_source));

        Ok(IngestHandle {
            run_id,
            events: events_rx,
            cancel,
            task,
        })
    }
}

/// Caller's side of a running ingestion
#[derive(Debug)]
pub struct IngestHandle {
    run_id: Uuid,
    events: mpsc::UnboundedReceiver<IngestEvent>,
    cancel: CancellationToken,
    task: JoinHandle<IngestOutcome>,
}

impl IngestHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Next event; None once the run has finished and all events are drained
    pub async fn recv(&mut self) -> Option<IngestEvent> {
        self.events.recv().await
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<IngestOutcome, IngestError> {
        Ok(self.task.await?)
    }
}

struct StreamStats {
    records: usize,
    skipped_lines: usize,
}

/// Marks a run Failed if its task unwinds before reaching a terminal state
struct RunningGuard {
    state: Arc<Mutex<IngestState>>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if *state == IngestState::Running {
            error!("Ingestion task ended without a terminal state");
            *state = IngestState::Failed;
        }
    }
}

struct IngestRun {
    run_id: Uuid,
    request: IngestRequest,
    data: Arc<dyn RangeFetch>,
    index: Arc<dyn RangeFetch>,
    store: Arc<Mutex<ContigStore>>,
    events: mpsc::UnboundedSender<IngestEvent>,
    cancel: CancellationToken,
}

impl IngestRun {
    /// Run to a terminal state, recording it before the final event goes out
    async fn supervise(
        self,
        state: Arc<Mutex<IngestState>>,
        current_source: Arc<Mutex<Option<String>>>,
    ) -> IngestOutcome {
        let _guard = RunningGuard {
            state: Arc::clone(&state),
        };
        let run_id = self.run_id;
        let source_url = self.request.source_url.clone();
        let events = self.events.clone();

        match self.execute().await {
            Ok(Some(summary)) => {
                info!(
                    "Ingestion {} complete: {} contigs from {} records in {:.1}s",
                    run_id, summary.contigs_count, summary.records, summary.elapsed_seconds
                );
                *lock(&current_source) = Some(source_url);
                *lock(&state) = IngestState::Completed;
                let _ = events.send(IngestEvent::End(summary.clone()));
                IngestOutcome::Completed(summary)
            }
            Ok(None) => {
                info!("Ingestion {} cancelled; index is partial until reset", run_id);
                *lock(&state) = IngestState::Cancelled;
                IngestOutcome::Cancelled
            }
            Err(e) => {
                error!("Ingestion {} failed: {}", run_id, e);
                *lock(&state) = IngestState::Failed;
                let message = e.to_string();
                let _ = events.send(IngestEvent::Error(message.clone()));
                IngestOutcome::Failed(message)
            }
        }
    }

    /// Ok(None) when cancelled
    async fn execute(self) -> Result<Option<IngestSummary>, IngestError> {
        let started = Instant::now();
        info!("Starting ingestion {} of {}", self.run_id, self.request.source_url);
        let _ = self.events.send(IngestEvent::Begin {
            run_id: self.run_id,
            source_url: self.request.source_url.clone(),
        });

        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let guard = lock_store(&store)?;
            guard.clear_index_metadata()
        })
        .await??;

        let file = BgzfFile::new(Arc::clone(&self.data), Arc::clone(&self.index));
        let total = file.total_size().await;
        match total {
            Some(total) => debug!("Decompressed size approximately {} bytes", total),
            None => warn!("Decompressed size unknown; progress will be indeterminate"),
        }

        let mut cursor = file.into_chunks(self.request.chunk_size);
        let mut batcher = Batcher::new(StoreSink::new(Arc::clone(&self.store)), self.request.batch_size);

        let streamed = self.stream(&mut cursor, &mut batcher, total).await;
        if let Err(e) = cursor.file().close().await {
            warn!("Failed to close resources: {}", e);
        }

        let stream_stats = match streamed {
            Ok(Some(stats)) => stats,
            Ok(None) => {
                let stats = batcher.abandon().await;
                debug!("Cancelled after {} delivered batches", stats.batches);
                return Ok(None);
            }
            Err(e) => {
                batcher.abandon().await;
                return Err(e);
            }
        };
        let batch_stats = batcher.finish().await?;

        let metadata = IndexMetadata::new(
            self.request.source_url.clone(),
            self.request.index_url.clone(),
            self.request.attrs_to_index.clone(),
        );
        let store = Arc::clone(&self.store);
        let contigs_count = tokio::task::spawn_blocking(move || {
            let guard = lock_store(&store)?;
            guard.save_index_metadata(&metadata)?;
            guard.contig_count()
        })
        .await??;

        Ok(Some(IngestSummary {
            run_id: self.run_id,
            source_url: self.request.source_url.clone(),
            contigs_count,
            elapsed_seconds: started.elapsed().as_secs_f64(),
            records: stream_stats.records,
            skipped_lines: stream_stats.skipped_lines,
            batches: batch_stats.batches,
        }))
    }

    /// Feed every chunk through decoder, parser and batcher; Ok(None) when cancelled
    async fn stream(
        &self,
        cursor: &mut ChunkCursor,
        batcher: &mut Batcher<StoreSink>,
        total: Option<u64>,
    ) -> Result<Option<StreamStats>, IngestError> {
        let mut decoder = LineDecoder::new();
        let mut parser = RecordParser::new(&self.request.attrs_to_index);
        let mut records = 0;

        loop {
            batcher.settle().await?;
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            let Some(chunk) = cursor.next_chunk().await? else {
                break;
            };
            for line in decoder.push(&chunk) {
                if let Some(record) = parser.parse_line(&line) {
                    batcher.push(record).await?;
                    records += 1;
                }
            }

            let progress = Progress::new(cursor.position(), total);
            debug!(
                "Processed {} bytes ({} records, {} skipped lines)",
                progress.processed_bytes, records, parser.malformed_count
            );
            let _ = self.events.send(IngestEvent::Progress(progress));
        }

        if let Some(line) = decoder.finish() {
            if let Some(record) = parser.parse_line(&line) {
                batcher.push(record).await?;
                records += 1;
            }
        }

        Ok(Some(StreamStats {
            records,
            skipped_lines: parser.malformed_count,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgzf::testing::bgzip;
    use crate::fetch::{FileStat, MemoryFile};
    use crate::query::Filter;
    use bytes::Bytes;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;

    const SOURCE: &str = "memory://genome.gff3.gz";

    fn indexer() -> Indexer {
        Indexer::new(ContigStore::open_in_memory().unwrap()).unwrap()
    }

    fn resources(text: &str, block_size: usize) -> (Arc<MemoryFile>, Arc<MemoryFile>) {
        let (compressed, gzi) = bgzip(text.as_bytes(), block_size);
        (
            Arc::new(MemoryFile::new("genome.gff3.gz", compressed)),
            Arc::new(MemoryFile::new("genome.gff3.gz.gzi", gzi)),
        )
    }

    async fn drain(mut handle: IngestHandle) -> (IngestOutcome, Vec<IngestEvent>) {
        let mut events = Vec::new();
        while let Some(event) = handle.recv().await {
            events.push(event);
        }
        (handle.wait().await.unwrap(), events)
    }

    async fn ingest(indexer: &Indexer, request: IngestRequest, text: &str) -> (IngestOutcome, Vec<IngestEvent>) {
        let (data, index) = resources(text, 1000);
        let handle = indexer.start_with_resources(request, data, index).unwrap();
        drain(handle).await
    }

    /// 10 contigs x 10 CDS lines, one interpro each (~60 bytes per line)
    fn ten_by_ten() -> String {
        let mut text = String::from("##gff-version 3\n");
        for i in 0..100 {
            let start = (i % 10) * 100 + 1;
            text.push_str(&format!(
                "ctg{:02}\tsrc\tCDS\t{}\t{}\t.\t+\t0\tID=cds{:03};interpro=IPR{:06}\n",
                i / 10,
                start,
                start + 90,
                i,
                i % 13
            ));
        }
        text
    }

    #[tokio::test]
    async fn test_scenario_two_contigs() {
        let text = "##gff-version 3\n\
            A\tsrc\tgene\t1\t900\t.\t+\t.\tID=g1;interpro=IPR000001,IPR000002\n\
            A\tsrc\tCDS\t10\t800\t.\t+\t0\tID=c1;Parent=g1;interpro=IPR000002\n\
            B\tsrc\tgene\t1\t500\t.\t-\t.\tID=g2;pfam=PF00001\n";
        let indexer = indexer();
        assert!(indexer.needs_rebuild(SOURCE).unwrap());

        let request = IngestRequest::new(SOURCE).with_attrs(&[AnnotationCategory::Interpro]);
        let (outcome, _) = ingest(&indexer, request, text).await;
        assert!(matches!(outcome, IngestOutcome::Completed(ref s) if s.contigs_count == 2));

        let all = indexer.query(&ContigQuery::default()).unwrap();
        assert_eq!(all.count, 2);

        let exact = indexer
            .query(&ContigQuery::new(vec![Filter::exact(AnnotationCategory::Interpro, "IPR000001")]))
            .unwrap();
        assert_eq!(exact.count, 1);
        assert_eq!(exact.items[0].contig_name, "A");
        assert_eq!(exact.items[0].annotations.interpros, vec!["IPR000001", "IPR000002"]);
        assert_eq!(exact.items[0].length, 900);

        let any = indexer
            .query(&ContigQuery::new(vec![Filter::any(AnnotationCategory::Interpro)]))
            .unwrap();
        assert_eq!(any.count, 1);
        assert_eq!(any.items[0].contig_name, "A");

        // pfam was not requested
        let b = indexer.store().lock().unwrap().get_contig("B").unwrap().unwrap();
        assert!(b.annotations.is_empty());

        assert_eq!(indexer.state(), IngestState::Completed);
        assert_eq!(indexer.current_source().as_deref(), Some(SOURCE));
        assert!(!indexer.needs_rebuild(SOURCE).unwrap());
        assert!(indexer.needs_rebuild("memory://other.gff3.gz").unwrap());
    }

    #[tokio::test]
    async fn test_event_sequence_and_progress() {
        let text = ten_by_ten();
        let indexer = indexer();
        let request = IngestRequest::new(SOURCE).with_batch_size(30).with_chunk_size(700);
        let (outcome, events) = ingest(&indexer, request, &text).await;

        assert!(matches!(events.first(), Some(IngestEvent::Begin { .. })));
        let summary = match events.last() {
            Some(IngestEvent::End(summary)) => summary.clone(),
            other => panic!("expected End, got {:?}", other),
        };
        assert_eq!(outcome, IngestOutcome::Completed(summary.clone()));
        assert_eq!(summary.contigs_count, 10);
        assert_eq!(summary.records, 100);
        assert_eq!(summary.batches, 4);
        assert_eq!(summary.skipped_lines, 0);

        let progress: Vec<Progress> = events
            .iter()
            .filter_map(|e| match e {
                IngestEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert!(progress.len() > 1);
        assert!(progress.windows(2).all(|w| w[0].processed_bytes < w[1].processed_bytes));
        let last = progress[progress.len() - 1];
        assert_eq!(last.processed_bytes, text.len() as u64);
        assert!(last.total_bytes.is_some());
        assert_eq!(last.percent, Some(100.0));
    }

    #[tokio::test]
    async fn test_idempotent_after_reset() {
        let text = ten_by_ten();
        let indexer = indexer();

        ingest(&indexer, IngestRequest::new(SOURCE).with_batch_size(7), &text).await;
        let first = indexer.store().lock().unwrap().all_contigs().unwrap();

        indexer.reset().unwrap();
        assert_eq!(indexer.state(), IngestState::Idle);
        assert_eq!(indexer.current_source(), None);

        ingest(&indexer, IngestRequest::new(SOURCE).with_batch_size(7), &text).await;
        let second = indexer.store().lock().unwrap().all_contigs().unwrap();

        assert_eq!(first.len(), 10);
        assert_eq!(first, second);
    }

    /// Data transport that fires a cancellation token once `reads` reads have completed
    #[derive(Debug)]
    struct CancelAfterReads {
        inner: Arc<MemoryFile>,
        reads: usize,
        token: Mutex<Option<CancellationToken>>,
    }

    #[async_trait]
    impl RangeFetch for CancelAfterReads {
        async fn read(&self, length: u64, offset: u64) -> Result<Bytes, FetchError> {
            let bytes = self.inner.read(length, offset).await?;
            if self.inner.read_calls() >= self.reads {
                if let Some(token) = self.token.lock().unwrap().as_ref() {
                    token.cancel();
                }
            }
            Ok(bytes)
        }

        async fn read_file(&self) -> Result<Bytes, FetchError> {
            self.inner.read_file().await
        }

        async fn stat(&self) -> Result<FileStat, FetchError> {
            self.inner.stat().await
        }
    }

    #[tokio::test]
    async fn test_cancel_then_reset_and_reingest() {
        let text = ten_by_ten();
        let request = IngestRequest::new(SOURCE).with_batch_size(20).with_chunk_size(1500);

        let reference = indexer();
        ingest(&reference, request.clone(), &text).await;
        let full_count = reference.contig_count().unwrap();
        assert_eq!(full_count, 10);

        let indexer = indexer();
        let (data, index) = resources(&text, 1000);
        let cancelling = Arc::new(CancelAfterReads {
            inner: data.clone(),
            reads: 1,
            token: Mutex::new(None),
        });
        let handle = indexer
            .start_with_resources(request.clone(), cancelling.clone(), index)
            .unwrap();
        *cancelling.token.lock().unwrap() = Some(handle.cancellation_token());

        let (outcome, events) = drain(handle).await;
        assert_eq!(outcome, IngestOutcome::Cancelled);
        assert_eq!(indexer.state(), IngestState::Cancelled);
        assert!(!events
            .iter()
            .any(|e| matches!(e, IngestEvent::End(_) | IngestEvent::Error(_))));
        // No reads after the cancelling one
        assert_eq!(data.read_calls(), 1);

        let partial = indexer.contig_count().unwrap();
        assert!(partial > 0 && partial < full_count, "partial count {}", partial);
        assert!(indexer.index_metadata().unwrap().is_none());
        assert!(indexer.needs_rebuild(SOURCE).unwrap());

        indexer.reset().unwrap();
        let (outcome, _) = ingest(&indexer, request, &text).await;
        assert!(matches!(outcome, IngestOutcome::Completed(_)));
        assert_eq!(indexer.contig_count().unwrap(), full_count);
    }

    #[tokio::test]
    async fn test_transport_failure_reports_error_and_store_recovers() {
        let text = ten_by_ten();
        let indexer = indexer();
        let (compressed, gzi) = bgzip(text.as_bytes(), 1000);
        let data = Arc::new(MemoryFile::new("genome.gff3.gz", compressed).with_failure_after(1));
        let index = Arc::new(MemoryFile::new("genome.gff3.gz.gzi", gzi));

        let request = IngestRequest::new(SOURCE).with_chunk_size(1500);
        let handle = indexer.start_with_resources(request, data, index).unwrap();
        let (outcome, events) = drain(handle).await;

        let message = match outcome {
            IngestOutcome::Failed(message) => message,
            other => panic!("expected failure, got {:?}", other),
        };
        assert!(message.contains("503"), "{}", message);
        assert_eq!(events.last(), Some(&IngestEvent::Error(message)));
        assert!(!events.iter().any(|e| matches!(e, IngestEvent::End(_))));
        assert_eq!(indexer.state(), IngestState::Failed);
        assert!(indexer.index_metadata().unwrap().is_none());

        indexer.reset().unwrap();
        assert_eq!(indexer.contig_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_rebuild_forgets_previous_source() {
        let text = ten_by_ten();
        let indexer = indexer();
        let (outcome, _) = ingest(&indexer, IngestRequest::new(SOURCE), &text).await;
        assert!(matches!(outcome, IngestOutcome::Completed(_)));
        assert!(!indexer.needs_rebuild(SOURCE).unwrap());

        // A second source, streamed on top without a reset, fails part way
        let other = "memory://other.gff3.gz";
        let (compressed, gzi) = bgzip(text.replace("ctg", "alt").as_bytes(), 1000);
        let data = Arc::new(MemoryFile::new("other.gff3.gz", compressed).with_failure_after(1));
        let index = Arc::new(MemoryFile::new("other.gff3.gz.gzi", gzi));
        let request = IngestRequest::new(other).with_batch_size(5).with_chunk_size(1500);
        let handle = indexer.start_with_resources(request, data, index).unwrap();
        assert_eq!(indexer.current_source(), None);

        let (outcome, _) = drain(handle).await;
        assert!(matches!(outcome, IngestOutcome::Failed(_)));
        assert!(indexer.contig_count().unwrap() > 10);
        assert!(indexer.index_metadata().unwrap().is_none());
        assert_eq!(indexer.current_source(), None);
        assert!(indexer.needs_rebuild(SOURCE).unwrap());
        assert!(indexer.needs_rebuild(other).unwrap());
    }

    /// Data transport whose reads panic
    #[derive(Debug)]
    struct PanickingFetch;

    #[async_trait]
    impl RangeFetch for PanickingFetch {
        async fn read(&self, _length: u64, _offset: u64) -> Result<Bytes, FetchError> {
            panic!("transport bug");
        }

        async fn read_file(&self) -> Result<Bytes, FetchError> {
            panic!("transport bug");
        }

        async fn stat(&self) -> Result<FileStat, FetchError> {
            Ok(FileStat::unknown())
        }
    }

    #[tokio::test]
    async fn test_panicked_run_does_not_stay_running() {
        let text = ten_by_ten();
        let indexer = indexer();
        let (_, index) = resources(&text, 1000);
        let mut handle = indexer
            .start_with_resources(IngestRequest::new(SOURCE), Arc::new(PanickingFetch), index)
            .unwrap();
        while handle.recv().await.is_some() {}
        assert!(matches!(handle.wait().await, Err(IngestError::Task(_))));
        assert_eq!(indexer.state(), IngestState::Failed);

        // Usable again
        indexer.reset().unwrap();
        let (outcome, _) = ingest(&indexer, IngestRequest::new(SOURCE), &text).await;
        assert!(matches!(outcome, IngestOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_concurrent_start_rejected() {
        let text = ten_by_ten();
        let indexer = indexer();
        let (data, index) = resources(&text, 1000);
        let handle = indexer
            .start_with_resources(IngestRequest::new(SOURCE), data, index)
            .unwrap();
        assert_eq!(indexer.state(), IngestState::Running);

        let (data, index) = resources(&text, 1000);
        assert!(matches!(
            indexer.start_with_resources(IngestRequest::new("memory://other"), data, index),
            Err(IngestError::AlreadyRunning)
        ));
        assert!(matches!(indexer.reset(), Err(IngestError::AlreadyRunning)));

        let (outcome, _) = drain(handle).await;
        assert!(matches!(outcome, IngestOutcome::Completed(_)));

        // Terminal state may start again
        let (outcome, _) = ingest(&indexer, IngestRequest::new(SOURCE), &text).await;
        assert!(matches!(outcome, IngestOutcome::Completed(_)));
    }

    struct SyntheticFeature {
        contig: String,
        end: u64,
        interpros: Vec<String>,
        pfams: Vec<String>,
        gos: Vec<String>,
    }

    fn synthetic_features() -> Vec<SyntheticFeature> {
        (0..240)
            .map(|i: usize| {
                let interpros = match i % 4 {
                    0 => vec![],
                    1 => vec![format!("IPR{:06}", i % 9)],
                    _ => vec![format!("IPR{:06}", i % 9), format!("IPR{:06}", (i + 3) % 9)],
                };
                let pfams = if i % 3 == 0 { vec![format!("pf{:05}", i % 5)] } else { vec![] };
                let gos = if i % 5 == 0 { vec![format!("GO:{:07}", i % 4)] } else { vec![] };
                SyntheticFeature {
                    contig: format!("scaffold_{}", (i * 7) % 17),
                    end: 100 + ((i * 131) % 5000) as u64,
                    interpros,
                    pfams,
                    gos,
                }
            })
            .collect()
    }

    fn render(features: &[SyntheticFeature]) -> String {
        let mut text = String::from("##gff-version 3\n##sequence-region scaffold_0 1 9000\n");
        for (i, f) in features.iter().enumerate() {
            let mut attrs = vec![format!("ID=f{}", i), "product=hypothetical protein".to_string()];
            if !f.interpros.is_empty() {
                attrs.push(format!("interpro={}", f.interpros.join(",")));
            }
            if !f.pfams.is_empty() {
                attrs.push(format!("pfam={}", f.pfams.join(",")));
            }
            if !f.gos.is_empty() {
                // GO ids percent-escaped the way some annotators emit them
                let escaped: Vec<String> = f.gos.iter().map(|g| g.replace(':', "%3A")).collect();
                attrs.push(format!("go={}", escaped.join(",")));
            }
            text.push_str(&format!("{}\tpipeline\tCDS\t1\t{}\t.\t-\t1\t{}\n", f.contig, f.end, attrs.join(";")));
            if i % 50 == 0 {
                text.push_str("truncated\tline\n");
            }
        }
        text
    }

    fn as_set(values: &[String]) -> BTreeSet<String> {
        values.iter().cloned().collect()
    }

    #[tokio::test]
    async fn test_round_trip_matches_independent_aggregation() {
        let features = synthetic_features();
        let text = render(&features);

        // contig -> (length, category values)
        let mut expected: BTreeMap<String, (u64, [BTreeSet<String>; 3])> = BTreeMap::new();
        for f in &features {
            let entry = expected
                .entry(f.contig.clone())
                .or_insert_with(|| (0, [BTreeSet::new(), BTreeSet::new(), BTreeSet::new()]));
            entry.0 = entry.0.max(f.end);
            entry.1[0].extend(f.interpros.iter().cloned());
            entry.1[1].extend(f.pfams.iter().map(|p| p.to_uppercase()));
            entry.1[2].extend(f.gos.iter().cloned());
        }

        let indexer = indexer();
        let request = IngestRequest::new(SOURCE)
            .with_attrs(&[AnnotationCategory::Interpro, AnnotationCategory::Pfam, AnnotationCategory::Go])
            .with_batch_size(17)
            .with_chunk_size(2048);
        let (outcome, _) = ingest(&indexer, request, &text).await;
        let summary = match outcome {
            IngestOutcome::Completed(summary) => summary,
            other => panic!("expected completion, got {:?}", other),
        };
        assert_eq!(summary.records, features.len());
        assert_eq!(summary.skipped_lines, 5);

        let mut stored = Vec::new();
        let mut page = 1;
        loop {
            let result = indexer.query(&ContigQuery::default().page(page).page_size(4)).unwrap();
            assert_eq!(result.count, expected.len());
            if result.items.is_empty() {
                break;
            }
            stored.extend(result.items);
            page += 1;
        }
        assert_eq!(stored.len(), expected.len());

        for contig in stored {
            let (length, values) = &expected[&contig.contig_name];
            assert_eq!(contig.length, *length, "{}", contig.contig_name);
            assert_eq!(as_set(&contig.annotations.interpros), values[0], "{}", contig.contig_name);
            assert_eq!(as_set(&contig.annotations.pfams), values[1], "{}", contig.contig_name);
            assert_eq!(as_set(&contig.annotations.gos), values[2], "{}", contig.contig_name);
            assert_eq!(contig.presence.has_interpros, !values[0].is_empty());
            assert_eq!(contig.presence.has_pfams, !values[1].is_empty());
            assert!(contig.annotations.keggs.is_empty() && !contig.presence.has_keggs);
        }
    }

    #[tokio::test]
    async fn test_start_by_path_reads_local_files() {
        let text = ten_by_ten();
        let (compressed, gzi) = bgzip(text.as_bytes(), 1000);
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("genome.gff3.gz");
        std::fs::write(&source, compressed).unwrap();
        std::fs::write(dir.path().join("genome.gff3.gz.gzi"), gzi).unwrap();

        let indexer = Indexer::open(dir.path().join("index.sqlite")).unwrap();
        let source_url = source.to_string_lossy().into_owned();
        let handle = indexer.start(IngestRequest::new(source_url.clone())).unwrap();
        let (outcome, _) = drain(handle).await;

        assert!(matches!(outcome, IngestOutcome::Completed(ref s) if s.contigs_count == 10));
        let reopened = Indexer::open(dir.path().join("index.sqlite")).unwrap();
        assert_eq!(reopened.current_source(), Some(source_url));
    }

    #[test]
    fn test_aggregate_by_contig_preserves_first_seen_order() {
        let mut parser = RecordParser::new(&[AnnotationCategory::Cog]);
        let records: Vec<FeatureRecord> = [
            "b\ts\tCDS\t1\t50\t.\t+\t0\tcog=COG0001",
            "a\ts\tCDS\t1\t70\t.\t+\t0\tcog=COG0002",
            "b\ts\tCDS\t60\t90\t.\t+\t0\tcog=COG0001,COG0003",
        ]
        .iter()
        .filter_map(|line| parser.parse_line(line))
        .collect();

        let contigs = aggregate_by_contig(&records);
        assert_eq!(contigs.len(), 2);
        assert_eq!(contigs[0].contig_name, "b");
        assert_eq!(contigs[0].length, 90);
        assert_eq!(contigs[0].annotations.cogs, vec!["COG0001", "COG0003"]);
        assert!(contigs[0].presence.has_cogs);
        assert_eq!(contigs[1].contig_name, "a");
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(Progress::new(50, Some(200)).percent, Some(25.0));
        assert_eq!(Progress::new(250, Some(200)).percent, Some(100.0));
        assert_eq!(Progress::new(50, None).percent, None);
    }
}
