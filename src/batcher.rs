// ==============================================================================
// batcher.rs - Backpressured Record Batcher
// ==============================================================================
// Description: Buffers parsed records and hands full batches to a sink, one
//              delivery at a time
// Author: Matt Barham
// Created: 2026-10-01
// Modified: 2026-10-12
// Version: 1.1.0
// ==============================================================================

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::FeatureRecord;
use crate::store::StoreError;

/// Default number of records per delivered batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Failed to persist batch: {0}")]
    Store(#[from] StoreError),

    #[error("Batch delivery task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Consumer of full batches
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    async fn deliver(&self, batch: Vec<FeatureRecord>) -> Result<(), BatchError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub batches: usize,
    pub records: usize,
}

/// Swap-buffer batcher with at most one delivery in flight
///
/// `push` hands off the buffer once it reaches `batch_size`, waiting for the
/// previous delivery first. The producer calls `settle` between chunks so a
/// slow sink throttles reading.
pub struct Batcher<S: BatchSink> {
    sink: Arc<S>,
    batch_size: usize,
    buffer: Vec<FeatureRecord>,
    in_flight: Option<JoinHandle<Result<(), BatchError>>>,
    stats: BatchStats,
}

impl<S: BatchSink> Batcher<S> {
    pub fn new(sink: S, batch_size: usize) -> Self {
        Self::with_shared_sink(Arc::new(sink), batch_size)
    }

    pub fn with_shared_sink(sink: Arc<S>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            sink,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            in_flight: None,
            stats: BatchStats::default(),
        }
    }

    pub async fn push(&mut self, record: FeatureRecord) -> Result<(), BatchError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            let full = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
            self.dispatch(full).await?;
        }
        Ok(())
    }

    /// Wait for the in-flight delivery, if any
    pub async fn settle(&mut self) -> Result<(), BatchError> {
        if let Some(handle) = self.in_flight.take() {
            handle.await??;
        }
        Ok(())
    }

    /// Flush the remainder and wait for every delivery to land
    pub async fn finish(mut self) -> Result<BatchStats, BatchError> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.dispatch(rest).await?;
        }
        self.settle().await?;
        debug!(
            "Batcher finished: {} records in {} batches",
            self.stats.records, self.stats.batches
        );
        Ok(self.stats)
    }

    /// Drop buffered records without delivering them
    ///
    /// A delivery already in flight is allowed to complete so no write races a
    /// later reset of the store.
    pub async fn abandon(mut self) -> BatchStats {
        let dropped = self.buffer.len();
        self.buffer.clear();
        if let Err(e) = self.settle().await {
            warn!("In-flight batch failed while abandoning: {}", e);
        }
        debug!("Batcher abandoned with {} undelivered records", dropped);
        self.stats
    }

    /// Records waiting in the buffer (not yet handed to the sink)
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    async fn dispatch(&mut self, batch: Vec<FeatureRecord>) -> Result<(), BatchError> {
        self.settle().await?;

        self.stats.batches += 1;
        self.stats.records += batch.len();
        debug!("Dispatching batch {} ({} records)", self.stats.batches, batch.len());

        let sink = Arc::clone(&self.sink);
        self.in_flight = Some(tokio::spawn(async move { sink.deliver(batch).await }));
        Ok(())
    }
}
