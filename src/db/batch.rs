//! Bounded batch writer.
//!
//! Backends cap how many writes one atomic commit may carry. [`BatchWriter`] accumulates
//! writes and flushes a batch whenever the cap is reached, so callers that touch an
//! unbounded number of documents (retention purges) stay portable across backends with
//! different limits.

use super::{DocumentStore, StoreError, WriteBatch, WriteOp};

/// Totals reported once a writer is finished
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub batches_committed: usize,
    pub writes_committed: usize,
}

pub struct BatchWriter<'a> {
    store: &'a dyn DocumentStore,
    limit: usize,
    pending: WriteBatch,
    stats: BatchStats,
}

impl<'a> BatchWriter<'a> {
    /// `limit` is clamped to the backend's own maximum and to at least one write
    pub fn new(store: &'a dyn DocumentStore, limit: usize) -> Self {
        let limit = limit.min(store.max_batch_size()).max(1);
        Self {
            store,
            limit,
            pending: WriteBatch::new(),
            stats: BatchStats::default(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Queue a write, committing the pending batch first if it is full
    pub async fn push(&mut self, op: WriteOp) -> Result<(), StoreError> {
        if self.pending.len() >= self.limit {
            self.flush().await?;
        }
        self.pending.push(op, None);
        Ok(())
    }

    /// Commit whatever is pending
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.pending);
        let size = batch.len();
        self.store.commit(batch).await?;

        self.stats.batches_committed += 1;
        self.stats.writes_committed += size;
        tracing::trace!(writes = size, "Committed write batch");
        Ok(())
    }

    /// Flush the remainder and report totals
    pub async fn finish(mut self) -> Result<BatchStats, StoreError> {
        self.flush().await?;
        Ok(self.stats)
    }
}
