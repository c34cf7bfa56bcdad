//! Consumption history retention
//!
//! Daily records older than a rolling window are deleted in bounded batches. Purges
//! are triggered after writes to a user's history and run as detached tasks: a
//! failure is logged and the next write simply tries again.

use chrono::{Duration, NaiveDate};

use crate::db::{consumption_history, BatchWriter, DocKey, Store, StoreError, WriteOp};
use crate::metrics::record_records_purged;

use super::aggregation::ids_before;

/// Outcome of one purge
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PurgeStats {
    /// Number of daily records deleted
    pub records_removed: usize,
    /// Number of atomic batches committed
    pub batches: usize,
}

/// Deletes a user's daily records that fall outside the retention window
#[derive(Clone)]
pub struct RetentionManager {
    store: Store,
    batch_limit: usize,
    window_days: u32,
}

impl RetentionManager {
    pub fn new(store: Store, batch_limit: usize, window_days: u32) -> Self {
        Self {
            store,
            batch_limit,
            window_days,
        }
    }

    pub fn window_days(&self) -> u32 {
        self.window_days
    }

    /// First date kept when today is `today`
    pub fn cutoff_for(&self, today: NaiveDate) -> NaiveDate {
        today - Duration::days(self.window_days as i64)
    }

    /// Delete every record dated strictly before `cutoff`. Running it again is a no-op.
    pub async fn purge_older_than(
        &self,
        user_id: &str,
        cutoff: NaiveDate,
    ) -> Result<PurgeStats, StoreError> {
        let ids = ids_before(self.store.as_ref(), user_id, cutoff).await?;
        if ids.is_empty() {
            return Ok(PurgeStats::default());
        }

        tracing::debug!(
            user_id = %user_id,
            cutoff = %cutoff,
            count = ids.len(),
            "Found expired consumption records"
        );

        let collection = consumption_history(user_id);
        let mut writer = BatchWriter::new(self.store.as_ref(), self.batch_limit);
        for id in ids {
            writer
                .push(WriteOp::Delete {
                    key: DocKey::new(collection.clone(), id),
                })
                .await?;
        }
        let batch_stats = writer.finish().await?;

        record_records_purged(batch_stats.writes_committed as u64);

        Ok(PurgeStats {
            records_removed: batch_stats.writes_committed,
            batches: batch_stats.batches_committed,
        })
    }

    /// Purge in a detached task; the caller never waits and failures are only logged
    pub fn spawn_purge(&self, user_id: &str, cutoff: NaiveDate) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let user_id = user_id.to_string();

        tokio::spawn(async move {
            match manager.purge_older_than(&user_id, cutoff).await {
                Ok(stats) if stats.records_removed > 0 => {
                    tracing::info!(
                        user_id = %user_id,
                        cutoff = %cutoff,
                        records = stats.records_removed,
                        batches = stats.batches,
                        "Retention purge completed"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        cutoff = %cutoff,
                        error = %e,
                        "Retention purge failed"
                    );
                }
            }
        })
    }
}
