//! Offset Tracker - Tracks the next offset to commit per owned partition
//!
//! Partition workers record offsets here once the processing core allows it (a
//! finished, non-revoked batch or a direct mark). The poll loop periodically commits
//! whatever is tracked. Partitions must be registered on assignment; marks for a
//! partition that is not (or no longer) owned are dropped, so a worker finishing after
//! revocation can never resurrect a commit for a partition we lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::kafka::client::{ClientError, ConsumerClient};
use crate::kafka::types::Partition;
use crate::metrics_consts::{
    COMMITS_SKIPPED_REBALANCING, OFFSET_COMMITS, OFFSET_TRACKER_OUT_OF_ORDER_BATCH,
};

/// Errors that can occur when retrieving committable offsets
#[derive(Error, Debug)]
pub enum OffsetTrackerError {
    /// A rebalance is currently in progress - commits should be skipped
    #[error("Rebalance in progress - offset commits should be skipped")]
    RebalanceInProgress,
    #[error("Failed to commit offsets: {0}")]
    Commit(#[from] ClientError),
}

/// State tracked per owned partition
#[derive(Debug, Default)]
struct PartitionState {
    /// The next offset to consume (highest processed + 1)
    processed_offset: Option<i64>,
    /// The last batch ID that was processed (for ordering verification)
    last_processed_batch_id: u64,
    /// Offset of the last successful commit
    committed_offset: Option<i64>,
}

/// Thread-safe tracker for processed offsets per partition
pub struct OffsetTracker {
    partition_state: DashMap<Partition, PartitionState>,
    /// Global counter for assigning batch IDs (unique across all partitions)
    next_batch_id: AtomicU64,
    /// When true, offset commits are skipped
    rebalancing: AtomicBool,
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self {
            partition_state: DashMap::new(),
            next_batch_id: AtomicU64::new(1), // Start at 1 so 0 can mean "no batch"
            rebalancing: AtomicBool::new(false),
        }
    }

    /// Set the rebalancing flag to prevent offset commits during rebalancing
    pub fn set_rebalancing(&self, rebalancing: bool) {
        let was_rebalancing = self.rebalancing.swap(rebalancing, Ordering::SeqCst);
        if was_rebalancing != rebalancing {
            info!(
                rebalancing = rebalancing,
                "Offset tracker rebalancing state changed"
            );
        }
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalancing.load(Ordering::SeqCst)
    }

    /// Assign a new, globally increasing batch ID
    pub fn assign_batch_id(&self) -> u64 {
        self.next_batch_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Start tracking a newly assigned partition
    pub fn assign_partition(&self, partition: &Partition) {
        self.partition_state.entry(partition.clone()).or_default();
    }

    /// Record `next_offset` (last processed + 1) for a partition.
    ///
    /// Offsets only move forward. Returns false when the mark was dropped because the
    /// partition is not owned.
    pub fn mark_processed(&self, partition: &Partition, batch_id: u64, next_offset: i64) -> bool {
        let Some(mut state) = self.partition_state.get_mut(partition) else {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = next_offset,
                "Dropping offset mark for partition that is not owned"
            );
            return false;
        };

        if batch_id < state.last_processed_batch_id {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                batch_id = batch_id,
                last_batch_id = state.last_processed_batch_id,
                "Batch processed out of order"
            );
            metrics::counter!(
                OFFSET_TRACKER_OUT_OF_ORDER_BATCH,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .increment(1);
        }

        // Only advance offset, never go backwards
        if state
            .processed_offset
            .map_or(true, |current| next_offset > current)
        {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                batch_id = batch_id,
                previous_offset = ?state.processed_offset,
                new_offset = next_offset,
                "Advancing processed offset"
            );
            state.processed_offset = Some(next_offset);
        }

        if batch_id > state.last_processed_batch_id {
            state.last_processed_batch_id = batch_id;
        }
        true
    }

    /// Snapshot of offsets ready for commit
    pub fn get_committable_offsets(&self) -> Result<HashMap<Partition, i64>, OffsetTrackerError> {
        if self.rebalancing.load(Ordering::SeqCst) {
            return Err(OffsetTrackerError::RebalanceInProgress);
        }

        Ok(self
            .partition_state
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .processed_offset
                    .map(|offset| (entry.key().clone(), offset))
            })
            .collect())
    }

    /// Committable offsets that moved since the last successful commit
    pub fn get_uncommitted_offsets(&self) -> Result<HashMap<Partition, i64>, OffsetTrackerError> {
        if self.rebalancing.load(Ordering::SeqCst) {
            return Err(OffsetTrackerError::RebalanceInProgress);
        }

        Ok(self
            .partition_state
            .iter()
            .filter_map(|entry| {
                let state = entry.value();
                match state.processed_offset {
                    Some(offset) if state.committed_offset != Some(offset) => {
                        Some((entry.key().clone(), offset))
                    }
                    _ => None,
                }
            })
            .collect())
    }

    /// Record a successful commit
    pub fn mark_committed(&self, offsets: &HashMap<Partition, i64>) {
        for (partition, offset) in offsets {
            if let Some(mut state) = self.partition_state.get_mut(partition) {
                state.committed_offset = Some(*offset);
            }
        }
    }

    pub fn get_committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.partition_state
            .get(partition)
            .and_then(|r| r.value().committed_offset)
    }

    /// Commit changed offsets through the client. Returns the number of partitions committed.
    pub fn commit_to(&self, client: &dyn ConsumerClient) -> Result<usize, OffsetTrackerError> {
        let offsets = match self.get_uncommitted_offsets() {
            Ok(offsets) => offsets,
            Err(e) => {
                metrics::counter!(COMMITS_SKIPPED_REBALANCING).increment(1);
                return Err(e);
            }
        };

        if offsets.is_empty() {
            return Ok(0);
        }

        client.commit(&offsets)?;
        self.mark_committed(&offsets);
        metrics::counter!(OFFSET_COMMITS).increment(1);
        Ok(offsets.len())
    }

    pub fn get_partition_offset(&self, partition: &Partition) -> Option<i64> {
        self.partition_state
            .get(partition)
            .and_then(|r| r.value().processed_offset)
    }

    pub fn is_owned(&self, partition: &Partition) -> bool {
        self.partition_state.contains_key(partition)
    }

    /// Stop tracking a partition (during revocation)
    pub fn clear_partition(&self, partition: &Partition) {
        if self.partition_state.remove(partition).is_some() {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Cleared offset tracking for revoked partition"
            );
        }
    }

    /// Clear all partitions (during shutdown)
    pub fn clear_all(&self) {
        self.partition_state.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.partition_state.len()
    }
}
