//! Partition Router - Routes batches to partition-specific runtimes
//!
//! Workers are created synchronously during partition assignment and revoked
//! synchronously during revocation; draining them happens afterwards, off the
//! rebalance callback. Batch routing only sends to existing workers.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::info;

use crate::kafka::client::ConsumerClient;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::rebalance_handler::RebalanceHandler;
use crate::kafka::types::{Partition, PartitionState};
use crate::metrics_consts::{
    ASSIGNED_PARTITIONS, PARTITION_BACKPRESSURE, PARTITION_BACKPRESSURE_WAIT_MS,
    UNROUTABLE_BATCHES,
};
use crate::processing::context::BatchProcessor;
use crate::processing::runtime::{FailureSender, PartitionBatch, PartitionWorker, RuntimeConfig};

pub struct PartitionRouter {
    workers: DashMap<Partition, PartitionWorker>,
    /// Seek epoch of the consumer's fetch position per assigned partition
    seek_epochs: DashMap<Partition, u64>,
    /// Revoked workers waiting to be drained
    revoked: Mutex<Vec<PartitionWorker>>,
    processor: Arc<dyn BatchProcessor>,
    client: Arc<dyn ConsumerClient>,
    offset_tracker: Arc<OffsetTracker>,
    config: RuntimeConfig,
    failures: Option<FailureSender>,
}

impl PartitionRouter {
    pub fn new(
        processor: Arc<dyn BatchProcessor>,
        client: Arc<dyn ConsumerClient>,
        offset_tracker: Arc<OffsetTracker>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            workers: DashMap::new(),
            seek_epochs: DashMap::new(),
            revoked: Mutex::new(Vec::new()),
            processor,
            client,
            offset_tracker,
            config,
            failures: None,
        }
    }

    /// Report failed batches on `failures`
    pub fn with_failures(mut self, failures: FailureSender) -> Self {
        self.failures = Some(failures);
        self
    }

    pub fn offset_tracker(&self) -> &Arc<OffsetTracker> {
        &self.offset_tracker
    }

    /// Add a worker for a partition (called during partition assignment)
    ///
    /// If a worker already exists for this partition it is reused.
    pub fn add_partition(&self, partition: Partition) {
        self.offset_tracker.assign_partition(&partition);

        if self.workers.contains_key(&partition) {
            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Worker already exists, reusing"
            );
            return;
        }

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            mode = self.config.mode.as_str(),
            "Creating partition worker"
        );

        let worker = PartitionWorker::new(
            partition.clone(),
            self.processor.clone(),
            self.client.clone(),
            self.offset_tracker.clone(),
            &self.config,
            self.failures.clone(),
        );
        self.workers.insert(partition, worker);
        metrics::gauge!(ASSIGNED_PARTITIONS).set(self.workers.len() as f64);
    }

    pub fn add_partitions(&self, partitions: &[Partition]) {
        for partition in partitions {
            self.add_partition(partition.clone());
        }
    }

    /// Remove and revoke the worker of a partition.
    ///
    /// The worker's in-flight batch can no longer be committed and later batches are
    /// skipped. Returns the worker for async shutdown.
    pub fn revoke_partition(&self, partition: &Partition) -> Option<PartitionWorker> {
        self.seek_epochs.remove(partition);
        let (_, worker) = self.workers.remove(partition)?;
        worker.revoke();
        metrics::gauge!(ASSIGNED_PARTITIONS).set(self.workers.len() as f64);

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Revoked partition worker"
        );
        Some(worker)
    }

    pub fn revoke_partitions(&self, partitions: &[Partition]) -> Vec<PartitionWorker> {
        partitions
            .iter()
            .filter_map(|p| self.revoke_partition(p))
            .collect()
    }

    /// Route a batch to its partition worker, waiting while the worker's channel is full
    pub async fn route_batch(&self, batch: PartitionBatch) -> Result<()> {
        let partition = batch.partition.clone();

        // Release the DashMap guard before awaiting
        let (sender, capacity) = match self.workers.get(&partition) {
            Some(worker) => (worker.sender(), worker.capacity()),
            None => {
                metrics::counter!(UNROUTABLE_BATCHES).increment(1);
                return Err(anyhow!(
                    "No worker for partition {partition} - was it assigned?"
                ));
            }
        };

        let send_start = (capacity == 0).then(|| {
            metrics::counter!(
                PARTITION_BACKPRESSURE,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .increment(1);
            Instant::now()
        });

        let result = sender.send(batch).await.map_err(|_| {
            anyhow!("Failed to send batch to worker for {partition}: channel closed")
        });

        if let Some(start) = send_start {
            metrics::histogram!(
                PARTITION_BACKPRESSURE_WAIT_MS,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .record(start.elapsed().as_millis() as f64);
        }

        result
    }

    /// Record that the consumer's fetch position moved for `partition`
    pub fn record_seek(&self, partition: &Partition, seek_epoch: u64) {
        if self.workers.contains_key(partition) {
            self.seek_epochs.insert(partition.clone(), seek_epoch);
        }
    }

    /// Seek epoch to tag freshly fetched batches of `partition` with
    pub fn seek_epoch(&self, partition: &Partition) -> u64 {
        self.seek_epochs.get(partition).map(|e| *e).unwrap_or(0)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn has_partition(&self, partition: &Partition) -> bool {
        self.workers.contains_key(partition)
    }

    /// State of the partition's current worker, `None` when unassigned
    pub fn partition_state(&self, partition: &Partition) -> Option<PartitionState> {
        self.workers.get(partition).map(|w| w.state())
    }

    /// Remove every worker (active and revoked) for async shutdown
    pub fn shutdown_all(&self) -> Vec<PartitionWorker> {
        let keys: Vec<Partition> = self.workers.iter().map(|r| r.key().clone()).collect();
        info!(worker_count = keys.len(), "Shutting down partition router");

        let mut workers = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, worker)) = self.workers.remove(&key) {
                workers.push(worker);
            }
        }
        workers.append(&mut self.take_revoked(None));
        self.seek_epochs.clear();
        metrics::gauge!(ASSIGNED_PARTITIONS).set(0.0);
        workers
    }

    fn take_revoked(&self, partitions: Option<&[Partition]>) -> Vec<PartitionWorker> {
        let mut revoked = self
            .revoked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let (taken, kept): (Vec<_>, Vec<_>) = revoked
            .drain(..)
            .partition(|w| partitions.map_or(true, |p| p.contains(w.partition())));
        *revoked = kept;
        taken
    }
}

/// Shut workers down concurrently
pub async fn shutdown_workers(workers: Vec<PartitionWorker>) {
    let shutdown_futures: Vec<_> = workers.into_iter().map(|w| w.shutdown()).collect();
    join_all(shutdown_futures).await;
}

#[async_trait]
impl RebalanceHandler for PartitionRouter {
    fn setup_assigned_partitions(&self, partitions: &[Partition]) {
        self.add_partitions(partitions);
    }

    fn setup_revoked_partitions(&self, partitions: &[Partition]) {
        let workers = self.revoke_partitions(partitions);
        self.revoked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(workers);
    }

    async fn cleanup_revoked_partitions(&self, partitions: &[Partition]) -> Result<()> {
        let workers = self.take_revoked(Some(partitions));
        if workers.is_empty() {
            return Ok(());
        }

        info!(
            worker_count = workers.len(),
            "Draining revoked partition workers"
        );
        shutdown_workers(workers).await;
        Ok(())
    }

    async fn on_post_rebalance(&self) -> Result<()> {
        info!(
            worker_count = self.worker_count(),
            "Post-rebalance: partition changes complete"
        );
        Ok(())
    }
}
