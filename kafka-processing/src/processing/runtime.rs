//! Partition Runtime - Dedicated worker driving the processing lifecycle of one partition
//!
//! Each assigned partition gets its own worker with a bounded channel, ensuring:
//! 1. Ordering is preserved within each partition
//! 2. Parallelism is achieved across partitions
//! 3. Backpressure is applied when processing falls behind
//!
//! For every delivered batch the worker opens a [`Coordinator`], hands the batch to
//! application code in the partition's [`ProcessingMode`] and, once every unit finished,
//! records the committable offset or pauses the partition for a retry.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::anyhow;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::kafka::client::ConsumerClient;
use crate::kafka::message::KafkaMessage;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::{Partition, PartitionState};
use crate::metrics_consts::{
    BATCHES_FAILED, BATCHES_PROCESSED, BATCH_PROCESSING_DURATION_MS, COMMITS_SUPPRESSED_REVOKED,
    REVOKED_BATCHES_SKIPPED, STALE_MESSAGES_DISCARDED, VIRTUAL_PARTITION_GROUPS,
};
use crate::processing::backoff::BackoffPolicy;
use crate::processing::context::{BatchContext, BatchProcessor};
use crate::processing::coordinator::Coordinator;
use crate::processing::mode::ProcessingMode;
use crate::processing::pause::PauseController;

/// A batch of messages for a single partition
#[derive(Debug)]
pub struct PartitionBatch {
    pub partition: Partition,
    pub messages: Vec<KafkaMessage>,
    /// Sequential batch ID for ordering verification
    pub batch_id: u64,
    /// Seek epoch of the partition when the batch was fetched
    pub seek_epoch: u64,
}

impl PartitionBatch {
    pub fn new(
        partition: Partition,
        messages: Vec<KafkaMessage>,
        batch_id: u64,
        seek_epoch: u64,
    ) -> Self {
        Self {
            partition,
            messages,
            batch_id,
            seek_epoch,
        }
    }
}

/// A batch that completed with a unit error
#[derive(Debug, Clone)]
pub struct ProcessingFailure {
    pub partition: Partition,
    pub first_offset: i64,
    pub last_offset: i64,
    pub error: Arc<anyhow::Error>,
}

pub type FailureSender = mpsc::UnboundedSender<ProcessingFailure>;
pub type FailureReceiver = mpsc::UnboundedReceiver<ProcessingFailure>;

/// Configuration for partition runtimes
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Size of the channel buffer per partition
    pub channel_buffer_size: usize,
    pub backoff: BackoffPolicy,
    /// When false, a successful batch counts as fully consumed
    pub manual_offset_management: bool,
    pub mode: ProcessingMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 10, // Buffer up to 10 batches per partition
            backoff: BackoffPolicy::default(),
            manual_offset_management: false,
            mode: ProcessingMode::Immediate,
        }
    }
}

#[derive(Default)]
struct RevocationState {
    revoked: bool,
    current: Option<Arc<Coordinator>>,
}

/// State shared between a runtime and the router that owns it
struct RuntimeShared {
    partition: Partition,
    pause: Arc<PauseController>,
    offset_tracker: Arc<OffsetTracker>,
    state: Mutex<RevocationState>,
}

impl RuntimeShared {
    fn state(&self) -> MutexGuard<'_, RevocationState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_revoked(&self) -> bool {
        self.state().revoked
    }

    /// Make `coordinator` the in-flight batch. A coordinator installed after revocation
    /// starts out revoked.
    fn install(&self, coordinator: &Arc<Coordinator>) {
        let mut state = self.state();
        if state.revoked {
            coordinator.revoke();
        }
        state.current = Some(coordinator.clone());
    }

    fn uninstall(&self, coordinator: &Arc<Coordinator>) {
        let mut state = self.state();
        if state
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, coordinator))
        {
            state.current = None;
        }
    }

    fn revoke(&self) {
        let current = {
            let mut state = self.state();
            state.revoked = true;
            state.current.take()
        };

        if let Some(coordinator) = current {
            coordinator.revoke();
        }
        self.pause.cancel();
        self.offset_tracker.clear_partition(&self.partition);

        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            "Partition runtime revoked"
        );
    }
}

/// Decrements its coordinator exactly once, even when the unit panics
struct UnitGuard {
    coordinator: Arc<Coordinator>,
    finished: bool,
}

impl UnitGuard {
    fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            finished: false,
        }
    }

    fn finish(mut self, result: anyhow::Result<()>) {
        if let Err(e) = result {
            self.coordinator.fail(e);
        }
        self.finished = true;
        self.coordinator.decrement();
    }
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.coordinator
                .fail(anyhow!("processing unit ended without finishing"));
            self.coordinator.decrement();
        }
    }
}

/// A long-running batch whose consume task is still running
struct InFlight {
    coordinator: Arc<Coordinator>,
    batch_id: u64,
    started: Instant,
    handle: JoinHandle<()>,
}

/// The per-partition driving loop
struct PartitionRuntime {
    partition: Partition,
    processor: Arc<dyn BatchProcessor>,
    pause: Arc<PauseController>,
    offset_tracker: Arc<OffsetTracker>,
    shared: Arc<RuntimeShared>,
    config: RuntimeConfig,
    failures: Option<FailureSender>,
    in_flight: Option<InFlight>,
}

impl PartitionRuntime {
    async fn run(mut self, mut receiver: mpsc::Receiver<PartitionBatch>) {
        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            mode = self.config.mode.as_str(),
            "Starting partition runtime"
        );

        loop {
            let long_running = self.in_flight.as_ref().map(|f| f.coordinator.clone());

            tokio::select! {
                biased;

                _ = async {
                    if let Some(coordinator) = &long_running {
                        coordinator.wait().await;
                    }
                }, if long_running.is_some() => {
                    self.complete_in_flight().await;
                }

                batch = receiver.recv() => match batch {
                    Some(batch) => self.handle_batch(batch).await,
                    None => break,
                }
            }
        }

        if self.in_flight.is_some() {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                "Waiting for long-running batch before shutdown"
            );
            self.complete_in_flight().await;
        }

        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            "Partition runtime shutting down"
        );
    }

    async fn handle_batch(&mut self, batch: PartitionBatch) {
        let message_count = batch.messages.len();

        if self.shared.is_revoked() {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                batch_id = batch.batch_id,
                message_count = message_count,
                "Skipping batch for revoked partition"
            );
            metrics::counter!(REVOKED_BATCHES_SKIPPED).increment(1);
            return;
        }

        if !self.pause.accepts(batch.seek_epoch) {
            self.discard_stale(&batch);
            return;
        }

        // a batch accepted while a long-running job is still out keeps offsets in order
        if self.in_flight.is_some() {
            self.complete_in_flight().await;
            if !self.pause.accepts(batch.seek_epoch) {
                self.discard_stale(&batch);
                return;
            }
        }

        if batch.messages.is_empty() {
            return;
        }

        let coordinator = Arc::new(Coordinator::new(self.partition.clone()));
        coordinator.start(&batch.messages);
        self.shared.install(&coordinator);
        self.pause.begin_batch();

        debug!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            message_count = message_count,
            batch_id = batch.batch_id,
            first_offset = ?coordinator.first_offset(),
            last_offset = ?coordinator.last_offset(),
            "Processing batch"
        );

        let started = Instant::now();
        match self.config.mode.clone() {
            ProcessingMode::Immediate => {
                let ctx = self.direct_context(batch.messages, &coordinator, batch.batch_id);
                coordinator.increment(1);
                let unit = UnitGuard::new(coordinator.clone());
                let result = self.processor.consume(&ctx).await;
                unit.finish(result);

                self.finish(&coordinator, batch.batch_id, started, false);
            }
            ProcessingMode::LongRunning => {
                if let Some(first) = coordinator.first_offset() {
                    self.pause.suspend(first);
                }

                let ctx = self.direct_context(batch.messages, &coordinator, batch.batch_id);
                coordinator.increment(1);
                let unit = UnitGuard::new(coordinator.clone());
                let processor = self.processor.clone();
                let handle = tokio::spawn(async move {
                    let result = processor.consume(&ctx).await;
                    unit.finish(result);
                });

                self.in_flight = Some(InFlight {
                    coordinator,
                    batch_id: batch.batch_id,
                    started,
                    handle,
                });
            }
            ProcessingMode::VirtualPartitions(partitioner) => {
                let groups = partitioner.split(batch.messages);
                metrics::histogram!(VIRTUAL_PARTITION_GROUPS).record(groups.len() as f64);

                // one unit held by the dispatcher until every group is registered
                coordinator.increment(1);
                let dispatcher = UnitGuard::new(coordinator.clone());

                let auto_mark = !self.config.manual_offset_management;
                let handles: Vec<JoinHandle<()>> = groups
                    .into_iter()
                    .map(|group| {
                        coordinator.increment(1);
                        let unit = UnitGuard::new(coordinator.clone());
                        let processor = self.processor.clone();
                        let coordinator = coordinator.clone();
                        tokio::spawn(async move {
                            let offsets: Vec<i64> = group.offsets().collect();
                            let ctx = BatchContext::virtual_partition(
                                group.messages,
                                coordinator.clone(),
                                group.index,
                            );
                            let result = processor.consume(&ctx).await;
                            if result.is_ok() && auto_mark {
                                coordinator.mark_offsets(offsets);
                            }
                            unit.finish(result);
                        })
                    })
                    .collect();

                dispatcher.finish(Ok(()));

                for result in join_all(handles).await {
                    if let Err(e) = result {
                        error!(
                            topic = self.partition.topic(),
                            partition = self.partition.partition_number(),
                            error = ?e,
                            "Virtual partition task failed"
                        );
                    }
                }
                coordinator.wait().await;

                self.finish(&coordinator, batch.batch_id, started, false);
            }
        }
    }

    fn direct_context(
        &self,
        messages: Vec<KafkaMessage>,
        coordinator: &Arc<Coordinator>,
        batch_id: u64,
    ) -> BatchContext {
        BatchContext::direct(
            messages,
            coordinator.clone(),
            self.pause.clone(),
            self.offset_tracker.clone(),
            batch_id,
        )
    }

    fn discard_stale(&self, batch: &PartitionBatch) {
        debug!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            batch_id = batch.batch_id,
            seek_epoch = batch.seek_epoch,
            current_epoch = self.pause.seek_epoch(),
            paused = self.pause.is_paused(),
            "Discarding batch fetched before the latest pause or seek"
        );
        metrics::counter!(STALE_MESSAGES_DISCARDED).increment(batch.messages.len() as u64);
    }

    async fn complete_in_flight(&mut self) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };

        in_flight.coordinator.wait().await;
        if let Err(e) = in_flight.handle.await {
            error!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                error = ?e,
                "Long-running job task failed"
            );
        }

        self.finish(
            &in_flight.coordinator,
            in_flight.batch_id,
            in_flight.started,
            true,
        );
    }

    /// Settle a batch whose units all finished
    fn finish(
        &self,
        coordinator: &Arc<Coordinator>,
        batch_id: u64,
        started: Instant,
        long_running: bool,
    ) {
        self.shared.uninstall(coordinator);
        metrics::histogram!(BATCH_PROCESSING_DURATION_MS)
            .record(started.elapsed().as_millis() as f64);

        if coordinator.is_revoked() {
            info!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                batch_id = batch_id,
                "Batch finished after revocation - offsets not committed"
            );
            metrics::counter!(COMMITS_SUPPRESSED_REVOKED).increment(1);
            return;
        }

        let failure = coordinator.failure();
        // a pause from application code keeps the batch from the pause offset on
        // uncommitted, only explicit marks count
        let auto_mark =
            !self.config.manual_offset_management && !self.pause.paused_during_batch();
        if failure.is_none() && auto_mark {
            if let Some(last) = coordinator.last_offset() {
                coordinator.mark_through(last);
            }
        }

        if let Some(next_offset) = coordinator.committable_offset() {
            self.offset_tracker
                .mark_processed(&self.partition, batch_id, next_offset);
        }

        let (Some(first_offset), Some(last_offset)) =
            (coordinator.first_offset(), coordinator.last_offset())
        else {
            return;
        };

        match failure {
            Some(error) => {
                metrics::counter!(BATCHES_FAILED, "mode" => self.config.mode.as_str())
                    .increment(1);
                error!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    batch_id = batch_id,
                    first_offset = first_offset,
                    last_offset = last_offset,
                    error = ?error,
                    "Error processing batch - pausing partition for retry"
                );

                if let Some(failures) = &self.failures {
                    let failure = ProcessingFailure {
                        partition: self.partition.clone(),
                        first_offset,
                        last_offset,
                        error,
                    };
                    if failures.send(failure).is_err() {
                        debug!("Failure receiver dropped");
                    }
                }

                let retry_from = coordinator.first_unmarked().unwrap_or(first_offset);
                self.pause.pause(retry_from, None);
            }
            None => {
                metrics::counter!(BATCHES_PROCESSED, "mode" => self.config.mode.as_str())
                    .increment(1);

                if long_running && !self.pause.paused_during_batch() {
                    self.pause.seek_if_unset(last_offset + 1);
                    self.pause.resume();
                }
                self.pause.complete_batch();

                debug!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    batch_id = batch_id,
                    committable_offset = ?coordinator.committable_offset(),
                    "Batch processed successfully"
                );
            }
        }
    }
}

/// A worker that runs the [`PartitionRuntime`] of a single partition
pub struct PartitionWorker {
    partition: Partition,
    sender: mpsc::Sender<PartitionBatch>,
    shared: Arc<RuntimeShared>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    /// Create a new partition worker
    pub fn new(
        partition: Partition,
        processor: Arc<dyn BatchProcessor>,
        client: Arc<dyn ConsumerClient>,
        offset_tracker: Arc<OffsetTracker>,
        config: &RuntimeConfig,
        failures: Option<FailureSender>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.channel_buffer_size);
        let pause = PauseController::new(partition.clone(), client, config.backoff);
        let shared = Arc::new(RuntimeShared {
            partition: partition.clone(),
            pause: pause.clone(),
            offset_tracker: offset_tracker.clone(),
            state: Mutex::new(RevocationState::default()),
        });

        let runtime = PartitionRuntime {
            partition: partition.clone(),
            processor,
            pause,
            offset_tracker,
            shared: shared.clone(),
            config: config.clone(),
            failures,
            in_flight: None,
        };
        let handle = tokio::spawn(runtime.run(receiver));

        Self {
            partition,
            sender,
            shared,
            handle: Some(handle),
        }
    }

    /// Send a batch to this worker for processing
    /// Awaits until channel has capacity. Returns error only if channel is closed (receiver dropped)
    pub async fn send(
        &self,
        batch: PartitionBatch,
    ) -> Result<(), mpsc::error::SendError<PartitionBatch>> {
        self.sender.send(batch).await
    }

    /// Get a clone of the sender for use outside of DashMap guards
    pub fn sender(&self) -> mpsc::Sender<PartitionBatch> {
        self.sender.clone()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Seek epoch batches must carry to be delivered
    pub fn seek_epoch(&self) -> u64 {
        self.shared.pause.seek_epoch()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.pause.is_paused()
    }

    pub fn state(&self) -> PartitionState {
        if self.shared.is_revoked() {
            PartitionState::Revoked
        } else {
            PartitionState::Active
        }
    }

    /// Revoke the partition: the in-flight batch becomes non-committable, later batches
    /// are skipped and any pause timer is cancelled
    pub fn revoke(&self) {
        self.shared.revoke();
    }

    /// Shutdown the worker gracefully
    pub async fn shutdown(mut self) {
        // Drop the sender to signal the worker to stop
        drop(self.sender);

        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(()) => {
                    debug!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        "Partition worker shut down gracefully"
                    );
                }
                Err(e) => {
                    warn!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        error = ?e,
                        "Partition worker panicked during shutdown"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio::time::sleep;

    use crate::kafka::test_utils::{ClientCall, RecordingClient};
    use crate::processing::backoff::PAUSE_FOREVER;
    use crate::processing::virtual_partitions::{MessageKeyPartitioner, VirtualPartitioner};

    fn partition() -> Partition {
        Partition::new("test-topic".to_string(), 0)
    }

    fn batch(offsets: std::ops::Range<i64>, batch_id: u64, seek_epoch: u64) -> PartitionBatch {
        let messages = offsets
            .map(|o| KafkaMessage::new_keyed_for_test(partition(), o, &format!("k{}", o % 2), "x"))
            .collect();
        PartitionBatch::new(partition(), messages, batch_id, seek_epoch)
    }

    struct Harness {
        worker: PartitionWorker,
        client: Arc<RecordingClient>,
        tracker: Arc<OffsetTracker>,
    }

    fn harness(processor: Arc<dyn BatchProcessor>, config: RuntimeConfig) -> Harness {
        let client = Arc::new(RecordingClient::new());
        let tracker = Arc::new(OffsetTracker::new());
        tracker.assign_partition(&partition());
        let worker = PartitionWorker::new(
            partition(),
            processor,
            client.clone(),
            tracker.clone(),
            &config,
            None,
        );
        Harness {
            worker,
            client,
            tracker,
        }
    }

    /// Records every offset it is handed
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<i64>>,
        batches: AtomicUsize,
    }

    impl Recorder {
        fn seen(&self) -> Vec<i64> {
            let mut seen = self.seen.lock().unwrap().clone();
            seen.sort_unstable();
            seen
        }
    }

    #[async_trait]
    impl BatchProcessor for Recorder {
        async fn consume(&self, ctx: &BatchContext) -> anyhow::Result<()> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .extend(ctx.messages().iter().map(|m| m.offset()));
            Ok(())
        }
    }

    /// Fails the first `failures` batches
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchProcessor for Flaky {
        async fn consume(&self, _ctx: &BatchContext) -> anyhow::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(anyhow!("boom"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_immediate_success_marks_whole_batch() {
        let recorder = Arc::new(Recorder::default());
        let h = harness(recorder.clone(), RuntimeConfig::default());

        h.worker.send(batch(0..5, 1, 0)).await.unwrap();
        h.worker.send(batch(5..8, 2, 0)).await.unwrap();
        h.worker.shutdown().await;

        assert_eq!(recorder.seen(), (0..8).collect::<Vec<_>>());
        assert_eq!(h.tracker.get_partition_offset(&partition()), Some(8));
        assert!(h.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pause_during_batch_skips_automatic_mark() {
        struct PauseMidBatch;

        #[async_trait]
        impl BatchProcessor for PauseMidBatch {
            async fn consume(&self, ctx: &BatchContext) -> anyhow::Result<()> {
                ctx.mark_as_consumed(&ctx.messages()[1]);
                ctx.pause(2, Some(PAUSE_FOREVER));
                Ok(())
            }
        }

        let h = harness(Arc::new(PauseMidBatch), RuntimeConfig::default());

        h.worker.send(batch(0..5, 1, 0)).await.unwrap();
        h.worker.shutdown().await;

        // only what was marked before the pause is committable
        assert_eq!(h.tracker.get_partition_offset(&partition()), Some(2));
        assert_eq!(h.client.calls(), vec![ClientCall::Pause(partition(), 2)]);
    }

    #[tokio::test]
    async fn test_long_running_pause_during_job_skips_automatic_mark() {
        struct PauseInJob;

        #[async_trait]
        impl BatchProcessor for PauseInJob {
            async fn consume(&self, ctx: &BatchContext) -> anyhow::Result<()> {
                ctx.pause(3, Some(PAUSE_FOREVER));
                Ok(())
            }
        }

        let config = RuntimeConfig {
            mode: ProcessingMode::LongRunning,
            ..RuntimeConfig::default()
        };
        let h = harness(Arc::new(PauseInJob), config);

        h.worker.send(batch(0..5, 1, 0)).await.unwrap();
        h.worker.shutdown().await;

        assert_eq!(h.tracker.get_partition_offset(&partition()), None);
        assert_eq!(
            h.client.calls(),
            vec![ClientCall::Pause(partition(), 0), ClientCall::Pause(partition(), 3)]
        );
    }

    #[tokio::test]
    async fn test_manual_offset_management_commits_only_marks() {
        struct MarkFirst;

        #[async_trait]
        impl BatchProcessor for MarkFirst {
            async fn consume(&self, ctx: &BatchContext) -> anyhow::Result<()> {
                ctx.mark_as_consumed(&ctx.messages()[0]);
                Ok(())
            }
        }

        let config = RuntimeConfig {
            manual_offset_management: true,
            ..RuntimeConfig::default()
        };
        let h = harness(Arc::new(MarkFirst), config);

        h.worker.send(batch(10..15, 1, 0)).await.unwrap();
        h.worker.shutdown().await;

        assert_eq!(h.tracker.get_partition_offset(&partition()), Some(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_pauses_with_backoff_and_reports() {
        let client = Arc::new(RecordingClient::new());
        let tracker = Arc::new(OffsetTracker::new());
        tracker.assign_partition(&partition());
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
        let config = RuntimeConfig {
            backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), true),
            ..RuntimeConfig::default()
        };
        let worker = PartitionWorker::new(
            partition(),
            Arc::new(Flaky {
                failures: 2,
                calls: AtomicUsize::new(0),
            }),
            client.clone(),
            tracker.clone(),
            &config,
            Some(failures_tx),
        );

        worker.send(batch(0..3, 1, 0)).await.unwrap();
        let failure = failures_rx.recv().await.unwrap();
        assert_eq!((failure.first_offset, failure.last_offset), (0, 2));
        assert_eq!(failure.error.to_string(), "boom");
        assert!(worker.is_paused());

        // backoff timer resumes at the failed offset
        sleep(Duration::from_millis(101)).await;
        assert!(!worker.is_paused());
        worker.send(batch(0..3, 2, 1)).await.unwrap();
        failures_rx.recv().await.unwrap();

        sleep(Duration::from_millis(201)).await;
        worker.send(batch(0..3, 3, 2)).await.unwrap();
        worker.shutdown().await;

        assert_eq!(
            client.calls(),
            vec![
                ClientCall::Pause(partition(), 0),
                ClientCall::Seek(partition(), 0, 1),
                ClientCall::Resume(partition()),
                ClientCall::Pause(partition(), 0),
                ClientCall::Seek(partition(), 0, 2),
                ClientCall::Resume(partition()),
            ]
        );
        assert_eq!(tracker.get_partition_offset(&partition()), Some(3));
    }

    #[tokio::test]
    async fn test_batches_from_older_seek_epoch_are_discarded() {
        struct SeekAhead {
            seen: Mutex<Vec<i64>>,
        }

        #[async_trait]
        impl BatchProcessor for SeekAhead {
            async fn consume(&self, ctx: &BatchContext) -> anyhow::Result<()> {
                let first = ctx.first_offset().unwrap_or_default();
                self.seen
                    .lock()
                    .unwrap()
                    .extend(ctx.messages().iter().map(|m| m.offset()));
                if first == 0 {
                    ctx.pause(first, Some(PAUSE_FOREVER));
                    ctx.seek(6);
                    ctx.resume();
                }
                Ok(())
            }
        }

        let processor = Arc::new(SeekAhead {
            seen: Mutex::new(Vec::new()),
        });
        let h = harness(processor.clone(), RuntimeConfig::default());

        h.worker.send(batch(0..5, 1, 0)).await.unwrap();
        // prefetched before the seek
        h.worker.send(batch(5..10, 2, 0)).await.unwrap();
        h.worker.send(batch(6..10, 3, 1)).await.unwrap();
        h.worker.shutdown().await;

        let seen = processor.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_long_running_pauses_then_resumes_after_last_offset() {
        struct Gated {
            release: Arc<Notify>,
            started: Arc<Notify>,
        }

        #[async_trait]
        impl BatchProcessor for Gated {
            async fn consume(&self, _ctx: &BatchContext) -> anyhow::Result<()> {
                self.started.notify_one();
                self.release.notified().await;
                Ok(())
            }
        }

        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let config = RuntimeConfig {
            mode: ProcessingMode::LongRunning,
            ..RuntimeConfig::default()
        };
        let h = harness(
            Arc::new(Gated {
                release: release.clone(),
                started: started.clone(),
            }),
            config,
        );

        h.worker.send(batch(0..4, 1, 0)).await.unwrap();
        started.notified().await;
        assert!(h.worker.is_paused());

        // the worker keeps draining while the job runs
        h.worker.send(batch(4..6, 2, 0)).await.unwrap();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(h.tracker.get_partition_offset(&partition()), None);

        release.notify_one();
        h.worker.shutdown().await;

        assert_eq!(
            h.client.calls(),
            vec![
                ClientCall::Pause(partition(), 0),
                ClientCall::Seek(partition(), 4, 1),
                ClientCall::Resume(partition()),
            ]
        );
        assert_eq!(h.tracker.get_partition_offset(&partition()), Some(4));
    }

    #[tokio::test]
    async fn test_revocation_during_long_running_job_suppresses_commit() {
        struct Gated {
            release: Arc<Notify>,
            started: Arc<Notify>,
        }

        #[async_trait]
        impl BatchProcessor for Gated {
            async fn consume(&self, _ctx: &BatchContext) -> anyhow::Result<()> {
                self.started.notify_one();
                self.release.notified().await;
                Ok(())
            }
        }

        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let config = RuntimeConfig {
            mode: ProcessingMode::LongRunning,
            ..RuntimeConfig::default()
        };
        let h = harness(
            Arc::new(Gated {
                release: release.clone(),
                started: started.clone(),
            }),
            config,
        );

        h.worker.send(batch(0..4, 1, 0)).await.unwrap();
        started.notified().await;

        h.worker.revoke();
        assert_eq!(h.worker.state(), PartitionState::Revoked);
        release.notify_one();
        h.worker.shutdown().await;

        assert_eq!(h.tracker.get_partition_offset(&partition()), None);
        // no resume for a partition we no longer own
        assert_eq!(h.client.calls(), vec![ClientCall::Pause(partition(), 0)]);
    }

    #[tokio::test]
    async fn test_revoked_runtime_skips_new_batches() {
        let recorder = Arc::new(Recorder::default());
        let h = harness(recorder.clone(), RuntimeConfig::default());

        h.worker.revoke();
        h.worker.send(batch(0..3, 1, 0)).await.unwrap();
        h.worker.shutdown().await;

        assert_eq!(recorder.batches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_virtual_partitions_commit_lowest_unprocessed_offset() {
        struct FailOddKey;

        #[async_trait]
        impl BatchProcessor for FailOddKey {
            async fn consume(&self, ctx: &BatchContext) -> anyhow::Result<()> {
                if ctx.messages()[0].offset() % 2 == 1 {
                    return Err(anyhow!("odd group failed"));
                }
                Ok(())
            }
        }

        let config = RuntimeConfig {
            mode: ProcessingMode::VirtualPartitions(VirtualPartitioner::new(
                Arc::new(MessageKeyPartitioner),
                None,
            )),
            ..RuntimeConfig::default()
        };
        let h = harness(Arc::new(FailOddKey), config);

        // keys alternate k0, k1 starting at offset 4: group k0 = even offsets
        h.worker.send(batch(4..10, 1, 0)).await.unwrap();
        h.worker.shutdown().await;

        // offset 4 is done, 5 is not
        assert_eq!(h.tracker.get_partition_offset(&partition()), Some(5));
        assert_eq!(h.client.calls(), vec![ClientCall::Pause(partition(), 5)]);
    }

    #[tokio::test]
    async fn test_virtual_partitions_run_groups_concurrently() {
        struct Concurrent {
            running: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl BatchProcessor for Concurrent {
            async fn consume(&self, _ctx: &BatchContext) -> anyhow::Result<()> {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let processor = Arc::new(Concurrent {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let config = RuntimeConfig {
            mode: ProcessingMode::VirtualPartitions(VirtualPartitioner::new(
                Arc::new(MessageKeyPartitioner),
                None,
            )),
            ..RuntimeConfig::default()
        };
        let h = harness(processor.clone(), config);

        h.worker.send(batch(0..6, 1, 0)).await.unwrap();
        h.worker.shutdown().await;

        assert_eq!(processor.peak.load(Ordering::SeqCst), 2);
        assert_eq!(h.tracker.get_partition_offset(&partition()), Some(6));
    }
}
