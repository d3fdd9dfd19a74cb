use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::kafka::batch_context::BatchConsumerContext;
use crate::kafka::client::{ClientError, ConsumerClient, ConsumerCommand, ConsumerCommandReceiver};
use crate::kafka::message::KafkaMessage;
use crate::kafka::offset_tracker::{OffsetTracker, OffsetTrackerError};
use crate::kafka::types::Partition;
use crate::metrics_consts::{BATCH_COLLECTION_DURATION_MS, KAFKA_ERRORS, MESSAGES_RECEIVED};
use crate::processing::router::{shutdown_workers, PartitionRouter};
use crate::processing::runtime::PartitionBatch;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Batching and commit cadence of the poll loop
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Upper bound of messages collected per poll window
    pub max_messages: usize,
    /// How long to wait for a full window before handing out what arrived
    pub max_wait_time: Duration,
    pub commit_interval: Duration,
}

pub struct BatchConsumer {
    consumer: StreamConsumer<BatchConsumerContext>,

    // owns the partition workers and the offset tracker they report to
    router: Arc<PartitionRouter>,

    // pause/resume/seek/commit requests issued by partition workers
    commands: ConsumerCommandReceiver,

    settings: PollSettings,

    // shutdown signal from the parent process
    shutdown_rx: oneshot::Receiver<()>,
}

impl BatchConsumer {
    /// Create the consumer and subscribe to `topic`.
    ///
    /// Must be called from within a tokio runtime: the rebalance context spawns its
    /// cleanup worker on creation.
    pub fn new(
        config: &ClientConfig,
        router: Arc<PartitionRouter>,
        commands: ConsumerCommandReceiver,
        shutdown_rx: oneshot::Receiver<()>,
        topic: &str,
        settings: PollSettings,
    ) -> Result<Self> {
        let consumer_ctx =
            BatchConsumerContext::new(router.clone(), router.offset_tracker().clone());

        let consumer: StreamConsumer<BatchConsumerContext> = config
            .create_with_context(consumer_ctx)
            .context("Failed to create Kafka consumer")?;

        let err_msg = format!("Failed to subscribe to topic: {topic}");
        consumer.subscribe(&[topic]).context(err_msg)?;

        Ok(Self {
            consumer,
            router,
            commands,
            settings,
            shutdown_rx,
        })
    }

    /// Consume until the shutdown signal fires, then drain workers and commit once more
    pub async fn start_consumption(self) -> Result<()> {
        info!("Starting batch Kafka message consumption...");

        let Self {
            consumer,
            router,
            commands,
            settings,
            shutdown_rx,
        } = self;

        let stream = consumer
            .stream()
            .map(|result| result.map(|message| KafkaMessage::from_borrowed_message(&message)));

        run_poll_loop(&consumer, stream, router, commands, settings, shutdown_rx).await
    }
}

/// Drive partition workers from `stream` until `shutdown_rx` fires.
///
/// Each iteration applies queued worker commands on `client`, collects one window
/// and routes it per partition, tagged with the seek epoch current when the window
/// started. Offsets are committed between windows once `commit_interval` elapsed,
/// never while a window is being collected. On shutdown the workers are drained,
/// their last commands applied and the tracked offsets committed a final time.
pub async fn run_poll_loop<S>(
    client: &dyn ConsumerClient,
    stream: S,
    router: Arc<PartitionRouter>,
    mut commands: ConsumerCommandReceiver,
    settings: PollSettings,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<()>
where
    S: Stream<Item = KafkaResult<KafkaMessage>>,
{
    let offset_tracker = router.offset_tracker().clone();
    let mut stream = Box::pin(stream);
    let mut last_commit = tokio::time::Instant::now();

    loop {
        // batches collected below are tagged with the epochs these commands set
        apply_pending_commands(client, &router, &mut commands);

        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                info!("Shutdown signal received, starting graceful shutdown");
                break;
            }

            batch_result = consume_batch(&mut stream, settings.max_messages, settings.max_wait_time) => {
                let (messages, collection_duration) = batch_result?;
                metrics::histogram!(BATCH_COLLECTION_DURATION_MS)
                    .record(collection_duration.as_millis() as f64);

                if !messages.is_empty() {
                    metrics::counter!(MESSAGES_RECEIVED).increment(messages.len() as u64);
                    route_window(&router, &offset_tracker, messages).await;
                }
            }
        }

        if last_commit.elapsed() >= settings.commit_interval {
            commit_tracked_offsets(client, &offset_tracker);
            last_commit = tokio::time::Instant::now();
        }
    }
    info!("Batch consumer loop shutting down...");

    drop(stream);
    shutdown_workers(router.shutdown_all()).await;

    // workers may have finished batches while draining
    apply_pending_commands(client, &router, &mut commands);
    commit_tracked_offsets(client, &offset_tracker);
    offset_tracker.clear_all();

    info!("Graceful shutdown completed");

    Ok(())
}

async fn route_window(
    router: &PartitionRouter,
    offset_tracker: &OffsetTracker,
    messages: Vec<KafkaMessage>,
) {
    for (partition, messages) in group_by_partition(messages) {
        let batch = PartitionBatch::new(
            partition.clone(),
            messages,
            offset_tracker.assign_batch_id(),
            router.seek_epoch(&partition),
        );
        if let Err(e) = router.route_batch(batch).await {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Dropping batch: {e:#}"
            );
        }
    }
}

/// Apply every queued worker command on the consumer
fn apply_pending_commands(
    client: &dyn ConsumerClient,
    router: &PartitionRouter,
    commands: &mut ConsumerCommandReceiver,
) {
    while let Ok(command) = commands.try_recv() {
        apply_command(client, router, command);
    }
}

fn apply_command(client: &dyn ConsumerClient, router: &PartitionRouter, command: ConsumerCommand) {
    let result = match &command {
        ConsumerCommand::Pause { partition, offset } => client.pause(partition, *offset),
        ConsumerCommand::Resume { partition } => client.resume(partition),
        ConsumerCommand::Seek {
            partition,
            offset,
            seek_epoch,
        } => client.seek(partition, *offset, *seek_epoch).map(|_| {
            router.record_seek(partition, *seek_epoch);
        }),
        ConsumerCommand::Commit { offsets } => {
            let offsets: HashMap<Partition, i64> = offsets.iter().cloned().collect();
            client.commit(&offsets)
        }
    };

    if let Err(e) = result {
        error!(command = ?command, error = ?e, "Failed to apply consumer command");
    }
}

/// Commit offsets from the offset tracker to Kafka
///
/// Only offsets that partition workers reported as processed are committed, and only
/// when they moved since the last commit. Commits are skipped during rebalancing.
fn commit_tracked_offsets(consumer: &dyn ConsumerClient, offset_tracker: &OffsetTracker) {
    match offset_tracker.commit_to(consumer) {
        Ok(0) => {}
        Ok(count) => {
            info!("Committed offsets for {count} partitions");
        }
        Err(OffsetTrackerError::RebalanceInProgress) => {
            info!("Skipping offset commit during rebalancing");
        }
        Err(e) => {
            warn!(error = ?e, "Failed to commit tracked offsets");
        }
    }
}

/// Split a poll window into per-partition batches, keeping offset order and the
/// order in which partitions first appeared
fn group_by_partition(messages: Vec<KafkaMessage>) -> Vec<(Partition, Vec<KafkaMessage>)> {
    let mut groups: Vec<(Partition, Vec<KafkaMessage>)> = Vec::new();
    for message in messages {
        match groups.iter_mut().find(|(p, _)| p == message.partition()) {
            Some((_, group)) => group.push(message),
            None => groups.push((message.partition().clone(), vec![message])),
        }
    }
    groups
}

/// Collect up to `max_messages` within `max_wait_time`.
/// Returns the messages and the duration spent collecting them.
async fn consume_batch<S>(
    stream: &mut S,
    max_messages: usize,
    max_wait_time: Duration,
) -> KafkaResult<(Vec<KafkaMessage>, Duration)>
where
    S: Stream<Item = KafkaResult<KafkaMessage>> + Unpin,
{
    let start = Instant::now();
    let mut messages = Vec::with_capacity(max_messages);
    let deadline = tokio::time::sleep(max_wait_time);
    tokio::pin!(deadline);
    let mut kafka_error_count = 0;

    while messages.len() < max_messages {
        tokio::select! {
            _ = &mut deadline => {
                break;
            }

            next_msg = stream.next() => {
                match next_msg {
                    Some(Ok(message)) => {
                        messages.push(message);
                        kafka_error_count = 0;
                    }
                    Some(Err(e)) => {
                        kafka_error_count += 1;
                        if let Some(fatal) = handle_kafka_error(e, kafka_error_count).await {
                            return Err(fatal);
                        }
                    }
                    None => {
                        debug!("Kafka message stream ended");
                        break;
                    }
                }
            }
        }
    }

    Ok((messages, start.elapsed()))
}

/// Log and stat a consumer error, backing off on transient ones.
/// Returns the error when the loop cannot continue.
async fn handle_kafka_error(e: KafkaError, current_count: u64) -> Option<KafkaError> {
    match &e {
        KafkaError::MessageConsumption(code) => {
            match code {
                RDKafkaErrorCode::PartitionEOF => {
                    metrics::counter!(KAFKA_ERRORS, &[("level", "info"), ("error", "partition_eof")])
                        .increment(1);
                }
                RDKafkaErrorCode::OperationTimedOut => {
                    metrics::counter!(KAFKA_ERRORS, &[("level", "info"), ("error", "op_timed_out")])
                        .increment(1);
                }
                RDKafkaErrorCode::OffsetOutOfRange => {
                    // "auto.offset.reset" moves the position in coordination with the broker
                    warn!("Offset out of range - seeking to configured offset reset policy");
                    metrics::counter!(
                        KAFKA_ERRORS,
                        &[("level", "info"), ("error", "offset_out_of_range")]
                    )
                    .increment(1);
                    sleep(Duration::from_millis(500)).await;
                }
                _ => {
                    warn!("Kafka consumer error: {code:?}");
                    metrics::counter!(KAFKA_ERRORS, &[("level", "warn"), ("error", "consumer")])
                        .increment(1);
                    sleep(Duration::from_millis(100 * current_count.min(10))).await;
                }
            }

            None
        }

        KafkaError::MessageConsumptionFatal(code) => {
            error!("Fatal Kafka consumer error: {code:?}");
            metrics::counter!(KAFKA_ERRORS, &[("level", "fatal"), ("error", "consumer")])
                .increment(1);

            Some(e)
        }

        KafkaError::Global(code) => {
            match code {
                RDKafkaErrorCode::AllBrokersDown => {
                    warn!("All brokers down: {code:?} - waiting for reconnect");
                    metrics::counter!(
                        KAFKA_ERRORS,
                        &[("level", "warn"), ("error", "all_brokers_down")]
                    )
                    .increment(1);
                    sleep(Duration::from_secs(current_count.min(5))).await;
                }
                RDKafkaErrorCode::BrokerTransportFailure => {
                    warn!("Broker transport failure: {code:?} - waiting for reconnect");
                    metrics::counter!(
                        KAFKA_ERRORS,
                        &[("level", "warn"), ("error", "broker_transport")]
                    )
                    .increment(1);
                    sleep(Duration::from_secs(current_count.min(3))).await;
                }
                RDKafkaErrorCode::Authentication => {
                    error!("Authentication failed: {code:?}");
                    metrics::counter!(
                        KAFKA_ERRORS,
                        &[("level", "fatal"), ("error", "authentication")]
                    )
                    .increment(1);
                    return Some(e);
                }
                _ => {
                    warn!("Global Kafka error: {code:?}");
                    metrics::counter!(KAFKA_ERRORS, &[("level", "warn"), ("error", "global")])
                        .increment(1);
                    sleep(Duration::from_millis(500 * current_count.min(6))).await;
                }
            }

            None
        }

        KafkaError::Canceled => {
            info!("Consumer canceled - shutting down");
            metrics::counter!(KAFKA_ERRORS, &[("level", "info"), ("error", "canceled")])
                .increment(1);

            Some(e)
        }

        _ => {
            error!(error = ?e, "Unexpected Kafka error");
            metrics::counter!(KAFKA_ERRORS, &[("level", "fatal"), ("error", "unexpected")])
                .increment(1);
            sleep(Duration::from_millis(100 * current_count.min(10))).await;

            None
        }
    }
}

fn partition_list(partition: &Partition, offset: Offset) -> Result<TopicPartitionList, ClientError> {
    let mut list = TopicPartitionList::new();
    list.add_partition_offset(partition.topic(), partition.partition_number(), offset)?;
    Ok(list)
}

/// The poll loop applies worker commands straight on the consumer it owns
impl ConsumerClient for StreamConsumer<BatchConsumerContext> {
    fn pause(&self, partition: &Partition, _offset: i64) -> Result<(), ClientError> {
        let list = partition_list(partition, Offset::Invalid)?;
        Consumer::pause(self, &list)?;
        Ok(())
    }

    fn resume(&self, partition: &Partition) -> Result<(), ClientError> {
        let list = partition_list(partition, Offset::Invalid)?;
        Consumer::resume(self, &list)?;
        Ok(())
    }

    fn seek(
        &self,
        partition: &Partition,
        offset: i64,
        _seek_epoch: u64,
    ) -> Result<(), ClientError> {
        Consumer::seek(
            self,
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(offset),
            SEEK_TIMEOUT,
        )?;
        Ok(())
    }

    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), ClientError> {
        let mut list = TopicPartitionList::new();
        for (partition, next_offset) in offsets {
            list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*next_offset),
            )?;
        }

        // synchronous so the tracker only records offsets the broker accepted
        Consumer::commit(self, &list, CommitMode::Sync)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::kafka::test_utils::{ClientCall, RecordingClient};
    use crate::processing::context::{BatchContext, BatchProcessor};
    use crate::processing::runtime::RuntimeConfig;

    struct NoopProcessor;

    #[async_trait]
    impl BatchProcessor for NoopProcessor {
        async fn consume(&self, _ctx: &BatchContext) -> Result<()> {
            Ok(())
        }
    }

    fn partition(num: i32) -> Partition {
        Partition::new("test-topic".to_string(), num)
    }

    fn router(client: Arc<RecordingClient>) -> PartitionRouter {
        PartitionRouter::new(
            Arc::new(NoopProcessor),
            client,
            Arc::new(OffsetTracker::new()),
            RuntimeConfig::default(),
        )
    }

    #[test]
    fn test_group_by_partition_keeps_order() {
        let messages = vec![
            KafkaMessage::new_for_test(partition(1), 10, "a"),
            KafkaMessage::new_for_test(partition(0), 3, "b"),
            KafkaMessage::new_for_test(partition(1), 11, "c"),
            KafkaMessage::new_for_test(partition(0), 4, "d"),
        ];

        let groups = group_by_partition(messages);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, partition(1));
        assert_eq!(
            groups[0].1.iter().map(|m| m.offset()).collect::<Vec<_>>(),
            vec![10, 11]
        );
        assert_eq!(groups[1].0, partition(0));
        assert_eq!(
            groups[1].1.iter().map(|m| m.offset()).collect::<Vec<_>>(),
            vec![3, 4]
        );
    }

    #[tokio::test]
    async fn test_applied_seek_advances_router_epoch() {
        let client = Arc::new(RecordingClient::new());
        let router = router(client.clone());
        router.add_partition(partition(0));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(ConsumerCommand::Pause {
            partition: partition(0),
            offset: 4,
        })
        .unwrap();
        tx.send(ConsumerCommand::Seek {
            partition: partition(0),
            offset: 7,
            seek_epoch: 1,
        })
        .unwrap();
        tx.send(ConsumerCommand::Resume {
            partition: partition(0),
        })
        .unwrap();

        apply_pending_commands(client.as_ref(), &router, &mut rx);

        assert_eq!(router.seek_epoch(&partition(0)), 1);
        assert_eq!(
            client.calls(),
            vec![
                ClientCall::Pause(partition(0), 4),
                ClientCall::Seek(partition(0), 7, 1),
                ClientCall::Resume(partition(0)),
            ]
        );

        shutdown_workers(router.shutdown_all()).await;
    }

    #[tokio::test]
    async fn test_seek_for_unassigned_partition_keeps_epoch_at_zero() {
        let client = Arc::new(RecordingClient::new());
        let router = router(client.clone());

        apply_command(
            client.as_ref(),
            &router,
            ConsumerCommand::Seek {
                partition: partition(3),
                offset: 7,
                seek_epoch: 2,
            },
        );

        assert_eq!(router.seek_epoch(&partition(3)), 0);
    }

    #[test]
    fn test_commit_skipped_while_rebalancing() {
        let client = RecordingClient::new();
        let tracker = OffsetTracker::new();
        tracker.assign_partition(&partition(0));
        let batch_id = tracker.assign_batch_id();
        tracker.mark_processed(&partition(0), batch_id, 5);

        tracker.set_rebalancing(true);
        assert!(tracker.is_rebalancing());
        commit_tracked_offsets(&client, &tracker);
        assert!(client.calls().is_empty());

        tracker.set_rebalancing(false);
        commit_tracked_offsets(&client, &tracker);
        commit_tracked_offsets(&client, &tracker);
        assert_eq!(
            client.calls(),
            vec![ClientCall::Commit(vec![(partition(0), 5)])]
        );
    }
}
