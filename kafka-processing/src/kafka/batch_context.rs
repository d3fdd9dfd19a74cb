use std::sync::Arc;

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::rebalance_handler::RebalanceHandler;
use crate::kafka::types::Partition;
use crate::metrics_consts::REBALANCE_EMPTY_SKIPPED;

/// Events sent to the async rebalance worker
#[derive(Debug, Clone)]
pub enum RebalanceEvent {
    /// Partitions were revoked and their workers must be drained
    Revoke(Vec<Partition>),
}

fn partitions_of(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements().into_iter().map(Partition::from).collect()
}

pub struct BatchConsumerContext {
    rebalance_handler: Arc<dyn RebalanceHandler>,
    offset_tracker: Arc<OffsetTracker>,
    /// Handle to the async runtime for executing async callbacks from sync context
    rt_handle: Handle,
    /// Channel to send rebalance events to async worker
    rebalance_tx: mpsc::UnboundedSender<RebalanceEvent>,
}

impl BatchConsumerContext {
    /// Must be called from within a tokio runtime
    pub fn new(
        rebalance_handler: Arc<dyn RebalanceHandler>,
        offset_tracker: Arc<OffsetTracker>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let worker_handler = rebalance_handler.clone();
        Handle::current().spawn(async move {
            Self::rebalance_worker(rx, worker_handler).await;
        });

        Self {
            rebalance_handler,
            offset_tracker,
            rt_handle: Handle::current(),
            rebalance_tx: tx,
        }
    }

    /// Async worker that processes rebalance cleanup events
    async fn rebalance_worker(
        mut rx: mpsc::UnboundedReceiver<RebalanceEvent>,
        handler: Arc<dyn RebalanceHandler>,
    ) {
        info!("Starting rebalance cleanup worker");

        while let Some(event) = rx.recv().await {
            match event {
                RebalanceEvent::Revoke(partitions) => {
                    info!(
                        partition_count = partitions.len(),
                        "Rebalance worker: cleaning up revoked partitions"
                    );

                    if let Err(e) = handler.cleanup_revoked_partitions(&partitions).await {
                        error!("Partition revocation cleanup failed: {e:#}");
                    }
                }
            }
        }

        info!("Rebalance cleanup worker shutting down");
    }
}

impl ClientContext for BatchConsumerContext {}

impl ConsumerContext for BatchConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Pre-rebalance event: {:?}", rebalance);

        let handler = self.rebalance_handler.clone();
        self.rt_handle.spawn(async move {
            if let Err(e) = handler.on_pre_rebalance().await {
                error!("Pre-rebalance handler failed: {e:#}");
            }
        });

        match rebalance {
            Rebalance::Revoke(partitions) => {
                // cooperative-sticky sends these for every membership change
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "revoke")
                        .increment(1);
                    return;
                }

                info!(partition_count = partitions.count(), "Revoking partitions");

                // no commits until the assignment settles
                self.offset_tracker.set_rebalancing(true);

                // SYNC: revoke runtimes before revocation completes so nothing they
                // finish afterwards can be committed
                let partitions = partitions_of(partitions);
                self.rebalance_handler.setup_revoked_partitions(&partitions);

                if let Err(e) = self.rebalance_tx.send(RebalanceEvent::Revoke(partitions)) {
                    error!(error = ?e, "Failed to send revoke event to rebalance worker");
                }
            }
            Rebalance::Assign(partitions) => {
                info!(
                    partition_count = partitions.count(),
                    "Pre-rebalance assign event"
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {e:#}");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Post-rebalance event: {:?}", rebalance);

        match rebalance {
            Rebalance::Assign(partitions) if partitions.count() == 0 => {
                debug!("Skipping empty assign rebalance");
                metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "assign")
                    .increment(1);
            }
            Rebalance::Assign(partitions) => {
                info!(partition_count = partitions.count(), "Assigned partitions");

                // SYNC: create runtimes before messages can arrive
                self.rebalance_handler
                    .setup_assigned_partitions(&partitions_of(partitions));
            }
            Rebalance::Revoke(_) => {
                info!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {e:#}");
            }
        }

        self.offset_tracker.set_rebalancing(false);

        let handler = self.rebalance_handler.clone();
        self.rt_handle.spawn(async move {
            if let Err(e) = handler.on_post_rebalance().await {
                error!("Post-rebalance handler failed: {e:#}");
            }
        });
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(_) => {
                debug!(
                    partition_count = offsets.count(),
                    "Successfully committed offsets"
                );
            }
            Err(e) => {
                warn!(error = ?e, "Failed to commit offsets");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Offset;

    #[test]
    fn test_partitions_of_topic_partition_list() {
        let mut tpl = TopicPartitionList::new();
        assert!(partitions_of(&tpl).is_empty());

        tpl.add_partition_offset("test-topic-1", 0, Offset::Beginning)
            .unwrap();
        tpl.add_partition_offset("test-topic-2", 3, Offset::Beginning)
            .unwrap();

        assert_eq!(
            partitions_of(&tpl),
            vec![
                Partition::new("test-topic-1".to_string(), 0),
                Partition::new("test-topic-2".to_string(), 3),
            ]
        );
    }
}
