//! The handle application code receives with every batch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::kafka::message::KafkaMessage;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::Partition;
use crate::processing::backoff::PauseTimeout;
use crate::processing::coordinator::Coordinator;
use crate::processing::pause::PauseController;

/// Application code consuming batches of one partition
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    /// Process `ctx.messages()`. An error fails the batch; the runtime pauses the
    /// partition with backoff and redelivers from the first unmarked message.
    async fn consume(&self, ctx: &BatchContext) -> Result<()>;
}

enum Marking {
    /// Marks reach the offset tracker as soon as they are made
    Direct {
        offset_tracker: Arc<OffsetTracker>,
        batch_id: u64,
    },
    /// Marks stay in the coordinator until every unit of the batch finished
    Deferred,
}

pub struct BatchContext {
    partition: Partition,
    messages: Vec<KafkaMessage>,
    coordinator: Arc<Coordinator>,
    /// Absent for virtual partition units
    pause: Option<Arc<PauseController>>,
    marking: Marking,
    virtual_index: Option<usize>,
}

impl BatchContext {
    pub(crate) fn direct(
        messages: Vec<KafkaMessage>,
        coordinator: Arc<Coordinator>,
        pause: Arc<PauseController>,
        offset_tracker: Arc<OffsetTracker>,
        batch_id: u64,
    ) -> Self {
        Self {
            partition: coordinator.partition().clone(),
            messages,
            coordinator,
            pause: Some(pause),
            marking: Marking::Direct {
                offset_tracker,
                batch_id,
            },
            virtual_index: None,
        }
    }

    pub(crate) fn virtual_partition(
        messages: Vec<KafkaMessage>,
        coordinator: Arc<Coordinator>,
        index: usize,
    ) -> Self {
        Self {
            partition: coordinator.partition().clone(),
            messages,
            coordinator,
            pause: None,
            marking: Marking::Deferred,
            virtual_index: Some(index),
        }
    }

    pub fn messages(&self) -> &[KafkaMessage] {
        &self.messages
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.messages.first().map(|m| m.offset())
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.messages.last().map(|m| m.offset())
    }

    /// Whether the partition was taken away while this batch was being processed
    pub fn is_revoked(&self) -> bool {
        self.coordinator.is_revoked()
    }

    /// Index of the virtual partition this context covers
    pub fn virtual_index(&self) -> Option<usize> {
        self.virtual_index
    }

    fn pause_controller(&self, operation: &str) -> Option<&Arc<PauseController>> {
        if self.pause.is_none() {
            warn!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                virtual_index = ?self.virtual_index,
                operation = operation,
                "Partition flow control is not available inside a virtual partition - ignoring"
            );
        }
        self.pause.as_ref()
    }

    /// Pause the partition at `offset`. Without a timeout the backoff policy picks one;
    /// [`PAUSE_FOREVER`](crate::processing::backoff::PAUSE_FOREVER) pauses until `resume`.
    pub fn pause(&self, offset: i64, timeout: Option<Duration>) -> Option<PauseTimeout> {
        self.pause_controller("pause")
            .map(|pause| pause.pause(offset, timeout))
    }

    /// Continue from `offset` on the next resume
    pub fn seek(&self, offset: i64) {
        if let Some(pause) = self.pause_controller("seek") {
            pause.seek(offset);
        }
    }

    /// Resume a paused partition, returning where fetching continues
    pub fn resume(&self) -> Option<i64> {
        self.pause_controller("resume")?.resume()
    }

    /// Mark `message` and everything before it in this context as consumed.
    ///
    /// Returns false when the mark cannot count: the partition was revoked or the
    /// message is not part of this context.
    pub fn mark_as_consumed(&self, message: &KafkaMessage) -> bool {
        let offset = message.offset();
        if message.partition() != &self.partition
            || !self.messages.iter().any(|m| m.offset() == offset)
        {
            warn!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                offset = offset,
                "Cannot mark a message that is not part of this batch"
            );
            return false;
        }

        match &self.marking {
            Marking::Direct {
                offset_tracker,
                batch_id,
            } => {
                self.coordinator.mark_through(offset);
                if self.coordinator.is_revoked() {
                    return false;
                }
                offset_tracker.mark_processed(&self.partition, *batch_id, offset + 1)
            }
            Marking::Deferred => {
                self.coordinator.mark_offsets(
                    self.messages
                        .iter()
                        .map(|m| m.offset())
                        .take_while(|o| *o <= offset),
                );
                !self.coordinator.is_revoked()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::test_utils::{ClientCall, RecordingClient};
    use crate::processing::backoff::{BackoffPolicy, PAUSE_FOREVER};

    fn partition() -> Partition {
        Partition::new("test-topic".to_string(), 0)
    }

    fn messages(offsets: &[i64]) -> Vec<KafkaMessage> {
        offsets
            .iter()
            .map(|o| KafkaMessage::new_for_test(partition(), *o, "payload"))
            .collect()
    }

    fn coordinator(offsets: &[i64]) -> Arc<Coordinator> {
        let coordinator = Arc::new(Coordinator::new(partition()));
        coordinator.start(&messages(offsets));
        coordinator
    }

    #[test]
    fn test_direct_mark_reaches_offset_tracker() {
        let tracker = Arc::new(OffsetTracker::new());
        tracker.assign_partition(&partition());
        let client = Arc::new(RecordingClient::new());
        let pause = PauseController::new(partition(), client, BackoffPolicy::default());
        let coordinator = coordinator(&[3, 4, 5]);

        let ctx = BatchContext::direct(
            messages(&[3, 4, 5]),
            coordinator.clone(),
            pause,
            tracker.clone(),
            1,
        );
        assert!(ctx.mark_as_consumed(&ctx.messages()[1]));

        assert_eq!(tracker.get_partition_offset(&partition()), Some(5));
        assert_eq!(coordinator.committable_offset(), Some(5));
    }

    #[test]
    fn test_direct_mark_after_revocation_is_dropped() {
        let tracker = Arc::new(OffsetTracker::new());
        tracker.assign_partition(&partition());
        let client = Arc::new(RecordingClient::new());
        let pause = PauseController::new(partition(), client, BackoffPolicy::default());
        let coordinator = coordinator(&[0, 1]);

        let ctx = BatchContext::direct(
            messages(&[0, 1]),
            coordinator.clone(),
            pause,
            tracker.clone(),
            1,
        );
        coordinator.revoke();

        assert!(!ctx.mark_as_consumed(&ctx.messages()[0]));
        assert_eq!(tracker.get_partition_offset(&partition()), None);
    }

    #[test]
    fn test_deferred_mark_covers_earlier_group_messages_only() {
        let coordinator = coordinator(&[0, 1, 2, 3]);
        let ctx = BatchContext::virtual_partition(messages(&[1, 3]), coordinator.clone(), 0);

        assert!(ctx.mark_as_consumed(&ctx.messages()[1]));
        // offsets 0 and 2 belong to another group
        assert_eq!(coordinator.committable_offset(), None);
        assert_eq!(coordinator.first_unmarked(), Some(0));

        coordinator.mark_offsets([0, 2]);
        assert_eq!(coordinator.committable_offset(), Some(4));
    }

    #[test]
    fn test_mark_rejects_foreign_message() {
        let coordinator = coordinator(&[0, 1]);
        let ctx = BatchContext::virtual_partition(messages(&[0, 1]), coordinator.clone(), 0);

        let other = KafkaMessage::new_for_test(partition(), 9, "payload");
        assert!(!ctx.mark_as_consumed(&other));
        assert_eq!(coordinator.first_unmarked(), Some(0));
    }

    #[tokio::test]
    async fn test_virtual_partition_flow_control_is_noop() {
        let ctx = BatchContext::virtual_partition(messages(&[0]), coordinator(&[0]), 2);

        assert_eq!(ctx.virtual_index(), Some(2));
        assert_eq!(ctx.pause(0, Some(PAUSE_FOREVER)), None);
        ctx.seek(5);
        assert_eq!(ctx.resume(), None);
    }

    #[tokio::test]
    async fn test_direct_flow_control_reaches_client() {
        let tracker = Arc::new(OffsetTracker::new());
        let client = Arc::new(RecordingClient::new());
        let pause = PauseController::new(partition(), client.clone(), BackoffPolicy::default());
        let ctx = BatchContext::direct(messages(&[0, 1]), coordinator(&[0, 1]), pause, tracker, 1);

        assert_eq!(
            ctx.pause(0, Some(PAUSE_FOREVER)),
            Some(PauseTimeout::Forever)
        );
        ctx.seek(2);
        assert_eq!(ctx.resume(), Some(2));

        assert_eq!(
            client.calls(),
            vec![
                ClientCall::Pause(partition(), 0),
                ClientCall::Seek(partition(), 2, 1),
                ClientCall::Resume(partition()),
            ]
        );
    }
}
