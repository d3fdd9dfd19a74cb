//! The consumer-side operations the processing layer issues against Kafka.
//!
//! rdkafka's consumer is owned by the poll loop, so partition workers never touch it
//! directly: [`KafkaClient`] turns every call into a [`ConsumerCommand`] which the
//! [`BatchConsumer`](crate::kafka::batch_consumer::BatchConsumer) applies between polls.

use std::collections::HashMap;

use rdkafka::error::KafkaError;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::kafka::types::Partition;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("consumer command channel closed")]
    ChannelClosed,
    #[error("kafka consumer operation failed: {0}")]
    Kafka(#[from] KafkaError),
}

/// Operations the processing core issues against the underlying Kafka client
pub trait ConsumerClient: Send + Sync {
    /// Stop fetching for the partition. `offset` is where fetching will restart from.
    fn pause(&self, partition: &Partition, offset: i64) -> Result<(), ClientError>;

    /// Restart fetching for a paused partition
    fn resume(&self, partition: &Partition) -> Result<(), ClientError>;

    /// Move the fetch position. Batches fetched afterwards carry `seek_epoch`.
    fn seek(&self, partition: &Partition, offset: i64, seek_epoch: u64)
        -> Result<(), ClientError>;

    /// Commit the given next-offsets-to-consume
    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), ClientError>;
}

/// Commands applied by the poll loop on the consumer it owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerCommand {
    Pause {
        partition: Partition,
        offset: i64,
    },
    Resume {
        partition: Partition,
    },
    Seek {
        partition: Partition,
        offset: i64,
        seek_epoch: u64,
    },
    Commit {
        offsets: Vec<(Partition, i64)>,
    },
}

/// Sender for consumer commands - held by partition workers
pub type ConsumerCommandSender = mpsc::UnboundedSender<ConsumerCommand>;
/// Receiver for consumer commands - held by BatchConsumer
pub type ConsumerCommandReceiver = mpsc::UnboundedReceiver<ConsumerCommand>;

/// [`ConsumerClient`] backed by the poll loop's command channel
#[derive(Clone)]
pub struct KafkaClient {
    commands: ConsumerCommandSender,
}

impl KafkaClient {
    pub fn new(commands: ConsumerCommandSender) -> Self {
        Self { commands }
    }

    /// Create a client and the receiving end the poll loop drains
    pub fn channel() -> (Self, ConsumerCommandReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, command: ConsumerCommand) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::ChannelClosed)
    }
}

impl ConsumerClient for KafkaClient {
    fn pause(&self, partition: &Partition, offset: i64) -> Result<(), ClientError> {
        self.send(ConsumerCommand::Pause {
            partition: partition.clone(),
            offset,
        })
    }

    fn resume(&self, partition: &Partition) -> Result<(), ClientError> {
        self.send(ConsumerCommand::Resume {
            partition: partition.clone(),
        })
    }

    fn seek(
        &self,
        partition: &Partition,
        offset: i64,
        seek_epoch: u64,
    ) -> Result<(), ClientError> {
        self.send(ConsumerCommand::Seek {
            partition: partition.clone(),
            offset,
            seek_epoch,
        })
    }

    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), ClientError> {
        self.send(ConsumerCommand::Commit {
            offsets: offsets
                .iter()
                .map(|(partition, offset)| (partition.clone(), *offset))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kafka_client_forwards_commands_in_order() {
        let (client, mut rx) = KafkaClient::channel();
        let partition = Partition::new("test-topic".to_string(), 0);

        client.pause(&partition, 10).unwrap();
        client.seek(&partition, 12, 1).unwrap();
        client.resume(&partition).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            ConsumerCommand::Pause {
                partition: partition.clone(),
                offset: 10
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ConsumerCommand::Seek {
                partition: partition.clone(),
                offset: 12,
                seek_epoch: 1
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ConsumerCommand::Resume { partition }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_kafka_client_reports_closed_channel() {
        let (client, rx) = KafkaClient::channel();
        drop(rx);

        let partition = Partition::new("test-topic".to_string(), 0);
        assert!(matches!(
            client.resume(&partition),
            Err(ClientError::ChannelClosed)
        ));
    }
}
