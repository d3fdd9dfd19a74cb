use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::Stream;
use rdkafka::error::KafkaResult;

use crate::kafka::client::{ClientError, ConsumerClient};
use crate::kafka::message::KafkaMessage;
use crate::kafka::types::Partition;

/// A call made against a [`ConsumerClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    Pause(Partition, i64),
    Seek(Partition, i64, u64),
    Resume(Partition),
    /// Committed offsets, sorted by partition number
    Commit(Vec<(Partition, i64)>),
}

fn commit_call(offsets: &HashMap<Partition, i64>) -> ClientCall {
    let mut offsets: Vec<(Partition, i64)> = offsets
        .iter()
        .map(|(partition, offset)| (partition.clone(), *offset))
        .collect();
    offsets.sort_by(|a, b| {
        (a.0.topic(), a.0.partition_number()).cmp(&(b.0.topic(), b.0.partition_number()))
    });
    ClientCall::Commit(offsets)
}

/// Client that only records what it was asked to do
#[derive(Default)]
pub struct RecordingClient {
    calls: Mutex<Vec<ClientCall>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: ClientCall) -> Result<(), ClientError> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl ConsumerClient for RecordingClient {
    fn pause(&self, partition: &Partition, offset: i64) -> Result<(), ClientError> {
        self.record(ClientCall::Pause(partition.clone(), offset))
    }

    fn resume(&self, partition: &Partition) -> Result<(), ClientError> {
        self.record(ClientCall::Resume(partition.clone()))
    }

    fn seek(
        &self,
        partition: &Partition,
        offset: i64,
        seek_epoch: u64,
    ) -> Result<(), ClientError> {
        self.record(ClientCall::Seek(partition.clone(), offset, seek_epoch))
    }

    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), ClientError> {
        self.record(commit_call(offsets))
    }
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<Partition, Vec<KafkaMessage>>,
    positions: HashMap<Partition, i64>,
    epochs: HashMap<Partition, u64>,
    paused: HashSet<Partition>,
    committed: HashMap<Partition, i64>,
    calls: Vec<ClientCall>,
}

/// In-memory stand-in for a broker plus the consumer fetching from it.
///
/// Fetching honours pause, resume and seek the way the poll loop does: a paused
/// partition yields nothing, and a seek moves the fetch position and tags later
/// batches with the new seek epoch.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    /// Append a message and return its offset
    pub fn produce(&self, partition: &Partition, key: Option<&str>, payload: &str) -> i64 {
        let mut state = self.state();
        let log = state.logs.entry(partition.clone()).or_default();
        let offset = log.len() as i64;
        let message = match key {
            Some(key) => KafkaMessage::new_keyed_for_test(partition.clone(), offset, key, payload),
            None => KafkaMessage::new_for_test(partition.clone(), offset, payload),
        };
        log.push(message);
        offset
    }

    /// Fetch up to `max_messages` from the current position, with the seek epoch
    /// the batch belongs to. `None` when paused or caught up.
    pub fn fetch(
        &self,
        partition: &Partition,
        max_messages: usize,
    ) -> Option<(Vec<KafkaMessage>, u64)> {
        let mut state = self.state();
        if state.paused.contains(partition) {
            return None;
        }

        let position = state.positions.get(partition).copied().unwrap_or(0);
        let epoch = state.epochs.get(partition).copied().unwrap_or(0);
        let messages: Vec<KafkaMessage> = state
            .logs
            .get(partition)?
            .iter()
            .filter(|m| m.offset() >= position)
            .take(max_messages)
            .cloned()
            .collect();

        let last = messages.last()?.offset();
        state.positions.insert(partition.clone(), last + 1);
        Some((messages, epoch))
    }

    /// Message-by-message stream of `partition`, as a consumer's message stream yields
    /// them. Waits while the partition is paused or caught up.
    pub fn message_stream(
        self: &Arc<Self>,
        partition: Partition,
    ) -> impl Stream<Item = KafkaResult<KafkaMessage>> + Send + 'static {
        let broker = Arc::clone(self);
        futures::stream::unfold((broker, partition), |(broker, partition)| async move {
            loop {
                let next = broker
                    .fetch(&partition, 1)
                    .and_then(|(messages, _)| messages.into_iter().next());
                if let Some(message) = next {
                    return Some((Ok(message), (broker, partition)));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    pub fn is_paused(&self, partition: &Partition) -> bool {
        self.state().paused.contains(partition)
    }

    pub fn position(&self, partition: &Partition) -> i64 {
        self.state().positions.get(partition).copied().unwrap_or(0)
    }

    pub fn committed(&self, partition: &Partition) -> Option<i64> {
        self.state().committed.get(partition).copied()
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.state().calls.clone()
    }
}

impl ConsumerClient for MemoryBroker {
    fn pause(&self, partition: &Partition, offset: i64) -> Result<(), ClientError> {
        let mut state = self.state();
        state.paused.insert(partition.clone());
        state.calls.push(ClientCall::Pause(partition.clone(), offset));
        Ok(())
    }

    fn resume(&self, partition: &Partition) -> Result<(), ClientError> {
        let mut state = self.state();
        state.paused.remove(partition);
        state.calls.push(ClientCall::Resume(partition.clone()));
        Ok(())
    }

    fn seek(
        &self,
        partition: &Partition,
        offset: i64,
        seek_epoch: u64,
    ) -> Result<(), ClientError> {
        let mut state = self.state();
        state.positions.insert(partition.clone(), offset);
        state.epochs.insert(partition.clone(), seek_epoch);
        state
            .calls
            .push(ClientCall::Seek(partition.clone(), offset, seek_epoch));
        Ok(())
    }

    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), ClientError> {
        let mut state = self.state();
        for (partition, offset) in offsets {
            state.committed.insert(partition.clone(), *offset);
        }
        state.calls.push(commit_call(offsets));
        Ok(())
    }
}
