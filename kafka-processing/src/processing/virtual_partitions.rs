//! Virtual partitions - split one partition's batch into groups processed concurrently.
//!
//! Messages sharing a partition key land in the same group and keep their relative
//! offset order. Groups are ordered by the first appearance of their key in the batch.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::kafka::message::KafkaMessage;

/// Maps a message to the key of the virtual partition it belongs to.
///
/// Messages without a key share one default group.
pub trait Partitioner: Send + Sync {
    fn partition_key(&self, message: &KafkaMessage) -> Option<String>;
}

impl<F> Partitioner for F
where
    F: Fn(&KafkaMessage) -> Option<String> + Send + Sync,
{
    fn partition_key(&self, message: &KafkaMessage) -> Option<String> {
        self(message)
    }
}

/// Groups by the Kafka message key
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageKeyPartitioner;

impl Partitioner for MessageKeyPartitioner {
    fn partition_key(&self, message: &KafkaMessage) -> Option<String> {
        message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupId {
    Key(String),
    Slot(u64),
    Default,
}

/// One group of a split batch
#[derive(Debug, Clone)]
pub struct VirtualBatch {
    /// Position of the group in the split output
    pub index: usize,
    pub messages: Vec<KafkaMessage>,
}

impl VirtualBatch {
    pub fn offsets(&self) -> impl Iterator<Item = i64> + '_ {
        self.messages.iter().map(|m| m.offset())
    }
}

#[derive(Clone)]
pub struct VirtualPartitioner {
    partitioner: Arc<dyn Partitioner>,
    /// Fold keys onto at most this many groups
    max_partitions: Option<usize>,
}

impl VirtualPartitioner {
    pub fn new(partitioner: Arc<dyn Partitioner>, max_partitions: Option<usize>) -> Self {
        Self {
            partitioner,
            max_partitions: max_partitions.filter(|max| *max > 0),
        }
    }

    pub fn max_partitions(&self) -> Option<usize> {
        self.max_partitions
    }

    fn group_of(&self, message: &KafkaMessage) -> GroupId {
        let key = self.partitioner.partition_key(message);

        match (self.max_partitions, key) {
            (Some(max), Some(key)) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                GroupId::Slot(hasher.finish() % max as u64)
            }
            // keyless messages take the first slot so the bound holds
            (Some(_), None) => GroupId::Slot(0),
            (None, Some(key)) => GroupId::Key(key),
            (None, None) => GroupId::Default,
        }
    }

    /// Split a batch into disjoint, order-preserving groups
    pub fn split(&self, messages: Vec<KafkaMessage>) -> Vec<VirtualBatch> {
        let mut positions: HashMap<GroupId, usize> = HashMap::new();
        let mut groups: Vec<VirtualBatch> = Vec::new();

        for message in messages {
            let group = self.group_of(&message);
            let index = *positions.entry(group).or_insert_with(|| {
                groups.push(VirtualBatch {
                    index: groups.len(),
                    messages: Vec::new(),
                });
                groups.len() - 1
            });
            groups[index].messages.push(message);
        }

        groups
    }
}
