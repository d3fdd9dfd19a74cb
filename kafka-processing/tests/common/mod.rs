//! Shared helpers for integration tests.
//!
//! [`Harness`] plays the poll loop against an in-memory broker: it fetches per
//! partition, tags batches with the broker's seek epoch, routes them and commits
//! what the offset tracker reports.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use kafka_processing::kafka::offset_tracker::OffsetTracker;
use kafka_processing::kafka::test_utils::{ClientCall, MemoryBroker};
use kafka_processing::kafka::types::Partition;
use kafka_processing::processing::context::BatchProcessor;
use kafka_processing::processing::router::{shutdown_workers, PartitionRouter};
use kafka_processing::processing::runtime::{PartitionBatch, RuntimeConfig};

pub const TEST_TOPIC: &str = "kprocessing-integration-test";

static TRACING: Once = Once::new();

/// Route library logs to the test output, filtered by `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

pub fn partition(num: i32) -> Partition {
    Partition::new(TEST_TOPIC.to_string(), num)
}

pub struct Harness {
    pub broker: Arc<MemoryBroker>,
    pub router: PartitionRouter,
    pub offset_tracker: Arc<OffsetTracker>,
    pub max_messages: usize,
}

impl Harness {
    pub fn new(processor: Arc<dyn BatchProcessor>, config: RuntimeConfig, max_messages: usize) -> Self {
        init_tracing();
        let broker = Arc::new(MemoryBroker::new());
        let offset_tracker = Arc::new(OffsetTracker::new());
        let router = PartitionRouter::new(processor, broker.clone(), offset_tracker.clone(), config);

        Self {
            broker,
            router,
            offset_tracker,
            max_messages,
        }
    }

    pub fn produce(&self, partition: &Partition, count: usize) {
        for i in 0..count {
            self.broker.produce(partition, None, &format!(r#"{{"n":{i}}}"#));
        }
    }

    pub fn produce_keyed(&self, partition: &Partition, keys: &[&str]) {
        for key in keys {
            self.broker
                .produce(partition, Some(key), &format!(r#"{{"key":"{key}"}}"#));
        }
    }

    /// One poll iteration: fetch, route and commit. Returns whether a batch was routed.
    pub async fn poll(&self, partition: &Partition) -> bool {
        let routed = match self.broker.fetch(partition, self.max_messages) {
            Some((messages, seek_epoch)) => {
                let batch = PartitionBatch::new(
                    partition.clone(),
                    messages,
                    self.offset_tracker.assign_batch_id(),
                    seek_epoch,
                );
                self.router.route_batch(batch).await.unwrap();
                true
            }
            None => false,
        };

        self.offset_tracker.commit_to(self.broker.as_ref()).unwrap();
        routed
    }

    /// Poll until `done` holds, failing the test after `limit`
    pub async fn poll_until<F>(&self, partition: &Partition, limit: Duration, done: F)
    where
        F: Fn(&Self) -> bool,
    {
        let polling = async {
            while !done(self) {
                self.poll(partition).await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(limit, polling)
            .await
            .expect("condition not reached in time");
    }

    pub fn committed_offsets(&self, partition: &Partition) -> Vec<i64> {
        self.broker
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                ClientCall::Commit(offsets) => offsets
                    .into_iter()
                    .find(|(p, _)| p == partition)
                    .map(|(_, offset)| offset),
                _ => None,
            })
            .collect()
    }

    pub async fn shutdown(self) {
        shutdown_workers(self.router.shutdown_all()).await;
    }
}
