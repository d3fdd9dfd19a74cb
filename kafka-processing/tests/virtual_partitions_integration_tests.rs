mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use common::{partition, Harness};
use kafka_processing::processing::backoff::BackoffPolicy;
use kafka_processing::processing::context::{BatchContext, BatchProcessor};
use kafka_processing::processing::mode::ProcessingMode;
use kafka_processing::processing::runtime::RuntimeConfig;
use kafka_processing::processing::virtual_partitions::{MessageKeyPartitioner, VirtualPartitioner};

/// Fails the first time it processes the group of `failing_key`
struct KeyedProcessor {
    failing_key: &'static str,
    failed: AtomicBool,
    processed: Mutex<Vec<i64>>,
    groups_seen: Mutex<HashSet<usize>>,
}

impl KeyedProcessor {
    fn new(failing_key: &'static str) -> Self {
        Self {
            failing_key,
            failed: AtomicBool::new(false),
            processed: Mutex::new(Vec::new()),
            groups_seen: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl BatchProcessor for KeyedProcessor {
    async fn consume(&self, ctx: &BatchContext) -> Result<()> {
        if let Some(index) = ctx.virtual_index() {
            self.groups_seen.lock().unwrap().insert(index);
        }

        let is_failing_group = ctx
            .messages()
            .iter()
            .any(|m| m.key() == Some(self.failing_key.as_bytes()));
        if is_failing_group && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("group {} failed", self.failing_key));
        }

        self.processed
            .lock()
            .unwrap()
            .extend(ctx.messages().iter().map(|m| m.offset()));
        Ok(())
    }
}

fn virtual_config() -> RuntimeConfig {
    RuntimeConfig {
        backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), true),
        mode: ProcessingMode::VirtualPartitions(VirtualPartitioner::new(
            Arc::new(MessageKeyPartitioner),
            None,
        )),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_commit_never_passes_lowest_unprocessed_offset() {
    let processor = Arc::new(KeyedProcessor::new("b"));
    let harness = Harness::new(processor.clone(), virtual_config(), 10);
    let p = partition(0);
    harness.router.add_partition(p.clone());
    harness.produce_keyed(&p, &["a", "b", "a", "a"]);

    harness
        .poll_until(&p, Duration::from_secs(5), |h| h.broker.committed(&p) == Some(4))
        .await;

    // group "b" (offset 1) failed first: only offset 0 was committable
    assert_eq!(harness.committed_offsets(&p), vec![1, 4]);

    let mut processed = processor.processed.lock().unwrap().clone();
    processed.sort_unstable();
    // the retry redelivers from the failed offset on
    assert_eq!(processed, vec![0, 1, 2, 2, 3, 3]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_groups_run_concurrently_and_commit_once() {
    let processor = Arc::new(KeyedProcessor::new("never"));
    let harness = Harness::new(processor.clone(), virtual_config(), 10);
    let p = partition(0);
    harness.router.add_partition(p.clone());
    harness.produce_keyed(&p, &["a", "b", "c", "a", "b", "c"]);

    harness
        .poll_until(&p, Duration::from_secs(5), |h| h.broker.committed(&p) == Some(6))
        .await;

    assert_eq!(harness.committed_offsets(&p), vec![6]);
    assert_eq!(processor.groups_seen.lock().unwrap().len(), 3);

    harness.shutdown().await;
}
