use anyhow::Result;
use async_trait::async_trait;

use crate::kafka::types::Partition;

/// Trait for handling Kafka consumer rebalance events
///
/// # Revoke Flow
///
/// ```text
/// pre_rebalance(Revoke)
///     ├─► on_pre_rebalance()           [async, spawned]
///     ├─► setup_revoked_partitions()   [SYNC] - revoke runtimes, stop commits
///     └─► revoke event sent to async worker
///
/// Async worker processes the revoke event:
///     └─► cleanup_revoked_partitions() [async] - drain and shut down workers
/// ```
///
/// # Assign Flow
///
/// ```text
/// post_rebalance(Assign)
///     ├─► setup_assigned_partitions()  [SYNC] - create partition runtimes
///     └─► on_post_rebalance()          [async, spawned]
/// ```
///
/// Setup methods run inside librdkafka callbacks and MUST be fast and non-blocking.
/// A partition that is revoked and immediately re-assigned gets a fresh runtime; the old
/// one is already revoked, so nothing it finishes later can be committed.
#[async_trait]
pub trait RebalanceHandler: Send + Sync {
    /// Called synchronously when partitions are assigned, before messages arrive
    fn setup_assigned_partitions(&self, _partitions: &[Partition]) {}

    /// Called synchronously when partitions are revoked, before revocation completes
    fn setup_revoked_partitions(&self, _partitions: &[Partition]) {}

    /// Called asynchronously after partition revocation.
    /// Use for slow cleanup: draining worker queues, waiting for in-flight jobs.
    async fn cleanup_revoked_partitions(&self, partitions: &[Partition]) -> Result<()>;

    /// Called before any rebalance operation begins
    async fn on_pre_rebalance(&self) -> Result<()> {
        Ok(())
    }

    /// Called after rebalance operation completes
    async fn on_post_rebalance(&self) -> Result<()> {
        Ok(())
    }
}
