//! Background jobs carried as JSON messages.
//!
//! Each message payload is one job. [`JobConsumer`] decodes and executes jobs in offset
//! order through a [`JobExecutor`]; the processing mode of the topic decides whether that
//! happens inline, as a long-running job or spread over virtual partitions.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ConfigError, Violation};
use crate::kafka::message::KafkaMessage;
use crate::processing::context::{BatchContext, BatchProcessor};
use crate::processing::virtual_partitions::Partitioner;

/// How producers hand jobs to Kafka
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMethod {
    /// Enqueue without waiting for the broker acknowledgement
    #[default]
    ProduceAsync,
    /// Wait for the broker acknowledgement
    ProduceSync,
}

impl DispatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMethod::ProduceAsync => "produce_async",
            DispatchMethod::ProduceSync => "produce_sync",
        }
    }
}

impl fmt::Display for DispatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMethod {
    type Err = Violation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "produce_async" => Ok(DispatchMethod::ProduceAsync),
            "produce_sync" => Ok(DispatchMethod::ProduceSync),
            other => Err(Violation::new(
                "dispatch_method",
                format!("must be one of produce_async, produce_sync (got {other:?})"),
            )),
        }
    }
}

/// Maps a decoded job to the virtual partition it should run in
pub type JobKeyFn = dyn Fn(&Value) -> Option<String> + Send + Sync;

/// Per-topic job settings
#[derive(Clone, Default)]
pub struct JobOptions {
    pub dispatch_method: DispatchMethod,
    partitioner: Option<Arc<JobKeyFn>>,
}

impl JobOptions {
    /// Parse job settings, reporting every invalid one
    pub fn parse(dispatch_method: &str) -> Result<Self, ConfigError> {
        let mut violations = Vec::new();

        let dispatch_method = dispatch_method.parse().unwrap_or_else(|violation| {
            violations.push(violation);
            DispatchMethod::default()
        });

        ConfigError::check(violations)?;
        Ok(Self {
            dispatch_method,
            partitioner: None,
        })
    }

    /// Route jobs to virtual partitions by a key derived from the job itself
    pub fn with_partitioner<F>(mut self, partitioner: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.partitioner = Some(Arc::new(partitioner));
        self
    }

    /// Message partitioner for virtual partitions, when a job partitioner is set
    pub fn message_partitioner(&self) -> Option<Arc<dyn Partitioner>> {
        self.partitioner
            .clone()
            .map(|key_fn| -> Arc<dyn Partitioner> { Arc::new(JobPartitioner { key_fn }) })
    }
}

impl fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOptions")
            .field("dispatch_method", &self.dispatch_method)
            .field("partitioner", &self.partitioner.is_some())
            .finish()
    }
}

/// Decodes the job payload and keys it; undecodable jobs share the default group
struct JobPartitioner {
    key_fn: Arc<JobKeyFn>,
}

impl Partitioner for JobPartitioner {
    fn partition_key(&self, message: &KafkaMessage) -> Option<String> {
        let job: Value = message.payload_json().ok()?;
        (self.key_fn)(&job)
    }
}

/// Runs decoded jobs
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: Value) -> Result<()>;
}

/// Batch processor executing one JSON job per message
pub struct JobConsumer {
    executor: Arc<dyn JobExecutor>,
}

impl JobConsumer {
    pub fn new(executor: Arc<dyn JobExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl BatchProcessor for JobConsumer {
    async fn consume(&self, ctx: &BatchContext) -> Result<()> {
        for message in ctx.messages() {
            // a revoked partition is being processed elsewhere already
            if ctx.is_revoked() {
                info!(
                    topic = ctx.partition().topic(),
                    partition = ctx.partition().partition_number(),
                    offset = message.offset(),
                    "Partition revoked, not running remaining jobs"
                );
                break;
            }

            let job: Value = message
                .payload_json()
                .with_context(|| format!("Failed to decode job at offset {}", message.offset()))?;

            self.executor
                .execute(job)
                .await
                .with_context(|| format!("Job at offset {} failed", message.offset()))?;

            // inside a virtual partition the batch is marked once every group finished
            if ctx.virtual_index().is_none() {
                ctx.mark_as_consumed(message);
            }

            debug!(
                topic = ctx.partition().topic(),
                partition = ctx.partition().partition_number(),
                offset = message.offset(),
                "Job executed"
            );
        }

        Ok(())
    }
}
