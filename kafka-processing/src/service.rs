use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{Config, ProcessingSettings};
use crate::jobs::{JobConsumer, JobExecutor, JobOptions};
use crate::kafka::batch_consumer::BatchConsumer;
use crate::kafka::client::KafkaClient;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::ConsumerConfigBuilder;
use crate::processing::context::BatchProcessor;
use crate::processing::router::PartitionRouter;
use crate::processing::runtime::FailureSender;
use crate::processing::virtual_partitions::{MessageKeyPartitioner, Partitioner};

/// Consumes one topic and hands its batches to a [`BatchProcessor`]
pub struct ProcessingService {
    config: Config,
    settings: ProcessingSettings,
    processor: Arc<dyn BatchProcessor>,
    /// Groups messages when virtual partitions are enabled
    partitioner: Arc<dyn Partitioner>,
    failures: Option<FailureSender>,
}

impl ProcessingService {
    /// Create a new service from configuration
    pub fn new(config: Config, processor: Arc<dyn BatchProcessor>) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for consumer topic '{}' and group '{}'",
                config.kafka_consumer_topic, config.kafka_consumer_group
            )
        })?;

        Ok(Self {
            settings: config.to_processing_settings(),
            config,
            processor,
            partitioner: Arc::new(MessageKeyPartitioner),
            failures: None,
        })
    }

    /// Service executing JSON jobs with the job options from `config`
    pub fn for_jobs(config: Config, executor: Arc<dyn JobExecutor>) -> Result<Self> {
        let service = Self::new(config, Arc::new(JobConsumer::new(executor)))?;
        let options = service.config.job_options().context("Invalid job options")?;
        Ok(service.with_job_options(options))
    }

    /// Service executing JSON jobs, grouped into virtual partitions by `key_fn`
    pub fn for_partitioned_jobs<F>(
        config: Config,
        executor: Arc<dyn JobExecutor>,
        key_fn: F,
    ) -> Result<Self>
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        let service = Self::new(config, Arc::new(JobConsumer::new(executor)))?;
        let options = service
            .config
            .job_options()
            .context("Invalid job options")?
            .with_partitioner(key_fn);
        Ok(service.with_job_options(options))
    }

    fn with_job_options(self, options: JobOptions) -> Self {
        info!(
            dispatch_method = options.dispatch_method.as_str(),
            partitioned = options.message_partitioner().is_some(),
            "Configuring job consumer"
        );

        match options.message_partitioner() {
            Some(partitioner) => self.with_partitioner(partitioner),
            None => self,
        }
    }

    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Report failed batches on `failures`
    pub fn with_failures(mut self, failures: FailureSender) -> Self {
        self.failures = Some(failures);
        self
    }

    pub fn settings(&self) -> &ProcessingSettings {
        &self.settings
    }

    /// Build the consumer and start the poll loop
    fn start(&self) -> Result<(JoinHandle<Result<()>>, oneshot::Sender<()>)> {
        let (client, commands) = KafkaClient::channel();
        let offset_tracker = Arc::new(OffsetTracker::new());

        let mut router = PartitionRouter::new(
            self.processor.clone(),
            Arc::new(client),
            offset_tracker,
            self.settings.runtime_config(self.partitioner.clone()),
        );
        if let Some(failures) = &self.failures {
            router = router.with_failures(failures.clone());
        }

        let consumer_config = ConsumerConfigBuilder::for_batch_consumer(
            &self.config.kafka_hosts,
            &self.config.kafka_consumer_group,
        )
        .with_tls(self.config.kafka_tls)
        .with_offset_reset(&self.config.kafka_consumer_offset_reset)
        .with_sticky_partition_assignment(self.config.kafka_client_id.as_deref())
        .build();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let consumer = BatchConsumer::new(
            &consumer_config,
            Arc::new(router),
            commands,
            shutdown_rx,
            &self.config.kafka_consumer_topic,
            self.settings.poll_settings(),
        )
        .with_context(|| {
            format!(
                "Failed to create Kafka consumer for topic '{}' with group '{}'",
                self.config.kafka_consumer_topic, self.config.kafka_consumer_group
            )
        })?;

        info!(
            topic = self.config.kafka_consumer_topic.as_str(),
            group = self.config.kafka_consumer_group.as_str(),
            mode = ?self.settings.mode(self.partitioner.clone()),
            "Initialized consumer"
        );

        let handle = tokio::spawn(async move { consumer.start_consumption().await });
        Ok((handle, shutdown_tx))
    }

    /// Run the service until ctrl+c
    pub async fn run(self) -> Result<()> {
        let (consumer_handle, shutdown_tx) = self.start()?;

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl+c signal")?;

        self.stop(consumer_handle, shutdown_tx).await;
        Ok(())
    }

    /// Run the service with a custom shutdown signal
    pub async fn run_with_shutdown(self, shutdown_signal: impl Future<Output = ()>) -> Result<()> {
        let (consumer_handle, shutdown_tx) = self.start()?;

        shutdown_signal.await;

        self.stop(consumer_handle, shutdown_tx).await;
        Ok(())
    }

    async fn stop(&self, consumer_handle: JoinHandle<Result<()>>, shutdown_tx: oneshot::Sender<()>) {
        info!("Received shutdown signal, shutting down gracefully...");

        if shutdown_tx.send(()).is_err() {
            info!("Consumer already stopped");
        }

        // Wait for consumer to finish with timeout
        let shutdown_timeout = self.config.shutdown_timeout();
        match tokio::time::timeout(shutdown_timeout, consumer_handle).await {
            Ok(Ok(Ok(_))) => info!("Consumer stopped normally"),
            Ok(Ok(Err(e))) => error!("Consumer stopped with error: {e:#}"),
            Ok(Err(e)) => error!("Consumer task panicked: {e:#}"),
            Err(_) => error!("Consumer shutdown timed out after {:?}", shutdown_timeout),
        }

        info!("Processing service stopped");
    }
}
