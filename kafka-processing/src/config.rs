use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;

use crate::error::{ConfigError, Violation};
use crate::jobs::JobOptions;
use crate::kafka::batch_consumer::PollSettings;
use crate::processing::backoff::BackoffPolicy;
use crate::processing::mode::ProcessingMode;
use crate::processing::runtime::RuntimeConfig;
use crate::processing::virtual_partitions::{Partitioner, VirtualPartitioner};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "kafka-processing")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "jobs")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Enables cooperative-sticky static membership when set
    pub kafka_client_id: Option<String>,

    // Batching
    #[envconfig(default = "100")]
    pub max_messages: usize,

    #[envconfig(default = "1000")]
    pub max_wait_time_ms: u64,

    // Pausing and backoff
    #[envconfig(default = "1000")]
    pub pause_timeout_ms: u64,

    #[envconfig(default = "30000")]
    pub pause_max_timeout_ms: u64,

    #[envconfig(default = "true")]
    pub pause_with_exponential_backoff: bool,

    // Processing mode
    #[envconfig(default = "false")]
    pub manual_offset_management: bool,

    #[envconfig(default = "false")]
    pub long_running_job: bool,

    // Virtual partitions are enabled when set
    pub virtual_partitions_max: Option<usize>,

    // Jobs
    #[envconfig(default = "produce_async")]
    pub job_dispatch_method: String,

    // Runtime
    #[envconfig(default = "5000")]
    pub commit_interval_ms: u64,

    #[envconfig(default = "10")]
    pub channel_buffer_size: usize,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Get batch wait time as Duration
    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    pub fn pause_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_timeout_ms)
    }

    pub fn pause_max_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_max_timeout_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn to_processing_settings(&self) -> ProcessingSettings {
        ProcessingSettings {
            max_messages: self.max_messages,
            max_wait_time: self.max_wait_time(),
            pause_timeout: self.pause_timeout(),
            pause_max_timeout: self.pause_max_timeout(),
            pause_with_exponential_backoff: self.pause_with_exponential_backoff,
            manual_offset_management: self.manual_offset_management,
            long_running_job: self.long_running_job,
            virtual_partitions_max: self.virtual_partitions_max,
            commit_interval: self.commit_interval(),
            channel_buffer_size: self.channel_buffer_size,
        }
    }

    /// Check every setting, reporting all violations together
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = self.to_processing_settings().violations();

        if self.kafka_hosts.trim().is_empty() {
            violations.push(Violation::new("kafka_hosts", "must not be empty"));
        }
        if self.kafka_consumer_group.trim().is_empty() {
            violations.push(Violation::new("kafka_consumer_group", "must not be empty"));
        }
        if self.kafka_consumer_topic.trim().is_empty() {
            violations.push(Violation::new("kafka_consumer_topic", "must not be empty"));
        }
        if !matches!(
            self.kafka_consumer_offset_reset.as_str(),
            "earliest" | "latest" | "error"
        ) {
            violations.push(Violation::new(
                "kafka_consumer_offset_reset",
                "must be one of earliest, latest, error",
            ));
        }
        if self.shutdown_timeout_secs == 0 {
            violations.push(Violation::new("shutdown_timeout_secs", "must be positive"));
        }
        if let Err(ConfigError::Invalid(job_violations)) =
            JobOptions::parse(&self.job_dispatch_method)
        {
            violations.extend(job_violations);
        }

        ConfigError::check(violations)
    }

    pub fn job_options(&self) -> Result<JobOptions, ConfigError> {
        JobOptions::parse(&self.job_dispatch_method)
    }
}

/// Batching, backoff and processing mode settings of one consumed topic
#[derive(Debug, Clone)]
pub struct ProcessingSettings {
    pub max_messages: usize,
    pub max_wait_time: Duration,
    pub pause_timeout: Duration,
    pub pause_max_timeout: Duration,
    pub pause_with_exponential_backoff: bool,
    pub manual_offset_management: bool,
    pub long_running_job: bool,
    pub virtual_partitions_max: Option<usize>,
    pub commit_interval: Duration,
    pub channel_buffer_size: usize,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_wait_time: Duration::from_secs(1),
            pause_timeout: Duration::from_secs(1),
            pause_max_timeout: Duration::from_secs(30),
            pause_with_exponential_backoff: true,
            manual_offset_management: false,
            long_running_job: false,
            virtual_partitions_max: None,
            commit_interval: Duration::from_secs(5),
            channel_buffer_size: 10,
        }
    }
}

impl ProcessingSettings {
    fn violations(&self) -> Vec<Violation> {
        let mut violations = Vec::new();

        if self.max_messages == 0 {
            violations.push(Violation::new("max_messages", "must be at least 1"));
        }
        if self.max_wait_time.is_zero() {
            violations.push(Violation::new("max_wait_time", "must be positive"));
        }
        if self.pause_timeout.is_zero() {
            violations.push(Violation::new("pause_timeout", "must be positive"));
        }
        if self.pause_max_timeout < self.pause_timeout {
            violations.push(Violation::new(
                "pause_max_timeout",
                "must not be lower than pause_timeout",
            ));
        }
        if self.commit_interval.is_zero() {
            violations.push(Violation::new("commit_interval", "must be positive"));
        }
        if self.channel_buffer_size == 0 {
            violations.push(Violation::new("channel_buffer_size", "must be at least 1"));
        }
        if self.virtual_partitions_max == Some(0) {
            violations.push(Violation::new(
                "virtual_partitions_max",
                "must be at least 1",
            ));
        }
        if self.long_running_job && self.virtual_partitions_max.is_some() {
            violations.push(Violation::new(
                "long_running_job",
                "cannot be combined with virtual partitions",
            ));
        }

        violations
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check(self.violations())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.pause_timeout,
            self.pause_max_timeout,
            self.pause_with_exponential_backoff,
        )
    }

    /// Processing mode, grouping virtual partitions with `partitioner`
    pub fn mode(&self, partitioner: Arc<dyn Partitioner>) -> ProcessingMode {
        match self.virtual_partitions_max {
            Some(max) => {
                ProcessingMode::VirtualPartitions(VirtualPartitioner::new(partitioner, Some(max)))
            }
            None if self.long_running_job => ProcessingMode::LongRunning,
            None => ProcessingMode::Immediate,
        }
    }

    pub fn runtime_config(&self, partitioner: Arc<dyn Partitioner>) -> RuntimeConfig {
        RuntimeConfig {
            channel_buffer_size: self.channel_buffer_size,
            backoff: self.backoff(),
            manual_offset_management: self.manual_offset_management,
            mode: self.mode(partitioner),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            max_messages: self.max_messages,
            max_wait_time: self.max_wait_time,
            commit_interval: self.commit_interval,
        }
    }
}
