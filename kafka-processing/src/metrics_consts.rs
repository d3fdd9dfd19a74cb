// ==== Pause / resume metrics ====
/// Counter for partition pauses, labelled by whether a resume timer was armed
pub const PARTITION_PAUSES: &str = "kafka_processing_partition_pauses_total";

/// Counter for partition resumes, labelled by trigger (explicit / timer)
pub const PARTITION_RESUMES: &str = "kafka_processing_partition_resumes_total";

/// Counter for resumes that were redirected by a staged seek
pub const PARTITION_SEEK_OVERRIDES: &str = "kafka_processing_seek_overrides_applied_total";

/// Histogram of pause timeouts chosen by the backoff policy (ms)
pub const PAUSE_TIMEOUT_MS: &str = "kafka_processing_pause_timeout_ms";

// ==== Batch metrics ====
/// Counter for batches handed to application code, labelled by processing mode
pub const BATCHES_PROCESSED: &str = "kafka_processing_batches_processed_total";

/// Counter for batches that completed with a unit error
pub const BATCHES_FAILED: &str = "kafka_processing_batches_failed_total";

/// Counter for messages discarded because they were fetched before a pause or seek
pub const STALE_MESSAGES_DISCARDED: &str = "kafka_processing_stale_messages_discarded_total";

/// Counter for batches dropped because the partition was already revoked
pub const REVOKED_BATCHES_SKIPPED: &str = "kafka_processing_revoked_batches_skipped_total";

/// Histogram for the number of virtual partitions a batch was split into
pub const VIRTUAL_PARTITION_GROUPS: &str = "kafka_processing_virtual_partition_groups";

/// Histogram for batch processing duration (ms)
pub const BATCH_PROCESSING_DURATION_MS: &str = "kafka_processing_batch_duration_ms";

// ==== Offset metrics ====
/// Counter for batch completions whose offsets were discarded due to revocation
pub const COMMITS_SUPPRESSED_REVOKED: &str = "kafka_processing_commits_suppressed_revoked_total";

/// Counter for commit attempts skipped while a rebalance was in progress
pub const COMMITS_SKIPPED_REBALANCING: &str = "kafka_processing_commits_skipped_rebalancing_total";

/// Counter for successful offset commits
pub const OFFSET_COMMITS: &str = "kafka_processing_offset_commits_total";

/// Counter for batches marked out of order
pub const OFFSET_TRACKER_OUT_OF_ORDER_BATCH: &str = "kafka_processing_out_of_order_batch_total";

// ==== Consumer metrics ====
/// Counter for messages received from Kafka
pub const MESSAGES_RECEIVED: &str = "kafka_processing_messages_received_total";

/// Histogram of time spent collecting one poll window (ms)
pub const BATCH_COLLECTION_DURATION_MS: &str = "kafka_processing_batch_collection_duration_ms";

/// Counter for Kafka errors by level and class
pub const KAFKA_ERRORS: &str = "kafka_processing_kafka_errors_total";

/// Counter for batches routed to partitions without a worker
pub const UNROUTABLE_BATCHES: &str = "kafka_processing_unroutable_batches_total";

/// Counter for batch sends that had to wait for a full partition channel
pub const PARTITION_BACKPRESSURE: &str = "kafka_processing_partition_backpressure_total";

/// Histogram of time spent waiting on a full partition channel (ms)
pub const PARTITION_BACKPRESSURE_WAIT_MS: &str = "kafka_processing_partition_backpressure_wait_ms";

// ==== Rebalance metrics ====
/// Counter for rebalance events with no partitions (cooperative-sticky no-ops)
pub const REBALANCE_EMPTY_SKIPPED: &str = "kafka_processing_rebalance_empty_skipped_total";

/// Gauge for the number of partitions with a running worker
pub const ASSIGNED_PARTITIONS: &str = "kafka_processing_assigned_partitions";
