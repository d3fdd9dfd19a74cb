// Kafka module - consumer client, poll loop and rebalance handling
pub mod batch_consumer;
pub mod batch_context;
pub mod client;
pub mod config;
pub mod message;
pub mod offset_tracker;
pub mod rebalance_handler;
pub mod types;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

// Public API
pub use client::{ConsumerClient, KafkaClient};
pub use config::ConsumerConfigBuilder;
pub use message::KafkaMessage;
pub use rebalance_handler::RebalanceHandler;
pub use types::Partition;
