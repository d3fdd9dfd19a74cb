use rdkafka::ClientConfig;

/// Kafka consumer configuration builder.
///
/// Offsets are committed by the poll loop from what partition workers report, so
/// automatic offset store and automatic commit are always disabled.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Create a config builder for a group-based batch consumer.
    ///
    /// Sets: enable.auto.offset.store=false, enable.auto.commit=false, socket.timeout.ms,
    /// session.timeout.ms, heartbeat.interval.ms, max.poll.interval.ms.
    pub fn for_batch_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    /// Override offset reset policy
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Cooperative-sticky assignment; with a client id also enables static membership
    pub fn with_sticky_partition_assignment(mut self, client_id: Option<&str>) -> Self {
        self.config
            .set("partition.assignment.strategy", "cooperative-sticky");

        if let Some(found_client_id) = client_id {
            self.config.set("client.id", found_client_id);
            self.config.set("group.instance.id", found_client_id);
        }
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_consumer_disables_auto_commit_and_store() {
        let config = ConsumerConfigBuilder::for_batch_consumer("localhost:9092", "group")
            .with_offset_reset("earliest")
            .build();

        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("group.id"), Some("group"));
    }

    #[test]
    fn test_tls_and_sticky_assignment() {
        let config = ConsumerConfigBuilder::for_batch_consumer("localhost:9092", "group")
            .with_tls(true)
            .with_sticky_partition_assignment(Some("consumer-1"))
            .build();

        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(
            config.get("partition.assignment.strategy"),
            Some("cooperative-sticky")
        );
        assert_eq!(config.get("group.instance.id"), Some("consumer-1"));

        let plain = ConsumerConfigBuilder::for_batch_consumer("localhost:9092", "group")
            .with_tls(false)
            .build();
        assert_eq!(plain.get("security.protocol"), None);
    }
}
