use rdkafka::ClientConfig;

use crate::ingest::types::StartingPoint;

/// Kafka consumer configuration builder for partition workers.
///
/// Each worker owns an assign-only consumer for a single partition. Offsets are
/// never auto-committed or auto-stored: the sink cursor decides where a worker
/// resumes, and transport commits only happen after a batch is durably written.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Create a config builder for an **assign-only partition consumer**.
    ///
    /// `group.id` is still required by rdkafka for offset commits, but the
    /// consumer never joins group coordination because partitions are assigned
    /// manually.
    pub fn for_partition_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000");

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

    /// Policy applied when an explicit resume offset is out of range
    pub fn with_offset_reset(mut self, start: StartingPoint) -> Self {
        let policy = match start {
            StartingPoint::Earliest => "earliest",
            StartingPoint::Latest | StartingPoint::Resume(_) => "latest",
        };
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Set maximum wait time when fetch.min.bytes is not satisfied
    pub fn with_fetch_wait_max_ms(mut self, ms: u32) -> Self {
        self.config.set("fetch.wait.max.ms", ms.to_string());
        self
    }

    /// Set minimum number of messages to queue for prefetching
    pub fn with_queued_min_messages(mut self, messages: u32) -> Self {
        self.config.set("queued.min.messages", messages.to_string());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
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
    fn test_partition_consumer_disables_auto_commit() {
        let config = ConsumerConfigBuilder::for_partition_consumer("localhost:9092", "enricher")
            .with_offset_reset(StartingPoint::Earliest)
            .build();

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("group.id"), Some("enricher"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_tls_and_custom_settings() {
        let config = ConsumerConfigBuilder::for_partition_consumer("broker:9093", "enricher")
            .with_tls(true)
            .with_fetch_wait_max_ms(250)
            .set("client.id", "enricher-0")
            .build();

        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("fetch.wait.max.ms"), Some("250"));
        assert_eq!(config.get("client.id"), Some("enricher-0"));
    }
}
