//! Aggregator pipeline configuration.
//!
//! [`AggregatorPipelineConfig`] derives from the core
//! [`AggregatorConfig`](opsentra_core::config::AggregatorConfig) and adds
//! fields used only inside this crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AggregatorError;

/// Aggregator pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorPipelineConfig {
    /// Broker URL (required, no default).
    pub broker_url: String,
    /// Time-series store URI.
    pub store_uri: String,
    /// Object store region.
    pub object_store_region: String,
    /// Object store access key (falls back to the default credential chain).
    pub object_store_access_key: Option<String>,
    /// Object store secret key.
    pub object_store_secret_key: Option<String>,
    /// Archive bucket prefix.
    pub bucket_prefix: String,
    /// Archive cadence in minutes.
    pub archive_interval_minutes: u64,
    /// Maximum records per archive batch.
    pub archive_batch_limit: usize,
    /// HTTP listen address.
    pub listen_address: String,
    /// Per-subscriber outbound buffer size.
    pub subscriber_buffer_size: usize,

    // --- extension fields (not present in the core config) ---
    /// Consumer prefetch window (messages in flight per queue).
    pub prefetch_count: u16,
    /// Subscriber heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
}

impl Default for AggregatorPipelineConfig {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            store_uri: "mongodb://localhost:27017".to_owned(),
            object_store_region: "us-east-1".to_owned(),
            object_store_access_key: None,
            object_store_secret_key: None,
            bucket_prefix: "opsentra".to_owned(),
            archive_interval_minutes: 10,
            archive_batch_limit: 10_000,
            listen_address: "0.0.0.0:5000".to_owned(),
            subscriber_buffer_size: 1_000,
            prefetch_count: 10,
            heartbeat_interval_secs: 30,
        }
    }
}

impl AggregatorPipelineConfig {
    /// Build the pipeline configuration from the core config section.
    ///
    /// Extension fields take their defaults.
    pub fn from_core(core: &opsentra_core::config::AggregatorConfig) -> Self {
        Self {
            broker_url: core.broker_url.clone(),
            store_uri: core.store_uri.clone(),
            object_store_region: core.object_store_region.clone(),
            object_store_access_key: core.object_store_access_key.clone(),
            object_store_secret_key: core.object_store_secret_key.clone(),
            bucket_prefix: core.bucket_prefix.clone(),
            archive_interval_minutes: core.archive_interval_minutes,
            archive_batch_limit: core.archive_batch_limit,
            listen_address: core.listen_address.clone(),
            subscriber_buffer_size: core.subscriber_buffer_size,
            ..Self::default()
        }
    }

    /// Archive cadence as a [`Duration`].
    pub fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive_interval_minutes * 60)
    }

    /// Archival scan window. Records older than `now - window` are left for
    /// a later process instance.
    pub fn archive_window(&self) -> Duration {
        self.archive_interval()
    }

    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), AggregatorError> {
        if self.broker_url.is_empty() {
            return Err(AggregatorError::Config {
                field: "broker_url".to_owned(),
                reason: "required, no default".to_owned(),
            });
        }
        if self.store_uri.is_empty() {
            return Err(AggregatorError::Config {
                field: "store_uri".to_owned(),
                reason: "required".to_owned(),
            });
        }
        if self.archive_interval_minutes == 0 {
            return Err(AggregatorError::Config {
                field: "archive_interval_minutes".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.archive_batch_limit == 0 {
            return Err(AggregatorError::Config {
                field: "archive_batch_limit".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.subscriber_buffer_size == 0 {
            return Err(AggregatorError::Config {
                field: "subscriber_buffer_size".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.prefetch_count == 0 {
            return Err(AggregatorError::Config {
                field: "prefetch_count".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(AggregatorError::Config {
                field: "heartbeat_interval_secs".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(AggregatorError::Config {
                field: "listen_address".to_owned(),
                reason: format!("'{}' is not a valid socket address", self.listen_address),
            });
        }
        Ok(())
    }
}

/// Builder for [`AggregatorPipelineConfig`].
#[derive(Default)]
pub struct AggregatorPipelineConfigBuilder {
    config: AggregatorPipelineConfig,
}

impl AggregatorPipelineConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker URL.
    pub fn broker_url(mut self, url: impl Into<String>) -> Self {
        self.config.broker_url = url.into();
        self
    }

    /// Set the store URI.
    pub fn store_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.store_uri = uri.into();
        self
    }

    /// Set the object store region.
    pub fn object_store_region(mut self, region: impl Into<String>) -> Self {
        self.config.object_store_region = region.into();
        self
    }

    /// Set the archive bucket prefix.
    pub fn bucket_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.bucket_prefix = prefix.into();
        self
    }

    /// Set the archive cadence in minutes.
    pub fn archive_interval_minutes(mut self, minutes: u64) -> Self {
        self.config.archive_interval_minutes = minutes;
        self
    }

    /// Set the archive batch limit.
    pub fn archive_batch_limit(mut self, limit: usize) -> Self {
        self.config.archive_batch_limit = limit;
        self
    }

    /// Set the HTTP listen address.
    pub fn listen_address(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_address = addr.into();
        self
    }

    /// Set the per-subscriber buffer size.
    pub fn subscriber_buffer_size(mut self, size: usize) -> Self {
        self.config.subscriber_buffer_size = size;
        self
    }

    /// Set the consumer prefetch count.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.config.prefetch_count = count;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<AggregatorPipelineConfig, AggregatorError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_requires_broker_url() {
        assert!(AggregatorPipelineConfig::default().validate().is_err());
    }

    #[test]
    fn from_core_preserves_values() {
        let core = opsentra_core::config::AggregatorConfig {
            broker_url: "amqp://broker:5672".to_owned(),
            bucket_prefix: "acme".to_owned(),
            archive_interval_minutes: 5,
            subscriber_buffer_size: 2_000,
            ..Default::default()
        };
        let config = AggregatorPipelineConfig::from_core(&core);
        assert_eq!(config.broker_url, "amqp://broker:5672");
        assert_eq!(config.bucket_prefix, "acme");
        assert_eq!(config.archive_interval_minutes, 5);
        assert_eq!(config.subscriber_buffer_size, 2_000);
        // extension fields keep their defaults
        assert_eq!(config.prefetch_count, 10);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn builder_creates_valid_config() {
        let config = AggregatorPipelineConfigBuilder::new()
            .broker_url("amqp://localhost:5672")
            .listen_address("127.0.0.1:5000")
            .archive_batch_limit(500)
            .build()
            .unwrap();
        assert_eq!(config.archive_batch_limit, 500);
    }

    #[test]
    fn builder_rejects_zero_prefetch() {
        let result = AggregatorPipelineConfigBuilder::new()
            .broker_url("amqp://localhost:5672")
            .prefetch_count(0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn archive_interval_converts_to_duration() {
        let config = AggregatorPipelineConfig {
            archive_interval_minutes: 10,
            ..Default::default()
        };
        assert_eq!(config.archive_interval(), Duration::from_secs(600));
        assert_eq!(config.archive_window(), Duration::from_secs(600));
    }

    #[test]
    fn validate_rejects_bad_listen_address() {
        let config = AggregatorPipelineConfig {
            broker_url: "amqp://localhost:5672".to_owned(),
            listen_address: "nonsense".to_owned(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
