#![doc = include_str!("../README.md")]
//!
//! # Module Structure
//!
//! - [`error`]: Domain error types (`AggregatorError`)
//! - [`config`]: Pipeline configuration (`AggregatorPipelineConfig`, builder)
//! - [`consumer`]: Broker consumption with bounded prefetch and dead-lettering
//! - [`store`]: Time-series persistence (insert, enrichment merge, reads, archival scans)
//! - [`hub`]: Subscriber registry, filtered fan-out, heartbeats
//! - [`archive`]: Periodic gzip batches to object storage
//! - [`api`]: HTTP surface (SSE stream, filtered fetch, services, health)
//! - [`aggregator`]: Main orchestrator (`AggregatorPipeline`, `Pipeline` impl)
//!
//! # Architecture
//!
//! ```text
//! broker --raw-logs--> Consumer --> Store (synced=false)
//!            |             |
//!      ai-enriched         +--> SubscriberHub --> SSE clients
//!                                     ^
//! Store <-- ArchiveScheduler --gzip--> object store (synced=true)
//! ```

pub mod aggregator;
pub mod api;
pub mod archive;
pub mod config;
pub mod consumer;
pub mod error;
pub mod hub;
pub mod store;

pub use aggregator::{AggregatorPipeline, AggregatorPipelineBuilder};
pub use config::{AggregatorPipelineConfig, AggregatorPipelineConfigBuilder};
pub use error::AggregatorError;
