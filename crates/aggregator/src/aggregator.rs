//! Aggregator pipeline orchestration.
//!
//! [`AggregatorPipeline`] implements the core [`Pipeline`] trait so
//! `opsentra-daemon` manages it with the same lifecycle as the shipper.
//!
//! # Startup order (each step must succeed before the next)
//!
//! 1. Persistence store: connect, create the time-series collection if
//!    absent, ensure indexes.
//! 2. Object store client: initialize; bucket creation stays deferred.
//! 3. Broker: connect with backoff, declare exchange/queues/bindings,
//!    start consumers.
//! 4. Subscriber hub: open the HTTP endpoint, begin heartbeats.
//! 5. Archival scheduler: start the timer.
//!
//! # Shutdown order
//!
//! Stop accepting new subscribers, stop broker consumers (in-flight acks
//! drain), disconnect subscriber sinks, close the broker/store/object-store
//! clients. Archival is not forced; the next process instance picks up
//! residual unsynchronized records.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use opsentra_core::error::OpsentraError;
use opsentra_core::pipeline::{HealthStatus, Pipeline};

use crate::api::{ApiState, ApiStats, router};
use crate::archive::{ArchiveScheduler, ArchiveSettings};
use crate::config::AggregatorPipelineConfig;
use crate::consumer::{BrokerConsumer, ConsumerSettings};
use crate::error::AggregatorError;
use crate::hub::SubscriberHub;
use crate::store::LogStore;

/// Cloud metadata IP endpoint (capture identity for the bucket name).
const METADATA_URL: &str = "http://169.254.169.254/latest/meta-data/local-ipv4";
/// Metadata lookup hard deadline.
const METADATA_DEADLINE: Duration = Duration::from_secs(2);

/// Pipeline run state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AggregatorState {
    Initialized,
    Running,
    Stopped,
}

/// The aggregator pipeline.
pub struct AggregatorPipeline {
    config: AggregatorPipelineConfig,
    state: AggregatorState,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    fatal_tx: mpsc::Sender<OpsentraError>,
    hub: Arc<SubscriberHub>,
    store: Option<Arc<LogStore>>,
    broker_connected: Arc<AtomicBool>,
    accepting_subscribers: Arc<AtomicBool>,
    started_at: Instant,
}

impl AggregatorPipeline {
    /// Current state name.
    pub fn state_name(&self) -> &str {
        match self.state {
            AggregatorState::Initialized => "initialized",
            AggregatorState::Running => "running",
            AggregatorState::Stopped => "stopped",
        }
    }

    /// Number of currently connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }
}

impl Pipeline for AggregatorPipeline {
    async fn start(&mut self) -> Result<(), OpsentraError> {
        if self.state == AggregatorState::Running {
            return Err(opsentra_core::error::PipelineError::AlreadyRunning.into());
        }

        info!("starting aggregator pipeline");

        // 1. persistence store
        let store = Arc::new(
            LogStore::connect(&self.config.store_uri)
                .await
                .map_err(OpsentraError::from)?,
        );
        store.ensure_schema().await.map_err(OpsentraError::from)?;
        self.store = Some(Arc::clone(&store));
        info!("persistence store ready");

        // 2. object store client (bucket creation deferred to first archival)
        let capture_ip = capture_ip().await;
        let scheduler = Arc::new(
            ArchiveScheduler::new(
                ArchiveSettings {
                    region: self.config.object_store_region.clone(),
                    access_key: self.config.object_store_access_key.clone(),
                    secret_key: self.config.object_store_secret_key.clone(),
                    bucket_prefix: self.config.bucket_prefix.clone(),
                    interval: self.config.archive_interval(),
                    window: self.config.archive_window(),
                    batch_limit: self.config.archive_batch_limit,
                },
                Arc::clone(&store),
                &capture_ip,
            )
            .await,
        );
        let object_store_ok = scheduler.object_store_ok_handle();
        let archived = scheduler.archived_handle();

        // 3. broker: connect, declare topology, start consumers
        let consumer = BrokerConsumer::new(
            ConsumerSettings {
                broker_url: self.config.broker_url.clone(),
                prefetch_count: self.config.prefetch_count,
            },
            Arc::clone(&store),
            Arc::clone(&self.hub),
        );
        self.broker_connected = consumer.connected_handle();
        let stats = ApiStats {
            persisted: consumer.persisted_handle(),
            enriched: consumer.enriched_handle(),
            dead_lettered: consumer.dead_letter_handle(),
            archived,
        };
        let connection = consumer
            .connect_with_backoff()
            .await
            .map_err(OpsentraError::from)?;
        info!("broker topology declared");
        self.tasks.push(tokio::spawn(consumer.run(
            connection,
            self.shutdown_tx.subscribe(),
            self.fatal_tx.clone(),
        )));

        // 4. subscriber hub: HTTP endpoint + heartbeats
        self.accepting_subscribers.store(true, Ordering::Relaxed);
        let api_state = Arc::new(ApiState {
            hub: Arc::clone(&self.hub),
            store: Arc::clone(&store),
            broker_connected: Arc::clone(&self.broker_connected),
            object_store_ok,
            stats,
            started_at: self.started_at,
            accepting_subscribers: Arc::clone(&self.accepting_subscribers),
        });
        let listener = tokio::net::TcpListener::bind(&self.config.listen_address)
            .await
            .map_err(|e| {
                OpsentraError::from(AggregatorError::Api(format!(
                    "bind {} failed: {e}",
                    self.config.listen_address
                )))
            })?;
        info!(address = %self.config.listen_address, "subscriber endpoint listening");

        let mut serve_shutdown = self.shutdown_tx.subscribe();
        let app = router(api_state);
        self.tasks.push(tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = serve_shutdown.recv().await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "http server terminated");
            }
        }));

        let hub = Arc::clone(&self.hub);
        let sweep_cadence = self
            .config
            .heartbeat_interval()
            .checked_div(3)
            .unwrap_or(Duration::from_secs(10))
            .max(Duration::from_secs(1));
        let mut heartbeat_shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(sweep_cadence);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => hub.heartbeat_sweep(),
                    _ = heartbeat_shutdown.recv() => {
                        debug!("heartbeat task shutting down");
                        return;
                    }
                }
            }
        }));

        // 5. archival scheduler
        self.tasks
            .push(tokio::spawn(scheduler.run(self.shutdown_tx.subscribe())));

        self.state = AggregatorState::Running;
        info!("aggregator pipeline started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), OpsentraError> {
        if self.state != AggregatorState::Running {
            return Err(opsentra_core::error::PipelineError::NotRunning.into());
        }

        info!("stopping aggregator pipeline");

        // stop accepting new subscribers first
        self.accepting_subscribers.store(false, Ordering::Relaxed);

        // consumers drain their in-flight acks, the server closes streams
        let _ = self.shutdown_tx.send(());

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                warn!(error = %e, "aggregator task join failed");
            }
        }

        self.hub.close_all();
        // dropping the store handle returns its pooled connections
        self.store = None;

        self.state = AggregatorState::Stopped;
        info!("aggregator pipeline stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            AggregatorState::Running => {
                let store_up = match &self.store {
                    Some(store) => store.ping().await,
                    None => false,
                };
                if !store_up {
                    return HealthStatus::Unhealthy("store unreachable".to_owned());
                }
                if !self.broker_connected.load(Ordering::Relaxed) {
                    return HealthStatus::Degraded("broker disconnected".to_owned());
                }
                HealthStatus::Healthy
            }
            AggregatorState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            AggregatorState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// Resolve the capture IP for the bucket name, once per process.
///
/// A cloud-metadata lookup with a 2 s hard deadline; host name on failure.
async fn capture_ip() -> String {
    let fallback = || {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown-host".to_owned())
    };

    let attempt = async {
        let client = reqwest::Client::builder()
            .timeout(METADATA_DEADLINE)
            .build()
            .ok()?;
        let response = client.get(METADATA_URL).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = response.text().await.ok()?;
        let ip = body.trim().to_owned();
        if ip.is_empty() { None } else { Some(ip) }
    };

    match tokio::time::timeout(METADATA_DEADLINE, attempt).await {
        Ok(Some(ip)) => ip,
        _ => {
            debug!("cloud metadata lookup failed, using host name for bucket identity");
            fallback()
        }
    }
}

/// Builder for [`AggregatorPipeline`].
pub struct AggregatorPipelineBuilder {
    config: AggregatorPipelineConfig,
    fatal_channel_capacity: usize,
}

impl AggregatorPipelineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: AggregatorPipelineConfig::default(),
            fatal_channel_capacity: 4,
        }
    }

    /// Set the pipeline configuration.
    pub fn config(mut self, config: AggregatorPipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the pipeline.
    ///
    /// # Returns
    /// - `AggregatorPipeline`: the pipeline instance
    /// - `mpsc::Receiver<OpsentraError>`: fatal error channel (reconnect
    ///   exhaustion and similar conditions the daemon turns into a non-zero
    ///   exit)
    pub fn build(
        self,
    ) -> Result<(AggregatorPipeline, mpsc::Receiver<OpsentraError>), AggregatorError> {
        self.config.validate()?;

        let (shutdown_tx, _) = broadcast::channel(16);
        let (fatal_tx, fatal_rx) = mpsc::channel(self.fatal_channel_capacity);
        let hub = Arc::new(SubscriberHub::new(
            self.config.subscriber_buffer_size,
            self.config.heartbeat_interval(),
        ));

        let pipeline = AggregatorPipeline {
            config: self.config,
            state: AggregatorState::Initialized,
            shutdown_tx,
            tasks: Vec::new(),
            fatal_tx,
            hub,
            store: None,
            broker_connected: Arc::new(AtomicBool::new(false)),
            accepting_subscribers: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        };

        Ok((pipeline, fatal_rx))
    }
}

impl Default for AggregatorPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AggregatorPipelineConfig {
        AggregatorPipelineConfig {
            broker_url: "amqp://127.0.0.1:1".to_owned(),
            listen_address: "127.0.0.1:0".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn builder_creates_pipeline() {
        let (pipeline, _fatal_rx) = AggregatorPipelineBuilder::new()
            .config(test_config())
            .build()
            .unwrap();
        assert_eq!(pipeline.state_name(), "initialized");
        assert_eq!(pipeline.subscriber_count(), 0);
    }

    #[test]
    fn builder_rejects_missing_broker_url() {
        let config = AggregatorPipelineConfig {
            broker_url: String::new(),
            ..Default::default()
        };
        assert!(AggregatorPipelineBuilder::new().config(config).build().is_err());
    }

    #[tokio::test]
    async fn stop_before_start_fails() {
        let (mut pipeline, _fatal_rx) = AggregatorPipelineBuilder::new()
            .config(test_config())
            .build()
            .unwrap();
        assert!(pipeline.stop().await.is_err());
        assert!(pipeline.health_check().await.is_unhealthy());
    }
}
