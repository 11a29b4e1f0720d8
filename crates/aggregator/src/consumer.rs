//! Broker consumer: bounded-prefetch consumption of both durable queues.
//!
//! Two bindings on the topic exchange:
//! - `raw-logs` bound to `logs.#` receives every record,
//! - `ai-enriched` bound to `ai.#` receives post-analysis updates.
//!
//! Each queue is consumed on its own channel with a bounded prefetch window.
//! A message is acknowledged only after its dispatch (persist + fan-out)
//! succeeds; handler failures negatively acknowledge with requeue, and a
//! message that keeps failing is dead-lettered (logged and dropped) once the
//! broker-exposed delivery count reaches the poison threshold.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use opsentra_core::error::OpsentraError;
use opsentra_core::types::{EnrichmentUpdate, LogRecord};
use opsentra_core::{ENRICHED_BINDING, ENRICHED_QUEUE, LOGS_EXCHANGE, RAW_LOGS_BINDING, RAW_LOGS_QUEUE};

use crate::error::AggregatorError;
use crate::hub::SubscriberHub;
use crate::store::LogStore;

/// Base reconnect delay.
const RECONNECT_BASE: Duration = Duration::from_secs(5);
/// Reconnect delay cap.
const RECONNECT_CAP: Duration = Duration::from_secs(30);
/// Reconnect delay growth factor.
const RECONNECT_FACTOR: f64 = 1.5;
/// Consecutive connect attempts before giving up.
const MAX_CONNECT_ATTEMPTS: u32 = 10;
/// Single connect attempt deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Deliveries of the same message before it is dead-lettered.
const POISON_THRESHOLD: i64 = 3;

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Broker URL.
    pub broker_url: String,
    /// Prefetch window per queue (messages in flight).
    pub prefetch_count: u16,
}

/// The aggregator-side broker consumer.
pub struct BrokerConsumer {
    settings: ConsumerSettings,
    store: Arc<LogStore>,
    hub: Arc<SubscriberHub>,
    connected: Arc<AtomicBool>,
    persisted_count: Arc<AtomicU64>,
    enriched_count: Arc<AtomicU64>,
    dead_letter_count: Arc<AtomicU64>,
}

impl BrokerConsumer {
    /// Create a new consumer.
    pub fn new(settings: ConsumerSettings, store: Arc<LogStore>, hub: Arc<SubscriberHub>) -> Self {
        Self {
            settings,
            store,
            hub,
            connected: Arc::new(AtomicBool::new(false)),
            persisted_count: Arc::new(AtomicU64::new(0)),
            enriched_count: Arc::new(AtomicU64::new(0)),
            dead_letter_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared broker-connectivity flag for health reporting.
    pub fn connected_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected)
    }

    /// Records persisted counter handle.
    pub fn persisted_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.persisted_count)
    }

    /// Enrichment updates applied counter handle.
    pub fn enriched_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.enriched_count)
    }

    /// Dead-lettered messages counter handle.
    pub fn dead_letter_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dead_letter_count)
    }

    /// Connect with exponential backoff and declare the topology.
    ///
    /// Used at startup so the lifecycle supervisor can fail the process when
    /// the broker never becomes reachable.
    pub async fn connect_with_backoff(&self) -> Result<Connection, AggregatorError> {
        let mut backoff = RECONNECT_BASE;
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match self.connect_once().await {
                Ok(connection) => return Ok(connection),
                Err(e) if attempt == MAX_CONNECT_ATTEMPTS => {
                    error!(attempts = attempt, error = %e, "broker connect attempts exhausted");
                    return Err(AggregatorError::ReconnectExhausted { attempts: attempt });
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        backoff_secs = backoff.as_secs_f64(),
                        error = %e,
                        "broker connect failed, backing off"
                    );
                    sleep(backoff).await;
                    backoff = backoff.mul_f64(RECONNECT_FACTOR).min(RECONNECT_CAP);
                }
            }
        }
        unreachable!("loop returns on success or final attempt")
    }

    /// One connect attempt, including topology declaration.
    async fn connect_once(&self) -> Result<Connection, AggregatorError> {
        let connection = match timeout(
            CONNECT_TIMEOUT,
            Connection::connect(&self.settings.broker_url, ConnectionProperties::default()),
        )
        .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(AggregatorError::Connect(e.to_string())),
            Err(_) => return Err(AggregatorError::Connect("connect attempt timed out".to_owned())),
        };

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| AggregatorError::Connect(e.to_string()))?;
        declare_topology(&channel).await?;
        // the topology channel is not reused; each queue consumer opens its own
        let _ = channel.close(0, "topology declared").await;

        Ok(connection)
    }

    /// Consume both queues until shutdown.
    ///
    /// `initial` carries the connection established at startup. On mid-run
    /// connection failure, reconnects with backoff; exhaustion reports a
    /// fatal error and stops.
    pub async fn run(
        self,
        initial: Connection,
        mut shutdown: broadcast::Receiver<()>,
        fatal_tx: mpsc::Sender<OpsentraError>,
    ) {
        let mut connection = initial;

        loop {
            self.connected.store(true, Ordering::Relaxed);
            let session = self.consume_session(&connection, &mut shutdown).await;
            self.connected.store(false, Ordering::Relaxed);

            match session {
                Ok(()) => {
                    let _ = connection.close(0, "aggregator shutdown").await;
                    info!("consumer stopped");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "consume session failed, reconnecting");
                    let _ = connection.close(0, "consumer reconnect").await;
                }
            }

            let mut backoff = RECONNECT_BASE;
            let mut attempts = 0u32;
            connection = loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("consumer stopping while disconnected");
                        return;
                    }
                    result = self.connect_once() => match result {
                        Ok(connection) => break connection,
                        Err(e) => {
                            attempts += 1;
                            if attempts >= MAX_CONNECT_ATTEMPTS {
                                error!(attempts = attempts, error = %e, "reconnect attempts exhausted");
                                let _ = fatal_tx
                                    .send(AggregatorError::ReconnectExhausted { attempts }.into())
                                    .await;
                                return;
                            }
                            warn!(
                                attempt = attempts,
                                backoff_secs = backoff.as_secs_f64(),
                                error = %e,
                                "reconnect failed, backing off"
                            );
                            sleep(backoff).await;
                            backoff = backoff.mul_f64(RECONNECT_FACTOR).min(RECONNECT_CAP);
                        }
                    }
                }
            };
        }
    }

    /// One consuming session over an established connection.
    ///
    /// Returns `Ok(())` on shutdown, `Err` on channel/connection failure.
    async fn consume_session(
        &self,
        connection: &Connection,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), AggregatorError> {
        // one channel per queue; channels are not shared across consumers
        let raw_channel = self.open_channel(connection).await?;
        let enriched_channel = self.open_channel(connection).await?;

        info!(
            prefetch = self.settings.prefetch_count,
            "consumers attached to raw and enriched queues"
        );

        tokio::select! {
            result = self.consume_raw(&raw_channel) => result,
            result = self.consume_enriched(&enriched_channel) => result,
            _ = shutdown.recv() => {
                debug!("shutdown requested, draining in-flight acks");
                Ok(())
            }
        }
    }

    async fn open_channel(&self, connection: &Connection) -> Result<Channel, AggregatorError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| AggregatorError::Connect(e.to_string()))?;
        channel
            .basic_qos(self.settings.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| AggregatorError::Connect(e.to_string()))?;
        Ok(channel)
    }

    /// Consume the raw-logs queue: persist, fan out, then ack.
    async fn consume_raw(&self, channel: &Channel) -> Result<(), AggregatorError> {
        let mut consumer = channel
            .basic_consume(
                RAW_LOGS_QUEUE,
                "opsentra-aggregator-raw",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| AggregatorError::Consume {
                queue: RAW_LOGS_QUEUE.to_owned(),
                reason: e.to_string(),
            })?;

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery.map_err(|e| AggregatorError::Consume {
                queue: RAW_LOGS_QUEUE.to_owned(),
                reason: e.to_string(),
            })?;
            self.handle_raw(delivery).await;
        }

        Err(AggregatorError::Consume {
            queue: RAW_LOGS_QUEUE.to_owned(),
            reason: "consumer stream ended".to_owned(),
        })
    }

    /// Consume the enriched queue: merge onto the stored record, notify.
    async fn consume_enriched(&self, channel: &Channel) -> Result<(), AggregatorError> {
        let mut consumer = channel
            .basic_consume(
                ENRICHED_QUEUE,
                "opsentra-aggregator-enriched",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| AggregatorError::Consume {
                queue: ENRICHED_QUEUE.to_owned(),
                reason: e.to_string(),
            })?;

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery.map_err(|e| AggregatorError::Consume {
                queue: ENRICHED_QUEUE.to_owned(),
                reason: e.to_string(),
            })?;
            self.handle_enriched(delivery).await;
        }

        Err(AggregatorError::Consume {
            queue: ENRICHED_QUEUE.to_owned(),
            reason: "consumer stream ended".to_owned(),
        })
    }

    /// Dispatch one raw-logs delivery.
    ///
    /// Ack only after persistence succeeds; an undecodable payload is logged
    /// and dropped; a persistently failing message is dead-lettered.
    async fn handle_raw(&self, delivery: Delivery) {
        let record: LogRecord = match serde_json::from_slice(&delivery.data) {
            Ok(record) => record,
            Err(e) => {
                warn!(queue = RAW_LOGS_QUEUE, error = %e, "undecodable record, dropping");
                self.dead_letter_count.fetch_add(1, Ordering::Relaxed);
                ack(&delivery).await;
                return;
            }
        };

        match self.store.insert_record(&record).await {
            Ok(id) => {
                self.persisted_count.fetch_add(1, Ordering::Relaxed);
                self.hub.publish_record(&id, &record);
                ack(&delivery).await;
            }
            Err(e) => {
                if delivery_count(&delivery) >= POISON_THRESHOLD {
                    error!(
                        queue = RAW_LOGS_QUEUE,
                        service = %record.service,
                        error = %e,
                        "poisoned record, dead-lettering"
                    );
                    self.dead_letter_count.fetch_add(1, Ordering::Relaxed);
                    ack(&delivery).await;
                } else {
                    warn!(queue = RAW_LOGS_QUEUE, error = %e, "persist failed, requeueing");
                    nack_requeue(&delivery).await;
                }
            }
        }
    }

    /// Dispatch one enriched delivery.
    async fn handle_enriched(&self, delivery: Delivery) {
        let update: EnrichmentUpdate = match serde_json::from_slice(&delivery.data) {
            Ok(update) => update,
            Err(e) => {
                warn!(queue = ENRICHED_QUEUE, error = %e, "undecodable enrichment, dropping");
                self.dead_letter_count.fetch_add(1, Ordering::Relaxed);
                ack(&delivery).await;
                return;
            }
        };

        match self.store.apply_enrichment(&update).await {
            Ok(matched) => {
                if matched {
                    self.enriched_count.fetch_add(1, Ordering::Relaxed);
                    self.hub.publish_enrichment(&update);
                } else {
                    debug!(log_id = %update.log_id, "enrichment target not found, dropping");
                }
                ack(&delivery).await;
            }
            Err(e) => {
                if delivery_count(&delivery) >= POISON_THRESHOLD {
                    error!(
                        queue = ENRICHED_QUEUE,
                        log_id = %update.log_id,
                        error = %e,
                        "poisoned enrichment, dead-lettering"
                    );
                    self.dead_letter_count.fetch_add(1, Ordering::Relaxed);
                    ack(&delivery).await;
                } else {
                    warn!(queue = ENRICHED_QUEUE, error = %e, "enrichment failed, requeueing");
                    nack_requeue(&delivery).await;
                }
            }
        }
    }
}

/// Declare exchange, queues, and bindings (idempotent on the broker side).
pub async fn declare_topology(channel: &Channel) -> Result<(), AggregatorError> {
    let topology = |e: lapin::Error| AggregatorError::Connect(format!("topology: {e}"));

    channel
        .exchange_declare(
            LOGS_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(topology)?;

    for (queue, binding) in [
        (RAW_LOGS_QUEUE, RAW_LOGS_BINDING),
        (ENRICHED_QUEUE, ENRICHED_BINDING),
    ] {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(topology)?;
        channel
            .queue_bind(
                queue,
                LOGS_EXCHANGE,
                binding,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(topology)?;
    }

    Ok(())
}

/// Read the broker-exposed delivery count for poison detection.
///
/// Quorum queues expose `x-delivery-count`; when absent, the redelivered
/// flag counts as a single prior attempt.
fn delivery_count(delivery: &Delivery) -> i64 {
    let from_header = delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|table| {
            table
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == "x-delivery-count")
                .map(|(_, value)| value)
        })
        .and_then(|value| match value {
            AMQPValue::LongLongInt(n) => Some(*n),
            AMQPValue::LongInt(n) => Some(i64::from(*n)),
            AMQPValue::ShortInt(n) => Some(i64::from(*n)),
            AMQPValue::LongUInt(n) => Some(i64::from(*n)),
            _ => None,
        });

    match from_header {
        Some(count) => count,
        None if delivery.redelivered => 1,
        None => 0,
    }
}

async fn ack(delivery: &Delivery) {
    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        warn!(error = %e, "ack failed");
    }
}

async fn nack_requeue(delivery: &Delivery) {
    let options = BasicNackOptions {
        requeue: true,
        ..Default::default()
    };
    if let Err(e) = delivery.nack(options).await {
        warn!(error = %e, "nack failed");
    }
}
