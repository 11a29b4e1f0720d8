//! Subscriber hub: registration, filtered fan-out, and heartbeats.
//!
//! The hub holds the set of long-lived subscribers and delivers every record
//! received after registration to every matching subscriber in broker
//! delivery order. Registration, fan-out, and removal are linearizable with
//! respect to each other (a single `RwLock` write section, no await points).
//!
//! # Backpressure
//!
//! Each subscriber owns a bounded outbound buffer. A full buffer disconnects
//! the subscriber instead of blocking the hub; disconnection is permanent and
//! the client must reconnect. The hub never buffers history.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use opsentra_core::types::{EnrichmentUpdate, LogRecord};

/// An event framed to subscribers.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A newly persisted log record.
    Record {
        /// Store identifier assigned at insert.
        id: String,
        /// The record itself.
        record: LogRecord,
    },
    /// An enrichment update for a previously delivered record.
    Enrichment(EnrichmentUpdate),
    /// Keeps idle connections open through intermediate proxies.
    Heartbeat,
}

/// One registered subscriber.
struct Subscriber {
    /// Optional service filter; `None` receives everything.
    service_filter: Option<String>,
    /// Bounded outbound buffer.
    tx: mpsc::Sender<StreamEvent>,
    /// Time of the last successfully queued event.
    last_event: Instant,
}

/// The subscriber hub.
pub struct SubscriberHub {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    /// Per-subscriber outbound buffer capacity.
    buffer_size: usize,
    /// Window after which an idle subscriber receives a heartbeat.
    heartbeat_interval: Duration,
    /// Events delivered across all subscribers.
    delivered_count: AtomicU64,
    /// Subscribers disconnected due to buffer overflow.
    overflow_disconnects: AtomicU64,
}

impl SubscriberHub {
    /// Create a new hub.
    pub fn new(buffer_size: usize, heartbeat_interval: Duration) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            buffer_size,
            heartbeat_interval,
            delivered_count: AtomicU64::new(0),
            overflow_disconnects: AtomicU64::new(0),
        }
    }

    /// Register a subscriber with an optional service filter.
    ///
    /// Returns the subscriber id and the receiving end of its buffer.
    /// The subscriber sees only events delivered after this call returns.
    pub fn register(&self, service_filter: Option<String>) -> (Uuid, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let id = Uuid::new_v4();
        let subscriber = Subscriber {
            service_filter: service_filter.clone(),
            tx,
            last_event: Instant::now(),
        };
        self.subscribers.write().insert(id, subscriber);
        info!(subscriber = %id, filter = ?service_filter, "subscriber registered");
        (id, rx)
    }

    /// Remove a subscriber (client disconnect or shutdown).
    pub fn remove(&self, id: &Uuid) {
        if self.subscribers.write().remove(id).is_some() {
            debug!(subscriber = %id, "subscriber removed");
        }
    }

    /// Fan a record out to every matching subscriber.
    ///
    /// Fan-out is bounded by the subscriber set at dispatch time; a
    /// registration racing with this call does not receive the record.
    pub fn publish_record(&self, id: &str, record: &LogRecord) {
        let event = StreamEvent::Record {
            id: id.to_owned(),
            record: record.clone(),
        };
        self.fan_out(event, Some(record.service.as_str()));
    }

    /// Fan an enrichment update out to every subscriber.
    ///
    /// Enrichment events are keyed by record identifier and are not
    /// service-filtered; clients ignore ids they never saw.
    pub fn publish_enrichment(&self, update: &EnrichmentUpdate) {
        self.fan_out(StreamEvent::Enrichment(update.clone()), None);
    }

    /// Send a heartbeat to every subscriber that has been idle for the
    /// configured window. Call on a fixed cadence.
    pub fn heartbeat_sweep(&self) {
        let interval = self.heartbeat_interval;
        let overflow = &self.overflow_disconnects;
        self.subscribers.write().retain(|id, subscriber| {
            if subscriber.last_event.elapsed() < interval {
                return true;
            }
            match subscriber.tx.try_send(StreamEvent::Heartbeat) {
                Ok(()) => {
                    subscriber.last_event = Instant::now();
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    overflow.fetch_add(1, Ordering::Relaxed);
                    warn!(subscriber = %id, "subscriber buffer full on heartbeat, disconnecting");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = %id, "subscriber gone, removing");
                    false
                }
            }
        });
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Total events delivered across all subscribers.
    pub fn delivered_count(&self) -> u64 {
        self.delivered_count.load(Ordering::Relaxed)
    }

    /// Subscribers disconnected because their buffer overflowed.
    pub fn overflow_disconnects(&self) -> u64 {
        self.overflow_disconnects.load(Ordering::Relaxed)
    }

    /// Disconnect all subscribers (shutdown path: stop accepting, drop sinks).
    pub fn close_all(&self) {
        let mut subscribers = self.subscribers.write();
        let count = subscribers.len();
        subscribers.clear();
        if count > 0 {
            info!(count = count, "all subscribers disconnected");
        }
    }

    /// Deliver one event under the write lock, honoring filters and
    /// disconnecting subscribers whose buffer is full.
    fn fan_out(&self, event: StreamEvent, service: Option<&str>) {
        let delivered = &self.delivered_count;
        let overflow = &self.overflow_disconnects;
        self.subscribers.write().retain(|id, subscriber| {
            if let (Some(service), Some(filter)) = (service, &subscriber.service_filter)
                && service != filter
            {
                return true;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {
                    subscriber.last_event = Instant::now();
                    delivered.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    overflow.fetch_add(1, Ordering::Relaxed);
                    warn!(subscriber = %id, "subscriber buffer overflow, disconnecting");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = %id, "subscriber sink closed, removing");
                    false
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use opsentra_core::types::{Level, SourceType};

    fn record(service: &str, msg: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level: Level::Info,
            service: service.to_owned(),
            host: "host".to_owned(),
            ip: "10.0.0.1".to_owned(),
            source: format!("/var/log/{service}.log"),
            message: msg.to_owned(),
            source_type: SourceType::System,
            metadata: Default::default(),
        }
    }

    fn hub() -> SubscriberHub {
        SubscriberHub::new(8, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn unfiltered_subscriber_receives_all_records() {
        let hub = hub();
        let (_id, mut rx) = hub.register(None);

        hub.publish_record("id-1", &record("nginx", "one"));
        hub.publish_record("id-2", &record("mysql", "two"));

        match rx.recv().await.unwrap() {
            StreamEvent::Record { id, record } => {
                assert_eq!(id, "id-1");
                assert_eq!(record.service, "nginx");
            }
            other => panic!("expected record, got {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), StreamEvent::Record { .. }));
    }

    #[tokio::test]
    async fn service_filter_excludes_other_services() {
        let hub = hub();
        let (_nginx_id, mut nginx_rx) = hub.register(Some("nginx".to_owned()));
        let (_mysql_id, mut mysql_rx) = hub.register(Some("mysql".to_owned()));

        hub.publish_record("id-1", &record("nginx", "upstream timed out"));

        match nginx_rx.recv().await.unwrap() {
            StreamEvent::Record { record, .. } => assert_eq!(record.service, "nginx"),
            other => panic!("expected record, got {other:?}"),
        }
        assert!(mysql_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_subscriber_fifo_order() {
        let hub = hub();
        let (_id, mut rx) = hub.register(None);

        for i in 0..5 {
            hub.publish_record(&format!("id-{i}"), &record("app", &format!("m{i}")));
        }
        for i in 0..5 {
            match rx.recv().await.unwrap() {
                StreamEvent::Record { id, .. } => assert_eq!(id, format!("id-{i}")),
                other => panic!("expected record, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn late_subscriber_sees_no_history() {
        let hub = hub();
        hub.publish_record("id-early", &record("app", "before registration"));

        let (_id, mut rx) = hub.register(None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflow_disconnects_slow_subscriber() {
        let hub = SubscriberHub::new(4, Duration::from_secs(30));
        let (_slow_id, slow_rx) = hub.register(None);
        let (_ok_id, mut ok_rx) = hub.register(None);
        assert_eq!(hub.subscriber_count(), 2);

        // the slow subscriber never reads; its buffer (4) fills, the 5th drops
        // it. The healthy subscriber keeps reading and sees no gaps.
        for i in 0..5 {
            hub.publish_record(&format!("id-{i}"), &record("app", "m"));
            match ok_rx.recv().await.unwrap() {
                StreamEvent::Record { id, .. } => assert_eq!(id, format!("id-{i}")),
                other => panic!("expected record, got {other:?}"),
            }
        }

        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.overflow_disconnects(), 1);
        drop(slow_rx);
    }

    #[tokio::test]
    async fn enrichment_bypasses_service_filter() {
        let hub = hub();
        let (_id, mut rx) = hub.register(Some("nginx".to_owned()));

        let update = EnrichmentUpdate {
            log_id: "id-1".to_owned(),
            analysis: "disk pressure".to_owned(),
            suggestions: vec!["df -h".to_owned()],
            confidence: 0.8,
        };
        hub.publish_enrichment(&update);

        match rx.recv().await.unwrap() {
            StreamEvent::Enrichment(received) => assert_eq!(received.log_id, "id-1"),
            other => panic!("expected enrichment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_sent_to_idle_subscriber() {
        let hub = SubscriberHub::new(8, Duration::from_millis(0));
        let (_id, mut rx) = hub.register(None);

        hub.heartbeat_sweep();
        assert!(matches!(rx.recv().await.unwrap(), StreamEvent::Heartbeat));
    }

    #[tokio::test]
    async fn heartbeat_skips_recently_served_subscriber() {
        let hub = SubscriberHub::new(8, Duration::from_secs(30));
        let (_id, mut rx) = hub.register(None);

        hub.publish_record("id-1", &record("app", "fresh"));
        hub.heartbeat_sweep();

        assert!(matches!(
            rx.recv().await.unwrap(),
            StreamEvent::Record { .. }
        ));
        // no heartbeat queued: the record reset the idle window
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removed_subscriber_gets_nothing_further() {
        let hub = hub();
        let (id, mut rx) = hub.register(None);

        hub.remove(&id);
        hub.publish_record("id-1", &record("app", "m"));

        // sender dropped on removal, receiver reports closed
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_all_drops_every_sink() {
        let hub = hub();
        let (_a, mut rx_a) = hub.register(None);
        let (_b, mut rx_b) = hub.register(Some("nginx".to_owned()));

        hub.close_all();
        assert_eq!(hub.subscriber_count(), 0);
        assert!(rx_a.recv().await.is_none());
        assert!(rx_b.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let hub = hub();
        let (_id, rx) = hub.register(None);
        drop(rx);

        hub.publish_record("id-1", &record("app", "m"));
        assert_eq!(hub.subscriber_count(), 0);
    }
}
