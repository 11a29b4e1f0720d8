//! Archival scheduler: periodic upload of unsynchronized records to object
//! storage.
//!
//! Every tick selects up to `batch_limit` records with `synced=false` inside
//! the scan window, serializes them to a compact JSON array, gzips the
//! payload, uploads it, and only then marks the batch synchronized. Any
//! failure leaves the batch untouched for the next tick — there is no
//! partial mark.
//!
//! At most one archival operation is in flight at a time; overrunning ticks
//! are skipped, not queued.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::error::AggregatorError;
use crate::store::{ArchiveEntry, LogStore, document_to_json};

/// Archive format version recorded in object metadata.
const ARCHIVE_VERSION: &str = "3.0";

/// Archival settings.
#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    /// Object store region.
    pub region: String,
    /// Optional static credentials (default chain otherwise).
    pub access_key: Option<String>,
    /// Secret half of the static credentials.
    pub secret_key: Option<String>,
    /// Bucket prefix; the bucket is `<prefix>-logs-<capture-ip>`.
    pub bucket_prefix: String,
    /// Tick cadence.
    pub interval: Duration,
    /// Scan window (records older than `now - window` are left alone).
    pub window: Duration,
    /// Maximum records per batch.
    pub batch_limit: usize,
}

/// The archival scheduler.
pub struct ArchiveScheduler {
    s3: Client,
    store: Arc<LogStore>,
    settings: ArchiveSettings,
    bucket: String,
    /// Lazily created on first archival.
    bucket_ready: AtomicBool,
    /// Cadence guard: at most one operation in flight.
    in_flight: AtomicBool,
    /// Records archived across the process lifetime.
    archived_count: Arc<AtomicU64>,
    /// Last tick outcome, for health reporting.
    object_store_ok: Arc<AtomicBool>,
}

impl ArchiveScheduler {
    /// Initialize the object store client.
    ///
    /// Bucket creation is deferred to the first archival.
    pub async fn new(settings: ArchiveSettings, store: Arc<LogStore>, capture_ip: &str) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let (Some(access), Some(secret)) = (&settings.access_key, &settings.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access.clone(),
                secret.clone(),
                None,
                None,
                "opsentra-config",
            ));
        }
        let sdk_config = loader.load().await;

        let bucket = bucket_name(&settings.bucket_prefix, capture_ip);
        info!(bucket = %bucket, "object store client initialized");

        Self {
            s3: Client::new(&sdk_config),
            store,
            settings,
            bucket,
            bucket_ready: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            archived_count: Arc::new(AtomicU64::new(0)),
            object_store_ok: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Destination bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Archived-records counter handle.
    pub fn archived_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.archived_count)
    }

    /// Object-store health flag handle.
    pub fn object_store_ok_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.object_store_ok)
    }

    /// Run the scheduler until shutdown.
    ///
    /// Spawn with `tokio::spawn`. Archival is not forced at shutdown;
    /// residual unsynchronized records are handled by the next process
    /// instance.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; skip it so startup is quiet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.in_flight.swap(true, Ordering::SeqCst) {
                        debug!("previous archival still running, skipping tick");
                        continue;
                    }
                    match self.run_once().await {
                        Ok(0) => {
                            self.object_store_ok.store(true, Ordering::Relaxed);
                            debug!("no unsynchronized records, no object created");
                        }
                        Ok(count) => {
                            self.object_store_ok.store(true, Ordering::Relaxed);
                            info!(records = count, bucket = %self.bucket, "archival batch uploaded");
                        }
                        Err(e) => {
                            self.object_store_ok.store(false, Ordering::Relaxed);
                            error!(
                                component = "archive",
                                bucket = %self.bucket,
                                error = %e,
                                "archival tick failed, will retry next tick"
                            );
                        }
                    }
                    self.in_flight.store(false, Ordering::SeqCst);
                }
                _ = shutdown.recv() => {
                    debug!("archive scheduler shutting down");
                    return;
                }
            }
        }
    }

    /// One archival pass. Returns the number of records archived.
    pub async fn run_once(&self) -> Result<usize, AggregatorError> {
        let entries = self
            .store
            .unsynced_batch(self.settings.window, self.settings.batch_limit)
            .await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let payload = compress_entries(&entries)?;
        let key = object_key(Utc::now());

        self.ensure_bucket().await?;

        self.s3
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(payload))
            .content_type("application/gzip")
            .content_encoding("gzip")
            .metadata("log-count", entries.len().to_string())
            .metadata("compression", "gzip")
            .metadata("version", ARCHIVE_VERSION)
            .send()
            .await
            .map_err(|e| {
                AggregatorError::archive("upload", aws_sdk_s3::error::DisplayErrorContext(&e))
            })?;

        let ids: Vec<_> = entries.iter().map(|entry| entry.id).collect();
        let marked = self.store.mark_synced(&ids).await?;
        self.archived_count.fetch_add(marked, Ordering::Relaxed);

        debug!(key = %key, records = entries.len(), marked = marked, "archive object written");
        Ok(entries.len())
    }

    /// Create the bucket on first use (idempotent; tolerates creation races).
    async fn ensure_bucket(&self) -> Result<(), AggregatorError> {
        if self.bucket_ready.load(Ordering::Relaxed) {
            return Ok(());
        }

        let exists = self
            .s3
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok();

        if !exists {
            let mut request = self.s3.create_bucket().bucket(&self.bucket);
            // us-east-1 rejects an explicit location constraint
            if self.settings.region != "us-east-1" {
                request = request.create_bucket_configuration(
                    CreateBucketConfiguration::builder()
                        .location_constraint(BucketLocationConstraint::from(
                            self.settings.region.as_str(),
                        ))
                        .build(),
                );
            }
            match request.send().await {
                Ok(_) => info!(bucket = %self.bucket, "archive bucket created"),
                Err(e) => {
                    let service_error = e.into_service_error();
                    if service_error.is_bucket_already_owned_by_you()
                        || service_error.is_bucket_already_exists()
                    {
                        debug!(bucket = %self.bucket, "bucket created concurrently");
                    } else {
                        return Err(AggregatorError::Archive {
                            operation: "create bucket".to_owned(),
                            reason: service_error.to_string(),
                        });
                    }
                }
            }
        }

        self.bucket_ready.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Destination bucket for this capture host.
pub fn bucket_name(prefix: &str, capture_ip: &str) -> String {
    // S3 virtual-hosted TLS does not cover dotted bucket names
    let ip = capture_ip.replace(['.', ':'], "-");
    format!("{prefix}-logs-{ip}")
}

/// Object key for an archival batch (`logs-<UTC ts, colons replaced>.json.gz`).
pub fn object_key(now: DateTime<Utc>) -> String {
    format!("logs-{}.json.gz", now.format("%Y-%m-%dT%H-%M-%S"))
}

/// Serialize entries to a compact JSON array and gzip it.
pub fn compress_entries(entries: &[ArchiveEntry]) -> Result<Vec<u8>, AggregatorError> {
    let values: Vec<serde_json::Value> = entries
        .iter()
        .map(|entry| document_to_json(&entry.document))
        .collect();
    let json =
        serde_json::to_vec(&values).map_err(|e| AggregatorError::archive("serialize", e))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| AggregatorError::archive("compress", e))?;
    encoder
        .finish()
        .map_err(|e| AggregatorError::archive("compress", e))
}
