//! Persistence writer: time-series storage for log records.
//!
//! Records live in the `opsentra.logs` time-series collection
//! (time field `timestamp`, meta field `service`, minute granularity,
//! 30-day TTL). Secondary indexes serve recent-by-service reads, severity
//! filters, and archival scans.
//!
//! Write failures surface to the caller so broker acks can be withheld.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use futures::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{Bson, DateTime as BsonDateTime, Document, doc};
use mongodb::options::{
    CreateCollectionOptions, IndexOptions, TimeseriesGranularity, TimeseriesOptions,
};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, info};

use opsentra_core::types::{EnrichmentUpdate, LogRecord};

use crate::error::AggregatorError;

/// Database name.
const DATABASE: &str = "opsentra";
/// Time-series collection name.
const COLLECTION: &str = "logs";
/// Store-native record TTL.
const RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// A record selected for archival.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Store identifier.
    pub id: ObjectId,
    /// Canonical record fields, projected.
    pub document: Document,
}

/// Filter for the read endpoint.
#[derive(Debug, Clone, Default)]
pub struct FetchFilter {
    /// Only records of this service.
    pub service: Option<String>,
    /// Only records at this level.
    pub level: Option<String>,
    /// Maximum records to return.
    pub limit: i64,
}

/// Handle to the time-series store.
///
/// The underlying driver maintains a connection pool shared by the
/// persistence writer and the archival scheduler.
pub struct LogStore {
    db: Database,
    logs: Collection<Document>,
}

impl LogStore {
    /// Connect to the store.
    pub async fn connect(uri: &str) -> Result<Self, AggregatorError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| AggregatorError::store("connect", e))?;
        let db = client.database(DATABASE);
        let logs = db.collection::<Document>(COLLECTION);
        Ok(Self { db, logs })
    }

    /// Create the time-series collection (if absent) and ensure indexes.
    ///
    /// Creation is existence-check-then-create; an "already exists" race with
    /// another instance is tolerated.
    pub async fn ensure_schema(&self) -> Result<(), AggregatorError> {
        let existing = self
            .db
            .list_collection_names()
            .await
            .map_err(|e| AggregatorError::store("list collections", e))?;

        if !existing.iter().any(|name| name == COLLECTION) {
            let options = CreateCollectionOptions::builder()
                .timeseries(
                    TimeseriesOptions::builder()
                        .time_field("timestamp".to_owned())
                        .meta_field(Some("service".to_owned()))
                        .granularity(Some(TimeseriesGranularity::Minutes))
                        .build(),
                )
                .expire_after_seconds(RETENTION)
                .build();
            match self.db.create_collection(COLLECTION).with_options(options).await {
                Ok(()) => info!(collection = COLLECTION, "time-series collection created"),
                Err(e) if e.to_string().contains("already exists") => {
                    debug!(collection = COLLECTION, "collection created concurrently");
                }
                Err(e) => return Err(AggregatorError::store("create collection", e)),
            }
        }

        let indexes = vec![
            IndexModel::builder()
                .keys(doc! { "timestamp": -1, "service": 1 })
                .options(IndexOptions::builder().name("recent_by_service".to_owned()).build())
                .build(),
            IndexModel::builder()
                .keys(doc! { "level": 1, "timestamp": -1 })
                .options(IndexOptions::builder().name("severity_filter".to_owned()).build())
                .build(),
            IndexModel::builder()
                .keys(doc! { "synced": 1, "timestamp": 1 })
                .options(IndexOptions::builder().name("archival_scan".to_owned()).build())
                .build(),
        ];
        self.logs
            .create_indexes(indexes)
            .await
            .map_err(|e| AggregatorError::store("create indexes", e))?;

        Ok(())
    }

    /// Insert a record with `synced=false` and return the assigned id.
    pub async fn insert_record(&self, record: &LogRecord) -> Result<String, AggregatorError> {
        let document = record_to_document(record);
        let result = self
            .logs
            .insert_one(document)
            .await
            .map_err(|e| AggregatorError::store("insert", e))?;

        match result.inserted_id {
            Bson::ObjectId(oid) => Ok(oid.to_hex()),
            other => Ok(other.to_string()),
        }
    }

    /// Merge enrichment fields onto a persisted record by identifier.
    ///
    /// Returns `false` when no record matches the identifier.
    pub async fn apply_enrichment(
        &self,
        update: &EnrichmentUpdate,
    ) -> Result<bool, AggregatorError> {
        let oid = ObjectId::parse_str(&update.log_id).map_err(|e| {
            AggregatorError::store("enrichment", format!("bad identifier '{}': {e}", update.log_id))
        })?;

        let suggestions: Vec<Bson> = update
            .suggestions
            .iter()
            .map(|s| Bson::String(s.clone()))
            .collect();
        let result = self
            .logs
            .update_one(
                doc! { "_id": oid },
                doc! { "$set": {
                    "enrichment": {
                        "analysis": &update.analysis,
                        "suggestions": suggestions,
                        "confidence": update.confidence,
                    },
                    "enrichedAt": BsonDateTime::from_chrono(Utc::now()),
                } },
            )
            .await
            .map_err(|e| AggregatorError::store("enrichment update", e))?;

        Ok(result.matched_count > 0)
    }

    /// Read recent records matching the filter, newest first.
    pub async fn fetch_filtered(
        &self,
        filter: &FetchFilter,
    ) -> Result<Vec<serde_json::Value>, AggregatorError> {
        let mut query = Document::new();
        if let Some(service) = &filter.service {
            query.insert("service", service);
        }
        if let Some(level) = &filter.level {
            query.insert("level", level);
        }

        let mut cursor = self
            .logs
            .find(query)
            .sort(doc! { "timestamp": -1 })
            .limit(filter.limit)
            .await
            .map_err(|e| AggregatorError::store("fetch", e))?;

        let mut records = Vec::new();
        while let Some(document) = cursor
            .try_next()
            .await
            .map_err(|e| AggregatorError::store("fetch cursor", e))?
        {
            records.push(document_to_json(&document));
        }
        Ok(records)
    }

    /// Distinct `service` values seen in the store.
    pub async fn list_services(&self) -> Result<Vec<String>, AggregatorError> {
        let values = self
            .logs
            .distinct("service", doc! {})
            .await
            .map_err(|e| AggregatorError::store("distinct services", e))?;

        let mut services: Vec<String> = values
            .into_iter()
            .filter_map(|value| match value {
                Bson::String(s) => Some(s),
                _ => None,
            })
            .collect();
        services.sort();
        Ok(services)
    }

    /// Select up to `limit` unsynchronized records inside the scan window,
    /// oldest first, projecting only canonical fields.
    pub async fn unsynced_batch(
        &self,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<ArchiveEntry>, AggregatorError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window)
                .map_err(|e| AggregatorError::store("archival window", e))?;

        let mut cursor = self
            .logs
            .find(doc! {
                "synced": false,
                "timestamp": { "$gte": BsonDateTime::from_chrono(cutoff) },
            })
            .projection(doc! {
                "timestamp": 1,
                "level": 1,
                "service": 1,
                "host": 1,
                "ip": 1,
                "source": 1,
                "message": 1,
                "sourceType": 1,
                "metadata": 1,
            })
            .sort(doc! { "timestamp": 1 })
            .limit(limit as i64)
            .await
            .map_err(|e| AggregatorError::store("archival scan", e))?;

        let mut entries = Vec::new();
        while let Some(document) = cursor
            .try_next()
            .await
            .map_err(|e| AggregatorError::store("archival cursor", e))?
        {
            let id = match document.get_object_id("_id") {
                Ok(oid) => oid,
                Err(_) => continue,
            };
            entries.push(ArchiveEntry { id, document });
        }
        Ok(entries)
    }

    /// Atomically mark the given records as synchronized.
    ///
    /// `synced` is monotonic: this is the only transition and it is never
    /// reversed.
    pub async fn mark_synced(&self, ids: &[ObjectId]) -> Result<u64, AggregatorError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let id_list: Vec<Bson> = ids.iter().map(|oid| Bson::ObjectId(*oid)).collect();
        let result = self
            .logs
            .update_many(
                doc! { "_id": { "$in": id_list } },
                doc! { "$set": {
                    "synced": true,
                    "syncedAt": BsonDateTime::from_chrono(Utc::now()),
                } },
            )
            .await
            .map_err(|e| AggregatorError::store("mark synced", e))?;
        Ok(result.modified_count)
    }

    /// Cheap liveness probe for health reporting.
    pub async fn ping(&self) -> bool {
        self.db.run_command(doc! { "ping": 1 }).await.is_ok()
    }
}

/// Convert a record into its stored document form (`synced=false` on insert).
pub fn record_to_document(record: &LogRecord) -> Document {
    let mut metadata = Document::new();
    for (key, value) in &record.metadata {
        metadata.insert(key, value);
    }

    doc! {
        "timestamp": BsonDateTime::from_chrono(record.timestamp),
        "level": record.level.as_str(),
        "service": &record.service,
        "host": &record.host,
        "ip": &record.ip,
        "source": &record.source,
        "message": &record.message,
        "sourceType": record.source_type.as_str(),
        "metadata": metadata,
        "synced": false,
    }
}

/// Convert a stored document into client-facing JSON.
///
/// `_id` becomes a hex `id`, datetimes become RFC 3339 strings with
/// millisecond precision.
pub fn document_to_json(document: &Document) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, value) in document {
        let (key, value) = if key.as_str() == "_id" {
            ("id".to_owned(), bson_to_json(value))
        } else {
            (key.clone(), bson_to_json(value))
        };
        map.insert(key, value);
    }
    serde_json::Value::Object(map)
}

fn bson_to_json(value: &Bson) -> serde_json::Value {
    match value {
        Bson::ObjectId(oid) => serde_json::Value::String(oid.to_hex()),
        Bson::DateTime(dt) => serde_json::Value::String(
            dt.to_chrono().to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
        Bson::String(s) => serde_json::Value::String(s.clone()),
        Bson::Boolean(b) => serde_json::Value::Bool(*b),
        Bson::Int32(n) => serde_json::Value::from(*n),
        Bson::Int64(n) => serde_json::Value::from(*n),
        Bson::Double(n) => serde_json::Value::from(*n),
        Bson::Document(doc) => document_to_json(doc),
        Bson::Array(items) => {
            serde_json::Value::Array(items.iter().map(bson_to_json).collect())
        }
        Bson::Null => serde_json::Value::Null,
        other => serde_json::Value::String(other.to_string()),
    }
}
