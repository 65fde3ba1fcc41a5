//! Domain models shared by every storage backend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::hashing::content_hash;

// ═══════════════════════════════════════════════════════════════════════════
// Raw data
// ═══════════════════════════════════════════════════════════════════════════

/// Immutable versioned raw entity document
///
/// Identity is `(tenant_id, entity_key, version)`. A `null` payload marks
/// the entity as deleted at that version (tombstone).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDataRecord {
    pub tenant_id: String,
    pub entity_key: String,
    pub entity_type: String,
    pub version: i64,
    pub payload: Value,
    pub payload_hash: String,
    pub created_at: DateTime<Utc>,
}

impl RawDataRecord {
    /// Create a record, hashing the payload.
    pub fn new(
        tenant_id: impl Into<String>,
        entity_key: impl Into<String>,
        entity_type: impl Into<String>,
        version: i64,
        payload: Value,
    ) -> Self {
        let payload_hash = content_hash(&payload);
        Self {
            tenant_id: tenant_id.into(),
            entity_key: entity_key.into(),
            entity_type: entity_type.into(),
            version,
            payload,
            payload_hash,
            created_at: Utc::now(),
        }
    }

    /// Deletion marker for `entity_key` at `version`.
    pub fn tombstone(
        tenant_id: impl Into<String>,
        entity_key: impl Into<String>,
        entity_type: impl Into<String>,
        version: i64,
    ) -> Self {
        Self::new(tenant_id, entity_key, entity_type, version, Value::Null)
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_null()
    }

    /// `tenant/entity_key@version`, used in logs and error messages.
    pub fn display_id(&self) -> String {
        format!("{}/{}@{}", self.tenant_id, self.entity_key, self.version)
    }
}

/// Result of an idempotent write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutOutcome {
    /// Row did not exist and was written
    Created,
    /// Row already existed with an identical hash; nothing written
    AlreadyApplied,
}

impl PutOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, PutOutcome::Created)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Slices and inverted index
// ═══════════════════════════════════════════════════════════════════════════

/// Materialized partial view of one entity version
///
/// Immutable per `(tenant_id, entity_key, version, slice_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceRecord {
    pub tenant_id: String,
    pub entity_key: String,
    pub entity_type: String,
    pub version: i64,
    pub slice_type: String,
    pub payload: Value,
    pub slice_hash: String,
    pub rule_set_id: String,
    pub rule_set_version: String,
    pub tombstone: bool,
}

impl SliceRecord {
    pub fn key(&self) -> SliceKey {
        SliceKey {
            tenant_id: self.tenant_id.clone(),
            entity_key: self.entity_key.clone(),
            version: self.version,
            slice_type: self.slice_type.clone(),
        }
    }
}

/// Primary key of a slice row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceKey {
    pub tenant_id: String,
    pub entity_key: String,
    pub version: i64,
    pub slice_type: String,
}

/// Reverse lookup row: `(index_type, index_value)` → entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvertedIndexEntry {
    pub tenant_id: String,
    pub index_type: String,
    pub index_value: String,
    pub entity_key: String,
    pub entity_type: String,
    pub current_version: i64,
}

/// Cursor-paginated inverted index lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexQuery {
    pub tenant_id: String,
    pub index_type: String,
    pub index_value: String,
    /// Exclusive lower bound on `entity_key`
    pub after: Option<String>,
    pub limit: usize,
    /// Only entries of this entity type
    pub entity_type: Option<String>,
    /// Skip this entity key (the upstream of a fanout)
    pub exclude_entity_key: Option<String>,
}

impl IndexQuery {
    pub fn new(
        tenant_id: impl Into<String>,
        index_type: impl Into<String>,
        index_value: impl Into<String>,
        limit: usize,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            index_type: index_type.into(),
            index_value: index_value.into(),
            after: None,
            limit,
            entity_type: None,
            exclude_entity_key: None,
        }
    }

    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.after = cursor;
        self
    }

    pub fn entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn excluding(mut self, entity_key: impl Into<String>) -> Self {
        self.exclude_entity_key = Some(entity_key.into());
        self
    }

    /// Entity-type and exclusion filters; cursor and limit are not checked.
    pub fn admits(&self, entry: &InvertedIndexEntry) -> bool {
        self.entity_type
            .as_deref()
            .map_or(true, |t| entry.entity_type == t)
            && self
                .exclude_entity_key
                .as_deref()
                .map_or(true, |k| entry.entity_key != k)
    }
}

/// One page of results plus the cursor for the next page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Outbox
// ═══════════════════════════════════════════════════════════════════════════

/// Outbox entry lifecycle
///
/// ```text
/// PENDING → PROCESSING → PROCESSED
///               ↓  ↑ (visibility timeout)
///             FAILED → PENDING (reset) | DLQ (retries exhausted)
/// DLQ → PENDING (replay)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Dlq,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Processed => "PROCESSED",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::Dlq => "DLQ",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSING" => Ok(OutboxStatus::Processing),
            "PROCESSED" => Ok(OutboxStatus::Processed),
            "FAILED" => Ok(OutboxStatus::Failed),
            "DLQ" => Ok(OutboxStatus::Dlq),
            other => Err(StorageError::serialization(format!(
                "Invalid outbox status: {}",
                other
            ))),
        }
    }

    /// Statuses that hold back later entries of the same aggregate.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, OutboxStatus::Pending | OutboxStatus::Processing)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable event co-written with business data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    /// Store-assigned monotonic insertion order (0 until inserted)
    pub sequence: i64,
    pub idempotency_key: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    /// Lower value is claimed sooner
    pub priority: i32,
    pub entity_version: Option<i64>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

pub const DEFAULT_OUTBOX_PRIORITY: i32 = 100;

impl OutboxEntry {
    pub fn new(
        idempotency_key: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            idempotency_key: idempotency_key.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            priority: DEFAULT_OUTBOX_PRIORITY,
            entity_version: None,
            claimed_at: None,
            claimed_by: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            failure_reason: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_entity_version(mut self, version: i64) -> Self {
        self.entity_version = Some(version);
        self
    }

    /// Sort key used by causal ordering: version, then creation, then sequence.
    pub fn causal_key(&self) -> (i64, DateTime<Utc>, i64) {
        (self.entity_version.unwrap_or(0), self.created_at, self.sequence)
    }

    pub fn same_aggregate(&self, other: &OutboxEntry) -> bool {
        self.aggregate_type == other.aggregate_type && self.aggregate_id == other.aggregate_id
    }
}

/// Candidate ordering for a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOrder {
    /// Creation order
    #[default]
    Fifo,
    /// Ascending priority, then creation order
    Priority,
}

/// Parameters of one atomic claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub limit: usize,
    pub aggregate_type: Option<String>,
    pub worker_id: Option<String>,
    pub order: ClaimOrder,
    /// Hold back entries whose aggregate has an earlier in-flight entry
    pub causal: bool,
}

impl ClaimRequest {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            aggregate_type: None,
            worker_id: None,
            order: ClaimOrder::Fifo,
            causal: false,
        }
    }

    pub fn aggregate_type(mut self, aggregate_type: Option<&str>) -> Self {
        self.aggregate_type = aggregate_type.map(str::to_string);
        self
    }

    pub fn worker(mut self, worker_id: Option<&str>) -> Self {
        self.worker_id = worker_id.map(str::to_string);
        self
    }

    pub fn order(mut self, order: ClaimOrder) -> Self {
        self.order = order;
        self
    }

    pub fn causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }
}

/// Outcome of the atomic raw + outbox write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub outcome: PutOutcome,
    /// Stored outbox entry; `None` when the raw write was a no-op
    pub outbox_entry: Option<OutboxEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_record_hash_and_tombstone() {
        let rec = RawDataRecord::new("t1", "order-1", "ORDER", 1, json!({"name": "A"}));
        assert!(rec.payload_hash.starts_with("sha256:"));
        assert!(!rec.is_tombstone());
        assert_eq!(rec.display_id(), "t1/order-1@1");

        let del = RawDataRecord::tombstone("t1", "order-1", "ORDER", 2);
        assert!(del.is_tombstone());
    }

    #[test]
    fn test_outbox_status_roundtrip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Processed,
            OutboxStatus::Failed,
            OutboxStatus::Dlq,
        ] {
            assert_eq!(OutboxStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(OutboxStatus::from_str("DONE").is_err());
    }

    #[test]
    fn test_outbox_status_serde_matches_as_str() {
        let s = serde_json::to_string(&OutboxStatus::Dlq).unwrap();
        assert_eq!(s, "\"DLQ\"");
    }

    #[test]
    fn test_in_flight_statuses() {
        assert!(OutboxStatus::Pending.is_in_flight());
        assert!(OutboxStatus::Processing.is_in_flight());
        assert!(!OutboxStatus::Failed.is_in_flight());
        assert!(!OutboxStatus::Dlq.is_in_flight());
    }

    #[test]
    fn test_causal_key_orders_by_version_first() {
        let older = OutboxEntry::new("k1", "ORDER", "o-1", "raw.ingested", json!({}))
            .with_entity_version(2);
        let mut newer = OutboxEntry::new("k2", "ORDER", "o-1", "raw.ingested", json!({}))
            .with_entity_version(1);
        newer.created_at = older.created_at - chrono::Duration::seconds(5);
        assert!(newer.causal_key() < older.causal_key());
        assert!(older.same_aggregate(&newer));
    }

    #[test]
    fn test_claim_request_builder() {
        let req = ClaimRequest::new(10)
            .aggregate_type(Some("ORDER"))
            .worker(Some("w-1"))
            .order(ClaimOrder::Priority)
            .causal(true);
        assert_eq!(req.aggregate_type.as_deref(), Some("ORDER"));
        assert_eq!(req.worker_id.as_deref(), Some("w-1"));
        assert!(req.causal);
    }
}
