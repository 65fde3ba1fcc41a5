//! Storage ports
//!
//! Every backend implements these traits. Writes are idempotent and keyed
//! by version: repeating a write with identical content succeeds without
//! effect, repeating it with different content is an
//! `IdempotencyViolation`.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::models::{
    ClaimOrder, ClaimRequest, IndexQuery, IngestReceipt, InvertedIndexEntry, OutboxEntry,
    OutboxStatus, Page, PutOutcome, RawDataRecord, SliceRecord,
};
use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Raw data
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait RawDataStore: Send + Sync {
    /// Write one version.
    ///
    /// - same `(tenant, key, version)` and hash → `AlreadyApplied`
    /// - same key and version, different hash → `IdempotencyViolation`
    /// - version not greater than the latest stored version → `Validation`
    async fn put_idempotent(&self, record: &RawDataRecord) -> Result<PutOutcome>;

    async fn get(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
    ) -> Result<Option<RawDataRecord>>;

    async fn get_latest(&self, tenant_id: &str, entity_key: &str) -> Result<Option<RawDataRecord>>;

    /// Highest version strictly below `before_version`.
    async fn get_previous(
        &self,
        tenant_id: &str,
        entity_key: &str,
        before_version: i64,
    ) -> Result<Option<RawDataRecord>>;

    /// Latest version of each key; missing keys are omitted.
    async fn batch_get_latest(
        &self,
        tenant_id: &str,
        entity_keys: &[String],
    ) -> Result<Vec<RawDataRecord>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Slices
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait SliceStore: Send + Sync {
    /// Write a batch of slices atomically. Any hash conflict rejects the
    /// whole batch.
    async fn put_slices(&self, slices: &[SliceRecord]) -> Result<Vec<PutOutcome>>;

    async fn get_slice(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
        slice_type: &str,
    ) -> Result<Option<SliceRecord>>;

    /// Newest slice of `slice_type` at any version.
    async fn get_latest_slice(
        &self,
        tenant_id: &str,
        entity_key: &str,
        slice_type: &str,
    ) -> Result<Option<SliceRecord>>;

    /// Slices written at exactly `version`, sorted by slice type.
    async fn list_slices(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
    ) -> Result<Vec<SliceRecord>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Inverted index
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait InvertedIndexStore: Send + Sync {
    /// Replace every entry of one entity with `entries` computed at `version`.
    ///
    /// Returns `false` (and writes nothing) when a newer version is already
    /// indexed.
    async fn replace_entity_entries(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
        entries: &[InvertedIndexEntry],
    ) -> Result<bool>;

    /// Entries sorted by `entity_key`, starting after the query cursor.
    async fn query(&self, query: &IndexQuery) -> Result<Page<InvertedIndexEntry>>;

    async fn count(&self, tenant_id: &str, index_type: &str, index_value: &str) -> Result<u64>;

    /// Entries admitted by the query's entity-type and exclusion filters.
    async fn count_matching(&self, query: &IndexQuery) -> Result<u64>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Outbox
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append one entry. A duplicate `idempotency_key` returns the stored entry.
    async fn insert(&self, entry: OutboxEntry) -> Result<OutboxEntry>;

    async fn insert_all(&self, entries: Vec<OutboxEntry>) -> Result<Vec<OutboxEntry>>;

    /// Pending entries in creation order, after the `after_sequence` cursor.
    async fn find_pending_after(
        &self,
        after_sequence: Option<i64>,
        limit: usize,
        aggregate_type: Option<&str>,
    ) -> Result<Vec<OutboxEntry>>;

    async fn find_pending(
        &self,
        limit: usize,
        aggregate_type: Option<&str>,
    ) -> Result<Vec<OutboxEntry>> {
        self.find_pending_after(None, limit, aggregate_type).await
    }

    /// Atomically flip up to `request.limit` PENDING entries to PROCESSING.
    ///
    /// Two concurrent calls never return the same entry.
    async fn claim_with(&self, request: &ClaimRequest) -> Result<Vec<OutboxEntry>>;

    async fn claim(
        &self,
        limit: usize,
        aggregate_type: Option<&str>,
        worker_id: Option<&str>,
    ) -> Result<Vec<OutboxEntry>> {
        let request = ClaimRequest::new(limit)
            .aggregate_type(aggregate_type)
            .worker(worker_id);
        self.claim_with(&request).await
    }

    async fn claim_one(
        &self,
        aggregate_type: Option<&str>,
        worker_id: Option<&str>,
    ) -> Result<Option<OutboxEntry>> {
        Ok(self.claim(1, aggregate_type, worker_id).await?.into_iter().next())
    }

    async fn claim_by_priority(
        &self,
        limit: usize,
        aggregate_type: Option<&str>,
        worker_id: Option<&str>,
    ) -> Result<Vec<OutboxEntry>> {
        let request = ClaimRequest::new(limit)
            .aggregate_type(aggregate_type)
            .worker(worker_id)
            .order(ClaimOrder::Priority);
        self.claim_with(&request).await
    }

    /// Claim honoring per-aggregate order: an entry is skipped while an
    /// earlier entry of the same aggregate is PENDING or PROCESSING.
    async fn claim_with_ordering(
        &self,
        limit: usize,
        aggregate_type: Option<&str>,
        worker_id: Option<&str>,
    ) -> Result<Vec<OutboxEntry>> {
        let request = ClaimRequest::new(limit)
            .aggregate_type(aggregate_type)
            .worker(worker_id)
            .causal(true);
        self.claim_with(&request).await
    }

    /// PROCESSING → PROCESSED for entries still claimed by `worker_id`.
    ///
    /// Entries that are not PROCESSING, or whose claim now belongs to another
    /// worker, are left alone and not counted.
    async fn mark_processed(&self, ids: &[Uuid], worker_id: Option<&str>) -> Result<u64>;

    /// PROCESSING → FAILED, incrementing `retry_count`. Rejects an entry that
    /// is not PROCESSING or is claimed by someone other than `worker_id`.
    async fn mark_failed(&self, id: Uuid, worker_id: Option<&str>, reason: &str) -> Result<()>;

    /// FAILED → PENDING for the given ids.
    async fn reset_to_pending(&self, ids: &[Uuid]) -> Result<u64>;

    /// FAILED → PENDING for every failed entry.
    async fn reset_all_failed(&self) -> Result<u64>;

    /// PROCESSING entries claimed longer than `visibility_timeout` ago go
    /// back to PENDING. `retry_count` is unchanged.
    async fn release_expired_claims(&self, visibility_timeout: Duration) -> Result<u64>;

    /// FAILED entries with `retry_count >= max_retry_count` move to DLQ.
    async fn move_to_dlq(&self, max_retry_count: i32) -> Result<u64>;

    async fn find_dlq(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// DLQ → PENDING with `retry_count` reset to zero.
    async fn replay_from_dlq(&self, ids: &[Uuid]) -> Result<u64>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxEntry>>;

    async fn count_by_status(&self, status: OutboxStatus) -> Result<u64>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Ingest (raw + outbox in one unit)
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait IngestStore: RawDataStore + OutboxStore {
    /// Write the raw record and its outbox entry atomically.
    ///
    /// When the raw write is `AlreadyApplied` no outbox entry is written.
    /// When it fails, neither is written.
    async fn put_raw_with_outbox(
        &self,
        record: &RawDataRecord,
        entry: OutboxEntry,
    ) -> Result<IngestReceipt>;
}
