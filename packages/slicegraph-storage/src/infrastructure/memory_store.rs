//! In-memory store
//!
//! Implements every storage port behind `parking_lot` mutexes. Each table
//! has its own lock; operations that touch several tables acquire them in
//! the fixed order raw → slices → index → outbox.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    ClaimOrder, ClaimRequest, Clock, IndexQuery, IngestReceipt, IngestStore, InvertedIndexEntry,
    InvertedIndexStore, OutboxEntry, OutboxStatus, OutboxStore, Page, PutOutcome, RawDataRecord,
    RawDataStore, SliceKey, SliceRecord, SliceStore, SystemClock,
};
use crate::{Result, StorageError};

type EntityId = (String, String);
type IndexKey = (String, String, String);

#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    clock: Arc<dyn Clock>,
    raw: Mutex<HashMap<EntityId, BTreeMap<i64, RawDataRecord>>>,
    slices: Mutex<BTreeMap<SliceKey, SliceRecord>>,
    index: Mutex<IndexTable>,
    outbox: Mutex<OutboxTable>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                raw: Mutex::new(HashMap::new()),
                slices: Mutex::new(BTreeMap::new()),
                index: Mutex::new(IndexTable::default()),
                outbox: Mutex::new(OutboxTable::default()),
            }),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Raw data
// ═══════════════════════════════════════════════════════════════════════════

fn check_raw_write(
    versions: Option<&BTreeMap<i64, RawDataRecord>>,
    record: &RawDataRecord,
) -> Result<PutOutcome> {
    let Some(versions) = versions else {
        return Ok(PutOutcome::Created);
    };
    if let Some(existing) = versions.get(&record.version) {
        if existing.payload_hash == record.payload_hash {
            return Ok(PutOutcome::AlreadyApplied);
        }
        return Err(StorageError::idempotency_violation(format!(
            "raw {} already stored with hash {}, got {}",
            record.display_id(),
            existing.payload_hash,
            record.payload_hash
        )));
    }
    if let Some((&latest, _)) = versions.last_key_value() {
        if record.version < latest {
            return Err(StorageError::validation(format!(
                "version regression for {}/{}: {} < latest {}",
                record.tenant_id, record.entity_key, record.version, latest
            )));
        }
    }
    Ok(PutOutcome::Created)
}

fn entity_id(tenant_id: &str, entity_key: &str) -> EntityId {
    (tenant_id.to_string(), entity_key.to_string())
}

#[async_trait]
impl RawDataStore for InMemoryStore {
    async fn put_idempotent(&self, record: &RawDataRecord) -> Result<PutOutcome> {
        let mut raw = self.inner.raw.lock();
        let id = entity_id(&record.tenant_id, &record.entity_key);
        let outcome = check_raw_write(raw.get(&id), record)?;
        if outcome.is_created() {
            raw.entry(id).or_default().insert(record.version, record.clone());
        }
        Ok(outcome)
    }

    async fn get(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
    ) -> Result<Option<RawDataRecord>> {
        let raw = self.inner.raw.lock();
        Ok(raw
            .get(&entity_id(tenant_id, entity_key))
            .and_then(|versions| versions.get(&version))
            .cloned())
    }

    async fn get_latest(&self, tenant_id: &str, entity_key: &str) -> Result<Option<RawDataRecord>> {
        let raw = self.inner.raw.lock();
        Ok(raw
            .get(&entity_id(tenant_id, entity_key))
            .and_then(|versions| versions.last_key_value())
            .map(|(_, record)| record.clone()))
    }

    async fn get_previous(
        &self,
        tenant_id: &str,
        entity_key: &str,
        before_version: i64,
    ) -> Result<Option<RawDataRecord>> {
        let raw = self.inner.raw.lock();
        Ok(raw
            .get(&entity_id(tenant_id, entity_key))
            .and_then(|versions| versions.range(..before_version).next_back())
            .map(|(_, record)| record.clone()))
    }

    async fn batch_get_latest(
        &self,
        tenant_id: &str,
        entity_keys: &[String],
    ) -> Result<Vec<RawDataRecord>> {
        let raw = self.inner.raw.lock();
        Ok(entity_keys
            .iter()
            .filter_map(|key| {
                raw.get(&entity_id(tenant_id, key))
                    .and_then(|versions| versions.last_key_value())
                    .map(|(_, record)| record.clone())
            })
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Slices
// ═══════════════════════════════════════════════════════════════════════════

fn entity_slices<'a>(
    slices: &'a BTreeMap<SliceKey, SliceRecord>,
    tenant_id: &'a str,
    entity_key: &'a str,
) -> impl Iterator<Item = &'a SliceRecord> + 'a {
    let start = SliceKey {
        tenant_id: tenant_id.to_string(),
        entity_key: entity_key.to_string(),
        version: i64::MIN,
        slice_type: String::new(),
    };
    slices
        .range(start..)
        .take_while(move |(k, _)| k.tenant_id == tenant_id && k.entity_key == entity_key)
        .map(|(_, v)| v)
}

#[async_trait]
impl SliceStore for InMemoryStore {
    async fn put_slices(&self, records: &[SliceRecord]) -> Result<Vec<PutOutcome>> {
        let mut slices = self.inner.slices.lock();

        // Validate the whole batch before writing anything
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            match slices.get(&record.key()) {
                Some(existing) if existing.slice_hash == record.slice_hash => {
                    outcomes.push(PutOutcome::AlreadyApplied)
                }
                Some(existing) => {
                    return Err(StorageError::idempotency_violation(format!(
                        "slice {}/{}@{}#{} already stored with hash {}, got {}",
                        record.tenant_id,
                        record.entity_key,
                        record.version,
                        record.slice_type,
                        existing.slice_hash,
                        record.slice_hash
                    )))
                }
                None => outcomes.push(PutOutcome::Created),
            }
        }

        for (record, outcome) in records.iter().zip(&outcomes) {
            if outcome.is_created() {
                slices.insert(record.key(), record.clone());
            }
        }
        Ok(outcomes)
    }

    async fn get_slice(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
        slice_type: &str,
    ) -> Result<Option<SliceRecord>> {
        let key = SliceKey {
            tenant_id: tenant_id.to_string(),
            entity_key: entity_key.to_string(),
            version,
            slice_type: slice_type.to_string(),
        };
        Ok(self.inner.slices.lock().get(&key).cloned())
    }

    async fn get_latest_slice(
        &self,
        tenant_id: &str,
        entity_key: &str,
        slice_type: &str,
    ) -> Result<Option<SliceRecord>> {
        let slices = self.inner.slices.lock();
        Ok(entity_slices(&slices, tenant_id, entity_key)
            .filter(|s| s.slice_type == slice_type)
            .max_by_key(|s| s.version)
            .cloned())
    }

    async fn list_slices(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
    ) -> Result<Vec<SliceRecord>> {
        let slices = self.inner.slices.lock();
        Ok(entity_slices(&slices, tenant_id, entity_key)
            .filter(|s| s.version == version)
            .cloned()
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Inverted index
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct IndexTable {
    /// (tenant, index_type, index_value) → entity_key → entry
    postings: HashMap<IndexKey, BTreeMap<String, InvertedIndexEntry>>,
    /// (tenant, entity_key) → (indexed version, posting keys)
    entities: HashMap<EntityId, (i64, Vec<IndexKey>)>,
}

impl IndexTable {
    fn remove_entity(&mut self, id: &EntityId) {
        if let Some((_, keys)) = self.entities.remove(id) {
            for key in keys {
                if let Some(posting) = self.postings.get_mut(&key) {
                    posting.remove(&id.1);
                    if posting.is_empty() {
                        self.postings.remove(&key);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl InvertedIndexStore for InMemoryStore {
    async fn replace_entity_entries(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
        entries: &[InvertedIndexEntry],
    ) -> Result<bool> {
        let mut index = self.inner.index.lock();
        let id = entity_id(tenant_id, entity_key);
        if let Some((indexed, _)) = index.entities.get(&id) {
            if *indexed > version {
                debug!(tenant_id, entity_key, version, indexed, "skipping stale index write");
                return Ok(false);
            }
        }

        index.remove_entity(&id);
        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            let key = (
                entry.tenant_id.clone(),
                entry.index_type.clone(),
                entry.index_value.clone(),
            );
            index
                .postings
                .entry(key.clone())
                .or_default()
                .insert(entry.entity_key.clone(), entry.clone());
            keys.push(key);
        }
        index.entities.insert(id, (version, keys));
        Ok(true)
    }

    async fn query(&self, query: &IndexQuery) -> Result<Page<InvertedIndexEntry>> {
        if query.limit == 0 {
            return Err(StorageError::validation("index query limit must be positive"));
        }
        let index = self.inner.index.lock();
        let key = (
            query.tenant_id.clone(),
            query.index_type.clone(),
            query.index_value.clone(),
        );
        let Some(posting) = index.postings.get(&key) else {
            return Ok(Page::empty());
        };

        let mut items: Vec<InvertedIndexEntry> = match &query.after {
            Some(cursor) => posting
                .range::<String, _>((
                    std::ops::Bound::Excluded(cursor.clone()),
                    std::ops::Bound::Unbounded,
                ))
                .map(|(_, e)| e)
                .filter(|e| query.admits(e))
                .take(query.limit + 1)
                .cloned()
                .collect(),
            None => posting
                .values()
                .filter(|e| query.admits(e))
                .take(query.limit + 1)
                .cloned()
                .collect(),
        };

        let next_cursor = if items.len() > query.limit {
            items.truncate(query.limit);
            items.last().map(|e| e.entity_key.clone())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn count(&self, tenant_id: &str, index_type: &str, index_value: &str) -> Result<u64> {
        let index = self.inner.index.lock();
        let key = (
            tenant_id.to_string(),
            index_type.to_string(),
            index_value.to_string(),
        );
        Ok(index.postings.get(&key).map_or(0, |p| p.len() as u64))
    }

    async fn count_matching(&self, query: &IndexQuery) -> Result<u64> {
        let index = self.inner.index.lock();
        let key = (
            query.tenant_id.clone(),
            query.index_type.clone(),
            query.index_value.clone(),
        );
        Ok(index.postings.get(&key).map_or(0, |p| {
            p.values().filter(|e| query.admits(e)).count() as u64
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Outbox
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct OutboxTable {
    next_sequence: i64,
    entries: BTreeMap<i64, OutboxEntry>,
    by_id: HashMap<Uuid, i64>,
    by_key: HashMap<String, i64>,
}

impl OutboxTable {
    fn insert(&mut self, mut entry: OutboxEntry, now: DateTime<Utc>) -> OutboxEntry {
        if let Some(existing) = self
            .by_key
            .get(&entry.idempotency_key)
            .and_then(|seq| self.entries.get(seq))
        {
            return existing.clone();
        }
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        entry.status = OutboxStatus::Pending;
        entry.created_at = now;
        entry.updated_at = now;
        self.by_id.insert(entry.id, entry.sequence);
        self.by_key
            .insert(entry.idempotency_key.clone(), entry.sequence);
        self.entries.insert(entry.sequence, entry.clone());
        entry
    }

    fn get_mut(&mut self, id: &Uuid) -> Option<&mut OutboxEntry> {
        let seq = self.by_id.get(id)?;
        self.entries.get_mut(seq)
    }

    fn claim(&mut self, request: &ClaimRequest, now: DateTime<Utc>) -> Vec<OutboxEntry> {
        if request.limit == 0 {
            return Vec::new();
        }

        // Earliest in-flight causal key per aggregate
        let mut heads: HashMap<(&str, &str), (i64, DateTime<Utc>, i64)> = HashMap::new();
        if request.causal {
            for entry in self.entries.values().filter(|e| e.status.is_in_flight()) {
                let key = (entry.aggregate_type.as_str(), entry.aggregate_id.as_str());
                let causal = entry.causal_key();
                heads
                    .entry(key)
                    .and_modify(|head| {
                        if causal < *head {
                            *head = causal;
                        }
                    })
                    .or_insert(causal);
            }
        }

        let mut candidates: Vec<&OutboxEntry> = self
            .entries
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .filter(|e| {
                request
                    .aggregate_type
                    .as_deref()
                    .map_or(true, |t| e.aggregate_type == t)
            })
            .filter(|e| {
                !request.causal
                    || heads
                        .get(&(e.aggregate_type.as_str(), e.aggregate_id.as_str()))
                        .map_or(true, |head| *head >= e.causal_key())
            })
            .collect();

        if request.order == ClaimOrder::Priority {
            candidates.sort_by_key(|e| (e.priority, e.sequence));
        }

        let picked: Vec<i64> = candidates
            .iter()
            .take(request.limit)
            .map(|e| e.sequence)
            .collect();

        picked
            .into_iter()
            .filter_map(|seq| {
                let entry = self.entries.get_mut(&seq)?;
                entry.status = OutboxStatus::Processing;
                entry.claimed_at = Some(now);
                entry.claimed_by = request.worker_id.clone();
                entry.updated_at = now;
                Some(entry.clone())
            })
            .collect()
    }

    fn transition<F>(&mut self, ids: &[Uuid], mut apply: F) -> u64
    where
        F: FnMut(&mut OutboxEntry) -> bool,
    {
        let mut changed = 0;
        for id in ids {
            if let Some(entry) = self.get_mut(id) {
                if apply(entry) {
                    changed += 1;
                }
            }
        }
        changed
    }

    fn transition_all<F>(&mut self, mut apply: F) -> u64
    where
        F: FnMut(&mut OutboxEntry) -> bool,
    {
        let mut changed = 0;
        for entry in self.entries.values_mut() {
            if apply(entry) {
                changed += 1;
            }
        }
        changed
    }
}

/// PROCESSING under `worker_id`'s claim.
fn held_by(entry: &OutboxEntry, worker_id: Option<&str>) -> bool {
    entry.status == OutboxStatus::Processing && entry.claimed_by.as_deref() == worker_id
}

fn requeue(entry: &mut OutboxEntry, now: DateTime<Utc>) {
    entry.status = OutboxStatus::Pending;
    entry.claimed_at = None;
    entry.claimed_by = None;
    entry.updated_at = now;
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn insert(&self, entry: OutboxEntry) -> Result<OutboxEntry> {
        let now = self.now();
        Ok(self.inner.outbox.lock().insert(entry, now))
    }

    async fn insert_all(&self, entries: Vec<OutboxEntry>) -> Result<Vec<OutboxEntry>> {
        let now = self.now();
        let mut outbox = self.inner.outbox.lock();
        Ok(entries
            .into_iter()
            .map(|entry| outbox.insert(entry, now))
            .collect())
    }

    async fn find_pending_after(
        &self,
        after_sequence: Option<i64>,
        limit: usize,
        aggregate_type: Option<&str>,
    ) -> Result<Vec<OutboxEntry>> {
        let outbox = self.inner.outbox.lock();
        let start = after_sequence.map_or(i64::MIN, |s| s.saturating_add(1));
        Ok(outbox
            .entries
            .range(start..)
            .map(|(_, e)| e)
            .filter(|e| e.status == OutboxStatus::Pending)
            .filter(|e| aggregate_type.map_or(true, |t| e.aggregate_type == t))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_with(&self, request: &ClaimRequest) -> Result<Vec<OutboxEntry>> {
        let now = self.now();
        let claimed = self.inner.outbox.lock().claim(request, now);
        if !claimed.is_empty() {
            debug!(
                count = claimed.len(),
                worker = request.worker_id.as_deref().unwrap_or("-"),
                causal = request.causal,
                "claimed outbox entries"
            );
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, ids: &[Uuid], worker_id: Option<&str>) -> Result<u64> {
        let now = self.now();
        Ok(self.inner.outbox.lock().transition(ids, |e| {
            if !held_by(e, worker_id) {
                return false;
            }
            e.status = OutboxStatus::Processed;
            e.processed_at = Some(now);
            e.updated_at = now;
            true
        }))
    }

    async fn mark_failed(&self, id: Uuid, worker_id: Option<&str>, reason: &str) -> Result<()> {
        let now = self.now();
        let mut outbox = self.inner.outbox.lock();
        let entry = outbox
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found(format!("outbox entry {}", id)))?;
        if entry.status != OutboxStatus::Processing {
            return Err(StorageError::validation(format!(
                "cannot fail outbox entry {} in status {}",
                id, entry.status
            )));
        }
        if !held_by(entry, worker_id) {
            return Err(StorageError::validation(format!(
                "outbox entry {} is claimed by {}",
                id,
                entry.claimed_by.as_deref().unwrap_or("-")
            )));
        }
        entry.status = OutboxStatus::Failed;
        entry.retry_count += 1;
        entry.failure_reason = Some(reason.to_string());
        entry.claimed_at = None;
        entry.claimed_by = None;
        entry.updated_at = now;
        Ok(())
    }

    async fn reset_to_pending(&self, ids: &[Uuid]) -> Result<u64> {
        let now = self.now();
        Ok(self.inner.outbox.lock().transition(ids, |e| {
            if e.status != OutboxStatus::Failed {
                return false;
            }
            requeue(e, now);
            true
        }))
    }

    async fn reset_all_failed(&self) -> Result<u64> {
        let now = self.now();
        Ok(self.inner.outbox.lock().transition_all(|e| {
            if e.status != OutboxStatus::Failed {
                return false;
            }
            requeue(e, now);
            true
        }))
    }

    async fn release_expired_claims(&self, visibility_timeout: Duration) -> Result<u64> {
        let now = self.now();
        let timeout = chrono::Duration::from_std(visibility_timeout)
            .map_err(|e| StorageError::validation(format!("invalid visibility timeout: {}", e)))?;
        let cutoff = now - timeout;
        let released = self.inner.outbox.lock().transition_all(|e| {
            let expired = e.status == OutboxStatus::Processing
                && e.claimed_at.map_or(true, |at| at < cutoff);
            if expired {
                requeue(e, now);
            }
            expired
        });
        if released > 0 {
            debug!(released, "released expired outbox claims");
        }
        Ok(released)
    }

    async fn move_to_dlq(&self, max_retry_count: i32) -> Result<u64> {
        let now = self.now();
        Ok(self.inner.outbox.lock().transition_all(|e| {
            if e.status != OutboxStatus::Failed || e.retry_count < max_retry_count {
                return false;
            }
            e.status = OutboxStatus::Dlq;
            e.updated_at = now;
            true
        }))
    }

    async fn find_dlq(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let outbox = self.inner.outbox.lock();
        Ok(outbox
            .entries
            .values()
            .filter(|e| e.status == OutboxStatus::Dlq)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replay_from_dlq(&self, ids: &[Uuid]) -> Result<u64> {
        let now = self.now();
        Ok(self.inner.outbox.lock().transition(ids, |e| {
            if e.status != OutboxStatus::Dlq {
                return false;
            }
            requeue(e, now);
            e.retry_count = 0;
            e.failure_reason = None;
            true
        }))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxEntry>> {
        let outbox = self.inner.outbox.lock();
        Ok(outbox
            .by_id
            .get(&id)
            .and_then(|seq| outbox.entries.get(seq))
            .cloned())
    }

    async fn count_by_status(&self, status: OutboxStatus) -> Result<u64> {
        let outbox = self.inner.outbox.lock();
        Ok(outbox.entries.values().filter(|e| e.status == status).count() as u64)
    }
}

#[async_trait]
impl IngestStore for InMemoryStore {
    async fn put_raw_with_outbox(
        &self,
        record: &RawDataRecord,
        entry: OutboxEntry,
    ) -> Result<IngestReceipt> {
        let now = self.now();
        let mut raw = self.inner.raw.lock();
        let mut outbox = self.inner.outbox.lock();

        let id = entity_id(&record.tenant_id, &record.entity_key);
        let outcome = check_raw_write(raw.get(&id), record)?;
        if !outcome.is_created() {
            return Ok(IngestReceipt {
                outcome,
                outbox_entry: None,
            });
        }

        raw.entry(id).or_default().insert(record.version, record.clone());
        let stored = outbox.insert(entry, now);
        Ok(IngestReceipt {
            outcome,
            outbox_entry: Some(stored),
        })
    }
}
