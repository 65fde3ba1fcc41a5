//! PostgreSQL storage adapter
//!
//! - Connection pooling: `PgPool`
//! - Claims: `FOR UPDATE SKIP LOCKED`, so concurrent workers never block on
//!   or double-claim the same row
//! - Per-entity writes serialize on a transaction-scoped advisory lock
//! - Schema: `migrations/0001_slicegraph.sql` (apply with `sqlx migrate run`)

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{
    ClaimOrder, ClaimRequest, IndexQuery, IngestReceipt, IngestStore, InvertedIndexEntry,
    InvertedIndexStore, OutboxEntry, OutboxStatus, OutboxStore, Page, PutOutcome, RawDataRecord,
    RawDataStore, SliceRecord, SliceStore,
};
use crate::{Result, StorageError};

const RAW_COLUMNS: &str =
    "tenant_id, entity_key, entity_type, version, payload, payload_hash, created_at";

const SLICE_COLUMNS: &str = "tenant_id, entity_key, entity_type, version, slice_type, payload, \
     slice_hash, rule_set_id, rule_set_version, tombstone";

const INDEX_COLUMNS: &str =
    "tenant_id, index_type, index_value, entity_key, entity_type, current_version";

const OUTBOX_COLUMNS: &str = "id, seq, idempotency_key, aggregate_type, aggregate_id, event_type, \
     payload, status, retry_count, priority, entity_version, claimed_at, claimed_by, created_at, \
     updated_at, processed_at, failure_reason";

/// Connection pool settings
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl PostgresConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 20,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// PostgreSQL backend for every storage port
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|e| {
                StorageError::database(format!("Failed to connect to PostgreSQL: {}", e))
                    .with_source(e)
            })?;
        info!(max_connections = config.max_connections, "connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Row mapping
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn row_to_raw(row: &PgRow) -> Result<RawDataRecord> {
        Ok(RawDataRecord {
            tenant_id: row.try_get("tenant_id")?,
            entity_key: row.try_get("entity_key")?,
            entity_type: row.try_get("entity_type")?,
            version: row.try_get("version")?,
            payload: row.try_get("payload")?,
            payload_hash: row.try_get("payload_hash")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_slice(row: &PgRow) -> Result<SliceRecord> {
        Ok(SliceRecord {
            tenant_id: row.try_get("tenant_id")?,
            entity_key: row.try_get("entity_key")?,
            entity_type: row.try_get("entity_type")?,
            version: row.try_get("version")?,
            slice_type: row.try_get("slice_type")?,
            payload: row.try_get("payload")?,
            slice_hash: row.try_get("slice_hash")?,
            rule_set_id: row.try_get("rule_set_id")?,
            rule_set_version: row.try_get("rule_set_version")?,
            tombstone: row.try_get("tombstone")?,
        })
    }

    fn row_to_index_entry(row: &PgRow) -> Result<InvertedIndexEntry> {
        Ok(InvertedIndexEntry {
            tenant_id: row.try_get("tenant_id")?,
            index_type: row.try_get("index_type")?,
            index_value: row.try_get("index_value")?,
            entity_key: row.try_get("entity_key")?,
            entity_type: row.try_get("entity_type")?,
            current_version: row.try_get("current_version")?,
        })
    }

    fn row_to_outbox(row: &PgRow) -> Result<OutboxEntry> {
        let status: String = row.try_get("status")?;
        Ok(OutboxEntry {
            id: row.try_get("id")?,
            sequence: row.try_get("seq")?,
            idempotency_key: row.try_get("idempotency_key")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: OutboxStatus::from_str(&status)?,
            retry_count: row.try_get("retry_count")?,
            priority: row.try_get("priority")?,
            entity_version: row.try_get("entity_version")?,
            claimed_at: row.try_get("claimed_at")?,
            claimed_by: row.try_get("claimed_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            processed_at: row.try_get("processed_at")?,
            failure_reason: row.try_get("failure_reason")?,
        })
    }

    fn rows_to_outbox(rows: &[PgRow]) -> Result<Vec<OutboxEntry>> {
        rows.iter().map(Self::row_to_outbox).collect()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Shared statements (run on a pooled connection or inside a transaction)
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn lock_entity(conn: &mut PgConnection, scope: &str, tenant_id: &str, key: &str) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{}:{}:{}", scope, tenant_id, key))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn put_raw_on(conn: &mut PgConnection, record: &RawDataRecord) -> Result<PutOutcome> {
        Self::lock_entity(conn, "raw", &record.tenant_id, &record.entity_key).await?;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT payload_hash FROM raw_data WHERE tenant_id = $1 AND entity_key = $2 AND version = $3",
        )
        .bind(&record.tenant_id)
        .bind(&record.entity_key)
        .bind(record.version)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(hash) = existing {
            if hash == record.payload_hash {
                return Ok(PutOutcome::AlreadyApplied);
            }
            return Err(StorageError::idempotency_violation(format!(
                "raw {} already stored with hash {}, got {}",
                record.display_id(),
                hash,
                record.payload_hash
            )));
        }

        let latest: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version) FROM raw_data WHERE tenant_id = $1 AND entity_key = $2",
        )
        .bind(&record.tenant_id)
        .bind(&record.entity_key)
        .fetch_one(&mut *conn)
        .await?;

        if let Some(latest) = latest {
            if record.version < latest {
                return Err(StorageError::validation(format!(
                    "version regression for {}/{}: {} < latest {}",
                    record.tenant_id, record.entity_key, record.version, latest
                )));
            }
        }

        sqlx::query(&format!(
            "INSERT INTO raw_data ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            RAW_COLUMNS
        ))
        .bind(&record.tenant_id)
        .bind(&record.entity_key)
        .bind(&record.entity_type)
        .bind(record.version)
        .bind(&record.payload)
        .bind(&record.payload_hash)
        .bind(record.created_at)
        .execute(&mut *conn)
        .await?;

        Ok(PutOutcome::Created)
    }

    async fn insert_outbox_on(conn: &mut PgConnection, entry: &OutboxEntry) -> Result<OutboxEntry> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO outbox (id, idempotency_key, aggregate_type, aggregate_id, event_type, \
             payload, status, retry_count, priority, entity_version) \
             VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', 0, $7, $8) \
             ON CONFLICT (idempotency_key) DO NOTHING \
             RETURNING {}",
            OUTBOX_COLUMNS
        ))
        .bind(entry.id)
        .bind(&entry.idempotency_key)
        .bind(&entry.aggregate_type)
        .bind(&entry.aggregate_id)
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .bind(entry.priority)
        .bind(entry.entity_version)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = inserted {
            return Self::row_to_outbox(&row);
        }

        let row = sqlx::query(&format!(
            "SELECT {} FROM outbox WHERE idempotency_key = $1",
            OUTBOX_COLUMNS
        ))
        .bind(&entry.idempotency_key)
        .fetch_one(&mut *conn)
        .await?;
        Self::row_to_outbox(&row)
    }
}

fn claim_order_sql(order: ClaimOrder) -> &'static str {
    match order {
        ClaimOrder::Fifo => "o.seq",
        ClaimOrder::Priority => "o.priority, o.seq",
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Raw data
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl RawDataStore for PostgresStore {
    async fn put_idempotent(&self, record: &RawDataRecord) -> Result<PutOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = Self::put_raw_on(&mut tx, record).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn get(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
    ) -> Result<Option<RawDataRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM raw_data WHERE tenant_id = $1 AND entity_key = $2 AND version = $3",
            RAW_COLUMNS
        ))
        .bind(tenant_id)
        .bind(entity_key)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_raw).transpose()
    }

    async fn get_latest(&self, tenant_id: &str, entity_key: &str) -> Result<Option<RawDataRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM raw_data WHERE tenant_id = $1 AND entity_key = $2 \
             ORDER BY version DESC LIMIT 1",
            RAW_COLUMNS
        ))
        .bind(tenant_id)
        .bind(entity_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_raw).transpose()
    }

    async fn get_previous(
        &self,
        tenant_id: &str,
        entity_key: &str,
        before_version: i64,
    ) -> Result<Option<RawDataRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM raw_data WHERE tenant_id = $1 AND entity_key = $2 AND version < $3 \
             ORDER BY version DESC LIMIT 1",
            RAW_COLUMNS
        ))
        .bind(tenant_id)
        .bind(entity_key)
        .bind(before_version)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_raw).transpose()
    }

    async fn batch_get_latest(
        &self,
        tenant_id: &str,
        entity_keys: &[String],
    ) -> Result<Vec<RawDataRecord>> {
        if entity_keys.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT ON (entity_key) {} FROM raw_data \
             WHERE tenant_id = $1 AND entity_key = ANY($2) \
             ORDER BY entity_key, version DESC",
            RAW_COLUMNS
        ))
        .bind(tenant_id)
        .bind(entity_keys)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_raw).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Slices
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl SliceStore for PostgresStore {
    async fn put_slices(&self, slices: &[SliceRecord]) -> Result<Vec<PutOutcome>> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(slices.len());

        for slice in slices {
            let existing: Option<String> = sqlx::query_scalar(
                "SELECT slice_hash FROM slices \
                 WHERE tenant_id = $1 AND entity_key = $2 AND version = $3 AND slice_type = $4 \
                 FOR UPDATE",
            )
            .bind(&slice.tenant_id)
            .bind(&slice.entity_key)
            .bind(slice.version)
            .bind(&slice.slice_type)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(hash) if hash == slice.slice_hash => {
                    outcomes.push(PutOutcome::AlreadyApplied);
                    continue;
                }
                Some(hash) => {
                    // Dropping `tx` rolls back the rows written so far
                    return Err(StorageError::idempotency_violation(format!(
                        "slice {}/{}@{}#{} already stored with hash {}, got {}",
                        slice.tenant_id,
                        slice.entity_key,
                        slice.version,
                        slice.slice_type,
                        hash,
                        slice.slice_hash
                    )));
                }
                None => {}
            }

            let result = sqlx::query(&format!(
                "INSERT INTO slices ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (tenant_id, entity_key, version, slice_type) DO NOTHING",
                SLICE_COLUMNS
            ))
            .bind(&slice.tenant_id)
            .bind(&slice.entity_key)
            .bind(&slice.entity_type)
            .bind(slice.version)
            .bind(&slice.slice_type)
            .bind(&slice.payload)
            .bind(&slice.slice_hash)
            .bind(&slice.rule_set_id)
            .bind(&slice.rule_set_version)
            .bind(slice.tombstone)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                // Lost a race with a concurrent writer; its hash decides
                return Err(StorageError::transaction(format!(
                    "concurrent slice write for {}/{}@{}#{}",
                    slice.tenant_id, slice.entity_key, slice.version, slice.slice_type
                )));
            }
            outcomes.push(PutOutcome::Created);
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn get_slice(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
        slice_type: &str,
    ) -> Result<Option<SliceRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM slices \
             WHERE tenant_id = $1 AND entity_key = $2 AND version = $3 AND slice_type = $4",
            SLICE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(entity_key)
        .bind(version)
        .bind(slice_type)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_slice).transpose()
    }

    async fn get_latest_slice(
        &self,
        tenant_id: &str,
        entity_key: &str,
        slice_type: &str,
    ) -> Result<Option<SliceRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM slices \
             WHERE tenant_id = $1 AND entity_key = $2 AND slice_type = $3 \
             ORDER BY version DESC LIMIT 1",
            SLICE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(entity_key)
        .bind(slice_type)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_slice).transpose()
    }

    async fn list_slices(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
    ) -> Result<Vec<SliceRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM slices WHERE tenant_id = $1 AND entity_key = $2 AND version = $3 \
             ORDER BY slice_type",
            SLICE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(entity_key)
        .bind(version)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_slice).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Inverted index
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl InvertedIndexStore for PostgresStore {
    async fn replace_entity_entries(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
        entries: &[InvertedIndexEntry],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        Self::lock_entity(&mut tx, "index", tenant_id, entity_key).await?;

        let indexed: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM inverted_index_versions WHERE tenant_id = $1 AND entity_key = $2",
        )
        .bind(tenant_id)
        .bind(entity_key)
        .fetch_optional(&mut *tx)
        .await?;

        if indexed.is_some_and(|v| v > version) {
            debug!(tenant_id, entity_key, version, "skipping stale index write");
            return Ok(false);
        }

        sqlx::query("DELETE FROM inverted_index WHERE tenant_id = $1 AND entity_key = $2")
            .bind(tenant_id)
            .bind(entity_key)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(&format!(
                "INSERT INTO inverted_index ({}) VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (tenant_id, index_type, index_value, entity_key) DO NOTHING",
                INDEX_COLUMNS
            ))
            .bind(&entry.tenant_id)
            .bind(&entry.index_type)
            .bind(&entry.index_value)
            .bind(&entry.entity_key)
            .bind(&entry.entity_type)
            .bind(entry.current_version)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO inverted_index_versions (tenant_id, entity_key, version) VALUES ($1, $2, $3) \
             ON CONFLICT (tenant_id, entity_key) DO UPDATE SET version = EXCLUDED.version",
        )
        .bind(tenant_id)
        .bind(entity_key)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn query(&self, query: &IndexQuery) -> Result<Page<InvertedIndexEntry>> {
        if query.limit == 0 {
            return Err(StorageError::validation("index query limit must be positive"));
        }
        let rows = sqlx::query(&format!(
            "SELECT {} FROM inverted_index \
             WHERE tenant_id = $1 AND index_type = $2 AND index_value = $3 \
               AND ($4::TEXT IS NULL OR entity_key > $4) \
               AND ($5::TEXT IS NULL OR entity_type = $5) \
               AND ($6::TEXT IS NULL OR entity_key <> $6) \
             ORDER BY entity_key LIMIT $7",
            INDEX_COLUMNS
        ))
        .bind(&query.tenant_id)
        .bind(&query.index_type)
        .bind(&query.index_value)
        .bind(query.after.as_deref())
        .bind(query.entity_type.as_deref())
        .bind(query.exclude_entity_key.as_deref())
        .bind(query.limit as i64 + 1)
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .iter()
            .map(Self::row_to_index_entry)
            .collect::<Result<Vec<_>>>()?;
        let next_cursor = if items.len() > query.limit {
            items.truncate(query.limit);
            items.last().map(|e| e.entity_key.clone())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn count(&self, tenant_id: &str, index_type: &str, index_value: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM inverted_index \
             WHERE tenant_id = $1 AND index_type = $2 AND index_value = $3",
        )
        .bind(tenant_id)
        .bind(index_type)
        .bind(index_value)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_matching(&self, query: &IndexQuery) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM inverted_index \
             WHERE tenant_id = $1 AND index_type = $2 AND index_value = $3 \
               AND ($4::TEXT IS NULL OR entity_type = $4) \
               AND ($5::TEXT IS NULL OR entity_key <> $5)",
        )
        .bind(&query.tenant_id)
        .bind(&query.index_type)
        .bind(&query.index_value)
        .bind(query.entity_type.as_deref())
        .bind(query.exclude_entity_key.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Outbox
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl OutboxStore for PostgresStore {
    async fn insert(&self, entry: OutboxEntry) -> Result<OutboxEntry> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_outbox_on(&mut conn, &entry).await
    }

    async fn insert_all(&self, entries: Vec<OutboxEntry>) -> Result<Vec<OutboxEntry>> {
        let mut tx = self.pool.begin().await?;
        let mut stored = Vec::with_capacity(entries.len());
        for entry in &entries {
            stored.push(Self::insert_outbox_on(&mut tx, entry).await?);
        }
        tx.commit().await?;
        Ok(stored)
    }

    async fn find_pending_after(
        &self,
        after_sequence: Option<i64>,
        limit: usize,
        aggregate_type: Option<&str>,
    ) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM outbox \
             WHERE status = 'PENDING' AND seq > $1 AND ($2::TEXT IS NULL OR aggregate_type = $2) \
             ORDER BY seq LIMIT $3",
            OUTBOX_COLUMNS
        ))
        .bind(after_sequence.unwrap_or(0))
        .bind(aggregate_type)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Self::rows_to_outbox(&rows)
    }

    async fn claim_with(&self, request: &ClaimRequest) -> Result<Vec<OutboxEntry>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "WITH candidates AS ( \
                SELECT o.id FROM outbox o \
                WHERE o.status = 'PENDING' \
                  AND ($2::TEXT IS NULL OR o.aggregate_type = $2) \
                  AND (NOT $3 OR NOT EXISTS ( \
                        SELECT 1 FROM outbox p \
                        WHERE p.aggregate_type = o.aggregate_type \
                          AND p.aggregate_id = o.aggregate_id \
                          AND p.status IN ('PENDING', 'PROCESSING') \
                          AND (COALESCE(p.entity_version, 0), p.created_at, p.seq) \
                            < (COALESCE(o.entity_version, 0), o.created_at, o.seq))) \
                ORDER BY {order} \
                LIMIT $1 \
                FOR UPDATE OF o SKIP LOCKED \
             ) \
             UPDATE outbox SET status = 'PROCESSING', claimed_at = NOW(), claimed_by = $4, \
                updated_at = NOW() \
             FROM candidates WHERE outbox.id = candidates.id \
             RETURNING {columns}",
            order = claim_order_sql(request.order),
            columns = OUTBOX_COLUMNS
                .split(", ")
                .map(|c| format!("outbox.{}", c))
                .collect::<Vec<_>>()
                .join(", "),
        );

        let rows = sqlx::query(&sql)
            .bind(request.limit as i64)
            .bind(request.aggregate_type.as_deref())
            .bind(request.causal)
            .bind(request.worker_id.as_deref())
            .fetch_all(&self.pool)
            .await?;

        let mut claimed = Self::rows_to_outbox(&rows)?;
        match request.order {
            ClaimOrder::Fifo => claimed.sort_by_key(|e| e.sequence),
            ClaimOrder::Priority => claimed.sort_by_key(|e| (e.priority, e.sequence)),
        }
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
        let result = sqlx::query(
            "UPDATE outbox SET status = 'PROCESSED', processed_at = NOW(), updated_at = NOW() \
             WHERE id = ANY($1) AND status = 'PROCESSING' \
               AND claimed_by IS NOT DISTINCT FROM $2",
        )
        .bind(ids)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_failed(&self, id: Uuid, worker_id: Option<&str>, reason: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'FAILED', retry_count = retry_count + 1, \
             failure_reason = $3, claimed_at = NULL, claimed_by = NULL, updated_at = NOW() \
             WHERE id = $1 AND status = 'PROCESSING' AND claimed_by IS NOT DISTINCT FROM $2",
        )
        .bind(id)
        .bind(worker_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.find_by_id(id).await? {
            None => Err(StorageError::not_found(format!("outbox entry {}", id))),
            Some(entry) if entry.status != OutboxStatus::Processing => {
                Err(StorageError::validation(format!(
                    "cannot fail outbox entry {} in status {}",
                    id, entry.status
                )))
            }
            Some(entry) => Err(StorageError::validation(format!(
                "outbox entry {} is claimed by {}",
                id,
                entry.claimed_by.as_deref().unwrap_or("-")
            ))),
        }
    }

    async fn reset_to_pending(&self, ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'PENDING', claimed_at = NULL, claimed_by = NULL, \
             updated_at = NOW() WHERE id = ANY($1) AND status = 'FAILED'",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reset_all_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'PENDING', claimed_at = NULL, claimed_by = NULL, \
             updated_at = NOW() WHERE status = 'FAILED'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn release_expired_claims(&self, visibility_timeout: Duration) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'PENDING', claimed_at = NULL, claimed_by = NULL, \
             updated_at = NOW() \
             WHERE status = 'PROCESSING' \
               AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $1))",
        )
        .bind(visibility_timeout.as_secs_f64())
        .execute(&self.pool)
        .await?;
        let released = result.rows_affected();
        if released > 0 {
            debug!(released, "released expired outbox claims");
        }
        Ok(released)
    }

    async fn move_to_dlq(&self, max_retry_count: i32) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'DLQ', updated_at = NOW() \
             WHERE status = 'FAILED' AND retry_count >= $1",
        )
        .bind(max_retry_count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_dlq(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM outbox WHERE status = 'DLQ' ORDER BY seq LIMIT $1",
            OUTBOX_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Self::rows_to_outbox(&rows)
    }

    async fn replay_from_dlq(&self, ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'PENDING', retry_count = 0, failure_reason = NULL, \
             claimed_at = NULL, claimed_by = NULL, updated_at = NOW() \
             WHERE id = ANY($1) AND status = 'DLQ'",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxEntry>> {
        let row = sqlx::query(&format!("SELECT {} FROM outbox WHERE id = $1", OUTBOX_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_outbox).transpose()
    }

    async fn count_by_status(&self, status: OutboxStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl IngestStore for PostgresStore {
    async fn put_raw_with_outbox(
        &self,
        record: &RawDataRecord,
        entry: OutboxEntry,
    ) -> Result<IngestReceipt> {
        let mut tx = self.pool.begin().await?;
        let outcome = Self::put_raw_on(&mut tx, record).await?;
        if !outcome.is_created() {
            tx.rollback().await?;
            return Ok(IngestReceipt {
                outcome,
                outbox_entry: None,
            });
        }
        let stored = Self::insert_outbox_on(&mut tx, &entry).await?;
        tx.commit().await?;
        Ok(IngestReceipt {
            outcome,
            outbox_entry: Some(stored),
        })
    }
}
