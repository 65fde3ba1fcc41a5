//! Ingest: raw write + `raw.ingested` outbox entry in one unit
//!
//! Retrying an ingest with the same content is a no-op (`AlreadyApplied`); the
//! same version with different content is an `IdempotencyViolation`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use slicegraph_storage::{IngestStore, OutboxEntry, PutOutcome, RawDataRecord};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::events::{aggregate_id, OutboxEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub tenant_id: String,
    pub entity_key: String,
    pub entity_type: String,
    pub version: i64,
    pub payload: Value,
}

impl IngestRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        entity_key: impl Into<String>,
        entity_type: impl Into<String>,
        version: i64,
        payload: Value,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            entity_key: entity_key.into(),
            entity_type: entity_type.into(),
            version,
            payload,
        }
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("tenant_id", &self.tenant_id),
            ("entity_key", &self.entity_key),
            ("entity_type", &self.entity_type),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::validation(format!("{} must not be empty", field)));
            }
        }
        if self.version < 1 {
            return Err(EngineError::validation(format!(
                "version must be >= 1, got {}",
                self.version
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestStatus {
    Created,
    /// Identical content was already stored for this version
    AlreadyApplied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    pub status: IngestStatus,
    pub payload_hash: String,
    pub outbox_id: Option<Uuid>,
}

pub struct IngestService {
    store: Arc<dyn IngestStore>,
}

impl IngestService {
    pub fn new(store: Arc<dyn IngestStore>) -> Self {
        Self { store }
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestResult> {
        request.validate()?;
        let record = RawDataRecord::new(
            request.tenant_id,
            request.entity_key,
            request.entity_type,
            request.version,
            request.payload,
        );
        self.write(record).await
    }

    /// Record a deletion as a tombstone version.
    pub async fn delete(
        &self,
        tenant_id: &str,
        entity_key: &str,
        entity_type: &str,
        version: i64,
    ) -> Result<IngestResult> {
        IngestRequest::new(tenant_id, entity_key, entity_type, version, Value::Null).validate()?;
        self.write(RawDataRecord::tombstone(
            tenant_id,
            entity_key,
            entity_type,
            version,
        ))
        .await
    }

    async fn write(&self, record: RawDataRecord) -> Result<IngestResult> {
        let event = OutboxEvent::RawIngested {
            tenant_id: record.tenant_id.clone(),
            entity_key: record.entity_key.clone(),
            entity_type: record.entity_type.clone(),
            version: record.version,
            payload_hash: record.payload_hash.clone(),
        };
        let entry = OutboxEntry::new(
            format!(
                "raw:{}:{}:{}",
                record.tenant_id, record.entity_key, record.version
            ),
            record.entity_type.clone(),
            aggregate_id(&record.tenant_id, &record.entity_key),
            event.event_type(),
            event.to_payload()?,
        )
        .with_entity_version(record.version);

        let receipt = self.store.put_raw_with_outbox(&record, entry).await?;
        let status = match receipt.outcome {
            PutOutcome::Created => IngestStatus::Created,
            PutOutcome::AlreadyApplied => IngestStatus::AlreadyApplied,
        };

        match status {
            IngestStatus::Created => info!(
                entity = %record.display_id(),
                tombstone = record.is_tombstone(),
                payload_hash = %record.payload_hash,
                "raw data ingested"
            ),
            IngestStatus::AlreadyApplied => debug!(entity = %record.display_id(), "duplicate ingest"),
        }

        Ok(IngestResult {
            status,
            payload_hash: record.payload_hash,
            outbox_id: receipt.outbox_entry.map(|e| e.id),
        })
    }
}
