//! Typed outbox event payloads

use serde::{Deserialize, Serialize};
use slicegraph_storage::OutboxEntry;

use crate::error::{EngineError, Result};
use crate::fanout::FanoutRequest;

pub const EVENT_RAW_INGESTED: &str = "raw.ingested";
pub const EVENT_ENTITY_RECOMPUTE: &str = "entity.recompute";
pub const EVENT_FANOUT_ASYNC: &str = "fanout.async";

/// Aggregate type of background fanout entries
pub const FANOUT_AGGREGATE: &str = "FANOUT";

/// Upstream change that caused a recompute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamRef {
    pub dependency: String,
    pub entity_type: String,
    pub entity_key: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboxEvent {
    RawIngested {
        tenant_id: String,
        entity_key: String,
        entity_type: String,
        version: i64,
        payload_hash: String,
    },
    EntityRecompute {
        tenant_id: String,
        entity_key: String,
        entity_type: String,
        upstream: UpstreamRef,
    },
    FanoutAsync(FanoutRequest),
}

impl OutboxEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            OutboxEvent::RawIngested { .. } => EVENT_RAW_INGESTED,
            OutboxEvent::EntityRecompute { .. } => EVENT_ENTITY_RECOMPUTE,
            OutboxEvent::FanoutAsync(_) => EVENT_FANOUT_ASYNC,
        }
    }

    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode an entry's payload, checking it against `event_type`.
    pub fn from_entry(entry: &OutboxEntry) -> Result<Self> {
        let event: OutboxEvent = serde_json::from_value(entry.payload.clone())?;
        if event.event_type() != entry.event_type {
            return Err(EngineError::validation(format!(
                "outbox entry {} has event_type {} but payload of {}",
                entry.id,
                entry.event_type,
                event.event_type()
            )));
        }
        Ok(event)
    }
}

/// Outbox aggregate id for an entity: tenants never share an ordering lane.
pub fn aggregate_id(tenant_id: &str, entity_key: &str) -> String {
    format!("{}:{}", tenant_id, entity_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::FanoutPriority;

    #[test]
    fn test_event_roundtrip_through_entry() {
        let event = OutboxEvent::RawIngested {
            tenant_id: "t1".into(),
            entity_key: "o-1".into(),
            entity_type: "ORDER".into(),
            version: 1,
            payload_hash: "sha256:00".into(),
        };
        let entry = OutboxEntry::new(
            "raw:t1:o-1:1",
            "ORDER",
            aggregate_id("t1", "o-1"),
            event.event_type(),
            event.to_payload().unwrap(),
        );
        assert_eq!(OutboxEvent::from_entry(&entry).unwrap(), event);
    }

    #[test]
    fn test_event_type_mismatch_rejected() {
        let event = OutboxEvent::FanoutAsync(FanoutRequest {
            tenant_id: "t1".into(),
            dependency: "d".into(),
            upstream_entity_type: "BRAND".into(),
            upstream_entity_key: "acme".into(),
            upstream_version: 1,
            index_value: "acme".into(),
            priority: FanoutPriority::Background,
        });
        let entry = OutboxEntry::new(
            "k",
            FANOUT_AGGREGATE,
            "d",
            EVENT_RAW_INGESTED,
            event.to_payload().unwrap(),
        );
        assert!(OutboxEvent::from_entry(&entry).is_err());
    }
}
