//! Downstream trigger port
//!
//! The fanout engine hands each batch of discovered entities to a
//! `DownstreamTrigger`. The default implementation enqueues one idempotent
//! `entity.recompute` outbox entry per downstream entity.

use std::sync::Arc;

use async_trait::async_trait;
use slicegraph_storage::{OutboxEntry, OutboxStore};
use tracing::debug;

use super::config::FanoutPriority;
use crate::error::Result;
use crate::events::{aggregate_id, OutboxEvent, UpstreamRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamTarget {
    pub tenant_id: String,
    pub entity_key: String,
    pub entity_type: String,
    pub upstream: UpstreamRef,
}

#[async_trait]
pub trait DownstreamTrigger: Send + Sync {
    async fn trigger(&self, targets: &[DownstreamTarget], priority: FanoutPriority) -> Result<()>;
}

pub struct OutboxRecomputeTrigger {
    outbox: Arc<dyn OutboxStore>,
}

impl OutboxRecomputeTrigger {
    pub fn new(outbox: Arc<dyn OutboxStore>) -> Self {
        Self { outbox }
    }

    fn idempotency_key(target: &DownstreamTarget) -> String {
        format!(
            "recompute:{}:{}:{}:{}:{}",
            target.tenant_id,
            target.entity_key,
            target.upstream.dependency,
            target.upstream.entity_key,
            target.upstream.version
        )
    }
}

#[async_trait]
impl DownstreamTrigger for OutboxRecomputeTrigger {
    async fn trigger(&self, targets: &[DownstreamTarget], priority: FanoutPriority) -> Result<()> {
        let entries = targets
            .iter()
            .map(|target| {
                let event = OutboxEvent::EntityRecompute {
                    tenant_id: target.tenant_id.clone(),
                    entity_key: target.entity_key.clone(),
                    entity_type: target.entity_type.clone(),
                    upstream: target.upstream.clone(),
                };
                Ok(OutboxEntry::new(
                    Self::idempotency_key(target),
                    target.entity_type.clone(),
                    aggregate_id(&target.tenant_id, &target.entity_key),
                    event.event_type(),
                    event.to_payload()?,
                )
                .with_priority(priority.outbox_priority()))
            })
            .collect::<Result<Vec<_>>>()?;

        let count = entries.len();
        self.outbox.insert_all(entries).await?;
        debug!(count, priority = priority.as_str(), "enqueued downstream recomputes");
        Ok(())
    }
}
