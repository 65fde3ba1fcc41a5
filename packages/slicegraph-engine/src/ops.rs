//! Operator actions: retries, dead-letter replay, cache control, status
//! counts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use slicegraph_storage::{OutboxEntry, OutboxStatus, OutboxStore};
use tracing::info;
use uuid::Uuid;

use crate::cache::{CacheStats, ContractLoader};
use crate::contract::RuleSetRef;
use crate::error::Result;
use crate::fanout::{FanoutEngine, FanoutJob, FanoutOutcome};

pub struct OpsService {
    outbox: Arc<dyn OutboxStore>,
    loader: Arc<ContractLoader>,
    fanout: Arc<FanoutEngine>,
}

impl OpsService {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        loader: Arc<ContractLoader>,
        fanout: Arc<FanoutEngine>,
    ) -> Self {
        Self {
            outbox,
            loader,
            fanout,
        }
    }

    pub async fn retry_failed(&self, ids: &[Uuid]) -> Result<u64> {
        let reset = self.outbox.reset_to_pending(ids).await?;
        info!(requested = ids.len(), reset, "retrying failed outbox entries");
        Ok(reset)
    }

    pub async fn retry_all_failed(&self) -> Result<u64> {
        let reset = self.outbox.reset_all_failed().await?;
        info!(reset, "retrying all failed outbox entries");
        Ok(reset)
    }

    pub async fn dlq(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        Ok(self.outbox.find_dlq(limit).await?)
    }

    /// Move dead-lettered entries back to PENDING with a fresh retry budget.
    pub async fn replay_dlq(&self, ids: &[Uuid]) -> Result<u64> {
        let replayed = self.outbox.replay_from_dlq(ids).await?;
        info!(requested = ids.len(), replayed, "replayed dead-lettered entries");
        Ok(replayed)
    }

    pub async fn release_stale(&self, visibility_timeout: Duration) -> Result<u64> {
        Ok(self.outbox.release_expired_claims(visibility_timeout).await?)
    }

    pub fn invalidate_contract(&self, rule_set: Option<&RuleSetRef>) {
        match rule_set {
            Some(r) => {
                let removed = self.loader.invalidate(r);
                info!(rule_set = %r, removed, "contract cache entry invalidated");
            }
            None => {
                self.loader.invalidate_all();
                info!("contract cache cleared");
            }
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.loader.stats()
    }

    pub fn fanout_job(&self, id: Uuid) -> Option<FanoutJob> {
        self.fanout.job(id)
    }

    pub async fn retry_fanout_job(&self, id: Uuid) -> Result<FanoutOutcome> {
        self.fanout.retry_job(id).await
    }

    pub async fn outbox_counts(&self) -> Result<BTreeMap<&'static str, u64>> {
        let mut counts = BTreeMap::new();
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Processed,
            OutboxStatus::Failed,
            OutboxStatus::Dlq,
        ] {
            counts.insert(status.as_str(), self.outbox.count_by_status(status).await?);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::contract::fixtures::order_contract;
    use crate::contract::InMemoryContractRegistry;
    use crate::fanout::{FanoutConfig, OutboxRecomputeTrigger};
    use serde_json::json;
    use slicegraph_storage::{ClaimRequest, InMemoryStore};

    fn ops(store: Arc<InMemoryStore>, registry: Arc<InMemoryContractRegistry>) -> OpsService {
        let loader = Arc::new(ContractLoader::new(registry, &CacheConfig::default()));
        let fanout = Arc::new(FanoutEngine::new(
            FanoutConfig::default(),
            Vec::new(),
            store.clone(),
            store.clone(),
            Arc::new(OutboxRecomputeTrigger::new(store.clone())),
        ));
        OpsService::new(store, loader, fanout)
    }

    #[tokio::test]
    async fn test_dlq_replay_and_counts() {
        let store = Arc::new(InMemoryStore::new());
        let ops = ops(store.clone(), Arc::new(InMemoryContractRegistry::new()));

        let entry = store
            .insert(OutboxEntry::new("k", "ORDER", "t1:o-1", "raw.ingested", json!({})))
            .await
            .unwrap();
        store.claim_with(&ClaimRequest::new(1)).await.unwrap();
        store.mark_failed(entry.id, None, "[permanent] boom").await.unwrap();
        store.move_to_dlq(1).await.unwrap();

        let counts = ops.outbox_counts().await.unwrap();
        assert_eq!(counts["DLQ"], 1);
        assert_eq!(counts["PENDING"], 0);

        assert_eq!(ops.dlq(10).await.unwrap().len(), 1);
        assert_eq!(ops.replay_dlq(&[entry.id]).await.unwrap(), 1);
        let replayed = store.find_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(replayed.status, OutboxStatus::Pending);
        assert_eq!(replayed.retry_count, 0);
    }

    #[tokio::test]
    async fn test_invalidate_contract_forces_reload() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(InMemoryContractRegistry::new());
        registry.register(order_contract());
        let ops = ops(store, registry.clone());

        let r = RuleSetRef::new("orders", "1");
        ops.loader.load(&r).await.unwrap();
        ops.invalidate_contract(Some(&r));
        ops.loader.load(&r).await.unwrap();
        assert_eq!(registry.load_count(), 2);
        assert_eq!(ops.cache_stats().misses, 2);
    }
}
