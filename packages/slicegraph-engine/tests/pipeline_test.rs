//! End-to-end: ingest → outbox worker → change set → slices → fanout
//!
//! Everything runs against the in-memory store so the whole pipeline is
//! exercised in-process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use slicegraph_engine::{
    CacheConfig, ChangeProcessor, ChangeType, ContractLoader, EngineError, FanoutConfig,
    FanoutDependency, FanoutEngine, FieldMapping, InMemoryContractRegistry, IndexRule,
    IndexValueSource, IngestRequest, IngestService, IngestStatus, OutboxMaintenance,
    OutboxRecomputeTrigger, OutboxWorker, RuleSetContract, RuleSetRef, SliceRule,
    SlicingEngine, StaticRuleSetResolver, WorkerConfig,
};
use slicegraph_storage::{
    InMemoryStore, InvertedIndexStore, OutboxStatus, OutboxStore, SliceStore,
};

fn order_contract() -> RuleSetContract {
    RuleSetContract {
        id: "orders".into(),
        version: "1".into(),
        entity_type: "ORDER".into(),
        slices: vec![
            SliceRule::new(
                "SUMMARY",
                vec![
                    FieldMapping::new("/name").required(),
                    FieldMapping::new("/status").or_default(json!("NEW")),
                ],
            ),
            SliceRule::new(
                "DETAIL",
                vec![
                    FieldMapping::new("/items").to("/lines"),
                    FieldMapping::new("/brand"),
                ],
            ),
        ],
        indexes: vec![IndexRule::new("brand", "/brand")],
        impact_map: BTreeMap::from([
            (
                "SUMMARY".to_string(),
                vec!["/name".to_string(), "/status".to_string()],
            ),
            (
                "DETAIL".to_string(),
                vec!["/items".to_string(), "/brand".to_string()],
            ),
        ]),
    }
}

fn brand_contract() -> RuleSetContract {
    RuleSetContract {
        id: "brands".into(),
        version: "1".into(),
        entity_type: "BRAND".into(),
        slices: vec![SliceRule::new(
            "CORE",
            vec![FieldMapping::new("/name").required()],
        )],
        indexes: Vec::new(),
        impact_map: BTreeMap::from([("CORE".to_string(), vec!["/name".to_string()])]),
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    ingest: IngestService,
    processor: Arc<ChangeProcessor>,
    worker: OutboxWorker,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());

        let registry = Arc::new(InMemoryContractRegistry::new());
        registry.register(order_contract());
        registry.register(brand_contract());
        let loader = Arc::new(ContractLoader::new(registry, &CacheConfig::default()));

        let dependency = FanoutDependency::new(
            "brand-orders",
            "BRAND",
            "ORDER",
            "brand",
            IndexValueSource::EntityKey,
        )
        .on_slices(["CORE"]);
        let fanout = Arc::new(FanoutEngine::new(
            FanoutConfig::default(),
            vec![dependency],
            store.clone(),
            store.clone(),
            Arc::new(OutboxRecomputeTrigger::new(store.clone())),
        ));

        let resolver = StaticRuleSetResolver::new()
            .with_default("ORDER", RuleSetRef::new("orders", "1"))
            .with_default("BRAND", RuleSetRef::new("brands", "1"));
        let processor = Arc::new(ChangeProcessor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(SlicingEngine::new(loader)),
            Arc::new(resolver),
            fanout,
        ));

        let worker = OutboxWorker::new(
            store.clone(),
            processor.clone(),
            WorkerConfig {
                workers: 1,
                ..WorkerConfig::default()
            },
        )
        .with_worker_id("worker-test");

        Self {
            ingest: IngestService::new(store.clone()),
            store,
            processor,
            worker,
        }
    }

    async fn put(&self, key: &str, entity_type: &str, version: i64, payload: serde_json::Value) {
        self.ingest
            .ingest(IngestRequest::new("t1", key, entity_type, version, payload))
            .await
            .unwrap();
    }

    /// Run the worker until the outbox has nothing claimable.
    async fn drain(&self) -> usize {
        let mut total = 0;
        loop {
            let report = self.worker.run_once().await.unwrap();
            if report.claimed == 0 {
                return total;
            }
            total += report.claimed;
        }
    }
}

#[tokio::test]
async fn test_name_change_updates_only_summary() {
    let h = Harness::new();
    h.put("o-1", "ORDER", 1, json!({"name": "A", "items": [1], "brand": "acme"}))
        .await;
    h.drain().await;

    let v1 = h.store.list_slices("t1", "o-1", 1).await.unwrap();
    assert_eq!(v1.len(), 2);

    h.put("o-1", "ORDER", 2, json!({"name": "B", "items": [1], "brand": "acme"}))
        .await;
    h.drain().await;

    let v2 = h.store.list_slices("t1", "o-1", 2).await.unwrap();
    assert_eq!(v2.len(), 1);
    assert_eq!(v2[0].slice_type, "SUMMARY");
    assert_eq!(v2[0].payload, json!({"name": "B", "status": "NEW"}));

    // DETAIL is still served from v1
    let detail = h
        .store
        .get_latest_slice("t1", "o-1", "DETAIL")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detail.version, 1);
    assert_eq!(detail.payload, json!({"lines": [1], "brand": "acme"}));

    // Reprocessing is a no-op and reports the same change set
    let report = h.processor.process_ingested("t1", "o-1", 2).await.unwrap();
    assert_eq!(report.change_set.change_type, ChangeType::Update);
    assert_eq!(report.change_set.paths().collect::<Vec<_>>(), vec!["/name"]);
    assert_eq!(
        report.change_set.impacted_slice_types,
        BTreeSet::from(["SUMMARY".to_string()])
    );
    assert_eq!(report.slices.written, 0);
}

#[tokio::test]
async fn test_duplicate_and_conflicting_ingest() {
    let h = Harness::new();
    let request = IngestRequest::new("t1", "o-1", "ORDER", 1, json!({"name": "A"}));

    let first = h.ingest.ingest(request.clone()).await.unwrap();
    let again = h.ingest.ingest(request).await.unwrap();
    assert_eq!(first.status, IngestStatus::Created);
    assert_eq!(again.status, IngestStatus::AlreadyApplied);
    assert_eq!(first.payload_hash, again.payload_hash);

    let conflict = h
        .ingest
        .ingest(IngestRequest::new("t1", "o-1", "ORDER", 1, json!({"name": "Z"})))
        .await;
    assert!(matches!(conflict, Err(EngineError::IdempotencyViolation(_))));

    assert_eq!(h.drain().await, 1);
}

#[tokio::test]
async fn test_versions_of_one_entity_are_processed_in_order() {
    let h = Harness::new();
    h.put("o-1", "ORDER", 1, json!({"name": "A"})).await;
    h.put("o-1", "ORDER", 2, json!({"name": "B"})).await;
    h.put("o-2", "ORDER", 1, json!({"name": "C"})).await;

    // v2 of o-1 waits for v1
    let first = h.worker.run_once().await.unwrap();
    assert_eq!(first.claimed, 2);
    let second = h.worker.run_once().await.unwrap();
    assert_eq!(second.claimed, 1);
    assert_eq!(second.processed, 1);

    let summary = h
        .store
        .get_latest_slice("t1", "o-1", "SUMMARY")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.version, 2);
    assert_eq!(summary.payload["name"], json!("B"));
}

#[tokio::test]
async fn test_brand_change_fans_out_to_orders() {
    let h = Harness::new();
    h.put("o-1", "ORDER", 1, json!({"name": "A", "brand": "acme"})).await;
    h.put("o-2", "ORDER", 1, json!({"name": "B", "brand": "acme"})).await;
    h.put("o-3", "ORDER", 1, json!({"name": "C", "brand": "other"})).await;
    h.drain().await;
    assert_eq!(h.store.count("t1", "brand", "acme").await.unwrap(), 2);

    h.put("acme", "BRAND", 1, json!({"name": "Acme Corp"})).await;
    // brand raw.ingested, then the two recomputes it enqueued
    assert_eq!(h.drain().await, 3);

    let processed = h.store.count_by_status(OutboxStatus::Processed).await.unwrap();
    assert_eq!(processed, 6);
    assert_eq!(h.store.count_by_status(OutboxStatus::Pending).await.unwrap(), 0);

    let fanout = h.processor.fanout();
    assert_eq!(fanout.jobs_with_status("completed").len(), 1);
}

#[tokio::test]
async fn test_delete_tombstones_slices_and_clears_index() {
    let h = Harness::new();
    h.put("o-1", "ORDER", 1, json!({"name": "A", "brand": "acme"})).await;
    h.put("o-2", "ORDER", 1, json!({"name": "B", "brand": "acme"})).await;
    h.drain().await;

    let deleted = h.ingest.delete("t1", "o-2", "ORDER", 2).await.unwrap();
    assert_eq!(deleted.status, IngestStatus::Created);
    h.drain().await;

    let slices = h.store.list_slices("t1", "o-2", 2).await.unwrap();
    assert_eq!(slices.len(), 2);
    assert!(slices.iter().all(|s| s.tombstone && s.payload.is_null()));
    assert_eq!(h.store.count("t1", "brand", "acme").await.unwrap(), 1);
}

#[tokio::test]
async fn test_poison_entry_lands_in_dlq_without_blocking_others() {
    let h = Harness::new();
    // Missing required /name
    h.put("o-bad", "ORDER", 1, json!({"brand": "acme"})).await;
    h.put("o-good", "ORDER", 1, json!({"name": "G"})).await;

    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);

    let failed = h.store.find_pending(10, None).await.unwrap();
    assert!(failed.is_empty());

    let maintenance = OutboxMaintenance::new(h.store.clone(), Duration::from_secs(300), 1);
    let sweep = maintenance.sweep().await.unwrap();
    assert_eq!(sweep.dead_lettered, 1);

    let dlq = h.store.find_dlq(10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].aggregate_id, "t1:o-bad");
    assert!(dlq[0]
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .starts_with("[permanent]"));
}
