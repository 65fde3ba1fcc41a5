//! Fanout engine integration tests
//!
//! Covers batching, the circuit breaker actions, deduplication, retry,
//! timeout, concurrency limits and priority admission against the in-memory
//! index.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use slicegraph_engine::{
    CircuitBreakerAction, DownstreamTarget, DownstreamTrigger, EngineError, ErrorCategory,
    FanoutConfig, FanoutDependency, FanoutEngine, FanoutJobState, FanoutOutcome, FanoutPolicy,
    FanoutPriority, FanoutRequest, IndexValueSource, OutboxEvent, RetryConfig,
};
use slicegraph_storage::{
    InMemoryStore, InvertedIndexEntry, InvertedIndexStore, OutboxStatus, OutboxStore,
};

#[derive(Default)]
struct RecordingTrigger {
    batches: Mutex<Vec<Vec<String>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Fail this many calls with a transient error first
    transient_failures: AtomicUsize,
    permanent_failure: bool,
    delay: Option<Duration>,
}

impl RecordingTrigger {
    fn triggered_keys(&self) -> Vec<String> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl DownstreamTrigger for RecordingTrigger {
    async fn trigger(
        &self,
        targets: &[DownstreamTarget],
        _priority: FanoutPriority,
    ) -> slicegraph_engine::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.permanent_failure {
            return Err(EngineError::validation("downstream rejected batch"));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::ExternalService("downstream unavailable".into()));
        }

        self.batches
            .lock()
            .push(targets.iter().map(|t| t.entity_key.clone()).collect());
        Ok(())
    }
}

fn policy() -> FanoutPolicy {
    FanoutPolicy {
        batch_size: 100,
        batch_delay_ms: 0,
        max_fanout: 1_000,
        circuit_breaker_action: CircuitBreakerAction::Async,
        priority: FanoutPriority::Normal,
        retry: RetryConfig::default(),
        deduplication_window_ms: 0,
        timeout_ms: 60_000,
    }
}

fn brand_products(policy: FanoutPolicy) -> FanoutDependency {
    FanoutDependency::new(
        "brand-products",
        "BRAND",
        "PRODUCT",
        "brand",
        IndexValueSource::EntityKey,
    )
    .with_policy(policy)
}

fn request(brand: &str, priority: FanoutPriority) -> FanoutRequest {
    FanoutRequest {
        tenant_id: "t1".into(),
        dependency: "brand-products".into(),
        upstream_entity_type: "BRAND".into(),
        upstream_entity_key: brand.into(),
        upstream_version: 1,
        index_value: brand.into(),
        priority,
    }
}

async fn index_entity(store: &InMemoryStore, key: &str, entity_type: &str, brand: &str) {
    let entry = InvertedIndexEntry {
        tenant_id: "t1".into(),
        index_type: "brand".into(),
        index_value: brand.into(),
        entity_key: key.into(),
        entity_type: entity_type.into(),
        current_version: 1,
    };
    store
        .replace_entity_entries("t1", key, 1, &[entry])
        .await
        .unwrap();
}

async fn seed_products(store: &InMemoryStore, brand: &str, n: usize) {
    for i in 0..n {
        index_entity(store, &format!("{}-p-{:04}", brand, i), "PRODUCT", brand).await;
    }
}

fn engine(
    store: &Arc<InMemoryStore>,
    trigger: &Arc<RecordingTrigger>,
    config: FanoutConfig,
    policy: FanoutPolicy,
) -> FanoutEngine {
    FanoutEngine::new(
        config,
        vec![brand_products(policy)],
        store.clone(),
        store.clone(),
        trigger.clone(),
    )
}

#[tokio::test]
async fn test_batches_cover_every_downstream_entity() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger::default());
    seed_products(&store, "acme", 250).await;
    let engine = engine(&store, &trigger, FanoutConfig::default(), policy());

    let outcome = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap();

    let job_id = match outcome {
        FanoutOutcome::Completed { job_id, triggered } => {
            assert_eq!(triggered, 250);
            job_id
        }
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(trigger.batch_sizes(), vec![100, 100, 50]);

    let mut keys = trigger.triggered_keys();
    keys.dedup();
    assert_eq!(keys.len(), 250);

    match engine.job(job_id).unwrap().state {
        FanoutJobState::Completed { batches, .. } => assert_eq!(batches, 3),
        other => panic!("unexpected state {:?}", other),
    }
}

#[tokio::test]
async fn test_only_downstream_type_is_triggered() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger::default());
    seed_products(&store, "acme", 2).await;
    index_entity(&store, "acme-store-1", "STORE", "acme").await;
    index_entity(&store, "acme", "BRAND", "acme").await;
    let engine = engine(&store, &trigger, FanoutConfig::default(), policy());

    engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap();
    assert_eq!(
        trigger.triggered_keys(),
        vec!["acme-p-0000".to_string(), "acme-p-0001".to_string()]
    );
}

#[tokio::test]
async fn test_circuit_breaker_skip() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger::default());
    seed_products(&store, "acme", 11).await;
    let engine = engine(
        &store,
        &trigger,
        FanoutConfig::default(),
        FanoutPolicy {
            max_fanout: 10,
            circuit_breaker_action: CircuitBreakerAction::Skip,
            ..policy()
        },
    );

    let outcome = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap();
    assert!(matches!(outcome, FanoutOutcome::Skipped { .. }));
    assert!(trigger.triggered_keys().is_empty());
    assert_eq!(engine.jobs_with_status("skipped").len(), 1);
}

#[tokio::test]
async fn test_circuit_breaker_error() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger::default());
    seed_products(&store, "acme", 11).await;
    let engine = engine(
        &store,
        &trigger,
        FanoutConfig::default(),
        FanoutPolicy {
            max_fanout: 10,
            circuit_breaker_action: CircuitBreakerAction::Error,
            ..policy()
        },
    );

    let err = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap_err();
    match err {
        EngineError::FanoutLimitExceeded {
            dependency,
            count,
            limit,
        } => {
            assert_eq!(dependency, "brand-products");
            assert_eq!(count, 11);
            assert_eq!(limit, 10);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(trigger.triggered_keys().is_empty());

    let failed = engine.jobs_with_status("failed");
    assert_eq!(failed.len(), 1);
    match &failed[0].state {
        FanoutJobState::Failed { error_category, .. } => {
            assert_eq!(*error_category, ErrorCategory::Permanent)
        }
        other => panic!("unexpected state {:?}", other),
    }
}

#[tokio::test]
async fn test_circuit_breaker_async_hands_off_to_outbox() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger::default());
    seed_products(&store, "acme", 11).await;
    let engine = engine(
        &store,
        &trigger,
        FanoutConfig::default(),
        FanoutPolicy {
            max_fanout: 10,
            circuit_breaker_action: CircuitBreakerAction::Async,
            ..policy()
        },
    );

    let outbox_id = match engine
        .execute(request("acme", FanoutPriority::High))
        .await
        .unwrap()
    {
        FanoutOutcome::AsyncQueued { outbox_id, .. } => outbox_id,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert!(trigger.triggered_keys().is_empty());

    let entry = store.find_by_id(outbox_id).await.unwrap().unwrap();
    assert_eq!(entry.status, OutboxStatus::Pending);
    assert_eq!(entry.aggregate_type, "FANOUT");
    assert_eq!(entry.priority, FanoutPriority::Background.outbox_priority());

    // The background path ignores max_fanout
    let OutboxEvent::FanoutAsync(background) = OutboxEvent::from_entry(&entry).unwrap() else {
        panic!("expected a fanout.async event");
    };
    assert_eq!(background.priority, FanoutPriority::Background);
    let outcome = engine.execute_async(background).await.unwrap();
    assert!(matches!(
        outcome,
        FanoutOutcome::Completed { triggered: 11, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_failed_fanout_is_not_deduplicated() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger {
        transient_failures: AtomicUsize::new(3),
        ..RecordingTrigger::default()
    });
    seed_products(&store, "acme", 3).await;
    let engine = engine(
        &store,
        &trigger,
        FanoutConfig::default(),
        FanoutPolicy {
            deduplication_window_ms: 60_000,
            ..policy()
        },
    );

    let err = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExternalService(_)));
    assert!(trigger.triggered_keys().is_empty());

    // Trigger healthy again, still inside the window
    let retried = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap();
    assert!(matches!(retried, FanoutOutcome::Completed { triggered: 3, .. }));
    assert_eq!(trigger.triggered_keys().len(), 3);

    // A successful run does arm the window
    let third = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap();
    assert!(matches!(third, FanoutOutcome::Deduplicated { .. }));
}

#[tokio::test]
async fn test_breaker_counts_only_downstream_targets() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger::default());
    seed_products(&store, "acme", 1).await;
    for i in 0..5 {
        index_entity(&store, &format!("acme-o-{}", i), "ORDER", "acme").await;
    }
    index_entity(&store, "acme", "BRAND", "acme").await;
    let engine = engine(
        &store,
        &trigger,
        FanoutConfig::default(),
        FanoutPolicy {
            max_fanout: 2,
            circuit_breaker_action: CircuitBreakerAction::Skip,
            ..policy()
        },
    );

    let outcome = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap();
    assert!(matches!(outcome, FanoutOutcome::Completed { triggered: 1, .. }));
    assert_eq!(trigger.triggered_keys(), vec!["acme-p-0000".to_string()]);
    match engine.job(outcome.job_id().unwrap()).unwrap().state {
        FanoutJobState::Completed { batches, .. } => assert_eq!(batches, 1),
        other => panic!("unexpected state {:?}", other),
    }
}

#[tokio::test]
async fn test_self_referencing_dependency_skips_upstream() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger::default());
    for key in ["p-1", "p-2", "p-3"] {
        index_entity(&store, key, "PRODUCT", "family-1").await;
    }
    let related = FanoutDependency::new(
        "product-family",
        "PRODUCT",
        "PRODUCT",
        "brand",
        IndexValueSource::EntityKey,
    )
    .with_policy(FanoutPolicy {
        max_fanout: 2,
        circuit_breaker_action: CircuitBreakerAction::Error,
        ..policy()
    });
    let engine = FanoutEngine::new(
        FanoutConfig::default(),
        vec![related],
        store.clone(),
        store.clone(),
        trigger.clone(),
    );

    let outcome = engine
        .execute(FanoutRequest {
            tenant_id: "t1".into(),
            dependency: "product-family".into(),
            upstream_entity_type: "PRODUCT".into(),
            upstream_entity_key: "p-2".into(),
            upstream_version: 4,
            index_value: "family-1".into(),
            priority: FanoutPriority::Normal,
        })
        .await
        .unwrap();
    // Two siblings fit under max_fanout once p-2 itself is excluded
    assert!(matches!(outcome, FanoutOutcome::Completed { triggered: 2, .. }));
    assert_eq!(
        trigger.triggered_keys(),
        vec!["p-1".to_string(), "p-3".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_deduplication_window() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger::default());
    seed_products(&store, "acme", 3).await;
    let engine = engine(
        &store,
        &trigger,
        FanoutConfig::default(),
        FanoutPolicy {
            deduplication_window_ms: 1_000,
            ..policy()
        },
    );

    let first = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap();
    assert!(matches!(first, FanoutOutcome::Completed { .. }));

    let second = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap();
    assert!(matches!(second, FanoutOutcome::Deduplicated { .. }));
    assert_eq!(trigger.batch_sizes(), vec![3]);

    tokio::time::advance(Duration::from_millis(1_001)).await;
    assert_eq!(engine.purge_dedup(), 1);
    let third = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap();
    assert!(matches!(third, FanoutOutcome::Completed { .. }));
    assert_eq!(trigger.batch_sizes(), vec![3, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_transient_trigger_failures_are_retried() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger {
        transient_failures: AtomicUsize::new(2),
        ..RecordingTrigger::default()
    });
    seed_products(&store, "acme", 5).await;
    let engine = engine(&store, &trigger, FanoutConfig::default(), policy());

    let outcome = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap();
    assert!(matches!(outcome, FanoutOutcome::Completed { triggered: 5, .. }));
    assert_eq!(trigger.batch_sizes(), vec![5]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger {
        transient_failures: AtomicUsize::new(5),
        ..RecordingTrigger::default()
    });
    seed_products(&store, "acme", 5).await;
    let engine = engine(&store, &trigger, FanoutConfig::default(), policy());

    let err = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExternalService(_)));
    // 3 attempts consumed
    assert_eq!(trigger.transient_failures.load(Ordering::SeqCst), 2);

    // FAILED → PENDING → COMPLETED under the same job id
    let failed = engine.jobs_with_status("failed");
    assert_eq!(failed.len(), 1);
    let job_id = failed[0].id;
    let outcome = engine.retry_job(job_id).await.unwrap();
    assert!(matches!(outcome, FanoutOutcome::Completed { triggered: 5, .. }));
    assert_eq!(outcome.job_id(), Some(job_id));

    let job = engine.job(job_id).unwrap();
    assert_eq!(job.state.state_name(), "completed");
    assert_eq!(job.attempts, 2);
    assert!(engine.retry_job(job_id).await.is_err());
}

#[tokio::test]
async fn test_permanent_trigger_failure_is_not_retried() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger {
        permanent_failure: true,
        ..RecordingTrigger::default()
    });
    seed_products(&store, "acme", 5).await;
    let engine = engine(&store, &trigger, FanoutConfig::default(), policy());

    let err = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(trigger.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(engine.jobs_with_status("failed").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_job_as_transient() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger {
        delay: Some(Duration::from_secs(10)),
        ..RecordingTrigger::default()
    });
    seed_products(&store, "acme", 5).await;
    let engine = engine(
        &store,
        &trigger,
        FanoutConfig::default(),
        FanoutPolicy {
            timeout_ms: 100,
            ..policy()
        },
    );

    let err = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout(_)));
    assert!(err.category().is_retryable());

    let failed = engine.jobs_with_status("failed");
    assert_eq!(failed.len(), 1);
    assert!(matches!(
        failed[0].state,
        FanoutJobState::Failed {
            error_category: ErrorCategory::Transient,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_bounded() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger {
        delay: Some(Duration::from_millis(50)),
        ..RecordingTrigger::default()
    });
    let brands: Vec<String> = (0..6).map(|i| format!("brand-{}", i)).collect();
    for brand in &brands {
        seed_products(&store, brand, 1).await;
    }
    let engine = engine(
        &store,
        &trigger,
        FanoutConfig {
            max_concurrent_fanouts: 2,
            ..FanoutConfig::default()
        },
        policy(),
    );

    let results = futures::future::join_all(
        brands
            .iter()
            .map(|b| engine.execute(request(b, FanoutPriority::Normal))),
    )
    .await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(trigger.max_in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(trigger.triggered_keys().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_waiting_fanouts_are_admitted_most_urgent_first() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger {
        delay: Some(Duration::from_millis(50)),
        ..RecordingTrigger::default()
    });
    for brand in ["holder", "low", "critical", "normal"] {
        seed_products(&store, brand, 1).await;
    }
    let engine = engine(
        &store,
        &trigger,
        FanoutConfig {
            max_concurrent_fanouts: 1,
            ..FanoutConfig::default()
        },
        policy(),
    );

    // The holder takes the only slot and sleeps in the trigger; the rest park
    // in arrival order low, critical, normal.
    let results = futures::future::join_all([
        engine.execute(request("holder", FanoutPriority::Low)),
        engine.execute(request("low", FanoutPriority::Low)),
        engine.execute(request("critical", FanoutPriority::Critical)),
        engine.execute(request("normal", FanoutPriority::Normal)),
    ])
    .await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(
        trigger.triggered_keys(),
        vec![
            "holder-p-0000",
            "critical-p-0000",
            "normal-p-0000",
            "low-p-0000"
        ]
    );
    assert_eq!(trigger.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disabled_engine_does_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Arc::new(RecordingTrigger::default());
    seed_products(&store, "acme", 3).await;
    let engine = engine(
        &store,
        &trigger,
        FanoutConfig {
            enabled: false,
            ..FanoutConfig::default()
        },
        policy(),
    );

    let outcome = engine
        .execute(request("acme", FanoutPriority::Normal))
        .await
        .unwrap();
    assert_eq!(outcome, FanoutOutcome::Disabled);
    assert!(trigger.triggered_keys().is_empty());
}
