/*
 * Slicegraph Engine - Incremental View Maintenance Core
 *
 * Keeps derived slices and inverted-index entries in sync with versioned
 * raw documents.
 *
 * Architecture:
 * - Ingest (raw + outbox in one transaction)
 * - Outbox Workers (atomic claim, per-entity ordering)
 * - ChangeSet + Impact (fail-closed path → slice mapping)
 * - Slicing (pure, deterministic)
 * - Fanout (index-driven downstream recompute, circuit breaker)
 * - Contract Cache (TTL + LRU, single-flight loads)
 * - Bootstrap (YAML config → wired engine, workers, maintenance)
 */

// Public modules
pub mod bootstrap;
pub mod cache;
pub mod changeset;
pub mod config;
pub mod contract;
pub mod error;
pub mod events;
pub mod fanout;
pub mod impact;
pub mod ingest;
pub mod ops;
pub mod pointer;
pub mod processor;
pub mod slicing;
pub mod telemetry;
pub mod worker;

// Re-exports
pub use bootstrap::{Engine, EngineBuilder};
pub use cache::{CacheConfig, CacheStats, ContractLoader, SingleFlight, TtlLruCache};
pub use changeset::{ChangeSet, ChangeSetBuilder, ChangeType, ChangedPath, ImpactDetail};
pub use config::{ConfigError, EngineConfig, OutboxSettings};
pub use contract::{
    ContractRegistry, FieldMapping, InMemoryContractRegistry, IndexRule, RuleSetContract,
    RuleSetRef, SliceRule,
};
pub use error::{EngineError, ErrorCategory, Result};
pub use events::{OutboxEvent, UpstreamRef};
pub use fanout::{
    CircuitBreakerAction, DownstreamTarget, DownstreamTrigger, FanoutConfig, FanoutDependency,
    FanoutEngine, FanoutJob, FanoutJobState, FanoutOutcome, FanoutPolicy, FanoutPriority,
    FanoutRequest, GatePermit, IndexValueSource, OutboxRecomputeTrigger, PriorityGate,
    RetryConfig,
};
pub use impact::ImpactCalculator;
pub use ingest::{IngestRequest, IngestResult, IngestService, IngestStatus};
pub use ops::OpsService;
pub use processor::{
    ChangeProcessor, ProcessingReport, RecomputeReport, RuleSetResolver, StaticRuleSetResolver,
};
pub use slicing::{slice_with_contract, SlicingEngine, SlicingOutput};
pub use telemetry::init_tracing;
pub use worker::{
    spawn_workers, BatchReport, ClaimStrategy, MaintenanceReport, OutboxHandler,
    OutboxMaintenance, OutboxWorker, WorkerConfig,
};
