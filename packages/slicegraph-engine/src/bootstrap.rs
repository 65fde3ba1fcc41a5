//! Engine assembly from `EngineConfig`
//!
//! `EngineBuilder` wires the contract loader, fanout engine, change
//! processor, ingest and ops services over one storage backend. The built
//! `Engine` hands out outbox workers and the maintenance sweep configured
//! from the same file, and `spawn` starts both under one cancellation token.

use std::path::Path;
use std::sync::Arc;

use slicegraph_storage::{IngestStore, InvertedIndexStore, OutboxStore, RawDataStore, SliceStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::ContractLoader;
use crate::config::EngineConfig;
use crate::contract::ContractRegistry;
use crate::error::{EngineError, Result};
use crate::fanout::{DownstreamTrigger, FanoutDependency, FanoutEngine, OutboxRecomputeTrigger};
use crate::ingest::IngestService;
use crate::ops::OpsService;
use crate::processor::{ChangeProcessor, RuleSetResolver};
use crate::slicing::SlicingEngine;
use crate::telemetry::init_tracing;
use crate::worker::{spawn_workers, OutboxMaintenance, OutboxWorker};

pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<Arc<dyn ContractRegistry>>,
    resolver: Option<Arc<dyn RuleSetResolver>>,
    dependencies: Vec<FanoutDependency>,
    trigger: Option<Arc<dyn DownstreamTrigger>>,
    tracing_filter: Option<String>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: None,
            resolver: None,
            dependencies: Vec::new(),
            trigger: None,
            tracing_filter: None,
        }
    }

    /// Load YAML, apply `SLICEGRAPH_*` overrides, validate.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = EngineConfig::from_yaml_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(Self::new(EngineConfig::from_yaml_str(yaml)?))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(mut self, registry: Arc<dyn ContractRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn RuleSetResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn dependencies(mut self, dependencies: impl IntoIterator<Item = FanoutDependency>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    /// Replace the default outbox-backed recompute trigger.
    pub fn trigger(mut self, trigger: Arc<dyn DownstreamTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Install the fmt subscriber on `build` (see `init_tracing`).
    pub fn with_tracing(mut self, default_filter: impl Into<String>) -> Self {
        self.tracing_filter = Some(default_filter.into());
        self
    }

    pub fn build<S>(self, store: Arc<S>) -> Result<Engine>
    where
        S: RawDataStore + SliceStore + InvertedIndexStore + OutboxStore + IngestStore + 'static,
    {
        if let Some(filter) = &self.tracing_filter {
            init_tracing(filter);
        }
        let registry = self
            .registry
            .ok_or_else(|| EngineError::config("engine needs a contract registry"))?;
        let resolver = self
            .resolver
            .ok_or_else(|| EngineError::config("engine needs a rule set resolver"))?;

        let outbox: Arc<dyn OutboxStore> = store.clone();
        let trigger = self
            .trigger
            .unwrap_or_else(|| Arc::new(OutboxRecomputeTrigger::new(outbox.clone())));

        let loader = Arc::new(ContractLoader::new(registry, &self.config.cache));
        let fanout = Arc::new(FanoutEngine::new(
            self.config.fanout.clone(),
            self.dependencies,
            store.clone(),
            outbox.clone(),
            trigger,
        ));
        let processor = Arc::new(ChangeProcessor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(SlicingEngine::new(loader.clone())),
            resolver,
            fanout.clone(),
        ));

        info!(
            workers = self.config.worker.workers,
            dependencies = fanout.dependencies().len(),
            cache_enabled = self.config.cache.enabled,
            "engine assembled"
        );
        Ok(Engine {
            ingest: IngestService::new(store),
            ops: OpsService::new(outbox.clone(), loader.clone(), fanout),
            config: self.config,
            outbox,
            loader,
            processor,
        })
    }
}

pub struct Engine {
    config: EngineConfig,
    outbox: Arc<dyn OutboxStore>,
    loader: Arc<ContractLoader>,
    processor: Arc<ChangeProcessor>,
    ingest: IngestService,
    ops: OpsService,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ingest(&self) -> &IngestService {
        &self.ingest
    }

    pub fn ops(&self) -> &OpsService {
        &self.ops
    }

    pub fn processor(&self) -> &Arc<ChangeProcessor> {
        &self.processor
    }

    pub fn fanout(&self) -> &Arc<FanoutEngine> {
        self.processor.fanout()
    }

    pub fn loader(&self) -> &Arc<ContractLoader> {
        &self.loader
    }

    /// A single worker using the configured claim settings.
    pub fn worker(&self) -> OutboxWorker {
        OutboxWorker::new(
            self.outbox.clone(),
            self.processor.clone(),
            self.config.worker.clone(),
        )
    }

    pub fn maintenance(&self) -> OutboxMaintenance {
        OutboxMaintenance::new(
            self.outbox.clone(),
            self.config.outbox.visibility_timeout(),
            self.config.outbox.max_retries,
        )
    }

    /// Start `worker.workers` workers plus the maintenance loop. All stop
    /// when `cancel` fires.
    pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = spawn_workers(
            self.outbox.clone(),
            self.processor.clone(),
            self.config.worker.clone(),
            cancel.clone(),
        );
        let maintenance = self.maintenance();
        let interval = self.config.outbox.maintenance_interval();
        handles.push(tokio::spawn(async move {
            maintenance.run(cancel, interval).await
        }));
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slicegraph_storage::InMemoryStore;

    #[test]
    fn test_build_requires_registry_and_resolver() {
        let store = Arc::new(InMemoryStore::new());
        let err = EngineBuilder::new(EngineConfig::default())
            .build(store)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = EngineBuilder::from_yaml_str("outbox:\n  max_retries: 0\n")
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
