//! Change processor
//!
//! Turns one ingested raw version into stored slices, refreshed index
//! entries and fanout requests:
//!
//! ```text
//! raw(v) ─┬─> ChangeSet(v-1 → v) ─> impact ─> partial slices ─> SliceStore
//!         └─> index entries ───────────────────────────────────> InvertedIndexStore
//!                                    impact ─> fanout requests ─> FanoutEngine
//! ```
//!
//! Every step is idempotent, so reprocessing an outbox entry after a crash
//! converges to the same state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use slicegraph_storage::{
    InvertedIndexStore, OutboxEntry, PutOutcome, RawDataRecord, RawDataStore, SliceRecord,
    SliceStore,
};
use tracing::{debug, info, instrument};

use crate::changeset::{ChangeSet, ChangeSetBuilder, ChangeType};
use crate::contract::RuleSetRef;
use crate::error::{EngineError, Result};
use crate::events::OutboxEvent;
use crate::fanout::{FanoutEngine, FanoutOutcome};
use crate::impact::ImpactCalculator;
use crate::slicing::{SlicingEngine, SlicingOutput};
use crate::worker::OutboxHandler;

/// Which rule set slices a tenant's entities of a given type
pub trait RuleSetResolver: Send + Sync {
    fn resolve(&self, tenant_id: &str, entity_type: &str) -> Result<RuleSetRef>;
}

/// Per-entity-type defaults with per-tenant overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticRuleSetResolver {
    #[serde(default)]
    defaults: HashMap<String, RuleSetRef>,
    /// tenant → entity type → rule set
    #[serde(default)]
    overrides: HashMap<String, HashMap<String, RuleSetRef>>,
}

impl StaticRuleSetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, entity_type: impl Into<String>, rule_set: RuleSetRef) -> Self {
        self.defaults.insert(entity_type.into(), rule_set);
        self
    }

    pub fn with_tenant_override(
        mut self,
        tenant_id: impl Into<String>,
        entity_type: impl Into<String>,
        rule_set: RuleSetRef,
    ) -> Self {
        self.overrides
            .entry(tenant_id.into())
            .or_default()
            .insert(entity_type.into(), rule_set);
        self
    }
}

impl RuleSetResolver for StaticRuleSetResolver {
    fn resolve(&self, tenant_id: &str, entity_type: &str) -> Result<RuleSetRef> {
        self.overrides
            .get(tenant_id)
            .and_then(|by_type| by_type.get(entity_type))
            .or_else(|| self.defaults.get(entity_type))
            .cloned()
            .ok_or_else(|| {
                EngineError::not_found(format!(
                    "no rule set for {} entities of tenant {}",
                    entity_type, tenant_id
                ))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceWriteStats {
    pub written: usize,
    pub already_applied: usize,
    pub index_updated: bool,
}

#[derive(Debug, Clone)]
pub struct ProcessingReport {
    pub change_set: ChangeSet,
    pub rule_set: RuleSetRef,
    pub slices: SliceWriteStats,
    pub fanout: Vec<FanoutOutcome>,
}

#[derive(Debug, Clone)]
pub struct RecomputeReport {
    pub entity: String,
    pub version: i64,
    pub rule_set: RuleSetRef,
    pub slices: SliceWriteStats,
}

pub struct ChangeProcessor {
    raw: Arc<dyn RawDataStore>,
    slices: Arc<dyn SliceStore>,
    index: Arc<dyn InvertedIndexStore>,
    slicing: Arc<SlicingEngine>,
    resolver: Arc<dyn RuleSetResolver>,
    fanout: Arc<FanoutEngine>,
}

impl ChangeProcessor {
    pub fn new(
        raw: Arc<dyn RawDataStore>,
        slices: Arc<dyn SliceStore>,
        index: Arc<dyn InvertedIndexStore>,
        slicing: Arc<SlicingEngine>,
        resolver: Arc<dyn RuleSetResolver>,
        fanout: Arc<FanoutEngine>,
    ) -> Self {
        Self {
            raw,
            slices,
            index,
            slicing,
            resolver,
            fanout,
        }
    }

    pub fn fanout(&self) -> &Arc<FanoutEngine> {
        &self.fanout
    }

    /// Process version `version` of an entity against its predecessor.
    #[instrument(skip(self))]
    pub async fn process_ingested(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
    ) -> Result<ProcessingReport> {
        let to = self
            .raw
            .get(tenant_id, entity_key, version)
            .await?
            .ok_or_else(|| {
                EngineError::not_found(format!("raw {}/{}@{}", tenant_id, entity_key, version))
            })?;
        let from = self.raw.get_previous(tenant_id, entity_key, version).await?;

        let rule_set = self.resolver.resolve(&to.tenant_id, &to.entity_type)?;
        let contract = self.slicing.loader().load(&rule_set).await?;

        let change_set = ChangeSetBuilder::build(from.as_ref(), &to)?;
        let change_set = ImpactCalculator::apply(change_set, &contract)?;
        debug!(
            change_type = %change_set.change_type,
            changed_paths = change_set.changed_paths.len(),
            impacted = ?change_set.impacted_slice_types,
            "change set computed"
        );

        let output = self
            .slicing
            .slice_partial(&to, &rule_set, &change_set.impacted_slice_types)
            .await?;
        let slices = self.store_output(&to, &output).await?;

        let fanout = if change_set.change_type == ChangeType::NoChange {
            Vec::new()
        } else {
            let requests = self.fanout.requests_for(&change_set, &to, from.as_ref())?;
            join_all(requests.into_iter().map(|r| self.fanout.execute(r)))
                .await
                .into_iter()
                .collect::<Result<Vec<_>>>()?
        };

        info!(
            entity = %to.display_id(),
            change_type = %change_set.change_type,
            slices_written = slices.written,
            fanouts = fanout.len(),
            "change processed"
        );
        Ok(ProcessingReport {
            change_set,
            rule_set,
            slices,
            fanout,
        })
    }

    /// Re-slice the latest version of an entity with every declared slice.
    #[instrument(skip(self))]
    pub async fn recompute(&self, tenant_id: &str, entity_key: &str) -> Result<RecomputeReport> {
        let raw = self
            .raw
            .get_latest(tenant_id, entity_key)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("raw {}/{}", tenant_id, entity_key)))?;
        let rule_set = self.resolver.resolve(&raw.tenant_id, &raw.entity_type)?;
        let output = self.slicing.slice(&raw, &rule_set).await?;
        let slices = self.store_output(&raw, &output).await?;

        debug!(entity = %raw.display_id(), written = slices.written, "entity recomputed");
        Ok(RecomputeReport {
            entity: raw.display_id(),
            version: raw.version,
            rule_set,
            slices,
        })
    }

    async fn store_output(
        &self,
        raw: &RawDataRecord,
        output: &SlicingOutput,
    ) -> Result<SliceWriteStats> {
        let mut stats = SliceWriteStats::default();
        if !output.slices.is_empty() {
            for outcome in self.slices.put_slices(&output.slices).await? {
                match outcome {
                    PutOutcome::Created => stats.written += 1,
                    PutOutcome::AlreadyApplied => stats.already_applied += 1,
                }
            }
        }

        stats.index_updated = self
            .index
            .replace_entity_entries(
                &raw.tenant_id,
                &raw.entity_key,
                raw.version,
                &output.index_entries,
            )
            .await?;
        if !stats.index_updated {
            debug!(entity = %raw.display_id(), "index already at a newer version");
        }
        Ok(stats)
    }

    /// Slices currently stored for `version`, keyed by slice type.
    pub async fn slices_at(
        &self,
        tenant_id: &str,
        entity_key: &str,
        version: i64,
    ) -> Result<Vec<SliceRecord>> {
        Ok(self.slices.list_slices(tenant_id, entity_key, version).await?)
    }

    /// Slice types declared by the rule set that applies to an entity type.
    pub async fn declared_slice_types(
        &self,
        tenant_id: &str,
        entity_type: &str,
    ) -> Result<BTreeSet<String>> {
        let rule_set = self.resolver.resolve(tenant_id, entity_type)?;
        Ok(self.slicing.loader().load(&rule_set).await?.slice_types())
    }
}

#[async_trait]
impl OutboxHandler for ChangeProcessor {
    async fn handle(&self, entry: &OutboxEntry) -> Result<()> {
        match OutboxEvent::from_entry(entry)? {
            OutboxEvent::RawIngested {
                tenant_id,
                entity_key,
                version,
                ..
            } => {
                self.process_ingested(&tenant_id, &entity_key, version)
                    .await?;
            }
            OutboxEvent::EntityRecompute {
                tenant_id,
                entity_key,
                ..
            } => {
                self.recompute(&tenant_id, &entity_key).await?;
            }
            OutboxEvent::FanoutAsync(request) => {
                self.fanout.execute_async(request).await?;
            }
        }
        Ok(())
    }
}
