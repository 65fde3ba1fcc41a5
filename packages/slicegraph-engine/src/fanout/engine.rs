//! Fanout engine
//!
//! Given an upstream change, discovers downstream entities through the
//! inverted index and triggers their recomputation in bounded batches.
//!
//! Per request:
//! 1. Deduplicate within the dependency's window
//! 2. Wait for a concurrency slot, most urgent priority first
//! 3. Count candidates and apply the circuit breaker above `max_fanout`
//! 4. Page through the index, triggering each batch with retry, under the
//!    policy timeout
//!
//! Every request gets a `FanoutJob` in the in-process registry.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use slicegraph_storage::{
    IndexQuery, InvertedIndexStore, OutboxEntry, OutboxStore, RawDataRecord,
};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{
    CircuitBreakerAction, FanoutConfig, FanoutDependency, FanoutPolicy, FanoutPriority,
    IndexValueSource, RetryConfig,
};
use super::gate::PriorityGate;
use super::job::{FanoutJob, FanoutJobState, FanoutJobStateMachine, FanoutRequest};
use super::trigger::{DownstreamTarget, DownstreamTrigger};
use crate::changeset::{ChangeSet, ChangeType};
use crate::error::{EngineError, Result};
use crate::events::{OutboxEvent, UpstreamRef, FANOUT_AGGREGATE};
use crate::pointer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanoutOutcome {
    Completed { job_id: Uuid, triggered: u64 },
    Skipped { job_id: Uuid, reason: String },
    Deduplicated { job_id: Uuid },
    AsyncQueued { job_id: Uuid, outbox_id: Uuid },
    Disabled,
}

impl FanoutOutcome {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            FanoutOutcome::Completed { job_id, .. }
            | FanoutOutcome::Skipped { job_id, .. }
            | FanoutOutcome::Deduplicated { job_id }
            | FanoutOutcome::AsyncQueued { job_id, .. } => Some(*job_id),
            FanoutOutcome::Disabled => None,
        }
    }
}

pub struct FanoutEngine {
    config: FanoutConfig,
    dependencies: Vec<FanoutDependency>,
    index: Arc<dyn InvertedIndexStore>,
    outbox: Arc<dyn OutboxStore>,
    trigger: Arc<dyn DownstreamTrigger>,
    gate: PriorityGate,
    /// dedup key → window expiry
    recent: DashMap<String, Instant>,
    jobs: DashMap<Uuid, FanoutJob>,
}

impl FanoutEngine {
    pub fn new(
        config: FanoutConfig,
        dependencies: Vec<FanoutDependency>,
        index: Arc<dyn InvertedIndexStore>,
        outbox: Arc<dyn OutboxStore>,
        trigger: Arc<dyn DownstreamTrigger>,
    ) -> Self {
        let gate = PriorityGate::new(config.max_concurrent_fanouts);
        Self {
            config,
            dependencies,
            index,
            outbox,
            trigger,
            gate,
            recent: DashMap::new(),
            jobs: DashMap::new(),
        }
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    pub fn dependencies(&self) -> &[FanoutDependency] {
        &self.dependencies
    }

    pub fn dependency(&self, name: &str) -> Result<&FanoutDependency> {
        self.dependencies
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| EngineError::not_found(format!("fanout dependency {}", name)))
    }

    pub fn dependencies_for<'a>(
        &'a self,
        upstream_entity_type: &'a str,
    ) -> impl Iterator<Item = &'a FanoutDependency> + 'a {
        self.dependencies
            .iter()
            .filter(move |d| d.upstream_entity_type == upstream_entity_type)
    }

    pub fn policy_for<'a>(&'a self, dependency: &'a FanoutDependency) -> &'a FanoutPolicy {
        dependency
            .policy
            .as_ref()
            .unwrap_or(&self.config.default_policy)
    }

    /// Fanout requests implied by a processed change.
    ///
    /// Field-sourced values are taken from both the new and the previous
    /// document so entities that referenced the old value are refreshed too.
    pub fn requests_for(
        &self,
        change_set: &ChangeSet,
        current: &RawDataRecord,
        previous: Option<&RawDataRecord>,
    ) -> Result<Vec<FanoutRequest>> {
        if !self.config.enabled || change_set.change_type == ChangeType::NoChange {
            return Ok(Vec::new());
        }

        let mut requests = Vec::new();
        for dependency in self.dependencies_for(&change_set.entity_type) {
            if !dependency.fires_on(&change_set.impacted_slice_types) {
                continue;
            }

            let mut values = BTreeSet::new();
            match &dependency.value_source {
                IndexValueSource::EntityKey => {
                    values.insert(change_set.entity_key.clone());
                }
                IndexValueSource::Field(path) => {
                    collect_index_values(&current.payload, path, &mut values)?;
                    if let Some(previous) = previous {
                        collect_index_values(&previous.payload, path, &mut values)?;
                    }
                }
            }

            let priority = self.policy_for(dependency).priority;
            requests.extend(values.into_iter().map(|index_value| FanoutRequest {
                tenant_id: change_set.tenant_id.clone(),
                dependency: dependency.name.clone(),
                upstream_entity_type: change_set.entity_type.clone(),
                upstream_entity_key: change_set.entity_key.clone(),
                upstream_version: change_set.to_version,
                index_value,
                priority,
            }));
        }
        Ok(requests)
    }

    /// Run one fanout with deduplication and the circuit breaker.
    pub async fn execute(&self, request: FanoutRequest) -> Result<FanoutOutcome> {
        if !self.config.enabled {
            return Ok(FanoutOutcome::Disabled);
        }
        let dependency = self.dependency(&request.dependency)?;
        let policy = self.policy_for(dependency);

        if self.is_duplicate(&request, policy) {
            let mut job = FanoutJob::new_pending(request);
            FanoutJobStateMachine::new(&mut job).skip("deduplicated")?;
            let job_id = job.id;
            debug!(job_id = %job_id, dedup_key = %job.request.dedup_key(), "fanout deduplicated");
            self.jobs.insert(job_id, job);
            return Ok(FanoutOutcome::Deduplicated { job_id });
        }

        let dedup_key = request.dedup_key();
        let result = self.run_job(dependency, policy, request, true).await;
        if result.is_err() {
            // Failed runs leave no dedup mark; the retry must run
            self.recent.remove(&dedup_key);
        }
        result
    }

    /// Run a fanout handed off by the ASYNC breaker action: no dedup, no
    /// `max_fanout` check.
    pub async fn execute_async(&self, request: FanoutRequest) -> Result<FanoutOutcome> {
        let dependency = self.dependency(&request.dependency)?;
        let policy = self.policy_for(dependency);
        self.run_job(dependency, policy, request, false).await
    }

    /// Re-run a FAILED job under its original id. Dedup is not consulted.
    pub async fn retry_job(&self, id: Uuid) -> Result<FanoutOutcome> {
        let mut job = self
            .job(id)
            .ok_or_else(|| EngineError::not_found(format!("fanout job {}", id)))?;
        FanoutJobStateMachine::new(&mut job).retry()?;
        let dependency = self.dependency(&job.request.dependency)?;
        let policy = self.policy_for(dependency);
        info!(job_id = %job.id, previous_attempts = job.attempts, "retrying fanout job");
        self.run_tracked(dependency, policy, job, true).await
    }

    pub fn job(&self, id: Uuid) -> Option<FanoutJob> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    pub fn jobs_with_status(&self, state_name: &str) -> Vec<FanoutJob> {
        let mut jobs: Vec<FanoutJob> = self
            .jobs
            .iter()
            .filter(|j| j.state.state_name() == state_name)
            .map(|j| j.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Drop terminal jobs last updated before `before`.
    pub fn purge_finished_jobs(&self, before: DateTime<Utc>) -> usize {
        let len = self.jobs.len();
        self.jobs
            .retain(|_, job| !(job.state.is_terminal() && job.updated_at < before));
        len - self.jobs.len()
    }

    /// Forget expired dedup windows.
    pub fn purge_dedup(&self) -> usize {
        let now = Instant::now();
        let len = self.recent.len();
        self.recent.retain(|_, expires_at| *expires_at > now);
        len - self.recent.len()
    }

    fn is_duplicate(&self, request: &FanoutRequest, policy: &FanoutPolicy) -> bool {
        let window = policy.deduplication_window();
        if window.is_zero() {
            return false;
        }
        let now = Instant::now();
        match self.recent.entry(request.dedup_key()) {
            Entry::Occupied(mut e) => {
                if now < *e.get() {
                    true
                } else {
                    e.insert(now + window);
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(now + window);
                false
            }
        }
    }

    fn publish(&self, job: &FanoutJob) {
        self.jobs.insert(job.id, job.clone());
    }

    async fn run_job(
        &self,
        dependency: &FanoutDependency,
        policy: &FanoutPolicy,
        request: FanoutRequest,
        use_breaker: bool,
    ) -> Result<FanoutOutcome> {
        self.run_tracked(dependency, policy, FanoutJob::new_pending(request), use_breaker)
            .await
    }

    async fn run_tracked(
        &self,
        dependency: &FanoutDependency,
        policy: &FanoutPolicy,
        mut job: FanoutJob,
        use_breaker: bool,
    ) -> Result<FanoutOutcome> {
        self.publish(&job);

        let _permit = self.gate.acquire(job.request.priority).await;

        match self.drive(dependency, policy, &mut job, use_breaker).await {
            Ok(outcome) => {
                self.publish(&job);
                Ok(outcome)
            }
            Err(err) => {
                if !job.state.is_terminal() {
                    FanoutJobStateMachine::new(&mut job).fail(&err)?;
                }
                self.publish(&job);
                warn!(
                    job_id = %job.id,
                    dependency = %dependency.name,
                    index_value = %job.request.index_value,
                    error = %err,
                    "fanout failed"
                );
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        dependency: &FanoutDependency,
        policy: &FanoutPolicy,
        job: &mut FanoutJob,
        use_breaker: bool,
    ) -> Result<FanoutOutcome> {
        FanoutJobStateMachine::new(job).start()?;
        let discovered = self
            .index
            .count_matching(&target_query(dependency, &job.request, 1))
            .await?;
        FanoutJobStateMachine::new(job).record_discovered(discovered)?;
        self.publish(job);

        if use_breaker && discovered > policy.max_fanout {
            return self.trip_breaker(dependency, policy, job, discovered).await;
        }

        let budget = policy.timeout();
        match timeout(budget, self.run_batches(dependency, policy, job)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::Timeout(format!(
                    "fanout {} for {} exceeded {:?}",
                    dependency.name, job.request.index_value, budget
                )))
            }
        }

        FanoutJobStateMachine::new(job).complete()?;
        let triggered = match &job.state {
            FanoutJobState::Completed { triggered, .. } => *triggered,
            _ => 0,
        };
        info!(
            job_id = %job.id,
            dependency = %dependency.name,
            index_value = %job.request.index_value,
            discovered,
            triggered,
            "fanout completed"
        );
        Ok(FanoutOutcome::Completed {
            job_id: job.id,
            triggered,
        })
    }

    async fn trip_breaker(
        &self,
        dependency: &FanoutDependency,
        policy: &FanoutPolicy,
        job: &mut FanoutJob,
        discovered: u64,
    ) -> Result<FanoutOutcome> {
        match policy.circuit_breaker_action {
            CircuitBreakerAction::Skip => {
                let reason = format!(
                    "fanout limit exceeded: {} > {}",
                    discovered, policy.max_fanout
                );
                warn!(
                    job_id = %job.id,
                    dependency = %dependency.name,
                    index_value = %job.request.index_value,
                    discovered,
                    limit = policy.max_fanout,
                    "fanout skipped by circuit breaker"
                );
                FanoutJobStateMachine::new(job).skip(reason.clone())?;
                Ok(FanoutOutcome::Skipped {
                    job_id: job.id,
                    reason,
                })
            }
            CircuitBreakerAction::Error => Err(EngineError::FanoutLimitExceeded {
                dependency: dependency.name.clone(),
                count: discovered,
                limit: policy.max_fanout,
            }),
            CircuitBreakerAction::Async => {
                let request = FanoutRequest {
                    priority: FanoutPriority::Background,
                    ..job.request.clone()
                };
                let event = OutboxEvent::FanoutAsync(request);
                let key = format!(
                    "fanout:{}:{}:{}:{}:{}",
                    job.request.tenant_id,
                    dependency.name,
                    job.request.index_value,
                    job.request.upstream_entity_key,
                    job.request.upstream_version
                );
                let aggregate_id = format!(
                    "{}:{}:{}",
                    job.request.tenant_id, dependency.name, job.request.index_value
                );
                let entry = OutboxEntry::new(
                    key,
                    FANOUT_AGGREGATE,
                    aggregate_id,
                    event.event_type(),
                    event.to_payload()?,
                )
                .with_priority(FanoutPriority::Background.outbox_priority());
                let stored = self.outbox.insert(entry).await?;

                FanoutJobStateMachine::new(job).queue_async(stored.id)?;
                info!(
                    job_id = %job.id,
                    dependency = %dependency.name,
                    discovered,
                    outbox_id = %stored.id,
                    "fanout handed off to background"
                );
                Ok(FanoutOutcome::AsyncQueued {
                    job_id: job.id,
                    outbox_id: stored.id,
                })
            }
        }
    }

    async fn run_batches(
        &self,
        dependency: &FanoutDependency,
        policy: &FanoutPolicy,
        job: &mut FanoutJob,
    ) -> Result<()> {
        let request = job.request.clone();
        let upstream = UpstreamRef {
            dependency: dependency.name.clone(),
            entity_type: request.upstream_entity_type.clone(),
            entity_key: request.upstream_entity_key.clone(),
            version: request.upstream_version,
        };

        let mut cursor: Option<String> = None;
        loop {
            let query =
                target_query(dependency, &request, policy.batch_size.max(1)).after(cursor.take());
            let page = self.index.query(&query).await?;

            let targets: Vec<DownstreamTarget> = page
                .items
                .iter()
                .map(|e| DownstreamTarget {
                    tenant_id: e.tenant_id.clone(),
                    entity_key: e.entity_key.clone(),
                    entity_type: e.entity_type.clone(),
                    upstream: upstream.clone(),
                })
                .collect();

            if !targets.is_empty() {
                self.trigger_with_retry(&targets, request.priority, &policy.retry)
                    .await?;
            }
            FanoutJobStateMachine::new(job).record_batch(targets.len() as u64)?;
            self.publish(job);

            match page.next_cursor {
                Some(next) => {
                    cursor = Some(next);
                    let delay = policy.batch_delay();
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
                None => return Ok(()),
            }
        }
    }

    async fn trigger_with_retry(
        &self,
        targets: &[DownstreamTarget],
        priority: FanoutPriority,
        retry: &RetryConfig,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.trigger.trigger(targets, priority).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < retry.max_attempts && err.category().is_retryable() => {
                    let delay = retry.backoff_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "downstream trigger failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Downstream entities of `dependency` under the request's value, minus the
/// upstream entity itself.
fn target_query(dependency: &FanoutDependency, request: &FanoutRequest, limit: usize) -> IndexQuery {
    let query = IndexQuery::new(
        request.tenant_id.as_str(),
        dependency.index_type.as_str(),
        request.index_value.as_str(),
        limit,
    )
    .entity_type(dependency.downstream_entity_type.as_str());
    if request.upstream_entity_type == dependency.downstream_entity_type {
        query.excluding(request.upstream_entity_key.as_str())
    } else {
        query
    }
}

/// Scalar or array-of-scalars at `path`; absent and null contribute nothing.
fn collect_index_values(doc: &Value, path: &str, out: &mut BTreeSet<String>) -> Result<()> {
    let scalar = |v: &Value| -> Result<Option<String>> {
        match v {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            Value::Bool(_) | Value::Number(_) => Ok(Some(v.to_string())),
            _ => Err(EngineError::InvalidFieldPath {
                path: path.to_string(),
                reason: "fanout value must be a scalar or an array of scalars".to_string(),
            }),
        }
    };
    match pointer::get(doc, path)? {
        None => {}
        Some(Value::Array(items)) => {
            for item in items {
                out.extend(scalar(item)?);
            }
        }
        Some(v) => out.extend(scalar(v)?),
    }
    Ok(())
}
