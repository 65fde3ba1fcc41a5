//! Outbox worker and maintenance loops
//!
//! `OutboxWorker` claims entries, hands each to an `OutboxHandler`, and
//! settles the batch: successes are marked processed, failures are marked
//! failed with the error category in the reason. `OutboxMaintenance`
//! releases abandoned claims, dead-letters exhausted entries and requeues
//! the rest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slicegraph_storage::{ClaimOrder, ClaimRequest, OutboxEntry, OutboxStore, OutboxStatus};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::Result;

#[async_trait]
pub trait OutboxHandler: Send + Sync {
    async fn handle(&self, entry: &OutboxEntry) -> Result<()>;
}

/// How a worker claims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStrategy {
    Fifo,
    Priority,
    /// FIFO, one in-flight entry per aggregate in causal order
    #[default]
    Ordered,
    OrderedPriority,
}

impl ClaimStrategy {
    pub fn request(&self, limit: usize) -> ClaimRequest {
        let base = ClaimRequest::new(limit);
        match self {
            ClaimStrategy::Fifo => base,
            ClaimStrategy::Priority => base.order(ClaimOrder::Priority),
            ClaimStrategy::Ordered => base.causal(true),
            ClaimStrategy::OrderedPriority => base.order(ClaimOrder::Priority).causal(true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    /// Cap for the idle/error backoff
    pub max_backoff_ms: u64,
    pub claim_strategy: ClaimStrategy,
    /// Restrict claims to one aggregate type
    pub aggregate_type: Option<String>,
    pub workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval_ms: 100,
            max_backoff_ms: 5_000,
            claim_strategy: ClaimStrategy::Ordered,
            aggregate_type: None,
            workers: num_cpus::get(),
        }
    }
}

impl WorkerConfig {
    pub fn claim_request(&self, worker_id: &str) -> ClaimRequest {
        self.claim_strategy
            .request(self.batch_size)
            .aggregate_type(self.aggregate_type.as_deref())
            .worker(Some(worker_id))
    }

    fn backoff(&self, idle_rounds: u32) -> Duration {
        let base = self.poll_interval_ms.max(1);
        let factor = 1u64 << idle_rounds.min(16);
        Duration::from_millis(base.saturating_mul(factor).min(self.max_backoff_ms.max(base)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub processed: usize,
    pub failed: usize,
    /// Handled but not settled (store error or lost claim)
    pub unsettled: usize,
}

pub struct OutboxWorker {
    store: Arc<dyn OutboxStore>,
    handler: Arc<dyn OutboxHandler>,
    config: WorkerConfig,
    worker_id: String,
}

impl OutboxWorker {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        handler: Arc<dyn OutboxHandler>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            handler,
            config,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim one batch and settle it.
    pub async fn run_once(&self) -> Result<BatchReport> {
        let entries = self
            .store
            .claim_with(&self.config.claim_request(&self.worker_id))
            .await?;
        let mut report = BatchReport {
            claimed: entries.len(),
            ..BatchReport::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        let mut processed = Vec::with_capacity(entries.len());
        for entry in &entries {
            let span = info_span!(
                "outbox_entry",
                id = %entry.id,
                event_type = %entry.event_type,
                aggregate = %entry.aggregate_id,
                retry = entry.retry_count
            );
            match self.handler.handle(entry).instrument(span).await {
                Ok(()) => processed.push(entry.id),
                Err(err) => {
                    let category = err.category();
                    warn!(
                        id = %entry.id,
                        event_type = %entry.event_type,
                        category = category.as_str(),
                        error = %err,
                        "outbox entry failed"
                    );
                    let reason = format!("[{}] {}", category, err);
                    match self
                        .store
                        .mark_failed(entry.id, Some(self.worker_id.as_str()), &reason)
                        .await
                    {
                        Ok(()) => report.failed += 1,
                        Err(settle) => {
                            // Left PROCESSING; the visibility timeout requeues it
                            error!(
                                id = %entry.id,
                                worker = %self.worker_id,
                                error = %settle,
                                "could not mark outbox entry failed"
                            );
                            report.unsettled += 1;
                        }
                    }
                }
            }
        }

        if !processed.is_empty() {
            match self
                .store
                .mark_processed(&processed, Some(self.worker_id.as_str()))
                .await
            {
                Ok(settled) => {
                    report.processed = settled as usize;
                    let lost = processed.len().saturating_sub(report.processed);
                    if lost > 0 {
                        warn!(
                            worker = %self.worker_id,
                            lost,
                            "claims expired before settling; entries will be redelivered"
                        );
                        report.unsettled += lost;
                    }
                }
                Err(err) => {
                    error!(
                        worker = %self.worker_id,
                        count = processed.len(),
                        error = %err,
                        "could not mark outbox entries processed"
                    );
                    report.unsettled += processed.len();
                }
            }
        }
        debug!(
            worker = %self.worker_id,
            claimed = report.claimed,
            processed = report.processed,
            failed = report.failed,
            unsettled = report.unsettled,
            "outbox batch settled"
        );
        Ok(report)
    }

    /// Poll until cancelled, backing off while idle or failing.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(worker = %self.worker_id, "outbox worker started");
        let mut idle_rounds = 0u32;
        loop {
            let delay = match self.run_once().await {
                Ok(report) if report.claimed > 0 => {
                    idle_rounds = 0;
                    None
                }
                Ok(_) => {
                    idle_rounds = idle_rounds.saturating_add(1);
                    Some(self.config.backoff(idle_rounds - 1))
                }
                Err(err) => {
                    idle_rounds = idle_rounds.saturating_add(1);
                    error!(worker = %self.worker_id, error = %err, "outbox poll failed");
                    Some(self.config.backoff(idle_rounds - 1))
                }
            };

            if cancel.is_cancelled() {
                break;
            }
            if let Some(delay) = delay {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        info!(worker = %self.worker_id, "outbox worker stopped");
    }
}

/// Spawn `config.workers` workers sharing one handler.
pub fn spawn_workers(
    store: Arc<dyn OutboxStore>,
    handler: Arc<dyn OutboxHandler>,
    config: WorkerConfig,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..config.workers.max(1))
        .map(|i| {
            let worker = OutboxWorker::new(store.clone(), handler.clone(), config.clone())
                .with_worker_id(format!("worker-{}-{}", i, Uuid::new_v4()));
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(cancel).await })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub released: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
}

pub struct OutboxMaintenance {
    store: Arc<dyn OutboxStore>,
    visibility_timeout: Duration,
    max_retries: i32,
}

impl OutboxMaintenance {
    pub fn new(store: Arc<dyn OutboxStore>, visibility_timeout: Duration, max_retries: i32) -> Self {
        Self {
            store,
            visibility_timeout,
            max_retries,
        }
    }

    /// Release expired claims, dead-letter exhausted failures, requeue the
    /// remaining failures. Dead-lettering runs before the requeue so an
    /// exhausted entry is never retried again.
    pub async fn sweep(&self) -> Result<MaintenanceReport> {
        let released = self
            .store
            .release_expired_claims(self.visibility_timeout)
            .await?;
        let dead_lettered = self.store.move_to_dlq(self.max_retries).await?;
        let requeued = self.store.reset_all_failed().await?;

        if released + dead_lettered + requeued > 0 {
            info!(released, dead_lettered, requeued, "outbox maintenance sweep");
        }
        if dead_lettered > 0 {
            let dlq = self.store.count_by_status(OutboxStatus::Dlq).await?;
            warn!(dead_lettered, dlq_size = dlq, "entries moved to dead letter queue");
        }
        Ok(MaintenanceReport {
            released,
            dead_lettered,
            requeued,
        })
    }

    pub async fn run(&self, cancel: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        error!(error = %err, "outbox maintenance failed");
                    }
                }
            }
        }
    }
}
