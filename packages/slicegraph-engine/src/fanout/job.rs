//! Fanout job record and lifecycle
//!
//! PENDING → IN_PROGRESS → COMPLETED | FAILED | SKIPPED | ASYNC_QUEUED.
//! PENDING may also end directly in FAILED or SKIPPED (deduplicated). Only
//! FAILED goes back to PENDING, through `retry`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::FanoutPriority;
use crate::error::{EngineError, ErrorCategory, Result};

/// One fanout to perform: recompute every downstream entity of
/// `dependency` indexed under `index_value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutRequest {
    pub tenant_id: String,
    pub dependency: String,
    pub upstream_entity_type: String,
    pub upstream_entity_key: String,
    pub upstream_version: i64,
    pub index_value: String,
    pub priority: FanoutPriority,
}

impl FanoutRequest {
    /// Key used by the deduplication window.
    pub fn dedup_key(&self) -> String {
        format!("{}|{}|{}", self.tenant_id, self.dependency, self.index_value)
    }
}

/// Fanout job state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FanoutJobState {
    Pending {
        queued_at: DateTime<Utc>,
    },
    InProgress {
        started_at: DateTime<Utc>,
        discovered: u64,
        triggered: u64,
        batches: u32,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
        triggered: u64,
        batches: u32,
    },
    Failed {
        failed_at: DateTime<Utc>,
        error: String,
        error_category: ErrorCategory,
        attempts: u32,
    },
    Skipped {
        skipped_at: DateTime<Utc>,
        reason: String,
    },
    AsyncQueued {
        queued_at: DateTime<Utc>,
        outbox_id: Uuid,
        discovered: u64,
    },
}

impl FanoutJobState {
    pub fn state_name(&self) -> &'static str {
        match self {
            FanoutJobState::Pending { .. } => "pending",
            FanoutJobState::InProgress { .. } => "in_progress",
            FanoutJobState::Completed { .. } => "completed",
            FanoutJobState::Failed { .. } => "failed",
            FanoutJobState::Skipped { .. } => "skipped",
            FanoutJobState::AsyncQueued { .. } => "async_queued",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FanoutJobState::Completed { .. }
                | FanoutJobState::Skipped { .. }
                | FanoutJobState::AsyncQueued { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutJob {
    pub id: Uuid,
    pub request: FanoutRequest,
    pub state: FanoutJobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FanoutJob {
    pub fn new_pending(request: FanoutRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request,
            state: FanoutJobState::Pending { queued_at: now },
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

pub struct FanoutJobStateMachine<'a> {
    job: &'a mut FanoutJob,
}

impl<'a> FanoutJobStateMachine<'a> {
    pub fn new(job: &'a mut FanoutJob) -> Self {
        Self { job }
    }

    fn invalid(&self, to: &str) -> EngineError {
        EngineError::InvalidStateTransition {
            from: self.job.state.state_name().to_string(),
            to: to.to_string(),
        }
    }

    fn set(&mut self, state: FanoutJobState, now: DateTime<Utc>) {
        self.job.state = state;
        self.job.updated_at = now;
    }

    /// Transition: PENDING → IN_PROGRESS
    pub fn start(&mut self) -> Result<()> {
        match &self.job.state {
            FanoutJobState::Pending { .. } => {
                let now = Utc::now();
                self.job.attempts += 1;
                self.set(
                    FanoutJobState::InProgress {
                        started_at: now,
                        discovered: 0,
                        triggered: 0,
                        batches: 0,
                    },
                    now,
                );
                Ok(())
            }
            _ => Err(self.invalid("in_progress")),
        }
    }

    pub fn record_discovered(&mut self, count: u64) -> Result<()> {
        match &mut self.job.state {
            FanoutJobState::InProgress { discovered, .. } => {
                *discovered = count;
                self.job.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.invalid("in_progress")),
        }
    }

    pub fn record_batch(&mut self, triggered_now: u64) -> Result<()> {
        match &mut self.job.state {
            FanoutJobState::InProgress {
                triggered, batches, ..
            } => {
                *triggered += triggered_now;
                *batches += 1;
                self.job.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.invalid("in_progress")),
        }
    }

    /// Transition: IN_PROGRESS → COMPLETED
    pub fn complete(&mut self) -> Result<()> {
        match &self.job.state {
            FanoutJobState::InProgress {
                started_at,
                triggered,
                batches,
                ..
            } => {
                let now = Utc::now();
                let duration_ms = (now - *started_at).num_milliseconds().max(0) as u64;
                let state = FanoutJobState::Completed {
                    started_at: *started_at,
                    completed_at: now,
                    duration_ms,
                    triggered: *triggered,
                    batches: *batches,
                };
                self.set(state, now);
                Ok(())
            }
            _ => Err(self.invalid("completed")),
        }
    }

    /// Transition: PENDING | IN_PROGRESS → FAILED
    pub fn fail(&mut self, error: &EngineError) -> Result<()> {
        match &self.job.state {
            FanoutJobState::Pending { .. } | FanoutJobState::InProgress { .. } => {
                let now = Utc::now();
                let state = FanoutJobState::Failed {
                    failed_at: now,
                    error: error.to_string(),
                    error_category: error.category(),
                    attempts: self.job.attempts,
                };
                self.set(state, now);
                Ok(())
            }
            _ => Err(self.invalid("failed")),
        }
    }

    /// Transition: PENDING | IN_PROGRESS → SKIPPED
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<()> {
        match &self.job.state {
            FanoutJobState::Pending { .. } | FanoutJobState::InProgress { .. } => {
                let now = Utc::now();
                self.set(
                    FanoutJobState::Skipped {
                        skipped_at: now,
                        reason: reason.into(),
                    },
                    now,
                );
                Ok(())
            }
            _ => Err(self.invalid("skipped")),
        }
    }

    /// Transition: IN_PROGRESS → ASYNC_QUEUED
    pub fn queue_async(&mut self, outbox_id: Uuid) -> Result<()> {
        match &self.job.state {
            FanoutJobState::InProgress { discovered, .. } => {
                let now = Utc::now();
                let state = FanoutJobState::AsyncQueued {
                    queued_at: now,
                    outbox_id,
                    discovered: *discovered,
                };
                self.set(state, now);
                Ok(())
            }
            _ => Err(self.invalid("async_queued")),
        }
    }

    /// Transition: FAILED → PENDING
    pub fn retry(&mut self) -> Result<()> {
        match &self.job.state {
            FanoutJobState::Failed { .. } => {
                let now = Utc::now();
                self.set(FanoutJobState::Pending { queued_at: now }, now);
                Ok(())
            }
            _ => Err(self.invalid("pending")),
        }
    }
}
