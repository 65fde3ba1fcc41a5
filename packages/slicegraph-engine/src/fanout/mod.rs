//! Fanout: propagating an upstream change to the downstream entities that
//! reference it.
//!
//! - `config`: dependencies, policies, circuit breaker, retry
//! - `job`: job record and its state machine
//! - `trigger`: where discovered entities are sent
//! - `gate`: priority-ordered concurrency admission
//! - `engine`: discovery, batching, dedup, concurrency

pub mod config;
pub mod engine;
pub mod gate;
pub mod job;
pub mod trigger;

pub use config::{
    CircuitBreakerAction, FanoutConfig, FanoutDependency, FanoutPolicy, FanoutPriority,
    IndexValueSource, RetryConfig,
};
pub use engine::{FanoutEngine, FanoutOutcome};
pub use gate::{GatePermit, PriorityGate};
pub use job::{FanoutJob, FanoutJobState, FanoutJobStateMachine, FanoutRequest};
pub use trigger::{DownstreamTarget, DownstreamTrigger, OutboxRecomputeTrigger};
