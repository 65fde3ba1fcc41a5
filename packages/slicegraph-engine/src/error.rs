use slicegraph_storage::{ErrorKind, StorageError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Idempotency violation: {0}")]
    IdempotencyViolation(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Unmapped change paths for rule set {rule_set}: {paths:?}")]
    UnmappedChangePath { rule_set: String, paths: Vec<String> },

    #[error("Missing required field {path} for slice {slice_type}")]
    MissingRequiredField { slice_type: String, path: String },

    #[error("Invalid field path {path}: {reason}")]
    InvalidFieldPath { path: String, reason: String },

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Fanout limit exceeded: {count} > {limit} for {dependency}")]
    FanoutLimitExceeded {
        dependency: String,
        count: u64,
        limit: u64,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation<E: std::fmt::Display>(e: E) -> Self {
        Self::Validation(e.to_string())
    }

    pub fn not_found<E: std::fmt::Display>(e: E) -> Self {
        Self::NotFound(e.to_string())
    }

    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn invariant<E: std::fmt::Display>(e: E) -> Self {
        Self::InvariantViolation(e.to_string())
    }

    /// Retry classification used by the outbox worker.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Storage(e) if e.kind.is_transient() => ErrorCategory::Infrastructure,
            EngineError::Timeout(_) | EngineError::ExternalService(_) | EngineError::Other(_) => {
                ErrorCategory::Transient
            }
            EngineError::Storage(_)
            | EngineError::Validation(_)
            | EngineError::NotFound(_)
            | EngineError::IdempotencyViolation(_)
            | EngineError::UnmappedChangePath { .. }
            | EngineError::MissingRequiredField { .. }
            | EngineError::InvalidFieldPath { .. }
            | EngineError::InvariantViolation(_)
            | EngineError::FanoutLimitExceeded { .. }
            | EngineError::InvalidStateTransition { .. }
            | EngineError::Serialization(_)
            | EngineError::Config(_) => ErrorCategory::Permanent,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err.kind {
            ErrorKind::IdempotencyViolation => EngineError::IdempotencyViolation(err.message),
            ErrorKind::NotFound => EngineError::NotFound(err.message),
            ErrorKind::Validation => EngineError::Validation(err.message),
            _ => EngineError::Storage(err),
        }
    }
}

impl From<crate::config::ConfigError> for EngineError {
    fn from(err: crate::config::ConfigError) -> Self {
        EngineError::config(err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::serialization(err)
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retry automatically (timeout, downstream outage)
    Transient,
    /// Permanent error - don't retry (invalid input, unmapped change path)
    Permanent,
    /// Infrastructure error - alert ops (database unavailable)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(EngineError::validation(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
