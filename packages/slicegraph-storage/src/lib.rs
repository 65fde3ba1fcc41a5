//! Slicegraph storage: versioned raw data, slices, inverted index, outbox
//!
//! ## Core Principles
//!
//! 1. **Append-only versions**: raw documents are immutable per version
//! 2. **Idempotency**: every write is keyed by version and content hash
//! 3. **Transactional outbox**: events are written with the data they describe
//!
//! ## Backends
//!
//! - `InMemoryStore`: single-process backend (tests, embedded use)
//! - `PostgresStore`: `FOR UPDATE SKIP LOCKED` claims (feature `postgres`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use slicegraph_storage::{InMemoryStore, IngestStore, OutboxStore, RawDataRecord, OutboxEntry};
//!
//! let store = InMemoryStore::new();
//! let record = RawDataRecord::new("t1", "order-1", "ORDER", 1, json!({"name": "A"}));
//! store.put_raw_with_outbox(&record, entry).await?;
//!
//! let batch = store.claim_with_ordering(32, Some("ORDER"), Some("worker-1")).await?;
//! ```

pub mod domain;
pub mod error;
pub mod hashing;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};
pub use hashing::content_hash;

pub use domain::{
    ClaimOrder, ClaimRequest, Clock, IndexQuery, IngestReceipt, IngestStore, InvertedIndexEntry,
    InvertedIndexStore, ManualClock, OutboxEntry, OutboxStatus, OutboxStore, Page, PutOutcome,
    RawDataRecord, RawDataStore, SliceKey, SliceRecord, SliceStore, SystemClock,
};
pub use infrastructure::InMemoryStore;

#[cfg(feature = "postgres")]
pub use infrastructure::{PostgresConfig, PostgresStore};
