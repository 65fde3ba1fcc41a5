//! Domain layer: versioned records, the outbox, and the storage ports
//!
//! # Core Principles
//!
//! 1. **Append-only raw data**: `(tenant, entity_key, version)` is written once
//! 2. **Idempotent writes**: same key + same hash is a successful no-op
//! 3. **Atomic claim**: an outbox entry is held by at most one worker
//!
//! # Port Traits
//!
//! - `RawDataStore`, `SliceStore`, `InvertedIndexStore`
//! - `OutboxStore`: claim, retry, visibility timeout, DLQ
//! - `IngestStore`: raw write + outbox entry in one transaction
//!
//! ```rust,ignore
//! use slicegraph_storage::domain::*;
//!
//! let record = RawDataRecord::new("t1", "order-1", "ORDER", 1, json!({"name": "A"}));
//! let entry = OutboxEntry::new("raw:t1:order-1:1", "ORDER", "order-1", "raw.ingested", json!({}));
//! let receipt = store.put_raw_with_outbox(&record, entry).await?;
//!
//! for claimed in store.claim(10, None, Some("worker-1")).await? {
//!     // ...
//!     store.mark_processed(&[claimed.id], Some("worker-1")).await?;
//! }
//! ```

pub mod clock;
pub mod models;
pub mod ports;

pub use clock::{Clock, ManualClock, SystemClock};
pub use models::*;
pub use ports::{IngestStore, InvertedIndexStore, OutboxStore, RawDataStore, SliceStore};
