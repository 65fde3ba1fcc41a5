//! Infrastructure layer - Storage adapters
//!
//! - `memory_store`: in-process backend
//! - `postgres_store`: PostgreSQL backend (feature `postgres`)

pub mod memory_store;

#[cfg(feature = "postgres")]
pub mod postgres_store;

pub use memory_store::InMemoryStore;

#[cfg(feature = "postgres")]
pub use postgres_store::{PostgresConfig, PostgresStore};
