//! Layered signature-keyed cache.
//!
//! A process-local memory tier sits in front of a SQLite table. Entries are
//! valid only for the exact [`Signature`] they were computed from. This module
//! provides:
//!
//! - Signature sources (file stat, composites, version counters)
//! - Single-flight schema initialization per database file
//! - WAL-mode connections with busy timeout and bounded retry
//! - Bounded LRU memory tier and row-bounded persistent tier
//! - A throttled JSON mirror for inspection and recovery

pub mod connection;
pub mod facade;
pub mod hash;
pub mod memory;
pub mod mirror;
pub mod persistent;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod signature;

pub use crate::Error;

pub use connection::StorageHandle;
pub use facade::{CacheFacade, CacheStats};
pub use memory::MemoryTier;
pub use mirror::SnapshotMirror;
pub use persistent::{KvOptions, KvStore, WriteOutcome};
pub use registry::SchemaRegistry;
pub use retry::RetryPolicy;
pub use schema::Schema;
pub use signature::{Signature, composite_signature, file_signature, recent_files_signature};
