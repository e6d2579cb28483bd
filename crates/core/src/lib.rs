//! Core types and shared functionality for tiercache.
//!
//! This crate provides:
//! - Two-tier (memory + SQLite) signature-keyed cache
//! - Delta-aware chat session persistence
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;
pub mod session;

pub use cache::{CacheFacade, Signature, StorageHandle};
pub use config::CacheConfig;
pub use error::{Error, ErrorKind};
pub use session::{ChatHistory, Message, Session, SessionStore};

/// Sortable UTC timestamp with microsecond resolution.
pub(crate) fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
