//! Chat session persistence.
//!
//! - [`SessionStore`] writes sessions to SQLite, appending new messages when
//!   the stored history is a prefix of the in-memory one
//! - [`ChatHistory`] keeps the working set in memory and flushes tracked
//!   changes through the store, mirroring to JSON
//! - [`legacy`] reads older JSON snapshot formats

pub mod history;
pub mod legacy;
pub mod model;
pub mod store;
pub mod tracker;

pub use history::{ChatHistory, FlushOutcome};
pub use legacy::{LoadedSnapshot, SnapshotFile, load_snapshot};
pub use model::{Message, Session};
pub use store::{DeltaReport, SessionStore};
pub use tracker::DirtyTracker;
