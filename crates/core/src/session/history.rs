//! In-memory session manager with write-through persistence.
//!
//! `ChatHistory` owns the working set of sessions. Every mutation is recorded
//! in a [`DirtyTracker`] and flushed immediately:
//!
//! 1. tracked deltas through [`SessionStore::apply_deltas`]
//! 2. on failure, a full [`SessionStore::save_all`] resync
//! 3. on failure again, a forced JSON mirror, which is then the only copy
//!
//! The tracker is cleared only once SQLite has accepted the changes, so a
//! later flush retries whatever is still pending.
//!
//! Mutations hold the state lock through the flush, so SQLite sees changes in
//! the order they were made. Readers such as [`ChatHistory::get_session`]
//! wait behind an in-flight flush, for at most the store's busy timeout plus
//! its retry delays.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use super::legacy::{self, SnapshotRef};
use super::model::{Message, Session};
use super::store::{DeltaReport, SessionStore};
use super::tracker::DirtyTracker;
use crate::Error;
use crate::cache::SnapshotMirror;
use crate::config::CacheConfig;

/// Which path a flush took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Clean,
    /// Deltas applied.
    Applied(DeltaReport),
    /// Deltas failed; the full state was rewritten instead.
    Resynced,
    /// SQLite rejected both paths; only the JSON mirror holds the changes.
    MirrorOnly,
}

#[derive(Debug, Default)]
struct HistoryState {
    sessions: BTreeMap<String, Session>,
    tracker: DirtyTracker,
}

/// Session manager backed by a [`SessionStore`] and a [`SnapshotMirror`].
#[derive(Debug)]
pub struct ChatHistory {
    store: SessionStore,
    mirror: SnapshotMirror,
    state: Mutex<HistoryState>,
}

impl ChatHistory {
    /// Open the configured chat database and snapshot.
    pub fn open(config: &CacheConfig) -> Self {
        let store = SessionStore::from_config(config);
        let mirror = SnapshotMirror::new(config.chat_snapshot_path(), config.mirror_interval());
        Self::with_parts(store, mirror)
    }

    /// Load sessions from SQLite, or from the snapshot when SQLite has none.
    ///
    /// A snapshot import is persisted once with `save_all`. Load failures are
    /// logged and leave the history empty.
    pub fn with_parts(store: SessionStore, mirror: SnapshotMirror) -> Self {
        let mut sessions = match store.load_all() {
            Ok(sessions) => sessions,
            Err(err) => {
                tracing::warn!(path = %store.storage().path().display(), error = %err, "Session store unavailable");
                Vec::new()
            }
        };

        if sessions.is_empty()
            && let Some(imported) = load_legacy(&mirror)
        {
            if let Err(err) = store.save_all(&imported) {
                tracing::warn!(error = %err, "Failed to persist imported sessions");
            }
            sessions = imported;
        }

        tracing::debug!(sessions = sessions.len(), "Chat history loaded");
        let sessions = sessions.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self { store, mirror, state: Mutex::new(HistoryState { sessions, tracker: DirtyTracker::new() }) }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn mirror(&self) -> &SnapshotMirror {
        &self.mirror
    }

    pub fn create_session(&self, title: &str) -> Result<Session, Error> {
        self.insert_session(Session::new(Uuid::new_v4().to_string(), title))
    }

    /// Insert or replace a session under its own id.
    pub fn insert_session(&self, session: Session) -> Result<Session, Error> {
        if session.id.is_empty() {
            return Err(Error::InvalidInput("session id must not be empty".into()));
        }
        let mut state = self.state.lock();
        state.tracker.mark_changed(&session.id);
        state.sessions.insert(session.id.clone(), session.clone());
        self.flush_locked(&mut state)?;
        Ok(session)
    }

    /// Append a message and return the session's new message count.
    pub fn append_message(&self, id: &str, message: Message) -> Result<usize, Error> {
        self.update(id, |session| {
            session.messages.push(message);
            session.messages.len()
        })
    }

    pub fn replace_messages(&self, id: &str, messages: Vec<Message>) -> Result<(), Error> {
        self.update(id, |session| session.messages = messages)
    }

    pub fn rename_session(&self, id: &str, title: &str) -> Result<(), Error> {
        self.update(id, |session| session.title = title.to_string())
    }

    /// Returns false when no such session existed.
    pub fn delete_session(&self, id: &str) -> Result<bool, Error> {
        let mut state = self.state.lock();
        if state.sessions.remove(id).is_none() {
            return Ok(false);
        }
        state.tracker.mark_deleted(id);
        self.flush_locked(&mut state)?;
        Ok(true)
    }

    pub fn clear_all(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.sessions.clear();
        state.tracker.mark_clear_all();
        self.flush_locked(&mut state)?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.state.lock().sessions.get(id).cloned()
    }

    /// All sessions, most recently updated first.
    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.state.lock().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when changes are waiting for SQLite.
    pub fn has_pending(&self) -> bool {
        !self.state.lock().tracker.is_empty()
    }

    /// Persist pending changes.
    ///
    /// Returns an error only when SQLite and the mirror both failed.
    pub fn flush(&self) -> Result<FlushOutcome, Error> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    /// Write the mirror now regardless of the throttle.
    pub fn export_snapshot(&self) -> Result<(), Error> {
        let state = self.state.lock();
        self.mirror.write(&SnapshotRef::new(&state.sessions))
    }

    fn update<R>(&self, id: &str, apply: impl FnOnce(&mut Session) -> R) -> Result<R, Error> {
        let mut state = self.state.lock();
        let session = state.sessions.get_mut(id).ok_or_else(|| Error::InvalidInput(format!("unknown session: {id}")))?;
        let result = apply(session);
        session.touch();
        state.tracker.mark_changed(id);
        self.flush_locked(&mut state)?;
        Ok(result)
    }

    fn flush_locked(&self, state: &mut HistoryState) -> Result<FlushOutcome, Error> {
        if state.tracker.is_empty() {
            return Ok(FlushOutcome::Clean);
        }
        let destructive = state.tracker.is_destructive();

        match self.apply_tracked(state) {
            Ok(report) => {
                state.tracker.reset();
                self.mirror.maybe_sync(&SnapshotRef::new(&state.sessions), destructive);
                return Ok(FlushOutcome::Applied(report));
            }
            Err(err) => {
                tracing::warn!(error = %err, "Delta flush failed, falling back to full save");
            }
        }

        let all: Vec<Session> = state.sessions.values().cloned().collect();
        match self.store.save_all(&all) {
            Ok(()) => {
                state.tracker.reset();
                self.mirror.maybe_sync(&SnapshotRef::new(&state.sessions), destructive);
                Ok(FlushOutcome::Resynced)
            }
            Err(err) => {
                tracing::warn!(error = %err, "Full save failed, forcing snapshot mirror");
                if self.mirror.maybe_sync(&SnapshotRef::new(&state.sessions), true) {
                    Ok(FlushOutcome::MirrorOnly)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn apply_tracked(&self, state: &HistoryState) -> Result<DeltaReport, Error> {
        let tracker = &state.tracker;
        let changed: Vec<&Session> = tracker.changed().filter_map(|id| state.sessions.get(id)).collect();

        if !tracker.clear_all() {
            let deleted: Vec<&str> = tracker.deleted().collect();
            return self.store.apply_deltas(&changed, &deleted, false);
        }

        // clear_all ignores other deltas, so sessions created after it go in a second pass
        let mut report = self.store.apply_deltas(&[], &[], true)?;
        if !changed.is_empty() {
            let rest = self.store.apply_deltas(&changed, &[], false)?;
            report.sessions_written = rest.sessions_written;
            report.messages_appended = rest.messages_appended;
            report.full_rewrites = rest.full_rewrites;
        }
        Ok(report)
    }
}

fn load_legacy(mirror: &SnapshotMirror) -> Option<Vec<Session>> {
    let value = match mirror.load::<Value>() {
        Ok(Some(value)) => value,
        Ok(None) => return None,
        Err(err) => {
            tracing::warn!(path = %mirror.path().display(), error = %err, "Unreadable chat snapshot");
            return None;
        }
    };
    match legacy::load_snapshot(value) {
        Ok(loaded) if !loaded.sessions.is_empty() => Some(loaded.sessions),
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(path = %mirror.path().display(), error = %err, "Unsupported chat snapshot");
            None
        }
    }
}
