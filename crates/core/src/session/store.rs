//! Delta-aware session persistence.
//!
//! Sessions live in `chat_sessions`, their messages in `chat_messages` keyed
//! by `(session_id, idx)`. Chat histories grow by appending, so when the
//! incoming list is longer than the stored one and the previously last stored
//! message still matches, a flush only inserts the new tail. Any other shape
//! (same length, shorter, or a changed last message) rewrites the session's
//! messages.
//!
//! Only the last stored message is compared on the append path. Earlier
//! messages are assumed unchanged when it matches.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use rusqlite::{OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Serialize;

use super::model::{Message, Session};
use crate::Error;
use crate::cache::{Schema, StorageHandle};
use crate::config::CacheConfig;

/// What one `apply_deltas` call wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeltaReport {
    pub cleared: bool,
    pub sessions_deleted: usize,
    /// Session rows inserted or updated; unchanged metadata is not counted.
    pub sessions_written: usize,
    pub messages_appended: usize,
    pub full_rewrites: usize,
}

/// How a session's messages were persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageWrite {
    Unchanged,
    Appended(usize),
    Rewritten,
}

/// SQLite-backed session store.
#[derive(Debug, Clone)]
pub struct SessionStore {
    storage: StorageHandle,
}

impl SessionStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self { storage: StorageHandle::new(path, Schema::sessions()) }
    }

    /// Wrap a configured handle. Its schema must be [`Schema::sessions`].
    pub fn new(storage: StorageHandle) -> Result<Self, Error> {
        if !storage.schema().owns("chat_sessions") || !storage.schema().owns("chat_messages") {
            return Err(Error::InvalidInput(format!("schema {} is not the session schema", storage.schema().name())));
        }
        Ok(Self { storage })
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let storage = StorageHandle::new(config.chat_db_path(), Schema::sessions())
            .with_busy_timeout(config.busy_timeout())
            .with_retry(config.retry_policy());
        Self { storage }
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    /// Persist pending changes in one transaction.
    ///
    /// `clear_all` deletes every session and ignores the other arguments.
    /// Deleted ids cascade to their messages. Changed sessions get a metadata
    /// upsert that is a no-op when nothing differs, then either an append of
    /// the new tail or a full message rewrite.
    pub fn apply_deltas(&self, changed: &[&Session], deleted: &[&str], clear_all: bool) -> Result<DeltaReport, Error> {
        let encoded: Vec<(&Session, Vec<EncodedMessage>)> = changed
            .iter()
            .map(|session| Ok((*session, encode_messages(&session.messages)?)))
            .collect::<Result<_, Error>>()?;

        let report = self.storage.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut report = DeltaReport::default();

            if clear_all {
                tx.execute("DELETE FROM chat_sessions", [])?;
                tx.commit()?;
                report.cleared = true;
                return Ok(report);
            }

            for id in deleted {
                report.sessions_deleted += tx.execute("DELETE FROM chat_sessions WHERE id = ?1", params![id])?;
            }

            for (session, messages) in &encoded {
                if upsert_meta(&tx, session)? {
                    report.sessions_written += 1;
                }
                match persist_messages(&tx, &session.id, messages)? {
                    MessageWrite::Unchanged => {}
                    MessageWrite::Appended(n) => report.messages_appended += n,
                    MessageWrite::Rewritten => report.full_rewrites += 1,
                }
            }

            tx.commit()?;
            Ok(report)
        })?;

        tracing::debug!(?report, "Applied session deltas");
        Ok(report)
    }

    /// Replace the stored state with `sessions`.
    pub fn save_all(&self, sessions: &[Session]) -> Result<(), Error> {
        let encoded: Vec<(&Session, Vec<EncodedMessage>)> = sessions
            .iter()
            .map(|session| Ok((session, encode_messages(&session.messages)?)))
            .collect::<Result<_, Error>>()?;
        let keep: HashSet<&str> = sessions.iter().map(|s| s.id.as_str()).collect();

        self.storage.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing: Vec<String> = {
                let mut stmt = tx.prepare("SELECT id FROM chat_sessions")?;
                stmt.query_map([], |row| row.get(0))?.collect::<Result<_, _>>()?
            };
            for id in existing.iter().filter(|id| !keep.contains(id.as_str())) {
                tx.execute("DELETE FROM chat_sessions WHERE id = ?1", params![id])?;
            }

            for (session, messages) in &encoded {
                upsert_meta(&tx, session)?;
                rewrite_messages(&tx, &session.id, messages)?;
            }

            tx.commit()?;
            Ok(())
        })?;

        tracing::info!(sessions = sessions.len(), "Saved all sessions");
        Ok(())
    }

    /// All sessions, most recently updated first.
    pub fn load_all(&self) -> Result<Vec<Session>, Error> {
        self.storage.with_conn(|conn| {
            let mut sessions: Vec<Session> = {
                let mut stmt = conn.prepare(
                    "SELECT id, title, created_at, updated_at, model, owner_id
                     FROM chat_sessions ORDER BY updated_at DESC, id",
                )?;
                stmt.query_map([], session_from_row)?.collect::<Result<_, _>>()?
            };

            let mut messages: BTreeMap<String, Vec<Message>> = BTreeMap::new();
            let mut stmt = conn.prepare(
                "SELECT session_id, role, parts_json, timestamp FROM chat_messages ORDER BY session_id, idx",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?;
            for row in rows {
                let (session_id, role, parts_json, timestamp) = row?;
                messages
                    .entry(session_id)
                    .or_default()
                    .push(Message { role, parts: serde_json::from_str(&parts_json)?, timestamp });
            }

            for session in &mut sessions {
                session.messages = messages.remove(&session.id).unwrap_or_default();
            }
            Ok(sessions)
        })
    }

    pub fn load_session(&self, id: &str) -> Result<Option<Session>, Error> {
        self.storage.with_conn(|conn| {
            let session = conn
                .query_row(
                    "SELECT id, title, created_at, updated_at, model, owner_id FROM chat_sessions WHERE id = ?1",
                    params![id],
                    session_from_row,
                )
                .optional()?;
            let Some(mut session) = session else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT role, parts_json, timestamp FROM chat_messages WHERE session_id = ?1 ORDER BY idx",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?))
            })?;
            for row in rows {
                let (role, parts_json, timestamp) = row?;
                session.messages.push(Message { role, parts: serde_json::from_str(&parts_json)?, timestamp });
            }
            Ok(Some(session))
        })
    }

    pub fn delete_session(&self, id: &str) -> Result<bool, Error> {
        self.storage
            .with_conn(|conn| Ok(conn.execute("DELETE FROM chat_sessions WHERE id = ?1", params![id])? > 0))
    }

    pub fn session_count(&self) -> Result<usize, Error> {
        let count: i64 = self
            .storage
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM chat_sessions", [], |row| row.get(0))?))?;
        Ok(count as usize)
    }

    pub fn message_count(&self, id: &str) -> Result<usize, Error> {
        let count: i64 = self.storage.with_conn(|conn| {
            let sql = "SELECT COUNT(*) FROM chat_messages WHERE session_id = ?1";
            Ok(conn.query_row(sql, params![id], |row| row.get(0))?)
        })?;
        Ok(count as usize)
    }
}

/// A message in its stored column form.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EncodedMessage {
    role: String,
    parts_json: String,
    timestamp: Option<String>,
}

fn encode_messages(messages: &[Message]) -> Result<Vec<EncodedMessage>, Error> {
    messages
        .iter()
        .map(|m| {
            Ok(EncodedMessage { role: m.role.clone(), parts_json: m.parts_json()?, timestamp: m.timestamp.clone() })
        })
        .collect()
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        model: row.get(4)?,
        owner_id: row.get(5)?,
        messages: Vec::new(),
    })
}

/// Insert or update session metadata. Returns false when the stored row
/// already matched and no UPDATE was performed.
fn upsert_meta(tx: &Transaction<'_>, session: &Session) -> Result<bool, Error> {
    let written = tx.execute(
        "INSERT INTO chat_sessions (id, title, created_at, updated_at, model, owner_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            model = excluded.model,
            owner_id = excluded.owner_id
         WHERE chat_sessions.title IS NOT excluded.title
            OR chat_sessions.created_at IS NOT excluded.created_at
            OR chat_sessions.updated_at IS NOT excluded.updated_at
            OR chat_sessions.model IS NOT excluded.model
            OR chat_sessions.owner_id IS NOT excluded.owner_id",
        params![session.id, session.title, session.created_at, session.updated_at, session.model, session.owner_id],
    )?;
    Ok(written > 0)
}

fn persist_messages(
    tx: &Transaction<'_>, session_id: &str, messages: &[EncodedMessage],
) -> Result<MessageWrite, Error> {
    let last: Option<(i64, EncodedMessage)> = tx
        .query_row(
            "SELECT idx, role, parts_json, timestamp FROM chat_messages
             WHERE session_id = ?1 ORDER BY idx DESC LIMIT 1",
            params![session_id],
            |row| {
                let message = EncodedMessage { role: row.get(1)?, parts_json: row.get(2)?, timestamp: row.get(3)? };
                Ok((row.get(0)?, message))
            },
        )
        .optional()?;

    let Some((last_idx, last_stored)) = last else {
        insert_messages(tx, session_id, messages, 0)?;
        return Ok(if messages.is_empty() { MessageWrite::Unchanged } else { MessageWrite::Appended(messages.len()) });
    };

    let persisted = usize::try_from(last_idx).map(|idx| idx + 1).unwrap_or(0);
    let tail_matches = persisted > 0 && messages.get(persisted - 1) == Some(&last_stored);

    // only growth past a matching tail is an append; anything else may edit stored rows
    if !tail_matches || messages.len() <= persisted {
        rewrite_messages(tx, session_id, messages)?;
        return Ok(MessageWrite::Rewritten);
    }

    insert_messages(tx, session_id, &messages[persisted..], persisted)?;
    Ok(MessageWrite::Appended(messages.len() - persisted))
}

fn rewrite_messages(tx: &Transaction<'_>, session_id: &str, messages: &[EncodedMessage]) -> Result<(), Error> {
    tx.execute("DELETE FROM chat_messages WHERE session_id = ?1", params![session_id])?;
    insert_messages(tx, session_id, messages, 0)
}

fn insert_messages(
    tx: &Transaction<'_>, session_id: &str, messages: &[EncodedMessage], first_idx: usize,
) -> Result<(), Error> {
    if messages.is_empty() {
        return Ok(());
    }
    let mut stmt = tx.prepare_cached(
        "INSERT INTO chat_messages (session_id, idx, role, parts_json, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (offset, message) in messages.iter().enumerate() {
        let idx = (first_idx + offset) as i64;
        stmt.execute(params![session_id, idx, message.role, message.parts_json, message.timestamp])?;
    }
    Ok(())
}
