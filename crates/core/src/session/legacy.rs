//! Versioned loader for JSON session snapshots.
//!
//! Snapshot shapes, oldest first:
//!
//! - v0: a bare list of messages (`[{role, content | parts, timestamp}]`)
//! - v1: an object mapping session id to session
//! - v2: `{"version": 2, "sessions": {id: session}}`
//!
//! Loading detects the shape and runs each pure migration step in turn until
//! the value is current.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::model::Session;
use crate::Error;

pub const SNAPSHOT_VERSION: u64 = 2;

/// Id given to the single session recovered from a v0 message list.
pub const LEGACY_SESSION_ID: &str = "legacy";

/// Current on-disk snapshot shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub version: u64,
    pub sessions: BTreeMap<String, Session>,
}

/// Borrowed form of [`SnapshotFile`] for writing without cloning.
#[derive(Debug, Serialize)]
pub struct SnapshotRef<'a> {
    pub version: u64,
    pub sessions: &'a BTreeMap<String, Session>,
}

impl<'a> SnapshotRef<'a> {
    pub fn new(sessions: &'a BTreeMap<String, Session>) -> Self {
        Self { version: SNAPSHOT_VERSION, sessions }
    }
}

/// Result of loading a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSnapshot {
    pub sessions: Vec<Session>,
    /// Version the file was written in, when it needed migration.
    pub migrated_from: Option<u64>,
}

/// Detect the shape of a snapshot value.
pub fn detect_version(value: &Value) -> Result<u64, Error> {
    match value {
        Value::Array(_) => Ok(0),
        Value::Object(map) => match (map.get("version"), map.get("sessions")) {
            (Some(Value::Number(v)), Some(Value::Object(_))) => v
                .as_u64()
                .ok_or_else(|| Error::InvalidInput(format!("unsupported snapshot version {v}"))),
            _ => Ok(1),
        },
        other => Err(Error::InvalidInput(format!("unrecognized snapshot shape: {}", type_name(other)))),
    }
}

/// Bring `value` to the current shape and decode it.
pub fn load_snapshot(value: Value) -> Result<LoadedSnapshot, Error> {
    let original = detect_version(&value)?;
    if original > SNAPSHOT_VERSION {
        return Err(Error::InvalidInput(format!("snapshot version {original} is newer than {SNAPSHOT_VERSION}")));
    }

    let mut value = value;
    let mut version = original;
    while version < SNAPSHOT_VERSION {
        value = match version {
            0 => migrate_v0(value)?,
            _ => migrate_v1(value)?,
        };
        version += 1;
    }

    let file: SnapshotFile = serde_json::from_value(value)?;
    let mut sessions: Vec<Session> = file.sessions.into_values().collect();
    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));

    if original < SNAPSHOT_VERSION {
        tracing::info!(from = original, to = SNAPSHOT_VERSION, sessions = sessions.len(), "Migrated legacy snapshot");
    }
    Ok(LoadedSnapshot { sessions, migrated_from: (original < SNAPSHOT_VERSION).then_some(original) })
}

/// v0 → v1: wrap the message list in one session.
fn migrate_v0(value: Value) -> Result<Value, Error> {
    let Value::Array(items) = value else {
        return Err(Error::InvalidInput("v0 snapshot must be a list".into()));
    };
    let messages: Vec<Value> = items.into_iter().map(normalize_message).collect();
    let stamp = messages
        .iter()
        .filter_map(|m| m.get("timestamp").and_then(Value::as_str))
        .max()
        .map(str::to_string)
        .unwrap_or_else(crate::timestamp);

    let mut sessions = Map::new();
    sessions.insert(
        LEGACY_SESSION_ID.to_string(),
        json!({
            "id": LEGACY_SESSION_ID,
            "title": "Imported history",
            "created_at": stamp,
            "updated_at": stamp,
            "messages": messages,
        }),
    );
    Ok(Value::Object(sessions))
}

/// v1 → v2: add the version wrapper and fill fields older writers omitted.
fn migrate_v1(value: Value) -> Result<Value, Error> {
    let Value::Object(entries) = value else {
        return Err(Error::InvalidInput("v1 snapshot must be an object".into()));
    };

    let now = crate::timestamp();
    let mut sessions = Map::new();
    for (id, raw) in entries {
        let Value::Object(mut session) = raw else {
            tracing::warn!(id, "Skipping malformed legacy session");
            continue;
        };
        session.entry("id").or_insert_with(|| Value::String(id.clone()));
        session.entry("title").or_insert_with(|| Value::String("Untitled".into()));
        let created = session.get("created_at").cloned().unwrap_or_else(|| Value::String(now.clone()));
        session.entry("created_at").or_insert_with(|| created.clone());
        session.entry("updated_at").or_insert(created);
        if let Some(Value::Array(messages)) = session.remove("messages") {
            session.insert("messages".into(), Value::Array(messages.into_iter().map(normalize_message).collect()));
        }
        sessions.insert(id, Value::Object(session));
    }

    Ok(json!({ "version": SNAPSHOT_VERSION, "sessions": sessions }))
}

/// Old messages carried a `content` string instead of `parts`.
fn normalize_message(message: Value) -> Value {
    let Value::Object(mut map) = message else {
        return json!({ "role": "user", "parts": [{ "text": message.to_string() }] });
    };
    if !map.contains_key("parts") {
        let parts = match map.remove("content") {
            Some(Value::String(text)) => json!([{ "text": text }]),
            Some(Value::Array(parts)) => Value::Array(parts),
            Some(other) => json!([{ "text": other.to_string() }]),
            None => json!([]),
        };
        map.insert("parts".into(), parts);
    }
    map.entry("role").or_insert_with(|| Value::String("user".into()));
    Value::Object(map)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
