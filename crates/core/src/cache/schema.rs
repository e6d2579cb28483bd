//! Table definitions.
//!
//! Every statement is idempotent (`IF NOT EXISTS`), so applying a schema to a
//! file that already has it is harmless. That is what lets a forced re-ensure
//! recreate a table dropped out-of-band without any version bookkeeping.

use rusqlite::Connection;

use crate::Error;

/// A named bundle of DDL plus the tables it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    name: String,
    tables: Vec<String>,
    ddl: String,
}

impl Schema {
    /// Generic signature-keyed KV table with an `updated_at` index for pruning.
    pub fn kv(table: &str) -> Result<Self, Error> {
        validate_identifier(table)?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                cache_key TEXT NOT NULL,
                signature_hash TEXT NOT NULL,
                signature_json TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (cache_key, signature_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_updated_at ON {table} (updated_at DESC);"
        );
        Ok(Self { name: format!("kv:{table}"), tables: vec![table.to_string()], ddl })
    }

    /// Chat sessions and their ordered messages.
    pub fn sessions() -> Self {
        let ddl = "CREATE TABLE IF NOT EXISTS chat_sessions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                model TEXT,
                owner_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_chat_sessions_updated_at ON chat_sessions (updated_at DESC);
            CREATE TABLE IF NOT EXISTS chat_messages (
                session_id TEXT NOT NULL REFERENCES chat_sessions (id) ON DELETE CASCADE,
                idx INTEGER NOT NULL,
                role TEXT NOT NULL,
                parts_json TEXT NOT NULL,
                timestamp TEXT,
                PRIMARY KEY (session_id, idx)
            );"
        .to_string();
        Self {
            name: "sessions".to_string(),
            tables: vec!["chat_sessions".to_string(), "chat_messages".to_string()],
            ddl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// True if `table` belongs to this schema.
    pub fn owns(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t == table)
    }

    /// Run the DDL on `conn`.
    pub fn apply(&self, conn: &Connection) -> Result<(), Error> {
        conn.execute_batch(&self.ddl)?;
        Ok(())
    }
}

/// Accept only plain SQL identifiers, since table names are interpolated.
pub fn validate_identifier(name: &str) -> Result<(), Error> {
    let mut chars = name.chars();
    let valid_head = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_head && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid table name: {name:?}")))
    }
}
