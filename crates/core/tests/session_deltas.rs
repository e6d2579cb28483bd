//! Delta persistence of chat sessions over a real SQLite file.

use std::sync::Arc;

use rusqlite::params;
use tiercache_core::cache::{Schema, SchemaRegistry, StorageHandle};
use tiercache_core::session::{Message, Session, SessionStore};

fn store_at(path: &std::path::Path) -> SessionStore {
    let storage = StorageHandle::new(path, Schema::sessions()).with_registry(Arc::new(SchemaRegistry::new()));
    SessionStore::new(storage).unwrap()
}

fn session(id: &str, messages: usize) -> Session {
    let mut session = Session::new(id, format!("session {id}"));
    session.messages = (0..messages).map(|i| Message::text("user", format!("{id} #{i}"))).collect();
    session
}

/// Record every write that touches a session other than `s1` or `s2`.
fn install_bystander_audit(store: &SessionStore) {
    let conn = store.storage().connect().unwrap();
    conn.execute_batch(
        "CREATE TABLE audit_log (session_id TEXT NOT NULL, op TEXT NOT NULL);
         CREATE TRIGGER audit_msg_insert AFTER INSERT ON chat_messages WHEN NEW.session_id NOT IN ('s1', 's2')
         BEGIN INSERT INTO audit_log VALUES (NEW.session_id, 'insert'); END;
         CREATE TRIGGER audit_msg_delete AFTER DELETE ON chat_messages WHEN OLD.session_id NOT IN ('s1', 's2')
         BEGIN INSERT INTO audit_log VALUES (OLD.session_id, 'delete'); END;
         CREATE TRIGGER audit_msg_delete_s1 AFTER DELETE ON chat_messages WHEN OLD.session_id = 's1'
         BEGIN INSERT INTO audit_log VALUES (OLD.session_id, 'delete'); END;
         CREATE TRIGGER audit_session_update AFTER UPDATE ON chat_sessions
         BEGIN INSERT INTO audit_log VALUES (NEW.id, 'update'); END;",
    )
    .unwrap();
}

fn audit_count(store: &SessionStore) -> i64 {
    let conn = store.storage().connect().unwrap();
    conn.query_row("SELECT COUNT(*) FROM audit_log", params![], |row| row.get(0)).unwrap()
}

#[test]
fn test_append_and_delete_touch_only_named_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_at(&dir.path().join("chat_storage.db"));

    let mut s1 = session("s1", 2);
    let s2 = session("s2", 3);
    let s3 = session("s3", 1);
    store.save_all(&[s1.clone(), s2, s3.clone()]).unwrap();
    install_bystander_audit(&store);

    s1.messages.push(Message::text("model", "reply"));
    s1.messages.push(Message::text("user", "follow-up"));
    let report = store.apply_deltas(&[&s1], &["s2"], false).unwrap();

    assert_eq!(report.sessions_deleted, 1);
    assert_eq!(report.messages_appended, 2);
    assert_eq!(report.full_rewrites, 0);
    assert_eq!(report.sessions_written, 0);

    assert!(store.load_session("s2").unwrap().is_none());
    assert_eq!(store.message_count("s2").unwrap(), 0);
    assert_eq!(store.load_session("s1").unwrap().unwrap(), s1);
    assert_eq!(store.load_session("s3").unwrap().unwrap(), s3);
    assert_eq!(audit_count(&store), 0);
}

#[test]
fn test_non_append_edit_replaces_rows_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_at(&dir.path().join("chat_storage.db"));

    let mut s1 = session("s1", 3);
    store.apply_deltas(&[&s1], &[], false).unwrap();

    s1.messages[2] = Message::text("user", "edited");
    s1.messages.push(Message::text("model", "new tail"));
    let report = store.apply_deltas(&[&s1], &[], false).unwrap();

    assert_eq!(report.full_rewrites, 1);
    assert_eq!(store.load_session("s1").unwrap().unwrap().messages, s1.messages);
}
