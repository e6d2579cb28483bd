//! Chat session types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One turn in a session. Its index is its position in [`Session::messages`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    /// Content parts, e.g. `[{"text": "..."}]`. Opaque to the store.
    #[serde(default)]
    pub parts: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Message {
    pub fn new(role: impl Into<String>, parts: Vec<Value>) -> Self {
        Self { role: role.into(), parts, timestamp: Some(crate::timestamp()) }
    }

    /// Single text part message.
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(role, vec![serde_json::json!({ "text": text.into() })])
    }

    /// Compact JSON of the parts, as stored in `chat_messages.parts_json`.
    pub fn parts_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.parts)
    }
}

/// Session metadata plus its ordered history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = crate::timestamp();
        Self {
            id: id.into(),
            title: title.into(),
            created_at: now.clone(),
            updated_at: now,
            model: None,
            owner_id: None,
            messages: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = crate::timestamp();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message_parts() {
        let msg = Message::text("user", "hello");
        assert_eq!(msg.parts_json().unwrap(), r#"[{"text":"hello"}]"#);
        assert!(msg.timestamp.is_some());
    }

    #[test]
    fn test_session_defaults_on_decode() {
        let session: Session = serde_json::from_str(
            r#"{"id":"s1","title":"t","created_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(session.messages.is_empty());
        assert!(session.model.is_none());
    }

    #[test]
    fn test_touch_advances_updated_at() {
        let mut session = Session::new("s1", "t");
        let before = session.updated_at.clone();
        std::thread::sleep(std::time::Duration::from_millis(2));
        session.touch();
        assert!(session.updated_at > before);
    }
}
