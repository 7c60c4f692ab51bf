use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tag the upstream agent uses for its final message of a turn.
pub const TERMINAL_MESSAGE_TYPE: &str = "result";

/// Inbound body of `POST /api/chat`, forwarded to the agent as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// One tagged message from the upstream agent.
///
/// Only `type` is interpreted; everything else is carried through to the
/// client untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl AgentMessage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == TERMINAL_MESSAGE_TYPE
    }

    /// Resumable session id, when the agent reports one.
    pub fn session_id(&self) -> Option<&str> {
        self.fields
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_message_keeps_unknown_fields() {
        let raw = json!({"type": "assistant", "text": "hi", "index": 3});
        let msg: AgentMessage = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(msg.kind, "assistant");
        assert!(!msg.is_terminal());
        assert_eq!(serde_json::to_value(&msg).unwrap(), raw);
    }

    #[test]
    fn test_agent_message_session_id() {
        let msg = AgentMessage::new("system").with_field("session_id", "abc-123");
        assert_eq!(msg.session_id(), Some("abc-123"));
        assert_eq!(AgentMessage::new("system").with_field("session_id", " ").session_id(), None);
        assert_eq!(AgentMessage::new("system").with_field("session_id", 7).session_id(), None);
    }

    #[test]
    fn test_result_is_terminal() {
        assert!(AgentMessage::new("result").is_terminal());
    }

    #[test]
    fn test_chat_request_requires_message() {
        assert!(serde_json::from_str::<ChatRequest>(r#"{"session_id":"s"}"#).is_err());
        let req: ChatRequest = serde_json::from_str(r#"{"message":"hi"}"#).unwrap();
        assert_eq!(req.session_id, None);
    }
}
