use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Identifier of a transcript turn. Allocated from a per-session counter, so
/// ids are unique and increasing within one session.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn-{}", self.0)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConversationTurn {
    pub id: TurnId,
    pub role: Role,
    pub content: String,
    /// Server-side id of the response that produced this turn (assistant only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

impl ConversationTurn {
    pub fn user(id: TurnId, content: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::User,
            content: content.into(),
            response_id: None,
        }
    }

    pub fn assistant(id: TurnId, content: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: content.into(),
            response_id: None,
        }
    }
}

/// Outbound request frames.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "openai_chat")]
    OpenAiChat(OpenAiChatData),
    /// Persona-flavoured request; the server wraps the message in a persona prompt.
    #[serde(rename = "chat")]
    PersonaChat(PersonaChatData),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OpenAiChatData {
    pub input_text: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PersonaChatData {
    pub message: String,
    pub persona_id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
}

impl ClientFrame {
    /// The user text this request carries.
    pub fn text(&self) -> &str {
        match self {
            Self::OpenAiChat(d) => &d.input_text,
            Self::PersonaChat(d) => &d.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn openai_chat_wire_shape() {
        let frame = ClientFrame::OpenAiChat(OpenAiChatData {
            input_text: "hi".into(),
            model: "gpt-4o-mini".into(),
            previous_response_id: None,
        });
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            v,
            json!({"type": "openai_chat", "data": {"input_text": "hi", "model": "gpt-4o-mini"}})
        );
    }

    #[test]
    fn persona_chat_carries_previous_response_id() {
        let frame = ClientFrame::PersonaChat(PersonaChatData {
            message: "favourite language?".into(),
            persona_id: "tech_enthusiast".into(),
            model: "gpt-4o-mini".into(),
            previous_response_id: Some("resp_1".into()),
        });
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], json!("chat"));
        assert_eq!(v["data"]["persona_id"], json!("tech_enthusiast"));
        assert_eq!(v["data"]["previous_response_id"], json!("resp_1"));
        assert_eq!(frame.text(), "favourite language?");
    }

    #[test]
    fn role_serializes_lowercase() {
        let turn = ConversationTurn::assistant(TurnId(7), "ok");
        let back = serde_json::to_string(&turn).unwrap();
        assert!(back.contains("\"assistant\""));
        assert!(back.contains("\"id\":7"));
        assert!(!back.contains("response_id"));
    }

    #[test]
    fn turn_id_display() {
        assert_eq!(TurnId(3).to_string(), "turn-3");
    }
}
