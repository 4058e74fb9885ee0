use cq_llm::{ChatRole, WireMessage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One entry in a conversation. Owned exclusively by its session; appended,
/// never removed except for the cancellation rollback of an in-flight
/// placeholder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub image_attachment: Option<Vec<u8>>,
    /// Placeholder state while a response is still in flight.
    #[serde(default)]
    pub is_thinking: bool,
    /// Model-context only; never rendered to a human.
    #[serde(default)]
    pub hidden_from_view: bool,
    #[serde(default)]
    pub tool_description: Option<String>,
    #[serde(default)]
    pub tool_output: Option<String>,
    #[serde(default)]
    pub models_attempted: Vec<String>,
    #[serde(default)]
    pub used_model: Option<String>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content.into())
    }

    /// In-flight assistant placeholder, deleted if the turn is cancelled
    /// before any content arrives.
    pub fn assistant_placeholder() -> Self {
        let mut msg = Self::new(MessageRole::Assistant, String::new());
        msg.is_thinking = true;
        msg
    }

    /// Tool output framed for the model, excluded from human rendering.
    pub fn hidden_tool_result(description: &str, output: &str) -> Self {
        let mut msg = Self::new(
            MessageRole::User,
            format!(
                "[tool result] {description}\n{output}\n\
                 Use this result to continue answering the original request."
            ),
        );
        msg.hidden_from_view = true;
        msg.tool_description = Some(description.to_string());
        msg.tool_output = Some(output.to_string());
        msg
    }

    fn new(role: MessageRole, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            image_attachment: None,
            is_thinking: false,
            hidden_from_view: false,
            tool_description: None,
            tool_output: None,
            models_attempted: Vec::new(),
            used_model: None,
        }
    }

    pub fn to_wire(&self) -> Option<WireMessage> {
        if self.is_thinking || self.content.is_empty() {
            return None;
        }
        let role = match self.role {
            MessageRole::User => ChatRole::User,
            MessageRole::Assistant => ChatRole::Assistant,
        };
        Some(WireMessage::new(role, self.content.clone()))
    }
}
