//! AI chat request and response bodies.

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[validate(length(min = 1, max = 32000, message = "Message content must be 1-32000 characters"))]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(
        length(min = 1, max = 50, message = "Between 1 and 50 messages are required"),
        nested
    )]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Checks the derive cannot express: blank content and the final turn.
    pub fn conversation_error(&self) -> Option<&'static str> {
        if self.messages.iter().any(|m| m.content.trim().is_empty()) {
            return Some("Message content cannot be blank");
        }
        match self.messages.last() {
            Some(last) if last.role == ChatRole::User => None,
            _ => Some("The last message must come from the user"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
    pub usage: TokenUsage,
    pub finish_reason: String,
}
