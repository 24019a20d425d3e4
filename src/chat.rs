use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;

use crate::errors::AppError;

/// Terminal frame of the canonical event stream
pub const DONE_EVENT: &str = "data: [DONE]\n\n";

/// Payload carried by the terminal frame
pub const DONE_PAYLOAD: &str = "[DONE]";

/// Speaker of a chat message
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One entry of a conversation transcript
///
/// `error` marks assistant bubbles that carry a user-facing failure message
/// instead of model output. It is only serialized when set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            error: false,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            error: true,
        }
    }
}

/// Conversation flavour, selects the system prompt
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    #[default]
    Chat,
    Insights,
    Verify,
}

impl ChatKind {
    /// Unknown names fall back to `Chat`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "insights" => ChatKind::Insights,
            "verify" => ChatKind::Verify,
            _ => ChatKind::Chat,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Chat => "chat",
            ChatKind::Insights => "insights",
            ChatKind::Verify => "verify",
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            ChatKind::Chat => crate::prompts::CHAT,
            ChatKind::Insights => crate::prompts::INSIGHTS,
            ChatKind::Verify => crate::prompts::VERIFY,
        }
    }
}

impl<'de> Deserialize<'de> for ChatKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(ChatKind::from_name).unwrap_or_default())
    }
}

/// Canonical request accepted by the proxy
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(rename = "type", default)]
    pub kind: ChatKind,
}

#[derive(Deserialize)]
struct IncomingChatRequest {
    #[serde(default)]
    messages: Option<Vec<ChatMessage>>,
    #[serde(rename = "type", default)]
    kind: ChatKind,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, kind: ChatKind) -> Self {
        Self { messages, kind }
    }

    /// Parse a raw request body
    ///
    /// Malformed JSON and a missing or empty `messages` array are both
    /// reported as `BadRequest`, with distinct messages.
    pub fn parse(body: &[u8]) -> Result<Self, AppError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|_| AppError::bad_request("Invalid JSON in request body"))?;

        let incoming: IncomingChatRequest = serde_json::from_value(value)
            .map_err(|e| AppError::bad_request(format!("Invalid request: {}", e)))?;

        match incoming.messages {
            Some(messages) if !messages.is_empty() => Ok(Self {
                messages,
                kind: incoming.kind,
            }),
            _ => Err(AppError::bad_request(
                "Invalid request: messages array is required",
            )),
        }
    }
}

/// Encode one text delta as a canonical stream frame
pub fn encode_delta(text: &str) -> String {
    let chunk = json!({ "choices": [{ "delta": { "content": text } }] });
    format!("data: {}\n\n", chunk)
}
