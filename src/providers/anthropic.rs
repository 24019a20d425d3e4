use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    chat::{ChatMessage, Role},
    providers::NativeEvent,
};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const MAX_TOKENS: u32 = 4096;

/// Messages API request; the system prompt travels outside `messages`
#[derive(Serialize, Debug)]
pub struct AnthropicRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub messages: Vec<AnthropicMessage<'a>>,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Serialize, Debug)]
pub struct AnthropicMessage<'a> {
    pub role: &'a str, // "user" or "assistant"
    pub content: &'a str,
}

// Streaming event structures for Server-Sent Events

/// One event of Anthropic's native stream
///
/// Only the fields carrying text or termination are read; everything else
/// (`message_start`, `ping`, `message_delta` usage) is ignored.
#[derive(Deserialize, Debug)]
pub struct AnthropicStreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub delta: Option<TextDelta>,
    #[serde(default)]
    pub content_block: Option<ContentBlock>,
    #[serde(default)]
    pub error: Option<StreamError>,
}

#[derive(Deserialize, Debug)]
pub struct TextDelta {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ContentBlock {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct StreamError {
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

pub fn build_headers(api_key: &str) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("x-api-key"), HeaderValue::from_str(api_key)?);
    headers.insert(
        HeaderName::from_static("anthropic-version"),
        HeaderValue::from_static(ANTHROPIC_VERSION),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// System-role messages are dropped; the prompt goes in `system`
pub fn build_body(model: &str, system_prompt: &str, messages: &[ChatMessage]) -> Value {
    let native = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| AnthropicMessage {
            role: m.role.as_str(),
            content: &m.content,
        })
        .collect();

    serde_json::json!(AnthropicRequest {
        model,
        system: system_prompt,
        messages: native,
        max_tokens: MAX_TOKENS,
        stream: true,
    })
}

pub fn interpret_event(payload: &str) -> Result<NativeEvent, serde_json::Error> {
    let event: AnthropicStreamEvent = serde_json::from_str(payload)?;

    let text = match event.event_type.as_str() {
        "content_block_delta" => event.delta.and_then(|d| d.text),
        "content_block_start" => event.content_block.and_then(|b| b.text),
        "message_stop" => return Ok(NativeEvent::Done),
        "error" => {
            let reason = event
                .error
                .map(|e| {
                    format!(
                        "{}: {}",
                        e.error_type.unwrap_or_else(|| "error".to_string()),
                        e.message.unwrap_or_default()
                    )
                })
                .unwrap_or_else(|| "unknown stream error".to_string());
            return Ok(NativeEvent::Abort(reason));
        }
        _ => None,
    };

    Ok(match text {
        Some(text) if !text.is_empty() => NativeEvent::Delta(text),
        _ => NativeEvent::Skip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_moves_system_prompt_out_of_messages() {
        let messages = vec![
            ChatMessage {
                role: Role::System,
                content: "ignored".to_string(),
                error: false,
            },
            ChatMessage::user("Which courses are offered?"),
        ];
        let body = build_body("claude-3-haiku-20240307", "be brief", &messages);

        assert_eq!(
            body,
            json!({
                "model": "claude-3-haiku-20240307",
                "system": "be brief",
                "messages": [{ "role": "user", "content": "Which courses are offered?" }],
                "max_tokens": 4096,
                "stream": true
            })
        );
    }

    #[test]
    fn test_headers() {
        let headers = build_headers("ant-key").unwrap();
        assert_eq!(headers["x-api-key"], "ant-key");
        assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn test_interpret_text_events() {
        assert_eq!(
            interpret_event(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#).unwrap(),
            NativeEvent::Delta("Hello".to_string())
        );
        assert_eq!(
            interpret_event(r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":"Hi "}}"#).unwrap(),
            NativeEvent::Delta("Hi ".to_string())
        );
        assert_eq!(
            interpret_event(r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#).unwrap(),
            NativeEvent::Skip
        );
    }

    #[test]
    fn test_interpret_control_events() {
        assert_eq!(interpret_event(r#"{"type":"message_stop"}"#).unwrap(), NativeEvent::Done);
        assert_eq!(interpret_event(r#"{"type":"ping"}"#).unwrap(), NativeEvent::Skip);
        assert_eq!(
            interpret_event(r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":3}}}"#).unwrap(),
            NativeEvent::Skip
        );
        assert_eq!(
            interpret_event(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#).unwrap(),
            NativeEvent::Abort("overloaded_error: Overloaded".to_string())
        );
    }

    #[test]
    fn test_interpret_truncated_payload_fails() {
        assert!(interpret_event(r#"{"type":"content_block_delta","delta":{"text":"Hel"#).is_err());
    }
}
