use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, InvalidHeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    chat::{ChatMessage, DONE_PAYLOAD},
    providers::NativeEvent,
};

// OpenAI-compatible data structures for API communication
#[derive(Serialize, Debug)]
pub struct OpenAIRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<OpenAIMessage<'a>>,
    pub stream: bool,
}

#[derive(Serialize, Debug)]
pub struct OpenAIMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIStreamChunk {
    #[serde(default)]
    pub choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIStreamChoice {
    #[serde(default)]
    pub delta: Option<OpenAIStreamDelta>,
    #[serde(default)]
    pub message: Option<OpenAIStreamDelta>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIStreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

pub fn build_headers(api_key: &str) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", api_key))?);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// System prompt first, then the conversation as-is
pub fn build_body(model: &str, system_prompt: &str, messages: &[ChatMessage]) -> Value {
    let mut native = Vec::with_capacity(messages.len() + 1);
    native.push(OpenAIMessage {
        role: "system",
        content: system_prompt,
    });
    native.extend(messages.iter().map(|m| OpenAIMessage {
        role: m.role.as_str(),
        content: &m.content,
    }));

    serde_json::json!(OpenAIRequest {
        model,
        messages: native,
        stream: true,
    })
}

/// Decode one chat-completion chunk, taking `delta` before `message`
pub fn interpret_chunk(payload: &str) -> Result<NativeEvent, serde_json::Error> {
    if payload == DONE_PAYLOAD {
        return Ok(NativeEvent::Done);
    }

    let chunk: OpenAIStreamChunk = serde_json::from_str(payload)?;
    let text = chunk.choices.into_iter().next().and_then(|choice| {
        choice
            .delta
            .and_then(|d| d.content)
            .filter(|c| !c.is_empty())
            .or_else(|| choice.message.and_then(|m| m.content))
    });

    Ok(match text {
        Some(text) if !text.is_empty() => NativeEvent::Delta(text),
        _ => NativeEvent::Skip,
    })
}
