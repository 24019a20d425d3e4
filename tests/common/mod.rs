//! Shared helpers for integration tests: proxy configuration pointing at
//! wiremock providers, canned provider streams, and request/response plumbing.
#![allow(dead_code)]

use ai_chat_proxy::{
    chat::{DONE_EVENT, encode_delta},
    config::{Config, Environment, ProviderSlot},
    server::{AppState, create_app},
};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response},
};
use serde_json::{Value, json};
use wiremock::{MockServer, ResponseTemplate};

pub const CHAT_PATH: &str = "/ai-chat";

/// Which slot a mock provider occupies
#[derive(Debug, Clone, Copy)]
pub enum Slot {
    Lovable,
    OpenAi,
    Anthropic,
}

/// Proxy configuration with the given slots pointed at `server`
///
/// Each slot gets its own path (`/lovable`, `/openai`, `/anthropic`) so a
/// single mock server can play every provider.
pub fn config_for(server: &MockServer, slots: &[Slot]) -> Config {
    let mut config = Config::default();
    config.relay.provider_timeout_seconds = 1;
    config.relay.stream_idle_timeout_seconds = 2;

    for slot in slots {
        let (target, name) = match slot {
            Slot::Lovable => (&mut config.providers.lovable, "lovable"),
            Slot::OpenAi => (&mut config.providers.openai, "openai"),
            Slot::Anthropic => (&mut config.providers.anthropic, "anthropic"),
        };
        *target = ProviderSlot {
            api_key: Some(format!("{}-key", name)),
            endpoint: Some(format!("{}/{}", server.uri(), name)),
            model: None,
            normalize_stream: false,
        };
    }
    config
}

pub fn development(mut config: Config) -> Config {
    config.environment = Environment::Development;
    config
}

pub fn app(config: Config) -> Router {
    create_app(AppState::new(config).expect("app state"))
}

pub fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(CHAT_PATH)
        .header("content-type", "application/json")
        .header("origin", "https://portal.example")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn user_turn(text: &str) -> Value {
    json!({ "messages": [{ "role": "user", "content": text }], "type": "chat" })
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

/// Canonical stream carrying `parts` as deltas, terminated with `[DONE]`
pub fn canonical_stream(parts: &[&str]) -> String {
    let mut out: String = parts.iter().map(|p| encode_delta(p)).collect();
    out.push_str(DONE_EVENT);
    out
}

/// Native Anthropic event stream for `parts`, including the usual noise
pub fn anthropic_stream(parts: &[&str]) -> String {
    let mut out = String::new();
    out.push_str("event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_01\",\"usage\":{\"input_tokens\":12}}}\n\n");
    out.push_str("event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n");
    out.push_str("event: ping\ndata: {\"type\":\"ping\"}\n\n");
    for part in parts {
        let event = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": part }
        });
        out.push_str(&format!("event: content_block_delta\ndata: {}\n\n", event));
    }
    out.push_str("event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n");
    out.push_str("event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":9}}\n\n");
    out.push_str("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    out
}

pub fn sse(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}
