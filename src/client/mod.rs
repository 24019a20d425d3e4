//! Client side of the chat relay.
//!
//! `ChatClient::send` appends the user's message to a [`Transcript`], posts
//! the recent context window to the proxy, decodes the canonical stream with
//! [`SseDecoder`] and grows the assistant message as deltas arrive. Timeout,
//! retry and cancellation policy all live here; the proxy never retries a
//! whole request on the caller's behalf.

pub mod decoder;
pub mod transcript;

use std::time::Duration;

use futures::StreamExt;
use reqwest::{
    Client,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::{ChatKind, ChatRequest};

pub use decoder::{DecodedEvent, SseDecoder};
pub use transcript::{GREETING, Transcript};

/// Friendly text of the error bubble shown when a turn fails
pub const CONNECTION_TROUBLE_MESSAGE: &str = "Sorry, I'm having trouble connecting right now. Please try again or contact our admission office directly. 📞";

pub const TIMEOUT_MESSAGE: &str = "Sorry, that took too long to answer. Please try again in a moment.";

pub const EMPTY_RESPONSE_MESSAGE: &str = "Sorry, I didn't receive a response. Please try asking again.";

const NOT_CONFIGURED_CODE: &str = "not_configured";

/// Why a chat turn failed on the client side
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("proxy returned {status}: {message}")]
    Proxy {
        status: u16,
        message: String,
        code: Option<String>,
    },

    #[error("no complete response within {}s", .0.as_secs())]
    StreamTimeout(Duration),

    #[error("stream ended without any assistant content")]
    EmptyResponse,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("client setup failed: {0}")]
    Setup(String),
}

impl ClientError {
    /// Whether the whole request is worth sending again
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Proxy { status, code, .. } => {
                (*status == 429 || *status >= 500) && code.as_deref() != Some(NOT_CONFIGURED_CODE)
            }
            ClientError::StreamTimeout(_) | ClientError::Transport(_) => true,
            ClientError::EmptyResponse | ClientError::Cancelled | ClientError::Setup(_) => false,
        }
    }

    /// Text for the error bubble appended to the transcript
    pub fn user_message(&self) -> &'static str {
        match self {
            ClientError::EmptyResponse => EMPTY_RESPONSE_MESSAGE,
            ClientError::StreamTimeout(_) => TIMEOUT_MESSAGE,
            _ => CONNECTION_TROUBLE_MESSAGE,
        }
    }
}

/// Error body sent by the proxy; every field is optional on this side
#[derive(Deserialize, Debug, Default)]
struct ProxyErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub bearer_token: Option<String>,
    pub kind: ChatKind,
    /// Overall bound on one attempt, headers and full stream included
    pub timeout: Duration,
    pub max_retries: u32,
    /// Linear backoff: the n-th retry waits `n × backoff_step`
    pub backoff_step: Duration,
    pub context_window: usize,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bearer_token: None,
            kind: ChatKind::Chat,
            timeout: Duration::from_secs(60),
            max_retries: 2,
            backoff_step: Duration::from_secs(1),
            context_window: 10,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_kind(mut self, kind: ChatKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_step: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_step = backoff_step;
        self
    }

    pub fn with_context_window(mut self, messages: usize) -> Self {
        self.context_window = messages;
        self
    }
}

pub struct ChatClient {
    http: Client,
    config: ClientConfig,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ClientError::Setup(e.to_string()))?;
        Ok(Self { http, config })
    }

    /// 发送一条用户消息并流式接收回复
    ///
    /// ## 功能说明
    /// 将用户消息追加到对话记录，发送最近的上下文窗口，
    /// 每收到一个增量就更新末尾的助手消息并回调 `on_delta`
    ///
    /// ## 内部实现逻辑
    /// 1. 每次尝试都受整体超时限制（默认60秒）
    /// 2. 可重试的错误会丢弃部分回复，按线性退避后重新发送整个请求
    /// 3. 最终失败时用错误气泡替换部分回复
    /// 4. `cancel` 触发时移除部分回复，不追加错误气泡，也不重试
    ///
    /// ## 返回值
    /// 成功时返回完整的助手回复文本
    pub async fn send<F>(
        &self,
        transcript: &mut Transcript,
        text: &str,
        cancel: &CancellationToken,
        mut on_delta: F,
    ) -> Result<String, ClientError>
    where
        F: FnMut(&str),
    {
        transcript.push_user(text.trim());
        let request = ChatRequest::new(
            transcript.context_window(self.config.context_window),
            self.config.kind,
        );

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(ClientError::Cancelled),
                result = tokio::time::timeout(
                    self.config.timeout,
                    self.attempt(&request, transcript, &mut on_delta),
                ) => result.unwrap_or(Err(ClientError::StreamTimeout(self.config.timeout))),
            };

            let error = match outcome {
                Ok(content) => {
                    info!(attempt, chars = content.chars().count(), "Chat turn completed");
                    return Ok(content);
                }
                Err(ClientError::Cancelled) => {
                    transcript.discard_partial();
                    info!("Chat turn cancelled");
                    return Err(ClientError::Cancelled);
                }
                Err(error) => error,
            };

            if error.is_retryable() && attempt <= self.config.max_retries {
                transcript.discard_partial();
                let backoff = self.config.backoff_step * attempt;
                warn!(attempt, error = %error, backoff_ms = backoff.as_millis() as u64, "Chat attempt failed, retrying");

                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Chat turn cancelled during backoff");
                        return Err(ClientError::Cancelled);
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
                continue;
            }

            warn!(attempt, error = %error, "Chat turn failed");
            transcript.fail_turn(error.user_message());
            return Err(error);
        }
    }

    async fn attempt<F>(
        &self,
        request: &ChatRequest,
        transcript: &mut Transcript,
        on_delta: &mut F,
    ) -> Result<String, ClientError>
    where
        F: FnMut(&str),
    {
        let mut builder = self
            .http
            .post(&self.config.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .json(request);
        if let Some(token) = &self.config.bearer_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body: ProxyErrorBody = response
                .json()
                .await
                .unwrap_or_default();
            return Err(ClientError::Proxy {
                status: status.as_u16(),
                message: body.error.unwrap_or_else(|| "Failed to get response".to_string()),
                code: body.code,
            });
        }

        let provider = response
            .headers()
            .get("x-ai-provider")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        debug!(provider = %provider, "Proxy accepted request, reading stream");

        let mut decoder = SseDecoder::new();
        let mut body = Box::pin(response.bytes_stream());

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ClientError::Transport(e.to_string()))?;
            for event in decoder.push(&chunk) {
                if let DecodedEvent::Delta(text) = event {
                    transcript.apply_delta(&text);
                    on_delta(&text);
                }
            }
            if decoder.is_done() {
                break;
            }
        }
        for event in decoder.finish() {
            if let DecodedEvent::Delta(text) = event {
                transcript.apply_delta(&text);
                on_delta(&text);
            }
        }

        let content = transcript.turn_content();
        if content.is_empty() {
            return Err(ClientError::EmptyResponse);
        }
        Ok(content.to_string())
    }
}
