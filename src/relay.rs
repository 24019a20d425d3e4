use std::{sync::Arc, time::Duration};

use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    chat::ChatRequest,
    config::RelayConfig,
    errors::AppError,
    providers::{ProviderDescriptor, ProviderRegistry},
    transcoder::{ByteStream, Transcoder, relay_stream},
};

/// Longest slice of an upstream error body kept for logs and details
const ERROR_EXCERPT_CHARS: usize = 200;

/// Why a single provider attempt did not produce a stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    #[error("{status} (rate limited or upstream failure)")]
    Transient { status: u16 },

    #[error("{status} (credentials rejected)")]
    Auth { status: u16 },

    #[error("{status}: {excerpt}")]
    Rejected { status: u16, excerpt: String },

    #[error("no response within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request setup failed: {0}")]
    Setup(String),

    #[error("cancelled by caller")]
    Cancelled,
}

impl AttemptFailure {
    /// Map a non-success upstream status onto a failure class
    pub fn classify(status: StatusCode, body: &str) -> Self {
        let code = status.as_u16();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            AttemptFailure::Transient { status: code }
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            AttemptFailure::Auth { status: code }
        } else {
            AttemptFailure::Rejected {
                status: code,
                excerpt: body.chars().take(ERROR_EXCERPT_CHARS).collect(),
            }
        }
    }
}

/// Stream accepted from one provider
pub struct RelayedStream {
    /// Name of the provider that answered, reported as `X-AI-Provider`
    pub provider: String,
    pub body: ByteStream,
}

/// Ordered failover across the configured providers
///
/// Providers are tried strictly one after another; the first one that
/// answers with a success status wins and its stream is relayed. Once a
/// stream has started the relay is committed to that provider.
pub struct Relay {
    client: Client,
    registry: Arc<ProviderRegistry>,
    provider_timeout: Duration,
    idle_timeout: Duration,
    expose_details: bool,
}

impl Relay {
    pub fn new(
        client: Client,
        registry: Arc<ProviderRegistry>,
        config: &RelayConfig,
        expose_details: bool,
    ) -> Self {
        Self {
            client,
            registry,
            provider_timeout: Duration::from_secs(config.provider_timeout_seconds),
            idle_timeout: Duration::from_secs(config.stream_idle_timeout_seconds),
            expose_details,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// 将聊天请求依次转发给已配置的提供商
    ///
    /// ## 功能说明
    /// 按注册表顺序尝试每个提供商，返回第一个成功响应的流。
    /// Anthropic 以及开启了 `normalize_stream` 的提供商会经过转码器，
    /// 其余OpenAI兼容提供商的字节原样透传
    ///
    /// ## 内部实现逻辑
    /// 1. 注册表为空时直接返回 `NotConfigured`
    /// 2. 每次尝试都受 `provider_timeout` 限制（仅覆盖等待响应头的阶段）
    /// 3. 非成功状态、超时或传输错误都会记录日志并继续尝试下一个提供商
    /// 4. `cancel` 被触发时立即停止，不再尝试后续提供商
    ///
    /// ## 错误处理
    /// - 没有配置提供商：`AppError::NotConfigured`
    /// - 所有提供商都失败：`AppError::AllProvidersFailed`，开发环境下附带最后一个错误
    pub async fn dispatch(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<RelayedStream, AppError> {
        if self.registry.is_empty() {
            warn!("Chat request received but no provider is configured");
            return Err(AppError::NotConfigured);
        }

        let system_prompt = request.kind.system_prompt();
        let mut last_failure: Option<(String, AttemptFailure)> = None;

        for (position, provider) in self.registry.iter().enumerate() {
            info!(
                provider = %provider.name,
                attempt = position + 1,
                of = self.registry.len(),
                kind = request.kind.as_str(),
                "Attempting provider"
            );

            match self.attempt(provider, system_prompt, request, cancel).await {
                Ok(body) => {
                    info!(provider = %provider.name, "Provider accepted request, streaming response");
                    return Ok(RelayedStream {
                        provider: provider.name.clone(),
                        body,
                    });
                }
                Err(AttemptFailure::Cancelled) => {
                    info!(provider = %provider.name, "Request cancelled by caller, stopping failover");
                    return Err(AppError::internal("request cancelled by caller"));
                }
                Err(failure) => {
                    warn!(provider = %provider.name, error = %failure, "Provider attempt failed");
                    last_failure = Some((provider.name.clone(), failure));
                }
            }
        }

        warn!(tried = self.registry.len(), "All providers failed");
        let details = self.expose_details.then(|| {
            let last = last_failure
                .map(|(name, failure)| format!("{} {}", name, failure))
                .unwrap_or_else(|| "none".to_string());
            format!("All AI providers failed. Last error: {}", last)
        });

        Err(AppError::AllProvidersFailed { details })
    }

    async fn attempt(
        &self,
        provider: &ProviderDescriptor,
        system_prompt: &str,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, AttemptFailure> {
        let headers = provider
            .build_headers()
            .map_err(|e| AttemptFailure::Setup(e.to_string()))?;
        let body = provider.build_body(system_prompt, &request.messages);

        let send = self
            .client
            .post(&provider.endpoint)
            .headers(headers)
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AttemptFailure::Cancelled),
            result = tokio::time::timeout(self.provider_timeout, send) => match result {
                Err(_) => return Err(AttemptFailure::Timeout(self.provider_timeout)),
                Ok(Err(e)) if e.is_timeout() => {
                    return Err(AttemptFailure::Timeout(self.provider_timeout));
                }
                Ok(Err(e)) => return Err(AttemptFailure::Transport(e.to_string())),
                Ok(Ok(response)) => response,
            },
        };

        let status = response.status();
        if !status.is_success() {
            let text = tokio::time::timeout(self.provider_timeout, response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            return Err(AttemptFailure::classify(status, &text));
        }

        let transcoder = provider
            .needs_transcoding()
            .then(|| Transcoder::new(provider.kind));

        Ok(relay_stream(
            response.bytes_stream(),
            transcoder,
            self.idle_timeout,
            cancel.clone(),
        ))
    }
}
