use std::time::Instant;

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::{Instrument, info, warn};
use uuid::Uuid;

/// Request ID header name
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request context information for logging and tracing
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: String,
    pub uri: String,
    pub origin: Option<String>,
    pub start_time: Instant,
}

impl RequestContext {
    /// Reuse the caller's request ID when present, otherwise generate one
    pub fn from_request(request: &Request) -> Self {
        let headers = request.headers();
        let request_id = header_str(headers, REQUEST_ID_HEADER)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            request_id,
            method: request.method().to_string(),
            uri: request.uri().path().to_string(),
            origin: header_str(headers, "origin").map(str::to_string),
            start_time: Instant::now(),
        }
    }

    /// Get elapsed time since request start
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// 请求上下文中间件
///
/// ## 功能说明
/// 为每个请求分配（或沿用客户端传入的）请求ID，在整个处理过程中
/// 使用带有请求ID的tracing span，并在响应头中回写 `x-request-id`
///
/// ## 注意事项
/// 流式响应在返回响应头时就会记录完成日志，流本身的结束由中继任务记录
pub async fn request_context_middleware(mut request: Request, next: Next) -> Response {
    let context = RequestContext::from_request(&request);

    let request_id = HeaderValue::from_str(&context.request_id).ok();
    if let Some(value) = &request_id {
        request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    }

    let span = tracing::info_span!(
        "http_request",
        request_id = %context.request_id,
        method = %context.method,
        uri = %context.uri,
    );

    async move {
        info!(
            origin = context.origin.as_deref().unwrap_or("none"),
            "Request started"
        );

        let mut response = next.run(request).await;

        if let Some(value) = request_id {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        let status = response.status();
        let duration_ms = context.elapsed().as_millis() as u64;
        if status.is_success() {
            info!(status = status.as_u16(), duration_ms, "Request completed");
        } else {
            warn!(status = status.as_u16(), duration_ms, "Request completed with error status");
        }

        response
    }
    .instrument(span)
    .await
}
