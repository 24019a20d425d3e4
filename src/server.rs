use std::{any::Any, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State, rejection::BytesRejection},
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    chat::ChatRequest,
    config::{Config, CorsConfig},
    errors::{AppError, AppResult},
    middleware::{REQUEST_ID_HEADER, request_context_middleware},
    providers::ProviderRegistry,
    relay::Relay,
    transcoder::cancel_on_drop,
};

/// Response header naming the provider that served a stream
pub const PROVIDER_HEADER: &str = "x-ai-provider";

/// 应用程序状态 - 在所有请求处理器之间共享
///
/// 包含配置、带有提供商注册表的中继器，以及用于优雅关闭的根取消令牌
#[derive(Clone)]
pub struct AppState {
    /// 应用程序配置（只读共享）
    pub config: Arc<Config>,
    /// 按优先级进行故障转移的中继器
    pub relay: Arc<Relay>,
    /// 每个请求的取消令牌都是它的子令牌
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create new application state from configuration
    pub fn new(config: Config) -> AppResult<Self> {
        // No total timeout: streams legitimately outlive any fixed bound.
        // The relay enforces header and idle timeouts itself.
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        let registry = Arc::new(ProviderRegistry::from_config(&config.providers));
        if registry.is_empty() {
            tracing::warn!("No AI provider configured, chat requests will be answered with 503");
        } else {
            tracing::info!(providers = ?registry.names(), "Provider registry initialized");
        }

        let relay = Relay::new(
            http_client,
            registry,
            &config.relay,
            config.environment.is_development(),
        );

        Ok(Self {
            config: Arc::new(config),
            relay: Arc::new(relay),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Health probe payload returned by `GET`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub status: String,
    /// Configured provider names in priority order
    pub providers: Vec<String>,
    pub configured: bool,
}

/// Create the main application router with all routes and middleware
pub fn create_app(state: AppState) -> Router {
    let config = state.config.clone();

    let routes = Router::new()
        .route("/", get(health_handler).post(chat_handler).options(preflight_handler))
        .route(
            "/ai-chat",
            get(health_handler).post(chat_handler).options(preflight_handler),
        )
        .with_state(state);

    with_middleware(routes, &config)
}

/// Wrap routes in the proxy's middleware stack
///
/// Outermost first: request context, CORS, panic recovery, HTTP tracing.
/// The body limit sits closest to the handlers.
pub fn with_middleware(routes: Router, config: &Config) -> Router {
    let cors = cors_layer(&config.cors);

    routes
        .layer(DefaultBodyLimit::max(config.server.max_request_size_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(request_context_middleware))
                .layer(cors)
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(TraceLayer::new_for_http()),
        )
}

/// CORS policy: any origin (mirrored), the browser-client headers, and the
/// provider/request-id headers readable by scripts
fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let allowed_headers: Vec<HeaderName> = config
        .allowed_headers
        .iter()
        .filter_map(|h| HeaderName::from_bytes(h.as_bytes()).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(allowed_headers)
        .expose_headers([
            HeaderName::from_static(PROVIDER_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .max_age(Duration::from_secs(config.max_age_seconds))
}

/// Turn a handler panic into the generic 500 JSON body
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };

    AppError::internal(format!("handler panicked: {}", detail)).into_response()
}

/// Start the HTTP server
///
/// Runs until ctrl-c, then cancels every in-flight relay through the root
/// token and drains open connections.
pub async fn start_server(config: Config) -> AppResult<()> {
    let app_state = AppState::new(config.clone())?;
    let shutdown = app_state.shutdown.clone();

    let app = create_app(app_state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    tracing::info!("AI chat proxy starting on {}", addr);
    tracing::info!("Available endpoints:");
    tracing::info!("  GET     /ai-chat - Health check");
    tracing::info!("  POST    /ai-chat - Streaming chat relay");
    tracing::info!("  OPTIONS /ai-chat - CORS preflight");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .map_err(|e| AppError::internal(format!("Server error: {}", e)))?;

    tracing::info!("AI chat proxy stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received, cancelling in-flight streams");
    shutdown.cancel();
}

// Request Handlers

/// Handle streaming chat requests
async fn chat_handler(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<Response> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge
        } else {
            AppError::bad_request(rejection.body_text())
        }
    })?;
    let request = ChatRequest::parse(&body)?;

    tracing::info!(
        kind = request.kind.as_str(),
        messages = request.messages.len(),
        "Processing chat request"
    );

    // Dropped together with the response body, which stops the relay task
    // and releases the upstream connection when the caller disconnects.
    let cancel = state.shutdown.child_token();
    let relayed = state.relay.dispatch(&request, &cancel).await?;

    let provider = HeaderValue::from_str(&relayed.provider)
        .map_err(|e| AppError::internal(format!("Invalid provider name: {}", e)))?;
    let body = Body::from_stream(cancel_on_drop(relayed.body, cancel));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (HeaderName::from_static(PROVIDER_HEADER), provider),
        ],
        body,
    )
        .into_response())
}

/// Handle health probes
async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    let providers = state.relay.registry().names();
    Json(HealthReport {
        status: "ok".to_string(),
        configured: !providers.is_empty(),
        providers,
    })
}

/// Bare OPTIONS without CORS request headers; real preflights are answered by the CORS layer
async fn preflight_handler() -> StatusCode {
    StatusCode::OK
}
