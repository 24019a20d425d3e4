use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Use anyhow::Result for configuration plumbing
// Use thiserror for errors that map onto a specific HTTP response

pub const NOT_CONFIGURED_MESSAGE: &str = "No AI provider configured. Please set LOVABLE_API_KEY, OPENAI_API_KEY, or ANTHROPIC_API_KEY in the proxy environment.";
pub const NOT_CONFIGURED_HINT: &str = "Set at least one provider key, e.g. 'OPENAI_API_KEY=your_key', and restart the proxy";
pub const UNAVAILABLE_MESSAGE: &str = "AI service is currently unavailable. Please try again in a moment or contact support.";
pub const PAYLOAD_TOO_LARGE_MESSAGE: &str = "Request body is too large";
pub const INTERNAL_MESSAGE: &str = "An unexpected error occurred. Please try again.";

/// Errors surfaced to callers of the chat endpoint
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("No AI provider configured")]
    NotConfigured,

    #[error("All AI providers failed")]
    AllProvidersFailed {
        /// Last provider failure, only populated in development builds
        details: Option<String>,
    },

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// JSON body of every error response
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::NotConfigured | AppError::AllProvidersFailed { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable discriminator carried in the `code` field
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::PayloadTooLarge => "payload_too_large",
            AppError::NotConfigured => "not_configured",
            AppError::AllProvidersFailed { .. } => "providers_unavailable",
            AppError::Internal(_) | AppError::ConfigError(_) => "internal_error",
        }
    }

    pub fn body(&self) -> ErrorBody {
        let (error, hint, details) = match self {
            AppError::BadRequest(msg) => (msg.clone(), None, None),
            AppError::PayloadTooLarge => (PAYLOAD_TOO_LARGE_MESSAGE.to_string(), None, None),
            AppError::NotConfigured => (
                NOT_CONFIGURED_MESSAGE.to_string(),
                Some(NOT_CONFIGURED_HINT.to_string()),
                None,
            ),
            AppError::AllProvidersFailed { details } => {
                (UNAVAILABLE_MESSAGE.to_string(), None, details.clone())
            }
            AppError::Internal(_) | AppError::ConfigError(_) => {
                (INTERNAL_MESSAGE.to_string(), None, None)
            }
        };

        ErrorBody {
            error,
            code: self.code().to_string(),
            hint,
            details,
        }
    }
}

/// Convert AppError to HTTP response
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal(msg) | AppError::ConfigError(msg) = &self {
            tracing::error!(error = %msg, "Request failed with internal error");
        }

        (self.status(), Json(self.body())).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::bad_request("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::NotConfigured.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            AppError::AllProvidersFailed { details: None }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(AppError::PayloadTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(AppError::PayloadTooLarge.code(), "payload_too_large");
        assert_eq!(AppError::internal("boom").status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_not_configured_body_has_hint() {
        let body = AppError::NotConfigured.body();
        assert_eq!(body.code, "not_configured");
        assert_eq!(body.error, NOT_CONFIGURED_MESSAGE);
        assert!(body.hint.is_some());
        assert!(body.details.is_none());
    }

    #[test]
    fn test_internal_message_is_not_leaked() {
        let body = AppError::internal("db password is hunter2").body();
        assert_eq!(body.error, INTERNAL_MESSAGE);
        assert!(body.details.is_none());
    }

    #[test]
    fn test_optional_fields_skipped() {
        let json = serde_json::to_value(AppError::bad_request("nope").body()).unwrap();
        assert_eq!(json, serde_json::json!({ "error": "nope", "code": "bad_request" }));
    }
}
