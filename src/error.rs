use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Error taxonomy for the enrichment and distribution pipeline.
///
/// Every failure surfaced to a consumer or logged by the preprocessor falls
/// into one of these categories. Each category carries a stable code string
/// that appears in HTTP error bodies.
#[derive(Debug, thiserror::Error)]
pub enum IntelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("reputation request budget exhausted")]
    BudgetExhausted,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl IntelError {
    pub fn code(&self) -> &'static str {
        match self {
            IntelError::Config(_) => "config_invalid",
            IntelError::Transient(_) => "upstream_transient",
            IntelError::BudgetExhausted => "budget_exhausted",
            IntelError::NotFound(_) => "not_found",
            IntelError::ServiceUnavailable(_) => "service_unavailable",
            IntelError::Fatal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            IntelError::NotFound(_) => StatusCode::NOT_FOUND,
            IntelError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<redis::RedisError> for IntelError {
    fn from(e: redis::RedisError) -> Self {
        IntelError::ServiceUnavailable(format!("cache error: {e}"))
    }
}

impl From<reqwest::Error> for IntelError {
    fn from(e: reqwest::Error) -> Self {
        IntelError::Transient(format!("upstream request failed: {e}"))
    }
}

/// Consumer-facing mapping. Error bodies carry only the stable code and a
/// short title, never internals or backtraces.
impl IntoResponse for IntelError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code = self.code(), "request failed: {}", self);
        }
        let body = Json(json!({
            "title": self.to_string(),
            "error_code": self.code(),
        }));
        if status == StatusCode::SERVICE_UNAVAILABLE {
            // The consumer is expected to retry once a snapshot exists.
            (status, [(header::RETRY_AFTER, "30")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
