use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::utils::{EngineError, ValidationError};

/// Errors returned by the HTTP surface
#[derive(Debug)]
pub enum ApiError {
    /// Malformed request or a rejected configuration write
    BadRequest(String),
    /// Unknown website, snippet, rule or list entry
    NotFound(String),
    /// Backing store failed or timed out
    Unavailable(String),
    /// Stored state contradicts its invariants
    Conflict(String),
    /// Internal service error
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Unavailable(_) => "store_unavailable",
            ApiError::Conflict(_) => "inconsistent_state",
            ApiError::Internal(_) => "internal",
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Unavailable(msg)
            | ApiError::Conflict(msg)
            | ApiError::Internal(msg) => msg,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ApiError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            ApiError::Conflict(msg) => write!(f, "Inconsistent state: {}", msg),
            ApiError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Validation(err) => ApiError::BadRequest(err.to_string()),
            EngineError::NotFound { .. } => ApiError::NotFound(error.to_string()),
            EngineError::Store { .. } => ApiError::Unavailable(error.to_string()),
            EngineError::InconsistentState(msg) => ApiError::Conflict(msg),
            EngineError::Config(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        ApiError::BadRequest(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Unavailable(_) | ApiError::Internal(_) = self {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(json!({
            "error": self.kind(),
            "message": self.message(),
        }));
        (self.status(), body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::StoreError;

    #[test]
    fn engine_errors_map_to_status_codes() {
        let cases = [
            (EngineError::from(ValidationError::LimitExceeded { limit: 5 }), StatusCode::BAD_REQUEST),
            (EngineError::not_found("website", "w1"), StatusCode::NOT_FOUND),
            (
                EngineError::store("w1", "load_rules", StoreError::Unavailable("down".to_string())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (EngineError::InconsistentState("drift".to_string()), StatusCode::CONFLICT),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn response_carries_status() {
        let response = ApiError::NotFound("website not found: w1".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
