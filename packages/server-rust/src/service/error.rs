//! Service-level and user-facing error types.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::auth::AuthFailure;
use super::config::ConfigError;
use super::store::StoreError;

/// Process-level failures. Startup variants are fatal; teardown variants are
/// logged and never escalated.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    ConfigInvalid(#[from] ConfigError),

    #[error("{resource} unavailable: {source}")]
    ResourceUnavailable {
        resource: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to bind listener: {0}")]
    Bind(#[source] anyhow::Error),

    #[error("teardown step '{step}' exceeded the shutdown deadline")]
    TeardownTimeout { step: &'static str },
}

/// Errors rendered to HTTP clients as `{"error": "<message>"}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Unauthorized(#[from] AuthFailure),

    #[error("{0}")]
    BadRequest(String),

    #[error("Invalid email address")]
    InvalidEmail,

    #[error("User not found")]
    NotFound,

    #[error("User already exists")]
    Conflict,

    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl ApiError {
    /// Builds a 400 from a body-extraction failure without leaking decoder internals.
    #[must_use]
    pub fn from_rejection(rejection: &JsonRejection) -> Self {
        Self::BadRequest(sanitize_validation_error(&rejection.body_text()))
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) | Self::InvalidEmail => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> String {
        match self {
            Self::Unauthorized(failure) => failure.public_message().to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            StoreError::AlreadyExists => Self::Conflict,
            StoreError::InvalidEmail => Self::InvalidEmail,
            other => Self::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(ref e) = self {
            tracing::error!(error = %e, "Request failed");
        }
        (self.status(), Json(json!({ "error": self.public_message() }))).into_response()
    }
}

const INTERNAL_MARKERS: &[&str] = &[
    "validation",
    "Field validation",
    "cannot unmarshal",
    "invalid type",
    "deserialize",
    "missing field",
    "bind",
    "Key:",
    "Error:",
];

/// Replaces decoder or validator output with a generic message unless it is
/// short and carries none of the internal markers.
#[must_use]
pub fn sanitize_validation_error(message: &str) -> String {
    const GENERIC: &str = "Invalid request";
    if message.len() >= 100 || INTERNAL_MARKERS.iter().any(|m| message.contains(m)) {
        GENERIC.to_string()
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn unauthorized_uses_public_message() {
        let (status, body) = body_json(ApiError::Unauthorized(AuthFailure::Missing)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({"error": "Authentication required"}));
    }

    #[tokio::test]
    async fn internal_error_hides_detail() {
        let (status, body) =
            body_json(ApiError::Internal(anyhow::anyhow!("pool exhausted at 10.0.0.3"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": "Internal server error"}));
    }

    #[tokio::test]
    async fn store_errors_map_to_statuses() {
        assert_eq!(ApiError::from(StoreError::NotFound).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(StoreError::AlreadyExists).status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::from(StoreError::InvalidEmail).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::from(StoreError::Closed).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn sanitize_keeps_short_clean_messages() {
        assert_eq!(sanitize_validation_error("name is required"), "name is required");
    }

    #[test]
    fn sanitize_hides_decoder_internals() {
        assert_eq!(
            sanitize_validation_error(
                "Failed to deserialize the JSON body into the target type: missing field `email`"
            ),
            "Invalid request"
        );
        assert_eq!(sanitize_validation_error("Key: 'Req.Email' Error:"), "Invalid request");
        assert_eq!(sanitize_validation_error(&"x".repeat(100)), "Invalid request");
    }

    #[test]
    fn teardown_timeout_names_step() {
        let err = ServiceError::TeardownTimeout { step: "exporter" };
        assert!(err.to_string().contains("exporter"));
    }
}
