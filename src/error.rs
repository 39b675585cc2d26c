use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use sqlx::error::DatabaseError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Request rejection taxonomy. Every variant carries a stable machine-checkable
/// kind; only the kind and message ever reach the client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Conflict(String),

    #[error("storage backend error: {0}")]
    Storage(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Persistence(e.to_string())
    }
}

impl ApiError {
    /// Wrap a store-layer failure, keeping the detail for logs only.
    pub fn persistence(e: impl std::fmt::Display) -> Self {
        ApiError::Persistence(e.to_string())
    }

    /// A unique-constraint violation means the row already exists, which is
    /// a conflict with current state rather than a backend fault. Anything
    /// else stays a persistence failure.
    pub fn conflict_on_unique(e: anyhow::Error, message: &str) -> Self {
        match e.downcast_ref::<sqlx::Error>() {
            Some(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                ApiError::Conflict(message.into())
            }
            _ => ApiError::persistence(e),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            // The source API answered duplicate ratings with 400, not 409;
            // the kind string still distinguishes the two cases.
            ApiError::InvalidInput(_) | ApiError::Conflict(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage(_) => StatusCode::BAD_GATEWAY,
            ApiError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::Unauthenticated(_) => "unauthenticated",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::InvalidInput(_) => "invalid_input",
            ApiError::Conflict(_) => "conflict",
            ApiError::Storage(_) => "storage_failure",
            ApiError::Persistence(_) => "persistence_failure",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            // Never leak driver/backend detail to the client.
            ApiError::Persistence(e) => {
                tracing::error!(error = %e, "persistence failure");
                "persistence error".to_string()
            }
            ApiError::Storage(e) => {
                tracing::error!(error = %e, "storage failure");
                "storage backend error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "kind": self.kind(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
