use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use palaver_core::CoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("too many requests")]
    RateLimited,

    #[error("{0}")]
    StreamRejected(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Core(core) => match core {
                CoreError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, core.to_string()),
                CoreError::NotFound => (StatusCode::NOT_FOUND, core.to_string()),
                CoreError::Conflict => (StatusCode::CONFLICT, core.to_string()),
                CoreError::ForbiddenMember => (StatusCode::FORBIDDEN, core.to_string()),
                CoreError::Unauthorized => (StatusCode::UNAUTHORIZED, core.to_string()),
                // Key and cipher details stay in the logs; callers get one
                // generic string.
                CoreError::KeyGeneration
                | CoreError::KeyPersistence
                | CoreError::KeyDecryption
                | CoreError::KeyNotFound
                | CoreError::KeyRevoked
                | CoreError::Encryption
                | CoreError::Decryption => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "encryption error".to_string(),
                ),
                CoreError::StorageUnavailable | CoreError::Cancelled => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service temporarily unavailable".to_string(),
                ),
            },
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            ApiError::StreamRejected(_) => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
        };

        let body = serde_json::json!({
            "success": false,
            "message": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
