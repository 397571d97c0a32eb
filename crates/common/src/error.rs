use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Common error types used across the pipeline.
#[derive(Debug, Error)]
pub enum AppError {
    /// A raw event names a recipient no user matches. The event stays unprocessed.
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    /// The user exists but has no chat identity to deliver to.
    #[error("No chat identity for user {0}")]
    UnknownChatIdentity(Uuid),

    #[error("Transport error: {0}")]
    Transport(String),

    /// Lost a race on a claim or state transition.
    #[error("Store conflict: {0}")]
    StoreConflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::UnknownRecipient(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            AppError::UnknownChatIdentity(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            AppError::Transport(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::StoreConflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Redis(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let resp = AppError::NotFound("x".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = AppError::StoreConflict("raced".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = AppError::Auth("nope".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_unknown_recipient_message() {
        let err = AppError::UnknownRecipient("ghost@nowhere.com".to_string());
        assert_eq!(err.to_string(), "Unknown recipient: ghost@nowhere.com");
    }
}
