use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use murmur_shared::RoomId;
use thiserror::Error;

use crate::gateway::ConnectionState;
use crate::services::FileStoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Authentication failed")]
    AuthenticationFailure,

    #[error("Unknown room: {0}")]
    UnknownRoom(RoomId),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Connection is not active ({0:?})")]
    NotActive(ConnectionState),

    #[error("Persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("Upload rejected: {0}")]
    UploadValidationFailure(String),

    #[error("File storage error: {0}")]
    FileStorage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<FileStoreError> for ServerError {
    fn from(e: FileStoreError) -> Self {
        match e {
            FileStoreError::Rejected(_) | FileStoreError::TooLarge { .. } => {
                ServerError::UploadValidationFailure(e.to_string())
            }
            FileStoreError::Storage(msg) => ServerError::FileStorage(msg),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::AuthenticationFailure => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::UnknownRoom(_) | ServerError::NotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            ServerError::MalformedEnvelope(_)
            | ServerError::UploadValidationFailure(_)
            | ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::NotActive(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::PersistenceFailure(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Persistence error".to_string())
            }
            ServerError::FileStorage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "File storage error".to_string())
            }
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
