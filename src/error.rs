//! 上传子系统的错误类型与 HTTP 响应转换。

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::io::ErrorKind;

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file size {size} exceeds limit {max}")]
    FileTooLarge { size: u64, max: u64 },

    #[error("session does not belong to caller")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("too many active uploads (limit {0})")]
    TooManySessions(u64),

    #[error("session persistence failed: {0}")]
    SessionPersistence(String),

    #[error("upload incomplete, missing chunks {missing:?}")]
    IncompleteUpload { missing: Vec<u64> },

    #[error("integrity check failed: expected {expected} bytes, got {actual}")]
    IntegrityCheckFailed { expected: u64, actual: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("chunk write failed: {0}")]
    ChunkWrite(String),

    #[error("finalization failed: {0}")]
    Finalization(String),
}

impl UploadError {
    /// 稳定的错误代码，客户端据此决定重试分片、续传或重新上传。
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::InvalidArgument(_) => "invalid_argument",
            UploadError::FileTooLarge { .. } => "file_too_large",
            UploadError::Unauthorized => "unauthorized",
            UploadError::NotFound(_) => "not_found",
            UploadError::InvalidState(_) => "invalid_state",
            UploadError::TooManySessions(_) => "too_many_sessions",
            UploadError::SessionPersistence(_) => "session_persistence_error",
            UploadError::IncompleteUpload { .. } => "incomplete_upload",
            UploadError::IntegrityCheckFailed { .. } => "integrity_check_failed",
            UploadError::Storage(_) => "storage_error",
            UploadError::ChunkWrite(_) => "chunk_write_failed",
            UploadError::Finalization(_) => "finalization_failed",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            UploadError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::Unauthorized => StatusCode::UNAUTHORIZED,
            UploadError::NotFound(_) => StatusCode::NOT_FOUND,
            UploadError::InvalidState(_) => StatusCode::CONFLICT,
            UploadError::TooManySessions(_) => StatusCode::TOO_MANY_REQUESTS,
            UploadError::SessionPersistence(_)
            | UploadError::IncompleteUpload { .. }
            | UploadError::IntegrityCheckFailed { .. }
            | UploadError::Storage(_)
            | UploadError::ChunkWrite(_)
            | UploadError::Finalization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn finalization(err: std::io::Error) -> Self {
        UploadError::Finalization(err.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_chunks: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    actual: Option<u64>,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            missing_chunks: None,
            expected: None,
            actual: None,
        };
        match self {
            UploadError::IncompleteUpload { missing } => body.missing_chunks = Some(missing),
            UploadError::IntegrityCheckFailed { expected, actual } => {
                body.expected = Some(expected);
                body.actual = Some(actual);
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

impl From<StorageError> for UploadError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => UploadError::InvalidArgument("invalid path".into()),
            StorageError::NameExhausted => {
                UploadError::InvalidArgument("no free file name in destination".into())
            }
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => UploadError::NotFound(err.to_string()),
                _ => UploadError::Storage(err.to_string()),
            },
        }
    }
}
