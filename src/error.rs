//! 统一的 API 错误类型与转换。

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::pipeline::PipelineError;
use crate::storage::LibraryError;

#[derive(Debug)]
pub enum ApiError {
    Internal(String),
    /// Creation-time validation failure: 422 with a plain-text message.
    Rejected {
        code: &'static str,
        message: String,
    },
    /// Upload-time failure: 422 with a JSON error body.
    UploadFailed {
        code: &'static str,
        message: String,
    },
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    status: &'static str,
    code: &'a str,
    message: &'a str,
}

impl ApiError {
    pub fn upload_not_found() -> Self {
        ApiError::UploadFailed {
            code: "upload_not_found",
            message: "upload not found".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
            ApiError::Rejected { code, message } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                [("x-error-code", code)],
                message,
            )
                .into_response(),
            ApiError::UploadFailed { code, message } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorBody {
                    status: "error",
                    code,
                    message: &message,
                }),
            )
                .into_response(),
        }
    }
}

impl From<LibraryError> for ApiError {
    fn from(error: LibraryError) -> Self {
        match error {
            LibraryError::Io(err) => ApiError::Internal(err.to_string()),
            other => ApiError::Rejected {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        ApiError::UploadFailed {
            code: error.code(),
            message: error.to_string(),
        }
    }
}
