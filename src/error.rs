use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to start terminal in {cwd}: {reason}")]
    Spawn { cwd: String, reason: String },

    #[error("Error: No active terminal session. Open a terminal connection with a working directory first.")]
    NoActiveSession,

    #[error("Error: Terminal directory mismatch.\nActive Directory: {active}\nRequested Directory: {requested}\n\nClose and reopen the terminal connection to sync directories.")]
    DirectoryMismatch { active: String, requested: String },

    #[error("Failed to write to terminal: {0}")]
    ProcessWrite(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path traversal attempt: {0}")]
    PathTraversal(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Missing {0} query parameter")]
    MissingParameter(&'static str),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NoActiveSession
            | AppError::DirectoryMismatch { .. }
            | AppError::MissingParameter(_)
            | AppError::InvalidRequest(_)
            | AppError::InvalidPath(_)
            | AppError::PathTraversal(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
