//! Supervisor error type. Each variant maps to the HTTP status and
//! error code the IPC handlers report back to the caller.

use axum::http::StatusCode;

/// Errors surfaced by supervisor operations
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Bot '{0}' is not running")]
    NotRunning(String),

    #[error("`{command}` failed ({}): {stderr_tail}", exit_label(.exit_code))]
    ProvisionFailed {
        command: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code".to_string(),
    }
}

impl From<std::io::Error> for SupervisorError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.into())
    }
}

impl SupervisorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::PreconditionFailed(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotRunning(_) => StatusCode::CONFLICT,
            Self::ProvisionFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        });
        if let Self::ProvisionFailed { command, exit_code, stderr_tail } = self {
            body["command"] = serde_json::json!(command);
            body["exit_code"] = serde_json::json!(exit_code);
            body["stderr_tail"] = serde_json::json!(stderr_tail);
        }
        body
    }

    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::PreconditionFailed(_) => "PRECONDITION_FAILED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::ProvisionFailed { .. } => "PROVISION_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        if let Self::Internal(e) = &self {
            tracing::error!("Internal supervisor error: {:#}", e);
        }
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
