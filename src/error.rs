//! Error type shared by the process backends and the target resolver.
//! Each variant carries a machine code and maps onto an HTTP status so
//! handlers can return it directly.

use axum::http::StatusCode;
use std::borrow::Cow;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    #[error("Target must be bot|app|all|server (got '{0}')")]
    BadTarget(String),

    #[error("Action must be start|stop|restart (got '{0}')")]
    BadAction(String),

    #[error("Only action=restart is allowed for server (got '{0}')")]
    ServerActionNotAllowed(String),

    #[error("Process control through pm2 is not available in the current run mode")]
    Pm2Unavailable,

    #[error("{0}")]
    Pm2Failed(String),

    #[error("pm2 jlist parse failed")]
    Pm2Parse,

    #[error("Process '{0}' not found")]
    Pm2ProcessNotFound(String),

    #[error("Container not found")]
    ContainerNotFound,

    #[error("{0}")]
    DockerFailed(String),

    #[error("{body}")]
    DockerHttp { status: u16, body: String },

    #[error("docker inspect parse failed")]
    DockerParse,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    CommandFailed(String),
}

impl ControlError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadTarget(_) | Self::BadAction(_) | Self::ServerActionNotAllowed(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Pm2ProcessNotFound(_) | Self::ContainerNotFound => StatusCode::NOT_FOUND,
            Self::Pm2Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> Cow<'static, str> {
        match self {
            Self::BadTarget(_) => "BAD_TARGET".into(),
            Self::BadAction(_) | Self::ServerActionNotAllowed(_) => "BAD_ACTION".into(),
            Self::Pm2Unavailable => "PM2_UNAVAILABLE".into(),
            Self::Pm2Failed(_) => "PM2_FAILED".into(),
            Self::Pm2Parse => "PM2_PARSE_ERROR".into(),
            Self::Pm2ProcessNotFound(_) => "PM2_PROCESS_NOT_FOUND".into(),
            Self::ContainerNotFound => "DOCKER_CONTAINER_NOT_FOUND".into(),
            Self::DockerFailed(_) => "DOCKER_FAILED".into(),
            Self::DockerHttp { status, .. } => format!("DOCKER_HTTP_{}", status).into(),
            Self::DockerParse => "DOCKER_PARSE_ERROR".into(),
            Self::Forbidden(_) => "FORBIDDEN".into(),
            Self::CommandFailed(_) => "COMMAND_FAILED".into(),
        }
    }

    /// True when the supervisor binary itself is missing, which is the only
    /// failure that sends a lookup on to the container backend.
    pub fn is_pm2_unavailable(&self) -> bool {
        matches!(self, Self::Pm2Unavailable)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "ok": false,
            "error": self.to_string(),
            "code": self.code(),
        })
    }
}

impl axum::response::IntoResponse for ControlError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        (status, axum::Json(self.to_json())).into_response()
    }
}

/// Plain `{ok:false, error}` failure for handlers that have no richer error type.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self::new(err.status_code(), err.to_string())
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "ok": false, "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_status() {
        assert_eq!(ControlError::BadTarget("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ControlError::BadAction("x".into()).code(), "BAD_ACTION");
        assert_eq!(
            ControlError::DockerHttp { status: 409, body: "conflict".into() }.code(),
            "DOCKER_HTTP_409"
        );
        assert_eq!(ControlError::ContainerNotFound.code(), "DOCKER_CONTAINER_NOT_FOUND");
        assert!(ControlError::Pm2Unavailable.is_pm2_unavailable());
        assert!(!ControlError::Pm2Failed("boom".into()).is_pm2_unavailable());
    }

    #[test]
    fn test_json_body() {
        let body = ControlError::Pm2ProcessNotFound("cipherphantom-bot".into()).to_json();
        assert_eq!(body["ok"], false);
        assert_eq!(body["code"], "PM2_PROCESS_NOT_FOUND");
        assert_eq!(body["error"], "Process 'cipherphantom-bot' not found");
    }
}
