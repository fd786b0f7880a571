//! Operator administration: feature flags, the fixed table of shell
//! operations, and the file-backed job queue that runs them later.

pub mod flags;
pub mod jobs;
pub mod ops;

use axum::http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum AdminError {
    #[error("Unknown operation: {0}")]
    UnknownOp(String),

    #[error("{0}")]
    FeatureDisabled(&'static str),

    #[error("Invalid flags: {0}")]
    InvalidFlags(String),

    #[error("Invalid runAt '{0}' (expected an ISO-8601 timestamp)")]
    InvalidRunAt(String),

    #[error("op is required")]
    MissingOp,

    #[error("{0}")]
    Store(#[from] anyhow::Error),
}

impl AdminError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownOp(_) | Self::InvalidFlags(_) | Self::InvalidRunAt(_) | Self::MissingOp => {
                StatusCode::BAD_REQUEST
            }
            Self::FeatureDisabled(_) => StatusCode::FORBIDDEN,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Flag-gate refusals carry a message only.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::UnknownOp(_) => Some("UNKNOWN_OP"),
            Self::FeatureDisabled(_) => None,
            Self::InvalidFlags(_) => Some("INVALID_FLAGS"),
            Self::InvalidRunAt(_) => Some("INVALID_RUN_AT"),
            Self::MissingOp => Some("MISSING_OP"),
            Self::Store(_) => Some("STORE_ERROR"),
        }
    }
}

impl axum::response::IntoResponse for AdminError {
    fn into_response(self) -> axum::response::Response {
        let mut body = serde_json::json!({ "ok": false, "error": self.to_string() });
        if let Some(code) = self.error_code() {
            body["code"] = code.into();
        }
        (self.status_code(), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn test_feature_disabled_has_no_code() {
        let res = AdminError::FeatureDisabled("Deploy is disabled by feature flag.").into_response();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, serde_json::json!({ "ok": false, "error": "Deploy is disabled by feature flag." }));

        let res = AdminError::UnknownOp("rm_rf".into()).into_response();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "UNKNOWN_OP");
    }
}
