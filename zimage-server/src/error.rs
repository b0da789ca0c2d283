//! HTTP error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, warn};
use zimage_core::Error;

pub type ApiResult<T> = Result<T, ApiError>;

/// Hint attached to out-of-memory failures.
pub const OOM_HINT: &str = "try a lower precision tier such as q4";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Core(#[from] Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Core(Error::InvalidRequest(_) | Error::UnknownPrecision(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Core(Error::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Core(e) => format!("{e:#}"),
            other => other.to_string(),
        };
        let body = match &self {
            Self::Core(e) if e.is_out_of_memory() => {
                error!("Generation ran out of memory: {}", message);
                json!({ "error": message, "out_of_memory": true, "hint": OOM_HINT })
            }
            _ => {
                if status.is_server_error() {
                    error!("Request failed: {}", message);
                } else {
                    warn!("Rejected request: {}", message);
                }
                json!({ "error": message })
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(Error::invalid("bad")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(Error::UnknownPrecision("q9".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(Error::NotFound("gone".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(Error::generation(anyhow::anyhow!("CUDA out of memory"))).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
