use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::model::ModelError;
use crate::preprocessing::PreprocessError;

/// Errors that cross the HTTP boundary.
///
/// Only the `Display` text of client errors is shown to callers; internal
/// failures are logged with a correlation id and reported generically.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("Model not loaded")]
    ModelUnavailable,
    #[error("Internal server error")]
    Internal { correlation_id: Uuid },
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status_code: u16,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<Uuid>,
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Log `detail` server-side and return an opaque error carrying a fresh
    /// correlation id.
    pub fn internal(detail: impl fmt::Display) -> Self {
        let correlation_id = Uuid::new_v4();
        log::error!("Internal error [{}]: {}", correlation_id, detail);
        Self::Internal { correlation_id }
    }

    /// Message safe to show a client, used for per-file batch errors.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal { correlation_id } => {
                format!("{} (correlation id {})", self, correlation_id)
            }
            _ => self.to_string(),
        }
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            Self::Internal { correlation_id } => Some(*correlation_id),
            _ => None,
        }
    }
}

impl From<PreprocessError> for ApiError {
    fn from(e: PreprocessError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<ModelError> for ApiError {
    fn from(e: ModelError) -> Self {
        Self::internal(e)
    }
}

impl From<actix_web::error::BlockingError> for ApiError {
    fn from(e: actix_web::error::BlockingError) -> Self {
        Self::internal(e)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_client_error() {
            log::warn!("HTTP error: {} - {}", status.as_u16(), self);
        }
        HttpResponse::build(status).json(ErrorBody {
            error: self.to_string(),
            status_code: status.as_u16(),
            timestamp: Utc::now(),
            correlation_id: self.correlation_id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::validation("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::PayloadTooLarge("big".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(ApiError::ModelUnavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ApiError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_error_hides_detail() {
        let err = ApiError::from(ModelError::ShapeMismatch {
            expected: vec![1, 150, 150, 3],
            actual: vec![1, 3, 150, 150],
        });
        assert_eq!(err.to_string(), "Internal server error");
        assert!(err.correlation_id().is_some());
    }

    #[test]
    fn preprocess_errors_are_client_errors() {
        let err = ApiError::from(PreprocessError::UnsupportedContentType("text/plain".into()));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("text/plain"));
    }
}
