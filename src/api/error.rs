use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::domain::ValidationError as PayloadError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// API error types that can be returned from handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Field node error: {0}")]
    FieldError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Error response that gets serialized to JSON
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::FieldError(_) => StatusCode::BAD_GATEWAY,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::ValidationError(_) => "ValidationError",
            ApiError::FieldError(_) => "FieldError",
            ApiError::InternalError(_) => "InternalServerError",
            ApiError::ServiceUnavailable(_) => "ServiceUnavailable",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type();

        let message = match &self {
            ApiError::InternalError(_) => {
                tracing::error!(error = %self, "API error occurred");
                "An internal error occurred".to_string()
            }
            ApiError::ServiceUnavailable(_) | ApiError::FieldError(_) => {
                tracing::warn!(error = %self, "upstream unavailable");
                self.to_string()
            }
            _ => {
                tracing::debug!(error = %self, "Client error");
                self.to_string()
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: error_type.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

impl From<PayloadError> for ApiError {
    fn from(error: PayloadError) -> Self {
        ApiError::ValidationError(error.to_string())
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ApiError::ValidationError(errors.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        ApiError::ServiceUnavailable(error.to_string())
    }
}

impl From<TransportError> for ApiError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Rejected { .. } => ApiError::BadRequest(error.to_string()),
            other => ApiError::FieldError(other.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::Validation(e) => e.into(),
            DispatchError::TransientStore(e) => e.into(),
            DispatchError::TransientTransport(e) => e.into(),
            DispatchError::EngineClosed | DispatchError::Timeout => {
                ApiError::ServiceUnavailable(error.to_string())
            }
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SensorKind;
    use crate::transport::Topic;

    #[test]
    fn dispatch_errors_map_to_http_statuses() {
        let cases = [
            (
                DispatchError::Validation(PayloadError::Malformed("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                DispatchError::TransientStore(StoreError::Timeout),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                DispatchError::TransientTransport(TransportError::Timeout { topic: Topic::Settings }),
                StatusCode::BAD_GATEWAY,
            ),
            (DispatchError::EngineClosed, StatusCode::SERVICE_UNAVAILABLE),
            (
                DispatchError::UnavailableInput(SensorKind::Battery),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status_code(), status);
        }
    }

    #[test]
    fn rejected_commands_are_client_errors() {
        let err = ApiError::from(TransportError::Rejected {
            topic: Topic::Relay,
            reason: "power_sp=2000".into(),
        });
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type(), "BadRequest");
    }
}
