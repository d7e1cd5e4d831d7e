use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("credential not found: {client_id}")]
    NotFound { client_id: String },
    #[error("auth exchange failed: {message}")]
    AuthExchange { message: String },
    #[error("backend error: {message}")]
    Backend { message: String },
    #[error("backend timed out: {message}")]
    BackendTimeout { message: String },
    #[error("unsupported {what}: {value}")]
    UnsupportedVariant { what: &'static str, value: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("no eligible route for model {model} on {vendor}")]
    NoEligibleRoute { vendor: String, model: String },
    #[error("models catalog error: {message}")]
    ModelCatalog { message: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl GatewayError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Configuration { .. } | Self::UnsupportedVariant { .. } | Self::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::AuthExchange { .. } | Self::Backend { .. } | Self::ModelCatalog { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NoEligibleRoute { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::NotFound { .. } => "not_found",
            Self::AuthExchange { .. } => "auth_exchange_error",
            Self::Backend { .. } => "backend_error",
            Self::BackendTimeout { .. } => "backend_timeout",
            Self::UnsupportedVariant { .. } => "unsupported_variant",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::NoEligibleRoute { .. } => "no_eligible_route",
            Self::ModelCatalog { .. } => "models_catalog_error",
            Self::Store(_) => "store_error",
        }
    }

    /// Transport failures and timeouts while forwarding count against the credential.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::BackendTimeout { .. })
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ineligible_route_maps_to_unprocessable_entity() {
        let err = GatewayError::NoEligibleRoute {
            vendor: "google-gemini".to_string(),
            model: "gemini-pro".to_string(),
        };
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.code(), "no_eligible_route");
        assert!(!err.is_backend_failure());
    }

    #[test]
    fn timeouts_are_backend_failures() {
        let err = GatewayError::BackendTimeout {
            message: "30s".to_string(),
        };
        assert!(err.is_backend_failure());
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
