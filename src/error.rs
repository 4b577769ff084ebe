//! HTTP-facing error type.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::cloud::{CloudError, ErrorClass};
use crate::ledger::LedgerError;
use crate::registration::RegistrationError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Cloud credentials missing or rejected, or the cloud is unreachable.
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", m),
            ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "NOT_FOUND", m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "CONFLICT", m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", m),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<CloudError> for ApiError {
    fn from(e: CloudError) -> Self {
        match e.class() {
            ErrorClass::Configuration => {
                ApiError::Unavailable(CloudError::NotConfigured.to_string())
            }
            ErrorClass::Transient => {
                ApiError::Unavailable(format!("cloud service unavailable, try again later ({e})"))
            }
            ErrorClass::Conflict => ApiError::Conflict(e.to_string()),
            ErrorClass::Permanent => match e {
                CloudError::NotFound(_) => ApiError::NotFound(e.to_string()),
                CloudError::InvalidPackage(_) | CloudError::Rejected { .. } => {
                    ApiError::BadRequest(e.to_string())
                }
                other => {
                    error!(error = %other, "cloud call failed");
                    ApiError::Internal(other.to_string())
                }
            },
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            StoreError::Rejected(reason) => ApiError::BadRequest(reason),
            other => {
                error!(error = %other, "store failure");
                ApiError::Internal("storage failure".into())
            }
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Invalid(m) => ApiError::BadRequest(m),
            LedgerError::Store(s) => s.into(),
        }
    }
}

impl From<RegistrationError> for ApiError {
    fn from(e: RegistrationError) -> Self {
        match e {
            RegistrationError::NoCourse(_)
            | RegistrationError::UnknownLearner(_)
            | RegistrationError::UnknownRegistration(_) => ApiError::NotFound(e.to_string()),
            RegistrationError::Cloud(c) => c.into(),
            RegistrationError::Store(s) => s.into(),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        error!(error = %e, "io failure");
        ApiError::Internal("io failure".into())
    }
}
