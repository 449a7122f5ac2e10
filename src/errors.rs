use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SakhiError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(sakhi::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(sakhi::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(sakhi::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(sakhi::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("JOSE error: {0}")]
    #[diagnostic(code(sakhi::jose))]
    Jose(String),

    #[error("Bad request: {0}")]
    #[diagnostic(code(sakhi::bad_request))]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    #[diagnostic(code(sakhi::unauthorized))]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    #[diagnostic(code(sakhi::forbidden))]
    Forbidden(String),

    #[error("Not found: {0}")]
    #[diagnostic(code(sakhi::not_found))]
    NotFound(String),

    #[error("Conflict: {0}")]
    #[diagnostic(code(sakhi::conflict))]
    Conflict(String),

    #[error("Too many requests: {0}")]
    #[diagnostic(code(sakhi::too_many_requests))]
    TooManyRequests(String),

    #[error("Payload too large: {0}")]
    #[diagnostic(code(sakhi::payload_too_large))]
    PayloadTooLarge(String),

    #[error("Upstream service error: {0}")]
    #[diagnostic(code(sakhi::upstream))]
    Upstream(String),

    #[error("{0}")]
    #[diagnostic(code(sakhi::other))]
    Other(String),
}

impl From<josekit::JoseError> for SakhiError {
    fn from(value: josekit::JoseError) -> Self {
        SakhiError::Jose(value.to_string())
    }
}

impl From<JsonRejection> for SakhiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            SakhiError::PayloadTooLarge(rejection.body_text())
        } else {
            SakhiError::BadRequest(rejection.body_text())
        }
    }
}

impl From<QueryRejection> for SakhiError {
    fn from(rejection: QueryRejection) -> Self {
        SakhiError::BadRequest(rejection.body_text())
    }
}

impl SakhiError {
    pub fn not_found(what: &str) -> Self {
        SakhiError::NotFound(format!("{} not found", what))
    }

    /// HTTP status plus the machine-readable code used in error bodies
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            SakhiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            SakhiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            SakhiError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            SakhiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            SakhiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            SakhiError::TooManyRequests(_) => (StatusCode::TOO_MANY_REQUESTS, "too_many_requests"),
            SakhiError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            SakhiError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            SakhiError::Serde(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            SakhiError::Io(_)
            | SakhiError::Config(_)
            | SakhiError::Db(_)
            | SakhiError::Jose(_)
            | SakhiError::Other(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for SakhiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Internal details stay in the logs
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let kind = if status.is_client_error() {
            "client_error"
        } else {
            "server_error"
        };

        (
            status,
            Json(json!({"error": {"code": code, "message": message, "type": kind}})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            SakhiError::not_found("Farmer").status_and_code(),
            (StatusCode::NOT_FOUND, "not_found")
        );
        assert_eq!(
            SakhiError::TooManyRequests("locked".into()).status_and_code().0,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            SakhiError::Db(sea_orm::DbErr::Custom("boom".into()))
                .status_and_code()
                .0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = SakhiError::not_found("Field");
        assert_eq!(err.to_string(), "Not found: Field not found");
    }
}
