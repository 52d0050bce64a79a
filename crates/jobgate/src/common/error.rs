use thiserror::Error;

use crate::common::error::GatewayError::{InternalError, ParameterError};

/// Every failure that can reach a caller of the gateway.
///
/// The variants map one to one onto the error codes of the HTTP surface.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    ParameterError(String),
    #[error("{0}")]
    SessionError(String),
    #[error("{0}")]
    ForbiddenError(String),
    #[error("{0}")]
    InternalError(String),
}

impl GatewayError {
    /// Name of the error as reported in the `code` field of an error response.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ParameterError(_) => "ParameterException",
            GatewayError::SessionError(_) => "SessionException",
            GatewayError::ForbiddenError(_) => "ForbiddenException",
            GatewayError::InternalError(_) => "InternalException",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::ParameterError(_) => 400,
            GatewayError::SessionError(_) | GatewayError::ForbiddenError(_) => 403,
            GatewayError::InternalError(_) => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            GatewayError::ParameterError(message)
            | GatewayError::SessionError(message)
            | GatewayError::ForbiddenError(message)
            | GatewayError::InternalError(message) => message,
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        InternalError(format!("I/O error: {e}"))
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        InternalError(format!("Database error: {e}"))
    }
}

impl From<serde_json::error::Error> for GatewayError {
    fn from(e: serde_json::error::Error) -> Self {
        InternalError(format!("Serialization error: {e}"))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(error: anyhow::Error) -> Self {
        InternalError(format!("{error:#}"))
    }
}

pub fn internal_error<T>(message: impl Into<String>) -> crate::Result<T> {
    Err(InternalError(message.into()))
}

pub fn parameter_error<T>(message: impl Into<String>) -> crate::Result<T> {
    Err(ParameterError(message.into()))
}

#[cfg(test)]
mod tests {
    use super::GatewayError;

    #[test]
    fn codes_and_statuses() {
        let cases = [
            (GatewayError::ParameterError("a".into()), "ParameterException", 400),
            (GatewayError::SessionError("b".into()), "SessionException", 403),
            (GatewayError::ForbiddenError("c".into()), "ForbiddenException", 403),
            (GatewayError::InternalError("d".into()), "InternalException", 500),
        ];
        for (error, code, status) in cases {
            assert_eq!(error.code(), code);
            assert_eq!(error.http_status(), status);
        }
    }

    #[test]
    fn io_errors_are_internal() {
        let error: GatewayError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(error, GatewayError::InternalError(_)));
        assert!(error.message().contains("missing"));
    }
}
