//! Error handling for the PLC servient.
//!
//! One consolidated error type covers the whole data path: address
//! resolution, Modbus transport, HTTP validation and the external sinks.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Servient error type
#[derive(Error, Debug, Clone)]
pub enum ServientError {
    /// A form references a register outside every configured class/range
    #[error("Address unresolved: {0}")]
    AddressUnresolved(String),

    /// Socket unavailable or connect failed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The device answered with a Modbus exception frame
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Malformed HTTP request or device description
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Metrics/message sink failures (best-effort, never surfaced to HTTP callers)
    #[error("Sink error: {0}")]
    SinkError(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the servient
pub type Result<T> = std::result::Result<T, ServientError>;

impl ServientError {
    pub fn address(msg: impl Into<String>) -> Self {
        ServientError::AddressUnresolved(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        ServientError::ConnectionError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ServientError::ProtocolError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ServientError::ValidationError(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ServientError::ConfigError(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        ServientError::SinkError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ServientError::InternalError(msg.into())
    }

    /// HTTP status this error maps to at the API boundary
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::ConnectionError(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::AddressUnresolved(_)
            | Self::ProtocolError(_)
            | Self::ConfigError(_)
            | Self::SinkError(_)
            | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServientError {
    fn into_response(self) -> Response {
        // Transport internals stay in the log; the caller only sees the
        // category and a short message.
        (self.http_status(), self.to_string()).into_response()
    }
}

impl From<std::io::Error> for ServientError {
    fn from(err: std::io::Error) -> Self {
        ServientError::ConnectionError(err.to_string())
    }
}

impl From<serde_json::Error> for ServientError {
    fn from(err: serde_json::Error) -> Self {
        ServientError::ValidationError(format!("JSON: {err}"))
    }
}

impl From<figment::Error> for ServientError {
    fn from(err: figment::Error) -> Self {
        ServientError::ConfigError(err.to_string())
    }
}

impl From<tokio_modbus::Error> for ServientError {
    fn from(err: tokio_modbus::Error) -> Self {
        match err {
            tokio_modbus::Error::Transport(e) => ServientError::ConnectionError(e.to_string()),
            other => ServientError::ProtocolError(other.to_string()),
        }
    }
}

impl From<tokio_modbus::ExceptionCode> for ServientError {
    fn from(code: tokio_modbus::ExceptionCode) -> Self {
        ServientError::ProtocolError(format!("Modbus exception: {code}"))
    }
}
