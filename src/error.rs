//! Error types for remote object access.
//!
//! This module defines the primary error type, `RemoteError`, shared by the
//! server-side engine, the request router and the client proxy. Using the
//! `thiserror` crate, it provides one consistent vocabulary for everything that
//! can go wrong between a client call and a hardware handler.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: a value did not match its schema or bounds. Detected before
//!   any side effect; the handler never runs.
//! - **`Access`**: a write to a `readonly` property, or a second write to a
//!   `constant` property.
//! - **`State`**: the operation is not permitted in the object's current state.
//! - **`Execution`**: a getter, setter or action handler failed while running. The
//!   original message is preserved.
//! - **`Timeout`**: a client-side wait (or a server-side lock/execution budget)
//!   elapsed.
//! - **`Transport`**: the connection failed. Every pending waiter on that
//!   connection receives this as a terminal error.
//! - **`NotFound`**: unknown thing, property, action, event or reply id.
//! - **`Protocol`**: malformed frames or an invocation mode the operation does
//!   not support.
//!
//! Errors travel over the wire as an [`ErrorDescriptor`] and are rebuilt on the
//! client with [`RemoteError::from_descriptor`], so the caller sees the same
//! variant the server raised.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the remote error type.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[derive(Error, Debug, Clone)]
#[allow(missing_docs)]
pub enum RemoteError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Access error: {0}")]
    Access(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Wire-level classification of a [`RemoteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ErrorKind {
    Validation,
    Access,
    State,
    Execution,
    Timeout,
    Transport,
    NotFound,
    Protocol,
    Config,
}

/// Structured error carried inside a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Error classification
    pub kind: ErrorKind,
    /// Human-readable message from the side that raised the error
    pub message: String,
}

impl RemoteError {
    /// Classify this error for transmission.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Validation(_) => ErrorKind::Validation,
            RemoteError::Access(_) => ErrorKind::Access,
            RemoteError::State(_) => ErrorKind::State,
            RemoteError::Execution(_) => ErrorKind::Execution,
            RemoteError::Timeout(_) => ErrorKind::Timeout,
            RemoteError::Transport(_) => ErrorKind::Transport,
            RemoteError::NotFound(_) => ErrorKind::NotFound,
            RemoteError::Protocol(_) => ErrorKind::Protocol,
            RemoteError::Config(_) => ErrorKind::Config,
        }
    }

    /// The message without the kind prefix added by `Display`.
    pub fn message(&self) -> &str {
        match self {
            RemoteError::Validation(m)
            | RemoteError::Access(m)
            | RemoteError::State(m)
            | RemoteError::Execution(m)
            | RemoteError::Timeout(m)
            | RemoteError::Transport(m)
            | RemoteError::NotFound(m)
            | RemoteError::Protocol(m)
            | RemoteError::Config(m) => m,
        }
    }

    /// Build the wire form of this error.
    pub fn to_descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            kind: self.kind(),
            message: self.message().to_string(),
        }
    }

    /// Rebuild an error received from the other side of a connection.
    pub fn from_descriptor(descriptor: ErrorDescriptor) -> Self {
        let ErrorDescriptor { kind, message } = descriptor;
        match kind {
            ErrorKind::Validation => RemoteError::Validation(message),
            ErrorKind::Access => RemoteError::Access(message),
            ErrorKind::State => RemoteError::State(message),
            ErrorKind::Execution => RemoteError::Execution(message),
            ErrorKind::Timeout => RemoteError::Timeout(message),
            ErrorKind::Transport => RemoteError::Transport(message),
            ErrorKind::NotFound => RemoteError::NotFound(message),
            ErrorKind::Protocol => RemoteError::Protocol(message),
            ErrorKind::Config => RemoteError::Config(message),
        }
    }

    /// Wrap a failure raised by user code (getter, setter, action handler).
    ///
    /// Always an `Execution` error: by the time user code fails it may have
    /// had side effects, so the pre-execution kinds do not apply. Nested
    /// errors keep their text in the message.
    pub fn from_handler(err: anyhow::Error) -> Self {
        RemoteError::Execution(format!("{:#}", err))
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        RemoteError::Transport(err.to_string())
    }
}

impl From<ConfigError> for RemoteError {
    fn from(err: ConfigError) -> Self {
        RemoteError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RemoteError::Validation("value 50 out of bounds".to_string());
        assert_eq!(err.to_string(), "Validation error: value 50 out of bounds");
    }

    #[test]
    fn test_descriptor_preserves_kind_and_message() {
        let err = RemoteError::State("connect not allowed in ON".into());
        let rebuilt = RemoteError::from_descriptor(err.to_descriptor());
        assert_eq!(rebuilt.kind(), ErrorKind::State);
        assert_eq!(rebuilt.message(), "connect not allowed in ON");
    }

    #[test]
    fn test_handler_error_wrapped_as_execution() {
        let err = RemoteError::from_handler(anyhow::anyhow!("could not set frame rate"));
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.message().contains("could not set frame rate"));
    }

    #[test]
    fn test_nested_remote_error_becomes_execution() {
        let err = RemoteError::from_handler(RemoteError::Validation("n: value 99 out of bounds".into()).into());
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.message().contains("value 99 out of bounds"));
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
    }
}
