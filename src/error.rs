//! Unified error handling for memring
//!
//! Every failure a command can end with is a `MemringError`. The dispatcher
//! uses `is_recoverable` to decide whether the retry policy may resubmit a
//! command, and `severity` to pick a log level.

use crate::protocol::Status;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Main error type for memring operations
#[derive(Debug, Error)]
pub enum MemringError {
    /// Socket-level failure, refused connect or peer hangup
    #[error("Connection error ({server}): {message}")]
    Connection { server: String, message: String },

    /// Malformed, unexpected or unmatched frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Command deadline exceeded
    #[error("Operation timed out after {after:?}: {operation}")]
    Timeout { operation: String, after: Duration },

    /// No servers configured, all servers down, or an invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Command cancelled by the caller or by dispatcher shutdown
    #[error("Command cancelled")]
    Cancelled,

    /// Command rejected before it reached a connection
    #[error("Invalid command: {message}")]
    InvalidCommand { message: String },

    /// The server reported that the key does not exist
    #[error("Key not found")]
    NotFound,

    /// The server reported that the key exists (add, or CAS mismatch)
    #[error("Key exists")]
    KeyExists,

    /// Any other non-success status returned by the server
    #[error("Server returned status: {status}")]
    Server { status: Status },

    /// The event loop could not be started
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("No servers configured")]
    NoServers,

    #[error("All servers are down")]
    AllServersDown,
}

/// Result type alias for memring operations
pub type MemringResult<T> = Result<T, MemringError>;

impl MemringError {
    /// Create a connection error for a server label
    pub fn connection<S: Into<String>, M: Into<String>>(server: S, message: M) -> Self {
        MemringError::Connection {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create a connection error from an I/O failure
    pub fn io<S: Into<String>>(server: S, err: &io::Error) -> Self {
        MemringError::Connection {
            server: server.into(),
            message: err.to_string(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        MemringError::Protocol(message.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, after: Duration) -> Self {
        MemringError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create an invalid command error
    pub fn invalid_command<S: Into<String>>(message: S) -> Self {
        MemringError::InvalidCommand {
            message: message.into(),
        }
    }

    /// Map a non-success server status to its typed error
    pub fn from_status(status: Status) -> Self {
        match status {
            Status::KeyNotFound => MemringError::NotFound,
            Status::KeyExists => MemringError::KeyExists,
            status => MemringError::Server { status },
        }
    }

    /// Check if this error is recoverable (the command may be resubmitted)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MemringError::Connection { .. } | MemringError::Protocol(_) | MemringError::Timeout { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            MemringError::Config(_) | MemringError::Runtime(_) => ErrorSeverity::Critical,
            MemringError::Protocol(_) => ErrorSeverity::Error,
            MemringError::Connection { .. } => ErrorSeverity::Warning,
            MemringError::Timeout { .. } => ErrorSeverity::Warning,
            MemringError::InvalidCommand { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Info,
        }
    }

    /// Emit a tracing event at the level matching this error's severity
    pub fn log(&self, context: &str) {
        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::Error => error!("{}: {}", context, self),
            ErrorSeverity::Warning => warn!("{}: {}", context, self),
            ErrorSeverity::Info => debug!("{}: {}", context, self),
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Errors that leave the client unable to serve any command
    Critical,
    /// Errors that affect a connection but not the event loop
    Error,
    /// Transient failures that are usually retried
    Warning,
    /// Ordinary command outcomes
    Info,
}
