use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::protocol::Channel;

/// Main error type for the relay
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Inbound frame could not be decoded; the frame is dropped
    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    /// The peer never answered the bind request
    #[error("Bind timed out after {timeout:?} for client '{client_id}'")]
    BindTimeout { client_id: String, timeout: Duration },

    #[error("Strength {requested} on channel {channel} exceeds limit {limit}")]
    OutOfLimit {
        channel: Channel,
        requested: u32,
        limit: u32,
    },

    #[error("Client '{client_id}' is not bound yet")]
    NotBound { client_id: String },

    #[error("Client ID not provided")]
    MissingClientId,

    #[error("Client '{client_id}' already connected")]
    AlreadyConnected { client_id: String },

    #[error("Relay is shutting down")]
    ShuttingDown,

    #[error("Not a WebSocket connection: {reason}")]
    NotAWebsocket { reason: String },

    #[error("Transport closed: {reason}")]
    TransportClosed { reason: String },

    #[error("Background task '{task}' failed: {reason}")]
    SchedulerTask { task: String, reason: String },

    #[error("Pulse '{id}' not found")]
    PulseNotFound { id: String },

    #[error("Invalid configuration value for '{key}': {reason}")]
    ConfigInvalid { key: String, reason: String },

    #[error("Failed to bind relay server: {reason}")]
    WebSocketBindFailed { reason: String },

    #[error("I/O error: {0}")]
    Io(String),
}

/// Type alias for relay results
pub type RelayResult<T> = Result<T, RelayError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    MalformedMessage,
    BindTimeout,
    OutOfLimit,
    NotBound,
    MissingClientId,
    AlreadyConnected,
    ShuttingDown,
    NotAWebsocket,
    TransportClosed,
    SchedulerTask,
    PulseNotFound,
    ConfigInvalid,
    WebSocketBindFailed,
    Io,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code_str = match self {
            // Protocol errors
            ErrorCode::MalformedMessage => "MALFORMED_MESSAGE",
            ErrorCode::BindTimeout => "BIND_TIMEOUT",
            ErrorCode::OutOfLimit => "OUT_OF_LIMIT",
            ErrorCode::NotBound => "NOT_BOUND",

            // Accept errors
            ErrorCode::MissingClientId => "MISSING_CLIENT_ID",
            ErrorCode::AlreadyConnected => "ALREADY_CONNECTED",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ErrorCode::NotAWebsocket => "NOT_A_WEBSOCKET",

            // Runtime errors
            ErrorCode::TransportClosed => "TRANSPORT_CLOSED",
            ErrorCode::SchedulerTask => "SCHEDULER_TASK",
            ErrorCode::PulseNotFound => "PULSE_NOT_FOUND",

            // Setup errors
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
            ErrorCode::WebSocketBindFailed => "WS_BIND_FAILED",
            ErrorCode::Io => "IO",
        };
        write!(f, "{}", code_str)
    }
}

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Informational only, not an actual error
    Info,
    /// Warning that doesn't prevent operation
    Warning,
    /// Error that affects functionality but allows continued operation
    Error,
    /// Severe error that prevents further operation
    Critical,
}

impl RelayError {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::MalformedMessage { .. } => ErrorCode::MalformedMessage,
            RelayError::BindTimeout { .. } => ErrorCode::BindTimeout,
            RelayError::OutOfLimit { .. } => ErrorCode::OutOfLimit,
            RelayError::NotBound { .. } => ErrorCode::NotBound,
            RelayError::MissingClientId => ErrorCode::MissingClientId,
            RelayError::AlreadyConnected { .. } => ErrorCode::AlreadyConnected,
            RelayError::ShuttingDown => ErrorCode::ShuttingDown,
            RelayError::NotAWebsocket { .. } => ErrorCode::NotAWebsocket,
            RelayError::TransportClosed { .. } => ErrorCode::TransportClosed,
            RelayError::SchedulerTask { .. } => ErrorCode::SchedulerTask,
            RelayError::PulseNotFound { .. } => ErrorCode::PulseNotFound,
            RelayError::ConfigInvalid { .. } => ErrorCode::ConfigInvalid,
            RelayError::WebSocketBindFailed { .. } => ErrorCode::WebSocketBindFailed,
            RelayError::Io(_) => ErrorCode::Io,
        }
    }

    /// How loudly this error should be reported
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RelayError::MalformedMessage { .. }
            | RelayError::TransportClosed { .. }
            | RelayError::ShuttingDown => ErrorSeverity::Info,
            RelayError::OutOfLimit { .. }
            | RelayError::NotBound { .. }
            | RelayError::MissingClientId
            | RelayError::AlreadyConnected { .. }
            | RelayError::NotAWebsocket { .. }
            | RelayError::PulseNotFound { .. } => ErrorSeverity::Warning,
            RelayError::BindTimeout { .. }
            | RelayError::SchedulerTask { .. }
            | RelayError::ConfigInvalid { .. }
            | RelayError::Io(_) => ErrorSeverity::Error,
            RelayError::WebSocketBindFailed { .. } => ErrorSeverity::Critical,
        }
    }

    /// Returns true for errors caused by the transport going away
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, RelayError::TransportClosed { .. })
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(err.to_string())
    }
}

/// Body written back when a connection attempt is rejected
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub status: i32,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&RelayError> for ErrorResponse {
    fn from(err: &RelayError) -> Self {
        Self {
            status: -1,
            error: ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }
}

// Helper functions to create standard errors

/// Create a malformed message error
pub fn malformed(reason: impl fmt::Display) -> RelayError {
    RelayError::MalformedMessage {
        reason: reason.to_string(),
    }
}

/// Create a transport closed error
pub fn transport_closed(reason: impl fmt::Display) -> RelayError {
    RelayError::TransportClosed {
        reason: reason.to_string(),
    }
}

/// Create a configuration error
pub fn config_invalid(key: &str, reason: impl fmt::Display) -> RelayError {
    RelayError::ConfigInvalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
