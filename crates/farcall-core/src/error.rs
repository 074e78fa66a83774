//! Error types for farcall.
//!
//! The taxonomy follows what can go wrong between two peers: malformed frames,
//! transport faults, exceptions thrown by a remote service, protocol-level
//! refusals carried on the wire as an [`ErrorCode`], cancellation and timeouts.

use crate::channel::ChannelState;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failures detected while reassembling a frame from the byte stream.
///
/// These are fatal to the receive operation that produced them, not to the
/// channel the bytes arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("Frame does not start with the expected marker")]
    InvalidMarker,

    #[error("Frame header truncated")]
    HeaderTruncated,

    #[error("Frame header checksum truncated")]
    HeaderCrcTruncated,

    #[error("Frame header checksum mismatch")]
    HeaderCrcMismatch,

    #[error("Unsupported frame version {0:#06x}")]
    UnsupportedVersion(u16),

    #[error("Negative frame body length {0}")]
    NegativeLength(i32),

    #[error("Frame body of {size} bytes exceeds the {max} byte limit")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Frame body truncated")]
    BodyTruncated,

    #[error("Frame body checksum truncated")]
    BodyCrcTruncated,

    #[error("Frame body checksum mismatch")]
    BodyCrcMismatch,
}

/// Closed set of protocol-level error codes carried by `Error` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InstanceNotFound = 1,
    ServiceNotAvailable = 2,
    SessionUnavailable = 3,
    UnexpectedPacket = 4,
    MethodNotFound = 5,
    PropertyNotFound = 6,
    EventNotFound = 7,
    InvalidArguments = 8,
}

impl ErrorCode {
    /// Decode a wire value; unknown values collapse to [`ErrorCode::Unknown`].
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => ErrorCode::InstanceNotFound,
            2 => ErrorCode::ServiceNotAvailable,
            3 => ErrorCode::SessionUnavailable,
            4 => ErrorCode::UnexpectedPacket,
            5 => ErrorCode::MethodNotFound,
            6 => ErrorCode::PropertyNotFound,
            7 => ErrorCode::EventNotFound,
            8 => ErrorCode::InvalidArguments,
            _ => ErrorCode::Unknown,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::Unknown => "unknown",
            ErrorCode::InstanceNotFound => "instance not found",
            ErrorCode::ServiceNotAvailable => "service not available",
            ErrorCode::SessionUnavailable => "session unavailable",
            ErrorCode::UnexpectedPacket => "unexpected packet",
            ErrorCode::MethodNotFound => "method not found",
            ErrorCode::PropertyNotFound => "property not found",
            ErrorCode::EventNotFound => "event not found",
            ErrorCode::InvalidArguments => "invalid arguments",
        };
        f.write_str(name)
    }
}

/// An exception raised by a service implementation, as seen across the wire.
///
/// The server-side error value never crosses the boundary; only its name,
/// message and an optional stack description do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteException {
    pub type_name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl RemoteException {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for RemoteException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// Main error type for farcall.
#[derive(Debug, Error)]
pub enum RpcError {
    // Wire errors
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    // Transport errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Cannot {operation} while channel is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ChannelState,
    },

    #[error("All {} channel factories failed", .0.len())]
    ConnectFailed(Vec<RpcError>),

    #[error("No channel factory produced a channel")]
    NoChannel,

    // Remote errors
    #[error("Server threw {0}")]
    ServerException(RemoteException),

    #[error("Remote error: {code}")]
    Remote {
        code: ErrorCode,
        stack: Option<String>,
    },

    // Protocol-level errors raised locally
    #[error("Service not available: {0}")]
    ServiceNotAvailable(Uuid),

    #[error("Instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("Session unavailable")]
    SessionUnavailable,

    #[error("Unexpected {0} packet")]
    UnexpectedPacket(&'static str),

    #[error("Method {0} not found")]
    MethodNotFound(i32),

    #[error("Property {0} not found")]
    PropertyNotFound(i32),

    #[error("Event {0} not found")]
    EventNotFound(i32),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    // Flow control
    #[error("Operation was cancelled")]
    Cancelled,

    #[error("No answer within {0:?}")]
    Timeout(Duration),

    // Serialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Registration and session state
    #[error("Service already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Property {0} is write-protected")]
    PropertyProtected(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for farcall operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return RpcError::ConnectionClosed;
        }
        RpcError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<RemoteException> for RpcError {
    fn from(exception: RemoteException) -> Self {
        RpcError::ServerException(exception)
    }
}

impl RpcError {
    pub fn transport(message: impl Into<String>) -> Self {
        RpcError::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Protocol-level code for errors that travel as `Error` replies.
    ///
    /// Returns `None` for errors that travel as `Exception` replies instead.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            RpcError::Remote { code, .. } => Some(*code),
            RpcError::ServiceNotAvailable(_) => Some(ErrorCode::ServiceNotAvailable),
            RpcError::InstanceNotFound(_) => Some(ErrorCode::InstanceNotFound),
            RpcError::SessionUnavailable => Some(ErrorCode::SessionUnavailable),
            RpcError::UnexpectedPacket(_) => Some(ErrorCode::UnexpectedPacket),
            RpcError::MethodNotFound(_) => Some(ErrorCode::MethodNotFound),
            RpcError::PropertyNotFound(_) => Some(ErrorCode::PropertyNotFound),
            RpcError::EventNotFound(_) => Some(ErrorCode::EventNotFound),
            RpcError::InvalidArguments(_) | RpcError::Serialization { .. } => {
                Some(ErrorCode::InvalidArguments)
            }
            _ => None,
        }
    }

    /// Describe this error as an exception for an `Exception` reply.
    pub fn to_exception(&self) -> RemoteException {
        match self {
            RpcError::ServerException(exception) => exception.clone(),
            other => RemoteException::new(other.kind_name(), other.to_string()),
        }
    }

    /// Short stable name of the variant, used as the exception type name.
    pub fn kind_name(&self) -> &'static str {
        match self {
            RpcError::Framing(_) => "Framing",
            RpcError::Malformed(_) => "Malformed",
            RpcError::Transport { .. } => "Transport",
            RpcError::ConnectionClosed => "ConnectionClosed",
            RpcError::InvalidState { .. } => "InvalidState",
            RpcError::ConnectFailed(_) => "ConnectFailed",
            RpcError::NoChannel => "NoChannel",
            RpcError::ServerException(_) => "ServerException",
            RpcError::Remote { .. } => "Remote",
            RpcError::ServiceNotAvailable(_) => "ServiceNotAvailable",
            RpcError::InstanceNotFound(_) => "InstanceNotFound",
            RpcError::SessionUnavailable => "SessionUnavailable",
            RpcError::UnexpectedPacket(_) => "UnexpectedPacket",
            RpcError::MethodNotFound(_) => "MethodNotFound",
            RpcError::PropertyNotFound(_) => "PropertyNotFound",
            RpcError::EventNotFound(_) => "EventNotFound",
            RpcError::InvalidArguments(_) => "InvalidArguments",
            RpcError::Cancelled => "Cancelled",
            RpcError::Timeout(_) => "Timeout",
            RpcError::Serialization { .. } => "Serialization",
            RpcError::AlreadyRegistered(_) => "AlreadyRegistered",
            RpcError::PropertyProtected(_) => "PropertyProtected",
            RpcError::Other(_) => "Other",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RpcError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout(_))
    }

    /// True for failures of the underlying byte stream, which fault a channel.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::Transport { .. } | RpcError::ConnectionClosed
        )
    }
}
