//! Caller-visible failure taxonomy.
//!
//! Every deadline has its own variant so callers can pick the right
//! recovery: reconnect after a `ConnectionTimeout`, retry on the same
//! connection after an `InvocationTimeout`, give up after a `ConnectTimeout`
//! that survived the retry loop.

use thiserror::Error;

use crate::net::connection::ConnectionId;

/// Errors surfaced by the RPC runtime.
///
/// `Clone` because a single close reason is delivered to every invocation
/// that was waiting on the dead connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// The handshake did not complete within the connect timeout.
    #[error("connect to {endpoint} timed out after {timeout_ms} ms")]
    ConnectTimeout { endpoint: String, timeout_ms: u64 },

    /// Establishment failed for any reason other than a timeout
    /// (refused, unreachable, reset during handshake).
    #[error("connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// A read or write on an open connection made no progress for the idle timeout.
    #[error("connection {connection} timed out: no transport progress for {timeout_ms} ms")]
    ConnectionTimeout {
        connection: ConnectionId,
        timeout_ms: u64,
    },

    /// The call's own deadline elapsed. The connection is unaffected.
    #[error("invocation `{operation}` timed out after {timeout_ms} ms")]
    InvocationTimeout { operation: String, timeout_ms: u64 },

    /// The peer reset or closed the connection.
    #[error("connection {connection} lost: {reason}")]
    ConnectionLost {
        connection: ConnectionId,
        reason: String,
    },

    /// The connection was closed by the application.
    #[error("connection {connection} closed by the application (graceful: {graceful})")]
    ConnectionClosed {
        connection: ConnectionId,
        graceful: bool,
    },

    /// Malformed or unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The servant raised an application-level exception.
    #[error("user exception: {0}")]
    UserException(String),

    #[error("object `{0}` does not exist")]
    ObjectNotExist(String),

    #[error("operation `{operation}` does not exist on `{identity}`")]
    OperationNotExist { identity: String, operation: String },

    /// The servant failed in a way it did not declare.
    #[error("unknown exception: {0}")]
    Unknown(String),

    #[error("invalid proxy `{input}`: {reason}")]
    InvalidProxy { input: String, reason: String },

    /// Timeouts are either -1 (infinite) or strictly positive.
    #[error("invalid timeout {0} ms: must be -1 or greater than 0")]
    InvalidTimeout(i64),

    #[error("object adapter deactivated")]
    AdapterDeactivated,

    /// The communicator was destroyed while the call was in progress.
    #[error("communicator destroyed")]
    CommunicatorDestroyed,
}

/// Fieldless mirror of [`RpcError`] for matching and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectTimeout,
    ConnectFailed,
    ConnectionTimeout,
    InvocationTimeout,
    ConnectionLost,
    ConnectionClosed,
    Protocol,
    UserException,
    ObjectNotExist,
    OperationNotExist,
    Unknown,
    InvalidProxy,
    InvalidTimeout,
    AdapterDeactivated,
    CommunicatorDestroyed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectTimeout => "connect_timeout",
            ErrorKind::ConnectFailed => "connect_failed",
            ErrorKind::ConnectionTimeout => "connection_timeout",
            ErrorKind::InvocationTimeout => "invocation_timeout",
            ErrorKind::ConnectionLost => "connection_lost",
            ErrorKind::ConnectionClosed => "connection_closed",
            ErrorKind::Protocol => "protocol",
            ErrorKind::UserException => "user_exception",
            ErrorKind::ObjectNotExist => "object_not_exist",
            ErrorKind::OperationNotExist => "operation_not_exist",
            ErrorKind::Unknown => "unknown",
            ErrorKind::InvalidProxy => "invalid_proxy",
            ErrorKind::InvalidTimeout => "invalid_timeout",
            ErrorKind::AdapterDeactivated => "adapter_deactivated",
            ErrorKind::CommunicatorDestroyed => "communicator_destroyed",
        }
    }
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            RpcError::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            RpcError::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            RpcError::InvocationTimeout { .. } => ErrorKind::InvocationTimeout,
            RpcError::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            RpcError::ConnectionClosed { .. } => ErrorKind::ConnectionClosed,
            RpcError::Protocol(_) => ErrorKind::Protocol,
            RpcError::UserException(_) => ErrorKind::UserException,
            RpcError::ObjectNotExist(_) => ErrorKind::ObjectNotExist,
            RpcError::OperationNotExist { .. } => ErrorKind::OperationNotExist,
            RpcError::Unknown(_) => ErrorKind::Unknown,
            RpcError::InvalidProxy { .. } => ErrorKind::InvalidProxy,
            RpcError::InvalidTimeout(_) => ErrorKind::InvalidTimeout,
            RpcError::AdapterDeactivated => ErrorKind::AdapterDeactivated,
            RpcError::CommunicatorDestroyed => ErrorKind::CommunicatorDestroyed,
        }
    }

    /// True for any of the three deadline kinds.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectTimeout | ErrorKind::ConnectionTimeout | ErrorKind::InvocationTimeout
        )
    }

    /// True when the failure means the connection it happened on is gone.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionTimeout
                | ErrorKind::ConnectionLost
                | ErrorKind::ConnectionClosed
                | ErrorKind::Protocol
        )
    }
}

/// Result type for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_kinds_are_distinct() {
        let connect = RpcError::ConnectTimeout {
            endpoint: "tcp://127.0.0.1:1".into(),
            timeout_ms: 100,
        };
        let invocation = RpcError::InvocationTimeout {
            operation: "sleep".into(),
            timeout_ms: 100,
        };
        assert!(connect.is_timeout());
        assert!(invocation.is_timeout());
        assert_ne!(connect.kind(), invocation.kind());
        assert!(!invocation.is_connection_fatal());
    }

    #[test]
    fn test_connection_timeout_is_fatal() {
        let err = RpcError::ConnectionTimeout {
            connection: ConnectionId::from_raw(7),
            timeout_ms: 250,
        };
        assert!(err.is_timeout());
        assert!(err.is_connection_fatal());
        assert_eq!(err.kind().as_str(), "connection_timeout");
        assert!(err.to_string().contains("conn-7"));
    }

    #[test]
    fn test_error_display() {
        let err = RpcError::InvalidTimeout(0);
        assert_eq!(
            err.to_string(),
            "invalid timeout 0 ms: must be -1 or greater than 0"
        );
        assert!(!RpcError::UserException("boom".into()).is_timeout());
    }
}
