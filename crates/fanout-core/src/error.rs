//! Error types for fan-out operations.
//!
//! This module provides [`FanoutError`], the error type shared by the cache,
//! the client sessions and the connection listener. Errors fall into four
//! groups:
//!
//! - ingestion errors, reported back to the upstream adapter
//! - session errors, which terminate exactly one client session
//! - configuration errors, raised while building a cache or server
//! - internal errors
//!
//! Chain invariant violations are not represented here: they abort the
//! process.

use std::fmt;

/// Comprehensive error type for fan-out operations.
///
/// # Example
///
/// ```rust
/// use fanout_core::FanoutError;
///
/// fn validate_key(key: &str) -> Result<(), FanoutError> {
///     if key.is_empty() {
///         return Err(FanoutError::InvalidUpdate {
///             key: key.to_string(),
///             reason: "key cannot be empty".to_string(),
///         });
///     }
///     Ok(())
/// }
///
/// assert!(validate_key("").is_err());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    /// An update in an ingested batch is malformed. No part of the batch
    /// was applied.
    #[error("invalid update for key {key:?}: {reason}")]
    InvalidUpdate {
        /// The offending key.
        key: String,
        /// Reason for the rejection.
        reason: String,
    },

    /// The peer sent a message that violates the session protocol.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// The peer does not speak a protocol version we support.
    #[error("unsupported protocol version {requested} (supported {min}..={max})")]
    VersionMismatch {
        /// Highest version offered by the peer.
        requested: u32,
        /// Lowest version supported locally.
        min: u32,
        /// Highest version supported locally.
        max: u32,
    },

    /// A frame exceeded the configured maximum size.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Reading from or writing to the transport failed.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Optional underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Disconnected,

    /// The session fell too far behind the chain tail.
    #[error("slow consumer: {lag} breadcrumbs behind (limit {limit})")]
    SlowConsumer {
        /// Observed lag in breadcrumbs.
        lag: u64,
        /// Configured limit.
        limit: u64,
    },

    /// An operation did not complete in time.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// The connection was refused because a limit was reached.
    #[error("connection limit reached: {message}")]
    ConnectionLimit {
        /// Which limit was hit.
        message: String,
    },

    /// The cache or server is shutting down.
    #[error("shutting down")]
    Shutdown,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unexpected internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
        /// Optional underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl FanoutError {
    /// Create an invalid-update error.
    pub fn invalid_update(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUpdate {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a transport error from any error type.
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error from any error type.
    pub fn internal<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether this error only concerns a single client session.
    ///
    /// Session-local errors close the session that raised them and are never
    /// propagated to the cache or to other sessions.
    pub fn is_session_local(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::VersionMismatch { .. }
                | Self::FrameTooLarge { .. }
                | Self::Transport { .. }
                | Self::Disconnected
                | Self::SlowConsumer { .. }
                | Self::Timeout { .. }
        )
    }

    /// The close reason a session reports when it ends with this error.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::Protocol { .. } | Self::FrameTooLarge { .. } => CloseReason::ProtocolError,
            Self::VersionMismatch { .. } => CloseReason::VersionMismatch,
            Self::Transport { .. } => CloseReason::TransportError,
            Self::Disconnected => CloseReason::Disconnected,
            Self::SlowConsumer { .. } => CloseReason::SlowConsumer,
            Self::Timeout { .. } => CloseReason::Timeout,
            Self::Shutdown => CloseReason::Shutdown,
            Self::InvalidUpdate { .. }
            | Self::ConnectionLimit { .. }
            | Self::Configuration(_)
            | Self::Internal { .. } => CloseReason::Internal,
        }
    }
}

impl From<std::io::Error> for FanoutError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::Disconnected,
            _ => Self::transport("i/o failure", err),
        }
    }
}

/// Why a client session ended.
///
/// Used as a low-cardinality metrics label and in session logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The client said goodbye.
    ClientGoodbye,
    /// The transport was closed by the peer.
    Disconnected,
    /// The session lagged too far behind the chain tail.
    SlowConsumer,
    /// A keepalive or write deadline expired.
    Timeout,
    /// The peer violated the protocol.
    ProtocolError,
    /// The peer requested an unsupported protocol version.
    VersionMismatch,
    /// Writing to or reading from the transport failed.
    TransportError,
    /// The server is shutting down.
    Shutdown,
    /// Anything else.
    Internal,
}

impl CloseReason {
    /// Static label for this reason.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ClientGoodbye => "client_goodbye",
            Self::Disconnected => "disconnected",
            Self::SlowConsumer => "slow_consumer",
            Self::Timeout => "timeout",
            Self::ProtocolError => "protocol_error",
            Self::VersionMismatch => "version_mismatch",
            Self::TransportError => "transport_error",
            Self::Shutdown => "shutdown",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FanoutError::invalid_update("/a", "key too long");
        assert!(err.to_string().contains("key too long"));
        assert!(err.to_string().contains("/a"));
    }

    #[test]
    fn test_session_local_classification() {
        assert!(FanoutError::SlowConsumer { lag: 9, limit: 3 }.is_session_local());
        assert!(FanoutError::Disconnected.is_session_local());
        assert!(FanoutError::protocol("bad hello").is_session_local());
        assert!(!FanoutError::invalid_update("k", "empty").is_session_local());
        assert!(!FanoutError::Shutdown.is_session_local());
    }

    #[test]
    fn test_close_reason_mapping() {
        assert_eq!(
            FanoutError::SlowConsumer { lag: 5, limit: 2 }.close_reason(),
            CloseReason::SlowConsumer
        );
        assert_eq!(FanoutError::Shutdown.close_reason(), CloseReason::Shutdown);
        assert_eq!(CloseReason::SlowConsumer.to_string(), "slow_consumer");
    }

    #[test]
    fn test_io_error_conversion() {
        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert!(matches!(FanoutError::from(eof), FanoutError::Disconnected));

        let other = std::io::Error::other("boom");
        assert!(matches!(
            FanoutError::from(other),
            FanoutError::Transport { .. }
        ));
    }
}
