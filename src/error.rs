//! Error types for vine-rpc.

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifier stamped on errors raised by the call executor.
pub const CLIENT_ID: &str = "vine.client";

/// Main error type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The selector could not resolve the service at all.
    #[error("service not found")]
    NotFound,

    /// The service resolved but no node survived filtering.
    #[error("none available")]
    NoneAvailable,

    /// Classified internal failure carrying service context.
    #[error("{id}: internal server error: {detail}")]
    Internal {
        /// Component or service that raised the error.
        id: String,
        /// Human readable detail.
        detail: String,
    },

    /// The caller's deadline expired or the call was cancelled.
    #[error("{id}: timeout: {detail}")]
    Timeout {
        /// Component or service that raised the error.
        id: String,
        /// Human readable detail.
        detail: String,
    },

    /// Status returned by a remote gRPC peer.
    #[error("rpc status: {0}")]
    Status(#[from] tonic::Status),

    /// Tonic transport error.
    #[error("Tonic transport error: {0}")]
    TonicTransport(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Encoding or decoding of discovery or payload data failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Discovery transport failure.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// The watcher was stopped.
    #[error("watcher stopped")]
    WatcherStopped,

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(e: tonic::transport::Error) -> Self {
        Self::TonicTransport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl Error {
    /// Create a connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create an internal error attributed to `id`.
    pub fn internal(id: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::Internal {
            id: id.into(),
            detail: detail.to_string(),
        }
    }

    /// Create a timeout error attributed to `id`.
    pub fn timeout(id: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::Timeout {
            id: id.into(),
            detail: detail.to_string(),
        }
    }

    /// Create a discovery error.
    pub fn discovery<S: Into<String>>(msg: S) -> Self {
        Self::Discovery(msg.into())
    }

    /// Whether this error means the caller ran out of time.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Status(status) => matches!(
                status.code(),
                tonic::Code::DeadlineExceeded | tonic::Code::Cancelled
            ),
            _ => false,
        }
    }

    /// Whether the default retry policy should attempt the call again.
    ///
    /// Timeouts and cancellation are never retried; everything else the
    /// transport reports is.
    pub fn is_retryable(&self) -> bool {
        !self.is_timeout() && !matches!(self, Self::WatcherStopped)
    }
}
