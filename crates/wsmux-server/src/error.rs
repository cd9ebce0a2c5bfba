//! Server error types.

use wsmux_core::MergeError;

/// Errors surfaced by [`serve`](crate::serve) and the event source.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not be bound. The only fatal startup failure.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error after the listener was bound.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The merged event stream was already claimed or the server is closed.
    #[error(transparent)]
    Merge(#[from] MergeError),
}

impl ServerError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Io(_) => "io",
            Self::Merge(e) => e.error_kind(),
        }
    }
}

/// Failure reported by a transport sink.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The underlying socket is gone.
    #[error("transport closed")]
    Closed,

    /// Protocol violation or framing error reported by the transport.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O failure on the socket.
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Why a [`Connection::send`](crate::Connection::send) was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The connection is closing or closed.
    #[error("connection closed")]
    Closed,
    /// The outbound queue is full; the message was dropped.
    #[error("outbound queue full")]
    Full,
}

/// Why a [`Connection::close`](crate::Connection::close) did not complete cleanly.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CloseError {
    /// Close was already requested, or the connection is gone.
    #[error("connection already closed")]
    AlreadyClosed,
    /// The writer did not acknowledge the close frame in time.
    #[error("close not acknowledged within {0:?}")]
    Timeout(std::time::Duration),
    /// The transport failed while sending the close frame.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why a raw connection was refused at admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AcceptError {
    /// The registry is at `max_connections`.
    #[error("at capacity ({max} connections)")]
    AtCapacity {
        /// Configured limit.
        max: usize,
    },
    /// The manager is shutting down.
    #[error("server shutting down")]
    ShuttingDown,
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// The config file is not valid JSON or does not match [`ServerConfig`](crate::ServerConfig).
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias for server results.
pub type Result<T, E = ServerError> = std::result::Result<T, E>;

pub(crate) fn bind_error(addr: &str, source: std::io::Error) -> ServerError {
    ServerError::Bind {
        addr: addr.to_owned(),
        source,
    }
}
