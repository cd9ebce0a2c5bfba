use bytes::Bytes;

/// Close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent when the server is going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code sent when a peer is refused because the server is at capacity.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// Close code reported when a close frame carried no status.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Application-level event produced by one connection.
///
/// Ordering contract per connection:
///
/// (Text | Binary | Ping | Pong)* → Close?
///
/// A `Close`, when present, is always the last event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Bytes),
    /// Ping control frame (already answered by the transport).
    Ping(Bytes),
    /// Pong control frame.
    Pong(Bytes),
    /// Peer-initiated close.
    Close {
        /// Close status code.
        code: u16,
        /// Close reason text.
        reason: String,
    },
}

impl ConnectionEvent {
    /// Build a close event.
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }

    /// Whether this is a `Close` event.
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close { .. })
    }

    /// Whether this is a data message (text or binary).
    pub fn is_message(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Binary(_))
    }

    /// Whether this is a ping or pong.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_))
    }

    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Close { .. } => "close",
        }
    }
}

impl From<String> for ConnectionEvent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for ConnectionEvent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for ConnectionEvent {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(data))
    }
}

impl From<Bytes> for ConnectionEvent {
    fn from(data: Bytes) -> Self {
        Self::Binary(data)
    }
}
