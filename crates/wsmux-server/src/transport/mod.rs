//! Seam between the connection manager and the protocol library.
//!
//! A transport hands the manager a [`RawConnection`]: an already-decoded
//! inbound event stream plus a [`ConnectionSink`] for the outbound half.
//! Handshake, framing and ping auto-replies stay inside the transport.

pub mod memory;
pub mod ws;

use std::net::SocketAddr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use wsmux_core::ConnectionEvent;

use crate::connection::Message;
use crate::error::TransportError;

/// Decoded inbound events for one connection.
pub type InboundStream = BoxStream<'static, Result<ConnectionEvent, TransportError>>;

/// Outbound half of a connection.
#[async_trait]
pub trait ConnectionSink: Send {
    /// Write one data or control message.
    async fn send(&mut self, message: Message) -> Result<(), TransportError>;

    /// Write a close frame with `code` and `reason`.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// A connection accepted by the transport and not yet tracked.
pub struct RawConnection {
    /// Peer address, when the transport knows it.
    pub remote_addr: Option<SocketAddr>,
    /// Decoded inbound events.
    pub events: InboundStream,
    /// Outbound half.
    pub sink: Box<dyn ConnectionSink>,
}

impl RawConnection {
    /// Bundle the two halves of an accepted connection.
    pub fn new(
        remote_addr: Option<SocketAddr>,
        events: InboundStream,
        sink: Box<dyn ConnectionSink>,
    ) -> Self {
        Self {
            remote_addr,
            events,
            sink,
        }
    }
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}
