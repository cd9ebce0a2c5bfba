//! In-process transport: a [`RawConnection`] driven from a [`MemoryPeer`].
//!
//! Useful for exercising the manager without sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use wsmux_core::ConnectionEvent;

use super::{ConnectionSink, RawConnection};
use crate::connection::Message;
use crate::error::TransportError;

/// What the server wrote to a memory connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkRecord {
    /// Data or control message.
    Message(Message),
    /// Close frame.
    Close {
        /// Close status code.
        code: u16,
        /// Close reason text.
        reason: String,
    },
}

/// Peer side of an in-memory connection.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Result<ConnectionEvent, TransportError>>>,
    outbound: mpsc::UnboundedReceiver<SinkRecord>,
    fail_close: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Deliver an event to the server. Returns `false` once disconnected.
    pub fn send(&self, event: impl Into<ConnectionEvent>) -> bool {
        self.push(Ok(event.into()))
    }

    /// Send a close event and end the inbound stream.
    pub fn close(&mut self, code: u16, reason: &str) {
        let _ = self.push(Ok(ConnectionEvent::close(code, reason)));
        self.disconnect();
    }

    /// Report a transport error and end the inbound stream.
    pub fn fail(&mut self, error: TransportError) {
        let _ = self.push(Err(error));
        self.disconnect();
    }

    /// End the inbound stream without a close event.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Make the server's next close frame fail.
    pub fn fail_next_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    /// Next record written by the server, or `None` once its sink is dropped.
    pub async fn recv(&mut self) -> Option<SinkRecord> {
        self.outbound.recv().await
    }

    /// Next record the server wrote, without waiting.
    pub fn try_recv(&mut self) -> Option<SinkRecord> {
        self.outbound.try_recv().ok()
    }

    fn push(&self, item: Result<ConnectionEvent, TransportError>) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(item).is_ok())
    }
}

struct MemorySink {
    tx: mpsc::UnboundedSender<SinkRecord>,
    fail_close: Arc<AtomicBool>,
}

#[async_trait]
impl ConnectionSink for MemorySink {
    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        self.tx
            .send(SinkRecord::Message(message))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.fail_close.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Io("close frame rejected".into()));
        }
        self.tx
            .send(SinkRecord::Close {
                code,
                reason: reason.to_owned(),
            })
            .map_err(|_| TransportError::Closed)
    }
}

/// Create a connected ([`RawConnection`], [`MemoryPeer`]) pair.
pub fn memory_connection(remote_addr: Option<SocketAddr>) -> (RawConnection, MemoryPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let fail_close = Arc::new(AtomicBool::new(false));

    let events = futures::stream::unfold(in_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();
    let sink = MemorySink {
        tx: out_tx,
        fail_close: Arc::clone(&fail_close),
    };

    let raw = RawConnection::new(remote_addr, events, Box::new(sink));
    let peer = MemoryPeer {
        inbound: Some(in_tx),
        outbound: out_rx,
        fail_close,
    };
    (raw, peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_events_reach_the_stream() {
        let (mut raw, mut peer) = memory_connection(None);
        assert!(peer.send("hi"));
        peer.close(1000, "bye");
        assert_eq!(raw.events.next().await, Some(Ok(ConnectionEvent::from("hi"))));
        assert_eq!(
            raw.events.next().await,
            Some(Ok(ConnectionEvent::close(1000, "bye")))
        );
        assert_eq!(raw.events.next().await, None);
        assert!(!peer.send("late"));
    }

    #[tokio::test]
    async fn sink_writes_reach_the_peer() {
        let (mut raw, mut peer) = memory_connection(None);
        raw.sink.send(Message::from("out")).await.unwrap();
        raw.sink.close(1001, "away").await.unwrap();
        assert_eq!(peer.recv().await, Some(SinkRecord::Message(Message::from("out"))));
        assert_eq!(
            peer.recv().await,
            Some(SinkRecord::Close {
                code: 1001,
                reason: "away".into()
            })
        );
    }

    #[tokio::test]
    async fn failed_close_is_one_shot() {
        let (mut raw, peer) = memory_connection(None);
        peer.fail_next_close();
        assert!(raw.sink.close(1000, "").await.is_err());
        assert!(raw.sink.close(1000, "").await.is_ok());
    }
}
