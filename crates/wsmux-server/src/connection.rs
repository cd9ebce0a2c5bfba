//! Handle to one open connection and its outbound writer task.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Interval;
use tracing::debug;
use wsmux_core::{ConnectionEvent, ConnectionId};

use crate::error::{CloseError, SendError, TransportError};
use crate::transport::ConnectionSink;

/// Outbound data or control message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Bytes),
    /// Ping control frame.
    Ping(Bytes),
    /// Pong control frame.
    Pong(Bytes),
}

impl Message {
    /// Short name of the message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(data))
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

/// Echo an inbound event back out. `Close` has no outbound message form.
impl TryFrom<ConnectionEvent> for Message {
    type Error = ConnectionEvent;

    fn try_from(event: ConnectionEvent) -> Result<Self, Self::Error> {
        match event {
            ConnectionEvent::Text(text) => Ok(Self::Text(text)),
            ConnectionEvent::Binary(data) => Ok(Self::Binary(data)),
            ConnectionEvent::Ping(data) => Ok(Self::Ping(data)),
            ConnectionEvent::Pong(data) => Ok(Self::Pong(data)),
            close @ ConnectionEvent::Close { .. } => Err(close),
        }
    }
}

/// Lifecycle state of a [`Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting sends.
    Open,
    /// A close frame was requested and not yet written.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Lowercase state name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Per-connection tunables, taken from [`ServerConfig`](crate::ServerConfig).
#[derive(Clone, Copy, Debug)]
pub struct ConnectionOptions {
    /// Outbound queue capacity.
    pub outbound_queue: usize,
    /// Server-initiated ping period, if any.
    pub ping_interval: Option<Duration>,
    /// How long [`Connection::close`] waits for the close frame to be written.
    pub close_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            ping_interval: None,
            close_timeout: Duration::from_secs(1),
        }
    }
}

enum Command {
    Send(Message),
    Close {
        code: u16,
        reason: String,
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
}

/// Represents one open connection.
///
/// Outbound traffic goes through a bounded queue to a writer task that owns
/// the transport sink.
pub struct Connection {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    connected_at: Instant,
    state: Arc<AtomicU8>,
    tx: mpsc::Sender<Command>,
    dropped_messages: AtomicU64,
    close_timeout: Duration,
}

impl Connection {
    /// Create the handle and its writer future. The caller spawns the writer;
    /// it runs until the connection closes or the last handle is dropped.
    pub fn open(
        id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        sink: Box<dyn ConnectionSink>,
        options: ConnectionOptions,
    ) -> (Arc<Self>, impl Future<Output = ()> + Send + 'static) {
        let (tx, rx) = mpsc::channel(options.outbound_queue.max(1));
        let state = Arc::new(AtomicU8::new(OPEN));
        let conn = Arc::new(Self {
            id: id.clone(),
            remote_addr,
            connected_at: Instant::now(),
            state: Arc::clone(&state),
            tx,
            dropped_messages: AtomicU64::new(0),
            close_timeout: options.close_timeout,
        });
        let writer = run_writer(id, sink, rx, state, options.ping_interval);
        (conn, writer)
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Peer address, when the transport knows it.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// When the connection was accepted.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the connection still accepts outbound messages.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Total messages dropped because the outbound queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Queue a message for the writer without waiting.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        match self.tx.try_send(Command::Send(message.into())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(SendError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.mark_closed();
                Err(SendError::Closed)
            }
        }
    }

    /// Send a close frame and wait, up to the close timeout, for the writer
    /// to put it on the wire.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), CloseError> {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CloseError::AlreadyClosed);
        }

        let (ack, acked) = oneshot::channel();
        let command = Command::Close {
            code,
            reason: reason.to_owned(),
            ack,
        };
        let outcome = tokio::time::timeout(self.close_timeout, async {
            self.tx
                .send(command)
                .await
                .map_err(|_| CloseError::AlreadyClosed)?;
            acked
                .await
                .map_err(|_| CloseError::AlreadyClosed)?
                .map_err(CloseError::from)
        })
        .await;
        self.mark_closed();

        debug!(conn_id = %self.id, code, reason, "close frame requested");
        outcome.unwrap_or(Err(CloseError::Timeout(self.close_timeout)))
    }

    /// Record that the peer or the transport ended the connection.
    pub(crate) fn mark_closed(&self) {
        self.state.store(CLOSED, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            let _ = interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_writer(
    id: ConnectionId,
    mut sink: Box<dyn ConnectionSink>,
    mut rx: mpsc::Receiver<Command>,
    state: Arc<AtomicU8>,
    ping_interval: Option<Duration>,
) {
    let mut ping = ping_interval.map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Send(message)) => {
                    if let Err(error) = sink.send(message).await {
                        debug!(conn_id = %id, %error, "outbound write failed");
                        break;
                    }
                }
                Some(Command::Close { code, reason, ack }) => {
                    let result = sink.close(code, &reason).await;
                    let _ = ack.send(result);
                    break;
                }
                None => break,
            },
            () = tick(&mut ping) => {
                if let Err(error) = sink.send(Message::Ping(Bytes::new())).await {
                    debug!(conn_id = %id, %error, "ping write failed");
                    break;
                }
            }
        }
    }

    state.store(CLOSED, Ordering::SeqCst);
    debug!(conn_id = %id, "writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryPeer, SinkRecord, memory_connection};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn open_with(options: ConnectionOptions) -> (Arc<Connection>, MemoryPeer) {
        let (raw, peer) = memory_connection(None);
        let (conn, writer) = Connection::open(ConnectionId::new(), None, raw.sink, options);
        let _ = tokio::spawn(writer);
        (conn, peer)
    }

    #[test]
    fn echo_conversion_rejects_close() {
        assert_eq!(
            Message::try_from(ConnectionEvent::from("hi")),
            Ok(Message::from("hi"))
        );
        let close = ConnectionEvent::close(1000, "bye");
        assert_eq!(Message::try_from(close.clone()), Err(close));
    }

    #[tokio::test]
    async fn send_reaches_sink_in_order() {
        let (conn, mut peer) = open_with(ConnectionOptions::default());
        assert!(conn.is_open());
        conn.send("one").unwrap();
        conn.send(vec![2u8]).unwrap();
        let first = tokio::time::timeout(TIMEOUT, peer.recv()).await.unwrap();
        let second = tokio::time::timeout(TIMEOUT, peer.recv()).await.unwrap();
        assert_eq!(first, Some(SinkRecord::Message(Message::from("one"))));
        assert_eq!(second, Some(SinkRecord::Message(Message::from(vec![2u8]))));
    }

    #[tokio::test]
    async fn full_queue_counts_drops() {
        let (raw, _peer) = memory_connection(None);
        let options = ConnectionOptions {
            outbound_queue: 1,
            ..ConnectionOptions::default()
        };
        // Writer never spawned, so nothing drains the queue.
        let (conn, _writer) = Connection::open(ConnectionId::new(), None, raw.sink, options);
        conn.send("a").unwrap();
        assert_eq!(conn.send("b"), Err(SendError::Full));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn close_writes_frame_and_marks_closed() {
        let (conn, mut peer) = open_with(ConnectionOptions::default());
        conn.close(1000, "bye").await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(
            peer.recv().await,
            Some(SinkRecord::Close {
                code: 1000,
                reason: "bye".into()
            })
        );
        assert_eq!(conn.send("late"), Err(SendError::Closed));
        assert_eq!(conn.close(1000, "again").await, Err(CloseError::AlreadyClosed));
    }

    #[tokio::test]
    async fn close_failure_is_reported() {
        let (conn, peer) = open_with(ConnectionOptions::default());
        peer.fail_next_close();
        let result = conn.close(1001, "away").await;
        assert!(matches!(result, Err(CloseError::Transport(_))));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn close_times_out_without_writer() {
        let (raw, _peer) = memory_connection(None);
        let options = ConnectionOptions {
            close_timeout: Duration::from_millis(20),
            ..ConnectionOptions::default()
        };
        let (conn, _writer) = Connection::open(ConnectionId::new(), None, raw.sink, options);
        let result = conn.close(1000, "").await;
        assert_eq!(result, Err(CloseError::Timeout(Duration::from_millis(20))));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_sends_periodic_pings() {
        let options = ConnectionOptions {
            ping_interval: Some(Duration::from_secs(5)),
            ..ConnectionOptions::default()
        };
        let (_conn, mut peer) = open_with(options);
        assert!(peer.try_recv().is_none());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            peer.recv().await,
            Some(SinkRecord::Message(Message::Ping(Bytes::new())))
        );
    }

    #[tokio::test]
    async fn writer_exit_marks_closed() {
        let (conn, peer) = open_with(ConnectionOptions::default());
        drop(peer);
        // The sink fails once the peer is gone; the writer then exits.
        let _ = conn.send("x");
        tokio::time::timeout(TIMEOUT, async {
            while conn.is_open() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(conn.send("y"), Err(SendError::Closed));
    }
}
