//! Connection lifecycle: admission, merging, broadcast and shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use metrics::{counter, gauge, histogram};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use wsmux_core::event::{CLOSE_GOING_AWAY, CLOSE_TRY_AGAIN_LATER};
use wsmux_core::{ConnectionEvent, ConnectionId, Merge, MergeError, MergeStrategy};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionOptions, Message};
use crate::error::{AcceptError, CloseError};
use crate::registry::{BroadcastReport, ConnectionRegistry};
use crate::transport::{InboundStream, RawConnection};

/// One event on the merged stream, tagged with the connection it came from.
#[derive(Clone, Debug)]
pub struct MergedEvent {
    /// Connection that produced the event.
    pub connection: Arc<Connection>,
    /// The event as decoded by the transport.
    pub event: ConnectionEvent,
}

/// The single merged stream of events from every tracked connection.
pub type EventStream = BoxStream<'static, MergedEvent>;

/// Why a connection attempt was turned away; the `reason` label of
/// `ws_rejected_total`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The request was not a valid WebSocket upgrade.
    Handshake,
    /// `max_connections` reached.
    Capacity,
    /// The server is shutting down.
    ShuttingDown,
}

impl RejectReason {
    /// Metric label value.
    pub fn label(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Capacity => "capacity",
            Self::ShuttingDown => "shutting_down",
        }
    }

    pub(crate) fn record(self) {
        counter!("ws_rejected_total", "reason" => self.label()).increment(1);
    }
}

impl From<AcceptError> for RejectReason {
    fn from(error: AcceptError) -> Self {
        match error {
            AcceptError::AtCapacity { .. } => Self::Capacity,
            AcceptError::ShuttingDown => Self::ShuttingDown,
        }
    }
}

/// Outcome of [`ConnectionManager::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Connections that received a close frame.
    pub closed: usize,
    /// Connections that were already closing or closed.
    pub already_closed: usize,
    /// Close attempts that failed or timed out.
    pub failed: Vec<(ConnectionId, CloseError)>,
}

/// Owns the registry and the merge primitive for one server.
///
/// Each accepted connection gets a writer task and an adapted event stream
/// attached to the merge. The adapted stream untracks its connection exactly
/// once: when a `Close` event is read (before it is yielded), when the
/// transport ends or errors, or when the stream is dropped by a stop.
pub struct ConnectionManager {
    registry: Arc<ConnectionRegistry>,
    merge: Box<dyn Merge<MergedEvent>>,
    strategy: MergeStrategy,
    accepting: AtomicBool,
    max_connections: usize,
    options: ConnectionOptions,
    shutdown_timeout: Duration,
    writers: TaskTracker,
    writer_stop: CancellationToken,
}

impl ConnectionManager {
    /// Build a manager with an empty registry and the configured merge strategy.
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            merge: config.merge_strategy.build(),
            strategy: config.merge_strategy,
            accepting: AtomicBool::new(true),
            max_connections: config.max_connections,
            options: ConnectionOptions {
                outbound_queue: config.outbound_queue,
                ping_interval: config.ping_interval(),
                close_timeout: config.close_timeout(),
            },
            shutdown_timeout: config.shutdown_timeout(),
            writers: TaskTracker::new(),
            writer_stop: CancellationToken::new(),
        }
    }

    /// Registry of tracked connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Merge primitive backing the event stream.
    pub fn strategy(&self) -> MergeStrategy {
        self.strategy
    }

    /// Whether new connections are still admitted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Number of tracked connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of the tracked connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.snapshot()
    }

    /// Events merged but not yet taken by the consumer. Each connection has
    /// at most one event buffered.
    pub fn buffered_events(&self) -> usize {
        self.merge.pending()
    }

    /// Track a connection handed over by the transport and merge its events.
    ///
    /// Refused connections get a close frame (1013 at capacity, 1001 while
    /// shutting down) and are never tracked.
    pub async fn accept(&self, raw: RawConnection) -> Result<Arc<Connection>, AcceptError> {
        if !self.is_accepting() {
            self.reject(raw, AcceptError::ShuttingDown).await;
            return Err(AcceptError::ShuttingDown);
        }
        let Some(slot) = self.registry.try_reserve(self.max_connections) else {
            let error = AcceptError::AtCapacity {
                max: self.max_connections,
            };
            self.reject(raw, error).await;
            return Err(error);
        };

        let RawConnection {
            remote_addr,
            events,
            sink,
        } = raw;
        let (conn, writer) = Connection::open(ConnectionId::new(), remote_addr, sink, self.options);
        let stop = self.writer_stop.clone();
        let _ = self.writers.spawn(async move {
            tokio::select! {
                () = writer => {}
                () = stop.cancelled() => {}
            }
        });

        slot.insert(Arc::clone(&conn));
        counter!("ws_connections_total").increment(1);
        gauge!("ws_connections_active").increment(1.0);
        info!(
            conn_id = %conn.id(),
            remote = ?remote_addr,
            active = self.registry.len(),
            "connection accepted"
        );

        // Shutdown may have snapshotted the registry before the insert.
        if !self.is_accepting() {
            let untrack = Untrack::new(Arc::clone(&conn), Arc::clone(&self.registry));
            drop(untrack);
            let _ = conn.close(CLOSE_GOING_AWAY, "server shutting down").await;
            return Err(AcceptError::ShuttingDown);
        }

        self.merge
            .attach(adapt(Arc::clone(&conn), Arc::clone(&self.registry), events));
        Ok(conn)
    }

    async fn reject(&self, raw: RawConnection, reason: AcceptError) {
        let code = match reason {
            AcceptError::AtCapacity { .. } => CLOSE_TRY_AGAIN_LATER,
            AcceptError::ShuttingDown => CLOSE_GOING_AWAY,
        };
        RejectReason::from(reason).record();
        warn!(remote = ?raw.remote_addr, %reason, code, "connection rejected");

        let mut sink = raw.sink;
        let text = reason.to_string();
        match tokio::time::timeout(self.options.close_timeout, sink.close(code, &text)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!(%error, "close frame for rejected connection failed"),
            Err(_) => debug!("close frame for rejected connection timed out"),
        }
    }

    /// Claim the merged event stream. Only the first call succeeds.
    pub fn events(&self) -> Result<EventStream, MergeError> {
        self.merge.merged()
    }

    /// Send `message` to every tracked open connection.
    pub fn broadcast(&self, message: &Message) -> BroadcastReport {
        self.registry.broadcast(message)
    }

    /// Stop accepting, end the merged stream and close every tracked
    /// connection with 1001. Returns `None` if shutdown already ran.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return None;
        }

        // Snapshot first: stopping the merge drops the adapted streams, which
        // untracks their connections.
        let connections = self.registry.snapshot();
        self.merge.stop();
        info!(connections = connections.len(), "closing connections");

        let outcomes = futures::future::join_all(connections.iter().map(|conn| async move {
            let outcome = conn.close(CLOSE_GOING_AWAY, "server shutting down").await;
            (conn.id().clone(), outcome)
        }))
        .await;

        let mut report = ShutdownReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.closed += 1,
                Err(CloseError::AlreadyClosed) => report.already_closed += 1,
                Err(error) => {
                    warn!(conn_id = %id, %error, "close failed during shutdown");
                    report.failed.push((id, error));
                }
            }
        }

        self.writer_stop.cancel();
        let _ = self.writers.close();
        if tokio::time::timeout(self.shutdown_timeout, self.writers.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.writers.len(),
                "writer tasks still running after {:?}", self.shutdown_timeout
            );
        }

        info!(
            closed = report.closed,
            already_closed = report.already_closed,
            failed = report.failed.len(),
            "connections closed"
        );
        Some(report)
    }
}

/// Removes a connection from the registry exactly once.
struct Untrack {
    connection: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    done: bool,
}

impl Untrack {
    fn new(connection: Arc<Connection>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            connection,
            registry,
            done: false,
        }
    }

    fn fire(&mut self) {
        if std::mem::replace(&mut self.done, true) {
            return;
        }
        if self.registry.remove(self.connection.id()).is_some() {
            let age = self.connection.age();
            counter!("ws_disconnections_total").increment(1);
            gauge!("ws_connections_active").decrement(1.0);
            histogram!("ws_connection_duration_seconds").record(age.as_secs_f64());
            info!(
                conn_id = %self.connection.id(),
                duration_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                active = self.registry.len(),
                "connection untracked"
            );
        }
    }

    fn event(&self, event: ConnectionEvent) -> MergedEvent {
        MergedEvent {
            connection: Arc::clone(&self.connection),
            event,
        }
    }
}

impl Drop for Untrack {
    fn drop(&mut self) {
        self.fire();
    }
}

enum Phase {
    Live(InboundStream, Untrack),
    /// Close seen; keep reading so the transport can finish its handshake.
    Draining(InboundStream),
}

/// Tag each event with its connection and untrack when the sequence ends.
fn adapt(
    connection: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    events: InboundStream,
) -> BoxStream<'static, MergedEvent> {
    let start = Phase::Live(events, Untrack::new(connection, registry));
    futures::stream::unfold(start, |phase| async move {
        let (mut events, mut untrack) = match phase {
            Phase::Live(events, untrack) => (events, untrack),
            Phase::Draining(mut events) => {
                while events.next().await.is_some() {}
                return None;
            }
        };
        match events.next().await {
            Some(Ok(event)) if event.is_close() => {
                untrack.connection.mark_closed();
                untrack.fire();
                let item = untrack.event(event);
                Some((item, Phase::Draining(events)))
            }
            Some(Ok(event)) => {
                let item = untrack.event(event);
                Some((item, Phase::Live(events, untrack)))
            }
            Some(Err(error)) => {
                warn!(conn_id = %untrack.connection.id(), %error, "connection transport error");
                untrack.connection.mark_closed();
                untrack.fire();
                None
            }
            None => {
                debug!(conn_id = %untrack.connection.id(), "connection stream ended");
                untrack.connection.mark_closed();
                untrack.fire();
                None
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::memory::{MemoryPeer, SinkRecord, memory_connection};
    use wsmux_core::event::CLOSE_NORMAL;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn strategies() -> [MergeStrategy; 2] {
        [MergeStrategy::Queue, MergeStrategy::Multiplexer]
    }

    fn manager(strategy: MergeStrategy) -> ConnectionManager {
        ConnectionManager::new(&ServerConfig {
            merge_strategy: strategy,
            close_timeout_ms: 200,
            shutdown_timeout_secs: 1,
            ..ServerConfig::default()
        })
    }

    async fn connect(manager: &ConnectionManager) -> (Arc<Connection>, MemoryPeer) {
        let (raw, peer) = memory_connection(None);
        let conn = manager.accept(raw).await.unwrap();
        (conn, peer)
    }

    async fn next(events: &mut EventStream) -> MergedEvent {
        tokio::time::timeout(TIMEOUT, events.next())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(TIMEOUT, async {
            while !cond() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached");
    }

    /// Read until the peer sees a close frame, skipping data.
    async fn close_frame(peer: &mut MemoryPeer) -> Option<(u16, String)> {
        loop {
            match tokio::time::timeout(TIMEOUT, peer.recv()).await.ok()?? {
                SinkRecord::Close { code, reason } => return Some((code, reason)),
                SinkRecord::Message(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn scenario_close_untracks_before_close_is_observed() {
        for strategy in strategies() {
            let manager = manager(strategy);
            let mut events = manager.events().unwrap();
            let (a, mut peer_a) = connect(&manager).await;
            let (b, peer_b) = connect(&manager).await;

            assert!(peer_a.send("hello"));
            assert!(peer_b.send(vec![1u8, 2, 3]));
            peer_a.close(CLOSE_NORMAL, "bye");

            let mut from_a = Vec::new();
            let mut from_b = Vec::new();
            for _ in 0..3 {
                let merged = next(&mut events).await;
                if merged.connection.id() == a.id() {
                    from_a.push(merged.event);
                } else {
                    assert_eq!(merged.connection.id(), b.id());
                    from_b.push(merged.event);
                }
            }
            assert_eq!(
                from_a,
                vec![
                    ConnectionEvent::from("hello"),
                    ConnectionEvent::close(CLOSE_NORMAL, "bye")
                ],
                "{strategy:?}"
            );
            assert_eq!(from_b, vec![ConnectionEvent::from(vec![1u8, 2, 3])]);

            let ids: Vec<_> = manager.connections().iter().map(|c| c.id().clone()).collect();
            assert_eq!(ids, vec![b.id().clone()], "{strategy:?}");
            assert!(!a.is_open());
        }
    }

    #[tokio::test]
    async fn disconnect_without_close_untracks() {
        for strategy in strategies() {
            let manager = manager(strategy);
            let mut events = manager.events().unwrap();
            let (a, mut peer_a) = connect(&manager).await;
            let (_b, peer_b) = connect(&manager).await;

            peer_a.disconnect();
            wait_until(|| !manager.registry().contains(a.id())).await;
            assert!(!a.is_open());
            assert!(peer_b.send("after"));

            let merged = next(&mut events).await;
            assert_eq!(merged.event, ConnectionEvent::from("after"));
            assert!(!manager.registry().contains(a.id()), "{strategy:?}");
            assert_eq!(manager.connection_count(), 1);
        }
    }

    #[tokio::test]
    async fn transport_error_ends_connection_without_merging() {
        for strategy in strategies() {
            let manager = manager(strategy);
            let mut events = manager.events().unwrap();
            let (a, mut peer_a) = connect(&manager).await;
            let (_b, peer_b) = connect(&manager).await;

            assert!(peer_a.send("before"));
            peer_a.fail(TransportError::Protocol("bad frame".into()));
            assert_eq!(next(&mut events).await.event, ConnectionEvent::from("before"));

            assert!(peer_b.send("other"));
            let merged = next(&mut events).await;
            assert_eq!(merged.event, ConnectionEvent::from("other"), "{strategy:?}");
            wait_until(|| !manager.registry().contains(a.id())).await;
            assert!(!a.is_open());
        }
    }

    #[tokio::test]
    async fn every_event_delivered_once_in_connection_order() {
        for strategy in strategies() {
            let manager = manager(strategy);
            let mut events = manager.events().unwrap();
            let mut peers = Vec::new();
            let mut ids = Vec::new();
            for _ in 0..4 {
                let (conn, peer) = connect(&manager).await;
                ids.push(conn.id().clone());
                peers.push(peer);
            }
            for (n, peer) in peers.iter().enumerate() {
                for i in 0..20 {
                    assert!(peer.send(format!("{n}:{i}")));
                }
            }

            let mut seen: std::collections::HashMap<ConnectionId, Vec<String>> =
                std::collections::HashMap::new();
            for _ in 0..80 {
                let merged = next(&mut events).await;
                let ConnectionEvent::Text(text) = merged.event else {
                    panic!("unexpected event");
                };
                seen.entry(merged.connection.id().clone())
                    .or_default()
                    .push(text);
            }
            for (n, id) in ids.iter().enumerate() {
                let expected: Vec<_> = (0..20).map(|i| format!("{n}:{i}")).collect();
                assert_eq!(seen[id], expected, "{strategy:?}");
            }
        }
    }

    #[tokio::test]
    async fn shutdown_ends_stream_and_closes_connections() {
        for strategy in strategies() {
            let manager = manager(strategy);
            let mut events = manager.events().unwrap();
            let (_a, mut peer_a) = connect(&manager).await;
            let (_b, mut peer_b) = connect(&manager).await;
            assert!(peer_a.send("buffered"));
            assert!(peer_b.send("buffered"));

            let report = manager.shutdown().await.unwrap();
            assert_eq!(report.closed, 2, "{strategy:?}");
            assert!(report.failed.is_empty());

            let end = tokio::time::timeout(TIMEOUT, events.next()).await.unwrap();
            assert!(end.is_none(), "{strategy:?}");
            assert_eq!(
                close_frame(&mut peer_a).await,
                Some((CLOSE_GOING_AWAY, "server shutting down".into()))
            );
            assert!(close_frame(&mut peer_b).await.is_some());
            wait_until(|| manager.connection_count() == 0).await;
        }
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let manager = manager(MergeStrategy::Queue);
        let (_a, _peer) = connect(&manager).await;
        assert!(manager.shutdown().await.is_some());
        assert!(manager.shutdown().await.is_none());
        assert!(!manager.is_accepting());
    }

    #[tokio::test]
    async fn shutdown_collects_close_failures() {
        let manager = manager(MergeStrategy::Queue);
        let (bad, peer_bad) = connect(&manager).await;
        let (_good, _peer_good) = connect(&manager).await;
        peer_bad.fail_next_close();

        let report = manager.shutdown().await.unwrap();
        assert_eq!(report.closed, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(&report.failed[0].0, bad.id());
    }

    #[tokio::test]
    async fn shutdown_counts_already_closed() {
        let manager = manager(MergeStrategy::Queue);
        let (a, _peer_a) = connect(&manager).await;
        let (_b, _peer_b) = connect(&manager).await;
        a.close(CLOSE_NORMAL, "early").await.unwrap();

        let report = manager.shutdown().await.unwrap();
        assert_eq!(report.closed, 1);
        assert_eq!(report.already_closed, 1);
    }

    #[tokio::test]
    async fn rejects_over_capacity_with_try_again_later() {
        let manager = ConnectionManager::new(&ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        });
        let (_first, _peer) = connect(&manager).await;

        let (raw, mut peer) = memory_connection(None);
        let result = manager.accept(raw).await;
        assert_eq!(result.unwrap_err(), AcceptError::AtCapacity { max: 1 });
        let (code, _) = close_frame(&mut peer).await.unwrap();
        assert_eq!(code, CLOSE_TRY_AGAIN_LATER);
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accepts_never_exceed_capacity() {
        let manager = Arc::new(ConnectionManager::new(&ServerConfig {
            max_connections: 2,
            ..ServerConfig::default()
        }));
        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    let (raw, peer) = memory_connection(None);
                    (manager.accept(raw).await.is_ok(), peer)
                })
            })
            .collect();

        let mut accepted = 0;
        let mut peers = Vec::new();
        for attempt in attempts {
            let (ok, peer) = attempt.await.unwrap();
            accepted += usize::from(ok);
            peers.push(peer);
        }
        assert_eq!(accepted, 2);
        assert_eq!(manager.connection_count(), 2);
    }

    #[tokio::test]
    async fn capacity_frees_up_after_disconnect() {
        let manager = ConnectionManager::new(&ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        });
        let _events = manager.events().unwrap();
        let (first, mut peer) = connect(&manager).await;
        peer.disconnect();
        wait_until(|| !manager.registry().contains(first.id())).await;

        let (raw, _peer) = memory_connection(None);
        assert!(manager.accept(raw).await.is_ok());
    }

    #[tokio::test]
    async fn default_config_buffers_one_event_per_connection() {
        let manager = ConnectionManager::new(&ServerConfig::default());
        assert_eq!(manager.strategy(), MergeStrategy::Queue);
        let mut events = manager.events().unwrap();
        let (a, peer_a) = connect(&manager).await;
        let (_b, peer_b) = connect(&manager).await;
        for i in 0..200 {
            assert!(peer_a.send(format!("a{i}")));
            assert!(peer_b.send(format!("b{i}")));
        }

        wait_until(|| manager.buffered_events() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.buffered_events(), 2);

        let mut from_a = Vec::new();
        while from_a.len() < 10 {
            let merged = next(&mut events).await;
            if merged.connection.id() == a.id() {
                from_a.push(merged.event);
            }
        }
        let expected: Vec<_> = (0..10).map(|i| ConnectionEvent::from(format!("a{i}"))).collect();
        assert_eq!(from_a, expected);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.buffered_events() <= 2, "{}", manager.buffered_events());
    }

    #[tokio::test]
    async fn rejects_after_shutdown_with_going_away() {
        let manager = manager(MergeStrategy::Queue);
        let _ = manager.shutdown().await;
        let (raw, mut peer) = memory_connection(None);
        assert_eq!(
            manager.accept(raw).await.unwrap_err(),
            AcceptError::ShuttingDown
        );
        let (code, _) = close_frame(&mut peer).await.unwrap();
        assert_eq!(code, CLOSE_GOING_AWAY);
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn reject_reason_labels() {
        assert_eq!(RejectReason::Handshake.label(), "handshake");
        assert_eq!(
            RejectReason::from(AcceptError::AtCapacity { max: 1 }).label(),
            "capacity"
        );
        assert_eq!(
            RejectReason::from(AcceptError::ShuttingDown).label(),
            "shutting_down"
        );
    }

    #[tokio::test]
    async fn events_claimed_once() {
        let manager = manager(MergeStrategy::Multiplexer);
        let _events = manager.events().unwrap();
        assert!(matches!(manager.events(), Err(MergeError::ConsumerClaimed)));
    }

    #[tokio::test]
    async fn broadcast_reaches_open_connections_only() {
        let manager = manager(MergeStrategy::Queue);
        let (_a, mut peer_a) = connect(&manager).await;
        let (b, _peer_b) = connect(&manager).await;
        let (_c, mut peer_c) = connect(&manager).await;
        b.close(CLOSE_NORMAL, "").await.unwrap();

        let report = manager.broadcast(&Message::from("news"));
        assert_eq!(report.delivered_count(), 2);
        assert_eq!(report.skipped, vec![b.id().clone()]);
        for peer in [&mut peer_a, &mut peer_c] {
            let got = tokio::time::timeout(TIMEOUT, peer.recv()).await.unwrap();
            assert_eq!(got, Some(SinkRecord::Message(Message::from("news"))));
        }
    }

    #[tokio::test]
    async fn connection_added_mid_drain_is_delivered_later() {
        for strategy in strategies() {
            let manager = manager(strategy);
            let mut events = manager.events().unwrap();
            let (_a, peer_a) = connect(&manager).await;
            assert!(peer_a.send("a1"));
            assert!(peer_a.send("a2"));
            assert_eq!(next(&mut events).await.event, ConnectionEvent::from("a1"));

            let (late, peer_late) = connect(&manager).await;
            assert!(peer_late.send("first"));

            let mut rest = Vec::new();
            for _ in 0..2 {
                let merged = next(&mut events).await;
                rest.push((merged.connection.id().clone(), merged.event));
            }
            let late_events: Vec<_> = rest.iter().filter(|(id, _)| id == late.id()).collect();
            assert_eq!(late_events.len(), 1, "{strategy:?}");
            assert_eq!(late_events[0].1, ConnectionEvent::from("first"));
        }
    }
}
