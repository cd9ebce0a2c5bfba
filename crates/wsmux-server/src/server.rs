//! Application entry points: [`serve`] and [`listen_and_serve`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::connection::{Connection, Message};
use crate::error::{Result, bind_error};
use crate::manager::{ConnectionManager, EventStream, MergedEvent};
use crate::registry::BroadcastReport;
use crate::shutdown::ShutdownCoordinator;
use crate::transport;

struct Inner {
    manager: Arc<ConnectionManager>,
    local_addr: SocketAddr,
    shutdown: ShutdownCoordinator,
    shutdown_timeout: Duration,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

/// Handle to a running server: the source of merged events.
///
/// Cheap to clone. Dropping every handle does not stop the listener; call
/// [`close`](Self::close).
#[derive(Clone)]
pub struct WsServer {
    inner: Arc<Inner>,
}

/// Bind `config.host:config.port` and start accepting connections.
///
/// Returns once the listener is bound. A bind failure is the only error.
pub async fn serve(config: ServerConfig) -> Result<WsServer> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| bind_error(&addr, e))?;
    let local_addr = listener.local_addr()?;

    let manager = Arc::new(ConnectionManager::new(&config));
    let app = transport::ws::router(Arc::clone(&manager), config.max_message_size);
    let shutdown = ShutdownCoordinator::new();
    let token = shutdown.token();

    let listener_task = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
        if let Err(error) = result {
            error!(%error, "listener failed");
        }
    });

    info!(
        %local_addr,
        strategy = manager.strategy().as_str(),
        max_connections = config.max_connections,
        "listening"
    );

    Ok(WsServer {
        inner: Arc::new(Inner {
            manager,
            local_addr,
            shutdown,
            shutdown_timeout: config.shutdown_timeout(),
            listener_task: Mutex::new(Some(listener_task)),
            closing: AtomicBool::new(false),
        }),
    })
}

/// Serve and drive the merged stream, calling `handler` for every event.
///
/// Returns after the stream ends, which happens once any handle calls
/// [`WsServer::close`].
pub async fn listen_and_serve<F, Fut>(config: ServerConfig, mut handler: F) -> Result<()>
where
    F: FnMut(WsServer, MergedEvent) -> Fut,
    Fut: Future<Output = ()>,
{
    let server = serve(config).await?;
    let mut events = server.events()?;
    while let Some(event) = events.next().await {
        handler(server.clone(), event).await;
    }
    server.close().await;
    Ok(())
}

impl WsServer {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Claim the merged event stream. Only the first call succeeds; it fails
    /// with [`MergeError::Stopped`](wsmux_core::MergeError::Stopped) after close.
    pub fn events(&self) -> Result<EventStream> {
        Ok(self.inner.manager.events()?)
    }

    /// Snapshot of the open connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.manager.connections()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.inner.manager.connection_count()
    }

    /// Send `message` to every open connection.
    pub fn broadcast(&self, message: impl Into<Message>) -> BroadcastReport {
        self.inner.manager.broadcast(&message.into())
    }

    /// The connection manager behind this server.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.inner.manager
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Stop accepting, end the event stream, close every connection and
    /// release the listener. Later calls wait for the first to finish.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            self.inner.shutdown.wait_done().await;
            return;
        }
        info!(local_addr = %self.inner.local_addr, "server closing");

        let _ = self.inner.manager.shutdown().await;

        let handles: Vec<_> = self.inner.listener_task.lock().take().into_iter().collect();
        let _ = self
            .inner
            .shutdown
            .graceful_shutdown(handles, Some(self.inner.shutdown_timeout))
            .await;
        info!(local_addr = %self.inner.local_addr, "server closed");
    }
}

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("local_addr", &self.inner.local_addr)
            .field("connections", &self.connection_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
