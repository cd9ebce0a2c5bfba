//! # wsmux-server
//!
//! Connection lifecycle on top of the `wsmux-core` merge primitives:
//!
//! - [`Connection`]: handle with a bounded outbound queue and writer task
//! - [`ConnectionRegistry`]: live set of open connections, broadcast
//! - [`ConnectionManager`]: admission, merging of per-connection events, shutdown
//! - [`transport`]: the sink seam, the axum WebSocket front end, an in-memory pair
//! - [`serve`] / [`listen_and_serve`]: bind a listener and expose the merged stream

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use config::{ServerConfig, load_config};
pub use connection::{Connection, ConnectionOptions, ConnectionState, Message};
pub use error::{AcceptError, CloseError, ConfigError, SendError, ServerError, TransportError};
pub use manager::{ConnectionManager, EventStream, MergedEvent, RejectReason, ShutdownReport};
pub use registry::{BroadcastReport, ConnectionRegistry, Reservation};
pub use server::{WsServer, listen_and_serve, serve};
pub use shutdown::ShutdownCoordinator;
pub use transport::{ConnectionSink, RawConnection};
