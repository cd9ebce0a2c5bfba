//! # wsmux-core
//!
//! Merge primitives that fan many independent event sources into one
//! consumable stream, plus the connection event types flowing through them.
//!
//! - [`Signal`]: single-shot, re-armable wakeup
//! - [`EventQueue`]: producers append, one consumer drains whole snapshots
//! - [`StreamMultiplexer`]: fan-in of streams with one in-flight pull each
//! - [`Merge`]: common seam over both, selected by [`MergeStrategy`]

#![deny(unsafe_code)]

pub mod error;
pub mod event;
pub mod ids;
pub mod merge;
pub mod mux;
pub mod queue;
pub mod signal;

pub use error::MergeError;
pub use event::ConnectionEvent;
pub use ids::ConnectionId;
pub use merge::{Merge, MergeStrategy};
pub use mux::{MuxIter, StreamMultiplexer};
pub use queue::{Delivery, EventQueue, QueueIter};
pub use signal::Signal;
