//! Common seam over the two merge primitives.

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::MergeError;
use crate::mux::StreamMultiplexer;
use crate::queue::EventQueue;

/// Which merge primitive backs a merged stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// [`EventQueue`] fed by one pump task per source. Each pump waits for
    /// its previous item to be consumed before pulling the next.
    #[default]
    Queue,
    /// [`StreamMultiplexer`] pulling each source one value at a time.
    Multiplexer,
}

impl MergeStrategy {
    /// Parse a strategy name (`queue` / `multiplexer`, case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Some(Self::Queue),
            "multiplexer" | "mux" => Some(Self::Multiplexer),
            _ => None,
        }
    }

    /// Build an empty merge primitive for this strategy.
    pub fn build<T: Send + 'static>(self) -> Box<dyn Merge<T>> {
        match self {
            Self::Queue => Box::new(EventQueue::new()),
            Self::Multiplexer => Box::new(StreamMultiplexer::new()),
        }
    }

    /// Canonical name, as accepted by [`parse`](Self::parse).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Multiplexer => "multiplexer",
        }
    }
}

/// Fans any number of sources into one single-consumer stream.
pub trait Merge<T>: Send + Sync {
    /// Feed `source` into the merged stream until it ends or the merge stops.
    fn attach(&self, source: BoxStream<'static, T>);

    /// Stop merging; the consumer's stream ends and buffered items are discarded.
    fn stop(&self);

    /// Whether the merge has been stopped.
    fn is_stopped(&self) -> bool;

    /// Items buffered and not yet taken by the consumer.
    fn pending(&self) -> usize;

    /// Claim the merged stream. Only the first call succeeds.
    fn merged(&self) -> Result<BoxStream<'static, T>, MergeError>;
}

impl<T: Send + 'static> Merge<T> for EventQueue<T> {
    /// Spawns a pump task that lives as long as `source` does. The pump has
    /// at most one item of `source` in the queue at a time.
    fn attach(&self, mut source: BoxStream<'static, T>) {
        if self.is_stopped() {
            return;
        }
        let queue = self.clone();
        let stop = self.stop_token();
        let _ = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    () = stop.cancelled() => break,
                    item = source.next() => item,
                };
                let Some(item) = item else { break };
                let delivery = queue.add_tracked(item);
                let consumed = tokio::select! {
                    () = stop.cancelled() => false,
                    consumed = delivery.consumed() => consumed,
                };
                if !consumed {
                    break;
                }
            }
            trace!("queue pump finished");
        });
    }

    fn stop(&self) {
        EventQueue::stop(self);
    }

    fn is_stopped(&self) -> bool {
        EventQueue::is_stopped(self)
    }

    fn pending(&self) -> usize {
        EventQueue::pending(self)
    }

    fn merged(&self) -> Result<BoxStream<'static, T>, MergeError> {
        Ok(self.iterate()?.into_stream())
    }
}

impl<T: Send + 'static> Merge<T> for StreamMultiplexer<T> {
    fn attach(&self, source: BoxStream<'static, T>) {
        self.add(source);
    }

    fn stop(&self) {
        StreamMultiplexer::stop(self);
    }

    fn is_stopped(&self) -> bool {
        StreamMultiplexer::is_stopped(self)
    }

    fn pending(&self) -> usize {
        StreamMultiplexer::pending(self)
    }

    fn merged(&self) -> Result<BoxStream<'static, T>, MergeError> {
        Ok(self.iterate()?.into_stream())
    }
}
