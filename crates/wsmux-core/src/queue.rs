//! Unbounded FIFO buffer drained in whole snapshots by a single consumer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::MergeError;
use crate::signal::Signal;

struct Entry<T> {
    item: T,
    taken: Option<oneshot::Sender<()>>,
}

impl<T> Entry<T> {
    /// Hand the item over, telling its producer it was consumed.
    fn take(self) -> T {
        if let Some(taken) = self.taken {
            let _ = taken.send(());
        }
        self.item
    }
}

struct State<T> {
    items: Vec<Entry<T>>,
    signal: Signal,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    stopped: AtomicBool,
    claimed: AtomicBool,
    stop_token: CancellationToken,
}

impl<T> Shared<T> {
    fn current_signal(&self) -> Signal {
        self.state.lock().signal.clone()
    }

    /// Take everything buffered and arm a new signal in one step, so a producer
    /// either lands in this snapshot or resolves the next cycle's signal.
    fn take_snapshot(&self) -> Vec<Entry<T>> {
        let mut state = self.state.lock();
        let items = std::mem::take(&mut state.items);
        let _ = Signal::rearm(&mut state.signal);
        items
    }
}

/// Multi-producer, single-consumer event queue.
///
/// Producers [`add`](Self::add) from any task; the consumer obtained from
/// [`iterate`](Self::iterate) sleeps on the current [`Signal`] and drains the
/// whole buffer each time it wakes. Items added while a snapshot is being
/// yielded belong to the next cycle.
///
/// Stop policy: [`stop`](Self::stop) discards anything still buffered,
/// including the rest of a snapshot the consumer has not yet pulled.
pub struct EventQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> EventQueue<T> {
    /// Create an empty, running queue.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: Vec::new(),
                    signal: Signal::new(),
                }),
                stopped: AtomicBool::new(false),
                claimed: AtomicBool::new(false),
                stop_token: CancellationToken::new(),
            }),
        }
    }

    /// Append an item and wake the consumer. Dropped once the queue is stopped.
    pub fn add(&self, item: T) {
        self.push(Entry { item, taken: None });
    }

    /// Like [`add`](Self::add), returning a [`Delivery`] that resolves once
    /// the consumer has yielded the item.
    ///
    /// Producers that await the delivery before adding again keep at most one
    /// item of theirs in the queue.
    pub fn add_tracked(&self, item: T) -> Delivery {
        let (tx, rx) = oneshot::channel();
        self.push(Entry {
            item,
            taken: Some(tx),
        });
        Delivery(rx)
    }

    fn push(&self, entry: Entry<T>) {
        let signal = {
            let mut state = self.shared.state.lock();
            if self.is_stopped() {
                return;
            }
            state.items.push(entry);
            state.signal.clone()
        };
        signal.resolve();
    }

    /// Stop the queue. The consumer ends at its next cycle boundary.
    pub fn stop(&self) {
        let (signal, discarded) = {
            let mut state = self.shared.state.lock();
            if self.shared.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            (state.signal.clone(), std::mem::take(&mut state.items))
        };
        drop(discarded);
        self.shared.stop_token.cancel();
        signal.resolve();
    }

    /// Token cancelled when the queue stops.
    pub fn stop_token(&self) -> CancellationToken {
        self.shared.stop_token.clone()
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Number of items buffered and not yet snapshotted.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Claim the consumer side. Only the first call succeeds.
    pub fn iterate(&self) -> Result<QueueIter<T>, MergeError> {
        if self.is_stopped() {
            return Err(MergeError::Stopped);
        }
        if self.shared.claimed.swap(true, Ordering::SeqCst) {
            return Err(MergeError::ConsumerClaimed);
        }
        Ok(QueueIter {
            shared: Arc::clone(&self.shared),
            snapshot: VecDeque::new(),
            cycles: 0,
        })
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves when a tracked item has been yielded to the consumer.
///
/// Returned by [`EventQueue::add_tracked`].
#[derive(Debug)]
pub struct Delivery(oneshot::Receiver<()>);

impl Delivery {
    /// `true` once the item is consumed, `false` if the queue stopped and
    /// discarded it.
    pub async fn consumed(self) -> bool {
        self.0.await.is_ok()
    }
}

/// Consumer side of an [`EventQueue`].
pub struct QueueIter<T> {
    shared: Arc<Shared<T>>,
    snapshot: VecDeque<Entry<T>>,
    cycles: u64,
}

impl<T> QueueIter<T> {
    /// Next item, or `None` once the queue is stopped.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            if self.shared.stopped.load(Ordering::SeqCst) {
                self.snapshot.clear();
                return None;
            }
            if let Some(entry) = self.snapshot.pop_front() {
                return Some(entry.take());
            }

            self.shared.current_signal().wait().await;

            let items = self.shared.take_snapshot();
            self.cycles += 1;
            trace!(cycle = self.cycles, items = items.len(), "queue drain");
            self.snapshot.extend(items);
        }
    }

    /// Number of completed wake cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Items from the current snapshot not yet yielded.
    pub fn remaining_in_cycle(&self) -> usize {
        self.snapshot.len()
    }
}

impl<T: Send + 'static> QueueIter<T> {
    /// Adapt into a `Stream`.
    pub fn into_stream(self) -> BoxStream<'static, T> {
        futures::stream::unfold(self, |mut iter| async move {
            iter.next().await.map(|item| (item, iter))
        })
        .boxed()
    }
}
