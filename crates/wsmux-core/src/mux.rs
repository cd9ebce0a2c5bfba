//! Fan-in of a growing set of streams, pulling each one value at a time.
//!
//! Every registered source has at most one pull in flight. The pull runs as its
//! own task; when it produces a value the value is buffered together with its
//! source and the current [`Signal`] is resolved. The source is only pulled
//! again once the consumer has taken that value and asks for the next one, so a
//! chatty source can never run ahead of the consumer by more than one item.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::MergeError;
use crate::signal::Signal;

/// Decrements the live-source count when the source is dropped.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Source<T> {
    stream: BoxStream<'static, T>,
    _live: LiveGuard,
}

struct Tagged<T> {
    source: Source<T>,
    value: T,
}

struct State<T> {
    yields: Vec<Tagged<T>>,
    signal: Signal,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    stopped: AtomicBool,
    claimed: AtomicBool,
    live: Arc<AtomicUsize>,
    stop_token: CancellationToken,
}

impl<T: Send + 'static> Shared<T> {
    fn current_signal(&self) -> Signal {
        self.state.lock().signal.clone()
    }

    fn take_snapshot(&self) -> Vec<Tagged<T>> {
        let mut state = self.state.lock();
        let yields = std::mem::take(&mut state.yields);
        let _ = Signal::rearm(&mut state.signal);
        yields
    }

    fn push(&self, tagged: Tagged<T>) {
        let signal = {
            let mut state = self.state.lock();
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            state.yields.push(tagged);
            state.signal.clone()
        };
        signal.resolve();
    }

    fn wake(&self) {
        self.current_signal().resolve();
    }

    /// Spawn the single in-flight pull for `source`.
    fn request_next(self: &Arc<Self>, mut source: Source<T>) {
        let shared = Arc::clone(self);
        let _ = tokio::spawn(async move {
            let item = tokio::select! {
                () = shared.stop_token.cancelled() => return,
                item = source.stream.next() => item,
            };
            match item {
                Some(value) => shared.push(Tagged { source, value }),
                None => {
                    drop(source);
                    trace!("multiplexed source ended");
                    shared.wake();
                }
            }
        });
    }
}

/// Multiplexes any number of streams into one single-consumer stream.
///
/// Sources may be added at any time, including while the consumer is in the
/// middle of a drain cycle; their first value then shows up in a later cycle.
/// A source that ends is simply forgotten. Fallible sources registered through
/// [`add_fallible`](Self::add_fallible) end at their first error.
///
/// Stop policy matches [`EventQueue`](crate::queue::EventQueue): buffered
/// values are discarded and in-flight pulls are cancelled.
///
/// Must be used from within a Tokio runtime.
pub struct StreamMultiplexer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for StreamMultiplexer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> StreamMultiplexer<T> {
    /// Create an empty, running multiplexer.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    yields: Vec::new(),
                    signal: Signal::new(),
                }),
                stopped: AtomicBool::new(false),
                claimed: AtomicBool::new(false),
                live: Arc::new(AtomicUsize::new(0)),
                stop_token: CancellationToken::new(),
            }),
        }
    }

    /// Register a source and immediately request its first value.
    pub fn add<S>(&self, stream: S)
    where
        S: Stream<Item = T> + Send + 'static,
    {
        if self.is_stopped() {
            debug!("source added after stop, dropping");
            return;
        }
        let _ = self.shared.live.fetch_add(1, Ordering::SeqCst);
        let source = Source {
            stream: stream.boxed(),
            _live: LiveGuard(Arc::clone(&self.shared.live)),
        };
        self.shared.request_next(source);
    }

    /// Register a source of `Result`s. The first `Err` ends that source only.
    pub fn add_fallible<S, E>(&self, stream: S)
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.add(end_on_error(stream));
    }

    /// Stop the multiplexer. The consumer ends at its next cycle boundary.
    pub fn stop(&self) {
        let (signal, discarded) = {
            let mut state = self.shared.state.lock();
            if self.shared.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            (state.signal.clone(), std::mem::take(&mut state.yields))
        };
        drop(discarded);
        self.shared.stop_token.cancel();
        signal.resolve();
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Sources that have not yet ended.
    pub fn active_sources(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Values buffered and not yet snapshotted.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().yields.len()
    }

    /// Claim the consumer side. Only the first call succeeds.
    pub fn iterate(&self) -> Result<MuxIter<T>, MergeError> {
        if self.is_stopped() {
            return Err(MergeError::Stopped);
        }
        if self.shared.claimed.swap(true, Ordering::SeqCst) {
            return Err(MergeError::ConsumerClaimed);
        }
        Ok(MuxIter {
            shared: Arc::clone(&self.shared),
            snapshot: VecDeque::new(),
            last: None,
            cycles: 0,
        })
    }
}

impl<T: Send + 'static> Default for StreamMultiplexer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of a [`StreamMultiplexer`].
pub struct MuxIter<T> {
    shared: Arc<Shared<T>>,
    snapshot: VecDeque<Tagged<T>>,
    /// Source of the value handed out last; pulled again on the next call.
    last: Option<Source<T>>,
    cycles: u64,
}

impl<T: Send + 'static> MuxIter<T> {
    /// Next value from any source, or `None` once the multiplexer is stopped.
    pub async fn next(&mut self) -> Option<T> {
        if let Some(source) = self.last.take() {
            if !self.shared.stopped.load(Ordering::SeqCst) {
                self.shared.request_next(source);
            }
        }

        loop {
            if self.shared.stopped.load(Ordering::SeqCst) {
                self.snapshot.clear();
                return None;
            }
            if let Some(Tagged { source, value }) = self.snapshot.pop_front() {
                self.last = Some(source);
                return Some(value);
            }

            self.shared.current_signal().wait().await;

            let yields = self.shared.take_snapshot();
            self.cycles += 1;
            trace!(cycle = self.cycles, items = yields.len(), "mux drain");
            self.snapshot.extend(yields);
        }
    }

    /// Number of completed wake cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Adapt into a `Stream`.
    pub fn into_stream(self) -> BoxStream<'static, T> {
        futures::stream::unfold(self, |mut iter| async move {
            iter.next().await.map(|item| (item, iter))
        })
        .boxed()
    }
}

/// Turn a stream of `Result`s into a stream that ends at the first error.
pub fn end_on_error<S, T, E>(stream: S) -> impl Stream<Item = T> + Send + 'static
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
{
    stream.scan((), |_, item| {
        futures::future::ready(match item {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(error = %e, "source failed, ending it");
                None
            }
        })
    })
}
