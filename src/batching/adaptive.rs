//! Adaptive batcher.
//!
//! Turns a stream of single-item `add` calls into batches without a fixed
//! delay. The first item to arrive while no handler is running starts a
//! handler immediately with a batch of one. Items that arrive while handlers
//! are busy accumulate in a buffer, and the whole buffer becomes the next
//! batch as soon as a handler slot frees up. Under light load batches stay
//! small and latency stays low; under heavy load batches grow to amortize the
//! handler's fixed cost.
//!
//! ```text
//!   add ──► [ buffer ≤ max_buffered ] ──swap──► handler(batch)
//!              ▲                                   │
//!              └──────── slot freed ◄──────────────┘
//! ```
//!
//! With the default single handler slot, invocations never overlap and
//! batches are delivered in arrival order.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::config::BatcherConfig;
use crate::context::CallContext;
use crate::error::{Error, Result};

/// Processes one batch.
#[async_trait]
pub trait BatchHandler<T>: Send + Sync + 'static {
    async fn handle(&self, batch: Vec<T>);
}

#[async_trait]
impl<T, F, Fut> BatchHandler<T> for F
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, batch: Vec<T>) {
        (self)(batch).await
    }
}

/// Counters describing batcher activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub batches: u64,
    pub items: u64,
    pub largest_batch: u64,
}

struct State<T> {
    buf: Vec<T>,
    running: usize,
    closed: bool,
}

struct Inner<T> {
    max_buffered: usize,
    max_running: usize,
    state: Mutex<State<T>>,
    /// Signalled when the buffer is swapped out or the batcher closes.
    space: Notify,
    /// Signalled when the last running handler finds nothing left to do.
    idle: Notify,
    handler: Arc<dyn BatchHandler<T>>,
    batches: AtomicU64,
    items: AtomicU64,
    largest_batch: AtomicU64,
}

/// Adaptive batcher over items of type `T`.
pub struct AdaptiveBatcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for AdaptiveBatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for AdaptiveBatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AdaptiveBatcher")
            .field("max_buffered", &self.inner.max_buffered)
            .field("max_running", &self.inner.max_running)
            .field("buffered", &state.buf.len())
            .field("running", &state.running)
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T: Send + 'static> AdaptiveBatcher<T> {
    pub fn new(config: BatcherConfig, handler: impl BatchHandler<T>) -> Self {
        Self::with_handler(config, Arc::new(handler))
    }

    pub fn with_handler(config: BatcherConfig, handler: Arc<dyn BatchHandler<T>>) -> Self {
        let max_buffered = config.max_buffered.max(1);
        Self {
            inner: Arc::new(Inner {
                max_buffered,
                max_running: config.max_concurrent_handlers.max(1),
                state: Mutex::new(State {
                    buf: Vec::with_capacity(max_buffered),
                    running: 0,
                    closed: false,
                }),
                space: Notify::new(),
                idle: Notify::new(),
                handler,
                batches: AtomicU64::new(0),
                items: AtomicU64::new(0),
                largest_batch: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue `item`.
    ///
    /// Waits only while the buffer is full and every handler slot is busy.
    /// Returns [`Error::DeadlineExceeded`] if `ctx` finishes first, in which
    /// case the item was not enqueued.
    pub async fn add(&self, ctx: &CallContext, item: T) -> Result<()> {
        let mut item = item;
        loop {
            let space = self.inner.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.try_add(item) {
                Ok(()) => return Ok(()),
                Err(returned) => item = returned,
            }
            if self.inner.state.lock().closed {
                return Err(Error::Closed);
            }

            tokio::select! {
                _ = &mut space => {}
                _ = ctx.done() => return Err(Error::DeadlineExceeded),
            }
        }
    }

    /// Enqueue `item` without waiting; hands it back if the buffer is full
    /// or the batcher is closed.
    pub fn try_add(&self, item: T) -> std::result::Result<(), T> {
        let batch = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(item);
            }
            let slot_free = state.running < self.inner.max_running;
            if state.buf.len() >= self.inner.max_buffered && !slot_free {
                return Err(item);
            }
            state.buf.push(item);
            if !slot_free {
                return Ok(());
            }
            state.running += 1;
            self.inner.take_batch(&mut state)
        };
        self.inner.space.notify_waiters();
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run_handler(batch).await });
        Ok(())
    }

    /// Stop accepting items, then wait for buffered items to be handled.
    pub async fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.space.notify_waiters();
        self.wait_idle().await;
    }

    /// Wait until nothing is buffered and no handler is running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            {
                let state = self.inner.state.lock();
                if state.running == 0 && state.buf.is_empty() {
                    return;
                }
            }
            idle.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of handler invocations currently in flight.
    pub fn running(&self) -> usize {
        self.inner.state.lock().running
    }

    pub fn buffered(&self) -> usize {
        self.inner.state.lock().buf.len()
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            batches: self.inner.batches.load(Ordering::Relaxed),
            items: self.inner.items.load(Ordering::Relaxed),
            largest_batch: self.inner.largest_batch.load(Ordering::Relaxed),
        }
    }
}

impl<T: Send + 'static> Inner<T> {
    fn take_batch(&self, state: &mut State<T>) -> Vec<T> {
        std::mem::replace(&mut state.buf, Vec::with_capacity(self.max_buffered))
    }

    /// Owns one handler slot until the buffer is found empty.
    async fn run_handler(self: Arc<Self>, mut batch: Vec<T>) {
        loop {
            let len = batch.len() as u64;
            self.batches.fetch_add(1, Ordering::Relaxed);
            self.items.fetch_add(len, Ordering::Relaxed);
            self.largest_batch.fetch_max(len, Ordering::Relaxed);
            debug!(batch_len = len, "dispatching batch");

            let outcome = AssertUnwindSafe(self.handler.handle(batch)).catch_unwind().await;
            if outcome.is_err() {
                error!(batch_len = len, "batch handler panicked");
            }

            let next = {
                let mut state = self.state.lock();
                if state.buf.is_empty() {
                    state.running -= 1;
                    None
                } else {
                    Some(self.take_batch(&mut state))
                }
            };
            match next {
                Some(b) => {
                    self.space.notify_waiters();
                    batch = b;
                }
                None => {
                    self.idle.notify_waiters();
                    return;
                }
            }
        }
    }
}
