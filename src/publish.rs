//! Outbound batching.
//!
//! Local mutations are not sent one by one. They are appended to an outbox
//! and published as one batch once the coalescing window elapses:
//!
//! ```text
//! mutation ──► outbox empty & idle? ──► spawn timer (window)
//!    │                                        │
//!    └──► fold into pending batch ◄───────────┘
//!                                             ▼
//!                        timer fires: drain atomically, publish, go idle
//! ```
//!
//! A window of zero publishes synchronously. An explicit sync cancels the
//! pending timer and publishes right away, taking the pending operations
//! with it so nothing is published twice.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::delta::Batch;
use crate::events::Subscribers;

struct Outbox<B> {
    pending: B,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever a timer is cancelled, so a timer that already woke up
    /// can tell it has been superseded.
    epoch: u64,
    subscribers: Subscribers<B>,
}

impl<B: Batch + Clone> Outbox<B> {
    fn drain(&mut self) {
        let batch = core::mem::take(&mut self.pending);
        if batch.is_empty() {
            return;
        }
        debug!(operations = batch.len(), "publishing batch");
        self.subscribers.emit(batch);
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
            self.epoch += 1;
        }
    }
}

/// Outbox shared between a replica and its publish timer.
pub(crate) struct Publisher<B> {
    interval: Duration,
    outbox: Arc<Mutex<Outbox<B>>>,
}

fn lock<B>(outbox: &Mutex<Outbox<B>>) -> MutexGuard<'_, Outbox<B>> {
    outbox.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: Batch + Clone + Send + 'static> Publisher<B> {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            outbox: Arc::new(Mutex::new(Outbox {
                pending: B::default(),
                timer: None,
                epoch: 0,
                subscribers: Subscribers::default(),
            })),
        }
    }

    pub(crate) fn subscribe(&self) -> UnboundedReceiver<B> {
        lock(&self.outbox).subscribers.subscribe()
    }

    /// Operations waiting for the timer.
    pub(crate) fn pending_len(&self) -> usize {
        lock(&self.outbox).pending.len()
    }

    /// Add a locally produced batch and schedule its publication.
    pub(crate) fn enqueue(&self, batch: B) {
        let mut outbox = lock(&self.outbox);
        outbox.pending.append(batch);
        if outbox.timer.is_some() {
            return;
        }
        if self.interval.is_zero() {
            outbox.drain();
            return;
        }
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no tokio runtime for buffered publishing, publishing immediately");
                outbox.drain();
                return;
            }
        };
        let shared = Arc::clone(&self.outbox);
        let interval = self.interval;
        let epoch = outbox.epoch;
        outbox.timer = Some(handle.spawn(async move {
            tokio::time::sleep(interval).await;
            let mut outbox = lock(&shared);
            if outbox.epoch != epoch {
                return;
            }
            outbox.timer = None;
            outbox.drain();
        }));
    }

    /// Publish `batch` together with anything pending, bypassing the window.
    pub(crate) fn publish_now(&self, batch: B) {
        let mut outbox = lock(&self.outbox);
        outbox.cancel_timer();
        let mut pending = core::mem::take(&mut outbox.pending);
        pending.append(batch);
        outbox.pending = pending;
        outbox.drain();
    }
}
