//! Ordered buffer of inbound callbacks.
//!
//! Single producer (the dispatch loop), consumed either by the immediate
//! dispatcher or by evoke calls. FIFO, unbounded, never reorders.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::SessionError;
use crate::wire::OrderingClass;

/// A callback as received from the RTI. Never mutated after enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEnvelope {
    /// Server-assigned, strictly increasing per connection.
    pub sequence: u64,
    pub ordering: OrderingClass,
    pub payload: Bytes,
}

impl CallbackEnvelope {
    pub fn new(sequence: u64, ordering: OrderingClass, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            ordering,
            payload: payload.into(),
        }
    }
}

#[derive(Default)]
struct QueueInner {
    items: VecDeque<CallbackEnvelope>,
    /// Terminal marker for the current connection.
    closed: Option<SessionError>,
    /// Incremented on every close so waiters notice a close even after a reopen.
    closures: u64,
    paused: bool,
    /// No consumer yet; nothing is deliverable.
    held: bool,
}

/// Result of waiting for the queue to become deliverable.
#[derive(Debug, PartialEq)]
pub enum WaitOutcome {
    /// At least one callback is queued and delivery is not paused.
    Ready,
    /// The queue was closed while (or before) waiting and nothing deliverable remains.
    Closed(SessionError),
    TimedOut,
}

pub struct CallbackQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Callback queue mutex poisoned - continuing with inner state");
                poisoned.into_inner()
            }
        }
    }

    /// Always succeeds. Callbacks enqueued after a close are still kept in order.
    pub fn enqueue(&self, envelope: CallbackEnvelope) {
        let depth = {
            let mut inner = self.lock();
            inner.items.push_back(envelope);
            inner.items.len()
        };
        tracing::trace!(depth, "Callback enqueued");
        self.notify.notify_waiters();
    }

    /// Oldest callback, or None when empty or paused.
    pub fn try_dequeue(&self) -> Option<CallbackEnvelope> {
        let mut inner = self.lock();
        if inner.paused || inner.held {
            return None;
        }
        inner.items.pop_front()
    }

    /// Push the terminal marker: waiters wake up and observe `error` once the
    /// queue has drained.
    pub fn close(&self, error: SessionError) {
        {
            let mut inner = self.lock();
            inner.closures += 1;
            inner.closed = Some(error);
        }
        self.notify.notify_waiters();
    }

    /// Clear the terminal marker for a new connection. Leftover callbacks stay queued.
    pub fn reopen(&self) {
        self.lock().closed = None;
    }

    pub fn set_paused(&self, paused: bool) {
        self.lock().paused = paused;
        self.notify.notify_waiters();
    }

    /// Keep everything queued until a consumer exists. Independent of
    /// [`set_paused`](Self::set_paused).
    pub fn set_held(&self, held: bool) {
        self.lock().held = held;
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub(crate) fn closures(&self) -> u64 {
        self.lock().closures
    }

    /// Wait until a callback can be delivered, the queue is closed, or `deadline`
    /// passes (`None` waits without limit).
    ///
    /// `since` is the close count observed when the caller started; a close that
    /// happened after that point is reported even if the queue was reopened since.
    pub async fn wait(&self, deadline: Option<Instant>, since: u64) -> WaitOutcome {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.lock();
                let deliverable = !inner.paused && !inner.held && !inner.items.is_empty();
                if deliverable {
                    return WaitOutcome::Ready;
                }
                if let Some(error) = &inner.closed {
                    return WaitOutcome::Closed(error.clone());
                }
                if inner.closures != since {
                    return WaitOutcome::Closed(SessionError::connection_lost(
                        "connection closed while waiting for callbacks",
                    ));
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return WaitOutcome::TimedOut;
                    }
                }
                None => notified.await,
            }
        }
    }
}
