//! Callback delivery.
//!
//! # Architecture
//!
//! - **queue**: FIFO buffer filled by the dispatch loop
//! - **CallbackDelivery**: single-flight consumer used by both delivery modes.
//!   Dequeue and handler invocation happen under one lock, so concurrent
//!   evokers and the immediate dispatcher can never reorder callbacks.
//!
//! In `Immediate` mode a dispatcher task drains the queue as callbacks arrive.
//! In `Evoked` mode nothing is delivered until the federate calls
//! [`Session::evoke`](crate::Session::evoke), and the handler runs inline on the
//! evoking task.

pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use queue::{CallbackEnvelope, CallbackQueue, WaitOutcome};

use crate::correlator::deadline_after;
use crate::error::{CallbackError, SessionError};
use crate::transport::FrameWriter;
use crate::wire::{CallbackAck, Frame};

/// How callbacks reach the handler. Fixed once the session first connects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Delivered by an engine task as soon as they arrive.
    #[default]
    Immediate,
    /// Delivered only inside `evoke`.
    Evoked,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Evoked => "evoked",
        }
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Federate-side receiver for RTI callbacks.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn on_callback(&self, callback: CallbackEnvelope) -> Result<(), CallbackError>;
}

#[async_trait]
impl<F> CallbackHandler for F
where
    F: Fn(CallbackEnvelope) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    async fn on_callback(&self, callback: CallbackEnvelope) -> Result<(), CallbackError> {
        self(callback)
    }
}

tokio::task_local! {
    static IN_CALLBACK: bool;
}

/// True while the current task is running a callback handler.
pub fn in_callback() -> bool {
    IN_CALLBACK.try_with(|flag| *flag).unwrap_or(false)
}

/// How much an `evoke` may deliver and how long it may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvokeBudget {
    pub max_callbacks: usize,
    /// Wait for callbacks while less than this has elapsed. `None` waits
    /// without limit.
    pub min_wait: Option<Duration>,
    /// Stop delivering once this has elapsed.
    pub max_time: Option<Duration>,
}

impl EvokeBudget {
    /// At most one callback, waiting up to `wait` for it to arrive.
    pub fn single(wait: Duration) -> Self {
        Self {
            max_callbacks: 1,
            min_wait: Some(wait),
            max_time: None,
        }
    }

    /// Up to `n` callbacks that are already queued. Does not wait.
    pub fn count(n: usize) -> Self {
        Self {
            max_callbacks: n,
            min_wait: Some(Duration::ZERO),
            max_time: None,
        }
    }

    /// Keep delivering; wait for more while less than `min` has elapsed and
    /// stop at `max`.
    pub fn multiple(min: Duration, max: Duration) -> Self {
        Self {
            max_callbacks: usize::MAX,
            min_wait: Some(min),
            max_time: Some(max.max(min)),
        }
    }

    /// One callback, waiting as long as it takes.
    pub fn forever() -> Self {
        Self {
            max_callbacks: 1,
            min_wait: None,
            max_time: None,
        }
    }

    pub fn with_max_callbacks(mut self, max_callbacks: usize) -> Self {
        self.max_callbacks = max_callbacks;
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.min_wait.is_none() && self.max_time.is_none()
    }
}

/// Single-flight callback consumer shared by the session, the immediate
/// dispatcher and evoke calls.
pub struct CallbackDelivery {
    queue: Arc<CallbackQueue>,
    handler: tokio::sync::RwLock<Option<Arc<dyn CallbackHandler>>>,
    /// Held across dequeue and handler invocation.
    in_flight: tokio::sync::Mutex<()>,
    ack_writer: tokio::sync::RwLock<Option<FrameWriter>>,
    acknowledge: bool,
}

impl CallbackDelivery {
    /// Callbacks stay queued until [`set_handler`](Self::set_handler) is called.
    pub fn new(queue: Arc<CallbackQueue>, acknowledge: bool) -> Self {
        queue.set_held(true);
        Self {
            queue,
            handler: tokio::sync::RwLock::new(None),
            in_flight: tokio::sync::Mutex::new(()),
            ack_writer: tokio::sync::RwLock::new(None),
            acknowledge,
        }
    }

    pub fn queue(&self) -> &Arc<CallbackQueue> {
        &self.queue
    }

    pub async fn set_handler(&self, handler: Arc<dyn CallbackHandler>) {
        *self.handler.write().await = Some(handler);
        self.queue.set_held(false);
    }

    /// Where acknowledgements go; `None` while disconnected.
    pub async fn set_ack_writer(&self, writer: Option<FrameWriter>) {
        *self.ack_writer.write().await = writer;
    }

    /// Deliver the oldest deliverable callback. False if there was none.
    pub async fn deliver_next(&self) -> bool {
        let _in_flight = self.in_flight.lock().await;
        let Some(handler) = self.handler.read().await.clone() else {
            return false;
        };
        let Some(callback) = self.queue.try_dequeue() else {
            return false;
        };
        let sequence = callback.sequence;

        let ack = invoke(handler, callback).await;

        if self.acknowledge {
            self.acknowledge(sequence, ack).await;
        }
        true
    }

    async fn acknowledge(&self, sequence: u64, ack: CallbackAck) {
        let Some(writer) = self.ack_writer.read().await.clone() else {
            tracing::debug!(sequence, "Callback acknowledgement skipped: not connected");
            return;
        };
        if let Err(e) = writer.send(Frame::reply(sequence, ack.encode())).await {
            tracing::debug!(sequence, error = %e, "Callback acknowledgement not sent");
        }
    }

    /// Deliver callbacks inline until `budget` is spent. Returns how many were
    /// delivered.
    ///
    /// `since` is the queue's close count when the session accepted the evoke.
    /// A close observed before anything was delivered is returned as an error.
    pub async fn evoke(&self, budget: EvokeBudget, since: u64) -> Result<usize, SessionError> {
        let start = Instant::now();
        let wait_until = budget.min_wait.and_then(|d| deadline_after(start, d));
        let stop_at = budget.max_time.and_then(|d| deadline_after(start, d));
        let mut delivered = 0;

        while delivered < budget.max_callbacks {
            if stop_at.is_some_and(|stop| Instant::now() >= stop) {
                break;
            }
            if self.deliver_next().await {
                delivered += 1;
                continue;
            }

            let deadline = match (wait_until, stop_at) {
                (Some(wait), Some(stop)) => Some(wait.min(stop)),
                (wait, None) => wait,
                (None, stop) => stop,
            };
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            match self.queue.wait(deadline, since).await {
                WaitOutcome::Ready => continue,
                WaitOutcome::TimedOut => break,
                WaitOutcome::Closed(err) if delivered == 0 => return Err(err),
                WaitOutcome::Closed(_) => break,
            }
        }

        tracing::trace!(delivered, "Evoke finished");
        Ok(delivered)
    }

    /// Immediate-mode dispatcher for one connection. Exits once the queue is
    /// closed for that connection and nothing deliverable remains.
    pub async fn run_immediate(self: Arc<Self>, since: u64) {
        tracing::debug!("Immediate callback dispatcher started");
        loop {
            while self.deliver_next().await {}
            match self.queue.wait(None, since).await {
                WaitOutcome::Ready | WaitOutcome::TimedOut => continue,
                WaitOutcome::Closed(err) => {
                    tracing::debug!(reason = %err, "Immediate callback dispatcher stopped");
                    return;
                }
            }
        }
    }
}

async fn invoke(handler: Arc<dyn CallbackHandler>, callback: CallbackEnvelope) -> CallbackAck {
    let sequence = callback.sequence;
    let run = IN_CALLBACK.scope(true, async move { handler.on_callback(callback).await });

    match std::panic::AssertUnwindSafe(run).catch_unwind().await {
        Ok(Ok(())) => {
            tracing::trace!(sequence, "Callback handled");
            CallbackAck::Succeeded
        }
        Ok(Err(e)) => {
            tracing::warn!(sequence, error = %e, "Callback handler failed");
            CallbackAck::Failed(e.message().to_string())
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "callback handler panicked".to_string());
            tracing::error!(sequence, panic = %message, "Callback handler panicked");
            CallbackAck::Failed(message)
        }
    }
}
