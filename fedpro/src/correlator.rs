//! Matches Replies to the Calls that are waiting for them.
//!
//! - Lock-free concurrent access via DashMap
//! - Each pending call owns a oneshot; resolution removes the entry first, so
//!   a call completes at most once no matter how many Replies or failures race
//! - Entries are removed on resolve, timeout, cancellation and `fail_all`

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::SessionError;

type CallResult = Result<Bytes, SessionError>;

/// `start + after`, or `None` when that is beyond what `Instant` can hold.
/// A `None` deadline never expires.
pub(crate) fn deadline_after(start: Instant, after: Duration) -> Option<Instant> {
    start.checked_add(after)
}

struct PendingCall {
    tx: oneshot::Sender<CallResult>,
    registered_at: Instant,
}

/// What happened to an inbound Reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the waiting caller.
    Delivered,
    /// Sequence was issued but nobody is waiting any more (timed out, already
    /// resolved, failed by a disconnect, or the caller went away).
    Late,
    /// Sequence was never issued on this session.
    Unknown,
}

/// Receiving end of a registered call.
pub struct ResultSlot {
    sequence: u64,
    timeout: Duration,
    deadline: Option<Instant>,
    rx: oneshot::Receiver<CallResult>,
}

impl ResultSlot {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[derive(Default)]
pub struct Correlator {
    pending: DashMap<u64, PendingCall>,
    highest_issued: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the slot for `sequence`. Must happen before the Call is written.
    pub fn register(&self, sequence: u64, timeout: Duration) -> ResultSlot {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let deadline = deadline_after(now, timeout);
        self.pending.insert(
            sequence,
            PendingCall {
                tx,
                registered_at: now,
            },
        );
        self.highest_issued.fetch_max(sequence, Ordering::SeqCst);
        tracing::trace!(sequence, pending = self.pending.len(), "Call registered");
        ResultSlot {
            sequence,
            timeout,
            deadline,
            rx,
        }
    }

    pub fn resolve(&self, sequence: u64, result: CallResult) -> Resolution {
        if sequence == 0 || sequence > self.highest_issued.load(Ordering::SeqCst) {
            return Resolution::Unknown;
        }
        let Some((_, call)) = self.pending.remove(&sequence) else {
            return Resolution::Late;
        };
        tracing::trace!(
            sequence,
            elapsed_ms = call.registered_at.elapsed().as_millis() as u64,
            "Call resolved"
        );
        match call.tx.send(result) {
            Ok(()) => Resolution::Delivered,
            Err(_) => Resolution::Late,
        }
    }

    /// Fail every pending call with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: &SessionError) -> usize {
        let sequences: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for sequence in sequences {
            if let Some((_, call)) = self.pending.remove(&sequence) {
                let _ = call.tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::debug!(failed, error = %error, "Failed pending calls");
        }
        failed
    }

    /// Drop the entry for `sequence` without resolving it. False if it was
    /// already gone.
    pub fn cancel(&self, sequence: u64) -> bool {
        self.pending.remove(&sequence).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn highest_issued(&self) -> u64 {
        self.highest_issued.load(Ordering::SeqCst)
    }

    /// Wait for the slot's Reply or its deadline, whichever comes first.
    ///
    /// If the caller's future is dropped the entry is removed, so a later
    /// Reply is treated as late.
    pub async fn wait(&self, mut slot: ResultSlot) -> CallResult {
        let mut guard = CancelOnDrop {
            correlator: self,
            sequence: slot.sequence,
            armed: true,
        };

        let outcome = match slot.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, &mut slot.rx).await,
            None => Ok((&mut slot.rx).await),
        };
        guard.armed = false;

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::connection_lost(
                "call abandoned before a reply arrived",
            )),
            Err(_) => {
                if self.cancel(slot.sequence) {
                    tracing::debug!(
                        sequence = slot.sequence,
                        timeout = ?slot.timeout,
                        "Call timed out"
                    );
                    return Err(SessionError::CallTimeout {
                        sequence: slot.sequence,
                        timeout: slot.timeout,
                    });
                }
                // Lost the race: the result was sent just as the deadline hit.
                match slot.rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(SessionError::CallTimeout {
                        sequence: slot.sequence,
                        timeout: slot.timeout,
                    }),
                }
            }
        }
    }
}

struct CancelOnDrop<'a> {
    correlator: &'a Correlator,
    sequence: u64,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed && self.correlator.cancel(self.sequence) {
            tracing::trace!(sequence = self.sequence, "Call wait dropped");
        }
    }
}
