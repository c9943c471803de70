//! Dispatch loop: the single reader of a connection.
//!
//! Before the loop starts, [`open_session`] runs the new-session handshake on
//! the fresh connection.
//!
//! Flow:
//! 1. Read the next frame (or notice shutdown, a failed write, or silence)
//! 2. Reply → resolve the waiting call
//! 3. Callback → check ordering, enqueue
//! 4. Control → answer heartbeats, honour goodbye, signal termination
//! 5. On transport failure or protocol violation: return, and let the session
//!    tear the connection down and fail every waiter
//!
//! The loop never waits on anything a caller has to release: heartbeat
//! responses are written from a detached task so the send lock is never taken
//! here.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::callback::{CallbackEnvelope, CallbackQueue};
use crate::correlator::{Correlator, Resolution};
use crate::error::{ServiceError, SessionError};
use crate::transport::{FrameReader, FrameWriter, TransportError};
use crate::wire::protocol::parse_callback;
use crate::wire::{ControlMessage, Frame, FrameType, NewSessionReason, ReplyBody};

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchExit {
    /// Local shutdown requested (disconnect, close, session dropped).
    Shutdown,
    /// Peer closed, I/O failed, liveness timeout or goodbye.
    ConnectionLost(String),
    /// Malformed frame or protocol violation.
    Fault(SessionError),
}

pub struct DispatchContext {
    pub correlator: Arc<Correlator>,
    pub queue: Arc<CallbackQueue>,
    pub writer: FrameWriter,
    pub shutdown: CancellationToken,
    /// Tear down if nothing arrives for this long.
    pub liveness_timeout: Option<Duration>,
    /// Cancelled when the RTI confirms a requested termination.
    pub terminated: CancellationToken,
}

/// Offer `version` and wait for the RTI's answer. Returns the session id the
/// RTI assigned, or why the session was not established.
///
/// Must run before [`run`] takes over the reader. The caller bounds it with a
/// timeout.
pub async fn open_session(
    reader: &mut FrameReader,
    writer: &FrameWriter,
    version: u32,
) -> Result<u64, String> {
    writer
        .send(Frame::control(ControlMessage::NewSession { version }.encode()))
        .await
        .map_err(|e| e.to_string())?;

    let frame = reader.receive().await.map_err(|e| e.to_string())?;
    if frame.frame_type != FrameType::Control {
        return Err(format!(
            "expected new-session status, got {} frame",
            frame.frame_type
        ));
    }
    match ControlMessage::parse(frame.payload).map_err(|e| e.to_string())? {
        ControlMessage::NewSessionStatus {
            reason: NewSessionReason::Success,
            session_id,
        } => {
            tracing::debug!(session_id, version, "RTI accepted new session");
            Ok(session_id)
        }
        ControlMessage::NewSessionStatus { reason, .. } => {
            Err(format!("RTI refused the session: {reason}"))
        }
        other => Err(format!("expected new-session status, got {other:?}")),
    }
}

pub async fn run(mut reader: FrameReader, ctx: DispatchContext) -> DispatchExit {
    let mut last_callback: Option<u64> = None;
    let mut last_seen = Instant::now();

    loop {
        let liveness_deadline = ctx.liveness_timeout.map(|timeout| last_seen + timeout);
        let liveness = async {
            match liveness_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            _ = ctx.shutdown.cancelled() => {
                tracing::debug!("Dispatch loop shutting down");
                return DispatchExit::Shutdown;
            }

            _ = ctx.writer.failed() => {
                return DispatchExit::ConnectionLost("write to RTI failed".to_string());
            }

            _ = liveness => {
                let timeout = ctx.liveness_timeout.unwrap_or_default();
                tracing::warn!(?timeout, "No traffic from RTI within liveness timeout");
                return DispatchExit::ConnectionLost(format!("no traffic from RTI for {timeout:?}"));
            }

            received = reader.receive() => {
                match received {
                    Ok(frame) => {
                        last_seen = Instant::now();
                        if let Err(exit) = route(&ctx, &mut last_callback, frame) {
                            return exit;
                        }
                    }
                    Err(TransportError::Closed) => {
                        tracing::debug!("RTI closed the connection");
                        return DispatchExit::ConnectionLost("connection closed by peer".to_string());
                    }
                    Err(TransportError::Io(reason)) => {
                        tracing::debug!(error = %reason, "Transport read failed");
                        return DispatchExit::ConnectionLost(reason);
                    }
                    Err(TransportError::Malformed(e)) => {
                        return DispatchExit::Fault(SessionError::MalformedFrame(e));
                    }
                }
            }
        }
    }
}

fn violation(message: String) -> DispatchExit {
    DispatchExit::Fault(SessionError::ProtocolViolation(message))
}

fn route(
    ctx: &DispatchContext,
    last_callback: &mut Option<u64>,
    frame: Frame,
) -> Result<(), DispatchExit> {
    let sequence = frame.sequence;
    tracing::trace!(frame_type = %frame.frame_type, sequence, "Routing frame");

    match frame.frame_type {
        FrameType::Reply => {
            let result = match ReplyBody::parse(frame.payload) {
                Ok(ReplyBody::Ok(payload)) => Ok(payload),
                Ok(ReplyBody::ServiceError(payload)) => {
                    Err(SessionError::Service(ServiceError::new(payload)))
                }
                Err(e) => return Err(violation(format!("reply {sequence}: {e}"))),
            };
            match ctx.correlator.resolve(sequence, result) {
                Resolution::Delivered => {}
                Resolution::Late => {
                    tracing::warn!(sequence, "Discarding reply for call that is no longer pending");
                }
                Resolution::Unknown => {
                    return Err(violation(format!(
                        "reply for sequence {sequence} which was never issued"
                    )));
                }
            }
        }

        FrameType::Callback => {
            if let Some(previous) = *last_callback
                && sequence <= previous
            {
                return Err(violation(format!(
                    "callback sequence {sequence} does not follow {previous}"
                )));
            }
            let (ordering, payload) = parse_callback(frame.payload)
                .map_err(|e| violation(format!("callback {sequence}: {e}")))?;
            *last_callback = Some(sequence);
            ctx.queue
                .enqueue(CallbackEnvelope::new(sequence, ordering, payload));
        }

        FrameType::Control => {
            let message = ControlMessage::parse(frame.payload)
                .map_err(|e| violation(format!("control frame: {e}")))?;
            match message {
                ControlMessage::Heartbeat { id } => {
                    tracing::trace!(id, "Answering RTI heartbeat");
                    let writer = ctx.writer.clone();
                    tokio::spawn(async move {
                        let response = ControlMessage::HeartbeatResponse { responding_to: id };
                        if let Err(e) = writer.send(Frame::control(response.encode())).await {
                            tracing::debug!(id, error = %e, "Heartbeat response not sent");
                        }
                    });
                }
                ControlMessage::HeartbeatResponse { responding_to } => {
                    tracing::trace!(responding_to, "Heartbeat acknowledged by RTI");
                }
                ControlMessage::Goodbye { reason } => {
                    tracing::info!(%reason, "RTI ended the session");
                    return Err(DispatchExit::ConnectionLost(format!(
                        "RTI ended the session: {reason}"
                    )));
                }
                ControlMessage::SessionTerminated => {
                    if ctx.terminated.is_cancelled() {
                        tracing::warn!("Repeated session termination from RTI");
                    } else {
                        tracing::debug!("RTI confirmed session termination");
                        ctx.terminated.cancel();
                    }
                }
                ControlMessage::NewSession { .. }
                | ControlMessage::NewSessionStatus { .. }
                | ControlMessage::TerminateSession => {
                    return Err(violation(format!(
                        "unexpected control message from RTI: {message:?}"
                    )));
                }
                ControlMessage::Unknown { kind } => {
                    tracing::debug!(kind, "Ignoring unknown control message");
                }
            }
        }

        FrameType::Call => {
            return Err(violation(format!(
                "unexpected call frame {sequence} from RTI"
            )));
        }
    }
    Ok(())
}

/// Send a Heartbeat every `interval` until `shutdown` fires or a send fails.
pub async fn run_heartbeat(
    writer: FrameWriter,
    interval: Duration,
    ids: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let id = ids.fetch_add(1, Ordering::SeqCst);
                let heartbeat = ControlMessage::Heartbeat { id };
                if let Err(e) = writer.send(Frame::control(heartbeat.encode())).await {
                    tracing::debug!(id, error = %e, "Heartbeat not sent, stopping");
                    return;
                }
                tracing::trace!(id, "Heartbeat sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Connection;
    use crate::wire::OrderingClass;
    use crate::wire::protocol::encode_callback;
    use bytes::Bytes;

    struct Harness {
        correlator: Arc<Correlator>,
        queue: Arc<CallbackQueue>,
        shutdown: CancellationToken,
        terminated: CancellationToken,
        rti_reader: FrameReader,
        rti_writer: FrameWriter,
        task: tokio::task::JoinHandle<DispatchExit>,
    }

    fn start(liveness_timeout: Option<Duration>) -> Harness {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = Connection::from_stream(client, 1 << 20).into_split();
        let (rti_reader, rti_writer) = Connection::from_stream(server, 1 << 20).into_split();

        let correlator = Arc::new(Correlator::new());
        let queue = Arc::new(CallbackQueue::new());
        let shutdown = CancellationToken::new();
        let terminated = CancellationToken::new();
        let ctx = DispatchContext {
            correlator: Arc::clone(&correlator),
            queue: Arc::clone(&queue),
            writer,
            shutdown: shutdown.clone(),
            liveness_timeout,
            terminated: terminated.clone(),
        };
        Harness {
            correlator,
            queue,
            shutdown,
            terminated,
            rti_reader,
            rti_writer,
            task: tokio::spawn(run(reader, ctx)),
        }
    }

    fn ok_reply(sequence: u64, body: &'static [u8]) -> Frame {
        Frame::reply(sequence, ReplyBody::Ok(Bytes::from_static(body)).encode())
    }

    fn callback(sequence: u64) -> Frame {
        Frame::callback(sequence, encode_callback(OrderingClass::Receive, &[sequence as u8]))
    }

    #[tokio::test]
    async fn reply_resolves_call() {
        let h = start(None);
        let slot = h.correlator.register(1, Duration::from_secs(5));

        h.rti_writer.send(ok_reply(1, b"done")).await.unwrap();
        assert_eq!(h.correlator.wait(slot).await.unwrap(), "done");

        h.shutdown.cancel();
        assert_eq!(h.task.await.unwrap(), DispatchExit::Shutdown);
    }

    #[tokio::test]
    async fn service_error_reaches_caller_verbatim() {
        let h = start(None);
        let slot = h.correlator.register(1, Duration::from_secs(5));

        let body = ReplyBody::ServiceError(Bytes::from_static(b"NotConnected")).encode();
        h.rti_writer.send(Frame::reply(1, body)).await.unwrap();

        let err = h.correlator.wait(slot).await.unwrap_err();
        assert_eq!(err.as_service_error().unwrap().payload(), "NotConnected");
    }

    #[tokio::test]
    async fn callbacks_are_enqueued_in_order() {
        let h = start(None);
        for seq in [5, 6, 7] {
            h.rti_writer.send(callback(seq)).await.unwrap();
        }
        h.rti_writer
            .send(Frame::control(ControlMessage::Unknown { kind: 42 }.encode()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.queue.len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| h.queue.try_dequeue())
            .map(|cb| cb.sequence)
            .collect();
        assert_eq!(order, vec![5, 6, 7]);
        assert!(!h.task.is_finished());
    }

    #[tokio::test]
    async fn reply_for_unissued_sequence_is_a_violation() {
        let h = start(None);
        h.rti_writer.send(ok_reply(9, b"")).await.unwrap();

        assert!(matches!(
            h.task.await.unwrap(),
            DispatchExit::Fault(SessionError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn late_reply_is_discarded() {
        let h = start(None);
        let slot = h.correlator.register(1, Duration::from_millis(10));
        assert!(h.correlator.wait(slot).await.is_err());

        h.rti_writer.send(ok_reply(1, b"late")).await.unwrap();
        h.rti_writer.send(callback(1)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!h.task.is_finished());
    }

    #[tokio::test]
    async fn repeated_callback_sequence_is_a_violation() {
        let h = start(None);
        h.rti_writer.send(callback(3)).await.unwrap();
        h.rti_writer.send(callback(3)).await.unwrap();

        assert!(matches!(
            h.task.await.unwrap(),
            DispatchExit::Fault(SessionError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn inbound_call_is_a_violation() {
        let h = start(None);
        h.rti_writer.send(Frame::call(1, "nope")).await.unwrap();

        assert!(matches!(
            h.task.await.unwrap(),
            DispatchExit::Fault(SessionError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn peer_close_is_connection_lost() {
        let Harness {
            task,
            rti_reader,
            rti_writer,
            ..
        } = start(None);
        rti_writer.close().await;
        drop(rti_reader);
        drop(rti_writer);

        assert!(matches!(
            task.await.unwrap(),
            DispatchExit::ConnectionLost(_)
        ));
    }

    #[tokio::test]
    async fn goodbye_is_connection_lost() {
        let h = start(None);
        let goodbye = ControlMessage::Goodbye {
            reason: "federation destroyed".into(),
        };
        h.rti_writer.send(Frame::control(goodbye.encode())).await.unwrap();

        assert_eq!(
            h.task.await.unwrap(),
            DispatchExit::ConnectionLost("RTI ended the session: federation destroyed".into())
        );
    }

    #[tokio::test]
    async fn session_terminated_is_signalled_without_stopping() {
        let h = start(None);
        h.rti_writer
            .send(Frame::control(ControlMessage::SessionTerminated.encode()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), h.terminated.cancelled())
            .await
            .unwrap();
        assert!(!h.task.is_finished());
    }

    #[tokio::test]
    async fn handshake_message_after_open_is_a_violation() {
        let h = start(None);
        let status = ControlMessage::NewSessionStatus {
            reason: NewSessionReason::Success,
            session_id: 1,
        };
        h.rti_writer.send(Frame::control(status.encode())).await.unwrap();

        assert!(matches!(
            h.task.await.unwrap(),
            DispatchExit::Fault(SessionError::ProtocolViolation(_))
        ));
    }

    fn handshake_pair() -> (FrameReader, FrameWriter, FrameReader, FrameWriter) {
        let (client, server) = tokio::io::duplex(4096);
        let (reader, writer) = Connection::from_stream(client, 1024).into_split();
        let (rti_reader, rti_writer) = Connection::from_stream(server, 1024).into_split();
        (reader, writer, rti_reader, rti_writer)
    }

    #[tokio::test]
    async fn open_session_returns_assigned_id() {
        let (mut reader, writer, mut rti_reader, rti_writer) = handshake_pair();
        let rti = tokio::spawn(async move {
            let offer = rti_reader.receive().await.unwrap();
            assert_eq!(
                ControlMessage::parse(offer.payload).unwrap(),
                ControlMessage::NewSession { version: 3 }
            );
            let status = ControlMessage::NewSessionStatus {
                reason: NewSessionReason::Success,
                session_id: 77,
            };
            rti_writer.send(Frame::control(status.encode())).await.unwrap();
        });

        assert_eq!(open_session(&mut reader, &writer, 3).await, Ok(77));
        rti.await.unwrap();
    }

    #[tokio::test]
    async fn open_session_reports_refusal() {
        let (mut reader, writer, mut rti_reader, rti_writer) = handshake_pair();
        tokio::spawn(async move {
            rti_reader.receive().await.unwrap();
            let status = ControlMessage::NewSessionStatus {
                reason: NewSessionReason::UnsupportedProtocolVersion,
                session_id: 0,
            };
            rti_writer.send(Frame::control(status.encode())).await.unwrap();
            rti_reader
        });

        let err = open_session(&mut reader, &writer, 1).await.unwrap_err();
        assert_eq!(err, "RTI refused the session: unsupported protocol version");
    }

    #[tokio::test]
    async fn open_session_rejects_other_traffic() {
        let (mut reader, writer, mut rti_reader, rti_writer) = handshake_pair();
        tokio::spawn(async move {
            rti_reader.receive().await.unwrap();
            rti_writer.send(ok_reply(1, b"hello")).await.unwrap();
            rti_reader
        });

        let err = open_session(&mut reader, &writer, 1).await.unwrap_err();
        assert!(err.contains("reply frame"), "{err}");
    }

    #[tokio::test]
    async fn heartbeat_is_answered() {
        let mut h = start(None);
        h.rti_writer
            .send(Frame::control(ControlMessage::Heartbeat { id: 11 }.encode()))
            .await
            .unwrap();

        let frame = h.rti_reader.receive().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Control);
        assert_eq!(
            ControlMessage::parse(frame.payload).unwrap(),
            ControlMessage::HeartbeatResponse { responding_to: 11 }
        );
    }

    #[tokio::test]
    async fn silence_trips_liveness_timeout() {
        let h = start(Some(Duration::from_millis(30)));
        assert!(matches!(
            h.task.await.unwrap(),
            DispatchExit::ConnectionLost(_)
        ));
    }

    #[tokio::test]
    async fn heartbeat_task_sends_periodically() {
        let (client, server) = tokio::io::duplex(4096);
        let (_reader, writer) = Connection::from_stream(client, 1024).into_split();
        let (mut rti_reader, _rti_writer) = Connection::from_stream(server, 1024).into_split();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_heartbeat(
            writer,
            Duration::from_millis(10),
            Arc::new(AtomicU64::new(1)),
            shutdown.clone(),
        ));

        for expected in 1..=2 {
            let frame = rti_reader.receive().await.unwrap();
            assert_eq!(
                ControlMessage::parse(frame.payload).unwrap(),
                ControlMessage::Heartbeat { id: expected }
            );
        }
        shutdown.cancel();
        task.await.unwrap();
    }
}
