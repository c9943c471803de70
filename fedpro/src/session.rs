//! Session state machine and the public API used by the service layer.
//!
//! A [`Session`] is a cheap, cloneable handle. Every clone drives the same
//! connection: calls from any number of tasks are serialized onto the wire
//! by the send lock and matched to their Replies by the correlator, while one
//! dispatch task per connection reads everything the RTI sends.
//!
//! Connection loss and protocol faults are detected once, by the dispatch
//! task, and fanned out from [`SessionInner::teardown`] to every pending call
//! and every blocked evoke.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::callback::{
    CallbackDelivery, CallbackHandler, CallbackQueue, DeliveryMode, EvokeBudget, in_callback,
};
use crate::config::{ReconnectPolicy, SessionConfig};
use crate::correlator::Correlator;
use crate::dispatch::{self, DispatchContext, DispatchExit};
use crate::error::SessionError;
use crate::state::SessionState;
use crate::transport::{self, Connection, Endpoint, FrameWriter};
use crate::wire::{ControlMessage, FEDERATE_PROTOCOL_VERSION, Frame};

/// Unique identifier for a session, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(what, "Session mutex poisoned - continuing with inner state");
            poisoned.into_inner()
        }
    }
}

/// Clears an in-progress flag when the operation ends, however it ends.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Live connection owned by the session.
struct Link {
    epoch: u64,
    /// Value of `SessionInner::generation` when the link was attached.
    generation: u64,
    /// Id assigned by the RTI in the new-session handshake.
    rti_session: u64,
    writer: FrameWriter,
    shutdown: CancellationToken,
    /// Cancelled once the RTI confirms a termination request.
    terminated: CancellationToken,
}

struct SessionInner {
    id: SessionId,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    correlator: Arc<Correlator>,
    queue: Arc<CallbackQueue>,
    delivery: Arc<CallbackDelivery>,
    mode: Mutex<DeliveryMode>,
    link: Mutex<Option<Link>>,
    /// Last endpoint dialed, for reconnection.
    endpoint: Mutex<Option<Endpoint>>,
    /// Next Call sequence number. Never reset.
    next_sequence: AtomicU64,
    heartbeat_ids: Arc<AtomicU64>,
    /// Incremented per attached connection.
    epoch: AtomicU64,
    /// Incremented by every explicit disconnect or close; stops pending reconnects.
    generation: AtomicU64,
    joining: AtomicBool,
}

/// Client session with one RTI.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .field("queued_callbacks", &self.queued_callbacks())
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let queue = Arc::new(CallbackQueue::new());
        let delivery = Arc::new(CallbackDelivery::new(
            Arc::clone(&queue),
            config.acknowledge_callbacks,
        ));
        let (state, _) = watch::channel(SessionState::Disconnected);
        let id = SessionId::new();
        tracing::debug!(session = %id, mode = %config.delivery_mode, "Session created");

        Self {
            inner: Arc::new(SessionInner {
                id,
                mode: Mutex::new(config.delivery_mode),
                config,
                state,
                correlator: Arc::new(Correlator::new()),
                queue,
                delivery,
                link: Mutex::new(None),
                endpoint: Mutex::new(None),
                next_sequence: AtomicU64::new(1),
                heartbeat_ids: Arc::new(AtomicU64::new(1)),
                epoch: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                joining: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Session id the RTI assigned to the current connection.
    pub fn rti_session_id(&self) -> Option<u64> {
        lock_or_recover(&self.inner.link, "link")
            .as_ref()
            .map(|link| link.rti_session)
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    pub fn queued_callbacks(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        *lock_or_recover(&self.inner.mode, "delivery mode")
    }

    /// Install the handler. Callbacks that arrive before this stay queued and
    /// are delivered, in order, once it is set.
    pub async fn set_callback_handler(&self, handler: impl CallbackHandler + 'static) {
        self.inner.delivery.set_handler(Arc::new(handler)).await;
    }

    /// Only accepted before the session has connected for the first time.
    pub fn set_delivery_mode(&self, mode: DeliveryMode) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Disconnected || self.inner.epoch.load(Ordering::SeqCst) > 0 {
            return Err(SessionError::invalid_state("set_delivery_mode", state));
        }
        *lock_or_recover(&self.inner.mode, "delivery mode") = mode;
        tracing::debug!(session = %self.inner.id, %mode, "Delivery mode set");
        Ok(())
    }

    /// Dial `endpoint`, open a session with the RTI and move
    /// Disconnected → Connecting → Connected.
    ///
    /// A refused or unanswered new-session request fails with
    /// [`SessionError::Connect`] and leaves the session Disconnected.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<(), SessionError> {
        self.inner.connect_endpoint(&endpoint).await
    }

    /// Attach an already established stream instead of dialing. The
    /// new-session handshake still runs on it.
    pub async fn connect_with(&self, connection: Connection) -> Result<(), SessionError> {
        self.inner.begin_connect()?;
        self.inner.attach(connection).await
    }

    /// Join a federation execution. Connected → Joined once the RTI accepts.
    ///
    /// Only one join may be outstanding; a second one fails with
    /// [`SessionError::InProgress`] without sending anything.
    pub async fn join(&self, params: impl Into<Bytes>) -> Result<Bytes, SessionError> {
        if self.inner.joining.swap(true, Ordering::SeqCst) {
            return Err(SessionError::InProgress { operation: "join" });
        }
        let _joining = InProgress(&self.inner.joining);

        let reply = self
            .inner
            .send_call("join", |s| s == SessionState::Connected, params.into(), None)
            .await?;
        match self
            .inner
            .try_transition(|s| s == SessionState::Connected, SessionState::Joined)
        {
            Ok(_) => {
                tracing::info!(session = %self.inner.id, "Joined federation execution");
                Ok(reply)
            }
            Err(current) => Err(SessionError::invalid_state("join", current)),
        }
    }

    /// Resign from the federation execution. Joined → Resigning → Connected.
    ///
    /// A non-fatal failure (service error, timeout) leaves the session Joined.
    pub async fn resign(&self, params: impl Into<Bytes>) -> Result<Bytes, SessionError> {
        if let Err(current) = self
            .inner
            .try_transition(|s| s == SessionState::Joined, SessionState::Resigning)
        {
            return Err(SessionError::invalid_state("resign", current));
        }

        let result = self
            .inner
            .send_call(
                "resign",
                |s| s == SessionState::Resigning,
                params.into(),
                None,
            )
            .await;

        match result {
            Ok(reply) => {
                if let Err(current) = self
                    .inner
                    .try_transition(|s| s == SessionState::Resigning, SessionState::Connected)
                {
                    return Err(SessionError::invalid_state("resign", current));
                }
                tracing::info!(session = %self.inner.id, "Resigned from federation execution");
                Ok(reply)
            }
            Err(e) => {
                if !e.is_fatal() {
                    let _ = self
                        .inner
                        .try_transition(|s| s == SessionState::Resigning, SessionState::Joined);
                }
                Err(e)
            }
        }
    }

    /// Service call. Only valid while Joined.
    pub async fn call(
        &self,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Bytes, SessionError> {
        self.inner
            .send_call("call", |s| s.allows_service_calls(), payload.into(), timeout)
            .await
    }

    /// Administrative call (federation management before joining). Valid while
    /// Connected or Joined.
    pub async fn call_admin(
        &self,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Bytes, SessionError> {
        self.inner
            .send_call("call_admin", |s| s.allows_admin_calls(), payload.into(), timeout)
            .await
    }

    /// Deliver queued callbacks on the calling task. Returns how many were
    /// delivered. Nothing is delivered before a handler is set.
    pub async fn evoke(&self, budget: EvokeBudget) -> Result<usize, SessionError> {
        if in_callback() {
            return Err(SessionError::EvokeWithinCallback);
        }
        let state = self.state();
        if self.delivery_mode() != DeliveryMode::Evoked {
            return Err(SessionError::invalid_state("evoke", state));
        }
        if budget.is_unbounded() && !self.inner.config.allow_unbounded_evoke {
            return Err(SessionError::UnboundedEvoke);
        }

        let since = self.inner.queue.closures();
        if !state.is_connected() && self.inner.queue.is_empty() {
            return Err(SessionError::invalid_state("evoke", state));
        }
        self.inner.delivery.evoke(budget, since).await
    }

    pub fn enable_callbacks(&self) {
        self.inner.queue.set_paused(false);
        tracing::debug!(session = %self.inner.id, "Callbacks enabled");
    }

    pub fn disable_callbacks(&self) {
        self.inner.queue.set_paused(true);
        tracing::debug!(session = %self.inner.id, "Callbacks disabled");
    }

    pub fn callbacks_enabled(&self) -> bool {
        !self.inner.queue.is_paused()
    }

    /// Send one heartbeat now. Returns its id.
    pub async fn send_heartbeat(&self) -> Result<u64, SessionError> {
        let state = self.state();
        let Some(writer) = self.inner.current_writer().filter(|_| state.is_connected()) else {
            return Err(SessionError::invalid_state("send_heartbeat", state));
        };
        let id = self.inner.heartbeat_ids.fetch_add(1, Ordering::SeqCst);
        writer
            .send(Frame::control(ControlMessage::Heartbeat { id }.encode()))
            .await?;
        Ok(id)
    }

    /// End the session with the RTI and drop the connection.
    ///
    /// The RTI is asked to terminate the session and given
    /// `terminate_timeout` to confirm. Pending calls then fail with
    /// `ConnectionLost` and blocked evokes return. A no-op when already
    /// Disconnected, Faulted or Closed.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state == SessionState::Disconnected || state.is_terminal() {
            return Ok(());
        }
        self.inner
            .shutdown(SessionState::Disconnected, "disconnected by federate")
            .await;
        tracing::info!(session = %self.inner.id, "Disconnected");
        Ok(())
    }

    /// Disconnect and retire the session for good.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.state().is_terminal() {
            return Ok(());
        }
        self.inner
            .shutdown(SessionState::Closed, "session closed")
            .await;
        tracing::info!(session = %self.inner.id, "Session closed");
        Ok(())
    }
}

impl SessionInner {
    /// Atomically move to `next` if the current state satisfies `allowed` and
    /// the transition table permits it. Returns the previous state, or the
    /// current state on refusal.
    fn try_transition(
        &self,
        allowed: impl FnOnce(SessionState) -> bool,
        next: SessionState,
    ) -> Result<SessionState, SessionState> {
        let mut outcome = Err(next);
        self.state.send_if_modified(|state| {
            let current = *state;
            if allowed(current) && current.can_transition_to(next) {
                *state = next;
                outcome = Ok(current);
                true
            } else {
                outcome = Err(current);
                false
            }
        });
        if let Ok(previous) = outcome {
            tracing::debug!(session = %self.id, from = %previous, to = %next, "Session state changed");
        }
        outcome
    }

    fn current_writer(&self) -> Option<FrameWriter> {
        lock_or_recover(&self.link, "link")
            .as_ref()
            .map(|link| link.writer.clone())
    }

    fn begin_connect(&self) -> Result<(), SessionError> {
        self.try_transition(
            |s| s == SessionState::Disconnected,
            SessionState::Connecting,
        )
        .map(|_| ())
        .map_err(|current| SessionError::invalid_state("connect", current))
    }

    async fn connect_endpoint(self: &Arc<Self>, endpoint: &Endpoint) -> Result<(), SessionError> {
        self.begin_connect()?;
        *lock_or_recover(&self.endpoint, "endpoint") = Some(endpoint.clone());

        match transport::connect(
            endpoint,
            self.config.connect_timeout,
            self.config.max_frame_length,
        )
        .await
        {
            Ok(connection) => self.attach(connection).await,
            Err(e) => {
                tracing::warn!(session = %self.id, %endpoint, error = %e, "Connect failed");
                let _ = self.try_transition(
                    |s| s == SessionState::Connecting,
                    SessionState::Disconnected,
                );
                Err(e)
            }
        }
    }

    /// Open a session on a fresh connection, wire it up and enter Connected.
    /// Expects Connecting.
    async fn attach(self: &Arc<Self>, connection: Connection) -> Result<(), SessionError> {
        let peer = connection.peer().to_string();
        let (mut reader, writer) = connection.into_split();
        let generation = self.generation.load(Ordering::SeqCst);

        let timeout = self.config.connect_timeout;
        let handshake = dispatch::open_session(&mut reader, &writer, FEDERATE_PROTOCOL_VERSION);
        let rti_session = match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(rti_session)) => rti_session,
            Ok(Err(reason)) => return Err(self.abandon_handshake(&writer, peer, reason).await),
            Err(_) => {
                let reason = format!("no new-session status within {timeout:?}");
                return Err(self.abandon_handshake(&writer, peer, reason).await);
            }
        };

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let shutdown = CancellationToken::new();
        let terminated = CancellationToken::new();

        self.queue.reopen();
        let since = self.queue.closures();
        self.delivery.set_ack_writer(Some(writer.clone())).await;
        *lock_or_recover(&self.link, "link") = Some(Link {
            epoch,
            generation,
            rti_session,
            writer: writer.clone(),
            shutdown: shutdown.clone(),
            terminated: terminated.clone(),
        });

        if let Err(current) =
            self.try_transition(|s| s == SessionState::Connecting, SessionState::Connected)
        {
            // Disconnected or closed while dialing.
            {
                let mut link = lock_or_recover(&self.link, "link");
                if link.as_ref().is_some_and(|l| l.epoch == epoch) {
                    link.take();
                }
            }
            shutdown.cancel();
            writer.close().await;
            self.delivery.set_ack_writer(None).await;
            return Err(SessionError::invalid_state("connect", current));
        }

        let ctx = DispatchContext {
            correlator: Arc::clone(&self.correlator),
            queue: Arc::clone(&self.queue),
            writer: writer.clone(),
            shutdown: shutdown.clone(),
            liveness_timeout: self.config.heartbeat.map(|hb| hb.timeout),
            terminated,
        };
        let weak: Weak<SessionInner> = Arc::downgrade(self);
        tokio::spawn(async move {
            let exit = dispatch::run(reader, ctx).await;
            if let Some(inner) = weak.upgrade() {
                inner.teardown(epoch, exit).await;
            }
        });

        if let Some(heartbeat) = self.config.heartbeat {
            tokio::spawn(dispatch::run_heartbeat(
                writer,
                heartbeat.interval,
                Arc::clone(&self.heartbeat_ids),
                shutdown,
            ));
        }

        let mode = *lock_or_recover(&self.mode, "delivery mode");
        if mode == DeliveryMode::Immediate {
            tokio::spawn(Arc::clone(&self.delivery).run_immediate(since));
        }

        tracing::info!(session = %self.id, epoch, rti_session, %peer, %mode, "Connected to RTI");
        Ok(())
    }

    async fn abandon_handshake(
        &self,
        writer: &FrameWriter,
        endpoint: String,
        reason: String,
    ) -> SessionError {
        tracing::warn!(session = %self.id, %endpoint, %reason, "Session handshake failed");
        writer.close().await;
        let _ = self.try_transition(
            |s| s == SessionState::Connecting,
            SessionState::Disconnected,
        );
        SessionError::Connect { endpoint, reason }
    }

    async fn send_call(
        &self,
        operation: &'static str,
        allowed: impl Fn(SessionState) -> bool,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes, SessionError> {
        let state = *self.state.borrow();
        if !allowed(state) {
            return Err(SessionError::invalid_state(operation, state));
        }
        let Some(writer) = self.current_writer() else {
            return Err(SessionError::invalid_state(operation, state));
        };
        let timeout = timeout.unwrap_or(self.config.call_timeout);

        let slot = {
            let mut guard = writer.lock().await;
            // Assigned under the send lock so wire order equals sequence order.
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            let slot = self.correlator.register(sequence, timeout);
            if let Err(e) = guard.send(Frame::call(sequence, payload)).await {
                self.correlator.cancel(sequence);
                return Err(e);
            }
            tracing::trace!(session = %self.id, sequence, operation, "Call sent");
            slot
        };

        self.correlator.wait(slot).await
    }

    /// Tear down the connection of `epoch` after its dispatch loop exited.
    /// Ignored if that connection was already shut down locally.
    async fn teardown(self: &Arc<Self>, epoch: u64, exit: DispatchExit) {
        let link = {
            let mut link = lock_or_recover(&self.link, "link");
            if link.as_ref().is_some_and(|l| l.epoch == epoch) {
                link.take()
            } else {
                None
            }
        };
        let Some(link) = link else {
            return;
        };
        let generation = link.generation;

        let (error, next) = match exit {
            DispatchExit::Shutdown => (
                SessionError::connection_lost("connection shut down"),
                SessionState::Disconnected,
            ),
            DispatchExit::ConnectionLost(reason) => {
                tracing::warn!(session = %self.id, epoch, %reason, "Connection to RTI lost");
                (SessionError::ConnectionLost(reason), SessionState::Disconnected)
            }
            DispatchExit::Fault(error) => {
                tracing::error!(session = %self.id, epoch, %error, "Session faulted");
                (error, SessionState::Faulted)
            }
        };

        let moved = self.try_transition(|s| !s.is_terminal(), next).is_ok();
        self.release(link, &error).await;

        if moved && next == SessionState::Disconnected {
            self.schedule_reconnect(generation);
        }
    }

    /// Local teardown for disconnect and close.
    async fn shutdown(self: &Arc<Self>, next: SessionState, reason: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.terminate().await;
        let link = lock_or_recover(&self.link, "link").take();
        let _ = self.try_transition(|s| !s.is_terminal(), next);

        let error = SessionError::connection_lost(reason);
        match link {
            Some(link) => self.release(link, &error).await,
            None => {
                self.correlator.fail_all(&error);
                self.queue.close(error);
            }
        }
    }

    /// Ask the RTI to end the session and wait, at most `terminate_timeout`,
    /// for its confirmation or for the connection to go away.
    async fn terminate(&self) {
        let Some((writer, shutdown, terminated)) = lock_or_recover(&self.link, "link")
            .as_ref()
            .map(|link| {
                (
                    link.writer.clone(),
                    link.shutdown.clone(),
                    link.terminated.clone(),
                )
            })
        else {
            return;
        };

        let request = Frame::control(ControlMessage::TerminateSession.encode());
        if let Err(e) = writer.send(request).await {
            tracing::debug!(session = %self.id, error = %e, "Termination request not sent");
            return;
        }

        let timeout = self.config.terminate_timeout;
        tokio::select! {
            _ = terminated.cancelled() => {
                tracing::debug!(session = %self.id, "RTI confirmed termination");
            }
            _ = shutdown.cancelled() => {
                tracing::debug!(session = %self.id, "Connection ended before termination was confirmed");
            }
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(session = %self.id, ?timeout, "RTI did not confirm termination");
            }
        }
    }

    /// Stop the connection's tasks, then fail everything waiting on it.
    async fn release(&self, link: Link, error: &SessionError) {
        link.shutdown.cancel();
        // Close before failing calls so a caller registering concurrently
        // either sees the closed writer or is caught by fail_all.
        link.writer.close().await;
        self.delivery.set_ack_writer(None).await;

        let failed = self.correlator.fail_all(error);
        self.queue.close(error.clone());
        tracing::debug!(session = %self.id, epoch = link.epoch, failed, "Connection released");
    }

    /// Redial after losing a link attached in `generation`. Nothing happens if
    /// a disconnect or close has happened since.
    fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let ReconnectPolicy::Retry { attempts, delay } = self.config.reconnect else {
            return;
        };
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(session = %self.id, "Reconnect skipped after explicit shutdown");
            return;
        }
        let Some(endpoint) = lock_or_recover(&self.endpoint, "endpoint").clone() else {
            tracing::debug!(session = %self.id, "No endpoint to reconnect to");
            return;
        };
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            for attempt in 1..=attempts {
                tokio::time::sleep(delay.saturating_mul(attempt)).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                tracing::info!(session = %inner.id, attempt, attempts, %endpoint, "Reconnecting to RTI");
                match inner.connect_endpoint(&endpoint).await {
                    Ok(()) => return,
                    Err(SessionError::InvalidState { state, .. }) => {
                        tracing::debug!(session = %inner.id, %state, "Reconnect abandoned");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(session = %inner.id, attempt, error = %e, "Reconnect attempt failed");
                    }
                }
            }
            tracing::warn!(attempts, %endpoint, "Giving up reconnecting to RTI");
        });
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let link = match self.link.get_mut() {
            Ok(link) => link.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(link) = link {
            link.shutdown.cancel();
        }
        let error = SessionError::connection_lost("session dropped");
        self.correlator.fail_all(&error);
        self.queue.close(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackEnvelope;
    use crate::error::CallbackError;
    use crate::transport::{FrameReader, FrameWriter};
    use crate::wire::protocol::encode_callback;
    use crate::wire::{FrameType, NewSessionReason, OrderingClass, ReplyBody};

    const RTI_SESSION: u64 = 42;

    /// In-memory RTI end of a duplex connection.
    fn duplex_pair() -> (Connection, FrameReader, FrameWriter) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (rti_reader, rti_writer) = Connection::from_stream(server, 1 << 20).into_split();
        (Connection::from_stream(client, 1 << 20), rti_reader, rti_writer)
    }

    fn quick_terminate() -> SessionConfig {
        SessionConfig::new().with_terminate_timeout(Duration::from_millis(50))
    }

    /// Answer the new-session request on the RTI end with `reason`.
    async fn answer_handshake(
        rti_reader: &mut FrameReader,
        rti_writer: &FrameWriter,
        reason: NewSessionReason,
    ) {
        let offer = rti_reader.receive().await.unwrap();
        assert_eq!(offer.frame_type, FrameType::Control);
        assert_eq!(
            ControlMessage::parse(offer.payload).unwrap(),
            ControlMessage::NewSession {
                version: FEDERATE_PROTOCOL_VERSION
            }
        );
        let status = ControlMessage::NewSessionStatus {
            reason,
            session_id: RTI_SESSION,
        };
        rti_writer.send(Frame::control(status.encode())).await.unwrap();
    }

    /// Connect `session` over a duplex stream, playing the RTI's part of the
    /// handshake. Returns the RTI end.
    async fn connect_duplex(session: &Session) -> (FrameReader, FrameWriter) {
        let (connection, mut rti_reader, rti_writer) = duplex_pair();
        let (connected, ()) = tokio::join!(
            session.connect_with(connection),
            answer_handshake(&mut rti_reader, &rti_writer, NewSessionReason::Success),
        );
        connected.unwrap();
        (rti_reader, rti_writer)
    }

    async fn reply_ok(rti_reader: &mut FrameReader, rti_writer: &FrameWriter) -> Frame {
        let call = rti_reader.receive().await.unwrap();
        assert_eq!(call.frame_type, FrameType::Call);
        rti_writer
            .send(Frame::reply(call.sequence, ReplyBody::Ok(call.payload.clone()).encode()))
            .await
            .unwrap();
        call
    }

    #[tokio::test]
    async fn operations_before_connect_are_invalid() {
        let session = Session::default();
        assert_eq!(
            session.call("x", None).await,
            Err(SessionError::invalid_state("call", SessionState::Disconnected))
        );
        assert_eq!(
            session.join("fed").await,
            Err(SessionError::invalid_state("join", SessionState::Disconnected))
        );
        assert_eq!(
            session.resign("").await,
            Err(SessionError::invalid_state("resign", SessionState::Disconnected))
        );
        assert!(matches!(
            session.send_heartbeat().await,
            Err(SessionError::InvalidState { .. })
        ));
        assert_eq!(session.disconnect().await, Ok(()));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn join_and_resign_walk_the_state_machine() {
        let session = Session::default();
        let mut states = session.subscribe_state();

        let (mut rti_reader, rti_writer) = connect_duplex(&session).await;
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.rti_session_id(), Some(RTI_SESSION));
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SessionState::Connected);

        // Service calls need membership.
        assert_eq!(
            session.call("x", None).await,
            Err(SessionError::invalid_state("call", SessionState::Connected))
        );

        let joiner = {
            let session = session.clone();
            tokio::spawn(async move { session.join("federate-a").await })
        };
        let call = reply_ok(&mut rti_reader, &rti_writer).await;
        assert_eq!(call.sequence, 1);
        assert_eq!(joiner.await.unwrap().unwrap(), "federate-a");
        assert_eq!(session.state(), SessionState::Joined);

        let resigner = {
            let session = session.clone();
            tokio::spawn(async move { session.resign("").await })
        };
        let call = reply_ok(&mut rti_reader, &rti_writer).await;
        assert_eq!(call.sequence, 2);
        resigner.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn failed_resign_stays_joined() {
        let session = Session::default();
        let (mut rti_reader, rti_writer) = connect_duplex(&session).await;

        let joiner = {
            let session = session.clone();
            tokio::spawn(async move { session.join("a").await })
        };
        reply_ok(&mut rti_reader, &rti_writer).await;
        joiner.await.unwrap().unwrap();

        let resigner = {
            let session = session.clone();
            tokio::spawn(async move { session.resign("").await })
        };
        let call = rti_reader.receive().await.unwrap();
        let body = ReplyBody::ServiceError(Bytes::from_static(b"OwnershipAcquisitionPending"));
        rti_writer
            .send(Frame::reply(call.sequence, body.encode()))
            .await
            .unwrap();

        let err = resigner.await.unwrap().unwrap_err();
        assert!(err.as_service_error().is_some());
        assert_eq!(session.state(), SessionState::Joined);
    }

    #[tokio::test]
    async fn connect_twice_is_invalid() {
        let session = Session::default();
        let _rti = connect_duplex(&session).await;
        let (second, _r2, _w2) = duplex_pair();

        assert_eq!(
            session.connect_with(second).await,
            Err(SessionError::invalid_state("connect", SessionState::Connected))
        );
    }

    #[tokio::test]
    async fn delivery_mode_is_fixed_after_first_connect() {
        let session = Session::new(quick_terminate());
        session.set_delivery_mode(DeliveryMode::Evoked).unwrap();
        assert_eq!(session.delivery_mode(), DeliveryMode::Evoked);

        let _rti = connect_duplex(&session).await;
        session.disconnect().await.unwrap();

        assert!(matches!(
            session.set_delivery_mode(DeliveryMode::Immediate),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn evoke_preconditions() {
        let immediate = Session::default();
        assert!(matches!(
            immediate.evoke(EvokeBudget::count(1)).await,
            Err(SessionError::InvalidState { .. })
        ));

        let evoked = Session::new(SessionConfig::new().with_delivery_mode(DeliveryMode::Evoked));
        assert_eq!(
            evoked.evoke(EvokeBudget::forever()).await,
            Err(SessionError::UnboundedEvoke)
        );
        assert_eq!(
            evoked.evoke(EvokeBudget::count(1)).await,
            Err(SessionError::invalid_state("evoke", SessionState::Disconnected))
        );
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let session = Session::new(quick_terminate());
        let _rti = connect_duplex(&session).await;

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close().await, Ok(()));
        assert_eq!(session.disconnect().await, Ok(()));

        let (again, _r, _w) = duplex_pair();
        assert_eq!(
            session.connect_with(again).await,
            Err(SessionError::invalid_state("connect", SessionState::Closed))
        );
    }

    #[tokio::test]
    async fn heartbeat_on_demand() {
        let session = Session::default();
        let (mut rti_reader, _rti_writer) = connect_duplex(&session).await;

        let id = session.send_heartbeat().await.unwrap();
        let frame = rti_reader.receive().await.unwrap();
        assert_eq!(frame.sequence, 0);
        assert_eq!(
            ControlMessage::parse(frame.payload).unwrap(),
            ControlMessage::Heartbeat { id }
        );
    }

    #[tokio::test]
    async fn refused_handshake_leaves_session_disconnected() {
        let session = Session::default();
        let (connection, mut rti_reader, rti_writer) = duplex_pair();
        let (connected, ()) = tokio::join!(
            session.connect_with(connection),
            answer_handshake(&mut rti_reader, &rti_writer, NewSessionReason::OutOfResources),
        );

        let reason = match connected {
            Err(SessionError::Connect { reason, .. }) => reason,
            other => panic!("expected a connect error, got {other:?}"),
        };
        assert!(reason.contains("out of resources"), "{reason}");
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.rti_session_id(), None);

        // A fresh handshake on a new connection succeeds.
        let _rti = connect_duplex(&session).await;
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn silent_peer_fails_the_handshake() {
        let session = Session::new(
            SessionConfig::new().with_connect_timeout(Duration::from_millis(50)),
        );
        let (connection, _rti_reader, _rti_writer) = duplex_pair();

        let connected = session.connect_with(connection).await;
        assert!(matches!(connected, Err(SessionError::Connect { .. })), "{connected:?}");
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_waits_for_termination_confirmation() {
        let session = Session::new(
            SessionConfig::new().with_terminate_timeout(Duration::from_secs(30)),
        );
        let (mut rti_reader, rti_writer) = connect_duplex(&session).await;

        let rti = tokio::spawn(async move {
            let request = rti_reader.receive().await.unwrap();
            assert_eq!(
                ControlMessage::parse(request.payload).unwrap(),
                ControlMessage::TerminateSession
            );
            rti_writer
                .send(Frame::control(ControlMessage::SessionTerminated.encode()))
                .await
                .unwrap();
            (rti_reader, rti_writer)
        });

        tokio::time::timeout(Duration::from_secs(5), session.disconnect())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.rti_session_id(), None);
        rti.await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_termination_is_bounded() {
        let session = Session::new(quick_terminate());
        let (mut rti_reader, _rti_writer) = connect_duplex(&session).await;

        let started = tokio::time::Instant::now();
        session.close().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(session.state(), SessionState::Closed);

        let request = rti_reader.receive().await.unwrap();
        assert_eq!(
            ControlMessage::parse(request.payload).unwrap(),
            ControlMessage::TerminateSession
        );
    }

    #[tokio::test]
    async fn second_join_while_first_is_outstanding_is_rejected() {
        let session = Session::default();
        let (mut rti_reader, rti_writer) = connect_duplex(&session).await;

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.join("first").await })
        };
        let call = rti_reader.receive().await.unwrap();
        assert_eq!(call.frame_type, FrameType::Call);

        assert_eq!(
            session.join("second").await,
            Err(SessionError::InProgress { operation: "join" })
        );

        rti_writer
            .send(Frame::reply(call.sequence, ReplyBody::Ok(call.payload).encode()))
            .await
            .unwrap();
        assert_eq!(first.await.unwrap().unwrap(), "first");
        assert_eq!(session.state(), SessionState::Joined);

        // The guard is released: a further join reaches the state check.
        assert_eq!(
            session.join("third").await,
            Err(SessionError::invalid_state("join", SessionState::Joined))
        );
    }

    #[tokio::test]
    async fn unrepresentable_timeouts_mean_no_deadline() {
        let session = Session::new(SessionConfig::new().with_delivery_mode(DeliveryMode::Evoked));
        let (mut rti_reader, rti_writer) = connect_duplex(&session).await;
        session
            .set_callback_handler(|_: CallbackEnvelope| -> Result<(), CallbackError> { Ok(()) })
            .await;

        let caller = {
            let session = session.clone();
            tokio::spawn(async move { session.call_admin("x", Some(Duration::MAX)).await })
        };
        reply_ok(&mut rti_reader, &rti_writer).await;
        assert_eq!(caller.await.unwrap().unwrap(), "x");
        assert_eq!(session.pending_calls(), 0);

        let evoker = {
            let session = session.clone();
            tokio::spawn(async move { session.evoke(EvokeBudget::single(Duration::MAX)).await })
        };
        rti_writer
            .send(Frame::callback(1, encode_callback(OrderingClass::Receive, b"cb")))
            .await
            .unwrap();
        assert_eq!(evoker.await.unwrap(), Ok(1));
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(Session::default().id(), Session::default().id());
    }
}
