// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session state machine.
//!
//! ```text
//!             request                 created+activated
//! Inactive ─────────────▶ Creating ──────────────────────▶ Active
//!    ▲                      │  ▲                              │
//!    └── caller failure ────┘  │ activation failed            │ channel lost /
//!                              │ (recovery, with backoff)     │ keep-alive failure
//!                              └──────────── Reactivating ◀───┘
//!                                               │ activated
//!                                               └──────────▶ Active (same future)
//!
//! any state ── close ──▶ Closing ──▶ Closed ── request ──▶ Creating
//! ```
//!
//! The machine is an actor: one task owns the mutable state and applies
//! events from an unbounded queue strictly in order. Network work runs in
//! spawned tasks that post their outcome back as events tagged with the
//! generation they were started under; events from an older generation are
//! dropped. Readers see an immutable [`ArcSwap`] snapshot and never touch the
//! queue when a session is already being created or is usable.
//!
//! Callers get a [`SessionFuture`], a shared future resolved exactly once.
//! A successful reactivation keeps the already-resolved future, so holders
//! never observe the interruption.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use ualink_core::{ReconnectPolicy, RetryDecision};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::correlator::RequestCorrelator;
use crate::error::{OpcUaError, OpcUaResult, ServiceError, SessionError, TimeoutError};
use crate::identity::{CertificateValidator, IdentityProvider};
use crate::message::{
    expect_response, ActivateSessionRequest, ApplicationDescription, CloseSessionRequest,
    CreateSessionRequest, CreateSessionResponse, ReadRequest, RequestHeader, RequestKind,
    RequestMessage, SignatureData,
};
use crate::stats::ClientStats;
use crate::transport::ChannelEvent;
use crate::types::{EndpointDescription, NodeId, ReadValueId, TimestampsToReturn};

// =============================================================================
// SessionState
// =============================================================================

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session; the next request creates one.
    #[default]
    Inactive,
    /// CreateSession/ActivateSession in progress.
    Creating,
    /// Session is usable.
    Active,
    /// Re-activating the existing session on a new channel.
    Reactivating,
    /// CloseSession in progress.
    Closing,
    /// Closed by the client. A new request starts over.
    Closed,
}

impl SessionState {
    /// Returns `true` if the session is usable.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// States in which the current future is handed out without queueing.
    #[inline]
    fn serves_current_future(&self) -> bool {
        matches!(self, Self::Creating | Self::Active | Self::Reactivating)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "Inactive"),
            Self::Creating => write!(f, "Creating"),
            Self::Active => write!(f, "Active"),
            Self::Reactivating => write!(f, "Reactivating"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// A server session.
pub struct Session {
    session_id: NodeId,
    authentication_token: NodeId,
    revised_timeout: Duration,
    max_request_message_size: u32,
    endpoint: EndpointDescription,
    server_nonce: Mutex<Vec<u8>>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
}

impl Session {
    fn from_response(response: CreateSessionResponse, endpoint: EndpointDescription) -> Self {
        let now = Instant::now();
        Self {
            session_id: response.session_id,
            authentication_token: response.authentication_token,
            revised_timeout: response.revised_session_timeout,
            max_request_message_size: response.max_request_message_size,
            endpoint,
            server_nonce: Mutex::new(response.server_nonce),
            created_at: now,
            last_activity: Mutex::new(now),
        }
    }

    /// Server-assigned session id.
    pub fn session_id(&self) -> &NodeId {
        &self.session_id
    }

    /// Token placed in every request header.
    pub fn authentication_token(&self) -> &NodeId {
        &self.authentication_token
    }

    /// Session timeout as revised by the server.
    pub fn revised_timeout(&self) -> Duration {
        self.revised_timeout
    }

    /// Maximum request size accepted by the server; 0 = no limit.
    pub fn max_request_message_size(&self) -> u32 {
        self.max_request_message_size
    }

    /// Endpoint the session was created on.
    pub fn endpoint(&self) -> &EndpointDescription {
        &self.endpoint
    }

    /// Latest server nonce.
    pub fn server_nonce(&self) -> Vec<u8> {
        self.server_nonce.lock().clone()
    }

    fn set_server_nonce(&self, nonce: Vec<u8>) {
        *self.server_nonce.lock() = nonce;
    }

    /// Session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last request on this session.
    pub fn idle_time(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Builds a request header carrying the authentication token.
    pub fn request_header(&self, timeout_hint: Duration) -> RequestHeader {
        *self.last_activity.lock() = Instant::now();
        RequestHeader::with_token(self.authentication_token.clone(), timeout_hint)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("revised_timeout", &self.revised_timeout)
            .field("endpoint", &self.endpoint.url)
            .finish()
    }
}

/// Shared future resolving to the current session.
pub type SessionFuture = Shared<BoxFuture<'static, OpcUaResult<Arc<Session>>>>;

type SessionPromise = oneshot::Sender<OpcUaResult<Arc<Session>>>;

fn new_promise() -> (SessionPromise, SessionFuture) {
    let (tx, rx) = oneshot::channel();
    let future = async move {
        rx.await
            .unwrap_or_else(|_| Err(OpcUaError::from(SessionError::Stopped)))
    }
    .boxed()
    .shared();
    (tx, future)
}

// =============================================================================
// Listeners
// =============================================================================

/// How a session became active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionActivation {
    /// A new session was created; server-side subscriptions are not bound to it.
    Created,
    /// The existing session was re-activated on a new channel.
    Reactivated,
}

/// Observes session activation.
///
/// `on_session_active` is awaited before the session future resolves, so
/// work done here (e.g. transferring subscriptions) happens before callers
/// see the session. Requests must be issued with the given session directly.
#[async_trait]
pub trait SessionActivityListener: Send + Sync {
    /// The session is usable.
    async fn on_session_active(&self, _session: &Arc<Session>, _activation: SessionActivation) {}

    /// The session was discarded and will not come back.
    async fn on_session_inactive(&self, _session: &Arc<Session>) {}
}

type StateListener = Arc<dyn Fn(SessionState, SessionState) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    state: RwLock<Vec<StateListener>>,
    activity: RwLock<Vec<Arc<dyn SessionActivityListener>>>,
}

impl Listeners {
    fn activity(&self) -> Vec<Arc<dyn SessionActivityListener>> {
        self.activity.read().clone()
    }

    async fn notify_active(&self, session: &Arc<Session>, activation: SessionActivation) {
        for listener in self.activity() {
            listener.on_session_active(session, activation).await;
        }
    }

    async fn notify_inactive(&self, session: &Arc<Session>) {
        for listener in self.activity() {
            listener.on_session_inactive(session).await;
        }
    }
}

// =============================================================================
// Events
// =============================================================================

enum SessionEvent {
    CreateSessionRequested {
        reply: oneshot::Sender<SessionFuture>,
    },
    CreateSessionSuccess {
        generation: u64,
        session: Arc<Session>,
    },
    CreateSessionFailure {
        generation: u64,
        error: OpcUaError,
    },
    ActivateSessionSuccess {
        generation: u64,
        session: Arc<Session>,
        activation: SessionActivation,
    },
    ActivateSessionFailure {
        generation: u64,
        error: OpcUaError,
    },
    RetryCreate {
        generation: u64,
    },
    ChannelLost {
        reason: String,
    },
    KeepAliveFailure {
        generation: u64,
        error: OpcUaError,
    },
    CloseSessionRequested {
        reply: oneshot::Sender<OpcUaResult<()>>,
    },
    CloseSessionSuccess {
        generation: u64,
    },
}

impl SessionEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::CreateSessionRequested { .. } => "CreateSessionRequested",
            Self::CreateSessionSuccess { .. } => "CreateSessionSuccess",
            Self::CreateSessionFailure { .. } => "CreateSessionFailure",
            Self::ActivateSessionSuccess { .. } => "ActivateSessionSuccess",
            Self::ActivateSessionFailure { .. } => "ActivateSessionFailure",
            Self::RetryCreate { .. } => "RetryCreate",
            Self::ChannelLost { .. } => "ChannelLost",
            Self::KeepAliveFailure { .. } => "KeepAliveFailure",
            Self::CloseSessionRequested { .. } => "CloseSessionRequested",
            Self::CloseSessionSuccess { .. } => "CloseSessionSuccess",
        }
    }
}

// =============================================================================
// Collaborators
// =============================================================================

/// Everything the session machine talks to.
#[derive(Clone)]
pub struct SessionContext {
    /// Client configuration.
    pub config: Arc<ClientConfig>,
    /// Request correlator.
    pub correlator: Arc<RequestCorrelator>,
    /// Identity capability.
    pub identity: Arc<dyn IdentityProvider>,
    /// Certificate capability.
    pub validator: Arc<dyn CertificateValidator>,
    /// Recovery backoff.
    pub reconnect: Arc<dyn ReconnectPolicy>,
    /// Shared statistics.
    pub stats: Arc<ClientStats>,
    /// Execution context for spawned work.
    pub runtime: Handle,
}

#[derive(Clone, Default)]
struct FsmSnapshot {
    state: SessionState,
    future: Option<SessionFuture>,
    session: Option<Arc<Session>>,
}

// =============================================================================
// SessionFsm
// =============================================================================

/// Handle to the session state machine.
pub struct SessionFsm {
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: Arc<ArcSwap<FsmSnapshot>>,
    state_rx: watch::Receiver<SessionState>,
    listeners: Arc<Listeners>,
    cancel: CancellationToken,
}

impl SessionFsm {
    /// Starts the state machine on `context.runtime`.
    pub fn new(context: SessionContext) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Inactive);
        let snapshot = Arc::new(ArcSwap::from_pointee(FsmSnapshot::default()));
        let listeners = Arc::new(Listeners::default());
        let cancel = CancellationToken::new();

        let channel_events = context.correlator.subscribe_channel_events();
        context.runtime.spawn(forward_channel_loss(
            channel_events,
            events_tx.clone(),
            cancel.clone(),
        ));

        let runtime = context.runtime.clone();
        let actor = FsmActor {
            ctx: context,
            events: events_tx.clone(),
            snapshot: snapshot.clone(),
            state_tx,
            listeners: listeners.clone(),
            state: SessionState::Inactive,
            generation: 0,
            session: None,
            promise: None,
            future: None,
            recovering: false,
            attempt: 0,
            keep_alive: None,
            close_replies: Vec::new(),
            deferred: Vec::new(),
        };
        runtime.spawn(actor.run(events_rx, cancel.clone()));

        Self {
            events: events_tx,
            snapshot,
            state_rx,
            listeners,
            cancel,
        }
    }

    /// Returns the current session future, starting creation if needed.
    pub async fn session_future(&self) -> OpcUaResult<SessionFuture> {
        {
            let snapshot = self.snapshot.load();
            if snapshot.state.serves_current_future() {
                if let Some(future) = &snapshot.future {
                    return Ok(future.clone());
                }
            }
        }

        let (reply, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::CreateSessionRequested { reply })
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped.into())
    }

    /// Waits for a usable session.
    ///
    /// While the session is being reactivated this waits for the outcome:
    /// the session is returned once activated again, and a recreated
    /// session is awaited if reactivation fails. Activity listeners run
    /// before reactivation completes and must not call this.
    pub async fn session(&self) -> OpcUaResult<Arc<Session>> {
        let mut states = self.state_rx.clone();
        states
            .wait_for(|state| *state != SessionState::Reactivating)
            .await
            .map_err(|_| SessionError::Stopped)?;
        self.session_future().await?.await
    }

    /// Closes the session. Always succeeds locally.
    pub async fn close(&self) -> OpcUaResult<()> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::CloseSessionRequested { reply })
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| OpcUaError::from(SessionError::Stopped))?
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.snapshot.load().state
    }

    /// The active session, if any.
    pub fn current_session(&self) -> Option<Arc<Session>> {
        let snapshot = self.snapshot.load();
        match snapshot.state {
            SessionState::Active => snapshot.session.clone(),
            _ => None,
        }
    }

    /// Watches state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Registers a callback invoked with `(old, new)` on every transition.
    pub fn add_state_listener<F>(&self, listener: F)
    where
        F: Fn(SessionState, SessionState) + Send + Sync + 'static,
    {
        self.listeners.state.write().push(Arc::new(listener));
    }

    /// Registers an activity listener.
    pub fn add_activity_listener(&self, listener: Arc<dyn SessionActivityListener>) {
        self.listeners.activity.write().push(listener);
    }

    /// Returns `true` if both futures are the same instance.
    pub fn same_future(a: &SessionFuture, b: &SessionFuture) -> bool {
        a.ptr_eq(b)
    }
}

impl Drop for SessionFsm {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for SessionFsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFsm")
            .field("state", &self.state())
            .finish()
    }
}

async fn forward_channel_loss(
    mut channel_events: broadcast::Receiver<ChannelEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = channel_events.recv() => event,
        };
        match event {
            Ok(ChannelEvent::Lost { reason }) => {
                if events.send(SessionEvent::ChannelLost { reason }).is_err() {
                    break;
                }
            }
            Ok(ChannelEvent::Restored(_)) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Channel event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// =============================================================================
// Actor
// =============================================================================

struct FsmActor {
    ctx: SessionContext,
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: Arc<ArcSwap<FsmSnapshot>>,
    state_tx: watch::Sender<SessionState>,
    listeners: Arc<Listeners>,

    state: SessionState,
    generation: u64,
    session: Option<Arc<Session>>,
    promise: Option<SessionPromise>,
    future: Option<SessionFuture>,
    recovering: bool,
    attempt: u32,
    keep_alive: Option<CancellationToken>,
    close_replies: Vec<oneshot::Sender<OpcUaResult<()>>>,
    deferred: Vec<SessionEvent>,
}

impl FsmActor {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            trace!(event = event.name(), state = %self.state, "Session event");
            self.handle(event);
        }

        self.stop_keep_alive();
        self.fail_promise(SessionError::Stopped.into());
        debug!("Session state machine stopped");
    }

    fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::CreateSessionRequested { reply } => self.on_create_requested(reply),
            SessionEvent::CreateSessionSuccess {
                generation,
                session,
            } => {
                if self.is_current(generation, SessionState::Creating) {
                    self.spawn_activate(session, SessionActivation::Created);
                }
            }
            SessionEvent::CreateSessionFailure { generation, error }
            | SessionEvent::ActivateSessionFailure { generation, error }
                if self.is_current(generation, SessionState::Creating) =>
            {
                self.on_creation_failed(error);
            }
            SessionEvent::ActivateSessionFailure { generation, error } => {
                if self.is_current(generation, SessionState::Reactivating) {
                    self.on_reactivation_failed(error);
                }
            }
            SessionEvent::CreateSessionFailure { .. } => {}
            SessionEvent::ActivateSessionSuccess {
                generation,
                session,
                activation,
            } => {
                if generation == self.generation
                    && matches!(self.state, SessionState::Creating | SessionState::Reactivating)
                {
                    self.on_activated(session, activation);
                }
            }
            SessionEvent::RetryCreate { generation } => {
                if self.is_current(generation, SessionState::Creating) {
                    self.spawn_create();
                }
            }
            SessionEvent::ChannelLost { reason } => {
                if self.state == SessionState::Active {
                    info!(reason = %reason, "Channel lost, reactivating session");
                    self.begin_reactivation();
                }
            }
            SessionEvent::KeepAliveFailure { generation, error } => {
                if self.is_current(generation, SessionState::Active) {
                    warn!(error = %error, "Keep-alive failed, reactivating session");
                    self.begin_reactivation();
                }
            }
            SessionEvent::CloseSessionRequested { reply } => self.on_close_requested(reply),
            SessionEvent::CloseSessionSuccess { generation } => {
                if self.is_current(generation, SessionState::Closing) {
                    self.on_closed();
                }
            }
        }
    }

    fn is_current(&self, generation: u64, state: SessionState) -> bool {
        generation == self.generation && self.state == state
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn on_create_requested(&mut self, reply: oneshot::Sender<SessionFuture>) {
        match self.state {
            SessionState::Inactive | SessionState::Closed => {
                self.recovering = false;
                self.attempt = 0;
                let future = self.ensure_unresolved_future();
                self.generation += 1;
                self.transition(SessionState::Creating);
                self.spawn_create();
                let _ = reply.send(future);
            }
            SessionState::Creating | SessionState::Active | SessionState::Reactivating => {
                if let Some(future) = &self.future {
                    let _ = reply.send(future.clone());
                }
            }
            SessionState::Closing => {
                self.deferred
                    .push(SessionEvent::CreateSessionRequested { reply });
            }
        }
    }

    fn on_creation_failed(&mut self, error: OpcUaError) {
        if !self.recovering {
            debug!(error = %error, "Session creation failed");
            self.fail_promise(error);
            self.transition(SessionState::Inactive);
            return;
        }

        self.attempt += 1;
        match self.ctx.reconnect.next_delay(self.attempt) {
            RetryDecision::Retry(delay) => {
                warn!(
                    attempt = self.attempt,
                    delay = ?delay,
                    error = %error,
                    "Session recovery attempt failed, retrying"
                );
                let generation = self.generation;
                let events = self.events.clone();
                self.ctx.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(SessionEvent::RetryCreate { generation });
                });
            }
            RetryDecision::GiveUp => {
                warn!(attempts = self.attempt, error = %error, "Session recovery abandoned");
                self.fail_promise(
                    SessionError::RecoveryAbandoned {
                        attempts: self.attempt,
                    }
                    .into(),
                );
                self.recovering = false;
                self.transition(SessionState::Inactive);
            }
        }
    }

    fn on_activated(&mut self, session: Arc<Session>, activation: SessionActivation) {
        match activation {
            SessionActivation::Created => self.ctx.stats.record_session_created(),
            SessionActivation::Reactivated => self.ctx.stats.record_session_reactivated(),
        }
        info!(
            session_id = %session.session_id(),
            activation = ?activation,
            "Session active"
        );

        self.session = Some(session.clone());
        self.recovering = false;
        self.attempt = 0;
        if let Some(promise) = self.promise.take() {
            let _ = promise.send(Ok(session.clone()));
        }
        self.transition(SessionState::Active);
        self.start_keep_alive(session);
    }

    fn begin_reactivation(&mut self) {
        self.stop_keep_alive();
        self.generation += 1;
        self.transition(SessionState::Reactivating);
        match self.session.clone() {
            Some(session) => self.spawn_activate(session, SessionActivation::Reactivated),
            None => self.on_reactivation_failed(OpcUaError::from(SessionError::Closed)),
        }
    }

    fn on_reactivation_failed(&mut self, error: OpcUaError) {
        warn!(error = %error, "Reactivation failed, recreating session");
        if let Some(session) = self.session.take() {
            let listeners = self.listeners.clone();
            self.ctx
                .runtime
                .spawn(async move { listeners.notify_inactive(&session).await });
        }

        self.recovering = true;
        self.attempt = 0;
        self.ensure_unresolved_future();
        self.generation += 1;
        self.transition(SessionState::Creating);
        self.spawn_create();
    }

    fn on_close_requested(&mut self, reply: oneshot::Sender<OpcUaResult<()>>) {
        match self.state {
            SessionState::Inactive | SessionState::Closed => {
                self.transition(SessionState::Closed);
                let _ = reply.send(Ok(()));
            }
            SessionState::Closing => self.close_replies.push(reply),
            SessionState::Creating | SessionState::Active | SessionState::Reactivating => {
                self.close_replies.push(reply);
                self.stop_keep_alive();
                self.generation += 1;
                self.fail_promise(OpcUaError::session_closed());
                self.transition(SessionState::Closing);

                let session = self.session.take();
                let ctx = self.ctx.clone();
                let listeners = self.listeners.clone();
                let events = self.events.clone();
                let generation = self.generation;
                self.ctx.runtime.spawn(async move {
                    close_session(&ctx, session.as_ref()).await;
                    if let Some(session) = &session {
                        listeners.notify_inactive(session).await;
                    }
                    let _ = events.send(SessionEvent::CloseSessionSuccess { generation });
                });
            }
        }
    }

    fn on_closed(&mut self) {
        self.transition(SessionState::Closed);
        for reply in self.close_replies.drain(..) {
            let _ = reply.send(Ok(()));
        }
        // Requests that arrived while closing start a fresh session now.
        for event in self.deferred.drain(..) {
            let _ = self.events.send(event);
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Returns the current future, replacing it if it already resolved.
    fn ensure_unresolved_future(&mut self) -> SessionFuture {
        match &self.future {
            Some(future) if future.peek().is_none() && self.promise.is_some() => future.clone(),
            _ => {
                let (promise, future) = new_promise();
                self.promise = Some(promise);
                self.future = Some(future.clone());
                future
            }
        }
    }

    fn fail_promise(&mut self, error: OpcUaError) {
        if let Some(promise) = self.promise.take() {
            let _ = promise.send(Err(error));
        }
    }

    fn transition(&mut self, new_state: SessionState) {
        let old_state = self.state;
        self.state = new_state;

        let session = match new_state {
            SessionState::Active | SessionState::Reactivating => self.session.clone(),
            _ => None,
        };
        self.snapshot.store(Arc::new(FsmSnapshot {
            state: new_state,
            future: self.future.clone(),
            session,
        }));

        if old_state == new_state {
            return;
        }
        self.state_tx.send_replace(new_state);
        debug!(old_state = %old_state, new_state = %new_state, "Session state changed");

        let listeners = self.listeners.state.read().clone();
        for listener in listeners {
            listener(old_state, new_state);
        }
    }

    fn spawn_create(&self) {
        let ctx = self.ctx.clone();
        let events = self.events.clone();
        let generation = self.generation;
        self.ctx.runtime.spawn(async move {
            let event = match create_session(&ctx).await {
                Ok(session) => SessionEvent::CreateSessionSuccess {
                    generation,
                    session,
                },
                Err(error) => SessionEvent::CreateSessionFailure { generation, error },
            };
            let _ = events.send(event);
        });
    }

    fn spawn_activate(&self, session: Arc<Session>, activation: SessionActivation) {
        let ctx = self.ctx.clone();
        let events = self.events.clone();
        let listeners = self.listeners.clone();
        let generation = self.generation;
        self.ctx.runtime.spawn(async move {
            let event = match activate_session(&ctx, &session).await {
                Ok(()) => {
                    listeners.notify_active(&session, activation).await;
                    SessionEvent::ActivateSessionSuccess {
                        generation,
                        session,
                        activation,
                    }
                }
                Err(error) => SessionEvent::ActivateSessionFailure { generation, error },
            };
            let _ = events.send(event);
        });
    }

    fn start_keep_alive(&mut self, session: Arc<Session>) {
        self.stop_keep_alive();
        let token = CancellationToken::new();
        self.keep_alive = Some(token.clone());
        self.ctx.runtime.spawn(keep_alive(
            self.ctx.clone(),
            session,
            self.events.clone(),
            self.generation,
            token,
        ));
    }

    fn stop_keep_alive(&mut self) {
        if let Some(token) = self.keep_alive.take() {
            token.cancel();
        }
    }
}

// =============================================================================
// Service calls
// =============================================================================

fn client_nonce() -> Vec<u8> {
    let mut nonce = Uuid::new_v4().as_bytes().to_vec();
    nonce.extend_from_slice(Uuid::new_v4().as_bytes());
    nonce
}

async fn create_session(ctx: &SessionContext) -> OpcUaResult<Arc<Session>> {
    let channel = ctx.correlator.ensure_channel().await?;
    let config = &ctx.config;

    let request = CreateSessionRequest {
        client_description: ApplicationDescription {
            application_uri: config.application_uri.clone(),
            application_name: config.application_name.clone(),
        },
        endpoint_url: config.endpoint.clone(),
        session_name: config.session_name.clone(),
        client_nonce: client_nonce(),
        requested_session_timeout: config.session_timeout,
        max_response_message_size: config.max_response_message_size,
    };

    let response = ctx
        .correlator
        .send(RequestMessage::new(
            RequestHeader::new(config.request_timeout),
            request,
        ))
        .await
        .map_err(|e| map_fault(e, |status| SessionError::CreationFailed { status }))?;
    let body = expect_response!(response, CreateSession)?;

    if !channel.endpoint.security_mode.is_none() {
        ctx.validator
            .validate(std::slice::from_ref(&body.server_certificate))
            .await?;
    }

    debug!(session_id = %body.session_id, revised_timeout = ?body.revised_session_timeout, "Session created");
    Ok(Arc::new(Session::from_response(body, channel.endpoint)))
}

async fn activate_session(ctx: &SessionContext, session: &Arc<Session>) -> OpcUaResult<()> {
    let channel = ctx.correlator.ensure_channel().await?;
    let (token, token_signature) = ctx
        .identity
        .identity_token(&channel.endpoint, &session.server_nonce())
        .await?;

    let request = ActivateSessionRequest {
        client_signature: SignatureData::default(),
        user_identity_token: token,
        user_token_signature: token_signature,
        locale_ids: Vec::new(),
    };

    let response = ctx
        .correlator
        .send(RequestMessage::new(
            session.request_header(ctx.config.request_timeout),
            request,
        ))
        .await
        .map_err(|e| map_fault(e, |status| SessionError::ActivationFailed { status }))?;
    let body = expect_response!(response, ActivateSession)?;
    session.set_server_nonce(body.server_nonce);
    Ok(())
}

async fn close_session(ctx: &SessionContext, session: Option<&Arc<Session>>) {
    // Publishes are abandoned without waiting for the server.
    let failed = ctx.correlator.fail_pending(|kind| match kind {
        RequestKind::Publish => OpcUaError::session_closed(),
        _ => OpcUaError::channel_closed("session closing"),
    });
    if failed > 0 {
        debug!(failed, "Failed in-flight requests on close");
    }

    let Some(session) = session else {
        return;
    };
    if !ctx.correlator.is_connected() {
        debug!("Channel down, closing session locally");
        return;
    }

    let request = RequestMessage::new(
        session.request_header(ctx.config.request_timeout),
        CloseSessionRequest {
            delete_subscriptions: true,
        },
    );
    if let Err(error) = ctx.correlator.send(request).await {
        debug!(error = %error, "CloseSession failed, closing locally");
    }
}

fn map_fault<F>(error: OpcUaError, to_session_error: F) -> OpcUaError
where
    F: FnOnce(crate::types::StatusCode) -> SessionError,
{
    match error {
        OpcUaError::Service(ServiceError::Fault { status, .. }) if !status.is_channel_closed() => {
            to_session_error(status).into()
        }
        other => other,
    }
}

async fn keep_alive(
    ctx: SessionContext,
    session: Arc<Session>,
    events: mpsc::UnboundedSender<SessionEvent>,
    generation: u64,
    cancel: CancellationToken,
) {
    let interval = ctx.config.keep_alive_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let request = RequestMessage::new(
            session.request_header(ctx.config.keep_alive_timeout),
            ReadRequest {
                max_age: Duration::ZERO,
                timestamps_to_return: TimestampsToReturn::Neither,
                nodes_to_read: vec![ReadValueId::value_of(NodeId::SERVER_STATUS_STATE)],
            },
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = ctx.correlator.send(request) => result,
        };

        match result {
            Ok(_) => {
                if failures > 0 {
                    debug!(failures, "Keep-alive recovered");
                }
                failures = 0;
            }
            Err(error) => {
                failures += 1;
                debug!(failures, error = %error, "Keep-alive read failed");
                if error.is_session_invalid() || failures > ctx.config.keep_alive_failures_allowed {
                    let error = if error.is_session_invalid() {
                        error
                    } else {
                        TimeoutError::KeepAlive { failures }.into()
                    };
                    let _ = events.send(SessionEvent::KeepAliveFailure { generation, error });
                    return;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
