// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Mock Implementations
//!
//! An in-memory OPC UA server behind [`SecureChannelTransport`], plus
//! recording doubles for the client's listener traits.
//!
//! ## Design Principles
//!
//! - Configurable behavior for different test scenarios
//! - Recording of interactions for verification
//! - Thread-safe for concurrent testing
//! - Easy to set up fault injection

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use ualink_client::error::{OpcUaError, OpcUaResult, TransportError};
use ualink_client::message::{
    ActivateSessionResponse, CloseSessionResponse, CreateMonitoredItemsResponse,
    CreateSessionResponse, CreateSubscriptionResponse, DeleteMonitoredItemsResponse,
    DeleteSubscriptionsResponse, IdentityToken, ModifyMonitoredItemsResponse,
    ModifySubscriptionResponse, MonitoredItemCreateResult, MonitoredItemModifyResult,
    MonitoredItemNotification, NotificationData, NotificationMessage, PublishResponse,
    ReadResponse, RepublishResponse, RequestKind, RequestMessage, ResponseMessage,
    SetMonitoringModeResponse, SetPublishingModeResponse, TransferResult,
    TransferSubscriptionsResponse, UaRequest, WriteResponse,
};
use ualink_client::session::{Session, SessionActivation, SessionActivityListener};
use ualink_client::transport::{ChannelInfo, SecureChannelTransport, TransportEvent};
use ualink_client::types::{
    DataValue, EndpointDescription, MonitoringMode, NodeId, SecurityMode, SecurityPolicy,
    StatusCode, Variant,
};

// =============================================================================
// Server Behavior
// =============================================================================

/// Knobs of the in-memory server.
#[derive(Debug, Clone)]
pub struct ServerBehavior {
    /// Endpoint reported for every channel.
    pub endpoint: EndpointDescription,

    /// Certificate returned by CreateSession.
    pub server_certificate: Vec<u8>,

    /// Whether TransferSubscriptions is implemented.
    pub transfer_supported: bool,

    /// Queue the current value when a reporting item is created.
    pub send_initial_values: bool,

    /// Publish requests the server will hold before answering
    /// `Bad_TooManyPublishRequests`.
    pub max_parked_publishes: Option<usize>,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            endpoint: EndpointDescription {
                url: "opc.tcp://localhost:4840".to_string(),
                security_policy: SecurityPolicy::None,
                security_mode: SecurityMode::None,
                server_certificate: Vec::new(),
            },
            server_certificate: vec![0x30, 0x82, 0x01, 0x0A],
            transfer_supported: true,
            send_initial_values: false,
            max_parked_publishes: None,
        }
    }
}

impl ServerBehavior {
    /// Disables TransferSubscriptions.
    pub fn without_transfer(mut self) -> Self {
        self.transfer_supported = false;
        self
    }

    /// Queues initial values for new reporting items.
    pub fn with_initial_values(mut self) -> Self {
        self.send_initial_values = true;
        self
    }

    /// Caps outstanding Publish requests.
    pub fn with_max_parked_publishes(mut self, max: usize) -> Self {
        self.max_parked_publishes = Some(max);
        self
    }

    /// Reports a secured endpoint.
    pub fn secured(mut self, mode: SecurityMode, policy: SecurityPolicy) -> Self {
        self.endpoint.security_mode = mode;
        self.endpoint.security_policy = policy;
        self
    }
}

// =============================================================================
// Server State
// =============================================================================

#[derive(Debug)]
struct ServerSession {
    session_id: NodeId,
    activated: bool,
}

#[derive(Debug, Clone)]
struct ServerItem {
    client_handle: u32,
    node_id: NodeId,
    mode: MonitoringMode,
}

#[derive(Debug)]
struct ServerSubscription {
    owner: NodeId,
    publishing_enabled: bool,
    next_sequence_number: u32,
    items: BTreeMap<u32, ServerItem>,
    ready: VecDeque<NotificationMessage>,
    retransmission: BTreeMap<u32, NotificationMessage>,
}

impl ServerSubscription {
    fn new(owner: NodeId, publishing_enabled: bool) -> Self {
        Self {
            owner,
            publishing_enabled,
            next_sequence_number: 1,
            items: BTreeMap::new(),
            ready: VecDeque::new(),
            retransmission: BTreeMap::new(),
        }
    }

    /// Assigns the next sequence number. A lost message is numbered but
    /// neither queued nor retained.
    fn enqueue(&mut self, notification_data: Vec<NotificationData>, lost: bool) -> u32 {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;
        let message = NotificationMessage {
            sequence_number,
            publish_time: Utc::now(),
            notification_data,
        };
        if !lost {
            self.retransmission.insert(sequence_number, message.clone());
            self.ready.push_back(message);
        }
        sequence_number
    }

    fn changes_for(&self, node_id: &NodeId, value: &DataValue) -> Vec<MonitoredItemNotification> {
        self.items
            .values()
            .filter(|item| &item.node_id == node_id && item.mode == MonitoringMode::Reporting)
            .map(|item| MonitoredItemNotification {
                client_handle: item.client_handle,
                value: value.clone(),
            })
            .collect()
    }
}

#[derive(Debug)]
struct ParkedPublish {
    request_id: u32,
    token: NodeId,
    results: Vec<StatusCode>,
}

#[derive(Default)]
struct ServerState {
    sink: Option<mpsc::UnboundedSender<TransportEvent>>,
    connected: bool,
    channel_id: u32,
    connects: usize,
    refuse_connections: bool,
    hold_publishes: bool,
    next_id: u32,
    next_subscription_id: u32,
    sessions: HashMap<NodeId, ServerSession>,
    subscriptions: BTreeMap<u32, ServerSubscription>,
    values: HashMap<NodeId, DataValue>,
    parked: VecDeque<ParkedPublish>,
    requests: HashMap<RequestKind, usize>,
    faults: HashMap<RequestKind, VecDeque<StatusCode>>,
    unresponsive: HashSet<RequestKind>,
    lose_next: HashSet<u32>,
    identities: Vec<IdentityToken>,
}

impl ServerState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Subscription ids have their own counter and never collide with a
    /// live subscription.
    fn next_subscription_id(&mut self) -> u32 {
        loop {
            self.next_subscription_id = self.next_subscription_id.wrapping_add(1).max(1);
            if !self.subscriptions.contains_key(&self.next_subscription_id) {
                return self.next_subscription_id;
            }
        }
    }

    fn respond(&self, request_id: u32, response: ResponseMessage) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(TransportEvent::Response {
                request_id,
                response,
            });
        }
    }

    fn check_session(&self, token: &NodeId) -> Result<(), StatusCode> {
        match self.sessions.get(token) {
            Some(session) if session.activated => Ok(()),
            Some(_) => Err(StatusCode::BAD_SESSION_NOT_ACTIVATED),
            None => Err(StatusCode::BAD_SESSION_ID_INVALID),
        }
    }

    fn owned_subscription(&mut self, token: &NodeId, id: u32) -> Option<&mut ServerSubscription> {
        self.subscriptions
            .get_mut(&id)
            .filter(|subscription| &subscription.owner == token)
    }

    fn has_subscriptions(&self, token: &NodeId) -> bool {
        self.subscriptions.values().any(|s| &s.owner == token)
    }

    fn notify_change(&mut self, node_id: &NodeId, value: &DataValue) {
        for (id, subscription) in self.subscriptions.iter_mut() {
            if !subscription.publishing_enabled {
                continue;
            }
            let changes = subscription.changes_for(node_id, value);
            if changes.is_empty() {
                continue;
            }
            let lost = self.lose_next.remove(id);
            subscription.enqueue(vec![NotificationData::DataChange(changes)], lost);
        }
    }

    /// Answers parked Publish requests for which a message is ready.
    fn dispatch_publishes(&mut self) {
        if self.hold_publishes {
            return;
        }

        let mut expired = false;
        let mut index = 0;
        while index < self.parked.len() {
            let token = self.parked[index].token.clone();
            let ready = self
                .subscriptions
                .iter_mut()
                .find(|(_, s)| s.owner == token && !s.ready.is_empty());

            let Some((&subscription_id, subscription)) = ready else {
                index += 1;
                continue;
            };
            let Some(message) = subscription.ready.pop_front() else {
                index += 1;
                continue;
            };
            let available_sequence_numbers = subscription.retransmission.keys().copied().collect();
            let timed_out = message.notification_data.iter().any(|data| {
                matches!(data, NotificationData::StatusChange(s) if s.matches(StatusCode::BAD_TIMEOUT))
            });

            let Some(parked) = self.parked.remove(index) else {
                break;
            };
            if timed_out {
                self.subscriptions.remove(&subscription_id);
                expired = true;
            }
            self.respond(
                parked.request_id,
                ResponseMessage::new(
                    parked.request_id,
                    PublishResponse {
                        subscription_id,
                        available_sequence_numbers,
                        more_notifications: false,
                        notification_message: message,
                        results: parked.results,
                    },
                ),
            );
        }

        if expired {
            self.release_idle_publishes();
        }
    }

    /// Fails parked Publish requests of sessions left without subscriptions.
    fn release_idle_publishes(&mut self) {
        let parked = std::mem::take(&mut self.parked);
        for publish in parked {
            if self.has_subscriptions(&publish.token) {
                self.parked.push_back(publish);
            } else {
                self.respond(
                    publish.request_id,
                    ResponseMessage::fault(publish.request_id, StatusCode::BAD_NO_SUBSCRIPTION),
                );
            }
        }
    }

    fn lose_channel(&mut self) {
        self.connected = false;
        self.parked.clear();
        for session in self.sessions.values_mut() {
            session.activated = false;
        }
    }
}

// =============================================================================
// MockServer
// =============================================================================

/// In-memory OPC UA server speaking the client's message model.
///
/// Implements every service the client issues. Sessions survive a channel
/// loss and must be re-activated; [`restart`](Self::restart) forgets them.
pub struct MockServer {
    behavior: ServerBehavior,
    state: Mutex<ServerState>,
}

impl MockServer {
    /// Creates a server with default behavior.
    pub fn new() -> Arc<Self> {
        Self::with_behavior(ServerBehavior::default())
    }

    /// Creates a server with `behavior`.
    pub fn with_behavior(behavior: ServerBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            state: Mutex::new(ServerState::default()),
        })
    }

    /// Endpoint URL.
    pub fn endpoint_url(&self) -> &str {
        &self.behavior.endpoint.url
    }

    // =========================================================================
    // Address space
    // =========================================================================

    /// Sets a variable without notifying monitored items.
    pub fn set_value(&self, node_id: NodeId, value: impl Into<Variant>) {
        self.state.lock().values.insert(node_id, DataValue::new(value));
    }

    /// Current value of a variable.
    pub fn value(&self, node_id: &NodeId) -> Option<DataValue> {
        self.state.lock().values.get(node_id).cloned()
    }

    /// Changes a variable server-side and notifies monitored items.
    pub fn write(&self, node_id: NodeId, value: impl Into<Variant>) {
        let value = DataValue::new(value);
        let mut state = self.state.lock();
        state.notify_change(&node_id, &value);
        state.values.insert(node_id, value);
        state.dispatch_publishes();
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Drops the channel and reports the loss to the client.
    pub fn drop_channel(&self, reason: &str) {
        let mut state = self.state.lock();
        state.lose_channel();
        if let Some(sink) = &state.sink {
            let _ = sink.send(TransportEvent::ChannelLost {
                reason: reason.to_string(),
            });
        }
    }

    /// Drops the channel and forgets every session. Subscriptions survive
    /// only if `keep_subscriptions` is set.
    pub fn restart(&self, keep_subscriptions: bool) {
        let mut state = self.state.lock();
        state.lose_channel();
        state.sessions.clear();
        if !keep_subscriptions {
            state.subscriptions.clear();
        }
        if let Some(sink) = &state.sink {
            let _ = sink.send(TransportEvent::ChannelLost {
                reason: "server restart".to_string(),
            });
        }
    }

    /// Numbers subscriptions created from now on starting at `first`, as a
    /// restarted server that reuses ids would.
    pub fn number_subscriptions_from(&self, first: u32) {
        self.state.lock().next_subscription_id = first.saturating_sub(1);
    }

    /// Refuses (or accepts again) new channels.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Answers the next request of `kind` with a service fault.
    pub fn fail_next(&self, kind: RequestKind, status: StatusCode) {
        self.state
            .lock()
            .faults
            .entry(kind)
            .or_default()
            .push_back(status);
    }

    /// Silently swallows requests of `kind` while set.
    pub fn set_unresponsive(&self, kind: RequestKind, unresponsive: bool) {
        let mut state = self.state.lock();
        if unresponsive {
            state.unresponsive.insert(kind);
        } else {
            state.unresponsive.remove(&kind);
        }
    }

    /// The next message of `subscription_id` is numbered but never sent
    /// nor retained for republish.
    pub fn lose_next_message(&self, subscription_id: u32) {
        self.state.lock().lose_next.insert(subscription_id);
    }

    /// Holds Publish responses until [`release_publishes`](Self::release_publishes).
    pub fn hold_publishes(&self) {
        self.state.lock().hold_publishes = true;
    }

    /// Answers held Publish requests.
    pub fn release_publishes(&self) {
        let mut state = self.state.lock();
        state.hold_publishes = false;
        state.dispatch_publishes();
    }

    /// Reverses the queue of ready messages, so they go out newest first.
    pub fn reverse_ready(&self, subscription_id: u32) {
        if let Some(subscription) = self.state.lock().subscriptions.get_mut(&subscription_id) {
            let reversed = subscription.ready.drain(..).rev().collect();
            subscription.ready = reversed;
        }
    }

    /// Queues a keep-alive for `subscription_id`.
    pub fn send_keep_alive(&self, subscription_id: u32) {
        let mut state = self.state.lock();
        if let Some(subscription) = state.subscriptions.get_mut(&subscription_id) {
            let keep_alive = NotificationMessage::keep_alive(subscription.next_sequence_number);
            subscription.ready.push_back(keep_alive);
        }
        state.dispatch_publishes();
    }

    /// Expires a subscription: a `Bad_Timeout` status change is queued and the
    /// subscription is removed once it has been published.
    pub fn expire_subscription(&self, subscription_id: u32) {
        let mut state = self.state.lock();
        if let Some(subscription) = state.subscriptions.get_mut(&subscription_id) {
            subscription.enqueue(vec![NotificationData::StatusChange(StatusCode::BAD_TIMEOUT)], false);
        }
        state.dispatch_publishes();
    }

    /// Creates a subscription monitoring `node_id` for the active session
    /// without the client asking, as after a lost CreateSubscription
    /// response. Returns its id.
    pub fn add_orphan_subscription(&self, node_id: NodeId, client_handle: u32) -> u32 {
        let mut state = self.state.lock();
        let owner = state
            .sessions
            .iter()
            .find(|(_, session)| session.activated)
            .map(|(token, _)| token.clone())
            .expect("an active session");
        let subscription_id = state.next_subscription_id();
        let monitored_item_id = state.next_id();

        let mut subscription = ServerSubscription::new(owner, true);
        subscription.items.insert(
            monitored_item_id,
            ServerItem {
                client_handle,
                node_id,
                mode: MonitoringMode::Reporting,
            },
        );
        state.subscriptions.insert(subscription_id, subscription);
        subscription_id
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Number of requests received for `kind`.
    pub fn request_count(&self, kind: RequestKind) -> usize {
        self.state.lock().requests.get(&kind).copied().unwrap_or(0)
    }

    /// Number of channel opens.
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Live sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Subscription ids, ascending.
    pub fn subscription_ids(&self) -> Vec<u32> {
        self.state.lock().subscriptions.keys().copied().collect()
    }

    /// Distinct sessions owning subscriptions.
    pub fn subscription_owners(&self) -> HashSet<NodeId> {
        self.state
            .lock()
            .subscriptions
            .values()
            .map(|s| s.owner.clone())
            .collect()
    }

    /// Client handles of the items of `subscription_id`, ascending.
    pub fn client_handles(&self, subscription_id: u32) -> Vec<u32> {
        let state = self.state.lock();
        let mut handles: Vec<u32> = state
            .subscriptions
            .get(&subscription_id)
            .map(|s| s.items.values().map(|i| i.client_handle).collect())
            .unwrap_or_default();
        handles.sort_unstable();
        handles
    }

    /// Messages retained for republish.
    pub fn retained_sequence_numbers(&self, subscription_id: u32) -> Vec<u32> {
        self.state
            .lock()
            .subscriptions
            .get(&subscription_id)
            .map(|s| s.retransmission.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Publish requests held by the server.
    pub fn parked_publishes(&self) -> usize {
        self.state.lock().parked.len()
    }

    /// Identity tokens presented in ActivateSession, in order.
    pub fn identities(&self) -> Vec<IdentityToken> {
        self.state.lock().identities.clone()
    }

    fn channel_info(&self, state: &ServerState) -> ChannelInfo {
        ChannelInfo {
            channel_id: state.channel_id,
            token_id: 1,
            token_expires_at: Utc::now() + ChronoDuration::hours(1),
            endpoint: self.behavior.endpoint.clone(),
        }
    }

    // =========================================================================
    // Services
    // =========================================================================

    fn handle(&self, state: &mut ServerState, request_id: u32, request: RequestMessage) {
        let kind = request.kind();
        *state.requests.entry(kind).or_insert(0) += 1;

        if state.unresponsive.contains(&kind) {
            return;
        }
        if let Some(status) = state.faults.get_mut(&kind).and_then(VecDeque::pop_front) {
            state.respond(request_id, ResponseMessage::fault(request_id, status));
            return;
        }

        let token = request.header.authentication_token.clone();
        let needs_session = !matches!(kind, RequestKind::CreateSession | RequestKind::ActivateSession);
        if needs_session {
            if let Err(status) = state.check_session(&token) {
                state.respond(request_id, ResponseMessage::fault(request_id, status));
                return;
            }
        }

        let response = match request.body {
            UaRequest::CreateSession(body) => {
                let n = state.next_id();
                let session_id = NodeId::numeric(1, n);
                let authentication_token = NodeId::numeric(0, 100_000 + n);
                state.sessions.insert(
                    authentication_token.clone(),
                    ServerSession {
                        session_id: session_id.clone(),
                        activated: false,
                    },
                );
                ResponseMessage::new(
                    request_id,
                    CreateSessionResponse {
                        session_id,
                        authentication_token,
                        revised_session_timeout: body.requested_session_timeout,
                        server_nonce: vec![n as u8; 32],
                        server_certificate: self.behavior.server_certificate.clone(),
                        server_endpoints: vec![self.behavior.endpoint.clone()],
                        max_request_message_size: 0,
                    },
                )
            }

            UaRequest::ActivateSession(body) => match state.sessions.get_mut(&token) {
                Some(session) => {
                    session.activated = true;
                    let nonce = session.session_id.to_opc_string().into_bytes();
                    state.identities.push(body.user_identity_token);
                    ResponseMessage::new(
                        request_id,
                        ActivateSessionResponse {
                            server_nonce: nonce,
                            results: Vec::new(),
                        },
                    )
                }
                None => ResponseMessage::fault(request_id, StatusCode::BAD_SESSION_ID_INVALID),
            },

            UaRequest::CloseSession(body) => {
                state.sessions.remove(&token);
                if body.delete_subscriptions {
                    state.subscriptions.retain(|_, s| s.owner != token);
                }
                state.parked.retain(|p| p.token != token);
                ResponseMessage::new(request_id, CloseSessionResponse)
            }

            UaRequest::Read(body) => {
                let results = body
                    .nodes_to_read
                    .iter()
                    .map(|read| {
                        if read.node_id == NodeId::SERVER_STATUS_STATE {
                            DataValue::new(0)
                        } else {
                            state
                                .values
                                .get(&read.node_id)
                                .cloned()
                                .unwrap_or_else(|| DataValue::with_status(StatusCode::BAD_NODE_ID_UNKNOWN))
                        }
                    })
                    .collect();
                ResponseMessage::new(request_id, ReadResponse { results })
            }

            UaRequest::Write(body) => {
                let mut results = Vec::with_capacity(body.nodes_to_write.len());
                for write in body.nodes_to_write {
                    if state.values.contains_key(&write.node_id) {
                        state.notify_change(&write.node_id, &write.value);
                        state.values.insert(write.node_id, write.value);
                        results.push(StatusCode::GOOD);
                    } else {
                        results.push(StatusCode::BAD_NODE_ID_UNKNOWN);
                    }
                }
                state.respond(request_id, ResponseMessage::new(request_id, WriteResponse { results }));
                state.dispatch_publishes();
                return;
            }

            UaRequest::CreateSubscription(body) => {
                let subscription_id = state.next_subscription_id();
                state.subscriptions.insert(
                    subscription_id,
                    ServerSubscription::new(token, body.publishing_enabled),
                );
                ResponseMessage::new(
                    request_id,
                    CreateSubscriptionResponse {
                        subscription_id,
                        revised_publishing_interval: body.requested_publishing_interval,
                        revised_lifetime_count: body.requested_lifetime_count,
                        revised_max_keep_alive_count: body.requested_max_keep_alive_count,
                    },
                )
            }

            UaRequest::ModifySubscription(body) => {
                if state.owned_subscription(&token, body.subscription_id).is_some() {
                    ResponseMessage::new(
                        request_id,
                        ModifySubscriptionResponse {
                            revised_publishing_interval: body.requested_publishing_interval,
                            revised_lifetime_count: body.requested_lifetime_count,
                            revised_max_keep_alive_count: body.requested_max_keep_alive_count,
                        },
                    )
                } else {
                    ResponseMessage::fault(request_id, StatusCode::BAD_SUBSCRIPTION_ID_INVALID)
                }
            }

            UaRequest::SetPublishingMode(body) => {
                let results = body
                    .subscription_ids
                    .iter()
                    .map(|id| match state.owned_subscription(&token, *id) {
                        Some(subscription) => {
                            subscription.publishing_enabled = body.publishing_enabled;
                            StatusCode::GOOD
                        }
                        None => StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
                    })
                    .collect();
                ResponseMessage::new(request_id, SetPublishingModeResponse { results })
            }

            UaRequest::DeleteSubscriptions(body) => {
                let results = body
                    .subscription_ids
                    .iter()
                    .map(|id| {
                        if state.owned_subscription(&token, *id).is_some() {
                            state.subscriptions.remove(id);
                            StatusCode::GOOD
                        } else {
                            StatusCode::BAD_SUBSCRIPTION_ID_INVALID
                        }
                    })
                    .collect();
                state.respond(
                    request_id,
                    ResponseMessage::new(request_id, DeleteSubscriptionsResponse { results }),
                );
                state.release_idle_publishes();
                return;
            }

            UaRequest::TransferSubscriptions(body) => {
                if !self.behavior.transfer_supported {
                    ResponseMessage::fault(request_id, StatusCode::BAD_SERVICE_UNSUPPORTED)
                } else {
                    let results = body
                        .subscription_ids
                        .iter()
                        .map(|id| match state.subscriptions.get_mut(id) {
                            Some(subscription) => {
                                subscription.owner = token.clone();
                                TransferResult {
                                    status_code: StatusCode::GOOD,
                                    available_sequence_numbers: subscription
                                        .retransmission
                                        .keys()
                                        .copied()
                                        .collect(),
                                }
                            }
                            None => TransferResult {
                                status_code: StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
                                available_sequence_numbers: Vec::new(),
                            },
                        })
                        .collect();
                    ResponseMessage::new(request_id, TransferSubscriptionsResponse { results })
                }
            }

            UaRequest::CreateMonitoredItems(body) => {
                let send_initial = self.behavior.send_initial_values;
                let mut ids = Vec::with_capacity(body.items_to_create.len());
                for _ in &body.items_to_create {
                    ids.push(state.next_id());
                }
                let values = state.values.clone();
                match state.owned_subscription(&token, body.subscription_id) {
                    None => ResponseMessage::fault(request_id, StatusCode::BAD_SUBSCRIPTION_ID_INVALID),
                    Some(subscription) => {
                        let mut initial = Vec::new();
                        let results = body
                            .items_to_create
                            .into_iter()
                            .zip(ids)
                            .map(|(create, monitored_item_id)| {
                                let node_id = create.item_to_monitor.node_id.clone();
                                let Some(value) = values.get(&node_id) else {
                                    return MonitoredItemCreateResult {
                                        status_code: StatusCode::BAD_NODE_ID_UNKNOWN,
                                        monitored_item_id: 0,
                                        revised_sampling_interval: Default::default(),
                                        revised_queue_size: 0,
                                    };
                                };
                                let client_handle = create.requested_parameters.client_handle;
                                if send_initial && create.monitoring_mode == MonitoringMode::Reporting {
                                    initial.push(MonitoredItemNotification {
                                        client_handle,
                                        value: value.clone(),
                                    });
                                }
                                subscription.items.insert(
                                    monitored_item_id,
                                    ServerItem {
                                        client_handle,
                                        node_id,
                                        mode: create.monitoring_mode,
                                    },
                                );
                                MonitoredItemCreateResult {
                                    status_code: StatusCode::GOOD,
                                    monitored_item_id,
                                    revised_sampling_interval: create.requested_parameters.sampling_interval,
                                    revised_queue_size: create.requested_parameters.queue_size.max(1),
                                }
                            })
                            .collect();
                        if !initial.is_empty() {
                            subscription.enqueue(vec![NotificationData::DataChange(initial)], false);
                        }
                        state.respond(
                            request_id,
                            ResponseMessage::new(request_id, CreateMonitoredItemsResponse { results }),
                        );
                        state.dispatch_publishes();
                        return;
                    }
                }
            }

            UaRequest::ModifyMonitoredItems(body) => {
                match state.owned_subscription(&token, body.subscription_id) {
                    None => ResponseMessage::fault(request_id, StatusCode::BAD_SUBSCRIPTION_ID_INVALID),
                    Some(subscription) => {
                        let results = body
                            .items_to_modify
                            .iter()
                            .map(|modify| match subscription.items.get_mut(&modify.monitored_item_id) {
                                Some(item) => {
                                    item.client_handle = modify.requested_parameters.client_handle;
                                    MonitoredItemModifyResult {
                                        status_code: StatusCode::GOOD,
                                        revised_sampling_interval: modify.requested_parameters.sampling_interval,
                                        revised_queue_size: modify.requested_parameters.queue_size.max(1),
                                    }
                                }
                                None => MonitoredItemModifyResult {
                                    status_code: StatusCode::BAD_MONITORED_ITEM_ID_INVALID,
                                    revised_sampling_interval: Default::default(),
                                    revised_queue_size: 0,
                                },
                            })
                            .collect();
                        ResponseMessage::new(request_id, ModifyMonitoredItemsResponse { results })
                    }
                }
            }

            UaRequest::SetMonitoringMode(body) => {
                match state.owned_subscription(&token, body.subscription_id) {
                    None => ResponseMessage::fault(request_id, StatusCode::BAD_SUBSCRIPTION_ID_INVALID),
                    Some(subscription) => {
                        let results = body
                            .monitored_item_ids
                            .iter()
                            .map(|id| match subscription.items.get_mut(id) {
                                Some(item) => {
                                    item.mode = body.monitoring_mode;
                                    StatusCode::GOOD
                                }
                                None => StatusCode::BAD_MONITORED_ITEM_ID_INVALID,
                            })
                            .collect();
                        ResponseMessage::new(request_id, SetMonitoringModeResponse { results })
                    }
                }
            }

            UaRequest::DeleteMonitoredItems(body) => {
                match state.owned_subscription(&token, body.subscription_id) {
                    None => ResponseMessage::fault(request_id, StatusCode::BAD_SUBSCRIPTION_ID_INVALID),
                    Some(subscription) => {
                        let results = body
                            .monitored_item_ids
                            .iter()
                            .map(|id| match subscription.items.remove(id) {
                                Some(_) => StatusCode::GOOD,
                                None => StatusCode::BAD_MONITORED_ITEM_ID_INVALID,
                            })
                            .collect();
                        ResponseMessage::new(request_id, DeleteMonitoredItemsResponse { results })
                    }
                }
            }

            UaRequest::Publish(body) => {
                let results = body
                    .subscription_acknowledgements
                    .iter()
                    .map(|ack| match state.owned_subscription(&token, ack.subscription_id) {
                        Some(subscription) => {
                            if subscription.retransmission.remove(&ack.sequence_number).is_some() {
                                StatusCode::GOOD
                            } else {
                                StatusCode::BAD_SEQUENCE_NUMBER_UNKNOWN
                            }
                        }
                        None => StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
                    })
                    .collect();

                if !state.has_subscriptions(&token) {
                    ResponseMessage::fault(request_id, StatusCode::BAD_NO_SUBSCRIPTION)
                } else if self
                    .behavior
                    .max_parked_publishes
                    .is_some_and(|max| state.parked.len() >= max)
                {
                    ResponseMessage::fault(request_id, StatusCode::BAD_TOO_MANY_PUBLISH_REQUESTS)
                } else {
                    state.parked.push_back(ParkedPublish {
                        request_id,
                        token,
                        results,
                    });
                    state.dispatch_publishes();
                    return;
                }
            }

            UaRequest::Republish(body) => {
                let message = state
                    .owned_subscription(&token, body.subscription_id)
                    .and_then(|s| s.retransmission.get(&body.retransmit_sequence_number).cloned());
                match message {
                    Some(notification_message) => ResponseMessage::new(
                        request_id,
                        RepublishResponse {
                            notification_message,
                        },
                    ),
                    None => ResponseMessage::fault(request_id, StatusCode::BAD_MESSAGE_NOT_AVAILABLE),
                }
            }
        };

        state.respond(request_id, response);
    }
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockServer")
            .field("connected", &state.connected)
            .field("sessions", &state.sessions.len())
            .field("subscriptions", &state.subscriptions.len())
            .field("parked", &state.parked.len())
            .finish()
    }
}

#[async_trait]
impl SecureChannelTransport for MockServer {
    async fn connect(&self) -> OpcUaResult<ChannelInfo> {
        let mut state = self.state.lock();
        state.connects += 1;
        if state.refuse_connections {
            return Err(TransportError::refused(self.endpoint_url(), "refused by test").into());
        }
        if !state.connected {
            state.connected = true;
            state.channel_id += 1;
        }
        Ok(self.channel_info(&state))
    }

    async fn disconnect(&self) -> OpcUaResult<()> {
        self.state.lock().lose_channel();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn transmit(&self, request_id: u32, request: RequestMessage) -> OpcUaResult<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(OpcUaError::channel_closed("no channel"));
        }
        self.handle(&mut state, request_id, request);
        Ok(())
    }

    fn attach(&self, sink: mpsc::UnboundedSender<TransportEvent>) {
        self.state.lock().sink = Some(sink);
    }
}

// =============================================================================
// Recording Listeners
// =============================================================================

/// Records session activity callbacks.
#[derive(Debug, Default)]
pub struct RecordingActivityListener {
    events: Mutex<Vec<(NodeId, Option<SessionActivation>)>>,
}

impl RecordingActivityListener {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Activations in order; `None` marks an inactive callback.
    pub fn events(&self) -> Vec<(NodeId, Option<SessionActivation>)> {
        self.events.lock().clone()
    }

    /// Activation kinds only.
    pub fn activations(&self) -> Vec<SessionActivation> {
        self.events.lock().iter().filter_map(|(_, a)| *a).collect()
    }

    /// Number of inactive callbacks.
    pub fn inactive_count(&self) -> usize {
        self.events.lock().iter().filter(|(_, a)| a.is_none()).count()
    }
}

#[async_trait]
impl SessionActivityListener for RecordingActivityListener {
    async fn on_session_active(&self, session: &Arc<Session>, activation: SessionActivation) {
        self.events
            .lock()
            .push((session.session_id().clone(), Some(activation)));
    }

    async fn on_session_inactive(&self, session: &Arc<Session>) {
        self.events.lock().push((session.session_id().clone(), None));
    }
}
