// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Subscriptions and monitored items.
//!
//! # Overview
//!
//! [`SubscriptionManager`] owns the client-side record of every subscription
//! and monitored item. Server state and client state change together: a
//! record is added only after the server confirmed the create and removed
//! only after the server confirmed the delete (or reported the id as already
//! gone).
//!
//! Monitored items are keyed by client handle. Handles come from one
//! [`ClientHandleSequence`] per client and are checked against every item of
//! every subscription, so a handle identifies an item for its whole life,
//! including after the server-side ids change on recreation.
//!
//! When a new session is created while subscriptions exist, the manager first
//! tries TransferSubscriptions and falls back to recreating each subscription
//! and its items with the original parameters and client handles.
//!
//! Notifications reach a [`SubscriptionListener`] through one serial queue per
//! subscription.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use ualink_core::ClientHandleSequence;

use crate::config::{ClientConfig, MonitoredItemSettings, SubscriptionSettings};
use crate::correlator::RequestCorrelator;
use crate::error::{OpcUaError, OpcUaResult, SubscriptionError};
use crate::message::{
    expect_response, CreateMonitoredItemsRequest, CreateSubscriptionRequest,
    DeleteMonitoredItemsRequest, DeleteSubscriptionsRequest, ModifyMonitoredItemsRequest,
    ModifySubscriptionRequest, MonitoredItemCreateRequest, MonitoredItemModifyRequest,
    MonitoringParameters, NotificationData, NotificationMessage, RequestKind, RequestMessage,
    ResponseMessage, SetMonitoringModeRequest, SetPublishingModeRequest,
    TransferSubscriptionsRequest, UaRequest,
};
use crate::publish::{NotificationSequencer, PublishEngine};
use crate::session::{Session, SessionActivation, SessionActivityListener, SessionFsm};
use crate::stats::ClientStats;
use crate::types::{MonitoringMode, NodeId, ReadValueId, StatusCode};

// =============================================================================
// Listener
// =============================================================================

/// Receives notifications for one subscription.
///
/// Calls for a subscription are made one at a time, in sequence order.
#[async_trait]
pub trait SubscriptionListener: Send + Sync {
    /// Data change and event notifications of one notification message.
    async fn on_notification(
        &self,
        subscription_id: u32,
        sequence_number: u32,
        items: &[NotificationData],
    );

    /// The server sent a keep-alive.
    async fn on_keep_alive(&self, _subscription_id: u32, _publish_time: DateTime<Utc>) {}

    /// The server reported a subscription status change.
    async fn on_status_changed(&self, _subscription_id: u32, _status: StatusCode) {}

    /// Notification messages that could not be recovered.
    async fn on_data_lost(&self, _subscription_id: u32, _sequence_numbers: &[u32]) {}

    /// The subscription could not be moved to a new session.
    async fn on_transfer_failed(&self, _subscription_id: u32, _error: &OpcUaError) {}
}

/// Listener callback as a value.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// See [`SubscriptionListener::on_notification`].
    Notification {
        /// Subscription id.
        subscription_id: u32,
        /// Sequence number of the message.
        sequence_number: u32,
        /// Data change and event notifications.
        items: Vec<NotificationData>,
    },
    /// See [`SubscriptionListener::on_keep_alive`].
    KeepAlive {
        /// Subscription id.
        subscription_id: u32,
        /// Server publish time.
        publish_time: DateTime<Utc>,
    },
    /// See [`SubscriptionListener::on_status_changed`].
    StatusChanged {
        /// Subscription id.
        subscription_id: u32,
        /// Reported status.
        status: StatusCode,
    },
    /// See [`SubscriptionListener::on_data_lost`].
    DataLost {
        /// Subscription id.
        subscription_id: u32,
        /// Unrecoverable sequence numbers.
        sequence_numbers: Vec<u32>,
    },
    /// See [`SubscriptionListener::on_transfer_failed`].
    TransferFailed {
        /// Subscription id.
        subscription_id: u32,
        /// Cause.
        error: OpcUaError,
    },
}

/// Forwards listener callbacks into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl ChannelListener {
    /// Creates the listener and the receiving end.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: SubscriptionEvent) {
        if self.tx.send(event).is_err() {
            trace!("Subscription event receiver dropped");
        }
    }
}

#[async_trait]
impl SubscriptionListener for ChannelListener {
    async fn on_notification(
        &self,
        subscription_id: u32,
        sequence_number: u32,
        items: &[NotificationData],
    ) {
        self.forward(SubscriptionEvent::Notification {
            subscription_id,
            sequence_number,
            items: items.to_vec(),
        });
    }

    async fn on_keep_alive(&self, subscription_id: u32, publish_time: DateTime<Utc>) {
        self.forward(SubscriptionEvent::KeepAlive {
            subscription_id,
            publish_time,
        });
    }

    async fn on_status_changed(&self, subscription_id: u32, status: StatusCode) {
        self.forward(SubscriptionEvent::StatusChanged {
            subscription_id,
            status,
        });
    }

    async fn on_data_lost(&self, subscription_id: u32, sequence_numbers: &[u32]) {
        self.forward(SubscriptionEvent::DataLost {
            subscription_id,
            sequence_numbers: sequence_numbers.to_vec(),
        });
    }

    async fn on_transfer_failed(&self, subscription_id: u32, error: &OpcUaError) {
        self.forward(SubscriptionEvent::TransferFailed {
            subscription_id,
            error: error.clone(),
        });
    }
}

// =============================================================================
// MonitoredItem
// =============================================================================

/// What to monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemRequest {
    /// Node and attribute.
    pub item_to_monitor: ReadValueId,
    /// Initial monitoring mode.
    pub monitoring_mode: MonitoringMode,
    /// Overrides the client's default item settings.
    pub settings: Option<MonitoredItemSettings>,
}

impl MonitoredItemRequest {
    /// Monitors the `Value` attribute of `node_id` with default settings.
    pub fn value_of(node_id: NodeId) -> Self {
        Self {
            item_to_monitor: ReadValueId::value_of(node_id),
            monitoring_mode: MonitoringMode::Reporting,
            settings: None,
        }
    }

    /// Sets the monitoring mode.
    pub fn with_mode(mut self, mode: MonitoringMode) -> Self {
        self.monitoring_mode = mode;
        self
    }

    /// Overrides the item settings.
    pub fn with_settings(mut self, settings: MonitoredItemSettings) -> Self {
        self.settings = Some(settings);
        self
    }
}

/// A monitored item as known to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItem {
    client_handle: u32,
    monitored_item_id: u32,
    item_to_monitor: ReadValueId,
    monitoring_mode: MonitoringMode,
    settings: MonitoredItemSettings,
    revised_sampling_interval: Duration,
    revised_queue_size: u32,
}

impl MonitoredItem {
    fn unbound(
        client_handle: u32,
        item_to_monitor: ReadValueId,
        monitoring_mode: MonitoringMode,
        settings: MonitoredItemSettings,
    ) -> Self {
        Self {
            client_handle,
            monitored_item_id: 0,
            item_to_monitor,
            monitoring_mode,
            revised_sampling_interval: settings.sampling_interval,
            revised_queue_size: settings.queue_size,
            settings,
        }
    }

    /// Client handle; stable for the life of the item.
    pub fn client_handle(&self) -> u32 {
        self.client_handle
    }

    /// Server-assigned id; changes when the item is recreated.
    pub fn monitored_item_id(&self) -> u32 {
        self.monitored_item_id
    }

    /// Monitored node and attribute.
    pub fn item_to_monitor(&self) -> &ReadValueId {
        &self.item_to_monitor
    }

    /// Current monitoring mode.
    pub fn monitoring_mode(&self) -> MonitoringMode {
        self.monitoring_mode
    }

    /// Requested settings.
    pub fn settings(&self) -> &MonitoredItemSettings {
        &self.settings
    }

    /// Sampling interval as revised by the server.
    pub fn revised_sampling_interval(&self) -> Duration {
        self.revised_sampling_interval
    }

    /// Queue size as revised by the server.
    pub fn revised_queue_size(&self) -> u32 {
        self.revised_queue_size
    }

    fn parameters(&self) -> MonitoringParameters {
        monitoring_parameters(self.client_handle, &self.settings)
    }
}

fn monitoring_parameters(client_handle: u32, settings: &MonitoredItemSettings) -> MonitoringParameters {
    MonitoringParameters {
        client_handle,
        sampling_interval: settings.sampling_interval,
        filter: settings.filter,
        queue_size: settings.queue_size,
        discard_oldest: settings.discard_oldest,
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Subscription parameters as revised by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisedParameters {
    /// Publishing interval.
    pub publishing_interval: Duration,
    /// Lifetime count.
    pub lifetime_count: u32,
    /// Max keep-alive count.
    pub max_keep_alive_count: u32,
}

enum Delivery {
    Message {
        subscription_id: u32,
        message: NotificationMessage,
    },
    KeepAlive {
        subscription_id: u32,
        publish_time: DateTime<Utc>,
    },
    DataLost {
        subscription_id: u32,
        sequence_numbers: Vec<u32>,
    },
    TransferFailed {
        subscription_id: u32,
        error: OpcUaError,
    },
}

/// A subscription and its monitored items.
pub struct Subscription {
    subscription_id: AtomicU32,
    requested: RwLock<SubscriptionSettings>,
    revised: RwLock<RevisedParameters>,
    items: RwLock<BTreeMap<u32, MonitoredItem>>,
    sequencer: Mutex<NotificationSequencer>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    stats: Arc<ClientStats>,
    created_at: DateTime<Utc>,
}

impl Subscription {
    pub(crate) fn new(
        subscription_id: u32,
        requested: SubscriptionSettings,
        revised: RevisedParameters,
        listener: Arc<dyn SubscriptionListener>,
        stats: Arc<ClientStats>,
        runtime: &Handle,
    ) -> Arc<Self> {
        let (deliveries, rx) = mpsc::unbounded_channel();
        runtime.spawn(deliver(listener, rx));
        Arc::new(Self {
            subscription_id: AtomicU32::new(subscription_id),
            requested: RwLock::new(requested),
            revised: RwLock::new(revised),
            items: RwLock::new(BTreeMap::new()),
            sequencer: Mutex::new(NotificationSequencer::new()),
            deliveries,
            stats,
            created_at: Utc::now(),
        })
    }

    /// Server-assigned id; changes if the subscription is recreated.
    pub fn subscription_id(&self) -> u32 {
        self.subscription_id.load(Ordering::Acquire)
    }

    /// Parameters the subscription was requested with.
    pub fn requested_settings(&self) -> SubscriptionSettings {
        self.requested.read().clone()
    }

    /// Parameters as revised by the server.
    pub fn revised(&self) -> RevisedParameters {
        *self.revised.read()
    }

    /// Longest time the server may go without publishing.
    pub fn keep_alive_period(&self) -> Duration {
        let revised = self.revised();
        revised
            .publishing_interval
            .saturating_mul(revised.max_keep_alive_count)
    }

    /// Snapshot of the monitored items, ordered by client handle.
    pub fn items(&self) -> Vec<MonitoredItem> {
        self.items.read().values().cloned().collect()
    }

    /// Looks up an item by client handle.
    pub fn item(&self, client_handle: u32) -> Option<MonitoredItem> {
        self.items.read().get(&client_handle).cloned()
    }

    /// Number of monitored items.
    pub fn item_count(&self) -> usize {
        self.items.read().len()
    }

    /// Highest sequence number delivered to the listener.
    pub fn last_sequence_number(&self) -> u32 {
        self.sequencer.lock().last_delivered()
    }

    /// When the client first created this subscription.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn contains_handle(&self, client_handle: u32) -> bool {
        self.items.read().contains_key(&client_handle)
    }

    fn bind_item(&self, item: MonitoredItem) {
        self.items.write().insert(item.client_handle, item);
    }

    fn remove_item(&self, client_handle: u32) -> Option<MonitoredItem> {
        self.items.write().remove(&client_handle)
    }

    fn rebind(&self, subscription_id: u32, revised: RevisedParameters) {
        self.subscription_id.store(subscription_id, Ordering::Release);
        *self.revised.write() = revised;
        self.sequencer.lock().reset();
    }

    // -------------------------------------------------------------------------
    // Sequencing
    // -------------------------------------------------------------------------

    /// Feeds a data message; returns sequence numbers to republish.
    pub(crate) fn on_message(&self, message: NotificationMessage) -> Vec<u32> {
        let subscription_id = self.subscription_id();
        let sequence_number = message.sequence_number;

        // Held while enqueueing so concurrent responses cannot reorder.
        let mut sequencer = self.sequencer.lock();
        let outcome = sequencer.accept(message);
        if outcome.duplicate {
            self.stats.record_duplicate();
            trace!(subscription_id, sequence_number, "Duplicate notification discarded");
        }
        self.enqueue_messages(subscription_id, outcome.deliver);
        outcome.republish
    }

    /// Handles a keep-alive; returns sequence numbers to republish.
    pub(crate) fn on_keep_alive(&self, message: &NotificationMessage) -> Vec<u32> {
        let subscription_id = self.subscription_id();
        let mut sequencer = self.sequencer.lock();
        let missing = sequencer.keep_alive(message.sequence_number);
        self.enqueue(Delivery::KeepAlive {
            subscription_id,
            publish_time: message.publish_time,
        });
        missing
    }

    pub(crate) fn mark_lost(&self, sequence_numbers: Vec<u32>) {
        let subscription_id = self.subscription_id();
        let mut sequencer = self.sequencer.lock();
        let released = sequencer.mark_lost(&sequence_numbers);
        self.enqueue(Delivery::DataLost {
            subscription_id,
            sequence_numbers,
        });
        self.enqueue_messages(subscription_id, released);
    }

    pub(crate) fn withdraw_republish(&self, sequence_numbers: &[u32]) {
        self.sequencer.lock().withdraw(sequence_numbers);
    }

    fn available(&self, sequence_numbers: &[u32]) -> Vec<u32> {
        self.sequencer.lock().available(sequence_numbers)
    }

    fn transfer_failed(&self, error: OpcUaError) {
        self.enqueue(Delivery::TransferFailed {
            subscription_id: self.subscription_id(),
            error,
        });
    }

    fn enqueue_messages(&self, subscription_id: u32, messages: Vec<NotificationMessage>) {
        for message in messages {
            self.stats.record_notification_delivered();
            self.enqueue(Delivery::Message {
                subscription_id,
                message,
            });
        }
    }

    fn enqueue(&self, delivery: Delivery) {
        if self.deliveries.send(delivery).is_err() {
            debug!(subscription_id = self.subscription_id(), "Delivery task gone");
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subscription_id", &self.subscription_id())
            .field("revised", &self.revised())
            .field("items", &self.item_count())
            .finish()
    }
}

async fn deliver(listener: Arc<dyn SubscriptionListener>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Message {
                subscription_id,
                message,
            } => {
                let sequence_number = message.sequence_number;
                let mut items = Vec::with_capacity(message.notification_data.len());
                for data in message.notification_data {
                    match data {
                        NotificationData::StatusChange(status) => {
                            listener.on_status_changed(subscription_id, status).await;
                        }
                        other => items.push(other),
                    }
                }
                if !items.is_empty() {
                    listener
                        .on_notification(subscription_id, sequence_number, &items)
                        .await;
                }
            }
            Delivery::KeepAlive {
                subscription_id,
                publish_time,
            } => listener.on_keep_alive(subscription_id, publish_time).await,
            Delivery::DataLost {
                subscription_id,
                sequence_numbers,
            } => {
                listener
                    .on_data_lost(subscription_id, &sequence_numbers)
                    .await
            }
            Delivery::TransferFailed {
                subscription_id,
                error,
            } => listener.on_transfer_failed(subscription_id, &error).await,
        }
    }
}

// =============================================================================
// SubscriptionRegistry
// =============================================================================

/// Live subscriptions, shared with the publish engine.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    subscriptions: DashMap<u32, Arc<Subscription>>,
    reserved: Mutex<HashSet<u32>>,
}

impl SubscriptionRegistry {
    pub(crate) fn get(&self, subscription_id: u32) -> Option<Arc<Subscription>> {
        self.subscriptions
            .get(&subscription_id)
            .map(|entry| entry.value().clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn insert(&self, subscription: Arc<Subscription>) {
        self.subscriptions
            .insert(subscription.subscription_id(), subscription);
    }

    pub(crate) fn remove(&self, subscription_id: u32) -> Option<Arc<Subscription>> {
        self.subscriptions
            .remove(&subscription_id)
            .map(|(_, subscription)| subscription)
    }

    /// Takes a subscription out of the map while it has no valid server id.
    /// Its client handles stay reserved until it is attached again.
    fn detach(&self, subscription: &Subscription) {
        self.subscriptions.remove(&subscription.subscription_id());
        let mut reserved = self.reserved.lock();
        reserved.extend(subscription.items.read().keys().copied());
    }

    /// Puts a detached subscription back under its current id.
    fn attach(&self, subscription: Arc<Subscription>) {
        let handles: Vec<u32> = subscription.items.read().keys().copied().collect();
        self.insert(subscription);
        self.release(&handles);
    }

    fn handle_in_use(&self, client_handle: u32) -> bool {
        self.reserved.lock().contains(&client_handle)
            || self
                .subscriptions
                .iter()
                .any(|entry| entry.value().contains_handle(client_handle))
    }

    fn reserve(&self, client_handle: u32) {
        self.reserved.lock().insert(client_handle);
    }

    fn release(&self, client_handles: &[u32]) {
        let mut reserved = self.reserved.lock();
        for handle in client_handles {
            reserved.remove(handle);
        }
    }
}

// =============================================================================
// SubscriptionManager
// =============================================================================

/// Creates, modifies and deletes subscriptions and monitored items.
pub struct SubscriptionManager {
    config: Arc<ClientConfig>,
    correlator: Arc<RequestCorrelator>,
    fsm: Arc<SessionFsm>,
    registry: Arc<SubscriptionRegistry>,
    publish: Arc<PublishEngine>,
    handles: ClientHandleSequence,
    stats: Arc<ClientStats>,
    runtime: Handle,
}

impl SubscriptionManager {
    /// Creates the manager and its publish engine, and registers for
    /// session activation.
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        correlator: Arc<RequestCorrelator>,
        fsm: Arc<SessionFsm>,
        stats: Arc<ClientStats>,
        runtime: Handle,
    ) -> Arc<Self> {
        let registry = Arc::new(SubscriptionRegistry::default());
        let publish = PublishEngine::new(
            config.clone(),
            correlator.clone(),
            fsm.clone(),
            registry.clone(),
            stats.clone(),
            runtime.clone(),
        );

        let manager = Arc::new(Self {
            config,
            correlator,
            fsm: fsm.clone(),
            registry,
            publish,
            handles: ClientHandleSequence::new(),
            stats,
            runtime,
        });
        fsm.add_activity_listener(Arc::new(RestoreOnActivation(Arc::downgrade(&manager))));
        manager
    }

    /// The publish engine.
    pub fn publish_engine(&self) -> &Arc<PublishEngine> {
        &self.publish
    }

    /// All live subscriptions.
    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.registry.all()
    }

    /// Looks up a subscription by its current id.
    pub fn subscription(&self, subscription_id: u32) -> Option<Arc<Subscription>> {
        self.registry.get(subscription_id)
    }

    /// Returns `true` if a monitored item of any subscription holds
    /// `client_handle`.
    pub fn is_handle_in_use(&self, client_handle: u32) -> bool {
        self.registry.handle_in_use(client_handle)
    }

    /// Stops the publish loop.
    pub fn stop(&self) {
        self.publish.stop();
    }

    /// Restarts the publish loop.
    pub fn resume(&self) {
        self.publish.resume();
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Creates a subscription delivering to `listener`.
    pub async fn create_subscription(
        &self,
        settings: SubscriptionSettings,
        listener: Arc<dyn SubscriptionListener>,
    ) -> OpcUaResult<Arc<Subscription>> {
        settings.validate()?;
        let session = self.fsm.session().await?;
        let (subscription_id, revised) = self.create_on_server(&session, &settings).await?;

        let subscription = Subscription::new(
            subscription_id,
            settings,
            revised,
            listener,
            self.stats.clone(),
            &self.runtime,
        );
        self.registry.insert(subscription.clone());
        info!(
            subscription_id,
            publishing_interval = ?revised.publishing_interval,
            "Subscription created"
        );

        self.publish.kick();
        Ok(subscription)
    }

    /// Changes the subscription's timing parameters.
    pub async fn modify_subscription(
        &self,
        subscription: &Subscription,
        settings: SubscriptionSettings,
    ) -> OpcUaResult<RevisedParameters> {
        settings.validate()?;
        let subscription_id = self.ensure_registered(subscription)?;
        let session = self.fsm.session().await?;

        let response = self
            .call(
                &session,
                ModifySubscriptionRequest {
                    subscription_id,
                    requested_publishing_interval: settings.publishing_interval,
                    requested_lifetime_count: settings.lifetime_count,
                    requested_max_keep_alive_count: settings.max_keep_alive_count,
                    max_notifications_per_publish: settings.max_notifications_per_publish,
                    priority: settings.priority,
                },
            )
            .await?;
        let body = expect_response!(response, ModifySubscription)?;

        let revised = RevisedParameters {
            publishing_interval: body.revised_publishing_interval,
            lifetime_count: body.revised_lifetime_count,
            max_keep_alive_count: body.revised_max_keep_alive_count,
        };
        {
            let mut requested = subscription.requested.write();
            let publishing_enabled = requested.publishing_enabled;
            *requested = SubscriptionSettings {
                publishing_enabled,
                ..settings
            };
        }
        *subscription.revised.write() = revised;
        debug!(subscription_id, revised = ?revised, "Subscription modified");
        Ok(revised)
    }

    /// Enables or disables publishing.
    pub async fn set_publishing_mode(
        &self,
        subscription: &Subscription,
        publishing_enabled: bool,
    ) -> OpcUaResult<()> {
        let subscription_id = self.ensure_registered(subscription)?;
        let session = self.fsm.session().await?;

        let response = self
            .call(
                &session,
                SetPublishingModeRequest {
                    publishing_enabled,
                    subscription_ids: vec![subscription_id],
                },
            )
            .await?;
        let body = expect_response!(response, SetPublishingMode)?;
        let status = single_result(RequestKind::SetPublishingMode, &body.results)?;
        if status.is_bad() {
            return Err(OpcUaError::service(RequestKind::SetPublishingMode, status));
        }

        subscription.requested.write().publishing_enabled = publishing_enabled;
        debug!(subscription_id, publishing_enabled, "Publishing mode set");
        Ok(())
    }

    /// Deletes the subscription on the server, then locally.
    ///
    /// If the server rejects the delete the client-side record is kept.
    pub async fn delete_subscription(&self, subscription: &Subscription) -> OpcUaResult<()> {
        let subscription_id = self.ensure_registered(subscription)?;
        let session = self.fsm.session().await?;

        let response = self
            .call(
                &session,
                DeleteSubscriptionsRequest {
                    subscription_ids: vec![subscription_id],
                },
            )
            .await?;
        let body = expect_response!(response, DeleteSubscriptions)?;
        let status = single_result(RequestKind::DeleteSubscriptions, &body.results)?;

        if status.is_bad() && !status.matches(StatusCode::BAD_SUBSCRIPTION_ID_INVALID) {
            warn!(subscription_id, status = %status, "Subscription delete rejected");
            return Err(OpcUaError::service(RequestKind::DeleteSubscriptions, status));
        }

        self.registry.remove(subscription_id);
        self.publish.forget(subscription_id);
        info!(subscription_id, "Subscription deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Monitored items
    // -------------------------------------------------------------------------

    /// Creates monitored items. The outer error is a request failure; the
    /// inner results are per item, in request order.
    pub async fn create_monitored_items(
        &self,
        subscription: &Subscription,
        requests: Vec<MonitoredItemRequest>,
    ) -> OpcUaResult<Vec<OpcUaResult<MonitoredItem>>> {
        self.ensure_registered(subscription)?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.fsm.session().await?;

        let handles = self.reserve_handles(requests.len())?;
        let items: Vec<MonitoredItem> = requests
            .into_iter()
            .zip(&handles)
            .map(|(request, &client_handle)| {
                MonitoredItem::unbound(
                    client_handle,
                    request.item_to_monitor,
                    request.monitoring_mode,
                    request
                        .settings
                        .unwrap_or_else(|| self.config.monitored_item.clone()),
                )
            })
            .collect();

        let results = self.create_items_on_server(&session, subscription, items).await;
        self.registry.release(&handles);
        let results = results?;

        let created = results.iter().filter(|r| r.is_ok()).count();
        debug!(
            subscription_id = subscription.subscription_id(),
            requested = results.len(),
            created,
            "Monitored items created"
        );
        Ok(results)
    }

    /// Creates a single monitored item.
    pub async fn add_monitored_item(
        &self,
        subscription: &Subscription,
        request: MonitoredItemRequest,
    ) -> OpcUaResult<MonitoredItem> {
        self.create_monitored_items(subscription, vec![request])
            .await?
            .into_iter()
            .next()
            .unwrap_or_else(|| {
                Err(OpcUaError::unexpected_response(
                    RequestKind::CreateMonitoredItems,
                    "empty results",
                ))
            })
    }

    /// Changes item settings. Returns one status per change.
    pub async fn modify_monitored_items(
        &self,
        subscription: &Subscription,
        changes: Vec<(u32, MonitoredItemSettings)>,
    ) -> OpcUaResult<Vec<StatusCode>> {
        let subscription_id = self.ensure_registered(subscription)?;
        let items = lookup_items(subscription, changes.iter().map(|(h, _)| *h))?;
        let session = self.fsm.session().await?;

        let items_to_modify = items
            .iter()
            .zip(&changes)
            .map(|(item, (client_handle, settings))| MonitoredItemModifyRequest {
                monitored_item_id: item.monitored_item_id,
                requested_parameters: monitoring_parameters(*client_handle, settings),
            })
            .collect();

        let response = self
            .call(
                &session,
                ModifyMonitoredItemsRequest {
                    subscription_id,
                    timestamps_to_return: self.config.monitored_item.timestamps,
                    items_to_modify,
                },
            )
            .await?;
        let body = expect_response!(response, ModifyMonitoredItems)?;
        check_result_count(RequestKind::ModifyMonitoredItems, body.results.len(), changes.len())?;

        let mut statuses = Vec::with_capacity(changes.len());
        for (result, (client_handle, settings)) in body.results.into_iter().zip(changes) {
            if result.status_code.is_good() {
                if let Some(item) = subscription.items.write().get_mut(&client_handle) {
                    item.settings = settings;
                    item.revised_sampling_interval = result.revised_sampling_interval;
                    item.revised_queue_size = result.revised_queue_size;
                }
            }
            statuses.push(result.status_code);
        }
        Ok(statuses)
    }

    /// Sets the monitoring mode of items. Returns one status per handle.
    pub async fn set_monitoring_mode(
        &self,
        subscription: &Subscription,
        client_handles: &[u32],
        monitoring_mode: MonitoringMode,
    ) -> OpcUaResult<Vec<StatusCode>> {
        let subscription_id = self.ensure_registered(subscription)?;
        let items = lookup_items(subscription, client_handles.iter().copied())?;
        let session = self.fsm.session().await?;

        let response = self
            .call(
                &session,
                SetMonitoringModeRequest {
                    subscription_id,
                    monitoring_mode,
                    monitored_item_ids: items.iter().map(|i| i.monitored_item_id).collect(),
                },
            )
            .await?;
        let body = expect_response!(response, SetMonitoringMode)?;
        check_result_count(RequestKind::SetMonitoringMode, body.results.len(), items.len())?;

        let mut bound = subscription.items.write();
        for (status, item) in body.results.iter().zip(&items) {
            if status.is_good() {
                if let Some(item) = bound.get_mut(&item.client_handle) {
                    item.monitoring_mode = monitoring_mode;
                }
            }
        }
        Ok(body.results)
    }

    /// Deletes items on the server, then locally. Returns one status per handle.
    ///
    /// An item stays in the client record when its delete was rejected.
    pub async fn delete_monitored_items(
        &self,
        subscription: &Subscription,
        client_handles: &[u32],
    ) -> OpcUaResult<Vec<StatusCode>> {
        let subscription_id = self.ensure_registered(subscription)?;
        let items = lookup_items(subscription, client_handles.iter().copied())?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.fsm.session().await?;

        let response = self
            .call(
                &session,
                DeleteMonitoredItemsRequest {
                    subscription_id,
                    monitored_item_ids: items.iter().map(|i| i.monitored_item_id).collect(),
                },
            )
            .await?;
        let body = expect_response!(response, DeleteMonitoredItems)?;
        check_result_count(RequestKind::DeleteMonitoredItems, body.results.len(), items.len())?;

        for (status, item) in body.results.iter().zip(&items) {
            if status.is_good() || status.matches(StatusCode::BAD_MONITORED_ITEM_ID_INVALID) {
                subscription.remove_item(item.client_handle);
            } else {
                warn!(
                    subscription_id,
                    client_handle = item.client_handle,
                    status = %status,
                    "Monitored item delete rejected"
                );
            }
        }
        Ok(body.results)
    }

    /// Deletes a single monitored item.
    pub async fn delete_monitored_item(
        &self,
        subscription: &Subscription,
        client_handle: u32,
    ) -> OpcUaResult<()> {
        let statuses = self
            .delete_monitored_items(subscription, &[client_handle])
            .await?;
        let status = single_result(RequestKind::DeleteMonitoredItems, &statuses)?;
        if status.is_bad() && !status.matches(StatusCode::BAD_MONITORED_ITEM_ID_INVALID) {
            return Err(SubscriptionError::MonitoredItemFailed {
                client_handle,
                status,
            }
            .into());
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn call(
        &self,
        session: &Session,
        request: impl Into<UaRequest>,
    ) -> OpcUaResult<ResponseMessage> {
        self.correlator
            .send(RequestMessage::new(
                session.request_header(self.config.request_timeout),
                request,
            ))
            .await
    }

    fn ensure_registered(&self, subscription: &Subscription) -> OpcUaResult<u32> {
        let subscription_id = subscription.subscription_id();
        match self.registry.get(subscription_id) {
            Some(_) => Ok(subscription_id),
            None => Err(OpcUaError::subscription_not_found(subscription_id)),
        }
    }

    fn reserve_handles(&self, count: usize) -> OpcUaResult<Vec<u32>> {
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            match self
                .handles
                .next_handle(|handle| self.registry.handle_in_use(handle))
            {
                Ok(handle) => {
                    self.registry.reserve(handle);
                    handles.push(handle);
                }
                Err(error) => {
                    self.registry.release(&handles);
                    return Err(error.into());
                }
            }
        }
        Ok(handles)
    }

    async fn create_on_server(
        &self,
        session: &Session,
        settings: &SubscriptionSettings,
    ) -> OpcUaResult<(u32, RevisedParameters)> {
        let response = self
            .call(
                session,
                CreateSubscriptionRequest {
                    requested_publishing_interval: settings.publishing_interval,
                    requested_lifetime_count: settings.lifetime_count,
                    requested_max_keep_alive_count: settings.max_keep_alive_count,
                    max_notifications_per_publish: settings.max_notifications_per_publish,
                    publishing_enabled: settings.publishing_enabled,
                    priority: settings.priority,
                },
            )
            .await?;
        let body = expect_response!(response, CreateSubscription)?;
        Ok((
            body.subscription_id,
            RevisedParameters {
                publishing_interval: body.revised_publishing_interval,
                lifetime_count: body.revised_lifetime_count,
                max_keep_alive_count: body.revised_max_keep_alive_count,
            },
        ))
    }

    /// Creates `items` on the server and binds the ones that succeeded.
    async fn create_items_on_server(
        &self,
        session: &Session,
        subscription: &Subscription,
        items: Vec<MonitoredItem>,
    ) -> OpcUaResult<Vec<OpcUaResult<MonitoredItem>>> {
        let items_to_create = items
            .iter()
            .map(|item| MonitoredItemCreateRequest {
                item_to_monitor: item.item_to_monitor.clone(),
                monitoring_mode: item.monitoring_mode,
                requested_parameters: item.parameters(),
            })
            .collect();

        let response = self
            .call(
                session,
                CreateMonitoredItemsRequest {
                    subscription_id: subscription.subscription_id(),
                    timestamps_to_return: self.config.monitored_item.timestamps,
                    items_to_create,
                },
            )
            .await?;
        let body = expect_response!(response, CreateMonitoredItems)?;
        check_result_count(RequestKind::CreateMonitoredItems, body.results.len(), items.len())?;

        let results = body
            .results
            .into_iter()
            .zip(items)
            .map(|(result, mut item)| {
                if result.status_code.is_bad() {
                    return Err(SubscriptionError::MonitoredItemFailed {
                        client_handle: item.client_handle,
                        status: result.status_code,
                    }
                    .into());
                }
                item.monitored_item_id = result.monitored_item_id;
                item.revised_sampling_interval = result.revised_sampling_interval;
                item.revised_queue_size = result.revised_queue_size;
                subscription.bind_item(item.clone());
                Ok(item)
            })
            .collect();
        Ok(results)
    }

    // -------------------------------------------------------------------------
    // Transfer and recreation
    // -------------------------------------------------------------------------

    async fn restore(&self, session: &Arc<Session>) {
        let subscriptions = self.registry.all();
        if subscriptions.is_empty() {
            return;
        }
        let count = subscriptions.len();
        info!(count, session_id = %session.session_id(), "Moving subscriptions to new session");

        let request = TransferSubscriptionsRequest {
            subscription_ids: subscriptions.iter().map(|s| s.subscription_id()).collect(),
            send_initial_values: false,
        };
        let response = self
            .call(session, request)
            .await
            .and_then(|response| expect_response!(response, TransferSubscriptions));

        let results: Vec<Option<_>> = match response {
            Ok(body) if body.results.len() == count => body.results.into_iter().map(Some).collect(),
            Ok(body) => {
                warn!(
                    expected = count,
                    actual = body.results.len(),
                    "TransferSubscriptions result count mismatch, recreating"
                );
                vec![None; count]
            }
            Err(error) if error.status_code().is_service_unsupported() => {
                info!("TransferSubscriptions not supported, recreating");
                vec![None; count]
            }
            Err(error) => {
                warn!(error = %error, "TransferSubscriptions failed, recreating");
                vec![None; count]
            }
        };

        let mut stale = Vec::new();
        for (subscription, result) in subscriptions.into_iter().zip(results) {
            let subscription_id = subscription.subscription_id();
            match result {
                Some(result) if result.status_code.is_good() => {
                    debug!(subscription_id, "Subscription transferred");
                    let missing = subscription.available(&result.available_sequence_numbers);
                    self.publish.republish(session, &subscription, missing).await;
                }
                Some(result) => {
                    debug!(subscription_id, status = %result.status_code, "Transfer rejected");
                    stale.push(subscription);
                }
                None => stale.push(subscription),
            }
        }

        // The new server may hand out ids that are still keys of stale entries.
        for subscription in &stale {
            self.registry.detach(subscription);
            self.publish.forget(subscription.subscription_id());
        }
        for subscription in &stale {
            self.recreate(session, subscription).await;
        }
    }

    /// Recreates a detached subscription and its items on `session`.
    async fn recreate(&self, session: &Arc<Session>, subscription: &Arc<Subscription>) {
        let old_id = subscription.subscription_id();
        let settings = subscription.requested_settings();

        let (new_id, revised) = match self.create_on_server(session, &settings).await {
            Ok(created) => created,
            Err(error) => {
                warn!(subscription_id = old_id, error = %error, "Subscription could not be recreated");
                let handles: Vec<u32> = subscription.items.read().keys().copied().collect();
                self.registry.release(&handles);
                subscription.transfer_failed(error);
                return;
            }
        };

        subscription.rebind(new_id, revised);
        self.registry.attach(subscription.clone());

        let items = subscription.items();
        let total = items.len();
        let handles: Vec<u32> = items.iter().map(|i| i.client_handle).collect();
        let failed: Vec<(u32, OpcUaError)> = match self
            .create_items_on_server(session, subscription, items)
            .await
        {
            Ok(results) => handles
                .into_iter()
                .zip(results)
                .filter_map(|(handle, result)| result.err().map(|e| (handle, e)))
                .collect(),
            Err(error) => handles.into_iter().map(|h| (h, error.clone())).collect(),
        };

        for (client_handle, error) in &failed {
            warn!(
                subscription_id = new_id,
                client_handle,
                error = %error,
                "Monitored item could not be recreated"
            );
            subscription.remove_item(*client_handle);
        }
        if let Some((_, error)) = failed.into_iter().next() {
            subscription.transfer_failed(error);
        }

        info!(
            old_subscription_id = old_id,
            subscription_id = new_id,
            items = subscription.item_count(),
            requested_items = total,
            "Subscription recreated"
        );
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("subscriptions", &self.registry.len())
            .field("publish", &self.publish)
            .finish()
    }
}

fn single_result(service: RequestKind, results: &[StatusCode]) -> OpcUaResult<StatusCode> {
    match results {
        [status] => Ok(*status),
        other => Err(OpcUaError::unexpected_response(
            service,
            format!("{} results for 1 operation", other.len()),
        )),
    }
}

fn check_result_count(service: RequestKind, actual: usize, expected: usize) -> OpcUaResult<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(OpcUaError::unexpected_response(
            service,
            format!("{actual} results for {expected} operations"),
        ))
    }
}

fn lookup_items(
    subscription: &Subscription,
    client_handles: impl Iterator<Item = u32>,
) -> OpcUaResult<Vec<MonitoredItem>> {
    client_handles
        .map(|client_handle| {
            subscription
                .item(client_handle)
                .ok_or_else(|| SubscriptionError::MonitoredItemNotFound { client_handle }.into())
        })
        .collect()
}

/// Session activity hook that moves subscriptions to a newly created session.
struct RestoreOnActivation(Weak<SubscriptionManager>);

#[async_trait]
impl SessionActivityListener for RestoreOnActivation {
    async fn on_session_active(&self, session: &Arc<Session>, activation: SessionActivation) {
        if activation != SessionActivation::Created {
            return;
        }
        if let Some(manager) = self.0.upgrade() {
            manager.restore(session).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
