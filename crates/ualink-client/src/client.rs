// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Client facade.
//!
//! [`UaClient`] wires the correlator, session state machine and subscription
//! manager together and sequences their startup and teardown with a
//! [`LifecycleManager`] running shutdown in inverse registration order:
//! publishing stops first, then the session is closed, then the channel.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use ualink_core::{Lifecycle, LifecycleManager, ShutdownOrder};

use crate::config::{ClientConfig, MonitoredItemSettings, SubscriptionSettings};
use crate::correlator::RequestCorrelator;
use crate::error::{ConfigurationError, OpcUaError, OpcUaResult};
use crate::identity::{AnonymousProvider, CertificateValidator, IdentityProvider, InsecureValidator};
use crate::message::{expect_response, ReadRequest, RequestKind, RequestMessage, WriteRequest, WriteValue};
use crate::session::{Session, SessionContext, SessionFsm, SessionFuture, SessionState};
use crate::stats::{ClientStats, StatsSnapshot};
use crate::subscription::{
    MonitoredItem, MonitoredItemRequest, RevisedParameters, Subscription, SubscriptionListener,
    SubscriptionManager,
};
use crate::transport::{ChannelInfo, SecureChannelTransport};
use crate::types::{
    DataValue, MonitoringMode, NodeId, ReadValueId, StatusCode, TimestampsToReturn, Variant,
    ATTRIBUTE_VALUE,
};

// =============================================================================
// UaClient
// =============================================================================

/// OPC UA client.
pub struct UaClient {
    config: Arc<ClientConfig>,
    correlator: Arc<RequestCorrelator>,
    fsm: Arc<SessionFsm>,
    subscriptions: Arc<SubscriptionManager>,
    lifecycle: LifecycleManager,
    stats: Arc<ClientStats>,
}

impl UaClient {
    /// Creates a builder.
    pub fn builder(config: ClientConfig) -> UaClientBuilder {
        UaClientBuilder::new(config)
    }

    /// Runs startup and waits for an active session.
    pub async fn connect(&self) -> OpcUaResult<Arc<Session>> {
        info!(endpoint = %self.config.endpoint, "Connecting");
        self.lifecycle.startup().await;
        let session = self.fsm.session().await?;
        info!(session_id = %session.session_id(), "Connected");
        Ok(session)
    }

    /// Stops publishing, closes the session and the channel.
    ///
    /// Always succeeds locally.
    pub async fn disconnect(&self) -> OpcUaResult<()> {
        info!(endpoint = %self.config.endpoint, "Disconnecting");
        self.lifecycle.shutdown().await;
        Ok(())
    }

    /// Waits for a usable session, creating one if needed.
    pub async fn session(&self) -> OpcUaResult<Arc<Session>> {
        self.fsm.session().await
    }

    /// The current session future.
    pub async fn session_future(&self) -> OpcUaResult<SessionFuture> {
        self.fsm.session_future().await
    }

    /// Session state.
    pub fn state(&self) -> SessionState {
        self.fsm.state()
    }

    /// Watches session state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.fsm.subscribe_state()
    }

    /// Registers a callback invoked with `(old, new)` on every session
    /// state transition.
    pub fn add_state_listener<F>(&self, listener: F)
    where
        F: Fn(SessionState, SessionState) + Send + Sync + 'static,
    {
        self.fsm.add_state_listener(listener);
    }

    /// The current channel, if open.
    pub fn channel(&self) -> Option<Arc<ChannelInfo>> {
        self.correlator.channel()
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The subscription manager.
    pub fn subscription_manager(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// The session state machine.
    pub fn session_fsm(&self) -> &Arc<SessionFsm> {
        &self.fsm
    }

    // =========================================================================
    // Attribute services
    // =========================================================================

    /// Reads attributes.
    pub async fn read(&self, nodes_to_read: Vec<ReadValueId>) -> OpcUaResult<Vec<DataValue>> {
        let expected = nodes_to_read.len();
        let session = self.fsm.session().await?;
        let response = self
            .correlator
            .send(RequestMessage::new(
                session.request_header(self.config.request_timeout),
                ReadRequest {
                    max_age: std::time::Duration::ZERO,
                    timestamps_to_return: TimestampsToReturn::Both,
                    nodes_to_read,
                },
            ))
            .await?;
        let body = expect_response!(response, Read)?;
        if body.results.len() != expected {
            return Err(OpcUaError::unexpected_response(
                RequestKind::Read,
                format!("{} results for {expected} nodes", body.results.len()),
            ));
        }
        Ok(body.results)
    }

    /// Reads the value of one node.
    pub async fn read_value(&self, node_id: NodeId) -> OpcUaResult<DataValue> {
        self.read(vec![ReadValueId::value_of(node_id)])
            .await?
            .pop()
            .ok_or_else(|| OpcUaError::unexpected_response(RequestKind::Read, "empty results"))
    }

    /// Writes attributes. Returns one status per value.
    pub async fn write(&self, nodes_to_write: Vec<WriteValue>) -> OpcUaResult<Vec<StatusCode>> {
        let session = self.fsm.session().await?;
        let response = self
            .correlator
            .send(RequestMessage::new(
                session.request_header(self.config.request_timeout),
                WriteRequest { nodes_to_write },
            ))
            .await?;
        Ok(expect_response!(response, Write)?.results)
    }

    /// Writes the value of one node.
    pub async fn write_value(&self, node_id: NodeId, value: impl Into<Variant>) -> OpcUaResult<()> {
        let statuses = self
            .write(vec![WriteValue {
                node_id,
                attribute_id: ATTRIBUTE_VALUE,
                value: DataValue::new(value),
            }])
            .await?;
        match statuses.first() {
            Some(status) if status.is_good() => Ok(()),
            Some(status) => Err(OpcUaError::service(RequestKind::Write, *status)),
            None => Err(OpcUaError::unexpected_response(RequestKind::Write, "empty results")),
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Creates a subscription with explicit settings.
    pub async fn create_subscription(
        &self,
        settings: SubscriptionSettings,
        listener: Arc<dyn SubscriptionListener>,
    ) -> OpcUaResult<Arc<Subscription>> {
        self.subscriptions
            .create_subscription(settings, listener)
            .await
    }

    /// Creates a subscription with the configured default settings.
    pub async fn create_default_subscription(
        &self,
        listener: Arc<dyn SubscriptionListener>,
    ) -> OpcUaResult<Arc<Subscription>> {
        self.subscriptions
            .create_subscription(self.config.subscription.clone(), listener)
            .await
    }

    /// Changes a subscription's timing parameters.
    pub async fn modify_subscription(
        &self,
        subscription: &Subscription,
        settings: SubscriptionSettings,
    ) -> OpcUaResult<RevisedParameters> {
        self.subscriptions
            .modify_subscription(subscription, settings)
            .await
    }

    /// Enables or disables publishing for a subscription.
    pub async fn set_publishing_mode(
        &self,
        subscription: &Subscription,
        publishing_enabled: bool,
    ) -> OpcUaResult<()> {
        self.subscriptions
            .set_publishing_mode(subscription, publishing_enabled)
            .await
    }

    /// Deletes a subscription.
    pub async fn delete_subscription(&self, subscription: &Subscription) -> OpcUaResult<()> {
        self.subscriptions.delete_subscription(subscription).await
    }

    /// Adds one monitored item.
    pub async fn add_monitored_item(
        &self,
        subscription: &Subscription,
        request: MonitoredItemRequest,
    ) -> OpcUaResult<MonitoredItem> {
        self.subscriptions
            .add_monitored_item(subscription, request)
            .await
    }

    /// Adds monitored items in one request.
    pub async fn create_monitored_items(
        &self,
        subscription: &Subscription,
        requests: Vec<MonitoredItemRequest>,
    ) -> OpcUaResult<Vec<OpcUaResult<MonitoredItem>>> {
        self.subscriptions
            .create_monitored_items(subscription, requests)
            .await
    }

    /// Changes monitored item settings.
    pub async fn modify_monitored_items(
        &self,
        subscription: &Subscription,
        changes: Vec<(u32, MonitoredItemSettings)>,
    ) -> OpcUaResult<Vec<StatusCode>> {
        self.subscriptions
            .modify_monitored_items(subscription, changes)
            .await
    }

    /// Sets the monitoring mode of items.
    pub async fn set_monitoring_mode(
        &self,
        subscription: &Subscription,
        client_handles: &[u32],
        monitoring_mode: MonitoringMode,
    ) -> OpcUaResult<Vec<StatusCode>> {
        self.subscriptions
            .set_monitoring_mode(subscription, client_handles, monitoring_mode)
            .await
    }

    /// Deletes one monitored item.
    pub async fn delete_monitored_item(
        &self,
        subscription: &Subscription,
        client_handle: u32,
    ) -> OpcUaResult<()> {
        self.subscriptions
            .delete_monitored_item(subscription, client_handle)
            .await
    }

    /// Deletes monitored items in one request.
    pub async fn delete_monitored_items(
        &self,
        subscription: &Subscription,
        client_handles: &[u32],
    ) -> OpcUaResult<Vec<StatusCode>> {
        self.subscriptions
            .delete_monitored_items(subscription, client_handles)
            .await
    }
}

impl std::fmt::Debug for UaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UaClient")
            .field("endpoint", &self.config.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Lifecycle components
// =============================================================================

struct SessionComponent(Arc<SessionFsm>);

#[async_trait]
impl Lifecycle for SessionComponent {
    fn name(&self) -> &str {
        "session"
    }

    async fn on_startup(&self) {}

    async fn on_shutdown(&self) {
        if let Err(error) = self.0.close().await {
            warn!(error = %error, "Session close failed");
        }
    }
}

struct PublishComponent(Arc<SubscriptionManager>);

#[async_trait]
impl Lifecycle for PublishComponent {
    fn name(&self) -> &str {
        "publish"
    }

    async fn on_startup(&self) {
        self.0.resume();
    }

    async fn on_shutdown(&self) {
        self.0.stop();
    }
}

// =============================================================================
// UaClientBuilder
// =============================================================================

/// Builder for [`UaClient`].
pub struct UaClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn SecureChannelTransport>>,
    identity_provider: Option<Arc<dyn IdentityProvider>>,
    certificate_validator: Option<Arc<dyn CertificateValidator>>,
    runtime: Option<Handle>,
}

impl UaClientBuilder {
    /// Creates a builder for `config`.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            identity_provider: None,
            certificate_validator: None,
            runtime: None,
        }
    }

    /// Sets the secure channel transport. Required.
    pub fn transport(mut self, transport: Arc<dyn SecureChannelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the identity provider. Defaults to anonymous.
    pub fn identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity_provider = Some(provider);
        self
    }

    /// Sets the certificate validator. Defaults to accepting every
    /// certificate.
    pub fn certificate_validator(mut self, validator: Arc<dyn CertificateValidator>) -> Self {
        self.certificate_validator = Some(validator);
        self
    }

    /// Sets the runtime handle. Defaults to the current runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Builds the client.
    pub fn build(self) -> OpcUaResult<UaClient> {
        self.config.validate()?;

        let transport = self
            .transport
            .ok_or_else(|| ConfigurationError::missing_field("transport"))?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| {
                ConfigurationError::invalid_value("runtime", format!("no tokio runtime: {e}"))
            })?,
        };
        let identity = self
            .identity_provider
            .unwrap_or_else(|| Arc::new(AnonymousProvider::new()));
        let validator = match self.certificate_validator {
            Some(validator) => validator,
            None => {
                if !self.config.security_mode.is_none() {
                    warn!("Secured endpoint without certificate validator, accepting any certificate");
                }
                Arc::new(InsecureValidator)
            }
        };

        let config = Arc::new(self.config);
        let stats = Arc::new(ClientStats::new());
        let correlator = RequestCorrelator::new(transport, stats.clone(), &runtime);

        let fsm = Arc::new(SessionFsm::new(SessionContext {
            config: config.clone(),
            correlator: correlator.clone(),
            identity,
            validator,
            reconnect: config.reconnect.build(),
            stats: stats.clone(),
            runtime: runtime.clone(),
        }));

        let subscriptions = SubscriptionManager::new(
            config.clone(),
            correlator.clone(),
            fsm.clone(),
            stats.clone(),
            runtime,
        );

        let lifecycle = LifecycleManager::new(ShutdownOrder::Inverse);
        {
            let correlator = correlator.clone();
            lifecycle.add_startup_task(move || {
                let correlator = correlator.clone();
                async move {
                    if let Err(error) = correlator.ensure_channel().await {
                        debug!(error = %error, "Channel not opened at startup");
                    }
                }
            });
        }
        {
            let correlator = correlator.clone();
            lifecycle.add_shutdown_task(move || {
                let correlator = correlator.clone();
                async move {
                    if let Err(error) = correlator.disconnect().await {
                        debug!(error = %error, "Channel disconnect failed");
                    }
                }
            });
        }
        lifecycle.add_lifecycle(Arc::new(SessionComponent(fsm.clone())));
        lifecycle.add_lifecycle(Arc::new(PublishComponent(subscriptions.clone())));

        Ok(UaClient {
            config,
            correlator,
            fsm,
            subscriptions,
            lifecycle,
            stats,
        })
    }
}
