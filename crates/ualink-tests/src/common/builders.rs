// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Builders
//!
//! Builders wiring a [`UaClient`] to a [`MockServer`] with sensible defaults,
//! and for notification messages fed straight into sequencers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ualink_client::client::UaClient;
use ualink_client::config::ClientConfig;
use ualink_client::identity::{CertificateValidator, IdentityProvider};
use ualink_client::message::{MonitoredItemNotification, NotificationData, NotificationMessage};
use ualink_client::session::SessionActivityListener;
use ualink_client::types::{DataValue, Variant};
use ualink_core::BackoffConfig;

use super::fixtures::{nodes, test_config};
use super::mocks::{MockServer, ServerBehavior};

// =============================================================================
// Client Fixture
// =============================================================================

/// A client connected to its own in-memory server.
pub struct ClientFixture {
    /// The server.
    pub server: Arc<MockServer>,

    /// The client.
    pub client: UaClient,
}

impl ClientFixture {
    /// Client and server with every default.
    pub fn new() -> Self {
        TestClientBuilder::new().build()
    }
}

impl Default for ClientFixture {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TestClientBuilder
// =============================================================================

/// Builder for [`ClientFixture`].
pub struct TestClientBuilder {
    behavior: ServerBehavior,
    config: ClientConfig,
    identity: Option<Arc<dyn IdentityProvider>>,
    validator: Option<Arc<dyn CertificateValidator>>,
    activity_listener: Option<Arc<dyn SessionActivityListener>>,
    seed_address_space: bool,
}

impl Default for TestClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClientBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self {
            behavior: ServerBehavior::default(),
            config: test_config(),
            identity: None,
            validator: None,
            activity_listener: None,
            seed_address_space: true,
        }
    }

    /// Set the server behavior.
    pub fn behavior(mut self, behavior: ServerBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Replace the client configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Adjust the client configuration in place.
    pub fn configure(mut self, f: impl FnOnce(&mut ClientConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Set the request timeout.
    pub fn request_timeout(self, timeout: Duration) -> Self {
        self.configure(|c| c.request_timeout = timeout)
    }

    /// Set the keep-alive interval, timeout and failures allowed.
    pub fn keep_alive(self, interval: Duration, timeout: Duration, failures_allowed: u32) -> Self {
        self.configure(|c| {
            c.keep_alive_interval = interval;
            c.keep_alive_timeout = timeout;
            c.keep_alive_failures_allowed = failures_allowed;
        })
    }

    /// Set the recovery backoff.
    pub fn reconnect(self, backoff: BackoffConfig) -> Self {
        self.configure(|c| c.reconnect = backoff)
    }

    /// Set the pipelining cap.
    pub fn max_pending_publish_requests(self, max: u32) -> Self {
        self.configure(|c| c.max_pending_publish_requests = max)
    }

    /// Set the identity provider.
    pub fn identity(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(provider);
        self
    }

    /// Set the certificate validator.
    pub fn validator(mut self, validator: Arc<dyn CertificateValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Register a session activity listener before anything connects.
    pub fn activity_listener(mut self, listener: Arc<dyn SessionActivityListener>) -> Self {
        self.activity_listener = Some(listener);
        self
    }

    /// Start with an empty address space.
    pub fn empty_address_space(mut self) -> Self {
        self.seed_address_space = false;
        self
    }

    /// Build the fixture. Must be called inside a tokio runtime.
    pub fn build(self) -> ClientFixture {
        let server = MockServer::with_behavior(self.behavior);
        if self.seed_address_space {
            server.set_value(nodes::temperature(), 20.0);
            server.set_value(nodes::pressure(), 1.0);
            server.set_value(nodes::pump_running(), false);
            server.set_value(nodes::batch_count(), 0);
        }

        let mut builder = UaClient::builder(self.config).transport(server.clone());
        if let Some(identity) = self.identity {
            builder = builder.identity_provider(identity);
        }
        if let Some(validator) = self.validator {
            builder = builder.certificate_validator(validator);
        }
        let client = builder.build().expect("test client builds");

        if let Some(listener) = self.activity_listener {
            client.session_fsm().add_activity_listener(listener);
        }

        ClientFixture { server, client }
    }
}

// =============================================================================
// NotificationMessage Builder
// =============================================================================

/// Builder for [`NotificationMessage`] values.
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    sequence_number: u32,
    changes: Vec<MonitoredItemNotification>,
}

impl NotificationBuilder {
    /// Start a message with `sequence_number`.
    pub fn new(sequence_number: u32) -> Self {
        Self {
            sequence_number,
            changes: Vec::new(),
        }
    }

    /// Add a data change.
    pub fn change(mut self, client_handle: u32, value: impl Into<Variant>) -> Self {
        self.changes.push(MonitoredItemNotification {
            client_handle,
            value: DataValue::new(value),
        });
        self
    }

    /// Build the message. Without changes it is a keep-alive.
    pub fn build(self) -> NotificationMessage {
        let notification_data = if self.changes.is_empty() {
            Vec::new()
        } else {
            vec![NotificationData::DataChange(self.changes)]
        };
        NotificationMessage {
            sequence_number: self.sequence_number,
            publish_time: Utc::now(),
            notification_data,
        }
    }
}
