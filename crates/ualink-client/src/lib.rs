// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # ualink-client
//!
//! OPC UA client core on top of a pluggable secure channel transport.
//!
//! ## Components
//!
//! - **Correlator**: matches responses to requests by handle, enforces
//!   timeouts and fails pending requests when the channel drops
//! - **Session**: actor-driven state machine that creates, activates,
//!   reactivates and closes sessions, and watches server liveness
//! - **Publish**: pipelined Publish loop with per-subscription sequence
//!   tracking, acknowledgements and Republish of gaps
//! - **Subscription**: subscription and monitored item services, plus
//!   transfer or recreation after a session is replaced
//! - **Client**: facade sequencing all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         UaClient                         │
//! ├──────────────┬─────────────────────┬─────────────────────┤
//! │  SessionFsm  │ SubscriptionManager │   LifecycleManager  │
//! │  (actor)     │   + PublishEngine   │                     │
//! ├──────────────┴─────────────────────┴─────────────────────┤
//! │                    RequestCorrelator                     │
//! ├──────────────────────────────────────────────────────────┤
//! │              dyn SecureChannelTransport                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ualink_client::{ClientConfig, UaClient, ChannelListener, MonitoredItemRequest, NodeId};
//!
//! let config = ClientConfig::builder()
//!     .endpoint("opc.tcp://localhost:4840")
//!     .build()?;
//! let client = UaClient::builder(config).transport(transport).build()?;
//! client.connect().await?;
//!
//! let (listener, mut events) = ChannelListener::new();
//! let subscription = client.create_default_subscription(listener).await?;
//! client
//!     .add_monitored_item(&subscription, MonitoredItemRequest::value_of(NodeId::string(2, "Temp")))
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod identity;
pub mod message;
pub mod publish;
pub mod session;
pub mod stats;
pub mod subscription;
pub mod transport;
pub mod types;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use client::{UaClient, UaClientBuilder};
pub use config::{ClientConfig, ClientConfigBuilder, MonitoredItemSettings, SubscriptionSettings};
pub use correlator::RequestCorrelator;
pub use error::{
    ConfigurationError, ErrorCode, ErrorSeverity, OpcUaError, OpcUaResult, SecurityError,
    ServiceError, SessionError, SubscriptionError, TimeoutError, TransportError,
};
pub use identity::{
    AnonymousProvider, CertificateValidator, IdentityProvider, InsecureValidator,
    ThumbprintValidator, UsernameProvider,
};
pub use message::{
    NotificationData, NotificationMessage, RequestKind, RequestMessage, ResponseMessage,
    UaRequest, UaResponse, WriteValue,
};
pub use publish::{NotificationSequencer, PublishEngine};
pub use session::{
    Session, SessionActivation, SessionActivityListener, SessionFsm, SessionFuture, SessionState,
};
pub use stats::{ClientStats, StatsSnapshot};
pub use subscription::{
    ChannelListener, MonitoredItem, MonitoredItemRequest, RevisedParameters, Subscription,
    SubscriptionEvent, SubscriptionListener, SubscriptionManager,
};
pub use transport::{ChannelEvent, ChannelInfo, SecureChannelTransport, TransportEvent};
pub use types::{
    DataValue, EndpointDescription, MonitoringMode, NodeId, ReadValueId, SecurityMode,
    SecurityPolicy, StatusCode, TimestampsToReturn, Variant,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
