// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Secure channel transport abstraction.
//!
//! The transport owns sockets, framing, the hello/acknowledge handshake,
//! secure channel open/renew and message encoding. The client core only sees
//! this trait: it transmits correlated requests and receives
//! [`TransportEvent`]s on a sink it attaches once.
//!
//! A transport implementation must:
//! - deliver each response as [`TransportEvent::Response`] with the request id
//!   it was transmitted under;
//! - report a lost channel with [`TransportEvent::ChannelLost`] (pending
//!   requests are then failed by the correlator, not the transport);
//! - make `connect()` idempotent while a channel is open.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{OpcUaError, OpcUaResult};
use crate::message::{RequestMessage, ResponseMessage};
use crate::types::EndpointDescription;

// =============================================================================
// ChannelInfo
// =============================================================================

/// Identity of the currently open secure channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Server-assigned channel id.
    pub channel_id: u32,
    /// Current security token id; changes on renewal.
    pub token_id: u32,
    /// Expiry of the current security token.
    pub token_expires_at: DateTime<Utc>,
    /// Endpoint the channel is open against.
    pub endpoint: EndpointDescription,
}

impl fmt::Display for ChannelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "channel {} (token {}) to {}",
            self.channel_id, self.token_id, self.endpoint.url
        )
    }
}

// =============================================================================
// TransportEvent
// =============================================================================

/// Event pushed by the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A response for `request_id`.
    Response {
        /// Request id the response belongs to.
        request_id: u32,
        /// The decoded response.
        response: ResponseMessage,
    },

    /// The request could not be completed (e.g. decoding failed).
    Failure {
        /// Request id.
        request_id: u32,
        /// Cause.
        error: OpcUaError,
    },

    /// The secure channel was lost.
    ChannelLost {
        /// Reason.
        reason: String,
    },

    /// A channel is open again (possibly a new one).
    ChannelRestored(ChannelInfo),
}

// =============================================================================
// SecureChannelTransport
// =============================================================================

/// Secure channel transport.
#[async_trait]
pub trait SecureChannelTransport: Send + Sync + 'static {
    /// Opens (or returns) the secure channel.
    async fn connect(&self) -> OpcUaResult<ChannelInfo>;

    /// Closes the secure channel.
    async fn disconnect(&self) -> OpcUaResult<()>;

    /// Returns `true` while a channel is open.
    fn is_connected(&self) -> bool;

    /// Encodes and sends `request` tagged with `request_id`.
    ///
    /// Fails with a channel-closed error if no channel is open.
    async fn transmit(&self, request_id: u32, request: RequestMessage) -> OpcUaResult<()>;

    /// Registers the event sink. Called once by the correlator.
    fn attach(&self, sink: mpsc::UnboundedSender<TransportEvent>);
}

// =============================================================================
// ChannelEvent
// =============================================================================

/// Channel change observed by upper layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel went away.
    Lost {
        /// Reason reported by the transport.
        reason: String,
    },
    /// A channel is open.
    Restored(ChannelInfo),
}
