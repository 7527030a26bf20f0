// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Service message model.
//!
//! Requests and responses are tagged unions ([`UaRequest`], [`UaResponse`])
//! discriminated by [`RequestKind`]. Each kind carries the binary encoding
//! type ids of its request and response so that a codec can resolve a body
//! through [`MessageKind::from_type_id`]. Encoding itself lives behind the
//! transport.
//!
//! ```
//! use ualink_client::message::{MessageKind, RequestKind};
//!
//! assert_eq!(RequestKind::Publish.request_type_id(), 826);
//! assert_eq!(MessageKind::from_type_id(829), Some(MessageKind::Response(RequestKind::Publish)));
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{
    DataChangeFilter, DataValue, EndpointDescription, MonitoringMode, NodeId, ReadValueId,
    StatusCode, TimestampsToReturn, Variant,
};

// =============================================================================
// Service table
// =============================================================================

macro_rules! services {
    ($($kind:ident($req:ident, $resp:ident) = $id:literal, $doc:literal;)*) => {
        /// Service discriminator.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum RequestKind {
            $(
                #[doc = $doc]
                $kind,
            )*
        }

        impl RequestKind {
            /// All services, in declaration order.
            pub const ALL: &'static [RequestKind] = &[$(RequestKind::$kind,)*];

            /// Service name.
            pub const fn name(&self) -> &'static str {
                match self {
                    $(Self::$kind => stringify!($kind),)*
                }
            }

            /// Binary encoding id of the request body.
            pub const fn request_type_id(&self) -> u32 {
                match self {
                    $(Self::$kind => $id,)*
                }
            }

            /// Binary encoding id of the response body.
            pub const fn response_type_id(&self) -> u32 {
                self.request_type_id() + 3
            }
        }

        /// Request body.
        #[derive(Debug, Clone)]
        pub enum UaRequest {
            $(
                #[doc = $doc]
                $kind($req),
            )*
        }

        impl UaRequest {
            /// Service kind of this body.
            pub fn kind(&self) -> RequestKind {
                match self {
                    $(Self::$kind(_) => RequestKind::$kind,)*
                }
            }
        }

        $(
            impl From<$req> for UaRequest {
                fn from(body: $req) -> Self {
                    Self::$kind(body)
                }
            }
        )*

        /// Response body.
        #[derive(Debug, Clone)]
        pub enum UaResponse {
            $(
                #[doc = $doc]
                $kind($resp),
            )*
            /// The server rejected the request; the status is in the header.
            ServiceFault,
        }

        impl UaResponse {
            /// Service kind, `None` for a fault.
            pub fn kind(&self) -> Option<RequestKind> {
                match self {
                    $(Self::$kind(_) => Some(RequestKind::$kind),)*
                    Self::ServiceFault => None,
                }
            }
        }

        $(
            impl From<$resp> for UaResponse {
                fn from(body: $resp) -> Self {
                    Self::$kind(body)
                }
            }
        )*
    };
}

services! {
    CreateSession(CreateSessionRequest, CreateSessionResponse) = 461, "CreateSession";
    ActivateSession(ActivateSessionRequest, ActivateSessionResponse) = 467, "ActivateSession";
    CloseSession(CloseSessionRequest, CloseSessionResponse) = 473, "CloseSession";
    Read(ReadRequest, ReadResponse) = 631, "Read";
    Write(WriteRequest, WriteResponse) = 673, "Write";
    CreateMonitoredItems(CreateMonitoredItemsRequest, CreateMonitoredItemsResponse) = 751, "CreateMonitoredItems";
    ModifyMonitoredItems(ModifyMonitoredItemsRequest, ModifyMonitoredItemsResponse) = 763, "ModifyMonitoredItems";
    SetMonitoringMode(SetMonitoringModeRequest, SetMonitoringModeResponse) = 769, "SetMonitoringMode";
    DeleteMonitoredItems(DeleteMonitoredItemsRequest, DeleteMonitoredItemsResponse) = 781, "DeleteMonitoredItems";
    CreateSubscription(CreateSubscriptionRequest, CreateSubscriptionResponse) = 787, "CreateSubscription";
    ModifySubscription(ModifySubscriptionRequest, ModifySubscriptionResponse) = 793, "ModifySubscription";
    SetPublishingMode(SetPublishingModeRequest, SetPublishingModeResponse) = 799, "SetPublishingMode";
    Publish(PublishRequest, PublishResponse) = 826, "Publish";
    Republish(RepublishRequest, RepublishResponse) = 832, "Republish";
    TransferSubscriptions(TransferSubscriptionsRequest, TransferSubscriptionsResponse) = 841, "TransferSubscriptions";
    DeleteSubscriptions(DeleteSubscriptionsRequest, DeleteSubscriptionsResponse) = 847, "DeleteSubscriptions";
}

/// Binary encoding id of `ServiceFault`.
pub const SERVICE_FAULT_TYPE_ID: u32 = 397;

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl UaResponse {
    /// Name for diagnostics.
    pub fn name(&self) -> &'static str {
        self.kind().map(|k| k.name()).unwrap_or("ServiceFault")
    }
}

/// Registry entry resolved from a binary type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A request body.
    Request(RequestKind),
    /// A response body.
    Response(RequestKind),
    /// A service fault.
    ServiceFault,
}

impl MessageKind {
    /// Resolves a binary encoding id.
    pub fn from_type_id(type_id: u32) -> Option<Self> {
        if type_id == SERVICE_FAULT_TYPE_ID {
            return Some(Self::ServiceFault);
        }
        RequestKind::ALL.iter().find_map(|kind| {
            if kind.request_type_id() == type_id {
                Some(Self::Request(*kind))
            } else if kind.response_type_id() == type_id {
                Some(Self::Response(*kind))
            } else {
                None
            }
        })
    }
}

/// Extracts the expected response body or fails with an unexpected response.
macro_rules! expect_response {
    ($response:expr, $kind:ident) => {
        match $response.body {
            $crate::message::UaResponse::$kind(body) => Ok(body),
            other => Err($crate::error::OpcUaError::unexpected_response(
                $crate::message::RequestKind::$kind,
                other.name(),
            )),
        }
    };
}

pub(crate) use expect_response;

// =============================================================================
// Headers and envelopes
// =============================================================================

/// Common request header.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeader {
    /// Session authentication token; null before CreateSession.
    pub authentication_token: NodeId,
    /// Client timestamp.
    pub timestamp: DateTime<Utc>,
    /// Request handle; the correlator stamps the request id here.
    pub request_handle: u32,
    /// Timeout hint; zero means no local deadline.
    pub timeout_hint: Duration,
}

impl RequestHeader {
    /// Header without a session token.
    pub fn new(timeout_hint: Duration) -> Self {
        Self {
            authentication_token: NodeId::NULL,
            timestamp: Utc::now(),
            request_handle: 0,
            timeout_hint,
        }
    }

    /// Header carrying a session token.
    pub fn with_token(authentication_token: NodeId, timeout_hint: Duration) -> Self {
        Self {
            authentication_token,
            ..Self::new(timeout_hint)
        }
    }
}

/// Common response header.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHeader {
    /// Server timestamp.
    pub timestamp: DateTime<Utc>,
    /// Echo of the request handle.
    pub request_handle: u32,
    /// Overall service result.
    pub service_result: StatusCode,
}

impl ResponseHeader {
    /// Good header for `request_handle`.
    pub fn good(request_handle: u32) -> Self {
        Self::with_status(request_handle, StatusCode::GOOD)
    }

    /// Header with a given service result.
    pub fn with_status(request_handle: u32, service_result: StatusCode) -> Self {
        Self {
            timestamp: Utc::now(),
            request_handle,
            service_result,
        }
    }
}

/// A request on its way to the transport.
#[derive(Debug, Clone)]
pub struct RequestMessage {
    /// Header.
    pub header: RequestHeader,
    /// Body.
    pub body: UaRequest,
}

impl RequestMessage {
    /// Creates a request message.
    pub fn new(header: RequestHeader, body: impl Into<UaRequest>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// Service kind.
    pub fn kind(&self) -> RequestKind {
        self.body.kind()
    }
}

/// A response from the transport.
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    /// Header.
    pub header: ResponseHeader,
    /// Body.
    pub body: UaResponse,
}

impl ResponseMessage {
    /// Good response.
    pub fn new(request_handle: u32, body: impl Into<UaResponse>) -> Self {
        Self {
            header: ResponseHeader::good(request_handle),
            body: body.into(),
        }
    }

    /// Service fault.
    pub fn fault(request_handle: u32, status: StatusCode) -> Self {
        Self {
            header: ResponseHeader::with_status(request_handle, status),
            body: UaResponse::ServiceFault,
        }
    }
}

// =============================================================================
// Session services
// =============================================================================

/// Client application description.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplicationDescription {
    /// Application URI.
    pub application_uri: String,
    /// Application name.
    pub application_name: String,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub client_description: ApplicationDescription,
    pub endpoint_url: String,
    pub session_name: String,
    pub client_nonce: Vec<u8>,
    pub requested_session_timeout: Duration,
    pub max_response_message_size: u32,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct CreateSessionResponse {
    pub session_id: NodeId,
    pub authentication_token: NodeId,
    pub revised_session_timeout: Duration,
    pub server_nonce: Vec<u8>,
    /// DER-encoded certificate chain, leaf first.
    pub server_certificate: Vec<u8>,
    pub server_endpoints: Vec<EndpointDescription>,
    pub max_request_message_size: u32,
}

/// User identity token presented in ActivateSession.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityToken {
    /// Anonymous user.
    Anonymous {
        /// User token policy id.
        policy_id: String,
    },
    /// User name and password.
    UserName {
        /// User token policy id.
        policy_id: String,
        /// User name.
        user_name: String,
        /// Password, possibly encrypted.
        password: Vec<u8>,
        /// Encryption algorithm URI, `None` when sent in the clear.
        encryption_algorithm: Option<String>,
    },
}

/// Signature over the server certificate and nonce.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignatureData {
    /// Algorithm URI.
    pub algorithm: Option<String>,
    /// Signature bytes.
    pub signature: Vec<u8>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct ActivateSessionRequest {
    pub client_signature: SignatureData,
    pub user_identity_token: IdentityToken,
    pub user_token_signature: SignatureData,
    pub locale_ids: Vec<String>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default)]
pub struct ActivateSessionResponse {
    pub server_nonce: Vec<u8>,
    pub results: Vec<StatusCode>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct CloseSessionRequest {
    pub delete_subscriptions: bool,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default)]
pub struct CloseSessionResponse;

// =============================================================================
// Attribute services
// =============================================================================

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub max_age: Duration,
    pub timestamps_to_return: TimestampsToReturn,
    pub nodes_to_read: Vec<ReadValueId>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default)]
pub struct ReadResponse {
    pub results: Vec<DataValue>,
}

/// A value to write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteValue {
    /// Target node.
    pub node_id: NodeId,
    /// Target attribute.
    pub attribute_id: u32,
    /// Value to write.
    pub value: DataValue,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub nodes_to_write: Vec<WriteValue>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default)]
pub struct WriteResponse {
    pub results: Vec<StatusCode>,
}

// =============================================================================
// Monitored item services
// =============================================================================

/// Requested sampling parameters of a monitored item.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringParameters {
    /// Client handle echoed in notifications.
    pub client_handle: u32,
    /// Sampling interval.
    pub sampling_interval: Duration,
    /// Optional deadband filter.
    pub filter: Option<DataChangeFilter>,
    /// Server-side queue size.
    pub queue_size: u32,
    /// Discard policy.
    pub discard_oldest: bool,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemCreateRequest {
    pub item_to_monitor: ReadValueId,
    pub monitoring_mode: MonitoringMode,
    pub requested_parameters: MonitoringParameters,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemCreateResult {
    pub status_code: StatusCode,
    pub monitored_item_id: u32,
    pub revised_sampling_interval: Duration,
    pub revised_queue_size: u32,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemModifyRequest {
    pub monitored_item_id: u32,
    pub requested_parameters: MonitoringParameters,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemModifyResult {
    pub status_code: StatusCode,
    pub revised_sampling_interval: Duration,
    pub revised_queue_size: u32,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct CreateMonitoredItemsRequest {
    pub subscription_id: u32,
    pub timestamps_to_return: TimestampsToReturn,
    pub items_to_create: Vec<MonitoredItemCreateRequest>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default)]
pub struct CreateMonitoredItemsResponse {
    pub results: Vec<MonitoredItemCreateResult>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct ModifyMonitoredItemsRequest {
    pub subscription_id: u32,
    pub timestamps_to_return: TimestampsToReturn,
    pub items_to_modify: Vec<MonitoredItemModifyRequest>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default)]
pub struct ModifyMonitoredItemsResponse {
    pub results: Vec<MonitoredItemModifyResult>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct SetMonitoringModeRequest {
    pub subscription_id: u32,
    pub monitoring_mode: MonitoringMode,
    pub monitored_item_ids: Vec<u32>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default)]
pub struct SetMonitoringModeResponse {
    pub results: Vec<StatusCode>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct DeleteMonitoredItemsRequest {
    pub subscription_id: u32,
    pub monitored_item_ids: Vec<u32>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default)]
pub struct DeleteMonitoredItemsResponse {
    pub results: Vec<StatusCode>,
}

// =============================================================================
// Subscription services
// =============================================================================

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub requested_publishing_interval: Duration,
    pub requested_lifetime_count: u32,
    pub requested_max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub publishing_enabled: bool,
    pub priority: u8,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct CreateSubscriptionResponse {
    pub subscription_id: u32,
    pub revised_publishing_interval: Duration,
    pub revised_lifetime_count: u32,
    pub revised_max_keep_alive_count: u32,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct ModifySubscriptionRequest {
    pub subscription_id: u32,
    pub requested_publishing_interval: Duration,
    pub requested_lifetime_count: u32,
    pub requested_max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub priority: u8,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct ModifySubscriptionResponse {
    pub revised_publishing_interval: Duration,
    pub revised_lifetime_count: u32,
    pub revised_max_keep_alive_count: u32,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct SetPublishingModeRequest {
    pub publishing_enabled: bool,
    pub subscription_ids: Vec<u32>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default)]
pub struct SetPublishingModeResponse {
    pub results: Vec<StatusCode>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct TransferSubscriptionsRequest {
    pub subscription_ids: Vec<u32>,
    pub send_initial_values: bool,
}

/// Per-subscription outcome of TransferSubscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    /// Transfer status.
    pub status_code: StatusCode,
    /// Sequence numbers still available for republish.
    pub available_sequence_numbers: Vec<u32>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default)]
pub struct TransferSubscriptionsResponse {
    pub results: Vec<TransferResult>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct DeleteSubscriptionsRequest {
    pub subscription_ids: Vec<u32>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default)]
pub struct DeleteSubscriptionsResponse {
    pub results: Vec<StatusCode>,
}

// =============================================================================
// Publish
// =============================================================================

/// Acknowledges a processed notification message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionAcknowledgement {
    /// Subscription id.
    pub subscription_id: u32,
    /// Acknowledged sequence number.
    pub sequence_number: u32,
}

/// A data change for one monitored item.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemNotification {
    /// Client handle of the item.
    pub client_handle: u32,
    /// New value.
    pub value: DataValue,
}

/// Event fields for one monitored item.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFieldList {
    /// Client handle of the item.
    pub client_handle: u32,
    /// Selected event fields.
    pub event_fields: Vec<Variant>,
}

/// One notification block inside a [`NotificationMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationData {
    /// Data changes.
    DataChange(Vec<MonitoredItemNotification>),
    /// Events.
    Event(Vec<EventFieldList>),
    /// Subscription status change.
    StatusChange(StatusCode),
}

/// A sequenced message from the server's retransmission queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    /// Sequence number, per subscription.
    pub sequence_number: u32,
    /// Publish time.
    pub publish_time: DateTime<Utc>,
    /// Notification blocks. Empty for a keep-alive.
    pub notification_data: Vec<NotificationData>,
}

impl NotificationMessage {
    /// Keep-alive carrying the next sequence number to expect.
    pub fn keep_alive(next_sequence_number: u32) -> Self {
        Self {
            sequence_number: next_sequence_number,
            publish_time: Utc::now(),
            notification_data: Vec::new(),
        }
    }

    /// Returns `true` for a keep-alive.
    pub fn is_keep_alive(&self) -> bool {
        self.notification_data.is_empty()
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub subscription_acknowledgements: Vec<SubscriptionAcknowledgement>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct PublishResponse {
    pub subscription_id: u32,
    pub available_sequence_numbers: Vec<u32>,
    pub more_notifications: bool,
    pub notification_message: NotificationMessage,
    /// Results of the acknowledgements, in request order.
    pub results: Vec<StatusCode>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct RepublishRequest {
    pub subscription_id: u32,
    pub retransmit_sequence_number: u32,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct RepublishResponse {
    pub notification_message: NotificationMessage,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_registry() {
        for kind in RequestKind::ALL {
            assert_eq!(
                MessageKind::from_type_id(kind.request_type_id()),
                Some(MessageKind::Request(*kind))
            );
            assert_eq!(
                MessageKind::from_type_id(kind.response_type_id()),
                Some(MessageKind::Response(*kind))
            );
        }
        assert_eq!(MessageKind::from_type_id(397), Some(MessageKind::ServiceFault));
        assert_eq!(MessageKind::from_type_id(1), None);
    }

    #[test]
    fn test_kind_of_bodies() {
        let request = RequestMessage::new(
            RequestHeader::new(Duration::ZERO),
            CloseSessionRequest {
                delete_subscriptions: true,
            },
        );
        assert_eq!(request.kind(), RequestKind::CloseSession);

        let fault = ResponseMessage::fault(7, StatusCode::BAD_SESSION_ID_INVALID);
        assert_eq!(fault.body.kind(), None);
        assert_eq!(fault.body.name(), "ServiceFault");
        assert_eq!(fault.header.request_handle, 7);
    }

    #[test]
    fn test_expect_response() {
        let response = ResponseMessage::new(1, ReadResponse::default());
        let body = expect_response!(response, Read);
        assert!(body.is_ok());

        let response = ResponseMessage::new(1, WriteResponse::default());
        let err = expect_response!(response, Read).unwrap_err();
        assert!(err.to_string().contains("unexpected response 'Write'"));
    }

    #[test]
    fn test_keep_alive_message() {
        let message = NotificationMessage::keep_alive(5);
        assert!(message.is_keep_alive());
        assert_eq!(message.sequence_number, 5);
        assert_eq!(RequestKind::TransferSubscriptions.to_string(), "TransferSubscriptions");
    }
}
