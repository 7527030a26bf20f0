// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA value types used by the client core.
//!
//! - **StatusCode**: 32-bit result codes with the well-known constants the
//!   session and subscription machinery branches on
//! - **NodeId**: the four identifier kinds with `ns=2;s=Name` parsing
//! - **Variant / DataValue**: values carried by reads, writes and notifications
//! - **SecurityMode / SecurityPolicy / EndpointDescription**: channel security
//! - **MonitoringMode / TimestampsToReturn / DataChangeFilter**: monitoring
//!
//! # Examples
//!
//! ```
//! use ualink_client::types::{NodeId, StatusCode};
//!
//! let node: NodeId = "ns=2;s=Boiler.Temperature".parse().unwrap();
//! assert_eq!(node.namespace_index, 2);
//!
//! assert!(StatusCode::BAD_TIMEOUT.is_bad());
//! assert_eq!(StatusCode::BAD_TIMEOUT.name(), "Bad_Timeout");
//! ```

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigurationError, OpcUaError};

// =============================================================================
// StatusCode
// =============================================================================

/// OPC UA status code.
///
/// The top two bits carry severity: `00` good, `01` uncertain, `10` bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

macro_rules! status_codes {
    ($($name:ident = $value:literal, $text:literal;)*) => {
        impl StatusCode {
            $(
                #[doc = $text]
                pub const $name: StatusCode = StatusCode($value);
            )*

            /// Returns the symbolic name, or `"Unknown"`.
            pub fn name(&self) -> &'static str {
                match self.0 & 0xFFFF_0000 {
                    $($value => $text,)*
                    _ => "Unknown",
                }
            }
        }
    };
}

status_codes! {
    GOOD = 0x0000_0000, "Good";
    BAD_UNEXPECTED_ERROR = 0x8001_0000, "Bad_UnexpectedError";
    BAD_INTERNAL_ERROR = 0x8002_0000, "Bad_InternalError";
    BAD_COMMUNICATION_ERROR = 0x8005_0000, "Bad_CommunicationError";
    BAD_UNKNOWN_RESPONSE = 0x8009_0000, "Bad_UnknownResponse";
    BAD_TIMEOUT = 0x800A_0000, "Bad_Timeout";
    BAD_SERVICE_UNSUPPORTED = 0x800B_0000, "Bad_ServiceUnsupported";
    BAD_SHUTDOWN = 0x800C_0000, "Bad_Shutdown";
    BAD_SERVER_HALTED = 0x800E_0000, "Bad_ServerHalted";
    BAD_NOTHING_TO_DO = 0x800F_0000, "Bad_NothingToDo";
    BAD_SECURITY_CHECKS_FAILED = 0x8013_0000, "Bad_SecurityChecksFailed";
    BAD_IDENTITY_TOKEN_REJECTED = 0x8021_0000, "Bad_IdentityTokenRejected";
    BAD_SESSION_ID_INVALID = 0x8025_0000, "Bad_SessionIdInvalid";
    BAD_SESSION_CLOSED = 0x8026_0000, "Bad_SessionClosed";
    BAD_SESSION_NOT_ACTIVATED = 0x8027_0000, "Bad_SessionNotActivated";
    BAD_SUBSCRIPTION_ID_INVALID = 0x8028_0000, "Bad_SubscriptionIdInvalid";
    GOOD_SUBSCRIPTION_TRANSFERRED = 0x002D_0000, "Good_SubscriptionTransferred";
    BAD_NODE_ID_UNKNOWN = 0x8034_0000, "Bad_NodeIdUnknown";
    BAD_NOT_SUPPORTED = 0x803D_0000, "Bad_NotSupported";
    BAD_NOT_IMPLEMENTED = 0x8040_0000, "Bad_NotImplemented";
    BAD_MONITORED_ITEM_ID_INVALID = 0x8042_0000, "Bad_MonitoredItemIdInvalid";
    BAD_TOO_MANY_SUBSCRIPTIONS = 0x8077_0000, "Bad_TooManySubscriptions";
    BAD_TOO_MANY_PUBLISH_REQUESTS = 0x8078_0000, "Bad_TooManyPublishRequests";
    BAD_NO_SUBSCRIPTION = 0x8079_0000, "Bad_NoSubscription";
    BAD_SEQUENCE_NUMBER_UNKNOWN = 0x807A_0000, "Bad_SequenceNumberUnknown";
    BAD_MESSAGE_NOT_AVAILABLE = 0x807B_0000, "Bad_MessageNotAvailable";
    BAD_REQUEST_TIMEOUT = 0x8085_0000, "Bad_RequestTimeout";
    BAD_SECURE_CHANNEL_CLOSED = 0x8086_0000, "Bad_SecureChannelClosed";
    BAD_CONFIGURATION_ERROR = 0x8089_0000, "Bad_ConfigurationError";
    BAD_NOT_CONNECTED = 0x808A_0000, "Bad_NotConnected";
    BAD_OUT_OF_SERVICE = 0x808D_0000, "Bad_OutOfService";
    BAD_INVALID_ARGUMENT = 0x80AB_0000, "Bad_InvalidArgument";
    BAD_CONNECTION_CLOSED = 0x80AE_0000, "Bad_ConnectionClosed";
    BAD_INVALID_STATE = 0x80AF_0000, "Bad_InvalidState";
}

impl StatusCode {
    /// Returns `true` for good codes.
    #[inline]
    pub const fn is_good(&self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    /// Returns `true` for uncertain codes.
    #[inline]
    pub const fn is_uncertain(&self) -> bool {
        self.0 & 0xC000_0000 == 0x4000_0000
    }

    /// Returns `true` for bad codes.
    #[inline]
    pub const fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Compares the code part, ignoring info bits.
    #[inline]
    pub const fn matches(&self, other: StatusCode) -> bool {
        self.0 & 0xFFFF_0000 == other.0 & 0xFFFF_0000
    }

    /// Codes reported when the secure channel under a request went away.
    pub fn is_channel_closed(&self) -> bool {
        [
            Self::BAD_SECURE_CHANNEL_CLOSED,
            Self::BAD_CONNECTION_CLOSED,
            Self::BAD_NOT_CONNECTED,
            Self::BAD_COMMUNICATION_ERROR,
        ]
        .iter()
        .any(|c| self.matches(*c))
    }

    /// Codes meaning the server no longer knows the session.
    pub fn is_session_invalid(&self) -> bool {
        [
            Self::BAD_SESSION_ID_INVALID,
            Self::BAD_SESSION_CLOSED,
            Self::BAD_SESSION_NOT_ACTIVATED,
        ]
        .iter()
        .any(|c| self.matches(*c))
    }

    /// Republish codes meaning the message is gone for good.
    pub fn is_message_unavailable(&self) -> bool {
        self.matches(Self::BAD_MESSAGE_NOT_AVAILABLE) || self.matches(Self::BAD_SEQUENCE_NUMBER_UNKNOWN)
    }

    /// Codes meaning the server does not implement TransferSubscriptions.
    pub fn is_service_unsupported(&self) -> bool {
        [
            Self::BAD_NOT_IMPLEMENTED,
            Self::BAD_NOT_SUPPORTED,
            Self::BAD_OUT_OF_SERVICE,
            Self::BAD_SERVICE_UNSUPPORTED,
        ]
        .iter()
        .any(|c| self.matches(*c))
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.0)
    }
}

impl From<u32> for StatusCode {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

// =============================================================================
// NodeId
// =============================================================================

/// OPC UA node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// Namespace index (0 = OPC UA standard namespace).
    pub namespace_index: u16,

    /// The node identifier.
    pub identifier: NodeIdentifier,
}

impl NodeId {
    /// Creates a numeric node ID.
    #[inline]
    pub fn numeric(namespace_index: u16, value: u32) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Numeric(value),
        }
    }

    /// Creates a string node ID.
    #[inline]
    pub fn string(namespace_index: u16, value: impl Into<String>) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::String(value.into()),
        }
    }

    /// Creates a GUID node ID.
    #[inline]
    pub fn guid(namespace_index: u16, value: Uuid) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Guid(value),
        }
    }

    /// Creates an opaque (byte string) node ID.
    #[inline]
    pub fn opaque(namespace_index: u16, value: Vec<u8>) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Opaque(value),
        }
    }

    /// The null node id (ns=0, i=0).
    pub const NULL: NodeId = NodeId {
        namespace_index: 0,
        identifier: NodeIdentifier::Numeric(0),
    };

    /// `Server_ServerStatus_State` (ns=0, i=2259), read by the session keep-alive.
    pub const SERVER_STATUS_STATE: NodeId = NodeId {
        namespace_index: 0,
        identifier: NodeIdentifier::Numeric(2259),
    };

    /// Returns `true` for the null node id.
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Formats as `ns=X;T=V`, omitting `ns=0;`.
    pub fn to_opc_string(&self) -> String {
        if self.namespace_index == 0 {
            self.identifier.to_string()
        } else {
            format!("ns={};{}", self.namespace_index, self.identifier)
        }
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_opc_string())
    }
}

impl FromStr for NodeId {
    type Err = OpcUaError;

    /// Parses `ns=2;i=1001`, `ns=2;s=Name`, `ns=2;g=<uuid>`, `ns=2;b=<base64>`
    /// and the same forms without the namespace prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: &str| OpcUaError::from(ConfigurationError::invalid_node_id(s, reason));

        let (namespace_index, identifier_part) = match s.strip_prefix("ns=") {
            Some(rest) => {
                let (ns, id) = rest
                    .split_once(';')
                    .ok_or_else(|| invalid("Missing identifier after namespace"))?;
                let ns: u16 = ns.parse().map_err(|_| invalid("Invalid namespace index"))?;
                (ns, id)
            }
            None => (0, s),
        };

        let identifier = if let Some(id) = identifier_part.strip_prefix("i=") {
            NodeIdentifier::Numeric(id.parse().map_err(|_| invalid("Invalid numeric identifier"))?)
        } else if let Some(id) = identifier_part.strip_prefix("s=") {
            NodeIdentifier::String(id.to_string())
        } else if let Some(id) = identifier_part.strip_prefix("g=") {
            NodeIdentifier::Guid(Uuid::parse_str(id).map_err(|e| invalid(&format!("Invalid GUID: {e}")))?)
        } else if let Some(id) = identifier_part.strip_prefix("b=") {
            NodeIdentifier::Opaque(BASE64.decode(id).map_err(|e| invalid(&format!("Invalid base64: {e}")))?)
        } else {
            return Err(invalid("Unknown identifier type. Expected i=, s=, g=, or b="));
        };

        Ok(Self {
            namespace_index,
            identifier,
        })
    }
}

/// OPC UA node identifier kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum NodeIdentifier {
    /// Numeric identifier.
    Numeric(u32),
    /// String identifier.
    String(String),
    /// GUID identifier.
    Guid(Uuid),
    /// Opaque identifier.
    Opaque(Vec<u8>),
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "i={}", v),
            Self::String(v) => write!(f, "s={}", v),
            Self::Guid(v) => write!(f, "g={}", v),
            Self::Opaque(v) => write!(f, "b={}", BASE64.encode(v)),
        }
    }
}

// =============================================================================
// Attribute / ReadValueId
// =============================================================================

/// Attribute id of the `Value` attribute.
pub const ATTRIBUTE_VALUE: u32 = 13;

/// A (node, attribute) pair to read or monitor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadValueId {
    /// Node to read.
    pub node_id: NodeId,
    /// Attribute id, usually [`ATTRIBUTE_VALUE`].
    pub attribute_id: u32,
    /// Optional index range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_range: Option<String>,
}

impl ReadValueId {
    /// Targets the `Value` attribute of `node_id`.
    pub fn value_of(node_id: NodeId) -> Self {
        Self {
            node_id,
            attribute_id: ATTRIBUTE_VALUE,
            index_range: None,
        }
    }
}

// =============================================================================
// Variant / DataValue
// =============================================================================

/// A dynamically typed OPC UA value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Variant {
    /// Null value.
    #[default]
    Null,
    /// Boolean value.
    Boolean(bool),
    /// 32-bit signed integer.
    Int32(i32),
    /// 32-bit unsigned integer.
    UInt32(u32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit unsigned integer.
    UInt64(u64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit double.
    Double(f64),
    /// String value.
    String(String),
    /// Date/time value.
    DateTime(DateTime<Utc>),
    /// Byte string.
    ByteString(Vec<u8>),
    /// Status code.
    StatusCode(StatusCode),
    /// Array of values.
    Array(Vec<Variant>),
}

impl Variant {
    /// Returns `true` for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Attempts to get the value as an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Boolean(v) => Some(i64::from(*v)),
            Self::Int32(v) => Some(i64::from(*v)),
            Self::UInt32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            Self::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Attempts to get the value as an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(f64::from(*v)),
            Self::Double(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

/// A value with status and timestamps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataValue {
    /// The value.
    pub value: Variant,
    /// Status of the value.
    pub status: StatusCode,
    /// Source timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Server timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    /// Good value stamped with the current time.
    pub fn new(value: impl Into<Variant>) -> Self {
        let now = Utc::now();
        Self {
            value: value.into(),
            status: StatusCode::GOOD,
            source_timestamp: Some(now),
            server_timestamp: Some(now),
        }
    }

    /// Value-less data value with a status.
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }
}

// =============================================================================
// Security
// =============================================================================

/// OPC UA message security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// No security.
    #[default]
    None,
    /// Messages are signed.
    Sign,
    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

impl SecurityMode {
    /// Returns `true` if this mode provides no security.
    #[inline]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns the display name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Sign => "Sign",
            Self::SignAndEncrypt => "SignAndEncrypt",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SecurityMode {
    type Err = OpcUaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "none" => Ok(Self::None),
            "sign" => Ok(Self::Sign),
            "signandencrypt" | "signencrypt" => Ok(Self::SignAndEncrypt),
            _ => Err(ConfigurationError::invalid_value("security_mode", s).into()),
        }
    }
}

/// OPC UA security policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityPolicy {
    /// No security policy.
    #[default]
    None,
    /// Basic256Sha256.
    Basic256Sha256,
    /// Aes128_Sha256_RsaOaep.
    Aes128Sha256RsaOaep,
    /// Aes256_Sha256_RsaPss.
    Aes256Sha256RsaPss,
}

impl SecurityPolicy {
    /// Returns the policy URI.
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            Self::Basic256Sha256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256",
            Self::Aes128Sha256RsaOaep => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep"
            }
            Self::Aes256Sha256RsaPss => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss"
            }
        }
    }

    /// Resolves a policy from its URI.
    pub fn from_uri(uri: &str) -> Option<Self> {
        [
            Self::None,
            Self::Basic256Sha256,
            Self::Aes128Sha256RsaOaep,
            Self::Aes256Sha256RsaPss,
        ]
        .into_iter()
        .find(|p| p.uri() == uri)
    }
}

/// The endpoint a channel is opened against.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndpointDescription {
    /// Endpoint URL.
    pub url: String,
    /// Security policy.
    pub security_policy: SecurityPolicy,
    /// Security mode.
    pub security_mode: SecurityMode,
    /// DER-encoded server certificate, empty when unsecured.
    #[serde(default)]
    pub server_certificate: Vec<u8>,
}

// =============================================================================
// Monitoring
// =============================================================================

/// Monitoring mode of a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringMode {
    /// Not sampled, not reported.
    Disabled,
    /// Sampled but not reported.
    Sampling,
    /// Sampled and reported.
    #[default]
    Reporting,
}

/// Timestamps the server should include in notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampsToReturn {
    /// Source timestamp only.
    Source,
    /// Server timestamp only.
    Server,
    /// Both timestamps.
    #[default]
    Both,
    /// No timestamps.
    Neither,
}

/// Deadband filter for data change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DataChangeFilter {
    /// Report when the absolute change exceeds the value.
    Absolute(f64),
    /// Report when the change exceeds a percentage of the EU range.
    Percent(f64),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_severity() {
        assert!(StatusCode::GOOD.is_good());
        assert!(!StatusCode::GOOD.is_bad());
        assert!(StatusCode::BAD_NO_SUBSCRIPTION.is_bad());
        assert!(StatusCode(0x4000_0000).is_uncertain());
        assert!(StatusCode::GOOD_SUBSCRIPTION_TRANSFERRED.is_good());
    }

    #[test]
    fn test_status_code_name_ignores_info_bits() {
        let with_info = StatusCode(StatusCode::BAD_TIMEOUT.0 | 0x0000_0400);
        assert_eq!(with_info.name(), "Bad_Timeout");
        assert!(with_info.matches(StatusCode::BAD_TIMEOUT));
        assert_eq!(StatusCode(0x8FFF_0000).name(), "Unknown");
    }

    #[test]
    fn test_status_code_display() {
        assert_eq!(
            StatusCode::BAD_SUBSCRIPTION_ID_INVALID.to_string(),
            "Bad_SubscriptionIdInvalid (0x80280000)"
        );
    }

    #[test]
    fn test_status_code_groups() {
        assert!(StatusCode::BAD_SECURE_CHANNEL_CLOSED.is_channel_closed());
        assert!(StatusCode::BAD_SESSION_ID_INVALID.is_session_invalid());
        assert!(StatusCode::BAD_SERVICE_UNSUPPORTED.is_service_unsupported());
        assert!(StatusCode::BAD_OUT_OF_SERVICE.is_service_unsupported());
        assert!(!StatusCode::BAD_SUBSCRIPTION_ID_INVALID.is_service_unsupported());
    }

    #[test]
    fn test_node_id_parse_and_display() {
        let numeric: NodeId = "ns=2;i=1001".parse().unwrap();
        assert_eq!(numeric, NodeId::numeric(2, 1001));
        assert_eq!(numeric.to_string(), "ns=2;i=1001");

        let string: NodeId = "s=Pump.Speed".parse().unwrap();
        assert_eq!(string, NodeId::string(0, "Pump.Speed"));
        assert_eq!(string.to_string(), "s=Pump.Speed");

        let opaque = NodeId::opaque(3, b"hi".to_vec());
        let parsed: NodeId = opaque.to_string().parse().unwrap();
        assert_eq!(parsed, opaque);
    }

    #[test]
    fn test_node_id_parse_errors() {
        assert!("ns=x;i=1".parse::<NodeId>().is_err());
        assert!("ns=2".parse::<NodeId>().is_err());
        assert!("ns=2;q=1".parse::<NodeId>().is_err());
        assert!("i=abc".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_well_known_nodes() {
        assert!(NodeId::NULL.is_null());
        assert_eq!(NodeId::SERVER_STATUS_STATE.to_string(), "i=2259");
    }

    #[test]
    fn test_variant_conversions() {
        assert_eq!(Variant::from(42).as_i64(), Some(42));
        assert_eq!(Variant::from(1.5).as_f64(), Some(1.5));
        assert_eq!(Variant::UInt32(7).as_f64(), Some(7.0));
        assert_eq!(Variant::from("x").as_i64(), None);
        assert!(Variant::default().is_null());
    }

    #[test]
    fn test_security_policy_uri_roundtrip() {
        let policy = SecurityPolicy::Basic256Sha256;
        assert_eq!(SecurityPolicy::from_uri(policy.uri()), Some(policy));
        assert_eq!(SecurityPolicy::from_uri("urn:bogus"), None);
        assert_eq!("sign_and_encrypt".parse::<SecurityMode>().unwrap(), SecurityMode::SignAndEncrypt);
    }
}
