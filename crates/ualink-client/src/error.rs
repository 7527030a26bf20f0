// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA client error types.
//!
//! # Error Categories
//!
//! ```text
//! OpcUaError
//! ├── Transport     - connection refused, channel closed mid-flight
//! ├── Service       - bad status code returned by a service call
//! ├── Session       - creation/activation rejected, session invalid or closed
//! ├── Subscription  - transfer rejected, unknown subscription or item
//! ├── Security      - certificate or identity rejected
//! ├── Configuration - invalid settings
//! ├── Timeout       - request deadline elapsed (outcome unknown)
//! └── Core          - handle exhaustion and other core failures
//! ```
//!
//! Every variant maps to an OPC UA [`StatusCode`] so that callers always get a
//! structured code alongside the human-readable message.
//!
//! # Examples
//!
//! ```
//! use ualink_client::error::{OpcUaError, TransportError};
//! use ualink_client::types::StatusCode;
//!
//! let error = OpcUaError::channel_closed("peer reset");
//! assert!(error.is_channel_closed());
//! assert_eq!(error.status_code(), StatusCode::BAD_SECURE_CHANNEL_CLOSED);
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::Level;
use ualink_core::CoreError;

use crate::message::RequestKind;
use crate::types::StatusCode;

// =============================================================================
// OpcUaError - Main Error Type
// =============================================================================

/// The main error type for client operations.
///
/// `Clone` so that one resolution of a shared future can be handed to every
/// waiter.
#[derive(Debug, Clone, Error)]
pub enum OpcUaError {
    /// Transport-level failures.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// Bad service result returned by the server.
    #[error("{0}")]
    Service(#[from] ServiceError),

    /// Session lifecycle failures.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Subscription and monitored item failures.
    #[error("{0}")]
    Subscription(#[from] SubscriptionError),

    /// Security failures.
    #[error("{0}")]
    Security(#[from] SecurityError),

    /// Configuration errors.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// Request timeouts.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),

    /// Core component failures.
    #[error("{0}")]
    Core(#[from] CoreError),
}

impl OpcUaError {
    // =========================================================================
    // Factory Methods
    // =========================================================================

    /// Creates a channel closed error.
    pub fn channel_closed(reason: impl Into<String>) -> Self {
        Self::Transport(TransportError::ChannelClosed {
            reason: Some(reason.into()),
        })
    }

    /// Creates a not connected error.
    pub fn not_connected() -> Self {
        Self::Transport(TransportError::NotConnected)
    }

    /// Creates a service fault for `service` carrying `status`.
    pub fn service(service: RequestKind, status: StatusCode) -> Self {
        Self::Service(ServiceError::Fault { service, status })
    }

    /// Creates an unexpected response error.
    pub fn unexpected_response(service: RequestKind, actual: impl Into<String>) -> Self {
        Self::Service(ServiceError::UnexpectedResponse {
            service,
            actual: actual.into(),
        })
    }

    /// Creates a request timeout error.
    pub fn request_timeout(service: RequestKind, duration: Duration) -> Self {
        Self::Timeout(TimeoutError::Request { service, duration })
    }

    /// Creates a session closed error.
    pub fn session_closed() -> Self {
        Self::Session(SessionError::Closed)
    }

    /// Creates a subscription not found error.
    pub fn subscription_not_found(subscription_id: u32) -> Self {
        Self::Subscription(SubscriptionError::NotFound { subscription_id })
    }

    // =========================================================================
    // Error Properties
    // =========================================================================

    /// Returns the OPC UA status code describing this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Transport(e) => e.status_code(),
            Self::Service(e) => e.status_code(),
            Self::Session(e) => e.status_code(),
            Self::Subscription(e) => e.status_code(),
            Self::Security(e) => e.status_code(),
            Self::Configuration(_) => StatusCode::BAD_CONFIGURATION_ERROR,
            Self::Timeout(_) => StatusCode::BAD_TIMEOUT,
            Self::Core(_) => StatusCode::BAD_INTERNAL_ERROR,
        }
    }

    /// Returns `true` if the channel was closed under the request.
    ///
    /// This is the only condition the request correlator retries on.
    pub fn is_channel_closed(&self) -> bool {
        match self {
            Self::Transport(TransportError::ChannelClosed { .. })
            | Self::Transport(TransportError::NotConnected) => true,
            Self::Service(ServiceError::Fault { status, .. }) => status.is_channel_closed(),
            _ => false,
        }
    }

    /// Returns `true` for timeouts.
    ///
    /// A timed-out request may still have been processed by the server.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns `true` if the server no longer recognises the session.
    pub fn is_session_invalid(&self) -> bool {
        self.status_code().is_session_invalid()
    }

    /// Returns `true` if retrying may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::Session(e) => e.is_retryable(),
            Self::Timeout(_) => true,
            Self::Service(_)
            | Self::Subscription(_)
            | Self::Security(_)
            | Self::Configuration(_)
            | Self::Core(_) => false,
        }
    }

    /// Returns the severity level of this error.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Transport(_) => ErrorSeverity::Warning,
            Self::Service(_) => ErrorSeverity::Error,
            Self::Session(e) => e.severity(),
            Self::Subscription(_) => ErrorSeverity::Error,
            Self::Security(_) => ErrorSeverity::Critical,
            Self::Configuration(_) => ErrorSeverity::Critical,
            Self::Timeout(_) => ErrorSeverity::Warning,
            Self::Core(e) if e.is_programmer_error() => ErrorSeverity::Critical,
            Self::Core(_) => ErrorSeverity::Error,
        }
    }

    /// Returns the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Service(_) => "service",
            Self::Session(_) => "session",
            Self::Subscription(_) => "subscription",
            Self::Security(_) => "security",
            Self::Configuration(_) => "configuration",
            Self::Timeout(_) => "timeout",
            Self::Core(_) => "core",
        }
    }

    /// Returns a structured error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Transport(e) => e.error_code(),
            Self::Service(e) => e.error_code(),
            Self::Session(e) => e.error_code(),
            Self::Subscription(e) => e.error_code(),
            Self::Security(e) => e.error_code(),
            Self::Configuration(e) => e.error_code(),
            Self::Timeout(e) => e.error_code(),
            Self::Core(_) => ErrorCode::new(9, 1),
        }
    }

    /// Returns the tracing level for this error.
    pub fn tracing_level(&self) -> Level {
        self.severity().to_tracing_level()
    }

    /// Logs this error with appropriate level and context.
    pub fn log(&self, context: &str) {
        let code = self.error_code();
        let status = self.status_code();

        match self.tracing_level() {
            Level::ERROR => tracing::error!(
                error_code = %code,
                status = %status,
                category = self.category(),
                context = context,
                "{self}"
            ),
            Level::WARN => tracing::warn!(
                error_code = %code,
                status = %status,
                category = self.category(),
                context = context,
                "{self}"
            ),
            _ => tracing::debug!(
                error_code = %code,
                status = %status,
                category = self.category(),
                context = context,
                "{self}"
            ),
        }
    }
}

// =============================================================================
// TransportError
// =============================================================================

/// Secure channel transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection refused by the endpoint.
    #[error("Connection refused to '{endpoint}': {reason}")]
    ConnectionRefused {
        /// Target endpoint.
        endpoint: String,
        /// Reason reported by the transport.
        reason: String,
    },

    /// The secure channel closed while the request was in flight.
    #[error("Secure channel closed{}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    ChannelClosed {
        /// Reason for closure.
        reason: Option<String>,
    },

    /// No secure channel is open.
    #[error("Not connected to OPC UA server")]
    NotConnected,

    /// Encoding or framing failure.
    #[error("Transport I/O error: {message}")]
    Io {
        /// Error message.
        message: String,
    },
}

impl TransportError {
    /// Creates a connection refused error.
    pub fn refused(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionRefused {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Creates an I/O error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Returns the matching status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ConnectionRefused { .. } | Self::Io { .. } => StatusCode::BAD_COMMUNICATION_ERROR,
            Self::ChannelClosed { .. } => StatusCode::BAD_SECURE_CHANNEL_CLOSED,
            Self::NotConnected => StatusCode::BAD_NOT_CONNECTED,
        }
    }

    /// Returns `true` if reconnecting may help.
    pub fn is_retryable(&self) -> bool {
        true
    }

    /// Returns a structured error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::ConnectionRefused { .. } => ErrorCode::new(1, 1),
            Self::ChannelClosed { .. } => ErrorCode::new(1, 2),
            Self::NotConnected => ErrorCode::new(1, 3),
            Self::Io { .. } => ErrorCode::new(1, 4),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        Self::io(error.to_string())
    }
}

// =============================================================================
// ServiceError
// =============================================================================

/// Service-level failures. Never retried automatically.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The server answered with a bad service result.
    #[error("{service} failed: {status}")]
    Fault {
        /// Service that was called.
        service: RequestKind,
        /// Service result.
        status: StatusCode,
    },

    /// The response body did not match the request.
    #[error("{service} returned unexpected response '{actual}'")]
    UnexpectedResponse {
        /// Service that was called.
        service: RequestKind,
        /// Name of the response actually received.
        actual: String,
    },
}

impl ServiceError {
    /// Returns the matching status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Fault { status, .. } => *status,
            Self::UnexpectedResponse { .. } => StatusCode::BAD_UNKNOWN_RESPONSE,
        }
    }

    /// Returns a structured error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Fault { .. } => ErrorCode::new(2, 1),
            Self::UnexpectedResponse { .. } => ErrorCode::new(2, 2),
        }
    }
}

// =============================================================================
// SessionError
// =============================================================================

/// Session lifecycle errors.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// CreateSession was rejected.
    #[error("Session creation failed: {status}")]
    CreationFailed {
        /// Status code reported.
        status: StatusCode,
    },

    /// ActivateSession was rejected.
    #[error("Session activation failed: {status}")]
    ActivationFailed {
        /// Status code reported.
        status: StatusCode,
    },

    /// The session was closed by the client.
    #[error("Session closed")]
    Closed,

    /// Recovery gave up after exhausting the reconnect policy.
    #[error("Session recovery abandoned after {attempts} attempts")]
    RecoveryAbandoned {
        /// Attempts made.
        attempts: u32,
    },

    /// The session state machine is no longer running.
    #[error("Session state machine stopped")]
    Stopped,
}

impl SessionError {
    /// Returns the matching status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::CreationFailed { status } | Self::ActivationFailed { status } => *status,
            Self::Closed => StatusCode::BAD_SESSION_CLOSED,
            Self::RecoveryAbandoned { .. } => StatusCode::BAD_SESSION_NOT_ACTIVATED,
            Self::Stopped => StatusCode::BAD_SHUTDOWN,
        }
    }

    /// Returns `true` if a new `session()` call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CreationFailed { .. }
                | Self::ActivationFailed { .. }
                | Self::RecoveryAbandoned { .. }
        )
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Closed => ErrorSeverity::Info,
            Self::Stopped => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    /// Returns a structured error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::CreationFailed { .. } => ErrorCode::new(3, 1),
            Self::ActivationFailed { .. } => ErrorCode::new(3, 2),
            Self::Closed => ErrorCode::new(3, 3),
            Self::RecoveryAbandoned { .. } => ErrorCode::new(3, 4),
            Self::Stopped => ErrorCode::new(3, 5),
        }
    }
}

// =============================================================================
// SubscriptionError
// =============================================================================

/// Subscription and monitored item errors.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    /// No subscription with this id is known locally.
    #[error("Subscription {subscription_id} not found")]
    NotFound {
        /// Subscription id.
        subscription_id: u32,
    },

    /// TransferSubscriptions rejected a subscription and recreation failed.
    #[error("Transfer of subscription {subscription_id} failed: {status}")]
    TransferFailed {
        /// Subscription id.
        subscription_id: u32,
        /// Status reported.
        status: StatusCode,
    },

    /// A monitored item operation was rejected.
    #[error("Monitored item {client_handle} failed: {status}")]
    MonitoredItemFailed {
        /// Client handle of the item.
        client_handle: u32,
        /// Status reported.
        status: StatusCode,
    },

    /// No monitored item with this client handle exists.
    #[error("Monitored item with client handle {client_handle} not found")]
    MonitoredItemNotFound {
        /// Client handle.
        client_handle: u32,
    },

    /// Parameters failed validation.
    #[error("Invalid subscription parameters: {reason}")]
    InvalidParameters {
        /// Why they were rejected.
        reason: String,
    },
}

impl SubscriptionError {
    /// Creates an invalid parameters error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            reason: reason.into(),
        }
    }

    /// Returns the matching status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
            Self::TransferFailed { status, .. } | Self::MonitoredItemFailed { status, .. } => {
                *status
            }
            Self::MonitoredItemNotFound { .. } => StatusCode::BAD_MONITORED_ITEM_ID_INVALID,
            Self::InvalidParameters { .. } => StatusCode::BAD_INVALID_ARGUMENT,
        }
    }

    /// Returns a structured error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::new(4, 1),
            Self::TransferFailed { .. } => ErrorCode::new(4, 2),
            Self::MonitoredItemFailed { .. } => ErrorCode::new(4, 3),
            Self::MonitoredItemNotFound { .. } => ErrorCode::new(4, 4),
            Self::InvalidParameters { .. } => ErrorCode::new(4, 5),
        }
    }
}

// =============================================================================
// SecurityError
// =============================================================================

/// Security errors.
#[derive(Debug, Clone, Error)]
pub enum SecurityError {
    /// The server certificate chain was rejected.
    #[error("Server certificate rejected: {reason}")]
    CertificateRejected {
        /// Reason from the validator.
        reason: String,
    },

    /// No identity token could be produced.
    #[error("Identity token rejected: {reason}")]
    IdentityRejected {
        /// Reason.
        reason: String,
    },
}

impl SecurityError {
    /// Creates a certificate rejection.
    pub fn certificate(reason: impl Into<String>) -> Self {
        Self::CertificateRejected {
            reason: reason.into(),
        }
    }

    /// Creates an identity rejection.
    pub fn identity(reason: impl Into<String>) -> Self {
        Self::IdentityRejected {
            reason: reason.into(),
        }
    }

    /// Returns the matching status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::CertificateRejected { .. } => StatusCode::BAD_SECURITY_CHECKS_FAILED,
            Self::IdentityRejected { .. } => StatusCode::BAD_IDENTITY_TOKEN_REJECTED,
        }
    }

    /// Returns a structured error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::CertificateRejected { .. } => ErrorCode::new(5, 1),
            Self::IdentityRejected { .. } => ErrorCode::new(5, 2),
        }
    }
}

// =============================================================================
// ConfigurationError
// =============================================================================

/// Configuration errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    /// A required field is missing.
    #[error("Missing required field: '{field}'")]
    MissingField {
        /// Field name.
        field: String,
    },

    /// Invalid endpoint URL.
    #[error("Invalid endpoint '{url}': {reason}")]
    InvalidEndpoint {
        /// The URL.
        url: String,
        /// Reason.
        reason: String,
    },

    /// A field holds an invalid value.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Reason.
        reason: String,
    },

    /// Node id could not be parsed.
    #[error("Invalid node id '{value}': {reason}")]
    InvalidNodeId {
        /// Input string.
        value: String,
        /// Reason.
        reason: String,
    },

    /// Security mode and policy do not agree.
    #[error("Invalid security configuration: {reason}")]
    InvalidSecurity {
        /// Reason.
        reason: String,
    },
}

impl ConfigurationError {
    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates an invalid endpoint error.
    pub fn invalid_endpoint(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid node id error.
    pub fn invalid_node_id(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidNodeId {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid security error.
    pub fn invalid_security(reason: impl Into<String>) -> Self {
        Self::InvalidSecurity {
            reason: reason.into(),
        }
    }

    /// Returns a structured error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::MissingField { .. } => ErrorCode::new(6, 1),
            Self::InvalidEndpoint { .. } => ErrorCode::new(6, 2),
            Self::InvalidValue { .. } => ErrorCode::new(6, 3),
            Self::InvalidNodeId { .. } => ErrorCode::new(6, 4),
            Self::InvalidSecurity { .. } => ErrorCode::new(6, 5),
        }
    }
}

// =============================================================================
// TimeoutError
// =============================================================================

/// Timeout errors.
///
/// A timed-out request may have been processed server-side; treat writes and
/// calls that time out as "outcome unknown".
#[derive(Debug, Clone, Error)]
pub enum TimeoutError {
    /// The request deadline elapsed before a response arrived.
    #[error("{service} timed out after {duration:?}")]
    Request {
        /// Service that was called.
        service: RequestKind,
        /// Timeout hint that elapsed.
        duration: Duration,
    },

    /// Consecutive keep-alive reads failed.
    #[error("Keep-alive failed {failures} times in a row")]
    KeepAlive {
        /// Consecutive failures.
        failures: u32,
    },
}

impl TimeoutError {
    /// Returns a structured error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Request { .. } => ErrorCode::new(7, 1),
            Self::KeepAlive { .. } => ErrorCode::new(7, 2),
        }
    }
}

// =============================================================================
// ErrorSeverity
// =============================================================================

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    /// Informational - no action required.
    Info,
    /// Warning - action may be required.
    Warning,
    /// Error - action required, but recoverable.
    Error,
    /// Critical - immediate action required.
    Critical,
}

impl ErrorSeverity {
    /// Converts to tracing level.
    pub fn to_tracing_level(self) -> Level {
        match self {
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// ErrorCode
// =============================================================================

/// Structured error code for categorization.
///
/// Format: `UA-XXYY` where XX is category and YY is specific error.
///
/// Categories:
/// - 1: Transport
/// - 2: Service
/// - 3: Session
/// - 4: Subscription
/// - 5: Security
/// - 6: Configuration
/// - 7: Timeout
/// - 9: Core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    /// Category.
    pub category: u8,
    /// Specific error within category.
    pub code: u8,
}

impl ErrorCode {
    /// Creates a new error code.
    pub const fn new(category: u8, code: u8) -> Self {
        Self { category, code }
    }

    /// Returns the full error code as a u16.
    pub fn as_u16(&self) -> u16 {
        ((self.category as u16) << 8) | (self.code as u16)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UA-{:02X}{:02X}", self.category, self.code)
    }
}

/// Result type for client operations.
pub type OpcUaResult<T> = Result<T, OpcUaError>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_closed_is_retryable() {
        let err = OpcUaError::channel_closed("reset");
        assert!(err.is_channel_closed());
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::BAD_SECURE_CHANNEL_CLOSED);
        assert_eq!(err.to_string(), "Secure channel closed: reset");
    }

    #[test]
    fn test_service_fault_carries_status() {
        let err = OpcUaError::service(RequestKind::CreateSubscription, StatusCode::BAD_TOO_MANY_SUBSCRIPTIONS);
        assert_eq!(err.status_code(), StatusCode::BAD_TOO_MANY_SUBSCRIPTIONS);
        assert!(!err.is_retryable());
        assert!(!err.is_channel_closed());
        assert!(err.to_string().starts_with("CreateSubscription failed"));
    }

    #[test]
    fn test_bad_channel_status_counts_as_closed() {
        let err = OpcUaError::service(RequestKind::Read, StatusCode::BAD_CONNECTION_CLOSED);
        assert!(err.is_channel_closed());
    }

    #[test]
    fn test_timeout_is_outcome_unknown() {
        let err = OpcUaError::request_timeout(RequestKind::Write, Duration::from_secs(5));
        assert!(err.is_timeout());
        assert!(!err.is_channel_closed());
        assert_eq!(err.status_code(), StatusCode::BAD_TIMEOUT);
        assert_eq!(err.category(), "timeout");
    }

    #[test]
    fn test_session_invalid_detection() {
        let err = OpcUaError::service(RequestKind::Publish, StatusCode::BAD_SESSION_ID_INVALID);
        assert!(err.is_session_invalid());
        assert!(!OpcUaError::not_connected().is_session_invalid());
    }

    #[test]
    fn test_handle_exhaustion_is_critical() {
        let err: OpcUaError = CoreError::handle_exhausted(1, 16).into();
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert!(!err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::BAD_INTERNAL_ERROR);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::new(3, 2).to_string(), "UA-0302");
        assert_eq!(OpcUaError::session_closed().error_code().to_string(), "UA-0303");
        assert_eq!(ErrorCode::new(1, 4).as_u16(), 0x0104);
    }
}
