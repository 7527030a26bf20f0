// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Client configuration.
//!
//! [`ClientConfig`] is plain serde data so it can be loaded from TOML or JSON
//! by the embedding application; durations are written in humantime form
//! (`"30s"`, `"250ms"`). Build it in code through [`ClientConfigBuilder`],
//! which validates on `build()`.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use ualink_client::config::ClientConfig;
//!
//! let config = ClientConfig::builder()
//!     .endpoint("opc.tcp://plc-01:4840")
//!     .request_timeout(Duration::from_secs(5))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.max_pending_publish_requests, 2);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use ualink_core::BackoffConfig;

use crate::error::{ConfigurationError, OpcUaError, OpcUaResult};
use crate::types::{DataChangeFilter, SecurityMode, SecurityPolicy, TimestampsToReturn};

// =============================================================================
// ClientConfig
// =============================================================================

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server endpoint URL (e.g., "opc.tcp://localhost:4840").
    pub endpoint: String,

    /// Security mode.
    #[serde(default)]
    pub security_mode: SecurityMode,

    /// Security policy.
    #[serde(default)]
    pub security_policy: SecurityPolicy,

    /// Application name sent in CreateSession.
    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Application URI.
    #[serde(default = "default_application_uri")]
    pub application_uri: String,

    /// Session name.
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// Requested session timeout. The server may revise it.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Timeout hint for ordinary service calls.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Maximum response message size; 0 = no limit.
    #[serde(default)]
    pub max_response_message_size: u32,

    /// Interval between keep-alive reads while the session is active.
    #[serde(default = "default_keep_alive_interval", with = "humantime_serde")]
    pub keep_alive_interval: Duration,

    /// Timeout of a single keep-alive read.
    #[serde(default = "default_keep_alive_timeout", with = "humantime_serde")]
    pub keep_alive_timeout: Duration,

    /// Consecutive keep-alive failures tolerated before recovery starts.
    #[serde(default = "default_keep_alive_failures_allowed")]
    pub keep_alive_failures_allowed: u32,

    /// Upper bound on outstanding Publish requests.
    #[serde(default = "default_max_pending_publish_requests")]
    pub max_pending_publish_requests: u32,

    /// Session recovery backoff.
    #[serde(default)]
    pub reconnect: BackoffConfig,

    /// Defaults for new subscriptions.
    #[serde(default)]
    pub subscription: SubscriptionSettings,

    /// Defaults for new monitored items.
    #[serde(default)]
    pub monitored_item: MonitoredItemSettings,
}

fn default_application_name() -> String {
    "ualink".to_string()
}

fn default_application_uri() -> String {
    "urn:ualink:client".to_string()
}

fn default_session_name() -> String {
    "ualink-session".to_string()
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_keep_alive_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_keep_alive_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_keep_alive_failures_allowed() -> u32 {
    1
}

fn default_max_pending_publish_requests() -> u32 {
    2
}

impl ClientConfig {
    /// Creates a builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> OpcUaResult<()> {
        if self.endpoint.is_empty() {
            return Err(ConfigurationError::missing_field("endpoint").into());
        }
        if !self.endpoint.starts_with("opc.tcp://") {
            return Err(ConfigurationError::invalid_endpoint(
                &self.endpoint,
                "Endpoint must start with 'opc.tcp://'",
            )
            .into());
        }

        let secured = !self.security_mode.is_none();
        let has_policy = self.security_policy != SecurityPolicy::None;
        if secured != has_policy {
            return Err(ConfigurationError::invalid_security(format!(
                "security mode {} does not match policy {}",
                self.security_mode,
                self.security_policy.uri()
            ))
            .into());
        }

        if self.session_timeout.is_zero() {
            return Err(ConfigurationError::invalid_value("session_timeout", "must be non-zero").into());
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigurationError::invalid_value("request_timeout", "must be non-zero").into());
        }
        if self.keep_alive_interval.is_zero() {
            return Err(
                ConfigurationError::invalid_value("keep_alive_interval", "must be non-zero").into(),
            );
        }
        if self.max_pending_publish_requests == 0 {
            return Err(ConfigurationError::invalid_value(
                "max_pending_publish_requests",
                "must be at least 1",
            )
            .into());
        }

        self.reconnect
            .validate()
            .map_err(|e| OpcUaError::from(ConfigurationError::invalid_value("reconnect", e.to_string())))?;
        self.subscription.validate()?;
        Ok(())
    }
}

// =============================================================================
// ClientConfigBuilder
// =============================================================================

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    endpoint: Option<String>,
    security_mode: Option<SecurityMode>,
    security_policy: Option<SecurityPolicy>,
    application_name: Option<String>,
    application_uri: Option<String>,
    session_name: Option<String>,
    session_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    max_response_message_size: Option<u32>,
    keep_alive_interval: Option<Duration>,
    keep_alive_timeout: Option<Duration>,
    keep_alive_failures_allowed: Option<u32>,
    max_pending_publish_requests: Option<u32>,
    reconnect: Option<BackoffConfig>,
    subscription: Option<SubscriptionSettings>,
    monitored_item: Option<MonitoredItemSettings>,
}

impl ClientConfigBuilder {
    /// Sets the server endpoint URL.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the security mode and policy together.
    pub fn security(mut self, mode: SecurityMode, policy: SecurityPolicy) -> Self {
        self.security_mode = Some(mode);
        self.security_policy = Some(policy);
        self
    }

    /// Sets the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Sets the application URI.
    pub fn application_uri(mut self, uri: impl Into<String>) -> Self {
        self.application_uri = Some(uri.into());
        self
    }

    /// Sets the session name.
    pub fn session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    /// Sets the requested session timeout.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Sets the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the maximum response message size.
    pub fn max_response_message_size(mut self, size: u32) -> Self {
        self.max_response_message_size = Some(size);
        self
    }

    /// Sets the keep-alive interval.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    /// Sets the keep-alive read timeout.
    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = Some(timeout);
        self
    }

    /// Sets how many consecutive keep-alive failures are tolerated.
    pub fn keep_alive_failures_allowed(mut self, failures: u32) -> Self {
        self.keep_alive_failures_allowed = Some(failures);
        self
    }

    /// Sets the maximum number of outstanding Publish requests.
    pub fn max_pending_publish_requests(mut self, max: u32) -> Self {
        self.max_pending_publish_requests = Some(max);
        self
    }

    /// Sets the reconnect backoff.
    pub fn reconnect(mut self, backoff: BackoffConfig) -> Self {
        self.reconnect = Some(backoff);
        self
    }

    /// Sets default subscription settings.
    pub fn subscription(mut self, settings: SubscriptionSettings) -> Self {
        self.subscription = Some(settings);
        self
    }

    /// Sets default monitored item settings.
    pub fn monitored_item(mut self, settings: MonitoredItemSettings) -> Self {
        self.monitored_item = Some(settings);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> OpcUaResult<ClientConfig> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| ConfigurationError::missing_field("endpoint"))?;

        let config = ClientConfig {
            endpoint,
            security_mode: self.security_mode.unwrap_or_default(),
            security_policy: self.security_policy.unwrap_or_default(),
            application_name: self.application_name.unwrap_or_else(default_application_name),
            application_uri: self.application_uri.unwrap_or_else(default_application_uri),
            session_name: self.session_name.unwrap_or_else(default_session_name),
            session_timeout: self.session_timeout.unwrap_or_else(default_session_timeout),
            request_timeout: self.request_timeout.unwrap_or_else(default_request_timeout),
            max_response_message_size: self.max_response_message_size.unwrap_or(0),
            keep_alive_interval: self
                .keep_alive_interval
                .unwrap_or_else(default_keep_alive_interval),
            keep_alive_timeout: self
                .keep_alive_timeout
                .unwrap_or_else(default_keep_alive_timeout),
            keep_alive_failures_allowed: self
                .keep_alive_failures_allowed
                .unwrap_or_else(default_keep_alive_failures_allowed),
            max_pending_publish_requests: self
                .max_pending_publish_requests
                .unwrap_or_else(default_max_pending_publish_requests),
            reconnect: self.reconnect.unwrap_or_default(),
            subscription: self.subscription.unwrap_or_default(),
            monitored_item: self.monitored_item.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// SubscriptionSettings
// =============================================================================

/// Requested subscription parameters.
///
/// The server revises these; the requested values are kept so a subscription
/// can be recreated with them after a failed transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// Publishing interval.
    #[serde(default = "default_publishing_interval", with = "humantime_serde")]
    pub publishing_interval: Duration,

    /// Lifetime count (publishing intervals without a Publish before expiry).
    #[serde(default = "default_lifetime_count")]
    pub lifetime_count: u32,

    /// Max keep-alive count.
    #[serde(default = "default_keep_alive_count")]
    pub max_keep_alive_count: u32,

    /// Maximum notifications per publish; 0 = no limit.
    #[serde(default = "default_max_notifications")]
    pub max_notifications_per_publish: u32,

    /// Relative priority.
    #[serde(default)]
    pub priority: u8,

    /// Publishing enabled.
    #[serde(default = "default_true")]
    pub publishing_enabled: bool,
}

fn default_publishing_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_lifetime_count() -> u32 {
    60
}

fn default_keep_alive_count() -> u32 {
    10
}

fn default_max_notifications() -> u32 {
    65535
}

fn default_true() -> bool {
    true
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            publishing_interval: default_publishing_interval(),
            lifetime_count: default_lifetime_count(),
            max_keep_alive_count: default_keep_alive_count(),
            max_notifications_per_publish: default_max_notifications(),
            priority: 0,
            publishing_enabled: true,
        }
    }
}

impl SubscriptionSettings {
    /// Sets the publishing interval.
    pub fn with_publishing_interval(mut self, interval: Duration) -> Self {
        self.publishing_interval = interval;
        self
    }

    /// Sets lifetime and keep-alive counts.
    pub fn with_counts(mut self, lifetime_count: u32, max_keep_alive_count: u32) -> Self {
        self.lifetime_count = lifetime_count;
        self.max_keep_alive_count = max_keep_alive_count;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Validates the settings.
    pub fn validate(&self) -> OpcUaResult<()> {
        if self.publishing_interval.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "subscription.publishing_interval",
                "must be non-zero",
            )
            .into());
        }
        if self.max_keep_alive_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "subscription.max_keep_alive_count",
                "must be non-zero",
            )
            .into());
        }
        if self.lifetime_count < self.max_keep_alive_count.saturating_mul(3) {
            return Err(ConfigurationError::invalid_value(
                "subscription.lifetime_count",
                "must be at least 3 x max_keep_alive_count",
            )
            .into());
        }
        Ok(())
    }
}

// =============================================================================
// MonitoredItemSettings
// =============================================================================

/// Defaults applied to monitored items that do not override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemSettings {
    /// Sampling interval.
    #[serde(default = "default_sampling_interval", with = "humantime_serde")]
    pub sampling_interval: Duration,

    /// Server-side queue size.
    #[serde(default = "default_queue_size")]
    pub queue_size: u32,

    /// Discard the oldest value when the queue overflows.
    #[serde(default = "default_true")]
    pub discard_oldest: bool,

    /// Timestamps to return.
    #[serde(default)]
    pub timestamps: TimestampsToReturn,

    /// Optional deadband filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<DataChangeFilter>,
}

fn default_sampling_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_queue_size() -> u32 {
    10
}

impl Default for MonitoredItemSettings {
    fn default() -> Self {
        Self {
            sampling_interval: default_sampling_interval(),
            queue_size: default_queue_size(),
            discard_oldest: true,
            timestamps: TimestampsToReturn::default(),
            filter: None,
        }
    }
}

// =============================================================================
// Serde helpers
// =============================================================================

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*duration)
            .to_string()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ClientConfig::builder()
            .endpoint("opc.tcp://localhost:4840")
            .build()
            .unwrap();

        assert_eq!(config.session_timeout, Duration::from_secs(120));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.keep_alive_failures_allowed, 1);
        assert_eq!(config.subscription.lifetime_count, 60);
        assert_eq!(config.monitored_item.queue_size, 10);
    }

    #[test]
    fn test_missing_endpoint() {
        let err = ClientConfig::builder().build().unwrap_err();
        assert!(matches!(
            err,
            OpcUaError::Configuration(ConfigurationError::MissingField { .. })
        ));
    }

    #[test]
    fn test_invalid_scheme() {
        assert!(ClientConfig::builder()
            .endpoint("http://localhost:4840")
            .build()
            .is_err());
    }

    #[test]
    fn test_security_must_agree() {
        let mismatched = ClientConfig::builder()
            .endpoint("opc.tcp://localhost:4840")
            .security(SecurityMode::Sign, SecurityPolicy::None)
            .build();
        assert!(mismatched.is_err());

        let matched = ClientConfig::builder()
            .endpoint("opc.tcp://localhost:4840")
            .security(SecurityMode::SignAndEncrypt, SecurityPolicy::Basic256Sha256)
            .build();
        assert!(matched.is_ok());
    }

    #[test]
    fn test_zero_pending_publish_rejected() {
        let result = ClientConfig::builder()
            .endpoint("opc.tcp://localhost:4840")
            .max_pending_publish_requests(0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_subscription_lifetime_rule() {
        let settings = SubscriptionSettings::default().with_counts(20, 10);
        assert!(settings.validate().is_err());
        assert!(SubscriptionSettings::default().with_counts(30, 10).validate().is_ok());
    }

    #[test]
    fn test_humantime_json() {
        let config = ClientConfig::builder()
            .endpoint("opc.tcp://localhost:4840")
            .request_timeout(Duration::from_millis(1500))
            .build()
            .unwrap();

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"request_timeout\":\"1s 500ms\""));

        let parsed: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_timeout, Duration::from_millis(1500));
    }
}
