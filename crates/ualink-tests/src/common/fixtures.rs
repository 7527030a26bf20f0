// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Fixtures
//!
//! Pre-built nodes, settings and configuration documents shared by the
//! integration tests.

use std::time::Duration;

use ualink_client::config::{ClientConfig, SubscriptionSettings};
use ualink_client::types::NodeId;
use ualink_core::BackoffConfig;

// =============================================================================
// Nodes
// =============================================================================

/// Well-known variables of the mock address space.
pub mod nodes {
    use super::NodeId;

    /// Boiler temperature, a double.
    pub fn temperature() -> NodeId {
        NodeId::string(2, "Boiler.Temperature")
    }

    /// Boiler pressure, a double.
    pub fn pressure() -> NodeId {
        NodeId::string(2, "Boiler.Pressure")
    }

    /// Pump running flag, a boolean.
    pub fn pump_running() -> NodeId {
        NodeId::string(2, "Pump.Running")
    }

    /// Batch counter, an Int32.
    pub fn batch_count() -> NodeId {
        NodeId::numeric(2, 1001)
    }

    /// A node the server does not know.
    pub fn missing() -> NodeId {
        NodeId::string(2, "Does.Not.Exist")
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Endpoint used by every fixture configuration.
pub const TEST_ENDPOINT: &str = "opc.tcp://localhost:4840";

/// Subscription settings with a 100ms publishing interval.
pub fn fast_subscription() -> SubscriptionSettings {
    SubscriptionSettings::default()
        .with_publishing_interval(Duration::from_millis(100))
        .with_counts(30, 10)
}

/// Client configuration tuned for tests: short request timeout, keep-alive
/// effectively off, fast fixed-delay recovery.
pub fn test_config() -> ClientConfig {
    ClientConfig::builder()
        .endpoint(TEST_ENDPOINT)
        .session_name("ualink-test")
        .request_timeout(Duration::from_secs(5))
        .keep_alive_interval(Duration::from_secs(3600))
        .reconnect(BackoffConfig::fixed(Duration::from_millis(20)).with_max_attempts(20))
        .subscription(fast_subscription())
        .build()
        .expect("fixture config is valid")
}

// =============================================================================
// Configuration documents
// =============================================================================

/// A complete TOML configuration.
pub const CONFIG_TOML: &str = r#"
endpoint = "opc.tcp://plc-01.local:4840"
security_mode = "sign_and_encrypt"
security_policy = "basic256_sha256"
application_name = "line-3-collector"
session_timeout = "2m"
request_timeout = "10s"
keep_alive_interval = "5s"
keep_alive_failures_allowed = 2
max_pending_publish_requests = 4

[reconnect]
kind = "exponential"
initial_delay = 500
max_delay = 8000
max_attempts = 10

[subscription]
publishing_interval = "250ms"
lifetime_count = 120
max_keep_alive_count = 20

[monitored_item]
sampling_interval = "100ms"
queue_size = 5
"#;

/// A minimal JSON configuration; everything else defaults.
pub const CONFIG_JSON: &str = r#"{
    "endpoint": "opc.tcp://127.0.0.1:48010",
    "request_timeout": "3s",
    "subscription": { "publishing_interval": "500ms" }
}"#;

/// A TOML configuration violating the lifetime rule.
pub const INVALID_CONFIG_TOML: &str = r#"
endpoint = "opc.tcp://plc-01.local:4840"

[subscription]
publishing_interval = "1s"
lifetime_count = 10
max_keep_alive_count = 10
"#;
