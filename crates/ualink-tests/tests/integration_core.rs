// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Core Integration Tests
//!
//! Integration tests for ualink-core functionality and client configuration:
//!
//! - Lifecycle startup/shutdown ordering
//! - Client handle allocation and wraparound
//! - Reconnect policies
//! - Configuration files and validation
//!
//! ## Test Categories
//!
//! - `test_lifecycle_*`: Lifecycle manager tests
//! - `test_handle_*`: Client handle sequence tests
//! - `test_backoff_*`: Reconnect policy tests
//! - `test_config_*`: Configuration tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use ualink_client::{
    client::UaClient,
    config::ClientConfig,
    error::OpcUaError,
    types::{SecurityMode, SecurityPolicy},
};
use ualink_core::{
    backoff::{BackoffConfig, BackoffKind, ExponentialBackoff, ReconnectPolicy, RetryDecision},
    ClientHandleSequence, CoreError, Lifecycle, LifecycleManager, ShutdownOrder,
};

use ualink_tests::common::{
    fixtures::{test_config, CONFIG_JSON, CONFIG_TOML, INVALID_CONFIG_TOML},
    temp_test_dir,
};

// =============================================================================
// Lifecycle Tests
// =============================================================================

struct Component {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Component {
    fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            log: log.clone(),
        })
    }
}

#[async_trait]
impl Lifecycle for Component {
    fn name(&self) -> &str {
        self.name
    }

    async fn on_startup(&self) {
        self.log.lock().push(format!("start {}", self.name));
    }

    async fn on_shutdown(&self) {
        self.log.lock().push(format!("stop {}", self.name));
    }
}

#[tokio::test]
async fn test_lifecycle_inverse_order_mixes_components_and_tasks() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = LifecycleManager::new(ShutdownOrder::Inverse);

    let task_log = log.clone();
    manager.add_startup_task(move || {
        let log = task_log.clone();
        async move { log.lock().push("open channel".to_string()) }
    });
    let task_log = log.clone();
    manager.add_shutdown_task(move || {
        let log = task_log.clone();
        async move { log.lock().push("close channel".to_string()) }
    });
    manager.add_lifecycle(Component::new("session", &log));
    manager.add_lifecycle(Component::new("publish", &log));

    manager.startup().await;
    manager.shutdown().await;

    assert_eq!(
        *log.lock(),
        vec![
            "open channel",
            "start session",
            "start publish",
            "stop publish",
            "stop session",
            "close channel",
        ]
    );
}

#[tokio::test]
async fn test_lifecycle_linear_order_and_removal() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = LifecycleManager::new(ShutdownOrder::Linear);

    let first = manager.add_lifecycle(Component::new("first", &log));
    manager.add_lifecycle(Component::new("second", &log));
    manager.add_lifecycle(Component::new("third", &log));
    assert_eq!(manager.len(), 3);

    assert!(manager.remove_lifecycle(first));
    assert!(!manager.remove_lifecycle(first));
    assert_eq!(manager.len(), 2);

    manager.shutdown().await;
    assert_eq!(*log.lock(), vec!["stop second", "stop third"]);
}

#[tokio::test]
async fn test_lifecycle_can_run_repeatedly() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = LifecycleManager::new(ShutdownOrder::Inverse);
    manager.add_lifecycle(Component::new("engine", &log));

    for _ in 0..2 {
        manager.startup().await;
        manager.shutdown().await;
    }

    assert_eq!(
        *log.lock(),
        vec!["start engine", "stop engine", "start engine", "stop engine"]
    );
}

// =============================================================================
// Client Handle Tests
// =============================================================================

#[test]
fn test_handle_wraps_past_max_and_skips_zero_in_use() {
    let sequence = ClientHandleSequence::bounded(u32::MAX - 1, u32::MAX);
    let in_use = |handle: u32| handle == 0;

    assert_eq!(sequence.next_handle(in_use).unwrap(), u32::MAX - 1);
    assert_eq!(sequence.next_handle(in_use).unwrap(), u32::MAX);
    assert_eq!(sequence.next_handle(in_use).unwrap(), 1);
    assert_eq!(sequence.next_handle(in_use).unwrap(), 2);
}

#[test]
fn test_handle_skips_live_handles() {
    let sequence = ClientHandleSequence::new();
    let live = [1u32, 2, 4];

    let handles: Vec<u32> = (0..3)
        .map(|_| sequence.next_handle(|h| live.contains(&h)).unwrap())
        .collect();

    assert_eq!(handles, vec![3, 5, 6]);
}

#[test]
fn test_handle_exhaustion_leaves_position_unchanged() {
    let sequence = ClientHandleSequence::bounded(2, 3);

    let err = sequence.next_handle(|_| true).unwrap_err();
    assert!(matches!(err, CoreError::HandleExhausted { seed: 2, scanned: 4 }));
    assert_eq!(sequence.peek(), 2);

    assert_eq!(sequence.next_handle(|h| h != 0).unwrap(), 0);
}

// =============================================================================
// Backoff Tests
// =============================================================================

#[test]
fn test_backoff_exponential_is_capped() {
    let policy = ExponentialBackoff::new(BackoffConfig::default());
    let delays: Vec<RetryDecision> = (1..=7).map(|attempt| policy.next_delay(attempt)).collect();

    assert_eq!(
        delays,
        [1, 2, 4, 8, 16, 16, 16]
            .into_iter()
            .map(|s| RetryDecision::Retry(Duration::from_secs(s)))
            .collect::<Vec<_>>()
    );
}

#[test]
fn test_backoff_gives_up_after_max_attempts() {
    let policy = BackoffConfig::fixed(Duration::from_millis(50))
        .with_max_attempts(2)
        .build();

    assert_eq!(policy.next_delay(1), RetryDecision::Retry(Duration::from_millis(50)));
    assert_eq!(policy.next_delay(2), RetryDecision::Retry(Duration::from_millis(50)));
    assert_eq!(policy.next_delay(3), RetryDecision::GiveUp);

    assert_eq!(BackoffConfig::no_retry().build().next_delay(1), RetryDecision::GiveUp);
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[test]
fn test_config_loads_from_toml_file() {
    let dir = temp_test_dir("ualink_config_");
    let path = dir.path().join("client.toml");
    std::fs::write(&path, CONFIG_TOML).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let config: ClientConfig = toml::from_str(&contents).unwrap();
    config.validate().unwrap();

    assert_eq!(config.endpoint, "opc.tcp://plc-01.local:4840");
    assert_eq!(config.security_mode, SecurityMode::SignAndEncrypt);
    assert_eq!(config.security_policy, SecurityPolicy::Basic256Sha256);
    assert_eq!(config.application_name, "line-3-collector");
    assert_eq!(config.session_timeout, Duration::from_secs(120));
    assert_eq!(config.request_timeout, Duration::from_secs(10));
    assert_eq!(config.keep_alive_failures_allowed, 2);
    assert_eq!(config.max_pending_publish_requests, 4);

    assert_eq!(config.reconnect.kind, BackoffKind::Exponential);
    assert_eq!(config.reconnect.initial_delay, Duration::from_millis(500));
    assert_eq!(config.reconnect.max_delay, Duration::from_secs(8));
    assert_eq!(config.reconnect.max_attempts, Some(10));

    assert_eq!(config.subscription.publishing_interval, Duration::from_millis(250));
    assert_eq!(config.subscription.lifetime_count, 120);
    assert_eq!(config.subscription.max_keep_alive_count, 20);
    assert_eq!(config.monitored_item.sampling_interval, Duration::from_millis(100));
    assert_eq!(config.monitored_item.queue_size, 5);
}

#[test]
fn test_config_minimal_json_uses_defaults() {
    let config: ClientConfig = serde_json::from_str(CONFIG_JSON).unwrap();
    config.validate().unwrap();

    assert_eq!(config.endpoint, "opc.tcp://127.0.0.1:48010");
    assert_eq!(config.request_timeout, Duration::from_secs(3));
    assert_eq!(config.security_mode, SecurityMode::None);
    assert_eq!(config.keep_alive_interval, Duration::from_secs(5));
    assert_eq!(config.keep_alive_failures_allowed, 1);
    assert_eq!(config.max_pending_publish_requests, 2);
    assert_eq!(config.reconnect, BackoffConfig::default());
    assert_eq!(config.subscription.publishing_interval, Duration::from_millis(500));
    assert_eq!(config.subscription.lifetime_count, 60);
}

#[test]
fn test_config_json_round_trip_keeps_durations() {
    let config: ClientConfig = toml::from_str(CONFIG_TOML).unwrap();

    let json = serde_json::to_value(&config).unwrap();
    assert_eq!(json["request_timeout"], "10s");
    assert_eq!(json["security_mode"], "sign_and_encrypt");
    assert_eq!(json["reconnect"]["initial_delay"], 500);

    let restored: ClientConfig = serde_json::from_value(json).unwrap();
    assert_eq!(restored.request_timeout, config.request_timeout);
    assert_eq!(restored.reconnect, config.reconnect);
    assert_eq!(restored.subscription, config.subscription);
}

#[test]
fn test_config_rejects_short_lifetime() {
    let config: ClientConfig = toml::from_str(INVALID_CONFIG_TOML).unwrap();
    let err = config.validate().unwrap_err();
    assert!(matches!(err, OpcUaError::Subscription(_) | OpcUaError::Configuration(_)));
}

#[test]
fn test_config_rejects_bad_endpoint_and_security() {
    let err = ClientConfig::builder()
        .endpoint("http://localhost:4840")
        .build()
        .unwrap_err();
    assert!(matches!(err, OpcUaError::Configuration(_)));

    let err = ClientConfig::builder()
        .endpoint("opc.tcp://localhost:4840")
        .security(SecurityMode::SignAndEncrypt, SecurityPolicy::None)
        .build()
        .unwrap_err();
    assert!(matches!(err, OpcUaError::Configuration(_)));

    let err = ClientConfig::builder()
        .endpoint("opc.tcp://localhost:4840")
        .max_pending_publish_requests(0)
        .build()
        .unwrap_err();
    assert!(matches!(err, OpcUaError::Configuration(_)));
}

#[tokio::test]
async fn test_config_client_requires_transport() {
    let err = UaClient::builder(test_config()).build().unwrap_err();
    assert!(matches!(err, OpcUaError::Configuration(_)));
}
