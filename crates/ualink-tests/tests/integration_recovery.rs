// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Recovery Integration Tests
//!
//! Integration tests for connection recovery against the in-memory server:
//!
//! - Channel loss with session reactivation
//! - Server restart with subscription transfer
//! - Server restart with subscription recreation
//! - Bounded recovery attempts
//!
//! ## Test Categories
//!
//! - `test_recovery_channel_*`: Lost channel, session kept
//! - `test_recovery_restart_*`: Lost session, subscriptions moved
//! - `test_recovery_attempts_*`: Reconnect policy limits

use std::time::Duration;

use ualink_client::{
    client::UaClient,
    error::{OpcUaError, SessionError},
    message::RequestKind,
    session::SessionState,
    subscription::{ChannelListener, MonitoredItemRequest, Subscription, SubscriptionEvent},
    types::{NodeId, StatusCode, Variant},
};
use ualink_core::BackoffConfig;

use ualink_tests::common::{
    assertions::{
        assert_no_notification, eventually, next_event, next_notification, wait_for_state,
        DataChangeAssertions, StatsAssertions, EVENT_TIMEOUT,
    },
    builders::{ClientFixture, TestClientBuilder},
    fixtures::{fast_subscription, nodes},
    init_test_logging,
    mocks::{MockServer, ServerBehavior},
};

const QUIET: Duration = Duration::from_millis(300);

/// A subscription on one node whose first change has been seen.
struct Monitored {
    subscription: std::sync::Arc<Subscription>,
    client_handle: u32,
    events: tokio::sync::mpsc::UnboundedReceiver<SubscriptionEvent>,
}

async fn monitor_temperature(server: &MockServer, client: &UaClient) -> Monitored {
    monitor(server, client, nodes::temperature(), 21.0).await
}

async fn monitor(server: &MockServer, client: &UaClient, node_id: NodeId, first: f64) -> Monitored {
    let (listener, mut events) = ChannelListener::new();
    let subscription = client
        .create_subscription(fast_subscription(), listener)
        .await
        .unwrap();
    let item = client
        .add_monitored_item(&subscription, MonitoredItemRequest::value_of(node_id.clone()))
        .await
        .unwrap();

    server.write(node_id, first);
    let (_, sequence_number, changes) = next_notification(&mut events, EVENT_TIMEOUT).await;
    assert_eq!(sequence_number, 1);
    changes.assert_single(item.client_handle(), &Variant::from(first));

    Monitored {
        subscription,
        client_handle: item.client_handle(),
        events,
    }
}

async fn wait_for_new_session(client: &UaClient, sessions: u64) {
    eventually("session recreated", EVENT_TIMEOUT, || {
        client.stats().sessions_created == sessions && client.state() == SessionState::Active
    })
    .await;
}

// =============================================================================
// Channel Loss Tests
// =============================================================================

#[tokio::test]
async fn test_recovery_channel_loss_keeps_session_and_subscription() {
    init_test_logging();
    let ClientFixture { server, client } = ClientFixture::new();
    let mut monitored = monitor_temperature(&server, &client).await;
    let subscription_id = monitored.subscription.subscription_id();

    server.drop_channel("cable pulled");
    eventually("session reactivated", EVENT_TIMEOUT, || {
        client.stats().sessions_reactivated == 1 && client.state() == SessionState::Active
    })
    .await;

    server.write(nodes::temperature(), 22.0);
    let (id, sequence_number, changes) = next_notification(&mut monitored.events, EVENT_TIMEOUT).await;
    assert_eq!(id, subscription_id);
    assert_eq!(sequence_number, 2);
    changes.assert_single(monitored.client_handle, &Variant::from(22.0));
    assert_no_notification(&mut monitored.events, QUIET).await;

    assert_eq!(monitored.subscription.subscription_id(), subscription_id);
    assert_eq!(server.request_count(RequestKind::CreateSession), 1);
    assert_eq!(server.request_count(RequestKind::TransferSubscriptions), 0);
    assert_eq!(server.request_count(RequestKind::CreateSubscription), 1);
    let stats = client.stats();
    stats.assert_sessions_created(1);
    stats.assert_no_late_responses();
}

#[tokio::test]
async fn test_recovery_channel_loss_while_idle_reconnects_on_demand() {
    let ClientFixture { server, client } = ClientFixture::new();
    client.connect().await.unwrap();

    server.drop_channel("idle timeout");
    eventually("session reactivated", EVENT_TIMEOUT, || {
        client.stats().sessions_reactivated == 1
    })
    .await;

    let value = client.read_value(nodes::pressure()).await.unwrap();
    assert_eq!(value.value, Variant::from(1.0));
    assert_eq!(server.connect_count(), 2);
}

// =============================================================================
// Server Restart Tests
// =============================================================================

#[tokio::test]
async fn test_recovery_restart_transfers_subscription() {
    let ClientFixture { server, client } = ClientFixture::new();
    let mut monitored = monitor_temperature(&server, &client).await;
    let subscription_id = monitored.subscription.subscription_id();

    server.restart(true);
    wait_for_new_session(&client, 2).await;

    assert_eq!(server.request_count(RequestKind::TransferSubscriptions), 1);
    assert_eq!(server.request_count(RequestKind::CreateSubscription), 1);
    assert_eq!(monitored.subscription.subscription_id(), subscription_id);

    let session = client.session().await.unwrap();
    let owners = server.subscription_owners();
    assert_eq!(owners.len(), 1);
    assert!(owners.contains(session.authentication_token()));

    server.write(nodes::temperature(), 23.0);
    let (id, sequence_number, changes) = next_notification(&mut monitored.events, EVENT_TIMEOUT).await;
    assert_eq!(id, subscription_id);
    assert_eq!(sequence_number, 2);
    changes.assert_single(monitored.client_handle, &Variant::from(23.0));
    assert_no_notification(&mut monitored.events, QUIET).await;
}

#[tokio::test]
async fn test_recovery_restart_recreates_when_transfer_unsupported() {
    let ClientFixture { server, client } = TestClientBuilder::new()
        .behavior(ServerBehavior::default().without_transfer())
        .build();
    let mut monitored = monitor_temperature(&server, &client).await;
    let old_id = monitored.subscription.subscription_id();

    server.restart(false);
    wait_for_new_session(&client, 2).await;

    let new_id = monitored.subscription.subscription_id();
    assert_ne!(new_id, old_id);
    assert_eq!(server.subscription_ids(), vec![new_id]);
    assert_eq!(server.client_handles(new_id), vec![monitored.client_handle]);
    assert!(client.subscription_manager().subscription(old_id).is_none());
    assert!(client.subscription_manager().subscription(new_id).is_some());
    assert_eq!(server.request_count(RequestKind::CreateSubscription), 2);
    assert_eq!(server.request_count(RequestKind::CreateMonitoredItems), 2);

    server.write(nodes::temperature(), 24.0);
    let (id, sequence_number, changes) = next_notification(&mut monitored.events, EVENT_TIMEOUT).await;
    assert_eq!(id, new_id);
    assert_eq!(sequence_number, 1);
    changes.assert_single(monitored.client_handle, &Variant::from(24.0));
    assert_no_notification(&mut monitored.events, QUIET).await;
}

#[tokio::test]
async fn test_recovery_restart_recreates_when_transfer_rejected() {
    let ClientFixture { server, client } = ClientFixture::new();
    let mut monitored = monitor_temperature(&server, &client).await;
    let old_id = monitored.subscription.subscription_id();

    server.restart(false);
    wait_for_new_session(&client, 2).await;

    assert_eq!(server.request_count(RequestKind::TransferSubscriptions), 1);
    assert_eq!(server.request_count(RequestKind::CreateSubscription), 2);
    let new_id = monitored.subscription.subscription_id();
    assert_ne!(new_id, old_id);

    server.write(nodes::temperature(), 25.0);
    let (id, _, changes) = next_notification(&mut monitored.events, EVENT_TIMEOUT).await;
    assert_eq!(id, new_id);
    changes.assert_single(monitored.client_handle, &Variant::from(25.0));
}

#[tokio::test]
async fn test_recovery_restart_recreates_when_server_reuses_ids() {
    // Starting at 1 or 2, a new id lands on a key not yet recreated for
    // one of the two possible recreation orders.
    for first_id in [1, 2] {
        let ClientFixture { server, client } = ClientFixture::new();
        let mut temperature = monitor(&server, &client, nodes::temperature(), 21.0).await;
        let mut pressure = monitor(&server, &client, nodes::pressure(), 2.0).await;
        assert_eq!(server.subscription_ids(), vec![1, 2]);

        server.number_subscriptions_from(first_id);
        server.restart(false);
        wait_for_new_session(&client, 2).await;

        let manager = client.subscription_manager();
        assert_eq!(manager.subscriptions().len(), 2, "first id {first_id}");
        let mut ids = Vec::new();
        for monitored in [&temperature, &pressure] {
            let id = monitored.subscription.subscription_id();
            assert!(manager.subscription(id).is_some(), "first id {first_id}");
            assert_eq!(server.client_handles(id), vec![monitored.client_handle]);
            ids.push(id);
        }
        ids.sort_unstable();
        assert_eq!(server.subscription_ids(), ids, "first id {first_id}");

        for (monitored, node_id, value) in [
            (&mut temperature, nodes::temperature(), 22.0),
            (&mut pressure, nodes::pressure(), 3.0),
        ] {
            server.write(node_id, value);
            let (id, sequence_number, changes) =
                next_notification(&mut monitored.events, EVENT_TIMEOUT).await;
            assert_eq!(id, monitored.subscription.subscription_id());
            assert_eq!(sequence_number, 1);
            changes.assert_single(monitored.client_handle, &Variant::from(value));
        }
    }
}

#[tokio::test]
async fn test_recovery_restart_reports_failed_recreation() {
    let ClientFixture { server, client } = TestClientBuilder::new()
        .behavior(ServerBehavior::default().without_transfer())
        .build();
    let mut monitored = monitor_temperature(&server, &client).await;
    let old_id = monitored.subscription.subscription_id();

    server.fail_next(RequestKind::CreateSubscription, StatusCode::BAD_TOO_MANY_SUBSCRIPTIONS);
    server.restart(false);

    match next_event(&mut monitored.events, EVENT_TIMEOUT).await {
        SubscriptionEvent::TransferFailed {
            subscription_id,
            error,
        } => {
            assert_eq!(subscription_id, old_id);
            assert!(error.status_code().matches(StatusCode::BAD_TOO_MANY_SUBSCRIPTIONS));
        }
        other => panic!("Expected transfer failure, got {:?}", other),
    }

    wait_for_new_session(&client, 2).await;
    assert!(client.subscription_manager().subscriptions().is_empty());
    assert!(server.subscription_ids().is_empty());
}

// =============================================================================
// Recovery Attempt Tests
// =============================================================================

#[tokio::test]
async fn test_recovery_attempts_retry_until_server_returns() {
    let ClientFixture { server, client } = TestClientBuilder::new()
        .reconnect(BackoffConfig::fixed(Duration::from_millis(20)).with_max_attempts(200))
        .build();
    let mut monitored = monitor_temperature(&server, &client).await;

    server.refuse_connections(true);
    server.restart(false);
    eventually("several connect attempts", EVENT_TIMEOUT, || server.connect_count() >= 4).await;
    assert_eq!(client.state(), SessionState::Creating);

    server.refuse_connections(false);
    wait_for_new_session(&client, 2).await;

    server.write(nodes::temperature(), 26.0);
    let (_, _, changes) = next_notification(&mut monitored.events, EVENT_TIMEOUT).await;
    changes.assert_single(monitored.client_handle, &Variant::from(26.0));
}

#[tokio::test]
async fn test_recovery_attempts_abandoned_after_limit() {
    let ClientFixture { server, client } = TestClientBuilder::new()
        .reconnect(BackoffConfig::fixed(Duration::from_millis(200)).with_max_attempts(2))
        .build();
    client.connect().await.unwrap();

    let mut states = client.subscribe_state();
    server.refuse_connections(true);
    server.restart(false);
    wait_for_state(&mut states, SessionState::Creating, EVENT_TIMEOUT).await;

    let err = client.session().await.unwrap_err();
    assert!(
        matches!(err, OpcUaError::Session(SessionError::RecoveryAbandoned { attempts: 3 })),
        "unexpected error: {err:?}"
    );
    assert_eq!(client.state(), SessionState::Inactive);

    server.refuse_connections(false);
    client.session().await.unwrap();
    assert_eq!(client.state(), SessionState::Active);
    client.stats().assert_sessions_created(2);
}
