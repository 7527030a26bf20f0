// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Session Integration Tests
//!
//! Integration tests for the session state machine against the in-memory
//! server:
//!
//! - Single session under concurrent first use
//! - Session future identity across reactivation
//! - Keep-alive failure, close and restart
//! - Identity and certificate validation
//!
//! ## Test Categories
//!
//! - `test_session_*`: Creation, activation and close
//! - `test_keep_alive_*`: Keep-alive monitoring
//! - `test_security_*`: Identity tokens and certificate validation

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use ualink_client::{
    error::{OpcUaError, SessionError},
    identity::{hex_encode, ThumbprintValidator, UsernameProvider},
    message::{IdentityToken, RequestKind},
    session::{SessionActivation, SessionFsm, SessionState},
    subscription::ChannelListener,
    types::{NodeId, SecurityMode, SecurityPolicy, StatusCode, Variant},
};

use ualink_tests::common::{
    assertions::{eventually, wait_for_state, within, StatsAssertions, EVENT_TIMEOUT},
    builders::{ClientFixture, TestClientBuilder},
    fixtures::{fast_subscription, nodes},
    harness::TestHarness,
    init_test_logging,
    mocks::{RecordingActivityListener, ServerBehavior},
};

// =============================================================================
// Creation Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_concurrent_first_use_creates_one_session() {
    init_test_logging();
    let ClientFixture { server, client } = ClientFixture::new();
    let client = Arc::new(client);

    let calls = (0..10).map(|_| {
        let client = client.clone();
        tokio::spawn(async move {
            let (listener, _rx) = ChannelListener::new();
            client.create_subscription(fast_subscription(), listener).await
        })
    });
    let results = within(EVENT_TIMEOUT, join_all(calls)).await;

    for result in results {
        let subscription = result.expect("task panicked").expect("subscription created");
        assert!(subscription.subscription_id() > 0);
    }

    assert_eq!(server.request_count(RequestKind::CreateSession), 1);
    assert_eq!(server.request_count(RequestKind::ActivateSession), 1);
    assert_eq!(server.request_count(RequestKind::CreateSubscription), 10);
    assert_eq!(server.subscription_ids().len(), 10);
    assert_eq!(server.subscription_owners().len(), 1);
    assert_eq!(client.subscription_manager().subscriptions().len(), 10);
    client.stats().assert_sessions_created(1);
}

#[tokio::test]
async fn test_session_connect_and_disconnect() {
    let ClientFixture { server, client } = ClientFixture::new();
    assert_eq!(client.state(), SessionState::Inactive);

    let session = client.connect().await.unwrap();
    assert_eq!(client.state(), SessionState::Active);
    assert_eq!(session.session_id(), &NodeId::numeric(1, 1));
    assert!(client.channel().is_some());
    assert_eq!(server.session_count(), 1);

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(server.request_count(RequestKind::CloseSession), 1);
    assert_eq!(server.session_count(), 0);
    client.stats().assert_no_late_responses();
}

#[tokio::test]
async fn test_session_closed_client_can_reconnect() {
    let ClientFixture { server, client } = ClientFixture::new();

    let first = client.connect().await.unwrap();
    client.disconnect().await.unwrap();

    let second = client.connect().await.unwrap();
    assert_ne!(first.session_id(), second.session_id());
    assert_eq!(client.state(), SessionState::Active);
    assert_eq!(server.request_count(RequestKind::CreateSession), 2);
    client.stats().assert_sessions_created(2);
}

#[tokio::test]
async fn test_session_started_on_demand_by_read() {
    let ClientFixture { server, client } = ClientFixture::new();

    let value = client.read_value(nodes::temperature()).await.unwrap();
    assert_eq!(value.value.as_f64(), Some(20.0));
    assert_eq!(client.state(), SessionState::Active);
    assert_eq!(server.request_count(RequestKind::CreateSession), 1);
}

#[tokio::test]
async fn test_session_creation_failure_reaches_waiter() {
    let ClientFixture { server, client } = ClientFixture::new();
    server.fail_next(RequestKind::CreateSession, StatusCode::BAD_INTERNAL_ERROR);

    let err = client.session().await.unwrap_err();
    assert!(
        matches!(err, OpcUaError::Session(SessionError::CreationFailed { .. })),
        "unexpected error: {err:?}"
    );
    assert!(err.status_code().matches(StatusCode::BAD_INTERNAL_ERROR));
    assert_eq!(client.state(), SessionState::Inactive);

    // The next request starts over.
    client.session().await.unwrap();
    assert_eq!(client.state(), SessionState::Active);
}

#[tokio::test]
async fn test_session_close_fails_pending_waiters() {
    let ClientFixture { server, client } = ClientFixture::new();
    let client = Arc::new(client);
    server.set_unresponsive(RequestKind::CreateSession, true);

    let mut states = client.subscribe_state();
    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.session().await })
    };
    wait_for_state(&mut states, SessionState::Creating, EVENT_TIMEOUT).await;

    client.session_fsm().close().await.unwrap();

    let err = within(EVENT_TIMEOUT, waiter).await.unwrap().unwrap_err();
    assert!(matches!(err, OpcUaError::Session(SessionError::Closed)));
    assert_eq!(client.state(), SessionState::Closed);
}

// =============================================================================
// Reactivation Tests
// =============================================================================

#[tokio::test]
async fn test_session_future_survives_reactivation() {
    let listener = RecordingActivityListener::new();
    let ClientFixture { server, client } = TestClientBuilder::new()
        .activity_listener(listener.clone())
        .build();

    let session = client.connect().await.unwrap();
    let before = client.session_future().await.unwrap();

    server.drop_channel("network blip");
    eventually("session reactivated", EVENT_TIMEOUT, || {
        client.stats().sessions_reactivated == 1 && client.state() == SessionState::Active
    })
    .await;

    let after = client.session_future().await.unwrap();
    assert!(SessionFsm::same_future(&before, &after));
    assert!(Arc::ptr_eq(&session, &client.session().await.unwrap()));

    assert_eq!(server.request_count(RequestKind::CreateSession), 1);
    assert_eq!(server.request_count(RequestKind::ActivateSession), 2);
    assert_eq!(server.connect_count(), 2);
    assert_eq!(
        listener.activations(),
        vec![SessionActivation::Created, SessionActivation::Reactivated]
    );
    assert_eq!(listener.inactive_count(), 0);
}

#[tokio::test]
async fn test_session_requests_wait_while_reactivating() {
    let ClientFixture { server, client } = TestClientBuilder::new()
        .request_timeout(Duration::from_millis(500))
        .build();
    let client = Arc::new(client);
    client.connect().await.unwrap();

    let mut states = client.subscribe_state();
    server.set_unresponsive(RequestKind::ActivateSession, true);
    server.drop_channel("network blip");
    wait_for_state(&mut states, SessionState::Reactivating, EVENT_TIMEOUT).await;

    let reads = server.request_count(RequestKind::Read);
    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read_value(nodes::pressure()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!reader.is_finished());
    assert_eq!(client.state(), SessionState::Reactivating);
    assert_eq!(server.request_count(RequestKind::Read), reads);

    // The swallowed ActivateSession times out and the session is recreated.
    server.set_unresponsive(RequestKind::ActivateSession, false);
    let value = within(EVENT_TIMEOUT, reader).await.unwrap().unwrap();
    assert_eq!(value.value, Variant::from(1.0));
    assert_eq!(client.state(), SessionState::Active);
    assert_eq!(server.request_count(RequestKind::CreateSession), 2);
}

#[tokio::test]
async fn test_session_recreated_when_server_forgets_it() {
    let listener = RecordingActivityListener::new();
    let ClientFixture { server, client } = TestClientBuilder::new()
        .activity_listener(listener.clone())
        .build();

    let first = client.connect().await.unwrap();
    let before = client.session_future().await.unwrap();

    server.restart(false);
    eventually("session recreated", EVENT_TIMEOUT, || {
        client.stats().sessions_created == 2 && client.state() == SessionState::Active
    })
    .await;

    let second = client.session().await.unwrap();
    assert_ne!(first.session_id(), second.session_id());

    let after = client.session_future().await.unwrap();
    assert!(!SessionFsm::same_future(&before, &after));

    assert_eq!(
        listener.activations(),
        vec![SessionActivation::Created, SessionActivation::Created]
    );
    eventually("old session reported inactive", EVENT_TIMEOUT, || {
        listener.inactive_count() == 1
    })
    .await;
}

#[tokio::test]
async fn test_session_state_listener_sees_recovery_path() {
    let ClientFixture { server, client } = ClientFixture::new();
    let transitions = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let transitions = transitions.clone();
        client.add_state_listener(move |old, new| transitions.lock().push((old, new)));
    }

    client.connect().await.unwrap();
    server.restart(false);
    eventually("session recreated", EVENT_TIMEOUT, || {
        client.stats().sessions_created == 2
    })
    .await;

    use SessionState::*;
    assert_eq!(
        *transitions.lock(),
        vec![
            (Inactive, Creating),
            (Creating, Active),
            (Active, Reactivating),
            (Reactivating, Creating),
            (Creating, Active),
        ]
    );
}

// =============================================================================
// Keep-alive Tests
// =============================================================================

#[tokio::test]
async fn test_keep_alive_failures_trigger_reactivation() {
    let ClientFixture { server, client } = TestClientBuilder::new()
        .keep_alive(Duration::from_millis(50), Duration::from_millis(50), 1)
        .build();

    client.connect().await.unwrap();
    eventually("keep-alive reads sent", EVENT_TIMEOUT, || {
        server.request_count(RequestKind::Read) >= 2
    })
    .await;
    assert_eq!(client.stats().sessions_reactivated, 0);

    server.set_unresponsive(RequestKind::Read, true);
    eventually("session reactivated", EVENT_TIMEOUT, || {
        client.stats().sessions_reactivated >= 1
    })
    .await;
    server.set_unresponsive(RequestKind::Read, false);

    let mut states = client.subscribe_state();
    wait_for_state(&mut states, SessionState::Active, EVENT_TIMEOUT).await;
    assert_eq!(server.request_count(RequestKind::CreateSession), 1);
    assert!(client.stats().request_timeouts >= 2);
}

// =============================================================================
// Security Tests
// =============================================================================

#[tokio::test]
async fn test_security_username_identity_is_presented() {
    TestHarness::with_name("username_identity")
        .client(|b| b.identity(Arc::new(UsernameProvider::new("operator", "secret"))))
        .run(|res| async move {
            res.client.connect().await.unwrap();

            let identities = res.server.identities();
            assert_eq!(identities.len(), 1);
            match &identities[0] {
                IdentityToken::UserName { user_name, .. } => assert_eq!(user_name, "operator"),
                other => panic!("Expected a user name token, got {:?}", other),
            }
        })
        .await;
}

#[tokio::test]
async fn test_security_untrusted_server_certificate_is_rejected() {
    let behavior = ServerBehavior::default()
        .secured(SecurityMode::SignAndEncrypt, SecurityPolicy::Basic256Sha256);
    let certificate = behavior.server_certificate.clone();
    let validator = Arc::new(ThumbprintValidator::new(Arc::new(hex_encode)));

    let ClientFixture { server, client } = TestClientBuilder::new()
        .behavior(behavior)
        .configure(|c| {
            c.security_mode = SecurityMode::SignAndEncrypt;
            c.security_policy = SecurityPolicy::Basic256Sha256;
        })
        .validator(validator.clone())
        .build();

    let err = client.session().await.unwrap_err();
    assert!(matches!(err, OpcUaError::Security(_)), "unexpected error: {err:?}");
    assert_eq!(client.state(), SessionState::Inactive);
    assert_eq!(server.request_count(RequestKind::ActivateSession), 0);

    validator.trust(hex_encode(&certificate).to_lowercase());
    client.session().await.unwrap();
    assert_eq!(client.state(), SessionState::Active);
}
