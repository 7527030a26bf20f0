// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Custom Test Assertions
//!
//! Assertion helpers for subscription events, session state and stats, plus
//! bounded waits on asynchronous outcomes.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use ualink_client::message::{MonitoredItemNotification, NotificationData};
use ualink_client::session::SessionState;
use ualink_client::stats::StatsSnapshot;
use ualink_client::subscription::SubscriptionEvent;
use ualink_client::types::Variant;

/// Default bound on any awaited outcome.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Event waits
// =============================================================================

/// Receive the next subscription event or panic after `timeout`.
pub async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<SubscriptionEvent>,
    timeout: Duration,
) -> SubscriptionEvent {
    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => panic!("Subscription event channel closed"),
        Err(_) => panic!("No subscription event within {:?}", timeout),
    }
}

/// Receive the next data notification, skipping keep-alives.
pub async fn next_notification(
    rx: &mut mpsc::UnboundedReceiver<SubscriptionEvent>,
    timeout: Duration,
) -> (u32, u32, Vec<MonitoredItemNotification>) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match next_event(rx, remaining).await {
            SubscriptionEvent::Notification {
                subscription_id,
                sequence_number,
                items,
            } => return (subscription_id, sequence_number, data_changes(&items)),
            SubscriptionEvent::KeepAlive { .. } => continue,
            other => panic!("Expected a notification, got {:?}", other),
        }
    }
}

/// Assert that no event other than a keep-alive arrives within `within`.
pub async fn assert_no_notification(
    rx: &mut mpsc::UnboundedReceiver<SubscriptionEvent>,
    within: Duration,
) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Err(_) | Ok(None) => return,
            Ok(Some(SubscriptionEvent::KeepAlive { .. })) => continue,
            Ok(Some(event)) => panic!("Expected no notification, got {:?}", event),
        }
    }
}

/// Flatten the data changes of a notification message.
pub fn data_changes(items: &[NotificationData]) -> Vec<MonitoredItemNotification> {
    items
        .iter()
        .filter_map(|data| match data {
            NotificationData::DataChange(changes) => Some(changes.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Wait until the watched session state equals `expected`.
pub async fn wait_for_state(
    rx: &mut watch::Receiver<SessionState>,
    expected: SessionState,
    timeout: Duration,
) {
    let reached = tokio::time::timeout(timeout, async {
        rx.wait_for(|state| *state == expected).await.is_ok()
    })
    .await;
    match reached {
        Ok(true) => {}
        Ok(false) => panic!("Session state channel closed while waiting for {}", expected),
        Err(_) => panic!(
            "Session did not reach {} within {:?} (now {})",
            expected,
            timeout,
            *rx.borrow()
        ),
    }
}

/// Poll `condition` every 10ms until it holds, or panic after `timeout`.
pub async fn eventually<F>(description: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("Condition not met within {:?}: {}", timeout, description);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `future` or panic after `timeout`.
pub async fn within<F: Future>(timeout: Duration, future: F) -> F::Output {
    tokio::time::timeout(timeout, future)
        .await
        .unwrap_or_else(|_| panic!("Operation did not complete within {:?}", timeout))
}

// =============================================================================
// Notification Assertions
// =============================================================================

/// Assertion extensions for data change lists.
pub trait DataChangeAssertions {
    /// Assert exactly one change, for `client_handle`, carrying `value`.
    fn assert_single(&self, client_handle: u32, value: &Variant);

    /// Assert every change belongs to `client_handle`.
    fn assert_handle(&self, client_handle: u32);
}

impl DataChangeAssertions for Vec<MonitoredItemNotification> {
    fn assert_single(&self, client_handle: u32, value: &Variant) {
        assert_eq!(self.len(), 1, "Expected one data change, got {:?}", self);
        assert_eq!(
            self[0].client_handle, client_handle,
            "Expected client handle {}, got {}",
            client_handle, self[0].client_handle
        );
        assert_eq!(
            &self[0].value.value, value,
            "Expected value {:?}, got {:?}",
            value, self[0].value.value
        );
    }

    fn assert_handle(&self, client_handle: u32) {
        for (i, change) in self.iter().enumerate() {
            assert_eq!(
                change.client_handle, client_handle,
                "Change at index {} has client handle {}, expected {}",
                i, change.client_handle, client_handle
            );
        }
    }
}

// =============================================================================
// Stats Assertions
// =============================================================================

/// Assertion extensions for [`StatsSnapshot`].
pub trait StatsAssertions {
    /// Assert the number of sessions created.
    fn assert_sessions_created(&self, expected: u64);

    /// Assert no response arrived for an unknown or completed request.
    fn assert_no_late_responses(&self);
}

impl StatsAssertions for StatsSnapshot {
    fn assert_sessions_created(&self, expected: u64) {
        assert_eq!(
            self.sessions_created, expected,
            "Expected {} sessions created, but got {}",
            expected, self.sessions_created
        );
    }

    fn assert_no_late_responses(&self) {
        assert_eq!(
            self.late_responses, 0,
            "Expected no late responses, but got {}",
            self.late_responses
        );
    }
}
