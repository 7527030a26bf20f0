// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Publish loop and notification sequencing.
//!
//! [`PublishEngine`] keeps Publish requests outstanding while the session is
//! active and at least one subscription exists. Responses are routed to the
//! owning [`Subscription`], whose [`NotificationSequencer`] decides what can be
//! delivered, what must be re-requested with Republish and what is a
//! duplicate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::correlator::RequestCorrelator;
use crate::error::{OpcUaError, OpcUaResult};
use crate::message::{
    expect_response, DeleteSubscriptionsRequest, NotificationData, NotificationMessage,
    PublishRequest, PublishResponse, RepublishRequest, RequestMessage, SubscriptionAcknowledgement,
};
use crate::session::{Session, SessionFsm, SessionState};
use crate::stats::ClientStats;
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::types::StatusCode;

// =============================================================================
// NotificationSequencer
// =============================================================================

/// Result of feeding a message to the sequencer.
#[derive(Debug, Default)]
pub struct SequenceOutcome {
    /// Messages now deliverable, in sequence order.
    pub deliver: Vec<NotificationMessage>,
    /// Sequence numbers to request with Republish.
    pub republish: Vec<u32>,
    /// The message had already been delivered or buffered.
    pub duplicate: bool,
}

/// Per-subscription ordering state.
///
/// Delivery is strictly increasing by sequence number: a message is released
/// only once every earlier number was delivered or declared lost.
#[derive(Debug, Default)]
pub struct NotificationSequencer {
    last_delivered: u32,
    buffered: BTreeMap<u32, NotificationMessage>,
    requested: BTreeSet<u32>,
    lost: BTreeSet<u32>,
}

impl NotificationSequencer {
    /// A sequencer expecting sequence number 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// A sequencer that already delivered everything up to `last_delivered`.
    pub fn starting_after(last_delivered: u32) -> Self {
        Self {
            last_delivered,
            ..Self::default()
        }
    }

    /// Highest delivered sequence number; 0 before the first delivery.
    pub fn last_delivered(&self) -> u32 {
        self.last_delivered
    }

    /// Number of messages held back behind a gap.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Sequence numbers with a Republish outstanding.
    pub fn requested(&self) -> impl Iterator<Item = u32> + '_ {
        self.requested.iter().copied()
    }

    /// Feeds a data message from Publish or Republish.
    pub fn accept(&mut self, message: NotificationMessage) -> SequenceOutcome {
        let mut outcome = SequenceOutcome::default();
        let sequence_number = message.sequence_number;
        self.requested.remove(&sequence_number);

        if sequence_number <= self.last_delivered || self.buffered.contains_key(&sequence_number) {
            outcome.duplicate = true;
            return outcome;
        }

        self.lost.remove(&sequence_number);
        self.buffered.insert(sequence_number, message);
        outcome.republish = self.missing_before(sequence_number);
        self.drain(&mut outcome.deliver);
        outcome
    }

    /// Handles a keep-alive carrying the next sequence number the server
    /// will use. Returns the numbers that should have arrived already.
    pub fn keep_alive(&mut self, next_sequence_number: u32) -> Vec<u32> {
        self.missing_before(next_sequence_number)
    }

    /// Declares sequence numbers unrecoverable and releases what they held back.
    pub fn mark_lost(&mut self, sequence_numbers: &[u32]) -> Vec<NotificationMessage> {
        for &sequence_number in sequence_numbers {
            self.requested.remove(&sequence_number);
            if sequence_number > self.last_delivered && !self.buffered.contains_key(&sequence_number) {
                self.lost.insert(sequence_number);
            }
        }
        let mut deliver = Vec::new();
        self.drain(&mut deliver);
        deliver
    }

    /// Cancels outstanding Republish requests without declaring the
    /// messages lost; a later keep-alive, message or transfer asks again.
    pub fn withdraw(&mut self, sequence_numbers: &[u32]) {
        for sequence_number in sequence_numbers {
            self.requested.remove(sequence_number);
        }
    }

    /// Handles the sequence numbers a server still holds after a transfer.
    pub fn available(&mut self, sequence_numbers: &[u32]) -> Vec<u32> {
        let mut missing: Vec<u32> = sequence_numbers
            .iter()
            .copied()
            .filter(|s| *s > self.last_delivered && self.is_unaccounted(*s))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        self.requested.extend(missing.iter().copied());
        missing
    }

    /// Forgets everything; the next expected number is 1.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn is_unaccounted(&self, sequence_number: u32) -> bool {
        !self.buffered.contains_key(&sequence_number)
            && !self.requested.contains(&sequence_number)
            && !self.lost.contains(&sequence_number)
    }

    fn missing_before(&mut self, sequence_number: u32) -> Vec<u32> {
        let first = self.last_delivered.saturating_add(1);
        let missing: Vec<u32> = (first..sequence_number)
            .filter(|s| self.is_unaccounted(*s))
            .collect();
        self.requested.extend(missing.iter().copied());
        missing
    }

    fn drain(&mut self, deliver: &mut Vec<NotificationMessage>) {
        while let Some(next) = self.last_delivered.checked_add(1) {
            if let Some(message) = self.buffered.remove(&next) {
                deliver.push(message);
            } else if !self.lost.remove(&next) {
                break;
            }
            self.last_delivered = next;
        }
    }
}

// =============================================================================
// Publish timing
// =============================================================================

/// Timeout hint for a Publish request.
///
/// The request may legitimately sit on the server for a full keep-alive
/// period per outstanding Publish.
pub fn publish_timeout_hint(
    request_timeout: Duration,
    longest_keep_alive: Duration,
    pending: u32,
) -> Duration {
    request_timeout
        .max(longest_keep_alive)
        .mul_f64(f64::from(pending.max(1)) * 1.5)
}

/// Number of Publish requests to keep outstanding.
pub fn pending_limit(subscription_count: usize, max_pending: u32) -> u32 {
    if subscription_count == 0 {
        return 0;
    }
    let wanted = u32::try_from(subscription_count.saturating_add(1)).unwrap_or(u32::MAX);
    wanted.min(max_pending.max(1))
}

// =============================================================================
// PublishEngine
// =============================================================================

/// Drives the Publish loop for one client.
pub struct PublishEngine {
    config: Arc<ClientConfig>,
    correlator: Arc<RequestCorrelator>,
    fsm: Arc<SessionFsm>,
    registry: Arc<SubscriptionRegistry>,
    stats: Arc<ClientStats>,
    runtime: Handle,
    pending: AtomicU32,
    max_pending: AtomicU32,
    acknowledgements: Mutex<Vec<SubscriptionAcknowledgement>>,
    running: AtomicBool,
    cancel: CancellationToken,
}

impl PublishEngine {
    /// Creates the engine and starts watching session state.
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        correlator: Arc<RequestCorrelator>,
        fsm: Arc<SessionFsm>,
        registry: Arc<SubscriptionRegistry>,
        stats: Arc<ClientStats>,
        runtime: Handle,
    ) -> Arc<Self> {
        let max_pending = config.max_pending_publish_requests.max(1);
        let state_rx = fsm.subscribe_state();
        let engine = Arc::new(Self {
            config,
            correlator,
            fsm,
            registry,
            stats,
            runtime,
            pending: AtomicU32::new(0),
            max_pending: AtomicU32::new(max_pending),
            acknowledgements: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        });

        engine.runtime.spawn(watch_session(
            Arc::downgrade(&engine),
            state_rx,
            engine.cancel.clone(),
        ));
        engine
    }

    /// Publish requests currently outstanding.
    pub fn pending_count(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Current cap on outstanding Publish requests.
    pub fn max_pending(&self) -> u32 {
        self.max_pending.load(Ordering::Acquire)
    }

    /// Acknowledgements waiting for the next Publish.
    pub fn queued_acknowledgements(&self) -> usize {
        self.acknowledgements.lock().len()
    }

    /// Returns `true` unless stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops issuing Publish requests. Outstanding ones complete normally.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Resumes after [`stop`](Self::stop).
    pub fn resume(self: &Arc<Self>) {
        self.running.store(true, Ordering::Release);
        self.kick();
    }

    /// Tops the pipeline up to the pending limit.
    pub(crate) fn kick(self: &Arc<Self>) {
        if !self.is_running() || self.fsm.state() != SessionState::Active {
            return;
        }
        let Some(session) = self.fsm.current_session() else {
            return;
        };

        let limit = pending_limit(self.registry.len(), self.max_pending());
        loop {
            let current = self.pending.load(Ordering::Acquire);
            if current >= limit {
                return;
            }
            if self
                .pending
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let engine = self.clone();
            let session = session.clone();
            self.runtime
                .spawn(async move { engine.publish(session, current + 1).await });
        }
    }

    async fn publish(self: Arc<Self>, session: Arc<Session>, pending: u32) {
        let acknowledgements = std::mem::take(&mut *self.acknowledgements.lock());
        let longest_keep_alive = self
            .registry
            .all()
            .iter()
            .map(|s| s.keep_alive_period())
            .max()
            .unwrap_or_default();
        let timeout = publish_timeout_hint(self.config.request_timeout, longest_keep_alive, pending);

        trace!(
            pending,
            acknowledgements = acknowledgements.len(),
            timeout = ?timeout,
            "Sending Publish"
        );
        self.stats.record_publish_request();
        let request = RequestMessage::new(
            session.request_header(timeout),
            PublishRequest {
                subscription_acknowledgements: acknowledgements.clone(),
            },
        );
        let result = self.correlator.send(request).await;
        self.pending.fetch_sub(1, Ordering::AcqRel);

        let response = result.and_then(|response| expect_response!(response, Publish));
        match response {
            Ok(body) => {
                self.kick();
                self.on_publish_response(&session, body).await;
            }
            Err(error) => {
                // Unacknowledged messages stay in the server's retransmission
                // queue; acknowledgements for removed subscriptions are dropped.
                let requeue = acknowledgements
                    .into_iter()
                    .filter(|ack| self.registry.get(ack.subscription_id).is_some());
                self.acknowledgements.lock().extend(requeue);
                self.on_publish_error(error);
            }
        }
    }

    async fn on_publish_response(&self, session: &Arc<Session>, response: PublishResponse) {
        for (ack, status) in response.results.iter().enumerate() {
            if status.is_bad() {
                self.stats.record_acknowledgement_rejected();
                debug!(index = ack, status = %status, "Acknowledgement rejected");
            }
        }

        let subscription_id = response.subscription_id;
        let message = response.notification_message;
        let sequence_number = message.sequence_number;

        let Some(subscription) = self.registry.get(subscription_id) else {
            if message.is_keep_alive() {
                debug!(subscription_id, "Keep-alive for unknown subscription");
            } else {
                self.delete_orphan(session, subscription_id, sequence_number).await;
            }
            return;
        };

        if message.is_keep_alive() {
            trace!(subscription_id, sequence_number, "Keep-alive");
            let missing = subscription.on_keep_alive(&message);
            self.republish(session, &subscription, missing).await;
            return;
        }

        self.acknowledge(subscription_id, sequence_number);
        let timed_out = message.notification_data.iter().any(|data| {
            matches!(data, NotificationData::StatusChange(status) if status.matches(StatusCode::BAD_TIMEOUT))
        });

        let missing = subscription.on_message(message);
        if !missing.is_empty() {
            debug!(
                subscription_id,
                sequence_number,
                missing = ?missing,
                "Sequence gap, requesting republish"
            );
        }
        self.republish(session, &subscription, missing).await;

        if timed_out {
            warn!(subscription_id, "Subscription timed out on the server, removing");
            self.registry.remove(subscription_id);
            self.forget(subscription_id);
        }
    }

    /// Deletes a subscription the server publishes for but the client no
    /// longer knows. If that fails the message is acknowledged instead.
    async fn delete_orphan(&self, session: &Arc<Session>, subscription_id: u32, sequence_number: u32) {
        warn!(subscription_id, sequence_number, "Notification for unknown subscription, deleting it");
        let request = RequestMessage::new(
            session.request_header(self.config.request_timeout),
            DeleteSubscriptionsRequest {
                subscription_ids: vec![subscription_id],
            },
        );
        let response = self
            .correlator
            .send(request)
            .await
            .and_then(|response| expect_response!(response, DeleteSubscriptions));
        match response {
            Ok(body) if body.results.first().is_some_and(StatusCode::is_good) => {
                self.stats.record_orphan_deleted();
                debug!(subscription_id, "Orphaned subscription deleted");
            }
            Ok(body) => {
                debug!(subscription_id, results = ?body.results, "Orphaned subscription already gone");
            }
            Err(error) => {
                debug!(subscription_id, error = %error, "Orphaned subscription not deleted");
                self.acknowledge(subscription_id, sequence_number);
            }
        }
    }

    fn on_publish_error(self: &Arc<Self>, error: OpcUaError) {
        let status = error.status_code();
        if status.matches(StatusCode::BAD_NO_SUBSCRIPTION) {
            debug!("Server has no subscriptions, waiting for one");
        } else if status.matches(StatusCode::BAD_TOO_MANY_PUBLISH_REQUESTS) {
            let cap = self.pending_count().max(1);
            self.max_pending.store(cap, Ordering::Release);
            warn!(max_pending = cap, "Server rejected Publish, lowering pipeline depth");
        } else if error.is_session_invalid() || error.is_channel_closed() {
            // Resumed by the session watcher once the session is active again.
            debug!(error = %error, "Publish stopped until the session recovers");
        } else {
            debug!(error = %error, "Publish failed, re-issuing");
            self.kick();
        }
    }

    pub(crate) async fn republish(
        &self,
        session: &Arc<Session>,
        subscription: &Arc<Subscription>,
        sequence_numbers: Vec<u32>,
    ) {
        if sequence_numbers.is_empty() {
            return;
        }

        let subscription_id = subscription.subscription_id();
        let mut lost = Vec::new();
        let mut remaining = sequence_numbers.into_iter();
        while let Some(sequence_number) = remaining.next() {
            self.stats.record_republish();
            match self
                .request_republish(session, subscription_id, sequence_number)
                .await
            {
                Ok(message) => {
                    self.acknowledge(subscription_id, sequence_number);
                    subscription.on_message(message);
                }
                Err(error) if error.status_code().is_message_unavailable() => {
                    debug!(subscription_id, sequence_number, error = %error, "Message not available");
                    self.stats.record_message_lost();
                    lost.push(sequence_number);
                }
                Err(error) => {
                    // The server may still hold these; ask again later.
                    let deferred: Vec<u32> = std::iter::once(sequence_number).chain(remaining).collect();
                    debug!(subscription_id, deferred = ?deferred, error = %error, "Republish deferred");
                    subscription.withdraw_republish(&deferred);
                    break;
                }
            }
        }

        if !lost.is_empty() {
            warn!(subscription_id, lost = ?lost, "Notification messages lost");
            subscription.mark_lost(lost);
        }
    }

    async fn request_republish(
        &self,
        session: &Arc<Session>,
        subscription_id: u32,
        retransmit_sequence_number: u32,
    ) -> OpcUaResult<NotificationMessage> {
        let request = RequestMessage::new(
            session.request_header(self.config.request_timeout),
            RepublishRequest {
                subscription_id,
                retransmit_sequence_number,
            },
        );
        let response = self.correlator.send(request).await?;
        Ok(expect_response!(response, Republish)?.notification_message)
    }

    fn acknowledge(&self, subscription_id: u32, sequence_number: u32) {
        self.acknowledgements.lock().push(SubscriptionAcknowledgement {
            subscription_id,
            sequence_number,
        });
    }

    /// Drops queued acknowledgements for a subscription that no longer exists.
    pub(crate) fn forget(&self, subscription_id: u32) {
        self.acknowledgements
            .lock()
            .retain(|ack| ack.subscription_id != subscription_id);
    }
}

impl Drop for PublishEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PublishEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishEngine")
            .field("pending", &self.pending_count())
            .field("max_pending", &self.max_pending())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn watch_session(
    engine: Weak<PublishEngine>,
    mut state_rx: watch::Receiver<SessionState>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let active = *state_rx.borrow_and_update() == SessionState::Active;
        let Some(engine) = engine.upgrade() else {
            return;
        };
        if active {
            engine.kick();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::message::MonitoredItemNotification;
    use crate::types::DataValue;

    fn message(sequence_number: u32) -> NotificationMessage {
        NotificationMessage {
            sequence_number,
            publish_time: Utc::now(),
            notification_data: vec![NotificationData::DataChange(vec![
                MonitoredItemNotification {
                    client_handle: 1,
                    value: DataValue::new(f64::from(sequence_number)),
                },
            ])],
        }
    }

    fn numbers(messages: &[NotificationMessage]) -> Vec<u32> {
        messages.iter().map(|m| m.sequence_number).collect()
    }

    #[test]
    fn test_in_order_delivery() {
        let mut sequencer = NotificationSequencer::new();
        for n in 1..=3 {
            let outcome = sequencer.accept(message(n));
            assert_eq!(numbers(&outcome.deliver), vec![n]);
            assert!(outcome.republish.is_empty());
        }
        assert_eq!(sequencer.last_delivered(), 3);
    }

    #[test]
    fn test_gap_buffers_and_requests_republish() {
        let mut sequencer = NotificationSequencer::new();
        sequencer.accept(message(1));

        let outcome = sequencer.accept(message(4));
        assert!(outcome.deliver.is_empty());
        assert_eq!(outcome.republish, vec![2, 3]);
        assert_eq!(sequencer.buffered_len(), 1);

        // A later arrival does not re-request numbers already in flight.
        let outcome = sequencer.accept(message(5));
        assert!(outcome.republish.is_empty());

        let outcome = sequencer.accept(message(3));
        assert!(outcome.deliver.is_empty());

        let outcome = sequencer.accept(message(2));
        assert_eq!(numbers(&outcome.deliver), vec![2, 3, 4, 5]);
        assert_eq!(sequencer.requested().count(), 0);
    }

    #[test]
    fn test_duplicates_are_discarded() {
        let mut sequencer = NotificationSequencer::new();
        sequencer.accept(message(1));
        sequencer.accept(message(3));

        assert!(sequencer.accept(message(1)).duplicate);
        assert!(sequencer.accept(message(3)).duplicate);

        let outcome = sequencer.accept(message(2));
        assert_eq!(numbers(&outcome.deliver), vec![2, 3]);
        assert!(sequencer.accept(message(2)).duplicate);
    }

    #[test]
    fn test_any_arrival_order_delivers_ascending() {
        let orders: [&[u32]; 6] = [
            &[1, 2, 3, 4, 5],
            &[5, 4, 3, 2, 1],
            &[2, 1, 4, 3, 5],
            &[3, 5, 1, 2, 4],
            &[1, 1, 3, 2, 3, 5, 4, 5],
            &[4, 2, 5, 1, 3, 2],
        ];

        for order in orders {
            let mut sequencer = NotificationSequencer::new();
            let mut delivered = Vec::new();
            for &n in order {
                delivered.extend(numbers(&sequencer.accept(message(n)).deliver));
            }
            assert_eq!(delivered, vec![1, 2, 3, 4, 5], "arrival order {order:?}");
        }
    }

    #[test]
    fn test_lost_message_releases_later_ones() {
        let mut sequencer = NotificationSequencer::new();
        sequencer.accept(message(1));
        let outcome = sequencer.accept(message(3));
        assert_eq!(outcome.republish, vec![2]);

        let released = sequencer.mark_lost(&[2]);
        assert_eq!(numbers(&released), vec![3]);
        assert_eq!(sequencer.last_delivered(), 3);

        // The lost number showing up later is stale.
        assert!(sequencer.accept(message(2)).duplicate);
    }

    #[test]
    fn test_keep_alive_reveals_gap() {
        let mut sequencer = NotificationSequencer::new();
        sequencer.accept(message(1));

        assert!(sequencer.keep_alive(2).is_empty());
        assert_eq!(sequencer.keep_alive(4), vec![2, 3]);
        assert!(sequencer.keep_alive(4).is_empty());
    }

    #[test]
    fn test_withdrawn_republish_is_requested_again() {
        let mut sequencer = NotificationSequencer::new();
        sequencer.accept(message(1));
        assert_eq!(sequencer.accept(message(3)).republish, vec![2]);

        sequencer.withdraw(&[2]);
        assert_eq!(sequencer.last_delivered(), 1);
        assert_eq!(sequencer.requested().count(), 0);
        assert_eq!(sequencer.available(&[2, 3]), vec![2]);

        sequencer.withdraw(&[2]);
        assert_eq!(sequencer.keep_alive(4), vec![2]);
        assert_eq!(numbers(&sequencer.accept(message(2)).deliver), vec![2, 3]);
    }

    #[test]
    fn test_available_after_transfer() {
        let mut sequencer = NotificationSequencer::starting_after(5);
        assert_eq!(sequencer.available(&[4, 7, 6, 6]), vec![6, 7]);
        assert!(sequencer.available(&[6, 7]).is_empty());

        sequencer.reset();
        assert_eq!(sequencer.last_delivered(), 0);
    }

    #[test]
    fn test_publish_timeout_hint() {
        let hint = publish_timeout_hint(Duration::from_secs(10), Duration::from_secs(20), 2);
        assert_eq!(hint, Duration::from_secs(60));

        let hint = publish_timeout_hint(Duration::from_secs(10), Duration::from_secs(1), 0);
        assert_eq!(hint, Duration::from_secs(15));
    }

    #[test]
    fn test_pending_limit() {
        assert_eq!(pending_limit(0, 5), 0);
        assert_eq!(pending_limit(1, 5), 2);
        assert_eq!(pending_limit(10, 5), 5);
        assert_eq!(pending_limit(3, 0), 1);
    }
}
