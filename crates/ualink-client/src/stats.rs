// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Client statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// =============================================================================
// ClientStats
// =============================================================================

/// Counters shared by the correlator, session machine and publish engine.
#[derive(Debug, Default)]
pub struct ClientStats {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    request_timeouts: AtomicU64,
    late_responses: AtomicU64,
    send_retries: AtomicU64,
    channel_opens: AtomicU64,
    sessions_created: AtomicU64,
    sessions_reactivated: AtomicU64,
    publish_requests: AtomicU64,
    notifications_delivered: AtomicU64,
    duplicates_discarded: AtomicU64,
    republish_requests: AtomicU64,
    messages_lost: AtomicU64,
    acknowledgements_rejected: AtomicU64,
    orphans_deleted: AtomicU64,
}

macro_rules! counters {
    ($($field:ident => $record:ident, $doc:literal;)*) => {
        impl ClientStats {
            $(
                #[doc = concat!("Records ", $doc, ".")]
                #[inline]
                pub fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }

                #[doc = concat!("Number of ", $doc, ".")]
                #[inline]
                pub fn $field(&self) -> u64 {
                    self.$field.load(Ordering::Relaxed)
                }
            )*

            /// Takes a point-in-time copy of every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field(),)*
                }
            }

            /// Resets all counters.
            pub fn reset(&self) {
                $(self.$field.store(0, Ordering::Relaxed);)*
            }
        }

        /// Serializable copy of [`ClientStats`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
        pub struct StatsSnapshot {
            $(
                #[doc = concat!("Number of ", $doc, ".")]
                pub $field: u64,
            )*
        }
    };
}

counters! {
    requests_sent => record_request_sent, "requests transmitted";
    responses_received => record_response, "responses matched to a pending request";
    request_timeouts => record_timeout, "requests that timed out locally";
    late_responses => record_late_response, "responses or failures for unknown request ids";
    send_retries => record_send_retry, "sends retried after a channel closed";
    channel_opens => record_channel_open, "secure channels opened";
    sessions_created => record_session_created, "sessions created";
    sessions_reactivated => record_session_reactivated, "sessions reactivated on a new channel";
    publish_requests => record_publish_request, "Publish requests sent";
    notifications_delivered => record_notification_delivered, "notification messages delivered";
    duplicates_discarded => record_duplicate, "duplicate notification messages discarded";
    republish_requests => record_republish, "Republish requests sent";
    messages_lost => record_message_lost, "notification messages lost after a failed republish";
    acknowledgements_rejected => record_acknowledgement_rejected, "acknowledgements the server rejected";
    orphans_deleted => record_orphan_deleted, "server subscriptions unknown to the client deleted on the server";
}

impl ClientStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_snapshot_reset() {
        let stats = ClientStats::new();
        stats.record_request_sent();
        stats.record_request_sent();
        stats.record_duplicate();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_sent, 2);
        assert_eq!(snapshot.duplicates_discarded, 1);
        assert_eq!(stats.requests_sent(), 2);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
