// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Request/response correlation over a replaceable secure channel.
//!
//! Every request gets the next id from a monotonically increasing counter;
//! the id is stamped into the request handle and a pending entry is kept
//! until a response, a failure, a timeout or a channel loss resolves it.
//! Each entry resolves exactly once; whatever arrives afterwards for the same
//! id is logged at `warn` and dropped.
//!
//! # Retry
//!
//! Only the transmit step is retried, once, when it fails because the channel
//! is closed. A request that reached the wire and then lost its channel is
//! failed, since the server may already have processed it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{OpcUaError, OpcUaResult};
use crate::message::{RequestKind, RequestMessage, ResponseMessage, UaResponse};
use crate::stats::ClientStats;
use crate::transport::{ChannelEvent, ChannelInfo, SecureChannelTransport, TransportEvent};
use crate::types::StatusCode;

type ResponseSender = oneshot::Sender<OpcUaResult<ResponseMessage>>;
type ResponseReceiver = oneshot::Receiver<OpcUaResult<ResponseMessage>>;

const CHANNEL_EVENT_CAPACITY: usize = 64;

struct PendingRequest {
    tx: ResponseSender,
    kind: RequestKind,
    sent_at: Instant,
}

// =============================================================================
// RequestCorrelator
// =============================================================================

/// Matches responses to requests and owns the channel snapshot.
pub struct RequestCorrelator {
    transport: Arc<dyn SecureChannelTransport>,
    next_request_id: AtomicU32,
    pending: DashMap<u32, PendingRequest>,
    channel: ArcSwapOption<ChannelInfo>,
    connect_lock: Mutex<()>,
    channel_events: broadcast::Sender<ChannelEvent>,
    stats: Arc<ClientStats>,
    cancel: CancellationToken,
}

impl RequestCorrelator {
    /// Attaches to `transport` and spawns the dispatch task on `runtime`.
    pub fn new(
        transport: Arc<dyn SecureChannelTransport>,
        stats: Arc<ClientStats>,
        runtime: &Handle,
    ) -> Arc<Self> {
        let (sink, events) = mpsc::unbounded_channel();
        transport.attach(sink);

        let (channel_events, _) = broadcast::channel(CHANNEL_EVENT_CAPACITY);
        let cancel = CancellationToken::new();

        let correlator = Arc::new(Self {
            transport,
            next_request_id: AtomicU32::new(1),
            pending: DashMap::new(),
            channel: ArcSwapOption::from(None),
            connect_lock: Mutex::new(()),
            channel_events,
            stats,
            cancel: cancel.clone(),
        });

        runtime.spawn(dispatch_loop(Arc::downgrade(&correlator), events, cancel));
        correlator
    }

    /// Sends a request and waits for its response.
    ///
    /// A bad service result is returned as [`OpcUaError::Service`].
    pub async fn send(&self, request: RequestMessage) -> OpcUaResult<ResponseMessage> {
        let kind = request.kind();
        let timeout_hint = request.header.timeout_hint;

        let (request_id, rx) = match self.transmit(request.clone()).await {
            Ok(sent) => sent,
            Err(e) if e.is_channel_closed() => {
                debug!(service = %kind, error = %e, "Channel closed on send, retrying once");
                self.stats.record_send_retry();
                self.ensure_channel().await?;
                self.transmit(request).await?
            }
            Err(e) => return Err(e),
        };

        let response = self.await_response(request_id, kind, timeout_hint, rx).await?;
        let status = response.header.service_result;
        if matches!(response.body, UaResponse::ServiceFault) {
            let status = if status.is_bad() {
                status
            } else {
                StatusCode::BAD_UNKNOWN_RESPONSE
            };
            return Err(OpcUaError::service(kind, status));
        }
        if status.is_bad() {
            return Err(OpcUaError::service(kind, status));
        }
        Ok(response)
    }

    async fn transmit(&self, mut request: RequestMessage) -> OpcUaResult<(u32, ResponseReceiver)> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind();
        request.header.request_handle = request_id;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id,
            PendingRequest {
                tx,
                kind,
                sent_at: Instant::now(),
            },
        );

        trace!(request_id, service = %kind, "Sending request");
        if let Err(e) = self.transport.transmit(request_id, request).await {
            self.pending.remove(&request_id);
            return Err(e);
        }
        self.stats.record_request_sent();
        Ok((request_id, rx))
    }

    async fn await_response(
        &self,
        request_id: u32,
        kind: RequestKind,
        timeout_hint: Duration,
        mut rx: ResponseReceiver,
    ) -> OpcUaResult<ResponseMessage> {
        if timeout_hint.is_zero() {
            return rx.await.unwrap_or_else(|_| Err(abandoned()));
        }

        match tokio::time::timeout(timeout_hint, &mut rx).await {
            Ok(result) => result.unwrap_or_else(|_| Err(abandoned())),
            Err(_) => {
                if self.pending.remove(&request_id).is_none() {
                    // Resolved between the deadline and the removal.
                    warn!(request_id, service = %kind, "Timeout fired for an already completed request");
                    return rx.await.unwrap_or_else(|_| Err(abandoned()));
                }
                self.stats.record_timeout();
                debug!(request_id, service = %kind, timeout = ?timeout_hint, "Request timed out");
                Err(OpcUaError::request_timeout(kind, timeout_hint))
            }
        }
    }

    /// Returns the open channel, opening one if necessary.
    ///
    /// Concurrent callers share one connect attempt.
    pub async fn ensure_channel(&self) -> OpcUaResult<ChannelInfo> {
        if let Some(info) = self.connected_channel() {
            return Ok(info);
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(info) = self.connected_channel() {
            return Ok(info);
        }

        let info = self.transport.connect().await?;
        self.channel.store(Some(Arc::new(info.clone())));
        self.stats.record_channel_open();
        info!(channel = %info, "Secure channel open");
        let _ = self.channel_events.send(ChannelEvent::Restored(info.clone()));
        Ok(info)
    }

    fn connected_channel(&self) -> Option<ChannelInfo> {
        let snapshot = self.channel.load_full()?;
        self.transport
            .is_connected()
            .then(|| ChannelInfo::clone(&snapshot))
    }

    /// Closes the channel and fails everything still pending.
    pub async fn disconnect(&self) -> OpcUaResult<()> {
        let _guard = self.connect_lock.lock().await;
        let result = self.transport.disconnect().await;
        self.channel.store(None);
        self.fail_pending(|_| OpcUaError::channel_closed("disconnected"));
        result
    }

    /// Fails every pending request with the error built for its kind.
    ///
    /// Returns the number of requests failed.
    pub fn fail_pending<F>(&self, error_for: F) -> usize
    where
        F: Fn(RequestKind) -> OpcUaError,
    {
        let ids: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(error_for(pending.kind)));
                failed += 1;
            }
        }
        failed
    }

    /// Snapshot of the current channel, if one is believed open.
    pub fn channel(&self) -> Option<Arc<ChannelInfo>> {
        self.channel.load_full()
    }

    /// Returns `true` if the transport reports an open channel.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Subscribes to channel loss/restore notifications.
    pub fn subscribe_channel_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.channel_events.subscribe()
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Shared statistics.
    pub fn stats(&self) -> &Arc<ClientStats> {
        &self.stats
    }

    fn complete(&self, request_id: u32, result: OpcUaResult<ResponseMessage>) {
        match self.pending.remove(&request_id) {
            Some((_, pending)) => {
                self.stats.record_response();
                trace!(
                    request_id,
                    service = %pending.kind,
                    elapsed = ?pending.sent_at.elapsed(),
                    "Request completed"
                );
                let _ = pending.tx.send(result);
            }
            None => {
                self.stats.record_late_response();
                match result {
                    Ok(response) => warn!(
                        request_id,
                        response = response.body.name(),
                        "Response for unknown or completed request"
                    ),
                    Err(error) => warn!(
                        request_id,
                        error = %error,
                        "Failure for unknown or completed request"
                    ),
                }
            }
        }
    }

    fn channel_lost(&self, reason: String) {
        self.channel.store(None);
        let failed = self.fail_pending(|_| OpcUaError::channel_closed(reason.clone()));
        warn!(reason = %reason, failed, "Secure channel lost");
        let _ = self.channel_events.send(ChannelEvent::Lost { reason });
    }

    fn channel_restored(&self, info: ChannelInfo) {
        info!(channel = %info, "Secure channel restored");
        self.channel.store(Some(Arc::new(info.clone())));
        let _ = self.channel_events.send(ChannelEvent::Restored(info));
    }
}

impl Drop for RequestCorrelator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.pending.len())
            .field("channel", &self.channel.load_full())
            .finish()
    }
}

fn abandoned() -> OpcUaError {
    OpcUaError::channel_closed("request abandoned")
}

async fn dispatch_loop(
    correlator: Weak<RequestCorrelator>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(correlator) = correlator.upgrade() else {
            break;
        };

        match event {
            TransportEvent::Response {
                request_id,
                response,
            } => correlator.complete(request_id, Ok(response)),
            TransportEvent::Failure { request_id, error } => {
                correlator.complete(request_id, Err(error))
            }
            TransportEvent::ChannelLost { reason } => correlator.channel_lost(reason),
            TransportEvent::ChannelRestored(info) => correlator.channel_restored(info),
        }
    }
    trace!("Correlator dispatch loop stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ReadRequest, ReadResponse, RequestHeader};
    use crate::types::{EndpointDescription, TimestampsToReturn};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::AtomicBool;

    /// Transport that records transmits and lets the test push events.
    #[derive(Default)]
    struct LoopbackTransport {
        connected: AtomicBool,
        connects: AtomicU32,
        fail_transmits: AtomicU32,
        sent: SyncMutex<Vec<(u32, RequestMessage)>>,
        sink: SyncMutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    }

    impl LoopbackTransport {
        fn push(&self, event: TransportEvent) {
            if let Some(sink) = self.sink.lock().as_ref() {
                sink.send(event).unwrap();
            }
        }

        fn last_id(&self) -> u32 {
            self.sent.lock().last().map(|(id, _)| *id).unwrap()
        }
    }

    #[async_trait]
    impl SecureChannelTransport for LoopbackTransport {
        async fn connect(&self) -> OpcUaResult<ChannelInfo> {
            self.connected.store(true, Ordering::SeqCst);
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ChannelInfo {
                channel_id: n,
                token_id: 1,
                token_expires_at: chrono::Utc::now(),
                endpoint: EndpointDescription::default(),
            })
        }

        async fn disconnect(&self) -> OpcUaResult<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn transmit(&self, request_id: u32, request: RequestMessage) -> OpcUaResult<()> {
            let forced = self
                .fail_transmits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if forced || !self.is_connected() {
                return Err(OpcUaError::channel_closed("loopback closed"));
            }
            self.sent.lock().push((request_id, request));
            Ok(())
        }

        fn attach(&self, sink: mpsc::UnboundedSender<TransportEvent>) {
            *self.sink.lock() = Some(sink);
        }
    }

    fn read_request(timeout: Duration) -> RequestMessage {
        RequestMessage::new(
            RequestHeader::new(timeout),
            ReadRequest {
                max_age: Duration::ZERO,
                timestamps_to_return: TimestampsToReturn::Both,
                nodes_to_read: Vec::new(),
            },
        )
    }

    async fn setup() -> (Arc<LoopbackTransport>, Arc<RequestCorrelator>) {
        let transport = Arc::new(LoopbackTransport::default());
        let correlator = RequestCorrelator::new(
            transport.clone(),
            Arc::new(ClientStats::new()),
            &Handle::current(),
        );
        correlator.ensure_channel().await.unwrap();
        (transport, correlator)
    }

    #[tokio::test]
    async fn test_response_resolves_request() {
        let (transport, correlator) = setup().await;

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.send(read_request(Duration::ZERO)).await })
        };
        while transport.sent.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        let id = transport.last_id();
        assert_eq!(transport.sent.lock()[0].1.header.request_handle, id);
        transport.push(TransportEvent::Response {
            request_id: id,
            response: ResponseMessage::new(id, ReadResponse::default()),
        });

        assert!(task.await.unwrap().is_ok());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_ids_are_unique() {
        let (transport, correlator) = setup().await;
        for _ in 0..3 {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.send(read_request(Duration::ZERO)).await });
        }
        while transport.sent.lock().len() < 3 {
            tokio::task::yield_now().await;
        }
        let mut ids: Vec<u32> = transport.sent.lock().iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_is_ignored() {
        let (transport, correlator) = setup().await;

        let err = correlator
            .send(read_request(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(correlator.pending_count(), 0);

        let id = transport.last_id();
        transport.push(TransportEvent::Response {
            request_id: id,
            response: ResponseMessage::new(id, ReadResponse::default()),
        });
        transport.push(TransportEvent::Failure {
            request_id: 9999,
            error: OpcUaError::channel_closed("late"),
        });

        while correlator.stats().late_responses() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(correlator.stats().request_timeouts(), 1);
    }

    #[tokio::test]
    async fn test_service_fault_is_typed() {
        let (transport, correlator) = setup().await;

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.send(read_request(Duration::ZERO)).await })
        };
        while transport.sent.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        let id = transport.last_id();
        transport.push(TransportEvent::Response {
            request_id: id,
            response: ResponseMessage::fault(id, StatusCode::BAD_NODE_ID_UNKNOWN),
        });

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_NODE_ID_UNKNOWN);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_channel_loss_fails_pending() {
        let (transport, correlator) = setup().await;
        let mut events = correlator.subscribe_channel_events();

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.send(read_request(Duration::ZERO)).await })
        };
        while transport.sent.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        transport.connected.store(false, Ordering::SeqCst);
        transport.push(TransportEvent::ChannelLost {
            reason: "peer reset".into(),
        });

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_channel_closed());
        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::Lost { .. }));
        assert!(correlator.channel().is_none());
    }

    #[tokio::test]
    async fn test_closed_transmit_retries_once_on_new_channel() {
        let (transport, correlator) = setup().await;
        transport.connected.store(false, Ordering::SeqCst);

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.send(read_request(Duration::ZERO)).await })
        };
        while transport.sent.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        let id = transport.last_id();
        transport.push(TransportEvent::Response {
            request_id: id,
            response: ResponseMessage::new(id, ReadResponse::default()),
        });

        assert!(task.await.unwrap().is_ok());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(correlator.stats().send_retries(), 1);
    }

    #[tokio::test]
    async fn test_second_transmit_failure_propagates() {
        let (transport, correlator) = setup().await;
        transport.fail_transmits.store(2, Ordering::SeqCst);

        let err = correlator
            .send(read_request(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(err.is_channel_closed());
        assert_eq!(correlator.stats().send_retries(), 1);
        assert_eq!(correlator.pending_count(), 0);
    }
}
