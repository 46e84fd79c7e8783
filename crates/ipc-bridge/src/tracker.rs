//! Request tracker: the correlation table for dispatched calls.
//!
//! Each pending entry owns its caller's completion and a key into a shared
//! [`DelayQueue`]. Removing the entry from the map is the single settle step,
//! so a response, a timeout and a flush can never all act on the same call:
//! whichever path removes the entry first delivers the outcome, the others
//! find nothing.

use std::collections::HashMap;
use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::time::{DelayQueue, delay_queue};

use crate::bridge::protocol::{CorrelationId, RequestId, ResponseEnvelope, ResponseOutcome};
use crate::error::BridgeError;

/// Longest timeout a call may carry. The timer wheel cannot hold deadlines
/// much beyond two years past its start.
pub const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Where a call's outcome is delivered.
pub type Completion = oneshot::Sender<Result<serde_json::Value, BridgeError>>;

struct PendingCall {
    method: String,
    correlation_id: CorrelationId,
    started_at: Instant,
    timeout: Duration,
    timeout_key: delay_queue::Key,
    completion: Completion,
}

/// How a pending call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SettleKind {
    Success,
    /// Worker answered with an error.
    Error { code: i64, message: String },
    Timeout(Duration),
}

/// Record of a settled call, returned to the controller for events and
/// health accounting. The caller has already been notified.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub id: RequestId,
    pub method: String,
    pub correlation_id: CorrelationId,
    pub latency: Duration,
    pub kind: SettleKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TrackerMetrics {
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_timeouts: u64,
    pub pending_count: usize,
    /// Mean over calls that received a response. Zero until one does.
    pub avg_latency_ms: f64,
}

#[derive(Default)]
pub struct RequestTracker {
    pending: HashMap<RequestId, PendingCall>,
    timeouts: DelayQueue<RequestId>,
    next_id: u64,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    total_timeouts: u64,
    responded: u64,
    total_latency: Duration,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id. Monotonic for the tracker's lifetime, never reused.
    pub fn generate_id(&mut self) -> RequestId {
        self.next_id += 1;
        RequestId::new(self.next_id)
    }

    /// Register a dispatched call and arm its timeout.
    ///
    /// Timeouts above [`MAX_CALL_TIMEOUT`] are clamped to it; callers are
    /// expected to reject them first.
    pub fn track(
        &mut self,
        id: RequestId,
        method: impl Into<String>,
        correlation_id: CorrelationId,
        timeout: Duration,
        completion: Completion,
    ) {
        if self.pending.is_empty() {
            // Restart the wheel so its horizon is measured from now.
            self.timeouts = DelayQueue::new();
        }
        let timeout_key = self.timeouts.insert(id, timeout.min(MAX_CALL_TIMEOUT));
        let method = method.into();
        tracing::trace!(%id, %method, ?timeout, "Tracking call");
        let previous = self.pending.insert(
            id,
            PendingCall {
                method,
                correlation_id,
                started_at: Instant::now(),
                timeout,
                timeout_key,
                completion,
            },
        );
        if let Some(previous) = previous {
            // Ids come from generate_id, so this is a caller bug.
            tracing::error!(%id, "Duplicate request id tracked");
            self.timeouts.try_remove(&previous.timeout_key);
            let _ = previous
                .completion
                .send(Err(BridgeError::Internal(format!("duplicate request id {}", id))));
        }
        self.total_requests += 1;
    }

    /// Settle the call matching `response.id`.
    ///
    /// `None` means orphan (already timed out, flushed, or never issued). The
    /// tracker is left untouched in that case.
    pub fn resolve(&mut self, response: ResponseEnvelope) -> Option<Settlement> {
        let call = self.pending.remove(&response.id)?;
        self.timeouts.try_remove(&call.timeout_key);

        let latency = call.started_at.elapsed();
        self.responded += 1;
        self.total_latency += latency;

        let kind = match response.outcome {
            ResponseOutcome::Result(value) => {
                self.total_successes += 1;
                let _ = call.completion.send(Ok(value));
                SettleKind::Success
            }
            ResponseOutcome::Error(err) => {
                self.total_failures += 1;
                let kind = SettleKind::Error {
                    code: err.code,
                    message: err.message.clone(),
                };
                let _ = call.completion.send(Err(err.into()));
                kind
            }
        };

        tracing::trace!(id = %response.id, ?latency, "Call resolved");
        Some(Settlement {
            id: response.id,
            method: call.method,
            correlation_id: call.correlation_id,
            latency,
            kind,
        })
    }

    /// Wait for the next call whose timeout elapses, fail it, and return it.
    ///
    /// Pends forever while nothing is tracked. Cancel safe.
    pub async fn next_timeout(&mut self) -> Settlement {
        loop {
            let expired = poll_fn(|cx| match self.timeouts.poll_expired(cx) {
                Poll::Ready(Some(expired)) => Poll::Ready(expired),
                Poll::Ready(None) | Poll::Pending => Poll::Pending,
            })
            .await;

            let id = expired.into_inner();
            let Some(call) = self.pending.remove(&id) else {
                continue;
            };
            self.total_timeouts += 1;
            let _ = call.completion.send(Err(BridgeError::Timeout {
                method: call.method.clone(),
                timeout: call.timeout,
            }));
            return Settlement {
                id,
                method: call.method,
                correlation_id: call.correlation_id,
                latency: call.started_at.elapsed(),
                kind: SettleKind::Timeout(call.timeout),
            };
        }
    }

    /// Fail every pending call with `reason`. Returns how many were failed.
    pub fn reject_all(&mut self, reason: BridgeError) -> usize {
        let count = self.pending.len();
        for (_, call) in self.pending.drain() {
            self.total_failures += 1;
            let _ = call.completion.send(Err(reason.clone()));
        }
        self.timeouts.clear();
        if count > 0 {
            tracing::debug!(count, error = %reason, "Rejected all pending calls");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn metrics(&self) -> TrackerMetrics {
        let avg_latency_ms = if self.responded == 0 {
            0.0
        } else {
            self.total_latency.as_secs_f64() * 1000.0 / self.responded as f64
        };
        TrackerMetrics {
            total_requests: self.total_requests,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            total_timeouts: self.total_timeouts,
            pending_count: self.pending.len(),
            avg_latency_ms,
        }
    }
}
