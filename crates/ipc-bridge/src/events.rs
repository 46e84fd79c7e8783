//! Bridge notifications.
//!
//! Observers are registered on [`crate::BridgeConfig`] and called inline from
//! the bridge's event loop, once per occurrence. They must not block; hand
//! work off (see [`ChannelObserver`]) if it might.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::bridge::protocol::{CorrelationId, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorContext {
    Handshake,
    Decode,
    Orphan,
    Write,
    Crash,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    Ready {
        worker_id: String,
        protocol_version: String,
    },
    RequestStart {
        id: RequestId,
        method: String,
        correlation_id: CorrelationId,
    },
    RequestSuccess {
        id: RequestId,
        method: String,
        correlation_id: CorrelationId,
        latency_ms: u64,
    },
    RequestError {
        id: RequestId,
        method: String,
        correlation_id: CorrelationId,
        code: i64,
        message: String,
        latency_ms: u64,
    },
    RequestTimeout {
        id: RequestId,
        method: String,
        correlation_id: CorrelationId,
        timeout_ms: u64,
    },
    CircuitOpen {
        failures: u32,
        cooldown_ms: u64,
    },
    CircuitClose,
    Heartbeat {
        ok: bool,
        latency_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    WorkerLog {
        line: String,
    },
    Error {
        context: ErrorContext,
        message: String,
    },
}

impl BridgeEvent {
    /// Notification name, as observers see it.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::RequestStart { .. } => "request_start",
            Self::RequestSuccess { .. } => "request_success",
            Self::RequestError { .. } => "request_error",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::CircuitClose => "circuit_close",
            Self::Heartbeat { .. } => "heartbeat",
            Self::WorkerLog { .. } => "worker_log",
            Self::Error { .. } => "error",
        }
    }
}

/// Receives every [`BridgeEvent`], synchronously on the bridge's event loop.
///
/// Keep `on_event` short. A panic is caught and logged; the observer keeps
/// receiving later events.
pub trait BridgeObserver: Send + Sync {
    fn on_event(&self, event: &BridgeEvent);
}

impl<F> BridgeObserver for F
where
    F: Fn(&BridgeEvent) + Send + Sync,
{
    fn on_event(&self, event: &BridgeEvent) {
        self(event)
    }
}

/// Forwards every event into an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl BridgeObserver for ChannelObserver {
    fn on_event(&self, event: &BridgeEvent) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.tx.send(event.clone());
    }
}

/// Fan-out to the configured observers.
#[derive(Clone, Default)]
pub(crate) struct Notifier {
    observers: Vec<Arc<dyn BridgeObserver>>,
}

impl Notifier {
    pub fn new(observers: Vec<Arc<dyn BridgeObserver>>) -> Self {
        Self { observers }
    }

    pub fn emit(&self, event: BridgeEvent) {
        tracing::trace!(event = event.name(), "Bridge event");
        for observer in &self.observers {
            let delivered =
                std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(&event)));
            if delivered.is_err() {
                tracing::error!(event = event.name(), "Bridge observer panicked");
            }
        }
    }
}

pub(crate) fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
