//! Error taxonomy for the bridge.
//!
//! - **Protocol**: malformed lines, envelope shape, version mismatch
//! - **Admission**: not ready, circuit open, queue full (rejected synchronously)
//! - **Timeout**: the worker never answered (distinct from a worker error)
//! - **Transport**: stdin unwritable or worker exited (fails all pending work)
//! - **Remote**: the worker answered with an error (code passed through verbatim)

use std::time::Duration;

use crate::bridge::protocol::{RpcError, error_codes};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed line: {0}")]
    Malformed(String),
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("incompatible protocol version: worker speaks {worker}, bridge expects {expected}")]
    VersionMismatch { worker: String, expected: String },
    #[error("failed to encode: {0}")]
    Encode(String),
}

impl ProtocolError {
    pub fn code(&self) -> i64 {
        match self {
            Self::Malformed(_) => error_codes::PARSE_ERROR,
            Self::InvalidEnvelope(_) => error_codes::INVALID_REQUEST,
            Self::VersionMismatch { .. } => error_codes::VERSION_MISMATCH,
            Self::Encode(_) => error_codes::INTERNAL_ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be at least {min}, got {actual}")]
    TooSmall {
        field: &'static str,
        min: u64,
        actual: u64,
    },
    #[error("{field} must be at most {max}, got {actual}")]
    TooLarge {
        field: &'static str,
        max: u64,
        actual: u64,
    },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Error surfaced to callers of [`crate::Bridge`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("spawn timeout: worker did not send a handshake within {0:?}")]
    SpawnTimeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("call timeout {timeout:?} exceeds the maximum of {max:?}")]
    InvalidTimeout { timeout: Duration, max: Duration },

    #[error("bridge not ready")]
    NotReady,

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("queue full ({0} calls waiting)")]
    QueueFull(usize),

    #[error("bridge stopped")]
    Stopped,

    #[error("call `{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("worker error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Stable numeric code. Remote errors keep the worker's code.
    pub fn code(&self) -> i64 {
        match self {
            Self::Config(_) | Self::Spawn(_) | Self::NotReady | Self::Internal(_) => {
                error_codes::INTERNAL_ERROR
            }
            Self::InvalidTimeout { .. } => error_codes::INVALID_PARAMS,
            Self::SpawnTimeout(_) | Self::Timeout { .. } => error_codes::TIMEOUT,
            Self::Protocol(e) => e.code(),
            Self::CircuitOpen => error_codes::CIRCUIT_OPEN,
            Self::QueueFull(_) => error_codes::QUEUE_FULL,
            Self::Stopped => error_codes::BRIDGE_STOPPED,
            Self::Transport(_) => error_codes::TRANSPORT,
            Self::Remote { code, .. } => *code,
        }
    }

    /// True when the error came back from the worker rather than the bridge.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Rejected before reaching the worker.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::InvalidTimeout { .. } | Self::NotReady | Self::CircuitOpen | Self::QueueFull(_)
        )
    }
}

impl From<RpcError> for BridgeError {
    fn from(e: RpcError) -> Self {
        Self::Remote {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}
