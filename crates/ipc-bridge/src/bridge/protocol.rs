//! Wire protocol types for parent-worker communication.
//!
//! One channel, newline-delimited JSON on the worker's stdio:
//! - **stdin** (parent → worker): [`CallEnvelope`]
//! - **stdout** (worker → parent): one [`Handshake`] line, then [`ResponseEnvelope`] lines
//!
//! stderr is opaque diagnostic text and never parsed as protocol.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Method name reserved for liveness probes. Worker runtimes answer it directly.
pub const HEARTBEAT_METHOD: &str = "__heartbeat__";

/// Marker value of the `type` field on the handshake line.
pub const HANDSHAKE_TYPE: &str = "ready";

/// Stable numeric error codes (JSON-RPC 2.0 compatible).
///
/// Codes in `-32099..=-32000` are bridge-originated; anything a worker sends
/// back is surfaced verbatim as [`crate::error::BridgeError::Remote`].
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const TIMEOUT: i64 = -32001;
    pub const CIRCUIT_OPEN: i64 = -32002;
    pub const QUEUE_FULL: i64 = -32003;
    pub const BRIDGE_STOPPED: i64 = -32004;
    pub const TRANSPORT: i64 = -32005;
    pub const VERSION_MISMATCH: i64 = -32006;
}

/// Routing identifier for a call.
///
/// Assigned monotonically by the request tracker; the sole key used to match
/// a response back to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trace identifier carried alongside a call for cross-system diagnostics.
///
/// Never used for routing, so request ids can be recycled independently of
/// trace lineage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(uuid::Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `"jsonrpc": "2.0"` marker. Any other value fails to deserialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JsonRpcVersion {
    #[default]
    #[serde(rename = "2.0")]
    V2,
}

/// Call from parent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    #[serde(default)]
    pub jsonrpc: JsonRpcVersion,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub correlation_id: CorrelationId,
    /// Effective timeout enforced by the parent. Not sent on the wire.
    #[serde(skip)]
    pub timeout: Duration,
}

impl CallEnvelope {
    pub fn new(
        id: RequestId,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Self {
        Self {
            jsonrpc: JsonRpcVersion::V2,
            id,
            method: method.into(),
            params,
            correlation_id: CorrelationId::new(),
            timeout,
        }
    }
}

/// Structured error returned by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("method not found: {}", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Exactly one of result or error - the decoder rejects anything else.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(serde_json::Value),
    Error(RpcError),
}

/// Response from worker to parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub id: RequestId,
    pub outcome: ResponseOutcome,
}

impl ResponseEnvelope {
    pub fn result(id: RequestId, value: serde_json::Value) -> Self {
        Self {
            id,
            outcome: ResponseOutcome::Result(value),
        }
    }

    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self {
            id,
            outcome: ResponseOutcome::Error(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ResponseOutcome::Error(_))
    }
}

/// Response as it appears on the wire, before shape validation.
///
/// `result` uses a presence-preserving deserializer so `"result": null` is
/// distinguishable from a missing field.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<JsonRpcVersion>,
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// One-time line a worker emits before accepting calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub worker_id: String,
    pub protocol_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireHandshake {
    #[serde(rename = "type")]
    pub kind: String,
    pub worker_id: String,
    pub protocol_version: String,
}
