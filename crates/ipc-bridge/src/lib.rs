//! ipc-bridge: drive one long-lived worker subprocess over line-delimited
//! JSON-RPC on stdio.
//!
//! A [`Bridge`] spawns the worker, gates on its handshake, and turns method
//! calls into correlated request/response exchanges with per-call timeouts,
//! bounded admission, a circuit breaker and a heartbeat. Workers written in
//! Rust can use [`worker::run_worker`] for the child side.

pub mod bridge;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod health;
pub mod process;
pub mod tracker;
pub mod version;
pub mod worker;

pub use bridge::protocol::{CorrelationId, RequestId, RpcError, error_codes};
pub use config::{BridgeConfig, WorkerCommand};
pub use controller::{Bridge, HealthStatus};
pub use error::{BridgeError, ConfigError, ProtocolError};
pub use events::{BridgeEvent, BridgeObserver, ChannelObserver, ErrorContext};
pub use health::CircuitState;
pub use process::{CommandSpawner, WorkerSpawner, WorkerState};
pub use version::{BRIDGE_VERSION, ExactMatch, PROTOCOL_VERSION, SameMajor, VersionPolicy};
pub use worker::{CallHandler, WorkerOptions, run_worker};
