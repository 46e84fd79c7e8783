//! Reference worker used by the end-to-end tests.
//!
//! Methods:
//! - `echo` returns its params
//! - `add {a, b}` returns `a + b`
//! - `sleep {ms, value?}` answers after `ms` milliseconds
//! - `fail {code, message, data?}` answers with that error
//! - `exit {code}` exits immediately without answering
//! - `log {message}` writes `message` to stderr and returns null

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ipc_bridge::bridge::protocol::{HEARTBEAT_METHOD, RpcError};
use ipc_bridge::worker::{CallHandler, WorkerOptions, run_worker};
use ipc_bridge::PROTOCOL_VERSION;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug)]
struct Args {
    worker_id: Option<String>,
    protocol_version: String,
    handshake: bool,
    handshake_delay: Duration,
    stall_heartbeat: bool,
    noise: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: mock-worker [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --worker-id <id>            Worker id in the handshake [default: worker-<pid>]");
            eprintln!("  --protocol-version <v>      Advertised protocol version [default: {PROTOCOL_VERSION}]");
            eprintln!("  --no-handshake              Never send the handshake");
            eprintln!("  --handshake-delay-ms <ms>   Wait before sending the handshake");
            eprintln!("  --stall-heartbeat           Never answer heartbeats");
            eprintln!("  --noise                     Print a non-protocol line before the handshake");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        worker_id: None,
        protocol_version: PROTOCOL_VERSION.to_string(),
        handshake: true,
        handshake_delay: Duration::ZERO,
        stall_heartbeat: false,
        noise: false,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--worker-id" => {
                i += 1;
                parsed.worker_id = Some(args.get(i).ok_or("--worker-id requires a value")?.clone());
            }
            "--protocol-version" => {
                i += 1;
                parsed.protocol_version = args
                    .get(i)
                    .ok_or("--protocol-version requires a value")?
                    .clone();
            }
            "--handshake-delay-ms" => {
                i += 1;
                let ms = args
                    .get(i)
                    .ok_or("--handshake-delay-ms requires a value")?
                    .parse::<u64>()
                    .map_err(|e| format!("--handshake-delay-ms: {e}"))?;
                parsed.handshake_delay = Duration::from_millis(ms);
            }
            "--no-handshake" => parsed.handshake = false,
            "--stall-heartbeat" => parsed.stall_heartbeat = true,
            "--noise" => parsed.noise = true,
            "--help" | "-h" => return Err("".to_string()),
            arg => return Err(format!("unknown argument: {arg}")),
        }
        i += 1;
    }
    Ok(parsed)
}

/// Logs go to stderr; stdout is the protocol stream.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("MOCK_WORKER_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("ipc_bridge={level},mock_worker={level}"))
    };

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

#[tokio::main]
async fn run(args: Args) -> anyhow::Result<()> {
    if args.noise {
        println!("mock worker booting");
    }
    if !args.handshake_delay.is_zero() {
        tokio::time::sleep(args.handshake_delay).await;
    }

    let mut options = WorkerOptions::default()
        .with_protocol_version(args.protocol_version)
        .with_handshake(args.handshake)
        .with_heartbeats(!args.stall_heartbeat);
    if let Some(worker_id) = args.worker_id {
        options = options.with_worker_id(worker_id);
    }

    run_worker(Arc::new(MockHandler), options)
        .await
        .context("worker loop failed")
}

struct MockHandler;

#[derive(Deserialize)]
struct AddParams {
    a: i64,
    b: i64,
}

#[derive(Deserialize)]
struct SleepParams {
    ms: u64,
    #[serde(default)]
    value: Option<Value>,
}

#[derive(Deserialize)]
struct FailParams {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct ExitParams {
    #[serde(default)]
    code: i32,
}

#[derive(Deserialize)]
struct LogParams {
    message: String,
}

fn parse<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| RpcError::invalid_params(e.to_string()))
}

#[async_trait::async_trait]
impl CallHandler for MockHandler {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match method {
            "echo" => Ok(params.unwrap_or(Value::Null)),
            "add" => {
                let AddParams { a, b } = parse(params)?;
                a.checked_add(b)
                    .map(|sum| json!(sum))
                    .ok_or_else(|| RpcError::invalid_params("overflow"))
            }
            "sleep" => {
                let SleepParams { ms, value } = parse(params)?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(value.unwrap_or_else(|| json!("slept")))
            }
            "fail" => {
                let FailParams {
                    code,
                    message,
                    data,
                } = parse(params)?;
                let err = RpcError::new(code, message);
                Err(match data {
                    Some(data) => err.with_data(data),
                    None => err,
                })
            }
            "exit" => {
                let ExitParams { code } = parse(params.or_else(|| Some(json!({}))))?;
                tracing::warn!(code, "Exiting on request");
                process::exit(code);
            }
            "log" => {
                let LogParams { message } = parse(params)?;
                eprintln!("{message}");
                Ok(Value::Null)
            }
            // Only reached with --stall-heartbeat: hang so the bridge's probe times out.
            HEARTBEAT_METHOD => std::future::pending().await,
            other => Err(RpcError::method_not_found(other)),
        }
    }
}
