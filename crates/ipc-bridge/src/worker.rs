//! Worker runtime - the child side of the protocol.
//!
//! The parent side (spawning, routing) is in controller.rs. A worker binary
//! implements [`CallHandler`] and hands it to [`run_worker`], which:
//! - writes the handshake line to stdout
//! - reads calls from stdin and runs them concurrently
//! - answers the reserved heartbeat method itself
//! - serializes all responses through one writer task
//! - returns when stdin closes
//!
//! Diagnostics belong on stderr; stdout carries protocol lines only.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{self, LineCodec};
use crate::bridge::protocol::{CallEnvelope, HEARTBEAT_METHOD, Handshake, ResponseEnvelope};
use crate::version::PROTOCOL_VERSION;

pub use crate::bridge::protocol::RpcError;

/// Business logic of a worker.
#[async_trait::async_trait]
pub trait CallHandler: Send + Sync + 'static {
    /// Run one call. An `Err` is sent back verbatim as the response error.
    async fn handle(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, RpcError>;
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    pub protocol_version: String,
    /// Answer `__heartbeat__` without calling the handler.
    pub answer_heartbeats: bool,
    pub send_handshake: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            protocol_version: PROTOCOL_VERSION.to_string(),
            answer_heartbeats: true,
            send_handshake: true,
        }
    }
}

impl WorkerOptions {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn with_heartbeats(mut self, answer: bool) -> Self {
        self.answer_heartbeats = answer;
        self
    }

    pub fn with_handshake(mut self, send: bool) -> Self {
        self.send_handshake = send;
        self
    }
}

/// Serve calls over this process's stdin/stdout until stdin closes.
pub async fn run_worker<H: CallHandler>(handler: Arc<H>, options: WorkerOptions) -> io::Result<()> {
    run_worker_on(handler, options, tokio::io::stdin(), tokio::io::stdout()).await
}

/// [`run_worker`] over arbitrary streams.
pub async fn run_worker_on<H, R, W>(
    handler: Arc<H>,
    options: WorkerOptions,
    reader: R,
    writer: W,
) -> io::Result<()>
where
    H: CallHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = FramedRead::new(reader, LineCodec::new());
    let mut writer = FramedWrite::new(writer, LineCodec::new());

    if options.send_handshake {
        let line = codec::encode_handshake(&Handshake {
            worker_id: options.worker_id.clone(),
            protocol_version: options.protocol_version.clone(),
        })
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.send(line).await?;
        tracing::info!(worker_id = %options.worker_id, "Worker ready");
    }

    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<ResponseEnvelope>();
    let writer_task = tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            let line = match codec::encode_response(&response) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(id = %response.id, error = %e, "Failed to encode response");
                    continue;
                }
            };
            writer.send(line).await?;
        }
        Ok::<_, io::Error>(())
    });

    let mut calls = JoinSet::new();
    let read_result = loop {
        tokio::select! {
            item = reader.next() => match item {
                Some(Ok(line)) => {
                    let call = match codec::decode_call(&line) {
                        Ok(call) => call,
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping undecodable call");
                            continue;
                        }
                    };
                    if options.answer_heartbeats && call.method == HEARTBEAT_METHOD {
                        let alive = serde_json::json!({"alive": true, "worker_id": options.worker_id});
                        let _ = response_tx.send(ResponseEnvelope::result(call.id, alive));
                        continue;
                    }
                    calls.spawn(run_call(Arc::clone(&handler), call, response_tx.clone()));
                }
                Some(Err(e)) => break Err(e),
                None => {
                    tracing::info!("Stdin closed, worker exiting");
                    break Ok(());
                }
            },
            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "Call task failed");
                }
            }
        }
    };

    calls.shutdown().await;
    drop(response_tx);
    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Response writer failed"),
        Err(e) => tracing::warn!(error = %e, "Response writer panicked"),
    }
    read_result
}

async fn run_call<H: CallHandler>(
    handler: Arc<H>,
    call: CallEnvelope,
    responses: mpsc::UnboundedSender<ResponseEnvelope>,
) {
    let CallEnvelope {
        id,
        method,
        params,
        correlation_id,
        ..
    } = call;
    tracing::debug!(%id, %method, %correlation_id, "Handling call");

    // Inner task so a panicking handler still produces a response.
    let outcome = tokio::spawn(async move { handler.handle(&method, params).await }).await;
    let response = match outcome {
        Ok(Ok(value)) => ResponseEnvelope::result(id, value),
        Ok(Err(err)) => ResponseEnvelope::error(id, err),
        Err(e) => ResponseEnvelope::error(id, RpcError::internal(format!("handler failed: {}", e))),
    };
    let _ = responses.send(response);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{RequestId, ResponseOutcome, error_codes};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct TestHandler;

    #[async_trait::async_trait]
    impl CallHandler for TestHandler {
        async fn handle(
            &self,
            method: &str,
            params: Option<serde_json::Value>,
        ) -> Result<serde_json::Value, RpcError> {
            match method {
                "echo" => Ok(params.unwrap_or(serde_json::Value::Null)),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!("slow"))
                }
                "panic" => panic!("handler exploded"),
                other => Err(RpcError::method_not_found(other)),
            }
        }
    }

    fn call_line(id: u64, method: &str, params: Option<serde_json::Value>) -> String {
        let call = CallEnvelope::new(RequestId::new(id), method, params, Duration::from_secs(1));
        format!("{}\n", codec::encode(&call).unwrap())
    }

    #[tokio::test]
    async fn serves_calls_until_stdin_closes() {
        let (mut parent_in, worker_in) = tokio::io::duplex(4096);
        let (worker_out, parent_out) = tokio::io::duplex(4096);
        let worker = tokio::spawn(run_worker_on(
            Arc::new(TestHandler),
            WorkerOptions::default().with_worker_id("w-test"),
            worker_in,
            worker_out,
        ));

        let mut lines = BufReader::new(parent_out).lines();
        let handshake = codec::parse_handshake(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(handshake.worker_id, "w-test");
        assert_eq!(handshake.protocol_version, PROTOCOL_VERSION);

        parent_in.write_all(call_line(1, "slow", None).as_bytes()).await.unwrap();
        parent_in
            .write_all(call_line(2, "echo", Some(json!({"x": 1}))).as_bytes())
            .await
            .unwrap();
        parent_in.write_all(b"garbage\n").await.unwrap();
        parent_in.write_all(call_line(3, "nope", None).as_bytes()).await.unwrap();
        parent_in
            .write_all(call_line(4, HEARTBEAT_METHOD, None).as_bytes())
            .await
            .unwrap();
        parent_in.write_all(call_line(5, "panic", None).as_bytes()).await.unwrap();

        let mut responses = Vec::new();
        for _ in 0..5 {
            let line = lines.next_line().await.unwrap().unwrap();
            responses.push(codec::decode(&line).unwrap());
        }
        responses.sort_by_key(|r| r.id);

        assert_eq!(responses[0].outcome, ResponseOutcome::Result(json!("slow")));
        assert_eq!(responses[1].outcome, ResponseOutcome::Result(json!({"x": 1})));
        match &responses[2].outcome {
            ResponseOutcome::Error(e) => assert_eq!(e.code, error_codes::METHOD_NOT_FOUND),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(
            responses[3].outcome,
            ResponseOutcome::Result(json!({"alive": true, "worker_id": "w-test"}))
        );
        match &responses[4].outcome {
            ResponseOutcome::Error(e) => assert_eq!(e.code, error_codes::INTERNAL_ERROR),
            other => panic!("expected error, got {other:?}"),
        }

        drop(parent_in);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn heartbeats_can_be_left_to_the_handler() {
        let (mut parent_in, worker_in) = tokio::io::duplex(4096);
        let (worker_out, parent_out) = tokio::io::duplex(4096);
        let worker = tokio::spawn(run_worker_on(
            Arc::new(TestHandler),
            WorkerOptions::default()
                .with_heartbeats(false)
                .with_handshake(false),
            worker_in,
            worker_out,
        ));

        parent_in
            .write_all(call_line(9, HEARTBEAT_METHOD, None).as_bytes())
            .await
            .unwrap();
        let mut lines = BufReader::new(parent_out).lines();
        let response = codec::decode(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(response.id, RequestId::new(9));
        assert!(response.is_error());

        drop(parent_in);
        worker.await.unwrap().unwrap();
    }
}
