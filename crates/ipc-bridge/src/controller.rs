//! Bridge controller - lifecycle, handshake gate, call admission and routing.
//!
//! Flow:
//! 1. Validate config, spawn worker
//! 2. Wait for the handshake (bounded by `spawn_timeout`), check its version
//! 3. Arm the heartbeat, mark the worker RUNNING
//! 4. Run the event loop: admit calls, route responses, fire timeouts
//! 5. On stop, crash or write failure: fail everything outstanding
//!
//! The event loop is a single task that owns the worker, tracker, health
//! monitor and wait queue. [`Bridge`] handles talk to it over a command
//! channel; each call waits on its own oneshot completion.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::bridge::codec;
use crate::bridge::protocol::{CallEnvelope, HEARTBEAT_METHOD, Handshake};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, ProtocolError};
use crate::events::{BridgeEvent, ErrorContext, Notifier, millis};
use crate::health::{
    CircuitBreaker, CircuitState, CircuitTransition, HealthMonitor, HeartbeatReport, ProbeOutcome,
};
use crate::process::{WorkerOutput, WorkerProcess, WorkerState};
use crate::tracker::{Completion, MAX_CALL_TIMEOUT, RequestTracker, SettleKind, Settlement};

/// Point-in-time view of the bridge.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub worker_id: String,
    pub protocol_version: String,
    pub ready: bool,
    pub worker_state: WorkerState,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub pending_count: usize,
    pub queue_size: usize,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_timeouts: u64,
    pub avg_latency_ms: f64,
    /// Milliseconds since the last heartbeat that reached the worker.
    pub last_heartbeat_ms: Option<u64>,
    pub last_heartbeat_ok: Option<bool>,
    pub uptime_ms: u64,
    /// When the bridge became ready (ISO 8601 format).
    pub started_at: String,
}

enum Command {
    Call {
        method: String,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
        reply: Completion,
    },
    Health(oneshot::Sender<HealthStatus>),
    ResetCircuit(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

struct QueuedCall {
    method: String,
    params: Option<serde_json::Value>,
    timeout: Duration,
    reply: Completion,
    /// Trial ticket when admitted as the single HALF_OPEN trial.
    trial: Option<u64>,
}

/// Handle to a running bridge. Cheap to clone; the bridge stops when the
/// last handle is dropped or [`Bridge::stop`] is called.
#[derive(Clone)]
pub struct Bridge {
    commands: mpsc::UnboundedSender<Command>,
    ready: watch::Receiver<bool>,
    worker_state: watch::Receiver<WorkerState>,
    config: Arc<BridgeConfig>,
    handshake: Arc<Handshake>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("worker_id", &self.handshake.worker_id)
            .field("protocol_version", &self.handshake.protocol_version)
            .field("ready", &*self.ready.borrow())
            .field("worker_state", &*self.worker_state.borrow())
            .finish()
    }
}

impl Bridge {
    /// Spawn the worker and wait for a valid handshake.
    ///
    /// Fails with [`BridgeError::SpawnTimeout`] if no handshake arrives in
    /// time and with a protocol error on version mismatch. Either way the
    /// worker is stopped and no call is ever accepted.
    pub async fn start(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        let config = Arc::new(config);
        let notifier = Notifier::new(config.observers.clone());

        let (mut worker, mut output) =
            WorkerProcess::start(&config).map_err(|e| BridgeError::Spawn(e.to_string()))?;

        tracing::debug!(timeout = ?config.spawn_timeout(), "Waiting for worker handshake");
        let handshake = match tokio::time::timeout(
            config.spawn_timeout(),
            await_handshake(&mut output, &notifier),
        )
        .await
        {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => return Err(abort_start(worker, &notifier, e).await),
            Err(_) => {
                let e = BridgeError::SpawnTimeout(config.spawn_timeout());
                return Err(abort_start(worker, &notifier, e).await);
            }
        };

        if let Err(e) = codec::validate_protocol_version(
            &handshake.protocol_version,
            &config.protocol_version,
            &*config.version_policy,
        ) {
            return Err(abort_start(worker, &notifier, e.into()).await);
        }

        if let Err(e) = worker.mark_ready() {
            let e = BridgeError::Transport(e.to_string());
            return Err(abort_start(worker, &notifier, e).await);
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready) = watch::channel(true);

        let mut health = HealthMonitor::new(
            CircuitBreaker::new(
                config.circuit_failure_threshold,
                config.circuit_cooldown(),
            ),
            config.heartbeat_interval(),
        );
        arm_heartbeat(&mut health, &commands, config.heartbeat_timeout());

        if let Err(e) = worker.mark_running() {
            let e = BridgeError::Transport(e.to_string());
            return Err(abort_start(worker, &notifier, e).await);
        }

        tracing::info!(
            worker_id = %handshake.worker_id,
            protocol_version = %handshake.protocol_version,
            "Bridge ready"
        );
        notifier.emit(BridgeEvent::Ready {
            worker_id: handshake.worker_id.clone(),
            protocol_version: handshake.protocol_version.clone(),
        });

        let bridge = Self {
            commands,
            ready,
            worker_state: worker.subscribe_state(),
            config: Arc::clone(&config),
            handshake: Arc::new(handshake),
        };

        let controller = Controller {
            worker,
            output,
            output_open: true,
            tracker: RequestTracker::new(),
            health,
            queue: VecDeque::new(),
            notifier,
            ready_tx,
            handshake: Arc::clone(&bridge.handshake),
            started_at: chrono::Utc::now().to_rfc3339(),
            started: Instant::now(),
            stopped: false,
            config,
        };
        tokio::spawn(controller.run(command_rx));

        Ok(bridge)
    }

    /// Invoke `method` on the worker.
    ///
    /// `timeout` defaults to the configured per-call timeout and starts when
    /// the call is written to the worker, not while it waits in the queue.
    pub async fn call(
        &self,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                method: method.into(),
                params,
                timeout,
                reply,
            })
            .map_err(|_| BridgeError::NotReady)?;
        rx.await.map_err(|_| BridgeError::Stopped)?
    }

    /// [`call`](Self::call) with serde on both ends.
    pub async fn call_typed<P, R>(
        &self,
        method: impl Into<String>,
        params: &P,
        timeout: Option<Duration>,
    ) -> Result<R, BridgeError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| ProtocolError::Encode(format!("params: {}", e)))?;
        let params = (!params.is_null()).then_some(params);
        let result = self.call(method, params, timeout).await?;
        serde_json::from_value(result)
            .map_err(|e| ProtocolError::InvalidEnvelope(format!("unexpected result: {}", e)).into())
    }

    /// Stop the bridge: disarm the heartbeat, fail pending and queued calls
    /// with [`BridgeError::Stopped`], and terminate the worker. Idempotent.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    pub async fn health(&self) -> Result<HealthStatus, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Health(tx))
            .map_err(|_| BridgeError::Stopped)?;
        rx.await.map_err(|_| BridgeError::Stopped)
    }

    /// Force the circuit breaker closed (operator recovery).
    pub async fn reset_circuit(&self) -> Result<(), BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ResetCircuit(tx))
            .map_err(|_| BridgeError::Stopped)?;
        rx.await.map_err(|_| BridgeError::Stopped)
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
            && matches!(
                *self.worker_state.borrow(),
                WorkerState::Ready | WorkerState::Running
            )
    }

    pub fn worker_state(&self) -> WorkerState {
        *self.worker_state.borrow()
    }

    pub fn worker_id(&self) -> &str {
        &self.handshake.worker_id
    }

    /// Protocol version the worker advertised.
    pub fn protocol_version(&self) -> &str {
        &self.handshake.protocol_version
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

async fn await_handshake(
    output: &mut mpsc::UnboundedReceiver<WorkerOutput>,
    notifier: &Notifier,
) -> Result<Handshake, BridgeError> {
    while let Some(out) = output.recv().await {
        match out {
            WorkerOutput::Stdout(line) => match codec::parse_handshake(&line) {
                Some(handshake) => return Ok(handshake),
                None => {
                    tracing::warn!(%line, "Ignoring non-handshake line before ready");
                }
            },
            WorkerOutput::Stderr(line) => notifier.emit(BridgeEvent::WorkerLog { line }),
            WorkerOutput::StdinClosed(reason) => {
                return Err(BridgeError::Transport(format!(
                    "worker stdin not writable: {}",
                    reason
                )));
            }
            WorkerOutput::Exited(code) => {
                return Err(BridgeError::Transport(format!(
                    "worker exited before handshake ({})",
                    describe_exit(code)
                )));
            }
        }
    }
    Err(BridgeError::Transport(
        "worker output closed before handshake".to_string(),
    ))
}

async fn abort_start(
    mut worker: WorkerProcess,
    notifier: &Notifier,
    error: BridgeError,
) -> BridgeError {
    tracing::error!(error = %error, "Worker handshake failed");
    notifier.emit(BridgeEvent::Error {
        context: ErrorContext::Handshake,
        message: error.to_string(),
    });
    worker.stop().await;
    error
}

/// Heartbeat probe: a reserved-name call through the bridge's own command
/// path. Holds only a weak sender so it never keeps the bridge alive.
fn arm_heartbeat(
    health: &mut HealthMonitor,
    commands: &mpsc::UnboundedSender<Command>,
    timeout: Duration,
) {
    let weak = commands.downgrade();
    health.start_heartbeat(move || {
        let weak = weak.clone();
        async move {
            let Some(commands) = weak.upgrade() else {
                return ProbeOutcome::Skipped("bridge dropped".to_string());
            };
            let (reply, rx) = oneshot::channel();
            let sent = commands.send(Command::Call {
                method: HEARTBEAT_METHOD.to_string(),
                params: None,
                timeout: Some(timeout),
                reply,
            });
            drop(commands);
            if sent.is_err() {
                return ProbeOutcome::Skipped("bridge stopped".to_string());
            }
            match rx.await {
                Ok(Ok(_)) => ProbeOutcome::Alive,
                Ok(Err(e)) if e.is_admission() || e == BridgeError::Stopped => {
                    ProbeOutcome::Skipped(e.to_string())
                }
                Ok(Err(e)) => ProbeOutcome::Failed(e.to_string()),
                Err(_) => ProbeOutcome::Skipped("bridge stopped".to_string()),
            }
        }
    });
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "killed by signal".to_string(),
    }
}

enum LoopEvent {
    Output(Option<WorkerOutput>),
    Timeout(Settlement),
    Heartbeat(HeartbeatReport),
    Command(Option<Command>),
}

struct Controller {
    config: Arc<BridgeConfig>,
    worker: WorkerProcess,
    output: mpsc::UnboundedReceiver<WorkerOutput>,
    output_open: bool,
    tracker: RequestTracker,
    health: HealthMonitor,
    queue: VecDeque<QueuedCall>,
    notifier: Notifier,
    ready_tx: watch::Sender<bool>,
    handshake: Arc<Handshake>,
    started_at: String,
    started: Instant,
    stopped: bool,
}

impl Controller {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let event = tokio::select! {
                biased;

                out = self.output.recv(), if self.output_open => LoopEvent::Output(out),
                settlement = self.tracker.next_timeout() => LoopEvent::Timeout(settlement),
                report = self.health.next_heartbeat() => LoopEvent::Heartbeat(report),
                cmd = commands.recv() => LoopEvent::Command(cmd),
            };

            match event {
                LoopEvent::Output(Some(out)) => self.handle_output(out),
                LoopEvent::Output(None) => {
                    tracing::debug!("Worker output channel closed");
                    self.output_open = false;
                }
                LoopEvent::Timeout(settlement) => self.handle_settlement(settlement),
                LoopEvent::Heartbeat(report) => self.handle_heartbeat(report),
                LoopEvent::Command(Some(Command::Call {
                    method,
                    params,
                    timeout,
                    reply,
                })) => {
                    let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());
                    self.admit(QueuedCall {
                        method,
                        params,
                        timeout,
                        reply,
                        trial: None,
                    });
                }
                LoopEvent::Command(Some(Command::Health(reply))) => {
                    let _ = reply.send(self.health_status());
                }
                LoopEvent::Command(Some(Command::ResetCircuit(reply))) => {
                    let transition = self.health.force_close(Instant::now());
                    self.emit_transition(transition);
                    let _ = reply.send(());
                }
                LoopEvent::Command(Some(Command::Stop(reply))) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                LoopEvent::Command(None) => {
                    tracing::debug!("All bridge handles dropped");
                    self.shutdown().await;
                    break;
                }
            }
        }
        tracing::debug!("Bridge event loop exiting");
    }

    fn accepting(&self) -> bool {
        !self.stopped && *self.ready_tx.borrow() && self.worker.can_accept_requests()
    }

    /// Admission: timeout range, ready, circuit, in-flight limit, then the
    /// wait queue.
    fn admit(&mut self, mut call: QueuedCall) {
        if call.timeout > MAX_CALL_TIMEOUT {
            let _ = call.reply.send(Err(BridgeError::InvalidTimeout {
                timeout: call.timeout,
                max: MAX_CALL_TIMEOUT,
            }));
            return;
        }
        if !self.accepting() {
            let _ = call.reply.send(Err(BridgeError::NotReady));
            return;
        }
        if !self.health.is_request_allowed(Instant::now()) {
            tracing::debug!(method = %call.method, "Rejected: circuit open");
            let _ = call.reply.send(Err(BridgeError::CircuitOpen));
            return;
        }
        call.trial = self.health.breaker().current_trial();
        if self.tracker.pending_count() < self.config.max_inflight {
            self.dispatch(call);
        } else if self.queue.len() < self.config.max_queue_size {
            tracing::trace!(method = %call.method, queued = self.queue.len() + 1, "Call queued");
            self.queue.push_back(call);
        } else {
            tracing::debug!(method = %call.method, "Rejected: queue full");
            if let Some(ticket) = call.trial {
                self.health.cancel_trial(ticket);
            }
            let _ = call
                .reply
                .send(Err(BridgeError::QueueFull(self.config.max_queue_size)));
        }
    }

    /// Encode, track, write. The call is tracked before the write so a
    /// failed write fails it along with everything else pending.
    fn dispatch(&mut self, call: QueuedCall) {
        let id = self.tracker.generate_id();
        let envelope = CallEnvelope::new(id, call.method, call.params, call.timeout);
        let line = match codec::encode(&envelope) {
            Ok(line) => line,
            Err(e) => {
                if let Some(ticket) = call.trial {
                    self.health.cancel_trial(ticket);
                }
                let _ = call.reply.send(Err(e.into()));
                return;
            }
        };

        self.tracker.track(
            id,
            envelope.method.clone(),
            envelope.correlation_id.clone(),
            envelope.timeout,
            call.reply,
        );
        tracing::debug!(%id, method = %envelope.method, correlation_id = %envelope.correlation_id, "Dispatching call");
        self.notifier.emit(BridgeEvent::RequestStart {
            id,
            method: envelope.method,
            correlation_id: envelope.correlation_id,
        });

        if !self.worker.write_line(line) {
            self.handle_write_failure("worker stdin not writable".to_string());
        }
    }

    /// A non-writable stdin compromises the channel, not just one call.
    fn handle_write_failure(&mut self, message: String) {
        if !*self.ready_tx.borrow() {
            // Already failed; just make sure nothing is left waiting.
            self.fail_all(BridgeError::Transport(message));
            return;
        }
        tracing::error!("{}", message);
        self.ready_tx.send_replace(false);
        self.health.stop();
        let failed = self.fail_all(BridgeError::Transport(message.clone()));
        tracing::warn!(failed, "Failed outstanding calls after write failure");

        let transition = self.health.record_failure(Instant::now());
        self.emit_transition(transition);
        self.notifier.emit(BridgeEvent::Error {
            context: ErrorContext::Write,
            message,
        });
    }

    fn handle_output(&mut self, out: WorkerOutput) {
        match out {
            WorkerOutput::Stdout(line) => self.route_line(&line),
            WorkerOutput::Stderr(line) => self.notifier.emit(BridgeEvent::WorkerLog { line }),
            WorkerOutput::StdinClosed(reason) => {
                self.handle_write_failure(format!("worker stdin not writable: {}", reason))
            }
            WorkerOutput::Exited(code) => self.handle_exit(code),
        }
    }

    fn route_line(&mut self, line: &str) {
        let response = match codec::decode(line) {
            Ok(response) => response,
            Err(e) => {
                if codec::parse_handshake(line).is_some() {
                    tracing::warn!("Ignoring repeated handshake");
                } else {
                    tracing::warn!(error = %e, %line, "Dropping undecodable line");
                }
                self.notifier.emit(BridgeEvent::Error {
                    context: ErrorContext::Decode,
                    message: e.to_string(),
                });
                return;
            }
        };

        let id = response.id;
        match self.tracker.resolve(response) {
            Some(settlement) => self.handle_settlement(settlement),
            None => {
                tracing::warn!(%id, "Orphan response (timed out or unknown id)");
                self.notifier.emit(BridgeEvent::Error {
                    context: ErrorContext::Orphan,
                    message: format!("no pending call for id {}", id),
                });
            }
        }
    }

    fn handle_settlement(&mut self, settlement: Settlement) {
        let latency_ms = millis(settlement.latency);
        let counts_for_circuit = settlement.method != HEARTBEAT_METHOD;
        let now = Instant::now();

        let transition = match settlement.kind {
            SettleKind::Success => {
                self.notifier.emit(BridgeEvent::RequestSuccess {
                    id: settlement.id,
                    method: settlement.method,
                    correlation_id: settlement.correlation_id,
                    latency_ms,
                });
                counts_for_circuit.then(|| self.health.record_success()).flatten()
            }
            SettleKind::Error { code, message } => {
                tracing::debug!(id = %settlement.id, code, %message, "Worker returned error");
                self.notifier.emit(BridgeEvent::RequestError {
                    id: settlement.id,
                    method: settlement.method,
                    correlation_id: settlement.correlation_id,
                    code,
                    message,
                    latency_ms,
                });
                counts_for_circuit.then(|| self.health.record_failure(now)).flatten()
            }
            SettleKind::Timeout(timeout) => {
                tracing::warn!(id = %settlement.id, method = %settlement.method, ?timeout, "Call timed out");
                self.notifier.emit(BridgeEvent::RequestTimeout {
                    id: settlement.id,
                    method: settlement.method,
                    correlation_id: settlement.correlation_id,
                    timeout_ms: millis(timeout),
                });
                counts_for_circuit.then(|| self.health.record_failure(now)).flatten()
            }
        };
        self.emit_transition(transition);
        self.drain_queue();
    }

    /// Dispatch queued calls in FIFO order while slots are free.
    fn drain_queue(&mut self) {
        while self.accepting() && self.tracker.pending_count() < self.config.max_inflight {
            let Some(mut call) = self.queue.pop_front() else {
                break;
            };
            // May hand the trial to this call, or refuse it.
            if !self
                .health
                .is_queued_request_allowed(call.trial, Instant::now())
            {
                let _ = call.reply.send(Err(BridgeError::CircuitOpen));
                continue;
            }
            call.trial = self.health.breaker().current_trial();
            self.dispatch(call);
        }
    }

    fn handle_heartbeat(&mut self, report: HeartbeatReport) {
        let transition = self.health.record_heartbeat(&report, Instant::now());
        let latency_ms = millis(report.latency);
        match report.outcome {
            ProbeOutcome::Alive => self.notifier.emit(BridgeEvent::Heartbeat {
                ok: true,
                latency_ms,
                detail: None,
            }),
            ProbeOutcome::Failed(reason) => self.notifier.emit(BridgeEvent::Heartbeat {
                ok: false,
                latency_ms,
                detail: Some(reason),
            }),
            ProbeOutcome::Skipped(_) => {}
        }
        self.emit_transition(transition);
    }

    fn handle_exit(&mut self, code: Option<i32>) {
        if self.stopped {
            return;
        }
        let message = format!("worker exited unexpectedly ({})", describe_exit(code));
        tracing::error!(?code, "Worker crashed");
        self.ready_tx.send_replace(false);
        self.health.stop();
        let failed = self.fail_all(BridgeError::Transport(message.clone()));
        if failed > 0 {
            tracing::warn!(failed, "Failed outstanding calls after worker crash");
        }
        self.notifier.emit(BridgeEvent::Error {
            context: ErrorContext::Crash,
            message,
        });
    }

    fn fail_all(&mut self, reason: BridgeError) -> usize {
        let mut failed = self.tracker.reject_all(reason.clone());
        for call in self.queue.drain(..) {
            let _ = call.reply.send(Err(reason.clone()));
            failed += 1;
        }
        failed
    }

    fn emit_transition(&self, transition: Option<CircuitTransition>) {
        match transition {
            Some(CircuitTransition::Opened { failures, cooldown }) => {
                self.notifier.emit(BridgeEvent::CircuitOpen {
                    failures,
                    cooldown_ms: millis(cooldown),
                });
            }
            Some(CircuitTransition::Closed) => self.notifier.emit(BridgeEvent::CircuitClose),
            None => {}
        }
    }

    async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        tracing::info!("Stopping bridge");
        self.health.stop();
        self.ready_tx.send_replace(false);
        let failed = self.fail_all(BridgeError::Stopped);
        if failed > 0 {
            tracing::debug!(failed, "Rejected outstanding calls on stop");
        }
        self.worker.stop().await;
        tracing::info!(state = %self.worker.state(), "Bridge stopped");
    }

    fn health_status(&self) -> HealthStatus {
        let now = Instant::now();
        let metrics = self.tracker.metrics();
        let stats = self.health.stats(now);
        HealthStatus {
            worker_id: self.handshake.worker_id.clone(),
            protocol_version: self.handshake.protocol_version.clone(),
            ready: self.accepting(),
            worker_state: self.worker.state(),
            circuit_state: stats.circuit_state,
            consecutive_failures: stats.consecutive_failures,
            pending_count: metrics.pending_count,
            queue_size: self.queue.len(),
            total_requests: metrics.total_requests,
            total_successes: metrics.total_successes,
            total_failures: metrics.total_failures,
            total_timeouts: metrics.total_timeouts,
            avg_latency_ms: metrics.avg_latency_ms,
            last_heartbeat_ms: stats.last_heartbeat_ago.map(millis),
            last_heartbeat_ok: stats.last_heartbeat_ok,
            uptime_ms: millis(now.saturating_duration_since(self.started)),
            started_at: self.started_at.clone(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    //! Controller tests against scripted `sh` workers. End-to-end tests with
    //! the real worker runtime live in `tests/`.

    use super::*;
    use crate::config::WorkerCommand;
    use crate::error::ConfigError;
    use crate::events::ChannelObserver;

    fn sh(script: &str) -> BridgeConfig {
        BridgeConfig::new(WorkerCommand::new("sh").args(["-c", script]))
            .with_spawn_timeout(Duration::from_secs(2))
            .with_heartbeat_interval(Duration::from_secs(3600))
            .with_stop_grace(Duration::from_millis(200))
    }

    const HANDSHAKE: &str =
        r#"echo '{"type":"ready","worker_id":"sh-1","protocol_version":"1.0"}'"#;

    #[tokio::test]
    async fn invalid_config_fails_before_spawning() {
        let err = Bridge::start(sh("exit 0").with_max_inflight(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Config(ConfigError::TooSmall {
                field: "max_inflight",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn missing_handshake_times_out() {
        let (observer, mut events) = ChannelObserver::new();
        let cfg = sh("echo 'not a handshake'; sleep 5")
            .with_spawn_timeout(Duration::from_millis(200))
            .with_observer(Arc::new(observer));
        let err = Bridge::start(cfg).await.unwrap_err();
        assert_eq!(err, BridgeError::SpawnTimeout(Duration::from_millis(200)));

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            BridgeEvent::Error {
                context: ErrorContext::Handshake,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn exit_before_handshake_is_transport_error() {
        let err = Bridge::start(sh("exit 2")).await.unwrap_err();
        assert_eq!(
            err,
            BridgeError::Transport("worker exited before handshake (exit code 2)".to_string())
        );
    }

    #[tokio::test]
    async fn version_mismatch_fails_start() {
        let err = Bridge::start(sh(
            r#"echo '{"type":"ready","worker_id":"old","protocol_version":"0.9"}'; sleep 5"#,
        ))
        .await
        .unwrap_err();
        assert_eq!(
            err,
            BridgeError::Protocol(ProtocolError::VersionMismatch {
                worker: "0.9".to_string(),
                expected: "1.0".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn custom_version_policy_is_honored() {
        let cfg = sh(&format!("{}; cat > /dev/null", HANDSHAKE.replace("1.0", "1.7")))
            .with_version_policy(Arc::new(crate::version::SameMajor));
        let bridge = Bridge::start(cfg).await.unwrap();
        assert_eq!(bridge.protocol_version(), "1.7");
        bridge.stop().await;
    }

    #[tokio::test]
    async fn silent_worker_times_out_calls() {
        let bridge = Bridge::start(sh(&format!("{}; cat > /dev/null", HANDSHAKE)))
            .await
            .unwrap();
        assert!(bridge.is_ready());
        assert_eq!(bridge.worker_id(), "sh-1");
        assert_eq!(bridge.worker_state(), WorkerState::Running);

        let err = bridge
            .call("anything", None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::Timeout {
                method: "anything".to_string(),
                timeout: Duration::from_millis(50),
            }
        );

        let health = bridge.health().await.unwrap();
        assert_eq!(health.pending_count, 0);
        assert_eq!(health.total_timeouts, 1);
        bridge.stop().await;
    }

    #[tokio::test]
    async fn write_failure_fails_every_pending_call() {
        // Handshake, then close stdin while staying alive.
        let cfg = sh(&format!("{}; exec 0<&-; sleep 5", HANDSHAKE))
            .with_max_inflight(8)
            .with_default_timeout(Duration::from_secs(10));
        let bridge = Bridge::start(cfg).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let calls = (0..3).map(|i| {
            let bridge = bridge.clone();
            async move { bridge.call(format!("m{}", i), None, None).await }
        });
        let results = futures::future::join_all(calls).await;
        for result in results {
            let err = result.unwrap_err();
            assert!(
                matches!(err, BridgeError::Transport(_) | BridgeError::NotReady),
                "unexpected: {err:?}"
            );
        }
        assert!(!bridge.is_ready());
        bridge.stop().await;
    }

    #[tokio::test]
    async fn worker_that_never_reads_cannot_stall_the_bridge() {
        let bridge = Bridge::start(sh(&format!("{}; sleep 30", HANDSHAKE)))
            .await
            .unwrap();

        // Bigger than the pipe buffer, so the write cannot complete.
        let payload = serde_json::Value::String("x".repeat(200 * 1024));
        let err = tokio::time::timeout(
            Duration::from_secs(3),
            bridge.call("m", Some(payload), Some(Duration::from_millis(100))),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(err.is_timeout(), "{err:?}");

        let health = tokio::time::timeout(Duration::from_secs(2), bridge.health())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(health.total_timeouts, 1);
        assert_eq!(health.pending_count, 0);

        tokio::time::timeout(Duration::from_secs(3), bridge.stop())
            .await
            .unwrap();
        assert!(!bridge.is_ready());
    }

    #[tokio::test]
    async fn out_of_range_call_timeout_is_rejected() {
        let bridge = Bridge::start(sh(&format!("{}; cat > /dev/null", HANDSHAKE)))
            .await
            .unwrap();
        let three_years = Duration::from_secs(3 * 365 * 24 * 60 * 60);

        let err = bridge
            .call("echo", None, Some(three_years))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::InvalidTimeout {
                timeout: three_years,
                max: MAX_CALL_TIMEOUT,
            }
        );
        assert_eq!(err.code(), crate::bridge::protocol::error_codes::INVALID_PARAMS);

        // The event loop is still serving calls.
        assert!(bridge.is_ready());
        let err = bridge
            .call("echo", None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(bridge.health().await.unwrap().total_requests, 1);
        bridge.stop().await;
    }

    #[tokio::test]
    async fn out_of_range_default_timeout_fails_start() {
        let cfg = sh("exit 0").with_default_timeout(Duration::from_secs(3 * 365 * 24 * 60 * 60));
        let err = Bridge::start(cfg).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Config(ConfigError::TooLarge {
                field: "default_timeout_ms",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let bridge = Bridge::start(sh(&format!("{}; cat > /dev/null", HANDSHAKE)))
            .await
            .unwrap();
        let pending = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.call("hang", None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        bridge.stop().await;
        bridge.stop().await;
        assert_eq!(pending.await.unwrap().unwrap_err(), BridgeError::Stopped);
        assert!(!bridge.is_ready());
        assert_eq!(bridge.worker_state(), WorkerState::Stopped);
        assert_eq!(
            bridge.call("late", None, None).await.unwrap_err(),
            BridgeError::NotReady
        );
        assert_eq!(bridge.health().await.unwrap_err(), BridgeError::Stopped);
    }
}
