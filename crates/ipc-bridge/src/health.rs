//! Health monitor: circuit breaker plus periodic heartbeat.
//!
//! Both gate traffic. The breaker counts consecutive failures and trips to
//! OPEN at a threshold; after a cooldown it lets exactly one trial call
//! through (HALF_OPEN) whose outcome decides CLOSED or OPEN again. The
//! heartbeat runs an injected probe on an interval and hands the result back
//! to the owner, who feeds it to the breaker.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Edge reported by the breaker when it changes between open and closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened { failures: u32, cooldown: Duration },
    Closed,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failures: u32,
    threshold: u32,
    cooldown: Duration,
    open_until: Option<Instant>,
    /// Ticket of the outstanding HALF_OPEN trial.
    trial: Option<u64>,
    trials_granted: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            threshold: threshold.max(1),
            cooldown,
            open_until: None,
            trial: None,
            trials_granted: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failures
    }

    pub fn record_success(&mut self) -> Option<CircuitTransition> {
        self.failures = 0;
        match self.state {
            CircuitState::HalfOpen => {
                self.close();
                Some(CircuitTransition::Closed)
            }
            CircuitState::Closed | CircuitState::Open => None,
        }
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<CircuitTransition> {
        self.failures = self.failures.saturating_add(1);
        match self.state {
            CircuitState::Closed if self.failures >= self.threshold => Some(self.open(now)),
            CircuitState::HalfOpen => Some(self.open(now)),
            CircuitState::Closed | CircuitState::Open => None,
        }
    }

    /// Admission check. May move OPEN to HALF_OPEN, which grants the single
    /// trial to this caller; later callers are refused until it settles.
    pub fn is_request_allowed(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = self.open_until.is_none_or(|until| now >= until);
                if cooled {
                    tracing::info!("Circuit half-open, admitting trial call");
                    self.state = CircuitState::HalfOpen;
                    self.grant_trial();
                }
                cooled
            }
            CircuitState::HalfOpen => {
                if self.trial.is_some() {
                    false
                } else {
                    self.grant_trial();
                    true
                }
            }
        }
    }

    /// Admission check for a call leaving the wait queue. `ticket` is what
    /// [`current_trial`](Self::current_trial) returned when the call was
    /// admitted; only the matching holder skips the HALF_OPEN gate.
    pub fn is_queued_request_allowed(&mut self, ticket: Option<u64>, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen if ticket.is_some() && ticket == self.trial => true,
            CircuitState::Open | CircuitState::HalfOpen => self.is_request_allowed(now),
        }
    }

    /// Ticket of the outstanding trial, if HALF_OPEN has granted one.
    pub fn current_trial(&self) -> Option<u64> {
        self.trial
    }

    /// Give back a trial that never reached the worker. Stale tickets are
    /// ignored.
    pub fn cancel_trial(&mut self, ticket: u64) {
        if self.trial == Some(ticket) {
            self.trial = None;
        }
    }

    fn grant_trial(&mut self) {
        self.trials_granted += 1;
        self.trial = Some(self.trials_granted);
    }

    /// Operator override: close and reset the failure count.
    pub fn force_close(&mut self, _now: Instant) -> Option<CircuitTransition> {
        let was_closed = self.state == CircuitState::Closed;
        self.failures = 0;
        self.close();
        (!was_closed).then_some(CircuitTransition::Closed)
    }

    fn open(&mut self, now: Instant) -> CircuitTransition {
        self.state = CircuitState::Open;
        self.open_until = Some(now + self.cooldown);
        self.trial = None;
        tracing::warn!(failures = self.failures, cooldown = ?self.cooldown, "Circuit opened");
        CircuitTransition::Opened {
            failures: self.failures,
            cooldown: self.cooldown,
        }
    }

    fn close(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!("Circuit closed");
        }
        self.state = CircuitState::Closed;
        self.open_until = None;
        self.trial = None;
    }
}

/// What a heartbeat probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Alive,
    Failed(String),
    /// The probe never reached the worker (e.g. refused at admission).
    /// Not counted either way.
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub outcome: ProbeOutcome,
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthStats {
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    /// Time since the last heartbeat that reached the worker.
    pub last_heartbeat_ago: Option<Duration>,
    pub last_heartbeat_ok: Option<bool>,
}

pub struct HealthMonitor {
    breaker: CircuitBreaker,
    interval: Duration,
    heartbeat_task: Option<JoinHandle<()>>,
    reports_tx: mpsc::UnboundedSender<HeartbeatReport>,
    reports_rx: mpsc::UnboundedReceiver<HeartbeatReport>,
    last_heartbeat: Option<(Instant, bool)>,
}

impl HealthMonitor {
    pub fn new(breaker: CircuitBreaker, interval: Duration) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            breaker,
            interval,
            heartbeat_task: None,
            reports_tx,
            reports_rx,
            last_heartbeat: None,
        }
    }

    /// Arm the periodic probe. The first probe runs one interval from now;
    /// probes never overlap. Re-arming replaces the previous timer.
    pub fn start_heartbeat<P, Fut>(&mut self, probe: P)
    where
        P: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ProbeOutcome> + Send + 'static,
    {
        self.stop();
        let tx = self.reports_tx.clone();
        let period = self.interval;
        self.heartbeat_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let started = Instant::now();
                let outcome = probe().await;
                let report = HeartbeatReport {
                    outcome,
                    latency: started.elapsed(),
                };
                if tx.send(report).is_err() {
                    break;
                }
            }
        }));
        tracing::debug!(interval = ?self.interval, "Heartbeat armed");
    }

    pub fn is_heartbeat_armed(&self) -> bool {
        self.heartbeat_task.is_some()
    }

    /// Next probe result. Pends forever while disarmed. Cancel safe.
    pub async fn next_heartbeat(&mut self) -> HeartbeatReport {
        match self.reports_rx.recv().await {
            Some(report) => report,
            // We hold a sender, so the channel never closes.
            None => std::future::pending().await,
        }
    }

    /// Feed a probe result to the breaker.
    pub fn record_heartbeat(
        &mut self,
        report: &HeartbeatReport,
        now: Instant,
    ) -> Option<CircuitTransition> {
        match &report.outcome {
            ProbeOutcome::Alive => {
                self.last_heartbeat = Some((now, true));
                self.breaker.record_success()
            }
            ProbeOutcome::Failed(reason) => {
                tracing::warn!(%reason, "Heartbeat failed");
                self.last_heartbeat = Some((now, false));
                self.breaker.record_failure(now)
            }
            ProbeOutcome::Skipped(reason) => {
                tracing::debug!(%reason, "Heartbeat skipped");
                None
            }
        }
    }

    /// Disarm the heartbeat. A probe already running is abandoned.
    pub fn stop(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn record_success(&mut self) -> Option<CircuitTransition> {
        self.breaker.record_success()
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<CircuitTransition> {
        self.breaker.record_failure(now)
    }

    pub fn is_request_allowed(&mut self, now: Instant) -> bool {
        self.breaker.is_request_allowed(now)
    }

    pub fn is_queued_request_allowed(&mut self, ticket: Option<u64>, now: Instant) -> bool {
        self.breaker.is_queued_request_allowed(ticket, now)
    }

    pub fn cancel_trial(&mut self, ticket: u64) {
        self.breaker.cancel_trial(ticket)
    }

    pub fn force_close(&mut self, now: Instant) -> Option<CircuitTransition> {
        self.breaker.force_close(now)
    }

    pub fn stats(&self, now: Instant) -> HealthStats {
        HealthStats {
            circuit_state: self.breaker.state(),
            consecutive_failures: self.breaker.failure_count(),
            last_heartbeat_ago: self
                .last_heartbeat
                .map(|(at, _)| now.saturating_duration_since(at)),
            last_heartbeat_ok: self.last_heartbeat.map(|(_, ok)| ok),
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
