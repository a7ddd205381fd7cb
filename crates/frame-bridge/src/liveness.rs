//! Readiness tracking and the probe/reload state machine.
//!
//! ```text
//!   load ──> Probing ──ready──> Ready
//!              │  threshold, attempts < max
//!              v
//!        RetryScheduled ──backoff──> reload ──load──> Probing
//!              │  threshold, attempts == max
//!              v
//!        Unresponsive            (any) ──stop──> Stopped
//! ```
//!
//! Every timer carries the session generation it was started for and checks
//! it before touching state, in addition to being aborted on exit from the
//! phase that started it.

use std::sync::Arc;
use std::time::Duration;

use frame_channel::FrameHost;
use frame_proto::Envelope;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ANY_ORIGIN, BridgeConfig};
use crate::error::{BridgeError, BridgeResult, InvalidationReason};
use crate::events::BridgeEvent;
use crate::ledger::PendingLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Idle,
    Probing,
    Ready,
    RetryScheduled,
    Unresponsive,
    Stopped,
}

/// Shared readiness flag. A new generation starts false on every session reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub generation: u64,
    pub ready: bool,
    /// What ended the previous generation.
    pub cause: Option<InvalidationReason>,
    /// Set while the prober is stopped, exhausted or torn down.
    pub halted: Option<InvalidationReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub max_attempts: u32,
    pub ping_count: u32,
    pub ping_threshold: u32,
    pub stopped: bool,
}

struct ProberState {
    phase: LivenessState,
    retry: RetryState,
    generation: u64,
    probe_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
}

impl ProberState {
    fn clear_timers(&mut self) {
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
    }
}

struct ProberInner {
    host: Arc<dyn FrameHost>,
    ledger: PendingLedger,
    events: broadcast::Sender<BridgeEvent>,
    readiness: watch::Sender<Readiness>,
    config: BridgeConfig,
    state: Mutex<ProberState>,
}

#[derive(Clone)]
pub struct LivenessProber {
    inner: Arc<ProberInner>,
}

enum TickOutcome {
    Probe,
    Escalated,
    Finished,
}

impl LivenessProber {
    pub fn new(
        host: Arc<dyn FrameHost>,
        ledger: PendingLedger,
        events: broadcast::Sender<BridgeEvent>,
        config: &BridgeConfig,
    ) -> Self {
        let (readiness, _) = watch::channel(Readiness {
            generation: 0,
            ready: false,
            cause: None,
            halted: None,
        });
        Self {
            inner: Arc::new(ProberInner {
                host,
                ledger,
                events,
                readiness,
                config: config.clone(),
                state: Mutex::new(ProberState {
                    phase: LivenessState::Idle,
                    retry: RetryState {
                        attempts: 0,
                        max_attempts: config.max_attempts,
                        ping_count: 0,
                        ping_threshold: config.probe_threshold.max(1),
                        stopped: false,
                    },
                    generation: 0,
                    probe_task: None,
                    retry_task: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> LivenessState {
        self.inner.state.lock().phase
    }

    pub fn retry_state(&self) -> RetryState {
        self.inner.state.lock().retry
    }

    pub fn readiness(&self) -> Readiness {
        *self.inner.readiness.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness().ready
    }

    /// Peer (re)loaded: readiness drops for a fresh generation and probing
    /// restarts unless the stopped flag is set. Retry attempts carry over so
    /// that reloads issued by the prober count towards the limit.
    pub fn begin_session(&self) {
        let generation = {
            let mut guard = self.inner.state.lock();
            guard.clear_timers();
            guard.retry.ping_count = 0;
            self.next_generation(&mut guard, InvalidationReason::Refreshed);
            if guard.retry.stopped {
                debug!(
                    target = "frame_bridge::liveness",
                    generation = guard.generation,
                    "peer loaded while stopped; not probing"
                );
                return;
            }
            guard.phase = LivenessState::Probing;
            guard.generation
        };
        self.start_probing(generation);
    }

    /// Readiness signal from the peer. Valid from any phase.
    pub fn mark_ready(&self) -> bool {
        let mut guard = self.inner.state.lock();
        guard.clear_timers();
        let was_ready = guard.phase == LivenessState::Ready;
        guard.phase = LivenessState::Ready;
        guard.retry.attempts = 0;
        guard.retry.ping_count = 0;
        guard.retry.stopped = false;
        self.inner.readiness.send_modify(|current| {
            current.generation = guard.generation;
            current.ready = true;
            current.halted = None;
        });
        if !was_ready {
            info!(
                target = "frame_bridge::liveness",
                generation = guard.generation,
                "peer ready"
            );
        }
        !was_ready
    }

    /// Soft-timeout fallback: releases readiness waiters without a signal.
    /// Probing, if any, continues.
    pub fn force_ready(&self) {
        let generation = self.inner.state.lock().generation;
        self.inner.readiness.send_if_modified(|current| {
            if current.ready {
                return false;
            }
            current.generation = generation;
            current.ready = true;
            true
        });
    }

    /// Explicit stop. Idempotent.
    pub fn stop(&self) {
        {
            let mut guard = self.inner.state.lock();
            guard.clear_timers();
            if guard.phase != LivenessState::Stopped {
                info!(target = "frame_bridge::liveness", "reconnect attempts stopped");
            }
            guard.phase = LivenessState::Stopped;
            guard.retry.stopped = true;
        }
        self.halt_waiters(InvalidationReason::ReconnectStopped);
        self.inner
            .ledger
            .cancel_all(InvalidationReason::ReconnectStopped);
    }

    /// Clears retry bookkeeping and drops readiness for a fresh generation.
    /// The caller is expected to reload or navigate the peer afterwards.
    pub fn reset(&self, reason: InvalidationReason) {
        let mut guard = self.inner.state.lock();
        guard.clear_timers();
        guard.phase = LivenessState::Idle;
        guard.retry.attempts = 0;
        guard.retry.ping_count = 0;
        guard.retry.stopped = false;
        self.next_generation(&mut guard, reason);
    }

    /// Re-arms a stopped or exhausted prober and probes the current peer
    /// without reloading it. Returns `false` if there was nothing to resume.
    pub fn resume(&self) -> bool {
        let generation = {
            let mut guard = self.inner.state.lock();
            if !matches!(
                guard.phase,
                LivenessState::Stopped | LivenessState::Unresponsive | LivenessState::Idle
            ) {
                return false;
            }
            guard.clear_timers();
            guard.phase = LivenessState::Probing;
            guard.retry.attempts = 0;
            guard.retry.ping_count = 0;
            guard.retry.stopped = false;
            guard.generation
        };
        self.inner.readiness.send_if_modified(|current| current.halted.take().is_some());
        info!(target = "frame_bridge::liveness", generation, "reconnect re-armed");
        self.start_probing(generation);
        true
    }

    /// Stops timers without touching retry bookkeeping (teardown).
    pub fn halt(&self) {
        {
            let mut guard = self.inner.state.lock();
            guard.clear_timers();
            guard.phase = LivenessState::Idle;
        }
        self.halt_waiters(InvalidationReason::Disconnected);
    }

    /// Waits for the readiness of the generation current at the time of the
    /// call. A reset or halt in the meantime rejects with its reason; a later
    /// generation's signal never releases this waiter.
    pub async fn wait_ready(&self, timeout: Duration) -> BridgeResult<()> {
        let mut rx = self.inner.readiness.subscribe();
        let generation = rx.borrow().generation;
        let outcome = tokio::time::timeout(
            timeout,
            rx.wait_for(|r| r.generation != generation || r.ready || r.halted.is_some()),
        )
        .await
        .map(|seen| seen.map(|r| *r));
        match outcome {
            Ok(Ok(r)) if r.generation != generation => Err(BridgeError::SessionInvalidated(
                r.cause.unwrap_or(InvalidationReason::Refreshed),
            )),
            Ok(Ok(Readiness { ready: true, .. })) => Ok(()),
            Ok(Ok(r)) => Err(BridgeError::SessionInvalidated(
                r.halted.unwrap_or(InvalidationReason::Disconnected),
            )),
            Ok(Err(_)) => Err(BridgeError::SessionInvalidated(
                InvalidationReason::Disconnected,
            )),
            Err(_) => Err(BridgeError::timeout("ready", timeout.as_millis() as u64)),
        }
    }

    fn next_generation(&self, guard: &mut ProberState, cause: InvalidationReason) {
        guard.generation += 1;
        let halted = guard.retry.stopped.then_some(InvalidationReason::ReconnectStopped);
        self.inner.readiness.send_replace(Readiness {
            generation: guard.generation,
            ready: false,
            cause: Some(cause),
            halted,
        });
    }

    fn halt_waiters(&self, reason: InvalidationReason) {
        self.inner.readiness.send_modify(|current| current.halted = Some(reason));
    }

    fn start_probing(&self, generation: u64) {
        self.send_probe();
        let task = self.spawn_probe_loop(generation);
        let mut guard = self.inner.state.lock();
        if guard.generation == generation && guard.phase == LivenessState::Probing {
            guard.probe_task = Some(task);
        } else {
            task.abort();
        }
    }

    fn send_probe(&self) {
        if let Err(err) = self
            .inner
            .host
            .post_message(Envelope::probe().to_value(), ANY_ORIGIN)
        {
            debug!(target = "frame_bridge::liveness", error = %err, "probe not delivered");
        }
    }

    fn spawn_probe_loop(&self, generation: u64) -> JoinHandle<()> {
        let prober = self.clone();
        let interval = self.inner.config.probe_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match prober.on_probe_tick(generation) {
                    TickOutcome::Probe => prober.send_probe(),
                    TickOutcome::Escalated | TickOutcome::Finished => break,
                }
            }
        })
    }

    fn on_probe_tick(&self, generation: u64) -> TickOutcome {
        let mut guard = self.inner.state.lock();
        if guard.generation != generation || guard.phase != LivenessState::Probing {
            return TickOutcome::Finished;
        }
        guard.retry.ping_count += 1;
        if guard.retry.ping_count < guard.retry.ping_threshold {
            return TickOutcome::Probe;
        }
        // Leaving Probing: this task is the probe timer and ends on return.
        drop(guard.probe_task.take());
        let retry = guard.retry;
        if retry.attempts < retry.max_attempts {
            let attempt = retry.attempts + 1;
            let delay = self.inner.config.backoff_for(attempt);
            guard.retry.attempts = attempt;
            guard.phase = LivenessState::RetryScheduled;
            guard.retry_task = Some(self.spawn_reload(generation, delay));
            drop(guard);
            warn!(
                target = "frame_bridge::liveness",
                attempt,
                max_attempts = retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "peer not ready; scheduling reload"
            );
            let _ = self.inner.events.send(BridgeEvent::RetryScheduled {
                attempt,
                max_attempts: retry.max_attempts,
                delay_ms: delay.as_millis() as u64,
            });
        } else {
            guard.phase = LivenessState::Unresponsive;
            guard.retry.stopped = true;
            drop(guard);
            let reason = format!(
                "no readiness signal after {} probes",
                retry.ping_threshold
            );
            warn!(
                target = "frame_bridge::liveness",
                attempts = retry.attempts,
                max_attempts = retry.max_attempts,
                reason = %reason,
                "peer unresponsive; giving up"
            );
            self.halt_waiters(InvalidationReason::ReconnectStopped);
            self.inner
                .ledger
                .cancel_all(InvalidationReason::ReconnectStopped);
            let _ = self.inner.events.send(BridgeEvent::Unresponsive {
                reason,
                attempts: retry.attempts,
                max_attempts: retry.max_attempts,
            });
        }
        TickOutcome::Escalated
    }

    fn spawn_reload(&self, generation: u64, delay: Duration) -> JoinHandle<()> {
        let prober = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut guard = prober.inner.state.lock();
                if guard.generation != generation || guard.phase != LivenessState::RetryScheduled
                {
                    return;
                }
                drop(guard.retry_task.take());
            }
            info!(target = "frame_bridge::liveness", generation, "reloading peer");
            if let Err(err) = prober.inner.host.reload() {
                warn!(target = "frame_bridge::liveness", error = %err, "peer reload failed");
            }
        })
    }
}
