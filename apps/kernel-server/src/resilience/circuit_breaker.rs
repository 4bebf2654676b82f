// [[AXON]]/apps/kernel-server/src/resilience/circuit_breaker.rs
// Purpose: Per-upstream circuit breaker with a sliding outcome window.
// Architecture: Infrastructure Layer
// Dependencies: dashmap, tokio, metrics

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn label(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

#[derive(Error, Debug)]
pub enum BreakerError<E> {
    #[error("circuit open for {0}")]
    Open(String),
    #[error(transparent)]
    Inner(E),
}

struct Core {
    state: BreakerState,
    /// Outcomes of the most recent calls while closed; true = failure.
    window: VecDeque<bool>,
    timeout_streak: u32,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    half_open_inflight: usize,
}

/// Failure-ratio breaker. Closed -> open when the ratio over a window of at
/// least `min_requests` reaches `failure_ratio`, or when `timeout_streak`
/// consecutive calls time out. Open -> half-open after `reset_timeout`;
/// half-open admits a bounded number of probes and closes again after
/// `success_threshold` consecutive successes.
pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    core: Mutex<Core>,
}

impl CircuitBreaker {
    pub fn new(name: &str, cfg: BreakerConfig) -> Self {
        CircuitBreaker {
            name: name.to_string(),
            cfg,
            core: Mutex::new(Core {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                timeout_streak: 0,
                opened_at: None,
                half_open_successes: 0,
                half_open_inflight: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut core = self.core.lock().unwrap_or_else(|e| e.into_inner());
        self.maybe_transition_half_open(&mut core);
        core.state
    }

    /// Run `op` under the breaker. `is_timeout` flags results that should
    /// count against the timeout streak in addition to the failure window.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;
        let call_timeout = Duration::from_secs(self.cfg.call_timeout_secs);
        let started = Instant::now();
        let outcome = tokio::time::timeout(call_timeout, op()).await;
        let duration = started.elapsed();

        match outcome {
            Ok(Ok(value)) => {
                self.record(true, false);
                self.emit_request("success");
                metrics::histogram!("cb_call_duration_seconds", "upstream" => self.name.clone())
                    .record(duration.as_secs_f64());
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record(false, false);
                self.emit_request("failure");
                Err(BreakerError::Inner(e))
            }
            Err(_elapsed) => {
                self.record(false, true);
                self.emit_request("timeout");
                Err(BreakerError::Open(format!(
                    "{} timed out after {:?}",
                    self.name, call_timeout
                )))
            }
        }
    }

    /// Admission check. Errors with `Open` when calls must be short-circuited.
    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let mut core = self.core.lock().unwrap_or_else(|e| e.into_inner());
        self.maybe_transition_half_open(&mut core);
        match core.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(BreakerError::Open(self.name.clone())),
            BreakerState::HalfOpen => {
                if core.half_open_inflight >= self.cfg.half_open_max_calls {
                    return Err(BreakerError::Open(self.name.clone()));
                }
                core.half_open_inflight += 1;
                Ok(())
            }
        }
    }

    fn record(&self, success: bool, timed_out: bool) {
        let mut core = self.core.lock().unwrap_or_else(|e| e.into_inner());
        match core.state {
            BreakerState::Closed => {
                core.window.push_back(!success);
                while core.window.len() > self.cfg.window_size {
                    core.window.pop_front();
                }
                if timed_out {
                    core.timeout_streak += 1;
                } else if success {
                    core.timeout_streak = 0;
                }

                let failures = core.window.iter().filter(|&&f| f).count();
                let ratio_tripped = core.window.len() >= self.cfg.min_requests
                    && failures as f64 / core.window.len() as f64 >= self.cfg.failure_ratio;
                let timeout_tripped = core.timeout_streak >= self.cfg.timeout_streak;
                if ratio_tripped || timeout_tripped {
                    self.transition(&mut core, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                core.half_open_inflight = core.half_open_inflight.saturating_sub(1);
                if success {
                    core.half_open_successes += 1;
                    if core.half_open_successes >= self.cfg.success_threshold {
                        self.transition(&mut core, BreakerState::Closed);
                    }
                } else {
                    // Any failure while probing re-opens immediately.
                    self.transition(&mut core, BreakerState::Open);
                }
            }
            // A late result from before the trip; the window restarts on close.
            BreakerState::Open => {}
        }
    }

    fn maybe_transition_half_open(&self, core: &mut Core) {
        if core.state == BreakerState::Open {
            let elapsed = core
                .opened_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= Duration::from_secs(self.cfg.reset_timeout_secs) {
                self.transition(core, BreakerState::HalfOpen);
            }
        }
    }

    fn transition(&self, core: &mut Core, to: BreakerState) {
        let from = core.state;
        if from == to {
            return;
        }
        core.state = to;
        match to {
            BreakerState::Open => {
                core.opened_at = Some(Instant::now());
                core.window.clear();
                core.timeout_streak = 0;
            }
            BreakerState::HalfOpen => {
                core.half_open_successes = 0;
                core.half_open_inflight = 0;
            }
            BreakerState::Closed => {
                core.window.clear();
                core.timeout_streak = 0;
            }
        }
        tracing::warn!(
            "circuit breaker {} transitioned {} -> {}",
            self.name,
            from.label(),
            to.label()
        );
        metrics::counter!(
            "cb_state_changes_total",
            "upstream" => self.name.clone(),
            "from" => from.label(),
            "to" => to.label()
        )
        .increment(1);
        metrics::gauge!("cb_state", "upstream" => self.name.clone()).set(to.gauge_value());
    }

    fn emit_request(&self, status: &'static str) {
        let state = {
            let core = self.core.lock().unwrap_or_else(|e| e.into_inner());
            core.state
        };
        metrics::counter!(
            "cb_requests_total",
            "upstream" => self.name.clone(),
            "state" => state.label(),
            "status" => status
        )
        .increment(1);
    }
}

/// Process-wide registry of named breakers, one per upstream.
pub struct BreakerRegistry {
    cfg: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(cfg: BreakerConfig) -> Self {
        BreakerRegistry {
            cfg,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, upstream: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(upstream.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(upstream, self.cfg.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_cfg() -> BreakerConfig {
        BreakerConfig {
            window_size: 10,
            min_requests: 10,
            failure_ratio: 0.6,
            timeout_streak: 3,
            reset_timeout_secs: 0,
            success_threshold: 2,
            half_open_max_calls: 5,
            call_timeout_secs: 5,
        }
    }

    #[derive(thiserror::Error, Debug)]
    #[error("upstream boom")]
    struct Boom;

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<Boom>> {
        cb.call(|| async { Err::<(), _>(Boom) }).await.map(|_| ())
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), BreakerError<Boom>> {
        cb.call(|| async { Ok::<_, Boom>(()) }).await.map(|_| ())
    }

    #[tokio::test]
    async fn opens_exactly_on_the_crossing_sample() {
        let cfg = BreakerConfig {
            reset_timeout_secs: 3600,
            ..fast_cfg()
        };
        let cb = CircuitBreaker::new("up", cfg);
        // 5 failures + 4 successes: 9 samples, below min_requests.
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        for _ in 0..4 {
            let _ = succeed(&cb).await;
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        // 10th sample: 6/10 failures crosses the 0.6 ratio.
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn open_short_circuits_calls() {
        let cfg = BreakerConfig {
            reset_timeout_secs: 3600,
            ..fast_cfg()
        };
        let cb = CircuitBreaker::new("up", cfg);
        for _ in 0..10 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), BreakerState::Open);
        let result = succeed(&cb).await;
        assert!(matches!(result, Err(BreakerError::Open(_))));
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new("up", fast_cfg());
        for _ in 0..10 {
            let _ = fail(&cb).await;
        }
        // reset_timeout is zero: next state read flips to half-open.
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        let _ = succeed(&cb).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        let _ = succeed(&cb).await;
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new("up", fast_cfg());
        for _ in 0..10 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        let _ = fail(&cb).await;
        // reset_timeout 0 means state() immediately flips back to half-open,
        // so assert via the inner core before the probe window reopens.
        let state = {
            let core = cb.core.lock().unwrap();
            core.state
        };
        assert_eq!(state, BreakerState::Open);
    }

    #[tokio::test]
    async fn registry_returns_same_instance_per_name() {
        let registry = BreakerRegistry::new(fast_cfg());
        let a = registry.get("github");
        let b = registry.get("github");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
