//! Per-backend circuit breaker.
//!
//! # States
//! - Closed: calls pass through; `failure_threshold` failures open the circuit
//! - Open: calls fail fast (or run the fallback) until `reset_timeout` has
//!   passed since the last failure; the next call then moves to half-open
//! - HalfOpen: trial calls pass through; `half_open_max_calls` successes close
//!   the circuit, any failure reopens it
//!
//! ```text
//! Closed ──threshold failures──▶ Open ──reset timeout + call──▶ HalfOpen
//!   ▲                              ▲                               │
//!   └──────── N successes ─────────┼───────────────────────────────┤
//!                                  └────────── any failure ────────┘
//! ```
//!
//! History is diagnostic only and never drives transitions.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::error::DispatchError;

/// Outcomes retained per backend name.
pub const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CircuitEventKind {
    Success,
    Failure { message: String },
    Rejected,
    Fallback,
    Transition { from: CircuitState, to: CircuitState },
    Reset,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitEvent {
    /// Wall-clock epoch millis.
    pub at_ms: u64,
    #[serde(flatten)]
    pub kind: CircuitEventKind,
}

#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    history: VecDeque<CircuitEvent>,
}

impl CircuitRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    fn push(&mut self, kind: CircuitEventKind) {
        if self.history.len() >= HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(CircuitEvent {
            at_ms: epoch_ms(),
            kind,
        });
    }

    fn transition(&mut self, name: &str, to: CircuitState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.failure_count = 0;
        self.success_count = 0;
        self.push(CircuitEventKind::Transition { from, to });
        match to {
            CircuitState::Open => tracing::warn!(
                backend = name,
                from = from.as_str(),
                "circuit opened"
            ),
            CircuitState::HalfOpen => tracing::info!(backend = name, "circuit half-open, trialling"),
            CircuitState::Closed => tracing::info!(backend = name, "circuit closed"),
        }
    }
}

/// Point-in-time view of one backend's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_ago_ms: Option<u64>,
    pub history: Vec<CircuitEvent>,
}

enum Admission {
    Proceed,
    Rejected,
}

/// Circuit breakers keyed by backend name, created lazily on first use.
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, CircuitRecord>>,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: config.reset_timeout(),
            half_open_max_calls: config.half_open_max_calls.max(1),
        }
    }

    /// Run `op` under the breaker for `name`.
    ///
    /// Open → `CircuitOpen` without invoking `op`. Failures from `op` are
    /// recorded and returned unchanged.
    pub async fn execute<T, F, Fut>(&self, name: &str, op: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        self.run(
            name,
            op,
            None::<fn() -> std::future::Ready<Result<T, DispatchError>>>,
        )
        .await
    }

    /// Like [`execute`](Self::execute), but runs `fallback` instead of failing
    /// when the circuit is open or `op` fails. When both fail the result is
    /// `CircuitBreaker` carrying both errors.
    pub async fn execute_with_fallback<T, F, Fut, G, GFut>(
        &self,
        name: &str,
        op: F,
        fallback: G,
    ) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, DispatchError>>,
    {
        self.run(name, op, Some(fallback)).await
    }

    async fn run<T, F, Fut, G, GFut>(
        &self,
        name: &str,
        op: F,
        fallback: Option<G>,
    ) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, DispatchError>>,
    {
        let primary_err = match self.admit(name) {
            Admission::Rejected => DispatchError::CircuitOpen {
                name: name.to_string(),
            },
            Admission::Proceed => match op().await {
                Ok(value) => {
                    self.record_success(name);
                    return Ok(value);
                }
                Err(e) => {
                    self.record_failure(name, &e);
                    e
                }
            },
        };

        let Some(fallback) = fallback else {
            return Err(primary_err);
        };

        self.with_record(name, |r| r.push(CircuitEventKind::Fallback));
        tracing::debug!(backend = name, "running fallback: {primary_err}");

        fallback()
            .await
            .map_err(|fallback_err| DispatchError::CircuitBreaker {
                name: name.to_string(),
                primary: Box::new(primary_err),
                fallback: Box::new(fallback_err),
            })
    }

    fn with_record<R>(&self, name: &str, f: impl FnOnce(&mut CircuitRecord) -> R) -> R {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let record = circuits
            .entry(name.to_string())
            .or_insert_with(CircuitRecord::new);
        f(record)
    }

    fn admit(&self, name: &str) -> Admission {
        let reset_timeout = self.reset_timeout;
        self.with_record(name, |r| {
            if r.state != CircuitState::Open {
                return Admission::Proceed;
            }
            let cooled = r
                .last_failure
                .is_none_or(|at| at.elapsed() >= reset_timeout);
            if cooled {
                r.transition(name, CircuitState::HalfOpen);
                Admission::Proceed
            } else {
                r.push(CircuitEventKind::Rejected);
                Admission::Rejected
            }
        })
    }

    fn record_success(&self, name: &str) {
        let half_open_max = self.half_open_max_calls;
        self.with_record(name, |r| {
            r.push(CircuitEventKind::Success);
            match r.state {
                CircuitState::Closed => r.failure_count = 0,
                CircuitState::HalfOpen => {
                    r.success_count += 1;
                    if r.success_count >= half_open_max {
                        r.transition(name, CircuitState::Closed);
                    }
                }
                // A trial that started half-open finished after a sibling reopened it.
                CircuitState::Open => {}
            }
        });
    }

    fn record_failure(&self, name: &str, err: &DispatchError) {
        let threshold = self.failure_threshold;
        self.with_record(name, |r| {
            r.last_failure = Some(Instant::now());
            r.push(CircuitEventKind::Failure {
                message: err.to_string(),
            });
            match r.state {
                CircuitState::Closed => {
                    r.failure_count += 1;
                    if r.failure_count >= threshold {
                        r.transition(name, CircuitState::Open);
                    }
                }
                CircuitState::HalfOpen => r.transition(name, CircuitState::Open),
                CircuitState::Open => {}
            }
        });
    }

    /// Current state; backends never seen are `Closed`.
    pub fn state(&self, name: &str) -> CircuitState {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits
            .get(name)
            .map(|r| r.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, name: &str) -> Option<CircuitSnapshot> {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits.get(name).map(|r| snapshot_of(name, r))
    }

    /// Snapshots for every backend seen so far, sorted by name.
    pub fn all_states(&self) -> Vec<CircuitSnapshot> {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<CircuitSnapshot> = circuits
            .iter()
            .map(|(name, r)| snapshot_of(name, r))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Force a backend back to `Closed`. Returns false if it was never seen.
    pub fn reset(&self, name: &str) -> bool {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = circuits.get_mut(name) else {
            return false;
        };
        record.transition(name, CircuitState::Closed);
        record.failure_count = 0;
        record.success_count = 0;
        record.last_failure = None;
        record.push(CircuitEventKind::Reset);
        true
    }
}

fn snapshot_of(name: &str, r: &CircuitRecord) -> CircuitSnapshot {
    CircuitSnapshot {
        name: name.to_string(),
        state: r.state,
        failure_count: r.failure_count,
        success_count: r.success_count,
        last_failure_ago_ms: r.last_failure.map(|at| at.elapsed().as_millis() as u64),
        history: r.history.iter().cloned().collect(),
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
