// Copyright 2020 Palantir Technologies, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! The circuit breaker.
//!
//! A rolling-window failure detector. Outcomes are tallied into a ring of
//! fixed-duration buckets; when the error percentage over the window exceeds
//! the configured threshold (and enough commands have been observed), the
//! breaker opens and rejects commands without running them. After a
//! configurable wait the breaker lets a single probe command through, closing
//! again on its success.
//!
//! The breaker is usable on its own, independently of a
//! [`Client`](crate::Client):
//!
//! ```
//! # async fn shell() {
//! use palisade::breaker::{BreakerConfig, CircuitBreaker, RunError};
//!
//! let breaker = CircuitBreaker::new(BreakerConfig::default());
//!
//! let result: Result<&str, RunError<&str>> = breaker
//!     .run(async { Ok("hello") })
//!     .await;
//! # }
//! ```
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::{self, Duration, Instant};
use tracing::{info, warn};

/// Configuration of a circuit breaker.
#[derive(Clone)]
pub struct BreakerConfig {
    /// The total duration of the rolling window.
    pub window_duration: Duration,
    /// The number of equal-duration buckets in the window.
    pub num_buckets: usize,
    /// The error percentage above which the breaker trips.
    pub error_threshold: f64,
    /// The minimum number of observations in the window before the breaker
    /// may trip. The comparison is strict: exactly this many observations do
    /// not trip the breaker.
    pub volume_threshold: u64,
    /// The time spent open before a probe command is allowed through.
    ///
    /// Defaults to half the window duration.
    pub wait_duration_in_open_state: Option<Duration>,
    /// The time after which a command that has neither succeeded nor failed
    /// is charged as a timeout.
    pub timeout_duration: Duration,
    /// Invoked with the current metrics when the breaker opens.
    pub on_open: Option<Arc<dyn Fn(&BreakerMetrics) + Sync + Send>>,
    /// Invoked with the current metrics when the breaker closes.
    pub on_close: Option<Arc<dyn Fn(&BreakerMetrics) + Sync + Send>>,
}

impl Default for BreakerConfig {
    fn default() -> BreakerConfig {
        BreakerConfig {
            window_duration: Duration::from_secs(10),
            num_buckets: 10,
            error_threshold: 50.0,
            volume_threshold: 5,
            wait_duration_in_open_state: None,
            timeout_duration: Duration::from_secs(3),
            on_open: None,
            on_close: None,
        }
    }
}

impl BreakerConfig {
    fn wait_duration(&self) -> Duration {
        self.wait_duration_in_open_state
            .unwrap_or(self.window_duration / 2)
    }

    fn bucket_duration(&self) -> Duration {
        self.window_duration / self.num_buckets.max(1) as u32
    }
}

/// The logical state of a circuit breaker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BreakerState {
    /// Commands run normally.
    Closed,
    /// Commands are rejected without running.
    Open,
    /// A single probe command is allowed through.
    HalfOpen,
}

/// Outcome counters for one slot of the rolling window.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Bucket {
    /// Commands that succeeded.
    pub successes: u64,
    /// Commands that failed.
    pub failures: u64,
    /// Commands that neither succeeded nor failed in time.
    pub timeouts: u64,
    /// Commands rejected without running.
    pub short_circuits: u64,
}

/// Aggregated counters over the breaker's rolling window.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BreakerMetrics {
    /// Total successes in the window.
    pub successes: u64,
    /// Total failures in the window.
    pub failures: u64,
    /// Total timeouts in the window.
    pub timeouts: u64,
    /// Total short circuits in the window.
    pub short_circuits: u64,
    /// Successes plus failures plus timeouts.
    pub total_count: u64,
    /// Failures plus timeouts.
    pub error_count: u64,
    /// `error_count / max(total_count, 1) * 100`.
    pub error_percentage: f64,
}

struct Window {
    buckets: Vec<Bucket>,
    index: usize,
    last_rotation: Instant,
}

impl Window {
    fn new(num_buckets: usize) -> Window {
        Window {
            buckets: vec![Bucket::default(); num_buckets],
            index: 0,
            last_rotation: Instant::now(),
        }
    }

    fn current_mut(&mut self) -> &mut Bucket {
        &mut self.buckets[self.index]
    }

    fn advance(&mut self) {
        self.index = (self.index + 1) % self.buckets.len();
        self.buckets[self.index] = Bucket::default();
    }

    fn reset(&mut self) {
        for bucket in &mut self.buckets {
            *bucket = Bucket::default();
        }
    }

    fn metrics(&self) -> BreakerMetrics {
        let mut metrics = BreakerMetrics {
            successes: 0,
            failures: 0,
            timeouts: 0,
            short_circuits: 0,
            total_count: 0,
            error_count: 0,
            error_percentage: 0.0,
        };
        for bucket in &self.buckets {
            metrics.successes += bucket.successes;
            metrics.failures += bucket.failures;
            metrics.timeouts += bucket.timeouts;
            metrics.short_circuits += bucket.short_circuits;
        }
        metrics.total_count = metrics.successes + metrics.failures + metrics.timeouts;
        metrics.error_count = metrics.failures + metrics.timeouts;
        metrics.error_percentage =
            metrics.error_count as f64 / metrics.total_count.max(1) as f64 * 100.0;
        metrics
    }
}

#[derive(Copy, Clone)]
enum Logical {
    Closed,
    Open { since: Instant },
    HalfOpen { probing: bool },
}

struct Forced {
    state: BreakerState,
    snapshot: Logical,
}

struct State {
    window: Window,
    logical: Logical,
    forced: Option<Forced>,
}

impl State {
    // Rotation and the OPEN -> HALF_OPEN transition are both derived from the
    // clock, so the daemon timers and direct calls converge on the same state.
    fn refresh(&mut self, config: &BreakerConfig) {
        let now = Instant::now();
        let bucket = config.bucket_duration();
        let elapsed = now.saturating_duration_since(self.window.last_rotation);

        if bucket.is_zero() {
            self.window.reset();
            self.window.last_rotation = now;
        } else {
            let steps = (elapsed.as_nanos() / bucket.as_nanos()) as u64;
            if steps as usize >= self.window.buckets.len() {
                self.window.reset();
                self.window.last_rotation = now;
            } else {
                for _ in 0..steps {
                    self.window.advance();
                }
                self.window.last_rotation += bucket * steps as u32;
            }
        }

        if self.forced.is_none() {
            if let Logical::Open { since } = self.logical {
                if now.saturating_duration_since(since) >= config.wait_duration() {
                    self.logical = Logical::HalfOpen { probing: false };
                }
            }
        }
    }

    fn effective(&self) -> BreakerState {
        match &self.forced {
            Some(forced) => forced.state,
            None => match self.logical {
                Logical::Closed => BreakerState::Closed,
                Logical::Open { .. } => BreakerState::Open,
                Logical::HalfOpen { .. } => BreakerState::HalfOpen,
            },
        }
    }
}

struct Shared {
    config: BreakerConfig,
    state: Mutex<State>,
    ticker: OnceCell<()>,
}

enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// A rolling-window circuit breaker.
///
/// Cloning a breaker produces a handle to the same state, and a breaker may
/// be charged concurrently from any number of tasks. Background timers run as
/// daemon tasks holding weak references, so they never keep the process (or a
/// dropped breaker) alive.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    /// Creates a breaker.
    pub fn new(config: BreakerConfig) -> CircuitBreaker {
        let num_buckets = config.num_buckets.max(1);
        CircuitBreaker {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    window: Window::new(num_buckets),
                    logical: Logical::Closed,
                    forced: None,
                }),
                config,
                ticker: OnceCell::new(),
            }),
        }
    }

    /// Returns the breaker's current state.
    pub fn state(&self) -> BreakerState {
        let mut state = self.shared.state.lock();
        state.refresh(&self.shared.config);
        state.effective()
    }

    /// Returns true iff the breaker's current state is open.
    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    /// Returns the aggregated metrics of the rolling window.
    pub fn metrics(&self) -> BreakerMetrics {
        let mut state = self.shared.state.lock();
        state.refresh(&self.shared.config);
        state.window.metrics()
    }

    /// Forces the breaker open, snapshotting the pre-force state.
    pub fn force_open(&self) {
        self.force(BreakerState::Open);
    }

    /// Forces the breaker closed, snapshotting the pre-force state.
    pub fn force_close(&self) {
        self.force(BreakerState::Closed);
    }

    fn force(&self, target: BreakerState) {
        let mut state = self.shared.state.lock();
        state.refresh(&self.shared.config);
        let snapshot = state.logical;
        match &mut state.forced {
            Some(forced) => forced.state = target,
            None => state.forced = Some(Forced {
                state: target,
                snapshot,
            }),
        }
    }

    /// Restores the state snapshotted by the first force.
    ///
    /// A no-op if the breaker is not forced.
    pub fn unforce(&self) {
        let mut state = self.shared.state.lock();
        if let Some(forced) = state.forced.take() {
            state.logical = forced.snapshot;
            if let Logical::Open { .. } = state.logical {
                spawn_half_open_timer(&self.shared);
            }
        }
        state.refresh(&self.shared.config);
    }

    /// Requests permission to run a command.
    ///
    /// Returns `None` when the breaker rejects the command, charging a short
    /// circuit to the current bucket. Otherwise the returned [`Permit`] must
    /// be settled with [`Permit::success`] or [`Permit::failure`]; a permit
    /// that settles neither way is charged as a timeout after the configured
    /// timeout duration.
    pub fn acquire(&self) -> Option<Permit> {
        self.ensure_ticker();

        let probe = {
            let mut state = self.shared.state.lock();
            state.refresh(&self.shared.config);

            let permit = match &state.forced {
                Some(forced) => match forced.state {
                    BreakerState::Open => None,
                    _ => Some(false),
                },
                None => match state.logical {
                    Logical::Closed => Some(false),
                    Logical::Open { .. } => None,
                    Logical::HalfOpen { probing: false } => {
                        state.logical = Logical::HalfOpen { probing: true };
                        Some(true)
                    }
                    Logical::HalfOpen { probing: true } => None,
                },
            };

            match permit {
                Some(probe) => probe,
                None => {
                    state.window.current_mut().short_circuits += 1;
                    return None;
                }
            }
        };

        let charged = Arc::new(AtomicBool::new(false));

        let weak = Arc::downgrade(&self.shared);
        let flag = charged.clone();
        let timeout = self.shared.config.timeout_duration;
        spawn_daemon(async move {
            time::sleep(timeout).await;
            if flag.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(shared) = weak.upgrade() {
                apply(&shared, Outcome::Timeout, probe);
            }
        });

        Some(Permit {
            shared: self.shared.clone(),
            charged,
            probe,
        })
    }

    /// Runs a command under the breaker's supervision.
    ///
    /// When the breaker rejects the command, `RunError::Rejected` is returned
    /// without running it.
    pub async fn run<T, E, F>(&self, command: F) -> Result<T, RunError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        match self.acquire() {
            Some(permit) => permit.observe(command).await,
            None => Err(RunError::Rejected),
        }
    }

    /// Runs a command under the breaker's supervision, falling back when the
    /// breaker rejects it.
    pub async fn run_with_fallback<T, E, F, G, H>(
        &self,
        command: F,
        fallback: G,
    ) -> Result<T, RunError<E>>
    where
        F: Future<Output = Result<T, E>>,
        G: FnOnce() -> H,
        H: Future<Output = Result<T, E>>,
    {
        match self.acquire() {
            Some(permit) => permit.observe(command).await,
            None => fallback().await.map_err(RunError::Inner),
        }
    }

    fn ensure_ticker(&self) {
        self.shared.ticker.get_or_init(|| {
            let period = self.shared.config.bucket_duration();
            if period.is_zero() {
                return;
            }
            let weak = Arc::downgrade(&self.shared);
            spawn_daemon(async move {
                let mut interval = time::interval_at(Instant::now() + period, period);
                loop {
                    interval.tick().await;
                    match weak.upgrade() {
                        Some(shared) => shared.state.lock().refresh(&shared.config),
                        None => break,
                    }
                }
            });
        });
    }
}

/// Permission to run a single command under a breaker.
pub struct Permit {
    shared: Arc<Shared>,
    charged: Arc<AtomicBool>,
    probe: bool,
}

impl Permit {
    /// Charges the command's success.
    ///
    /// Only the first settling signal of a permit counts; later calls are
    /// ignored.
    pub fn success(&self) {
        self.charge(Outcome::Success);
    }

    /// Charges the command's failure.
    ///
    /// Only the first settling signal of a permit counts; later calls are
    /// ignored.
    pub fn failure(&self) {
        self.charge(Outcome::Failure);
    }

    fn charge(&self, outcome: Outcome) {
        if self.charged.swap(true, Ordering::SeqCst) {
            return;
        }
        apply(&self.shared, outcome, self.probe);
    }

    async fn observe<T, E, F>(self, command: F) -> Result<T, RunError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        match command.await {
            Ok(value) => {
                self.success();
                Ok(value)
            }
            Err(e) => {
                self.failure();
                Err(RunError::Inner(e))
            }
        }
    }
}

fn apply(shared: &Arc<Shared>, outcome: Outcome, probe: bool) {
    let mut notify = None;
    {
        let mut state = shared.state.lock();
        state.refresh(&shared.config);

        {
            let bucket = state.window.current_mut();
            match outcome {
                Outcome::Success => bucket.successes += 1,
                Outcome::Failure => bucket.failures += 1,
                Outcome::Timeout => bucket.timeouts += 1,
            }
        }

        if state.forced.is_some() {
            // forced breakers tally outcomes but never transition
        } else if probe {
            if matches!(state.logical, Logical::HalfOpen { .. }) {
                match outcome {
                    Outcome::Success => {
                        let metrics = state.window.metrics();
                        info!("circuit breaker closing");
                        state.logical = Logical::Closed;
                        state.window.reset();
                        notify = Some((shared.config.on_close.clone(), metrics));
                    }
                    Outcome::Failure | Outcome::Timeout => {
                        warn!("circuit breaker reopening after failed probe");
                        trip_open(&mut state, shared);
                        notify = Some((shared.config.on_open.clone(), state.window.metrics()));
                    }
                }
            }
        } else if matches!(state.logical, Logical::Closed) {
            let metrics = state.window.metrics();
            if metrics.total_count > shared.config.volume_threshold
                && metrics.error_percentage > shared.config.error_threshold
            {
                warn!(
                    error_percentage = metrics.error_percentage,
                    total_count = metrics.total_count,
                    "circuit breaker opening",
                );
                trip_open(&mut state, shared);
                notify = Some((shared.config.on_open.clone(), metrics));
            }
        }
    }

    // callbacks run without holding the breaker's lock
    if let Some((Some(callback), metrics)) = notify {
        callback(&metrics);
    }
}

fn trip_open(state: &mut State, shared: &Arc<Shared>) {
    state.logical = Logical::Open {
        since: Instant::now(),
    };
    spawn_half_open_timer(shared);
}

fn spawn_half_open_timer(shared: &Arc<Shared>) {
    let weak = Arc::downgrade(shared);
    let wait = shared.config.wait_duration();
    spawn_daemon(async move {
        time::sleep(wait).await;
        if let Some(shared) = weak.upgrade() {
            shared.state.lock().refresh(&shared.config);
        }
    });
}

fn spawn_daemon<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    }
}

/// The error returned by [`CircuitBreaker::run`].
#[derive(Debug, PartialEq, Eq)]
pub enum RunError<E> {
    /// The breaker rejected the command without running it.
    Rejected,
    /// The command itself failed.
    Inner(E),
}

impl<E> fmt::Display for RunError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Rejected => fmt.write_str("the circuit breaker is open"),
            RunError::Inner(e) => fmt::Display::fmt(e, fmt),
        }
    }
}

impl<E> error::Error for RunError<E> where E: error::Error {}
