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
//! The retry engine.
//!
//! [`RetrySchedule`] generates the backoff delays for a call and
//! [`Operation`] drives re-attempts over them. Both are usable on their own,
//! independently of a [`Client`](crate::Client).
use crate::rng::ClientRng;
use rand::Rng;
use std::error;
use std::fmt;
use std::time::Duration;
use tokio::time;

/// Configuration of the retry engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// The number of re-attempts after the initial attempt.
    pub retries: u32,
    /// The exponential growth factor between consecutive delays.
    pub factor: f64,
    /// The lower bound of a single delay.
    pub min_timeout: Duration,
    /// The upper bound of a single delay.
    pub max_timeout: Duration,
    /// Whether each delay is scaled by a random factor in `[1, 2)`.
    pub randomize: bool,
}

impl Default for RetryConfig {
    fn default() -> RetryConfig {
        RetryConfig {
            retries: 0,
            factor: 2.0,
            min_timeout: Duration::from_millis(200),
            max_timeout: Duration::from_millis(400),
            randomize: true,
        }
    }
}

/// The error returned when a retry configuration is invalid.
#[derive(Debug)]
pub struct InvalidRetryConfig {
    min_timeout: Duration,
    max_timeout: Duration,
}

impl fmt::Display for InvalidRetryConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "minimum timeout {:?} exceeds maximum timeout {:?}",
            self.min_timeout, self.max_timeout,
        )
    }
}

impl error::Error for InvalidRetryConfig {}

/// An ascending sequence of retry delays.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl RetrySchedule {
    /// Generates a schedule from a configuration.
    ///
    /// The delay for attempt index `i` is
    /// `clamp(round(r * min_timeout * factor^i), min_timeout, max_timeout)`,
    /// with `r` drawn uniformly from `[1, 2)` when randomization is enabled.
    /// The generated delays are sorted ascending.
    pub fn new(config: &RetryConfig) -> Result<RetrySchedule, InvalidRetryConfig> {
        RetrySchedule::with_rng(config, &ClientRng::Thread)
    }

    pub(crate) fn with_rng(
        config: &RetryConfig,
        rng: &ClientRng,
    ) -> Result<RetrySchedule, InvalidRetryConfig> {
        if config.min_timeout > config.max_timeout {
            return Err(InvalidRetryConfig {
                min_timeout: config.min_timeout,
                max_timeout: config.max_timeout,
            });
        }

        let min = config.min_timeout.as_millis() as u64;
        let max = config.max_timeout.as_millis() as u64;

        let mut delays = Vec::with_capacity(config.retries as usize);
        for i in 0..config.retries {
            let random = if config.randomize {
                rng.with(|rng| rng.gen_range(1.0..2.0))
            } else {
                1.0
            };

            // float-to-int conversion saturates, so factors > 1 can't overflow
            let millis = (random * min as f64 * config.factor.powi(i as i32)).round() as u64;
            delays.push(Duration::from_millis(millis.clamp(min, max)));
        }
        delays.sort();

        Ok(RetrySchedule { delays })
    }

    /// Returns the scheduled delays.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

/// A driver running an operation over a retry schedule.
///
/// The driver hands out 1-based attempt ordinals. [`Operation::attempt`]
/// begins the initial attempt, and each subsequent [`Operation::retry`]
/// consumes the next scheduled delay.
pub struct Operation {
    schedule: RetrySchedule,
    attempts: u32,
}

impl Operation {
    /// Creates a driver with a freshly generated schedule.
    pub fn new(config: &RetryConfig) -> Result<Operation, InvalidRetryConfig> {
        Operation::with_rng(config, &ClientRng::Thread)
    }

    pub(crate) fn with_rng(
        config: &RetryConfig,
        rng: &ClientRng,
    ) -> Result<Operation, InvalidRetryConfig> {
        Ok(Operation {
            schedule: RetrySchedule::with_rng(config, rng)?,
            attempts: 0,
        })
    }

    /// Returns the driver's schedule.
    pub fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    /// Returns the number of attempts begun so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the number of retries left in the schedule.
    pub fn remaining(&self) -> u32 {
        self.schedule.delays.len() as u32 - self.attempts.saturating_sub(1)
    }

    /// Begins the initial attempt immediately, returning its ordinal.
    pub fn attempt(&mut self) -> u32 {
        if self.attempts == 0 {
            self.attempts = 1;
        }
        self.attempts
    }

    /// Schedules the next attempt.
    ///
    /// Returns `None` when the schedule is exhausted. Otherwise sleeps for the
    /// next scheduled delay (skipped when `immediate` is set) and returns the
    /// new attempt's ordinal.
    pub async fn retry(&mut self, immediate: bool) -> Option<u32> {
        let used = self.attempts.saturating_sub(1) as usize;
        let delay = *self.schedule.delays.get(used)?;

        if !immediate && delay > Duration::ZERO {
            time::sleep(delay).await;
        }

        self.attempts += 1;
        Some(self.attempts)
    }
}
