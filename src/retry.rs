//! Retry controller: drives executor attempts under a retry budget.
//!
//! Backoff between attempts is `min(2^attempt, cap)` time units with no
//! jitter. Every attempt's raw output is written to the logs stage whatever
//! the outcome.

use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::error::Result;
use crate::executor::Executor;
use crate::model::{ExecutorResult, WorkItem};
use crate::storage::{self, Layout};
use crate::telemetry::metrics;

/// Default backoff cap, in time units.
pub const DEFAULT_CAP_UNITS: u32 = 7;

/// Backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Length of one backoff time unit.
    pub unit: Duration,
    /// Upper bound on a single delay, in units.
    pub cap_units: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
            cap_units: DEFAULT_CAP_UNITS,
        }
    }
}

impl RetryPolicy {
    pub fn with_unit(unit: Duration) -> Self {
        Self {
            unit,
            ..Self::default()
        }
    }

    /// Delay in units after a failed `attempt` (1-based).
    pub fn delay_units(&self, attempt: u32) -> u32 {
        2u32.checked_pow(attempt)
            .unwrap_or(u32::MAX)
            .min(self.cap_units)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.unit * self.delay_units(attempt)
    }
}

/// What a retry run produced.
#[derive(Debug, Clone)]
pub struct RetryRun {
    /// The successful result, or the last failure.
    pub result: ExecutorResult,
    pub attempts: u32,
    /// Backoff sleeps taken between attempts, in order.
    pub delays: Vec<Duration>,
}

/// Run `executor` on `item` until it succeeds, fails non-retryably, or the
/// budget of `max_retries` attempts is spent.
pub async fn run_with_retries(
    executor: &dyn Executor,
    item: &WorkItem,
    layout: &Layout,
    policy: RetryPolicy,
    max_retries: u32,
    timeout_s: u64,
) -> Result<RetryRun> {
    let target = executor.name().to_string();
    let stem = item.stem();
    let max_retries = max_retries.max(1);
    let mut delays = Vec::new();
    let mut attempt = 1;

    loop {
        let started = Instant::now();
        let result = executor
            .execute(&item.meta, &item.body, timeout_s, attempt)
            .await;

        let log_stdout = if result.raw_stdout.is_empty() {
            &result.stdout
        } else {
            &result.raw_stdout
        };
        storage::write_attempt_logs(layout, &stem, attempt, &target, log_stdout, &result.stderr)
            .await?;

        let outcome = if result.ok { "ok" } else { result.code() };
        metrics::executor_attempts().add(
            1,
            &[
                KeyValue::new("target", target.clone()),
                KeyValue::new("result", outcome.to_string()),
            ],
        );
        metrics::attempt_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("target", target.clone())],
        );

        if result.ok {
            info!(target = %target, attempt, elapsed_ms = result.elapsed_ms, "attempt succeeded");
            return Ok(RetryRun {
                result,
                attempts: attempt,
                delays,
            });
        }

        if attempt < max_retries && executor.is_retryable(&result) {
            let delay = policy.delay(attempt);
            warn!(
                target = %target,
                attempt,
                error_code = result.code(),
                delay_ms = delay.as_millis() as u64,
                "retryable failure, backing off"
            );
            tokio::time::sleep(delay).await;
            delays.push(delay);
            attempt += 1;
            continue;
        }

        warn!(
            target = %target,
            attempt,
            error_code = result.code(),
            error_stage = %result.stage(),
            "attempts finished with failure"
        );
        return Ok(RetryRun {
            result,
            attempts: attempt,
            delays,
        });
    }
}
