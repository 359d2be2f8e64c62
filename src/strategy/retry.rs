//! Classified retry with decorrelated-jitter backoff.
//!
//! Re-executes the composite below it while the surfaced fault is retryable,
//! up to the configured retry count (total executions = retries + 1). The
//! delay follows decorrelated jitter: each wait is drawn from
//! `min(max, max(seed, previous * 3 * U(0,1)))`, which spreads concurrent
//! retriers apart instead of synchronising them.

use crate::classify;
use crate::context::ResilienceContext;
use crate::telemetry::{PolicyEvent, TelemetryHub};
use crate::Fault;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

pub struct RetryStrategy {
    retries: u32,
    delay_seed: Duration,
    delay_maximum: Duration,
    telemetry: Arc<TelemetryHub>,
    pipeline_key: String,
}

impl RetryStrategy {
    pub fn new(
        retries: u32,
        delay_seed: Duration,
        delay_maximum: Duration,
        telemetry: Arc<TelemetryHub>,
        pipeline_key: String,
    ) -> Self {
        Self {
            retries,
            delay_seed,
            delay_maximum,
            telemetry,
            pipeline_key,
        }
    }

    /// Drive `run` until it succeeds, surfaces a non-retryable fault, or the
    /// retry budget is spent.
    pub async fn execute<'a, T, F>(
        &self,
        ctx: &ResilienceContext,
        mut run: F,
    ) -> Result<T, Fault>
    where
        T: Send,
        F: FnMut() -> BoxFuture<'a, Result<T, Fault>> + Send,
    {
        let mut current = self.delay_seed;
        let mut attempt: u32 = 0;
        loop {
            match run().await {
                Ok(value) => return Ok(value),
                Err(fault) => {
                    if attempt >= self.retries || !classify::can_retry(&fault) {
                        return Err(fault);
                    }
                    current = decorrelated_jitter(self.delay_seed, self.delay_maximum, current);
                    attempt += 1;
                    self.telemetry.emit(
                        &self.pipeline_key,
                        ctx.operation_key(),
                        &PolicyEvent::RetryAttempt {
                            attempt,
                            delay: current,
                        },
                    );
                    tokio::time::sleep(current).await;
                }
            }
        }
    }
}

/// One step of the decorrelated-jitter recurrence.
fn decorrelated_jitter(seed: Duration, maximum: Duration, current: Duration) -> Duration {
    let seed_ms = seed.as_secs_f64() * 1000.0;
    let max_ms = maximum.as_secs_f64() * 1000.0;
    let current_ms = current.as_secs_f64() * 1000.0;
    let next_ms = (current_ms * 3.0 * fastrand::f64()).max(seed_ms).min(max_ms);
    Duration::from_secs_f64(next_ms / 1000.0)
}
