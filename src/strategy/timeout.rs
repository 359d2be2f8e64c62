//! Pessimistic timeout strategy.
//!
//! The deadline is the configured endpoint timeout plus one second, leaving
//! room for a finer-grained deadline inside the caller's action to fire
//! first. When the deadline elapses the strategy returns `TimeoutRejected`
//! immediately and detaches the in-flight attempt to the background; any
//! fault that attempt later produces is logged, never propagated. The
//! caller's cancellation token is raced in the same select, so caller
//! cancellation is distinguishable from a pipeline timeout.

use crate::context::ResilienceContext;
use crate::telemetry::{PolicyEvent, TelemetryHub};
use crate::Fault;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEADLINE_SLACK: Duration = Duration::from_secs(1);

pub struct TimeoutStrategy {
    deadline: Duration,
    telemetry: Arc<TelemetryHub>,
    pipeline_key: String,
}

impl TimeoutStrategy {
    pub fn new(timeout: Duration, telemetry: Arc<TelemetryHub>, pipeline_key: String) -> Self {
        Self {
            deadline: timeout + DEADLINE_SLACK,
            telemetry,
            pipeline_key,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run one attempt under the deadline and the caller's cancellation.
    pub async fn execute<T: Send + 'static>(
        &self,
        ctx: &ResilienceContext,
        attempt: BoxFuture<'static, Result<T, Fault>>,
    ) -> Result<T, Fault> {
        let sleep = tokio::time::sleep(self.deadline);
        tokio::pin!(sleep);
        let mut attempt = attempt;
        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(Fault::Cancelled { by_caller: true }),
            result = &mut attempt => result,
            _ = &mut sleep => {
                self.telemetry.emit(
                    &self.pipeline_key,
                    ctx.operation_key(),
                    &PolicyEvent::TimeoutOccurred { timeout: self.deadline },
                );
                let operation_key = ctx.operation_key().to_string();
                tokio::spawn(async move {
                    if let Err(fault) = attempt.await {
                        debug!(
                            operation_key = operation_key.as_str(),
                            fault = %fault,
                            "abandoned attempt finished with fault after pipeline timeout"
                        );
                    }
                });
                Err(Fault::TimeoutRejected { timeout: self.deadline })
            }
        }
    }
}
