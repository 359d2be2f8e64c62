//! Typed fallback strategy.
//!
//! Wraps the whole composite when a caller requests a substitute value on
//! handled faults. The should-handle set always covers upstream dependency
//! errors, connection faults and cancelled tasks; when the execution opted
//! into handling execution faults it additionally covers broken or isolated
//! circuits and pipeline timeouts. Rate-limit rejections are never handled:
//! they must surface so the host edge can answer 429.

use crate::context::ResilienceContext;
use crate::telemetry::{PolicyEvent, TelemetryHub};
use crate::Fault;
use std::sync::Arc;

pub struct FallbackStrategy {
    handles_execution_faults: bool,
    telemetry: Arc<TelemetryHub>,
    pipeline_key: String,
}

impl FallbackStrategy {
    pub fn new(
        handles_execution_faults: bool,
        telemetry: Arc<TelemetryHub>,
        pipeline_key: String,
    ) -> Self {
        Self {
            handles_execution_faults,
            telemetry,
            pipeline_key,
        }
    }

    /// Whether a fault is in the configured should-handle set.
    pub fn should_handle(fault: &Fault, handles_execution_faults: bool) -> bool {
        match fault {
            Fault::Dependency { .. } | Fault::Connection { .. } | Fault::Cancelled { .. } => true,
            Fault::BrokenCircuit { .. } | Fault::IsolatedCircuit | Fault::TimeoutRejected { .. } => {
                handles_execution_faults
            }
            _ => false,
        }
    }

    /// Convert a handled fault into the substitute value: the context's
    /// typed generator when present, the type default otherwise. Unhandled
    /// faults pass through untouched. Runs at most once per execution.
    pub fn apply<T>(&self, ctx: &ResilienceContext, result: Result<T, Fault>) -> Result<T, Fault>
    where
        T: Default + Send + Sync + 'static,
    {
        match result {
            Err(fault) if Self::should_handle(&fault, self.handles_execution_faults) => {
                self.telemetry.emit(
                    &self.pipeline_key,
                    ctx.operation_key(),
                    &PolicyEvent::FallbackUsed,
                );
                tracing::debug!(
                    pipeline_key = self.pipeline_key.as_str(),
                    operation_key = ctx.operation_key(),
                    fault = %fault,
                    "substituting fallback value"
                );
                match ctx.fallback_generator::<T>() {
                    Some(generator) => Ok(generator()),
                    None => Ok(T::default()),
                }
            }
            other => other,
        }
    }
}
