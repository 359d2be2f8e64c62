//! Strategy composition per `(endpoint, resource, handles-execution-faults)`.
//!
//! Order is fixed, outermost first: retry, circuit breaker, timeout, rate
//! limit, operation. Rate limiting sits innermost so retried attempts also
//! consume tokens; the timeout sits inside the breaker so a timed-out
//! attempt counts toward breaker statistics; the breaker sits inside retry
//! so a break surfaces immediately and abandons further attempts.

use crate::classify;
use crate::config::EndpointConfig;
use crate::context::ResilienceContext;
use crate::strategy::circuit_breaker::{BreakerSettings, CircuitBreaker, CircuitSnapshot};
use crate::strategy::rate_limit::BucketStore;
use crate::strategy::retry::RetryStrategy;
use crate::strategy::timeout::TimeoutStrategy;
use crate::telemetry::{PolicyEvent, TelemetryHub};
use crate::Fault;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Identity of one cached pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub endpoint: String,
    pub resource: String,
    pub handles_execution_faults: bool,
}

impl PipelineKey {
    pub fn new(endpoint: &str, resource: &str, handles_execution_faults: bool) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            resource: resource.to_string(),
            handles_execution_faults,
        }
    }
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.handles_execution_faults {
            "fallback"
        } else {
            "plain"
        };
        write!(f, "{}/{}#{}", self.endpoint, self.resource, suffix)
    }
}

/// A built strategy stack. One instance exists per key between registry
/// clears; the breaker it owns is the shard for that key.
pub struct Pipeline {
    key: PipelineKey,
    config: EndpointConfig,
    breaker: CircuitBreaker,
    retry: RetryStrategy,
    timeout: TimeoutStrategy,
    buckets: Arc<BucketStore>,
    telemetry: Arc<TelemetryHub>,
}

impl Pipeline {
    pub(crate) fn new(
        key: PipelineKey,
        config: EndpointConfig,
        isolated: bool,
        buckets: Arc<BucketStore>,
        telemetry: Arc<TelemetryHub>,
    ) -> Self {
        let key_display = key.to_string();
        let breaker = CircuitBreaker::new(
            BreakerSettings {
                failure_threshold: config.failure_threshold,
                sampling_duration: config.failure_sampling_duration,
                minimum_throughput: config.failure_minimum_throughput,
                break_duration: config.failure_break_duration,
            },
            isolated,
            telemetry.clone(),
            key_display.clone(),
        );
        let retry = RetryStrategy::new(
            config.retries,
            config.retry_delay_seed,
            config.retry_delay_maximum,
            telemetry.clone(),
            key_display.clone(),
        );
        let timeout = TimeoutStrategy::new(config.timeout, telemetry.clone(), key_display);
        Self {
            key,
            config,
            breaker,
            retry,
            timeout,
            buckets,
            telemetry,
        }
    }

    pub fn key(&self) -> &PipelineKey {
        &self.key
    }

    pub fn handles_execution_faults(&self) -> bool {
        self.key.handles_execution_faults
    }

    pub fn circuit_snapshot(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    pub(crate) fn isolate(&self) {
        self.breaker.isolate();
    }

    /// Execute the caller's operation through the full strategy stack.
    ///
    /// `action` builds a fresh attempt future each time it is called; retry
    /// invokes it once per attempt.
    pub async fn execute<T, A, Fut>(&self, ctx: &ResilienceContext, action: A) -> Result<T, Fault>
    where
        A: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, Fault>> + Send + 'static,
        T: Send + 'static,
    {
        self.retry
            .execute(ctx, || Box::pin(self.execute_guarded(ctx, &action)))
            .await
    }

    /// One attempt: breaker admission, then the timed, rate-limited call.
    async fn execute_guarded<T, A, Fut>(
        &self,
        ctx: &ResilienceContext,
        action: &A,
    ) -> Result<T, Fault>
    where
        A: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, Fault>> + Send + 'static,
        T: Send + 'static,
    {
        self.breaker.admit(ctx.operation_key())?;

        // Admission before the action future is ever polled: a rejected
        // attempt must not execute the wrapped operation.
        let attempt: BoxFuture<'static, Result<T, Fault>> = if self.buckets.try_acquire(
            &self.key.endpoint,
            ctx.rate_limit_partition(),
            self.config.rate_limit,
            self.config.rate_limit_period,
        ) {
            Box::pin(action())
        } else {
            self.telemetry.emit(
                &self.key.to_string(),
                ctx.operation_key(),
                &PolicyEvent::RateLimitRejected,
            );
            Box::pin(futures::future::ready(Err(Fault::RateLimitRejected)))
        };

        let result = self.timeout.execute(ctx, attempt).await;

        match &result {
            Ok(_) => self.breaker.record_success(ctx.operation_key()),
            // Rate-limit rejections never enter circuit statistics.
            Err(Fault::RateLimitRejected) => {}
            Err(fault) if classify::can_circuit_break(fault) => {
                self.breaker.record_failure(ctx.operation_key())
            }
            Err(_) => self.breaker.record_success(ctx.operation_key()),
        }
        result
    }
}
