//! Public entry point: the resilience core and per-endpoint executors.
//!
//! `ResilienceCore` is the single long-lived service value owning all
//! process-wide mutable state: the settings store, the pipeline registry
//! (and through it every breaker and rate bucket), the telemetry hub and
//! the context pool. Hosts create one core at startup, derive cheap
//! per-endpoint executors from it, and call `reload` when configuration
//! changes.

use crate::config::{ConfigStore, SettingsSource};
use crate::context::ContextPool;
use crate::pipeline::PipelineKey;
use crate::response::UpstreamResponse;
use crate::strategy::fallback::FallbackStrategy;
use crate::strategy::rate_limit::BucketStore;
use crate::telemetry::{NoopSink, TelemetryHub, TelemetrySink};
use crate::Fault;
use crate::registry::PipelineRegistry;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Substitute-value source for a typed fallback.
pub enum FallbackValue<T> {
    /// Use `T::default()`.
    Default,
    /// Produce the value from a generator.
    Generate(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T> Clone for FallbackValue<T> {
    fn clone(&self) -> Self {
        match self {
            FallbackValue::Default => FallbackValue::Default,
            FallbackValue::Generate(generator) => FallbackValue::Generate(generator.clone()),
        }
    }
}

/// Per-call options imposed by the caller.
pub struct CallOptions<T> {
    /// When set, execution faults (broken/isolated circuit, pipeline
    /// timeout) join the fallback's should-handle set. Also part of the
    /// pipeline cache key. Defaults to `false`.
    pub handle_execution_faults: Option<bool>,
    /// Surface upstream 404 as a fault instead of returning the default.
    pub throw_if_not_found: bool,
    /// Invoked on upstream 400; the call then yields the default value.
    pub on_bad_request: Option<Arc<dyn Fn(&UpstreamResponse) + Send + Sync>>,
    /// Enables the typed fallback strategy for this execution.
    pub fallback: Option<FallbackValue<T>>,
}

impl<T> CallOptions<T> {
    pub fn new() -> Self {
        Self {
            handle_execution_faults: None,
            throw_if_not_found: false,
            on_bad_request: None,
            fallback: None,
        }
    }

    pub fn with_handle_execution_faults(mut self, handle: bool) -> Self {
        self.handle_execution_faults = Some(handle);
        self
    }

    pub fn with_throw_if_not_found(mut self, throw: bool) -> Self {
        self.throw_if_not_found = throw;
        self
    }

    pub fn with_on_bad_request(
        mut self,
        callback: impl Fn(&UpstreamResponse) + Send + Sync + 'static,
    ) -> Self {
        self.on_bad_request = Some(Arc::new(callback));
        self
    }

    /// Fall back to `T::default()` on handled faults.
    pub fn with_default_fallback(mut self) -> Self {
        self.fallback = Some(FallbackValue::Default);
        self
    }

    /// Fall back to a generated value on handled faults.
    pub fn with_fallback(mut self, generator: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.fallback = Some(FallbackValue::Generate(Arc::new(generator)));
        self
    }
}

impl<T> Default for CallOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CallOptions<T> {
    fn clone(&self) -> Self {
        Self {
            handle_execution_faults: self.handle_execution_faults,
            throw_if_not_found: self.throw_if_not_found,
            on_bad_request: self.on_bad_request.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

struct CoreInner {
    config: ConfigStore,
    registry: PipelineRegistry,
    telemetry: Arc<TelemetryHub>,
    contexts: ContextPool,
}

/// Process-wide resilience state. Cloning shares the same core.
#[derive(Clone)]
pub struct ResilienceCore {
    inner: Arc<CoreInner>,
}

impl ResilienceCore {
    /// Build a core with no telemetry sink.
    pub async fn new(source: Arc<dyn SettingsSource>) -> Result<Self, Fault> {
        Self::with_telemetry(source, Arc::new(NoopSink)).await
    }

    /// Build a core publishing policy counters to the given sink.
    pub async fn with_telemetry(
        source: Arc<dyn SettingsSource>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self, Fault> {
        let config = ConfigStore::new(source).await?;
        let telemetry = Arc::new(TelemetryHub::new(sink));
        let buckets = Arc::new(BucketStore::new());
        let registry = PipelineRegistry::new(buckets, telemetry.clone());
        Ok(Self {
            inner: Arc::new(CoreInner {
                config,
                registry,
                telemetry,
                contexts: ContextPool::default(),
            }),
        })
    }

    /// A cheap executor handle bound to one named endpoint.
    pub fn endpoint(&self, name: &str) -> EndpointExecutor {
        EndpointExecutor {
            core: self.inner.clone(),
            endpoint: name.to_string(),
        }
    }

    /// Refresh settings from the source and invalidate every cached
    /// pipeline, breaker and rate bucket.
    pub async fn reload(&self) -> Result<(), Fault> {
        self.inner.config.reload().await?;
        self.inner.registry.clear();
        info!(
            generation = self.inner.registry.generation(),
            "configuration reloaded"
        );
        Ok(())
    }

    /// Administratively isolate every circuit of the endpoint until the
    /// next reload.
    pub fn isolate(&self, endpoint: &str) {
        self.inner.registry.isolate(endpoint);
    }

    /// Monotonic count of registry clears.
    pub fn generation(&self) -> u64 {
        self.inner.registry.generation()
    }

    pub fn pipeline_count(&self) -> usize {
        self.inner.registry.pipeline_count()
    }
}

/// Executor for one named endpoint.
#[derive(Clone)]
pub struct EndpointExecutor {
    core: Arc<CoreInner>,
    endpoint: String,
}

impl EndpointExecutor {
    pub fn endpoint_name(&self) -> &str {
        &self.endpoint
    }

    /// Execute one logical operation against the endpoint through its
    /// resilience pipeline.
    ///
    /// `action` builds a fresh attempt future per invocation; it performs
    /// the actual I/O and yields the raw upstream response. The executor
    /// post-processes that response (404/400 short-circuits, ensure-success,
    /// body decode) before the outcome reaches pipeline classification.
    pub async fn execute<T, A, Fut>(
        &self,
        partition: &str,
        operation: &str,
        action: A,
        options: CallOptions<T>,
        cancellation: CancellationToken,
    ) -> Result<T, Fault>
    where
        A: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<UpstreamResponse, Fault>> + Send + 'static,
        T: DeserializeOwned + Default + Send + Sync + 'static,
    {
        let core = &self.core;
        // Per-lookup settings snapshot; pipelines built from it are cached
        // until the next reload.
        let config = core.config.endpoint(&self.endpoint)?;
        let prefix = core.config.operation_prefix();
        let handles_execution_faults = options.handle_execution_faults.unwrap_or(false);
        let key = PipelineKey::new(&self.endpoint, operation, handles_execution_faults);
        let pipeline = core.registry.get_or_add(key, &config);

        let mut ctx = core.contexts.acquire();
        ctx.prepare(
            format!("{prefix}.{operation}"),
            partition,
            cancellation,
        );
        if let Some(FallbackValue::Generate(generator)) = &options.fallback {
            ctx.set_fallback_generator(generator.clone());
        }

        let throw_if_not_found = options.throw_if_not_found;
        let on_bad_request = options.on_bad_request.clone();
        let wrapped = || {
            let attempt = action();
            let on_bad_request = on_bad_request.clone();
            async move {
                let response = attempt.await?;
                finish_response::<T>(response, throw_if_not_found, on_bad_request)
            }
        };

        let result = pipeline.execute(&ctx, wrapped).await;
        let result = if options.fallback.is_some() {
            FallbackStrategy::new(
                handles_execution_faults,
                core.telemetry.clone(),
                pipeline.key().to_string(),
            )
            .apply(&ctx, result)
        } else {
            result
        };
        core.contexts.release(ctx);
        result
    }
}

/// Caller-side response policy, applied inside the wrapped action so the
/// pipeline classifies the finished outcome.
fn finish_response<T>(
    response: UpstreamResponse,
    throw_if_not_found: bool,
    on_bad_request: Option<Arc<dyn Fn(&UpstreamResponse) + Send + Sync>>,
) -> Result<T, Fault>
where
    T: DeserializeOwned + Default,
{
    if response.status == StatusCode::NOT_FOUND && !throw_if_not_found {
        return Ok(T::default());
    }
    if response.status == StatusCode::BAD_REQUEST {
        if let Some(callback) = on_bad_request {
            callback(&response);
            return Ok(T::default());
        }
    }
    if !response.is_success() {
        return Err(Fault::Dependency {
            status: response.status.as_u16(),
            method: response.method.clone(),
            uri: response.uri.clone(),
        });
    }
    Ok(serde_json::from_slice(&response.body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn not_found_short_circuits_to_default() {
        let response = UpstreamResponse::new(404, Method::GET, "https://api/movies/9", "");
        let result: Result<i32, Fault> = finish_response(response, false, None);
        assert_eq!(result.unwrap(), 0);
    }

    #[test]
    fn not_found_surfaces_when_requested() {
        let response = UpstreamResponse::new(404, Method::GET, "https://api/movies/9", "");
        let result: Result<i32, Fault> = finish_response(response, true, None);
        assert!(matches!(
            result,
            Err(Fault::Dependency { status: 404, .. })
        ));
    }

    #[test]
    fn bad_request_invokes_callback_and_defaults() {
        let seen = Arc::new(AtomicU32::new(0));
        let observer = seen.clone();
        let callback: Arc<dyn Fn(&UpstreamResponse) + Send + Sync> = Arc::new(move |_| {
            observer.fetch_add(1, Ordering::SeqCst);
        });
        let response = UpstreamResponse::new(400, Method::POST, "https://api/users", "");
        let result: Result<i32, Fault> = finish_response(response, false, Some(callback));
        assert_eq!(result.unwrap(), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bad_request_without_callback_is_a_fault() {
        let response = UpstreamResponse::new(400, Method::POST, "https://api/users", "");
        let result: Result<i32, Fault> = finish_response(response, false, None);
        assert!(matches!(
            result,
            Err(Fault::Dependency { status: 400, .. })
        ));
    }

    #[test]
    fn success_decodes_the_body() {
        let response =
            UpstreamResponse::json(200, Method::GET, "https://api/movies/9", &42i32).unwrap();
        let result: Result<i32, Fault> = finish_response(response, false, None);
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn undecodable_body_is_a_decode_fault() {
        let response = UpstreamResponse::new(200, Method::GET, "https://api/movies/9", "not-json");
        let result: Result<i32, Fault> = finish_response(response, false, None);
        assert!(matches!(result, Err(Fault::Decode(_))));
    }
}
