//! Keyed cache of built pipelines.
//!
//! Lookups memoise one pipeline per key; the builder runs under the registry
//! lock so concurrent lookups of the same key never build twice. `clear`
//! drops every pipeline (and with them their breakers), drops every rate
//! bucket, resets administrative isolation, and bumps a generation counter.
//! In-flight executions keep the `Arc` they captured and finish on it.

use crate::config::EndpointConfig;
use crate::pipeline::{Pipeline, PipelineKey};
use crate::strategy::rate_limit::BucketStore;
use crate::telemetry::TelemetryHub;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::info;

struct RegistryInner {
    pipelines: HashMap<PipelineKey, Arc<Pipeline>>,
    isolated_endpoints: HashSet<String>,
    generation: u64,
}

pub struct PipelineRegistry {
    inner: Mutex<RegistryInner>,
    buckets: Arc<BucketStore>,
    telemetry: Arc<TelemetryHub>,
}

impl PipelineRegistry {
    pub fn new(buckets: Arc<BucketStore>, telemetry: Arc<TelemetryHub>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                pipelines: HashMap::new(),
                isolated_endpoints: HashSet::new(),
                generation: 0,
            }),
            buckets,
            telemetry,
        }
    }

    /// Return the cached pipeline for the key, building it if absent. The
    /// configuration snapshot is only consulted on a build.
    pub fn get_or_add(&self, key: PipelineKey, config: &EndpointConfig) -> Arc<Pipeline> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(pipeline) = inner.pipelines.get(&key) {
            return pipeline.clone();
        }
        let isolated = config.isolate || inner.isolated_endpoints.contains(&key.endpoint);
        let pipeline = Arc::new(Pipeline::new(
            key.clone(),
            config.clone(),
            isolated,
            self.buckets.clone(),
            self.telemetry.clone(),
        ));
        info!(pipeline_key = %key, isolated, "built resilience pipeline");
        inner.pipelines.insert(key, pipeline.clone());
        pipeline
    }

    /// Force every current and future breaker for the endpoint into the
    /// isolated state, until the next `clear`.
    pub fn isolate(&self, endpoint: &str) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.isolated_endpoints.insert(endpoint.to_string());
        for (key, pipeline) in &inner.pipelines {
            if key.endpoint == endpoint {
                pipeline.isolate();
            }
        }
    }

    /// Drop every cached pipeline, every rate bucket, and all administrative
    /// isolation. Executions already running keep their captured pipeline.
    pub fn clear(&self) {
        let generation = {
            let mut inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.pipelines.clear();
            inner.isolated_endpoints.clear();
            inner.generation += 1;
            inner.generation
        };
        self.buckets.clear();
        info!(generation, "cleared pipeline registry");
    }

    /// Monotonic count of clears, for observing reload boundaries.
    pub fn generation(&self) -> u64 {
        match self.inner.lock() {
            Ok(guard) => guard.generation,
            Err(poisoned) => poisoned.into_inner().generation,
        }
    }

    pub fn pipeline_count(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.pipelines.len(),
            Err(poisoned) => poisoned.into_inner().pipelines.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::circuit_breaker::CircuitState;
    use std::time::Duration;

    fn registry() -> PipelineRegistry {
        PipelineRegistry::new(Arc::new(BucketStore::new()), Arc::new(TelemetryHub::noop()))
    }

    fn config(name: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            uri: "https://upstream/api".to_string(),
            timeout: Duration::from_secs(5),
            retries: 0,
            retry_delay_seed: Duration::from_secs(1),
            retry_delay_maximum: Duration::from_secs(10),
            failure_threshold: 0.5,
            failure_sampling_duration: Duration::from_secs(30),
            failure_minimum_throughput: 2,
            failure_break_duration: Duration::from_secs(60),
            rate_limit: 0,
            rate_limit_period: Duration::from_secs(60),
            isolate: false,
        }
    }

    #[test]
    fn lookups_return_the_same_instance() {
        let registry = registry();
        let key = PipelineKey::new("movies", "GetMovie", false);
        let first = registry.get_or_add(key.clone(), &config("movies"));
        let second = registry.get_or_add(key, &config("movies"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.pipeline_count(), 1);
    }

    #[test]
    fn distinct_keys_get_distinct_pipelines() {
        let registry = registry();
        let plain = registry.get_or_add(
            PipelineKey::new("movies", "GetMovie", false),
            &config("movies"),
        );
        let with_fallback = registry.get_or_add(
            PipelineKey::new("movies", "GetMovie", true),
            &config("movies"),
        );
        let other_resource = registry.get_or_add(
            PipelineKey::new("movies", "GetMovies", false),
            &config("movies"),
        );
        assert!(!Arc::ptr_eq(&plain, &with_fallback));
        assert!(!Arc::ptr_eq(&plain, &other_resource));
        assert_eq!(registry.pipeline_count(), 3);
    }

    #[test]
    fn clear_drops_pipelines_and_bumps_generation() {
        let registry = registry();
        let key = PipelineKey::new("movies", "GetMovie", false);
        let before = registry.get_or_add(key.clone(), &config("movies"));
        assert_eq!(registry.generation(), 0);

        registry.clear();
        assert_eq!(registry.generation(), 1);
        assert_eq!(registry.pipeline_count(), 0);

        let after = registry.get_or_add(key, &config("movies"));
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn config_isolate_starts_the_breaker_isolated() {
        let registry = registry();
        let mut cfg = config("movies");
        cfg.isolate = true;
        let pipeline =
            registry.get_or_add(PipelineKey::new("movies", "GetMovie", false), &cfg);
        assert_eq!(pipeline.circuit_snapshot().state, CircuitState::Isolated);
    }

    #[test]
    fn administrative_isolation_covers_existing_and_new_pipelines() {
        let registry = registry();
        let existing = registry.get_or_add(
            PipelineKey::new("movies", "GetMovie", false),
            &config("movies"),
        );
        registry.isolate("movies");
        assert_eq!(existing.circuit_snapshot().state, CircuitState::Isolated);

        let built_later = registry.get_or_add(
            PipelineKey::new("movies", "GetMovies", false),
            &config("movies"),
        );
        assert_eq!(built_later.circuit_snapshot().state, CircuitState::Isolated);

        // Unrelated endpoints stay closed.
        let other = registry.get_or_add(
            PipelineKey::new("users", "GetUser", false),
            &config("users"),
        );
        assert_eq!(other.circuit_snapshot().state, CircuitState::Closed);
    }

    #[test]
    fn clear_resets_administrative_isolation() {
        let registry = registry();
        registry.isolate("movies");
        registry.clear();
        let pipeline = registry.get_or_add(
            PipelineKey::new("movies", "GetMovie", false),
            &config("movies"),
        );
        assert_eq!(pipeline.circuit_snapshot().state, CircuitState::Closed);
    }
}
