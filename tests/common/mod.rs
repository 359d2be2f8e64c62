//! Shared fixtures for the integration suites.

use callguard::{ApiSettings, EndpointSettings, InMemorySink, ResilienceCore, StaticSource};
use std::sync::Arc;
use std::time::Duration;

/// Endpoint settings tuned for fast tests: generous breaker thresholds,
/// millisecond retry delays, no rate limiting.
pub fn quiet_endpoint() -> EndpointSettings {
    EndpointSettings {
        uri: "https://upstream/api".to_string(),
        timeout: Duration::from_millis(200),
        retries: 0,
        retry_delay_seed: Duration::from_millis(1),
        retry_delay_maximum: Duration::from_millis(5),
        failure_threshold: 0.5,
        failure_sampling_duration: Duration::from_secs(30),
        failure_minimum_throughput: 100,
        failure_break_duration: Duration::from_secs(60),
        rate_limit: 0,
        rate_limit_period: Duration::from_secs(60),
        isolate: false,
    }
}

pub fn settings_with(name: &str, endpoint: EndpointSettings) -> ApiSettings {
    let mut settings = ApiSettings::default();
    settings.api.endpoints.insert(name.to_string(), endpoint);
    settings
}

pub struct Harness {
    pub core: ResilienceCore,
    #[allow(dead_code)]
    pub source: Arc<StaticSource>,
    pub sink: Arc<InMemorySink>,
}

/// Build a core over a mutable in-memory settings source and a counting
/// telemetry sink.
pub async fn harness(name: &str, endpoint: EndpointSettings) -> Harness {
    let source = Arc::new(StaticSource::new(settings_with(name, endpoint)));
    let sink = Arc::new(InMemorySink::new());
    let core = ResilienceCore::with_telemetry(source.clone(), sink.clone())
        .await
        .expect("settings load");
    Harness { core, source, sink }
}
