//! Policy telemetry.
//!
//! Every strategy event publishes a counter named
//! `polly.<strategy>.<event>.<operationKey>` (operation key lower-cased)
//! through a [`TelemetrySink`], and writes a structured log record with the
//! strategy-specific fields. Sinks are pluggable:
//!
//! | Sink | Description |
//! |------|-------------|
//! | [`NoopSink`] | Default; discards everything |
//! | [`InMemorySink`] | Counter map for tests and diagnostics |
//! | [`LogSink`] | Mirrors every increment to `tracing` |
//! | [`CompositeSink`] | Fans out to multiple sinks |

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// A strategy event worth counting.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    RetryAttempt { attempt: u32, delay: Duration },
    TimeoutOccurred { timeout: Duration },
    CircuitOpened { break_duration: Duration },
    CircuitClosed,
    RateLimitRejected,
    FallbackUsed,
}

impl PolicyEvent {
    /// Counter name for this event under the given operation key.
    pub fn counter_name(&self, operation_key: &str) -> String {
        let key = operation_key.to_ascii_lowercase();
        match self {
            PolicyEvent::RetryAttempt { attempt, .. } => {
                format!("polly.retry.on-retry.{attempt}.{key}")
            }
            PolicyEvent::TimeoutOccurred { .. } => format!("polly.timeout.on-timeout.{key}"),
            PolicyEvent::CircuitOpened { .. } => format!("polly.circuitbreaker.on-opened.{key}"),
            PolicyEvent::CircuitClosed => format!("polly.circuitbreaker.on-closed.{key}"),
            PolicyEvent::RateLimitRejected => {
                format!("polly.ratelimiter.on-rate-limiter-rejected.{key}")
            }
            PolicyEvent::FallbackUsed => format!("polly.fallback.on-fallback.{key}"),
        }
    }
}

/// Destination for policy counters.
pub trait TelemetrySink: Send + Sync {
    fn increment(&self, counter: &str);
}

/// Discards all events.
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn increment(&self, _counter: &str) {}
}

/// Counter map for tests and diagnostics.
#[derive(Default)]
pub struct InMemorySink {
    counters: Mutex<HashMap<String, u64>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, counter: &str) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|c| c.get(counter).copied())
            .unwrap_or(0)
    }

    /// Sum of every counter starting with `prefix`.
    pub fn count_by_prefix(&self, prefix: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| {
                c.iter()
                    .filter(|(name, _)| name.starts_with(prefix))
                    .map(|(_, value)| value)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for InMemorySink {
    fn increment(&self, counter: &str) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(counter.to_string()).or_insert(0) += 1;
        }
    }
}

/// Mirrors increments to `tracing` at debug level.
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn increment(&self, counter: &str) {
        debug!(counter, "policy counter incremented");
    }
}

/// Fans out to multiple sinks.
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl CompositeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl TelemetrySink for CompositeSink {
    fn increment(&self, counter: &str) {
        for sink in &self.sinks {
            sink.increment(counter);
        }
    }
}

/// Shared emission point handed to every strategy. Publishes the counter and
/// a structured log record per event.
pub struct TelemetryHub {
    sink: Arc<dyn TelemetrySink>,
}

impl TelemetryHub {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    pub fn emit(&self, pipeline_key: &str, operation_key: &str, event: &PolicyEvent) {
        self.sink.increment(&event.counter_name(operation_key));
        match event {
            PolicyEvent::RetryAttempt { attempt, delay } => debug!(
                pipeline_key,
                operation_key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after classified fault"
            ),
            PolicyEvent::TimeoutOccurred { timeout } => warn!(
                pipeline_key,
                operation_key,
                timeout_ms = timeout.as_millis() as u64,
                "pipeline timeout elapsed; abandoning attempt"
            ),
            PolicyEvent::CircuitOpened { break_duration } => warn!(
                pipeline_key,
                operation_key,
                break_ms = break_duration.as_millis() as u64,
                "circuit opened"
            ),
            PolicyEvent::CircuitClosed => {
                debug!(pipeline_key, operation_key, "circuit closed")
            }
            PolicyEvent::RateLimitRejected => debug!(
                pipeline_key,
                operation_key, "rate limit admission rejected"
            ),
            PolicyEvent::FallbackUsed => warn!(
                pipeline_key,
                operation_key, "fallback value substituted for fault"
            ),
        }
    }
}
