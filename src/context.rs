//! Per-invocation resilience context and its pool.
//!
//! A context carries the facts a single execution needs: the operation key
//! used for metrics and logs, the rate-limit partition, the caller's
//! cancellation token, and a typed property bag holding the optional
//! fallback generator. Contexts are pooled; `reset` scrubs one before reuse.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const FALLBACK_GENERATOR_KEY: &str = "fallback.generator";

/// Type-erased property storage with typed accessors.
#[derive(Default)]
pub struct PropertyBag {
    entries: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl PropertyBag {
    pub fn set<V: Any + Send + Sync>(&mut self, key: &'static str, value: V) {
        self.entries.insert(key, Box::new(value));
    }

    pub fn get<V: Any + Send + Sync>(&self, key: &'static str) -> Option<&V> {
        self.entries.get(key).and_then(|v| v.downcast_ref::<V>())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The per-execution property bag threaded through every strategy.
pub struct ResilienceContext {
    operation_key: String,
    rate_limit_partition: String,
    cancellation: CancellationToken,
    properties: PropertyBag,
}

impl ResilienceContext {
    pub fn new() -> Self {
        Self {
            operation_key: String::new(),
            rate_limit_partition: String::new(),
            cancellation: CancellationToken::new(),
            properties: PropertyBag::default(),
        }
    }

    /// Populate the context for one execution.
    pub fn prepare(
        &mut self,
        operation_key: String,
        rate_limit_partition: &str,
        cancellation: CancellationToken,
    ) {
        self.operation_key = operation_key;
        self.rate_limit_partition = rate_limit_partition.to_string();
        self.cancellation = cancellation;
    }

    pub fn operation_key(&self) -> &str {
        &self.operation_key
    }

    pub fn rate_limit_partition(&self) -> &str {
        &self.rate_limit_partition
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Attach a typed fallback generator for this execution.
    pub fn set_fallback_generator<T: Send + Sync + 'static>(
        &mut self,
        generator: Arc<dyn Fn() -> T + Send + Sync>,
    ) {
        self.properties.set(FALLBACK_GENERATOR_KEY, generator);
    }

    /// The typed fallback generator, if one was attached for `T`.
    pub fn fallback_generator<T: Send + Sync + 'static>(
        &self,
    ) -> Option<Arc<dyn Fn() -> T + Send + Sync>> {
        self.properties
            .get::<Arc<dyn Fn() -> T + Send + Sync>>(FALLBACK_GENERATOR_KEY)
            .cloned()
    }

    /// Scrub all per-execution state before the context returns to the pool.
    fn reset(&mut self) {
        self.operation_key.clear();
        self.rate_limit_partition.clear();
        self.cancellation = CancellationToken::new();
        self.properties.clear();
    }
}

impl Default for ResilienceContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded pool of contexts, reused across executions.
pub struct ContextPool {
    slots: Mutex<Vec<ResilienceContext>>,
    max_pooled: usize,
}

impl ContextPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    pub fn acquire(&self) -> ResilienceContext {
        self.slots
            .lock()
            .ok()
            .and_then(|mut slots| slots.pop())
            .unwrap_or_default()
    }

    pub fn release(&self, mut ctx: ResilienceContext) {
        ctx.reset();
        if let Ok(mut slots) = self.slots.lock() {
            if slots.len() < self.max_pooled {
                slots.push(ctx);
            }
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_fallback_slot_round_trips() {
        let mut ctx = ResilienceContext::new();
        assert!(ctx.fallback_generator::<i32>().is_none());

        let generator: Arc<dyn Fn() -> i32 + Send + Sync> = Arc::new(|| 7);
        ctx.set_fallback_generator(generator);
        assert_eq!(ctx.fallback_generator::<i32>().map(|g| g()), Some(7));
        // A lookup at a different type misses rather than panicking.
        assert!(ctx.fallback_generator::<String>().is_none());
    }

    #[test]
    fn pool_scrubs_released_contexts() {
        let pool = ContextPool::new(4);
        let mut ctx = pool.acquire();
        ctx.prepare(
            "Api.GetMovie".to_string(),
            "tok-1",
            CancellationToken::new(),
        );
        let generator: Arc<dyn Fn() -> i32 + Send + Sync> = Arc::new(|| 1);
        ctx.set_fallback_generator(generator);
        pool.release(ctx);
        assert_eq!(pool.pooled(), 1);

        let reused = pool.acquire();
        assert!(reused.operation_key().is_empty());
        assert!(reused.rate_limit_partition().is_empty());
        assert!(reused.fallback_generator::<i32>().is_none());
    }

    #[test]
    fn pool_is_bounded() {
        let pool = ContextPool::new(1);
        let first = pool.acquire();
        let second = pool.acquire();
        pool.release(first);
        pool.release(second);
        assert_eq!(pool.pooled(), 1);
    }
}
