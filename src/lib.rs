//! # callguard
//!
//! A resilience pipeline engine for outbound dependency calls. Each logical
//! operation a host service issues against an upstream API runs through a
//! composed stack of policies (rate limiting, timeout, circuit breaking,
//! retry, and an optional typed fallback) with per-endpoint, per-resource
//! and per-partition state that survives across calls and invalidates on
//! configuration reload.
//!
//! The crate performs no I/O itself: callers supply the operation as an
//! async action yielding a raw [`UpstreamResponse`]; the pipeline decides
//! admission, deadlines, retries and fault propagation around it.
//!
//! ```no_run
//! use callguard::{CallOptions, ResilienceCore, StaticSource, UpstreamResponse};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(settings: callguard::ApiSettings) -> Result<(), callguard::Fault> {
//! let core = ResilienceCore::new(Arc::new(StaticSource::new(settings))).await?;
//! let movies = core.endpoint("movies");
//! let titles: Vec<String> = movies
//!     .execute(
//!         "caller-token",
//!         "GetMovies",
//!         || async {
//!             // issue the HTTP request here
//!             UpstreamResponse::json(200, reqwest::Method::GET, "https://upstream/movies", &["Heat"])
//!         },
//!         CallOptions::new().with_default_fallback(),
//!         CancellationToken::new(),
//!     )
//!     .await?;
//! # let _ = titles;
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod registry;
pub mod response;
pub mod strategy;
pub mod telemetry;

pub use config::{
    ApiSettings, ConfigError, ConfigStore, EndpointConfig, EndpointSettings, FileSource,
    SettingsSource, StaticSource,
};
pub use context::{ContextPool, ResilienceContext};
pub use error::{ConnectionFaultKind, Fault};
pub use executor::{CallOptions, EndpointExecutor, FallbackValue, ResilienceCore};
pub use pipeline::{Pipeline, PipelineKey};
pub use response::UpstreamResponse;
pub use strategy::circuit_breaker::{CircuitSnapshot, CircuitState};
pub use telemetry::{
    CompositeSink, InMemorySink, LogSink, NoopSink, PolicyEvent, TelemetrySink,
};

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Fault>;
