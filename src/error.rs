//! # Fault Taxonomy
//!
//! This module provides the unified fault type surfaced by every layer of the
//! pipeline. Faults are explicit values, not panics: strategies classify
//! them, the executor propagates them, and the host edge translates them to
//! HTTP responses exactly once.
//!
//! ## Fault Categories
//!
//! | Variant | Description |
//! |---------|-------------|
//! | `Dependency` | Upstream returned a non-success HTTP response |
//! | `Connection` | Transport-level failure before any response |
//! | `TimeoutRejected` | Pipeline deadline fired |
//! | `RateLimitRejected` | Admission denied by the token bucket |
//! | `BrokenCircuit` / `IsolatedCircuit` | Admission denied by breaker state |
//! | `Cancelled` | Cancellation, caller-initiated or not |
//! | `Decode` | Upstream body could not be deserialised |
//! | `Config` | Configuration loading or lookup errors |
//! | `Other` | Anything else; surfaces verbatim |

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// How a connection-level failure was recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFaultKind {
    /// The remote end refused the connection.
    Refused,
    /// Name resolution failed (includes OS error 12007 and the native
    /// WinHTTP code -2147012889 reported by some stacks).
    HostNotFound,
    /// The response ended before the message completed.
    PrematureEof,
    /// A transport failure that fits none of the specific kinds.
    Other,
}

/// Unified fault type for the resilience pipeline.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("upstream returned HTTP {status} for {method} {uri}")]
    Dependency {
        status: u16,
        method: reqwest::Method,
        uri: String,
    },

    #[error("connection fault ({kind:?}): {message}")]
    Connection {
        kind: ConnectionFaultKind,
        message: String,
    },

    #[error("pipeline timeout of {timeout:?} elapsed")]
    TimeoutRejected { timeout: Duration },

    #[error("rate limit admission denied")]
    RateLimitRejected,

    #[error("circuit is open; retry after {retry_after:?}")]
    BrokenCircuit { retry_after: Duration },

    #[error("circuit is isolated by configuration or administrative action")]
    IsolatedCircuit,

    #[error("operation cancelled{}", cancelled_suffix(.by_caller))]
    Cancelled { by_caller: bool },

    #[error("failed to decode upstream body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Other(String),
}

impl Fault {
    /// Build a dependency fault from raw response facts.
    pub fn dependency(status: u16, method: reqwest::Method, uri: impl Into<String>) -> Self {
        Fault::Dependency {
            status,
            method,
            uri: uri.into(),
        }
    }

    /// Build a connection fault with an already-classified kind.
    pub fn connection(kind: ConnectionFaultKind, message: impl Into<String>) -> Self {
        Fault::Connection {
            kind,
            message: message.into(),
        }
    }

    /// The HTTP status the host edge should answer with when this fault
    /// surfaces unhandled.
    ///
    /// Rate-limit rejections map to 429 so callers can shed load; breaker
    /// and timeout rejections map to 503; a surfaced upstream 404 stays 404.
    pub fn http_status(&self) -> u16 {
        match self {
            Fault::RateLimitRejected => 429,
            Fault::BrokenCircuit { .. }
            | Fault::IsolatedCircuit
            | Fault::TimeoutRejected { .. } => 503,
            Fault::Dependency { status: 404, .. } => 404,
            Fault::Dependency { .. } | Fault::Connection { .. } => 502,
            Fault::Cancelled { .. } => 499,
            Fault::Decode(_) | Fault::Config(_) | Fault::Other(_) => 500,
        }
    }

    /// True for admission rejections issued by the pipeline itself rather
    /// than by the upstream call.
    pub fn is_execution_fault(&self) -> bool {
        matches!(
            self,
            Fault::BrokenCircuit { .. } | Fault::IsolatedCircuit | Fault::TimeoutRejected { .. }
        )
    }
}

impl From<reqwest::Error> for Fault {
    /// Classification boundary for transport errors raised inside a caller's
    /// action. Connection-level failures are recognised here so that the
    /// circuit-breaker predicate sees them as a single fault kind.
    fn from(err: reqwest::Error) -> Self {
        let message = full_error_message(&err);
        if let Some(kind) = crate::classify::connection_fault_kind(&message) {
            return Fault::Connection { kind, message };
        }
        if err.is_connect() {
            return Fault::Connection {
                kind: ConnectionFaultKind::Other,
                message,
            };
        }
        if err.is_timeout() {
            // An HTTP-client attempt deadline, not the pipeline's: surfaces
            // as a cancelled task that did not originate from the caller.
            return Fault::Cancelled { by_caller: false };
        }
        Fault::Other(message)
    }
}

fn cancelled_suffix(by_caller: &bool) -> &'static str {
    if *by_caller {
        " by caller"
    } else {
        ""
    }
}

/// Flatten an error and its sources into one searchable message.
fn full_error_message(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(Fault::RateLimitRejected.http_status(), 429);
        assert_eq!(
            Fault::BrokenCircuit {
                retry_after: Duration::from_secs(1)
            }
            .http_status(),
            503
        );
        assert_eq!(Fault::IsolatedCircuit.http_status(), 503);
        assert_eq!(
            Fault::TimeoutRejected {
                timeout: Duration::from_secs(2)
            }
            .http_status(),
            503
        );
        assert_eq!(
            Fault::dependency(404, reqwest::Method::GET, "/movies/9").http_status(),
            404
        );
        assert_eq!(
            Fault::dependency(500, reqwest::Method::GET, "/movies").http_status(),
            502
        );
        assert_eq!(
            Fault::connection(ConnectionFaultKind::Refused, "refused").http_status(),
            502
        );
        assert_eq!(Fault::Cancelled { by_caller: true }.http_status(), 499);
    }

    #[test]
    fn execution_fault_covers_pipeline_rejections_only() {
        assert!(Fault::IsolatedCircuit.is_execution_fault());
        assert!(Fault::TimeoutRejected {
            timeout: Duration::from_secs(1)
        }
        .is_execution_fault());
        assert!(!Fault::RateLimitRejected.is_execution_fault());
        assert!(!Fault::dependency(503, reqwest::Method::GET, "/u").is_execution_fault());
    }

    #[test]
    fn display_carries_call_facts() {
        let fault = Fault::dependency(502, reqwest::Method::GET, "https://api/movies");
        let text = fault.to_string();
        assert!(text.contains("502"));
        assert!(text.contains("GET"));
        assert!(text.contains("https://api/movies"));
    }
}
