//! Fault classification predicates.
//!
//! Pure functions deciding how a fault participates in each strategy: whether
//! it may trip the circuit breaker, whether it is worth retrying, and whether
//! a raw transport message describes a connection-level failure.

use crate::error::{ConnectionFaultKind, Fault};
use reqwest::Method;

/// HTTP statuses worth a retry for idempotent requests.
const RETRYABLE_STATUSES: [u16; 4] = [408, 502, 503, 504];

/// OS error code for "host not found" on Windows name resolution.
const HOST_NOT_FOUND_OS_CODE: &str = "12007";

/// Native WinHTTP HRESULT for the same condition, seen on some stacks.
const HOST_NOT_FOUND_NATIVE_CODE: &str = "-2147012889";

/// Whether a fault counts as a failure in circuit-breaker statistics.
///
/// Server errors and request timeouts (408), connection faults, pipeline
/// timeouts, and cancellations the caller did not ask for are all evidence
/// that the dependency is unhealthy. Caller-initiated cancellation is not.
pub fn can_circuit_break(fault: &Fault) -> bool {
    match fault {
        Fault::Dependency { status, .. } => *status >= 500 || *status == 408,
        Fault::Connection { .. } => true,
        Fault::TimeoutRejected { .. } => true,
        Fault::Cancelled { by_caller } => !by_caller,
        _ => false,
    }
}

/// Whether a fault should trigger another attempt.
///
/// Gated on GET: a non-idempotent request is never re-executed, whatever the
/// status says. Cancellations not initiated by the caller (an inner client
/// deadline) are retried regardless of method because no request body was
/// consumed by a response.
pub fn can_retry(fault: &Fault) -> bool {
    match fault {
        Fault::Dependency { status, method, .. } => {
            *method == Method::GET && RETRYABLE_STATUSES.contains(status)
        }
        Fault::Cancelled { by_caller } => !by_caller,
        _ => false,
    }
}

/// Recognise a connection-level failure from a flattened transport error
/// message. Returns `None` when the message matches no known condition.
pub fn connection_fault_kind(message: &str) -> Option<ConnectionFaultKind> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("connection refused") {
        return Some(ConnectionFaultKind::Refused);
    }
    if lower.contains("no such host is known")
        || lower.contains("failed to lookup address")
        || lower.contains("dns error")
        || lower.contains(HOST_NOT_FOUND_OS_CODE)
        || lower.contains(HOST_NOT_FOUND_NATIVE_CODE)
    {
        return Some(ConnectionFaultKind::HostNotFound);
    }
    if lower.contains("response ended prematurely")
        || lower.contains("connection closed before message completed")
    {
        return Some(ConnectionFaultKind::PrematureEof);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dep(status: u16, method: Method) -> Fault {
        Fault::dependency(status, method, "https://api/things")
    }

    #[test]
    fn circuit_breaks_on_server_errors_and_request_timeout() {
        assert!(can_circuit_break(&dep(500, Method::GET)));
        assert!(can_circuit_break(&dep(503, Method::POST)));
        assert!(can_circuit_break(&dep(408, Method::GET)));
        assert!(!can_circuit_break(&dep(404, Method::GET)));
        assert!(!can_circuit_break(&dep(400, Method::GET)));
    }

    #[test]
    fn circuit_breaks_on_infrastructure_faults() {
        assert!(can_circuit_break(&Fault::connection(
            ConnectionFaultKind::Refused,
            "connection refused"
        )));
        assert!(can_circuit_break(&Fault::TimeoutRejected {
            timeout: Duration::from_secs(2)
        }));
        assert!(can_circuit_break(&Fault::Cancelled { by_caller: false }));
        assert!(!can_circuit_break(&Fault::Cancelled { by_caller: true }));
        assert!(!can_circuit_break(&Fault::RateLimitRejected));
    }

    #[test]
    fn retry_requires_get_and_transient_status() {
        assert!(can_retry(&dep(502, Method::GET)));
        assert!(can_retry(&dep(503, Method::GET)));
        assert!(can_retry(&dep(504, Method::GET)));
        assert!(can_retry(&dep(408, Method::GET)));
        assert!(!can_retry(&dep(500, Method::GET)));
        assert!(!can_retry(&dep(502, Method::POST)));
        assert!(!can_retry(&dep(503, Method::DELETE)));
    }

    #[test]
    fn retry_covers_non_caller_cancellation_only() {
        assert!(can_retry(&Fault::Cancelled { by_caller: false }));
        assert!(!can_retry(&Fault::Cancelled { by_caller: true }));
        assert!(!can_retry(&Fault::RateLimitRejected));
        assert!(!can_retry(&Fault::BrokenCircuit {
            retry_after: Duration::from_secs(1)
        }));
    }

    #[test]
    fn connection_messages_are_recognised() {
        assert_eq!(
            connection_fault_kind("tcp connect error: Connection refused (os error 111)"),
            Some(ConnectionFaultKind::Refused)
        );
        assert_eq!(
            connection_fault_kind("dns error: failed to lookup address information"),
            Some(ConnectionFaultKind::HostNotFound)
        );
        assert_eq!(
            connection_fault_kind("No such host is known. (os error 12007)"),
            Some(ConnectionFaultKind::HostNotFound)
        );
        assert_eq!(
            connection_fault_kind("native error -2147012889"),
            Some(ConnectionFaultKind::HostNotFound)
        );
        assert_eq!(
            connection_fault_kind("The response ended prematurely."),
            Some(ConnectionFaultKind::PrematureEof)
        );
        assert_eq!(
            connection_fault_kind("connection closed before message completed"),
            Some(ConnectionFaultKind::PrematureEof)
        );
        assert_eq!(connection_fault_kind("status 500"), None);
    }
}
