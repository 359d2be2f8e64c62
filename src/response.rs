//! Thin representation of an upstream response.
//!
//! The pipeline performs no I/O itself; the caller's action produces one of
//! these from whatever transport it uses. The executor post-processes it
//! (404/400 short-circuits, ensure-success, body decode) before pipeline
//! classification sees the outcome.

use crate::Fault;
use bytes::Bytes;
use reqwest::{Method, StatusCode};

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub method: Method,
    pub uri: String,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn new(status: u16, method: Method, uri: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            method,
            uri: uri.into(),
            body: body.into(),
        }
    }

    /// Build a response carrying a JSON body, for callers and tests.
    pub fn json<T: serde::Serialize>(
        status: u16,
        method: Method,
        uri: impl Into<String>,
        value: &T,
    ) -> Result<Self, Fault> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(status, method, uri, body))
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Bridge from a live `reqwest` response. Transport errors while reading
    /// the body classify through the standard fault conversion.
    pub async fn from_reqwest(response: reqwest::Response) -> Result<Self, Fault> {
        let status = response.status();
        let uri = response.url().to_string();
        let body = response.bytes().await.map_err(Fault::from)?;
        Ok(Self {
            status,
            // reqwest does not expose the request method on the response;
            // callers that need the idempotency gate should set it.
            method: Method::GET,
            uri,
            body,
        })
    }

    /// Replace the recorded request method (used with `from_reqwest` for
    /// non-GET calls so retry classification stays correct).
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_body_round_trips() {
        let resp =
            UpstreamResponse::json(200, Method::GET, "https://api/movies", &vec![1, 2, 3]).unwrap();
        assert!(resp.is_success());
        let decoded: Vec<i32> = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn non_success_is_reported() {
        let resp = UpstreamResponse::new(502, Method::GET, "https://api/movies", "");
        assert!(!resp.is_success());
        assert_eq!(resp.status.as_u16(), 502);
    }
}
