//! The rule capability set consumed by the request pipeline.
//!
//! A rule sees a summary of each request and may ask for the request to be
//! rewritten before forwarding, or answered locally with a mocked response.
//! For CONNECT tunnels it additionally decides whether the proxy should
//! terminate TLS and inspect the decrypted traffic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Summary of a request as seen by the rule boundary.
///
/// Bodies are capped by the pipeline before the summary is built, so rule
/// implementations never see unbounded payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSummary {
    /// Request method (`GET`, `POST`, ...).
    pub method: String,
    /// Path and query, origin-form.
    pub target: String,
    /// Target host, without port.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// True when the request arrived on a decrypted (intercepted) stream.
    pub tls: bool,
    /// Request headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Request body, possibly truncated.
    pub body: Vec<u8>,
}

impl RequestSummary {
    /// Returns the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Scheme-qualified URL of the request.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.target)
    }
}

/// A rewrite applied to a request before it is forwarded upstream.
///
/// Fields left as `None` (or empty) keep the original value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestRewrite {
    /// Replacement path and query.
    pub target: Option<String>,
    /// Headers to set, replacing any existing value of the same name.
    pub set_headers: Vec<(String, String)>,
    /// Header names to remove.
    pub remove_headers: Vec<String>,
    /// Replacement body.
    pub body: Option<Vec<u8>>,
}

/// A response produced locally instead of contacting the upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockResponse {
    /// Response status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl MockResponse {
    /// Creates a plain-text mock with the given status.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "text/plain; charset=utf-8".into())],
            body: body.into().into_bytes(),
        }
    }
}

/// The rule's decision for a single request.
#[derive(Debug, Clone, Default)]
pub struct RuleVerdict {
    /// Optional rewrite applied before forwarding.
    pub rewrite: Option<RequestRewrite>,
    /// Optional mocked response; when present the upstream is never
    /// contacted and `rewrite` is ignored.
    pub mock: Option<MockResponse>,
}

impl RuleVerdict {
    /// Forward the request unchanged.
    pub fn forward() -> Self {
        Self::default()
    }

    /// Answer locally with `mock`.
    pub fn mocked(mock: MockResponse) -> Self {
        Self {
            rewrite: None,
            mock: Some(mock),
        }
    }

    /// Forward after applying `rewrite`.
    pub fn rewritten(rewrite: RequestRewrite) -> Self {
        Self {
            rewrite: Some(rewrite),
            mock: None,
        }
    }
}

/// The capability interface consulted by the proxy per request.
///
/// Implementations must be callable concurrently and should not block
/// indefinitely; the pipeline awaits these calls on the connection task.
#[async_trait]
pub trait TrafficRule: Send + Sync {
    /// Whether a CONNECT to `host` should be intercepted (TLS terminated
    /// and the decrypted stream inspected) rather than tunneled opaquely.
    ///
    /// The pipeline also intercepts unconditionally when the proxy was
    /// configured with forced HTTPS interception; this hook only adds
    /// hosts on top of that.
    async fn intercept_tls(&self, host: &str) -> bool {
        let _ = host;
        false
    }

    /// Inspect a request and decide how the pipeline should treat it.
    async fn inspect_request(&self, request: &RequestSummary) -> RuleVerdict {
        let _ = request;
        RuleVerdict::forward()
    }
}

/// Rule that forwards everything untouched and intercepts nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRule;

#[async_trait]
impl TrafficRule for PassthroughRule {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_header_lookup_is_case_insensitive() {
        let summary = RequestSummary {
            method: "GET".into(),
            target: "/".into(),
            host: "example.com".into(),
            port: 80,
            tls: false,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: Vec::new(),
        };
        assert_eq!(summary.header("content-type"), Some("text/plain"));
        assert_eq!(summary.header("accept"), None);
    }

    #[test]
    fn summary_url_uses_scheme_from_tls_flag() {
        let mut summary = RequestSummary {
            method: "GET".into(),
            target: "/index.html".into(),
            host: "example.com".into(),
            port: 8443,
            tls: true,
            headers: Vec::new(),
            body: Vec::new(),
        };
        assert_eq!(summary.url(), "https://example.com:8443/index.html");
        summary.tls = false;
        assert_eq!(summary.url(), "http://example.com:8443/index.html");
    }

    #[tokio::test]
    async fn passthrough_rule_forwards_everything() {
        let rule = PassthroughRule;
        assert!(!rule.intercept_tls("example.com").await);

        let summary = RequestSummary {
            method: "POST".into(),
            target: "/api".into(),
            host: "example.com".into(),
            port: 443,
            tls: true,
            headers: Vec::new(),
            body: b"payload".to_vec(),
        };
        let verdict = rule.inspect_request(&summary).await;
        assert!(verdict.mock.is_none());
        assert!(verdict.rewrite.is_none());
    }

    #[test]
    fn mock_text_sets_content_type() {
        let mock = MockResponse::text(404, "not here");
        assert_eq!(mock.status, 404);
        assert_eq!(mock.headers.len(), 1);
        assert_eq!(mock.body, b"not here");
    }
}
