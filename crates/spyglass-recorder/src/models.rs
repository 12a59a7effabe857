//! Data models for recorded traffic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of exchange a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// A full HTTP request/response exchange (plain or decrypted).
    Exchange,
    /// An opaque CONNECT tunnel; only byte counts and timing are known.
    Tunnel,
}

/// Lifecycle phase of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPhase {
    /// The exchange is still in flight.
    Pending,
    /// The exchange completed normally.
    Completed,
    /// The exchange ended in an error; `error` holds the cause.
    Failed,
}

/// One recorded request/response exchange or tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Correlation id, unique within a recorder instance.
    pub id: u64,
    /// Target host, without port.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Request method; `CONNECT` for tunnels.
    pub method: String,
    /// Path and query (origin-form), or `host:port` for tunnels.
    pub target: String,
    /// HTTP version of the request.
    pub version: String,
    /// Exchange or tunnel.
    pub kind: TransactionKind,
    /// True when the traffic was TLS-terminated by the proxy.
    pub intercepted: bool,
    /// True when the response was produced by a rule mock.
    pub mocked: bool,
    /// Request headers in arrival order.
    pub request_headers: Vec<(String, String)>,
    /// Request body, capped at [`MAX_RECORDED_BODY`](crate::MAX_RECORDED_BODY).
    pub request_body: Vec<u8>,
    /// True when the request body was cut off at the cap.
    pub request_truncated: bool,
    /// Response status, once the first response bytes arrived.
    pub status: Option<u16>,
    /// Response headers.
    pub response_headers: Vec<(String, String)>,
    /// Response body, capped.
    pub response_body: Vec<u8>,
    /// True when the response body was cut off at the cap.
    pub response_truncated: bool,
    /// Bytes relayed client→upstream (tunnels).
    pub bytes_up: u64,
    /// Bytes relayed upstream→client (tunnels).
    pub bytes_down: u64,
    /// When the request was first seen.
    pub started_at: DateTime<Utc>,
    /// When the first response byte arrived.
    pub first_byte_at: Option<DateTime<Utc>>,
    /// When the exchange finished (either way).
    pub completed_at: Option<DateTime<Utc>>,
    /// Lifecycle phase.
    pub phase: TransactionPhase,
    /// Failure cause, for `Failed` records.
    pub error: Option<String>,
}

/// Parameters for opening a new record.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    /// Target host, without port.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Request method.
    pub method: String,
    /// Path and query, or `host:port` for tunnels.
    pub target: String,
    /// HTTP version.
    pub version: String,
    /// Exchange or tunnel.
    pub kind: TransactionKind,
    /// Whether the traffic was TLS-terminated by the proxy.
    pub intercepted: bool,
    /// Request headers.
    pub request_headers: Vec<(String, String)>,
}

/// Filter for [`Recorder::query`](crate::Recorder::query).
///
/// All criteria are optional and conjunctive; the default filter matches
/// every record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Case-insensitive substring match on the host.
    pub host: Option<String>,
    /// Only records started at or after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Only records started strictly before this instant.
    pub to: Option<DateTime<Utc>>,
    /// Only records in this phase.
    pub phase: Option<TransactionPhase>,
}

impl RecordFilter {
    /// Whether `record` satisfies every set criterion.
    pub fn matches(&self, record: &TransactionRecord) -> bool {
        if let Some(host) = &self.host {
            if !record
                .host
                .to_ascii_lowercase()
                .contains(&host.to_ascii_lowercase())
            {
                return false;
            }
        }
        if let Some(from) = self.from {
            if record.started_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.started_at >= to {
                return false;
            }
        }
        if let Some(phase) = self.phase {
            if record.phase != phase {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(host: &str, started_at: DateTime<Utc>) -> TransactionRecord {
        TransactionRecord {
            id: 1,
            host: host.into(),
            port: 443,
            method: "GET".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            kind: TransactionKind::Exchange,
            intercepted: false,
            mocked: false,
            request_headers: Vec::new(),
            request_body: Vec::new(),
            request_truncated: false,
            status: None,
            response_headers: Vec::new(),
            response_body: Vec::new(),
            response_truncated: false,
            bytes_up: 0,
            bytes_down: 0,
            started_at,
            first_byte_at: None,
            completed_at: None,
            phase: TransactionPhase::Pending,
            error: None,
        }
    }

    #[test]
    fn default_filter_matches_everything() {
        let rec = record("example.com", Utc::now());
        assert!(RecordFilter::default().matches(&rec));
    }

    #[test]
    fn host_filter_is_substring_and_case_insensitive() {
        let rec = record("api.Example.com", Utc::now());
        let filter = RecordFilter {
            host: Some("example".into()),
            ..Default::default()
        };
        assert!(filter.matches(&rec));

        let filter = RecordFilter {
            host: Some("other".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&rec));
    }

    #[test]
    fn time_range_is_half_open() {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let rec = record("example.com", t0);

        let filter = RecordFilter {
            from: Some(t0),
            to: Some(t0 + chrono::Duration::seconds(1)),
            ..Default::default()
        };
        assert!(filter.matches(&rec));

        let filter = RecordFilter {
            to: Some(t0),
            ..Default::default()
        };
        assert!(!filter.matches(&rec));
    }

    #[test]
    fn phase_filter_matches_exactly() {
        let rec = record("example.com", Utc::now());
        let filter = RecordFilter {
            phase: Some(TransactionPhase::Failed),
            ..Default::default()
        };
        assert!(!filter.matches(&rec));
    }
}
