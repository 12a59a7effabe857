//! The concurrent record store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use crate::error::{RecorderError, Result};
use crate::models::{
    NewTransaction, RecordFilter, TransactionPhase, TransactionRecord,
};

/// Cap on recorded request/response bodies. Bytes beyond the cap are
/// relayed but not retained; the record is marked truncated.
pub const MAX_RECORDED_BODY: usize = 64 * 1024;

/// Append-only, queryable store of [`TransactionRecord`]s.
///
/// Cheap to clone; clones share the same store. Writers update records
/// incrementally by id, so a later partial update never loses earlier
/// data. After [`clear`](Recorder::clear), updates for ids opened before
/// the clear return [`RecorderError::UnknownId`] and are expected to be
/// dropped by the caller.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    records: Arc<RwLock<BTreeMap<u64, TransactionRecord>>>,
    next_id: Arc<AtomicU64>,
}

impl Recorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new record and returns its correlation id.
    pub fn begin(&self, new: NewTransaction) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = TransactionRecord {
            id,
            host: new.host,
            port: new.port,
            method: new.method,
            target: new.target,
            version: new.version,
            kind: new.kind,
            intercepted: new.intercepted,
            mocked: false,
            request_headers: new.request_headers,
            request_body: Vec::new(),
            request_truncated: false,
            status: None,
            response_headers: Vec::new(),
            response_body: Vec::new(),
            response_truncated: false,
            bytes_up: 0,
            bytes_down: 0,
            started_at: Utc::now(),
            first_byte_at: None,
            completed_at: None,
            phase: TransactionPhase::Pending,
            error: None,
        };
        self.records.write().insert(id, record);
        id
    }

    /// Applies `f` to the record with `id`.
    pub fn update<F>(&self, id: u64, f: F) -> Result<()>
    where
        F: FnOnce(&mut TransactionRecord),
    {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(RecorderError::UnknownId(id))?;
        f(record);
        Ok(())
    }

    /// Appends request body bytes, observing the body cap.
    pub fn append_request_body(&self, id: u64, chunk: &[u8]) {
        let _ = self.update(id, |rec| {
            append_capped(&mut rec.request_body, &mut rec.request_truncated, chunk);
        });
    }

    /// Records the response status and headers, stamping first-byte time.
    pub fn set_response_head(&self, id: u64, status: u16, headers: Vec<(String, String)>) {
        let _ = self.update(id, |rec| {
            rec.status = Some(status);
            rec.response_headers = headers;
            rec.first_byte_at.get_or_insert_with(Utc::now);
        });
    }

    /// Appends response body bytes, observing the body cap.
    pub fn append_response_body(&self, id: u64, chunk: &[u8]) {
        let _ = self.update(id, |rec| {
            rec.first_byte_at.get_or_insert_with(Utc::now);
            append_capped(&mut rec.response_body, &mut rec.response_truncated, chunk);
        });
    }

    /// Marks the record as answered by a rule mock.
    pub fn mark_mocked(&self, id: u64) {
        let _ = self.update(id, |rec| rec.mocked = true);
    }

    /// Adds relayed byte counts for a tunnel record.
    pub fn add_tunnel_bytes(&self, id: u64, up: u64, down: u64) {
        let _ = self.update(id, |rec| {
            rec.bytes_up += up;
            rec.bytes_down += down;
        });
    }

    /// Finalizes a record as completed.
    pub fn finalize(&self, id: u64) {
        let _ = self.update(id, |rec| {
            rec.completed_at = Some(Utc::now());
            rec.phase = TransactionPhase::Completed;
        });
    }

    /// Finalizes a record as failed with `error` as the cause.
    pub fn fail(&self, id: u64, error: impl Into<String>) {
        let error = error.into();
        let _ = self.update(id, |rec| {
            rec.completed_at = Some(Utc::now());
            rec.phase = TransactionPhase::Failed;
            rec.error = Some(error);
        });
    }

    /// Drops all retained records.
    ///
    /// Writers still holding ids from before the clear will see their
    /// subsequent updates dropped; id allocation keeps counting, so a
    /// cleared store never reuses a correlation id.
    pub fn clear(&self) {
        let mut records = self.records.write();
        let dropped = records.len();
        records.clear();
        tracing::debug!(dropped, "recorder cleared");
    }

    /// Returns a snapshot of the records matching `filter`, in id order.
    pub fn query(&self, filter: &RecordFilter) -> Vec<TransactionRecord> {
        self.records
            .read()
            .values()
            .filter(|rec| filter.matches(rec))
            .cloned()
            .collect()
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True when no records are retained.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

fn append_capped(body: &mut Vec<u8>, truncated: &mut bool, chunk: &[u8]) {
    let room = MAX_RECORDED_BODY.saturating_sub(body.len());
    if chunk.len() > room {
        body.extend_from_slice(&chunk[..room]);
        *truncated = true;
    } else {
        body.extend_from_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransactionKind;

    fn open(recorder: &Recorder, host: &str) -> u64 {
        recorder.begin(NewTransaction {
            host: host.into(),
            port: 80,
            method: "GET".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            kind: TransactionKind::Exchange,
            intercepted: false,
            request_headers: vec![("host".into(), host.into())],
        })
    }

    #[test]
    fn begin_assigns_unique_ids() {
        let recorder = Recorder::new();
        let a = open(&recorder, "a.example");
        let b = open(&recorder, "b.example");
        assert_ne!(a, b);
        assert_eq!(recorder.len(), 2);
    }

    #[test]
    fn incremental_updates_keep_earlier_data() {
        let recorder = Recorder::new();
        let id = open(&recorder, "example.com");

        recorder.set_response_head(id, 200, vec![("server".into(), "demo".into())]);
        recorder.append_response_body(id, b"hello ");
        recorder.append_response_body(id, b"world");
        recorder.finalize(id);

        let records = recorder.query(&RecordFilter::default());
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        // Headers recorded at begin survive the later body updates.
        assert_eq!(rec.request_headers.len(), 1);
        assert_eq!(rec.status, Some(200));
        assert_eq!(rec.response_body, b"hello world");
        assert!(rec.first_byte_at.is_some());
        assert!(rec.completed_at.is_some());
        assert_eq!(rec.phase, TransactionPhase::Completed);
    }

    #[test]
    fn body_is_capped_and_marked_truncated() {
        let recorder = Recorder::new();
        let id = open(&recorder, "example.com");

        recorder.append_response_body(id, &vec![0u8; MAX_RECORDED_BODY]);
        recorder.append_response_body(id, b"overflow");

        let rec = recorder.query(&RecordFilter::default()).remove(0);
        assert_eq!(rec.response_body.len(), MAX_RECORDED_BODY);
        assert!(rec.response_truncated);
    }

    #[test]
    fn fail_records_cause() {
        let recorder = Recorder::new();
        let id = open(&recorder, "example.com");
        recorder.fail(id, "connection refused");

        let rec = recorder.query(&RecordFilter::default()).remove(0);
        assert_eq!(rec.phase, TransactionPhase::Failed);
        assert_eq!(rec.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn updates_after_clear_are_dropped() {
        let recorder = Recorder::new();
        let id = open(&recorder, "example.com");
        recorder.clear();

        assert!(matches!(
            recorder.update(id, |_| {}),
            Err(RecorderError::UnknownId(_))
        ));
        // The convenience writers swallow the error.
        recorder.append_response_body(id, b"late");
        assert!(recorder.is_empty());

        // New records keep working and ids are not reused.
        let next = open(&recorder, "example.org");
        assert!(next > id);
    }

    #[test]
    fn query_filters_by_host() {
        let recorder = Recorder::new();
        open(&recorder, "alpha.example");
        open(&recorder, "beta.example");

        let filter = RecordFilter {
            host: Some("alpha".into()),
            ..Default::default()
        };
        let records = recorder.query(&filter);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].host, "alpha.example");
    }

    #[test]
    fn query_returns_snapshot_not_live_view() {
        let recorder = Recorder::new();
        let id = open(&recorder, "example.com");
        let snapshot = recorder.query(&RecordFilter::default());

        recorder.set_response_head(id, 502, Vec::new());
        assert_eq!(snapshot[0].status, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_writers_do_not_lose_updates() {
        let recorder = Recorder::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let recorder = recorder.clone();
            handles.push(tokio::spawn(async move {
                let id = recorder.begin(NewTransaction {
                    host: format!("host-{i}.example"),
                    port: 80,
                    method: "GET".into(),
                    target: "/".into(),
                    version: "HTTP/1.1".into(),
                    kind: TransactionKind::Exchange,
                    intercepted: false,
                    request_headers: Vec::new(),
                });
                recorder.set_response_head(id, 200, Vec::new());
                recorder.finalize(id);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let filter = RecordFilter {
            phase: Some(TransactionPhase::Completed),
            ..Default::default()
        };
        assert_eq!(recorder.query(&filter).len(), 8);
    }
}
