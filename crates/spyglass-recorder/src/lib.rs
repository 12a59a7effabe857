//! Spyglass Recorder - append-only, queryable store of proxied traffic.
//!
//! Every exchange the proxy handles (plain requests, intercepted HTTPS
//! requests, opaque CONNECT tunnels, mocked responses) becomes a
//! [`TransactionRecord`]. Records are created when a request begins, filled
//! in incrementally as bytes arrive, and finalized when the exchange
//! completes or errors. The store is safe under concurrent writers; the
//! query surface hands out snapshots, never live views.
//!
//! # Example
//!
//! ```
//! use spyglass_recorder::{NewTransaction, RecordFilter, Recorder, TransactionKind};
//!
//! let recorder = Recorder::new();
//! let id = recorder.begin(NewTransaction {
//!     host: "example.com".into(),
//!     port: 80,
//!     method: "GET".into(),
//!     target: "/".into(),
//!     version: "HTTP/1.1".into(),
//!     kind: TransactionKind::Exchange,
//!     intercepted: false,
//!     request_headers: Vec::new(),
//! });
//! recorder.set_response_head(id, 200, vec![("server".into(), "demo".into())]);
//! recorder.finalize(id);
//!
//! let records = recorder.query(&RecordFilter::default());
//! assert_eq!(records.len(), 1);
//! ```

pub mod error;
pub mod models;
mod store;

pub use error::{RecorderError, Result};
pub use models::{
    NewTransaction, RecordFilter, TransactionKind, TransactionPhase, TransactionRecord,
};
pub use store::{Recorder, MAX_RECORDED_BODY};
