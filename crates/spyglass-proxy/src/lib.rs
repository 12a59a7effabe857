//! Spyglass Proxy - an interactive, TLS-capable intercepting proxy.
//!
//! Sits between a client and the internet, terminates or tunnels
//! connections, and can transparently decrypt and re-encrypt HTTPS traffic
//! for inspection or rule-based rewriting.
//!
//! ## Architecture
//!
//! ```text
//! Client ──► ProxyServer (listener) ──► RequestHandler
//!                                            │
//!                         ┌──────────────────┴──────────────────┐
//!                         │ plain request                       │ CONNECT
//!                         ▼                                     ▼
//!                  rule: mock/rewrite?                 intercept this host?
//!                         │                            │               │
//!                         ▼                            │ yes           │ no
//!                  forward upstream          CertificateAuthority   raw tunnel
//!                  (throttled, recorded)      forges a leaf, TLS    (throttled,
//!                                             terminates, stream     recorded)
//!                                             re-enters the pipeline
//! ```
//!
//! The [`Recorder`](spyglass_recorder::Recorder) captures every exchange
//! and tunnel; a [`ThrottleGroup`] caps aggregate bandwidth when
//! configured; the [`TrafficRule`](spyglass_core::TrafficRule) boundary is
//! consulted per request. All three are owned by the [`ProxyServer`] and
//! injected; there is no process-global state.

mod ca;
mod error;
mod handler;
mod monitor;
mod proxy;
mod throttle;
mod tls;

pub use ca::{CertificateAuthority, LeafCert};
pub use error::{
    CertificateError, ConfigError, ProxyError, Result, StateError, UpstreamError,
};
pub use handler::{HandlerConfig, RequestHandler};
pub use monitor::{MonitorContext, MonitorInterface};
pub use proxy::{
    ProxyConfig, ProxyEvent, ProxyKind, ProxyServer, ProxyStatus, WebInterfaceConfig,
};
pub use throttle::{ThrottleGroup, ThrottledStream};

/// Default proxy listen port.
pub const DEFAULT_PROXY_PORT: u16 = 8001;
