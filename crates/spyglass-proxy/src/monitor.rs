//! Monitoring-interface boundary.
//!
//! A web/monitoring UI is an external collaborator; the core only knows how
//! to start and stop one at the right lifecycle points and what to hand it:
//! a read-only recorder handle and the configured ports. Implementations
//! live outside this crate.

use async_trait::async_trait;

use spyglass_recorder::Recorder;

use crate::error::Result;

/// What a monitoring interface gets handed when the server starts it.
#[derive(Debug, Clone)]
pub struct MonitorContext {
    /// Query access to the server's recorder.
    pub recorder: Recorder,
    /// HTTP port the interface should listen on.
    pub web_port: u16,
    /// Optional websocket port for live updates.
    pub ws_port: Option<u16>,
}

/// A pluggable monitoring interface started alongside the proxy.
#[async_trait]
pub trait MonitorInterface: Send + Sync {
    /// Starts the interface. A failure here fails the whole proxy start.
    async fn start(&self, ctx: MonitorContext) -> Result<()>;

    /// Stops the interface. Called from `ProxyServer::close`; must be
    /// idempotent.
    async fn close(&self);
}
