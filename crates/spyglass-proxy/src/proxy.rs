//! Proxy server lifecycle.
//!
//! [`ProxyServer`] owns the listener, the recorder, the optional throttle
//! group and the request handler, and walks a strict `INIT → READY →
//! CLOSED` state machine. Collaborators observe lifecycle transitions
//! through broadcast [`ProxyEvent`]s instead of polling.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use spyglass_core::{PassthroughRule, TrafficRule};
use spyglass_recorder::Recorder;

use crate::ca::CertificateAuthority;
use crate::error::{ConfigError, ProxyError, Result, StateError};
use crate::handler::{HandlerConfig, RequestHandler};
use crate::monitor::{MonitorContext, MonitorInterface};
use crate::throttle::ThrottleGroup;

/// Whether the proxy's own listener speaks plain HTTP or TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// Plain HTTP listener (the common case; HTTPS traffic still flows
    /// through it via CONNECT).
    #[default]
    Http,
    /// The listener itself terminates TLS with a certificate for the
    /// configured hostname.
    Https,
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyKind::Http => write!(f, "http"),
            ProxyKind::Https => write!(f, "https"),
        }
    }
}

/// Configuration for the optional monitoring interface.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct WebInterfaceConfig {
    /// Whether to start the interface at all.
    pub enable: bool,
    /// HTTP port of the interface.
    pub web_port: u16,
    /// Optional websocket port.
    pub ws_port: Option<u16>,
}

/// Immutable proxy configuration, captured at construction.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Listen port. Required; `0` means missing.
    pub port: u16,
    /// Listener flavor.
    pub kind: ProxyKind,
    /// Hostname the listener's own certificate is issued for. Required
    /// for [`ProxyKind::Https`].
    pub hostname: Option<String>,
    /// Monitoring interface settings.
    pub web_interface: Option<WebInterfaceConfig>,
    /// Aggregate bandwidth cap in KB/s. Must be positive when set.
    pub throttle_kbps: Option<u64>,
    /// Intercept every CONNECT instead of asking the rule per host.
    pub force_intercept_https: bool,
    /// Skip upstream certificate verification (explicit opt-in).
    pub ignore_upstream_tls_errors: bool,
    /// Suppress informational logging.
    pub silent: bool,
    /// The traffic rule consulted per request.
    pub rule: Arc<dyn TrafficRule>,
}

impl ProxyConfig {
    /// Creates a config listening on `port` with passthrough defaults.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            kind: ProxyKind::default(),
            hostname: None,
            web_interface: None,
            throttle_kbps: None,
            force_intercept_https: false,
            ignore_upstream_tls_errors: false,
            silent: false,
            rule: Arc::new(PassthroughRule),
        }
    }

    /// Sets the listener flavor.
    pub fn with_kind(mut self, kind: ProxyKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the hostname for an https-type listener.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Enables the monitoring interface.
    pub fn with_web_interface(mut self, web: WebInterfaceConfig) -> Self {
        self.web_interface = Some(web);
        self
    }

    /// Caps aggregate throughput at `kbps` KB/s.
    pub fn with_throttle(mut self, kbps: u64) -> Self {
        self.throttle_kbps = Some(kbps);
        self
    }

    /// Intercepts every CONNECT.
    pub fn with_force_intercept_https(mut self, force: bool) -> Self {
        self.force_intercept_https = force;
        self
    }

    /// Disables upstream certificate verification.
    pub fn with_ignore_upstream_tls_errors(mut self, ignore: bool) -> Self {
        self.ignore_upstream_tls_errors = ignore;
        self
    }

    /// Suppresses informational logging.
    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Sets the traffic rule.
    pub fn with_rule(mut self, rule: Arc<dyn TrafficRule>) -> Self {
        self.rule = rule;
        self
    }
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("port", &self.port)
            .field("kind", &self.kind)
            .field("hostname", &self.hostname)
            .field("web_interface", &self.web_interface)
            .field("throttle_kbps", &self.throttle_kbps)
            .field("force_intercept_https", &self.force_intercept_https)
            .field("ignore_upstream_tls_errors", &self.ignore_upstream_tls_errors)
            .field("silent", &self.silent)
            .finish()
    }
}

/// Lifecycle state of a [`ProxyServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// Constructed, not yet started.
    Init,
    /// Listener bound, accepting connections.
    Ready,
    /// Closed; terminal.
    Closed,
}

impl ProxyStatus {
    fn as_str(self) -> &'static str {
        match self {
            ProxyStatus::Init => "INIT",
            ProxyStatus::Ready => "READY",
            ProxyStatus::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events broadcast to collaborators.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    /// `start()` completed; the listener is accepting.
    Ready,
    /// `start()` failed with this cause.
    Error(String),
    /// The server was closed.
    Closed,
}

struct ServerState {
    status: ProxyStatus,
    starting: bool,
    poisoned: bool,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// The proxy server: lifecycle, listener, and owned collaborators.
///
/// Owns the recorder and throttle group and injects them where needed;
/// there is no process-global state, so multiple servers per process are
/// fine. A failed `start()` poisons the instance (no retry); `close()` is
/// terminal and idempotent, and lets in-flight connections drain naturally
/// while refusing new ones.
pub struct ProxyServer {
    config: ProxyConfig,
    ca: Arc<CertificateAuthority>,
    handler: Arc<RequestHandler>,
    recorder: Recorder,
    throttle: Option<Arc<ThrottleGroup>>,
    monitor: Option<Arc<dyn MonitorInterface>>,
    state: Mutex<ServerState>,
    events: broadcast::Sender<ProxyEvent>,
    shutdown: broadcast::Sender<()>,
}

impl ProxyServer {
    /// Validates `config` and builds the server in `INIT`.
    ///
    /// Fails with a [`ConfigError`] naming the violated invariant: missing
    /// port, missing hostname for an https listener, non-positive
    /// throttle, or forced interception without root CA material.
    pub fn new(config: ProxyConfig, ca: Arc<CertificateAuthority>) -> Result<Self> {
        if config.force_intercept_https && !ca.root_exists() {
            return Err(ConfigError::RootCaMissing.into());
        }
        if config.kind == ProxyKind::Https && config.hostname.is_none() {
            return Err(ConfigError::MissingHostname.into());
        }
        if config.port == 0 {
            return Err(ConfigError::MissingPort.into());
        }

        let throttle = match config.throttle_kbps {
            Some(0) => return Err(ConfigError::InvalidThrottle.into()),
            Some(kbps) => {
                if !config.silent {
                    tracing::info!(rate_kbps = kbps, "bandwidth throttle enabled");
                }
                Some(Arc::new(ThrottleGroup::new(kbps)))
            }
            None => None,
        };

        let recorder = Recorder::new();
        let handler = Arc::new(RequestHandler::new(
            HandlerConfig {
                force_intercept_https: config.force_intercept_https,
                ignore_upstream_tls_errors: config.ignore_upstream_tls_errors,
            },
            Arc::clone(&ca),
            Arc::clone(&config.rule),
            recorder.clone(),
            throttle.clone(),
        ));

        let (events, _) = broadcast::channel(16);
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            config,
            ca,
            handler,
            recorder,
            throttle,
            monitor: None,
            state: Mutex::new(ServerState {
                status: ProxyStatus::Init,
                starting: false,
                poisoned: false,
                accept_task: None,
                local_addr: None,
            }),
            events,
            shutdown,
        })
    }

    /// Attaches a monitoring interface; must happen before `start()`.
    pub fn with_monitor(mut self, monitor: Arc<dyn MonitorInterface>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ProxyStatus {
        self.state.lock().status
    }

    /// Query access to the server's recorder, for collaborators.
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// The certificate authority backing interception.
    pub fn certificate_authority(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// The configuration this server was built from.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Address the listener is bound to, once `READY`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().local_addr
    }

    /// Subscribes to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// Atomically replaces the active traffic rule.
    pub fn reload_rule(&self, rule: Arc<dyn TrafficRule>) {
        self.handler.reload_rule(rule);
    }

    /// Starts the server: certificate material first, then the listener,
    /// then the optional monitoring interface. Emits `Ready` on success
    /// or `Error` on the first failing step; a failure poisons the
    /// instance and a fresh one must be built.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.poisoned {
                return Err(StateError::Poisoned.into());
            }
            if state.starting {
                return Err(StateError::NotInit { status: "STARTING" }.into());
            }
            if state.status != ProxyStatus::Init {
                return Err(StateError::NotInit {
                    status: state.status.as_str(),
                }
                .into());
            }
            state.starting = true;
        }

        match self.start_inner().await {
            Ok(addr) => {
                {
                    let mut state = self.state.lock();
                    state.starting = false;
                    state.status = ProxyStatus::Ready;
                    state.local_addr = Some(addr);
                }
                if !self.config.silent {
                    tracing::info!(kind = %self.config.kind, %addr, "proxy started");
                }
                let _ = self.events.send(ProxyEvent::Ready);
                Ok(())
            }
            Err(e) => {
                // Unwind a partially started listener; the instance stays
                // poisoned either way.
                let _ = self.shutdown.send(());
                {
                    let mut state = self.state.lock();
                    state.starting = false;
                    state.poisoned = true;
                    if let Some(task) = state.accept_task.take() {
                        task.abort();
                    }
                }
                tracing::error!(error = %e, "failed to start proxy server");
                let _ = self.events.send(ProxyEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<SocketAddr> {
        // Certificate material must exist before the listener can be
        // created, so these steps are sequential, not concurrent.
        let acceptor = match self.config.kind {
            ProxyKind::Https => {
                let hostname = self.config.hostname.as_deref().unwrap_or("localhost");
                let leaf = self.ca.issue_leaf(hostname)?;
                Some(TlsAcceptor::from(leaf.server_config()?))
            }
            ProxyKind::Http => None,
        };

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.port))
            .await
            .map_err(ProxyError::Listen)?;
        let addr = listener.local_addr().map_err(ProxyError::Listen)?;

        // Accept loop: one task per connection, CONNECT and plain requests
        // both enter through the same handler.
        let handler = Arc::clone(&self.handler);
        let mut shutdown_rx = self.shutdown.subscribe();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let handler = Arc::clone(&handler);
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                tracing::debug!(%peer, "connection accepted");
                                match acceptor {
                                    Some(acceptor) => match acceptor.accept(stream).await {
                                        Ok(tls) => handler.serve_connection(tls).await,
                                        Err(e) => {
                                            tracing::debug!(%peer, error = %e, "listener TLS handshake failed");
                                        }
                                    },
                                    None => handler.serve_connection(stream).await,
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                    }
                }
            }
            tracing::debug!("accept loop stopped");
        });
        self.state.lock().accept_task = Some(accept_task);

        if let (Some(web), Some(monitor)) = (&self.config.web_interface, &self.monitor) {
            if web.enable {
                monitor
                    .start(MonitorContext {
                        recorder: self.recorder.clone(),
                        web_port: web.web_port,
                        ws_port: web.ws_port,
                    })
                    .await?;
                if !self.config.silent {
                    tracing::info!(port = web.web_port, "monitoring interface started");
                }
            }
        }

        Ok(addr)
    }

    /// Closes the server: clears the recorder, stops accepting, closes the
    /// monitoring interface. Idempotent; in-flight connections drain
    /// naturally (best-effort, not awaited). Terminal: a closed server
    /// must be replaced by a new instance.
    pub async fn close(&self) {
        let first_close = {
            let mut state = self.state.lock();
            let first = state.status != ProxyStatus::Closed;
            state.status = ProxyStatus::Closed;
            first
        };
        if !first_close {
            tracing::info!("proxy server already closed");
            return;
        }

        self.recorder.clear();
        let _ = self.shutdown.send(());
        if let Some(task) = self.state.lock().accept_task.take() {
            task.abort();
        }
        if let Some(monitor) = &self.monitor {
            monitor.close().await;
        }

        tracing::info!(port = self.config.port, "proxy server closed");
        let _ = self.events.send(ProxyEvent::Closed);
    }
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spyglass_recorder::{NewTransaction, RecordFilter, TransactionKind};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_ca() -> (TempDir, Arc<CertificateAuthority>) {
        let dir = TempDir::new().unwrap();
        let ca = Arc::new(CertificateAuthority::new(dir.path().join("ca")));
        (dir, ca)
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn https_kind_without_hostname_is_rejected() {
        let (_dir, ca) = test_ca();
        let config = ProxyConfig::new(8001).with_kind(ProxyKind::Https);
        let err = ProxyServer::new(config, ca).unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Config(ConfigError::MissingHostname)
        ));
    }

    #[test]
    fn missing_port_is_rejected() {
        let (_dir, ca) = test_ca();
        let err = ProxyServer::new(ProxyConfig::new(0), ca).unwrap_err();
        assert!(matches!(err, ProxyError::Config(ConfigError::MissingPort)));
    }

    #[test]
    fn zero_throttle_is_rejected() {
        let (_dir, ca) = test_ca();
        let config = ProxyConfig::new(8001).with_throttle(0);
        let err = ProxyServer::new(config, ca).unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Config(ConfigError::InvalidThrottle)
        ));
    }

    #[test]
    fn positive_throttle_builds_a_matching_limiter() {
        let (_dir, ca) = test_ca();
        let config = ProxyConfig::new(8001).with_throttle(100);
        let server = ProxyServer::new(config, ca).unwrap();
        let group = server.throttle.as_ref().expect("throttle group");
        assert_eq!(group.rate_bytes_per_sec(), 100 * 1024);
    }

    #[test]
    fn forced_interception_without_root_ca_is_rejected() {
        let (_dir, ca) = test_ca();
        let config = ProxyConfig::new(8001).with_force_intercept_https(true);
        let err = ProxyServer::new(config, ca).unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Config(ConfigError::RootCaMissing)
        ));
    }

    #[test]
    fn forced_interception_with_root_ca_is_accepted() {
        let (_dir, ca) = test_ca();
        ca.generate_root().unwrap();
        let config = ProxyConfig::new(8001).with_force_intercept_https(true);
        assert!(ProxyServer::new(config, ca).is_ok());
    }

    #[tokio::test]
    async fn start_emits_ready_and_double_start_is_a_state_error() {
        let (_dir, ca) = test_ca();
        let server = ProxyServer::new(ProxyConfig::new(free_port()), ca).unwrap();
        let mut events = server.events();

        server.start().await.unwrap();
        assert_eq!(server.status(), ProxyStatus::Ready);
        assert!(matches!(events.recv().await.unwrap(), ProxyEvent::Ready));

        let err = server.start().await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::State(StateError::NotInit { status: "READY" })
        ));
        // Observable state unchanged by the failed call.
        assert_eq!(server.status(), ProxyStatus::Ready);

        server.close().await;
    }

    #[tokio::test]
    async fn bind_failure_emits_error_and_poisons_the_instance() {
        let (_dir, ca) = test_ca();
        // Keep the port occupied for the duration of the test.
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let server = ProxyServer::new(ProxyConfig::new(port), ca).unwrap();
        let mut events = server.events();

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Listen(_)));
        assert!(matches!(
            events.recv().await.unwrap(),
            ProxyEvent::Error(_)
        ));
        assert_eq!(server.status(), ProxyStatus::Init);

        // Retry is forbidden; the instance is poisoned.
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::State(StateError::Poisoned)));
    }

    #[tokio::test]
    async fn close_clears_recorder_and_is_terminal() {
        let (_dir, ca) = test_ca();
        let server = ProxyServer::new(ProxyConfig::new(free_port()), ca).unwrap();
        server.start().await.unwrap();

        server.recorder().begin(NewTransaction {
            host: "example.com".into(),
            port: 80,
            method: "GET".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            kind: TransactionKind::Exchange,
            intercepted: false,
            request_headers: Vec::new(),
        });
        assert_eq!(server.recorder().len(), 1);

        let mut events = server.events();
        server.close().await;
        assert_eq!(server.status(), ProxyStatus::Closed);
        assert!(server.recorder().query(&RecordFilter::default()).is_empty());
        assert!(matches!(events.recv().await.unwrap(), ProxyEvent::Closed));

        // Terminal: no way back to READY.
        let err = server.start().await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::State(StateError::NotInit { status: "CLOSED" })
        ));

        // Idempotent.
        server.close().await;
        assert_eq!(server.status(), ProxyStatus::Closed);
    }

    #[tokio::test]
    async fn close_from_init_is_allowed() {
        let (_dir, ca) = test_ca();
        let server = ProxyServer::new(ProxyConfig::new(free_port()), ca).unwrap();
        server.close().await;
        assert_eq!(server.status(), ProxyStatus::Closed);
    }

    #[tokio::test]
    async fn closed_server_refuses_new_connections() {
        let (_dir, ca) = test_ca();
        let server = ProxyServer::new(ProxyConfig::new(free_port()), ca).unwrap();
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], addr.port()));

        // Reachable while ready.
        let probe = tokio::net::TcpStream::connect(addr).await;
        assert!(probe.is_ok());

        server.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // After close either the connect fails outright or the socket is
        // immediately torn down; a request must not be answered.
        if let Ok(mut stream) = tokio::net::TcpStream::connect(addr).await {
            let _ = stream
                .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
                .await;
            let mut buf = Vec::new();
            let n = tokio::time::timeout(
                Duration::from_millis(500),
                stream.read_to_end(&mut buf),
            )
            .await;
            match n {
                Ok(Ok(read)) => assert_eq!(read, 0, "closed server answered a request"),
                // Reset or timeout both mean nobody served us.
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn end_to_end_forward_through_a_started_server() {
        let (_dir, ca) = test_ca();
        let server = ProxyServer::new(ProxyConfig::new(free_port()), ca).unwrap();
        server.start().await.unwrap();
        let proxy_addr = server.local_addr().unwrap();

        // One-shot upstream.
        let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let mut client =
            tokio::net::TcpStream::connect(("127.0.0.1", proxy_addr.port())).await.unwrap();
        let request = format!(
            "GET http://127.0.0.1:{upstream_port}/ HTTP/1.1\r\nHost: 127.0.0.1:{upstream_port}\r\nConnection: close\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));

        let records = server.recorder().query(&RecordFilter::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Some(200));

        server.close().await;
    }

    #[tokio::test]
    async fn throttled_server_limits_response_throughput() {
        let (_dir, ca) = test_ca();
        // 8 KB/s with an 8 KB burst: a 16 KB body takes about a second.
        let config = ProxyConfig::new(free_port()).with_throttle(8);
        let server = ProxyServer::new(config, ca).unwrap();
        server.start().await.unwrap();
        let proxy_addr = server.local_addr().unwrap();

        let body_len = 16 * 1024;
        let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {body_len}\r\n\r\n");
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(&vec![0x5Au8; body_len]).await.unwrap();
        });

        let started = std::time::Instant::now();
        let mut client =
            tokio::net::TcpStream::connect(("127.0.0.1", proxy_addr.port())).await.unwrap();
        let request = format!(
            "GET http://127.0.0.1:{upstream_port}/blob HTTP/1.1\r\nHost: 127.0.0.1:{upstream_port}\r\nConnection: close\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        let elapsed = started.elapsed();
        assert!(response.len() >= body_len);
        assert!(
            elapsed >= Duration::from_millis(700),
            "response arrived too fast for an 8 KB/s cap: {elapsed:?}"
        );

        server.close().await;
    }

    struct CountingMonitor {
        started: std::sync::atomic::AtomicUsize,
        closed: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MonitorInterface for CountingMonitor {
        async fn start(&self, ctx: MonitorContext) -> Result<()> {
            assert_eq!(ctx.web_port, 8002);
            self.started
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {
            self.closed
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn monitoring_interface_follows_the_lifecycle() {
        let (_dir, ca) = test_ca();
        let monitor = Arc::new(CountingMonitor {
            started: std::sync::atomic::AtomicUsize::new(0),
            closed: std::sync::atomic::AtomicUsize::new(0),
        });
        let config = ProxyConfig::new(free_port()).with_web_interface(WebInterfaceConfig {
            enable: true,
            web_port: 8002,
            ws_port: None,
        });
        let server = ProxyServer::new(config, ca)
            .unwrap()
            .with_monitor(Arc::clone(&monitor) as Arc<dyn MonitorInterface>);

        server.start().await.unwrap();
        assert_eq!(monitor.started.load(std::sync::atomic::Ordering::SeqCst), 1);

        server.close().await;
        assert_eq!(monitor.closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_web_interface_is_not_started() {
        let (_dir, ca) = test_ca();
        let monitor = Arc::new(CountingMonitor {
            started: std::sync::atomic::AtomicUsize::new(0),
            closed: std::sync::atomic::AtomicUsize::new(0),
        });
        let config = ProxyConfig::new(free_port()).with_web_interface(WebInterfaceConfig {
            enable: false,
            web_port: 8002,
            ws_port: None,
        });
        let server = ProxyServer::new(config, ca)
            .unwrap()
            .with_monitor(Arc::clone(&monitor) as Arc<dyn MonitorInterface>);

        server.start().await.unwrap();
        assert_eq!(monitor.started.load(std::sync::atomic::Ordering::SeqCst), 0);
        server.close().await;
    }
}
