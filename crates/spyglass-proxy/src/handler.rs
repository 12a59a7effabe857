//! The per-connection decision pipeline.
//!
//! Every accepted connection is served HTTP/1 by hyper. Plain requests are
//! forwarded upstream after the rule boundary had its say; CONNECT requests
//! either become opaque byte tunnels or, when interception is selected, a
//! locally terminated TLS session whose decrypted stream re-enters the same
//! pipeline, which is what makes nested CONNECT work. Every exchange and
//! tunnel is recorded; a failing connection only ever takes itself down.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_stream::wrappers::ReceiverStream;

use spyglass_core::{MockResponse, RequestSummary, TrafficRule};
use spyglass_recorder::{NewTransaction, Recorder, TransactionKind, MAX_RECORDED_BODY};

use crate::ca::CertificateAuthority;
use crate::error::UpstreamError;
use crate::throttle::{ThrottleGroup, ThrottledStream};
use crate::tls;

/// Response body type used throughout the pipeline.
type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Flags the handler is bound to at construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerConfig {
    /// Intercept every CONNECT, regardless of what the rule says.
    pub force_intercept_https: bool,
    /// Skip upstream certificate verification. Explicit opt-in; weakens
    /// the security guarantees of every intercepted connection.
    pub ignore_upstream_tls_errors: bool,
}

/// The connection-handling pipeline.
///
/// Shared across all connection tasks behind an `Arc`; the only mutable
/// slot is the active rule, which [`reload_rule`](Self::reload_rule) swaps
/// atomically.
pub struct RequestHandler {
    config: HandlerConfig,
    ca: Arc<CertificateAuthority>,
    rule: RwLock<Arc<dyn TrafficRule>>,
    recorder: Recorder,
    throttle: Option<Arc<ThrottleGroup>>,
    upstream_tls: Arc<rustls::ClientConfig>,
}

impl RequestHandler {
    /// Creates a handler bound to the given collaborators.
    pub fn new(
        config: HandlerConfig,
        ca: Arc<CertificateAuthority>,
        rule: Arc<dyn TrafficRule>,
        recorder: Recorder,
        throttle: Option<Arc<ThrottleGroup>>,
    ) -> Self {
        let upstream_tls = tls::upstream_client_config(config.ignore_upstream_tls_errors);
        Self {
            config,
            ca,
            rule: RwLock::new(rule),
            recorder,
            throttle,
            upstream_tls,
        }
    }

    /// Atomically replaces the active rule. In-flight requests keep the
    /// rule they already resolved; new requests see the replacement.
    pub fn reload_rule(&self, rule: Arc<dyn TrafficRule>) {
        *self.rule.write() = rule;
        tracing::info!("traffic rule reloaded");
    }

    /// The recorder this handler feeds.
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    fn rule(&self) -> Arc<dyn TrafficRule> {
        Arc::clone(&self.rule.read())
    }

    /// Serves one accepted connection until it closes.
    ///
    /// This is the entry point the listener dispatches to; for an
    /// https-type proxy the stream is already TLS-unwrapped.
    pub async fn serve_connection<S>(self: Arc<Self>, io: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.serve_io(io, None).await;
    }

    /// Serves a stream, optionally one that was decrypted from an
    /// intercepted CONNECT to `decrypted = (host, port)`.
    async fn serve_io<S>(self: Arc<Self>, io: S, decrypted: Option<(String, u16)>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = self;
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = Arc::clone(&handler);
            let decrypted = decrypted.clone();
            async move { Ok::<_, hyper::Error>(handler.dispatch(req, decrypted).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await
        {
            tracing::debug!(error = %e, "connection closed with error");
        }
    }

    // Returns an explicitly boxed future so the CONNECT-in-CONNECT recursion
    // (handle_connect -> intercept_tunnel -> serve_io -> dispatch) has a
    // `Send` bound satisfied by type rather than by revealing the opaque
    // `async fn` return, which the auto-trait solver cannot do across the
    // recursive cycle.
    fn dispatch(
        self: Arc<Self>,
        req: Request<Incoming>,
        decrypted: Option<(String, u16)>,
    ) -> BoxFuture<'static, Response<ProxyBody>> {
        Box::pin(async move {
            if req.method() == Method::CONNECT {
                self.handle_connect(req).await
            } else {
                self.handle_request(req, decrypted).await
            }
        })
    }

    /// CONNECT entry point: replies 200, then either relays bytes opaquely
    /// or terminates TLS and re-enters the pipeline on the decrypted
    /// stream. Nested CONNECT (a client chaining proxies) recurses here.
    async fn handle_connect(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        let (host, port) = match req.uri().authority() {
            Some(authority) => (
                authority.host().to_string(),
                authority.port_u16().unwrap_or(443),
            ),
            None => {
                tracing::warn!(uri = %req.uri(), "CONNECT without host:port authority");
                return text_response(
                    StatusCode::BAD_REQUEST,
                    "CONNECT requires a host:port authority",
                );
            }
        };

        let id = self.recorder.begin(NewTransaction {
            host: host.clone(),
            port,
            method: Method::CONNECT.to_string(),
            target: format!("{host}:{port}"),
            version: format!("{:?}", req.version()),
            kind: TransactionKind::Tunnel,
            intercepted: false,
            request_headers: header_pairs(req.headers()),
        });

        let intercept = self.config.force_intercept_https || self.rule().intercept_tls(&host).await;
        if intercept {
            let _ = self.recorder.update(id, |rec| rec.intercepted = true);
        }

        let handler = Arc::clone(&self);
        // Boxed so the CONNECT-in-CONNECT recursion has a finite type.
        let tunnel: BoxFuture<'static, ()> = Box::pin(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let io = TokioIo::new(upgraded);
                    if intercept {
                        handler.intercept_tunnel(io, host, port, id).await;
                    } else {
                        handler.relay_tunnel(io, host, port, id).await;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "CONNECT upgrade failed");
                    handler.recorder.fail(id, format!("upgrade failed: {e}"));
                }
            }
        });
        tokio::spawn(tunnel);

        Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .unwrap()
    }

    /// Opaque relay: bytes pass through unmodified in both directions
    /// until either side closes.
    async fn relay_tunnel<C>(self: Arc<Self>, mut client: C, host: String, port: u16, id: u64)
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let upstream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(%host, port, error = %e, "tunnel connect failed");
                self.recorder.fail(id, format!("connect to {host}:{port} failed: {e}"));
                return;
            }
        };

        let relayed = match &self.throttle {
            Some(group) => {
                let mut upstream = ThrottledStream::new(upstream, Arc::clone(group));
                tokio::io::copy_bidirectional(&mut client, &mut upstream).await
            }
            None => {
                let mut upstream = upstream;
                tokio::io::copy_bidirectional(&mut client, &mut upstream).await
            }
        };

        match relayed {
            Ok((up, down)) => {
                tracing::debug!(%host, port, bytes_up = up, bytes_down = down, "tunnel closed");
                self.recorder.add_tunnel_bytes(id, up, down);
                self.recorder.finalize(id);
            }
            Err(e) => {
                tracing::debug!(%host, port, error = %e, "tunnel error");
                self.recorder.fail(id, e.to_string());
            }
        }
    }

    /// MITM: terminate the client's TLS with a forged leaf for `host`,
    /// then serve the decrypted stream as fresh HTTP.
    async fn intercept_tunnel<C>(self: Arc<Self>, client: C, host: String, port: u16, id: u64)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = match self.ca.issue_leaf(&host).and_then(|leaf| leaf.server_config()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(%host, error = %e, "leaf certificate issuance failed");
                self.recorder.fail(id, format!("certificate issuance failed: {e}"));
                return;
            }
        };

        let tls = match TlsAcceptor::from(config).accept(client).await {
            Ok(tls) => tls,
            Err(e) => {
                tracing::debug!(%host, error = %e, "client TLS handshake failed");
                self.recorder.fail(id, format!("client handshake failed: {e}"));
                return;
            }
        };
        tracing::debug!(%host, port, "interception established");

        let handler = Arc::clone(&self);
        handler.serve_io(tls, Some((host, port))).await;
        self.recorder.finalize(id);
    }

    /// Plain-request path, also re-entered for requests on decrypted MITM
    /// streams.
    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        decrypted: Option<(String, u16)>,
    ) -> Response<ProxyBody> {
        let (host, port, tls) = match &decrypted {
            Some((host, port)) => (host.clone(), *port, true),
            None => match req.uri().host() {
                Some(host) => (host.to_string(), req.uri().port_u16().unwrap_or(80), false),
                None => match host_header(req.headers()) {
                    Some((host, port)) => (host, port, false),
                    None => {
                        return text_response(
                            StatusCode::BAD_REQUEST,
                            "proxy requires an absolute URI or a Host header",
                        );
                    }
                },
            },
        };

        let (parts, incoming) = req.into_parts();
        let method = parts.method.clone();
        let mut target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());
        let mut headers = header_pairs(&parts.headers);

        let id = self.recorder.begin(NewTransaction {
            host: host.clone(),
            port,
            method: method.to_string(),
            target: target.clone(),
            version: format!("{:?}", parts.version),
            kind: TransactionKind::Exchange,
            intercepted: tls,
            request_headers: headers.clone(),
        });

        // Request bodies are buffered so rules can rewrite them.
        let mut body = match incoming.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                self.recorder.fail(id, format!("request body error: {e}"));
                return text_response(StatusCode::BAD_REQUEST, "failed to read request body");
            }
        };
        self.recorder.append_request_body(id, &body);

        let summary = RequestSummary {
            method: method.to_string(),
            target: target.clone(),
            host: host.clone(),
            port,
            tls,
            headers: headers.clone(),
            body: body[..body.len().min(MAX_RECORDED_BODY)].to_vec(),
        };
        let verdict = self.rule().inspect_request(&summary).await;

        if let Some(mock) = verdict.mock {
            tracing::debug!(host = %host, target = %target, "serving mocked response");
            self.recorder.mark_mocked(id);
            self.recorder
                .set_response_head(id, mock.status, mock.headers.clone());
            self.recorder.append_response_body(id, &mock.body);
            self.recorder.finalize(id);
            return mock_response(mock);
        }

        if let Some(rewrite) = verdict.rewrite {
            if let Some(new_target) = rewrite.target {
                target = new_target;
            }
            for name in &rewrite.remove_headers {
                headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
            }
            for (name, value) in rewrite.set_headers {
                headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
                headers.push((name, value));
            }
            if let Some(new_body) = rewrite.body {
                body = Bytes::from(new_body);
            }
            let _ = self.recorder.update(id, |rec| {
                rec.target = target.clone();
                rec.request_headers = headers.clone();
            });
        }

        match self
            .forward(id, &host, port, tls, method, &target, &headers, body)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "upstream exchange failed");
                self.recorder.fail(id, e.to_string());
                text_response(StatusCode::BAD_GATEWAY, &format!("upstream error: {e}"))
            }
        }
    }

    /// Connects upstream (throttled when configured, TLS when forwarding
    /// decrypted traffic) and runs the exchange.
    #[allow(clippy::too_many_arguments)]
    async fn forward(
        &self,
        id: u64,
        host: &str,
        port: u16,
        tls: bool,
        method: Method,
        target: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<Response<ProxyBody>, UpstreamError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| UpstreamError::Connect {
                host: host.to_string(),
                port,
                source: e,
            })?;

        if tls {
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| UpstreamError::Tls {
                    host: host.to_string(),
                    reason: "invalid server name".into(),
                })?;
            let connector = TlsConnector::from(Arc::clone(&self.upstream_tls));
            match &self.throttle {
                Some(group) => {
                    let stream = ThrottledStream::new(stream, Arc::clone(group));
                    let stream = connector.connect(server_name, stream).await.map_err(|e| {
                        UpstreamError::Tls {
                            host: host.to_string(),
                            reason: e.to_string(),
                        }
                    })?;
                    self.exchange(id, stream, host, method, target, headers, body)
                        .await
                }
                None => {
                    let stream = connector.connect(server_name, stream).await.map_err(|e| {
                        UpstreamError::Tls {
                            host: host.to_string(),
                            reason: e.to_string(),
                        }
                    })?;
                    self.exchange(id, stream, host, method, target, headers, body)
                        .await
                }
            }
        } else {
            match &self.throttle {
                Some(group) => {
                    let stream = ThrottledStream::new(stream, Arc::clone(group));
                    self.exchange(id, stream, host, method, target, headers, body)
                        .await
                }
                None => {
                    self.exchange(id, stream, host, method, target, headers, body)
                        .await
                }
            }
        }
    }

    /// Sends the request over an established upstream stream and pipes the
    /// response back, teeing it into the recorder as frames arrive.
    #[allow(clippy::too_many_arguments)]
    async fn exchange<S>(
        &self,
        id: u64,
        io: S,
        host: &str,
        method: Method,
        target: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<Response<ProxyBody>, UpstreamError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(io))
                .await
                .map_err(|e| UpstreamError::Http(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "upstream connection error");
            }
        });

        let mut outbound = Request::builder()
            .method(method)
            .uri(target)
            .body(Full::new(body))
            .map_err(|e| UpstreamError::Http(e.to_string()))?;

        let mut has_host = false;
        for (name, value) in headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            if name.eq_ignore_ascii_case("host") {
                has_host = true;
            }
            if let (Ok(name), Ok(value)) =
                (name.parse::<HeaderName>(), HeaderValue::from_str(value))
            {
                outbound.headers_mut().append(name, value);
            }
        }
        if !has_host {
            if let Ok(value) = HeaderValue::from_str(host) {
                outbound.headers_mut().insert(hyper::header::HOST, value);
            }
        }

        let response = sender
            .send_request(outbound)
            .await
            .map_err(|e| UpstreamError::Http(e.to_string()))?;

        let (mut parts, incoming) = response.into_parts();
        self.recorder
            .set_response_head(id, parts.status.as_u16(), header_pairs(&parts.headers));
        strip_hop_by_hop(&mut parts.headers);

        // Tee response frames into the recorder while streaming them to
        // the client; the record is finalized when the body ends.
        let recorder = self.recorder.clone();
        let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, hyper::Error>>(16);
        tokio::spawn(async move {
            let mut incoming = incoming;
            loop {
                match incoming.frame().await {
                    Some(Ok(frame)) => {
                        if let Some(data) = frame.data_ref() {
                            recorder.append_response_body(id, data);
                        }
                        if tx.send(Ok(frame)).await.is_err() {
                            recorder.fail(id, "client closed before response completed");
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        recorder.fail(id, e.to_string());
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    None => {
                        recorder.finalize(id);
                        return;
                    }
                }
            }
        });

        Ok(Response::from_parts(
            parts,
            StreamBody::new(ReceiverStream::new(rx)).boxed(),
        ))
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("config", &self.config)
            .field("throttled", &self.throttle.is_some())
            .finish()
    }
}

fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(Bytes::from(message.to_string())))
        .unwrap()
}

fn mock_response(mock: MockResponse) -> Response<ProxyBody> {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(mock.status).unwrap_or(StatusCode::OK));
    for (name, value) in &mock.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(full_body(Bytes::from(mock.body)))
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid mock"))
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect()
}

fn host_header(headers: &HeaderMap) -> Option<(String, u16)> {
    let value = headers.get(hyper::header::HOST)?.to_str().ok()?;
    match value.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((value.to_string(), 80)),
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
    )
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}
