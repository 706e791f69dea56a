//! The proxy server: listeners, the per-request service, upstream round
//! trips, and the pipeline driver.

use std::convert::Infallible;
use std::io;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context as _;
use http::header::{ACCEPT_ENCODING, HOST};
use http::uri::Authority;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::auth;
use crate::body::{Mutable, ProxyBody};
use crate::config::Options;
use crate::connect;
use crate::hosts::contains_host;
use crate::mitm::{upstream_client_config, CaMaterial, CertStore};
use crate::pipeline::{finalize_content_length, Pipeline, RequestCtx, Requester, Responder};

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// The forward proxy. Cheap to clone handles are not provided; share it
/// behind its own methods.
pub struct Proxy {
    state: Arc<ProxyState>,
}

pub(crate) struct ProxyState {
    opts: RwLock<Options>,
    pub(crate) requesters: Pipeline<dyn Requester>,
    pub(crate) responders: Pipeline<dyn Responder>,
    pub(crate) cert_store: CertStore,
    shutdown: watch::Sender<Option<Instant>>,
}

impl ProxyState {
    pub(crate) fn options(&self) -> Options {
        self.opts.read().expect("options lock poisoned").copy()
    }

    pub(crate) fn auth(&self) -> String {
        self.opts.read().expect("options lock poisoned").auth.clone()
    }

    pub(crate) fn ca(&self) -> Option<Arc<CaMaterial>> {
        self.opts.read().expect("options lock poisoned").ca.clone()
    }

    pub(crate) fn insecure_skip_verify(&self) -> bool {
        self.opts.read().expect("options lock poisoned").insecure_skip_verify
    }

    pub(crate) fn is_host_blocked(&self, host: &str) -> bool {
        let opts = self.opts.read().expect("options lock poisoned");
        contains_host(&opts.block_hosts, host)
    }
}

/// Per-connection context: whether requests on this connection were read
/// out of an established CONNECT session, and for which target.
#[derive(Debug, Clone)]
pub(crate) struct ConnCtx {
    pub within_connect: bool,
    /// Inner requests arrived over MITM-terminated TLS.
    pub tls: bool,
    /// CONNECT target authority (`host:port`).
    pub authority: Option<String>,
}

impl ConnCtx {
    fn outer() -> Self {
        Self {
            within_connect: false,
            tls: false,
            authority: None,
        }
    }
}

impl Proxy {
    /// Create a proxy with the given options. When HTTPS MITM is enabled
    /// without CA material, an ephemeral CA is generated here.
    pub fn new(opts: Options) -> anyhow::Result<Self> {
        let mut opts = opts.copy();
        if opts.https_mitm && opts.ca.is_none() {
            let ca = CaMaterial::generate().context("failed to generate ephemeral CA")?;
            opts.ca = Some(Arc::new(ca));
        }
        let (shutdown, _) = watch::channel(None);
        Ok(Self {
            state: Arc::new(ProxyState {
                opts: RwLock::new(opts),
                requesters: Pipeline::default(),
                responders: Pipeline::default(),
                cert_store: CertStore::new(),
                shutdown,
            }),
        })
    }

    /// Current options, as a read-only copy.
    pub fn options(&self) -> Options {
        self.state.options()
    }

    /// Replace the options by copy-on-write swap.
    pub fn set_options(&self, opts: Options) {
        let mut opts = opts.copy();
        if opts.https_mitm && opts.ca.is_none() {
            // Keep the CA we already have rather than regenerate.
            opts.ca = self.state.ca();
            if opts.ca.is_none() {
                match CaMaterial::generate() {
                    Ok(ca) => opts.ca = Some(Arc::new(ca)),
                    Err(e) => warn!("could not generate ephemeral CA: {e}"),
                }
            }
        }
        *self.state.opts.write().expect("options lock poisoned") = opts;
    }

    pub fn add_requester(&self, requester: Arc<dyn Requester>) {
        self.state.requesters.add(requester);
    }

    pub fn add_responder(&self, responder: Arc<dyn Responder>) {
        self.state.responders.add(responder);
    }

    pub fn is_host_blocked(&self, host: &str) -> bool {
        self.state.is_host_blocked(host)
    }

    /// Bind every configured address and serve until [`Proxy::shutdown`].
    /// Returns the first listener error, if any.
    pub async fn listen_and_serve(&self) -> anyhow::Result<()> {
        let addresses = self.state.options().addresses;
        if addresses.is_empty() {
            anyhow::bail!("no listen addresses configured");
        }
        let mut listeners = Vec::new();
        for addr in &addresses {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!("listening on {}", listener.local_addr()?);
            listeners.push(listener);
        }
        let mut tasks = JoinSet::new();
        for listener in listeners {
            let state = Arc::clone(&self.state);
            tasks.spawn(accept_loop(listener, state));
        }
        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err.get_or_insert(anyhow::anyhow!(e));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop accepting connections on every listener in parallel and give
    /// in-flight connections until `grace` to finish.
    pub fn shutdown(&self, grace: Duration) {
        let _ = self.state.shutdown.send(Some(Instant::now() + grace));
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ProxyState>) -> anyhow::Result<()> {
    let mut shutdown_rx = state.shutdown.subscribe();
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(x) => x,
                    Err(e) => {
                        warn!("accept error: {e}");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                conns.spawn(async move {
                    if let Err(e) = serve_client(stream, state).await {
                        debug!("connection from {peer} ended: {e}");
                    }
                });
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    let deadline = (*shutdown_rx.borrow()).unwrap_or_else(Instant::now);
    let _ = tokio::time::timeout_at(deadline, async {
        while conns.join_next().await.is_some() {}
    })
    .await;
    conns.shutdown().await;
    Ok(())
}

async fn serve_client(stream: TcpStream, state: Arc<ProxyState>) -> anyhow::Result<()> {
    let conn = ConnCtx::outer();
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        let conn = conn.clone();
        async move { Ok::<_, Infallible>(handle_request(req, state, conn).await) }
    });
    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await?;
    Ok(())
}

/// Serve HTTP/1.1 requests read out of an established CONNECT session
/// (plaintext or decrypted TLS).
pub(crate) async fn serve_within_connect<I>(
    io: I,
    state: Arc<ProxyState>,
    conn: ConnCtx,
) -> anyhow::Result<()>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        let conn = conn.clone();
        async move { Ok::<_, Infallible>(handle_request(req, state, conn).await) }
    });
    hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await?;
    Ok(())
}

pub(crate) async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    conn: ConnCtx,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        if conn.within_connect {
            return simple_response(StatusCode::BAD_REQUEST, "CONNECT inside CONNECT");
        }
        return connect::handle_connect(req, state).await;
    }

    // Auth was already satisfied at CONNECT time for inner requests; do
    // not re-challenge them.
    if !conn.within_connect {
        let auth_config = state.auth();
        if !auth_config.is_empty() && !auth::authorized(&auth_config, req.headers()) {
            return auth::challenge_response();
        }
    }

    round_trip(req, state, conn).await
}

async fn round_trip(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    conn: ConnCtx,
) -> Response<ProxyBody> {
    let target = match resolve_target(&req, &conn) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let (parts, client_body) = req.into_parts();
    // Capture the request as the client sent it, before any downstream
    // modification, so responders can negotiate against the original
    // Accept and Accept-Encoding.
    let ctx = RequestCtx::new(
        parts.method.clone(),
        parts.uri.clone(),
        parts.headers.clone(),
        conn.within_connect,
    );

    let mut upstream_req =
        Some(build_upstream_request(&parts, ProxyBody::from(client_body), &target));

    // Requester chain runs to completion before any upstream I/O; an
    // early response skips the round trip but still goes through the
    // responders.
    let mut early_response = None;
    for requester in state.requesters.snapshot() {
        match requester.request(upstream_req.take().unwrap()).await {
            Ok(next) => upstream_req = Some(next),
            Err(resp) => {
                early_response = Some(resp);
                break;
            }
        }
    }

    let mut resp = match early_response {
        Some(resp) => resp,
        None => match send_upstream(&state, &target, upstream_req.unwrap()).await {
            Ok(resp) => resp.map(ProxyBody::from),
            Err(e) => synthesize_error_response(&e),
        },
    };
    strip_connection_headers(resp.headers_mut());

    for responder in state.responders.snapshot() {
        resp = responder.response(&ctx, resp).await;
    }
    finalize_content_length(&mut resp);
    resp
}

/// Where a request is going: scheme, host, and port.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub https: bool,
    pub host: String,
    pub port: u16,
}

fn resolve_target(
    req: &Request<Incoming>,
    conn: &ConnCtx,
) -> Result<Target, Response<ProxyBody>> {
    if let Some(authority) = req.uri().authority() {
        let https = req.uri().scheme_str() == Some("https");
        return Ok(Target {
            https,
            host: strip_brackets(authority.host()).to_string(),
            port: authority.port_u16().unwrap_or(if https { 443 } else { 80 }),
        });
    }
    if conn.within_connect {
        // Origin-form request inside a CONNECT session; the tunnel target
        // is authoritative, the Host header is the fallback.
        let authority = conn
            .authority
            .clone()
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .and_then(|a| a.parse::<Authority>().ok());
        let Some(authority) = authority else {
            return Err(simple_response(
                StatusCode::BAD_REQUEST,
                "missing target host",
            ));
        };
        let default_port = if conn.tls { 443 } else { 80 };
        return Ok(Target {
            https: conn.tls,
            host: strip_brackets(authority.host()).to_string(),
            port: authority.port_u16().unwrap_or(default_port),
        });
    }
    Err(simple_response(
        StatusCode::BAD_REQUEST,
        "proxy requests must use absolute-form URI",
    ))
}

/// IPv6 literals come bracketed out of an authority.
pub(crate) fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

fn build_upstream_request(
    parts: &http::request::Parts,
    body: ProxyBody,
    target: &Target,
) -> Request<ProxyBody> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut req = Request::new(body);
    *req.method_mut() = parts.method.clone();
    *req.uri_mut() = path_and_query.parse().unwrap_or_else(|_| "/".parse().expect("root path parses"));
    *req.headers_mut() = filter_request_headers(&parts.headers);

    let default_port = if target.https { 443 } else { 80 };
    let host_value = if target.port == default_port {
        target.host.clone()
    } else {
        format!("{}:{}", target.host, target.port)
    };
    if let Ok(value) = HeaderValue::from_str(&host_value) {
        req.headers_mut().insert(HOST, value);
    }
    req
}

/// Strip hop-by-hop headers (RFC 7230 section 6.1) plus `Accept-Encoding`:
/// upstream bodies arrive identity-encoded so the responders can read
/// them, and the compressor re-encodes against the client's original
/// header afterwards.
fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) || *name == ACCEPT_ENCODING || *name == HOST {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Connection-scoped response headers must not travel past the proxy.
/// `Transfer-Encoding` stays: the outbound connection re-frames the body
/// and consults it.
fn strip_connection_headers(headers: &mut HeaderMap) {
    for name in [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-connection",
        "upgrade",
        "trailer",
    ] {
        headers.remove(name);
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
        || name.eq_ignore_ascii_case("proxy-connection")
}

/// Upstream transport failures, classified for status synthesis.
#[derive(Debug, Error)]
pub(crate) enum UpstreamError {
    #[error("host {host} is blocked")]
    Blocked { host: String },

    #[error("failed to resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("failed to connect to {host}: {source}")]
    Connect { host: String, source: io::Error },

    #[error("timed out reaching {host}")]
    Timeout { host: String },

    #[error("TLS to {host} failed: {source}")]
    Tls { host: String, source: io::Error },

    #[error("upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

impl UpstreamError {
    /// Blocked hosts surface like DNS failures.
    fn is_name_error(&self) -> bool {
        matches!(
            self,
            UpstreamError::Blocked { .. } | UpstreamError::Resolve { .. }
        )
    }
}

/// Dial `host:port`, refusing blocked hosts before any lookup.
pub(crate) async fn dial(
    state: &ProxyState,
    host: &str,
    port: u16,
) -> Result<TcpStream, UpstreamError> {
    if state.is_host_blocked(host) {
        debug!("refusing dial to blocked host {host}");
        return Err(UpstreamError::Blocked {
            host: host.to_string(),
        });
    }
    let addrs = timeout(DIAL_TIMEOUT, lookup_host((host, port)))
        .await
        .map_err(|_| UpstreamError::Timeout {
            host: host.to_string(),
        })?
        .map_err(|e| UpstreamError::Resolve {
            host: host.to_string(),
            source: e,
        })?;

    let mut last_err = None;
    for addr in addrs {
        match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(UpstreamError::Timeout {
                    host: host.to_string(),
                })
            }
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(e),
        }
    }
    match last_err {
        Some(source) => Err(UpstreamError::Connect {
            host: host.to_string(),
            source,
        }),
        None => Err(UpstreamError::Resolve {
            host: host.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        }),
    }
}

async fn send_upstream(
    state: &ProxyState,
    target: &Target,
    req: Request<ProxyBody>,
) -> Result<Response<Incoming>, UpstreamError> {
    let stream = dial(state, &target.host, target.port).await?;
    if target.https {
        let connector = TlsConnector::from(upstream_client_config(state.insecure_skip_verify()));
        let server_name = rustls::pki_types::ServerName::try_from(target.host.clone())
            .map_err(|e| UpstreamError::Tls {
                host: target.host.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
            })?;
        let tls_stream =
            connector
                .connect(server_name, stream)
                .await
                .map_err(|e| UpstreamError::Tls {
                    host: target.host.clone(),
                    source: e,
                })?;
        send_over(tls_stream, &target.host, req).await
    } else {
        send_over(stream, &target.host, req).await
    }
}

async fn send_over<S>(
    stream: S,
    host: &str,
    req: Request<ProxyBody>,
) -> Result<Response<Incoming>, UpstreamError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("upstream connection closed: {e}");
        }
    });
    let resp = timeout(RESPONSE_HEADER_TIMEOUT, sender.send_request(req))
        .await
        .map_err(|_| UpstreamError::Timeout {
            host: host.to_string(),
        })??;
    Ok(resp)
}

/// The upstream transport yielded no response; synthesize one. DNS-style
/// failures (including blocked hosts) become `521 Down`, everything else
/// `502 Bad Gateway`.
fn synthesize_error_response(err: &UpstreamError) -> Response<ProxyBody> {
    warn!("error during upstream round trip: {err}");
    let (status, text) = if err.is_name_error() {
        (StatusCode::from_u16(521).expect("521 is a valid status"), "Down")
    } else {
        (StatusCode::BAD_GATEWAY, "Bad Gateway")
    };
    Response::builder()
        .status(status)
        .body(ProxyBody::from(Mutable::from(text)))
        .expect("static response builds")
}

pub(crate) fn simple_response(status: StatusCode, text: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(ProxyBody::from(Mutable::from(text)))
        .expect("static response builds")
}
