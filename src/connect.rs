//! CONNECT handling.
//!
//! Per destination port, a CONNECT is either tunneled opaquely, read as
//! plaintext HTTP (port 80 with `connect_mitm`), terminated as TLS with a
//! forged certificate (port 443 with `https_mitm`), or rejected. Auth, if
//! configured, is checked before the tunnel is established; inner
//! requests of an authenticated session are not re-challenged.

use std::sync::Arc;

use http::uri::Authority;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

use crate::auth;
use crate::body::ProxyBody;
use crate::config::Options;
use crate::mitm::{server_config_for_cert, sign_host};
use crate::server::{
    dial, serve_within_connect, simple_response, strip_brackets, ConnCtx, ProxyState,
};

/// What to do with a CONNECT, decided per destination port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAction {
    /// Opaque byte tunnel.
    Tunnel,
    /// Read HTTP/1.1 requests out of the tunneled socket.
    HttpMitm,
    /// Present a forged certificate, decrypt, and proxy cleartext.
    TlsMitm,
    /// Refuse the tunnel.
    Reject,
}

/// Routing policy: port 80 may be read as plaintext HTTP, port 443 may be
/// TLS-terminated, anything else is refused.
pub fn route_connect(port: u16, opts: &Options) -> ConnectAction {
    match port {
        80 => {
            if opts.connect_mitm {
                ConnectAction::HttpMitm
            } else {
                ConnectAction::Tunnel
            }
        }
        443 => {
            if opts.https_mitm {
                ConnectAction::TlsMitm
            } else {
                ConnectAction::Tunnel
            }
        }
        _ => ConnectAction::Reject,
    }
}

pub(crate) fn handle_connect(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response<ProxyBody>> + Send>> {
    Box::pin(async move {
        let Some(authority) = req.uri().authority().cloned() else {
            return simple_response(
                StatusCode::BAD_REQUEST,
                "CONNECT requires a host:port authority",
            );
        };
        let (host, port) = match split_authority(&authority) {
            Some(target) => target,
            None => {
                return simple_response(StatusCode::BAD_REQUEST, "CONNECT requires a valid port")
            }
        };

        let auth_config = state.auth();
        if !auth_config.is_empty() && !auth::authorized(&auth_config, req.headers()) {
            debug!("rejecting unauthenticated CONNECT to {host}:{port}");
            return auth::challenge_response();
        }

        let action = route_connect(port, &state.options());
        if action == ConnectAction::Reject {
            warn!("rejecting CONNECT to {host}:{port}");
            return simple_response(StatusCode::FORBIDDEN, "CONNECT port not allowed");
        }

        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    debug!("CONNECT upgrade for {host}:{port} failed: {e}");
                    return;
                }
            };
            let result = match action {
                ConnectAction::Tunnel => tunnel(upgraded, &state, &host, port).await,
                ConnectAction::HttpMitm => {
                    serve_plain_mitm(upgraded, state, host.clone(), port).await
                }
                ConnectAction::TlsMitm => {
                    serve_tls_mitm(upgraded, state, host.clone(), port).await
                }
                ConnectAction::Reject => unreachable!("rejected before upgrade"),
            };
            if let Err(e) = result {
                debug!("CONNECT session for {host}:{port} ended: {e}");
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(ProxyBody::empty())
            .expect("static response builds")
    })
}

fn split_authority(authority: &Authority) -> Option<(String, u16)> {
    let port = authority.port_u16()?;
    Some((strip_brackets(authority.host()).to_string(), port))
}

/// Opaque tunnel: dial the target (blocked hosts refused) and shuttle
/// bytes both ways.
async fn tunnel(
    upgraded: Upgraded,
    state: &ProxyState,
    host: &str,
    port: u16,
) -> anyhow::Result<()> {
    let mut upstream = dial(state, host, port).await?;
    let mut client = TokioIo::new(upgraded);
    let (to_upstream, to_client) =
        tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!("tunnel to {host}:{port} closed ({to_upstream}B out, {to_client}B in)");
    Ok(())
}

/// Plaintext MITM: speak HTTP/1.1 with the client inside the tunnel.
async fn serve_plain_mitm(
    upgraded: Upgraded,
    state: Arc<ProxyState>,
    host: String,
    port: u16,
) -> anyhow::Result<()> {
    let conn = ConnCtx {
        within_connect: true,
        tls: false,
        authority: Some(format!("{host}:{port}")),
    };
    serve_within_connect(upgraded, state, conn).await
}

/// TLS MITM: terminate the client's TLS with a forged leaf for the SNI
/// hostname (CONNECT host when SNI is absent), then speak HTTP/1.1 over
/// the decrypted stream.
async fn serve_tls_mitm(
    upgraded: Upgraded,
    state: Arc<ProxyState>,
    host: String,
    port: u16,
) -> anyhow::Result<()> {
    let Some(ca) = state.ca() else {
        anyhow::bail!("https MITM enabled but no CA material available");
    };

    let acceptor = LazyConfigAcceptor::new(
        tokio_rustls::rustls::server::Acceptor::default(),
        TokioIo::new(upgraded),
    );
    let start = acceptor.await?;
    let hostname = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .unwrap_or_else(|| host.clone());

    // A mint failure aborts the handshake; the client sees a TLS-level
    // failure and nothing is cached.
    let cert = state
        .cert_store
        .fetch(&hostname, || sign_host(&ca, &[hostname.as_str()]))?;
    let config = server_config_for_cert(&cert)?;
    let tls_stream = start.into_stream(config).await?;

    let conn = ConnCtx {
        within_connect: true,
        tls: true,
        authority: Some(format!("{host}:{port}")),
    };
    serve_within_connect(TokioIo::new(tls_stream), state, conn).await
}
