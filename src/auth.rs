//! Basic proxy authentication.
//!
//! Credentials are configured as a single `user:pass` string. The
//! username comparison is case-insensitive, the password is exact. A
//! failed check yields `407 Proxy Authentication Required` with the
//! `Proxy` realm; for CONNECT that refusal means the tunnel is never
//! established. Requests inside an authenticated CONNECT session are not
//! re-challenged.

use base64::Engine;
use http::header::{HeaderMap, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{Response, StatusCode};

use crate::body::{Mutable, ProxyBody};

pub const PROXY_REALM: &str = "Proxy";

/// Check `user`/`pass` against the configured `user:pass` string.
pub fn check_credentials(configured: &str, user: &str, pass: &str) -> bool {
    let Some((username, password)) = configured.split_once(':') else {
        return false;
    };
    user.eq_ignore_ascii_case(username) && pass == password
}

/// Validate the `Proxy-Authorization` header of a request against the
/// configured credentials. An empty configuration means auth is off.
pub fn authorized(configured: &str, headers: &HeaderMap) -> bool {
    if configured.is_empty() {
        return true;
    }
    let Some(value) = headers
        .get(PROXY_AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some((scheme, encoded)) = value.split_once(' ') else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return false;
    }
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };
    check_credentials(configured, user, pass)
}

/// The `407` challenge sent on a failed or missing authorization.
pub fn challenge_response() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        .header(PROXY_AUTHENTICATE, format!("Basic realm=\"{PROXY_REALM}\""))
        .body(ProxyBody::from(Mutable::from(
            "Proxy Authentication Required",
        )))
        .expect("static response builds")
}
