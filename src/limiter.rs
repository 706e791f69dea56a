//! Response size capping.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::Response;

use crate::body::ProxyBody;
use crate::pipeline::{RequestCtx, Responder};

/// Caps response bodies at a configurable byte count. Download MIME types
/// (`application/octet-stream`) are exempted so deliberate large transfers
/// are not corrupted. A limit of zero or less disables the cap.
#[derive(Default)]
pub struct LimitBytesResponder {
    limit: AtomicI64,
}

impl LimitBytesResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit_bytes: i64) {
        self.limit.store(limit_bytes, Ordering::Relaxed);
    }
}

#[async_trait]
impl Responder for LimitBytesResponder {
    async fn response(&self, _ctx: &RequestCtx, resp: Response<ProxyBody>) -> Response<ProxyBody> {
        let limit_bytes = self.limit();
        if limit_bytes <= 0 {
            return resp;
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if content_type.is_empty() || content_type.starts_with("application/octet-stream") {
            return resp;
        }
        let (mut parts, body) = resp.into_parts();
        // A stored length beyond the cap would contradict the truncated
        // stream; drop it and let the connection frame the body.
        let declared = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.map_or(true, |len| len > limit_bytes as u64) {
            parts.headers.remove(CONTENT_LENGTH);
        }
        Response::from_parts(parts, ProxyBody::limited(body, limit_bytes as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Mutable;
    use crate::pipeline::RequestCtx;
    use http::{HeaderMap, Method, Uri};

    fn ctx() -> RequestCtx {
        RequestCtx::new(
            Method::GET,
            Uri::from_static("http://example.com/big.txt"),
            HeaderMap::new(),
            false,
        )
    }

    fn text_response(body: &str) -> Response<ProxyBody> {
        Response::builder()
            .header(CONTENT_TYPE, "text/plain")
            .body(ProxyBody::from(Mutable::from(body)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_limit_truncates_text() {
        let limiter = LimitBytesResponder::new();
        limiter.set_limit(4);
        let ctx = ctx();
        let resp = limiter.response(&ctx, text_response("0123456789")).await;
        let out = resp.into_body().into_buffer(ctx.deadline).await;
        assert_eq!(out.bytes(), b"0123");
    }

    #[tokio::test]
    async fn test_zero_limit_disables() {
        let limiter = LimitBytesResponder::new();
        let ctx = ctx();
        let resp = limiter.response(&ctx, text_response("0123456789")).await;
        let out = resp.into_body().into_buffer(ctx.deadline).await;
        assert_eq!(out.bytes(), b"0123456789");
    }

    #[tokio::test]
    async fn test_downloads_exempt() {
        let limiter = LimitBytesResponder::new();
        limiter.set_limit(4);
        let ctx = ctx();
        let resp = Response::builder()
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(ProxyBody::from(Mutable::from("0123456789")))
            .unwrap();
        let resp = limiter.response(&ctx, resp).await;
        let out = resp.into_body().into_buffer(ctx.deadline).await;
        assert_eq!(out.bytes(), b"0123456789");
    }

    #[tokio::test]
    async fn test_untyped_responses_exempt() {
        let limiter = LimitBytesResponder::new();
        limiter.set_limit(4);
        let ctx = ctx();
        let resp = Response::builder()
            .body(ProxyBody::from(Mutable::from("0123456789")))
            .unwrap();
        let resp = limiter.response(&ctx, resp).await;
        let out = resp.into_body().into_buffer(ctx.deadline).await;
        assert_eq!(out.bytes(), b"0123456789");
    }

    #[tokio::test]
    async fn test_oversized_content_length_dropped() {
        let limiter = LimitBytesResponder::new();
        limiter.set_limit(4);
        let ctx = ctx();
        let resp = Response::builder()
            .header(CONTENT_TYPE, "text/plain")
            .header(CONTENT_LENGTH, "10")
            .body(ProxyBody::from(Mutable::from("0123456789")))
            .unwrap();
        let resp = limiter.response(&ctx, resp).await;
        assert!(resp.headers().get(CONTENT_LENGTH).is_none());
    }
}
