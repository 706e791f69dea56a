//! Textual response re-compression.
//!
//! Re-encodes compressible bodies with Brotli, gzip, or deflate, chosen in
//! that order from what the client's original `Accept-Encoding`
//! advertised. Bodies shorter than 256 bytes are left unencoded.

use std::io::Write;

use async_trait::async_trait;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderValue, Response};
use tracing::warn;

use crate::body::{Mutable, ProxyBody};
use crate::headers::{has_any_header_value_part, mime_type};
use crate::pipeline::{RequestCtx, Responder, Toggle};

/// Matches the library's default preset.
const BROTLI_QUALITY: u32 = 6;
const BROTLI_WINDOW: u32 = 22;
const BROTLI_BUFFER: usize = 4096;
/// Level 5 trades a little ratio for much less CPU than the default.
const FLATE_LEVEL: u32 = 5;
/// Bodies shorter than this are not worth compressing.
const MIN_COMPRESS_LEN: usize = 256;

#[derive(Default)]
pub struct CompressResponder {
    pub toggle: Toggle,
}

impl CompressResponder {
    pub fn new() -> Self {
        Self::default()
    }
}

fn compressible_mime(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime == "application/javascript"
        || mime == "application/json"
        || mime.ends_with("+xml")
        || mime.ends_with("+json")
}

fn encode(data: &[u8], encoding: &str) -> std::io::Result<Mutable> {
    let mut outbuf = Mutable::new();
    match encoding {
        "br" => {
            let mut dest =
                brotli::CompressorWriter::new(&mut outbuf, BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_WINDOW);
            dest.write_all(data)?;
            dest.flush()?;
        }
        "gzip" => {
            let mut dest =
                flate2::write::GzEncoder::new(&mut outbuf, flate2::Compression::new(FLATE_LEVEL));
            dest.write_all(data)?;
            dest.finish()?;
        }
        "deflate" => {
            let mut dest = flate2::write::DeflateEncoder::new(
                &mut outbuf,
                flate2::Compression::new(FLATE_LEVEL),
            );
            dest.write_all(data)?;
            dest.finish()?;
        }
        other => unreachable!("unknown encoding {other}"),
    }
    Ok(outbuf)
}

#[async_trait]
impl Responder for CompressResponder {
    async fn response(&self, ctx: &RequestCtx, resp: Response<ProxyBody>) -> Response<ProxyBody> {
        if !self.toggle.enabled() {
            return resp;
        }
        let can_brotli = has_any_header_value_part(ctx.headers.get_all(ACCEPT_ENCODING), "br");
        let can_gzip = has_any_header_value_part(ctx.headers.get_all(ACCEPT_ENCODING), "gzip");
        let can_deflate = has_any_header_value_part(ctx.headers.get_all(ACCEPT_ENCODING), "deflate");
        if !(can_brotli || can_gzip || can_deflate) {
            return resp;
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !compressible_mime(mime_type(&content_type)) {
            return resp;
        }
        // Responses that already carry an encoding are left alone.
        if resp.headers().contains_key(CONTENT_ENCODING) {
            return resp;
        }

        let (mut parts, body) = resp.into_parts();
        let input = body.into_buffer(ctx.deadline).await;
        let (_, short) = input.peek(MIN_COMPRESS_LEN);
        if short {
            // Not worth compressing; the buffered body still replaces the
            // stream so Content-Length can be recomputed.
            return Response::from_parts(parts, ProxyBody::from(input));
        }

        let encoding = if can_brotli {
            "br"
        } else if can_gzip {
            "gzip"
        } else {
            "deflate"
        };
        match encode(input.bytes(), encoding) {
            Ok(outbuf) => {
                parts
                    .headers
                    .insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
                Response::from_parts(parts, ProxyBody::from(outbuf))
            }
            Err(e) => {
                warn!("compression with {encoding} failed: {e}, passing body through");
                Response::from_parts(parts, ProxyBody::from(input))
            }
        }
    }
}
