//! Image downscaling and re-encoding.
//!
//! Decodes image responses, auto-orients them per EXIF, resizes anything
//! over 1024px on the long edge, and re-encodes as WebP when the client
//! accepts it, JPEG otherwise. Undecodable images become a small embedded
//! "broken image" PNG with status 500.

use async_trait::async_trait;
use base64::Engine;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderValue, Response, StatusCode};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use lazy_static::lazy_static;
use tracing::warn;

use crate::body::{Mutable, ProxyBody};
use crate::headers::has_any_header_value_part;
use crate::pipeline::{RequestCtx, Responder, Toggle};

const WEBP_TYPE: &str = "image/webp";
const JPEG_TYPE: &str = "image/jpeg";
const MAX_IMG_DIM: u32 = 1024;
/// WebP stays acceptable at far lower quality settings than JPEG.
const WEBP_QUALITY: f32 = 10.0;
const JPEG_QUALITY: u8 = 20;

lazy_static! {
    static ref BAD_IMG: Vec<u8> = base64::engine::general_purpose::STANDARD
        .decode(BAD_IMG_BASE64)
        .expect("embedded sentinel image decodes");
}
const BAD_IMG_TYPE: &str = "image/png";

#[derive(Default)]
pub struct ImageShrinkResponder {
    pub toggle: Toggle,
}

impl ImageShrinkResponder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Responder for ImageShrinkResponder {
    async fn response(&self, ctx: &RequestCtx, resp: Response<ProxyBody>) -> Response<ProxyBody> {
        if !self.toggle.enabled() {
            return resp;
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("image/")
            || content_type == "image/x-icon"
            || content_type == "image/vnd.microsoft.icon"
            || content_type.ends_with("+xml")
            || content_type.ends_with("+json")
        {
            return resp;
        }

        let accept_empty = ctx.headers.get_all(ACCEPT).iter().next().is_none();
        let can_webp = has_any_header_value_part(ctx.headers.get_all(ACCEPT), WEBP_TYPE)
            || (content_type == WEBP_TYPE
                && (accept_empty
                    || has_any_header_value_part(ctx.headers.get_all(ACCEPT), "*/*")));

        let (mut parts, body) = resp.into_parts();
        let input = body.into_buffer(ctx.deadline).await;

        match shrink(input.bytes(), can_webp) {
            Ok((encoded, dest_type)) => {
                parts
                    .headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static(dest_type));
                Response::from_parts(parts, ProxyBody::from(Mutable::from(encoded)))
            }
            Err(e) => {
                warn!("error converting image from {content_type}: {e}");
                parts.status = StatusCode::INTERNAL_SERVER_ERROR;
                parts
                    .headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static(BAD_IMG_TYPE));
                Response::from_parts(parts, ProxyBody::from(Mutable::from(BAD_IMG.clone())))
            }
        }
    }
}

/// Decode, orient, downscale, and re-encode `data`.
fn shrink(data: &[u8], want_webp: bool) -> Result<(Vec<u8>, &'static str), image::ImageError> {
    let img = image::load_from_memory(data)?;
    let mut img = auto_orient(img, exif_orientation(data));

    let (w, h) = (img.width(), img.height());
    if w > MAX_IMG_DIM || h > MAX_IMG_DIM {
        let ratio = if w > h {
            f64::from(MAX_IMG_DIM) / f64::from(w)
        } else {
            f64::from(MAX_IMG_DIM) / f64::from(h)
        };
        let new_w = (f64::from(w) * ratio) as u32;
        let new_h = (f64::from(h) * ratio) as u32;
        img = img.resize_exact(new_w.max(1), new_h.max(1), FilterType::Lanczos3);
    }

    if want_webp {
        let rgba = img.to_rgba8();
        let encoded = webp::Encoder::from_rgba(&rgba, img.width(), img.height())
            .encode(WEBP_QUALITY)
            .to_vec();
        Ok((encoded, WEBP_TYPE))
    } else {
        let rgb = img.to_rgb8();
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
        encoder.encode(
            rgb.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgb8,
        )?;
        Ok((out, JPEG_TYPE))
    }
}

/// Orientation tag from EXIF metadata, 1 when absent.
fn exif_orientation(data: &[u8]) -> u32 {
    let mut cursor = std::io::Cursor::new(data);
    match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(meta) => meta
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    }
}

fn auto_orient(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

const BAD_IMG_BASE64: &str = "iVBORw0KGgoAAAANSUhEUgAAACIAAAAiCAMAAAANmfvwAAABa1BMVEUAAAAiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyIiiyKKpJssAAAAeHRSTlMAAQIDBAUGBwgJCwwNDg8SFBUWFxgZGhwdHiAhIyQmJyosLzEyNjg5Ojw9P0BBSUpMTU5RUlRWV1hZW1xdXmFjZ2xtcXR1eHl+gIOFi46Rl5qdnqCio6WmqqutsLK8wMPFx8jKzM/R09XZ2tze4uTo6fHz9ff5+/1dImJTAAABnklEQVQYGa3BaVsSYQCG0WcaoaAUFDfKNAmkXa0sK9M2K5dKNCu3ytCC0IxY5v75zQsOFyB88xydvr7pVLZQyKYe9qq15AE1uTGdNLhHRXY3j5EeUJNxXB/Hzsl15tLrEnBHDeaBzR7VnH0LzKvOBPBADWJlGFdNFIipSaQMUXn2YULyjQbkGQ5JcdjTsRuwKtl/KAVVtQiD0hIkVXUIF6QeIK6qI5iSApBTxQAsS7J2yPlU9Yh8l6QF6JcxA1dkdFryBG25RuCxjHWw1ZINazIOKKqNIr9llEirjTRFGQX21cZP/snIUFYbDhkZH8AnIzC9+KxfdfywIuMuxOW6Wca1pIqOTktKwD0ZIViRFOUwFujdYEbGJBFpDbpV8R3C0joRSVam6Jcr5XQoAr9UNQRbElkZo3zySZO8kbYhpmOfYVbXr6piFufrXzYszcE3eYJ5uCVP5NXm+5h0G5xu1VwEnqvBCyCpOgngx5BqLqeBp2rQdwTs3g/7LMsfnkoDTkJN/As02ArppK5lB8/OiFqzh5+8+7K9+vLaeZ26/w2hg7si3OgUAAAAAElFTkSuQmCC";

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, Uri};

    fn ctx_with_accept(accept: Option<&str>) -> RequestCtx {
        let mut headers = HeaderMap::new();
        if let Some(a) = accept {
            headers.insert(ACCEPT, a.parse().unwrap());
        }
        RequestCtx::new(
            Method::GET,
            Uri::from_static("http://example.com/pic.png"),
            headers,
            false,
        )
    }

    fn png_response(width: u32, height: u32) -> Response<ProxyBody> {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut data = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut data), image::ImageFormat::Png)
            .unwrap();
        Response::builder()
            .header(CONTENT_TYPE, "image/png")
            .body(ProxyBody::from(Mutable::from(data)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_large_image_downscaled_to_jpeg() {
        let responder = ImageShrinkResponder::new();
        let ctx = ctx_with_accept(Some("image/png"));
        let resp = responder.response(&ctx, png_response(2048, 512)).await;
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), JPEG_TYPE);
        let body = resp.into_body().into_buffer(ctx.deadline).await;
        let img = image::load_from_memory(body.bytes()).unwrap();
        assert_eq!((img.width(), img.height()), (1024, 256));
    }

    #[tokio::test]
    async fn test_webp_when_accepted() {
        let responder = ImageShrinkResponder::new();
        let ctx = ctx_with_accept(Some("image/avif,image/webp,*/*"));
        let resp = responder.response(&ctx, png_response(64, 64)).await;
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), WEBP_TYPE);
        let body = resp.into_body().into_buffer(ctx.deadline).await;
        assert_eq!(&body.bytes()[..4], b"RIFF");
    }

    #[tokio::test]
    async fn test_small_image_kept_small() {
        let responder = ImageShrinkResponder::new();
        let ctx = ctx_with_accept(None);
        let resp = responder.response(&ctx, png_response(100, 50)).await;
        let body = resp.into_body().into_buffer(ctx.deadline).await;
        let img = image::load_from_memory(body.bytes()).unwrap();
        assert_eq!((img.width(), img.height()), (100, 50));
    }

    #[tokio::test]
    async fn test_broken_image_sentinel() {
        let responder = ImageShrinkResponder::new();
        let ctx = ctx_with_accept(None);
        let resp = Response::builder()
            .header(CONTENT_TYPE, "image/png")
            .body(ProxyBody::from(Mutable::from("not an image")))
            .unwrap();
        let resp = responder.response(&ctx, resp).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), BAD_IMG_TYPE);
        let body = resp.into_body().into_buffer(ctx.deadline).await;
        assert_eq!(body.bytes(), &BAD_IMG[..]);
    }

    #[tokio::test]
    async fn test_svg_and_icons_untouched() {
        let responder = ImageShrinkResponder::new();
        let ctx = ctx_with_accept(None);
        for content_type in ["image/svg+xml", "image/x-icon", "image/vnd.microsoft.icon"] {
            let resp = Response::builder()
                .header(CONTENT_TYPE, content_type)
                .body(ProxyBody::from(Mutable::from("raw")))
                .unwrap();
            let resp = responder.response(&ctx, resp).await;
            assert_eq!(resp.status(), StatusCode::OK, "{content_type}");
            let body = resp.into_body().into_buffer(ctx.deadline).await;
            assert_eq!(body.bytes(), b"raw", "{content_type}");
        }
    }
}
