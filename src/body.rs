//! Response body plumbing.
//!
//! [`Mutable`] is an in-memory body that responders swap in for upstream
//! bodies; the final writer takes `Content-Length` from its length.
//! [`ProxyBody`] is the body type flowing through the pipeline: either the
//! upstream stream, a byte-capped wrapper around it, or a `Mutable`.

use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A buffer which may be directly mutated and used as a response body.
#[derive(Debug, Default)]
pub struct Mutable {
    buf: BytesMut,
}

impl Mutable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The unread contents.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Up to `n` bytes without consuming them. The flag is true when the
    /// buffer held fewer than `n` bytes.
    pub fn peek(&self, n: usize) -> (&[u8], bool) {
        if n <= self.buf.len() {
            (&self.buf[..n], false)
        } else {
            (&self.buf, true)
        }
    }

    /// Consume and return the whole remaining contents.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Reset to empty. Idempotent; the buffer stays reusable.
    pub fn close(&mut self) {
        self.buf.clear();
    }
}

impl io::Read for Mutable {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        Ok(n)
    }
}

impl io::Write for Mutable {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl From<&[u8]> for Mutable {
    fn from(data: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(data),
        }
    }
}

impl From<&str> for Mutable {
    fn from(data: &str) -> Self {
        Self::from(data.as_bytes())
    }
}

impl From<Vec<u8>> for Mutable {
    fn from(data: Vec<u8>) -> Self {
        Self {
            buf: BytesMut::from(&data[..]),
        }
    }
}

impl From<Bytes> for Mutable {
    fn from(data: Bytes) -> Self {
        Self::from(&data[..])
    }
}

/// Body stream errors surfaced to hyper.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("upstream body error: {0}")]
    Upstream(#[from] hyper::Error),
}

/// The response body as seen by the responder pipeline and the client
/// writer.
#[derive(Debug)]
pub enum ProxyBody {
    /// Streaming body from the upstream connection.
    Upstream(Incoming),
    /// In-memory replacement body.
    Buffer(Mutable),
    /// Byte-capped wrapper; yields at most `remaining` further bytes, then
    /// reports end of stream.
    Limited {
        inner: Box<ProxyBody>,
        remaining: u64,
    },
}

impl ProxyBody {
    pub fn empty() -> Self {
        ProxyBody::Buffer(Mutable::new())
    }

    pub fn limited(inner: ProxyBody, limit: u64) -> Self {
        ProxyBody::Limited {
            inner: Box::new(inner),
            remaining: limit,
        }
    }

    /// Length when the body is an in-memory buffer.
    pub fn buffer_len(&self) -> Option<usize> {
        match self {
            ProxyBody::Buffer(m) => Some(m.len()),
            _ => None,
        }
    }

    /// Drain the body into a [`Mutable`], reading no further than
    /// `deadline`. On deadline expiry or a stream error, whatever was
    /// collected so far is returned.
    pub async fn into_buffer(self, deadline: Instant) -> Mutable {
        let mut body = match self {
            ProxyBody::Buffer(m) => return m,
            other => other,
        };
        let mut out = Mutable::new();
        loop {
            let frame = match tokio::time::timeout_at(deadline, body.frame()).await {
                Err(_) => {
                    warn!("transform deadline hit while collecting body, passing partial body on");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!("body stream ended with error: {e}");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };
            if let Ok(data) = frame.into_data() {
                // Write to a BytesMut target cannot fail.
                let _ = out.write_all(&data);
            }
        }
        out
    }
}

impl From<Mutable> for ProxyBody {
    fn from(m: Mutable) -> Self {
        ProxyBody::Buffer(m)
    }
}

impl From<Incoming> for ProxyBody {
    fn from(b: Incoming) -> Self {
        ProxyBody::Upstream(b)
    }
}

impl Body for ProxyBody {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BodyError>>> {
        match self.get_mut() {
            ProxyBody::Buffer(m) => {
                if m.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(Frame::data(m.take()))))
                }
            }
            ProxyBody::Upstream(b) => Pin::new(b)
                .poll_frame(cx)
                .map(|opt| opt.map(|res| res.map_err(BodyError::from))),
            ProxyBody::Limited { inner, remaining } => {
                if *remaining == 0 {
                    return Poll::Ready(None);
                }
                match Pin::new(&mut **inner).poll_frame(cx) {
                    Poll::Ready(Some(Ok(frame))) => {
                        let frame = match frame.into_data() {
                            Ok(mut data) => {
                                if data.len() as u64 >= *remaining {
                                    data.truncate(*remaining as usize);
                                    *remaining = 0;
                                } else {
                                    *remaining -= data.len() as u64;
                                }
                                Frame::data(data)
                            }
                            Err(other) => other,
                        };
                        Poll::Ready(Some(Ok(frame)))
                    }
                    other => other,
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            ProxyBody::Buffer(m) => m.is_empty(),
            ProxyBody::Upstream(b) => b.is_end_stream(),
            ProxyBody::Limited { inner, remaining } => *remaining == 0 || inner.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            ProxyBody::Buffer(m) => SizeHint::with_exact(m.len() as u64),
            ProxyBody::Upstream(b) => b.size_hint(),
            ProxyBody::Limited { inner, remaining } => {
                let mut hint = inner.size_hint();
                if hint.lower() > *remaining {
                    hint.set_lower(*remaining);
                }
                match hint.upper() {
                    Some(upper) if upper <= *remaining => {}
                    _ => hint.set_upper(*remaining),
                }
                hint
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Duration;

    #[test]
    fn test_mutable_write_read_peek() {
        let mut m = Mutable::new();
        m.write_all(b"hello world").unwrap();
        assert_eq!(m.len(), 11);

        let (peeked, eof) = m.peek(5);
        assert_eq!(peeked, b"hello");
        assert!(!eof);
        assert_eq!(m.len(), 11, "peek must not consume");

        let (peeked, eof) = m.peek(100);
        assert_eq!(peeked, b"hello world");
        assert!(eof);

        let mut out = [0u8; 5];
        m.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert_eq!(Mutable::bytes(&m), b" world");
    }

    #[test]
    fn test_mutable_close_resets() {
        let mut m = Mutable::from("payload");
        m.close();
        assert!(m.is_empty());
        // Idempotent and reusable.
        m.close();
        m.write_all(b"again").unwrap();
        assert_eq!(Mutable::bytes(&m), b"again");
    }

    #[tokio::test]
    async fn test_limited_body_caps_buffer() {
        let inner = ProxyBody::Buffer(Mutable::from("0123456789"));
        let limited = ProxyBody::limited(inner, 4);
        let deadline = Instant::now() + Duration::from_secs(5);
        let out = limited.into_buffer(deadline).await;
        assert_eq!(Mutable::bytes(&out), b"0123");
    }

    #[tokio::test]
    async fn test_limited_body_passes_short_bodies() {
        let inner = ProxyBody::Buffer(Mutable::from("ok"));
        let limited = ProxyBody::limited(inner, 1024);
        let deadline = Instant::now() + Duration::from_secs(5);
        let out = limited.into_buffer(deadline).await;
        assert_eq!(Mutable::bytes(&out), b"ok");
    }
}
