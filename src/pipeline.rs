//! Request/response transformation pipeline.
//!
//! Responders run on every intercepted response, in insertion order. They
//! may swap the body for a [`crate::body::Mutable`] and mutate headers,
//! and always return a response. Requesters run before any upstream I/O
//! and may short-circuit the round trip with their own response.
//!
//! Both lists are append-only; readers take a snapshot and iterate without
//! holding the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, Request, Response, Uri};
use tokio::time::Instant;

use crate::body::ProxyBody;

/// Time allowed for response transformations (not for streaming the result back
/// to the client). Body collection past this point is abandoned and the
/// partially-collected body flows through.
pub const TRANSFORM_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-request data handed to every responder.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    pub method: Method,
    /// Effective request URI; the path is what the type filter matches.
    pub uri: Uri,
    /// The request headers as the client sent them, in particular with the
    /// original `Accept-Encoding` intact.
    pub headers: HeaderMap,
    /// True for requests read out of an established CONNECT session.
    pub within_connect: bool,
    /// Transform deadline for this request.
    pub deadline: Instant,
}

impl RequestCtx {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, within_connect: bool) -> Self {
        Self {
            method,
            uri,
            headers,
            within_connect,
            deadline: Instant::now() + TRANSFORM_TIMEOUT,
        }
    }
}

/// Handles a request before it is sent upstream. Returning `Err(response)`
/// finishes the request early.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn request(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Request<ProxyBody>, Response<ProxyBody>>;
}

/// Transforms a response. Must return a response; failures are expressed
/// as substituted sentinel responses, never as errors.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn response(&self, ctx: &RequestCtx, resp: Response<ProxyBody>) -> Response<ProxyBody>;
}

/// Runtime enable/disable bit, consulted on every call. Enabled when zero
/// so the default is on.
#[derive(Debug, Default)]
pub struct Toggle {
    disabled: AtomicBool,
}

impl Toggle {
    pub fn enabled(&self) -> bool {
        !self.disabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.disabled.store(!enabled, Ordering::Relaxed);
    }
}

/// Append-only handler list. Additions are synchronized; readers clone the
/// current list of handles and iterate lock-free.
pub struct Pipeline<T: ?Sized> {
    items: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> Default for Pipeline<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> Pipeline<T> {
    pub fn add(&self, item: Arc<T>) {
        self.items.write().expect("pipeline lock poisoned").push(item);
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.items.read().expect("pipeline lock poisoned").clone()
    }
}

/// After the pipeline: when the final body is an in-memory buffer, take
/// `Content-Length` from its length and drop any stale framing header.
pub fn finalize_content_length(resp: &mut Response<ProxyBody>) {
    if let Some(len) = resp.body().buffer_len() {
        resp.headers_mut().remove(TRANSFER_ENCODING);
        resp.headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(len));
    }
}
