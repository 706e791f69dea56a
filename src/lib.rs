//! slimprox - bandwidth-reducing forward proxy
//!
//! A forward HTTP/HTTPS proxy that accepts browser traffic, optionally
//! intercepts TLS with a locally trusted CA, and applies a configurable
//! pipeline of response transformations: size caps, image recompression,
//! JavaScript stripping, and Brotli/gzip/deflate re-compression.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use slimprox::{CompressResponder, Options, Proxy};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let proxy = Proxy::new(Options {
//!         addresses: vec!["127.0.0.1:8080".to_string()],
//!         connect_mitm: true,
//!         ..Default::default()
//!     })?;
//!     proxy.add_responder(Arc::new(CompressResponder::new()));
//!     proxy.listen_and_serve().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - `server` / `connect` - listeners, CONNECT routing, upstream round trips
//! - `mitm` - CA material, deterministic leaf minting, certificate cache
//! - `pipeline` - requester/responder chains and runtime toggles
//! - `limiter`, `compress`, `images`, `noscript`, `typefilter` - the
//!   bundled responders

// Core proxy modules
pub mod config;
pub mod connect;
pub mod server;

// Response pipeline
pub mod body;
pub mod compress;
pub mod images;
pub mod limiter;
pub mod noscript;
pub mod pipeline;
pub mod typefilter;

// MITM
pub mod mitm;

// Shared helpers
pub mod auth;
pub mod headers;
pub mod hosts;
pub mod html;

pub use body::{Mutable, ProxyBody};
pub use compress::CompressResponder;
pub use config::Options;
pub use headers::{has_any_fold, has_any_header_value_part, has_header_value_part};
pub use hosts::{contains_host, load_hosts, load_hosts_file};
pub use images::ImageShrinkResponder;
pub use limiter::LimitBytesResponder;
pub use mitm::{sign_host, CaMaterial, CertStore, CounterRng, ForgedCert, MitmError};
pub use noscript::NoscriptResponder;
pub use pipeline::{RequestCtx, Requester, Responder, Toggle};
pub use server::Proxy;
pub use typefilter::{TypeFilterResponder, TYPE_FILTER_FONTS};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
