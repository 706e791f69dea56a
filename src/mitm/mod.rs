//! TLS interception (MITM) support.
//!
//! This module covers everything between a routed CONNECT and a decrypted
//! stream:
//! - CA material loading and ephemeral CA generation
//! - deterministic leaf key generation (AES-CTR CSPRNG over the CA key)
//! - per-host certificate forging
//! - the bounded forged-certificate cache
//! - rustls configs for both directions

pub mod cert_cache;
pub mod certsign;
pub mod error;
pub mod rand;
pub mod tls_config;

pub use cert_cache::{CertStore, MAX_CACHED_CERTS};
pub use certsign::{sign_host, CaKey, CaMaterial, ForgedCert};
pub use error::{MitmError, Result};
pub use rand::CounterRng;
pub use tls_config::{server_config_for_cert, upstream_client_config};
