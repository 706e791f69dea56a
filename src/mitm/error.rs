//! MITM error types.

use thiserror::Error;

/// Result type for MITM operations.
pub type Result<T> = std::result::Result<T, MitmError>;

/// Errors from CA handling, certificate forging, and MITM TLS setup.
/// These fail the TLS handshake being established; they never reach the
/// response pipeline.
#[derive(Debug, Error)]
pub enum MitmError {
    /// CA certificate or key could not be parsed.
    #[error("failed to parse CA material: {0}")]
    CaParse(String),

    /// The CA key is neither RSA nor an EC P-256 key.
    #[error("unsupported CA key type: {0}")]
    UnsupportedKeyType(String),

    /// Private key (de)serialization failed.
    #[error("key marshaling failed: {0}")]
    KeyMarshal(String),

    /// OS randomness was unavailable.
    #[error("RNG failure: {0}")]
    Rng(String),

    /// Leaf certificate could not be built or signed.
    #[error("failed to generate certificate for {host}: {reason}")]
    CertGeneration { host: String, reason: String },

    /// rustls rejected the forged certificate chain.
    #[error("TLS configuration failed: {0}")]
    TlsConfig(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MitmError {
    pub fn cert_generation(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertGeneration {
            host: host.into(),
            reason: msg.into(),
        }
    }
}
