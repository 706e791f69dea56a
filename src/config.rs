//! Proxy options.
//!
//! Options are held behind a reader/writer lock in the proxy and mutated
//! only by copy-on-write swaps: readers always get a deep copy and never
//! retain pointers into a shared buffer. The CA material is the exception
//! by design: it is immutable, loaded once, and shared read-only.

use std::sync::Arc;

use crate::mitm::CaMaterial;

/// The proxy configuration record.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Verbose logging.
    pub verbose: bool,
    /// Listen addresses, e.g. `127.0.0.1:8080`.
    pub addresses: Vec<String>,
    /// Skip upstream TLS verification.
    pub insecure_skip_verify: bool,
    /// Hosts that are never dialed.
    pub block_hosts: Vec<String>,
    /// Read HTTP out of CONNECT tunnels to port 80.
    pub connect_mitm: bool,
    /// Decrypt CONNECT tunnels to port 443 with forged certificates.
    pub https_mitm: bool,
    /// CA used to sign forged leaves. When MITM is enabled without one,
    /// the proxy generates an ephemeral CA at startup.
    pub ca: Option<Arc<CaMaterial>>,
    /// Proxy credentials as `user:pass`; empty disables auth.
    pub auth: String,
}

impl Options {
    /// A read-only deep copy. Shared state (the CA) stays shared.
    pub fn copy(&self) -> Options {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_is_deep_for_lists() {
        let opts = Options {
            addresses: vec!["127.0.0.1:8080".to_string()],
            block_hosts: vec!["ads.example".to_string()],
            ..Default::default()
        };
        let mut copy = opts.copy();
        copy.block_hosts.push("more.example".to_string());
        assert_eq!(opts.block_hosts.len(), 1);
        assert_eq!(copy.block_hosts.len(), 2);
    }
}
