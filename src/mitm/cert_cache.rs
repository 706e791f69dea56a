//! Forged certificate cache.
//!
//! Bounded store keyed by lowercased hostname. The whole fetch operation
//! is serialized under one mutex, so a key is never minted twice and the
//! bound is never exceeded; generation for one host does block other
//! lookups for its duration.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use std::sync::Arc;

use tracing::debug;

use super::certsign::ForgedCert;
use super::error::Result;

/// Hard cap on stored certificates.
pub const MAX_CACHED_CERTS: usize = 50;
/// Entries older than this are evicted first when the store is full.
const MAX_ENTRY_AGE: Duration = Duration::from_secs(60 * 60);

struct CertEntry {
    cert: Arc<ForgedCert>,
    inserted_at: Instant,
}

/// Thread-safe `hostname -> certificate` store with age-biased eviction.
#[derive(Default)]
pub struct CertStore {
    entries: Mutex<HashMap<String, CertEntry>>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached certificate for `hostname`, minting one with
    /// `gen` on a miss. On overflow, entries older than an hour go first,
    /// then arbitrary entries until the store is back under the cap. A
    /// `gen` error is propagated unchanged and nothing is stored.
    pub fn fetch<F>(&self, hostname: &str, gen: F) -> Result<Arc<ForgedCert>>
    where
        F: FnOnce() -> Result<ForgedCert>,
    {
        let mut entries = self.entries.lock().expect("cert store lock poisoned");
        let key = hostname.to_lowercase();
        if let Some(entry) = entries.get(&key) {
            return Ok(Arc::clone(&entry.cert));
        }
        let now = Instant::now();
        if entries.len() >= MAX_CACHED_CERTS {
            entries.retain(|_, e| now.duration_since(e.inserted_at) < MAX_ENTRY_AGE);
            while entries.len() >= MAX_CACHED_CERTS {
                let Some(victim) = entries.keys().next().cloned() else {
                    break;
                };
                entries.remove(&victim);
            }
            debug!(len = entries.len(), "evicted cached certificates");
        }
        let cert = Arc::new(gen()?);
        entries.insert(
            key,
            CertEntry {
                cert: Arc::clone(&cert),
                inserted_at: now,
            },
        );
        Ok(cert)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cert store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
