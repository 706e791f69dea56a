//! Deterministic CSPRNG for certificate minting.
//!
//! An AES-128-CTR keystream keyed from the CA private key and seeded per
//! mint, so the same CA reproducibly derives the same leaf key material
//! for the same seed. This is not a general-purpose RNG: its security
//! rests entirely on the secrecy of the CA key.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use super::certsign::CaKey;
use super::error::Result;

/// AES-128 block and key size.
pub const BLOCK_SIZE: usize = 16;

/// Counter-mode keystream generator.
///
/// Key: the first [`BLOCK_SIZE`] bytes of `SHA-256(marshal(ca_key))`,
/// where RSA keys marshal as PKCS#1 and EC keys as SEC1. Counter: the
/// first [`BLOCK_SIZE`] bytes of `SHA-256(seed)`, all zero when no seed is
/// given. The counter increments little-endian with carry.
pub struct CounterRng {
    cipher: Aes128,
    counter: [u8; BLOCK_SIZE],
    block: [u8; BLOCK_SIZE],
    used: usize,
}

impl CounterRng {
    /// Build from the CA private key and a per-mint seed.
    ///
    /// Fails when the key cannot be marshaled; an unsupported key type
    /// never gets this far (see [`CaKey`]).
    pub fn from_ca_key(key: &CaKey, seed: &[u8]) -> Result<Self> {
        let marshaled = key.marshal()?;
        Ok(Self::from_key_bytes(&marshaled, seed))
    }

    /// Build directly from key material bytes.
    pub fn from_key_bytes(key_material: &[u8], seed: &[u8]) -> Self {
        let key_digest = Sha256::digest(key_material);
        let cipher = Aes128::new(GenericArray::from_slice(&key_digest[..BLOCK_SIZE]));
        let mut counter = [0u8; BLOCK_SIZE];
        if !seed.is_empty() {
            let seed_digest = Sha256::digest(seed);
            counter.copy_from_slice(&seed_digest[..BLOCK_SIZE]);
        }
        Self {
            cipher,
            counter,
            block: [0u8; BLOCK_SIZE],
            used: BLOCK_SIZE,
        }
    }

    fn refill(&mut self) {
        let mut block = GenericArray::clone_from_slice(&self.counter);
        self.cipher.encrypt_block(&mut block);
        self.block.copy_from_slice(&block);
        for byte in self.counter.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
        self.used = 0;
    }

    /// Fill `out` with keystream bytes.
    pub fn fill(&mut self, out: &mut [u8]) {
        let mut filled = 0;
        while filled < out.len() {
            if self.used == BLOCK_SIZE {
                self.refill();
            }
            let n = (BLOCK_SIZE - self.used).min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&self.block[self.used..self.used + n]);
            self.used += n;
            filled += n;
        }
    }
}

impl RngCore for CounterRng {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.fill(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.fill(dest);
        Ok(())
    }
}

impl CryptoRng for CounterRng {}
