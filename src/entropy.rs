//! Per-packet nonce generation.
//!
//! Every encrypted datagram leads with a 16-byte nonce so that identical
//! plaintexts never produce identical ciphertexts. The generator runs AES-128
//! over an evolving seed: unpredictable to anyone without the (random) key,
//! and non-repeating for far longer than any session lives.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptError;

/// Nonce length in bytes, equal to the AES block size.
pub const NONCE_SIZE: usize = 16;

/// AES-128 based nonce source.
///
/// Each call encrypts the internal seed in place and hands out the result,
/// so consecutive values form an unpredictable permutation walk.
pub struct NonceAes128 {
    seed: [u8; NONCE_SIZE],
    cipher: Aes128,
}

impl NonceAes128 {
    /// Seeds key and state from the OS entropy source.
    ///
    /// Failure here is fatal to session creation: without entropy the nonce
    /// stream would be guessable.
    pub fn new() -> Result<Self, CryptError> {
        let mut key = [0u8; 16];
        let mut seed = [0u8; NONCE_SIZE];
        OsRng
            .try_fill_bytes(&mut key)
            .map_err(|_| CryptError::EntropyUnavailable)?;
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|_| CryptError::EntropyUnavailable)?;
        Ok(NonceAes128 {
            seed,
            cipher: Aes128::new(&key.into()),
        })
    }

    /// Writes the next nonce into `nonce` (first [`NONCE_SIZE`] bytes).
    pub fn fill(&mut self, nonce: &mut [u8]) {
        self.cipher.encrypt_block((&mut self.seed).into());
        let n = nonce.len().min(NONCE_SIZE);
        nonce[..n].copy_from_slice(&self.seed[..n]);
    }
}
