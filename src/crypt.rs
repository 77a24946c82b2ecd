//! Packet encryption.
//!
//! Datagrams are encrypted whole, in place, with a raw block cipher chained
//! CBC-style from a fixed initial vector; the leading per-packet nonce (see
//! [`crate::entropy`]) is what keeps equal plaintexts from colliding. Trailing
//! bytes short of a block are XOR-masked with the last ciphertext block. This
//! is obfuscation plus the CRC32 integrity tag, deliberately not AEAD.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};

use crate::error::CryptError;

const BLOCK_SIZE: usize = 16;

/// Chaining start state. Public and fixed; uniqueness comes from the nonce.
const INITIAL_VECTOR: [u8; BLOCK_SIZE] = [
    0x9d, 0x1f, 0x66, 0x24, 0x05, 0xc1, 0x7a, 0xb3, 0x44, 0xe8, 0x5b, 0x90, 0x2f, 0xd3, 0x0c, 0x6e,
];

/// In-place symmetric datagram encryption.
pub trait BlockCrypt: Send + Sync {
    fn encrypt(&self, buf: &mut [u8]);
    fn decrypt(&self, buf: &mut [u8]);
}

enum AesVariant {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

/// AES packet crypt; key length selects AES-128/192/256.
pub struct AesBlockCrypt {
    cipher: AesVariant,
}

impl AesBlockCrypt {
    pub fn new(key: &[u8]) -> Result<Self, CryptError> {
        let cipher = match key.len() {
            16 => AesVariant::Aes128(Aes128::new(GenericArray::from_slice(key))),
            24 => AesVariant::Aes192(Aes192::new(GenericArray::from_slice(key))),
            32 => AesVariant::Aes256(Aes256::new(GenericArray::from_slice(key))),
            n => return Err(CryptError::InvalidKeyLength(n)),
        };
        Ok(AesBlockCrypt { cipher })
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match &self.cipher {
            AesVariant::Aes128(c) => c.encrypt_block(block),
            AesVariant::Aes192(c) => c.encrypt_block(block),
            AesVariant::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match &self.cipher {
            AesVariant::Aes128(c) => c.decrypt_block(block),
            AesVariant::Aes192(c) => c.decrypt_block(block),
            AesVariant::Aes256(c) => c.decrypt_block(block),
        }
    }
}

impl BlockCrypt for AesBlockCrypt {
    fn encrypt(&self, buf: &mut [u8]) {
        let mut tbl = INITIAL_VECTOR;
        let mut chunks = buf.chunks_exact_mut(BLOCK_SIZE);
        for chunk in &mut chunks {
            for (b, t) in chunk.iter_mut().zip(tbl.iter()) {
                *b ^= t;
            }
            self.encrypt_block(chunk);
            tbl.copy_from_slice(chunk);
        }
        for (b, t) in chunks.into_remainder().iter_mut().zip(tbl.iter()) {
            *b ^= t;
        }
    }

    fn decrypt(&self, buf: &mut [u8]) {
        let mut tbl = INITIAL_VECTOR;
        let mut next = [0u8; BLOCK_SIZE];
        let mut chunks = buf.chunks_exact_mut(BLOCK_SIZE);
        for chunk in &mut chunks {
            next.copy_from_slice(chunk);
            self.decrypt_block(chunk);
            for (b, t) in chunk.iter_mut().zip(tbl.iter()) {
                *b ^= t;
            }
            tbl = next;
        }
        for (b, t) in chunks.into_remainder().iter_mut().zip(tbl.iter()) {
            *b ^= t;
        }
    }
}

/// Repeating-pad XOR "cipher". No confidentiality; test and benchmark use.
pub struct XorBlockCrypt {
    pad: [u8; BLOCK_SIZE],
}

impl XorBlockCrypt {
    pub fn new(key: &[u8]) -> Result<Self, CryptError> {
        if key.is_empty() {
            return Err(CryptError::InvalidKeyLength(0));
        }
        let mut pad = [0u8; BLOCK_SIZE];
        for (i, p) in pad.iter_mut().enumerate() {
            *p = key[i % key.len()].wrapping_add(i as u8);
        }
        Ok(XorBlockCrypt { pad })
    }

    fn apply(&self, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b ^= self.pad[i % BLOCK_SIZE];
        }
    }
}

impl BlockCrypt for XorBlockCrypt {
    fn encrypt(&self, buf: &mut [u8]) {
        self.apply(buf);
    }

    fn decrypt(&self, buf: &mut [u8]) {
        self.apply(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(crypt: &dyn BlockCrypt, len: usize) {
        let original: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut buf = original.clone();
        crypt.encrypt(&mut buf);
        if len >= BLOCK_SIZE {
            assert_ne!(buf, original, "ciphertext equals plaintext at len {}", len);
        }
        crypt.decrypt(&mut buf);
        assert_eq!(buf, original, "roundtrip mismatch at len {}", len);
    }

    #[test]
    fn aes_roundtrip_all_key_sizes() {
        for key_len in [16usize, 24, 32] {
            let key: Vec<u8> = (0..key_len).map(|i| i as u8).collect();
            let crypt = AesBlockCrypt::new(&key).unwrap();
            for len in [0usize, 1, 15, 16, 17, 31, 32, 100, 1400, 1500] {
                roundtrip(&crypt, len);
            }
        }
    }

    #[test]
    fn aes_rejects_bad_key_length() {
        assert_eq!(
            AesBlockCrypt::new(&[0u8; 7]).err(),
            Some(CryptError::InvalidKeyLength(7))
        );
    }

    #[test]
    fn wrong_key_garbles() {
        let a = AesBlockCrypt::new(&[1u8; 16]).unwrap();
        let b = AesBlockCrypt::new(&[2u8; 16]).unwrap();
        let original = vec![0x5au8; 64];
        let mut buf = original.clone();
        a.encrypt(&mut buf);
        b.decrypt(&mut buf);
        assert_ne!(buf, original);
    }

    #[test]
    fn identical_plaintexts_diverge_with_distinct_prefix() {
        // Same payload, different leading "nonce" bytes: blocks after the
        // first must differ because of chaining.
        let crypt = AesBlockCrypt::new(&[9u8; 16]).unwrap();
        let mut p1 = vec![0u8; 64];
        let mut p2 = vec![0u8; 64];
        p2[0] = 1;
        crypt.encrypt(&mut p1);
        crypt.encrypt(&mut p2);
        assert_ne!(p1[16..], p2[16..]);
    }

    #[test]
    fn xor_roundtrip() {
        let crypt = XorBlockCrypt::new(b"pass").unwrap();
        for len in [0usize, 1, 16, 33, 1500] {
            roundtrip(&crypt, len);
        }
        assert!(XorBlockCrypt::new(b"").is_err());
    }
}
