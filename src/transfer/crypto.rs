//! Chunk encryption.
//!
//! Chunks are sealed with ChaCha20-Poly1305 under a per-account key derived
//! from the account secret with HKDF-SHA256. Each sealed chunk is
//! `nonce || ciphertext || tag`, with a fresh random nonce.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use super::error::TransferError;

const KEY_INFO: &[u8] = b"stormcloud-chunk-key-v1";
const NONCE_LEN: usize = 12;

pub struct ChunkCipher {
    aead: ChaCha20Poly1305,
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChunkCipher(<redacted>)")
    }
}

impl ChunkCipher {
    pub fn from_secret(secret: &[u8]) -> Result<Self, TransferError> {
        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut key = [0u8; 32];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|_| TransferError::Crypto)?;
        Ok(Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, TransferError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext)
            .map_err(|_| TransferError::Crypto)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, TransferError> {
        if sealed.len() < NONCE_LEN {
            return Err(TransferError::Crypto);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TransferError::Crypto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let cipher = ChunkCipher::from_secret(b"account secret material").unwrap();
        let sealed = cipher.seal(b"chunk bytes").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"chunk bytes");
        assert_eq!(cipher.open(&sealed).unwrap(), b"chunk bytes");
    }

    #[test]
    fn test_nonces_differ() {
        let cipher = ChunkCipher::from_secret(b"account secret material").unwrap();
        assert_ne!(cipher.seal(b"x").unwrap(), cipher.seal(b"x").unwrap());
    }

    #[test]
    fn test_wrong_key_and_tamper_rejected() {
        let a = ChunkCipher::from_secret(b"secret a secret a").unwrap();
        let b = ChunkCipher::from_secret(b"secret b secret b").unwrap();
        let mut sealed = a.seal(b"payload").unwrap();
        assert!(matches!(b.open(&sealed), Err(TransferError::Crypto)));

        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(a.open(&sealed), Err(TransferError::Crypto)));
        assert!(matches!(a.open(&[0u8; 4]), Err(TransferError::Crypto)));
    }
}
