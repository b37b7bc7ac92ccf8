//! Sealing payloads with AEAD.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;

use crate::error::{Error, Result};
use crate::hashing::BlockId;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Encrypts and decrypts repository payloads with AES-256-GCM.
///
/// Block payloads use the leading bytes of the block's HMAC digest as the
/// nonce: ids are unique per payload, so nonces never repeat under one key,
/// and identical payloads produce identical ciphertexts - which is what keeps
/// repeated puts idempotent all the way down to the store.
///
/// Everything that isn't named by its own HMAC (index blobs, the bootstrap
/// envelope) gets a random nonce prepended to the ciphertext instead.
#[derive(Clone)]
pub struct BlockCipher {
    cipher: Aes256Gcm,
}

impl BlockCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Seal a block payload under its id-derived nonce.
    pub fn seal_block(&self, id: &BlockId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(&id.digest()[..NONCE_LEN]);
        self.cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::corrupt(format!("could not seal block {id}")))
    }

    /// Open a block payload; fails with [`Error::Corrupt`] on any tampering.
    pub fn open_block(&self, id: &BlockId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(&id.digest()[..NONCE_LEN]);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::corrupt(format!("AEAD open failed for block {id}")))
    }

    /// Seal with a fresh random nonce, prepended to the result.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::corrupt("could not seal payload"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a [`seal`](Self::seal)ed payload.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(Error::corrupt("sealed payload shorter than its nonce"));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::corrupt("AEAD open failed"))
    }
}

/// Fresh random key material.
pub fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
