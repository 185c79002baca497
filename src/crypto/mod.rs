//! Cryptography module for Mirage
//!
//! The obfuscation envelope is pure AES-256-CTR keystream application plus
//! SHA-256 key mixing. There is no AEAD layer: the proxy never authenticates
//! or decrypts anything past the envelope.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};

/// Stream key length (AES-256)
pub const KEY_LEN: usize = 32;

/// Counter block length
pub const IV_LEN: usize = 16;

/// AES-256-CTR stream state for one direction of one session.
///
/// Encryption and decryption are the same XOR; the keystream position only
/// moves forward.
pub struct Aes256Ctr {
    inner: ctr::Ctr128BE<Aes256>,
}

impl Aes256Ctr {
    pub fn new(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Self {
        Self {
            inner: ctr::Ctr128BE::<Aes256>::new(key.into(), iv.into()),
        }
    }

    /// XOR the keystream into `data` in place, advancing the stream position.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}

/// Compute SHA-256
pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Fill `buf` with cryptographically secure random bytes
pub fn fill_random(buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keystream_round_trip() {
        let key = [7u8; KEY_LEN];
        let iv = [3u8; IV_LEN];

        let mut data = b"attack at dawn".to_vec();
        let original = data.clone();

        Aes256Ctr::new(&key, &iv).apply(&mut data);
        assert_ne!(data, original);

        // A second state seeded identically inverts the first.
        Aes256Ctr::new(&key, &iv).apply(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_keystream_position_advances() {
        let key = [1u8; KEY_LEN];
        let iv = [2u8; IV_LEN];

        // One state over 32 bytes must equal two applications of 16.
        let mut whole = [0u8; 32];
        Aes256Ctr::new(&key, &iv).apply(&mut whole);

        let mut split = [0u8; 32];
        let mut cipher = Aes256Ctr::new(&key, &iv);
        cipher.apply(&mut split[..16]);
        cipher.apply(&mut split[16..]);

        assert_eq!(whole, split);
    }

    #[test]
    fn test_sha256() {
        let digest = sha256(b"hello");
        assert_eq!(
            hex::encode(digest),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_fill_random() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        fill_random(&mut a);
        fill_random(&mut b);
        assert_ne!(a, b);
    }
}
