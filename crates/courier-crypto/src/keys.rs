use std::fmt;

use rand_core::{OsRng, RngCore};

use crate::error::{CryptoError, Result};

/// AES-256 key length in bytes.
pub const KEY_SIZE: usize = 32;

/// CBC initialization vector length in bytes (one AES block).
pub const IV_SIZE: usize = 16;

/// Symmetric key material for one session. Never reused across sessions.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub key: [u8; KEY_SIZE],
    pub iv: [u8; IV_SIZE],
}

impl SessionKeys {
    /// Generate a fresh random 256-bit key and 128-bit IV.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    /// Build key material from bytes received off the wire.
    pub fn from_parts(key: &[u8], iv: &[u8]) -> Result<Self> {
        let key: [u8; KEY_SIZE] = key.try_into().map_err(|_| CryptoError::InvalidKeyMaterial {
            expected: KEY_SIZE,
            actual: key.len(),
        })?;
        let iv: [u8; IV_SIZE] = iv.try_into().map_err(|_| CryptoError::InvalidKeyMaterial {
            expected: IV_SIZE,
            actual: iv.len(),
        })?;
        Ok(Self { key, iv })
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("key", &"<redacted>")
            .field("iv", &hex::encode(self.iv))
            .finish()
    }
}
