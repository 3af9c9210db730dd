/// RSA-OAEP (SHA-256) used during the handshake.
///
/// The receiver owns a [`SessionKeyPair`] generated fresh for every session and
/// publishes the public half as SPKI PEM. The sender parses it into a
/// [`PeerPublicKey`] and encrypts credentials and the symmetric key with it.

use rand_core::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::{CryptoError, Result};

/// Modulus size used for session keypairs.
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Smallest modulus that still fits a 32-byte key under OAEP-SHA256.
pub const MIN_RSA_BITS: usize = 1024;

pub struct SessionKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl SessionKeyPair {
    pub fn generate(bits: usize) -> Result<Self> {
        if bits < MIN_RSA_BITS {
            return Err(CryptoError::KeyGeneration(format!(
                "modulus of {} bits is below the {} bit minimum",
                bits, MIN_RSA_BITS
            )));
        }
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    pub fn public_key_pem(&self) -> Result<String> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }
}

/// The remote side's public key.
pub struct PeerPublicKey(RsaPublicKey);

impl PeerPublicKey {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(pem)
            .map_err(|_| CryptoError::InvalidPublicKey("PEM is not valid UTF-8".into()))?;
        RsaPublicKey::from_public_key_pem(text.trim_end_matches('\0'))
            .map(Self)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.0
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))
    }
}
