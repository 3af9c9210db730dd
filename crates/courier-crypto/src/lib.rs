/// Courier crypto primitives.
///
/// - SHA-256 hex digests for whole-file integrity
/// - AES-256-CBC pipeline with PKCS#7 padding, stateful across chunks
/// - RSA-OAEP (SHA-256) session keypair used to bootstrap the symmetric key
/// - Random symmetric key and IV generation

pub mod asymmetric;
pub mod cipher;
pub mod digest;
pub mod error;
pub mod keys;

pub use asymmetric::{PeerPublicKey, SessionKeyPair, DEFAULT_RSA_BITS};
pub use cipher::{
    decrypt_all, encrypt_all, encrypt_vec, padded_len, padding_is_valid, padding_len, CbcDecryptor,
    CbcEncryptor, BLOCK_SIZE,
};
pub use digest::{digest_bytes, digest_file, digest_reader, digests_match, StreamingDigest};
pub use error::{CryptoError, Result};
pub use keys::{SessionKeys, IV_SIZE, KEY_SIZE};
