/// AES-256-CBC pipeline with PKCS#7 padding.
///
/// Both directions keep chaining state across `update` calls, so a file can
/// be fed through in arbitrarily sized pieces. Only `finish` on the encryptor
/// pads, always appending between 1 and 16 bytes, so the output length is a
/// multiple of the block size and strictly longer than the plaintext.
///
/// The decryptor never strips padding itself: callers truncate to the
/// plaintext size they were told about and may check the remaining bytes with
/// [`padding_is_valid`].

use aes::Aes256;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::error::{CryptoError, Result};
use crate::keys::SessionKeys;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Number of padding bytes appended to a plaintext of `plaintext_len` bytes.
/// Always in `1..=BLOCK_SIZE`.
pub fn padding_len(plaintext_len: u64) -> u64 {
    BLOCK_SIZE as u64 - plaintext_len % BLOCK_SIZE as u64
}

/// Ciphertext length for a plaintext of `plaintext_len` bytes.
/// Returns None on overflow.
pub fn padded_len(plaintext_len: u64) -> Option<u64> {
    plaintext_len.checked_add(padding_len(plaintext_len))
}

/// True if `padding` is a well-formed PKCS#7 tail: N bytes of value N.
pub fn padding_is_valid(padding: &[u8]) -> bool {
    let n = padding.len();
    (1..=BLOCK_SIZE).contains(&n) && padding.iter().all(|&b| b as usize == n)
}

/// Move the whole blocks available across `pending` and `data` into a fresh
/// buffer, leaving only the sub-block tail in `pending`.
fn take_whole_blocks(pending: &mut Vec<u8>, data: &[u8]) -> Vec<u8> {
    let total = pending.len() + data.len();
    let whole = total - total % BLOCK_SIZE;
    if whole == 0 {
        pending.extend_from_slice(data);
        return Vec::new();
    }
    // pending never holds a full block, so it is entirely consumed here
    let from_data = whole - pending.len();
    let mut out = Vec::with_capacity(whole);
    out.append(pending);
    out.extend_from_slice(&data[..from_data]);
    pending.extend_from_slice(&data[from_data..]);
    out
}

/// Streaming encryptor. Buffers any partial trailing block between calls.
pub struct CbcEncryptor {
    inner: Aes256CbcEnc,
    pending: Vec<u8>,
}

impl CbcEncryptor {
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            inner: Aes256CbcEnc::new(
                GenericArray::from_slice(&keys.key),
                GenericArray::from_slice(&keys.iv),
            ),
            pending: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    /// Encrypt as many whole blocks as are available and return their ciphertext.
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = take_whole_blocks(&mut self.pending, data);
        for block in out.chunks_exact_mut(BLOCK_SIZE) {
            self.inner.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out
    }

    /// Pad the buffered tail and return the final ciphertext block.
    pub fn finish(mut self) -> Vec<u8> {
        let pad = BLOCK_SIZE - self.pending.len();
        let mut block = std::mem::take(&mut self.pending);
        block.resize(BLOCK_SIZE, pad as u8);
        self.inner.encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
        block
    }
}

/// Streaming decryptor. Output is raw plaintext including padding.
pub struct CbcDecryptor {
    inner: Aes256CbcDec,
    pending: Vec<u8>,
}

impl CbcDecryptor {
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            inner: Aes256CbcDec::new(
                GenericArray::from_slice(&keys.key),
                GenericArray::from_slice(&keys.iv),
            ),
            pending: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    /// Decrypt every whole block available so far.
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = take_whole_blocks(&mut self.pending, data);
        for block in out.chunks_exact_mut(BLOCK_SIZE) {
            self.inner.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out
    }

    /// Fails if the stream ended in the middle of a block.
    pub fn finish(self) -> Result<()> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(CryptoError::MisalignedCiphertext { len: self.pending.len() })
        }
    }
}

/// Encrypt a whole buffer, padding included.
pub fn encrypt_all(keys: &SessionKeys, plaintext: &[u8]) -> Vec<u8> {
    encrypt_vec(keys, plaintext.to_vec())
}

/// Pad and encrypt `buf` in place, reusing its allocation for the ciphertext.
pub fn encrypt_vec(keys: &SessionKeys, mut buf: Vec<u8>) -> Vec<u8> {
    let pad = padding_len(buf.len() as u64) as usize;
    buf.resize(buf.len() + pad, pad as u8);
    let mut inner = Aes256CbcEnc::new(
        GenericArray::from_slice(&keys.key),
        GenericArray::from_slice(&keys.iv),
    );
    for block in buf.chunks_exact_mut(BLOCK_SIZE) {
        inner.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    buf
}

/// Decrypt a whole block-aligned buffer. Padding is left in place.
pub fn decrypt_all(keys: &SessionKeys, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::MisalignedCiphertext { len: ciphertext.len() });
    }
    let mut dec = CbcDecryptor::new(keys);
    let out = dec.update(ciphertext);
    dec.finish()?;
    Ok(out)
}
