/// Fixed-size file metadata header.
///
/// ```text
/// name|size|fragment_size|digest|aaaa...a     (exactly 1024 bytes)
/// ```
///
/// The text is UTF-8, the filler is ASCII `'a'`. An encoded header longer than
/// 1024 bytes is truncated, which the decoder then rejects.

use std::path::{Component, Path};

use courier_crypto::padded_len;

use crate::error::{Result, TransferError};
use crate::protocol::packet_count;

/// Encoded header size.
pub const HEADER_SIZE: usize = 1024;

/// Padding byte after the last field.
pub const HEADER_FILLER: u8 = b'a';

/// Field terminator.
pub const FIELD_SEPARATOR: char = '|';

/// Length of a SHA-256 hex digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Longest accepted file name in bytes. Leaves room for the staging name.
pub const MAX_NAME_LEN: usize = 240;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub fragment_size: u32,
    pub digest: String,
}

impl FileMetadata {
    pub fn new(
        name: impl Into<String>,
        size: u64,
        fragment_size: u32,
        digest: impl Into<String>,
    ) -> Result<Self> {
        let meta = Self {
            name: name.into(),
            size,
            fragment_size,
            digest: digest.into(),
        };
        validate_file_name(&meta.name)?;
        validate_digest(&meta.digest)?;
        Ok(meta)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let text = format!(
            "{name}{sep}{size}{sep}{fragment}{sep}{digest}{sep}",
            name = self.name,
            size = self.size,
            fragment = self.fragment_size,
            digest = self.digest,
            sep = FIELD_SEPARATOR,
        );
        let mut header = [HEADER_FILLER; HEADER_SIZE];
        let n = text.len().min(HEADER_SIZE);
        header[..n].copy_from_slice(&text.as_bytes()[..n]);
        header
    }

    pub fn decode(header: &[u8]) -> Result<Self> {
        if header.len() != HEADER_SIZE {
            return Err(TransferError::protocol(format!(
                "metadata header is {} bytes, expected {}",
                header.len(),
                HEADER_SIZE
            )));
        }

        // The four fields end at the fourth separator; only filler may follow.
        let end = header
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b == FIELD_SEPARATOR as u8)
            .nth(3)
            .map(|(i, _)| i + 1)
            .ok_or_else(|| TransferError::protocol("metadata header is missing fields"))?;
        if header[end..].iter().any(|&b| b != HEADER_FILLER) {
            return Err(TransferError::protocol("unexpected bytes after metadata fields"));
        }

        let text = std::str::from_utf8(&header[..end])
            .map_err(|_| TransferError::protocol("metadata header is not UTF-8"))?;
        let mut rest = text;
        let name = take_field(&mut rest)?;
        let size = take_field(&mut rest)?
            .parse::<u64>()
            .map_err(|e| TransferError::protocol(format!("bad size field: {}", e)))?;
        let fragment_size = take_field(&mut rest)?
            .parse::<u32>()
            .map_err(|e| TransferError::protocol(format!("bad fragment field: {}", e)))?;
        let digest = take_field(&mut rest)?;

        Self::new(name, size, fragment_size, digest)
    }

    /// Ciphertext bytes the receiver must collect.
    pub fn expected_ciphertext_len(&self) -> Option<u64> {
        padded_len(self.size)
    }

    /// Datagrams the UDP channel will carry for this file.
    pub fn packet_count(&self) -> Option<u32> {
        self.expected_ciphertext_len().and_then(packet_count)
    }

    /// Receiver-side checks before accepting the transfer.
    pub fn validate(&self, max_size: u64) -> Result<()> {
        validate_file_name(&self.name)?;
        validate_digest(&self.digest)?;
        if self.size > max_size {
            return Err(TransferError::protocol(format!(
                "declared size {} exceeds limit {}",
                self.size, max_size
            )));
        }
        if self.packet_count().is_none() {
            return Err(TransferError::protocol(format!(
                "declared size {} cannot be framed",
                self.size
            )));
        }
        Ok(())
    }
}

fn take_field<'a>(rest: &mut &'a str) -> Result<&'a str> {
    let (field, tail) = rest
        .split_once(FIELD_SEPARATOR)
        .ok_or_else(|| TransferError::protocol("metadata header is missing fields"))?;
    *rest = tail;
    Ok(field)
}

/// A received name must be one plain path component inside the target directory.
pub fn validate_file_name(name: &str) -> Result<()> {
    let reject = |why: &str| Err(TransferError::protocol(format!("file name {:?} {}", name, why)));

    if name.is_empty() {
        return reject("is empty");
    }
    if name.len() > MAX_NAME_LEN {
        return reject("is too long");
    }
    if name.contains(['/', '\\', FIELD_SEPARATOR]) || name.chars().any(char::is_control) {
        return reject("contains a reserved character");
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => reject("escapes the target directory"),
    }
}

fn validate_digest(digest: &str) -> Result<()> {
    if digest.len() != DIGEST_HEX_LEN || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(TransferError::protocol(format!("malformed digest {:?}", digest)));
    }
    Ok(())
}
