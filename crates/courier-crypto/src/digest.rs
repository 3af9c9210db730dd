/// SHA-256 integrity codec. Digests are lowercase hex strings.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Read buffer for streaming digests (1 MB).
const DIGEST_BUF_SIZE: usize = 1024 * 1024;

/// Digest an in-memory buffer.
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Digest everything a reader yields until EOF.
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut digest = StreamingDigest::new();
    let mut buf = vec![0u8; DIGEST_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finalize_hex())
}

/// Digest a file on disk.
pub fn digest_file(path: &Path) -> io::Result<String> {
    digest_reader(File::open(path)?)
}

/// Compare two hex digests, ignoring case.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.len() == actual.len() && expected.eq_ignore_ascii_case(actual)
}

/// Incremental digest for data that arrives in pieces.
#[derive(Clone, Default)]
pub struct StreamingDigest {
    hasher: Sha256,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
