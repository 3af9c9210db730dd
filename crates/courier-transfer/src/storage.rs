use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use courier_crypto::digest_file;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metadata::validate_file_name;

/// Write buffer for received plaintext (1 MB).
const WRITE_BUF_SIZE: usize = 1024 * 1024;

/// Directory that received files land in.
///
/// Incoming data goes to a hidden `.{name}.part` file next to its final
/// location and is only renamed into place once the digest has been checked.
pub struct OutputDir {
    dir: PathBuf,
}

impl OutputDir {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", dir.display()),
            ));
        }
        info!("Receive directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// Final location for a received file name. Rejects names that leave the directory.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        validate_file_name(name)?;
        Ok(self.dir.join(name))
    }

    /// Open a staging file for `name`.
    pub fn stage(&self, name: &str) -> Result<StagedFile> {
        let target = self.resolve(name)?;
        let staging = self.dir.join(format!(".{}.part", name));
        let file = File::create(&staging)?;
        debug!("Staging {} at {}", name, staging.display());
        Ok(StagedFile {
            writer: Some(BufWriter::with_capacity(WRITE_BUF_SIZE, file)),
            staging,
            target,
            written: 0,
            committed: false,
        })
    }
}

/// A file being received. Deleted on drop unless committed.
pub struct StagedFile {
    writer: Option<BufWriter<File>>,
    staging: PathBuf,
    target: PathBuf,
    written: u64,
    committed: bool,
}

impl StagedFile {
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => {
                w.write_all(data)?;
                self.written += data.len() as u64;
                Ok(())
            }
            None => Err(io::Error::other("staged file already closed")),
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    pub fn target_path(&self) -> &Path {
        &self.target
    }

    /// Flush to disk and hash what was actually written.
    pub fn digest(&mut self) -> io::Result<String> {
        self.close()?;
        digest_file(&self.staging)
    }

    /// Move the staging file into place.
    pub fn commit(mut self) -> io::Result<PathBuf> {
        self.close()?;
        fs::rename(&self.staging, &self.target)?;
        self.committed = true;
        info!("Committed {} ({} bytes)", self.target.display(), self.written);
        Ok(self.target.clone())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
        }
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Close the handle before unlinking.
        self.writer.take();
        match fs::remove_file(&self.staging) {
            Ok(()) => info!("Discarded partial file {}", self.staging.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Partial file {} already gone", self.staging.display());
            }
            Err(e) => warn!("Failed to delete partial file {}: {}", self.staging.display(), e),
        }
    }
}
