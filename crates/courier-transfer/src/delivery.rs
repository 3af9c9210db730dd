/// Pieces shared by the TCP and UDP channels on either end of a transfer:
/// preparing the source file, writing received plaintext, the final digest
/// check, and the reports handed back to callers.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use courier_crypto::{digest_file, digests_match, padding_is_valid};
use tracing::warn;

use crate::config::SenderConfig;
use crate::error::{Result, TransferError};
use crate::handshake::ControlChannel;
use crate::logging::TransferEvent;
use crate::metadata::FileMetadata;
use crate::protocol::ControlToken;
use crate::session::{Session, SessionState};
use crate::storage::StagedFile;

/// What the sender knows about the receiver's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Receiver verified the digest and committed the file.
    Verified,
    /// All data went out but no verdict arrived in time.
    Unconfirmed,
}

/// Result of a completed send.
#[derive(Debug, Clone)]
pub struct SendReport {
    /// Matches the `session_id` field on this session's log lines.
    pub session_id: u64,
    pub outcome: DeliveryOutcome,
    pub file_name: String,
    pub bytes: u64,
    pub ciphertext_bytes: u64,
    /// Data datagrams (UDP only).
    pub datagrams: u32,
    pub retransmits: u64,
    pub elapsed: Duration,
}

/// Result of a committed receive.
#[derive(Debug, Clone)]
pub struct ReceiveReport {
    pub session_id: u64,
    pub path: PathBuf,
    pub file_name: String,
    pub bytes: u64,
    pub digest: String,
    pub peer: SocketAddr,
    pub elapsed: Duration,
}

/// Build the metadata for the file a sender is about to transmit.
pub(crate) fn describe_source(config: &SenderConfig) -> Result<FileMetadata> {
    let size = fs::metadata(&config.file_path)?.len();
    let name = config
        .file_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            TransferError::protocol(format!("{} has no usable file name", config.file_path.display()))
        })?;
    let digest = digest_file(&config.file_path)?;
    FileMetadata::new(name, size, config.fragment_size, digest)
}

/// Interpret the receiver's closing token.
pub(crate) fn verdict(token: Option<ControlToken>, meta: &FileMetadata) -> Result<DeliveryOutcome> {
    match token {
        Some(ControlToken::FileSuccess) => Ok(DeliveryOutcome::Verified),
        Some(ControlToken::FileFailed) => Err(TransferError::IntegrityFailure(format!(
            "receiver reported a digest mismatch for {}",
            meta.name
        ))),
        Some(other) => Err(TransferError::protocol(format!(
            "expected transfer verdict, got {:?}",
            other
        ))),
        None => {
            warn!("No verdict from receiver for {}; delivery unconfirmed", meta.name);
            Ok(DeliveryOutcome::Unconfirmed)
        }
    }
}

/// Writes decrypted output up to the declared size and keeps the rest as padding.
pub(crate) struct PlaintextSink {
    remaining: u64,
    padding: Vec<u8>,
}

impl PlaintextSink {
    pub(crate) fn new(size: u64) -> Self {
        Self {
            remaining: size,
            padding: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, plain: &[u8], out: &mut StagedFile) -> std::io::Result<()> {
        let take = (self.remaining.min(plain.len() as u64)) as usize;
        out.write(&plain[..take])?;
        self.remaining -= take as u64;
        self.padding.extend_from_slice(&plain[take..]);
        Ok(())
    }
}

/// Check the written file against the announced digest, then commit or discard it
/// and tell the sender which.
pub(crate) fn verify_and_commit<C: ControlChannel>(
    channel: &mut C,
    session: &mut Session,
    meta: &FileMetadata,
    mut staged: StagedFile,
    sink: PlaintextSink,
    started: Instant,
) -> Result<ReceiveReport> {
    session.advance(SessionState::Verifying)?;

    let actual = staged.digest()?;
    let padding_ok = sink.remaining == 0 && padding_is_valid(&sink.padding);
    if !padding_ok || !digests_match(&meta.digest, &actual) {
        session.log(TransferEvent::IntegrityMismatch {
            expected: meta.digest.clone(),
            actual: actual.clone(),
        });
        drop(staged);
        if let Err(e) = channel.send_token(ControlToken::FileFailed) {
            warn!("Could not report failure to {}: {}", session.peer(), e);
        }
        return Err(TransferError::IntegrityFailure(format!(
            "{}: expected sha256 {}, got {}{}",
            meta.name,
            meta.digest,
            actual,
            if padding_ok { "" } else { " (bad padding)" }
        )));
    }

    let bytes = staged.written();
    let path = staged.commit()?;
    channel.send_token(ControlToken::FileSuccess)?;
    session.advance(SessionState::Committed)?;

    let elapsed = started.elapsed();
    session.log(TransferEvent::IntegrityVerified { digest: actual.clone() });
    session.log(TransferEvent::TransferComplete {
        bytes,
        elapsed_ms: elapsed.as_millis() as u64,
        retransmits: 0,
    });
    session
        .progress()
        .sessions_completed
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    Ok(ReceiveReport {
        session_id: session.id(),
        path,
        file_name: meta.name.clone(),
        bytes,
        digest: actual,
        peer: session.peer(),
        elapsed,
    })
}
