/// Transfer logging trait for structured session logs.
///
/// Senders and receivers report typed events tagged with the component and a
/// per-session id. The default sink forwards to `tracing`.

use std::fmt;

use crate::session::SessionState;

/// Structured log entry for a transfer session.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub session_id: u64,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Session moved to a new state
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Keys exchanged and metadata accepted
    HandshakeComplete {
        file_name: String,
        size: u64,
    },
    /// UDP sender: starting a send round
    RoundStarted {
        round: u32,
        pending: u32,
    },
    /// UDP sender: ack window closed
    RoundFinished {
        round: u32,
        acknowledged: u32,
        total: u32,
    },
    /// UDP: receiver asked for a datagram again
    ResendRequested {
        seq: u32,
    },
    /// UDP receiver: read timed out with datagrams outstanding
    GapDetected {
        missing: u32,
        received: u32,
        expected: u32,
    },
    /// Digest of the written file matched
    IntegrityVerified {
        digest: String,
    },
    /// Digest of the written file did not match
    IntegrityMismatch {
        expected: String,
        actual: String,
    },
    /// Transfer complete
    TransferComplete {
        bytes: u64,
        elapsed_ms: u64,
        retransmits: u64,
    },
    /// Session aborted
    SessionFailed {
        reason: String,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged { from, to } => {
                write!(f, "state {} -> {}", from, to)
            }
            Self::HandshakeComplete { file_name, size } => {
                write!(f, "handshake_complete file={} size={}", file_name, size)
            }
            Self::RoundStarted { round, pending } => {
                write!(f, "round_started round={} pending={}", round, pending)
            }
            Self::RoundFinished { round, acknowledged, total } => {
                write!(f, "round_finished round={} acked={}/{}", round, acknowledged, total)
            }
            Self::ResendRequested { seq } => {
                write!(f, "resend_requested seq={}", seq)
            }
            Self::GapDetected { missing, received, expected } => {
                write!(f, "gap_detected missing={} received={}/{}", missing, received, expected)
            }
            Self::IntegrityVerified { digest } => {
                write!(f, "integrity_verified sha256={}", digest)
            }
            Self::IntegrityMismatch { expected, actual } => {
                write!(f, "integrity_mismatch expected={} actual={}", expected, actual)
            }
            Self::TransferComplete { bytes, elapsed_ms, retransmits } => {
                write!(f, "transfer_complete bytes={} elapsed_ms={} retransmits={}", bytes, elapsed_ms, retransmits)
            }
            Self::SessionFailed { reason } => {
                write!(f, "session_failed: {}", reason)
            }
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing,
/// collect entries for inspection, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        let sid = format!("{:016x}", entry.session_id);
        match &entry.event {
            TransferEvent::SessionFailed { .. } => {
                tracing::error!(component = entry.component, session = %sid, "{}", entry.event);
            }
            TransferEvent::IntegrityMismatch { .. } => {
                tracing::warn!(component = entry.component, session = %sid, "{}", entry.event);
            }
            TransferEvent::HandshakeComplete { .. }
            | TransferEvent::IntegrityVerified { .. }
            | TransferEvent::TransferComplete { .. } => {
                tracing::info!(component = entry.component, session = %sid, "{}", entry.event);
            }
            // Per-round and per-datagram chatter
            _ => {
                tracing::debug!(component = entry.component, session = %sid, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_render_as_key_value_text() {
        let ev = TransferEvent::RoundFinished { round: 2, acknowledged: 7, total: 9 };
        assert_eq!(ev.to_string(), "round_finished round=2 acked=7/9");

        let ev = TransferEvent::StateChanged {
            from: SessionState::Authenticating,
            to: SessionState::Failed,
        };
        assert_eq!(ev.to_string(), "state AUTHENTICATING -> FAILED");
    }
}
