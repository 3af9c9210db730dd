use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::session::SessionState;

/// Live counters for a sender or receiver, shared with whoever drives it.
///
/// Setting the cancel flag makes the active session abort at its next
/// poll tick and discard anything it has written.
pub struct TransferProgress {
    pub bytes_done: AtomicU64,
    pub bytes_total: AtomicU64,
    pub retransmits: AtomicU64,
    pub sessions_completed: AtomicU64,
    state: AtomicU8,
    cancelled: AtomicBool,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self {
            bytes_done: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            retransmits: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            state: AtomicU8::new(SessionState::Connecting as u8),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Relaxed)).unwrap_or(SessionState::Failed)
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Clear per-session counters before a new session starts.
    pub(crate) fn begin_session(&self, bytes_total: u64) {
        self.bytes_done.store(0, Ordering::Relaxed);
        self.bytes_total.store(bytes_total, Ordering::Relaxed);
        self.retransmits.store(0, Ordering::Relaxed);
        self.set_state(SessionState::Connecting);
    }

    pub(crate) fn add_bytes(&self, n: u64) {
        self.bytes_done.fetch_add(n, Ordering::Relaxed);
    }

    /// Fraction of the current session's bytes done, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        let total = self.bytes_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        (self.bytes_done.load(Ordering::Relaxed) as f64 / total as f64).min(1.0)
    }
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}
