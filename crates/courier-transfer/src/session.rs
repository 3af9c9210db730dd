/// Per-connection session: role, peer, key material and the state machine
///
/// ```text
/// CONNECTING -> KEY_EXCHANGE -> AUTHENTICATING -> KEY_TRANSFER
///   -> METADATA_EXCHANGE -> TRANSFERRING -> VERIFYING -> COMMITTED
/// ```
///
/// Any state may drop to FAILED. States only move forward one step at a time,
/// so a session that failed authentication can never reach metadata exchange.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use courier_crypto::SessionKeys;
use rand_core::{OsRng, RngCore};

use crate::error::{Result, TransferError};
use crate::logging::{TracingLogger, TransferEvent, TransferLog, TransferLogger};
use crate::progress::TransferProgress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    KeyExchange = 1,
    Authenticating = 2,
    KeyTransfer = 3,
    MetadataExchange = 4,
    Transferring = 5,
    Verifying = 6,
    Committed = 7,
    Failed = 8,
}

impl SessionState {
    /// The only state reachable from this one besides FAILED.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Connecting => Some(Self::KeyExchange),
            Self::KeyExchange => Some(Self::Authenticating),
            Self::Authenticating => Some(Self::KeyTransfer),
            Self::KeyTransfer => Some(Self::MetadataExchange),
            Self::MetadataExchange => Some(Self::Transferring),
            Self::Transferring => Some(Self::Verifying),
            Self::Verifying => Some(Self::Committed),
            Self::Committed | Self::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Connecting,
            1 => Self::KeyExchange,
            2 => Self::Authenticating,
            3 => Self::KeyTransfer,
            4 => Self::MetadataExchange,
            5 => Self::Transferring,
            6 => Self::Verifying,
            7 => Self::Committed,
            8 => Self::Failed,
            _ => return None,
        })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "CONNECTING",
            Self::KeyExchange => "KEY_EXCHANGE",
            Self::Authenticating => "AUTHENTICATING",
            Self::KeyTransfer => "KEY_TRANSFER",
            Self::MetadataExchange => "METADATA_EXCHANGE",
            Self::Transferring => "TRANSFERRING",
            Self::Verifying => "VERIFYING",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

pub struct Session {
    id: u64,
    role: Role,
    peer: SocketAddr,
    state: SessionState,
    authenticated: bool,
    keys: Option<SessionKeys>,
    component: &'static str,
    logger: Arc<dyn TransferLogger>,
    progress: Arc<TransferProgress>,
}

impl Session {
    pub fn new(
        role: Role,
        peer: SocketAddr,
        component: &'static str,
        logger: Option<Arc<dyn TransferLogger>>,
        progress: Arc<TransferProgress>,
    ) -> Self {
        progress.set_state(SessionState::Connecting);
        Self {
            id: OsRng.next_u64(),
            role,
            peer,
            state: SessionState::Connecting,
            authenticated: false,
            keys: None,
            component,
            logger: logger.unwrap_or_else(|| Arc::new(TracingLogger)),
            progress,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    /// Move one step forward. Anything else is a protocol violation.
    pub fn advance(&mut self, to: SessionState) -> Result<()> {
        if self.state.next() != Some(to) {
            return Err(TransferError::protocol(format!(
                "illegal session transition {} -> {}",
                self.state, to
            )));
        }
        if to == SessionState::KeyTransfer && !self.authenticated {
            return Err(TransferError::AuthenticationFailure(
                "key transfer attempted before authentication".into(),
            ));
        }
        self.set_state(to);
        Ok(())
    }

    /// Record a successful credential check. Only valid while authenticating.
    pub fn authenticate(&mut self) -> Result<()> {
        if self.state != SessionState::Authenticating {
            return Err(TransferError::protocol(format!(
                "authentication outside AUTHENTICATING (state {})",
                self.state
            )));
        }
        self.authenticated = true;
        Ok(())
    }

    /// Install the session's symmetric key material. Exactly once per session.
    pub fn install_keys(&mut self, keys: SessionKeys) -> Result<()> {
        if self.keys.is_some() {
            return Err(TransferError::protocol("session keys already installed"));
        }
        self.keys = Some(keys);
        Ok(())
    }

    pub fn keys(&self) -> Result<&SessionKeys> {
        self.keys
            .as_ref()
            .ok_or_else(|| TransferError::protocol("session has no key material"))
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.progress.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drop to FAILED and log why.
    pub fn fail(&mut self, err: &TransferError) {
        if self.state.is_terminal() {
            return;
        }
        self.log(TransferEvent::SessionFailed {
            reason: format!("{:?} {:?} in {}: {}", self.role, err.kind(), self.state, err),
        });
        self.set_state(SessionState::Failed);
    }

    /// Pass a result through, failing the session if it is an error.
    pub fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    pub fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: self.component,
            session_id: self.id,
            event,
        });
    }

    fn set_state(&mut self, to: SessionState) {
        self.log(TransferEvent::StateChanged { from: self.state, to });
        self.state = to;
        self.progress.set_state(to);
    }
}
