use courier_crypto::CryptoError;
use thiserror::Error;

/// Everything that can end a transfer session.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("integrity check failed: {0}")]
    IntegrityFailure(String),

    #[error("retry budget exhausted: {acknowledged}/{total} datagrams acknowledged")]
    TimeoutExhausted { acknowledged: u32, total: u32 },

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("transfer cancelled")]
    Cancelled,
}

/// Coarse classification the session state machine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    ProtocolViolation,
    AuthenticationFailure,
    IntegrityFailure,
    TimeoutExhausted,
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::ProtocolViolation(_) | Self::Crypto(_) => ErrorKind::ProtocolViolation,
            Self::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            Self::IntegrityFailure(_) => ErrorKind::IntegrityFailure,
            Self::TimeoutExhausted { .. } => ErrorKind::TimeoutExhausted,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }
}

/// True for the error kinds a blocking socket read reports when its timeout fires.
pub(crate) fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

pub type Result<T> = std::result::Result<T, TransferError>;
