use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use courier_crypto::DEFAULT_RSA_BITS;

use crate::logging::TransferLogger;
use crate::protocol::{DEFAULT_FRAGMENT_SIZE, RESEND_BATCH};

/// Default username accepted by a receiver.
pub const DEFAULT_USERNAME: &str = "admin";

/// Default password accepted by a receiver.
pub const DEFAULT_PASSWORD: &str = "admin123";

/// Largest file a receiver accepts by default (4 GB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Username and password, sent as `username|password` under RSA-OAEP.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("{}|{}", self.username, self.password).into_bytes()
    }

    /// Split at the first `|`; the password may itself contain `|`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let (username, password) = text.split_once('|')?;
        Some(Self::new(username, password))
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new(DEFAULT_USERNAME, DEFAULT_PASSWORD)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Timing and budget knobs for the UDP reliability layer.
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// How long the sender collects acknowledgments per round.
    pub ack_window: Duration,
    /// Socket read timeout while collecting acknowledgments.
    pub ack_timeout: Duration,
    /// Send rounds before giving up.
    pub max_rounds: u32,
    /// Pause between rounds.
    pub retry_pause: Duration,
    /// Receiver socket read timeout while data is expected.
    pub receive_timeout: Duration,
    /// Consecutive receiver timeouts tolerated with gaps outstanding.
    pub max_idle_timeouts: u32,
    /// Missing sequence numbers named per resend request batch.
    pub resend_batch: usize,
    /// How long the sender waits for FILE_SUCCESS / FILE_FAILED.
    pub final_timeout: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            ack_window: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(2),
            max_rounds: 3,
            retry_pause: Duration::from_secs(1),
            receive_timeout: Duration::from_secs(5),
            max_idle_timeouts: 6,
            resend_batch: RESEND_BATCH,
            final_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for sending one file.
#[derive(Clone)]
pub struct SenderConfig {
    pub file_path: PathBuf,
    pub peer: SocketAddr,
    pub credentials: Credentials,
    pub fragment_size: u32,
    pub connect_timeout: Duration,
    /// Read timeout for each handshake message, including the receiver's
    /// public key while it generates the RSA keypair.
    pub handshake_timeout: Duration,
    pub reliability: ReliabilityConfig,
    pub logger: Option<Arc<dyn TransferLogger>>,
}

impl SenderConfig {
    pub fn new(file_path: impl Into<PathBuf>, peer: SocketAddr) -> Self {
        Self {
            file_path: file_path.into(),
            peer,
            credentials: Credentials::default(),
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            reliability: ReliabilityConfig::default(),
            logger: None,
        }
    }
}

/// Configuration for a listening receiver.
#[derive(Clone)]
pub struct ReceiverConfig {
    pub bind_addr: SocketAddr,
    pub output_dir: PathBuf,
    pub credentials: Credentials,
    pub rsa_bits: usize,
    /// Accept-loop tick; bounds how long cancellation can go unnoticed.
    pub poll_interval: Duration,
    pub handshake_timeout: Duration,
    pub max_file_size: u64,
    pub reliability: ReliabilityConfig,
    pub logger: Option<Arc<dyn TransferLogger>>,
}

impl ReceiverConfig {
    pub fn new(bind_addr: SocketAddr, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr,
            output_dir: output_dir.into(),
            credentials: Credentials::default(),
            rsa_bits: DEFAULT_RSA_BITS,
            poll_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            reliability: ReliabilityConfig::default(),
            logger: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_wire_format() {
        let c = Credentials::default();
        assert_eq!(c.encode(), b"admin|admin123");
        assert_eq!(Credentials::parse(b"admin|admin123"), Some(c));
    }

    #[test]
    fn password_may_contain_separator() {
        let c = Credentials::parse(b"bob|pa|ss").unwrap();
        assert_eq!(c.username, "bob");
        assert_eq!(c.password, "pa|ss");
        assert_eq!(Credentials::parse(b"nobar"), None);
        assert_eq!(Credentials::parse(&[0xFF, b'|']), None);
    }

    #[test]
    fn debug_hides_password() {
        let shown = format!("{:?}", Credentials::new("u", "hunter2"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn defaults() {
        let r = ReliabilityConfig::default();
        assert_eq!(r.max_rounds, 3);
        assert_eq!(r.ack_window, Duration::from_secs(5));
        assert_eq!(r.resend_batch, 10);
        let rc = ReceiverConfig::new("0.0.0.0:12345".parse().unwrap(), "/tmp/in");
        assert_eq!(rc.poll_interval, Duration::from_secs(1));
        assert_eq!(rc.rsa_bits, 2048);
        assert_eq!(rc.handshake_timeout, Duration::from_secs(5));
        let sc = SenderConfig::new("/tmp/out.bin", "127.0.0.1:12345".parse().unwrap());
        assert_eq!(sc.handshake_timeout, Duration::from_secs(5));
        assert_eq!(sc.connect_timeout, Duration::from_secs(10));
    }
}
