/// Courier: encrypted single-file transfer between two peers.
///
/// Provides:
/// - RSA-OAEP handshake carrying credentials and a fresh AES-256 key + IV
/// - 1024-byte metadata header (`name|size|fragment|digest|`, padded with `a`)
/// - TCP channel: framed handshake, then a raw AES-256-CBC stream
/// - UDP channel: sequence-numbered datagrams with acks, retry rounds and
///   receiver-driven `RESEND:<seq>` requests
/// - SHA-256 verification before the received file is committed
/// - RTT-based transport selection

pub mod config;
mod datagram;
pub mod delivery;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod metadata;
mod net;
pub mod progress;
pub mod protocol;
pub mod selector;
pub mod session;
pub mod state;
pub mod storage;
pub mod tcp;
pub mod udp_receiver;
pub mod udp_sender;

// Re-export key types for convenience.
pub use config::{Credentials, ReceiverConfig, ReliabilityConfig, SenderConfig};
pub use delivery::{DeliveryOutcome, ReceiveReport, SendReport};
pub use error::{ErrorKind, Result, TransferError};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use metadata::{validate_file_name, FileMetadata, HEADER_SIZE};
pub use progress::TransferProgress;
pub use protocol::{ControlToken, DEFAULT_FRAGMENT_SIZE, DEFAULT_PORT};
pub use selector::{select_transport, Transport, TransportChoice, DEFAULT_RTT_THRESHOLD_MS};
pub use session::{Role, Session, SessionState};
pub use tcp::TcpReceiver;
pub use udp_receiver::UdpReceiver;
