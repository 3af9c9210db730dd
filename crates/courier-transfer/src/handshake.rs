/// Session handshake shared by both transports.
///
/// ```text
/// receiver                               sender
///   public key (PEM)         ------->
///                            <-------    KEY_RECEIVED
///                            <-------    RSA-OAEP("user|pass")
///   AUTH_SUCCESS | AUTH_FAILED ----->
///                            <-------    RSA-OAEP(aes key)
///   AES_KEY_RECEIVED         ------->
///                            <-------    iv
///   IV_RECEIVED              ------->
///                            <-------    metadata header (1024 bytes)
///   FILE_INFO_RECEIVED       ------->
/// ```
///
/// Wrong credentials end the session on both sides. A key, IV or header the
/// receiver cannot accept is answered with FILE_FAILED before it hangs up.
/// Nothing touches the filesystem until this exchange has completed.

use courier_crypto::{PeerPublicKey, SessionKeyPair, SessionKeys, KEY_SIZE};
use tracing::{info, warn};

use crate::config::Credentials;
use crate::error::{Result, TransferError};
use crate::logging::TransferEvent;
use crate::metadata::FileMetadata;
use crate::protocol::ControlToken;
use crate::session::{Session, SessionState};

/// Message transport used by the handshake. TCP frames each message, UDP
/// sends one datagram per message and chunks the public key.
pub trait ControlChannel {
    fn send_message(&mut self, message: &[u8]) -> Result<()>;

    fn recv_message(&mut self) -> Result<Vec<u8>>;

    fn send_public_key(&mut self, pem: &[u8]) -> Result<()> {
        self.send_message(pem)
    }

    fn recv_public_key(&mut self) -> Result<Vec<u8>> {
        self.recv_message()
    }

    fn send_token(&mut self, token: ControlToken) -> Result<()> {
        self.send_message(token.as_bytes())
    }

    fn expect_token(&mut self, expected: ControlToken) -> Result<()> {
        let msg = self.recv_message()?;
        if msg == expected.as_bytes() {
            Ok(())
        } else {
            Err(TransferError::protocol(format!(
                "expected {:?}, got {}",
                expected,
                describe(&msg)
            )))
        }
    }

    /// Like [`expect_token`](Self::expect_token), but names what the peer
    /// refused when it answers FILE_FAILED instead.
    fn expect_accepted(&mut self, expected: ControlToken, what: &str) -> Result<()> {
        let msg = self.recv_message()?;
        match ControlToken::parse(&msg) {
            Some(token) if token == expected => Ok(()),
            Some(ControlToken::FileFailed) => {
                Err(TransferError::protocol(format!("receiver rejected the {}", what)))
            }
            _ => Err(TransferError::protocol(format!(
                "expected {:?}, got {}",
                expected,
                describe(&msg)
            ))),
        }
    }
}

/// Tell the sender FILE_FAILED when `result` is an error, then pass it on.
fn refuse_on_error<C: ControlChannel, T>(channel: &mut C, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if let Err(send_err) = channel.send_token(ControlToken::FileFailed) {
            warn!("Could not report rejection ({}) to sender: {}", e, send_err);
        }
    }
    result
}

/// Short human-readable description of a control message.
pub(crate) fn describe(msg: &[u8]) -> String {
    match ControlToken::parse(msg) {
        Some(token) => format!("{:?}", token),
        None => format!("{} byte message", msg.len()),
    }
}

/// Receiver side: authenticate the peer, learn the session key and the file metadata.
pub fn run_receiver<C: ControlChannel>(
    channel: &mut C,
    session: &mut Session,
    credentials: &Credentials,
    rsa_bits: usize,
    max_file_size: u64,
) -> Result<FileMetadata> {
    session.advance(SessionState::KeyExchange)?;
    let keypair = SessionKeyPair::generate(rsa_bits)?;
    let pem = keypair.public_key_pem()?;
    channel.send_public_key(pem.as_bytes())?;
    channel.expect_token(ControlToken::KeyReceived)?;

    session.advance(SessionState::Authenticating)?;
    let auth = channel.recv_message()?;
    let presented = keypair
        .decrypt(&auth)
        .ok()
        .and_then(|plain| Credentials::parse(&plain));
    match presented {
        Some(c) if c == *credentials => {
            channel.send_token(ControlToken::AuthSuccess)?;
            session.authenticate()?;
            info!("Authenticated {} as {}", session.peer(), c.username);
        }
        Some(c) => {
            channel.send_token(ControlToken::AuthFailed)?;
            return Err(TransferError::AuthenticationFailure(format!(
                "{} presented wrong credentials for {:?}",
                session.peer(),
                c.username
            )));
        }
        None => {
            channel.send_token(ControlToken::AuthFailed)?;
            return Err(TransferError::AuthenticationFailure(format!(
                "{} sent an unreadable credential payload",
                session.peer()
            )));
        }
    }

    session.advance(SessionState::KeyTransfer)?;
    let wrapped = channel.recv_message()?;
    let key = refuse_on_error(channel, unwrap_session_key(&keypair, &wrapped))?;
    channel.send_token(ControlToken::AesKeyReceived)?;
    let iv = channel.recv_message()?;
    let keys = refuse_on_error(channel, SessionKeys::from_parts(&key, &iv).map_err(TransferError::from))?;
    channel.send_token(ControlToken::IvReceived)?;
    session.install_keys(keys)?;

    session.advance(SessionState::MetadataExchange)?;
    let header = channel.recv_message()?;
    let meta = refuse_on_error(
        channel,
        FileMetadata::decode(&header).and_then(|meta| meta.validate(max_file_size).map(|()| meta)),
    )?;
    channel.send_token(ControlToken::FileInfoReceived)?;

    session.log(TransferEvent::HandshakeComplete {
        file_name: meta.name.clone(),
        size: meta.size,
    });
    Ok(meta)
}

fn unwrap_session_key(keypair: &SessionKeyPair, wrapped: &[u8]) -> Result<Vec<u8>> {
    let key = keypair.decrypt(wrapped)?;
    if key.len() != KEY_SIZE {
        return Err(TransferError::protocol(format!(
            "symmetric key is {} bytes, expected {}",
            key.len(),
            KEY_SIZE
        )));
    }
    Ok(key)
}

/// Sender side: authenticate, hand over a fresh session key, announce the file.
pub fn run_sender<C: ControlChannel>(
    channel: &mut C,
    session: &mut Session,
    credentials: &Credentials,
    meta: &FileMetadata,
) -> Result<()> {
    session.advance(SessionState::KeyExchange)?;
    let pem = channel.recv_public_key()?;
    let peer_key = PeerPublicKey::from_pem(&pem)?;
    channel.send_token(ControlToken::KeyReceived)?;

    session.advance(SessionState::Authenticating)?;
    channel.send_message(&peer_key.encrypt(&credentials.encode())?)?;
    let reply = channel.recv_message()?;
    match ControlToken::parse(&reply) {
        Some(ControlToken::AuthSuccess) => session.authenticate()?,
        Some(ControlToken::AuthFailed) => {
            return Err(TransferError::AuthenticationFailure(format!(
                "{} rejected credentials for {:?}",
                session.peer(),
                credentials.username
            )));
        }
        _ => {
            return Err(TransferError::protocol(format!(
                "expected authentication result, got {}",
                describe(&reply)
            )));
        }
    }

    session.advance(SessionState::KeyTransfer)?;
    let keys = SessionKeys::generate();
    channel.send_message(&peer_key.encrypt(&keys.key)?)?;
    channel.expect_accepted(ControlToken::AesKeyReceived, "session key")?;
    channel.send_message(&keys.iv)?;
    channel.expect_accepted(ControlToken::IvReceived, "IV")?;
    session.install_keys(keys)?;

    session.advance(SessionState::MetadataExchange)?;
    channel.send_message(&meta.encode())?;
    channel.expect_accepted(ControlToken::FileInfoReceived, &format!("metadata for {}", meta.name))?;

    session.log(TransferEvent::HandshakeComplete {
        file_name: meta.name.clone(),
        size: meta.size,
    });
    Ok(())
}
