/// UDP receiver: wait for CONNECT, run the handshake, collect datagrams.
///
/// Every data datagram is acknowledged by echoing its 4-byte sequence number,
/// duplicates included. When a read times out with gaps outstanding, the
/// lowest missing sequence numbers are requested with `RESEND:<seq>`. Once
/// every sequence number is present the chunks are decrypted one at a time in
/// sequence order, truncated to the declared size and verified before commit.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Instant;

use courier_crypto::CbcDecryptor;
use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;
use crate::datagram::UdpControl;
use crate::delivery::{verify_and_commit, PlaintextSink, ReceiveReport};
use crate::error::{is_timeout, Result, TransferError};
use crate::handshake::{self, ControlChannel};
use crate::logging::TransferEvent;
use crate::net::create_udp_socket;
use crate::progress::TransferProgress;
use crate::protocol::{decode_datagram, encode_resend, ControlToken, MAX_DATAGRAM};
use crate::session::{Role, Session, SessionState};
use crate::state::{Insert, TransferState};
use crate::storage::OutputDir;

/// Listening side of the UDP channel.
pub struct UdpReceiver {
    socket: UdpSocket,
    output: OutputDir,
    config: ReceiverConfig,
}

impl UdpReceiver {
    pub fn bind(config: ReceiverConfig) -> Result<Self> {
        let output = OutputDir::open(&config.output_dir)?;
        let socket = create_udp_socket(config.bind_addr, true)?;
        info!("UDP receiver listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            output,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wait for one CONNECT and run that session to completion.
    pub fn receive_one(&self, progress: &Arc<TransferProgress>) -> Result<ReceiveReport> {
        let peer = self.wait_for_connect(progress)?;
        self.handle(peer, progress)
    }

    /// Serve sessions one after another until cancelled.
    pub fn serve(&self, progress: &Arc<TransferProgress>) -> Result<()> {
        loop {
            let peer = match self.wait_for_connect(progress) {
                Ok(peer) => peer,
                Err(TransferError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };
            match self.handle(peer, progress) {
                Ok(report) => info!(
                    "Received {} ({} bytes) from {} in {:.1?}",
                    report.file_name, report.bytes, report.peer, report.elapsed
                ),
                Err(TransferError::Cancelled) => return Ok(()),
                Err(e) => warn!("Session with {} failed: {}", peer, e),
            }
        }
    }

    /// Poll for CONNECT with a bounded read timeout so cancellation is noticed.
    fn wait_for_connect(&self, progress: &TransferProgress) -> Result<SocketAddr> {
        self.socket.set_read_timeout(Some(self.config.poll_interval))?;
        let mut buf = vec![0u8; MAX_DATAGRAM + 1];
        loop {
            if progress.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if ControlToken::parse(&buf[..n]) == Some(ControlToken::Connect) {
                        info!("UDP session request from {}", from);
                        return Ok(from);
                    }
                    debug!("Ignoring {} byte datagram from {} while idle", n, from);
                }
                Err(e) if is_timeout(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handle(&self, peer: SocketAddr, progress: &Arc<TransferProgress>) -> Result<ReceiveReport> {
        let started = Instant::now();
        progress.begin_session(0);
        let mut session = Session::new(
            Role::Receiver,
            peer,
            "udp-receiver",
            self.config.logger.clone(),
            progress.clone(),
        );
        let result = self.receive_session(&mut session, started);
        session.settle(result)
    }

    fn receive_session(&self, session: &mut Session, started: Instant) -> Result<ReceiveReport> {
        let cfg = &self.config;
        let peer = session.peer();
        self.socket.set_read_timeout(Some(cfg.handshake_timeout))?;

        let mut control = UdpControl::new(&self.socket, peer);
        let meta = handshake::run_receiver(&mut control, session, &cfg.credentials, cfg.rsa_bits, cfg.max_file_size)?;
        let (total, expected_len) = match (meta.packet_count(), meta.expected_ciphertext_len()) {
            (Some(total), Some(len)) => (total, len),
            _ => return Err(TransferError::protocol("declared size cannot be framed")),
        };
        session
            .progress()
            .bytes_total
            .store(meta.size, std::sync::atomic::Ordering::Relaxed);

        session.advance(SessionState::Transferring)?;
        let state = self.collect(session, total)?;

        if state.bytes() != expected_len {
            if let Err(e) = control.send_token(ControlToken::FileFailed) {
                warn!("Could not report failure to {}: {}", peer, e);
            }
            return Err(TransferError::protocol(format!(
                "received {} ciphertext bytes, expected {}",
                state.bytes(),
                expected_len
            )));
        }

        let mut staged = self.output.stage(&meta.name)?;
        let mut decryptor = CbcDecryptor::new(session.keys()?);
        let mut sink = PlaintextSink::new(meta.size);
        for chunk in state.into_chunks() {
            let plain = decryptor.update(&chunk);
            sink.push(&plain, &mut staged)?;
        }
        decryptor.finish()?;

        verify_and_commit(&mut control, session, &meta, staged, sink, started)
    }

    /// Gather datagrams until all `total` sequence numbers are held.
    fn collect(&self, session: &Session, total: u32) -> Result<TransferState> {
        let rel = &self.config.reliability;
        let peer = session.peer();
        self.socket.set_read_timeout(Some(rel.receive_timeout))?;

        let mut state = TransferState::new(total);
        let mut buf = vec![0u8; MAX_DATAGRAM + 1];
        let mut idle = 0u32;

        while !state.is_complete() {
            session.check_cancelled()?;
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) if from == peer => {
                    let Some((seq, chunk)) = decode_datagram(&buf[..n]) else {
                        debug!("Ignoring {} byte runt datagram", n);
                        continue;
                    };
                    match state.insert(seq, chunk) {
                        Insert::New => session.progress().add_bytes(chunk.len() as u64),
                        Insert::Duplicate => {}
                        Insert::Conflict => warn!("Datagram {} arrived again with different bytes; keeping first copy", seq),
                        Insert::OutOfRange => {
                            warn!("Ignoring datagram {} beyond expected count {}", seq, state.expected());
                            continue;
                        }
                    }
                    idle = 0;
                    self.socket.send_to(&seq.to_be_bytes(), peer)?;
                }
                Ok((_, from)) => debug!("Ignoring datagram from {}", from),
                Err(e) if is_timeout(&e) => {
                    idle += 1;
                    if idle > rel.max_idle_timeouts {
                        return Err(TransferError::TimeoutExhausted {
                            acknowledged: state.received(),
                            total: state.expected(),
                        });
                    }
                    let missing = state.missing(rel.resend_batch);
                    session.log(TransferEvent::GapDetected {
                        missing: state.expected() - state.received(),
                        received: state.received(),
                        expected: state.expected(),
                    });
                    for seq in missing {
                        self.socket.send_to(&encode_resend(seq), peer)?;
                        session.log(TransferEvent::ResendRequested { seq });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(state)
    }
}
