/// TCP channel.
///
/// The handshake runs over length-prefixed frames. Once the receiver has
/// acknowledged the metadata, the sender streams raw ciphertext, reading the
/// file in chunks of `max(fragment_size, 64 KB)`, and the receiver reads
/// exactly the ciphertext length implied by the declared size. A closing
/// `FILE_SUCCESS` / `FILE_FAILED` frame reports the digest check.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use courier_crypto::{CbcDecryptor, CbcEncryptor};
use tracing::{debug, info, warn};

use crate::config::{ReceiverConfig, SenderConfig};
use crate::delivery::{
    describe_source, verdict, verify_and_commit, DeliveryOutcome, PlaintextSink, ReceiveReport,
    SendReport,
};
use crate::error::{is_timeout, Result, TransferError};
use crate::handshake::{self, ControlChannel};
use crate::logging::TransferEvent;
use crate::metadata::FileMetadata;
use crate::net::{create_listener, tune_stream};
use crate::progress::TransferProgress;
use crate::protocol::{read_frame, write_frame, ControlToken, TCP_STREAM_CHUNK};
use crate::session::{Role, Session, SessionState};
use crate::storage::OutputDir;

impl ControlChannel for TcpStream {
    fn send_message(&mut self, message: &[u8]) -> Result<()> {
        write_frame(self, message)?;
        Ok(())
    }

    fn recv_message(&mut self) -> Result<Vec<u8>> {
        read_frame(self)
    }
}

/// Send one file over TCP. Blocks until the receiver's verdict, an error, or cancellation.
pub fn send_file(config: &SenderConfig, progress: Arc<TransferProgress>) -> Result<SendReport> {
    let started = Instant::now();
    let meta = describe_source(config)?;
    progress.begin_session(meta.size);

    let mut session = Session::new(
        Role::Sender,
        config.peer,
        "tcp-sender",
        config.logger.clone(),
        progress,
    );
    let result = send_session(config, &mut session, &meta, started);
    session.settle(result)
}

fn send_session(
    config: &SenderConfig,
    session: &mut Session,
    meta: &FileMetadata,
    started: Instant,
) -> Result<SendReport> {
    let mut stream = TcpStream::connect_timeout(&config.peer, config.connect_timeout)?;
    tune_stream(&stream);
    stream.set_read_timeout(Some(config.handshake_timeout))?;
    stream.set_write_timeout(Some(config.handshake_timeout))?;
    info!("Connected to {} over TCP", config.peer);

    handshake::run_sender(&mut stream, session, &config.credentials, meta)?;

    session.advance(SessionState::Transferring)?;
    let mut encryptor = CbcEncryptor::new(session.keys()?);
    let mut file = File::open(&config.file_path)?;
    let mut buf = vec![0u8; (config.fragment_size as usize).max(TCP_STREAM_CHUNK)];
    let mut plain_bytes: u64 = 0;
    let mut cipher_bytes: u64 = 0;

    loop {
        session.check_cancelled()?;
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let ct = encryptor.update(&buf[..n]);
        stream.write_all(&ct)?;
        plain_bytes += n as u64;
        cipher_bytes += ct.len() as u64;
        session.progress().add_bytes(n as u64);
    }
    let tail = encryptor.finish();
    stream.write_all(&tail)?;
    stream.flush()?;
    cipher_bytes += tail.len() as u64;
    debug!("Streamed {} ciphertext bytes to {}", cipher_bytes, config.peer);

    if plain_bytes != meta.size {
        return Err(TransferError::IntegrityFailure(format!(
            "{} changed size during transfer ({} announced, {} sent)",
            meta.name, meta.size, plain_bytes
        )));
    }

    session.advance(SessionState::Verifying)?;
    stream.set_read_timeout(Some(config.reliability.final_timeout))?;
    let token = match read_frame(&mut stream) {
        Ok(frame) => match ControlToken::parse(&frame) {
            Some(t) => Some(t),
            None => return Err(TransferError::protocol("unrecognised verdict frame")),
        },
        Err(TransferError::Io(e)) if is_timeout(&e) || e.kind() == io::ErrorKind::UnexpectedEof => None,
        Err(e) => return Err(e),
    };
    let outcome = verdict(token, meta)?;
    if outcome == DeliveryOutcome::Verified {
        session.advance(SessionState::Committed)?;
    }

    let elapsed = started.elapsed();
    session.log(TransferEvent::TransferComplete {
        bytes: plain_bytes,
        elapsed_ms: elapsed.as_millis() as u64,
        retransmits: 0,
    });

    Ok(SendReport {
        session_id: session.id(),
        outcome,
        file_name: meta.name.clone(),
        bytes: plain_bytes,
        ciphertext_bytes: cipher_bytes,
        datagrams: 0,
        retransmits: 0,
        elapsed,
    })
}

/// Listening side of the TCP channel.
pub struct TcpReceiver {
    listener: TcpListener,
    output: OutputDir,
    config: ReceiverConfig,
}

impl TcpReceiver {
    pub fn bind(config: ReceiverConfig) -> Result<Self> {
        let output = OutputDir::open(&config.output_dir)?;
        let listener = create_listener(config.bind_addr)?;
        info!("TCP receiver listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            output,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept one connection and run its session to completion.
    pub fn receive_one(&self, progress: &Arc<TransferProgress>) -> Result<ReceiveReport> {
        let (stream, peer) = self.accept(progress)?;
        self.handle(stream, peer, progress)
    }

    /// Accept sessions until cancelled. A failed session does not stop the loop.
    pub fn serve(&self, progress: &Arc<TransferProgress>) -> Result<()> {
        loop {
            let (stream, peer) = match self.accept(progress) {
                Ok(conn) => conn,
                Err(TransferError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };
            match self.handle(stream, peer, progress) {
                Ok(report) => info!(
                    "Received {} ({} bytes) from {} in {:.1?}",
                    report.file_name, report.bytes, report.peer, report.elapsed
                ),
                Err(TransferError::Cancelled) => return Ok(()),
                Err(e) => warn!("Session with {} failed: {}", peer, e),
            }
        }
    }

    fn accept(&self, progress: &TransferProgress) -> Result<(TcpStream, SocketAddr)> {
        loop {
            if progress.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    info!("TCP connection from {}", peer);
                    return Ok((stream, peer));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.config.poll_interval);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handle(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        progress: &Arc<TransferProgress>,
    ) -> Result<ReceiveReport> {
        let started = Instant::now();
        progress.begin_session(0);
        let mut session = Session::new(
            Role::Receiver,
            peer,
            "tcp-receiver",
            self.config.logger.clone(),
            progress.clone(),
        );
        let result = self.receive_session(&mut stream, &mut session, started);
        session.settle(result)
    }

    fn receive_session(
        &self,
        stream: &mut TcpStream,
        session: &mut Session,
        started: Instant,
    ) -> Result<ReceiveReport> {
        tune_stream(stream);
        stream.set_read_timeout(Some(self.config.handshake_timeout))?;
        stream.set_write_timeout(Some(self.config.handshake_timeout))?;

        let cfg = &self.config;
        let meta = handshake::run_receiver(stream, session, &cfg.credentials, cfg.rsa_bits, cfg.max_file_size)?;
        let expected = meta
            .expected_ciphertext_len()
            .ok_or_else(|| TransferError::protocol("declared size overflows"))?;
        session
            .progress()
            .bytes_total
            .store(meta.size, std::sync::atomic::Ordering::Relaxed);

        session.advance(SessionState::Transferring)?;
        stream.set_read_timeout(Some(cfg.reliability.receive_timeout))?;
        let mut staged = self.output.stage(&meta.name)?;
        let mut decryptor = CbcDecryptor::new(session.keys()?);
        let mut sink = PlaintextSink::new(meta.size);
        let mut buf = vec![0u8; (meta.fragment_size as usize).clamp(TCP_STREAM_CHUNK, 4 * TCP_STREAM_CHUNK)];
        let mut remaining = expected;

        while remaining > 0 {
            session.check_cancelled()?;
            let want = remaining.min(buf.len() as u64) as usize;
            stream.read_exact(&mut buf[..want])?;
            remaining -= want as u64;
            let plain = decryptor.update(&buf[..want]);
            sink.push(&plain, &mut staged)?;
            session.progress().add_bytes(want as u64);
        }
        decryptor.finish()?;

        verify_and_commit(stream, session, &meta, staged, sink, started)
    }
}
