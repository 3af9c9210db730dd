/// UDP sender: handshake, then rounds of blast-and-collect.
///
/// ```text
/// round 1..=max_rounds:
///   send every unacknowledged datagram
///   collect acks for up to ack_window (a read timeout ends the window early)
///   answer RESEND:<seq> immediately
/// then wait for FILE_SUCCESS / FILE_FAILED
/// ```
///
/// The whole file is encrypted up front; datagram `seq` always carries the
/// same ciphertext slice, so retransmissions are byte-identical.

use std::fs;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use courier_crypto::encrypt_vec;
use tracing::{debug, info};

use crate::config::{ReliabilityConfig, SenderConfig};
use crate::datagram::UdpControl;
use crate::delivery::{describe_source, verdict, DeliveryOutcome, SendReport};
use crate::error::{is_timeout, Result, TransferError};
use crate::handshake::{self, ControlChannel};
use crate::logging::TransferEvent;
use crate::metadata::FileMetadata;
use crate::net::{create_udp_socket, unspecified_for};
use crate::progress::TransferProgress;
use crate::protocol::{
    datagram_payload, encode_datagram, packet_count, ControlToken, Reply, MAX_DATAGRAM_PAYLOAD,
};
use crate::session::{Role, Session, SessionState};
use crate::state::AckTracker;

/// Receive buffer for replies; acks and tokens are tiny.
const REPLY_BUF_SIZE: usize = 2048;

/// Send one file over UDP. Blocks until the receiver's verdict, an error, or cancellation.
pub fn send_file(config: &SenderConfig, progress: Arc<TransferProgress>) -> Result<SendReport> {
    let started = Instant::now();
    let meta = describe_source(config)?;
    progress.begin_session(meta.size);

    let mut session = Session::new(
        Role::Sender,
        config.peer,
        "udp-sender",
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
    let peer = config.peer;
    let socket = create_udp_socket(unspecified_for(peer), false)?;
    socket.set_read_timeout(Some(config.handshake_timeout))?;
    info!("UDP sender {} -> {}", socket.local_addr()?, peer);

    let mut control = UdpControl::new(&socket, peer);
    control.send_token(ControlToken::Connect)?;
    handshake::run_sender(&mut control, session, &config.credentials, meta)?;

    session.advance(SessionState::Transferring)?;
    let plaintext = fs::read(&config.file_path)?;
    if plaintext.len() as u64 != meta.size {
        return Err(TransferError::IntegrityFailure(format!(
            "{} changed size during transfer ({} announced, {} read)",
            meta.name,
            meta.size,
            plaintext.len()
        )));
    }
    let ciphertext = encrypt_vec(session.keys()?, plaintext);
    let total = packet_count(ciphertext.len() as u64)
        .ok_or_else(|| TransferError::protocol("file too large to frame"))?;

    let mut blaster = Blaster {
        socket: &socket,
        peer,
        ciphertext: &ciphertext,
        acks: AckTracker::new(total),
        retransmits: 0,
    };
    let early = blaster.run_rounds(session, &config.reliability, meta.size)?;
    let retransmits = blaster.retransmits;

    session.advance(SessionState::Verifying)?;
    let token = match early {
        Some(t) => Some(t),
        None => blaster.await_verdict(&config.reliability)?,
    };
    let outcome = verdict(token, meta)?;
    if outcome == DeliveryOutcome::Verified {
        session.advance(SessionState::Committed)?;
    }

    let elapsed = started.elapsed();
    session.log(TransferEvent::TransferComplete {
        bytes: meta.size,
        elapsed_ms: elapsed.as_millis() as u64,
        retransmits,
    });

    Ok(SendReport {
        session_id: session.id(),
        outcome,
        file_name: meta.name.clone(),
        bytes: meta.size,
        ciphertext_bytes: ciphertext.len() as u64,
        datagrams: total,
        retransmits,
        elapsed,
    })
}

struct Blaster<'a> {
    socket: &'a UdpSocket,
    peer: SocketAddr,
    ciphertext: &'a [u8],
    acks: AckTracker,
    retransmits: u64,
}

impl Blaster<'_> {
    /// Returns the receiver's verdict if it arrived before every ack did.
    fn run_rounds(
        &mut self,
        session: &Session,
        rel: &ReliabilityConfig,
        plaintext_len: u64,
    ) -> Result<Option<ControlToken>> {
        let total = self.acks.total();
        let mut round = 0u32;

        while !self.acks.is_complete() {
            if round >= rel.max_rounds {
                return Err(TransferError::TimeoutExhausted {
                    acknowledged: self.acks.acknowledged(),
                    total,
                });
            }
            session.check_cancelled()?;
            round += 1;

            let pending = self.acks.unacknowledged();
            session.log(TransferEvent::RoundStarted {
                round,
                pending: pending.len() as u32,
            });
            for &seq in &pending {
                self.send(seq)?;
            }
            if round > 1 {
                self.count_retransmits(session, pending.len() as u64);
            }

            let early = self.collect_acks(session, rel)?;
            session.log(TransferEvent::RoundFinished {
                round,
                acknowledged: self.acks.acknowledged(),
                total,
            });
            let acked_bytes = self.acks.acknowledged() as u64 * MAX_DATAGRAM_PAYLOAD as u64;
            session
                .progress()
                .bytes_done
                .store(acked_bytes.min(plaintext_len), Ordering::Relaxed);

            if early.is_some() {
                return Ok(early);
            }
            if !self.acks.is_complete() && round < rel.max_rounds {
                thread::sleep(rel.retry_pause);
            }
        }
        Ok(None)
    }

    /// Read replies until every datagram is acknowledged, the window closes,
    /// or a read times out.
    fn collect_acks(&mut self, session: &Session, rel: &ReliabilityConfig) -> Result<Option<ControlToken>> {
        self.socket.set_read_timeout(Some(rel.ack_timeout))?;
        let deadline = Instant::now() + rel.ack_window;
        let mut buf = [0u8; REPLY_BUF_SIZE];

        while !self.acks.is_complete() && Instant::now() < deadline {
            session.check_cancelled()?;
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) if from == self.peer => match Reply::parse(&buf[..n]) {
                    Some(Reply::Ack(seq)) => {
                        self.acks.acknowledge(seq);
                    }
                    Some(Reply::Resend(seq)) => self.resend(session, seq)?,
                    Some(Reply::Final(token)) => return Ok(Some(token)),
                    None => debug!("Ignoring {} byte reply", n),
                },
                Ok((_, from)) => debug!("Ignoring datagram from {}", from),
                Err(e) if is_timeout(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Wait for FILE_SUCCESS / FILE_FAILED, still serving late resend requests.
    fn await_verdict(&mut self, rel: &ReliabilityConfig) -> Result<Option<ControlToken>> {
        let deadline = Instant::now() + rel.final_timeout;
        let mut buf = [0u8; REPLY_BUF_SIZE];

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(left.max(Duration::from_millis(1))))?;
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) if from == self.peer => match Reply::parse(&buf[..n]) {
                    Some(Reply::Final(token)) => return Ok(Some(token)),
                    Some(Reply::Resend(seq)) if seq < self.acks.total() => {
                        self.send(seq)?;
                        self.retransmits += 1;
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn resend(&mut self, session: &Session, seq: u32) -> Result<()> {
        if seq >= self.acks.total() {
            debug!("Ignoring resend request for out-of-range seq {}", seq);
            return Ok(());
        }
        session.log(TransferEvent::ResendRequested { seq });
        self.send(seq)?;
        self.count_retransmits(session, 1);
        Ok(())
    }

    fn send(&self, seq: u32) -> Result<()> {
        let datagram = encode_datagram(seq, datagram_payload(self.ciphertext, seq));
        self.socket.send_to(&datagram, self.peer)?;
        Ok(())
    }

    fn count_retransmits(&mut self, session: &Session, n: u64) {
        self.retransmits += n;
        session.progress().retransmits.fetch_add(n, Ordering::Relaxed);
    }
}
