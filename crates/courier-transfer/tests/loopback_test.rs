/// Integration test: send files to localhost over both transports and verify
/// they arrive intact, or not at all.
///
/// The lossy and corrupting cases put a small proxy between sender and
/// receiver that can drop or alter traffic in the sender-to-receiver direction.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use courier_crypto::digest_file;
use courier_transfer::protocol::MAX_DATAGRAM_PAYLOAD;
use courier_transfer::{
    tcp, udp_sender, Credentials, DeliveryOutcome, NullLogger, ReceiverConfig, ReliabilityConfig,
    SenderConfig, TcpReceiver, TransferError, TransferProgress, UdpReceiver,
};

const TEST_RSA_BITS: usize = 1024;

/// Datagrams the sender emits before the first data datagram:
/// CONNECT, KEY_RECEIVED, credentials, key, IV, metadata header.
const UDP_HANDSHAKE_DATAGRAMS: usize = 6;

/// Frames the sender writes before raw ciphertext:
/// KEY_RECEIVED, credentials, key, IV, metadata header.
const TCP_HANDSHAKE_FRAMES: usize = 5;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Workspace {
    root: PathBuf,
}

impl Workspace {
    fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!("courier_test_{}_{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("in")).unwrap();
        Self { root }
    }

    fn out_dir(&self) -> PathBuf {
        self.root.join("out")
    }

    /// Create an input file filled with a known pattern.
    fn input(&self, name: &str, size: usize) -> PathBuf {
        let path = self.root.join("in").join(name);
        let mut f = fs::File::create(&path).unwrap();
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        f.write_all(&data).unwrap();
        path
    }

    fn output_entries(&self) -> usize {
        self.output_names().len()
    }

    fn output_names(&self) -> Vec<String> {
        fs::read_dir(self.out_dir())
            .map(|d| {
                d.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn udp_reliability() -> ReliabilityConfig {
    ReliabilityConfig {
        ack_window: Duration::from_millis(300),
        ack_timeout: Duration::from_millis(100),
        max_rounds: 3,
        retry_pause: Duration::from_millis(50),
        receive_timeout: Duration::from_millis(250),
        max_idle_timeouts: 8,
        resend_batch: 10,
        final_timeout: Duration::from_secs(5),
    }
}

fn receiver_config(ws: &Workspace) -> ReceiverConfig {
    let mut cfg = ReceiverConfig::new("127.0.0.1:0".parse().unwrap(), ws.out_dir());
    cfg.rsa_bits = TEST_RSA_BITS;
    cfg.poll_interval = Duration::from_millis(20);
    cfg.handshake_timeout = Duration::from_secs(5);
    cfg.reliability = udp_reliability();
    cfg.logger = Some(Arc::new(NullLogger));
    cfg
}

fn sender_config(file: &Path, peer: SocketAddr) -> SenderConfig {
    let mut cfg = SenderConfig::new(file, peer);
    cfg.handshake_timeout = Duration::from_secs(5);
    cfg.reliability = udp_reliability();
    cfg
}

fn assert_same_file(sent: &Path, received: &Path) {
    let a = fs::read(sent).unwrap();
    let b = fs::read(received).unwrap();
    assert_eq!(a.len(), b.len(), "size mismatch");
    assert!(a == b, "content mismatch");
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

fn tcp_roundtrip(size: usize) {
    init_tracing();
    let ws = Workspace::new(&format!("tcp_{}", size));
    let input = ws.input("payload.bin", size);

    let receiver = TcpReceiver::bind(receiver_config(&ws)).unwrap();
    let addr = receiver.local_addr().unwrap();
    let handle = thread::spawn(move || receiver.receive_one(&Arc::new(TransferProgress::new())));

    let progress = Arc::new(TransferProgress::new());
    let report = tcp::send_file(&sender_config(&input, addr), progress.clone()).unwrap();
    let received = handle.join().unwrap().unwrap();

    assert_eq!(report.outcome, DeliveryOutcome::Verified);
    assert_eq!(report.bytes, size as u64);
    assert_eq!(report.ciphertext_bytes, (size as u64 / 16 + 1) * 16);
    assert_eq!(received.path, ws.out_dir().join("payload.bin"));
    assert_eq!(received.digest, digest_file(&input).unwrap());
    assert_same_file(&input, &received.path);
    assert_eq!(progress.bytes_done.load(Ordering::Relaxed), size as u64);
    assert_eq!(ws.output_entries(), 1, "staging file left behind");
}

#[test]
fn tcp_transfer_small_file() {
    tcp_roundtrip(1000);
}

#[test]
fn tcp_transfer_block_aligned_file() {
    tcp_roundtrip(4096);
}

#[test]
fn tcp_transfer_multi_chunk_file() {
    tcp_roundtrip(300_000);
}

#[test]
fn tcp_transfer_empty_file() {
    tcp_roundtrip(0);
}

#[test]
fn tcp_wrong_password_writes_nothing() {
    init_tracing();
    let ws = Workspace::new("tcp_auth");
    let input = ws.input("secret.txt", 512);

    let receiver = TcpReceiver::bind(receiver_config(&ws)).unwrap();
    let addr = receiver.local_addr().unwrap();
    let handle = thread::spawn(move || receiver.receive_one(&Arc::new(TransferProgress::new())));

    let mut cfg = sender_config(&input, addr);
    cfg.credentials = Credentials::new("admin", "letmein");
    let err = tcp::send_file(&cfg, Arc::new(TransferProgress::new())).unwrap_err();
    assert!(matches!(err, TransferError::AuthenticationFailure(_)), "{:?}", err);

    let err = handle.join().unwrap().unwrap_err();
    assert!(matches!(err, TransferError::AuthenticationFailure(_)), "{:?}", err);
    assert_eq!(ws.output_entries(), 0);
}

#[test]
fn tcp_serve_survives_failed_session_and_stops_on_cancel() {
    init_tracing();
    let ws = Workspace::new("tcp_serve");
    let input = ws.input("notes.txt", 2048);

    let receiver = TcpReceiver::bind(receiver_config(&ws)).unwrap();
    let addr = receiver.local_addr().unwrap();
    let progress = Arc::new(TransferProgress::new());
    let serve_progress = progress.clone();
    let handle = thread::spawn(move || receiver.serve(&serve_progress));

    let mut bad = sender_config(&input, addr);
    bad.credentials = Credentials::new("root", "admin123");
    assert!(tcp::send_file(&bad, Arc::new(TransferProgress::new())).is_err());

    let report = tcp::send_file(&sender_config(&input, addr), Arc::new(TransferProgress::new())).unwrap();
    assert_eq!(report.outcome, DeliveryOutcome::Verified);
    assert_same_file(&input, &ws.out_dir().join("notes.txt"));

    progress.cancel();
    let started = Instant::now();
    handle.join().unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(progress.sessions_completed.load(Ordering::Relaxed), 1);
}

/// Forward one TCP connection, flipping a single ciphertext byte.
fn spawn_corrupting_tcp_proxy(target: SocketAddr, flip_at: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        let (mut client, _) = listener.accept().unwrap();
        let mut upstream = TcpStream::connect(target).unwrap();

        let mut back_from = upstream.try_clone().unwrap();
        let mut back_to = client.try_clone().unwrap();
        thread::spawn(move || {
            let _ = io::copy(&mut back_from, &mut back_to);
            let _ = back_to.shutdown(std::net::Shutdown::Write);
        });

        for _ in 0..TCP_HANDSHAKE_FRAMES {
            let mut len = [0u8; 4];
            client.read_exact(&mut len).unwrap();
            let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
            client.read_exact(&mut frame).unwrap();
            upstream.write_all(&len).unwrap();
            upstream.write_all(&frame).unwrap();
        }

        let mut head = vec![0u8; flip_at + 1];
        client.read_exact(&mut head).unwrap();
        head[flip_at] ^= 0x01;
        upstream.write_all(&head).unwrap();
        let _ = io::copy(&mut client, &mut upstream);
        let _ = upstream.shutdown(std::net::Shutdown::Write);
    });

    addr
}

#[test]
fn tcp_corrupted_ciphertext_is_discarded() {
    init_tracing();
    let ws = Workspace::new("tcp_corrupt");
    let input = ws.input("ledger.db", 100_000);

    let receiver = TcpReceiver::bind(receiver_config(&ws)).unwrap();
    let proxy = spawn_corrupting_tcp_proxy(receiver.local_addr().unwrap(), 5000);
    let handle = thread::spawn(move || receiver.receive_one(&Arc::new(TransferProgress::new())));

    let err = tcp::send_file(&sender_config(&input, proxy), Arc::new(TransferProgress::new())).unwrap_err();
    assert!(matches!(err, TransferError::IntegrityFailure(_)), "{:?}", err);

    let err = handle.join().unwrap().unwrap_err();
    assert!(matches!(err, TransferError::IntegrityFailure(_)), "{:?}", err);
    assert_eq!(ws.output_entries(), 0);
}

/// Forward one TCP connection, passing the handshake through untouched and
/// then trickling the ciphertext upstream a few kilobytes at a time.
fn spawn_slow_tcp_relay(target: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        let (mut client, _) = listener.accept().unwrap();
        let mut upstream = TcpStream::connect(target).unwrap();

        let mut back_from = upstream.try_clone().unwrap();
        let mut back_to = client.try_clone().unwrap();
        thread::spawn(move || {
            let _ = io::copy(&mut back_from, &mut back_to);
            let _ = back_to.shutdown(std::net::Shutdown::Write);
        });

        for _ in 0..TCP_HANDSHAKE_FRAMES {
            let mut len = [0u8; 4];
            client.read_exact(&mut len).unwrap();
            let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
            client.read_exact(&mut frame).unwrap();
            upstream.write_all(&len).unwrap();
            upstream.write_all(&frame).unwrap();
        }

        let mut buf = [0u8; 4096];
        loop {
            let n = match client.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if upstream.write_all(&buf[..n]).is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = upstream.shutdown(std::net::Shutdown::Both);
        let _ = client.shutdown(std::net::Shutdown::Both);
    });

    addr
}

#[test]
fn tcp_cancel_mid_transfer_discards_partial_file() {
    init_tracing();
    let ws = Workspace::new("tcp_cancel_mid");
    let input = ws.input("big.bin", 8 * 1024 * 1024);

    let receiver = TcpReceiver::bind(receiver_config(&ws)).unwrap();
    let relay = spawn_slow_tcp_relay(receiver.local_addr().unwrap());
    let progress = Arc::new(TransferProgress::new());
    let receive_progress = progress.clone();
    let handle = thread::spawn(move || receiver.receive_one(&receive_progress));

    let cfg = sender_config(&input, relay);
    let sender = thread::spawn(move || tcp::send_file(&cfg, Arc::new(TransferProgress::new())));

    let deadline = Instant::now() + Duration::from_secs(10);
    while !ws.output_names().contains(&".big.bin.part".to_string()) {
        assert!(Instant::now() < deadline, "staging file never appeared");
        thread::sleep(Duration::from_millis(10));
    }
    while progress.bytes_done.load(Ordering::Relaxed) == 0 {
        assert!(Instant::now() < deadline, "no ciphertext reached the receiver");
        thread::sleep(Duration::from_millis(10));
    }
    progress.cancel();

    let err = handle.join().unwrap().unwrap_err();
    assert!(matches!(err, TransferError::Cancelled), "{:?}", err);
    assert_eq!(ws.output_names(), Vec::<String>::new());

    let sent = sender.join().unwrap();
    assert!(
        !matches!(&sent, Ok(report) if report.outcome == DeliveryOutcome::Verified),
        "sender claims delivery of a cancelled transfer"
    );
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

fn udp_roundtrip(size: usize) {
    init_tracing();
    let ws = Workspace::new(&format!("udp_{}", size));
    let input = ws.input("payload.bin", size);

    let receiver = UdpReceiver::bind(receiver_config(&ws)).unwrap();
    let addr = receiver.local_addr().unwrap();
    let handle = thread::spawn(move || receiver.receive_one(&Arc::new(TransferProgress::new())));

    let report = udp_sender::send_file(&sender_config(&input, addr), Arc::new(TransferProgress::new())).unwrap();
    let received = handle.join().unwrap().unwrap();

    let ciphertext_len = (size / 16 + 1) * 16;
    assert_eq!(report.outcome, DeliveryOutcome::Verified);
    assert_eq!(report.datagrams as usize, ciphertext_len.div_ceil(MAX_DATAGRAM_PAYLOAD));
    assert_eq!(received.digest, digest_file(&input).unwrap());
    assert_same_file(&input, &received.path);
    assert_eq!(ws.output_entries(), 1, "staging file left behind");
}

#[test]
fn udp_transfer_single_datagram() {
    udp_roundtrip(10 * 1024);
}

#[test]
fn udp_transfer_many_datagrams() {
    udp_roundtrip(1024 * 1024);
}

#[test]
fn udp_transfer_nearly_full_last_datagram() {
    // Third datagram ends 13 bytes short of the payload limit.
    udp_roundtrip(MAX_DATAGRAM_PAYLOAD * 3 - 16);
}

#[test]
fn udp_transfer_empty_file() {
    udp_roundtrip(0);
}

#[test]
fn udp_wrong_password_writes_nothing() {
    init_tracing();
    let ws = Workspace::new("udp_auth");
    let input = ws.input("secret.txt", 512);

    let receiver = UdpReceiver::bind(receiver_config(&ws)).unwrap();
    let addr = receiver.local_addr().unwrap();
    let handle = thread::spawn(move || receiver.receive_one(&Arc::new(TransferProgress::new())));

    let mut cfg = sender_config(&input, addr);
    cfg.credentials = Credentials::new("admin", "admin1234");
    let err = udp_sender::send_file(&cfg, Arc::new(TransferProgress::new())).unwrap_err();
    assert!(matches!(err, TransferError::AuthenticationFailure(_)), "{:?}", err);

    let err = handle.join().unwrap().unwrap_err();
    assert!(matches!(err, TransferError::AuthenticationFailure(_)), "{:?}", err);
    assert_eq!(ws.output_entries(), 0);
}

#[test]
fn udp_receiver_stops_on_cancel() {
    init_tracing();
    let ws = Workspace::new("udp_cancel");
    let receiver = UdpReceiver::bind(receiver_config(&ws)).unwrap();
    let progress = Arc::new(TransferProgress::new());
    let serve_progress = progress.clone();
    let handle = thread::spawn(move || receiver.serve(&serve_progress));

    thread::sleep(Duration::from_millis(100));
    progress.cancel();
    let started = Instant::now();
    handle.join().unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

/// UDP relay that passes every sender datagram through `tamper` before
/// forwarding it. Returning `false` drops the datagram. Replies pass untouched.
struct UdpProxy {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
}

impl UdpProxy {
    fn spawn<F>(target: SocketAddr, mut tamper: F) -> Self
    where
        F: FnMut(usize, &mut Vec<u8>) -> bool + Send + 'static,
    {
        let front = UdpSocket::bind("127.0.0.1:0").unwrap();
        let back = UdpSocket::bind("127.0.0.1:0").unwrap();
        front.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        back.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let addr = front.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let client: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

        {
            let front = front.try_clone().unwrap();
            let back = back.try_clone().unwrap();
            let stop = stop.clone();
            let client = client.clone();
            thread::spawn(move || {
                let mut buf = vec![0u8; 65536];
                let mut index = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    let Ok((n, from)) = front.recv_from(&mut buf) else {
                        continue;
                    };
                    *client.lock().unwrap() = Some(from);
                    let mut datagram = buf[..n].to_vec();
                    let keep = tamper(index, &mut datagram);
                    index += 1;
                    if keep {
                        let _ = back.send_to(&datagram, target);
                    }
                }
            });
        }
        {
            let stop = stop.clone();
            thread::spawn(move || {
                let mut buf = vec![0u8; 65536];
                while !stop.load(Ordering::Relaxed) {
                    let Ok((n, _)) = back.recv_from(&mut buf) else {
                        continue;
                    };
                    if let Some(to) = *client.lock().unwrap() {
                        let _ = front.send_to(&buf[..n], to);
                    }
                }
            });
        }

        Self { addr, stop }
    }
}

impl Drop for UdpProxy {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn data_seq(index: usize, datagram: &[u8]) -> Option<u32> {
    if index < UDP_HANDSHAKE_DATAGRAMS || datagram.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]))
}

#[test]
fn udp_lost_datagram_is_retransmitted() {
    init_tracing();
    let ws = Workspace::new("udp_loss");
    let input = ws.input("archive.tar", 200_000);

    let receiver = UdpReceiver::bind(receiver_config(&ws)).unwrap();
    let mut dropped = false;
    let proxy = UdpProxy::spawn(receiver.local_addr().unwrap(), move |index, datagram| {
        if !dropped && data_seq(index, datagram) == Some(1) {
            dropped = true;
            return false;
        }
        true
    });
    let handle = thread::spawn(move || receiver.receive_one(&Arc::new(TransferProgress::new())));

    let progress = Arc::new(TransferProgress::new());
    let report = udp_sender::send_file(&sender_config(&input, proxy.addr), progress.clone()).unwrap();
    let received = handle.join().unwrap().unwrap();

    assert_eq!(report.outcome, DeliveryOutcome::Verified);
    assert_eq!(report.datagrams, 4);
    assert!(report.retransmits >= 1);
    assert!(progress.retransmits.load(Ordering::Relaxed) >= 1);
    assert_same_file(&input, &received.path);
}

#[test]
fn udp_gap_is_filled_by_resend_request_within_one_round() {
    init_tracing();
    let ws = Workspace::new("udp_resend");
    let input = ws.input("archive.tar", 200_000);

    let receiver = UdpReceiver::bind(receiver_config(&ws)).unwrap();
    let mut dropped = false;
    let proxy = UdpProxy::spawn(receiver.local_addr().unwrap(), move |index, datagram| {
        if !dropped && data_seq(index, datagram) == Some(1) {
            dropped = true;
            return false;
        }
        true
    });
    let handle = thread::spawn(move || receiver.receive_one(&Arc::new(TransferProgress::new())));

    // A single round that outlasts the receiver's idle timeout, so only a
    // RESEND request can recover the dropped datagram.
    let mut cfg = sender_config(&input, proxy.addr);
    cfg.reliability.max_rounds = 1;
    cfg.reliability.ack_window = Duration::from_secs(3);
    cfg.reliability.ack_timeout = Duration::from_secs(1);
    let report = udp_sender::send_file(&cfg, Arc::new(TransferProgress::new())).unwrap();
    let received = handle.join().unwrap().unwrap();

    assert_eq!(report.outcome, DeliveryOutcome::Verified);
    assert_eq!(report.datagrams, 4);
    assert_eq!(report.retransmits, 1);
    assert_same_file(&input, &received.path);
}

#[test]
fn udp_persistent_loss_exhausts_retries() {
    init_tracing();
    let ws = Workspace::new("udp_exhaust");
    let input = ws.input("archive.tar", 200_000);

    let receiver = UdpReceiver::bind(receiver_config(&ws)).unwrap();
    let proxy = UdpProxy::spawn(receiver.local_addr().unwrap(), |index, datagram| {
        data_seq(index, datagram) != Some(1)
    });
    let handle = thread::spawn(move || receiver.receive_one(&Arc::new(TransferProgress::new())));

    let err = udp_sender::send_file(&sender_config(&input, proxy.addr), Arc::new(TransferProgress::new()))
        .unwrap_err();
    match err {
        TransferError::TimeoutExhausted { acknowledged, total } => {
            assert_eq!(total, 4);
            assert_eq!(acknowledged, 3);
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let err = handle.join().unwrap().unwrap_err();
    assert!(matches!(err, TransferError::TimeoutExhausted { .. }), "{:?}", err);
    assert_eq!(ws.output_entries(), 0);
}

#[test]
fn udp_corrupted_datagram_is_discarded() {
    init_tracing();
    let ws = Workspace::new("udp_corrupt");
    let input = ws.input("archive.tar", 200_000);

    let receiver = UdpReceiver::bind(receiver_config(&ws)).unwrap();
    let mut flipped = false;
    let proxy = UdpProxy::spawn(receiver.local_addr().unwrap(), move |index, datagram| {
        if !flipped && data_seq(index, datagram) == Some(0) {
            datagram[4 + 100] ^= 0x80;
            flipped = true;
        }
        true
    });
    let handle = thread::spawn(move || receiver.receive_one(&Arc::new(TransferProgress::new())));

    let err = udp_sender::send_file(&sender_config(&input, proxy.addr), Arc::new(TransferProgress::new()))
        .unwrap_err();
    assert!(matches!(err, TransferError::IntegrityFailure(_)), "{:?}", err);

    let err = handle.join().unwrap().unwrap_err();
    assert!(matches!(err, TransferError::IntegrityFailure(_)), "{:?}", err);
    assert_eq!(ws.output_entries(), 0);
}
