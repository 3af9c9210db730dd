use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use courier_transfer::{
    tcp, udp_sender, Credentials, DeliveryOutcome, ReceiverConfig, SenderConfig, SessionState,
    TcpReceiver, Transport, TransferProgress, TransportChoice, UdpReceiver, DEFAULT_PORT,
    DEFAULT_RTT_THRESHOLD_MS,
};

/// Courier - encrypted file transfer over TCP or UDP
#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Send and receive files over an authenticated, encrypted channel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one file to a listening receiver
    Send {
        /// File to send
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Receiver host
        #[arg(long, env = "COURIER_HOST", default_value = "127.0.0.1")]
        host: String,

        /// Receiver port
        #[arg(short, long, env = "COURIER_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        /// tcp, udp, or auto (pick from --rtt-ms)
        #[arg(short, long, env = "COURIER_TRANSPORT", default_value_t = TransportChoice::Auto)]
        transport: TransportChoice,

        /// Measured round-trip time to the receiver, in milliseconds
        #[arg(long, env = "COURIER_RTT_MS")]
        rtt_ms: Option<u64>,

        /// RTT below which auto selection uses TCP
        #[arg(long, env = "COURIER_RTT_THRESHOLD_MS", default_value_t = DEFAULT_RTT_THRESHOLD_MS)]
        rtt_threshold_ms: u64,

        /// Fragment size announced in the metadata header
        #[arg(long, env = "COURIER_FRAGMENT", default_value_t = courier_transfer::DEFAULT_FRAGMENT_SIZE)]
        fragment: u32,

        #[arg(short, long, env = "COURIER_USERNAME", default_value = "admin")]
        username: String,

        #[arg(long, env = "COURIER_PASSWORD", default_value = "admin123", hide_env_values = true)]
        password: String,
    },

    /// Listen for senders and write received files into a directory
    Receive {
        /// Directory received files are written to
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        #[arg(short, long, env = "COURIER_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        /// tcp, udp, or auto (pick from --rtt-ms)
        #[arg(short, long, env = "COURIER_TRANSPORT", default_value_t = TransportChoice::Tcp)]
        transport: TransportChoice,

        #[arg(long, env = "COURIER_RTT_MS")]
        rtt_ms: Option<u64>,

        #[arg(long, env = "COURIER_RTT_THRESHOLD_MS", default_value_t = DEFAULT_RTT_THRESHOLD_MS)]
        rtt_threshold_ms: u64,

        #[arg(short, long, env = "COURIER_USERNAME", default_value = "admin")]
        username: String,

        #[arg(long, env = "COURIER_PASSWORD", default_value = "admin123", hide_env_values = true)]
        password: String,

        /// Exit after the first session instead of serving until interrupted
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=info,courier_transfer=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let progress = Arc::new(TransferProgress::new());
    tokio::spawn(shutdown_signal(progress.clone()));
    let ticker = tokio::spawn(report_progress(progress.clone()));

    let result = match cli.command {
        Commands::Send {
            file,
            host,
            port,
            transport,
            rtt_ms,
            rtt_threshold_ms,
            fragment,
            username,
            password,
        } => {
            let transport = transport.resolve(rtt_ms, rtt_threshold_ms)?;
            let peer = resolve_addr(&host, port)?;
            let mut config = SenderConfig::new(file, peer);
            config.credentials = Credentials::new(username, password);
            config.fragment_size = fragment;
            send(config, transport, progress).await
        }
        Commands::Receive {
            dir,
            bind,
            port,
            transport,
            rtt_ms,
            rtt_threshold_ms,
            username,
            password,
            once,
        } => {
            let transport = transport.resolve(rtt_ms, rtt_threshold_ms)?;
            let bind_addr = resolve_addr(&bind, port)?;
            let mut config = ReceiverConfig::new(bind_addr, dir);
            config.credentials = Credentials::new(username, password);
            receive(config, transport, once, progress).await
        }
    };

    ticker.abort();
    result
}

fn resolve_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {}:{}", host, port))?
        .next()
        .with_context(|| format!("{} has no usable address", host))
}

async fn send(
    config: SenderConfig,
    transport: Transport,
    progress: Arc<TransferProgress>,
) -> anyhow::Result<()> {
    info!("Sending {} to {} over {}", config.file_path.display(), config.peer, transport);
    let path = config.file_path.clone();

    let report = tokio::task::spawn_blocking(move || match transport {
        Transport::Tcp => tcp::send_file(&config, progress),
        Transport::Udp => udp_sender::send_file(&config, progress),
    })
    .await
    .context("transfer task panicked")?
    .with_context(|| format!("failed to send {}", path.display()))?;

    match report.outcome {
        DeliveryOutcome::Verified => info!(
            "Session {:016x}: sent {} ({} bytes, {} retransmits) in {:.1?}; receiver verified the digest",
            report.session_id, report.file_name, report.bytes, report.retransmits, report.elapsed
        ),
        DeliveryOutcome::Unconfirmed => warn!(
            "Session {:016x}: sent {} ({} bytes) in {:.1?}, but the receiver never confirmed it",
            report.session_id, report.file_name, report.bytes, report.elapsed
        ),
    }
    Ok(())
}

async fn receive(
    config: ReceiverConfig,
    transport: Transport,
    once: bool,
    progress: Arc<TransferProgress>,
) -> anyhow::Result<()> {
    let dir = config.output_dir.clone();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        match (transport, once) {
            (Transport::Tcp, true) => {
                let report = TcpReceiver::bind(config)?.receive_one(&progress)?;
                info!(
                    "Session {:016x}: saved {} ({} bytes)",
                    report.session_id,
                    report.path.display(),
                    report.bytes
                );
            }
            (Transport::Tcp, false) => TcpReceiver::bind(config)?.serve(&progress)?,
            (Transport::Udp, true) => {
                let report = UdpReceiver::bind(config)?.receive_one(&progress)?;
                info!(
                    "Session {:016x}: saved {} ({} bytes)",
                    report.session_id,
                    report.path.display(),
                    report.bytes
                );
            }
            (Transport::Udp, false) => UdpReceiver::bind(config)?.serve(&progress)?,
        }
        Ok(())
    })
    .await
    .context("receiver task panicked")?
    .with_context(|| format!("receiver for {} stopped", dir.display()))
}

/// Periodically log how far the active session has come.
async fn report_progress(progress: Arc<TransferProgress>) {
    let mut interval = tokio::time::interval(Duration::from_secs(2));
    loop {
        interval.tick().await;
        if progress.state() == SessionState::Transferring {
            info!("{:.0}% transferred", progress.fraction() * 100.0);
        }
    }
}

async fn shutdown_signal(progress: Arc<TransferProgress>) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => info!("Received Ctrl+C, cancelling..."),
                _ = sigterm.recv() => info!("Received SIGTERM, cancelling..."),
            },
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, cancelling...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, cancelling...");
    }
    progress.cancel();
}
