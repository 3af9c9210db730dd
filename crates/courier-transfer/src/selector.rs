/// Transport selection from an observed round-trip time.
///
/// Low-latency links go over TCP; anything at or above the threshold uses the
/// UDP channel with its own reliability layer.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TransferError};

/// Round-trip time, in milliseconds, below which TCP is chosen.
pub const DEFAULT_RTT_THRESHOLD_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        })
    }
}

/// What the caller asked for; `Auto` defers to [`select_transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportChoice {
    Tcp,
    Udp,
    #[default]
    Auto,
}

impl TransportChoice {
    /// Turn the choice into a concrete transport. `Auto` needs a measured RTT.
    pub fn resolve(self, rtt_ms: Option<u64>, threshold_ms: u64) -> Result<Transport> {
        match self {
            Self::Tcp => Ok(Transport::Tcp),
            Self::Udp => Ok(Transport::Udp),
            Self::Auto => rtt_ms
                .map(|rtt| select_transport(rtt, threshold_ms))
                .ok_or_else(|| {
                    TransferError::protocol("automatic transport selection needs an RTT measurement")
                }),
        }
    }
}

impl fmt::Display for TransportChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Auto => "auto",
        })
    }
}

impl FromStr for TransportChoice {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown transport '{}' (expected tcp, udp or auto)", other)),
        }
    }
}

/// TCP when `rtt_ms < threshold_ms`, otherwise UDP.
pub fn select_transport(rtt_ms: u64, threshold_ms: u64) -> Transport {
    if rtt_ms < threshold_ms {
        Transport::Tcp
    } else {
        Transport::Udp
    }
}
