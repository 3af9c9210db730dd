/// Wire formats shared by both transports.
///
/// UDP data datagram:
///
/// ```text
/// [0..4]   Sequence number (u32 BE)
/// [4..]    Ciphertext slice (up to 65503 bytes)
/// ```
///
/// UDP public key transfer: one datagram carrying the chunk count (u32 BE),
/// then one datagram per chunk `[index u32 BE][PEM slice]`.
///
/// TCP control messages are length-prefixed frames `[len u32 BE][payload]`.
/// After the metadata exchange the TCP stream carries raw ciphertext.

use std::io::{self, Read, Write};

use crate::error::{Result, TransferError};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 12345;

/// Default fragment size advertised in the metadata header.
pub const DEFAULT_FRAGMENT_SIZE: u32 = 1024;

/// Largest UDP payload that fits an IPv4 datagram.
pub const MAX_DATAGRAM: usize = 65507;

/// Sequence number prefix on each data datagram.
pub const SEQ_HEADER: usize = 4;

/// Ciphertext bytes carried per data datagram.
pub const MAX_DATAGRAM_PAYLOAD: usize = MAX_DATAGRAM - SEQ_HEADER;

/// PEM bytes per public key chunk on UDP.
pub const PUBLIC_KEY_CHUNK: usize = 1024;

/// Upper bound on announced public key chunks. A 4096-bit PEM needs 1.
pub const MAX_KEY_CHUNKS: u32 = 64;

/// Missing sequence numbers named per resend round.
pub const RESEND_BATCH: usize = 10;

/// Minimum plaintext read size on the TCP streaming path (64 KB).
pub const TCP_STREAM_CHUNK: usize = 64 * 1024;

/// Largest TCP control frame accepted.
pub const MAX_CONTROL_FRAME: usize = 64 * 1024;

/// OS socket buffer size requested for both transports (2 MB).
pub const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Prefix of a selective resend request.
pub const RESEND_PREFIX: &[u8] = b"RESEND:";

/// Fixed ASCII control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    Connect,
    KeyReceived,
    AuthSuccess,
    AuthFailed,
    AesKeyReceived,
    IvReceived,
    FileInfoReceived,
    FileSuccess,
    FileFailed,
}

impl ControlToken {
    pub const ALL: [ControlToken; 9] = [
        Self::Connect,
        Self::KeyReceived,
        Self::AuthSuccess,
        Self::AuthFailed,
        Self::AesKeyReceived,
        Self::IvReceived,
        Self::FileInfoReceived,
        Self::FileSuccess,
        Self::FileFailed,
    ];

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Connect => b"CONNECT",
            Self::KeyReceived => b"KEY_RECEIVED",
            Self::AuthSuccess => b"AUTH_SUCCESS",
            Self::AuthFailed => b"AUTH_FAILED",
            Self::AesKeyReceived => b"AES_KEY_RECEIVED",
            Self::IvReceived => b"IV_RECEIVED",
            Self::FileInfoReceived => b"FILE_INFO_RECEIVED",
            Self::FileSuccess => b"FILE_SUCCESS",
            Self::FileFailed => b"FILE_FAILED",
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_bytes() == data)
    }
}

/// Messages the UDP receiver sends back while data is flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack(u32),
    Resend(u32),
    Final(ControlToken),
}

impl Reply {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if let Some(seq) = data.strip_prefix(RESEND_PREFIX) {
            let seq: [u8; 4] = seq.try_into().ok()?;
            return Some(Self::Resend(u32::from_be_bytes(seq)));
        }
        match ControlToken::parse(data) {
            Some(t @ (ControlToken::FileSuccess | ControlToken::FileFailed)) => {
                return Some(Self::Final(t));
            }
            Some(_) => return None,
            None => {}
        }
        let seq: [u8; 4] = data.try_into().ok()?;
        Some(Self::Ack(u32::from_be_bytes(seq)))
    }
}

/// `RESEND:` followed by the sequence number.
pub fn encode_resend(seq: u32) -> Vec<u8> {
    let mut msg = Vec::with_capacity(RESEND_PREFIX.len() + 4);
    msg.extend_from_slice(RESEND_PREFIX);
    msg.extend_from_slice(&seq.to_be_bytes());
    msg
}

/// Build a data datagram.
pub fn encode_datagram(seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SEQ_HEADER + payload.len());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Split a data datagram into sequence number and payload. None if too short.
pub fn decode_datagram(data: &[u8]) -> Option<(u32, &[u8])> {
    if data.len() < SEQ_HEADER {
        return None;
    }
    let (seq, payload) = data.split_at(SEQ_HEADER);
    let seq: [u8; 4] = seq.try_into().ok()?;
    Some((u32::from_be_bytes(seq), payload))
}

/// Number of datagrams needed for `ciphertext_len` bytes. None if it does not fit in u32.
pub fn packet_count(ciphertext_len: u64) -> Option<u32> {
    let per = MAX_DATAGRAM_PAYLOAD as u64;
    u32::try_from(ciphertext_len.div_ceil(per)).ok()
}

/// Slice of the ciphertext carried by datagram `seq`.
pub fn datagram_payload(ciphertext: &[u8], seq: u32) -> &[u8] {
    let start = (seq as usize).saturating_mul(MAX_DATAGRAM_PAYLOAD).min(ciphertext.len());
    let end = start.saturating_add(MAX_DATAGRAM_PAYLOAD).min(ciphertext.len());
    &ciphertext[start..end]
}

/// Split a PEM public key into indexed datagrams.
pub fn split_public_key(pem: &[u8]) -> Vec<Vec<u8>> {
    pem.chunks(PUBLIC_KEY_CHUNK)
        .enumerate()
        .map(|(idx, chunk)| encode_datagram(idx as u32, chunk))
        .collect()
}

/// Reassembles a public key from indexed chunks, in any arrival order.
pub struct KeyAssembler {
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl KeyAssembler {
    /// Start from the datagram announcing the chunk count.
    pub fn from_count_datagram(data: &[u8]) -> Result<Self> {
        let count: [u8; 4] = data
            .try_into()
            .map_err(|_| TransferError::protocol(format!("key chunk count has {} bytes", data.len())))?;
        let count = u32::from_be_bytes(count);
        if count == 0 || count > MAX_KEY_CHUNKS {
            return Err(TransferError::protocol(format!("implausible key chunk count {}", count)));
        }
        Ok(Self {
            chunks: vec![None; count as usize],
            received: 0,
        })
    }

    pub fn expected(&self) -> usize {
        self.chunks.len()
    }

    pub fn accept(&mut self, datagram: &[u8]) -> Result<()> {
        let (idx, chunk) = decode_datagram(datagram)
            .ok_or_else(|| TransferError::protocol("short key chunk"))?;
        let slot = self
            .chunks
            .get_mut(idx as usize)
            .ok_or_else(|| TransferError::protocol(format!("key chunk index {} out of range", idx)))?;
        if slot.is_none() {
            self.received += 1;
        }
        *slot = Some(chunk.to_vec());
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.chunks.len()
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        let mut pem = Vec::new();
        for (idx, chunk) in self.chunks.into_iter().enumerate() {
            let chunk = chunk.ok_or_else(|| TransferError::protocol(format!("key chunk {} missing", idx)))?;
            pem.extend_from_slice(&chunk);
        }
        Ok(pem)
    }
}

/// Write one length-prefixed control frame.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf)?;
    writer.flush()
}

/// Read one length-prefixed control frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_CONTROL_FRAME {
        return Err(TransferError::protocol(format!("control frame of {} bytes", len)));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame)?;
    Ok(frame)
}
