use std::net::{SocketAddr, UdpSocket};

use tracing::debug;

use crate::error::{Result, TransferError};
use crate::handshake::ControlChannel;
use crate::protocol::{split_public_key, KeyAssembler, MAX_DATAGRAM, MAX_KEY_CHUNKS, SEQ_HEADER};

/// Handshake messages over UDP: one datagram per message, exchanged with a
/// single peer. Datagrams from anyone else are dropped.
pub(crate) struct UdpControl<'a> {
    socket: &'a UdpSocket,
    peer: SocketAddr,
    buf: Vec<u8>,
}

impl<'a> UdpControl<'a> {
    pub(crate) fn new(socket: &'a UdpSocket, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            buf: vec![0u8; MAX_DATAGRAM + 1],
        }
    }
}

impl ControlChannel for UdpControl<'_> {
    fn send_message(&mut self, message: &[u8]) -> Result<()> {
        self.socket.send_to(message, self.peer)?;
        Ok(())
    }

    fn recv_message(&mut self) -> Result<Vec<u8>> {
        loop {
            let (n, from) = self.socket.recv_from(&mut self.buf)?;
            if from == self.peer {
                return Ok(self.buf[..n].to_vec());
            }
            debug!("Ignoring {} byte datagram from {} (peer is {})", n, from, self.peer);
        }
    }

    /// Chunk count first, then `[index][PEM slice]` datagrams.
    fn send_public_key(&mut self, pem: &[u8]) -> Result<()> {
        let chunks = split_public_key(pem);
        self.send_message(&(chunks.len() as u32).to_be_bytes())?;
        for chunk in &chunks {
            self.send_message(chunk)?;
        }
        Ok(())
    }

    /// Chunks that overtake the count datagram are held until it arrives.
    fn recv_public_key(&mut self) -> Result<Vec<u8>> {
        let mut early = Vec::new();
        let count = loop {
            let message = self.recv_message()?;
            if message.len() <= SEQ_HEADER {
                break message;
            }
            if early.len() >= MAX_KEY_CHUNKS as usize {
                return Err(TransferError::protocol("public key chunks arrived without a chunk count"));
            }
            early.push(message);
        };
        let mut assembler = KeyAssembler::from_count_datagram(&count)?;
        for chunk in &early {
            assembler.accept(chunk)?;
        }
        while !assembler.is_complete() {
            let chunk = self.recv_message()?;
            assembler.accept(&chunk)?;
        }
        debug!("Public key reassembled from {} chunks", assembler.expected());
        assembler.finish()
    }
}
