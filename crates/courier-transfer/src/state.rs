/// Per-session datagram bookkeeping for the UDP channel.
///
/// [`TransferState`] is the receiver's view: ciphertext slices keyed by
/// sequence number. [`AckTracker`] is the sender's view: a compact bitfield of
/// acknowledged sequence numbers.

use std::collections::BTreeMap;

/// Result of recording an incoming datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// First copy of this sequence number.
    New,
    /// Same bytes seen before.
    Duplicate,
    /// Different bytes for a sequence number already held. The first copy is kept.
    Conflict,
    /// Sequence number beyond the expected count.
    OutOfRange,
}

/// Receiver-side datagram store. Owned by a single session.
pub struct TransferState {
    expected: u32,
    received: BTreeMap<u32, Vec<u8>>,
    bytes: u64,
}

impl TransferState {
    pub fn new(expected_packet_count: u32) -> Self {
        Self {
            expected: expected_packet_count,
            received: BTreeMap::new(),
            bytes: 0,
        }
    }

    pub fn insert(&mut self, seq: u32, chunk: &[u8]) -> Insert {
        if seq >= self.expected {
            return Insert::OutOfRange;
        }
        match self.received.get(&seq) {
            Some(existing) if existing.as_slice() == chunk => Insert::Duplicate,
            Some(_) => Insert::Conflict,
            None => {
                self.bytes += chunk.len() as u64;
                self.received.insert(seq, chunk.to_vec());
                Insert::New
            }
        }
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.received.len() as u64 >= self.expected as u64
    }

    #[inline]
    pub fn received(&self) -> u32 {
        self.received.len() as u32
    }

    #[inline]
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Ciphertext bytes held so far.
    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Up to `limit` missing sequence numbers, lowest first.
    pub fn missing(&self, limit: usize) -> Vec<u32> {
        (0..self.expected)
            .filter(|seq| !self.received.contains_key(seq))
            .take(limit)
            .collect()
    }

    /// Hand over the chunks in ascending sequence order, releasing each one as
    /// the caller moves past it.
    pub fn into_chunks(self) -> impl Iterator<Item = Vec<u8>> {
        self.received.into_values()
    }
}

/// Sender-side record of acknowledged sequence numbers.
#[derive(Clone)]
pub struct AckTracker {
    bits: Vec<u64>,
    total: u32,
    acked: u32,
}

impl AckTracker {
    pub fn new(total: u32) -> Self {
        Self {
            bits: vec![0u64; (total as usize).div_ceil(64)],
            total,
            acked: 0,
        }
    }

    /// Mark a sequence number as acknowledged. Returns true if it was new.
    #[inline]
    pub fn acknowledge(&mut self, seq: u32) -> bool {
        if seq >= self.total {
            return false;
        }
        let (word, mask) = Self::locate(seq);
        if self.bits[word] & mask != 0 {
            return false;
        }
        self.bits[word] |= mask;
        self.acked += 1;
        true
    }

    #[inline]
    pub fn is_acknowledged(&self, seq: u32) -> bool {
        if seq >= self.total {
            return false;
        }
        let (word, mask) = Self::locate(seq);
        self.bits[word] & mask != 0
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.acked >= self.total
    }

    #[inline]
    pub fn acknowledged(&self) -> u32 {
        self.acked
    }

    #[inline]
    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn unacknowledged(&self) -> Vec<u32> {
        (0..self.total).filter(|&seq| !self.is_acknowledged(seq)).collect()
    }

    #[inline]
    fn locate(seq: u32) -> (usize, u64) {
        let idx = seq as usize;
        (idx / 64, 1u64 << (idx % 64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_state_tracks_gaps() {
        let mut state = TransferState::new(10);
        for seq in [0, 2, 5, 9] {
            assert_eq!(state.insert(seq, &[seq as u8]), Insert::New);
        }
        assert_eq!(state.missing(100), vec![1, 3, 4, 6, 7, 8]);
        assert_eq!(state.missing(2), vec![1, 3]);
        assert_eq!(state.received(), 4);
        assert!(!state.is_complete());
    }

    #[test]
    fn duplicates_and_conflicts_keep_first_copy() {
        let mut state = TransferState::new(2);
        assert_eq!(state.insert(0, b"one"), Insert::New);
        assert_eq!(state.insert(0, b"one"), Insert::Duplicate);
        assert_eq!(state.insert(0, b"uno"), Insert::Conflict);
        assert_eq!(state.insert(2, b"out"), Insert::OutOfRange);
        assert_eq!(state.insert(1, b"two"), Insert::New);
        assert!(state.is_complete());
        assert_eq!(state.bytes(), 6);
        let chunks: Vec<Vec<u8>> = state.into_chunks().collect();
        assert_eq!(chunks, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn chunks_come_out_in_sequence_order() {
        let mut state = TransferState::new(4);
        for seq in [3u32, 1, 0, 2] {
            state.insert(seq, &[b'a' + seq as u8; 2]);
        }
        assert_eq!(state.expected(), 4);
        let joined: Vec<u8> = state.into_chunks().flatten().collect();
        assert_eq!(joined, b"aabbccdd");
    }

    #[test]
    fn ack_tracker_basics() {
        let mut acks = AckTracker::new(130);
        assert!(!acks.is_complete());
        assert!(acks.acknowledge(0));
        assert!(!acks.acknowledge(0));
        assert!(acks.acknowledge(129));
        assert!(!acks.acknowledge(130));
        assert!(acks.is_acknowledged(129));
        assert!(!acks.is_acknowledged(64));
        assert_eq!(acks.acknowledged(), 2);
        assert_eq!(acks.unacknowledged().len(), 128);

        for seq in 0..130 {
            acks.acknowledge(seq);
        }
        assert!(acks.is_complete());
        assert!(acks.unacknowledged().is_empty());
        assert_eq!(acks.total(), 130);
    }

    #[test]
    fn empty_tracker_is_complete() {
        assert!(AckTracker::new(0).is_complete());
        assert!(TransferState::new(0).is_complete());
    }
}
