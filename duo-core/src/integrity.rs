//! Integrity: payload checksum and recently-delivered identifier tracking.

use std::collections::VecDeque;

/// Seed used for every frame checksum.
pub const CHECKSUM_SEED: u16 = 0xFFFF;

/// Slots in the dedup ring.
pub const MAX_IDENTIFIER_MEMOS: usize = 16;

/// How long a delivered identifier suppresses re-delivery.
pub const MEMO_LIFETIME_MS: u64 = 30 * 1000;

/// Reflected CRC-16/CCITT (poly 0x8408) using the radio ROM convention:
/// the seed is inverted on entry and the result inverted on exit.
pub fn crc16_le(seed: u16, bytes: &[u8]) -> u16 {
    let mut crc = !seed;
    for &byte in bytes {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Checksum carried in the frame header. Covers payload bytes only.
pub fn checksum(payload: &[u8]) -> u16 {
    crc16_le(CHECKSUM_SEED, payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IdentifierMemo {
    identifier: u16,
    received_at_ms: u64,
}

/// Fixed-capacity ring of recently delivered packet identifiers.
/// Eviction is by arrival order, not by age: the 17th record overwrites the oldest
/// even if that one is still inside its window.
#[derive(Debug, Default)]
pub struct IdentifierMemos {
    memos: VecDeque<IdentifierMemo>,
}

impl IdentifierMemos {
    pub fn new() -> Self {
        Self {
            memos: VecDeque::with_capacity(MAX_IDENTIFIER_MEMOS),
        }
    }

    /// Was this identifier delivered within the last [`MEMO_LIFETIME_MS`]?
    pub fn is_recognized(&self, identifier: u16, now_ms: u64) -> bool {
        self.memos.iter().any(|m| {
            m.identifier == identifier
                && now_ms.saturating_sub(m.received_at_ms) < MEMO_LIFETIME_MS
        })
    }

    pub fn record(&mut self, identifier: u16, now_ms: u64) {
        if self.memos.len() == MAX_IDENTIFIER_MEMOS {
            self.memos.pop_front();
        }
        self.memos.push_back(IdentifierMemo {
            identifier,
            received_at_ms: now_ms,
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.memos.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_known_vector() {
        // CRC-16/KERMIT of "123456789" is 0x2189; the ROM convention inverts it.
        assert_eq!(checksum(b"123456789"), !0x2189);
        assert_eq!(checksum(b""), 0xFFFF);
    }

    #[test]
    fn checksum_detects_tampering() {
        let crc = checksum(b"hello there");
        assert_eq!(checksum(b"hello there"), crc);
        assert_ne!(checksum(b"hello thera"), crc);
    }

    #[test]
    fn memo_recognized_within_window() {
        let mut memos = IdentifierMemos::new();
        memos.record(1234, 1_000);
        assert!(memos.is_recognized(1234, 1_000));
        assert!(memos.is_recognized(1234, 1_000 + MEMO_LIFETIME_MS - 1));
        assert!(!memos.is_recognized(1234, 1_000 + MEMO_LIFETIME_MS));
        assert!(!memos.is_recognized(1235, 1_000));
    }

    #[test]
    fn memo_ring_evicts_oldest_first() {
        let mut memos = IdentifierMemos::new();
        for id in 0..MAX_IDENTIFIER_MEMOS as u16 {
            memos.record(100 + id, 0);
        }
        assert_eq!(memos.len(), MAX_IDENTIFIER_MEMOS);
        assert!(memos.is_recognized(100, 10));

        memos.record(500, 10);
        assert_eq!(memos.len(), MAX_IDENTIFIER_MEMOS);
        assert!(!memos.is_recognized(100, 10));
        assert!(memos.is_recognized(101, 10));
        assert!(memos.is_recognized(500, 10));
    }
}
