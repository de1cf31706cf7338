/*!
PLC word bit manipulation and edge detection.

All inspection signalling is encoded as named bits inside a handful of 16-bit
data words. This module provides the bit position type, helpers to read and
modify single bits, and the [`EdgeDetector`] used by the monitoring loop.
*/

use crate::error::SharedError;
use crate::protocol::PLC_WORD_BITS;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a bit inside a 16-bit PLC word (0-15)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct BitIndex(u8);

impl BitIndex {
    /// Create a bit index, rejecting positions outside the word
    pub fn new(bit: u8) -> Option<Self> {
        (bit < PLC_WORD_BITS).then_some(Self(bit))
    }

    /// Bit index from the low four bits of `bit`
    pub const fn masked(bit: u8) -> Self {
        Self(bit & 0x0F)
    }

    /// Raw bit position
    pub fn get(self) -> u8 {
        self.0
    }

    /// Single-bit mask for this position
    pub fn mask(self) -> u16 {
        1u16 << self.0
    }

    /// All 16 positions in ascending order
    pub fn all() -> impl Iterator<Item = BitIndex> {
        (0..PLC_WORD_BITS).map(BitIndex)
    }
}

impl TryFrom<u8> for BitIndex {
    type Error = SharedError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(SharedError::InvalidBit(value))
    }
}

impl From<BitIndex> for u8 {
    fn from(bit: BitIndex) -> u8 {
        bit.0
    }
}

impl fmt::Display for BitIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Check whether `bit` is set in `word`
pub fn is_bit_on(word: u16, bit: BitIndex) -> bool {
    word & bit.mask() != 0
}

/// Return `word` with `bit` set or cleared
pub fn set_bit(word: u16, bit: BitIndex, on: bool) -> u16 {
    if on {
        word | bit.mask()
    } else {
        word & !bit.mask()
    }
}

/// Combined mask of several bit positions
pub fn bit_mask(bits: &[BitIndex]) -> u16 {
    bits.iter().fold(0u16, |acc, bit| acc | bit.mask())
}

/// Check that every bit in `mask` is on (`expect_all_on`) or every bit is off
pub fn bits_match(word: u16, mask: u16, expect_all_on: bool) -> bool {
    if expect_all_on {
        word & mask == mask
    } else {
        word & mask == 0
    }
}

/// Tracks bit transitions of one monitored word between consecutive samples.
///
/// Exactly one [`EdgeDetector::update`] must happen per monitoring cycle; edge
/// queries describe the transition between the last two updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeDetector {
    previous: u16,
    current: u16,
}

impl EdgeDetector {
    /// Create a detector with both snapshots cleared
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift the current snapshot to previous and take a new sample
    pub fn update(&mut self, word: u16) {
        self.previous = self.current;
        self.current = word;
    }

    /// `0 -> 1` on `bit` between the last two updates
    pub fn is_rising_edge(&self, bit: BitIndex) -> bool {
        !is_bit_on(self.previous, bit) && is_bit_on(self.current, bit)
    }

    /// `1 -> 0` on `bit` between the last two updates
    pub fn is_falling_edge(&self, bit: BitIndex) -> bool {
        is_bit_on(self.previous, bit) && !is_bit_on(self.current, bit)
    }

    /// Most recent sample
    pub fn current(&self) -> u16 {
        self.current
    }

    /// Sample before the most recent one
    pub fn previous(&self) -> u16 {
        self.previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bit(n: u8) -> BitIndex {
        BitIndex::new(n).unwrap()
    }

    #[test]
    fn test_bit_index_bounds() {
        assert!(BitIndex::new(0).is_some());
        assert!(BitIndex::new(15).is_some());
        assert!(BitIndex::new(16).is_none());
        assert_eq!(BitIndex::try_from(20u8), Err(SharedError::InvalidBit(20)));
        assert_eq!(BitIndex::all().count(), 16);
        assert_eq!(BitIndex::masked(17).get(), 1);
    }

    #[test]
    fn test_set_and_read_bits() {
        let word = set_bit(0, bit(3), true);
        assert_eq!(word, 0b1000);
        assert!(is_bit_on(word, bit(3)));
        assert!(!is_bit_on(word, bit(2)));

        let word = set_bit(set_bit(word, bit(7), true), bit(3), false);
        assert_eq!(word, 0b1000_0000);
    }

    #[test]
    fn test_bits_match_all_on_and_all_off() {
        let mask = bit_mask(&[bit(0), bit(1)]);
        assert_eq!(mask, 0b11);
        assert!(bits_match(0b111, mask, true));
        assert!(!bits_match(0b101, mask, true));
        assert!(bits_match(0b100, mask, false));
        assert!(!bits_match(0b110, mask, false));
    }

    #[test]
    fn test_edges_follow_consecutive_updates() {
        let sequence: [u16; 6] = [0x0000, 0x0001, 0x0001, 0x8000, 0x8001, 0x0000];
        let mut detector = EdgeDetector::new();
        let mut last = 0u16;

        for &word in &sequence {
            detector.update(word);
            for b in BitIndex::all() {
                let was = is_bit_on(last, b);
                let now = is_bit_on(word, b);
                assert_eq!(detector.is_rising_edge(b), !was && now, "rising bit {} word {:#06x}", b, word);
                assert_eq!(detector.is_falling_edge(b), was && !now, "falling bit {} word {:#06x}", b, word);
            }
            last = word;
        }
    }

    #[test]
    fn test_steady_high_is_not_an_edge() {
        let mut detector = EdgeDetector::new();
        detector.update(0b10);
        assert!(detector.is_rising_edge(bit(1)));
        detector.update(0b10);
        assert!(!detector.is_rising_edge(bit(1)));
        assert!(!detector.is_falling_edge(bit(1)));
        assert_eq!(detector.previous(), 0b10);
        assert_eq!(detector.current(), 0b10);
    }
}
