//! Status bit-mask decoding
//!
//!  The status field is a hex string read from its end: byte 0 is the last
//!  two characters. Polarity is inverted, a `0` bit means the condition is
//!  active.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::DecodeError;

/// Decoded status bits, byte index then bit index (0 = least significant).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BitMaskTable {
    bytes: BTreeMap<usize, BTreeMap<usize, bool>>,
}

impl BitMaskTable {
    /// Flag at `byte`/`bit`, `None` if the status field was too short.
    pub fn bit(&self, byte: usize, bit: usize) -> Option<bool> {
        self.bytes.get(&byte).and_then(|bits| bits.get(&bit)).copied()
    }

    /// All decoded bits of one byte.
    pub fn byte(&self, byte: usize) -> Option<&BTreeMap<usize, bool>> {
        self.bytes.get(&byte)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Decode a hex status field into a [`BitMaskTable`].
///
/// A leading odd character is decoded on its own, giving a byte with only
/// four bits.
pub fn decode_bit_masks(hex: &str) -> Result<BitMaskTable, DecodeError> {
    let hex = hex.trim();
    let mut bytes: BTreeMap<usize, BTreeMap<usize, bool>> = BTreeMap::new();

    for (index, chunk) in hex.as_bytes().rchunks(2).enumerate() {
        let mut value: u8 = 0;
        for &c in chunk {
            let nibble =
                hex_digit_val(c).ok_or_else(|| DecodeError::InvalidHex(hex.to_string()))?;
            value = (value << 4) | nibble;
        }

        let width = chunk.len() * 4;
        let bits: BTreeMap<usize, bool> = (0..width)
            .map(|bit| (bit, value & (1 << bit) == 0))
            .collect();
        bytes.insert(index, bits);
    }

    Ok(BitMaskTable { bytes })
}

fn hex_digit_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_nibble_all_set() {
        let table = decode_bit_masks("F").unwrap();
        assert_eq!(table.len(), 1);
        let byte = table.byte(0).unwrap();
        assert_eq!(byte.len(), 4);
        assert!(byte.values().all(|&active| !active));
    }

    #[test]
    fn test_zero_byte_all_active() {
        let table = decode_bit_masks("00").unwrap();
        let byte = table.byte(0).unwrap();
        assert_eq!(byte.len(), 8);
        assert!(byte.values().all(|&active| active));
    }

    #[test]
    fn test_byte_order_from_end() {
        // byte 0 = 0xFF, byte 1 = 0xFB, byte 2 = 0xFF, byte 3 = 0xBF
        let table = decode_bit_masks("BFFFFBFF").unwrap();
        assert_eq!(table.len(), 4);
        assert!(table.byte(0).unwrap().values().all(|&active| !active));
        assert_eq!(table.bit(1, 2), Some(true));
        assert_eq!(table.bit(1, 7), Some(false));
        assert_eq!(table.bit(3, 6), Some(true));
        assert_eq!(table.bit(3, 1), Some(false));
        assert_eq!(table.bit(4, 0), None);
    }

    #[test]
    fn test_odd_length_reads_what_is_left() {
        let table = decode_bit_masks("7FF").unwrap();
        assert_eq!(table.byte(0).unwrap().len(), 8);
        let leading = table.byte(1).unwrap();
        assert_eq!(leading.len(), 4);
        // 0x7 = 0111, only bit 3 is clear
        assert_eq!(leading.get(&3), Some(&true));
        assert_eq!(leading.get(&0), Some(&false));
    }

    #[test]
    fn test_invalid_and_empty() {
        assert!(matches!(
            decode_bit_masks("ZZ"),
            Err(DecodeError::InvalidHex(_))
        ));
        assert!(decode_bit_masks("").unwrap().is_empty());
    }
}
