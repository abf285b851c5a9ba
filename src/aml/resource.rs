// SPDX-License-Identifier: MIT

//! Binary resource descriptors embedded in AML resource-template buffers.
//!
//! Only the two descriptor shapes the ECAM patch pass rewrites are modeled.
//! Fields are decoded and re-encoded with explicit little-endian accessors so
//! a mutation can never write a wrong width.

use crate::{Error, Result};
use binread::{BinRead, BinReaderExt};
use serde::Serialize;
use std::io::Cursor;

pub const WORD_ADDRESS_SPACE_TAG: u8 = 0x88;
pub const WORD_ADDRESS_SPACE_LEN: usize = 16;
pub const FIXED_MEMORY32_TAG: u8 = 0x86;
pub const FIXED_MEMORY32_LEN: usize = 12;
pub const END_TAG: u8 = 0x79;

/// Word (16-bit) Address Space Descriptor. On these boards it describes the
/// PCI bus range produced by a root complex.
#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WordAddressSpace {
    #[br(assert(tag == WORD_ADDRESS_SPACE_TAG))]
    pub tag: u8,
    pub descriptor_length: u16,
    pub resource_type: u8,
    pub general_flags: u8,
    pub type_specific_flags: u8,
    pub granularity: u16,
    pub addr_range_min: u16,
    pub addr_range_max: u16,
    pub translation_offset: u16,
    pub addr_len: u16,
}

impl WordAddressSpace {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Cursor::new(bytes).read_le()?)
    }

    pub fn encode_into(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < WORD_ADDRESS_SPACE_LEN {
            return Err(Error::InvalidFormat(format!(
                "word address space descriptor needs {} bytes, buffer has {}",
                WORD_ADDRESS_SPACE_LEN,
                out.len()
            )));
        }
        out[0] = self.tag;
        out[1..3].copy_from_slice(&self.descriptor_length.to_le_bytes());
        out[3] = self.resource_type;
        out[4] = self.general_flags;
        out[5] = self.type_specific_flags;
        out[6..8].copy_from_slice(&self.granularity.to_le_bytes());
        out[8..10].copy_from_slice(&self.addr_range_min.to_le_bytes());
        out[10..12].copy_from_slice(&self.addr_range_max.to_le_bytes());
        out[12..14].copy_from_slice(&self.translation_offset.to_le_bytes());
        out[14..16].copy_from_slice(&self.addr_len.to_le_bytes());
        Ok(())
    }
}

/// 32-bit Fixed Memory Range Descriptor. On these boards it carries the
/// config-space window of a root complex.
#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FixedMemory32 {
    #[br(assert(tag == FIXED_MEMORY32_TAG))]
    pub tag: u8,
    pub descriptor_length: u16,
    pub information: u8,
    pub base_address: u32,
    pub range_length: u32,
}

impl FixedMemory32 {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Cursor::new(bytes).read_le()?)
    }

    pub fn encode_into(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < FIXED_MEMORY32_LEN {
            return Err(Error::InvalidFormat(format!(
                "fixed memory descriptor needs {} bytes, buffer has {}",
                FIXED_MEMORY32_LEN,
                out.len()
            )));
        }
        out[0] = self.tag;
        out[1..3].copy_from_slice(&self.descriptor_length.to_le_bytes());
        out[3] = self.information;
        out[4..8].copy_from_slice(&self.base_address.to_le_bytes());
        out[8..12].copy_from_slice(&self.range_length.to_le_bytes());
        Ok(())
    }
}

pub fn is_end_tag(bytes: &[u8]) -> bool {
    bytes.first().map_or(false, |tag| *tag == END_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_address_space_round_trip() {
        let bytes = [
            0x88, 0x0D, 0x00, // tag, length
            0x02, 0x0C, 0x00, // bus range, MinFixed | MaxFixed
            0x00, 0x00, // granularity
            0x05, 0x00, // min
            0x1F, 0x00, // max
            0x00, 0x00, // translation
            0x1B, 0x00, // length
        ];
        let mut word = WordAddressSpace::decode(&bytes).unwrap();
        assert_eq!(0x05, word.addr_range_min);
        assert_eq!(0x1F, word.addr_range_max);
        assert_eq!(0x1B, word.addr_len);

        word.addr_range_max = 0;
        word.addr_range_min = 0;
        word.addr_len = 1;
        let mut out = [0u8; WORD_ADDRESS_SPACE_LEN];
        word.encode_into(&mut out).unwrap();
        assert_eq!(bytes[0..8], out[0..8]);
        assert_eq!([0, 0, 0, 0, 1, 0], out[8..14]);
    }

    #[test]
    fn test_fixed_memory_round_trip() {
        let bytes = [0x86, 0x09, 0x00, 0x01, 0x00, 0x00, 0x00, 0xD0, 0x00, 0x80, 0x00, 0x00];
        let mut fixed = FixedMemory32::decode(&bytes).unwrap();
        assert_eq!(0xD000_0000, fixed.base_address);

        fixed.base_address += 0x8000;
        let mut out = [0u8; FIXED_MEMORY32_LEN];
        fixed.encode_into(&mut out).unwrap();
        assert_eq!(0xD000_8000, u32::from_le_bytes([out[4], out[5], out[6], out[7]]));
    }

    #[test]
    fn test_wrong_tag_rejected() {
        let bytes = [0x79u8, 0x00, 0x0D, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(WordAddressSpace::decode(&bytes).is_err());
        assert!(is_end_tag(&bytes));
    }
}
