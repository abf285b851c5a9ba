// SPDX-License-Identifier: MIT

use crate::{Error, Result};
use binread::{BinRead, BinReaderExt};
use derivative::Derivative;
use log::trace;
use std::any::type_name;
use std::io::Cursor;

/// A firmware memory image: a contiguous run of physical memory captured at
/// some base address. Every ACPI "pointer" in this crate is a physical
/// address resolved through one of these, with explicit bounds checks instead
/// of raw pointer arithmetic.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct MemoryImage {
    base: u64,
    #[derivative(Debug = "ignore")]
    data: Vec<u8>,
}

impl MemoryImage {
    pub fn new(base: u64, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    fn offset_of(&self, addr: u64, len: usize) -> Result<usize> {
        let offset = addr
            .checked_sub(self.base)
            .ok_or(Error::AddressOutOfRange { addr, len })? as usize;
        if offset.checked_add(len).map_or(true, |end| end > self.data.len()) {
            return Err(Error::AddressOutOfRange { addr, len });
        }
        Ok(offset)
    }

    pub fn contains(&self, addr: u64, len: usize) -> bool {
        self.offset_of(addr, len).is_ok()
    }

    pub fn slice(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let offset = self.offset_of(addr, len)?;
        Ok(&self.data[offset..offset + len])
    }

    pub fn slice_mut(&mut self, addr: u64, len: usize) -> Result<&mut [u8]> {
        let offset = self.offset_of(addr, len)?;
        Ok(&mut self.data[offset..offset + len])
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.slice_mut(addr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        Ok(self.slice(addr, 1)?[0])
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) -> Result<()> {
        self.slice_mut(addr, 1)?[0] = value;
        Ok(())
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        let bytes = self.slice(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.slice(addr, 8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Parse a little-endian binary structure at a physical address.
    pub fn read_struct<B: BinRead>(&self, addr: u64) -> Result<B>
    where
        B::Args: Default,
    {
        let offset = self.offset_of(addr, 0)?;
        trace!("Trying to parse {} at {:#x}", type_name::<B>(), addr);
        let mut cursor = Cursor::new(&self.data[offset..]);
        Ok(cursor.read_le::<B>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryImage;

    #[test]
    fn test_bounds() {
        let mut image = MemoryImage::new(0x1000, vec![0u8; 16]);

        assert!(image.slice(0x1000, 16).is_ok());
        assert!(image.slice(0x1008, 8).is_ok());
        assert!(image.slice(0x0FFF, 1).is_err());
        assert!(image.slice(0x1010, 1).is_err());
        assert!(image.slice(0x1008, 9).is_err());
        assert!(image.slice_mut(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_little_endian_accessors() {
        let mut image = MemoryImage::new(0, vec![0u8; 12]);
        image.write_bytes(4, &0x1122_3344u32.to_le_bytes()).unwrap();

        assert_eq!(0x1122_3344, image.read_u32(4).unwrap());
        assert_eq!(0x44, image.read_u8(4).unwrap());

        image.write_u8(7, 0xAB).unwrap();
        assert_eq!(0xAB22_3344, image.read_u32(4).unwrap());
    }
}
