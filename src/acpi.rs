// SPDX-License-Identifier: MIT

use crate::memory::MemoryImage;
use crate::{Error, Result};
use binread::BinRead;
use log::{debug, error, trace, warn};
use serde::Serialize;

pub const RSDP_SIGNATURE: &[u8] = b"RSD PTR ";
pub const RSDT_SIGNATURE: &[u8] = b"RSDT";
pub const XSDT_SIGNATURE: &[u8] = b"XSDT";
pub const MCFG_SIGNATURE: &[u8] = b"MCFG";
pub const FADT_SIGNATURE: &[u8] = b"FACP";
pub const DSDT_SIGNATURE: &[u8] = b"DSDT";

pub const SDT_HEADER_LEN: usize = 36;
/// Offset of the checksum byte inside a system description table header.
pub const SDT_CHECKSUM_OFFSET: u64 = 9;
/// Reserved bytes between the MCFG header and its first configuration entry.
pub const MCFG_RESERVED_LEN: usize = 8;

/// Root System Description Pointer, ACPI 2.0+ layout.
#[derive(BinRead, Debug, Clone, Serialize)]
pub struct Rsdp {
    #[br(assert(signature == RSDP_SIGNATURE))]
    pub signature: [u8; 8],
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub revision: u8,
    pub rsdt_address: u32,
    pub length: u32,
    pub xsdt_address: u64,
    pub extended_checksum: u8,
    pub reserved: [u8; 3],
}

/// Common 36-byte system description table header.
#[derive(BinRead, Debug, Clone, Serialize)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: [u8; 4],
    pub creator_revision: u32,
}

/// Checksum value that makes `bytes` plus the returned byte sum to zero
/// modulo 256. The checksum field itself must be zeroed before summing.
pub fn table_checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

/// Recompute the header checksum of the table at `addr` over its full
/// declared length.
pub fn update_checksum(mem: &mut MemoryImage, addr: u64) -> Result<()> {
    let header: SdtHeader = mem.read_struct(addr)?;
    mem.write_u8(addr + SDT_CHECKSUM_OFFSET, 0)?;
    let checksum = table_checksum(mem.slice(addr, header.length as usize)?);
    mem.write_u8(addr + SDT_CHECKSUM_OFFSET, checksum)
}

/// Physical addresses of the tables the ECAM patch pass needs. A `None`
/// entry after `locate_tables` is a terminal condition for the caller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableSet {
    pub mcfg: Option<u64>,
    pub fadt: Option<u64>,
}

/// Walk the root system description table to find the MCFG and FADT tables.
///
/// Prefers the XSDT (8-byte entries) when present and correctly signed,
/// falling back to the RSDT (4-byte entries). The first conforming match per
/// signature is canonical; the walk stops early once both tables are found.
pub fn locate_tables(mem: &MemoryImage, rsdp_addr: u64) -> Result<TableSet> {
    let mut tables = TableSet::default();

    let rsdp: Rsdp = match mem.read_struct(rsdp_addr) {
        Ok(rsdp) => rsdp,
        Err(err) => {
            error!("No valid RSDP at {:#x}: {}", rsdp_addr, err);
            return Ok(tables);
        }
    };

    let (root_addr, entry_width) = match select_root_table(mem, &rsdp) {
        Some(selected) => selected,
        None => {
            error!("XSDT/RSDT missing or wrong signature");
            return Ok(tables);
        }
    };

    let root: SdtHeader = mem.read_struct(root_addr)?;
    let mut offset = SDT_HEADER_LEN as u64;
    while offset + entry_width as u64 <= root.length as u64 {
        let entry_addr = root_addr + offset;
        offset += entry_width as u64;
        let table_addr = match entry_width {
            8 => mem.read_u64(entry_addr)?,
            _ => mem.read_u32(entry_addr)? as u64,
        };

        let signature = match mem.slice(table_addr, 4) {
            Ok(signature) => signature,
            Err(_) => {
                warn!("Root table entry {:#x} points outside the image", table_addr);
                continue;
            }
        };
        trace!("Root table entry {:#x} signature {:02X?}", table_addr, signature);

        if signature == MCFG_SIGNATURE && tables.mcfg.is_none() {
            tables.mcfg = Some(table_addr);
        } else if signature == FADT_SIGNATURE && tables.fadt.is_none() {
            tables.fadt = Some(table_addr);
        }

        if tables.mcfg.is_some() && tables.fadt.is_some() {
            return Ok(tables);
        }
    }

    Ok(tables)
}

fn select_root_table(mem: &MemoryImage, rsdp: &Rsdp) -> Option<(u64, usize)> {
    if rsdp.xsdt_address != 0 {
        if let Ok(signature) = mem.slice(rsdp.xsdt_address, 4) {
            if signature == XSDT_SIGNATURE {
                return Some((rsdp.xsdt_address, 8));
            }
        }
    }
    let rsdt_address = rsdp.rsdt_address as u64;
    if rsdt_address != 0 {
        if let Ok(signature) = mem.slice(rsdt_address, 4) {
            if signature == RSDT_SIGNATURE {
                debug!("XSDT unavailable, walking RSDT at {:#x}", rsdt_address);
                return Some((rsdt_address, 4));
            }
        }
    }
    None
}

/// One MCFG configuration-space allocation. Entry order matches the board's
/// controller enumeration order.
#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PciConfigEntry {
    pub base_address: u64,
    pub segment: u16,
    pub start_bus: u8,
    pub end_bus: u8,
    pub reserved: u32,
}

pub const PCI_CONFIG_ENTRY_LEN: usize = 16;

impl PciConfigEntry {
    pub fn encode(&self) -> [u8; PCI_CONFIG_ENTRY_LEN] {
        let mut out = [0u8; PCI_CONFIG_ENTRY_LEN];
        out[0..8].copy_from_slice(&self.base_address.to_le_bytes());
        out[8..10].copy_from_slice(&self.segment.to_le_bytes());
        out[10] = self.start_bus;
        out[11] = self.end_bus;
        out[12..16].copy_from_slice(&self.reserved.to_le_bytes());
        out
    }
}

/// View of a live MCFG table inside a firmware image.
#[derive(Debug, Clone)]
pub struct Mcfg {
    pub addr: u64,
    pub header: SdtHeader,
}

impl Mcfg {
    pub fn read(mem: &MemoryImage, addr: u64) -> Result<Self> {
        let header: SdtHeader = mem.read_struct(addr)?;
        if header.signature != MCFG_SIGNATURE {
            return Err(Error::InvalidFormat(format!(
                "expected MCFG signature, found {:02X?}",
                header.signature
            )));
        }
        Ok(Self { addr, header })
    }

    pub fn entry_count(&self) -> usize {
        (self.header.length as usize)
            .saturating_sub(SDT_HEADER_LEN + MCFG_RESERVED_LEN)
            / PCI_CONFIG_ENTRY_LEN
    }

    fn entry_addr(&self, index: usize) -> Result<u64> {
        if index >= self.entry_count() {
            return Err(Error::InvalidFormat(format!(
                "MCFG has {} entries, index {} out of range",
                self.entry_count(),
                index
            )));
        }
        Ok(self.addr
            + (SDT_HEADER_LEN + MCFG_RESERVED_LEN + index * PCI_CONFIG_ENTRY_LEN) as u64)
    }

    pub fn read_entry(&self, mem: &MemoryImage, index: usize) -> Result<PciConfigEntry> {
        mem.read_struct(self.entry_addr(index)?)
    }

    pub fn write_entry(
        &self,
        mem: &mut MemoryImage,
        index: usize,
        entry: &PciConfigEntry,
    ) -> Result<()> {
        mem.write_bytes(self.entry_addr(index)?, &entry.encode())
    }

    pub fn update_checksum(&self, mem: &mut MemoryImage) -> Result<()> {
        update_checksum(mem, self.addr)
    }
}

#[derive(BinRead, Debug, Clone)]
struct FadtPrefix {
    header: SdtHeader,
    firmware_ctrl: u32,
    dsdt: u32,
}

/// View of the FADT prefix this driver cares about: the header and the
/// 32-bit DSDT pointer, which is the sole link to the AML tree.
#[derive(Debug, Clone)]
pub struct Fadt {
    pub addr: u64,
    pub header: SdtHeader,
    pub firmware_ctrl: u32,
    pub dsdt: u32,
}

impl Fadt {
    pub fn read(mem: &MemoryImage, addr: u64) -> Result<Self> {
        let prefix: FadtPrefix = mem.read_struct(addr)?;
        if prefix.header.signature != FADT_SIGNATURE {
            return Err(Error::InvalidFormat(format!(
                "expected FACP signature, found {:02X?}",
                prefix.header.signature
            )));
        }
        Ok(Self {
            addr,
            header: prefix.header,
            firmware_ctrl: prefix.firmware_ctrl,
            dsdt: prefix.dsdt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_sums_to_zero() {
        let mut table = vec![0x12u8, 0x34, 0x56, 0x78, 0x9A];
        table.push(table_checksum(&table));
        let sum = table.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
        assert_eq!(0, sum);
    }

    #[test]
    fn test_pci_config_entry_encode() {
        let entry = PciConfigEntry {
            base_address: 0x0000_0001_0000_0000,
            segment: 0x0201,
            start_bus: 3,
            end_bus: 0x1F,
            reserved: 0,
        };
        let bytes = entry.encode();
        assert_eq!([0, 0, 0, 0, 1, 0, 0, 0], bytes[0..8]);
        assert_eq!([0x01, 0x02, 3, 0x1F], bytes[8..12]);

        let decoded: PciConfigEntry = MemoryImage::new(0, bytes.to_vec())
            .read_struct(0)
            .unwrap();
        assert_eq!(entry, decoded);
    }

    fn empty_sdt(signature: &[u8], length: u32) -> Vec<u8> {
        let mut table = vec![0u8; length as usize];
        table[0..4].copy_from_slice(signature);
        table[4..8].copy_from_slice(&length.to_le_bytes());
        table
    }

    #[test]
    fn test_locate_tables_prefers_xsdt() {
        // Layout: RSDP @0x00, RSDT @0x40 (points nowhere useful),
        // XSDT @0x80, FADT @0x100, MCFG @0x140.
        let base = 0x8000_0000u64;
        let mut data = vec![0u8; 0x200];

        data[0x00..0x08].copy_from_slice(RSDP_SIGNATURE);
        data[0x10..0x14].copy_from_slice(&(base as u32 + 0x40).to_le_bytes());
        data[0x18..0x20].copy_from_slice(&(base + 0x80).to_le_bytes());

        data[0x40..0x64].copy_from_slice(&empty_sdt(RSDT_SIGNATURE, 36));

        let mut xsdt = empty_sdt(XSDT_SIGNATURE, 36 + 16);
        xsdt[36..44].copy_from_slice(&(base + 0x100).to_le_bytes());
        xsdt[44..52].copy_from_slice(&(base + 0x140).to_le_bytes());
        data[0x80..0x80 + xsdt.len()].copy_from_slice(&xsdt);

        data[0x100..0x124].copy_from_slice(&empty_sdt(FADT_SIGNATURE, 36));
        data[0x140..0x164].copy_from_slice(&empty_sdt(MCFG_SIGNATURE, 36));

        let mem = MemoryImage::new(base, data);
        let tables = locate_tables(&mem, base).unwrap();
        assert_eq!(Some(base + 0x140), tables.mcfg);
        assert_eq!(Some(base + 0x100), tables.fadt);
    }

    #[test]
    fn test_locate_tables_rsdt_fallback_uses_4_byte_entries() {
        let base = 0x4000_0000u64;
        let mut data = vec![0u8; 0x200];

        data[0x00..0x08].copy_from_slice(RSDP_SIGNATURE);
        data[0x10..0x14].copy_from_slice(&(base as u32 + 0x40).to_le_bytes());
        // No XSDT.

        let mut rsdt = empty_sdt(RSDT_SIGNATURE, 36 + 8);
        rsdt[36..40].copy_from_slice(&(base as u32 + 0x100).to_le_bytes());
        rsdt[40..44].copy_from_slice(&(base as u32 + 0x140).to_le_bytes());
        data[0x40..0x40 + rsdt.len()].copy_from_slice(&rsdt);

        data[0x100..0x124].copy_from_slice(&empty_sdt(MCFG_SIGNATURE, 36));
        data[0x140..0x164].copy_from_slice(&empty_sdt(FADT_SIGNATURE, 36));

        let mem = MemoryImage::new(base, data);
        let tables = locate_tables(&mem, base).unwrap();
        assert_eq!(Some(base + 0x100), tables.mcfg);
        assert_eq!(Some(base + 0x140), tables.fadt);
    }

    #[test]
    fn test_locate_tables_missing_fadt() {
        let base = 0x4000_0000u64;
        let mut data = vec![0u8; 0x200];

        data[0x00..0x08].copy_from_slice(RSDP_SIGNATURE);
        data[0x18..0x20].copy_from_slice(&(base + 0x40).to_le_bytes());

        let mut xsdt = empty_sdt(XSDT_SIGNATURE, 36 + 8);
        xsdt[36..44].copy_from_slice(&(base + 0x100).to_le_bytes());
        data[0x40..0x40 + xsdt.len()].copy_from_slice(&xsdt);

        data[0x100..0x124].copy_from_slice(&empty_sdt(MCFG_SIGNATURE, 36));

        let mem = MemoryImage::new(base, data);
        let tables = locate_tables(&mem, base).unwrap();
        assert_eq!(Some(base + 0x100), tables.mcfg);
        assert_eq!(None, tables.fadt);
    }
}
