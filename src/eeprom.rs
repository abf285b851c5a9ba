// SPDX-License-Identifier: MIT

//! ONIE EEPROM access over an I2C bus controller.
//!
//! The platform driver binding (device matching against the board's known
//! EEPROM addresses, context creation on bind, explicit teardown on unbind)
//! and the chunked transfer engine live here; the bus controller itself is a
//! collaborator behind [`I2cMaster`].

use crate::{Error, Result};
use log::debug;
use modular_bitfield::prelude::*;
use serde::Serialize;

/// Largest chunk moved by a single I2C request.
pub const MAX_BUFFER_LENGTH: usize = 64;

/// Packed (bus, address) identity of an I2C device, as the bus controller
/// reports it.
#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceIndex {
    pub address: B7,
    pub bus: B9,
}

impl DeviceIndex {
    pub fn of(bus: u16, address: u8) -> Self {
        Self::new().with_address(address & 0x7F).with_bus(bus)
    }
}

/// One element of an I2C request queue.
pub enum I2cOperation<'a> {
    Write(&'a [u8]),
    Read(&'a mut [u8]),
}

/// The consumed bus-controller protocol: executes a request queue against
/// the device at `address` as a single transaction.
pub trait I2cMaster {
    fn transfer(&mut self, address: u8, operations: &mut [I2cOperation<'_>]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EepromOperation {
    Read,
    Write,
}

/// The board's known EEPROM population, from the platform bus/address lists.
#[derive(Debug, Clone, Default)]
pub struct EepromBus {
    known: Vec<DeviceIndex>,
}

impl EepromBus {
    pub fn from_platform_lists(buses: &[u16], addresses: &[u8]) -> Self {
        Self {
            known: buses
                .iter()
                .zip(addresses.iter())
                .map(|(bus, address)| DeviceIndex::of(*bus, *address))
                .collect(),
        }
    }

    /// The Supported() decision: is this I2C device one of the board's
    /// EEPROMs?
    pub fn matches(&self, index: DeviceIndex) -> bool {
        self.known.contains(&index)
    }

    /// Create the per-device context. Paired with
    /// [`EepromDevice::unbind`]; every failure path before the context
    /// exists leaves nothing to tear down.
    pub fn bind(
        &self,
        index: DeviceIndex,
        master: Box<dyn I2cMaster>,
    ) -> Result<EepromDevice> {
        if !self.matches(index) {
            return Err(Error::Unsupported(format!(
                "I2C device found at bus {} address {:#x}, but it's not an EEPROM",
                index.bus(),
                index.address()
            )));
        }
        debug!(
            "Attached to EEPROM device at bus {} address {:#x}",
            index.bus(),
            index.address()
        );
        Ok(EepromDevice { index, master })
    }
}

/// Bound EEPROM device context.
pub struct EepromDevice {
    index: DeviceIndex,
    master: Box<dyn I2cMaster>,
}

impl EepromDevice {
    pub fn index(&self) -> DeviceIndex {
        self.index
    }

    /// Move `buffer` to or from the EEPROM starting at `offset`, split into
    /// [`MAX_BUFFER_LENGTH`] chunks. Each chunk is addressed by a 2-byte
    /// big-endian offset write; a failed chunk aborts the transfer.
    pub fn transfer(
        &mut self,
        offset: u16,
        buffer: &mut [u8],
        operation: EepromOperation,
    ) -> Result<()> {
        if (offset as usize) + buffer.len() > u16::MAX as usize + 1 {
            return Err(Error::ErrorMessage(format!(
                "EEPROM transfer of {} bytes at {:#x} passes the end of the address space",
                buffer.len(),
                offset
            )));
        }
        let address = self.index.address();
        let mut chunk_offset = offset;
        for chunk in buffer.chunks_mut(MAX_BUFFER_LENGTH) {
            let offset_bytes = chunk_offset.to_be_bytes();
            match operation {
                EepromOperation::Read => {
                    let mut operations =
                        [I2cOperation::Write(&offset_bytes), I2cOperation::Read(chunk)];
                    self.master.transfer(address, &mut operations)?;
                }
                EepromOperation::Write => {
                    let mut request = Vec::with_capacity(2 + chunk.len());
                    request.extend_from_slice(&offset_bytes);
                    request.extend_from_slice(chunk);
                    let mut operations = [I2cOperation::Write(&request)];
                    self.master.transfer(address, &mut operations)?;
                }
            }
            chunk_offset = chunk_offset.wrapping_add(chunk.len() as u16);
        }
        Ok(())
    }

    pub fn read(&mut self, offset: u16, buffer: &mut [u8]) -> Result<()> {
        self.transfer(offset, buffer, EepromOperation::Read)
    }

    pub fn write(&mut self, offset: u16, data: &[u8]) -> Result<()> {
        let mut buffer = data.to_vec();
        self.transfer(offset, &mut buffer, EepromOperation::Write)
    }

    /// Tear the context down, releasing the bus protocol.
    pub fn unbind(self) -> DeviceIndex {
        debug!(
            "Detached from EEPROM device at bus {} address {:#x}",
            self.index.bus(),
            self.index.address()
        );
        self.index
    }
}
