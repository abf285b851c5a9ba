// SPDX-License-Identifier: MIT

//! Host-side tooling for Marvell Armada firmware ACPI images: locates the
//! MCFG and FADT tables in a firmware memory image, patches the MCFG entries
//! and the DSDT resource descriptors for each PCIe controller according to
//! the persisted ECAM preference, and re-serializes everything with valid
//! checksums. Also carries the ONIE EEPROM transfer engine used by the I2C
//! EEPROM driver on the same platforms.

pub mod acpi;
pub mod aml;
pub mod ecam;
pub mod eeprom;
pub mod memory;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO Error: `{0}`")]
    IOError(#[from] std::io::Error),
    #[error("Firmware image has invalid format: `{0}`")]
    InvalidFormat(String),
    #[error("Binary format parsing Error: `{0}`")]
    BinReadError(#[from] binread::Error),
    #[error("Address {addr:#x}..+{len} is outside of the firmware image")]
    AddressOutOfRange { addr: u64, len: usize },
    #[error("ACPI table `{0}` not found")]
    TableNotFound(&'static str),
    #[error("AML node `{0}` not found")]
    NodeNotFound(String),
    #[error("Device is not supported: `{0}`")]
    Unsupported(String),
    #[error("Error: `{0}`")]
    ErrorMessage(String),
}
