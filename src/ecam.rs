// SPDX-License-Identifier: MIT

//! ECAM configurator: applies the persisted ECAM preference to the live MCFG
//! table and the DSDT resource descriptors of every PCIe controller the board
//! reports, then fixes the table checksums back up.

use crate::acpi::{locate_tables, Fadt, Mcfg, SdtHeader};
use crate::aml::resource::{FixedMemory32, WordAddressSpace};
use crate::aml::AmlTree;
use crate::memory::MemoryImage;
use crate::{Error, Result};
use bitflags::bitflags;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::FromRepr;

pub const ECAM_VARIABLE_NAME: &str = "EcamPreference";

/// Formset GUID shared by the persisted variable and the setup UI package.
pub const ECAM_PLATFORM_FORMSET_GUID: Guid = Guid([
    0xE4, 0x8E, 0x2B, 0x92, 0x11, 0x63, 0x4A, 0x7D, 0x9C, 0xFB, 0x5E, 0x11, 0x08, 0x7A, 0xD7,
    0x61,
]);

/// Offset added to a controller's config-space base when the legacy access
/// window replaces standard ECAM.
pub const LEGACY_CONFIG_SPACE_OFFSET: u64 = 0x8000;

/// The shared MCFG window advertised while standard ECAM is suppressed:
/// byte 1 of the base address is forced to 0x80, every other byte is zero.
pub const SHARED_ECAM_WINDOW_BASE: u64 = 0x8000;

/// Persisted ECAM preference.
///
/// The labels are inherited from the platform firmware and are inverted
/// relative to what they suggest: `Disabled` programs standard
/// per-controller ECAM addressing, while `Enabled` collapses every
/// controller onto the shared legacy config window. The branch behavior is
/// load-bearing; the names are not.
#[derive(
    FromRepr, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum EcamPreference {
    Disabled = 0,
    Enabled = 1,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VariableAttributes: u32 {
        const NON_VOLATILE = 0x1;
        const BOOTSERVICE_ACCESS = 0x2;
        const RUNTIME_ACCESS = 0x4;
    }
}

/// Non-volatile variable storage, the persistence boundary of the pass.
pub trait VariableStore {
    fn get(&self, name: &str) -> Option<Vec<u8>>;
    fn set(&mut self, name: &str, attributes: VariableAttributes, data: &[u8]) -> Result<()>;
}

/// In-memory variable store for hosts and tests.
#[derive(Debug, Default, Clone)]
pub struct MemVariableStore {
    variables: HashMap<String, (VariableAttributes, Vec<u8>)>,
}

impl MemVariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attributes(&self, name: &str) -> Option<VariableAttributes> {
        self.variables.get(name).map(|(attributes, _)| *attributes)
    }
}

impl VariableStore for MemVariableStore {
    fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.variables.get(name).map(|(_, data)| data.clone())
    }

    fn set(&mut self, name: &str, attributes: VariableAttributes, data: &[u8]) -> Result<()> {
        self.variables
            .insert(name.to_string(), (attributes, data.to_vec()));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Guid(pub [u8; 16]);

/// One PCIe controller as reported by the board description, in enumeration
/// order. MCFG entry `i` belongs to controller `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcieController {
    pub config_space_address: u64,
    pub bus_min: u8,
    pub bus_max: u8,
}

/// Platform-compiled defaults, the PCD equivalents.
#[derive(Debug, Clone, Copy)]
pub struct EcamConfig {
    pub default_preference: EcamPreference,
}

impl Default for EcamConfig {
    fn default() -> Self {
        Self {
            default_preference: EcamPreference::Disabled,
        }
    }
}

/// Setup UI form package produced at the end of the pass so an operator can
/// toggle the preference before the next boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiPackage {
    pub formset_guid: Guid,
    pub device_path: Vec<u8>,
}

impl UiPackage {
    pub fn ecam_platform() -> Self {
        Self {
            formset_guid: ECAM_PLATFORM_FORMSET_GUID,
            device_path: vendor_device_path(&ECAM_PLATFORM_FORMSET_GUID),
        }
    }
}

/// Vendor device path wrapping the formset GUID, terminated by an
/// end-of-path node.
pub fn vendor_device_path(guid: &Guid) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.push(0x01); // hardware device path
    out.push(0x04); // vendor subtype
    out.extend_from_slice(&20u16.to_le_bytes());
    out.extend_from_slice(&guid.0);
    out.extend_from_slice(&[0x7F, 0xFF, 0x04, 0x00]); // end of entire path
    out
}

pub trait SetupUi {
    fn install(&mut self, package: &UiPackage) -> Result<()>;
}

/// Stand-in installer for host-side runs: records that the package was
/// produced and logs it.
#[derive(Debug, Default)]
pub struct LoggingSetupUi {
    pub installed: Vec<UiPackage>,
}

impl SetupUi for LoggingSetupUi {
    fn install(&mut self, package: &UiPackage) -> Result<()> {
        debug!("Installing setup UI package for {:02X?}", package.formset_guid.0);
        self.installed.push(package.clone());
        Ok(())
    }
}

/// Every field value a preference implies for one controller, computed once
/// and applied to both the MCFG entry and the AML descriptors so the two
/// representations cannot diverge on partial failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AddressingPolicy {
    mcfg_base: u64,
    start_bus: u8,
    end_bus: u8,
    word_min: u16,
    word_max: u16,
    word_len: u16,
    fixed_memory_base: u32,
}

impl AddressingPolicy {
    fn compute(preference: EcamPreference, controller: &PcieController) -> Self {
        match preference {
            EcamPreference::Disabled => Self {
                mcfg_base: controller.config_space_address,
                start_bus: controller.bus_min,
                end_bus: controller.bus_max,
                word_min: controller.bus_min as u16,
                word_max: controller.bus_max as u16,
                word_len: 0xFF,
                fixed_memory_base: controller.config_space_address as u32,
            },
            EcamPreference::Enabled => Self {
                mcfg_base: SHARED_ECAM_WINDOW_BASE,
                start_bus: 0,
                end_bus: 0,
                word_min: 0,
                word_max: 0,
                word_len: 1,
                fixed_memory_base: (controller.config_space_address
                    .wrapping_add(LEGACY_CONFIG_SPACE_OFFSET)) as u32,
            },
        }
    }
}

/// Outcome of a patch pass.
#[derive(Debug, Clone, Serialize)]
pub struct PatchSummary {
    pub preference: EcamPreference,
    pub patched: Vec<usize>,
    pub skipped: Vec<usize>,
}

/// One-shot boot-time patch pass over a firmware image. Single writer, no
/// reentrancy; runs to completion on one call.
pub struct EcamPatcher<'a> {
    mem: &'a mut MemoryImage,
    rsdp_addr: u64,
    config: EcamConfig,
}

impl<'a> EcamPatcher<'a> {
    pub fn new(mem: &'a mut MemoryImage, rsdp_addr: u64, config: EcamConfig) -> Self {
        Self {
            mem,
            rsdp_addr,
            config,
        }
    }

    pub fn run(
        &mut self,
        varstore: &mut dyn VariableStore,
        controllers: &[PcieController],
        ui: &mut dyn SetupUi,
    ) -> Result<PatchSummary> {
        let preference = self.read_preference(varstore);
        varstore.set(
            ECAM_VARIABLE_NAME,
            VariableAttributes::NON_VOLATILE | VariableAttributes::BOOTSERVICE_ACCESS,
            &[preference as u8],
        )?;

        let tables = locate_tables(self.mem, self.rsdp_addr)?;
        let mcfg_addr = tables.mcfg.ok_or_else(|| {
            error!("MCFG table is missing");
            Error::TableNotFound("MCFG")
        })?;
        let fadt_addr = tables.fadt.ok_or_else(|| {
            error!("FADT table is missing");
            Error::TableNotFound("FACP")
        })?;

        let mcfg = Mcfg::read(self.mem, mcfg_addr)?;
        let fadt = Fadt::read(self.mem, fadt_addr)?;

        let dsdt_addr = fadt.dsdt as u64;
        let dsdt_header: SdtHeader = self.mem.read_struct(dsdt_addr)?;
        let block = self
            .mem
            .slice(dsdt_addr, dsdt_header.length as usize)?
            .to_vec();
        let mut tree = AmlTree::parse(&block)?;

        let mut summary = PatchSummary {
            preference,
            patched: Vec::new(),
            skipped: Vec::new(),
        };

        if controllers.is_empty() {
            debug!("No PCIe controller found, nothing to patch");
            ui.install(&UiPackage::ecam_platform())?;
            return Ok(summary);
        }

        for (index, controller) in controllers.iter().enumerate() {
            match self.patch_controller(&mut tree, &mcfg, index, controller, preference) {
                Ok(()) => summary.patched.push(index),
                Err(err) => {
                    warn!("Skipping controller {}: {}", index, err);
                    summary.skipped.push(index);
                }
            }
        }

        let written = tree.write_tree()?;
        if written.len() > dsdt_header.length as usize {
            return Err(Error::InvalidFormat(format!(
                "serialized DSDT ({} bytes) exceeds its original footprint ({} bytes)",
                written.len(),
                dsdt_header.length
            )));
        }
        self.mem.write_bytes(dsdt_addr, &written)?;
        mcfg.update_checksum(self.mem)?;

        ui.install(&UiPackage::ecam_platform())?;
        Ok(summary)
    }

    fn read_preference(&self, varstore: &dyn VariableStore) -> EcamPreference {
        let stored = varstore
            .get(ECAM_VARIABLE_NAME)
            .and_then(|data| data.first().copied())
            .and_then(EcamPreference::from_repr);
        match stored {
            Some(preference) => preference,
            None => {
                warn!(
                    "No usable Ecam preference found, defaulting to {:?}",
                    self.config.default_preference
                );
                self.config.default_preference
            }
        }
    }

    fn patch_controller(
        &mut self,
        tree: &mut AmlTree,
        mcfg: &Mcfg,
        index: usize,
        controller: &PcieController,
        preference: EcamPreference,
    ) -> Result<()> {
        let crs_path = format!("\\_SB_.PCI{}._CRS.RBUF", index);
        let res_path = format!("\\_SB_.PCI{}.RES0._CRS", index);

        let crs_data = resource_data_node(tree, &crs_path)?;
        let res_data = resource_data_node(tree, &res_path)?;

        let mut word = WordAddressSpace::decode(
            tree.data(crs_data)
                .ok_or_else(|| Error::NodeNotFound(crs_path.clone()))?,
        )?;
        let mut fixed_memory = FixedMemory32::decode(
            tree.data(res_data)
                .ok_or_else(|| Error::NodeNotFound(res_path.clone()))?,
        )?;

        let policy = AddressingPolicy::compute(preference, controller);

        let mut entry = mcfg.read_entry(self.mem, index)?;
        entry.base_address = policy.mcfg_base;
        entry.start_bus = policy.start_bus;
        entry.end_bus = policy.end_bus;
        mcfg.write_entry(self.mem, index, &entry)?;

        word.addr_range_min = policy.word_min;
        word.addr_range_max = policy.word_max;
        word.addr_len = policy.word_len;
        fixed_memory.base_address = policy.fixed_memory_base;

        let mut crs_bytes = tree.data(crs_data).unwrap_or_default().to_vec();
        word.encode_into(&mut crs_bytes)?;
        if let Err(err) = tree.update_node(crs_data, &crs_bytes) {
            warn!("Could not update node {}: {}", crs_path, err);
        }

        let mut res_bytes = tree.data(res_data).unwrap_or_default().to_vec();
        fixed_memory.encode_into(&mut res_bytes)?;
        if let Err(err) = tree.update_node(res_data, &res_bytes) {
            warn!("Could not update node {}: {}", res_path, err);
        }

        Ok(())
    }
}

/// Resolve `path` to the raw-buffer data node of its attached resource
/// template: fixed argument 1 is the buffer operation, whose sole variable
/// argument is the descriptor byte list.
fn resource_data_node(tree: &AmlTree, path: &str) -> Result<crate::aml::NodeId> {
    let node = tree
        .find_node(path)
        .ok_or_else(|| Error::NodeNotFound(path.to_string()))?;
    let buffer = tree
        .fixed_arg(node, 1)
        .ok_or_else(|| Error::NodeNotFound(format!("{} buffer operation", path)))?;
    tree.variable_arg(buffer, 0)
        .ok_or_else(|| Error::NodeNotFound(format!("{} variable argument", path)))
}
