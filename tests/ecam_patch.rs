// SPDX-License-Identifier: MIT

mod common;

use common::{build_image, FixtureLayout, IMAGE_BASE};
use log::LevelFilter;
use mv_acpi_patcher::acpi::{Mcfg, PciConfigEntry, SdtHeader};
use mv_acpi_patcher::aml::resource::{FixedMemory32, WordAddressSpace};
use mv_acpi_patcher::aml::AmlTree;
use mv_acpi_patcher::ecam::{
    EcamConfig, EcamPatcher, EcamPreference, LoggingSetupUi, MemVariableStore, PatchSummary,
    PcieController, VariableAttributes, VariableStore, ECAM_VARIABLE_NAME,
};
use mv_acpi_patcher::memory::MemoryImage;
use mv_acpi_patcher::{Error, Result};
use simplelog::{Config, TestLogger};

fn controllers() -> Vec<PcieController> {
    vec![
        PcieController {
            config_space_address: 0x1_0000_0000,
            bus_min: 0,
            bus_max: 255,
        },
        PcieController {
            config_space_address: 0x2_0000_0000,
            bus_min: 0,
            bus_max: 31,
        },
    ]
}

fn run_pass(
    mem: &mut MemoryImage,
    layout: FixtureLayout,
    controllers: &[PcieController],
    varstore: &mut MemVariableStore,
    ui: &mut LoggingSetupUi,
) -> Result<PatchSummary> {
    EcamPatcher::new(mem, layout.rsdp, EcamConfig::default()).run(varstore, controllers, ui)
}

fn mcfg_entries(mem: &MemoryImage, layout: FixtureLayout) -> Vec<PciConfigEntry> {
    let mcfg = Mcfg::read(mem, layout.mcfg).unwrap();
    (0..mcfg.entry_count())
        .map(|index| mcfg.read_entry(mem, index).unwrap())
        .collect()
}

fn dsdt_bytes(mem: &MemoryImage, layout: FixtureLayout) -> Vec<u8> {
    let header: SdtHeader = mem.read_struct(layout.dsdt).unwrap();
    mem.slice(layout.dsdt, header.length as usize).unwrap().to_vec()
}

fn descriptors(mem: &MemoryImage, layout: FixtureLayout, index: usize) -> (WordAddressSpace, FixedMemory32) {
    let tree = AmlTree::parse(&dsdt_bytes(mem, layout)).unwrap();

    let crs = tree
        .find_node(&format!("\\_SB_.PCI{}._CRS.RBUF", index))
        .unwrap();
    let buffer = tree.fixed_arg(crs, 1).unwrap();
    let data = tree.variable_arg(buffer, 0).unwrap();
    let word = WordAddressSpace::decode(tree.data(data).unwrap()).unwrap();

    let res = tree
        .find_node(&format!("\\_SB_.PCI{}.RES0._CRS", index))
        .unwrap();
    let buffer = tree.fixed_arg(res, 1).unwrap();
    let data = tree.variable_arg(buffer, 0).unwrap();
    let fixed = FixedMemory32::decode(tree.data(data).unwrap()).unwrap();

    (word, fixed)
}

fn image_snapshot(mem: &MemoryImage) -> Vec<u8> {
    mem.slice(IMAGE_BASE, mem.len()).unwrap().to_vec()
}

#[test]
fn test_disabled_policy_programs_real_addresses() {
    let _ = TestLogger::init(LevelFilter::Debug, Config::default());
    let (mut mem, layout) = build_image(2, true);
    let controllers = controllers();
    let mut varstore = MemVariableStore::new();
    let mut ui = LoggingSetupUi::default();

    // Preference absent in storage; the platform default (Disabled) applies.
    let summary = run_pass(&mut mem, layout, &controllers, &mut varstore, &mut ui).unwrap();
    assert_eq!(EcamPreference::Disabled, summary.preference);
    assert_eq!(vec![0, 1], summary.patched);
    assert!(summary.skipped.is_empty());

    let entries = mcfg_entries(&mem, layout);
    for (index, controller) in controllers.iter().enumerate() {
        assert_eq!(controller.config_space_address, entries[index].base_address);
        assert_eq!(controller.bus_min, entries[index].start_bus);
        assert_eq!(controller.bus_max, entries[index].end_bus);
        // Fields outside the policy survive untouched.
        assert_eq!(index as u16, entries[index].segment);

        let (word, fixed) = descriptors(&mem, layout, index);
        assert_eq!(controller.bus_min as u16, word.addr_range_min);
        assert_eq!(controller.bus_max as u16, word.addr_range_max);
        assert_eq!(0xFF, word.addr_len);
        assert_eq!(controller.config_space_address as u32, fixed.base_address);
        // The pristine window length is preserved.
        assert_eq!(0x0001_0000, fixed.range_length);
    }
}

#[test]
fn test_preference_written_back_every_pass() {
    let (mut mem, layout) = build_image(2, true);
    let mut varstore = MemVariableStore::new();
    let mut ui = LoggingSetupUi::default();

    run_pass(&mut mem, layout, &controllers(), &mut varstore, &mut ui).unwrap();

    assert_eq!(Some(vec![EcamPreference::Disabled as u8]), varstore.get(ECAM_VARIABLE_NAME));
    let attributes = varstore.attributes(ECAM_VARIABLE_NAME).unwrap();
    assert!(attributes.contains(VariableAttributes::NON_VOLATILE));
    assert!(attributes.contains(VariableAttributes::BOOTSERVICE_ACCESS));
}

#[test]
fn test_enabled_policy_collapses_to_shared_window() {
    let (mut mem, layout) = build_image(2, true);
    let controllers = controllers();
    let mut varstore = MemVariableStore::new();
    varstore
        .set(
            ECAM_VARIABLE_NAME,
            VariableAttributes::NON_VOLATILE,
            &[EcamPreference::Enabled as u8],
        )
        .unwrap();
    let mut ui = LoggingSetupUi::default();

    let summary = run_pass(&mut mem, layout, &controllers, &mut varstore, &mut ui).unwrap();
    assert_eq!(EcamPreference::Enabled, summary.preference);

    let entries = mcfg_entries(&mem, layout);
    for (index, controller) in controllers.iter().enumerate() {
        let base_bytes = entries[index].base_address.to_le_bytes();
        assert_eq!(128, base_bytes[1]);
        for (position, byte) in base_bytes.iter().enumerate() {
            if position != 1 {
                assert_eq!(0, *byte, "base address byte {} should be zero", position);
            }
        }
        assert_eq!(0, entries[index].start_bus);
        assert_eq!(0, entries[index].end_bus);

        let (word, fixed) = descriptors(&mem, layout, index);
        assert_eq!(0, word.addr_range_min);
        assert_eq!(0, word.addr_range_max);
        assert_eq!(1, word.addr_len);
        assert_eq!(
            (controller.config_space_address + 0x8000) as u32,
            fixed.base_address
        );
    }
    // Both controllers share the one window.
    assert_eq!(entries[0].base_address, entries[1].base_address);
}

#[test]
fn test_mcfg_and_dsdt_checksums_sum_to_zero() {
    let (mut mem, layout) = build_image(2, true);
    let mut varstore = MemVariableStore::new();
    let mut ui = LoggingSetupUi::default();

    run_pass(&mut mem, layout, &controllers(), &mut varstore, &mut ui).unwrap();

    let mcfg = Mcfg::read(&mem, layout.mcfg).unwrap();
    let mcfg_bytes = mem.slice(layout.mcfg, mcfg.header.length as usize).unwrap();
    assert_eq!(0, mcfg_bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)));

    let dsdt = dsdt_bytes(&mem, layout);
    assert_eq!(0, dsdt.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)));
}

#[test]
fn test_patched_tree_round_trips() {
    let (mut mem, layout) = build_image(2, true);
    let mut varstore = MemVariableStore::new();
    let mut ui = LoggingSetupUi::default();

    run_pass(&mut mem, layout, &controllers(), &mut varstore, &mut ui).unwrap();

    let written = dsdt_bytes(&mem, layout);
    let reparsed = AmlTree::parse(&written).unwrap();
    assert_eq!(written, reparsed.write_tree().unwrap());
}

#[test]
fn test_same_preference_twice_is_idempotent() {
    let (mut mem, layout) = build_image(2, true);
    let controllers = controllers();
    let mut varstore = MemVariableStore::new();
    let mut ui = LoggingSetupUi::default();

    run_pass(&mut mem, layout, &controllers, &mut varstore, &mut ui).unwrap();
    let first = image_snapshot(&mem);

    run_pass(&mut mem, layout, &controllers, &mut varstore, &mut ui).unwrap();
    assert_eq!(first, image_snapshot(&mem));
}

#[test]
fn test_zero_controllers_is_benign() {
    let (mut mem, layout) = build_image(0, true);
    let before = image_snapshot(&mem);
    let mut varstore = MemVariableStore::new();
    let mut ui = LoggingSetupUi::default();

    let summary = run_pass(&mut mem, layout, &[], &mut varstore, &mut ui).unwrap();
    assert!(summary.patched.is_empty());
    assert!(summary.skipped.is_empty());

    // Tables untouched, UI package still installed.
    assert_eq!(before, image_snapshot(&mem));
    assert_eq!(1, ui.installed.len());
}

#[test]
fn test_missing_fadt_is_terminal() {
    let (mut mem, layout) = build_image(2, false);
    let before = image_snapshot(&mem);
    let mut varstore = MemVariableStore::new();
    let mut ui = LoggingSetupUi::default();

    let result = run_pass(&mut mem, layout, &controllers(), &mut varstore, &mut ui);
    assert!(matches!(result, Err(Error::TableNotFound("FACP"))));

    // No table was touched and no UI package was installed.
    assert_eq!(before, image_snapshot(&mem));
    assert!(ui.installed.is_empty());
}

#[test]
fn test_missing_node_skips_only_that_controller() {
    let _ = TestLogger::init(LevelFilter::Debug, Config::default());
    // DSDT and MCFG describe two controllers; the board claims three.
    let (mut mem, layout) = build_image(2, true);
    let mut controllers = controllers();
    controllers.push(PcieController {
        config_space_address: 0x3_0000_0000,
        bus_min: 0,
        bus_max: 7,
    });
    let mut varstore = MemVariableStore::new();
    let mut ui = LoggingSetupUi::default();

    let summary = run_pass(&mut mem, layout, &controllers, &mut varstore, &mut ui).unwrap();
    assert_eq!(vec![0, 1], summary.patched);
    assert_eq!(vec![2], summary.skipped);

    // The two present controllers were still patched.
    let entries = mcfg_entries(&mem, layout);
    assert_eq!(0x1_0000_0000, entries[0].base_address);
    assert_eq!(0x2_0000_0000, entries[1].base_address);
    assert_eq!(1, ui.installed.len());
}
