// SPDX-License-Identifier: MIT

use clap::{Parser, ValueEnum};
use mv_acpi_patcher::acpi::{locate_tables, Mcfg, TableSet};
use mv_acpi_patcher::ecam::{
    EcamConfig, EcamPatcher, EcamPreference, LoggingSetupUi, MemVariableStore, PatchSummary,
    PcieController,
};
use mv_acpi_patcher::memory::MemoryImage;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Raw dump of the firmware's ACPI table region
    image_file: PathBuf,

    /// Physical base address the dump was taken at
    #[arg(short, long, value_parser = parse_hex, default_value = "0")]
    base: u64,

    /// Physical address of the RSDP (defaults to the image base)
    #[arg(short, long, value_parser = parse_hex)]
    rsdp: Option<u64>,

    /// Board description file (JSON): controllers and default preference
    #[arg(short = 'd', long)]
    board: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Command::Info)]
    command: Command,

    #[arg(short, long, value_enum, default_value_t = Output::Debug)]
    output: Output,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Command {
    Info,
    Patch,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Output {
    Debug,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
struct BoardDescription {
    #[serde(default)]
    default_preference: Option<EcamPreference>,
    #[serde(default)]
    controllers: Vec<PcieController>,
}

#[derive(Debug, Serialize)]
struct ImageInfo {
    tables: TableSet,
    mcfg_entries: Vec<mv_acpi_patcher::acpi::PciConfigEntry>,
}

fn parse_hex(value: &str) -> Result<u64, String> {
    let trimmed = value.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(trimmed, 16).map_err(|err| err.to_string())
}

fn print<T: Serialize + std::fmt::Debug>(value: &T, output: Output) {
    match output {
        Output::Debug => println!("{:#?}", value),
        Output::Json => println!(
            "{}",
            serde_json::to_string_pretty(value)
                .expect("Cannot serialize report into JSON, try another output format")
        ),
    }
}

pub fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let data = fs::read(&args.image_file)
        .expect(format!("Cannot open image file at {:?}", args.image_file).as_str());
    let mut mem = MemoryImage::new(args.base, data);
    let rsdp_addr = args.rsdp.unwrap_or(args.base);

    let board: Option<BoardDescription> = args.board.as_ref().map(|path| {
        let raw = fs::read_to_string(path)
            .expect(format!("Cannot open board description at {:?}", path).as_str());
        serde_json::from_str(&raw).expect("Board description is not valid JSON")
    });

    match args.command {
        Command::Info => {
            let tables = locate_tables(&mem, rsdp_addr).expect("Cannot walk the root table");
            let mcfg_entries = tables
                .mcfg
                .map(|addr| {
                    let mcfg = Mcfg::read(&mem, addr).expect("MCFG table is malformed");
                    (0..mcfg.entry_count())
                        .map(|index| mcfg.read_entry(&mem, index).expect("MCFG entry truncated"))
                        .collect()
                })
                .unwrap_or_default();
            print(&ImageInfo { tables, mcfg_entries }, args.output);
        }
        Command::Patch => {
            let board = board.expect("Patching requires a board description (--board)");
            let config = EcamConfig {
                default_preference: board
                    .default_preference
                    .unwrap_or(EcamPreference::Disabled),
            };
            let mut varstore = MemVariableStore::new();
            let mut ui = LoggingSetupUi::default();

            let summary: PatchSummary = EcamPatcher::new(&mut mem, rsdp_addr, config)
                .run(&mut varstore, &board.controllers, &mut ui)
                .expect("Patch pass failed");

            fs::write(&args.image_file, mem.into_data())
                .expect(format!("Cannot write image file at {:?}", args.image_file).as_str());
            print(&summary, args.output);
        }
    }
}
