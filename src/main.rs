use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::Parser;
use log::{info, warn};

use galaga::bmp;
use galaga::bus::{Bus, CpuId, DipSwitches};
use galaga::emulator::{DebugCommand, Emulator};
use galaga::roms::{RomSet, RomSetKind};
use galaga::snapshot::Snapshot;
use galaga::video::VideoHardware;

const DEFAULT_DIP_FILE: &str = "./dip-switches.json";

/// Headless host for the Galaga board. Frames are delivered through the
/// board's mailbox; this driver counts them and can archive them as BMP
/// files. A windowed frontend plugs in at the same handle.
#[derive(Parser)]
#[command(name = "galaga", version, about)]
struct Args {
    /// Directory containing the ROM set files (MAME names)
    rom_path: PathBuf,

    /// ROM set: galaga, galagao, galagamw or galagamk
    #[arg(long, default_value = "galaga")]
    rom_set: String,

    /// JSON file with DIP switch overrides
    #[arg(long)]
    dip_switches: Option<PathBuf>,

    /// Snapshot file to resume from
    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Write a snapshot to this path when the run ends
    #[arg(long)]
    save_state_on_exit: Option<PathBuf>,

    /// Downgrade ROM checksum mismatches from fatal to warnings
    #[arg(long)]
    skip_checksums: bool,

    /// Permit writes into the 0x0000-0x3FFF code windows
    #[arg(long)]
    writable_rom: bool,

    /// Enable breakpoint machinery and instrumentation
    #[arg(long)]
    debug: bool,

    /// Breakpoint address (hex) applied to every CPU; repeatable
    #[arg(long = "break", value_name = "ADDR", value_parser = parse_hex_addr)]
    break_all: Vec<u16>,

    /// Breakpoint address (hex) for CPU1 only; repeatable
    #[arg(long, value_name = "ADDR", value_parser = parse_hex_addr)]
    break_cpu1: Vec<u16>,

    /// Breakpoint address (hex) for CPU2 only; repeatable
    #[arg(long, value_name = "ADDR", value_parser = parse_hex_addr)]
    break_cpu2: Vec<u16>,

    /// Breakpoint address (hex) for CPU3 only; repeatable
    #[arg(long, value_name = "ADDR", value_parser = parse_hex_addr)]
    break_cpu3: Vec<u16>,

    /// Record per-instruction snapshots (unsupported on this board)
    #[arg(long)]
    reverse_step: bool,

    /// Disassembly annotation file for CPU1 (`ADDR: bytes ; comment`)
    #[arg(long)]
    annotations_cpu1: Option<PathBuf>,

    /// Disassembly annotation file for CPU2
    #[arg(long)]
    annotations_cpu2: Option<PathBuf>,

    /// Disassembly annotation file for CPU3
    #[arg(long)]
    annotations_cpu3: Option<PathBuf>,

    /// Stop after this many delivered frames
    #[arg(long)]
    frame_limit: Option<u64>,

    /// Stop after this many wall-clock seconds
    #[arg(long)]
    seconds: Option<u64>,

    /// Archive every delivered frame as frame_NNNNN.bmp in this directory
    #[arg(long)]
    frame_dir: Option<PathBuf>,

    /// Render the 256-tile sheet to this BMP and exit
    #[arg(long, value_name = "PATH")]
    dump_tiles: Option<PathBuf>,
}

fn parse_hex_addr(text: &str) -> Result<u16, String> {
    let trimmed = text.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(trimmed, 16).map_err(|_| format!("'{text}' is not a 16-bit hex address"))
}

fn main() {
    env_logger::init();
    if let Err(err) = run(Args::parse()) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let kind: RomSetKind = args.rom_set.parse()?;
    info!("loading ROM set '{kind}' from {}", args.rom_path.display());
    let set = RomSet::load(kind, &args.rom_path, args.skip_checksums)?;

    let video = VideoHardware::from_rom_set(&set)?;

    if let Some(path) = &args.dump_tiles {
        let (width, height, rgba) = video.renderer().tile_sheet(1);
        std::fs::write(path, bmp::encode(width, height, &rgba))?;
        info!("tile sheet written to {}", path.display());
        return Ok(());
    }

    let dips = load_dips(args.dip_switches.as_deref())?;

    let mut bus = Bus::new();
    bus.load_code_roms(&set.cpu1, &set.cpu2, &set.cpu3);
    bus.set_dips(dips);
    bus.set_writable_rom(args.writable_rom);

    let mut emulator = Emulator::with_z80s(bus, video);

    let wants_debug = args.debug
        || !args.break_all.is_empty()
        || !args.break_cpu1.is_empty()
        || !args.break_cpu2.is_empty()
        || !args.break_cpu3.is_empty();
    if wants_debug {
        let debugger = emulator.enable_debug();
        for &addr in &args.break_all {
            for cpu in CpuId::ALL {
                debugger.add_breakpoint(cpu, addr);
            }
        }
        for &addr in &args.break_cpu1 {
            debugger.add_breakpoint(CpuId::Cpu1, addr);
        }
        for &addr in &args.break_cpu2 {
            debugger.add_breakpoint(CpuId::Cpu2, addr);
        }
        for &addr in &args.break_cpu3 {
            debugger.add_breakpoint(CpuId::Cpu3, addr);
        }
        let annotations = [
            (CpuId::Cpu1, args.annotations_cpu1.as_deref()),
            (CpuId::Cpu2, args.annotations_cpu2.as_deref()),
            (CpuId::Cpu3, args.annotations_cpu3.as_deref()),
        ];
        for (cpu, path) in annotations {
            if let Some(path) = path {
                debugger.load_annotations(cpu, path)?;
            }
        }
    }
    if args.reverse_step {
        warn!("--reverse-step is not implemented for the three-CPU board; ignoring");
    }

    if let Some(path) = &args.load_state {
        let snapshot = Snapshot::from_file(path)?;
        emulator.restore(&snapshot)?;
        info!("resumed from {}", path.display());
    }

    if let Some(dir) = &args.frame_dir {
        std::fs::create_dir_all(dir)?;
    }

    let handle = emulator.spawn()?;
    info!("hardware thread running");

    let started = Instant::now();
    let deadline = args.seconds.map(|s| started + Duration::from_secs(s));
    let mut frames_seen: u64 = 0;

    loop {
        if let Some(frame) = handle.frames.take() {
            if let Some(dir) = &args.frame_dir {
                let path = dir.join(format!("frame_{frames_seen:05}.bmp"));
                std::fs::write(path, &frame)?;
            }
            frames_seen += 1;
            if args.frame_limit.is_some_and(|limit| frames_seen >= limit) {
                break;
            }
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        if handle.control.is_cancelled() {
            // The hardware thread died on its own; surface its fault.
            break;
        }
        std::thread::sleep(Duration::from_millis(4));
    }

    if let Some(path) = &args.save_state_on_exit {
        handle.send(DebugCommand::SaveState(path.clone()));
    }

    let result = handle.shutdown();
    info!(
        "stopped after {frames_seen} frame(s) in {:.1}s",
        started.elapsed().as_secs_f32()
    );
    result?;
    Ok(())
}

fn load_dips(explicit: Option<&Path>) -> Result<DipSwitches, Box<dyn std::error::Error>> {
    if let Some(path) = explicit {
        return Ok(DipSwitches::from_file(path)?);
    }
    let default = Path::new(DEFAULT_DIP_FILE);
    if default.exists() {
        info!("using DIP switches from {DEFAULT_DIP_FILE}");
        return Ok(DipSwitches::from_file(default)?);
    }
    Ok(DipSwitches::default())
}
