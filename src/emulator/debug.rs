//! Breakpoints, the single-step latch and disassembly annotations.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use log::warn;

use crate::bus::CpuId;

/// Callback fired when a breakpoint matches, before the instruction runs.
pub type BreakpointSink = Box<dyn FnMut(CpuId, u16) + Send>;

/// Instrumentation state for the hardware loop. Only constructed when
/// the board runs with `debug` set; the hot path skips it entirely
/// otherwise.
pub struct Debugger {
    breakpoints: [BTreeSet<u16>; 3],
    annotations: [HashMap<u16, String>; 3],
    pub(super) waiting: bool,
    pub(super) single_step: bool,
    on_breakpoint: Option<BreakpointSink>,
}

impl Debugger {
    pub fn new() -> Self {
        Self {
            breakpoints: Default::default(),
            annotations: Default::default(),
            waiting: false,
            single_step: false,
            on_breakpoint: None,
        }
    }

    pub fn set_breakpoint_sink(&mut self, sink: BreakpointSink) {
        self.on_breakpoint = Some(sink);
    }

    pub fn add_breakpoint(&mut self, cpu: CpuId, addr: u16) {
        self.breakpoints[cpu.index()].insert(addr);
    }

    pub fn remove_breakpoint(&mut self, cpu: CpuId, addr: u16) {
        self.breakpoints[cpu.index()].remove(&addr);
    }

    pub fn load_annotations(&mut self, cpu: CpuId, path: &Path) -> std::io::Result<()> {
        let table = parse_annotations(path)?;
        self.annotations[cpu.index()] = table;
        Ok(())
    }

    pub fn annotation(&self, cpu: CpuId, addr: u16) -> Option<&str> {
        self.annotations[cpu.index()].get(&addr).map(String::as_str)
    }

    /// Pre-step hook: latch the wait state when any CPU sits on a
    /// breakpoint.
    pub(super) fn check_breakpoints(&mut self, pcs: [(CpuId, u16, bool); 3]) {
        for (cpu, pc, running) in pcs {
            if running && self.breakpoints[cpu.index()].contains(&pc) {
                self.waiting = true;
                match self.annotation(cpu, pc) {
                    Some(note) => log::info!("breakpoint: {cpu} at {pc:#06X}  ; {note}"),
                    None => log::info!("breakpoint: {cpu} at {pc:#06X}"),
                }
                if let Some(sink) = self.on_breakpoint.as_mut() {
                    sink(cpu, pc);
                }
            }
        }
    }

    /// Post-step hook: in single-step mode every iteration re-arms the
    /// wait latch.
    pub(super) fn after_step(&mut self) {
        if self.single_step {
            self.waiting = true;
        }
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an `ADDR: bytes ; comment` annotation file. Lines that do not
/// follow the shape are skipped with a warning rather than failing the
/// whole file.
pub fn parse_annotations(path: &Path) -> std::io::Result<HashMap<u16, String>> {
    let text = std::fs::read_to_string(path)?;
    let mut table = HashMap::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        let Some((addr_text, rest)) = line.split_once(':') else {
            warn!("{}:{}: annotation line has no address", path.display(), number + 1);
            continue;
        };
        let Ok(addr) = u16::from_str_radix(addr_text.trim(), 16) else {
            warn!(
                "{}:{}: bad annotation address '{}'",
                path.display(),
                number + 1,
                addr_text.trim()
            );
            continue;
        };
        let comment = match rest.split_once(';') {
            Some((_, comment)) => comment.trim().to_string(),
            None => rest.trim().to_string(),
        };
        table.insert(addr, comment);
    }
    Ok(table)
}
