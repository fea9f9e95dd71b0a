//! The PCB hardware loop and interrupt controller.
//!
//! One worker thread interleaves the three CPUs instruction by
//! instruction, throttles itself to real time in 1/60 s windows of
//! simulated CPU1 work, and on every VBLANK composes a frame, feeds the
//! sinks and injects the per-CPU interrupts. The host owns an
//! [`EmulatorHandle`]: control atomics, a one-slot frame mailbox and a
//! bounded debug-command channel.

mod debug;

pub use debug::{parse_annotations, BreakpointSink, Debugger};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::bus::{Bus, CpuId};
use crate::cpu::{BusHandle, CpuCore, StepFault};
use crate::snapshot::{BusLatches, Snapshot, SnapshotError};
use crate::video::VideoHardware;
use crate::z80::Z80;
use crate::CYCLES_PER_VBLANK;

const FRAME_INTERVAL: Duration = Duration::from_micros(16_667);
const PAUSE_POLL: Duration = Duration::from_millis(250);
const DEBUG_POLL: Duration = Duration::from_millis(10);
const COMMAND_QUEUE_DEPTH: usize = 32;

/// One-shot requests from the host to the hardware thread, drained at
/// the top of each loop iteration.
pub enum DebugCommand {
    Continue,
    SingleStep,
    AddBreakpoint(CpuId, u16),
    RemoveBreakpoint(CpuId, u16),
    SaveState(PathBuf),
    LoadState(PathBuf),
    ReverseStep,
}

/// UI -> hardware control flags.
#[derive(Default)]
pub struct Control {
    cancelled: AtomicBool,
    paused: AtomicBool,
}

impl Control {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

/// Single-slot frame handoff. The hardware thread overwrites the slot
/// each VBLANK; the UI takes it on its own tick. Losing the race costs
/// at worst one skipped or repeated frame.
#[derive(Default)]
pub struct FrameMailbox {
    slot: Mutex<Option<Vec<u8>>>,
    fresh: AtomicBool,
}

impl FrameMailbox {
    pub fn publish(&self, frame: Vec<u8>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(frame);
            self.fresh.store(true, Ordering::Release);
        }
    }

    pub fn take(&self) -> Option<Vec<u8>> {
        if !self.fresh.swap(false, Ordering::Acquire) {
            return None;
        }
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }
}

type RenderSink = Box<dyn FnMut(&[u8]) + Send>;
type AudioSink = Box<dyn FnMut() + Send>;

/// The board: bus, three stepping engines, video, sinks, counters.
pub struct Emulator {
    bus: Bus,
    cpus: [Box<dyn CpuCore>; 3],
    video: VideoHardware,
    on_render: RenderSink,
    on_audio: AudioSink,
    debugger: Option<Debugger>,
    total_cycles: u64,
    total_opcodes: u64,
    cycles_since_interrupt: u32,
}

impl Emulator {
    pub fn new(bus: Bus, cpus: [Box<dyn CpuCore>; 3], video: VideoHardware) -> Self {
        Self {
            bus,
            cpus,
            video,
            on_render: Box::new(|_| {}),
            on_audio: Box::new(|| {}),
            debugger: None,
            total_cycles: 0,
            total_opcodes: 0,
            cycles_since_interrupt: 0,
        }
    }

    /// Board with the stock Z80 cores.
    pub fn with_z80s(bus: Bus, video: VideoHardware) -> Self {
        Self::new(
            bus,
            [
                Box::new(Z80::new(CpuId::Cpu1)),
                Box::new(Z80::new(CpuId::Cpu2)),
                Box::new(Z80::new(CpuId::Cpu3)),
            ],
            video,
        )
    }

    /// Sink receiving each composed frame as BMP bytes.
    pub fn set_render_sink(&mut self, sink: RenderSink) {
        self.on_render = sink;
    }

    /// Audio path placeholder, called once per VBLANK.
    pub fn set_audio_sink(&mut self, sink: AudioSink) {
        self.on_audio = sink;
    }

    /// Switch on instrumentation. Without it the hot path never looks at
    /// breakpoints.
    pub fn enable_debug(&mut self) -> &mut Debugger {
        self.debugger.get_or_insert_with(Debugger::new)
    }

    pub fn debugger_mut(&mut self) -> Option<&mut Debugger> {
        self.debugger.as_mut()
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn cpu(&self, id: CpuId) -> &dyn CpuCore {
        self.cpus[id.index()].as_ref()
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn total_opcodes(&self) -> u64 {
        self.total_opcodes
    }

    pub fn cycles_since_interrupt(&self) -> u32 {
        self.cycles_since_interrupt
    }

    /// Step the three CPUs once in fixed order. Returns CPU1's cycles,
    /// which drive both throttling and interrupt scheduling.
    fn step_cpus(&mut self) -> Result<u32, StepFault> {
        let c1 = {
            let mut handle = BusHandle::new(&mut self.bus, CpuId::Cpu1);
            self.cpus[0].step(&mut handle)?
        };
        if !self.bus.halt_cpu2 {
            let mut handle = BusHandle::new(&mut self.bus, CpuId::Cpu2);
            self.cpus[1].step(&mut handle)?;
        }
        if !self.bus.halt_cpu3 {
            let mut handle = BusHandle::new(&mut self.bus, CpuId::Cpu3);
            self.cpus[2].step(&mut handle)?;
        }
        self.total_cycles += c1 as u64;
        self.total_opcodes += 1;
        Ok(c1)
    }

    /// VBLANK bookkeeping: accumulate CPU1 cycles and, once a 1/60 s
    /// window of simulated work has passed, emit a frame and inject the
    /// per-CPU interrupts.
    fn handle_interrupts(&mut self, c1: u32) -> Result<(), StepFault> {
        self.cycles_since_interrupt += c1;
        if self.cycles_since_interrupt < CYCLES_PER_VBLANK {
            return Ok(());
        }

        self.video.compose(&self.bus).map_err(StepFault::from)?;
        let frame = self.video.encode_frame();
        (self.on_render)(&frame);
        (self.on_audio)();

        if self.bus.irq1_enabled {
            self.bus.irq1_enabled = false;
            let vector = self.bus.port0_last_write;
            self.cpus[0].inject_maskable(vector);
        }
        if self.bus.irq2_enabled {
            // An interrupt aimed at a halted CPU un-halts it first.
            self.bus.halt_cpu2 = false;
            self.bus.irq2_enabled = false;
            // Real hardware feeds CPU2 its own port-0 latch; this board
            // model passes 0x00, matching the observed source behaviour.
            self.cpus[1].inject_maskable(0x00);
        }
        if self.bus.nmi3_enabled {
            self.bus.halt_cpu3 = false;
            self.bus.nmi3_enabled = false;
            self.cpus[2].inject_nmi();
        }

        self.cycles_since_interrupt = 0;
        Ok(())
    }

    /// One full loop iteration without throttling: step the CPUs, then
    /// run the VBLANK path. This is the headless / test entry point.
    pub fn tick(&mut self) -> Result<u32, StepFault> {
        let c1 = self.step_cpus()?;
        self.handle_interrupts(c1)?;
        Ok(c1)
    }

    /// Capture all mutable board state. The loop must be paused or not
    /// yet started.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: Snapshot::VERSION,
            cpus: [
                self.cpus[0].state(),
                self.cpus[1].state(),
                self.cpus[2].state(),
            ],
            bus: BusLatches {
                irq1_enabled: self.bus.irq1_enabled,
                irq2_enabled: self.bus.irq2_enabled,
                nmi3_enabled: self.bus.nmi3_enabled,
                halt_cpu2: self.bus.halt_cpu2,
                halt_cpu3: self.bus.halt_cpu3,
                port0_last_write: self.bus.port0_last_write,
            },
            memory: Snapshot::encode_memory(self.bus.memory_image()),
            total_cycles: self.total_cycles,
            total_opcodes: self.total_opcodes,
            cycles_since_interrupt: self.cycles_since_interrupt,
        }
    }

    /// Overwrite all mutable board state from a snapshot. Same pausing
    /// requirement as [`Emulator::snapshot`].
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let memory = snapshot.decode_memory()?;
        self.bus.restore_memory_image(&memory);
        for (cpu, state) in self.cpus.iter_mut().zip(snapshot.cpus.iter()) {
            cpu.restore(state);
        }
        self.bus.irq1_enabled = snapshot.bus.irq1_enabled;
        self.bus.irq2_enabled = snapshot.bus.irq2_enabled;
        self.bus.nmi3_enabled = snapshot.bus.nmi3_enabled;
        self.bus.halt_cpu2 = snapshot.bus.halt_cpu2;
        self.bus.halt_cpu3 = snapshot.bus.halt_cpu3;
        self.bus.port0_last_write = snapshot.bus.port0_last_write;
        self.total_cycles = snapshot.total_cycles;
        self.total_opcodes = snapshot.total_opcodes;
        self.cycles_since_interrupt = snapshot.cycles_since_interrupt;
        Ok(())
    }

    fn apply_command(&mut self, command: DebugCommand) {
        match command {
            DebugCommand::Continue => {
                if let Some(debugger) = self.debugger.as_mut() {
                    debugger.waiting = false;
                    debugger.single_step = false;
                }
            }
            DebugCommand::SingleStep => {
                if let Some(debugger) = self.debugger.as_mut() {
                    debugger.waiting = false;
                    debugger.single_step = true;
                }
            }
            DebugCommand::AddBreakpoint(cpu, addr) => {
                self.enable_debug().add_breakpoint(cpu, addr);
            }
            DebugCommand::RemoveBreakpoint(cpu, addr) => {
                if let Some(debugger) = self.debugger.as_mut() {
                    debugger.remove_breakpoint(cpu, addr);
                }
            }
            DebugCommand::SaveState(path) => match self.snapshot().to_file(&path) {
                Ok(()) => info!("state saved to {}", path.display()),
                Err(err) => error!("state save failed: {err}"),
            },
            DebugCommand::LoadState(path) => {
                match Snapshot::from_file(&path).and_then(|snapshot| self.restore(&snapshot)) {
                    Ok(()) => info!("state loaded from {}", path.display()),
                    Err(err) => error!("state load failed: {err}"),
                }
            }
            DebugCommand::ReverseStep => {
                warn!("reverse-step recording is not implemented for the three-CPU board");
            }
        }
    }

    fn dump_state(&self, fault: &StepFault) {
        error!("hardware loop fault: {fault}");
        for id in CpuId::ALL {
            let state = self.cpus[id.index()].state();
            let r = state.registers;
            error!(
                "{id}: PC={:04X} SP={:04X} AF={:02X}{:02X} BC={:02X}{:02X} DE={:02X}{:02X} \
                 HL={:02X}{:02X} IX={:04X} IY={:04X} I={:02X} IM{} IFF1={} halted={}",
                r.pc,
                r.sp,
                r.a,
                r.f,
                r.b,
                r.c,
                r.d,
                r.e,
                r.h,
                r.l,
                r.ix,
                r.iy,
                r.i,
                state.im,
                u8::from(state.iff1),
                state.halted,
            );
            if let Some(debugger) = self.debugger.as_ref() {
                if let Some(note) = debugger.annotation(id, state.registers.pc) {
                    error!("{id}: at {:04X}  ; {note}", state.registers.pc);
                }
            }
        }
        error!(
            "cycles={} opcodes={} since_vblank={}",
            self.total_cycles, self.total_opcodes, self.cycles_since_interrupt
        );
    }

    /// The hardware thread body. Runs until cancelled or a fatal fault.
    pub fn run(
        &mut self,
        control: &Control,
        commands: &Receiver<DebugCommand>,
    ) -> Result<(), StepFault> {
        let mut stopwatch = Instant::now();
        let mut cycles_in_window: u32 = 0;

        'outer: loop {
            while let Ok(command) = commands.try_recv() {
                self.apply_command(command);
            }
            if control.is_cancelled() {
                break;
            }
            if control.is_paused() {
                std::thread::sleep(PAUSE_POLL);
                // Real time spent paused must not be charged to the
                // throttle window.
                stopwatch = Instant::now();
                cycles_in_window = 0;
                continue;
            }

            if self.debugger.is_some() {
                let pcs = [
                    (CpuId::Cpu1, self.cpus[0].pc(), true),
                    (CpuId::Cpu2, self.cpus[1].pc(), !self.bus.halt_cpu2),
                    (CpuId::Cpu3, self.cpus[2].pc(), !self.bus.halt_cpu3),
                ];
                if let Some(debugger) = self.debugger.as_mut() {
                    debugger.check_breakpoints(pcs);
                }
                if self.debugger.as_ref().is_some_and(|d| d.waiting) {
                    while self.debugger.as_ref().is_some_and(|d| d.waiting) {
                        if control.is_cancelled() {
                            break 'outer;
                        }
                        while let Ok(command) = commands.try_recv() {
                            self.apply_command(command);
                        }
                        std::thread::sleep(DEBUG_POLL);
                    }
                    // Time spent in the debugger is not real work.
                    stopwatch = Instant::now();
                    cycles_in_window = 0;
                }
            }

            let c1 = match self.step_cpus() {
                Ok(cycles) => cycles,
                Err(fault) => {
                    self.dump_state(&fault);
                    control.cancel();
                    return Err(fault);
                }
            };
            cycles_in_window += c1;

            if let Some(debugger) = self.debugger.as_mut() {
                debugger.after_step();
            }

            if cycles_in_window >= CYCLES_PER_VBLANK {
                let elapsed = stopwatch.elapsed();
                if elapsed < FRAME_INTERVAL {
                    std::thread::sleep(FRAME_INTERVAL - elapsed);
                }
                cycles_in_window = 0;
                stopwatch = Instant::now();
            }

            if let Err(fault) = self.handle_interrupts(c1) {
                self.dump_state(&fault);
                control.cancel();
                return Err(fault);
            }
        }
        Ok(())
    }

    /// Move the board onto its worker thread. Frames land in the
    /// returned handle's mailbox as BMP bytes.
    pub fn spawn(mut self) -> std::io::Result<EmulatorHandle> {
        let control = Arc::new(Control::default());
        let frames = Arc::new(FrameMailbox::default());
        let (sender, receiver) = sync_channel(COMMAND_QUEUE_DEPTH);

        let mailbox = Arc::clone(&frames);
        self.set_render_sink(Box::new(move |bmp: &[u8]| mailbox.publish(bmp.to_vec())));

        let thread_control = Arc::clone(&control);
        let thread = std::thread::Builder::new()
            .name("galaga-hw".into())
            .spawn(move || {
                let mut board = self;
                board.run(&thread_control, &receiver)
            })?;

        Ok(EmulatorHandle {
            control,
            frames,
            commands: sender,
            thread,
        })
    }
}

/// Host-side handle to a running board.
pub struct EmulatorHandle {
    pub control: Arc<Control>,
    pub frames: Arc<FrameMailbox>,
    commands: SyncSender<DebugCommand>,
    thread: JoinHandle<Result<(), StepFault>>,
}

impl EmulatorHandle {
    /// Queue a debug command; false when the queue is full or the
    /// hardware thread is gone.
    pub fn send(&self, command: DebugCommand) -> bool {
        self.commands.try_send(command).is_ok()
    }

    /// Request shutdown and wait for the loop to exit.
    pub fn shutdown(self) -> Result<(), StepFault> {
        self.control.cancel();
        self.join()
    }

    pub fn join(self) -> Result<(), StepFault> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(StepFault::Device {
                cpu: CpuId::Cpu1,
                reason: "hardware thread panicked".into(),
            }),
        }
    }
}
