//! Simulation of the Simulatron architecture.
//!
//! This module is focused on executing machine code on a fully built
//! machine: CPU, MMU, memory bus, and devices.
//!
//! It consists of:
//! - [`Simulator`]: the machine itself, with the fetch/decode/execute loop.
//! - [`mem`]: the physical memory bus and RAM providers.
//! - [`mmu`]: virtual address translation.
//! - [`intr`]: the interrupt controller.
//! - [`device`]: the memory-mapped device set.
//! - [`debug`]: breakpoints.

pub mod debug;
pub mod device;
pub mod intr;
pub mod mem;
pub mod mmu;


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, trace};

use self::debug::BreakpointList;
use self::device::timer::IntervalTimer;
use self::intr::{
    InterruptController, INT_DIV_ZERO, INT_ILLEGAL_OP, INT_PAGE_FAULT, INT_SYSCALL,
};
use self::mem::{MemBus, RamStrategy, Rom, ROM_BASE};
use self::mmu::{Intent, PageFaultCode};

/// The architecture revision this crate implements.
pub const ARCH_VERSION: &str = "2.0.0";

/// A failure during instruction execution.
///
/// Faults never surface to the host: the CPU rewinds the PC to the faulting
/// instruction and turns the fault into the matching guest interrupt at the
/// same instruction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Privilege violation, unmapped opcode, region permission violation,
    /// invalid register reference, or mismatched operand widths.
    IllegalOperation,
    /// Integer division or remainder by zero.
    DivideByZero,
    /// The MMU rejected a translation with the given code.
    PageFault(PageFaultCode),
}

/// Host-visible reasons the simulator stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimErr {
    /// Not an error, but HALT: the machine stopped cleanly and is
    /// terminal.
    Halted,
    /// A memory access faulted during interrupt entry. There is no way to
    /// recover; the machine halts.
    DoubleFault,
}

impl std::fmt::Display for SimErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimErr::Halted => f.write_str("machine halted"),
            SimErr::DoubleFault => f.write_str("double fault during interrupt entry"),
        }
    }
}
impl std::error::Error for SimErr {}

/// The width of a register or operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// 8-bit integer.
    Byte,
    /// 16-bit integer.
    Half,
    /// 32-bit integer.
    Word,
    /// IEEE-754 binary32.
    Float,
}

impl Width {
    /// The size in bytes of a value of this width.
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word | Width::Float => 4,
        }
    }
}

/// A value the machine can hold in a register or move through memory.
///
/// Floats bit-cast on their way through memory; no numeric conversion ever
/// happens outside SCONVERT/UCONVERT.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// 8-bit integer.
    Byte(u8),
    /// 16-bit integer.
    Half(u16),
    /// 32-bit integer.
    Word(u32),
    /// IEEE-754 binary32.
    Float(f32),
}

impl Value {
    /// The width of this value.
    pub fn width(self) -> Width {
        match self {
            Value::Byte(_) => Width::Byte,
            Value::Half(_) => Width::Half,
            Value::Word(_) => Width::Word,
            Value::Float(_) => Width::Float,
        }
    }

    fn size(self) -> u32 {
        self.width().bytes()
    }

    fn into_word(self) -> Result<u32, Fault> {
        match self {
            Value::Word(w) => Ok(w),
            _ => Err(Fault::IllegalOperation),
        }
    }

    fn into_half(self) -> Result<u16, Fault> {
        match self {
            Value::Half(h) => Ok(h),
            _ => Err(Fault::IllegalOperation),
        }
    }

    fn into_byte(self) -> Result<u8, Fault> {
        match self {
            Value::Byte(b) => Ok(b),
            _ => Err(Fault::IllegalOperation),
        }
    }

    fn into_float(self) -> Result<f32, Fault> {
        match self {
            Value::Float(x) => Ok(x),
            _ => Err(Fault::IllegalOperation),
        }
    }

    /// Is this an integer equal to zero? (Floats are never "integer zero";
    /// float division follows IEEE-754 instead of faulting.)
    fn is_integer_zero(self) -> bool {
        matches!(
            self,
            Value::Byte(0) | Value::Half(0) | Value::Word(0)
        )
    }

    fn wrapping_increment(self) -> Value {
        match self {
            Value::Byte(x) => Value::Byte(x.wrapping_add(1)),
            Value::Half(x) => Value::Half(x.wrapping_add(1)),
            Value::Word(x) => Value::Word(x.wrapping_add(1)),
            Value::Float(x) => Value::Float(x + 1.0),
        }
    }
}

/// A decoded register reference.
///
/// The wire encoding is one byte: `0x00`-`0x07` are `r0`-`r7`,
/// `0x08`-`0x0F` their 16-bit halves, `0x10`-`0x17` their low bytes,
/// `0x18`-`0x1F` the float registers, then FLAGS, USPR, KSPR, PDPR, IMR,
/// and PFSR at `0x20`-`0x25`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    /// Full 32 bits of a general-purpose register.
    R(u8),
    /// Lower 16 bits of a general-purpose register.
    Rh(u8),
    /// Lowest 8 bits of a general-purpose register.
    Rb(u8),
    /// A float register.
    F(u8),
    /// The FLAGS register.
    Flags,
    /// The user stack pointer.
    Uspr,
    /// The kernel stack pointer (privileged).
    Kspr,
    /// The page directory pointer (privileged).
    Pdpr,
    /// The interrupt mask register (privileged).
    Imr,
    /// The page fault status register (privileged, read-only).
    Pfsr,
}

impl Reg {
    /// Decodes a register reference byte.
    pub fn decode(byte: u8) -> Option<Reg> {
        match byte {
            0x00..=0x07 => Some(Reg::R(byte)),
            0x08..=0x0F => Some(Reg::Rh(byte - 0x08)),
            0x10..=0x17 => Some(Reg::Rb(byte - 0x10)),
            0x18..=0x1F => Some(Reg::F(byte - 0x18)),
            0x20 => Some(Reg::Flags),
            0x21 => Some(Reg::Uspr),
            0x22 => Some(Reg::Kspr),
            0x23 => Some(Reg::Pdpr),
            0x24 => Some(Reg::Imr),
            0x25 => Some(Reg::Pfsr),
            _ => None,
        }
    }

    /// The width of values this register holds.
    pub fn width(self) -> Width {
        match self {
            Reg::R(_) | Reg::Uspr | Reg::Kspr | Reg::Pdpr | Reg::Pfsr => Width::Word,
            Reg::Rh(_) | Reg::Flags | Reg::Imr => Width::Half,
            Reg::Rb(_) => Width::Byte,
            Reg::F(_) => Width::Float,
        }
    }
}

/// The FLAGS register.
///
/// Bit 0 is Z, bit 1 is N, bit 2 is C, bit 3 is O. Bit 15 is the
/// interrupt-entry mode bit: it always reads 0 and only ever appears set
/// in the copy pushed during interrupt entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u16);

impl Flags {
    /// Zero flag bit.
    pub const ZERO: u16 = 0x0001;
    /// Negative flag bit.
    pub const NEGATIVE: u16 = 0x0002;
    /// Carry flag bit.
    pub const CARRY: u16 = 0x0004;
    /// Overflow flag bit.
    pub const OVERFLOW: u16 = 0x0008;
    /// The interrupt-entry mode bit, set in a pushed FLAGS copy when the
    /// CPU was already in kernel mode.
    const ENTRY_MODE: u16 = 0x8000;

    /// The raw bits. Bit 15 is always clear here.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Installs guest-supplied bits, masking off bit 15.
    fn from_guest(bits: u16) -> Flags {
        Flags(bits & !Flags::ENTRY_MODE)
    }

    /// Whether the zero flag is set.
    pub fn zero(self) -> bool {
        self.0 & Flags::ZERO != 0
    }
    /// Whether the negative flag is set.
    pub fn negative(self) -> bool {
        self.0 & Flags::NEGATIVE != 0
    }
    /// Whether the carry flag is set.
    pub fn carry(self) -> bool {
        self.0 & Flags::CARRY != 0
    }
    /// Whether the overflow flag is set.
    pub fn overflow(self) -> bool {
        self.0 & Flags::OVERFLOW != 0
    }

    fn for_int(zero: bool, negative: bool, carry: bool, overflow: bool) -> Flags {
        let mut bits = 0;
        if zero {
            bits |= Flags::ZERO;
        } else if negative {
            bits |= Flags::NEGATIVE;
        }
        if carry {
            bits |= Flags::CARRY;
        }
        if overflow {
            bits |= Flags::OVERFLOW;
        }
        Flags(bits)
    }

    fn for_float(ans: f32) -> Flags {
        if ans == 0.0 {
            Flags(Flags::ZERO)
        } else if ans < 0.0 {
            Flags(Flags::NEGATIVE)
        } else {
            Flags(0)
        }
    }
}

/// Flag predicates for the conditional jumps.
#[derive(Debug, Clone, Copy)]
enum Cond {
    Equal,
    NotEqual,
    SGreater,
    SGreaterEq,
    UGreater,
    UGreaterEq,
    SLess,
    SLessEq,
    ULess,
    ULessEq,
}

/// Indexed by `(opcode - 0x54) / 2`.
const COND_TABLE: [Cond; 10] = [
    Cond::Equal,
    Cond::NotEqual,
    Cond::SGreater,
    Cond::SGreaterEq,
    Cond::UGreater,
    Cond::UGreaterEq,
    Cond::SLess,
    Cond::SLessEq,
    Cond::ULess,
    Cond::ULessEq,
];

impl Cond {
    fn holds(self, f: Flags) -> bool {
        match self {
            Cond::Equal => f.zero(),
            Cond::NotEqual => !f.zero(),
            Cond::SGreater => !f.zero() && (f.negative() == f.overflow()),
            Cond::SGreaterEq => f.zero() || (f.negative() == f.overflow()),
            Cond::UGreater => !f.carry() && !f.zero(),
            Cond::UGreaterEq => !f.carry() || f.zero(),
            Cond::SLess => f.negative() != f.overflow(),
            Cond::SLessEq => f.zero() || (f.negative() != f.overflow()),
            Cond::ULess => f.carry(),
            Cond::ULessEq => f.carry() || f.zero(),
        }
    }
}

/// What the executed instruction asks of the step loop.
enum Exec {
    Continue,
    Halt,
    Pause,
}

/// Configuration for [`Simulator::new`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// Which RAM provider to build the machine with.
    pub ram: RamStrategy,
}

/// Rotates `value` (a `bits`-wide integer) together with the carry flag,
/// treating carry as one extra bit adjacent to the top of the register.
fn rotate_with_carry(value: u64, carry: bool, bits: u32, left: bool, count: u32) -> (u64, bool) {
    let ring = bits + 1;
    let n = count % ring;
    let n = if left { n } else { (ring - n) % ring };
    let v = (u64::from(carry) << bits) | value;
    let mask = (1u64 << ring) - 1;
    let r = ((v << n) | (v >> ((ring - n) % ring))) & mask;
    (r & ((1u64 << bits) - 1), (r >> bits) & 1 == 1)
}

/// Applies an overflowing integer operation across the three widths (and a
/// float operation), computing carry from the unsigned view and overflow
/// from the signed view.
macro_rules! arith {
    ($self:ident, $dest:ident, $value:ident, $op:ident, $float:tt) => {{
        let (result, flags) = match ($self.read_reg($dest)?, $value) {
            (Value::Byte(x), Value::Byte(y)) => {
                let (u, carry) = x.$op(y);
                let (s, overflow) = (x as i8).$op(y as i8);
                (Value::Byte(u), Flags::for_int(s == 0, s < 0, carry, overflow))
            }
            (Value::Half(x), Value::Half(y)) => {
                let (u, carry) = x.$op(y);
                let (s, overflow) = (x as i16).$op(y as i16);
                (Value::Half(u), Flags::for_int(s == 0, s < 0, carry, overflow))
            }
            (Value::Word(x), Value::Word(y)) => {
                let (u, carry) = x.$op(y);
                let (s, overflow) = (x as i32).$op(y as i32);
                (Value::Word(u), Flags::for_int(s == 0, s < 0, carry, overflow))
            }
            (Value::Float(x), Value::Float(y)) => {
                let ans = x $float y;
                (Value::Float(ans), Flags::for_float(ans))
            }
            _ => return Err(Fault::IllegalOperation),
        };
        $self.write_reg($dest, result)?;
        $self.flags = flags;
        Ok(())
    }};
}

/// A signed division-family operation: carry is cleared, overflow comes
/// from the signed operation. Floats follow IEEE-754.
macro_rules! signed_div {
    ($self:ident, $dest:ident, $value:ident, $op:ident, $float:tt) => {{
        let (result, flags) = match ($self.read_reg($dest)?, $value) {
            (Value::Byte(x), Value::Byte(y)) => {
                let (s, overflow) = (x as i8).$op(y as i8);
                (Value::Byte(s as u8), Flags::for_int(s == 0, s < 0, false, overflow))
            }
            (Value::Half(x), Value::Half(y)) => {
                let (s, overflow) = (x as i16).$op(y as i16);
                (Value::Half(s as u16), Flags::for_int(s == 0, s < 0, false, overflow))
            }
            (Value::Word(x), Value::Word(y)) => {
                let (s, overflow) = (x as i32).$op(y as i32);
                (Value::Word(s as u32), Flags::for_int(s == 0, s < 0, false, overflow))
            }
            (Value::Float(x), Value::Float(y)) => {
                let ans = x $float y;
                (Value::Float(ans), Flags::for_float(ans))
            }
            _ => return Err(Fault::IllegalOperation),
        };
        $self.write_reg($dest, result)?;
        $self.flags = flags;
        Ok(())
    }};
}

/// An unsigned division-family operation: overflow is cleared. Integer
/// registers only.
macro_rules! unsigned_div {
    ($self:ident, $dest:ident, $value:ident, $op:ident) => {{
        let (result, flags) = match ($self.read_reg($dest)?, $value) {
            (Value::Byte(x), Value::Byte(y)) => {
                let (u, carry) = x.$op(y);
                (Value::Byte(u), Flags::for_int(u == 0, (u as i8) < 0, carry, false))
            }
            (Value::Half(x), Value::Half(y)) => {
                let (u, carry) = x.$op(y);
                (Value::Half(u), Flags::for_int(u == 0, (u as i16) < 0, carry, false))
            }
            (Value::Word(x), Value::Word(y)) => {
                let (u, carry) = x.$op(y);
                (Value::Word(u), Flags::for_int(u == 0, (u as i32) < 0, carry, false))
            }
            _ => return Err(Fault::IllegalOperation),
        };
        $self.write_reg($dest, result)?;
        $self.flags = flags;
        Ok(())
    }};
}

/// A bitwise operation: sets Z and N, clears C and O. Integer registers
/// only.
macro_rules! bitwise {
    ($self:ident, $dest:ident, $value:ident, $op:tt) => {{
        let (result, flags) = match ($self.read_reg($dest)?, $value) {
            (Value::Byte(x), Value::Byte(y)) => {
                let ans = x $op y;
                (Value::Byte(ans), Flags::for_int(ans == 0, (ans as i8) < 0, false, false))
            }
            (Value::Half(x), Value::Half(y)) => {
                let ans = x $op y;
                (Value::Half(ans), Flags::for_int(ans == 0, (ans as i16) < 0, false, false))
            }
            (Value::Word(x), Value::Word(y)) => {
                let ans = x $op y;
                (Value::Word(ans), Flags::for_int(ans == 0, (ans as i32) < 0, false, false))
            }
            _ => return Err(Fault::IllegalOperation),
        };
        $self.write_reg($dest, result)?;
        $self.flags = flags;
        Ok(())
    }};
}

/// One width of a shift: returns `(answer, carry)`, where the carry is
/// the last bit shifted out (0 once only zeros remain).
macro_rules! shifted {
    ($x:expr, $n:expr, $u:ty, $s:ty, $kind:expr) => {{
        let x = $x;
        let n = u32::from($n);
        let bits = <$u>::BITS;
        match $kind {
            Shift::Left => {
                if n == 0 {
                    (x, false)
                } else if n < bits {
                    (x << n, (x >> (bits - n)) & 1 == 1)
                } else if n == bits {
                    (0, x & 1 == 1)
                } else {
                    (0, false)
                }
            }
            Shift::LogicalRight => {
                if n == 0 {
                    (x, false)
                } else if n < bits {
                    (x >> n, (x >> (n - 1)) & 1 == 1)
                } else if n == bits {
                    (0, x >> (bits - 1) == 1)
                } else {
                    (0, false)
                }
            }
            Shift::ArithmeticRight => {
                let sign = (x as $s) < 0;
                if n == 0 {
                    (x, false)
                } else if n < bits {
                    (((x as $s) >> n) as $u, (x >> (n - 1)) & 1 == 1)
                } else {
                    (if sign { <$u>::MAX } else { 0 }, sign)
                }
            }
        }
    }};
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shift {
    Left,
    LogicalRight,
    ArithmeticRight,
}

/// The Simulatron machine: CPU core, MMU, memory bus, and devices.
///
/// A fresh machine boots in kernel mode with every register zero and the
/// PC at the start of ROM. Load a [`Rom`] image, mount disk media through
/// [`MemBus::disk_a_mut`]/[`MemBus::disk_b_mut`], then call
/// [`Simulator::run`].
///
/// The machine executes on the calling thread. Devices (and any host
/// thread holding a [`KeyboardHandle`]) latch interrupts concurrently via
/// the shared [`InterruptController`]; the CPU drains the highest-priority
/// unmasked interrupt between instructions. Another thread may stop a
/// running machine by clearing the [`Simulator::mcr`] flag and kicking
/// the controller (see [`Simulator::mcr`]).
///
/// [`KeyboardHandle`]: device::keyboard::KeyboardHandle
pub struct Simulator {
    /// The memory bus, owning RAM, ROM, the interrupt vector, and every
    /// device register.
    pub mem: MemBus,

    /// Breakpoints checked between instructions by the `run` family.
    pub breakpoints: BreakpointList,

    /// The number of instructions retired since boot or reset.
    ///
    /// This may be set to 0 to reset the counter.
    pub instructions_run: u64,

    // Architectural state.
    r: [u32; 8],
    f: [f32; 8],
    flags: Flags,
    uspr: u32,
    kspr: u32,
    pdpr: u32,
    imr: u16,
    pfsr: u32,
    pc: u32,
    kernel_mode: bool,
    halted: bool,
    paused: bool,
    last_iret: bool,

    // Host-side wiring.
    config: SimConfig,
    intr: Arc<InterruptController>,
    timer: IntervalTimer,
    mcr: Arc<AtomicBool>,
    hit_breakpoint: bool,
}

impl Simulator {
    /// Creates a machine in the boot state, with a zeroed ROM and no disk
    /// media.
    pub fn new(config: SimConfig) -> Self {
        let intr = Arc::new(InterruptController::new());
        Self {
            mem: MemBus::new(Arc::clone(&intr), config.ram.build()),
            breakpoints: BreakpointList::new(),
            instructions_run: 0,
            r: [0; 8],
            f: [0.0; 8],
            flags: Flags::default(),
            uspr: 0,
            kspr: 0,
            pdpr: 0,
            imr: 0,
            pfsr: 0,
            pc: ROM_BASE,
            kernel_mode: true,
            halted: false,
            paused: false,
            last_iret: false,
            config,
            timer: IntervalTimer::spawn(Arc::clone(&intr)),
            intr,
            mcr: Arc::default(),
            hit_breakpoint: false,
        }
    }

    /// Installs a boot ROM image.
    pub fn load_rom(&mut self, rom: Rom) {
        self.mem.set_rom(rom);
    }

    /// Returns the machine to the boot state.
    ///
    /// RAM, the interrupt vector, all registers, the pending-interrupt
    /// set, and the timer reset; the ROM image, mounted disk media, device
    /// registers, breakpoints, and any host handles are preserved.
    pub fn reset(&mut self) {
        self.mem.reset(self.config.ram.build());
        self.intr.clear_all();
        self.timer.set_period(0);
        self.r = [0; 8];
        self.f = [0.0; 8];
        self.flags = Flags::default();
        self.uspr = 0;
        self.kspr = 0;
        self.pdpr = 0;
        self.imr = 0;
        self.pfsr = 0;
        self.pc = ROM_BASE;
        self.kernel_mode = true;
        self.halted = false;
        self.paused = false;
        self.last_iret = false;
        self.hit_breakpoint = false;
        self.instructions_run = 0;
    }

    // ------------------------------------------------------------------
    // Host-side accessors.
    // ------------------------------------------------------------------

    /// The program counter.
    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Sets the program counter.
    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    /// The FLAGS register.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Whether the CPU is in kernel mode.
    pub fn kernel_mode(&self) -> bool {
        self.kernel_mode
    }

    /// Whether the machine has halted (terminal).
    pub fn halted(&self) -> bool {
        self.halted
    }

    /// Whether the machine is paused awaiting an interrupt.
    pub fn paused(&self) -> bool {
        self.paused
    }

    /// Reads general-purpose register `n` (0-7).
    pub fn gpr(&self, n: u8) -> u32 {
        self.r[usize::from(n)]
    }

    /// Writes general-purpose register `n` (0-7).
    pub fn set_gpr(&mut self, n: u8, value: u32) {
        self.r[usize::from(n)] = value;
    }

    /// Reads float register `n` (0-7).
    pub fn fpr(&self, n: u8) -> f32 {
        self.f[usize::from(n)]
    }

    /// Writes float register `n` (0-7).
    pub fn set_fpr(&mut self, n: u8, value: f32) {
        self.f[usize::from(n)] = value;
    }

    /// The user stack pointer.
    pub fn uspr(&self) -> u32 {
        self.uspr
    }

    /// Sets the user stack pointer.
    pub fn set_uspr(&mut self, value: u32) {
        self.uspr = value;
    }

    /// The kernel stack pointer.
    pub fn kspr(&self) -> u32 {
        self.kspr
    }

    /// Sets the kernel stack pointer.
    pub fn set_kspr(&mut self, value: u32) {
        self.kspr = value;
    }

    /// The page directory pointer register.
    pub fn pdpr(&self) -> u32 {
        self.pdpr
    }

    /// Sets the page directory pointer register.
    pub fn set_pdpr(&mut self, value: u32) {
        self.pdpr = value;
    }

    /// The interrupt mask register.
    pub fn imr(&self) -> u16 {
        self.imr
    }

    /// Sets the interrupt mask register.
    pub fn set_imr(&mut self, value: u16) {
        self.imr = value;
    }

    /// The page fault status register.
    pub fn pfsr(&self) -> u32 {
        self.pfsr
    }

    /// The interrupt controller shared by the CPU and devices.
    ///
    /// Host code can latch an interrupt directly with
    /// [`InterruptController::raise`]; it will be serviced at the next
    /// instruction boundary once its IMR bit is set.
    pub fn interrupts(&self) -> &Arc<InterruptController> {
        &self.intr
    }

    /// Machine control: while the `run` family executes, this is true.
    ///
    /// Clearing it from another thread stops execution at the next
    /// instruction boundary. Follow the store with
    /// [`InterruptController::kick`] on [`Simulator::interrupts`] so a
    /// paused CPU wakes immediately rather than at its next poll.
    pub fn mcr(&self) -> &Arc<AtomicBool> {
        &self.mcr
    }

    /// Indicates whether the last `run` stopped on a breakpoint.
    pub fn hit_breakpoint(&self) -> bool {
        self.hit_breakpoint
    }

    // ------------------------------------------------------------------
    // Execution.
    // ------------------------------------------------------------------

    /// Runs until the tripwire returns false, HALT executes, the MCR is
    /// cleared, a breakpoint matches, or a double fault occurs.
    pub fn run_while(
        &mut self,
        mut tripwire: impl FnMut(&mut Simulator) -> bool,
    ) -> Result<(), SimErr> {
        self.hit_breakpoint = false;
        self.mcr.store(true, Ordering::Relaxed);
        info!("CPU running.");

        let result = 'outer: {
            while self.mcr.load(Ordering::Relaxed) && tripwire(self) {
                match self.step() {
                    Ok(()) => {}
                    Err(SimErr::Halted) => break,
                    Err(e) => break 'outer Err(e),
                }

                if self.breakpoints.values().any(|bp| bp.check(self)) {
                    debug!("Breakpoint hit at {:#010X}.", self.pc);
                    self.hit_breakpoint = true;
                    break;
                }
            }
            Ok(())
        };

        self.mcr.store(false, Ordering::Release);
        // Any wait still parked on the controller must see the cleared
        // flag.
        self.intr.kick();
        info!("CPU stopped.");
        result
    }

    /// Runs the machine to completion.
    pub fn run(&mut self) -> Result<(), SimErr> {
        self.run_while(|_| true)
    }

    /// Runs with a limit on the number of retired instructions.
    pub fn run_with_limit(&mut self, max_steps: u64) -> Result<(), SimErr> {
        let start = self.instructions_run;
        self.run_while(|sim| sim.instructions_run.wrapping_sub(start) < max_steps)
    }

    /// Simulates one step: either one interrupt entry or one instruction.
    ///
    /// Unlike the internal step, this swallows the `Halted` marker so that
    /// stepping a halting program is not an error. A paused machine only
    /// blocks for interrupts inside the `run` family; stepped manually it
    /// services a pending interrupt if there is one and otherwise returns
    /// without progress.
    pub fn step_in(&mut self) -> Result<(), SimErr> {
        match self.step() {
            Err(SimErr::Halted) => Ok(()),
            r => r,
        }
    }

    fn step(&mut self) -> Result<(), SimErr> {
        if self.halted {
            return Err(SimErr::Halted);
        }

        if self.paused {
            return match self.intr.wait_take(self.imr, &self.mcr) {
                Some(n) => {
                    self.paused = false;
                    self.enter_interrupt(n)
                }
                None => Ok(()),
            };
        }

        if let Some(n) = self.intr.try_take(self.imr) {
            return self.enter_interrupt(n);
        }

        let instr_pc = self.pc;
        let after_iret = self.last_iret;
        self.last_iret = false;

        match self.exec_instr(after_iret) {
            Ok(Exec::Continue) => {
                self.instructions_run = self.instructions_run.wrapping_add(1);
                Ok(())
            }
            Ok(Exec::Halt) => {
                info!("CPU halting.");
                self.halted = true;
                self.instructions_run = self.instructions_run.wrapping_add(1);
                Err(SimErr::Halted)
            }
            Ok(Exec::Pause) => {
                debug!("CPU pausing.");
                self.paused = true;
                self.instructions_run = self.instructions_run.wrapping_add(1);
                Ok(())
            }
            Err(fault) => {
                // The instruction did not retire: the PC rewinds to it and
                // the fault is delivered as an interrupt.
                self.last_iret = after_iret;
                self.pc = instr_pc;
                self.publish_fault(fault);
                Ok(())
            }
        }
    }

    fn publish_fault(&mut self, fault: Fault) {
        debug!("Fault at {:#010X}: {fault:?}", self.pc);
        match fault {
            Fault::IllegalOperation => self.intr.raise(INT_ILLEGAL_OP),
            Fault::DivideByZero => self.intr.raise(INT_DIV_ZERO),
            Fault::PageFault(code) => {
                self.pfsr = code as u32;
                self.intr.raise(INT_PAGE_FAULT);
            }
        }
    }

    /// Pushes the interrupt frame and jumps through the vector.
    ///
    /// Observable as a single step: either the whole frame (FLAGS with the
    /// entry-mode bit, return PC, IMR) lands and the PC moves, or the
    /// machine halts with a double fault.
    fn enter_interrupt(&mut self, n: u8) -> Result<(), SimErr> {
        trace!("Entering interrupt {n}.");
        let entry_mode = if self.kernel_mode {
            Flags::ENTRY_MODE
        } else {
            0
        };
        self.kernel_mode = true;

        match self.interrupt_frame(n, entry_mode) {
            Ok(handler) => {
                self.imr = 0;
                self.pc = handler;
                Ok(())
            }
            Err(_) => {
                info!("Fault during entry to interrupt {n}; halting.");
                self.halted = true;
                Err(SimErr::DoubleFault)
            }
        }
    }

    fn interrupt_frame(&mut self, n: u8, entry_mode: u16) -> Result<u32, Fault> {
        self.push(Value::Half(self.flags.bits() | entry_mode))?;
        self.push(Value::Word(self.pc))?;
        self.push(Value::Half(self.imr))?;
        // The vector lives at physical n*4 regardless of mode.
        self.mem.load_word(u32::from(n) * 4)
    }

    // ------------------------------------------------------------------
    // The address path.
    // ------------------------------------------------------------------

    /// One byte through the address path: translated in user mode, direct
    /// to the bus in kernel mode.
    fn mem_load(&mut self, addr: u32, intent: Intent) -> Result<u8, Fault> {
        if self.kernel_mode {
            self.mem.load(addr)
        } else {
            let physical = mmu::translate(&self.mem, self.pdpr, addr, intent)?;
            self.mem.load(physical)
        }
    }

    fn mem_store(&mut self, addr: u32, value: u8) -> Result<(), Fault> {
        if self.kernel_mode {
            self.mem.store(addr, value)
        } else {
            let physical = mmu::translate(&self.mem, self.pdpr, addr, Intent::Write)?;
            self.mem.store(physical, value)
        }
    }

    /// Loads a typed value big-endian, translating each byte separately so
    /// that accesses may straddle page boundaries.
    fn load_value(&mut self, addr: u32, width: Width, intent: Intent) -> Result<Value, Fault> {
        let mut bytes = [0u8; 4];
        let size = width.bytes() as usize;
        for (i, b) in bytes[..size].iter_mut().enumerate() {
            *b = self.mem_load(addr.wrapping_add(i as u32), intent)?;
        }
        Ok(match width {
            Width::Byte => Value::Byte(bytes[0]),
            Width::Half => Value::Half(u16::from_be_bytes([bytes[0], bytes[1]])),
            Width::Word => Value::Word(u32::from_be_bytes(bytes)),
            Width::Float => Value::Float(f32::from_bits(u32::from_be_bytes(bytes))),
        })
    }

    fn store_value(&mut self, addr: u32, value: Value) -> Result<(), Fault> {
        let (bytes, size): ([u8; 4], usize) = match value {
            Value::Byte(x) => ([x, 0, 0, 0], 1),
            Value::Half(x) => {
                let [a, b] = x.to_be_bytes();
                ([a, b, 0, 0], 2)
            }
            Value::Word(x) => (x.to_be_bytes(), 4),
            // Floats reinterpret as raw bits; no conversion.
            Value::Float(x) => (x.to_bits().to_be_bytes(), 4),
        };
        for (i, b) in bytes[..size].iter().enumerate() {
            self.mem_store(addr.wrapping_add(i as u32), *b)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operand fetch.
    // ------------------------------------------------------------------

    fn fetch_byte(&mut self) -> Result<u8, Fault> {
        let byte = self.mem_load(self.pc, Intent::Fetch)?;
        self.pc = self.pc.wrapping_add(1);
        Ok(byte)
    }

    fn fetch_value(&mut self, width: Width) -> Result<Value, Fault> {
        let value = self.load_value(self.pc, width, Intent::Fetch)?;
        self.pc = self.pc.wrapping_add(width.bytes());
        Ok(value)
    }

    fn fetch_word(&mut self) -> Result<u32, Fault> {
        self.fetch_value(Width::Word)?.into_word()
    }

    fn fetch_reg(&mut self) -> Result<Reg, Fault> {
        let byte = self.fetch_byte()?;
        Reg::decode(byte).ok_or_else(|| {
            trace!("Invalid register reference {byte:#04x}.");
            Fault::IllegalOperation
        })
    }

    /// Fetches a register reference that must be integer-typed.
    fn fetch_int_reg(&mut self) -> Result<Reg, Fault> {
        let reg = self.fetch_reg()?;
        if reg.width() == Width::Float {
            trace!("Float register where an integer one is required.");
            return Err(Fault::IllegalOperation);
        }
        Ok(reg)
    }

    /// A 32-bit operand: a literal word, or the contents of a word-typed
    /// register.
    fn word_operand(&mut self, by_ref: bool) -> Result<u32, Fault> {
        if by_ref {
            let reg = self.fetch_reg()?;
            self.read_reg(reg)?.into_word()
        } else {
            self.fetch_word()
        }
    }

    /// An 8-bit operand: a literal byte, or the contents of a byte-typed
    /// register.
    fn byte_operand(&mut self, by_ref: bool) -> Result<u8, Fault> {
        if by_ref {
            let reg = self.fetch_reg()?;
            self.read_reg(reg)?.into_byte()
        } else {
            self.fetch_byte()
        }
    }

    /// Fetches a destination and source register of matching width and
    /// reads the source.
    fn reg_pair(&mut self) -> Result<(Reg, Value), Fault> {
        let dest = self.fetch_reg()?;
        let source = self.fetch_reg()?;
        if dest.width() != source.width() {
            trace!("Mismatched operand widths: {dest:?} vs {source:?}.");
            return Err(Fault::IllegalOperation);
        }
        let value = self.read_reg(source)?;
        Ok((dest, value))
    }

    /// [`Simulator::reg_pair`], additionally rejecting float registers.
    fn int_reg_pair(&mut self) -> Result<(Reg, Value), Fault> {
        let (dest, value) = self.reg_pair()?;
        if dest.width() == Width::Float {
            return Err(Fault::IllegalOperation);
        }
        Ok((dest, value))
    }

    // ------------------------------------------------------------------
    // The register file.
    // ------------------------------------------------------------------

    fn require_kernel(&self) -> Result<(), Fault> {
        if self.kernel_mode {
            Ok(())
        } else {
            trace!("Privilege violation.");
            Err(Fault::IllegalOperation)
        }
    }

    fn read_reg(&mut self, reg: Reg) -> Result<Value, Fault> {
        match reg {
            Reg::R(n) => Ok(Value::Word(self.r[usize::from(n)])),
            Reg::Rh(n) => Ok(Value::Half(self.r[usize::from(n)] as u16)),
            Reg::Rb(n) => Ok(Value::Byte(self.r[usize::from(n)] as u8)),
            Reg::F(n) => Ok(Value::Float(self.f[usize::from(n)])),
            Reg::Flags => Ok(Value::Half(self.flags.bits())),
            Reg::Uspr => Ok(Value::Word(self.uspr)),
            Reg::Kspr => {
                self.require_kernel()?;
                Ok(Value::Word(self.kspr))
            }
            Reg::Pdpr => {
                self.require_kernel()?;
                Ok(Value::Word(self.pdpr))
            }
            Reg::Imr => {
                self.require_kernel()?;
                Ok(Value::Half(self.imr))
            }
            Reg::Pfsr => {
                self.require_kernel()?;
                Ok(Value::Word(self.pfsr))
            }
        }
    }

    /// Writes a value to a register. Sub-registers modify only their own
    /// bits. The value's width must match the register's.
    fn write_reg(&mut self, reg: Reg, value: Value) -> Result<(), Fault> {
        match (reg, value) {
            (Reg::R(n), Value::Word(w)) => self.r[usize::from(n)] = w,
            (Reg::Rh(n), Value::Half(h)) => {
                let r = &mut self.r[usize::from(n)];
                *r = (*r & 0xFFFF_0000) | u32::from(h);
            }
            (Reg::Rb(n), Value::Byte(b)) => {
                let r = &mut self.r[usize::from(n)];
                *r = (*r & 0xFFFF_FF00) | u32::from(b);
            }
            (Reg::F(n), Value::Float(x)) => self.f[usize::from(n)] = x,
            (Reg::Flags, Value::Half(h)) => self.flags = Flags::from_guest(h),
            (Reg::Uspr, Value::Word(w)) => self.uspr = w,
            (Reg::Kspr, Value::Word(w)) => {
                self.require_kernel()?;
                self.kspr = w;
            }
            (Reg::Pdpr, Value::Word(w)) => {
                self.require_kernel()?;
                self.pdpr = w;
            }
            (Reg::Imr, Value::Half(h)) => {
                self.require_kernel()?;
                self.imr = h;
            }
            (Reg::Pfsr, _) => {
                trace!("PFSR is read-only.");
                return Err(Fault::IllegalOperation);
            }
            _ => {
                trace!("Width mismatch writing {value:?} to {reg:?}.");
                return Err(Fault::IllegalOperation);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // The stack.
    // ------------------------------------------------------------------

    fn active_sp(&self) -> u32 {
        if self.kernel_mode {
            self.kspr
        } else {
            self.uspr
        }
    }

    fn set_active_sp(&mut self, sp: u32) {
        if self.kernel_mode {
            self.kspr = sp;
        } else {
            self.uspr = sp;
        }
    }

    /// Decrements the active stack pointer by the value's width and stores
    /// it there. The pointer only moves once the store has succeeded, so a
    /// faulted push restarts cleanly.
    fn push(&mut self, value: Value) -> Result<(), Fault> {
        let sp = self.active_sp().wrapping_sub(value.size());
        self.store_value(sp, value)?;
        self.set_active_sp(sp);
        Ok(())
    }

    /// Loads a value from the active stack pointer, then increments it.
    fn pop(&mut self, width: Width) -> Result<Value, Fault> {
        let sp = self.active_sp();
        let value = self.load_value(sp, width, Intent::Read)?;
        self.set_active_sp(sp.wrapping_add(width.bytes()));
        Ok(value)
    }

    fn pop_word(&mut self) -> Result<u32, Fault> {
        self.pop(Width::Word)?.into_word()
    }

    fn pop_half(&mut self) -> Result<u16, Fault> {
        self.pop(Width::Half)?.into_half()
    }

    // ------------------------------------------------------------------
    // Decode and execute.
    // ------------------------------------------------------------------

    /// Fetches, decodes, and executes one instruction.
    ///
    /// `after_iret` reports whether the previously retired instruction was
    /// IRETURN; PAUSE consults it to close the enable-then-wait race.
    fn exec_instr(&mut self, after_iret: bool) -> Result<Exec, Fault> {
        let opcode = self.fetch_byte()?;
        match opcode {
            0x00 => {
                // HALT
                trace!("HALT");
                self.require_kernel()?;
                return Ok(Exec::Halt);
            }
            0x01 => {
                // PAUSE
                trace!("PAUSE");
                self.require_kernel()?;
                // Immediately after IRETURN, PAUSE completes without
                // waiting.
                return Ok(if after_iret {
                    Exec::Continue
                } else {
                    Exec::Pause
                });
            }
            0x02 | 0x03 => {
                // TIMER
                self.require_kernel()?;
                let millis = self.word_operand(opcode == 0x03)?;
                trace!("TIMER {millis}ms");
                self.timer.set_period(millis);
            }
            0x04 => {
                // USERMODE
                trace!("USERMODE");
                self.require_kernel()?;
                let target = self.pop_word()?;
                self.flags = Flags::default();
                self.kernel_mode = false;
                self.pc = target;
            }
            0x05 => {
                // IRETURN
                trace!("IRETURN");
                self.require_kernel()?;
                self.instr_ireturn()?;
            }
            0x06 | 0x07 => {
                // LOAD
                let dest = self.fetch_reg()?;
                let addr = self.word_operand(opcode == 0x07)?;
                trace!("LOAD {dest:?} from {addr:#010X}");
                let value = self.load_value(addr, dest.width(), Intent::Read)?;
                self.write_reg(dest, value)?;
            }
            0x08 | 0x09 => {
                // STORE
                let addr = self.word_operand(opcode == 0x09)?;
                let source = self.fetch_reg()?;
                trace!("STORE {source:?} to {addr:#010X}");
                let value = self.read_reg(source)?;
                self.store_value(addr, value)?;
            }
            0x0A => {
                // COPY ref literal
                let dest = self.fetch_reg()?;
                let value = self.fetch_value(dest.width())?;
                trace!("COPY {value:?} into {dest:?}");
                self.write_reg(dest, value)?;
            }
            0x0B => {
                // COPY ref ref
                let (dest, value) = self.reg_pair()?;
                trace!("COPY {value:?} into {dest:?}");
                self.write_reg(dest, value)?;
            }
            0x0C | 0x0D => {
                // SWAP: one memory access of register width, atomic with
                // respect to device observers.
                let reg = self.fetch_reg()?;
                let addr = self.word_operand(opcode == 0x0D)?;
                trace!("SWAP {reg:?} with {addr:#010X}");
                let reg_value = self.read_reg(reg)?;
                let mem_value = self.load_value(addr, reg_value.width(), Intent::Read)?;
                self.store_value(addr, reg_value)?;
                self.write_reg(reg, mem_value)?;
            }
            0x0E => {
                // PUSH
                let reg = self.fetch_reg()?;
                trace!("PUSH {reg:?}");
                let value = self.read_reg(reg)?;
                self.push(value)?;
            }
            0x0F => {
                // POP
                let reg = self.fetch_reg()?;
                trace!("POP {reg:?}");
                let value = self.pop(reg.width())?;
                self.write_reg(reg, value)?;
            }
            0x10..=0x17 => {
                // BLOCKCOPY; low opcode bits select ref operands.
                let length = self.word_operand(opcode & 0b100 != 0)?;
                let dest = self.word_operand(opcode & 0b010 != 0)?;
                let source = self.word_operand(opcode & 0b001 != 0)?;
                trace!("BLOCKCOPY {length} bytes {source:#010X} -> {dest:#010X}");
                for i in 0..length {
                    let byte = self.mem_load(source.wrapping_add(i), Intent::Read)?;
                    self.mem_store(dest.wrapping_add(i), byte)?;
                }
            }
            0x18..=0x1F => {
                // BLOCKSET
                let length = self.word_operand(opcode & 0b100 != 0)?;
                let dest = self.word_operand(opcode & 0b010 != 0)?;
                let value = self.byte_operand(opcode & 0b001 != 0)?;
                trace!("BLOCKSET {length} bytes of {value:#04x} at {dest:#010X}");
                for i in 0..length {
                    self.mem_store(dest.wrapping_add(i), value)?;
                }
            }
            0x20 => {
                // NEGATE
                let reg = self.fetch_reg()?;
                trace!("NEGATE {reg:?}");
                let negated = match self.read_reg(reg)? {
                    Value::Byte(x) => Value::Byte((x as i8).wrapping_neg() as u8),
                    Value::Half(x) => Value::Half((x as i16).wrapping_neg() as u16),
                    Value::Word(x) => Value::Word((x as i32).wrapping_neg() as u32),
                    Value::Float(x) => Value::Float(-x),
                };
                self.write_reg(reg, negated)?;
            }
            0x21 => {
                let dest = self.fetch_reg()?;
                let value = self.fetch_value(dest.width())?;
                self.instr_add(dest, value, false)?;
            }
            0x22 => {
                let (dest, value) = self.reg_pair()?;
                self.instr_add(dest, value, false)?;
            }
            0x23 => {
                let dest = self.fetch_int_reg()?;
                let value = self.fetch_value(dest.width())?;
                self.instr_add(dest, value, true)?;
            }
            0x24 => {
                let (dest, value) = self.int_reg_pair()?;
                self.instr_add(dest, value, true)?;
            }
            0x25 => {
                let dest = self.fetch_reg()?;
                let value = self.fetch_value(dest.width())?;
                self.instr_sub(dest, value, false)?;
            }
            0x26 => {
                let (dest, value) = self.reg_pair()?;
                self.instr_sub(dest, value, false)?;
            }
            0x27 => {
                let dest = self.fetch_int_reg()?;
                let value = self.fetch_value(dest.width())?;
                self.instr_sub(dest, value, true)?;
            }
            0x28 => {
                let (dest, value) = self.int_reg_pair()?;
                self.instr_sub(dest, value, true)?;
            }
            0x29 => {
                let dest = self.fetch_reg()?;
                let value = self.fetch_value(dest.width())?;
                self.instr_mult(dest, value)?;
            }
            0x2A => {
                let (dest, value) = self.reg_pair()?;
                self.instr_mult(dest, value)?;
            }
            0x2B => {
                let dest = self.fetch_reg()?;
                let value = self.fetch_value(dest.width())?;
                self.instr_sdiv(dest, value)?;
            }
            0x2C => {
                let (dest, value) = self.reg_pair()?;
                self.instr_sdiv(dest, value)?;
            }
            0x2D => {
                let dest = self.fetch_int_reg()?;
                let value = self.fetch_value(dest.width())?;
                self.instr_udiv(dest, value)?;
            }
            0x2E => {
                let (dest, value) = self.int_reg_pair()?;
                self.instr_udiv(dest, value)?;
            }
            0x2F => {
                let dest = self.fetch_reg()?;
                let value = self.fetch_value(dest.width())?;
                self.instr_srem(dest, value)?;
            }
            0x30 => {
                let (dest, value) = self.reg_pair()?;
                self.instr_srem(dest, value)?;
            }
            0x31 => {
                let dest = self.fetch_int_reg()?;
                let value = self.fetch_value(dest.width())?;
                self.instr_urem(dest, value)?;
            }
            0x32 => {
                let (dest, value) = self.int_reg_pair()?;
                self.instr_urem(dest, value)?;
            }
            0x33 => {
                // NOT
                let reg = self.fetch_int_reg()?;
                trace!("NOT {reg:?}");
                self.instr_not(reg)?;
            }
            0x34 => {
                let dest = self.fetch_int_reg()?;
                let value = self.fetch_value(dest.width())?;
                bitwise!(self, dest, value, &)?;
            }
            0x35 => {
                let (dest, value) = self.int_reg_pair()?;
                bitwise!(self, dest, value, &)?;
            }
            0x36 => {
                let dest = self.fetch_int_reg()?;
                let value = self.fetch_value(dest.width())?;
                bitwise!(self, dest, value, |)?;
            }
            0x37 => {
                let (dest, value) = self.int_reg_pair()?;
                bitwise!(self, dest, value, |)?;
            }
            0x38 => {
                let dest = self.fetch_int_reg()?;
                let value = self.fetch_value(dest.width())?;
                bitwise!(self, dest, value, ^)?;
            }
            0x39 => {
                let (dest, value) = self.int_reg_pair()?;
                bitwise!(self, dest, value, ^)?;
            }
            0x3A | 0x3B => {
                let reg = self.fetch_int_reg()?;
                let amount = self.byte_operand(opcode == 0x3B)?;
                self.instr_shift(reg, amount, Shift::Left)?;
            }
            0x3C | 0x3D => {
                let reg = self.fetch_int_reg()?;
                let amount = self.byte_operand(opcode == 0x3D)?;
                self.instr_shift(reg, amount, Shift::ArithmeticRight)?;
            }
            0x3E | 0x3F => {
                let reg = self.fetch_int_reg()?;
                let amount = self.byte_operand(opcode == 0x3F)?;
                self.instr_shift(reg, amount, Shift::LogicalRight)?;
            }
            0x40 | 0x41 => {
                let reg = self.fetch_int_reg()?;
                let amount = self.byte_operand(opcode == 0x41)?;
                self.instr_rotate(reg, amount, true)?;
            }
            0x42 | 0x43 => {
                let reg = self.fetch_int_reg()?;
                let amount = self.byte_operand(opcode == 0x43)?;
                self.instr_rotate(reg, amount, false)?;
            }
            0x44 | 0x45 => {
                let reg = self.fetch_int_reg()?;
                let amount = self.byte_operand(opcode == 0x45)?;
                self.instr_rotate_carry(reg, amount, true)?;
            }
            0x46 | 0x47 => {
                let reg = self.fetch_int_reg()?;
                let amount = self.byte_operand(opcode == 0x47)?;
                self.instr_rotate_carry(reg, amount, false)?;
            }
            0x48 | 0x49 => {
                // JUMP
                let target = self.word_operand(opcode == 0x49)?;
                trace!("JUMP {target:#010X}");
                self.pc = target;
            }
            0x4A => {
                // COMPARE ref literal
                let reg = self.fetch_reg()?;
                let value = self.fetch_value(reg.width())?;
                self.instr_compare(reg, value)?;
            }
            0x4B => {
                // COMPARE ref ref
                let (reg, value) = self.reg_pair()?;
                self.instr_compare(reg, value)?;
            }
            0x4C..=0x53 => {
                // BLOCKCMP; variant bits select ref operands.
                let variant = opcode - 0x4C;
                let length = self.word_operand(variant & 0b100 != 0)?;
                let source1 = self.word_operand(variant & 0b010 != 0)?;
                let source2 = self.word_operand(variant & 0b001 != 0)?;
                trace!("BLOCKCMP {length} bytes at {source1:#010X} and {source2:#010X}");
                self.instr_blockcmp(length, source1, source2)?;
            }
            0x54..=0x67 => {
                // Conditional jumps.
                let index = usize::from(opcode - 0x54);
                let cond = COND_TABLE[index / 2];
                let target = self.word_operand(index % 2 == 1)?;
                if cond.holds(self.flags) {
                    trace!("{cond:?} taken to {target:#010X}");
                    self.pc = target;
                }
            }
            0x68 | 0x69 => {
                // CALL
                let target = self.word_operand(opcode == 0x69)?;
                trace!("CALL {target:#010X}");
                self.push(Value::Word(self.pc))?;
                self.pc = target;
            }
            0x6A => {
                // RETURN
                trace!("RETURN");
                self.pc = self.pop_word()?;
            }
            0x6B => {
                // SYSCALL
                trace!("SYSCALL");
                self.intr.raise(INT_SYSCALL);
            }
            0x6C | 0x6D => {
                // SCONVERT / UCONVERT
                let dest = self.fetch_reg()?;
                let source = self.fetch_reg()?;
                let signed = opcode == 0x6C;
                trace!("{}CONVERT {source:?} -> {dest:?}", if signed { 'S' } else { 'U' });
                let value = match (dest.width(), source.width()) {
                    (Width::Float, Width::Word) => {
                        let x = self.read_reg(source)?.into_word()?;
                        Value::Float(if signed { x as i32 as f32 } else { x as f32 })
                    }
                    (Width::Word, Width::Float) => {
                        let x = self.read_reg(source)?.into_float()?;
                        Value::Word(if signed { x as i32 as u32 } else { x as u32 })
                    }
                    _ => return Err(Fault::IllegalOperation),
                };
                self.write_reg(dest, value)?;
            }
            _ => {
                trace!("Unrecognised opcode {opcode:#04x}.");
                return Err(Fault::IllegalOperation);
            }
        }
        Ok(Exec::Continue)
    }

    // ------------------------------------------------------------------
    // Instruction bodies.
    // ------------------------------------------------------------------

    fn instr_ireturn(&mut self) -> Result<(), Fault> {
        let imr = self.pop_half()?;
        let pc = self.pop_word().map_err(|e| {
            // Keep the operation atomic: restore what was already popped
            // so the whole instruction restarts after the fault. The undo
            // rewrites the bytes just read, so it cannot newly fault.
            let _ = self.push(Value::Half(imr));
            e
        })?;
        let flags = self.pop_half().map_err(|e| {
            let _ = self.push(Value::Word(pc));
            let _ = self.push(Value::Half(imr));
            e
        })?;

        // Bit 15 of the pushed FLAGS records the pre-entry mode.
        if flags & Flags::ENTRY_MODE == 0 {
            self.kernel_mode = false;
        }
        self.imr = imr;
        self.pc = pc;
        self.flags = Flags::from_guest(flags);
        self.last_iret = true;
        Ok(())
    }

    fn instr_add(&mut self, dest: Reg, value: Value, with_carry: bool) -> Result<(), Fault> {
        let value = if with_carry && self.flags.carry() {
            value.wrapping_increment()
        } else {
            value
        };
        arith!(self, dest, value, overflowing_add, +)
    }

    fn instr_sub(&mut self, dest: Reg, value: Value, with_borrow: bool) -> Result<(), Fault> {
        let value = if with_borrow && self.flags.carry() {
            value.wrapping_increment()
        } else {
            value
        };
        arith!(self, dest, value, overflowing_sub, -)
    }

    fn instr_mult(&mut self, dest: Reg, value: Value) -> Result<(), Fault> {
        arith!(self, dest, value, overflowing_mul, *)
    }

    fn instr_sdiv(&mut self, dest: Reg, value: Value) -> Result<(), Fault> {
        if value.is_integer_zero() {
            return Err(Fault::DivideByZero);
        }
        signed_div!(self, dest, value, overflowing_div, /)
    }

    fn instr_udiv(&mut self, dest: Reg, value: Value) -> Result<(), Fault> {
        if value.is_integer_zero() {
            return Err(Fault::DivideByZero);
        }
        unsigned_div!(self, dest, value, overflowing_div)
    }

    fn instr_srem(&mut self, dest: Reg, value: Value) -> Result<(), Fault> {
        if value.is_integer_zero() {
            return Err(Fault::DivideByZero);
        }
        signed_div!(self, dest, value, overflowing_rem, %)
    }

    fn instr_urem(&mut self, dest: Reg, value: Value) -> Result<(), Fault> {
        if value.is_integer_zero() {
            return Err(Fault::DivideByZero);
        }
        unsigned_div!(self, dest, value, overflowing_rem)
    }

    fn instr_not(&mut self, reg: Reg) -> Result<(), Fault> {
        let (result, flags) = match self.read_reg(reg)? {
            Value::Byte(x) => {
                let ans = !x;
                (Value::Byte(ans), Flags::for_int(ans == 0, (ans as i8) < 0, false, false))
            }
            Value::Half(x) => {
                let ans = !x;
                (Value::Half(ans), Flags::for_int(ans == 0, (ans as i16) < 0, false, false))
            }
            Value::Word(x) => {
                let ans = !x;
                (Value::Word(ans), Flags::for_int(ans == 0, (ans as i32) < 0, false, false))
            }
            Value::Float(_) => return Err(Fault::IllegalOperation),
        };
        self.write_reg(reg, result)?;
        self.flags = flags;
        Ok(())
    }

    fn instr_shift(&mut self, reg: Reg, amount: u8, kind: Shift) -> Result<(), Fault> {
        trace!("{kind:?} shift {reg:?} by {amount}");
        let (result, flags) = match self.read_reg(reg)? {
            Value::Byte(x) => {
                let (ans, carry) = shifted!(x, amount, u8, i8, kind);
                (
                    Value::Byte(ans),
                    Flags::for_int(ans == 0, (ans as i8) < 0, carry, false),
                )
            }
            Value::Half(x) => {
                let (ans, carry) = shifted!(x, amount, u16, i16, kind);
                (
                    Value::Half(ans),
                    Flags::for_int(ans == 0, (ans as i16) < 0, carry, false),
                )
            }
            Value::Word(x) => {
                let (ans, carry) = shifted!(x, amount, u32, i32, kind);
                (
                    Value::Word(ans),
                    Flags::for_int(ans == 0, (ans as i32) < 0, carry, false),
                )
            }
            Value::Float(_) => return Err(Fault::IllegalOperation),
        };
        self.write_reg(reg, result)?;
        self.flags = flags;
        Ok(())
    }

    /// Plain rotation. C and O are untouched and cleared respectively.
    fn instr_rotate(&mut self, reg: Reg, amount: u8, left: bool) -> Result<(), Fault> {
        trace!("{} rotate {reg:?} by {amount}", if left { "Left" } else { "Right" });
        let n = u32::from(amount);
        let carry = self.flags.carry();
        let (result, flags) = match self.read_reg(reg)? {
            Value::Byte(x) => {
                let ans = if left { x.rotate_left(n) } else { x.rotate_right(n) };
                (
                    Value::Byte(ans),
                    Flags::for_int(ans == 0, (ans as i8) < 0, carry, false),
                )
            }
            Value::Half(x) => {
                let ans = if left { x.rotate_left(n) } else { x.rotate_right(n) };
                (
                    Value::Half(ans),
                    Flags::for_int(ans == 0, (ans as i16) < 0, carry, false),
                )
            }
            Value::Word(x) => {
                let ans = if left { x.rotate_left(n) } else { x.rotate_right(n) };
                (
                    Value::Word(ans),
                    Flags::for_int(ans == 0, (ans as i32) < 0, carry, false),
                )
            }
            Value::Float(_) => return Err(Fault::IllegalOperation),
        };
        self.write_reg(reg, result)?;
        self.flags = flags;
        Ok(())
    }

    /// Rotation through carry: C is one extra register bit.
    fn instr_rotate_carry(&mut self, reg: Reg, amount: u8, left: bool) -> Result<(), Fault> {
        trace!(
            "{} rotate-carry {reg:?} by {amount}",
            if left { "Left" } else { "Right" }
        );
        let n = u32::from(amount);
        let carry = self.flags.carry();
        let (result, flags) = match self.read_reg(reg)? {
            Value::Byte(x) => {
                let (ans, c) = rotate_with_carry(u64::from(x), carry, 8, left, n);
                let ans = ans as u8;
                (
                    Value::Byte(ans),
                    Flags::for_int(ans == 0, (ans as i8) < 0, c, false),
                )
            }
            Value::Half(x) => {
                let (ans, c) = rotate_with_carry(u64::from(x), carry, 16, left, n);
                let ans = ans as u16;
                (
                    Value::Half(ans),
                    Flags::for_int(ans == 0, (ans as i16) < 0, c, false),
                )
            }
            Value::Word(x) => {
                let (ans, c) = rotate_with_carry(u64::from(x), carry, 32, left, n);
                let ans = ans as u32;
                (
                    Value::Word(ans),
                    Flags::for_int(ans == 0, (ans as i32) < 0, c, false),
                )
            }
            Value::Float(_) => return Err(Fault::IllegalOperation),
        };
        self.write_reg(reg, result)?;
        self.flags = flags;
        Ok(())
    }

    /// Sets flags from `reg - value`, discarding the result.
    fn instr_compare(&mut self, reg: Reg, value: Value) -> Result<(), Fault> {
        trace!("COMPARE {reg:?} with {value:?}");
        self.flags = match (self.read_reg(reg)?, value) {
            (Value::Byte(x), Value::Byte(y)) => {
                let (_, carry) = x.overflowing_sub(y);
                let (s, overflow) = (x as i8).overflowing_sub(y as i8);
                Flags::for_int(s == 0, s < 0, carry, overflow)
            }
            (Value::Half(x), Value::Half(y)) => {
                let (_, carry) = x.overflowing_sub(y);
                let (s, overflow) = (x as i16).overflowing_sub(y as i16);
                Flags::for_int(s == 0, s < 0, carry, overflow)
            }
            (Value::Word(x), Value::Word(y)) => {
                let (_, carry) = x.overflowing_sub(y);
                let (s, overflow) = (x as i32).overflowing_sub(y as i32);
                Flags::for_int(s == 0, s < 0, carry, overflow)
            }
            (Value::Float(x), Value::Float(y)) => Flags::for_float(x - y),
            _ => return Err(Fault::IllegalOperation),
        };
        Ok(())
    }

    /// Compares two byte ranges: Z if all equal, otherwise N per the sign
    /// of the first differing byte pair (unsigned comparison).
    fn instr_blockcmp(&mut self, length: u32, source1: u32, source2: u32) -> Result<(), Fault> {
        for i in 0..length {
            let a = self.mem_load(source1.wrapping_add(i), Intent::Read)?;
            let b = self.mem_load(source2.wrapping_add(i), Intent::Read)?;
            if a != b {
                self.flags = Flags::for_int(false, a < b, false, false);
                return Ok(());
            }
        }
        self.flags = Flags::for_int(true, false, false, false);
        Ok(())
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("pc", &self.pc)
            .field("r", &self.r)
            .field("flags", &self.flags)
            .field("kernel_mode", &self.kernel_mode)
            .field("halted", &self.halted)
            .field("paused", &self.paused)
            .field("instructions_run", &self.instructions_run)
            .finish_non_exhaustive()
    }
}
