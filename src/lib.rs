//! A simulator for the Simulatron 2.0.0 architecture.
//!
//! The Simulatron is a 32-bit big-endian teaching machine with privileged
//! and unprivileged execution, two-level virtual memory, and memory-mapped
//! I/O. This crate implements the machine itself: the CPU core with its
//! interrupt model, the MMU, the memory bus, and the device set (display,
//! keyboard, two disk controllers, and a timer). Front-ends, assemblers,
//! and linkers live elsewhere; the machine consumes raw byte images.
//!
//! # Usage
//!
//! A machine boots in kernel mode with the PC at the start of ROM. A
//! zeroed ROM starts with opcode `0x00`, which is HALT:
//!
//! ```
//! use simulatron::sim::{SimConfig, Simulator};
//!
//! let mut sim = Simulator::new(SimConfig::default());
//! sim.run().unwrap();
//! assert!(sim.halted());
//! ```
//!
//! Real programs are loaded as a 512-byte ROM image (typically produced by
//! the toolchain, but any bytes will do):
//!
//! ```
//! use simulatron::sim::mem::{Rom, ROM_SIZE};
//! use simulatron::sim::Simulator;
//!
//! let mut image = [0; ROM_SIZE];
//! image[0] = 0x0A; // COPY r0, 0x12345678
//! image[1] = 0x00;
//! image[2..6].copy_from_slice(&0x1234_5678u32.to_be_bytes());
//! // image[6] is 0x00: HALT.
//!
//! let mut sim = Simulator::default();
//! sim.load_rom(Rom::new(image));
//! sim.run().unwrap();
//! assert_eq!(sim.gpr(0), 0x1234_5678);
//! ```
//!
//! Disk media mount through the bus
//! ([`MemBus::disk_a_mut`](sim::mem::MemBus::disk_a_mut)), key presses
//! arrive through a
//! [`KeyboardHandle`](sim::device::keyboard::KeyboardHandle), and display
//! output streams as
//! [`CellUpdate`](sim::device::display::CellUpdate) values. See the
//! [`sim`] module for the full machine model.
#![warn(missing_docs)]

pub mod sim;

/// Initialise logging for tests.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use simplelog::{Config, LevelFilter, TestLogger};

    // Tests run in any order; the first caller wins and the rest are
    // no-ops.
    let _ = TestLogger::init(LevelFilter::Trace, Config::default());
}
