//! The memory-mapped device set.
//!
//! Each device owns its registers; the [`MemBus`](super::mem::MemBus)
//! mediates every access to them and enforces each register's direction.
//! Devices that signal the CPU hold a handle to the
//! [`InterruptController`](super::intr::InterruptController) and latch
//! their interrupt number there; they never reach into the CPU.
//!
//! The devices:
//! - [`display::DisplayController`]: the 25x80 cell grid, streamed to the
//!   front-end as [`display::CellUpdate`] values.
//! - [`keyboard::KeyboardController`]: key and metadata buffers, fed by a
//!   host-side [`keyboard::KeyboardHandle`].
//! - [`disk::DiskController`]: two instances, each a block-addressed
//!   controller over swappable [`disk::DiskMedia`].
//! - [`timer::IntervalTimer`]: the wall-clock periodic interrupt source.

pub mod disk;
pub mod display;
pub mod keyboard;
pub mod timer;
