//! The interrupt controller.
//!
//! [`InterruptController`] is the single synchronisation point between the
//! CPU and its devices. Devices hold an [`Arc`] handle and call
//! [`InterruptController::raise`]; the CPU drains interrupts between
//! instructions with [`InterruptController::try_take`] or, while paused,
//! [`InterruptController::wait_take`]. A host thread that clears the
//! machine-control flag calls [`InterruptController::kick`] so a blocked
//! wait notices immediately.
//!
//! An interrupt stays latched while its IMR bit is clear and becomes
//! servicable as soon as the bit is enabled. Arbitration is in ascending
//! numeric order, so interrupt 0 has the highest priority.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::{debug, trace};

/// Illegal operation interrupt.
pub const INT_ILLEGAL_OP: u8 = 0;
/// Division (or remainder) by zero interrupt.
pub const INT_DIV_ZERO: u8 = 1;
/// Page fault interrupt; the code is published in the PFSR.
pub const INT_PAGE_FAULT: u8 = 2;
/// Keyboard interrupt.
pub const INT_KEYBOARD: u8 = 3;
/// Disk A completion/change interrupt.
pub const INT_DISK_A: u8 = 4;
/// Disk B completion/change interrupt.
pub const INT_DISK_B: u8 = 5;
/// Timer interrupt.
pub const INT_TIMER: u8 = 6;
/// Syscall interrupt.
pub const INT_SYSCALL: u8 = 7;

/// Backstop interval for a blocked [`InterruptController::wait_take`].
/// The wait is normally ended by [`InterruptController::raise`] or
/// [`InterruptController::kick`]; the timeout only covers a stop whose
/// kick was lost or omitted.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// A latched set of pending interrupts, shared between the CPU and every
/// device.
///
/// All operations are atomic with respect to each other; raising never
/// blocks.
#[derive(Debug, Default)]
pub struct InterruptController {
    pending: Mutex<u8>,
    available: Condvar,
}

impl InterruptController {
    /// Creates a controller with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches interrupt `n` (0-7) and wakes a paused CPU.
    ///
    /// Raising an already-pending interrupt is a no-op; interrupts do not
    /// queue.
    pub fn raise(&self, n: u8) {
        assert!(n < 8, "interrupt number out of range: {n}");
        let mut pending = self.pending.lock().unwrap();
        *pending |= 1 << n;
        trace!("Latched interrupt {n}.");
        self.available.notify_all();
    }

    /// Takes the highest-priority pending interrupt enabled by `imr`,
    /// clearing it from the pending set. Returns `None` if no pending
    /// interrupt is unmasked.
    pub fn try_take(&self, imr: u16) -> Option<u8> {
        Self::take_enabled(&mut self.pending.lock().unwrap(), imr)
    }

    /// Blocks until an interrupt enabled by `imr` is pending, then takes it.
    ///
    /// Returns `None` if `alive` is cleared while waiting; the pending set
    /// is left untouched in that case. Masked interrupts latch but do not
    /// end the wait. The thread that clears `alive` must [`kick`] the
    /// controller for the wait to end promptly.
    ///
    /// [`kick`]: InterruptController::kick
    pub fn wait_take(&self, imr: u16, alive: &AtomicBool) -> Option<u8> {
        debug!("Waiting on an interrupt.");
        let mut pending = self.pending.lock().unwrap();
        loop {
            if let Some(n) = Self::take_enabled(&mut pending, imr) {
                return Some(n);
            }
            if !alive.load(Ordering::Relaxed) {
                return None;
            }
            (pending, _) = self.available.wait_timeout(pending, WAIT_POLL).unwrap();
        }
    }

    /// Wakes every blocked [`InterruptController::wait_take`] without
    /// latching anything, so it can re-examine the machine-control flag.
    /// Call this after clearing the flag from another thread.
    pub fn kick(&self) {
        // Take the lock so the wake cannot slip between a waiter's flag
        // check and its wait.
        let _pending = self.pending.lock().unwrap();
        self.available.notify_all();
    }

    /// Snapshot of the pending bitmask (bit n = interrupt n latched).
    pub fn pending(&self) -> u8 {
        *self.pending.lock().unwrap()
    }

    /// Drops every latched interrupt. Used by machine reset.
    pub(crate) fn clear_all(&self) {
        *self.pending.lock().unwrap() = 0;
    }

    fn take_enabled(pending: &mut u8, imr: u16) -> Option<u8> {
        // Ascending order: the lowest set-and-enabled bit wins.
        let enabled = u16::from(*pending) & imr;
        if enabled == 0 {
            return None;
        }
        let n = enabled.trailing_zeros() as u8;
        *pending &= !(1 << n);
        debug!("Servicing interrupt {n}.");
        Some(n)
    }
}
