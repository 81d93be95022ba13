//! The wall-clock interval timer.
//!
//! The TIMER instruction hands a period in milliseconds to this device;
//! every time the period elapses, the timer interrupt latches. A period of
//! zero disables the timer without raising a final interrupt.
//!
//! The timer runs on its own worker thread so that a paused CPU still
//! wakes up. Setting a new period restarts the countdown from that
//! moment. The thread joins when the device is dropped.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as cbc;
use log::trace;

use super::super::intr::{InterruptController, INT_TIMER};

enum Command {
    Period(u32),
    Shutdown,
}

/// The periodic interrupt source.
#[derive(Debug)]
pub struct IntervalTimer {
    commands: cbc::Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl IntervalTimer {
    /// Spawns the worker thread, initially disabled.
    pub(crate) fn spawn(intr: Arc<InterruptController>) -> Self {
        let (commands, rx) = cbc::unbounded();

        let worker = std::thread::spawn(move || {
            let mut period = 0u32;
            loop {
                let command = if period == 0 {
                    // Disabled: nothing to do until told otherwise.
                    rx.recv().map_err(|_| cbc::RecvTimeoutError::Disconnected)
                } else {
                    match rx.recv_timeout(Duration::from_millis(u64::from(period))) {
                        Err(cbc::RecvTimeoutError::Timeout) => {
                            intr.raise(INT_TIMER);
                            continue;
                        }
                        other => other,
                    }
                };
                match command {
                    Ok(Command::Period(new_period)) => {
                        trace!("Timer period set to {new_period}ms.");
                        period = new_period;
                    }
                    Ok(Command::Shutdown) | Err(_) => return,
                }
            }
        });

        Self {
            commands,
            worker: Some(worker),
        }
    }

    /// Sets the period in milliseconds; zero disables.
    pub(crate) fn set_period(&self, millis: u32) {
        // The worker outlives every sender until shutdown.
        let _ = self.commands.send(Command::Period(millis));
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
