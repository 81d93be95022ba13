//! The keyboard device.
//!
//! The front-end delivers structured [`KeyEvent`]s through a cloneable
//! [`KeyboardHandle`]; each event lands in the key and metadata buffers
//! (readable at 0x19B0/0x19B1) and latches the keyboard interrupt. A new
//! event simply overwrites the buffers; guest code is expected to read
//! them from its interrupt handler.

use std::sync::{Arc, Mutex};

use super::super::intr::{InterruptController, INT_KEYBOARD};

const META_CTRL: u8 = 0b01;
const META_ALT: u8 = 0b10;

/// A key press as delivered by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    /// The key's character-set byte.
    pub key: u8,
    /// Whether control was held.
    pub ctrl: bool,
    /// Whether alt was held.
    pub alt: bool,
}

impl KeyEvent {
    /// A plain key press with no modifiers.
    pub fn plain(key: u8) -> Self {
        KeyEvent {
            key,
            ctrl: false,
            alt: false,
        }
    }
}

#[derive(Debug, Default)]
struct Buffers {
    key: u8,
    metadata: u8,
}

/// The keyboard controller: owns the two memory-mapped buffers.
#[derive(Debug)]
pub struct KeyboardController {
    buffers: Arc<Mutex<Buffers>>,
    intr: Arc<InterruptController>,
}

impl KeyboardController {
    pub(crate) fn new(intr: Arc<InterruptController>) -> Self {
        Self {
            buffers: Arc::default(),
            intr,
        }
    }

    /// Creates a handle the host can press keys through.
    pub fn handle(&self) -> KeyboardHandle {
        KeyboardHandle {
            buffers: Arc::clone(&self.buffers),
            intr: Arc::clone(&self.intr),
        }
    }

    /// Handles a read at `offset` into the keyboard region
    /// (0 = key buffer, 1 = metadata).
    pub(crate) fn load(&self, offset: u32) -> u8 {
        let buffers = self.buffers.lock().unwrap();
        match offset {
            0 => buffers.key,
            _ => buffers.metadata,
        }
    }
}

/// A cloneable handle for injecting key presses into the machine.
///
/// Safe to use from any thread; each press overwrites the key buffers and
/// latches the keyboard interrupt.
#[derive(Debug, Clone)]
pub struct KeyboardHandle {
    buffers: Arc<Mutex<Buffers>>,
    intr: Arc<InterruptController>,
}

impl KeyboardHandle {
    /// Delivers one key press.
    pub fn press(&self, event: KeyEvent) {
        {
            let mut buffers = self.buffers.lock().unwrap();
            buffers.key = event.key;
            buffers.metadata = u8::from(event.ctrl) * META_CTRL | u8::from(event.alt) * META_ALT;
        }
        self.intr.raise(INT_KEYBOARD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyboard() -> (KeyboardController, Arc<InterruptController>) {
        let intr = Arc::new(InterruptController::new());
        (KeyboardController::new(Arc::clone(&intr)), intr)
    }

    #[test]
    fn press_fills_buffers_and_interrupts() {
        let (kb, intr) = keyboard();

        kb.handle().press(KeyEvent::plain(b'A'));
        assert_eq!(kb.load(0), b'A');
        assert_eq!(kb.load(1), 0);
        assert_eq!(intr.pending(), 1 << INT_KEYBOARD);
    }

    #[test]
    fn metadata_encodes_modifiers() {
        let (kb, _intr) = keyboard();
        let handle = kb.handle();

        handle.press(KeyEvent {
            key: b'c',
            ctrl: true,
            alt: false,
        });
        assert_eq!(kb.load(1), META_CTRL);

        handle.press(KeyEvent {
            key: b'c',
            ctrl: true,
            alt: true,
        });
        assert_eq!(kb.load(1), META_CTRL | META_ALT);
    }

    #[test]
    fn later_presses_overwrite() {
        let (kb, _intr) = keyboard();
        let handle = kb.handle();

        handle.press(KeyEvent::plain(b'x'));
        handle.press(KeyEvent::plain(b'y'));
        assert_eq!(kb.load(0), b'y');
    }
}
