//! The display device: a write-only 25x80 grid of character cells.
//!
//! Guest writes to the display region decode into [`CellUpdate`] values
//! and stream over an unbounded channel to whatever front-end cares to
//! render them. The device itself keeps no cell state and never raises an
//! interrupt.

use crossbeam_channel as cbc;

/// Number of rows in the cell grid.
pub const ROWS: u8 = 25;
/// Number of columns in the cell grid.
pub const COLS: u8 = 80;

const CELLS: u32 = ROWS as u32 * COLS as u32;

/// An 8-bit-per-channel colour, quantised from the 2-bit-per-channel cell
/// colour byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(
    /// Red.
    pub u8,
    /// Green.
    pub u8,
    /// Blue.
    pub u8,
);

impl Rgb {
    /// Decodes a `00RRGGBB` cell colour byte.
    ///
    /// Each 2-bit channel maps onto {0, 85, 170, 255}; the top two bits
    /// are ignored.
    pub fn from_cell_byte(byte: u8) -> Self {
        fn quantise(channel: u8) -> u8 {
            channel * 85
        }
        Rgb(
            quantise((byte >> 4) & 0b11),
            quantise((byte >> 2) & 0b11),
            quantise(byte & 0b11),
        )
    }
}

/// One observable change to the cell grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellUpdate {
    /// The character at a cell changed.
    Glyph {
        /// Cell row, 0-24.
        row: u8,
        /// Cell column, 0-79.
        col: u8,
        /// The new character.
        ch: char,
    },
    /// The foreground colour at a cell changed.
    Foreground {
        /// Cell row, 0-24.
        row: u8,
        /// Cell column, 0-79.
        col: u8,
        /// The new colour.
        colour: Rgb,
    },
    /// The background colour at a cell changed.
    Background {
        /// Cell row, 0-24.
        row: u8,
        /// Cell column, 0-79.
        col: u8,
        /// The new colour.
        colour: Rgb,
    },
}

/// Maps a byte of the machine's character set onto a printable character.
///
/// Bytes outside the set update no glyph.
pub fn glyph(byte: u8) -> Option<char> {
    match byte {
        31 => Some('£'),
        32..=126 => Some(char::from(byte)),
        127 => Some('¬'),
        _ => None,
    }
}

/// The display controller.
///
/// Created with its update stream by the memory bus; the receiving end is
/// claimed once via [`DisplayController::take_updates`].
pub struct DisplayController {
    updates: cbc::Sender<CellUpdate>,
    receiver: Option<cbc::Receiver<CellUpdate>>,
}

impl DisplayController {
    pub(crate) fn new() -> Self {
        let (updates, receiver) = cbc::unbounded();
        Self {
            updates,
            receiver: Some(receiver),
        }
    }

    /// Takes the receiving end of the update stream.
    ///
    /// Returns `None` if it has already been taken. If the receiver is
    /// dropped, further updates are discarded.
    pub fn take_updates(&mut self) -> Option<cbc::Receiver<CellUpdate>> {
        self.receiver.take()
    }

    /// Handles a write at `offset` into the display region.
    ///
    /// Offsets 0-1999 are characters, 2000-3999 foreground colours, and
    /// 4000-5999 background colours, each indexed row-major over the grid.
    pub(crate) fn store(&mut self, offset: u32, value: u8) {
        let cell = offset % CELLS;
        let row = (cell / COLS as u32) as u8;
        let col = (cell % COLS as u32) as u8;

        let update = match offset / CELLS {
            0 => match glyph(value) {
                Some(ch) => CellUpdate::Glyph { row, col, ch },
                None => return,
            },
            1 => CellUpdate::Foreground {
                row,
                col,
                colour: Rgb::from_cell_byte(value),
            },
            _ => CellUpdate::Background {
                row,
                col,
                colour: Rgb::from_cell_byte(value),
            },
        };
        // A missing front-end is fine; the writes just vanish.
        let _ = self.updates.send(update);
    }
}

impl std::fmt::Debug for DisplayController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayController").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn characters_map_row_major() {
        let mut display = DisplayController::new();
        let updates = display.take_updates().unwrap();

        display.store(0, b'H');
        display.store(81, b'i');
        assert_eq!(
            updates.try_recv(),
            Ok(CellUpdate::Glyph {
                row: 0,
                col: 0,
                ch: 'H'
            })
        );
        assert_eq!(
            updates.try_recv(),
            Ok(CellUpdate::Glyph {
                row: 1,
                col: 1,
                ch: 'i'
            })
        );
    }

    #[test]
    fn charset_edges() {
        assert_eq!(glyph(31), Some('£'));
        assert_eq!(glyph(b' '), Some(' '));
        assert_eq!(glyph(b'~'), Some('~'));
        assert_eq!(glyph(127), Some('¬'));
        assert_eq!(glyph(0), None);
        assert_eq!(glyph(200), None);
    }

    #[test]
    fn unprintable_bytes_emit_nothing() {
        let mut display = DisplayController::new();
        let updates = display.take_updates().unwrap();

        display.store(42, 0x07);
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn colour_regions_decode() {
        let mut display = DisplayController::new();
        let updates = display.take_updates().unwrap();

        display.store(2000, 0b0011_0110); // fg of cell 0: R=3, G=1, B=2
        display.store(4000 + 1999, 0b0000_0001); // bg of the last cell
        assert_eq!(
            updates.try_recv(),
            Ok(CellUpdate::Foreground {
                row: 0,
                col: 0,
                colour: Rgb(255, 85, 170)
            })
        );
        assert_eq!(
            updates.try_recv(),
            Ok(CellUpdate::Background {
                row: 24,
                col: 79,
                colour: Rgb(0, 0, 85)
            })
        );
    }

    #[test]
    fn colour_byte_quantisation() {
        assert_eq!(Rgb::from_cell_byte(0b0000_0000), Rgb(0, 0, 0));
        assert_eq!(Rgb::from_cell_byte(0b0011_1111), Rgb(255, 255, 255));
        assert_eq!(Rgb::from_cell_byte(0b0001_1011), Rgb(85, 170, 255));
        // Top two bits ignored.
        assert_eq!(Rgb::from_cell_byte(0b1100_0000), Rgb(0, 0, 0));
    }

    #[test]
    fn updates_without_a_receiver_are_dropped() {
        let mut display = DisplayController::new();
        drop(display.take_updates());
        display.store(0, b'x'); // must not panic
    }
}
