//! The disk controllers.
//!
//! Each [`DiskController`] exposes a 10-byte register window (status,
//! blocks available, block address, command) and a 4 KiB data buffer that
//! guest code fills or drains with ordinary loads and stores. A command
//! write moves one block between the buffer and the mounted
//! [`DiskMedia`], then completes: the F status bit toggles, S/B report
//! the outcome, and the controller's interrupt latches. Every command
//! produces exactly one completion.
//!
//! Host-side concerns (which file backs a disk, watching it for changes)
//! live behind the [`DiskMedia`] trait; [`MemDisk`] is the in-memory
//! implementation this crate ships. [`DiskController::insert`] and
//! [`DiskController::eject`] model media changes and raise the disk
//! interrupt with the status updated, exactly as a hot-swapped disk file
//! would.

use std::sync::Arc;

use log::debug;

use super::super::intr::InterruptController;

/// Size of one disk block and of the data buffer, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Status bit: media is mounted.
pub const STATUS_CONNECTED: u8 = 0x01;
/// Status bit: toggles on every command completion.
pub const STATUS_FINISHED: u8 = 0x02;
/// Status bit: the last command succeeded.
pub const STATUS_SUCCESS: u8 = 0x04;
/// Status bit: the last command was malformed.
pub const STATUS_BAD_COMMAND: u8 = 0x08;

/// Command: copy the addressed block into the data buffer.
pub const CMD_READ: u8 = 0x01;
/// Command: copy the data buffer into the addressed block.
pub const CMD_WRITE: u8 = 0x02;
/// Command: read, then advance the block address.
pub const CMD_CONTIGUOUS_READ: u8 = 0x03;
/// Command: write, then advance the block address.
pub const CMD_CONTIGUOUS_WRITE: u8 = 0x04;

/// Block-addressed backing storage for a disk controller.
///
/// `block` is always below [`DiskMedia::blocks`] when called by the
/// controller. Returning `false` reports an I/O failure, which completes
/// the in-flight command unsuccessfully.
pub trait DiskMedia: Send {
    /// The number of addressable blocks.
    fn blocks(&self) -> u32;
    /// Copies a block into `buf` (always [`BLOCK_SIZE`] bytes).
    fn read_block(&mut self, block: u32, buf: &mut [u8]) -> bool;
    /// Copies `data` (always [`BLOCK_SIZE`] bytes) over a block.
    fn write_block(&mut self, block: u32, data: &[u8]) -> bool;
}

/// In-memory disk media.
pub struct MemDisk {
    data: Vec<u8>,
}

impl MemDisk {
    /// A zero-filled disk of the given number of blocks.
    pub fn blank(blocks: u32) -> Self {
        Self {
            data: vec![0; blocks as usize * BLOCK_SIZE],
        }
    }

    /// Wraps a disk image, which must be a non-zero multiple of
    /// [`BLOCK_SIZE`] bytes.
    pub fn from_image(bytes: Vec<u8>) -> Result<Self, DiskImageError> {
        if bytes.is_empty() || bytes.len() % BLOCK_SIZE != 0 {
            return Err(DiskImageError { found: bytes.len() });
        }
        Ok(Self { data: bytes })
    }

    /// The raw disk contents.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Unwraps into the raw disk contents.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl DiskMedia for MemDisk {
    fn blocks(&self) -> u32 {
        (self.data.len() / BLOCK_SIZE) as u32
    }

    fn read_block(&mut self, block: u32, buf: &mut [u8]) -> bool {
        let start = block as usize * BLOCK_SIZE;
        buf.copy_from_slice(&self.data[start..start + BLOCK_SIZE]);
        true
    }

    fn write_block(&mut self, block: u32, data: &[u8]) -> bool {
        let start = block as usize * BLOCK_SIZE;
        self.data[start..start + BLOCK_SIZE].copy_from_slice(data);
        true
    }
}

/// A disk image had an unusable length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskImageError {
    /// The length of the rejected image.
    pub found: usize,
}

impl std::fmt::Display for DiskImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "disk image must be a non-zero multiple of {BLOCK_SIZE} bytes, got {}",
            self.found
        )
    }
}
impl std::error::Error for DiskImageError {}

enum Outcome {
    Success,
    Failed,
    Bad,
}

/// One disk controller: registers, data buffer, and the mounted media.
pub struct DiskController {
    intr: Arc<InterruptController>,
    int_num: u8,
    media: Option<Box<dyn DiskMedia>>,
    status: u8,
    block_addr: u32,
    buffer: Box<[u8; BLOCK_SIZE]>,
}

impl DiskController {
    pub(crate) fn new(intr: Arc<InterruptController>, int_num: u8) -> Self {
        Self {
            intr,
            int_num,
            media: None,
            status: 0,
            block_addr: 0,
            buffer: Box::new([0; BLOCK_SIZE]),
        }
    }

    /// Mounts media, setting the C status bit and raising the disk
    /// interrupt. Any previous media is returned.
    pub fn insert(&mut self, media: impl DiskMedia + 'static) -> Option<Box<dyn DiskMedia>> {
        let blocks = media.blocks();
        let previous = self.media.replace(Box::new(media));
        debug!("Disk {} connected with {blocks} blocks.", self.int_num);
        self.status |= STATUS_CONNECTED;
        self.intr.raise(self.int_num);
        previous
    }

    /// Unmounts the media, clearing the C status bit and raising the disk
    /// interrupt.
    pub fn eject(&mut self) -> Option<Box<dyn DiskMedia>> {
        debug!("Disk {} disconnected.", self.int_num);
        self.status &= !STATUS_CONNECTED;
        self.intr.raise(self.int_num);
        self.media.take()
    }

    /// The current status byte.
    pub fn status(&self) -> u8 {
        self.status
    }

    /// The number of blocks on the mounted media (0 if none).
    pub fn blocks_available(&self) -> u32 {
        self.media.as_ref().map_or(0, |m| m.blocks())
    }

    /// Handles a read in the register window. `None` for the write-only
    /// offsets.
    pub(crate) fn load_register(&self, offset: u32) -> Option<u8> {
        match offset {
            0 => Some(self.status),
            1..=4 => Some(self.blocks_available().to_be_bytes()[offset as usize - 1]),
            _ => None,
        }
    }

    /// Handles a write in the register window. `None` for the read-only
    /// offsets.
    pub(crate) fn store_register(&mut self, offset: u32, value: u8) -> Option<()> {
        match offset {
            5..=8 => {
                let mut bytes = self.block_addr.to_be_bytes();
                bytes[offset as usize - 5] = value;
                self.block_addr = u32::from_be_bytes(bytes);
                Some(())
            }
            9 => {
                self.execute(value);
                Some(())
            }
            _ => None,
        }
    }

    /// Reads a byte of the data buffer.
    pub(crate) fn load_data(&self, offset: u32) -> u8 {
        self.buffer[offset as usize]
    }

    /// Writes a byte of the data buffer.
    pub(crate) fn store_data(&mut self, offset: u32, value: u8) {
        self.buffer[offset as usize] = value;
    }

    fn execute(&mut self, cmd: u8) {
        debug!("Disk {} command {cmd:#04x}.", self.int_num);
        let Some(media) = self.media.as_mut() else {
            // No media: report disconnected, but still complete.
            self.status &= !STATUS_CONNECTED;
            self.intr.raise(self.int_num);
            return;
        };

        let outcome = if !(CMD_READ..=CMD_CONTIGUOUS_WRITE).contains(&cmd)
            || self.block_addr >= media.blocks()
        {
            Outcome::Bad
        } else {
            let ok = match cmd {
                CMD_READ | CMD_CONTIGUOUS_READ => {
                    media.read_block(self.block_addr, &mut self.buffer[..])
                }
                _ => media.write_block(self.block_addr, &self.buffer[..]),
            };
            if ok {
                if matches!(cmd, CMD_CONTIGUOUS_READ | CMD_CONTIGUOUS_WRITE) {
                    self.block_addr += 1;
                }
                Outcome::Success
            } else {
                Outcome::Failed
            }
        };
        self.complete(outcome);
    }

    fn complete(&mut self, outcome: Outcome) {
        self.status ^= STATUS_FINISHED;
        match outcome {
            Outcome::Success => {
                self.status |= STATUS_SUCCESS;
                self.status &= !STATUS_BAD_COMMAND;
            }
            Outcome::Failed => {
                self.status &= !(STATUS_SUCCESS | STATUS_BAD_COMMAND);
            }
            Outcome::Bad => {
                self.status &= !STATUS_SUCCESS;
                self.status |= STATUS_BAD_COMMAND;
            }
        }
        self.intr.raise(self.int_num);
    }
}

impl std::fmt::Debug for DiskController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskController")
            .field("int_num", &self.int_num)
            .field("status", &self.status)
            .field("block_addr", &self.block_addr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::sim::intr::INT_DISK_A;

    fn disk() -> (DiskController, Arc<InterruptController>) {
        crate::init_test_logging();
        let intr = Arc::new(InterruptController::new());
        (DiskController::new(Arc::clone(&intr), INT_DISK_A), intr)
    }

    fn take(intr: &InterruptController) -> Option<u8> {
        intr.try_take(0xFF)
    }

    #[test]
    fn initial_state_rejects_commands() {
        let (mut disk, intr) = disk();

        assert_eq!(disk.status(), 0);
        assert_eq!(disk.blocks_available(), 0);

        for cmd in [CMD_READ, CMD_WRITE, CMD_CONTIGUOUS_READ, CMD_CONTIGUOUS_WRITE] {
            disk.store_register(9, cmd);
            assert_eq!(take(&intr), Some(INT_DISK_A));
            assert_eq!(disk.status() & STATUS_CONNECTED, 0);
        }
    }

    #[test]
    fn insert_and_eject_interrupt_with_status() {
        let (mut disk, intr) = disk();

        disk.insert(MemDisk::blank(3));
        assert_eq!(take(&intr), Some(INT_DISK_A));
        assert_eq!(disk.status(), STATUS_CONNECTED);
        assert_eq!(disk.blocks_available(), 3);

        disk.eject();
        assert_eq!(take(&intr), Some(INT_DISK_A));
        assert_eq!(disk.status(), 0);
        assert_eq!(disk.blocks_available(), 0);
    }

    #[test]
    fn read_write_round_trip() {
        let (mut disk, intr) = disk();
        disk.insert(MemDisk::blank(2));
        take(&intr);

        // Fill the buffer and write it to block 1.
        for i in 0..BLOCK_SIZE {
            disk.store_data(i as u32, i as u8);
        }
        disk.store_register(8, 1); // block address, low byte
        disk.store_register(9, CMD_WRITE);
        assert_eq!(take(&intr), Some(INT_DISK_A));
        assert_eq!(
            disk.status(),
            STATUS_CONNECTED | STATUS_FINISHED | STATUS_SUCCESS
        );

        // Wipe the buffer by reading block 0, then read block 1 back.
        disk.store_register(8, 0);
        disk.store_register(9, CMD_READ);
        take(&intr);
        assert!(disk.status() & STATUS_FINISHED == 0); // toggled back
        assert_eq!(disk.load_data(100), 0);

        disk.store_register(8, 1);
        disk.store_register(9, CMD_READ);
        take(&intr);
        for i in (0..BLOCK_SIZE).step_by(199) {
            assert_eq!(disk.load_data(i as u32), i as u8);
        }
    }

    #[test]
    fn contiguous_commands_advance_the_address() {
        let (mut disk, intr) = disk();
        disk.insert(MemDisk::blank(2));
        take(&intr);

        disk.store_data(0, 0xAA);
        disk.store_register(9, CMD_CONTIGUOUS_WRITE);
        take(&intr);
        disk.store_data(0, 0xBB);
        disk.store_register(9, CMD_CONTIGUOUS_WRITE);
        take(&intr);
        assert_eq!(disk.status() & STATUS_SUCCESS, STATUS_SUCCESS);

        // A third write runs off the end.
        disk.store_register(9, CMD_CONTIGUOUS_WRITE);
        take(&intr);
        assert_eq!(disk.status() & STATUS_BAD_COMMAND, STATUS_BAD_COMMAND);

        // Reset the address and read both blocks back.
        for reg in 5..=8 {
            disk.store_register(reg, 0);
        }
        disk.store_register(9, CMD_CONTIGUOUS_READ);
        take(&intr);
        assert_eq!(disk.load_data(0), 0xAA);
        disk.store_register(9, CMD_CONTIGUOUS_READ);
        take(&intr);
        assert_eq!(disk.load_data(0), 0xBB);
    }

    #[test]
    fn unknown_command_is_bad() {
        let (mut disk, intr) = disk();
        disk.insert(MemDisk::blank(1));
        take(&intr);

        disk.store_register(9, 0x7F);
        assert_eq!(take(&intr), Some(INT_DISK_A));
        assert_eq!(
            disk.status(),
            STATUS_CONNECTED | STATUS_FINISHED | STATUS_BAD_COMMAND
        );
    }

    #[test]
    fn out_of_range_block_is_bad() {
        let (mut disk, intr) = disk();
        disk.insert(MemDisk::blank(4));
        take(&intr);

        disk.store_register(8, 4);
        disk.store_register(9, CMD_READ);
        take(&intr);
        assert_eq!(disk.status() & STATUS_BAD_COMMAND, STATUS_BAD_COMMAND);
    }

    #[test]
    fn block_address_assembles_big_endian() {
        let (mut disk, _intr) = disk();

        disk.store_register(5, 0x01);
        disk.store_register(6, 0x02);
        disk.store_register(7, 0x03);
        disk.store_register(8, 0x04);
        assert_eq!(disk.block_addr, 0x0102_0304);
    }

    #[test]
    fn blocks_available_reads_big_endian() {
        let (mut disk, _intr) = disk();
        disk.insert(MemDisk::blank(300));

        assert_eq!(disk.load_register(1), Some(0));
        assert_eq!(disk.load_register(2), Some(0));
        assert_eq!(disk.load_register(3), Some(0x01));
        assert_eq!(disk.load_register(4), Some(0x2C));
    }

    #[test]
    fn image_validation() {
        assert!(MemDisk::from_image(vec![0; BLOCK_SIZE]).is_ok());
        assert!(MemDisk::from_image(vec![0; 3 * BLOCK_SIZE]).is_ok());
        assert_eq!(
            MemDisk::from_image(vec![]).err(),
            Some(DiskImageError { found: 0 })
        );
        assert_eq!(
            MemDisk::from_image(vec![0; BLOCK_SIZE - 1]).err(),
            Some(DiskImageError {
                found: BLOCK_SIZE - 1
            })
        );
    }
}
