//! The physical memory bus and RAM providers.
//!
//! This module consists of:
//! - [`MemBus`]: routes every physical byte access to RAM, ROM, the
//!   interrupt vector, or a device register, enforcing each region's
//!   access direction.
//! - [`Ram`]: the contract for the flat RAM backing store, with
//!   [`DenseRam`] and [`SparseRam`] as the two interchangeable providers.
//! - [`Rom`]: the 512-byte boot image.
//!
//! The fixed physical map (inclusive ranges):
//!
//! ```text
//! 0x00000000-0x0000001F  interrupt vector        read/write
//! 0x00000020-0x0000003F  reserved                no access
//! 0x00000040-0x0000023F  ROM                     read-only
//! 0x00000240-0x000019AF  display cells           write-only
//! 0x000019B0-0x000019B1  keyboard buffers        read-only
//! 0x000019B2-0x00001FEB  reserved                no access
//! 0x00001FEC-0x00001FF5  disk A registers        split (see disk module)
//! 0x00001FF6-0x00001FFF  disk B registers        split (see disk module)
//! 0x00002000-0x00002FFF  disk A data buffer      read/write
//! 0x00003000-0x00003FFF  disk B data buffer      read/write
//! 0x00004000-0xFFFFFFFF  RAM                     read/write
//! ```
//!
//! All multi-byte quantities are big-endian. The bus never raises
//! interrupts itself; illegal accesses surface as [`Fault`] values for the
//! CPU to publish.

use std::sync::Arc;

use ahash::AHashMap;

use super::device::disk::DiskController;
use super::device::display::DisplayController;
use super::device::keyboard::KeyboardController;
use super::intr::{InterruptController, INT_DISK_A, INT_DISK_B};
use super::Fault;

/// Base physical address of the interrupt vector.
pub const VECTORS_BASE: u32 = 0x0000;
/// Base physical address of ROM.
pub const ROM_BASE: u32 = 0x0040;
/// Size of the boot ROM in bytes.
pub const ROM_SIZE: usize = 512;
/// Base physical address of the display cell region.
pub const DISPLAY_BASE: u32 = 0x0240;
/// Base physical address of the keyboard buffers.
pub const KEYBOARD_BASE: u32 = 0x19B0;
/// Base physical address of disk A's data buffer.
pub const DISK_A_DATA_BASE: u32 = 0x2000;
/// Base physical address of disk B's data buffer.
pub const DISK_B_DATA_BASE: u32 = 0x3000;
/// Base physical address of RAM.
pub const RAM_BASE: u32 = 0x4000;
/// Size of the RAM region in bytes.
pub const RAM_SIZE: usize = (u32::MAX - RAM_BASE) as usize + 1;
/// Size of one page/frame in bytes.
pub const PAGE_SIZE: usize = 4096;

const DISK_A_REG_BASE: u32 = 0x1FEC;
const DISK_B_REG_BASE: u32 = 0x1FF6;

/// The two disk controller slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiskId {
    A,
    B,
}

/// What a physical address resolves to, with the offset into that region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Vectors(u32),
    Reserved,
    Rom(u32),
    Display(u32),
    Keyboard(u32),
    DiskRegisters(DiskId, u32),
    DiskData(DiskId, u32),
    Ram(u32),
}

fn region_of(addr: u32) -> Region {
    match addr {
        0x0000..=0x001F => Region::Vectors(addr - VECTORS_BASE),
        0x0020..=0x003F => Region::Reserved,
        0x0040..=0x023F => Region::Rom(addr - ROM_BASE),
        0x0240..=0x19AF => Region::Display(addr - DISPLAY_BASE),
        0x19B0..=0x19B1 => Region::Keyboard(addr - KEYBOARD_BASE),
        0x19B2..=0x1FEB => Region::Reserved,
        0x1FEC..=0x1FF5 => Region::DiskRegisters(DiskId::A, addr - DISK_A_REG_BASE),
        0x1FF6..=0x1FFF => Region::DiskRegisters(DiskId::B, addr - DISK_B_REG_BASE),
        0x2000..=0x2FFF => Region::DiskData(DiskId::A, addr - DISK_A_DATA_BASE),
        0x3000..=0x3FFF => Region::DiskData(DiskId::B, addr - DISK_B_DATA_BASE),
        _ => Region::Ram(addr - RAM_BASE),
    }
}

/// The boot ROM image: exactly [`ROM_SIZE`] bytes, mapped read-only at
/// [`ROM_BASE`].
#[derive(Clone)]
pub struct Rom([u8; ROM_SIZE]);

impl Rom {
    /// Wraps a full ROM image.
    pub fn new(bytes: [u8; ROM_SIZE]) -> Self {
        Rom(bytes)
    }

    /// Builds a ROM from a byte slice, which must be exactly [`ROM_SIZE`]
    /// bytes long.
    pub fn from_image(bytes: &[u8]) -> Result<Self, RomSizeError> {
        match bytes.try_into() {
            Ok(array) => Ok(Rom(array)),
            Err(_) => Err(RomSizeError { found: bytes.len() }),
        }
    }
}

impl Default for Rom {
    /// An all-zero ROM.
    fn default() -> Self {
        Rom([0; ROM_SIZE])
    }
}

impl From<[u8; ROM_SIZE]> for Rom {
    fn from(bytes: [u8; ROM_SIZE]) -> Self {
        Rom(bytes)
    }
}

impl std::fmt::Debug for Rom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rom").finish_non_exhaustive()
    }
}

/// A ROM image had the wrong length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomSizeError {
    /// The length of the rejected image.
    pub found: usize,
}

impl std::fmt::Display for RomSizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ROM image must be {ROM_SIZE} bytes, got {}", self.found)
    }
}
impl std::error::Error for RomSizeError {}

/// The RAM backing store contract.
///
/// Addresses are offsets into the RAM region: offset 0 corresponds to
/// physical [`RAM_BASE`]. Providers make no permission, endianness, or
/// alignment judgements; those belong to the bus and CPU. Every offset
/// reads zero until first written.
pub trait Ram: Send {
    /// Reads the byte at `offset`.
    fn load(&self, offset: u32) -> u8;
    /// Writes the byte at `offset`.
    fn store(&mut self, offset: u32, value: u8);

    /// Reads `buf.len()` contiguous bytes starting at `offset`.
    fn load_block(&self, offset: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.load(offset + i as u32);
        }
    }
    /// Writes `data` contiguously starting at `offset`.
    fn store_block(&mut self, offset: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.store(offset + i as u32, *b);
        }
    }
}

/// Eagerly allocated RAM: the full region in one vector, constant-time
/// access.
pub struct DenseRam {
    data: Vec<u8>,
}

impl DenseRam {
    /// Allocates the full RAM region, zeroed.
    pub fn new() -> Self {
        Self {
            data: vec![0; RAM_SIZE],
        }
    }
}

impl Default for DenseRam {
    fn default() -> Self {
        Self::new()
    }
}

impl Ram for DenseRam {
    fn load(&self, offset: u32) -> u8 {
        self.data[offset as usize]
    }

    fn store(&mut self, offset: u32, value: u8) {
        self.data[offset as usize] = value;
    }

    fn load_block(&self, offset: u32, buf: &mut [u8]) {
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
    }

    fn store_block(&mut self, offset: u32, data: &[u8]) {
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
    }
}

/// Lazily allocated RAM: a page materialises, zero-filled, on first write.
///
/// `ahash` keys the page map; cryptographic strength is irrelevant here
/// and it is measurably faster than the standard hasher.
#[derive(Default)]
pub struct SparseRam {
    pages: AHashMap<u32, Box<[u8; PAGE_SIZE]>>,
}

impl SparseRam {
    /// Creates an empty sparse RAM.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of pages currently materialised.
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }
}

impl Ram for SparseRam {
    fn load(&self, offset: u32) -> u8 {
        match self.pages.get(&(offset >> 12)) {
            Some(page) => page[offset as usize & (PAGE_SIZE - 1)],
            None => 0,
        }
    }

    fn store(&mut self, offset: u32, value: u8) {
        let page = self
            .pages
            .entry(offset >> 12)
            .or_insert_with(|| Box::new([0; PAGE_SIZE]));
        page[offset as usize & (PAGE_SIZE - 1)] = value;
    }
}

/// Which RAM provider a simulator is built with.
///
/// Both providers satisfy the same contract; the choice trades start-up
/// cost and resident memory against per-access overhead.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RamStrategy {
    /// Allocate the full region up front ([`DenseRam`]).
    Dense,
    /// Allocate 4 KiB pages on first write ([`SparseRam`]).
    #[default]
    Sparse,
}

impl RamStrategy {
    /// Builds the provider.
    pub fn build(self) -> Box<dyn Ram> {
        match self {
            RamStrategy::Dense => Box::new(DenseRam::new()),
            RamStrategy::Sparse => Box::new(SparseRam::new()),
        }
    }
}

/// The memory bus: owns every addressable component and routes physical
/// accesses per the fixed map.
///
/// [`MemBus::load`] and [`MemBus::store`] are the canonical byte paths;
/// the wider accessors compose them big-endian, so a multi-byte access
/// that crosses region boundaries applies each region's rules per byte.
pub struct MemBus {
    vectors: [u8; 0x20],
    rom: Rom,
    display: DisplayController,
    keyboard: KeyboardController,
    disk_a: DiskController,
    disk_b: DiskController,
    ram: Box<dyn Ram>,
}

impl MemBus {
    /// Creates a bus with a zeroed ROM, no disk media, and the given RAM
    /// provider. Devices latch their interrupts on `intr`.
    pub fn new(intr: Arc<InterruptController>, ram: Box<dyn Ram>) -> Self {
        Self {
            vectors: [0; 0x20],
            rom: Rom::default(),
            display: DisplayController::new(),
            keyboard: KeyboardController::new(Arc::clone(&intr)),
            disk_a: DiskController::new(Arc::clone(&intr), INT_DISK_A),
            disk_b: DiskController::new(intr, INT_DISK_B),
            ram,
        }
    }

    /// Installs a ROM image.
    pub fn set_rom(&mut self, rom: Rom) {
        self.rom = rom;
    }

    /// Machine reset: zeroes the interrupt vector and replaces the RAM
    /// provider. The ROM image, devices, and mounted media are preserved.
    pub(crate) fn reset(&mut self, ram: Box<dyn Ram>) {
        self.vectors = [0; 0x20];
        self.ram = ram;
    }

    /// The display controller.
    pub fn display_mut(&mut self) -> &mut DisplayController {
        &mut self.display
    }

    /// The keyboard controller.
    pub fn keyboard(&self) -> &KeyboardController {
        &self.keyboard
    }

    /// Disk controller A.
    pub fn disk_a(&self) -> &DiskController {
        &self.disk_a
    }

    /// Disk controller A, mutably (for inserting and ejecting media).
    pub fn disk_a_mut(&mut self) -> &mut DiskController {
        &mut self.disk_a
    }

    /// Disk controller B.
    pub fn disk_b(&self) -> &DiskController {
        &self.disk_b
    }

    /// Disk controller B, mutably (for inserting and ejecting media).
    pub fn disk_b_mut(&mut self) -> &mut DiskController {
        &mut self.disk_b
    }

    fn disk(&self, id: DiskId) -> &DiskController {
        match id {
            DiskId::A => &self.disk_a,
            DiskId::B => &self.disk_b,
        }
    }

    fn disk_mut(&mut self, id: DiskId) -> &mut DiskController {
        match id {
            DiskId::A => &mut self.disk_a,
            DiskId::B => &mut self.disk_b,
        }
    }

    /// Reads the byte at a physical address, or faults if the region is
    /// not readable.
    pub fn load(&self, addr: u32) -> Result<u8, Fault> {
        match region_of(addr) {
            Region::Vectors(off) => Ok(self.vectors[off as usize]),
            Region::Reserved => Err(Fault::IllegalOperation),
            Region::Rom(off) => Ok(self.rom.0[off as usize]),
            Region::Display(_) => Err(Fault::IllegalOperation),
            Region::Keyboard(off) => Ok(self.keyboard.load(off)),
            Region::DiskRegisters(id, off) => {
                self.disk(id).load_register(off).ok_or(Fault::IllegalOperation)
            }
            Region::DiskData(id, off) => Ok(self.disk(id).load_data(off)),
            Region::Ram(off) => Ok(self.ram.load(off)),
        }
    }

    /// Writes the byte at a physical address, or faults if the region is
    /// not writable.
    pub fn store(&mut self, addr: u32, value: u8) -> Result<(), Fault> {
        match region_of(addr) {
            Region::Vectors(off) => {
                self.vectors[off as usize] = value;
                Ok(())
            }
            Region::Reserved | Region::Rom(_) | Region::Keyboard(_) => {
                Err(Fault::IllegalOperation)
            }
            Region::Display(off) => {
                self.display.store(off, value);
                Ok(())
            }
            Region::DiskRegisters(id, off) => self
                .disk_mut(id)
                .store_register(off, value)
                .ok_or(Fault::IllegalOperation),
            Region::DiskData(id, off) => {
                self.disk_mut(id).store_data(off, value);
                Ok(())
            }
            Region::Ram(off) => {
                self.ram.store(off, value);
                Ok(())
            }
        }
    }

    /// Reads a big-endian 16-bit value.
    pub fn load_half(&self, addr: u32) -> Result<u16, Fault> {
        let hi = self.load(addr)?;
        let lo = self.load(addr.wrapping_add(1))?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    /// Reads a big-endian 32-bit value.
    pub fn load_word(&self, addr: u32) -> Result<u32, Fault> {
        let mut bytes = [0; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.load(addr.wrapping_add(i as u32))?;
        }
        Ok(u32::from_be_bytes(bytes))
    }

    /// Writes a big-endian 16-bit value.
    pub fn store_half(&mut self, addr: u32, value: u16) -> Result<(), Fault> {
        let [hi, lo] = value.to_be_bytes();
        self.store(addr, hi)?;
        self.store(addr.wrapping_add(1), lo)
    }

    /// Writes a big-endian 32-bit value.
    pub fn store_word(&mut self, addr: u32, value: u32) -> Result<(), Fault> {
        for (i, b) in value.to_be_bytes().into_iter().enumerate() {
            self.store(addr.wrapping_add(i as u32), b)?;
        }
        Ok(())
    }

    /// Reads a byte without faulting, for host-side inspection.
    ///
    /// Returns `None` where a read would fault. Never triggers device
    /// side effects.
    pub fn peek(&self, addr: u32) -> Option<u8> {
        self.load(addr).ok()
    }

    /// Reads a big-endian word without faulting, for host-side inspection.
    pub fn peek_word(&self, addr: u32) -> Option<u32> {
        self.load_word(addr).ok()
    }
}

impl std::fmt::Debug for MemBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> MemBus {
        crate::init_test_logging();
        MemBus::new(
            Arc::new(InterruptController::new()),
            RamStrategy::Sparse.build(),
        )
    }

    #[test]
    fn ram_round_trips() {
        let mut bus = bus();

        assert_eq!(bus.load_word(RAM_BASE), Ok(0));
        bus.store(RAM_BASE, 0x01).unwrap();
        bus.store_half(RAM_BASE + 2, 0x1234).unwrap();
        assert_eq!(bus.load_word(RAM_BASE), Ok(0x0100_1234));
    }

    #[test]
    fn ram_reaches_the_top_of_the_address_space() {
        let mut bus = bus();

        bus.store(u32::MAX, 0xAB).unwrap();
        assert_eq!(bus.load(u32::MAX), Ok(0xAB));
    }

    #[test]
    fn vectors_are_read_write() {
        let mut bus = bus();

        bus.store_word(0x0000, 0xDEAD_BEEF).unwrap();
        assert_eq!(bus.load_word(0x0000), Ok(0xDEAD_BEEF));
        bus.store(0x001F, 7).unwrap();
        assert_eq!(bus.load(0x001F), Ok(7));
    }

    #[test]
    fn rom_is_read_only() {
        let mut bus = bus();
        let mut image = [0; ROM_SIZE];
        image[0] = 0x11;
        image[ROM_SIZE - 1] = 0x22;
        bus.set_rom(Rom::new(image));

        assert_eq!(bus.load(ROM_BASE), Ok(0x11));
        assert_eq!(bus.load(0x023F), Ok(0x22));
        assert_eq!(bus.store(ROM_BASE, 0), Err(Fault::IllegalOperation));
    }

    #[test]
    fn reserved_regions_fault_both_directions() {
        let mut bus = bus();

        for addr in [0x0020, 0x003F, 0x19B2, 0x1FEB] {
            assert_eq!(bus.load(addr), Err(Fault::IllegalOperation), "{addr:#x}");
            assert_eq!(
                bus.store(addr, 0),
                Err(Fault::IllegalOperation),
                "{addr:#x}"
            );
        }
    }

    #[test]
    fn display_is_write_only() {
        let mut bus = bus();

        bus.store(DISPLAY_BASE, b'A').unwrap();
        bus.store(0x19AF, 0x3F).unwrap();
        assert_eq!(bus.load(DISPLAY_BASE), Err(Fault::IllegalOperation));
    }

    #[test]
    fn keyboard_is_read_only() {
        let mut bus = bus();

        assert_eq!(bus.load(KEYBOARD_BASE), Ok(0));
        assert_eq!(bus.load(KEYBOARD_BASE + 1), Ok(0));
        assert_eq!(bus.store(KEYBOARD_BASE, 1), Err(Fault::IllegalOperation));
    }

    #[test]
    fn disk_register_directions() {
        let mut bus = bus();

        // Status and blocks-available are read-only.
        for off in 0..5 {
            assert_eq!(bus.load(0x1FEC + off), Ok(0));
            assert_eq!(bus.store(0x1FEC + off, 1), Err(Fault::IllegalOperation));
        }
        // Block address and command are write-only.
        for off in 5..10 {
            assert_eq!(bus.load(0x1FEC + off), Err(Fault::IllegalOperation));
        }
        bus.store(0x1FF1, 0).unwrap(); // disk A block address, high byte
        assert_eq!(bus.load(0x1FF6), Ok(0)); // disk B status
    }

    #[test]
    fn disk_data_buffers_are_read_write() {
        let mut bus = bus();

        bus.store(DISK_A_DATA_BASE, 0x5A).unwrap();
        bus.store(DISK_B_DATA_BASE + 0xFFF, 0xA5).unwrap();
        assert_eq!(bus.load(DISK_A_DATA_BASE), Ok(0x5A));
        assert_eq!(bus.load(DISK_B_DATA_BASE + 0xFFF), Ok(0xA5));
        // The two buffers are distinct.
        assert_eq!(bus.load(DISK_B_DATA_BASE), Ok(0));
    }

    #[test]
    fn peek_never_faults() {
        let bus = bus();

        assert_eq!(bus.peek(0x0020), None);
        assert_eq!(bus.peek(DISPLAY_BASE), None);
        assert_eq!(bus.peek(RAM_BASE), Some(0));
        assert_eq!(bus.peek_word(RAM_BASE), Some(0));
    }

    #[test]
    fn providers_agree() {
        crate::init_test_logging();
        let mut dense = DenseRam::new();
        let mut sparse = SparseRam::new();

        let pattern: Vec<(u32, u8)> = vec![
            (0, 1),
            (PAGE_SIZE as u32 - 1, 2),
            (PAGE_SIZE as u32, 3),
            (0xDEAD_0000, 4),
            (u32::MAX - RAM_BASE, 5),
        ];
        for &(offset, value) in &pattern {
            dense.store(offset, value);
            sparse.store(offset, value);
        }
        for &(offset, value) in &pattern {
            assert_eq!(dense.load(offset), value);
            assert_eq!(sparse.load(offset), value);
        }
        // Unwritten offsets read zero from both.
        assert_eq!(dense.load(123), 0);
        assert_eq!(sparse.load(123), 0);
        assert_eq!(sparse.resident_pages(), 4);
    }

    #[test]
    fn providers_agree_on_random_access() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        crate::init_test_logging();
        let mut dense = DenseRam::new();
        let mut sparse = SparseRam::new();
        let mut rng = StdRng::seed_from_u64(0x5EED_CAFE);

        let writes: Vec<(u32, u8)> = (0..1000)
            .map(|_| (rng.gen::<u32>() % (RAM_SIZE as u32), rng.gen()))
            .collect();
        for &(offset, value) in &writes {
            dense.store(offset, value);
            sparse.store(offset, value);
        }
        for &(offset, _) in &writes {
            assert_eq!(dense.load(offset), sparse.load(offset));
        }
    }

    #[test]
    fn block_helpers_round_trip() {
        crate::init_test_logging();
        let mut ram = SparseRam::new();

        // Straddles a page boundary.
        let data: Vec<u8> = (0..=255).collect();
        ram.store_block(PAGE_SIZE as u32 - 100, &data);
        let mut back = vec![0; data.len()];
        ram.load_block(PAGE_SIZE as u32 - 100, &mut back);
        assert_eq!(back, data);
    }
}
