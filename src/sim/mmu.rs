//! Virtual address translation.
//!
//! The MMU performs the two-level page walk: a 32-bit virtual address
//! splits into a 10-bit directory index, a 10-bit table index, and a 12-bit
//! frame offset. The walk itself goes through the [`MemBus`], so page
//! directories and tables may live anywhere physical reads are legal.
//!
//! Translation is a pure function of the bus contents and the PDPR; the
//! MMU holds no state of its own. On failure it reports a
//! [`PageFaultCode`], which the CPU publishes in the PFSR before raising
//! the page-fault interrupt. Translation only happens in user mode;
//! kernel-mode accesses go straight to the bus.

use log::trace;

use super::mem::MemBus;
use super::Fault;

// Page table entry bits.
const PTE_VALID: u32 = 1 << 0;
const PTE_PRESENT: u32 = 1 << 1;
const PTE_READ: u32 = 1 << 2;
const PTE_WRITE: u32 = 1 << 3;
const PTE_EXECUTE: u32 = 1 << 4;
const PTE_COW: u32 = 1 << 5;

// Bits 12-31 of an entry hold a frame number; 9-11 are user-defined.
const ENTRY_FRAME: u32 = 0xFFFF_F000;

/// The intent behind a memory access, checked against page permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// An instruction or operand fetch; requires the E bit.
    Fetch,
    /// A data read; requires the R bit.
    Read,
    /// A data write; requires the W bit and a clear C bit.
    Write,
}

/// The reason a translation failed, as published in the PFSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultCode {
    /// The directory or table entry had V=0.
    InvalidPage = 0,
    /// The intent's permission bit (R/W/E) was clear.
    IllegalAccess = 1,
    /// The table entry had V=1 but P=0.
    NotPresent = 2,
    /// A write hit a page with both W and C set.
    CopyOnWrite = 3,
}

/// Translates `vaddr` under the page directory at `pdpr`, or fails with a
/// page-fault code.
///
/// Walk reads that themselves hit an illegal physical region propagate as
/// illegal-operation faults.
pub fn translate(bus: &MemBus, pdpr: u32, vaddr: u32, intent: Intent) -> Result<u32, Fault> {
    // Directory entry: PDPR + 4 * top 10 bits.
    let dir_entry = bus.load_word(pdpr.wrapping_add(4 * (vaddr >> 22)))?;
    if dir_entry & PTE_VALID == 0 {
        return fault(vaddr, PageFaultCode::InvalidPage);
    }

    // Table entry: table frame + 4 * middle 10 bits.
    let table = dir_entry & ENTRY_FRAME;
    let entry = bus.load_word(table + 4 * ((vaddr >> 12) & 0x3FF))?;
    if entry & PTE_VALID == 0 {
        return fault(vaddr, PageFaultCode::InvalidPage);
    }
    if entry & PTE_PRESENT == 0 {
        return fault(vaddr, PageFaultCode::NotPresent);
    }

    let permission = match intent {
        Intent::Fetch => PTE_EXECUTE,
        Intent::Read => PTE_READ,
        Intent::Write => PTE_WRITE,
    };
    if entry & permission == 0 {
        return fault(vaddr, PageFaultCode::IllegalAccess);
    }
    // Copy-on-write outranks a successful write, but not the checks above.
    if intent == Intent::Write && entry & PTE_COW != 0 {
        return fault(vaddr, PageFaultCode::CopyOnWrite);
    }

    Ok((entry & ENTRY_FRAME) | (vaddr & 0xFFF))
}

fn fault(vaddr: u32, code: PageFaultCode) -> Result<u32, Fault> {
    trace!("Page fault at {vaddr:#010X}: {code:?}");
    Err(Fault::PageFault(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::sim::intr::InterruptController;
    use crate::sim::mem::{MemBus, RamStrategy, RAM_BASE};

    fn bus() -> MemBus {
        crate::init_test_logging();
        MemBus::new(
            Arc::new(InterruptController::new()),
            RamStrategy::Sparse.build(),
        )
    }

    /// Writes a directory entry and a table entry mapping virtual page 0
    /// to the given frame with the given low entry bits.
    fn map_page_zero(bus: &mut MemBus, pdpr: u32, frame: u32, bits: u32) {
        bus.store_word(pdpr, (pdpr + 0x1000) | PTE_VALID).unwrap();
        bus.store_word(pdpr + 0x1000, frame | bits).unwrap();
    }

    #[test]
    fn translates_a_mapped_address() {
        let mut bus = bus();
        const PDPR: u32 = RAM_BASE;

        map_page_zero(
            &mut bus,
            PDPR,
            0x0000_6000,
            PTE_VALID | PTE_PRESENT | PTE_READ,
        );
        assert_eq!(
            translate(&mut bus, PDPR, 0x0000_0123, Intent::Read),
            Ok(0x0000_6123)
        );
    }

    #[test]
    fn concatenates_frame_and_offset() {
        let mut bus = bus();
        const PDPR: u32 = 0x0010_0000;

        // Virtual address 0x00C0_3FFF: directory 3, table 3, offset 0xFFF.
        bus.store_word(PDPR + 4 * 3, 0x0000_5000 | PTE_VALID).unwrap();
        bus.store_word(
            0x0000_5000 + 4 * 3,
            0xABCD_E000 | PTE_VALID | PTE_PRESENT | PTE_WRITE,
        )
        .unwrap();
        assert_eq!(
            translate(&mut bus, PDPR, 0x00C0_3FFF, Intent::Write),
            Ok(0xABCD_EFFF)
        );
    }

    #[test]
    fn invalid_directory_entry_faults() {
        let mut bus = bus();
        // Nothing written: every entry reads zero, so V=0 everywhere.
        assert_eq!(
            translate(&mut bus, RAM_BASE, 0, Intent::Read),
            Err(Fault::PageFault(PageFaultCode::InvalidPage))
        );
        assert_eq!(
            translate(&mut bus, RAM_BASE, 0xFFFF_F000, Intent::Fetch),
            Err(Fault::PageFault(PageFaultCode::InvalidPage))
        );
    }

    #[test]
    fn invalid_table_entry_faults() {
        let mut bus = bus();
        const PDPR: u32 = RAM_BASE;

        bus.store_word(PDPR, 0x0000_5000 | PTE_VALID).unwrap();
        // Table entry with every bit except V.
        bus.store_word(0x0000_5000, 0x0000_6000 | 0x3E).unwrap();
        assert_eq!(
            translate(&mut bus, PDPR, 0, Intent::Read),
            Err(Fault::PageFault(PageFaultCode::InvalidPage))
        );
    }

    #[test]
    fn not_present_faults() {
        let mut bus = bus();
        const PDPR: u32 = RAM_BASE;

        map_page_zero(
            &mut bus,
            PDPR,
            0x0000_6000,
            PTE_VALID | PTE_READ | PTE_WRITE | PTE_EXECUTE,
        );
        assert_eq!(
            translate(&mut bus, PDPR, 0x0FFF, Intent::Read),
            Err(Fault::PageFault(PageFaultCode::NotPresent))
        );
    }

    #[test]
    fn permission_bits_are_intent_specific() {
        let mut bus = bus();
        const PDPR: u32 = RAM_BASE;

        for (bit, allowed) in [
            (PTE_READ, Intent::Read),
            (PTE_WRITE, Intent::Write),
            (PTE_EXECUTE, Intent::Fetch),
        ] {
            map_page_zero(&mut bus, PDPR, 0x0000_6000, PTE_VALID | PTE_PRESENT | bit);
            for intent in [Intent::Read, Intent::Write, Intent::Fetch] {
                let result = translate(&mut bus, PDPR, 0, intent);
                if intent == allowed {
                    assert_eq!(result, Ok(0x0000_6000));
                } else {
                    assert_eq!(
                        result,
                        Err(Fault::PageFault(PageFaultCode::IllegalAccess))
                    );
                }
            }
        }
    }

    #[test]
    fn cow_fires_only_on_writes() {
        let mut bus = bus();
        const PDPR: u32 = RAM_BASE;

        map_page_zero(
            &mut bus,
            PDPR,
            0x0000_6000,
            PTE_VALID | PTE_PRESENT | PTE_READ | PTE_WRITE | PTE_EXECUTE | PTE_COW,
        );
        assert_eq!(
            translate(&mut bus, PDPR, 0x42, Intent::Write),
            Err(Fault::PageFault(PageFaultCode::CopyOnWrite))
        );
        // Reads and fetches are untouched by C.
        assert_eq!(translate(&mut bus, PDPR, 0x42, Intent::Read), Ok(0x6042));
        assert_eq!(translate(&mut bus, PDPR, 0x42, Intent::Fetch), Ok(0x6042));
    }

    #[test]
    fn cow_does_not_outrank_missing_write_permission() {
        let mut bus = bus();
        const PDPR: u32 = RAM_BASE;

        map_page_zero(
            &mut bus,
            PDPR,
            0x0000_6000,
            PTE_VALID | PTE_PRESENT | PTE_READ | PTE_COW,
        );
        assert_eq!(
            translate(&mut bus, PDPR, 0, Intent::Write),
            Err(Fault::PageFault(PageFaultCode::IllegalAccess))
        );
    }

    #[test]
    fn walk_reads_in_illegal_regions_propagate() {
        let mut bus = bus();
        // PDPR pointing into the write-only display region: the walk's own
        // read faults as an illegal operation, not a page fault.
        assert_eq!(
            translate(&mut bus, 0x0000_0240, 0, Intent::Read),
            Err(Fault::IllegalOperation)
        );
    }
}
