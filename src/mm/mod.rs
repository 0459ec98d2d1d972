//! Memory management subsystem
//!
//! Three pieces: the translation-table pool (`ppool`), the two-stage page
//! table manager (`ptable`) and the owner-tracking physical page allocator
//! (`pma`). Page tables for both stages are built from `ppool` pages, never
//! from `pma` chunks, so a mapping operation can never re-enter the
//! allocator it is mapping for.

pub mod pma;
pub mod ppool;
pub mod ptable;

use bitflags::bitflags;

pub const PAGE_BITS: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;
/// log2 of PTEs per table page.
pub const PAGE_LEVEL_BITS: usize = 9;
pub const PTE_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<u64>();

/// Per-page TLB invalidation is used for ranges up to this many pages;
/// larger batches invalidate the whole (stage-scoped) TLB instead.
pub const MAX_TLBI_OPS: usize = 512;

bitflags! {
    /// Arch-independent page mapping modes.
    ///
    /// Stage-1 understands `R/W/X/D/INVALID/NS`. Stage-2 additionally
    /// tracks the ownership trio in software-reserved PTE bits:
    ///
    ///  1. V = valid/invalid    : part of the address space at all.
    ///  2. O = owned/unowned    : whether the memory is owned by the VM.
    ///  3. X = exclusive/shared : exclusive to the VM or shared with at
    ///                            most one other.
    ///
    /// Modes are chosen so that owner-of-exclusive-memory is all-zeroes.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Mode: u32 {
        const R = 0x0001;
        const W = 0x0002;
        const X = 0x0004;
        /// Device memory (nGnRnE).
        const D = 0x0008;
        const INVALID = 0x0010;
        const UNOWNED = 0x0020;
        const SHARED  = 0x0040;
        /// Non-secure (stage-1 only).
        const NS = 0x0080;
        /// Entry belongs to the hypervisor's stage-1 table.
        const STAGE1 = 0x0100;
    }
}

impl Mode {
    /// Inaccessible mapping.
    pub const I: Mode = Mode::INVALID;

    /// The mask for a mode that is considered unmapped.
    pub fn unmapped_mask() -> Mode {
        Mode::INVALID | Mode::UNOWNED
    }

    /// Memory that is valid, owned and exclusive (and not device).
    pub fn is_valid_owned_and_exclusive(self) -> bool {
        !self.intersects(Mode::D | Mode::INVALID | Mode::UNOWNED | Mode::SHARED)
    }
}

/// Errors surfaced by the page-table manager.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MmError {
    /// The translation-table pool is exhausted.
    NoTables,
    /// The queried range does not have a uniform mode.
    ModeNotUniform,
    /// Address not aligned as required.
    Unaligned,
}

pub const fn bytes_to_pages(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

pub const fn pages_to_bytes(pages: usize) -> usize {
    pages * PAGE_SIZE
}

/// Size in bytes of the span mapped by one PTE at `level` (level 0 = 4KiB
/// leaf pages).
pub const fn entry_size(level: u8) -> u64 {
    1u64 << (PAGE_BITS + level as usize * PAGE_LEVEL_BITS)
}
