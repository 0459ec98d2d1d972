//! Physical memory allocator.
//!
//! Tracks every page of one contiguous RAM window in a bitfield array: two
//! bits per owner per page, `OWNS` and `LAST`. Up to eight owners can hold
//! a page at once (owner 0 is the hypervisor). A chunk is a contiguous run
//! of pages attributed to an owner whose highest page carries the owner's
//! `LAST` bit. There is no free list; allocation is a linear scan for a
//! zero run.
//!
//! Page number 0 is the fault sentinel: it is permanently reserved, mapped
//! inaccessible in stage-1, and its address doubles as the error return of
//! the address-valued lookups.

use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use crate::addr::{Ipaddr, Paddr};
use crate::mm::ppool::PagePool;
use crate::mm::ptable::Ptable;
use crate::mm::{bytes_to_pages, entry_size, Mode, PAGE_BITS, PAGE_LEVEL_BITS, PAGE_SIZE};
use crate::sync::SpinLock;

/// Two bits per owner in a 16-bit entry.
pub type PageBits = u16;

pub const MAX_OWNERS: u8 = 8;
pub const HYPERVISOR_OWNER: u8 = 0;

/// Auto-select the largest stage-2 block alignment not exceeding the
/// request size.
pub const ALIGN_AUTO: u8 = u8::MAX;

/// Highest level at which stage-2 blocks exist (2 MiB and 1 GiB).
const STAGE2_MAX_BLOCK_LEVEL: u8 = 2;

const FAULT_PAGE_NUMBER: u64 = 0;

#[inline]
const fn own_bit(owner: u8) -> u16 {
    1 << (owner * 2)
}

#[inline]
const fn last_bit(owner: u8) -> u16 {
    own_bit(owner) << 1
}

/// Mask of every owner's LAST bit.
const ALL_LAST_BITS: u16 = 0xAAAA;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PmaError {
    /// No sufficiently large free run.
    NoMemory,
    /// Owner id out of range.
    InvalidOwner,
    /// Zero-sized request.
    ZeroSize,
    /// Request exceeds the managed window.
    TooLarge,
    /// Address outside the managed window or not page-aligned.
    BadPointer,
    /// Operation on the sentinel page or the bitmap itself.
    Restricted,
    /// The target region is not allocated (or not to this owner).
    NotAllocated,
    /// An assign span crossed a chunk boundary.
    SpansChunks,
    /// The page-table update failed.
    MapFailed,
}

/// One slot of the direct-mapped allocation cache. Fields are written under
/// the PMA lock; readers tolerate the benign race and only use a slot whose
/// `addr` matches.
struct CacheEntry {
    addr: AtomicU64,
    begin: AtomicU64,
    end: AtomicU64,
    page_count: AtomicU64,
    owners: AtomicU16,
}

impl CacheEntry {
    const fn new() -> Self {
        Self {
            addr: AtomicU64::new(0),
            begin: AtomicU64::new(0),
            end: AtomicU64::new(0),
            page_count: AtomicU64::new(0),
            owners: AtomicU16::new(0),
        }
    }
}

const CACHE_SLOTS: usize = 32;

#[inline]
fn cache_slot(addr: u64) -> usize {
    (((addr & 0x0FFF_FFFF) >> PAGE_BITS) % 0x1F) as usize
}

pub struct Pma {
    base: u64,
    page_count: u64,
    pages: &'static [AtomicU16],
    lock: SpinLock<()>,
    cache: [CacheEntry; CACHE_SLOTS],
}

impl Pma {
    /// Builds the allocator over `[base, base + size)` using `entries` as
    /// the owner bitmap. `entries` must cover at least `size / PAGE_SIZE`
    /// pages; all entries must start zeroed. Reserves the sentinel page.
    pub fn new(base: u64, size: u64, entries: &'static [AtomicU16]) -> Self {
        let page_count = size / PAGE_SIZE as u64;
        assert!(entries.len() as u64 >= page_count, "bitmap too small");
        assert!(base % PAGE_SIZE as u64 == 0);

        let pma = Self {
            base,
            page_count,
            pages: entries,
            lock: SpinLock::new(()),
            cache: [const { CacheEntry::new() }; CACHE_SLOTS],
        };

        // The sentinel page is always allocated to the hypervisor.
        pma.pages[FAULT_PAGE_NUMBER as usize].store(
            own_bit(HYPERVISOR_OWNER) | last_bit(HYPERVISOR_OWNER),
            Ordering::Relaxed,
        );
        pma
    }

    /// Address signalled on failure by the address-valued lookups.
    pub fn fault_ptr(&self) -> u64 {
        self.pn_to_ptr(FAULT_PAGE_NUMBER)
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.page_count * PAGE_SIZE as u64
    }

    #[inline]
    fn pn_to_ptr(&self, pn: u64) -> u64 {
        self.base + pn * PAGE_SIZE as u64
    }

    #[inline]
    fn ptr_to_pn(&self, ptr: u64) -> Option<u64> {
        if ptr < self.base {
            return None;
        }
        let pn = (ptr - self.base) / PAGE_SIZE as u64;
        (pn < self.page_count).then_some(pn)
    }

    #[inline]
    fn load(&self, pn: u64) -> u16 {
        self.pages[pn as usize].load(Ordering::Relaxed)
    }

    /// Pages holding the bitmap itself, when the bitmap lives inside the
    /// managed window, must never be reassigned or freed.
    fn is_restricted(&self, pn: u64) -> bool {
        if pn == FAULT_PAGE_NUMBER {
            return true;
        }
        let bm_begin = self.pages.as_ptr() as u64;
        let bm_end = bm_begin + core::mem::size_of_val(self.pages) as u64;
        let page = self.pn_to_ptr(pn);
        page + PAGE_SIZE as u64 > bm_begin && page < bm_end
    }

    fn valid_owner(owner: u8) -> Result<(), PmaError> {
        if owner >= MAX_OWNERS {
            log::error!("illegal PMA owner id {:#04x}", owner);
            return Err(PmaError::InvalidOwner);
        }
        Ok(())
    }

    // ── cache ───────────────────────────────────────────────────────

    fn cache_lookup(&self, addr: u64) -> Option<(u64, u64, u64, u16)> {
        let entry = &self.cache[cache_slot(addr)];
        if entry.addr.load(Ordering::Acquire) != addr || addr == 0 {
            return None;
        }
        Some((
            entry.begin.load(Ordering::Relaxed),
            entry.end.load(Ordering::Relaxed),
            entry.page_count.load(Ordering::Relaxed),
            entry.owners.load(Ordering::Relaxed),
        ))
    }

    fn cache_insert(&self, addr: u64, begin: u64, end: u64, page_count: u64, owner: u8) {
        let entry = &self.cache[cache_slot(addr)];
        entry.addr.store(0, Ordering::Release);
        entry.begin.store(begin, Ordering::Relaxed);
        entry.end.store(end, Ordering::Relaxed);
        entry.page_count.store(page_count, Ordering::Relaxed);
        entry.owners.store(own_bit(owner), Ordering::Relaxed);
        entry.addr.store(addr, Ordering::Release);
    }

    fn cache_add_owner(&self, addr: u64, owner: u8) {
        let entry = &self.cache[cache_slot(addr)];
        if entry.addr.load(Ordering::Acquire) == addr {
            entry.owners.fetch_or(own_bit(owner), Ordering::Relaxed);
        }
    }

    fn cache_remove_owner(&self, addr: u64, owner: u8) {
        let entry = &self.cache[cache_slot(addr)];
        if entry.addr.load(Ordering::Acquire) == addr {
            entry.owners.fetch_and(!own_bit(owner), Ordering::Relaxed);
        }
    }

    // ── lookups (lock-free) ─────────────────────────────────────────

    /// Finds the first page of the chunk containing `ptr` for `owner`.
    fn start_page_number(&self, ptr: u64, owner: u8) -> u64 {
        if let Some((begin, _, _, owners)) = self.cache_lookup(ptr) {
            if owners & own_bit(owner) != 0 {
                return begin;
            }
        }

        let Some(pn) = self.ptr_to_pn(ptr) else {
            log::error!("pointer {:#x} outside of memory range", ptr);
            return FAULT_PAGE_NUMBER;
        };

        if self.load(pn) == 0 {
            log::error!("pointer {:#x} refers to unallocated memory", ptr);
            return FAULT_PAGE_NUMBER;
        }

        // Walk backwards until the previous page is free or ends the
        // previous chunk.
        let mut start = pn;
        while start > 0 {
            let prev = self.load(start - 1);
            if prev & own_bit(owner) == 0 || prev & last_bit(owner) != 0 {
                break;
            }
            start -= 1;
        }
        start
    }

    /// Whether `pn` is the first page of a chunk for `owner`: the
    /// previous page either does not belong to `owner` or ends the
    /// previous chunk.
    fn is_start_page(&self, pn: u64, owner: u8) -> bool {
        if pn >= self.page_count {
            return false;
        }
        pn == 0 || {
            let prev = self.load(pn - 1);
            prev & own_bit(owner) == 0 || prev & last_bit(owner) != 0
        }
    }

    /// Size in bytes of the chunk containing `ptr` for `owner`, 0 on error.
    pub fn get_size(&self, ptr: u64, owner: u8) -> usize {
        if let Some((_, _, count, owners)) = self.cache_lookup(ptr) {
            if owners & own_bit(owner) != 0 {
                return count as usize * PAGE_SIZE;
            }
        }

        let start = self.start_page_number(ptr, owner);
        if start == FAULT_PAGE_NUMBER {
            return 0;
        }

        let mut size = 0usize;
        for pn in start..self.page_count {
            size += 1;
            if self.load(pn) & last_bit(owner) != 0 {
                break;
            }
        }
        size * PAGE_SIZE
    }

    /// Start address of the chunk containing `ptr`, or the fault sentinel.
    pub fn get_start(&self, ptr: u64, owner: u8) -> u64 {
        self.pn_to_ptr(self.start_page_number(ptr, owner))
    }

    /// Whether the whole region `[ptr, ptr + size)` is assigned to `owner`.
    pub fn is_assigned(&self, ptr: u64, size: usize, owner: u8) -> bool {
        if Self::valid_owner(owner).is_err() {
            return false;
        }
        if let Some((_, _, _, owners)) = self.cache_lookup(ptr) {
            return owners & own_bit(owner) != 0;
        }

        let (Some(start), Some(end)) = (
            self.ptr_to_pn(ptr),
            self.ptr_to_pn(ptr + size as u64 - 1),
        ) else {
            return false;
        };
        if start == FAULT_PAGE_NUMBER {
            return false;
        }
        (start..=end).all(|pn| self.load(pn) & own_bit(owner) != 0)
    }

    // ── reservation (no page table involved) ────────────────────────

    /// Marks `[begin, end)` for `owner` without touching any page table.
    /// Only used during init for regions already mapped by firmware.
    pub fn reserve_memory(&self, begin: u64, end: u64, owner: u8) -> Result<(), PmaError> {
        Self::valid_owner(owner)?;
        let Some(start_pn) = self.ptr_to_pn(begin) else {
            log::error!("reserve {:#x} outside of memory range", begin);
            return Err(PmaError::BadPointer);
        };
        let Some(end_pn) = self.ptr_to_pn(end - 1) else {
            log::error!("reserved region too large ({:#x})", end - begin);
            return Err(PmaError::TooLarge);
        };

        let _guard = self.lock.lock();
        for pn in start_pn..=end_pn {
            if self.load(pn) != 0 {
                // Roll everything back on the first conflict.
                log::error!("already reserved page encountered at {:#x}", self.pn_to_ptr(pn));
                for undo in start_pn..pn {
                    self.pages[undo as usize].store(0, Ordering::Relaxed);
                }
                return Err(PmaError::NotAllocated);
            }
            let mut bits = own_bit(owner);
            if pn == end_pn {
                bits |= last_bit(owner);
            }
            self.pages[pn as usize].store(bits, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Releases a region previously marked with `reserve_memory`.
    pub fn release_memory(&self, begin: u64, end: u64, owner: u8) -> Result<(), PmaError> {
        Self::valid_owner(owner)?;
        let Some(start_pn) = self.ptr_to_pn(begin) else {
            return Err(PmaError::BadPointer);
        };
        let Some(end_pn) = self.ptr_to_pn(end - 1) else {
            return Err(PmaError::TooLarge);
        };

        let _guard = self.lock.lock();

        if self.load(end_pn) & last_bit(owner) == 0 {
            log::warn!(
                "releasing partial region {:#x} - {:#x}; allocation state may become inconsistent",
                begin,
                end
            );
        }

        // The page before the released span becomes the end of whatever
        // chunk it belongs to.
        if start_pn > 0 && self.load(start_pn - 1) & own_bit(owner) != 0 {
            self.pages[start_pn as usize - 1].fetch_or(last_bit(owner), Ordering::Relaxed);
        }

        for pn in start_pn..=end_pn {
            let bits = self.load(pn);
            if bits & own_bit(owner) == 0 {
                continue;
            }
            let mut new = bits & !own_bit(owner);
            if new & last_bit(owner) != 0 {
                new &= !last_bit(owner);
                if pn != end_pn {
                    log::error!("reached end of chunk while releasing memory");
                }
                self.pages[pn as usize].store(new, Ordering::Relaxed);
                break;
            }
            self.pages[pn as usize].store(new, Ordering::Relaxed);
        }
        Ok(())
    }

    // ── allocation ──────────────────────────────────────────────────

    /// Alignment offset needed so that the physical start page shares the
    /// requested alignment remainder with `ipa_begin`, keeping block
    /// mappings possible without extra page tables.
    fn calc_ipa_offset(ipa_begin: Option<Ipaddr>, align_bits: u8) -> u64 {
        let Some(ipa) = ipa_begin else { return 0 };
        let mask = (1u64 << (align_bits as u64 + PAGE_BITS as u64)) - 1;
        if ipa.addr() & mask == 0 {
            return 0;
        }
        (ipa.addr() & mask) >> PAGE_BITS
    }

    fn auto_alignment(size: usize, ipa_begin: Option<Ipaddr>) -> u8 {
        let mut alignment = 0u8;
        for lvl in 1..=STAGE2_MAX_BLOCK_LEVEL {
            alignment = lvl * PAGE_LEVEL_BITS as u8;
            let off = Self::calc_ipa_offset(ipa_begin, alignment);
            let lvl_size = entry_size(lvl) as usize;
            if size < lvl_size
                || (off > 0
                    && size < lvl_size + PAGE_SIZE * (((1usize << alignment) as u64 - off) as usize))
            {
                alignment = (lvl - 1) * PAGE_LEVEL_BITS as u8;
                break;
            }
        }
        alignment
    }

    /// Allocates a run of pages for `owner` and maps it at `ipa_begin` in
    /// `ptable` (IPA == PA when `ipa_begin` is `None`). Returns the
    /// physical address of the run.
    pub fn alloc(
        &self,
        ptable: &mut Ptable,
        ipa_begin: Option<Ipaddr>,
        size: usize,
        mode: Mode,
        owner: u8,
        ppool: &PagePool,
    ) -> Result<u64, PmaError> {
        self.aligned_alloc(ptable, ipa_begin, size, 0, mode, owner, ppool)
    }

    /// `alloc` with the start page aligned to `1 << align_bits` pages
    /// (adjusted by the IPA offset). `ALIGN_AUTO` picks the largest block
    /// size not exceeding the request.
    pub fn aligned_alloc(
        &self,
        ptable: &mut Ptable,
        ipa_begin: Option<Ipaddr>,
        size: usize,
        align_bits: u8,
        mode: Mode,
        owner: u8,
        ppool: &PagePool,
    ) -> Result<u64, PmaError> {
        if size == 0 {
            log::error!("zero-sized allocation");
            return Err(PmaError::ZeroSize);
        }
        if size as u64 > self.size() {
            log::error!(
                "requested chunk ({}) larger than total memory ({})",
                size,
                self.size()
            );
            return Err(PmaError::TooLarge);
        }
        Self::valid_owner(owner)?;

        let align_bits = if align_bits == ALIGN_AUTO {
            Self::auto_alignment(size, ipa_begin)
        } else {
            align_bits
        };

        let need = bytes_to_pages(size) as u64;
        let align_offset = Self::calc_ipa_offset(ipa_begin, align_bits);

        let guard = self.lock.lock();

        let mut start_pn = 0u64;
        let mut run = 0u64;
        let mut pn = 0u64;
        while pn < self.page_count {
            if self.load(pn) == 0 {
                run += 1;
                if run >= need {
                    break;
                }
            } else {
                start_pn = pn + 1;
                run = 0;
                if align_bits > 0 {
                    let step = 1u64 << align_bits;
                    let incr = step - (start_pn % step);
                    start_pn += incr + align_offset;
                    pn += incr + align_offset;
                }
            }
            pn += 1;
        }

        if start_pn >= self.page_count || run < need {
            log::error!("no sufficiently large memory chunk left");
            return Err(PmaError::NoMemory);
        }

        let end_pn = start_pn + need - 1;
        for i in start_pn..=end_pn {
            self.pages[i as usize].store(own_bit(owner), Ordering::Relaxed);
        }
        self.pages[end_pn as usize].fetch_or(last_bit(owner), Ordering::Relaxed);
        drop(guard);

        let pa = self.pn_to_ptr(start_pn);
        let ipa = ipa_begin.unwrap_or(Ipaddr::new(pa));
        log::debug!(
            "PMA allocation {:#x} - {:#x} | IPA begin: {:#x}",
            pa,
            self.pn_to_ptr(end_pn) + PAGE_SIZE as u64 - 1,
            ipa.addr()
        );

        if let Err(e) = self.map_chunk(ptable, ipa, start_pn, end_pn, mode, owner, ppool) {
            // Undo the marks so a failed mapping leaks nothing.
            let _guard = self.lock.lock();
            for i in start_pn..=end_pn {
                self.pages[i as usize].store(0, Ordering::Relaxed);
            }
            return Err(e);
        }

        self.cache_insert(pa, start_pn, end_pn, need, owner);
        Ok(pa)
    }

    /// `aligned_alloc` that retries in halves when the contiguous request
    /// cannot be satisfied, up to `max_splits` levels of recursion. Returns
    /// the address of the *first* half's allocation.
    ///
    /// A successful first half is not rolled back when the second half
    /// fails; the original implementation behaves the same way.
    #[allow(clippy::too_many_arguments)]
    pub fn aligned_alloc_with_split(
        &self,
        ptable: &mut Ptable,
        ipa_begin: Option<Ipaddr>,
        size: usize,
        align_bits: u8,
        mode: Mode,
        owner: u8,
        ppool: &PagePool,
        max_splits: u8,
    ) -> Result<u64, PmaError> {
        match self.aligned_alloc(ptable, ipa_begin, size, align_bits, mode, owner, ppool) {
            Ok(pa) => Ok(pa),
            Err(e) if max_splits == 0 || size <= PAGE_SIZE => Err(e),
            Err(_) => {
                log::debug!(
                    "retrying allocation in split chunks ({} more splits allowed)",
                    max_splits
                );
                // Halve, keeping both halves page-aligned; the odd page goes
                // to the first half.
                let half = size / 2;
                let first = if half % PAGE_SIZE != 0 {
                    (half & !(PAGE_SIZE - 1)) + PAGE_SIZE
                } else {
                    half
                };
                let second = size - first;
                let second_ipa = ipa_begin.map(|ipa| ipa.add(first as u64));

                let pa = self.aligned_alloc_with_split(
                    ptable,
                    ipa_begin,
                    first,
                    align_bits,
                    mode,
                    owner,
                    ppool,
                    max_splits - 1,
                )?;
                self.aligned_alloc_with_split(
                    ptable,
                    second_ipa,
                    second,
                    align_bits,
                    mode,
                    owner,
                    ppool,
                    max_splits - 1,
                )?;
                Ok(pa)
            }
        }
    }

    /// Adds `owner` to an already-allocated chunk and maps it into the
    /// owner's page table.
    pub fn assign(
        &self,
        ptable: &mut Ptable,
        ptr: u64,
        ipa_begin: Option<Ipaddr>,
        size: usize,
        mode: Mode,
        owner: u8,
        ppool: &PagePool,
    ) -> Result<(), PmaError> {
        Self::valid_owner(owner)?;
        if size as u64 > self.size() {
            log::error!("assigning memory of size {} not possible", size);
            return Err(PmaError::TooLarge);
        }
        if owner == HYPERVISOR_OWNER && ipa_begin.is_some() {
            log::error!("an IPA was given for an assignment to the hypervisor");
            return Err(PmaError::BadPointer);
        }

        let Some(start_pn) = self.ptr_to_pn(ptr) else {
            log::error!("pointer {:#x} exceeds page count", ptr);
            return Err(PmaError::BadPointer);
        };
        if self.is_restricted(start_pn) {
            log::error!("illegal assign attempted to restricted section");
            return Err(PmaError::Restricted);
        }
        let Some(end_pn) = self.ptr_to_pn(ptr + size as u64 - 1) else {
            return Err(PmaError::TooLarge);
        };

        {
            let _guard = self.lock.lock();

            if self.load(start_pn) == 0 {
                log::error!("cannot assign an unallocated region, use alloc instead");
                return Err(PmaError::NotAllocated);
            }
            if self.load(start_pn) & own_bit(owner) != 0 {
                log::info!("memory region already assigned to owner {:#04x}", owner);
                return Ok(());
            }

            // Refuse spans that run over a chunk boundary of any owner.
            for pn in start_pn..end_pn {
                if self.load(pn) & ALL_LAST_BITS != 0 {
                    log::error!("memory assignment spans multiple allocations");
                    return Err(PmaError::SpansChunks);
                }
            }

            for pn in start_pn..=end_pn {
                self.pages[pn as usize].fetch_or(own_bit(owner), Ordering::Relaxed);
            }
            self.pages[end_pn as usize].fetch_or(last_bit(owner), Ordering::Relaxed);
        }

        let ipa = ipa_begin.unwrap_or(Ipaddr::new(ptr));
        if let Err(e) = self.map_chunk(ptable, ipa, start_pn, end_pn, mode, owner, ppool) {
            let _guard = self.lock.lock();
            for pn in start_pn..=end_pn {
                self.pages[pn as usize].fetch_and(
                    !(own_bit(owner) | last_bit(owner)),
                    Ordering::Relaxed,
                );
            }
            return Err(e);
        }

        self.cache_add_owner(ptr, owner);
        Ok(())
    }

    /// Removes `owner` from a chunk and unmaps it from the owner's page
    /// table. When the last owner goes, the pages return to the free pool.
    /// `ptr` must be the chunk's start for this owner.
    pub fn free(&self, ptable: &mut Ptable, ptr: u64, owner: u8, ppool: &PagePool) -> Result<(), PmaError> {
        Self::valid_owner(owner)?;

        let Some(start_pn) = self.ptr_to_pn(ptr) else {
            return Err(PmaError::BadPointer);
        };
        if self.is_restricted(start_pn) {
            log::error!("illegal attempt to free a restricted section");
            return Err(PmaError::Restricted);
        }
        if !self.is_start_page(start_pn, owner) {
            log::error!("free of {:#x} which is not a chunk start", ptr);
            return Err(PmaError::BadPointer);
        }

        let end_pn;
        {
            let _guard = self.lock.lock();

            if self.load(start_pn) == 0 {
                log::error!("freeing an unallocated memory region not possible");
                return Err(PmaError::NotAllocated);
            }
            if self.load(start_pn) & own_bit(owner) == 0 {
                log::error!("memory region is not assigned to owner {:#04x}", owner);
                return Err(PmaError::NotAllocated);
            }

            let mut end = start_pn;
            for pn in start_pn..self.page_count {
                let bits = self.load(pn);
                let mut new = bits & !own_bit(owner);
                let is_last = bits & last_bit(owner) != 0;
                if is_last {
                    new &= !last_bit(owner);
                }
                self.pages[pn as usize].store(new, Ordering::Relaxed);
                if is_last {
                    end = pn;
                    break;
                }
            }
            end_pn = end;
        }

        self.cache_remove_owner(ptr, owner);

        let begin = Paddr::new(self.pn_to_ptr(start_pn));
        let end = Paddr::new(self.pn_to_ptr(end_pn + 1));
        ptable.unmap(begin, end, ppool).map_err(|_| PmaError::MapFailed)
    }

    /// Maps an allocated run into `ptable`. Hypervisor mappings are plain
    /// identity maps; VM mappings go through prepare/commit.
    fn map_chunk(
        &self,
        ptable: &mut Ptable,
        ipa: Ipaddr,
        start_pn: u64,
        end_pn: u64,
        mode: Mode,
        owner: u8,
        ppool: &PagePool,
    ) -> Result<(), PmaError> {
        let begin = Paddr::new(self.pn_to_ptr(start_pn));
        let end = Paddr::new(self.pn_to_ptr(end_pn + 1));

        if owner == HYPERVISOR_OWNER {
            ptable
                .identity_map(begin, end, mode, ppool)
                .map(|_| ())
                .map_err(|_| PmaError::MapFailed)
        } else {
            ptable
                .prepare(ipa, begin, end, mode, ppool)
                .map_err(|_| PmaError::MapFailed)?;
            ptable.commit(ipa, begin, end, mode, ppool);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_PAGES: usize = 64;

    struct Fixture {
        pma: &'static Pma,
        ptable: Ptable,
        ppool: &'static PagePool,
    }

    fn fixture() -> Fixture {
        let arena = vec![0u8; (WINDOW_PAGES + 1) * PAGE_SIZE];
        let base = Box::leak(arena.into_boxed_slice()).as_ptr() as u64;
        let base = (base + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);

        let bitmap: &'static [AtomicU16] =
            Box::leak((0..WINDOW_PAGES).map(|_| AtomicU16::new(0)).collect());

        let pool_arena = vec![0u8; 33 * PAGE_SIZE];
        let pool_base = Box::leak(pool_arena.into_boxed_slice()).as_ptr() as u64;
        let pool_base = (pool_base + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        let ppool = Box::leak(Box::new(PagePool::new()));
        unsafe { ppool.init(pool_base, 32) };

        let pma = Box::leak(Box::new(Pma::new(
            base,
            (WINDOW_PAGES * PAGE_SIZE) as u64,
            bitmap,
        )));
        let ptable = Ptable::new_stage2(ppool).unwrap();
        Fixture { pma, ptable, ppool }
    }

    #[test]
    fn alloc_get_size_free_cycle() {
        let mut f = fixture();
        let p = f
            .pma
            .alloc(&mut f.ptable, None, 2 * PAGE_SIZE, Mode::R | Mode::W, 3, f.ppool)
            .unwrap();
        assert_ne!(p, f.pma.fault_ptr());
        assert_eq!(f.pma.get_size(p, 3), 2 * PAGE_SIZE);
        assert!(f.pma.is_assigned(p, 2 * PAGE_SIZE, 3));

        f.pma.free(&mut f.ptable, p, 3, f.ppool).unwrap();
        assert!(!f.pma.is_assigned(p, 2 * PAGE_SIZE, 3));
    }

    #[test]
    fn aligned_alloc_respects_alignment() {
        let mut f = fixture();
        let p = f
            .pma
            .aligned_alloc(&mut f.ptable, None, PAGE_SIZE, 2, Mode::R, 1, f.ppool)
            .unwrap();
        let pn = (p - f.pma.base()) / PAGE_SIZE as u64;
        assert_eq!(pn % 4, 0);
    }

    #[test]
    fn last_bit_sits_on_highest_page() {
        let mut f = fixture();
        let p = f
            .pma
            .alloc(&mut f.ptable, None, 3 * PAGE_SIZE, Mode::R, 2, f.ppool)
            .unwrap();
        let start = (p - f.pma.base()) / PAGE_SIZE as u64;
        for pn in start..start + 2 {
            assert_eq!(f.pma.load(pn) & last_bit(2), 0);
        }
        assert_ne!(f.pma.load(start + 2) & last_bit(2), 0);
    }

    #[test]
    fn zero_size_and_bad_owner_rejected() {
        let mut f = fixture();
        assert_eq!(
            f.pma.alloc(&mut f.ptable, None, 0, Mode::R, 1, f.ppool),
            Err(PmaError::ZeroSize)
        );
        assert_eq!(
            f.pma
                .alloc(&mut f.ptable, None, PAGE_SIZE, Mode::R, MAX_OWNERS, f.ppool),
            Err(PmaError::InvalidOwner)
        );
    }

    #[test]
    fn sentinel_page_is_protected() {
        let mut f = fixture();
        assert_eq!(
            f.pma.free(&mut f.ptable, f.pma.fault_ptr(), HYPERVISOR_OWNER, f.ppool),
            Err(PmaError::Restricted)
        );
    }
}
