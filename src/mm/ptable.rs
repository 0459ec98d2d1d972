//! Two-stage translation table manager.
//!
//! One `Ptable` abstraction covers the hypervisor's stage-1 table and each
//! VM's stage-2 table; the stage only changes how modes are encoded into
//! descriptor attributes. Tables are 4 KiB pages of 512 descriptors
//! allocated from the [`PagePool`], four levels deep (level 0 is the 4 KiB
//! leaf level), covering a 48-bit input space.
//!
//! The update machinery is two-phase: `prepare` allocates every
//! intermediate table a mapping will need (and splits blocks), `commit`
//! then only writes leaf descriptors and therefore cannot fail. `map` and
//! `unmap` are the common prepare+commit composition.

use crate::addr::{Ipaddr, Paddr};
use crate::arch::tlb;
use crate::mm::ppool::PagePool;
use crate::mm::{entry_size, MmError, Mode, PAGE_BITS, PAGE_LEVEL_BITS, PTE_PER_PAGE};

use static_assertions::const_assert_eq;

const_assert_eq!(PTE_PER_PAGE * core::mem::size_of::<u64>(), 4096);

/// Level of the root tables (entries span 512 GiB each).
const ROOT_LEVEL: u8 = 3;
/// Highest level at which block descriptors are architecturally allowed.
const MAX_BLOCK_LEVEL: u8 = 2;
/// End of the translatable input address space (48 bits).
const ADDR_SPACE_END: u64 = 1 << 48;

// ── Descriptor bits ─────────────────────────────────────────────────

const PTE_VALID: u64 = 1 << 0;
/// At non-leaf levels: set = table descriptor. At level 0: set = page.
const PTE_TYPE: u64 = 1 << 1;
const PTE_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

// Stage-1 lower attributes.
const S1_ATTRIDX_NORMAL: u64 = 0b001 << 2; // MAIR index 1: normal WB
const S1_ATTRIDX_DEVICE: u64 = 0b000 << 2; // MAIR index 0: device nGnRnE
const S1_NS: u64 = 1 << 5;
const S1_AP_RO: u64 = 1 << 7;
const S1_SH_INNER: u64 = 0b11 << 8;
const S1_AF: u64 = 1 << 10;
const S1_PXN: u64 = 1 << 53;
const S1_UXN: u64 = 1 << 54;

// Stage-2 lower attributes.
const S2_MEMATTR_NORMAL: u64 = 0b1111 << 2;
const S2_MEMATTR_DEVICE: u64 = 0b0000 << 2;
const S2_AP_R: u64 = 1 << 6;
const S2_AP_W: u64 = 1 << 7;
const S2_SH_INNER: u64 = 0b11 << 8;
const S2_AF: u64 = 1 << 10;
const S2_XN: u64 = 1 << 54;

// Software-reserved bits (55..58), used by stage-2 to track the ownership
// trio and by both stages to keep the mode of invalidated entries.
const SW_UNOWNED: u64 = 1 << 55;
const SW_SHARED: u64 = 1 << 56;
const SW_DEVICE: u64 = 1 << 57;
const SW_NS: u64 = 1 << 58;

#[inline]
const fn pte_is_present(pte: u64) -> bool {
    pte != 0
}

#[inline]
const fn pte_is_valid(pte: u64) -> bool {
    pte & PTE_VALID != 0
}

#[inline]
fn pte_is_table(pte: u64, level: u8) -> bool {
    level > 0 && pte_is_valid(pte) && (pte & PTE_TYPE != 0)
}

#[inline]
const fn pte_addr(pte: u64) -> u64 {
    pte & PTE_ADDR_MASK
}

/// Attribute bits of a leaf descriptor (everything but type and address).
#[inline]
const fn pte_attrs(pte: u64) -> u64 {
    pte & !(PTE_ADDR_MASK | PTE_TYPE)
}

fn mode_to_attrs(mode: Mode) -> u64 {
    let mut attrs = 0u64;

    if mode.contains(Mode::STAGE1) {
        attrs |= S1_AF | S1_SH_INNER;
        if mode.contains(Mode::D) {
            attrs = (attrs & !S1_SH_INNER) | S1_ATTRIDX_DEVICE | SW_DEVICE;
        } else {
            attrs |= S1_ATTRIDX_NORMAL;
        }
        if !mode.contains(Mode::W) {
            attrs |= S1_AP_RO;
        }
        if !mode.contains(Mode::X) || mode.contains(Mode::D) {
            attrs |= S1_PXN | S1_UXN;
        }
        if mode.contains(Mode::NS) {
            attrs |= S1_NS | SW_NS;
        }
    } else {
        attrs |= S2_AF;
        if mode.contains(Mode::D) {
            attrs |= S2_MEMATTR_DEVICE | SW_DEVICE;
        } else {
            attrs |= S2_MEMATTR_NORMAL | S2_SH_INNER;
        }
        if mode.contains(Mode::R) {
            attrs |= S2_AP_R;
        }
        if mode.contains(Mode::W) {
            attrs |= S2_AP_W;
        }
        if !mode.contains(Mode::X) {
            attrs |= S2_XN;
        }
        if mode.contains(Mode::UNOWNED) {
            attrs |= SW_UNOWNED;
        }
        if mode.contains(Mode::SHARED) {
            attrs |= SW_SHARED;
        }
    }

    if !mode.contains(Mode::INVALID) {
        attrs |= PTE_VALID;
    }

    attrs
}

fn attrs_to_mode(attrs: u64, stage1: bool) -> Mode {
    let mut mode = Mode::empty();

    if stage1 {
        mode |= Mode::STAGE1 | Mode::R;
        if attrs & S1_AP_RO == 0 {
            mode |= Mode::W;
        }
        if attrs & (S1_PXN | S1_UXN) == 0 {
            mode |= Mode::X;
        }
        if attrs & SW_DEVICE != 0 {
            mode |= Mode::D;
        }
        if attrs & SW_NS != 0 {
            mode |= Mode::NS;
        }
    } else {
        if attrs & S2_AP_R != 0 {
            mode |= Mode::R;
        }
        if attrs & S2_AP_W != 0 {
            mode |= Mode::W;
        }
        if attrs & S2_XN == 0 {
            mode |= Mode::X;
        }
        if attrs & SW_DEVICE != 0 {
            mode |= Mode::D;
        }
        if attrs & SW_UNOWNED != 0 {
            mode |= Mode::UNOWNED;
        }
        if attrs & SW_SHARED != 0 {
            mode |= Mode::SHARED;
        }
    }

    if attrs & PTE_VALID == 0 {
        mode |= Mode::INVALID;
    }

    mode
}

/// Mode reported for input addresses with no descriptor at all.
fn absent_mode(stage1: bool) -> Mode {
    let mut mode = Mode::INVALID | Mode::UNOWNED;
    if stage1 {
        mode |= Mode::STAGE1;
    }
    mode
}

// Table pages come from the pool, are page aligned and exclusively
// reachable through the ptable holding them; mutation only happens while
// the ptable is borrowed mutably.

#[inline]
fn pte_at(table: u64, idx: usize) -> u64 {
    unsafe { core::ptr::read((table as *const u64).add(idx)) }
}

#[inline]
fn set_pte(table: u64, idx: usize, pte: u64) {
    unsafe { core::ptr::write((table as *mut u64).add(idx), pte) }
}

#[inline]
fn index_at(addr: u64, level: u8) -> usize {
    ((addr >> (PAGE_BITS + level as usize * PAGE_LEVEL_BITS)) & (PTE_PER_PAGE as u64 - 1)) as usize
}

bitflags::bitflags! {
    #[derive(Clone, Copy)]
    struct UpdateFlags: u8 {
        const COMMIT = 0x01;
        const UNMAP  = 0x02;
    }
}

/// A stage-1 or stage-2 translation table.
pub struct Ptable {
    root: u64,
    stage1: bool,
}

impl Ptable {
    /// Allocates an empty root. `stage1` selects hypervisor stage-1
    /// attribute encoding; otherwise VM stage-2.
    pub fn new(stage1: bool, ppool: &PagePool) -> Result<Self, MmError> {
        let root = ppool.alloc().ok_or(MmError::NoTables)?;
        Ok(Self { root, stage1 })
    }

    pub fn new_stage1(ppool: &PagePool) -> Result<Self, MmError> {
        Self::new(true, ppool)
    }

    pub fn new_stage2(ppool: &PagePool) -> Result<Self, MmError> {
        Self::new(false, ppool)
    }

    /// Physical address of the root table, for TTBR/VTTBR programming.
    pub fn root_pa(&self) -> Paddr {
        Paddr::new(self.root)
    }

    pub fn is_stage1(&self) -> bool {
        self.stage1
    }

    /// Releases every table page back to the pool. The mappings themselves
    /// are forgotten, not unmapped; callers must not use the table again.
    pub fn fini(&mut self, ppool: &PagePool) {
        Self::free_subtables(self.root, ROOT_LEVEL, ppool);
        unsafe { ppool.free(self.root) };
        self.root = 0;
    }

    fn free_subtables(table: u64, level: u8, ppool: &PagePool) {
        for idx in 0..PTE_PER_PAGE {
            let pte = pte_at(table, idx);
            if pte_is_table(pte, level) {
                Self::free_subtables(pte_addr(pte), level - 1, ppool);
                unsafe { ppool.free(pte_addr(pte)) };
            }
        }
    }

    fn stage_mode(&self, mode: Mode) -> Mode {
        if self.stage1 {
            mode | Mode::STAGE1
        } else {
            mode - Mode::STAGE1
        }
    }

    /// Maps `[pa_begin, pa_end)` at `ipa_begin` with `mode`. Returns the
    /// end of the mapped input range.
    pub fn map(
        &mut self,
        pa_begin: Paddr,
        pa_end: Paddr,
        ipa_begin: Ipaddr,
        mode: Mode,
        ppool: &PagePool,
    ) -> Result<Ipaddr, MmError> {
        let mode = self.stage_mode(mode);
        let size = pa_end.offset_from(pa_begin);
        self.update(
            ipa_begin.addr(),
            pa_begin.addr(),
            size,
            mode,
            UpdateFlags::empty(),
            ppool,
        )?;
        self.update(
            ipa_begin.addr(),
            pa_begin.addr(),
            size,
            mode,
            UpdateFlags::COMMIT,
            ppool,
        )?;
        self.invalidate(ipa_begin.addr(), size);
        Ok(ipa_begin.add(size))
    }

    /// Identity map: IPA == PA.
    pub fn identity_map(
        &mut self,
        begin: Paddr,
        end: Paddr,
        mode: Mode,
        ppool: &PagePool,
    ) -> Result<Paddr, MmError> {
        self.map(begin, end, Ipaddr::new(begin.addr()), mode, ppool)?;
        Ok(begin)
    }

    /// First phase of a two-phase map: allocates all intermediate tables the
    /// mapping will need, so the matching `commit` cannot fail.
    pub fn prepare(
        &mut self,
        ipa_begin: Ipaddr,
        pa_begin: Paddr,
        pa_end: Paddr,
        mode: Mode,
        ppool: &PagePool,
    ) -> Result<(), MmError> {
        let mode = self.stage_mode(mode);
        self.update(
            ipa_begin.addr(),
            pa_begin.addr(),
            pa_end.offset_from(pa_begin),
            mode,
            UpdateFlags::empty(),
            ppool,
        )
    }

    /// Second phase: writes the leaf descriptors. `prepare` must have
    /// accepted the identical range and mode beforehand.
    pub fn commit(
        &mut self,
        ipa_begin: Ipaddr,
        pa_begin: Paddr,
        pa_end: Paddr,
        mode: Mode,
        ppool: &PagePool,
    ) {
        let mode = self.stage_mode(mode);
        let size = pa_end.offset_from(pa_begin);
        self.update(
            ipa_begin.addr(),
            pa_begin.addr(),
            size,
            mode,
            UpdateFlags::COMMIT,
            ppool,
        )
        .expect("commit after successful prepare cannot fail");
        self.invalidate(ipa_begin.addr(), size);
    }

    /// Removes any mapping of the identity range `[begin, end)`.
    pub fn unmap(&mut self, begin: Paddr, end: Paddr, ppool: &PagePool) -> Result<(), MmError> {
        let mode = self.stage_mode(Mode::INVALID | Mode::UNOWNED);
        let size = end.offset_from(begin);
        self.update(
            begin.addr(),
            begin.addr(),
            size,
            mode,
            UpdateFlags::UNMAP,
            ppool,
        )?;
        self.update(
            begin.addr(),
            begin.addr(),
            size,
            mode,
            UpdateFlags::UNMAP | UpdateFlags::COMMIT,
            ppool,
        )?;
        self.invalidate(begin.addr(), size);
        Ok(())
    }

    fn invalidate(&self, begin: u64, size: u64) {
        if self.stage1 {
            tlb::invalidate_stage1_range(begin, begin + size);
        } else {
            tlb::invalidate_stage2_range(begin, begin + size);
        }
    }

    fn update(
        &mut self,
        ipa_begin: u64,
        pa_begin: u64,
        size: u64,
        mode: Mode,
        flags: UpdateFlags,
        ppool: &PagePool,
    ) -> Result<(), MmError> {
        if ipa_begin % PAGE_SIZE_U64 != 0 || pa_begin % PAGE_SIZE_U64 != 0 {
            return Err(MmError::Unaligned);
        }
        let end = core::cmp::min(ipa_begin + size, ADDR_SPACE_END);
        if ipa_begin >= end {
            return Ok(());
        }
        self.update_level(ipa_begin, end, pa_begin, mode, self.root, ROOT_LEVEL, flags, ppool)
    }

    /// Applies `mode` to `[begin, end)` of input space within `table`,
    /// mapping physical addresses starting at `pa`. Without `COMMIT` this
    /// only allocates; with it, only writes.
    #[allow(clippy::too_many_arguments)]
    fn update_level(
        &self,
        begin: u64,
        end: u64,
        pa: u64,
        mode: Mode,
        table: u64,
        level: u8,
        flags: UpdateFlags,
        ppool: &PagePool,
    ) -> Result<(), MmError> {
        let esize = entry_size(level);
        let attrs = mode_to_attrs(mode);
        let unmap = flags.contains(UpdateFlags::UNMAP);
        let commit = flags.contains(UpdateFlags::COMMIT);

        let mut addr = begin;
        let mut pa = pa;
        let mut idx = index_at(addr, level);

        while addr < end && idx < PTE_PER_PAGE {
            let pte = pte_at(table, idx);
            let chunk_end = core::cmp::min(end, (addr & !(esize - 1)) + esize);

            let whole_entry = addr & (esize - 1) == 0 && chunk_end - addr == esize;
            let can_leaf = level == 0 || level <= MAX_BLOCK_LEVEL;

            if unmap && !pte_is_present(pte) {
                // Nothing mapped here; skip the whole entry.
            } else if whole_entry && (can_leaf || (unmap && !pte_is_table(pte, level))) {
                if commit {
                    let new_pte = if unmap {
                        0
                    } else {
                        let type_bit = if level == 0 { PTE_TYPE } else { 0 };
                        (pa & PTE_ADDR_MASK) | attrs | type_bit
                    };
                    if pte_is_table(pte, level) {
                        Self::free_subtables(pte_addr(pte), level - 1, ppool);
                        unsafe { ppool.free(pte_addr(pte)) };
                    }
                    set_pte(table, idx, new_pte);
                }
            } else {
                // Partial coverage: descend, splitting a leaf if necessary.
                let sub = if pte_is_table(pte, level) {
                    pte_addr(pte)
                } else if commit {
                    // prepare already installed the table.
                    panic!("missing subtable during commit");
                } else {
                    let sub = ppool.alloc().ok_or(MmError::NoTables)?;
                    if pte_is_present(pte) {
                        // Inherit the old leaf into 512 smaller leaves.
                        let inherited = pte_attrs(pte);
                        let child_size = entry_size(level - 1);
                        let child_type = if level - 1 == 0 { PTE_TYPE } else { 0 };
                        for i in 0..PTE_PER_PAGE {
                            set_pte(
                                sub,
                                i,
                                ((pte_addr(pte) + i as u64 * child_size) & PTE_ADDR_MASK)
                                    | inherited
                                    | child_type,
                            );
                        }
                    }
                    set_pte(table, idx, (sub & PTE_ADDR_MASK) | PTE_VALID | PTE_TYPE);
                    sub
                };
                self.update_level(addr, chunk_end, pa, mode, sub, level - 1, flags, ppool)?;
            }

            pa += chunk_end - addr;
            addr = chunk_end;
            idx += 1;
        }

        Ok(())
    }

    /// Returns the mode of `[begin, end)` if it is uniform across the range.
    pub fn get_mode(&self, begin: Ipaddr, end: Ipaddr) -> Result<Mode, MmError> {
        let begin = begin.addr();
        let end = core::cmp::min(end.addr(), ADDR_SPACE_END);
        if begin >= end {
            return Err(MmError::ModeNotUniform);
        }

        let mut mode = None;
        self.walk_modes(begin, end, self.root, ROOT_LEVEL, &mut |m| match mode {
            None => {
                mode = Some(m);
                true
            }
            Some(prev) => prev == m,
        })?;
        mode.ok_or(MmError::ModeNotUniform)
    }

    fn walk_modes(
        &self,
        begin: u64,
        end: u64,
        table: u64,
        level: u8,
        visit: &mut dyn FnMut(Mode) -> bool,
    ) -> Result<(), MmError> {
        let esize = entry_size(level);
        let mut addr = begin;
        let mut idx = index_at(addr, level);

        while addr < end && idx < PTE_PER_PAGE {
            let pte = pte_at(table, idx);
            let chunk_end = core::cmp::min(end, (addr & !(esize - 1)) + esize);

            if pte_is_table(pte, level) {
                self.walk_modes(addr, chunk_end, pte_addr(pte), level - 1, visit)?;
            } else {
                let mode = if pte_is_present(pte) {
                    attrs_to_mode(pte_attrs(pte), self.stage1)
                } else {
                    absent_mode(self.stage1)
                };
                if !visit(mode) {
                    return Err(MmError::ModeNotUniform);
                }
            }

            addr = chunk_end;
            idx += 1;
        }
        Ok(())
    }

    /// Software page walk: translates one input address to the physical
    /// address it maps to, if the mapping is valid.
    pub fn walk(&self, ipa: Ipaddr) -> Option<Paddr> {
        let addr = ipa.addr();
        if addr >= ADDR_SPACE_END {
            return None;
        }
        let mut table = self.root;
        let mut level = ROOT_LEVEL;
        loop {
            let pte = pte_at(table, index_at(addr, level));
            if pte_is_table(pte, level) {
                table = pte_addr(pte);
                level -= 1;
                continue;
            }
            if !pte_is_valid(pte) {
                return None;
            }
            let esize = entry_size(level);
            return Some(Paddr::new(pte_addr(pte) + (addr & (esize - 1))));
        }
    }

    /// Opportunistically coalesces fully-populated, uniformly-mapped
    /// subtables back into block descriptors and frees empty subtables.
    /// Called after a batch of maps; never changes what is mapped.
    pub fn defrag(&mut self, ppool: &PagePool) {
        Self::defrag_level(self.root, ROOT_LEVEL, ppool);
    }

    fn defrag_level(table: u64, level: u8, ppool: &PagePool) -> DefragSummary {
        let esize = entry_size(level);
        let mut run: Option<(u64, u64)> = None; // (attrs, base pa of entry 0)
        let mut any_present = false;
        let mut mergeable = true;

        for idx in 0..PTE_PER_PAGE {
            let mut pte = pte_at(table, idx);

            if pte_is_table(pte, level) {
                let sub = pte_addr(pte);
                match Self::defrag_level(sub, level - 1, ppool) {
                    DefragSummary::Empty => {
                        set_pte(table, idx, 0);
                        unsafe { ppool.free(sub) };
                        pte = 0;
                    }
                    // A subtable mapping one contiguous uniform run folds
                    // back into a single leaf at this level.
                    DefragSummary::Uniform { attrs, base } if level <= MAX_BLOCK_LEVEL => {
                        let type_bit = if level == 0 { PTE_TYPE } else { 0 };
                        pte = (base & PTE_ADDR_MASK) | attrs | type_bit;
                        set_pte(table, idx, pte);
                        unsafe { ppool.free(sub) };
                    }
                    _ => {
                        any_present = true;
                        mergeable = false;
                        continue;
                    }
                }
            }

            if !pte_is_present(pte) {
                mergeable = false;
                continue;
            }
            any_present = true;

            let attrs = pte_attrs(pte);
            let base = pte_addr(pte).wrapping_sub(idx as u64 * esize);
            match run {
                None => run = Some((attrs, base)),
                Some((a, b)) if a == attrs && b == base => {}
                Some(_) => mergeable = false,
            }
        }

        if !any_present {
            return DefragSummary::Empty;
        }
        match run {
            Some((attrs, base)) if mergeable => DefragSummary::Uniform { attrs, base },
            _ => DefragSummary::Mixed,
        }
    }
}

enum DefragSummary {
    /// No descriptor in the table maps anything.
    Empty,
    /// The whole table maps one contiguous run with identical attributes;
    /// `base` is the physical address entry 0 maps.
    Uniform { attrs: u64, base: u64 },
    Mixed,
}

const PAGE_SIZE_U64: u64 = crate::mm::PAGE_SIZE as u64;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PAGE_SIZE;

    fn pool(pages: usize) -> &'static PagePool {
        let v = vec![0u8; (pages + 1) * PAGE_SIZE];
        let base = Box::leak(v.into_boxed_slice()).as_ptr() as u64;
        let base = (base + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        let pool = Box::leak(Box::new(PagePool::new()));
        unsafe { pool.init(base, pages) };
        pool
    }

    #[test]
    fn map_then_walk() {
        let ppool = pool(32);
        let mut pt = Ptable::new_stage2(ppool).unwrap();

        let pa = Paddr::new(0x8000_0000);
        let ipa = Ipaddr::new(0x4000_0000);
        pt.map(pa, pa.add(0x4000), ipa, Mode::R | Mode::W, ppool)
            .unwrap();

        assert_eq!(pt.walk(ipa), Some(pa));
        assert_eq!(pt.walk(ipa.add(0x2004)), Some(pa.add(0x2004)));
        assert_eq!(pt.walk(ipa.add(0x4000)), None);
        pt.fini(ppool);
    }

    #[test]
    fn get_mode_uniform_and_mixed() {
        let ppool = pool(32);
        let mut pt = Ptable::new_stage2(ppool).unwrap();

        let pa = Paddr::new(0x8000_0000);
        let ipa = Ipaddr::new(0x8000_0000);
        pt.map(pa, pa.add(0x3000), ipa, Mode::R | Mode::W | Mode::X, ppool)
            .unwrap();

        let mode = pt.get_mode(ipa, ipa.add(0x3000)).unwrap();
        assert_eq!(mode, Mode::R | Mode::W | Mode::X);

        // Range extending past the mapping is not uniform.
        assert_eq!(
            pt.get_mode(ipa, ipa.add(0x4000)),
            Err(MmError::ModeNotUniform)
        );
        pt.fini(ppool);
    }

    #[test]
    fn map_unmap_restores_previous_mode() {
        let ppool = pool(32);
        let mut pt = Ptable::new_stage2(ppool).unwrap();

        let pa = Paddr::new(0x9000_0000);
        let ipa = Ipaddr::new(0x9000_0000);
        let before = pt.get_mode(ipa, ipa.add(0x2000)).unwrap();
        assert!(before.contains(Mode::INVALID | Mode::UNOWNED));

        pt.map(pa, pa.add(0x2000), ipa, Mode::R, ppool).unwrap();
        pt.unmap(pa, pa.add(0x2000), ppool).unwrap();

        assert_eq!(pt.get_mode(ipa, ipa.add(0x2000)).unwrap(), before);
        pt.fini(ppool);
    }

    #[test]
    fn prepare_then_commit_cannot_fail() {
        let ppool = pool(32);
        let mut pt = Ptable::new_stage2(ppool).unwrap();

        let pa = Paddr::new(0x8000_0000);
        let ipa = Ipaddr::new(0x1_0000_0000);
        pt.prepare(ipa, pa, pa.add(0x1000), Mode::R | Mode::W, ppool)
            .unwrap();
        // Commit only writes leaves; it must succeed with an empty pool.
        while ppool.alloc().is_some() {}
        pt.commit(ipa, pa, pa.add(0x1000), Mode::R | Mode::W, ppool);
        assert_eq!(pt.walk(ipa), Some(pa));
    }

    #[test]
    fn block_mapping_splits_on_partial_unmap() {
        let ppool = pool(64);
        let mut pt = Ptable::new_stage2(ppool).unwrap();

        // A 2 MiB-aligned 2 MiB range maps as a single block.
        let pa = Paddr::new(0x4000_0000);
        pt.identity_map(pa, pa.add(0x20_0000), Mode::R | Mode::W, ppool)
            .unwrap();
        assert_eq!(pt.walk(Ipaddr::new(0x4010_0000)), Some(Paddr::new(0x4010_0000)));

        // Unmapping one page splits the block; neighbours stay mapped.
        pt.unmap(pa.add(0x1000), pa.add(0x2000), ppool).unwrap();
        assert_eq!(pt.walk(Ipaddr::new(0x4000_1000)), None);
        assert_eq!(pt.walk(Ipaddr::new(0x4000_0000)), Some(pa));
        assert_eq!(pt.walk(Ipaddr::new(0x4000_2000)), Some(pa.add(0x2000)));
        pt.fini(ppool);
    }

    #[test]
    fn stage1_modes_round_trip() {
        let ppool = pool(32);
        let mut pt = Ptable::new_stage1(ppool).unwrap();

        let pa = Paddr::new(0x4000_0000);
        pt.identity_map(pa, pa.add(0x1000), Mode::R | Mode::W, ppool)
            .unwrap();
        let mode = pt
            .get_mode(Ipaddr::new(pa.addr()), Ipaddr::new(pa.addr() + 0x1000))
            .unwrap();
        assert!(mode.contains(Mode::R | Mode::W | Mode::STAGE1));
        assert!(!mode.contains(Mode::D));
        pt.fini(ppool);
    }

    #[test]
    fn defrag_frees_split_tables() {
        let ppool = pool(64);
        let mut pt = Ptable::new_stage2(ppool).unwrap();

        let pa = Paddr::new(0x4000_0000);
        pt.identity_map(pa, pa.add(0x20_0000), Mode::R | Mode::W, ppool)
            .unwrap();
        pt.unmap(pa.add(0x1000), pa.add(0x2000), ppool).unwrap();
        pt.identity_map(pa.add(0x1000), pa.add(0x2000), Mode::R | Mode::W, ppool)
            .unwrap();

        let before = ppool.allocated();
        pt.defrag(ppool);
        // The split level-0 table is uniform again and folds into a block.
        assert!(ppool.allocated() < before);
        assert_eq!(pt.walk(Ipaddr::new(0x4000_1000)), Some(pa.add(0x1000)));
        pt.fini(ppool);
    }
}
