//! Virtual CPU state.
//!
//! A vCPU is pinned to one physical CPU for its whole life. Everything
//! mutable sits behind the vCPU lock; state transitions only happen in the
//! context of the pCPU running (or scheduling) the vCPU, so the scheduler
//! can track state from run-call return codes.

use crate::arch::regs::ArchRegs;
use crate::ffa;
use crate::sync::{lock_both, SpinLock, SpinLockGuard};

/// Number of virtual interrupt IDs tracked per vCPU.
pub const NUM_INTIDS: usize = 64;
const INTID_WORD_BITS: usize = 32;
const INTID_WORDS: usize = NUM_INTIDS / INTID_WORD_BITS;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VcpuState {
    /// Switched off.
    Off,
    /// Ready to be run.
    Ready,
    /// Currently executing on its pCPU.
    Running,
    /// Waiting for a message.
    BlockedMailbox,
    /// Waiting for an interrupt (WFI).
    BlockedInterrupt,
    /// Preempted by a physical interrupt.
    Preempted,
    /// Taken a fatal error; never runs again.
    Aborted,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InterruptType {
    Irq,
    Fiq,
}

/// Per-vCPU virtual interrupt bitmaps.
///
/// The counters cache how many IDs are simultaneously enabled and pending
/// of each pin type; `irq_count + fiq_count` always equals the popcount of
/// `enabled & pending`.
#[derive(Clone, Copy, Debug)]
pub struct Interrupts {
    enabled: [u32; INTID_WORDS],
    pending: [u32; INTID_WORDS],
    /// Bit set = FIQ pin, clear = IRQ pin.
    int_type: [u32; INTID_WORDS],
    irq_count: u32,
    fiq_count: u32,
}

impl Interrupts {
    pub const fn new() -> Self {
        Self {
            enabled: [0; INTID_WORDS],
            pending: [0; INTID_WORDS],
            int_type: [0; INTID_WORDS],
            irq_count: 0,
            fiq_count: 0,
        }
    }

    #[inline]
    fn split(intid: u32) -> (usize, u32) {
        (
            intid as usize / INTID_WORD_BITS,
            1u32 << (intid as usize % INTID_WORD_BITS),
        )
    }

    fn type_of(&self, word: usize, mask: u32) -> InterruptType {
        if self.int_type[word] & mask != 0 {
            InterruptType::Fiq
        } else {
            InterruptType::Irq
        }
    }

    fn bump(&mut self, t: InterruptType, up: bool) {
        let counter = match t {
            InterruptType::Irq => &mut self.irq_count,
            InterruptType::Fiq => &mut self.fiq_count,
        };
        if up {
            *counter += 1;
        } else {
            *counter -= 1;
        }
    }

    /// Enables or disables an interrupt ID, updating the pin type and the
    /// enabled-and-pending counters.
    pub fn enable(&mut self, intid: u32, enable: bool, int_type: InterruptType) -> Result<(), ()> {
        if intid as usize >= NUM_INTIDS {
            return Err(());
        }
        let (word, mask) = Self::split(intid);

        if enable {
            if self.pending[word] & !self.enabled[word] & mask != 0 {
                self.bump(int_type, true);
            }
            self.enabled[word] |= mask;
            match int_type {
                InterruptType::Irq => self.int_type[word] &= !mask,
                InterruptType::Fiq => self.int_type[word] |= mask,
            }
        } else {
            if self.pending[word] & self.enabled[word] & mask != 0 {
                self.bump(self.type_of(word, mask), false);
            }
            self.enabled[word] &= !mask;
            self.int_type[word] &= !mask;
        }
        Ok(())
    }

    /// Marks an interrupt pending. Returns true when this made it newly
    /// enabled-and-pending (i.e. the vCPU may need waking). IDs beyond the
    /// tracked range are delivered through the vGIC only and are dropped
    /// here.
    pub fn inject(&mut self, intid: u32) -> bool {
        if intid as usize >= NUM_INTIDS {
            return false;
        }
        let (word, mask) = Self::split(intid);
        let newly = self.enabled[word] & !self.pending[word] & mask != 0;
        if newly {
            self.bump(self.type_of(word, mask), true);
        }
        self.pending[word] |= mask;
        newly
    }

    /// Takes the lowest enabled-and-pending ID, deactivating it.
    pub fn get(&mut self) -> Option<u32> {
        for word in 0..INTID_WORDS {
            let ready = self.enabled[word] & self.pending[word];
            if ready != 0 {
                let bit = ready.trailing_zeros();
                let mask = 1u32 << bit;
                self.pending[word] &= !mask;
                self.bump(self.type_of(word, mask), false);
                return Some((word * INTID_WORD_BITS) as u32 + bit);
            }
        }
        None
    }

    pub fn irq_count(&self) -> u32 {
        self.irq_count
    }

    pub fn fiq_count(&self) -> u32 {
        self.fiq_count
    }

    pub fn count(&self) -> u32 {
        self.irq_count + self.fiq_count
    }

    /// Recomputes the counters from the bitmaps; true when the cached
    /// values agree. Debug aid for the count invariant.
    pub fn counts_consistent(&self) -> bool {
        let mut irq = 0;
        let mut fiq = 0;
        for word in 0..INTID_WORDS {
            let ready = self.enabled[word] & self.pending[word];
            fiq += (ready & self.int_type[word]).count_ones();
            irq += (ready & !self.int_type[word]).count_ones();
        }
        irq == self.irq_count && fiq == self.fiq_count
    }
}

impl Default for Interrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl VcpuState {
    const fn encode(self) -> u8 {
        match self {
            VcpuState::Off => 0,
            VcpuState::Ready => 1,
            VcpuState::Running => 2,
            VcpuState::BlockedMailbox => 3,
            VcpuState::BlockedInterrupt => 4,
            VcpuState::Preempted => 5,
            VcpuState::Aborted => 6,
        }
    }

    const fn decode(v: u8) -> Self {
        match v {
            0 => VcpuState::Off,
            1 => VcpuState::Ready,
            2 => VcpuState::Running,
            3 => VcpuState::BlockedMailbox,
            4 => VcpuState::BlockedInterrupt,
            5 => VcpuState::Preempted,
            _ => VcpuState::Aborted,
        }
    }
}

pub struct VcpuInner {
    state: VcpuState,
    /// Index of the bound physical CPU in the CPU table.
    pub cpu_index: Option<usize>,
    pub regs: ArchRegs,
    pub interrupts: Interrupts,
    /// False only while the register file lives in hardware because the
    /// vCPU is executing on a pCPU.
    pub regs_available: bool,
}

impl VcpuInner {
    pub fn state(&self) -> VcpuState {
        self.state
    }

    /// Whether the vCPU counts as off for PSCI purposes. Aborted still
    /// counts as on: per PSCI a core is only off after CPU_OFF or before
    /// its first CPU_ON.
    pub fn is_off(&self) -> bool {
        matches!(self.state, VcpuState::Off)
    }

    /// Reflects the enabled-and-pending counts into the saved HCR VI/VF
    /// bits, so the interrupt fires on the next guest entry.
    pub fn update_virtual_interrupts(&mut self) {
        use crate::arch::defs::{HCR_EL2_VF, HCR_EL2_VI};
        if self.interrupts.irq_count() > 0 {
            self.regs.hcr_el2 |= HCR_EL2_VI;
        } else {
            self.regs.hcr_el2 &= !HCR_EL2_VI;
        }
        if self.interrupts.fiq_count() > 0 {
            self.regs.hcr_el2 |= HCR_EL2_VF;
        } else {
            self.regs.hcr_el2 &= !HCR_EL2_VF;
        }
    }
}

pub struct Vcpu {
    inner: SpinLock<VcpuInner>,
    /// Lock-free snapshot of `inner.state` for readers that may not take
    /// the vCPU lock (interrupt rerouting under the vGIC lock). Writes
    /// happen only through `set_state` while the vCPU lock is held.
    state_mirror: core::sync::atomic::AtomicU8,
}

impl Vcpu {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(VcpuInner {
                state: VcpuState::Off,
                cpu_index: None,
                regs: ArchRegs::new(),
                interrupts: Interrupts::new(),
                regs_available: true,
            }),
            state_mirror: core::sync::atomic::AtomicU8::new(VcpuState::Off.encode()),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, VcpuInner> {
        self.inner.lock()
    }

    /// Locks two vCPUs in address order.
    pub fn lock_both<'a>(
        a: &'a Vcpu,
        b: &'a Vcpu,
    ) -> (SpinLockGuard<'a, VcpuInner>, SpinLockGuard<'a, VcpuInner>) {
        lock_both(&a.inner, &b.inner)
    }

    /// The only way to change a vCPU's state; the guard proves the lock is
    /// held.
    pub fn set_state(&self, inner: &mut VcpuInner, state: VcpuState) {
        inner.state = state;
        self.state_mirror
            .store(state.encode(), core::sync::atomic::Ordering::Release);
    }

    /// Lock-free state snapshot; may be stale by the time it is used.
    pub fn peek_state(&self) -> VcpuState {
        VcpuState::decode(self.state_mirror.load(core::sync::atomic::Ordering::Acquire))
    }

    /// Programs the entry point and argument and makes the vCPU runnable.
    pub fn on(&self, inner: &mut VcpuInner, entry: crate::addr::Ipaddr, arg: u64) {
        inner.regs.set_pc_arg(entry, arg);
        self.set_state(inner, VcpuState::Ready);
    }

    /// Resets and starts a secondary vCPU. Returns true if it was off and
    /// is now started; false if it was already on and nothing was done.
    pub fn secondary_reset_and_start(
        &self,
        inner: &mut VcpuInner,
        entry: crate::addr::Ipaddr,
        arg: u64,
    ) -> bool {
        let was_off = inner.is_off();
        if was_off {
            inner.regs.reset();
            self.on(inner, entry, arg);
        }
        was_off
    }
}

impl Default for Vcpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the fault paths need to know about an abort taken from a
/// lower EL.
#[derive(Clone, Copy, Debug)]
pub struct FaultInfo {
    pub ipaddr: crate::addr::Ipaddr,
    pub vaddr: crate::addr::Vaddr,
    pub pc: u64,
    /// The access the guest attempted (R, W or X).
    pub mode: crate::mm::Mode,
}

/// Reference to a vCPU by arena position instead of pointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VcpuRef {
    pub vm_id: u16,
    pub vcpu_index: u16,
}

impl VcpuRef {
    pub fn arg1(&self) -> u64 {
        ffa::vm_vcpu(self.vm_id, self.vcpu_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_track_enabled_and_pending() {
        let mut ints = Interrupts::new();
        ints.enable(3, true, InterruptType::Irq).unwrap();
        assert_eq!(ints.count(), 0);

        assert!(ints.inject(3));
        assert_eq!(ints.irq_count(), 1);
        assert!(ints.counts_consistent());

        // Re-injecting a pending interrupt does not double count.
        assert!(!ints.inject(3));
        assert_eq!(ints.irq_count(), 1);

        assert_eq!(ints.get(), Some(3));
        assert_eq!(ints.count(), 0);
        assert!(ints.counts_consistent());
    }

    #[test]
    fn pending_before_enable_counts_on_enable() {
        let mut ints = Interrupts::new();
        assert!(!ints.inject(5));
        assert_eq!(ints.count(), 0);

        ints.enable(5, true, InterruptType::Irq).unwrap();
        assert_eq!(ints.irq_count(), 1);
        assert!(ints.counts_consistent());

        // Disabling while pending drops the count again.
        ints.enable(5, false, InterruptType::Irq).unwrap();
        assert_eq!(ints.count(), 0);
        assert!(ints.counts_consistent());
    }

    #[test]
    fn fiq_type_is_counted_separately() {
        let mut ints = Interrupts::new();
        ints.enable(7, true, InterruptType::Fiq).unwrap();
        ints.inject(7);
        assert_eq!(ints.fiq_count(), 1);
        assert_eq!(ints.irq_count(), 0);
        assert!(ints.counts_consistent());
    }

    #[test]
    fn out_of_range_id_rejected() {
        let mut ints = Interrupts::new();
        assert!(ints.enable(NUM_INTIDS as u32, true, InterruptType::Irq).is_err());
    }
}
