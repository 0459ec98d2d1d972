//! Physical CPU table.
//!
//! Seeded once at boot from the manifest CPU list; after that only the
//! power state changes, under the per-CPU lock.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::arch::cache;
use crate::platform::{MAX_CPUS, STACK_SIZE};
use crate::sync::SpinLock;

/// MPIDR-style affinity value identifying a physical CPU.
pub type CpuId = u64;

/// Returned when an affinity value resolves to no CPU the caller may use.
pub const CPU_INVALID_ID: CpuId = u64::MAX;

/// The stacks to be used by the CPUs.
///
/// Aligned to page boundaries so cache lines are not shared between a
/// CPU's stack and data that other CPUs access; the stack is used before
/// caching is enabled.
#[repr(C, align(4096))]
struct CallStacks([[u8; STACK_SIZE]; MAX_CPUS]);

static CALLSTACKS: CallStacks = CallStacks([[0; STACK_SIZE]; MAX_CPUS]);

static_assertions::const_assert_eq!(STACK_SIZE % crate::mm::PAGE_SIZE, 0);

pub struct CpuPower {
    pub is_on: bool,
    pub is_assigned: bool,
}

pub struct Cpu {
    id: AtomicU64,
    power: SpinLock<CpuPower>,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            id: AtomicU64::new(0),
            power: SpinLock::new(CpuPower {
                is_on: false,
                is_assigned: false,
            }),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id.load(Ordering::Relaxed)
    }

    pub fn is_on(&self) -> bool {
        self.power.lock().is_on
    }

    /// Marks the CPU on; returns the previous state.
    pub fn set_on(&self) -> bool {
        let mut p = self.power.lock();
        core::mem::replace(&mut p.is_on, true)
    }

    pub fn set_off(&self) {
        self.power.lock().is_on = false;
    }

    pub fn is_assigned(&self) -> bool {
        self.power.lock().is_assigned
    }

    pub fn set_assigned(&self) {
        self.power.lock().is_assigned = true;
    }

    /// Top of this CPU's boot stack.
    pub fn stack_bottom(&self, index: usize) -> u64 {
        CALLSTACKS.0[index].as_ptr() as u64 + STACK_SIZE as u64
    }
}

pub struct CpuSet {
    cpus: [Cpu; MAX_CPUS],
    count: AtomicUsize,
}

impl CpuSet {
    pub const fn new() -> Self {
        Self {
            cpus: [const { Cpu::new() }; MAX_CPUS],
            count: AtomicUsize::new(1),
        }
    }

    /// Seeds the table from the configured CPU list. The boot CPU keeps
    /// slot 0 and is already on.
    pub fn init(&self, cpu_ids: &[CpuId], boot_cpu_id: CpuId) {
        let count = core::cmp::min(cpu_ids.len(), MAX_CPUS);
        self.count.store(count, Ordering::Relaxed);

        let mut found_boot_cpu = false;
        for (i, &id) in cpu_ids.iter().take(count).enumerate() {
            let slot = if !found_boot_cpu && id == boot_cpu_id {
                found_boot_cpu = true;
                &self.cpus[0]
            } else {
                &self.cpus[i]
            };
            slot.id.store(id, Ordering::Relaxed);
            let mut p = slot.power.lock();
            p.is_assigned = false;
            p.is_on = core::ptr::eq(slot, &self.cpus[0]);
        }

        if !found_boot_cpu {
            log::warn!("boot CPU's ID not found in config");
            self.cpus[0].id.store(boot_cpu_id, Ordering::Relaxed);
            self.cpus[0].power.lock().is_on = true;
        }

        // Secondary cores read this table with the MMU (and therefore the
        // data cache) still off.
        cache::clean_range(
            self.cpus.as_ptr() as u64,
            core::mem::size_of_val(&self.cpus),
        );
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get(&self, index: usize) -> Option<&Cpu> {
        (index < self.count()).then(|| &self.cpus[index])
    }

    pub fn index_of(&self, cpu: &Cpu) -> usize {
        (cpu as *const Cpu as usize - self.cpus.as_ptr() as usize) / core::mem::size_of::<Cpu>()
    }

    /// Searches for a CPU by its affinity id.
    pub fn find(&self, id: CpuId) -> Option<&Cpu> {
        let max = core::cmp::min(self.count(), MAX_CPUS);
        self.cpus[..max].iter().find(|c| c.id() == id)
    }

}

impl Default for CpuSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_cpu_keeps_slot_zero() {
        let set = CpuSet::new();
        set.init(&[0x100, 0x0, 0x200], 0x0);
        assert_eq!(set.get(0).unwrap().id(), 0x0);
        assert!(set.get(0).unwrap().is_on());
        assert!(!set.get(1).unwrap().is_on());
        assert_eq!(set.count(), 3);
    }

    #[test]
    fn find_and_power_cycle() {
        let set = CpuSet::new();
        set.init(&[0x0, 0x1], 0x0);
        let c = set.find(0x1).unwrap();
        assert!(!c.is_on());
        assert!(!c.set_on());
        assert!(c.set_on());
        c.set_off();
        assert!(!c.is_on());
    }
}
