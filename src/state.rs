//! System-wide state.
//!
//! All singletons (the CPU table, the VM arena, the page allocator, the
//! hypervisor stage-1 table, the interrupt-owner table) are fields of one
//! `SystemState` constructed at init and passed around as an explicit
//! context. Locks are attached to the pieces of state, not to the whole.
//!
//! Lock ranking, outermost first: VM lock → vCPU lock → PMA lock → vGIC
//! lock. The stage-2 table of a VM is guarded by that VM's lock.

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use crate::addr::{Ipaddr, Paddr};
use crate::cpu::{CpuId, CpuSet};
use crate::devices::DeviceRegistry;
use crate::mm::pma::{Pma, PmaError, HYPERVISOR_OWNER};
use crate::mm::ppool::PagePool;
use crate::mm::ptable::Ptable;
use crate::mm::{Mode, PAGE_SIZE};
use crate::platform::MAX_VMS;
use crate::sync::SpinLock;
use crate::vcpu::VcpuRef;
use crate::vm::{Vm, VmConfig, VM_ID_OFFSET};

/// Physical interrupt IDs tracked by the owner table.
pub const MAX_INTERRUPTS: usize = 1024;

/// Geometry of the real GIC. Tests point this at an arena; the board
/// constants in `platform` provide the real values.
#[derive(Clone, Copy, Debug)]
pub struct GicMap {
    pub gicd_base: u64,
    pub gicd_size: u64,
    pub gits_base: u64,
    pub gits_size: u64,
    pub gicr_base: u64,
    pub gicr_frame_size: u64,
}

impl GicMap {
    pub fn from_platform() -> Self {
        use crate::platform::*;
        Self {
            gicd_base: GICD_BASE,
            gicd_size: GICD_SIZE,
            gits_base: GITS_BASE,
            gits_size: GITS_SIZE,
            gicr_base: GICR_BASE,
            gicr_frame_size: GICR_FRAME_SIZE,
        }
    }
}

/// Global map from physical interrupt id to the owning VM (0 = unowned).
pub struct InterruptOwners {
    owners: [AtomicU16; MAX_INTERRUPTS],
}

impl InterruptOwners {
    const fn new() -> Self {
        Self {
            owners: [const { AtomicU16::new(0) }; MAX_INTERRUPTS],
        }
    }

    pub fn owner(&self, intid: u32) -> Option<u16> {
        let id = self.owners.get(intid as usize)?.load(Ordering::Relaxed);
        (id != 0).then_some(id)
    }

    pub fn set_owner(&self, intid: u32, vm_id: u16) {
        if let Some(slot) = self.owners.get(intid as usize) {
            slot.store(vm_id, Ordering::Relaxed);
        }
    }
}

/// Everything needed to stand up a `SystemState`.
pub struct SystemConfig {
    /// Managed RAM window.
    pub phys_base: u64,
    pub phys_size: u64,
    /// Owner bitmap backing store, one entry per page of the window.
    pub bitmap: &'static [core::sync::atomic::AtomicU16],
    /// Translation-table pool region (page aligned).
    pub table_pool_base: u64,
    pub table_pool_pages: usize,
    pub gic: GicMap,
    pub boot_cpu_id: CpuId,
    pub cpu_ids: &'static [CpuId],
}

pub struct SystemState {
    pub pma: Pma,
    pub ppool: PagePool,
    /// Hypervisor stage-1 table.
    pub stage1: SpinLock<Ptable>,
    pub cpus: CpuSet,
    pub gic: GicMap,
    pub interrupts: InterruptOwners,
    /// Serializes every vGIC register access across pCPUs.
    pub vgic_lock: SpinLock<()>,
    pub devices: SpinLock<DeviceRegistry>,
    vms: [Vm; MAX_VMS],
    vm_count: AtomicU16,
    /// Head of the boot-order list (VM id, 0 = empty).
    first_boot_vm: AtomicU16,
    /// Current vCPU per pCPU index, packed as (vm_id << 16 | vcpu + 1).
    current: [AtomicU32; crate::platform::MAX_CPUS],
}

impl SystemState {
    /// Builds the memory subsystem and the empty VM arena. The sentinel
    /// page is mapped inaccessible in stage-1 and the table-pool region is
    /// reserved when it lies inside the managed window.
    pub fn create(cfg: SystemConfig) -> Result<Self, PmaError> {
        let ppool = PagePool::new();
        unsafe { ppool.init(cfg.table_pool_base, cfg.table_pool_pages) };

        let pma = Pma::new(cfg.phys_base, cfg.phys_size, cfg.bitmap);
        let mut stage1 = Ptable::new_stage1(&ppool).map_err(|_| PmaError::MapFailed)?;

        // Accesses through a null-ish pointer must fault in the hypervisor
        // too.
        let fault = Paddr::new(pma.fault_ptr());
        stage1
            .identity_map(fault, fault.add(PAGE_SIZE as u64), Mode::I, &ppool)
            .map_err(|_| PmaError::MapFailed)?;

        let pool_end = cfg.table_pool_base + (cfg.table_pool_pages * PAGE_SIZE) as u64;
        if cfg.table_pool_base >= cfg.phys_base && pool_end <= cfg.phys_base + cfg.phys_size {
            pma.reserve_memory(cfg.table_pool_base, pool_end, HYPERVISOR_OWNER)?;
        }

        let cpus = CpuSet::new();
        cpus.init(cfg.cpu_ids, cfg.boot_cpu_id);

        Ok(Self {
            pma,
            ppool,
            stage1: SpinLock::new(stage1),
            cpus,
            gic: cfg.gic,
            interrupts: InterruptOwners::new(),
            vgic_lock: SpinLock::new(()),
            devices: SpinLock::new(DeviceRegistry::new()),
            vms: [const { Vm::new() }; MAX_VMS],
            vm_count: AtomicU16::new(0),
            first_boot_vm: AtomicU16::new(0),
            current: [const { AtomicU32::new(0) }; crate::platform::MAX_CPUS],
        })
    }

    // ── VM arena ────────────────────────────────────────────────────

    pub fn vm_count(&self) -> u16 {
        self.vm_count.load(Ordering::Relaxed)
    }

    pub fn vm_find(&self, id: u16) -> Option<&Vm> {
        if id < VM_ID_OFFSET {
            return None;
        }
        self.vm_find_index(id - VM_ID_OFFSET)
    }

    pub fn vm_find_index(&self, index: u16) -> Option<&Vm> {
        if index >= self.vm_count() || index as usize >= MAX_VMS {
            return None;
        }
        Some(&self.vms[index as usize])
    }

    /// Creates the next VM with the given configuration and a fresh
    /// stage-2 table. Init-time only.
    pub fn vm_init_next(&self, config: VmConfig) -> Result<&Vm, PmaError> {
        let index = self.vm_count();
        if index as usize >= MAX_VMS {
            log::error!("too many VMs initialized");
            return Err(PmaError::NoMemory);
        }
        if config.vcpu_count as usize > config.cpus.len() {
            log::error!("not enough physical CPUs assigned to VM");
            return Err(PmaError::InvalidOwner);
        }

        let vm = &self.vms[index as usize];
        let id = index + VM_ID_OFFSET;

        let ptable = Ptable::new_stage2(&self.ppool).map_err(|_| PmaError::NoMemory)?;
        for &cpu_id in &config.cpus {
            let Some(cpu) = self.cpus.find(cpu_id) else {
                log::error!("unable to find CPU {:#x}", cpu_id);
                return Err(PmaError::InvalidOwner);
            };
            cpu.set_assigned();
        }

        vm.configure(id, config);
        {
            let mut inner = vm.lock();
            inner.ptable = Some(ptable);
        }
        // Bind each vCPU to its physical CPU index.
        for (vcpu_idx, &cpu_id) in vm.config().cpus.iter().enumerate() {
            if vcpu_idx >= vm.vcpu_count() as usize {
                break;
            }
            if let Some(cpu) = self.cpus.find(cpu_id) {
                let index = self.cpus.index_of(cpu);
                if let Some(vcpu) = vm.vcpu(vcpu_idx as u16) {
                    vcpu.lock().cpu_index = Some(index);
                }
            }
        }

        self.vm_count.store(index + 1, Ordering::Release);
        Ok(vm)
    }

    /// The VM whose CPU list contains `cpu_id`; CPU 0 falls back to the
    /// first boot VM.
    pub fn vm_find_from_cpu(&self, cpu_id: CpuId) -> Option<&Vm> {
        if cpu_id == 0 {
            return self.first_boot_vm();
        }
        (0..self.vm_count())
            .filter_map(|i| self.vm_find_index(i))
            .find(|vm| vm.vcpu_index_of_cpu(cpu_id).is_some())
    }

    // ── boot order ──────────────────────────────────────────────────

    pub fn first_boot_vm(&self) -> Option<&Vm> {
        let id = self.first_boot_vm.load(Ordering::Relaxed);
        (id != 0).then(|| self.vm_find(id)).flatten()
    }

    /// Inserts `vm` into the boot list, ordered by descending
    /// `boot_order`.
    pub fn vm_update_boot(&self, vm: &Vm) {
        let id = vm.id();
        let order = vm.config().boot_order;

        let head = self.first_boot_vm.load(Ordering::Relaxed);
        if head == 0 {
            self.first_boot_vm.store(id, Ordering::Relaxed);
            return;
        }

        let mut prev: Option<&Vm> = None;
        let mut cursor = Some(head);
        while let Some(cur_id) = cursor {
            let cur = self.vm_find(cur_id).expect("boot list corrupt");
            if cur.config().boot_order < order {
                break;
            }
            cursor = cur.lock().next_boot;
            prev = Some(cur);
        }

        match prev {
            None => {
                vm.lock().next_boot = Some(head);
                self.first_boot_vm.store(id, Ordering::Relaxed);
            }
            Some(p) => {
                let mut p_inner = p.lock();
                vm.lock().next_boot = p_inner.next_boot;
                p_inner.next_boot = Some(id);
            }
        }
    }

    // ── current vCPU per pCPU ───────────────────────────────────────

    pub fn set_current_vcpu(&self, cpu_index: usize, vcpu: Option<VcpuRef>) {
        let packed = vcpu.map_or(0, |r| ((r.vm_id as u32) << 16) | (r.vcpu_index as u32 + 1));
        self.current[cpu_index].store(packed, Ordering::Release);
    }

    pub fn current_vcpu(&self, cpu_index: usize) -> Option<VcpuRef> {
        let packed = self.current[cpu_index].load(Ordering::Acquire);
        (packed != 0).then(|| VcpuRef {
            vm_id: (packed >> 16) as u16,
            vcpu_index: (packed & 0xffff) as u16 - 1,
        })
    }

    /// The pCPU index the caller is executing on, from MPIDR.
    pub fn current_cpu_index(&self) -> usize {
        let mpidr = crate::arch::read_mpidr() & 0x00ff_ffff;
        self.cpus
            .find(mpidr)
            .map(|c| self.cpus.index_of(c))
            .unwrap_or(0)
    }

    // ── hypervisor memory sugar ─────────────────────────────────────

    /// Allocates zeroed identity-mapped memory for the hypervisor itself.
    pub fn hypervisor_alloc(&self, size: usize, mode: Mode) -> Result<u64, PmaError> {
        let mut stage1 = self.stage1.lock();
        let ptr = self
            .pma
            .alloc(&mut stage1, None, size, mode, HYPERVISOR_OWNER, &self.ppool)?;
        unsafe { core::ptr::write_bytes(ptr as *mut u8, 0, size) };
        Ok(ptr)
    }

    pub fn hypervisor_assign(&self, ptr: u64, size: usize, mode: Mode) -> Result<(), PmaError> {
        let mut stage1 = self.stage1.lock();
        self.pma
            .assign(&mut stage1, ptr, None, size, mode, HYPERVISOR_OWNER, &self.ppool)
    }

    pub fn hypervisor_free(&self, ptr: u64) -> Result<(), PmaError> {
        let mut stage1 = self.stage1.lock();
        self.pma
            .free(&mut stage1, ptr, HYPERVISOR_OWNER, &self.ppool)
    }

    /// Atomically reserves `[begin, end)` for `owner` and identity-maps it
    /// in the hypervisor's stage-1. Used to take device MMIO windows and
    /// mailbox pages without the chunk machinery.
    pub fn identity_map_and_reserve(
        &self,
        begin: Paddr,
        end: Paddr,
        mode: Mode,
        owner: u8,
    ) -> Result<(), PmaError> {
        self.pma.reserve_memory(begin.addr(), end.addr(), owner)?;
        let mut stage1 = self.stage1.lock();
        if stage1.identity_map(begin, end, mode, &self.ppool).is_err() {
            self.pma.release_memory(begin.addr(), end.addr(), owner)?;
            return Err(PmaError::MapFailed);
        }
        Ok(())
    }

    /// Unmaps a stage-1 range (mailbox teardown path).
    pub fn hypervisor_unmap(&self, begin: Paddr, end: Paddr) -> Result<(), PmaError> {
        let mut stage1 = self.stage1.lock();
        stage1
            .unmap(begin, end, &self.ppool)
            .map_err(|_| PmaError::MapFailed)
    }

    // ── helpers used by the trap paths ──────────────────────────────

    /// Resolves a `VcpuRef` to its VM and vCPU. Panics on a dangling ref:
    /// refs only come from validated switches.
    pub fn vcpu(&self, r: VcpuRef) -> (&Vm, &crate::vcpu::Vcpu) {
        let vm = self.vm_find(r.vm_id).expect("dangling vm ref");
        let vcpu = vm.vcpu(r.vcpu_index).expect("dangling vcpu ref");
        (vm, vcpu)
    }

    /// Translates a faulting IPA through a VM's stage-2 table.
    pub fn vm_walk_ipa(&self, vm: &Vm, ipa: Ipaddr) -> Option<Paddr> {
        let inner = vm.lock();
        inner.ptable.as_ref()?.walk(ipa)
    }
}
