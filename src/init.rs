//! One-time system bring-up and per-CPU entry.
//!
//! Ordering matters: the memory subsystem first, then the manifest, then
//! image placement and VM construction, vGIC wiring, the PSCI probe and
//! finally secondary CPU power-on. After `one_time_init` returns the
//! hypervisor is purely reactive.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use arrayvec::ArrayVec;

use crate::addr::Ipaddr;
use crate::arch::smc;
use crate::arch::defs::SMCCC_CALLER_HYPERVISOR;
use crate::cpio;
use crate::cpu::CpuId;
use crate::load::{self, LoadError};
use crate::manifest::{self, ManifestError};
use crate::mm::pma::PmaError;
use crate::platform::MAX_CPUS;
use crate::psci;
use crate::state::{SystemConfig, SystemState};
use crate::vcpu::{VcpuRef, VcpuState};
use crate::vm::{SmcWhitelist, VmConfig};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InitError {
    NoManifest,
    Manifest(ManifestError),
    Load(LoadError),
    Memory(PmaError),
    AlreadyInitialized,
}

impl From<ManifestError> for InitError {
    fn from(e: ManifestError) -> Self {
        InitError::Manifest(e)
    }
}

impl From<LoadError> for InitError {
    fn from(e: LoadError) -> Self {
        InitError::Load(e)
    }
}

impl From<PmaError> for InitError {
    fn from(e: PmaError) -> Self {
        InitError::Memory(e)
    }
}

struct StateCell(UnsafeCell<Option<SystemState>>);
// Written once before secondaries start, read-only afterwards.
unsafe impl Sync for StateCell {}

static STATE: StateCell = StateCell(UnsafeCell::new(None));
static STATE_READY: AtomicBool = AtomicBool::new(false);

/// The installed system state, once `one_time_init` has run.
pub fn system_state() -> Option<&'static SystemState> {
    if !STATE_READY.load(Ordering::Acquire) {
        return None;
    }
    unsafe { (*STATE.0.get()).as_ref() }
}

/// Builds the system state in its static home and runs the full setup.
/// Boot-CPU only; everything happens before any secondary is powered on.
pub fn one_time_init(
    cfg: SystemConfig,
    archive: &[u8],
) -> Result<&'static SystemState, InitError> {
    crate::dlog::init(crate::platform::LOG_LEVEL);

    if STATE_READY.load(Ordering::Acquire) {
        return Err(InitError::AlreadyInitialized);
    }

    let state = SystemState::create(cfg)?;
    let state: &'static SystemState = unsafe {
        let slot = &mut *STATE.0.get();
        *slot = Some(state);
        slot.as_ref().unwrap()
    };

    system_setup(state, archive)?;
    STATE_READY.store(true, Ordering::Release);

    // Secondaries enter through `cpu_entry`, which needs the state to be
    // published, so they are powered on only now.
    start_secondary_cpus(state);
    Ok(state)
}

/// Manifest-driven construction of every VM. Separated from the static
/// plumbing so tests can run it against their own `SystemState`.
pub fn system_setup(state: &SystemState, archive: &[u8]) -> Result<(), InitError> {
    // Keep the boot archive out of the allocator's hands while images are
    // still being copied from it. Archives living outside the managed
    // window (host tests) need no reservation.
    let archive_begin = crate::addr::round_down_to_page(archive.as_ptr() as u64);
    let archive_end =
        crate::addr::round_up_to_page(archive.as_ptr() as u64 + archive.len() as u64);
    if archive_begin >= state.pma.base()
        && archive_end <= state.pma.base() + state.pma.size()
    {
        state.identity_map_and_reserve(
            crate::addr::Paddr::new(archive_begin),
            crate::addr::Paddr::new(archive_end),
            crate::mm::Mode::R,
            crate::mm::pma::HYPERVISOR_OWNER,
        )?;
    }

    let manifest_blob = cpio::find_file(archive, "manifest.dtb").ok_or(InitError::NoManifest)?;
    let parsed = manifest::parse(manifest_blob)?;

    // Re-seed the CPU table from the manifest's CPU assignments, keeping
    // the boot CPU in slot 0.
    let mut cpu_ids: ArrayVec<CpuId, MAX_CPUS> = ArrayVec::new();
    for vm in &parsed.vms {
        for &cpu in &vm.cpus {
            if !cpu_ids.contains(&cpu) && !cpu_ids.is_full() {
                cpu_ids.push(cpu);
            }
        }
    }
    let boot_cpu_id = crate::arch::read_mpidr() & 0x00ff_ffff;
    state.cpus.init(&cpu_ids, boot_cpu_id);

    // Construct VMs in id order so arena indices match manifest ids.
    let mut order: ArrayVec<usize, { crate::platform::MAX_VMS }> = (0..parsed.vms.len()).collect();
    order.sort_unstable_by_key(|&i| parsed.vms[i].id);

    for &i in &order {
        let m = &parsed.vms[i];
        let mut whitelist = SmcWhitelist::new();
        for &smc_id in &m.smc_whitelist {
            let _ = whitelist.smcs.try_push(smc_id);
        }
        whitelist.permissive = m.smc_whitelist_permissive;

        let mut cpus = ArrayVec::new();
        for &c in m.cpus.iter().take(crate::platform::MAX_VCPUS) {
            cpus.push(c);
        }

        let config = VmConfig {
            uuid: m.security_services.first().copied().unwrap_or(uuid::Uuid::nil()),
            vcpu_count: m.vcpu_count,
            cpus,
            smc_whitelist: whitelist,
            security_services: m.security_services.clone(),
            is_primary: m.is_primary,
            requires_identity_mapping: m.requires_identity_mapping,
            ipa_mem_begin: Ipaddr::new(m.ipa_layout.kernel),
            ipa_mem_end: Ipaddr::new(m.ipa_layout.kernel + m.memory_size),
            boot_order: if m.is_primary { u16::MAX } else { m.id },
        };

        let vm = state.vm_init_next(config)?;
        load::load_vm(state, vm, m, archive)?;
        state
            .devices
            .lock()
            .register_platform_devices(vm.id() - crate::vm::VM_ID_OFFSET);
    }

    psci::init();
    Ok(())
}

/// Powers on every assigned CPU except the boot CPU, entering the
/// hypervisor at `cpu_entry`.
pub fn start_secondary_cpus(state: &SystemState) {
    for index in 1..state.cpus.count() {
        let Some(cpu) = state.cpus.get(index) else {
            continue;
        };
        if !cpu.is_assigned() || cpu.is_on() {
            continue;
        }
        let ret = smc::smc64(
            psci::PSCI_CPU_ON,
            cpu.id(),
            cpu_entry as usize as u64,
            cpu.id(),
            SMCCC_CALLER_HYPERVISOR,
        );
        if ret.func == psci::PSCI_RETURN_SUCCESS {
            cpu.set_on();
        } else {
            log::warn!("CPU {:#x} failed to start: {:#x}", cpu.id(), ret.func);
        }
    }
}

/// Binds the calling pCPU to its vCPU and marks it running. Returns the
/// vCPU the platform's guest-entry stub should restore and enter.
pub fn cpu_main(state: &SystemState) -> Option<VcpuRef> {
    let cpu_index = state.current_cpu_index();
    let cpu_id = state.cpus.get(cpu_index)?.id();

    let vm = state.vm_find_from_cpu(cpu_id).or_else(|| state.first_boot_vm())?;
    let vcpu_index = crate::api::vm_vcpu_index_for_cpu(vm, cpu_index)?;
    let r = VcpuRef {
        vm_id: vm.id(),
        vcpu_index,
    };

    let vcpu = vm.vcpu(vcpu_index)?;
    {
        let mut g = vcpu.lock();
        g.cpu_index = Some(cpu_index);
        vcpu.set_state(&mut g, VcpuState::Running);
        g.regs_available = false;
    }
    state.set_current_vcpu(cpu_index, Some(r));
    crate::arch::handler::maybe_invalidate_tlb(state, r);

    log::info!(
        "CPU {:#x} bound to VM {:#x} vCPU {}",
        cpu_id,
        r.vm_id,
        r.vcpu_index
    );
    Some(r)
}

/// Secondary CPU entry, targeted by PSCI_CPU_ON. The platform bring-up
/// stub establishes the EL2 stack and exception vectors before the world
/// switch; from here on everything is reactive trap handling.
#[no_mangle]
pub extern "C" fn cpu_entry(_context: u64) -> ! {
    let state = system_state().expect("secondary started before init");
    let _ = cpu_main(state);

    // The guest-entry stub takes over from the vCPU state; without one
    // (or if the CPU has no vCPU) the core parks.
    loop {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        unsafe {
            core::arch::asm!("wfe", options(nostack, nomem))
        };
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        core::hint::spin_loop();
    }
}
