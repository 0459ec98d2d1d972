//! PSCI broker.
//!
//! Guests see a minimal PSCI 1.1 implementation. Power calls from the
//! primary are translated to real pCPU power actions by adapting the EL3
//! PSCI implementation; every call that names a CPU is gated by the
//! per-VM permission check. Secondary VMs get the vCPU-level
//! implementation that cooperates with the primary's scheduler.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::addr::Ipaddr;
use crate::api;
use crate::arch::defs::*;
use crate::arch::smc;
use crate::cpu::{Cpu, CpuId, CPU_INVALID_ID};
use crate::state::SystemState;
use crate::vcpu::VcpuRef;
use crate::vm::{Vm, PRIMARY_VM_ID};

// Function IDs (32-bit convention; bit 30 masked off before matching).
pub const PSCI_VERSION: u64 = 0x8400_0000;
pub const PSCI_CPU_SUSPEND: u64 = 0x8400_0001;
pub const PSCI_CPU_OFF: u64 = 0x8400_0002;
pub const PSCI_CPU_ON: u64 = 0x8400_0003;
pub const PSCI_AFFINITY_INFO: u64 = 0x8400_0004;
pub const PSCI_MIGRATE: u64 = 0x8400_0005;
pub const PSCI_MIGRATE_INFO_TYPE: u64 = 0x8400_0006;
pub const PSCI_MIGRATE_INFO_UP_CPU: u64 = 0x8400_0007;
pub const PSCI_SYSTEM_OFF: u64 = 0x8400_0008;
pub const PSCI_SYSTEM_RESET: u64 = 0x8400_0009;
pub const PSCI_FEATURES: u64 = 0x8400_000A;
pub const PSCI_CPU_FREEZE: u64 = 0x8400_000B;
pub const PSCI_CPU_DEFAULT_SUSPEND: u64 = 0x8400_000C;
pub const PSCI_NODE_HW_STATE: u64 = 0x8400_000D;
pub const PSCI_SYSTEM_SUSPEND: u64 = 0x8400_000E;
pub const PSCI_SET_SUSPEND_MODE: u64 = 0x8400_000F;
pub const PSCI_STAT_RESIDENCY: u64 = 0x8400_0010;
pub const PSCI_STAT_COUNT: u64 = 0x8400_0011;
pub const PSCI_SYSTEM_RESET2: u64 = 0x8400_0012;
pub const PSCI_MEM_PROTECT: u64 = 0x8400_0013;
pub const PSCI_MEM_PROTECT_CHECK_RANGE: u64 = 0x8400_0014;

pub const PSCI_VERSION_0_2: u32 = 0x0000_0002;
pub const PSCI_VERSION_1_1: u32 = 0x0001_0001;

// Return values.
pub const PSCI_RETURN_SUCCESS: u64 = 0;
pub const PSCI_RETURN_ON: u64 = 0;
pub const PSCI_RETURN_OFF: u64 = 1;
pub const PSCI_ERROR_NOT_SUPPORTED: u64 = (-1i64) as u64;
pub const PSCI_ERROR_INVALID_PARAMETERS: u64 = (-2i64) as u64;
pub const PSCI_ERROR_DENIED: u64 = (-3i64) as u64;
pub const PSCI_ERROR_ALREADY_ON: u64 = (-4i64) as u64;
/// Power calls naming a CPU outside the caller's assignment.
pub const PSCI_ERROR_NO_PERMISSION: u64 = PSCI_ERROR_DENIED;

/// VM id that is dispatched through the primary power path alongside the
/// primary itself. Observed behavior of the system this reimplements; kept
/// until its purpose is clarified.
pub const PSCI_PROXY_VM_ID: u16 = 2;

/// EL3 PSCI version, probed once at boot. Starts at 1.1 so the broker is
/// fully functional before (and without) the probe.
static EL3_VERSION: AtomicU32 = AtomicU32::new(PSCI_VERSION_1_1);

/// Probes the EL3 PSCI implementation. A version of 0 marks EL3 PSCI as
/// unusable and blocks standard secure service calls.
pub fn init() {
    let ret = smc::smc32(PSCI_VERSION, 0, 0, 0, SMCCC_CALLER_HYPERVISOR);
    let version = match ret.func {
        x if x == SMCCC_ERROR_UNKNOWN => 0,
        v => v as u32,
    };
    EL3_VERSION.store(version, Ordering::Relaxed);
    log::info!(
        "EL3 PSCI version {}.{}",
        version >> 16,
        version & 0xffff
    );
}

fn el3_version() -> u32 {
    EL3_VERSION.load(Ordering::Relaxed)
}

/// Resolves a guest-supplied affinity to the physical CPU the calling VM
/// is allowed to act on, or `CPU_INVALID_ID`.
pub fn check_permission(vm: &Vm, cpu_aff: u64) -> CpuId {
    let cpu_no = crate::arch::aff_to_no(cpu_aff);
    if cpu_no < vm.vcpu_count() as u64 {
        return vm.config().cpus[cpu_no as usize];
    }
    CPU_INVALID_ID
}

/// Address secondary CPUs enter the hypervisor at after PSCI_CPU_ON.
fn cpu_entry_point() -> u64 {
    crate::init::cpu_entry as usize as u64
}

/// Handles PSCI requests from the primary VM (and the proxy VM id) by
/// adapting the EL3 PSCI implementation.
fn primary_vm_handler(
    state: &SystemState,
    cur: VcpuRef,
    func: u64,
    arg0: u64,
    arg1: u64,
    arg2: u64,
) -> Option<u64> {
    let (vm, vcpu) = state.vcpu(cur);

    // With no usable EL3 PSCI, block standard secure service calls by
    // reporting them unknown; everything else passes through.
    if el3_version() == 0 {
        return ((func & SMCCC_SERVICE_CALL_MASK) == SMCCC_STANDARD_SECURE_SERVICE_CALL)
            .then_some(SMCCC_ERROR_UNKNOWN);
    }

    let ret = match func & !SMCCC_CONVENTION_MASK {
        PSCI_VERSION => PSCI_VERSION_1_1 as u64,

        PSCI_FEATURES => match arg0 & !SMCCC_CONVENTION_MASK {
            PSCI_CPU_SUSPEND => {
                if el3_version() == PSCI_VERSION_0_2 {
                    // PSCI 0.2 has no PSCI_FEATURES; report 0.2-compatible
                    // suspend features.
                    0
                } else {
                    // PSCI 1.x defines exactly two feature bits.
                    smc::smc32(func, arg0, 0, 0, SMCCC_CALLER_HYPERVISOR).func & 0x3
                }
            }
            PSCI_VERSION | PSCI_FEATURES | PSCI_SYSTEM_OFF | PSCI_SYSTEM_RESET
            | PSCI_AFFINITY_INFO | PSCI_CPU_OFF | PSCI_CPU_ON => 0,
            _ => PSCI_ERROR_NOT_SUPPORTED,
        },

        PSCI_SYSTEM_OFF => {
            smc::smc32(PSCI_SYSTEM_OFF, 0, 0, 0, SMCCC_CALLER_HYPERVISOR);
            panic!("system off failed");
        }

        PSCI_SYSTEM_RESET => {
            smc::smc32(PSCI_SYSTEM_RESET, 0, 0, 0, SMCCC_CALLER_HYPERVISOR);
            panic!("system reset failed");
        }

        PSCI_AFFINITY_INFO => 'affinity: {
            let cpu_id = check_permission(vm, arg0);
            if cpu_id == CPU_INVALID_ID {
                log::warn!("VM {:#x} not allowed to issue PSCI_AFFINITY_INFO", vm.id());
                break 'affinity PSCI_ERROR_NO_PERMISSION;
            }
            let Some(cpu) = state.cpus.find(cpu_id) else {
                break 'affinity PSCI_ERROR_INVALID_PARAMETERS;
            };
            if arg1 != 0 {
                // Affinity levels above 0 are not supported.
                break 'affinity PSCI_ERROR_NOT_SUPPORTED;
            }
            if cpu.is_on() {
                PSCI_RETURN_ON
            } else {
                PSCI_RETURN_OFF
            }
        }

        PSCI_CPU_SUSPEND => 'suspend: {
            let cpu_id = check_permission(vm, arg0);
            if cpu_id == CPU_INVALID_ID {
                log::warn!("VM {:#x} not allowed to issue PSCI_CPU_SUSPEND", vm.id());
                break 'suspend PSCI_ERROR_NO_PERMISSION;
            }
            // Arrange to wake at the provided entry point. If the suspend
            // returns (failure or standby state) the SMC return value is
            // what the guest sees and the updated registers are ignored.
            {
                let mut g = vcpu.lock();
                g.regs.set_pc_arg(Ipaddr::new(arg1), arg2);
            }
            smc::smc64(
                PSCI_CPU_SUSPEND,
                cpu_id,
                cpu_entry_point(),
                cpu_id,
                SMCCC_CALLER_HYPERVISOR,
            )
            .func
        }

        PSCI_CPU_OFF => {
            let cpu_id = check_permission(vm, arg0);
            if cpu_id == CPU_INVALID_ID {
                log::warn!("VM {:#x} not allowed to issue PSCI_CPU_OFF", vm.id());
                PSCI_ERROR_NO_PERMISSION
            } else {
                if let Some(index) = vcpu.lock().cpu_index {
                    if let Some(cpu) = state.cpus.get(index) {
                        cpu.set_off();
                        crate::vgic::reroute_all_interrupts(state, vm, cpu.id());
                    }
                }
                smc::smc32(PSCI_CPU_OFF, 0, 0, 0, SMCCC_CALLER_HYPERVISOR);
                panic!("CPU off failed");
            }
        }

        PSCI_CPU_ON => 'cpu_on: {
            let cpu_id = check_permission(vm, arg0);
            if cpu_id == CPU_INVALID_ID {
                log::warn!("VM {:#x} not allowed to issue PSCI_CPU_ON", vm.id());
                break 'cpu_on PSCI_ERROR_NO_PERMISSION;
            }
            let Some(cpu) = state.cpus.find(cpu_id) else {
                break 'cpu_on PSCI_ERROR_INVALID_PARAMETERS;
            };

            if cpu_on(state, cpu, Ipaddr::new(arg1), arg2) {
                break 'cpu_on PSCI_ERROR_ALREADY_ON;
            }

            // Turning a CPU on can race with it still turning itself off;
            // retry while EL3 reports it on.
            let mut ret;
            loop {
                ret = smc::smc64(
                    PSCI_CPU_ON,
                    cpu_id,
                    cpu_entry_point(),
                    cpu_id,
                    SMCCC_CALLER_HYPERVISOR,
                )
                .func;
                if ret != PSCI_ERROR_ALREADY_ON {
                    break;
                }
            }

            if ret != PSCI_RETURN_SUCCESS {
                cpu.set_off();
            }
            ret
        }

        PSCI_MIGRATE | PSCI_MIGRATE_INFO_TYPE | PSCI_MIGRATE_INFO_UP_CPU | PSCI_CPU_FREEZE
        | PSCI_CPU_DEFAULT_SUSPEND | PSCI_NODE_HW_STATE | PSCI_SYSTEM_SUSPEND
        | PSCI_SET_SUSPEND_MODE | PSCI_STAT_RESIDENCY | PSCI_STAT_COUNT | PSCI_SYSTEM_RESET2
        | PSCI_MEM_PROTECT | PSCI_MEM_PROTECT_CHECK_RANGE => PSCI_ERROR_NOT_SUPPORTED,

        _ => return None,
    };

    Some(ret)
}

/// Marks a CPU on and, when it was off, programs the boot registers of the
/// vCPU bound to it. Returns the previous power state.
fn cpu_on(state: &SystemState, cpu: &Cpu, entry: Ipaddr, arg: u64) -> bool {
    let prev = cpu.set_on();
    if prev {
        return true;
    }

    let Some(vm) = state.vm_find_from_cpu(cpu.id()) else {
        log::warn!("no VM bound to CPU {:#x}", cpu.id());
        return prev;
    };
    let Some(index) = vm.vcpu_index_of_cpu(cpu.id()) else {
        log::warn!("unable to identify vCPU index of CPU {:#x}", cpu.id());
        return prev;
    };
    if let Some(vcpu) = vm.vcpu(index) {
        let mut g = vcpu.lock();
        vcpu.on(&mut g, entry, arg);
    }
    prev
}

/// Handles PSCI requests from a secondary VM: vCPU power management in
/// collaboration with the primary's scheduler.
fn secondary_vm_handler(
    state: &SystemState,
    cur: VcpuRef,
    func: u64,
    arg0: u64,
    arg1: u64,
    arg2: u64,
    next: &mut Option<VcpuRef>,
) -> Option<u64> {
    let (vm, _) = state.vcpu(cur);

    let ret = match func & !SMCCC_CONVENTION_MASK {
        PSCI_VERSION => PSCI_VERSION_1_1 as u64,

        PSCI_FEATURES => match arg0 & !SMCCC_CONVENTION_MASK {
            // Extended StateID format, no OS-initiated mode.
            PSCI_CPU_SUSPEND => 0x2,
            PSCI_VERSION | PSCI_FEATURES | PSCI_AFFINITY_INFO | PSCI_CPU_OFF | PSCI_CPU_ON => 0,
            _ => PSCI_ERROR_NOT_SUPPORTED,
        },

        PSCI_AFFINITY_INFO => 'affinity: {
            if arg1 != 0 {
                break 'affinity PSCI_ERROR_INVALID_PARAMETERS;
            }
            let target_index = arg0 as u16;
            if target_index >= vm.vcpu_count() {
                break 'affinity PSCI_ERROR_INVALID_PARAMETERS;
            }
            let vcpu = vm.vcpu(target_index).unwrap();
            if vcpu.lock().is_off() {
                PSCI_RETURN_OFF
            } else {
                PSCI_RETURN_ON
            }
        }

        // Downgrade suspend to WFI, as the specification allows.
        PSCI_CPU_SUSPEND => {
            *next = Some(api::wait_for_interrupt(state, cur));
            PSCI_RETURN_SUCCESS
        }

        PSCI_CPU_OFF => {
            // Should never return to the caller, but in case it somehow
            // does.
            *next = Some(api::vcpu_off(state, cur));
            PSCI_ERROR_DENIED
        }

        PSCI_CPU_ON => 'cpu_on: {
            let target_index = arg0 as u16;
            if target_index >= vm.vcpu_count() {
                break 'cpu_on PSCI_ERROR_INVALID_PARAMETERS;
            }
            let target_vcpu = vm.vcpu(target_index).unwrap();
            let was_off = {
                let mut g = target_vcpu.lock();
                target_vcpu.secondary_reset_and_start(&mut g, Ipaddr::new(arg1), arg2)
            };

            if was_off {
                let target = VcpuRef {
                    vm_id: cur.vm_id,
                    vcpu_index: target_index,
                };
                *next = Some(api::wake_up(state, cur, target));
                PSCI_RETURN_SUCCESS
            } else {
                PSCI_ERROR_ALREADY_ON
            }
        }

        PSCI_SYSTEM_OFF | PSCI_SYSTEM_RESET | PSCI_MIGRATE | PSCI_MIGRATE_INFO_TYPE
        | PSCI_MIGRATE_INFO_UP_CPU | PSCI_CPU_FREEZE | PSCI_CPU_DEFAULT_SUSPEND
        | PSCI_NODE_HW_STATE | PSCI_SYSTEM_SUSPEND | PSCI_SET_SUSPEND_MODE
        | PSCI_STAT_RESIDENCY | PSCI_STAT_COUNT | PSCI_SYSTEM_RESET2 | PSCI_MEM_PROTECT
        | PSCI_MEM_PROTECT_CHECK_RANGE => PSCI_ERROR_NOT_SUPPORTED,

        _ => return None,
    };

    Some(ret)
}

/// PSCI entry from HVC/SMC dispatch. Returns the x0 value when the call
/// was a PSCI one; `next` is set when the pCPU must switch vCPUs.
pub fn handler(
    state: &SystemState,
    cur: VcpuRef,
    func: u64,
    arg0: u64,
    arg1: u64,
    arg2: u64,
    next: &mut Option<VcpuRef>,
) -> Option<u64> {
    if cur.vm_id == PRIMARY_VM_ID || cur.vm_id == PSCI_PROXY_VM_ID {
        primary_vm_handler(state, cur, func, arg0, arg1, arg2)
    } else {
        secondary_vm_handler(state, cur, func, arg0, arg1, arg2, next)
    }
}
