//! PSCI broker: permissions, CPU power control and the EL3 adaptation.
//!
//! The fake monitor is process-global; tests serialize on one mutex.

mod common;

use std::sync::Mutex;

use arrayvec::ArrayVec;
use peregrine::addr::Ipaddr;
use peregrine::arch::smc;
use peregrine::psci::{self, *};
use peregrine::state::SystemState;
use peregrine::vcpu::{VcpuRef, VcpuState};
use peregrine::vm::{SmcWhitelist, VmConfig};

static SERIAL: Mutex<()> = Mutex::new(());

fn lock_fakes() -> std::sync::MutexGuard<'static, ()> {
    let guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    smc::fake::reset();
    smc::fake::queue_result(0x0001_0001);
    psci::init();
    smc::fake::reset();
    guard
}

/// Three VMs so a true secondary exists beyond the proxy id: the primary
/// on CPUs 0-1, the proxy VM on CPU 2, a secondary with two vCPUs on CPU 3
/// (and CPU 2 shared notionally for index math).
fn fixture() -> (&'static SystemState, VcpuRef, VcpuRef, VcpuRef) {
    let state = common::make_state(256);

    let mk = |vcpus: &[u64], is_primary: bool, mem: u64| {
        let mut cpus = ArrayVec::new();
        for &c in vcpus {
            cpus.push(c);
        }
        VmConfig {
            uuid: uuid::Uuid::nil(),
            vcpu_count: vcpus.len() as u16,
            cpus,
            smc_whitelist: SmcWhitelist::new(),
            security_services: ArrayVec::new(),
            is_primary,
            requires_identity_mapping: false,
            ipa_mem_begin: Ipaddr::new(mem),
            ipa_mem_end: Ipaddr::new(mem + 0x10_0000),
            boot_order: if is_primary { u16::MAX } else { 0 },
        }
    };

    state.vm_init_next(mk(&[0x0, 0x1], true, 0x1000_0000)).unwrap();
    state.vm_init_next(mk(&[0x2], false, 0x2000_0000)).unwrap();
    state.vm_init_next(mk(&[0x2, 0x3], false, 0x3000_0000)).unwrap();

    for vm_id in 1..=3u16 {
        let vm = state.vm_find(vm_id).unwrap();
        let vcpu = vm.vcpu(0).unwrap();
        let mut g = vcpu.lock();
        vcpu.set_state(&mut g, VcpuState::Running);
    }

    (
        state,
        VcpuRef { vm_id: 1, vcpu_index: 0 },
        VcpuRef { vm_id: 2, vcpu_index: 0 },
        VcpuRef { vm_id: 3, vcpu_index: 0 },
    )
}

fn call(
    state: &SystemState,
    cur: VcpuRef,
    func: u64,
    a0: u64,
    a1: u64,
    a2: u64,
) -> (u64, Option<VcpuRef>) {
    let mut next = None;
    let ret = psci::handler(state, cur, func, a0, a1, a2, &mut next).expect("a PSCI call");
    (ret, next)
}

#[test]
fn version_and_features() {
    let _g = lock_fakes();
    let (state, primary, ..) = fixture();

    assert_eq!(call(state, primary, PSCI_VERSION, 0, 0, 0).0, 0x0001_0001);
    assert_eq!(call(state, primary, PSCI_FEATURES, PSCI_CPU_ON, 0, 0).0, 0);
    assert_eq!(
        call(state, primary, PSCI_FEATURES, 0x8400_0042, 0, 0).0,
        PSCI_ERROR_NOT_SUPPORTED
    );
    assert_eq!(
        call(state, primary, PSCI_MIGRATE, 0, 0, 0).0,
        PSCI_ERROR_NOT_SUPPORTED
    );
}

#[test]
fn cpu_on_rejects_unowned_cpus() {
    let _g = lock_fakes();
    let (state, primary, ..) = fixture();

    // Affinity 5 resolves past the primary's two vCPUs.
    let (ret, _) = call(state, primary, PSCI_CPU_ON, 5, 0x8000_0000, 0);
    assert_eq!(ret, PSCI_ERROR_NO_PERMISSION);
    assert_eq!(smc::fake::call_count(), 0);
}

#[test]
fn cpu_on_boots_the_target_vcpu() {
    let _g = lock_fakes();
    let (state, primary, ..) = fixture();

    let entry = 0x8040_0000u64;
    let ctx = 0xfeed_u64;
    smc::fake::queue_result(PSCI_RETURN_SUCCESS);
    let (ret, _) = call(state, primary, PSCI_CPU_ON, 1, entry, ctx);
    assert_eq!(ret, PSCI_RETURN_SUCCESS);

    // The physical CPU is tracked as on and the bound vCPU will start at
    // the requested entry with the context in x0.
    assert!(state.cpus.find(0x1).unwrap().is_on());
    let vm = state.vm_find(1).unwrap();
    let g = vm.vcpu(1).unwrap().lock();
    assert_eq!(g.state(), VcpuState::Ready);
    assert_eq!(g.regs.pc, entry);
    assert_eq!(g.regs.r[0], ctx);
}

#[test]
fn cpu_on_retries_while_target_reports_already_on() {
    let _g = lock_fakes();
    let (state, primary, ..) = fixture();

    smc::fake::queue_result(PSCI_ERROR_ALREADY_ON);
    smc::fake::queue_result(PSCI_ERROR_ALREADY_ON);
    smc::fake::queue_result(PSCI_RETURN_SUCCESS);

    let (ret, _) = call(state, primary, PSCI_CPU_ON, 1, 0x8000_0000, 0);
    assert_eq!(ret, PSCI_RETURN_SUCCESS);
    assert_eq!(smc::fake::call_count(), 3);
}

#[test]
fn cpu_on_failure_rolls_back_the_power_state() {
    let _g = lock_fakes();
    let (state, primary, ..) = fixture();

    smc::fake::queue_result(PSCI_ERROR_INVALID_PARAMETERS);
    let (ret, _) = call(state, primary, PSCI_CPU_ON, 1, 0x8000_0000, 0);
    assert_eq!(ret, PSCI_ERROR_INVALID_PARAMETERS);
    assert!(!state.cpus.find(0x1).unwrap().is_on());
}

#[test]
fn affinity_info_reports_power_state() {
    let _g = lock_fakes();
    let (state, primary, ..) = fixture();

    assert_eq!(
        call(state, primary, PSCI_AFFINITY_INFO, 1, 0, 0).0,
        PSCI_RETURN_OFF
    );
    state.cpus.find(0x1).unwrap().set_on();
    assert_eq!(
        call(state, primary, PSCI_AFFINITY_INFO, 1, 0, 0).0,
        PSCI_RETURN_ON
    );
    // Affinity levels above 0 are unsupported.
    assert_eq!(
        call(state, primary, PSCI_AFFINITY_INFO, 1, 1, 0).0,
        PSCI_ERROR_NOT_SUPPORTED
    );
}

#[test]
fn proxy_vm_id_uses_the_primary_path() {
    let _g = lock_fakes();
    let (state, _, proxy, _) = fixture();

    // A power call from VM 2 is handled like a primary call, gated by its
    // own CPU assignment (one vCPU: affinity 1 is out of range).
    let (ret, next) = call(state, proxy, PSCI_CPU_ON, 1, 0x8000_0000, 0);
    assert_eq!(ret, PSCI_ERROR_NO_PERMISSION);
    assert!(next.is_none());
}

#[test]
fn secondary_cpu_on_starts_a_sibling_vcpu() {
    let _g = lock_fakes();
    let (state, _, _, secondary) = fixture();

    let (ret, next) = call(state, secondary, PSCI_CPU_ON, 1, 0x9000_0000, 0x77);
    assert_eq!(ret, PSCI_RETURN_SUCCESS);
    // The pCPU is handed to the primary to schedule the new vCPU.
    assert_eq!(next, Some(VcpuRef { vm_id: 1, vcpu_index: 0 }));

    let vm = state.vm_find(3).unwrap();
    let g = vm.vcpu(1).unwrap().lock();
    assert_eq!(g.state(), VcpuState::Ready);
    assert_eq!(g.regs.pc, 0x9000_0000);
    assert_eq!(g.regs.r[0], 0x77);

    // Starting it again reports it already on.
    let vm = state.vm_find(3).unwrap();
    let vcpu = vm.vcpu(0).unwrap();
    let mut g2 = vcpu.lock();
    vcpu.set_state(&mut g2, VcpuState::Running);
    drop(g2);
    let (ret, _) = call(state, secondary, PSCI_CPU_ON, 1, 0x9000_0000, 0x77);
    assert_eq!(ret, PSCI_ERROR_ALREADY_ON);
}

#[test]
fn secondary_cpu_off_and_suspend_cooperate_with_the_scheduler() {
    let _g = lock_fakes();
    let (state, primary, _, secondary) = fixture();

    let (ret, next) = call(state, secondary, PSCI_CPU_SUSPEND, 0, 0, 0);
    assert_eq!(ret, PSCI_RETURN_SUCCESS);
    assert_eq!(next, Some(primary));
    {
        let vm = state.vm_find(3).unwrap();
        let vcpu = vm.vcpu(0).unwrap();
        assert_eq!(vcpu.peek_state(), VcpuState::BlockedInterrupt);
        let mut g = vcpu.lock();
        vcpu.set_state(&mut g, VcpuState::Running);
    }

    let (ret, next) = call(state, secondary, PSCI_CPU_OFF, 0, 0, 0);
    assert_eq!(ret, PSCI_ERROR_DENIED);
    assert_eq!(next, Some(primary));
    let vm = state.vm_find(3).unwrap();
    assert_eq!(vm.vcpu(0).unwrap().peek_state(), VcpuState::Off);
}

#[test]
fn secondary_affinity_info_uses_vcpu_state() {
    let _g = lock_fakes();
    let (state, _, _, secondary) = fixture();

    assert_eq!(
        call(state, secondary, PSCI_AFFINITY_INFO, 1, 0, 0).0,
        PSCI_RETURN_OFF
    );
    assert_eq!(
        call(state, secondary, PSCI_AFFINITY_INFO, 0, 0, 0).0,
        PSCI_RETURN_ON
    );
    assert_eq!(
        call(state, secondary, PSCI_AFFINITY_INFO, 7, 0, 0).0,
        PSCI_ERROR_INVALID_PARAMETERS
    );
}
