//! Trap dispatch: WFI/WFE, SMC forwarding policy, MSR traps, fault
//! recovery and physical-interrupt delegation.
//!
//! The fake monitor and system-register file are process-global, so the
//! tests in this file serialize on one mutex.

mod common;

use std::sync::Mutex;

use arrayvec::ArrayVec;
use peregrine::addr::Ipaddr;
use peregrine::api::Transition;
use peregrine::arch::defs::*;
use peregrine::arch::handler::{self, TrapContext};
use peregrine::arch::{smc, sysregs, timer};
use peregrine::ffa;
use peregrine::mm::{Mode, PAGE_SIZE};
use peregrine::psci;
use peregrine::state::SystemState;
use peregrine::vcpu::{VcpuRef, VcpuState};
use peregrine::vm::{InterruptDescriptor, SmcWhitelist, VmConfig};

static SERIAL: Mutex<()> = Mutex::new(());

fn lock_fakes() -> std::sync::MutexGuard<'static, ()> {
    let guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    smc::fake::reset();
    sysregs::fake::reset();
    // A sane EL3: PSCI 1.1.
    smc::fake::queue_result(0x0001_0001);
    psci::init();
    smc::fake::reset();
    guard
}

struct Fixture {
    state: &'static SystemState,
    primary: VcpuRef,
    secondary: VcpuRef,
}

fn fixture(permissive: bool, whitelist: &[u32]) -> Fixture {
    let state = common::make_state(512);

    for (idx, (cpu, is_primary)) in [(0u64, true), (1u64, false)].iter().enumerate() {
        let mut cpus = ArrayVec::new();
        cpus.push(*cpu);
        let mut wl = SmcWhitelist::new();
        if !*is_primary {
            wl.permissive = permissive;
            for &s in whitelist {
                wl.smcs.push(s);
            }
        }
        let vm = state
            .vm_init_next(VmConfig {
                uuid: uuid::Uuid::nil(),
                vcpu_count: 1,
                cpus,
                smc_whitelist: wl,
                security_services: ArrayVec::new(),
                is_primary: *is_primary,
                requires_identity_mapping: false,
                ipa_mem_begin: Ipaddr::new(0x1000_0000 * (idx as u64 + 1)),
                ipa_mem_end: Ipaddr::new(0x1000_0000 * (idx as u64 + 1) + 0x10_0000),
                boot_order: if *is_primary { u16::MAX } else { 1 },
            })
            .unwrap();
        let vcpu = vm.vcpu(0).unwrap();
        let mut g = vcpu.lock();
        vcpu.set_state(&mut g, VcpuState::Running);
    }

    Fixture {
        state,
        primary: VcpuRef { vm_id: 1, vcpu_index: 0 },
        secondary: VcpuRef { vm_id: 2, vcpu_index: 0 },
    }
}

fn wfi_ctx() -> TrapContext {
    TrapContext {
        esr: (EC_WFI_WFE << 26) | (1 << 25),
        far: 0,
        hpfar: 0,
    }
}

fn msr_ctx(op0: u64, op1: u64, crn: u64, crm: u64, op2: u64, rt: u64, read: bool) -> u64 {
    let mut esr = (EC_MSR << 26)
        | (1 << 25)
        | (op0 << 20)
        | (op2 << 17)
        | (op1 << 14)
        | (crn << 10)
        | (rt << 5)
        | (crm << 1);
    if read {
        esr |= 1;
    }
    esr
}

#[test]
fn wfi_blocks_and_reports_timer_deadline() {
    let _g = lock_fakes();
    let f = fixture(false, &[]);

    timer::fake::COUNTER.store(1_000, core::sync::atomic::Ordering::Relaxed);
    {
        let (_, vcpu) = f.state.vcpu(f.secondary);
        let mut g = vcpu.lock();
        g.regs.pc = 0x4000;
        // Armed virtual timer one second of counter ticks ahead.
        g.regs.peripherals.cntv_ctl_el0 = 1;
        g.regs.peripherals.cntv_cval_el0 = 1_000 + 62_500_000;
    }

    let t = handler::sync_lower_exception(f.state, f.secondary, &wfi_ctx());
    assert_eq!(t, Transition::SwitchTo(f.primary));

    let (_, sec) = f.state.vcpu(f.secondary);
    assert_eq!(sec.peek_state(), VcpuState::BlockedInterrupt);
    assert_eq!(sec.lock().regs.pc, 0x4004);

    let (_, pri) = f.state.vcpu(f.primary);
    let g = pri.lock();
    assert_eq!(g.regs.r[0], ffa::RUN_WAIT_FOR_INTERRUPT);
    assert_eq!(g.regs.r[1], ffa::vm_vcpu(2, 0));
    // Roughly one second in nanoseconds.
    assert!(g.regs.r[2] > 900_000_000 && g.regs.r[2] <= 1_000_000_000);
}

#[test]
fn wfi_with_expired_timer_reports_interrupt() {
    let _g = lock_fakes();
    let f = fixture(false, &[]);

    timer::fake::COUNTER.store(10_000, core::sync::atomic::Ordering::Relaxed);
    {
        let (_, vcpu) = f.state.vcpu(f.secondary);
        let mut g = vcpu.lock();
        g.regs.peripherals.cntv_ctl_el0 = 1;
        g.regs.peripherals.cntv_cval_el0 = 500; // already fired
    }

    handler::sync_lower_exception(f.state, f.secondary, &wfi_ctx());
    let (_, pri) = f.state.vcpu(f.primary);
    let g = pri.lock();
    assert_eq!(g.regs.r[0], ffa::FFA_INTERRUPT_32);
    assert_eq!(g.regs.r[2], 0);
}

#[test]
fn wfi_without_timer_sleeps_indefinitely() {
    let _g = lock_fakes();
    let f = fixture(false, &[]);

    handler::sync_lower_exception(f.state, f.secondary, &wfi_ctx());
    let (_, pri) = f.state.vcpu(f.primary);
    assert_eq!(pri.lock().regs.r[2], ffa::SLEEP_INDEFINITE);
}

#[test]
fn wfe_yields_to_primary() {
    let _g = lock_fakes();
    let f = fixture(false, &[]);

    let ctx = TrapContext {
        esr: (EC_WFI_WFE << 26) | (1 << 25) | 1, // TI = WFE
        far: 0,
        hpfar: 0,
    };
    let t = handler::sync_lower_exception(f.state, f.secondary, &ctx);
    assert_eq!(t, Transition::SwitchTo(f.primary));

    let (_, sec) = f.state.vcpu(f.secondary);
    assert_eq!(sec.peek_state(), VcpuState::Ready);
    let (_, pri) = f.state.vcpu(f.primary);
    assert_eq!(pri.lock().regs.r[0], ffa::FFA_YIELD);

    // On the primary itself, WFE is a no-op.
    let t = handler::sync_lower_exception(f.state, f.primary, &ctx);
    assert_eq!(t, Transition::Resume);
}

#[test]
fn smc_not_on_whitelist_returns_unknown_without_forwarding() {
    let _g = lock_fakes();
    let f = fixture(false, &[]);

    let (_, vcpu) = f.state.vcpu(f.secondary);
    {
        let mut g = vcpu.lock();
        g.regs.r = [0; 31];
        g.regs.r[0] = 0xC200_0042; // SiP service, not whitelisted
        g.regs.pc = 0x1000;
    }

    let ctx = TrapContext {
        esr: (EC_SMC << 26) | (1 << 25),
        far: 0,
        hpfar: 0,
    };
    let t = handler::sync_lower_exception(f.state, f.secondary, &ctx);
    assert_eq!(t, Transition::Resume);

    let g = vcpu.lock();
    assert_eq!(g.regs.r[0], SMCCC_ERROR_UNKNOWN);
    assert_eq!(g.regs.pc, 0x1004);
    // No SMC reached the monitor.
    assert_eq!(smc::fake::call_count(), 0);
}

#[test]
fn whitelisted_smc_forwards_with_client_id_rewrite() {
    let _g = lock_fakes();
    let f = fixture(false, &[0xC200_0042]);

    let caller_x7 = 0x1234_5678_0000_0042u64;
    let (_, vcpu) = f.state.vcpu(f.secondary);
    {
        let mut g = vcpu.lock();
        g.regs.r = [0; 31];
        g.regs.r[0] = 0xC200_0042;
        g.regs.r[1] = 0xAA;
        g.regs.r[7] = caller_x7;
    }
    smc::fake::queue_result(0x0);

    let ctx = TrapContext {
        esr: (EC_SMC << 26) | (1 << 25),
        far: 0,
        hpfar: 0,
    };
    handler::sync_lower_exception(f.state, f.secondary, &ctx);

    // Forwarded with the client-id field replaced by the VM id.
    let call = smc::fake::call(0).expect("SMC forwarded");
    assert_eq!(call.func, 0xC200_0042);
    assert_eq!(call.arg1, 0xAA);
    assert_eq!(call.arg7 & 0xffff, 2);
    assert_eq!(call.arg7 & !0xffff, caller_x7 & !0xffff);

    // The caller's own x7 is restored in the return.
    assert_eq!(vcpu.lock().regs.r[7], caller_x7);
}

#[test]
fn standard_secure_calls_blocked_without_el3_psci() {
    let _g = lock_fakes();

    // Re-probe with a dead EL3: version reads as unknown.
    smc::fake::queue_result(SMCCC_ERROR_UNKNOWN);
    psci::init();
    smc::fake::reset();

    let f = fixture(false, &[]);
    let (_, vcpu) = f.state.vcpu(f.primary);
    {
        let mut g = vcpu.lock();
        g.regs.r = [0; 31];
        g.regs.r[0] = 0x8400_0000; // PSCI_VERSION
    }

    let ctx = TrapContext {
        esr: (EC_SMC << 26) | (1 << 25),
        far: 0,
        hpfar: 0,
    };
    handler::sync_lower_exception(f.state, f.primary, &ctx);

    assert_eq!(vcpu.lock().regs.r[0], SMCCC_ERROR_UNKNOWN);
    assert_eq!(smc::fake::call_count(), 0);

    // Restore a live EL3 for the other tests.
    smc::fake::queue_result(0x0001_0001);
    psci::init();
}

#[test]
fn unknown_sysreg_injects_unknown_exception() {
    let _g = lock_fakes();
    let f = fixture(false, &[]);

    sysregs::fake::prime(sysregs::VBAR_EL1, 0x9000_0000);
    let (_, vcpu) = f.state.vcpu(f.secondary);
    {
        let mut g = vcpu.lock();
        g.regs.pc = 0x2000;
        g.regs.spsr = PSR_PE_MODE_EL1H;
    }

    // An arbitrary unimplemented register.
    let esr = msr_ctx(3, 4, 2, 0, 1, 5, true);
    let ctx = TrapContext { esr, far: 0, hpfar: 0 };
    handler::sync_lower_exception(f.state, f.secondary, &ctx);

    let g = vcpu.lock();
    let pending = g.regs.pending_el1.expect("exception staged");
    assert_eq!(pending.elr_el1, 0x2000);
    assert_eq!(pending.esr_el1 >> 26, EC_UNKNOWN);
    // Vectored to the current-EL SPx entry with interrupts masked.
    assert_eq!(g.regs.pc, 0x9000_0000 + VECTOR_OFFSET_CURRENT_SPX);
    assert_eq!(g.regs.spsr, SPSR_EL1H_MASKED);
}

#[test]
fn debug_and_perfmon_are_raz_wi() {
    let _g = lock_fakes();
    let f = fixture(false, &[]);

    let (_, vcpu) = f.state.vcpu(f.secondary);
    {
        let mut g = vcpu.lock();
        g.regs.pc = 0x2000;
        g.regs.set(4, 0xdead_beef);
    }

    // MDSCR_EL1 read (op0=2): returns zero, no exception.
    let esr = msr_ctx(2, 0, 0, 2, 2, 4, true);
    handler::sync_lower_exception(
        f.state,
        f.secondary,
        &TrapContext { esr, far: 0, hpfar: 0 },
    );

    let g = vcpu.lock();
    assert!(g.regs.pending_el1.is_none());
    assert_eq!(g.regs.get(4), 0);
    assert_eq!(g.regs.pc, 0x2004);
}

#[test]
fn sgi1r_write_translates_guest_affinity() {
    let _g = lock_fakes();
    let f = fixture(false, &[]);

    let (_, vcpu) = f.state.vcpu(f.secondary);
    {
        let mut g = vcpu.lock();
        g.regs.pc = 0x3000;
        // Target list 0x2, all affinity fields zero (vCPU cluster 0).
        g.regs.set(6, 0x2);
    }

    // MSR ICC_SGI1R_EL1, x6 (op0=3 op1=0 crn=12 crm=11 op2=5).
    let esr = msr_ctx(3, 0, 12, 11, 5, 6, false);
    handler::sync_lower_exception(
        f.state,
        f.secondary,
        &TrapContext { esr, far: 0, hpfar: 0 },
    );

    // Affinity fields rewritten to the backing physical CPU, Aff0 = 1.
    let written = sysregs::read_gic_register(sysregs::ICC_SGI1R_EL1).unwrap();
    assert_eq!(written, 0x1);
    assert!(vcpu.lock().regs.pending_el1.is_none());
}

#[test]
fn spurious_stage2_fault_resumes_the_guest() {
    let _g = lock_fakes();
    let f = fixture(false, &[]);

    // Map a page as if another pCPU completed the update already.
    let vm = f.state.vm_find(2).unwrap();
    let ipa = 0x2000_0000u64;
    {
        let mut inner = vm.lock();
        let pt = inner.ptable.as_mut().unwrap();
        f.state
            .pma
            .alloc(
                pt,
                Some(Ipaddr::new(ipa)),
                PAGE_SIZE,
                Mode::R | Mode::W,
                2,
                &f.state.ppool,
            )
            .unwrap();
    }

    let ctx = TrapContext {
        esr: (EC_DATA_ABORT_LOWER_EL << 26) | (1 << 25) | (1 << 6), // write
        far: 0x123,
        hpfar: (ipa >> 12) << 4,
    };
    let t = handler::sync_lower_exception(f.state, f.secondary, &ctx);
    assert_eq!(t, Transition::Resume);
    let (_, vcpu) = f.state.vcpu(f.secondary);
    assert!(vcpu.lock().regs.pending_el1.is_none());
}

#[test]
fn unmapped_data_abort_is_injected_into_the_guest() {
    let _g = lock_fakes();
    let f = fixture(false, &[]);

    sysregs::fake::prime(sysregs::VBAR_EL1, 0xA000_0000);
    let (_, vcpu) = f.state.vcpu(f.secondary);
    {
        let mut g = vcpu.lock();
        g.regs.pc = 0x5000;
        g.regs.spsr = PSR_PE_MODE_EL1H;
    }

    let far = 0x7777_0123u64;
    let ctx = TrapContext {
        esr: (EC_DATA_ABORT_LOWER_EL << 26) | (1 << 25) | (1 << 24) | (2 << 22) | (1 << 6) | 0x04,
        far,
        hpfar: (0x7777_0000u64 >> 12) << 4,
    };
    handler::sync_lower_exception(f.state, f.secondary, &ctx);

    let g = vcpu.lock();
    let pending = g.regs.pending_el1.expect("data abort staged");
    assert_eq!(pending.esr_el1 >> 26, EC_DATA_ABORT_SAME_EL);
    assert_eq!(pending.far_el1, far);
    assert_eq!(pending.elr_el1, 0x5000);
    assert_eq!(g.regs.pc, 0xA000_0000 + VECTOR_OFFSET_CURRENT_SPX);
}

#[test]
fn physical_interrupt_is_delegated_to_the_owner() {
    let _g = lock_fakes();
    let f = fixture(false, &[]);

    // The secondary owns INTID 33 and is ready to take it.
    let vm = f.state.vm_find(2).unwrap();
    vm.lock()
        .interrupt_desc
        .push(InterruptDescriptor { interrupt_id: 33, attributes: 0 });
    {
        let (_, sec) = f.state.vcpu(f.secondary);
        let mut g = sec.lock();
        sec.set_state(&mut g, VcpuState::Ready);
        g.interrupts.enable(33, true, peregrine::vcpu::InterruptType::Irq).unwrap();
    }

    // IAR reports 33 pending while the primary runs.
    sysregs::fake::prime(sysregs::ICC_IAR1_EL1, 33);
    let t = handler::irq_lower(f.state, f.primary);
    assert_eq!(t, Transition::SwitchTo(f.secondary));

    let (_, pri) = f.state.vcpu(f.primary);
    assert_eq!(pri.peek_state(), VcpuState::Preempted);

    let (_, sec) = f.state.vcpu(f.secondary);
    let g = sec.lock();
    assert_eq!(g.state(), VcpuState::Running);
    assert_eq!(g.regs.r[0], ffa::FFA_INTERRUPT_32);
    assert_eq!(g.regs.r[1], 33);
    assert!(!g.regs_available);
    assert!(g.interrupts.counts_consistent());

    // Delivery is blocked until the interrupt is handled.
    assert_eq!(
        sysregs::read_gic_register(sysregs::ICC_PMR_EL1),
        Some(0)
    );
}

#[test]
fn interrupt_for_blocked_vcpu_stays_pending() {
    let _g = lock_fakes();
    let f = fixture(false, &[]);

    let vm = f.state.vm_find(2).unwrap();
    vm.lock()
        .interrupt_desc
        .push(InterruptDescriptor { interrupt_id: 34, attributes: 0 });
    {
        let (_, sec) = f.state.vcpu(f.secondary);
        let mut g = sec.lock();
        sec.set_state(&mut g, VcpuState::BlockedInterrupt);
        g.interrupts.enable(34, true, peregrine::vcpu::InterruptType::Irq).unwrap();
    }

    sysregs::fake::prime(sysregs::ICC_IAR1_EL1, 34);
    let t = handler::irq_lower(f.state, f.primary);
    // No switch: the vIRQ is pended for later.
    assert_eq!(t, Transition::Resume);

    let (_, sec) = f.state.vcpu(f.secondary);
    let g = sec.lock();
    assert_eq!(g.state(), VcpuState::BlockedInterrupt);
    assert_eq!(g.interrupts.irq_count(), 1);
}
