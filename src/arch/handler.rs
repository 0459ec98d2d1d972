//! Exception dispatch from a lower EL.
//!
//! The vector stubs save the guest register file into the current vCPU,
//! capture ESR/FAR/HPFAR, and call in here. Every handler returns a
//! [`Transition`]; the outermost entry performs the physical context
//! switch and the ISB before re-entering a guest.

use crate::api::{self, Transition};
use crate::arch::defs::*;
use crate::arch::{cache, smc, sysregs};
use crate::addr::{Ipaddr, Vaddr};
use crate::devices::{self, DevOutcome};
use crate::ffa::{self, FfaValue};
use crate::interrupts;
use crate::mm::Mode;
use crate::psci;
use crate::state::SystemState;
use crate::vcpu::{FaultInfo, InterruptType, VcpuRef, VcpuState};
use crate::vgic;
use crate::vm::Vm;

/// Registers captured by the vector stub at trap time.
#[derive(Clone, Copy, Debug)]
pub struct TrapContext {
    pub esr: u64,
    pub far: u64,
    pub hpfar: u64,
}

/// Builds the fault description for an abort. The FnV bit (valid only when
/// the fault status is a translation fault) tells us whether FAR can be
/// trusted; the IPA always comes from HPFAR.
fn fault_info_init(ctx: &TrapContext, pc: u64, mode: Mode) -> FaultInfo {
    let fipa = hpfar_fipa(ctx.hpfar);
    let fsc = iss_fsc(ctx.esr);

    if fsc == 0x10 && iss_fnv(ctx.esr) {
        FaultInfo {
            ipaddr: Ipaddr::new(fipa),
            vaddr: Vaddr::new(0),
            pc,
            mode,
        }
    } else {
        FaultInfo {
            ipaddr: Ipaddr::new(fipa | (ctx.far & (crate::mm::PAGE_SIZE as u64 - 1))),
            vaddr: Vaddr::new(ctx.far),
            pc,
            mode,
        }
    }
}

/// Decides whether a stage-2 fault is real. A fault can race a concurrent
/// page-table update on another CPU: re-reading the mode under the VM lock
/// settles it, because the updater holds that lock across its TLB
/// invalidations. If the current mode would permit the attempted access
/// the fault is spurious and the vCPU is simply resumed.
pub fn handle_page_fault(state: &SystemState, cur: VcpuRef, info: &FaultInfo) -> bool {
    let (vm, _) = state.vcpu(cur);
    let mask = info.mode | Mode::INVALID;

    let inner = vm.lock();
    let resume = inner
        .ptable
        .as_ref()
        .and_then(|pt| pt.get_mode(info.ipaddr, info.ipaddr.add(1)).ok())
        .map(|mode| (mode & mask) == info.mode)
        .unwrap_or(false);
    drop(inner);

    if !resume {
        log::warn!(
            "stage-2 page fault: pc={:#x}, vmid={:#x}, vcpu={}, vaddr={:#x}, ipaddr={:#x}, mode={:?}",
            info.pc,
            cur.vm_id,
            cur.vcpu_index,
            info.vaddr.addr(),
            info.ipaddr.addr(),
            info.mode
        );
    }

    resume
}

// ── EL1 exception injection ─────────────────────────────────────────

fn el1_handler_address(spsr: u64) -> u64 {
    let base = sysregs::read_vbar_el1();
    let pe_mode = spsr & PSR_PE_MODE_MASK;
    let is_arch32 = spsr & PSR_ARCH_MODE_32 != 0;

    if pe_mode == PSR_PE_MODE_EL0T {
        if is_arch32 {
            base + VECTOR_OFFSET_LOWER_EL_32
        } else {
            base + VECTOR_OFFSET_LOWER_EL_64
        }
    } else {
        crate::check!(!is_arch32);
        base + VECTOR_OFFSET_CURRENT_SPX
    }
}

/// Stages a synchronous exception into the guest's EL1: ESR/FAR plus the
/// return state, then redirects the vCPU to its vector table with
/// interrupts masked in EL1h mode.
fn inject_el1_exception(state: &SystemState, cur: VcpuRef, esr_el1: u64, far_el1: u64) {
    let (_, vcpu) = state.vcpu(cur);
    let mut g = vcpu.lock();

    let handler = el1_handler_address(g.regs.spsr);
    g.regs.pending_el1 = Some(crate::arch::regs::PendingEl1 {
        esr_el1,
        far_el1,
        elr_el1: g.regs.pc,
        spsr_el1: g.regs.spsr,
    });
    g.regs.spsr = SPSR_EL1H_MASKED;
    g.regs.pc = handler;
}

fn inject_el1_data_abort(state: &SystemState, cur: VcpuRef, esr_el2: u64, far_el2: u64) {
    // The ISS carries over; only the EC changes to reflect a same-EL
    // abort.
    let esr_el1 = esr_iss(esr_el2) | esr_il(esr_el2) | (EC_DATA_ABORT_SAME_EL << ESR_EC_OFFSET);
    log::info!("injecting data abort exception into VM {:#x}", cur.vm_id);
    inject_el1_exception(state, cur, esr_el1, far_el2);
}

fn inject_el1_instruction_abort(state: &SystemState, cur: VcpuRef, esr_el2: u64, far_el2: u64) {
    let esr_el1 =
        esr_iss(esr_el2) | esr_il(esr_el2) | (EC_INSTRUCTION_ABORT_SAME_EL << ESR_EC_OFFSET);
    log::info!(
        "injecting instruction abort exception into VM {:#x}",
        cur.vm_id
    );
    inject_el1_exception(state, cur, esr_el1, far_el2);
}

fn inject_el1_unknown(state: &SystemState, cur: VcpuRef, esr_el2: u64) {
    let esr_el1 = esr_il(esr_el2) | (EC_UNKNOWN << ESR_EC_OFFSET);
    log::info!(
        "injecting unknown-reason exception into VM {:#x}",
        cur.vm_id
    );
    // FAR is UNKNOWN for this class; pass zero rather than leak state.
    inject_el1_exception(state, cur, esr_el1, 0);
}

// ── SMC forwarding ──────────────────────────────────────────────────

fn smc_is_blocked(vm: &Vm, func: u64) -> bool {
    let whitelist = &vm.config().smc_whitelist;
    let block_by_default = !whitelist.permissive;

    if whitelist.smcs.iter().any(|&s| s as u64 == func) {
        return false;
    }
    if block_by_default {
        log::warn!(
            "SMC {:#010x} attempted from VM {:#x} got blocked",
            func,
            vm.id()
        );
    }
    // Access is still allowed in permissive mode.
    block_by_default
}

/// Applies the whitelist and forwards an allowed SMC to EL3, with the
/// SMCCC client-id field in x7 replaced by the caller's VM id for the
/// call and the caller's own x7 restored in the return.
fn smc_forwarder(vm: &Vm, args: &mut FfaValue) {
    let caller_x7 = args.arg7;

    if smc_is_blocked(vm, args.func) {
        args.func = SMCCC_ERROR_UNKNOWN;
        return;
    }

    args.arg7 = vm.id() as u64 | (caller_x7 & !SMCCC_CLIENT_ID_MASK);
    let mut ret = smc::forward(*args);

    // Preserve the value the caller passed rather than the client id; the
    // forwarded legacy calls return at most four values anyway.
    ret.arg7 = caller_x7;
    *args = ret;
}

// ── HVC ─────────────────────────────────────────────────────────────

fn hvc_handler(state: &SystemState, cur: VcpuRef) -> Transition {
    let (_, vcpu) = state.vcpu(cur);
    let args = vcpu.lock().regs.args();
    let mut next: Option<VcpuRef> = None;

    if let Some(ret) = psci::handler(state, cur, args.func, args.arg1, args.arg2, args.arg3, &mut next)
    {
        vcpu.lock().regs.r[0] = ret;
        update_virtual_interrupts(state, cur, next);
        return Transition::from_next(next);
    }

    let ret: FfaValue = match args.func {
        ffa::INTERRUPT_ENABLE => {
            let int_type = if args.arg3 != 0 {
                InterruptType::Fiq
            } else {
                InterruptType::Irq
            };
            let r = api::interrupt_enable(state, cur, args.arg1 as u32, args.arg2 != 0, int_type);
            FfaValue::psci_ret(r as u64)
        }

        ffa::INTERRUPT_GET => FfaValue::psci_ret(api::interrupt_get(state, cur) as u64),

        ffa::INTERRUPT_INJECT => {
            let (r, n) = api::interrupt_inject(
                state,
                cur,
                args.arg1 as u16,
                args.arg2 as u16,
                args.arg3 as u32,
            );
            next = n;
            FfaValue::psci_ret(r as u64)
        }

        ffa::MAILBOX_WRITABLE_GET => FfaValue::psci_ret(api::mailbox_writable_get(state, cur)),

        ffa::MAILBOX_WAITER_GET => {
            FfaValue::psci_ret(api::mailbox_waiter_get(state, cur, args.arg1 as u16))
        }

        ffa::FFA_VERSION => FfaValue::psci_ret(ffa::FFA_VERSION_1_1),

        ffa::FFA_ID_GET => {
            let mut v = FfaValue::success();
            v.arg2 = cur.vm_id as u64;
            v
        }

        ffa::FFA_FEATURES => match args.arg1 {
            ffa::FFA_VERSION | ffa::FFA_FEATURES | ffa::FFA_ID_GET | ffa::FFA_YIELD
            | ffa::FFA_MSG_SEND | ffa::FFA_MSG_WAIT | ffa::FFA_RUN | ffa::FFA_RX_RELEASE
            | ffa::FFA_RXTX_MAP_32 | ffa::FFA_RXTX_MAP_64 | ffa::FFA_PARTITION_INFO_GET
            | ffa::FFA_MSG_SEND_DIRECT_REQ_32 | ffa::FFA_MSG_SEND_DIRECT_RESP_32 => {
                FfaValue::success()
            }
            _ => FfaValue::error(ffa::FFA_NOT_SUPPORTED),
        },

        ffa::FFA_PARTITION_INFO_GET => {
            let mut v = FfaValue::success();
            v.arg2 = state.vm_count() as u64;
            v
        }

        ffa::FFA_RXTX_MAP_32 | ffa::FFA_RXTX_MAP_64 => api::vm_configure_pages(
            state,
            cur,
            Ipaddr::new(args.arg1),
            Ipaddr::new(args.arg2),
            args.arg3 as u32,
        ),

        ffa::FFA_RX_RELEASE => {
            let (ret, waiter) = api::rx_release(state, cur);
            if let Some(waiter_id) = waiter {
                let (r, n) =
                    api::interrupt_inject(state, cur, waiter_id, 0, ffa::MAILBOX_WRITABLE_INTID);
                let _ = r;
                next = n;
            }
            ret
        }

        ffa::FFA_MSG_SEND => {
            let (ret, n) = api::msg_send(
                state,
                cur,
                args.arg1 as u16,
                args.arg3 as u32,
                args.arg4 & 1 != 0,
            );
            next = n;
            ret
        }

        ffa::FFA_MSG_WAIT => {
            let (ret, n) = api::msg_wait(state, cur);
            next = n;
            match ret {
                Some(v) => v,
                // Blocked: the return value is staged by the sender.
                None => {
                    update_virtual_interrupts(state, cur, next);
                    return Transition::from_next(next);
                }
            }
        }

        ffa::FFA_YIELD => {
            next = api::yield_current(state, cur);
            FfaValue::success()
        }

        ffa::FFA_RUN => {
            let (ret, n) = api::ffa_run(
                state,
                cur,
                ffa::vm_id_from_arg(args.arg1),
                ffa::vcpu_index_from_arg(args.arg1),
            );
            next = n;
            ret
        }

        ffa::FFA_MSG_SEND_DIRECT_REQ_32 => {
            return direct_message(state, cur, args, true);
        }
        ffa::FFA_MSG_SEND_DIRECT_RESP_32 => {
            return direct_message(state, cur, args, false);
        }

        _ => FfaValue::psci_ret(SMCCC_ERROR_UNKNOWN),
    };

    vcpu.lock().regs.set_retval(ret);
    update_virtual_interrupts(state, cur, next);
    Transition::from_next(next)
}

/// Direct messaging: hands the pCPU (and the x3..x7 payload) straight to
/// the other endpoint. Requests go sender → receiver, responses return
/// receiver → sender.
fn direct_message(state: &SystemState, cur: VcpuRef, args: FfaValue, is_req: bool) -> Transition {
    let target_id = args.arg1 as u16 & 0xffff;
    let Some(target_vm) = state.vm_find(target_id) else {
        let (_, vcpu) = state.vcpu(cur);
        vcpu.lock()
            .regs
            .set_retval(FfaValue::error(ffa::FFA_INVALID_PARAMETERS));
        return Transition::Resume;
    };
    if target_id == cur.vm_id {
        let (_, vcpu) = state.vcpu(cur);
        vcpu.lock()
            .regs
            .set_retval(FfaValue::error(ffa::FFA_INVALID_PARAMETERS));
        return Transition::Resume;
    }

    let Some(index) = api::vm_vcpu_index_for_cpu(target_vm, state.current_cpu_index()) else {
        let (_, vcpu) = state.vcpu(cur);
        vcpu.lock()
            .regs
            .set_retval(FfaValue::error(ffa::FFA_BUSY));
        return Transition::Resume;
    };

    let mut payload = args;
    payload.arg1 = ((cur.vm_id as u64) << 16) | target_id as u64;
    let blocked_state = if is_req {
        // The requester waits for the response.
        VcpuState::BlockedMailbox
    } else {
        VcpuState::Ready
    };

    let next = api::switch_to_vm(state, cur, payload, blocked_state, target_id);
    let _ = index;
    update_virtual_interrupts(state, cur, Some(next));
    Transition::SwitchTo(next)
}

// ── MSR/MRS traps ───────────────────────────────────────────────────

/// GIC CPU-interface trap: pass the access through to the real register,
/// with the SGI generation register's affinity fields translated from the
/// guest's vCPU numbering to real CPUs.
fn gic_register_access(state: &SystemState, cur: VcpuRef, esr: u64) -> bool {
    let (vm, vcpu) = state.vcpu(cur);
    let enc = iss_sysreg(esr);
    let rt = iss_rt(esr) as usize;

    if iss_is_read(esr) {
        let Some(value) = sysregs::read_gic_register(enc) else {
            return false;
        };
        vcpu.lock().regs.set(rt, value);
        true
    } else {
        let mut value = if rt == 31 { 0 } else { vcpu.lock().regs.get(rt) };

        if enc == sysregs::ICC_SGI1R_EL1 {
            // Restructure the SGI1R Aff2/Aff1 fields into MPIDR layout so
            // the affinity folding applies.
            let aff2 = (value >> 32) & 0xf;
            let aff1 = (value >> 16) & 0xf;
            let aff = (aff2 << 16) | (aff1 << 8);

            let cpu_no = crate::arch::aff_to_no(aff);
            if cpu_no < vm.vcpu_count() as u64 {
                let pcpu = vm.config().cpus[cpu_no as usize];
                // Keep all bits that are not affinity-related.
                value &= 0x8100_0F00_0000;
                value |= (pcpu & 0xFF_0000) << 16; // Aff2
                value |= (pcpu & 0xFF00) << 8; // Aff1
                value |= 0x1; // Aff0 always 1
            }
        }

        sysregs::write_gic_register(enc, value)
    }
}

/// Debug and performance-monitor registers are hidden from guests: reads
/// as zero, writes ignored.
fn raz_wi_access(state: &SystemState, cur: VcpuRef, esr: u64) -> bool {
    if iss_is_read(esr) {
        let (_, vcpu) = state.vcpu(cur);
        vcpu.lock().regs.set(iss_rt(esr) as usize, 0);
    }
    true
}

fn feature_id_access(state: &SystemState, cur: VcpuRef, esr: u64) -> bool {
    if !iss_is_read(esr) {
        // The feature-ID space is read-only.
        return false;
    }
    let value = sysregs::read_feature_id(esr);
    let (_, vcpu) = state.vcpu(cur);
    vcpu.lock().regs.set(iss_rt(esr) as usize, value);
    true
}

fn cache_maintenance_access(state: &SystemState, cur: VcpuRef, esr: u64) -> bool {
    let op = cache::decode(
        iss_op0(esr),
        iss_op1(esr),
        iss_crn(esr),
        iss_crm(esr),
        iss_op2(esr),
    );
    let Some(op) = op else { return false };

    let rt = iss_rt(esr) as usize;
    let value = {
        let (_, vcpu) = state.vcpu(cur);
        vcpu.lock().regs.get(rt)
    };
    cache::execute(op, value);
    true
}

/// MSR/MRS trap dispatch. Unsupported registers surface to the guest as
/// an unknown exception.
pub fn handle_system_register_access(state: &SystemState, cur: VcpuRef, esr: u64) {
    crate::check!(esr_ec(esr) == EC_MSR);

    let handled = if sysregs::is_debug_access(esr) || sysregs::is_perfmon_access(esr) {
        raz_wi_access(state, cur, esr)
    } else if sysregs::is_feature_id_access(esr) {
        feature_id_access(state, cur, esr)
    } else if sysregs::is_gic_access(esr) {
        gic_register_access(state, cur, esr)
    } else if iss_op0(esr) == 1 {
        cache_maintenance_access(state, cur, esr)
    } else {
        false
    };

    if handled {
        advance_pc(state, cur, esr);
    } else {
        inject_el1_unknown(state, cur, esr);
    }
}

// ── entry points ────────────────────────────────────────────────────

fn advance_pc(state: &SystemState, cur: VcpuRef, esr: u64) {
    let (_, vcpu) = state.vcpu(cur);
    vcpu.lock().regs.pc += next_pc_inc(esr);
}

/// Recomputes the VI/VF bits for the vCPU about to run.
fn update_virtual_interrupts(state: &SystemState, cur: VcpuRef, next: Option<VcpuRef>) {
    let target = next.unwrap_or(cur);
    let (_, vcpu) = state.vcpu(target);
    vcpu.lock().update_virtual_interrupts();
}

/// Synchronous exception from a lower EL.
pub fn sync_lower_exception(state: &SystemState, cur: VcpuRef, ctx: &TrapContext) -> Transition {
    let ec = esr_ec(ctx.esr);

    match ec {
        EC_WFI_WFE => {
            advance_pc(state, cur, ctx.esr);
            // TI bit: 0 = WFI, 1 = WFE.
            if ctx.esr & 1 != 0 {
                match api::yield_current(state, cur) {
                    Some(next) => {
                        update_virtual_interrupts(state, cur, Some(next));
                        Transition::SwitchTo(next)
                    }
                    None => Transition::Resume,
                }
            } else {
                let next = api::wait_for_interrupt(state, cur);
                update_virtual_interrupts(state, cur, Some(next));
                Transition::SwitchTo(next)
            }
        }

        EC_DATA_ABORT_LOWER_EL => {
            let pc = {
                let (_, vcpu) = state.vcpu(cur);
                vcpu.lock().regs.pc
            };
            let mode = if iss_is_write(ctx.esr) { Mode::W } else { Mode::R };
            let info = fault_info_init(ctx, pc, mode);

            match devices::access_virt_dev(state, cur, ctx.esr, &info) {
                DevOutcome::Handled => {
                    advance_pc(state, cur, ctx.esr);
                    return Transition::Resume;
                }
                DevOutcome::Retry => return Transition::Resume,
                DevOutcome::Unhandled => {}
            }

            if vgic::access(state, cur, ctx.esr, &info) {
                advance_pc(state, cur, ctx.esr);
                return Transition::Resume;
            }

            log::warn!(
                "data abort | PC: {:#x} IPA: {:#x}",
                info.pc,
                info.ipaddr.addr()
            );

            if handle_page_fault(state, cur, &info) {
                return Transition::Resume;
            }
            inject_el1_data_abort(state, cur, ctx.esr, ctx.far);
            Transition::Resume
        }

        EC_INSTRUCTION_ABORT_LOWER_EL => {
            let pc = {
                let (_, vcpu) = state.vcpu(cur);
                vcpu.lock().regs.pc
            };
            let info = fault_info_init(ctx, pc, Mode::X);
            if handle_page_fault(state, cur, &info) {
                return Transition::Resume;
            }
            inject_el1_instruction_abort(state, cur, ctx.esr, ctx.far);
            Transition::Resume
        }

        EC_HVC => hvc_handler(state, cur),

        EC_SMC => {
            let transition = smc_handler(state, cur);
            // The SMC instruction itself is skipped either way.
            advance_pc(state, cur, ctx.esr);
            transition
        }

        EC_MSR => {
            handle_system_register_access(state, cur, ctx.esr);
            Transition::Resume
        }

        _ => {
            let pc = {
                let (_, vcpu) = state.vcpu(cur);
                vcpu.lock().regs.pc
            };
            log::info!(
                "unknown lower sync exception pc={:#x}, esr={:#x}, ec={:#x}",
                pc,
                ctx.esr,
                ec
            );
            inject_el1_unknown(state, cur, ctx.esr);
            Transition::Resume
        }
    }
}

fn smc_handler(state: &SystemState, cur: VcpuRef) -> Transition {
    let (vm, vcpu) = state.vcpu(cur);
    let mut args = vcpu.lock().regs.args();
    let mut next: Option<VcpuRef> = None;

    if let Some(ret) =
        psci::handler(state, cur, args.func, args.arg1, args.arg2, args.arg3, &mut next)
    {
        vcpu.lock().regs.r[0] = ret;
        update_virtual_interrupts(state, cur, next);
        return Transition::from_next(next);
    }

    smc_forwarder(vm, &mut args);
    vcpu.lock().regs.set_retval(args);
    Transition::Resume
}

/// Physical IRQ while a guest was running: delegate to the owning VM.
pub fn irq_lower(state: &SystemState, cur: VcpuRef) -> Transition {
    let transition = interrupts::delegate_interrupt(state, cur);
    if let Transition::SwitchTo(next) = transition {
        update_virtual_interrupts(state, cur, Some(next));
    } else {
        update_virtual_interrupts(state, cur, None);
    }
    transition
}

pub fn fiq_lower(state: &SystemState, cur: VcpuRef) -> Transition {
    irq_lower(state, cur)
}

/// SError from a lower EL: the faulting vCPU is lost, the system keeps
/// going.
pub fn serr_lower(state: &SystemState, cur: VcpuRef) -> Transition {
    log::error!(
        "SError from VM {:#x} vCPU {}; aborting the vCPU",
        cur.vm_id,
        cur.vcpu_index
    );
    let (vm, vcpu) = state.vcpu(cur);
    vm.set_aborting();
    {
        let mut g = vcpu.lock();
        vcpu.set_state(&mut g, VcpuState::Aborted);
    }
    let next = api::switch_to_primary(
        state,
        cur,
        FfaValue {
            func: ffa::RUN_WAIT_FOR_INTERRUPT,
            arg1: cur.arg1(),
            ..Default::default()
        },
        VcpuState::Aborted,
    );
    Transition::SwitchTo(next)
}

/// Invalidates stage-1 TLB entries when this pCPU last ran a *different*
/// vCPU of the same VM. Guests may reuse ASIDs inconsistently across
/// vCPUs, so stale entries from the sibling must go. Called on each run
/// transition before entering the guest.
pub fn maybe_invalidate_tlb(state: &SystemState, next: VcpuRef) {
    let (vm, vcpu) = state.vcpu(next);
    let Some(cpu_index) = vcpu.lock().cpu_index else {
        return;
    };

    let mut inner = vm.lock();
    if inner.last_vcpu_on_cpu[cpu_index] != Some(next.vcpu_index) {
        crate::arch::tlb::invalidate_vm_tlb_current_cpu();
        inner.last_vcpu_on_cpu[cpu_index] = Some(next.vcpu_index);
    }
}

/// Exceptions taken at EL2 itself are hypervisor bugs.
pub fn sync_current_exception(elr: u64, esr: u64) -> ! {
    match esr_ec(esr) {
        EC_DATA_ABORT_SAME_EL => {
            if !iss_fnv(esr) {
                log::error!("data abort: pc={:#x}, esr={:#x}", elr, esr);
            } else {
                log::error!("data abort: pc={:#x}, esr={:#x}, far=invalid", elr, esr);
            }
        }
        ec => {
            log::error!(
                "unknown current sync exception pc={:#x}, esr={:#x}, ec={:#x}",
                elr,
                esr,
                ec
            );
        }
    }
    panic!("EL2 exception");
}
