//! Partition-facing API: the scheduling handoffs, the mailbox, and
//! virtual-interrupt control.
//!
//! Scheduling is primary-driven and cooperative. The only operations that
//! change a vCPU's state are the `switch_to_*` functions; each takes the
//! target's lock around one state assignment and one write of the saved
//! return registers. A trap handler expresses its outcome as a
//! [`Transition`] and the outermost entry performs the physical switch.

use crate::addr::{is_page_aligned, pa_from_ipa, Ipaddr, Paddr};
use crate::arch::timer;
use crate::ffa::{self, FfaValue};
use crate::mm::{Mode, PAGE_SIZE};
use crate::state::SystemState;
use crate::vcpu::{InterruptType, Vcpu, VcpuInner, VcpuRef, VcpuState};
use crate::vm::{MailboxState, Vm, PRIMARY_VM_ID};

/// What a trap handler wants the world-switch code to do next.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Transition {
    /// Re-enter the current vCPU.
    Resume,
    /// Context-switch the physical CPU to another vCPU.
    SwitchTo(VcpuRef),
}

impl Transition {
    pub fn from_next(next: Option<VcpuRef>) -> Self {
        match next {
            Some(r) => Transition::SwitchTo(r),
            None => Transition::Resume,
        }
    }
}

/// vCPU of `vm` that a caller running on pCPU `cpu_index` should address:
/// vCPU 0 for UP VMs, the matching index for MP VMs.
pub fn vm_vcpu_index_for_cpu(vm: &Vm, cpu_index: usize) -> Option<u16> {
    if vm.vcpu_count() == 1 {
        Some(0)
    } else if (cpu_index as u16) < vm.vcpu_count() {
        Some(cpu_index as u16)
    } else {
        None
    }
}

/// Switches the physical CPU to the corresponding vCPU of another VM,
/// leaving the current vCPU in `current_state` and staging `to_ret` as the
/// destination's return value.
pub fn switch_to_vm(
    state: &SystemState,
    cur: VcpuRef,
    to_ret: FfaValue,
    current_state: VcpuState,
    to_id: u16,
) -> VcpuRef {
    let to_vm = state.vm_find(to_id).expect("switch target VM must exist");
    let vcpu_index = vm_vcpu_index_for_cpu(to_vm, state.current_cpu_index())
        .expect("switch target vCPU must exist");
    let next = VcpuRef {
        vm_id: to_id,
        vcpu_index,
    };

    {
        let (_, next_vcpu) = state.vcpu(next);
        let mut g = next_vcpu.lock();
        g.regs.set_retval(to_ret);
        next_vcpu.set_state(&mut g, VcpuState::Running);
    }
    {
        let (_, cur_vcpu) = state.vcpu(cur);
        let mut g = cur_vcpu.lock();
        cur_vcpu.set_state(&mut g, current_state);
    }

    next
}

/// Returns to the primary so its scheduler runs, reporting the reason in
/// `primary_ret`. For the blocking returns the primary is also told when
/// the vCPU's virtual timer would fire, so it can reschedule by then.
pub fn switch_to_primary(
    state: &SystemState,
    cur: VcpuRef,
    mut primary_ret: FfaValue,
    current_state: VcpuState,
) -> VcpuRef {
    if primary_ret.func == ffa::RUN_WAIT_FOR_INTERRUPT || primary_ret.func == ffa::FFA_MSG_WAIT {
        let (_, cur_vcpu) = state.vcpu(cur);
        let peripherals = cur_vcpu.lock().regs.peripherals;
        if timer::enabled(peripherals.cntv_ctl_el0) {
            let remaining = timer::remaining_ns(peripherals.cntv_cval_el0);
            if remaining == 0 {
                // Timer already pending: run this vCPU again right away.
                primary_ret.func = ffa::FFA_INTERRUPT_32;
                primary_ret.arg2 = 0;
            } else {
                primary_ret.arg2 = remaining;
            }
        } else {
            primary_ret.arg2 = ffa::SLEEP_INDEFINITE;
        }
    }

    switch_to_vm(state, cur, primary_ret, current_state, PRIMARY_VM_ID)
}

/// WFI: block until an interrupt arrives, giving the pCPU back to the
/// primary.
pub fn wait_for_interrupt(state: &SystemState, cur: VcpuRef) -> VcpuRef {
    let ret = FfaValue {
        func: ffa::RUN_WAIT_FOR_INTERRUPT,
        arg1: cur.arg1(),
        ..Default::default()
    };
    switch_to_primary(state, cur, ret, VcpuState::BlockedInterrupt)
}

/// Turns the current vCPU off (PSCI CPU_OFF from a secondary vCPU).
pub fn vcpu_off(state: &SystemState, cur: VcpuRef) -> VcpuRef {
    let ret = FfaValue {
        func: ffa::RUN_WAIT_FOR_INTERRUPT,
        arg1: cur.arg1(),
        ..Default::default()
    };

    // Disable the timer so the scheduler is not told to call back for it.
    {
        let (_, cur_vcpu) = state.vcpu(cur);
        let mut g = cur_vcpu.lock();
        timer::disable(&mut g.regs.peripherals.cntv_ctl_el0);
    }

    switch_to_primary(state, cur, ret, VcpuState::Off)
}

/// Voluntarily gives up the pCPU. A no-op on the primary, which makes the
/// scheduling decisions.
pub fn yield_current(state: &SystemState, cur: VcpuRef) -> Option<VcpuRef> {
    if cur.vm_id == PRIMARY_VM_ID {
        return None;
    }
    let ret = FfaValue {
        func: ffa::FFA_YIELD,
        arg1: cur.arg1(),
        ..Default::default()
    };
    Some(switch_to_primary(state, cur, ret, VcpuState::Ready))
}

/// Asks the primary to schedule (or kick) `target`.
pub fn wake_up(state: &SystemState, cur: VcpuRef, target: VcpuRef) -> VcpuRef {
    let ret = FfaValue {
        func: ffa::RUN_WAKE_UP,
        arg1: target.arg1(),
        ..Default::default()
    };
    switch_to_primary(state, cur, ret, VcpuState::Ready)
}

/// Called by the context-switch path once a vCPU's registers are saved and
/// may be used by other pCPUs.
pub fn regs_state_saved(vcpu: &Vcpu) {
    vcpu.lock().regs_available = true;
}

// ── virtual interrupts ──────────────────────────────────────────────

/// Enables or disables a virtual interrupt for the calling vCPU.
/// Returns 0 on success or -1 for an invalid id.
pub fn interrupt_enable(
    state: &SystemState,
    cur: VcpuRef,
    intid: u32,
    enable: bool,
    int_type: InterruptType,
) -> i64 {
    let (_, vcpu) = state.vcpu(cur);
    let mut g = vcpu.lock();
    match g.interrupts.enable(intid, enable, int_type) {
        Ok(()) => 0,
        Err(()) => -1,
    }
}

/// Returns and acknowledges the next pending-and-enabled interrupt id, or
/// `INVALID_INTID`.
pub fn interrupt_get(state: &SystemState, cur: VcpuRef) -> u32 {
    let (_, vcpu) = state.vcpu(cur);
    let mut g = vcpu.lock();
    g.interrupts.get().unwrap_or(ffa::INVALID_INTID)
}

/// Outcome of injecting with the target lock already held.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InjectOutcome {
    /// Nothing further to do.
    Done,
    /// Caller is the primary and should run or kick the target itself.
    NotifyPrimary,
    /// Caller should hand the pCPU to the primary to wake the target.
    WakeUp,
}

/// Injects `intid` into a locked target vCPU. The interrupt only takes
/// effect when the target next runs.
pub fn interrupt_inject_locked(
    target: &mut VcpuInner,
    intid: u32,
    cur: VcpuRef,
    target_ref: VcpuRef,
) -> InjectOutcome {
    // Only a transition to newly enabled-and-pending needs a wakeup; in
    // every other case setting the pending bit is all there is to do.
    if !target.interrupts.inject(intid) {
        return InjectOutcome::Done;
    }
    if target.interrupts.count() != 1 {
        return InjectOutcome::Done;
    }
    if cur.vm_id == PRIMARY_VM_ID {
        InjectOutcome::NotifyPrimary
    } else if cur != target_ref {
        InjectOutcome::WakeUp
    } else {
        InjectOutcome::Done
    }
}

/// Injects a virtual interrupt into an arbitrary vCPU, subject to the
/// injection policy: the primary may inject anywhere, secondaries only
/// into their own VM.
///
/// Returns -1 on a policy or validation failure, 0 on success, 1 when the
/// primary should schedule the target itself. `next` is set when the
/// caller must give up the pCPU.
pub fn interrupt_inject(
    state: &SystemState,
    cur: VcpuRef,
    target_vm_id: u16,
    target_vcpu_index: u16,
    intid: u32,
) -> (i64, Option<VcpuRef>) {
    if intid as usize >= crate::vcpu::NUM_INTIDS {
        return (-1, None);
    }
    let Some(target_vm) = state.vm_find(target_vm_id) else {
        return (-1, None);
    };
    if target_vcpu_index >= target_vm.vcpu_count() {
        return (-1, None);
    }
    if cur.vm_id != PRIMARY_VM_ID && cur.vm_id != target_vm_id {
        return (-1, None);
    }

    let target_ref = VcpuRef {
        vm_id: target_vm_id,
        vcpu_index: target_vcpu_index,
    };
    log::debug!(
        "injecting interrupt {} for VM {:#x} vCPU {} from VM {:#x} vCPU {}",
        intid,
        target_vm_id,
        target_vcpu_index,
        cur.vm_id,
        cur.vcpu_index
    );

    let outcome = {
        let (_, target_vcpu) = state.vcpu(target_ref);
        let mut g = target_vcpu.lock();
        interrupt_inject_locked(&mut g, intid, cur, target_ref)
    };

    match outcome {
        InjectOutcome::Done => (0, None),
        InjectOutcome::NotifyPrimary => (1, None),
        InjectOutcome::WakeUp => (0, Some(wake_up(state, cur, target_ref))),
    }
}

// ── mailbox ─────────────────────────────────────────────────────────

/// FFA_RXTX_MAP: wires up the caller's mailbox pages, once.
///
/// The guest loses exclusive ownership of both pages (they become
/// unowned-shared in its stage-2, TX read-write, RX read-only) and the
/// hypervisor maps the TX page readable and the RX page writable in its
/// own stage-1. Every step failure unwinds the earlier steps; the visible
/// effect is all-or-nothing.
pub fn vm_configure_pages(
    state: &SystemState,
    cur: VcpuRef,
    send: Ipaddr,
    recv: Ipaddr,
    page_count: u32,
) -> FfaValue {
    let (vm, _) = state.vcpu(cur);
    let mut inner = vm.lock();

    if inner.mailbox.is_configured() {
        return FfaValue::error(ffa::FFA_DENIED);
    }
    if page_count as usize != ffa::MAILBOX_SIZE / PAGE_SIZE {
        return FfaValue::error(ffa::FFA_INVALID_PARAMETERS);
    }
    if !is_page_aligned(send.addr()) || !is_page_aligned(recv.addr()) {
        return FfaValue::error(ffa::FFA_INVALID_PARAMETERS);
    }
    if send == recv {
        return FfaValue::error(ffa::FFA_INVALID_PARAMETERS);
    }

    let pa_send = pa_from_ipa(send);
    let pa_recv = pa_from_ipa(recv);
    let size = ffa::MAILBOX_SIZE as u64;

    let Some(ptable) = inner.ptable.as_mut() else {
        return FfaValue::error(ffa::FFA_DENIED);
    };

    // Both pages must be valid, owned and exclusive to the VM, with the
    // access the mailbox needs.
    let Ok(orig_send_mode) = ptable.get_mode(send, send.add(PAGE_SIZE as u64)) else {
        return FfaValue::error(ffa::FFA_DENIED);
    };
    if !orig_send_mode.is_valid_owned_and_exclusive()
        || !orig_send_mode.contains(Mode::R | Mode::W)
    {
        return FfaValue::error(ffa::FFA_DENIED);
    }
    let Ok(orig_recv_mode) = ptable.get_mode(recv, recv.add(PAGE_SIZE as u64)) else {
        return FfaValue::error(ffa::FFA_DENIED);
    };
    if !orig_recv_mode.is_valid_owned_and_exclusive() || !orig_recv_mode.contains(Mode::R) {
        return FfaValue::error(ffa::FFA_DENIED);
    }

    // Take exclusive ownership away from the VM.
    let send_shared = Mode::UNOWNED | Mode::SHARED | Mode::R | Mode::W;
    let recv_shared = Mode::UNOWNED | Mode::SHARED | Mode::R;
    if ptable
        .map(pa_send, pa_send.add(size), send, send_shared, &state.ppool)
        .is_err()
    {
        return FfaValue::error(ffa::FFA_NO_MEMORY);
    }
    if ptable
        .map(pa_recv, pa_recv.add(size), recv, recv_shared, &state.ppool)
        .is_err()
    {
        ptable
            .map(pa_send, pa_send.add(size), send, orig_send_mode - Mode::STAGE1, &state.ppool)
            .expect("restoring an existing mapping cannot fail");
        ptable.defrag(&state.ppool);
        return FfaValue::error(ffa::FFA_NO_MEMORY);
    }

    // Share the pages into the hypervisor's stage-1: TX readable, RX
    // writable.
    if state
        .hypervisor_assign(pa_send.addr(), ffa::MAILBOX_SIZE, Mode::R)
        .is_err()
    {
        undo_vm_mailbox_maps(state, &mut *inner, send, recv, orig_send_mode, orig_recv_mode);
        return FfaValue::error(ffa::FFA_NO_MEMORY);
    }
    if state
        .hypervisor_assign(pa_recv.addr(), ffa::MAILBOX_SIZE, Mode::W)
        .is_err()
    {
        let _ = state.hypervisor_free(pa_send.addr());
        undo_vm_mailbox_maps(state, &mut *inner, send, recv, orig_send_mode, orig_recv_mode);
        return FfaValue::error(ffa::FFA_NO_MEMORY);
    }

    inner.mailbox.send = Some(pa_send);
    inner.mailbox.recv = Some(pa_recv);
    inner.mailbox.state = MailboxState::Empty;

    FfaValue::success()
}

fn undo_vm_mailbox_maps(
    state: &SystemState,
    inner: &mut crate::vm::VmInner,
    send: Ipaddr,
    recv: Ipaddr,
    orig_send_mode: Mode,
    orig_recv_mode: Mode,
) {
    let ptable = inner.ptable.as_mut().expect("checked above");
    let pa_send = pa_from_ipa(send);
    let pa_recv = pa_from_ipa(recv);
    let size = ffa::MAILBOX_SIZE as u64;
    ptable
        .map(pa_send, pa_send.add(size), send, orig_send_mode - Mode::STAGE1, &state.ppool)
        .expect("restoring an existing mapping cannot fail");
    ptable
        .map(pa_recv, pa_recv.add(size), recv, orig_recv_mode - Mode::STAGE1, &state.ppool)
        .expect("restoring an existing mapping cannot fail");
}

/// FFA_MSG_SEND: copies the caller's TX buffer into the receiver's RX
/// buffer. At most one message is buffered per receiver at a time.
pub fn msg_send(
    state: &SystemState,
    cur: VcpuRef,
    receiver_id: u16,
    size: u32,
    notify: bool,
) -> (FfaValue, Option<VcpuRef>) {
    if size as usize > ffa::MAILBOX_SIZE {
        return (FfaValue::error(ffa::FFA_INVALID_PARAMETERS), None);
    }
    let (from_vm, _) = state.vcpu(cur);
    let Some(to_vm) = state.vm_find(receiver_id) else {
        return (FfaValue::error(ffa::FFA_INVALID_PARAMETERS), None);
    };
    if receiver_id == cur.vm_id {
        return (FfaValue::error(ffa::FFA_INVALID_PARAMETERS), None);
    }

    let target_ref = VcpuRef {
        vm_id: receiver_id,
        vcpu_index: 0,
    };
    let mut woke_target = false;

    {
        let (from, mut to) = Vm::lock_both(from_vm, to_vm);

        let Some(send_pa) = from.mailbox.send else {
            return (FfaValue::error(ffa::FFA_DENIED), None);
        };
        let Some(recv_pa) = to.mailbox.recv else {
            return (FfaValue::error(ffa::FFA_DENIED), None);
        };

        if to.mailbox.state != MailboxState::Empty {
            // Receiver is backed up; optionally queue for a writable
            // notification.
            let from_id = cur.vm_id;
            if notify
                && !to.mailbox.waiter_list.is_full()
                && !to.mailbox.waiter_list.contains(&from_id)
            {
                to.mailbox.waiter_list.push(from_id);
            }
            return (FfaValue::error(ffa::FFA_BUSY), None);
        }

        unsafe {
            core::ptr::copy_nonoverlapping(
                send_pa.addr() as *const u8,
                recv_pa.addr() as *mut u8,
                size as usize,
            );
        }
        to.mailbox.recv_sender = cur.vm_id;
        to.mailbox.recv_size = size;
        to.mailbox.recv_func = ffa::FFA_MSG_SEND;
        to.mailbox.state = MailboxState::Received;

        // Tell the receiver. Taking a vCPU lock inside the VM lock follows
        // the lock ranking. If vCPU 0 is blocked on the mailbox, hand it
        // the message return directly and get it scheduled.
        let (_, target_vcpu) = state.vcpu(target_ref);
        let mut tg = target_vcpu.lock();
        let _ = tg.interrupts.inject(ffa::MAILBOX_READABLE_INTID);

        if tg.state() == VcpuState::BlockedMailbox {
            tg.regs.set_retval(mailbox_recv_return(&to.mailbox));
            target_vcpu.set_state(&mut tg, VcpuState::Ready);
            to.mailbox.state = MailboxState::Read;
            woke_target = true;
        }
    }

    if woke_target && cur.vm_id != PRIMARY_VM_ID {
        return (FfaValue::success(), Some(wake_up(state, cur, target_ref)));
    }
    (FfaValue::success(), None)
}

fn mailbox_recv_return(mailbox: &crate::vm::Mailbox) -> FfaValue {
    FfaValue {
        func: mailbox.recv_func,
        arg1: (mailbox.recv_sender as u64) << 16,
        arg3: mailbox.recv_size as u64,
        ..Default::default()
    }
}

/// FFA_MSG_WAIT: returns a buffered message immediately, or blocks the
/// vCPU on the mailbox and returns to the primary.
pub fn msg_wait(state: &SystemState, cur: VcpuRef) -> (Option<FfaValue>, Option<VcpuRef>) {
    let (vm, _) = state.vcpu(cur);

    {
        let mut inner = vm.lock();
        if inner.mailbox.state == MailboxState::Received {
            inner.mailbox.state = MailboxState::Read;
            return (Some(mailbox_recv_return(&inner.mailbox)), None);
        }
    }

    // The primary cannot block on its mailbox: it drives the scheduler.
    if cur.vm_id == PRIMARY_VM_ID {
        return (Some(FfaValue::error(ffa::FFA_RETRY)), None);
    }

    let ret = FfaValue {
        func: ffa::FFA_MSG_WAIT,
        arg1: cur.arg1(),
        ..Default::default()
    };
    let next = switch_to_primary(state, cur, ret, VcpuState::BlockedMailbox);
    (None, Some(next))
}

/// Moves the head of `vm`'s waiter list onto the waiter's own ready list
/// (which records *whose* mailbox became writable) and returns the waiter.
fn pop_waiter(state: &SystemState, vm: &Vm) -> Option<u16> {
    let waiter_id = {
        let mut inner = vm.lock();
        if inner.mailbox.waiter_list.is_empty() {
            return None;
        }
        inner.mailbox.waiter_list.remove(0)
    };

    if let Some(waiter_vm) = state.vm_find(waiter_id) {
        let mut w = waiter_vm.lock();
        if !w.mailbox.ready_list.contains(&vm.id()) {
            let _ = w.mailbox.ready_list.try_push(vm.id());
        }
    }
    Some(waiter_id)
}

/// FFA_RX_RELEASE: hands the RX buffer back. Returns the first waiter (if
/// any) so the caller can inject the mailbox-writable interrupt into it.
pub fn rx_release(state: &SystemState, cur: VcpuRef) -> (FfaValue, Option<u16>) {
    let (vm, _) = state.vcpu(cur);

    {
        let mut inner = vm.lock();
        match inner.mailbox.state {
            MailboxState::Empty => return (FfaValue::error(ffa::FFA_DENIED), None),
            MailboxState::Received | MailboxState::Read => {
                inner.mailbox.state = MailboxState::Empty;
            }
        }
    }

    (FfaValue::success(), pop_waiter(state, vm))
}

/// Retrieves the next VM whose mailbox became writable for the caller.
/// Returns -1 encoded as u64 when none is pending.
pub fn mailbox_writable_get(state: &SystemState, cur: VcpuRef) -> u64 {
    let (vm, _) = state.vcpu(cur);
    let mut inner = vm.lock();
    if inner.mailbox.ready_list.is_empty() {
        return u64::MAX;
    }
    inner.mailbox.ready_list.remove(0) as u64
}

/// Retrieves the next waiter on `vm_id`'s mailbox (primary use only) and
/// marks that waiter's wait as ready to notify.
pub fn mailbox_waiter_get(state: &SystemState, cur: VcpuRef, vm_id: u16) -> u64 {
    if cur.vm_id != PRIMARY_VM_ID {
        return u64::MAX;
    }
    let Some(vm) = state.vm_find(vm_id) else {
        return u64::MAX;
    };
    pop_waiter(state, vm).map_or(u64::MAX, |w| w as u64)
}

// ── FFA_RUN ─────────────────────────────────────────────────────────

/// The primary hands the pCPU to a target vCPU.
pub fn ffa_run(
    state: &SystemState,
    cur: VcpuRef,
    target_vm_id: u16,
    target_vcpu_index: u16,
) -> (FfaValue, Option<VcpuRef>) {
    if cur.vm_id != PRIMARY_VM_ID {
        return (FfaValue::error(ffa::FFA_DENIED), None);
    }
    let Some(target_vm) = state.vm_find(target_vm_id) else {
        return (FfaValue::error(ffa::FFA_INVALID_PARAMETERS), None);
    };
    if target_vcpu_index >= target_vm.vcpu_count() {
        return (FfaValue::error(ffa::FFA_INVALID_PARAMETERS), None);
    }
    if target_vm.is_aborting() {
        return (FfaValue::error(ffa::FFA_ABORTED), None);
    }

    let target_ref = VcpuRef {
        vm_id: target_vm_id,
        vcpu_index: target_vcpu_index,
    };
    let (_, target_vcpu) = state.vcpu(target_ref);

    {
        let mut tg = target_vcpu.lock();
        match tg.state() {
            VcpuState::Ready | VcpuState::Preempted => {}
            VcpuState::BlockedInterrupt | VcpuState::BlockedMailbox
                if tg.interrupts.count() > 0 =>
            {
                // Pending work: wake it with an interrupt indication.
                tg.regs.set_retval(FfaValue::with_func(ffa::FFA_INTERRUPT_32));
            }
            VcpuState::Off | VcpuState::Aborted => {
                return (FfaValue::error(ffa::FFA_DENIED), None);
            }
            _ => {
                return (FfaValue::error(ffa::FFA_BUSY), None);
            }
        }
        crate::check!(tg.regs_available);
        target_vcpu.set_state(&mut tg, VcpuState::Running);
        tg.regs_available = false;
        tg.update_virtual_interrupts();
    }

    // The primary resumes with SUCCESS once it is next scheduled.
    {
        let (_, cur_vcpu) = state.vcpu(cur);
        let mut g = cur_vcpu.lock();
        g.regs.set_retval(FfaValue::success());
        cur_vcpu.set_state(&mut g, VcpuState::Ready);
    }

    (FfaValue::success(), Some(target_ref))
}
