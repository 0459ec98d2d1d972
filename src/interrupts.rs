//! Physical interrupt demultiplexing.
//!
//! Every unmasked physical IRQ taken while a guest runs lands here. The
//! interrupt is acknowledged at the GIC, matched against the interrupt
//! descriptors of all VMs to find its owner, pended as a virtual IRQ on
//! the owning vCPU, and, depending on that vCPU's state, the pCPU either
//! switches to it or resumes the preempted guest.

use crate::api::{self, Transition};
use crate::arch::sysregs;
use crate::ffa;
use crate::state::SystemState;
use crate::vcpu::{VcpuRef, VcpuState};

/// Finds the vCPU of the VM owning `interrupt_id` that corresponds to the
/// current pCPU. Panics when no VM owns the interrupt: physical interrupts
/// are only ever enabled on behalf of some VM.
pub fn find_target_vcpu(state: &SystemState, interrupt_id: u32) -> VcpuRef {
    let mut target_vm = None;

    'vms: for index in 0..state.vm_count() {
        let vm = state.vm_find_index(index).unwrap();
        let inner = vm.lock();
        // Descriptors are populated contiguously.
        for desc in inner.interrupt_desc.iter() {
            if desc.interrupt_id == interrupt_id {
                target_vm = Some(vm.id());
                break 'vms;
            }
        }
    }

    let vm_id = match target_vm {
        Some(id) => id,
        None => panic!("physical interrupt without an owning VM"),
    };
    let vm = state.vm_find(vm_id).unwrap();
    let vcpu_index = api::vm_vcpu_index_for_cpu(vm, state.current_cpu_index())
        .expect("interrupt target vCPU must exist");

    VcpuRef { vm_id, vcpu_index }
}

/// Delegates the pending physical interrupt to the vCPU of its owning VM.
pub fn delegate_interrupt(state: &SystemState, cur: VcpuRef) -> Transition {
    // Reading IAR both returns and activates the interrupt.
    let id = sysregs::get_pending_interrupt_id();
    let target = find_target_vcpu(state, id);

    {
        let (_, cur_vcpu) = state.vcpu(cur);
        let mut g = cur_vcpu.lock();
        cur_vcpu.set_state(&mut g, VcpuState::Preempted);
    }

    // Mask everything until this interrupt has been handled; nested
    // delivery is not supported.
    sysregs::set_priority_mask(0);

    let (_, target_vcpu) = state.vcpu(target);
    let mut tg = target_vcpu.lock();

    // The outcome is irrelevant here: delegation schedules the target
    // itself instead of bouncing through the primary's scheduler.
    let _ = api::interrupt_inject_locked(&mut tg, id, cur, target);

    if target == cur {
        log::trace!("resuming current vCPU for interrupt {}", id);
        target_vcpu.set_state(&mut tg, VcpuState::Running);
        return Transition::Resume;
    }

    let arg1 = match tg.state() {
        VcpuState::Ready => id as u64,
        // Implementation-defined: the blocked receiver learns the real id
        // via interrupt_get once it runs.
        VcpuState::BlockedMailbox => ffa::DEFERRED_INTID as u64,
        VcpuState::Preempted | VcpuState::BlockedInterrupt => {
            // Do not resume a vCPU that was itself preempted or is sitting
            // in WFI; the vIRQ stays pending and the current vCPU goes on.
            return Transition::Resume;
        }
        VcpuState::Running | VcpuState::Off | VcpuState::Aborted => {
            panic!("interrupt cannot be signalled to target vCPU");
        }
    };

    crate::check!(tg.regs_available);
    tg.regs.set_retval(crate::ffa::FfaValue {
        func: ffa::FFA_INTERRUPT_32,
        arg1,
        ..Default::default()
    });
    target_vcpu.set_state(&mut tg, VcpuState::Running);
    tg.regs_available = false;
    tg.update_virtual_interrupts();

    Transition::SwitchTo(target)
}
