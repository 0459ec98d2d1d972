//! Virtual GIC.
//!
//! Each VM gets a RAM shadow of the distributor, the ITS frame and one
//! redistributor frame per vCPU, laid out back to back so a single
//! hypervisor-owned region covers all three. Reads are served from the
//! shadow, so the guest sees its own redistributor layout; writes go to
//! both the shadow and the real GIC, with three rewrites on the way:
//!
//!  * `GICD_IROUTER<n>`: the guest's target affinity is translated through
//!    its vCPU list to the real CPU's affinity (routing-mode bit kept).
//!  * `GICD_CTLR`: the hypervisor-controlled value stays in the real
//!    register; the shadow records the guest's perception.
//!  * `GICD_ISENABLER<n>`: newly enabled interrupts are routed to the
//!    calling CPU and recorded in the owner table.
//!
//! One spinlock serializes all vGIC register traffic across pCPUs.

use arrayvec::ArrayVec;

use crate::addr::Ipaddr;
use crate::arch::defs::*;
use crate::arch::{aff_to_no, read_mpidr};
use crate::cpu::CpuId;
use crate::platform::MAX_VCPUS;
use crate::state::{SystemState, MAX_INTERRUPTS};
use crate::vcpu::{FaultInfo, VcpuRef, VcpuState};
use crate::vm::Vm;
use crate::mm::Mode;

// Distributor register offsets.
const GICD_CTLR: u64 = 0x000;
const GICD_ISENABLER0: u64 = 0x100;
const GICD_ISENABLER_END: u64 = GICD_ISENABLER0 + 31 * 4;
/// GICD_IROUTER<n> sits at 0x6000 + 8n (valid for SPIs, n = 32..1019).
const GICD_IROUTER_BASE: u64 = 0x6000;
const GICD_IROUTER_END: u64 = GICD_IROUTER_BASE + 1019 * 8;

const GICD_CTLR_RWP: u32 = 1 << 31;
const GICD_CTLR_ARE_NS: u32 = 1 << 4;
/// IROUTER bit 31 selects "any participating CPU" routing mode.
const IROUTER_MODE_BIT: u64 = 1 << 31;

/// Bounded RWP wait: register writes must settle before dependent writes.
const RWP_MAX_POLLS: u32 = 1 << 20;

/// Per-VM shadow region descriptor. The backing memory is allocated from
/// the hypervisor pool at VM build time and never freed.
#[derive(Clone, Copy, Debug)]
pub struct VirtGic {
    /// Hypervisor address of the shadow region.
    base: u64,
    /// Guest IPA the GIC is advertised at.
    gic_ipa: u64,
    gicd_size: u64,
    gits_size: u64,
    gicr_frame_size: u64,
    gicr_frames: u32,
}

impl VirtGic {
    pub fn new(base: u64, gic_ipa: u64, gic: &crate::state::GicMap, vcpu_count: u32) -> Self {
        Self {
            base,
            gic_ipa,
            gicd_size: gic.gicd_size,
            gits_size: gic.gits_size,
            gicr_frame_size: gic.gicr_frame_size,
            gicr_frames: vcpu_count,
        }
    }

    /// Bytes of shadow memory needed for `vcpu_count` redistributors.
    pub fn region_size(gic: &crate::state::GicMap, vcpu_count: u32) -> usize {
        (gic.gicd_size + gic.gits_size + gic.gicr_frame_size * vcpu_count as u64) as usize
    }

    pub fn total_size(&self) -> u64 {
        self.gicd_size + self.gits_size + self.gicr_frame_size * self.gicr_frames as u64
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn gic_ipa(&self) -> u64 {
        self.gic_ipa
    }

    pub fn contains_ipa(&self, ipa: Ipaddr) -> bool {
        ipa.addr() >= self.gic_ipa && ipa.addr() < self.gic_ipa + self.total_size()
    }

    /// Shadow address backing a guest IPA inside the region.
    pub fn shadow_addr(&self, ipa: Ipaddr) -> u64 {
        self.base + (ipa.addr() - self.gic_ipa)
    }

    /// Translates a guest GIC IPA to the real GIC register it stands for.
    /// Redistributor accesses are shifted from the vCPU's frame into the
    /// frame of the physical CPU backing it.
    pub fn to_gic(&self, ipa: Ipaddr, gic: &crate::state::GicMap, vm_cpus: &[CpuId]) -> Option<u64> {
        let off = ipa.addr().checked_sub(self.gic_ipa)?;
        if off >= self.total_size() {
            return None;
        }

        if off < self.gicd_size {
            return Some(gic.gicd_base + off);
        }
        let off = off - self.gicd_size;
        if off < self.gits_size {
            return Some(gic.gits_base + off);
        }
        let off = off - self.gits_size;

        let addr = gic.gicr_base + off;
        Some(gicr_adjust_cpu_offset(addr, gic, vm_cpus))
    }
}

/// Shifts a redistributor address into the frame of the physical CPU that
/// backs the accessed vCPU: `addr += (pcpu_no - vcpu_no) * frame_size`.
fn gicr_adjust_cpu_offset(addr: u64, gic: &crate::state::GicMap, vm_cpus: &[CpuId]) -> u64 {
    let vcpu_no = (addr - gic.gicr_base) / gic.gicr_frame_size;
    let mut pcpu_no = (read_mpidr() >> 8) & 0x7;

    if let Some(&cpu_id) = vm_cpus.get(vcpu_no as usize) {
        pcpu_no = aff_to_no(cpu_id);
    }

    addr.wrapping_add((pcpu_no.wrapping_sub(vcpu_no)).wrapping_mul(gic.gicr_frame_size))
}

// ── volatile access helpers ─────────────────────────────────────────

fn read_width(addr: u64, sas: u64) -> u64 {
    unsafe {
        match sas {
            0 => core::ptr::read_volatile(addr as *const u8) as u64,
            1 => core::ptr::read_volatile(addr as *const u16) as u64,
            2 => core::ptr::read_volatile(addr as *const u32) as u64,
            _ => core::ptr::read_volatile(addr as *const u64),
        }
    }
}

fn write_width(addr: u64, sas: u64, value: u64) {
    unsafe {
        match sas {
            0 => core::ptr::write_volatile(addr as *mut u8, value as u8),
            1 => core::ptr::write_volatile(addr as *mut u16, value as u16),
            2 => core::ptr::write_volatile(addr as *mut u32, value as u32),
            _ => core::ptr::write_volatile(addr as *mut u64, value),
        }
    }
}

/// Polls GICD_CTLR.RWP until outstanding register writes have settled.
fn rwp_wait(gic: &crate::state::GicMap) {
    let ctlr = gic.gicd_base + GICD_CTLR;
    for _ in 0..RWP_MAX_POLLS {
        if unsafe { core::ptr::read_volatile(ctlr as *const u32) } & GICD_CTLR_RWP == 0 {
            return;
        }
        core::hint::spin_loop();
    }
    log::error!("wait for GICD_CTLR.RWP failed, continuing anyway");
}

// ── interrupt routing ───────────────────────────────────────────────

type OnlineCpus = ArrayVec<CpuId, MAX_VCPUS>;

/// Physical CPU ids of a VM's online vCPUs. Taken before the vGIC lock so
/// no vCPU lock is needed underneath it.
fn online_cpus(vm: &Vm) -> OnlineCpus {
    let mut out = OnlineCpus::new();
    for (i, &cpu_id) in vm.config().cpus.iter().enumerate() {
        if i >= vm.vcpu_count() as usize {
            break;
        }
        if let Some(vcpu) = vm.vcpu(i as u16) {
            if vcpu.peek_state() != VcpuState::Off {
                let _ = out.try_push(cpu_id);
            }
        }
    }
    out
}

fn irouter_addr(gic: &crate::state::GicMap, intid: u32) -> u64 {
    gic.gicd_base + GICD_IROUTER_BASE + intid as u64 * 8
}

/// Whether the real routing of `intid` already targets one of the given
/// CPUs.
fn routed_to_cpus(gic: &crate::state::GicMap, intid: u32, cpus: &OnlineCpus) -> bool {
    let raw = unsafe { core::ptr::read_volatile(irouter_addr(gic, intid) as *const u64) };
    if raw == 0 {
        return false;
    }
    let target = raw & !IROUTER_MODE_BIT;
    cpus.iter().any(|&c| c == target)
}

/// Points the physical routing of `intid` at `cpu_id` for `vm_id`. When
/// the interrupt currently belongs to a different VM it is instead moved
/// off `cpu_id`, onto another online CPU of its owner.
pub fn route_intid_to_cpu(state: &SystemState, intid: u32, cpu_id: CpuId, vm_id: u16) {
    if !(32..=988).contains(&intid) {
        return;
    }
    let old_owner = state.interrupts.owner(intid);
    let addr = irouter_addr(&state.gic, intid);
    let raw = unsafe { core::ptr::read_volatile(addr as *const u64) };

    if raw != 0 && old_owner.is_some() && old_owner != Some(vm_id) {
        let owner_cpus = old_owner
            .and_then(|id| state.vm_find(id))
            .map(online_cpus)
            .unwrap_or_default();
        reroute_intid(state, intid, cpu_id, &owner_cpus);
    } else {
        unsafe { core::ptr::write_volatile(addr as *mut u64, cpu_id) };
    }
    rwp_wait(&state.gic);
}

/// Moves `intid` off `cpu_id` and onto another online CPU of its owning
/// VM; drops the routing when none exists.
fn reroute_intid(state: &SystemState, intid: u32, cpu_id: CpuId, owner_cpus: &OnlineCpus) {
    if !(32..=988).contains(&intid) {
        return;
    }
    let addr = irouter_addr(&state.gic, intid);
    let next = owner_cpus.iter().copied().find(|&c| c != cpu_id);
    // No remaining CPU: drop the routing entirely.
    unsafe { core::ptr::write_volatile(addr as *mut u64, next.unwrap_or(0)) };
}

/// Reroutes every interrupt owned by `vm_id` away from `cpu_id` (CPU_OFF
/// path).
pub fn reroute_all_interrupts(state: &SystemState, vm: &Vm, cpu_id: CpuId) {
    let owner_cpus = online_cpus(vm);
    let _vgic = state.vgic_lock.lock();
    for intid in 0..MAX_INTERRUPTS as u32 {
        if state.interrupts.owner(intid) == Some(vm.id()) {
            reroute_intid(state, intid, cpu_id, &owner_cpus);
        }
    }
    rwp_wait(&state.gic);
}

// ── trapped MMIO access ─────────────────────────────────────────────

/// Attempts to satisfy a data abort as a vGIC access. Returns true when
/// handled (the caller advances the PC).
pub fn access(state: &SystemState, cur: VcpuRef, esr: u64, info: &FaultInfo) -> bool {
    let (vm, vcpu) = state.vcpu(cur);

    let vgic = {
        let inner = vm.lock();
        match inner.vgic {
            Some(v) => v,
            None => return false,
        }
    };

    if !vgic.contains_ipa(info.ipaddr) {
        return false;
    }

    // Without a valid syndrome the access cannot be emulated.
    if !iss_isv(esr) {
        return false;
    }

    let Some(real_addr) = vgic.to_gic(info.ipaddr, &state.gic, &vm.config().cpus) else {
        log::warn!(
            "access is not a valid GIC field, ipa {:#x}",
            info.ipaddr.addr()
        );
        return false;
    };
    let shadow_addr = vgic.shadow_addr(info.ipaddr);

    let sas = iss_sas(esr);
    let srt = iss_srt(esr) as usize;

    if info.mode == Mode::R {
        // Reads are served from the shadow without the vGIC lock.
        let mut value = read_width(shadow_addr, sas);

        if sas == 2 && !iss_sf(esr) {
            value &= 0xffff_ffff;
        }
        let mut regs = vcpu.lock();
        if sas == 2 && !iss_sf(esr) {
            let old = regs.regs.get(srt);
            regs.regs.set(srt, (old & 0xffff_ffff_0000_0000) | value);
        } else {
            regs.regs.set(srt, value);
        }
        true
    } else if info.mode == Mode::W {
        // SRT == 31 stores the zero register.
        let value = if srt == 31 {
            0
        } else {
            vcpu.lock().regs.get(srt)
        };

        let gicd_off = real_addr
            .checked_sub(state.gic.gicd_base)
            .filter(|&off| off < state.gic.gicd_size);

        let _vgic_guard = state.vgic_lock.lock();
        write_to_reg(state, vm, cur, real_addr, shadow_addr, sas, value, gicd_off);
        true
    } else {
        false
    }
}

/// The write-through path with the hypervisor-owned rewrites. Runs under
/// the vGIC lock; everything it reads about vCPUs is lock-free state.
#[allow(clippy::too_many_arguments)]
fn write_to_reg(
    state: &SystemState,
    vm: &Vm,
    cur: VcpuRef,
    real_addr: u64,
    shadow_addr: u64,
    sas: u64,
    guest_value: u64,
    gicd_off: Option<u64>,
) {
    let mut real_value = guest_value;
    let mut shadow_value = guest_value;

    if let Some(off) = gicd_off {
        if (GICD_IROUTER_BASE..=GICD_IROUTER_END).contains(&off) {
            // Rewrite the guest's target affinity to the backing physical
            // CPU; fall back to the calling CPU, which belongs to this VM
            // and is certainly online.
            let target_no = aff_to_no(guest_value & !IROUTER_MODE_BIT) as usize;
            let target_online = vm
                .vcpu(target_no as u16)
                .map(|v| v.peek_state() != VcpuState::Off)
                .unwrap_or(false);
            let host_id = if target_online {
                vm.config().cpus[target_no]
            } else {
                vm.config().cpus[cur.vcpu_index as usize]
            };
            real_value = (guest_value & IROUTER_MODE_BIT) | host_id;
        }

        if off == GICD_CTLR {
            // The guest may not reconfigure the distributor; it only gets
            // to see affinity routing as fixed on.
            real_value =
                unsafe { core::ptr::read_volatile(real_addr as *const u32) } as u64;
            shadow_value = guest_value | GICD_CTLR_ARE_NS as u64;
        }
    }

    write_width(real_addr, sas, real_value);
    write_width(shadow_addr, sas, shadow_value);
    rwp_wait(&state.gic);

    if let Some(off) = gicd_off {
        if (GICD_ISENABLER0..=GICD_ISENABLER_END).contains(&off) {
            let first_intid = ((off - GICD_ISENABLER0) * 8) as u32;
            let current_cpu = read_mpidr() & 0x700;
            let cpus_online = online_cpus(vm);
            let mut bits = guest_value;
            for i in 0..32 {
                if bits & 1 != 0 && first_intid + i < MAX_INTERRUPTS as u32 {
                    let intid = first_intid + i;
                    if !routed_to_cpus(&state.gic, intid, &cpus_online) {
                        route_intid_to_cpu(state, intid, current_cpu, vm.id());
                    }
                    state.interrupts.set_owner(intid, vm.id());
                }
                bits >>= 1;
            }
        }
    }
}
