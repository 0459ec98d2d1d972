//! Virtual device framework.
//!
//! A flat registry of up to 128 devices, each claiming one IPA range.
//! Data aborts that miss the vGIC are offered to the registry; the owning
//! device resolves the access under one of three policies:
//!
//!  * pure emulation: backing state is per-instance registers,
//!  * passthrough: the real (identity-mapped) device is accessed, with
//!    per-device filtering,
//!  * direct-map: the first fault maps the real MMIO into the VM's
//!    stage-2 and the instruction is retried; later accesses never trap.
//!
//! Dispatch is a tagged enum, one variant per device type.

pub mod anatop;
pub mod clock_ctrl;
pub mod iomux;
pub mod sanct_uart;

use arrayvec::ArrayVec;

use crate::arch::defs::{iss_isv, iss_sas, iss_sf, iss_srt};
use crate::mm::Mode;
use crate::state::SystemState;
use crate::vcpu::{FaultInfo, VcpuRef};

pub const MAX_VIRT_DEVS: usize = 128;

/// What the framework should do after consulting a device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DevOutcome {
    /// Access emulated; skip the trapped instruction.
    Handled,
    /// Stage-2 now maps the range; re-execute the instruction.
    Retry,
    /// Not ours; let the fault take its course.
    Unhandled,
}

/// A read/write request already decoded from the ESR.
#[derive(Clone, Copy, Debug)]
pub struct MmioOp {
    pub offset: u64,
    /// log2 of the access width in bytes.
    pub sas: u64,
    pub write: bool,
    pub value: u64,
}

pub enum VirtDev {
    SanctUart(sanct_uart::SanctUart),
    Anatop(anatop::Anatop),
    Iomux(iomux::Iomux),
    ClockCtrl(clock_ctrl::ClockCtrl),
    /// Trap-and-forward to the real, identity-mapped device.
    Passthrough,
    /// Map the real MMIO through to the VM on first touch.
    DirectMap,
}

pub struct VirtDevEntry {
    pub name: &'static str,
    pub minor: u16,
    pub addr_start: u64,
    pub addr_end: u64,
    dev: VirtDev,
}

impl VirtDevEntry {
    /// Emulates one access. Returns the value read, or None for writes.
    fn access(&mut self, op: MmioOp) -> Option<u64> {
        match &mut self.dev {
            VirtDev::SanctUart(d) => d.access(self.minor, op),
            VirtDev::Anatop(d) => d.access(op),
            VirtDev::Iomux(d) => d.access(op),
            VirtDev::ClockCtrl(d) => d.access(self.addr_start, op),
            VirtDev::Passthrough => passthrough_access(self.addr_start, op),
            VirtDev::DirectMap => None,
        }
    }
}

pub(crate) fn passthrough_access(base: u64, op: MmioOp) -> Option<u64> {
    let addr = base + op.offset;
    unsafe {
        if op.write {
            match op.sas {
                0 => core::ptr::write_volatile(addr as *mut u8, op.value as u8),
                1 => core::ptr::write_volatile(addr as *mut u16, op.value as u16),
                2 => core::ptr::write_volatile(addr as *mut u32, op.value as u32),
                _ => core::ptr::write_volatile(addr as *mut u64, op.value),
            }
            None
        } else {
            Some(match op.sas {
                0 => core::ptr::read_volatile(addr as *const u8) as u64,
                1 => core::ptr::read_volatile(addr as *const u16) as u64,
                2 => core::ptr::read_volatile(addr as *const u32) as u64,
                _ => core::ptr::read_volatile(addr as *const u64),
            })
        }
    }
}

pub struct DeviceRegistry {
    devs: ArrayVec<VirtDevEntry, MAX_VIRT_DEVS>,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            devs: ArrayVec::new_const(),
        }
    }

    pub fn register(
        &mut self,
        name: &'static str,
        minor: u16,
        addr_start: u64,
        addr_end: u64,
        dev: VirtDev,
    ) -> Result<(), ()> {
        if self.devs.is_full() {
            return Err(());
        }
        log::debug!(
            "virt dev {}:{} at {:#x} - {:#x}",
            name,
            minor,
            addr_start,
            addr_end
        );
        self.devs.push(VirtDevEntry {
            name,
            minor,
            addr_start,
            addr_end,
            dev,
        });
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.devs.len()
    }

    fn find_mut(&mut self, ipa: u64) -> Option<&mut VirtDevEntry> {
        self.devs
            .iter_mut()
            .find(|d| ipa >= d.addr_start && ipa < d.addr_end)
    }

    /// Registers the platform's built-in devices for one VM. The same IPA
    /// window serves all VMs; per-VM minors keep the UART streams apart.
    pub fn register_platform_devices(&mut self, vm_index: u16) {
        use crate::platform::*;
        let uart_base = V_SANCT_UART_BASE + vm_index as u64 * V_SANCT_UART_SIZE;
        let _ = self.register(
            "sanct-uart",
            vm_index,
            uart_base,
            uart_base + V_SANCT_UART_SIZE,
            VirtDev::SanctUart(sanct_uart::SanctUart::new()),
        );
        if vm_index == 0 {
            let _ = self.register(
                "anatop",
                0,
                V_ANATOP_BASE,
                V_ANATOP_BASE + V_ANATOP_SIZE,
                VirtDev::Anatop(anatop::Anatop::new()),
            );
            let _ = self.register(
                "iomux",
                0,
                V_IOMUX_BASE,
                V_IOMUX_BASE + V_IOMUX_SIZE,
                VirtDev::Iomux(iomux::Iomux::new()),
            );
            let _ = self.register(
                "clock-ctrl",
                0,
                V_CLOCK_CTRL_BASE,
                V_CLOCK_CTRL_BASE + V_CLOCK_CTRL_SIZE,
                VirtDev::ClockCtrl(clock_ctrl::ClockCtrl::new()),
            );
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Tries to satisfy a data abort as a virtual-device access.
pub fn access_virt_dev(
    state: &SystemState,
    cur: VcpuRef,
    esr: u64,
    info: &FaultInfo,
) -> DevOutcome {
    let ipa = info.ipaddr.addr();

    // Direct-map devices only need the stage-2 mapping installed; resolve
    // them before decoding the instruction.
    let direct = {
        let mut reg = state.devices.lock();
        match reg.find_mut(ipa) {
            None => return DevOutcome::Unhandled,
            Some(entry) => match entry.dev {
                VirtDev::DirectMap => Some((entry.addr_start, entry.addr_end)),
                _ => None,
            },
        }
    };

    if let Some((start, end)) = direct {
        let (vm, _) = state.vcpu(cur);
        let mut inner = vm.lock();
        let Some(ptable) = inner.ptable.as_mut() else {
            return DevOutcome::Unhandled;
        };
        let begin = crate::addr::Paddr::new(start);
        let end = crate::addr::Paddr::new(end);
        if ptable
            .identity_map(begin, end, Mode::R | Mode::W | Mode::D, &state.ppool)
            .is_err()
        {
            log::error!("unable to direct-map device at {:#x}", start);
            return DevOutcome::Unhandled;
        }
        return DevOutcome::Retry;
    }

    // Emulated access needs valid syndrome fields.
    if !iss_isv(esr) {
        return DevOutcome::Unhandled;
    }
    let sas = iss_sas(esr);
    let srt = iss_srt(esr) as usize;
    let write = info.mode == Mode::W;

    let value = if write {
        if srt == 31 {
            // Stores of the zero register write zero.
            0
        } else {
            let (_, vcpu) = state.vcpu(cur);
            vcpu.lock().regs.get(srt)
        }
    } else {
        0
    };

    let result = {
        let mut reg = state.devices.lock();
        let Some(entry) = reg.find_mut(ipa) else {
            return DevOutcome::Unhandled;
        };
        let op = MmioOp {
            offset: ipa - entry.addr_start,
            sas,
            write,
            value,
        };
        entry.access(op)
    };

    if !write {
        let mut read = result.unwrap_or(0);
        if sas == 2 && !iss_sf(esr) {
            read &= 0xffff_ffff;
        }
        let (_, vcpu) = state.vcpu(cur);
        vcpu.lock().regs.set(srt, read);
    }

    DevOutcome::Handled
}
