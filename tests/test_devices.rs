//! Virtual device framework: emulation, passthrough filtering and
//! direct-map faults.

mod common;

use arrayvec::ArrayVec;
use peregrine::addr::Ipaddr;
use peregrine::devices::{self, DevOutcome, VirtDev};
use peregrine::mm::{Mode, PAGE_SIZE};
use peregrine::state::SystemState;
use peregrine::vcpu::{FaultInfo, VcpuRef};
use peregrine::vm::{SmcWhitelist, VmConfig};

fn setup(state: &'static SystemState) -> VcpuRef {
    let mut cpus = ArrayVec::new();
    cpus.push(0u64);
    state
        .vm_init_next(VmConfig {
            uuid: uuid::Uuid::nil(),
            vcpu_count: 1,
            cpus,
            smc_whitelist: SmcWhitelist::new(),
            security_services: ArrayVec::new(),
            is_primary: true,
            requires_identity_mapping: false,
            ipa_mem_begin: Ipaddr::new(0x1000_0000),
            ipa_mem_end: Ipaddr::new(0x1010_0000),
            boot_order: u16::MAX,
        })
        .unwrap();
    VcpuRef { vm_id: 1, vcpu_index: 0 }
}

fn esr_word(srt: u64, write: bool) -> u64 {
    let mut esr = (0x24u64 << 26) | (1 << 24) | (2 << 22) | (srt << 16);
    if write {
        esr |= 1 << 6;
    }
    esr
}

fn fault_at(ipa: u64, write: bool) -> FaultInfo {
    FaultInfo {
        ipaddr: Ipaddr::new(ipa),
        vaddr: peregrine::addr::Vaddr::new(ipa),
        pc: 0,
        mode: if write { Mode::W } else { Mode::R },
    }
}

#[test]
fn uart_tx_is_emulated() {
    let state = common::make_state(128);
    let cur = setup(state);

    let base = 0x3086_0000u64;
    state
        .devices
        .lock()
        .register(
            "sanct-uart",
            0,
            base,
            base + 0x1_0000,
            VirtDev::SanctUart(peregrine::devices::sanct_uart::SanctUart::new()),
        )
        .unwrap();

    // Store a byte to UTX (offset 4).
    let (_, vcpu) = state.vcpu(cur);
    vcpu.lock().regs.set(1, b'x' as u64);
    let out = devices::access_virt_dev(state, cur, esr_word(1, true), &fault_at(base + 4, true));
    assert_eq!(out, DevOutcome::Handled);

    // Reads of URX report nothing pending.
    let out = devices::access_virt_dev(state, cur, esr_word(2, false), &fault_at(base, false));
    assert_eq!(out, DevOutcome::Handled);
    assert_eq!(vcpu.lock().regs.get(2), 0);
}

#[test]
fn writes_of_xzr_store_zero() {
    let state = common::make_state(128);
    let cur = setup(state);

    let base = 0x3036_0000u64;
    state
        .devices
        .lock()
        .register(
            "anatop",
            0,
            base,
            base + 0x1_0000,
            VirtDev::Anatop(peregrine::devices::anatop::Anatop::new()),
        )
        .unwrap();

    // Seed a scratch register, then overwrite it with xzr (SRT == 31).
    let (_, vcpu) = state.vcpu(cur);
    vcpu.lock().regs.set(1, 0x5555);
    devices::access_virt_dev(state, cur, esr_word(1, true), &fault_at(base + 0x40, true));
    devices::access_virt_dev(state, cur, esr_word(31, true), &fault_at(base + 0x40, true));

    devices::access_virt_dev(state, cur, esr_word(2, false), &fault_at(base + 0x40, false));
    assert_eq!(vcpu.lock().regs.get(2), 0);
}

#[test]
fn clock_ctrl_blocks_the_protected_offsets() {
    let state = common::make_state(128);
    let cur = setup(state);

    // Back the "real" clock controller with an arena so passthrough is
    // observable.
    let base = common::arena(16);
    state
        .devices
        .lock()
        .register(
            "clock-ctrl",
            0,
            base,
            base + 16 * PAGE_SIZE as u64,
            VirtDev::ClockCtrl(peregrine::devices::clock_ctrl::ClockCtrl::new()),
        )
        .unwrap();

    let (_, vcpu) = state.vcpu(cur);

    // An ordinary register passes through.
    vcpu.lock().regs.set(1, 0x1234_5678);
    devices::access_virt_dev(state, cur, esr_word(1, true), &fault_at(base + 0x100, true));
    let real = unsafe { core::ptr::read_volatile((base + 0x100) as *const u32) };
    assert_eq!(real, 0x1234_5678);

    // The protected offsets stay untouched.
    for blocked in [0x44b0u64, 0xb000] {
        vcpu.lock().regs.set(1, 0xBAD);
        let out =
            devices::access_virt_dev(state, cur, esr_word(1, true), &fault_at(base + blocked, true));
        assert_eq!(out, DevOutcome::Handled);
        let real = unsafe { core::ptr::read_volatile((base + blocked) as *const u32) };
        assert_eq!(real, 0);
    }

    // Reads of a blocked offset still pass through.
    devices::access_virt_dev(state, cur, esr_word(2, false), &fault_at(base + 0x44b0, false));
    assert_eq!(vcpu.lock().regs.get(2), 0);
}

#[test]
fn direct_map_installs_stage2_and_retries() {
    let state = common::make_state(128);
    let cur = setup(state);

    // Use window-backed MMIO so the stage-2 map points at real memory.
    let base = common::arena(2);
    state
        .devices
        .lock()
        .register("dmap", 0, base, base + PAGE_SIZE as u64, VirtDev::DirectMap)
        .unwrap();

    let out = devices::access_virt_dev(state, cur, esr_word(1, true), &fault_at(base + 8, true));
    assert_eq!(out, DevOutcome::Retry);

    // The VM can now reach the device without trapping.
    let vm = state.vm_find(1).unwrap();
    let inner = vm.lock();
    let pt = inner.ptable.as_ref().unwrap();
    assert_eq!(pt.walk(Ipaddr::new(base + 8)), Some(peregrine::addr::Paddr::new(base + 8)));
    let mode = pt
        .get_mode(Ipaddr::new(base), Ipaddr::new(base + PAGE_SIZE as u64))
        .unwrap();
    assert!(mode.contains(Mode::R | Mode::W | Mode::D));
}

#[test]
fn unclaimed_addresses_fall_through() {
    let state = common::make_state(128);
    let cur = setup(state);
    let out = devices::access_virt_dev(state, cur, esr_word(1, false), &fault_at(0x5555_0000, false));
    assert_eq!(out, DevOutcome::Unhandled);
}
