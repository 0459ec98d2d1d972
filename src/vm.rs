//! Per-VM state.
//!
//! A VM owns its vCPUs inline and refers to physical CPUs and to other
//! VMs by index, never by pointer. Configuration is written exactly once
//! during single-threaded init and read-only afterwards; everything that
//! changes at runtime lives behind the VM lock.

use arrayvec::ArrayVec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use uuid::Uuid;

use crate::addr::{Ipaddr, Paddr};
use crate::cpu::CpuId;
use crate::mm::ptable::Ptable;
use crate::platform::{MAX_CPUS, MAX_VCPUS, MAX_VMS};
use crate::sync::{SpinLock, SpinLockGuard};
use crate::vcpu::Vcpu;
use crate::vgic::VirtGic;

/// VM ID 0 is reserved for the hypervisor; guests start here.
pub const VM_ID_OFFSET: u16 = 1;
pub const PRIMARY_VM_ID: u16 = VM_ID_OFFSET;

/// Max interrupt descriptors a manifest can attach to one VM.
pub const MAX_INTERRUPT_DESCS: usize = 64;
/// Max entries in a VM's SMC whitelist.
pub const MAX_SMCS: usize = 32;
/// Max security-service UUIDs per VM.
pub const MAX_SECURITY_SERVICES: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MailboxState {
    /// No message, writable.
    Empty,
    /// A message is buffered and not yet seen by the receiver.
    Received,
    /// The receiver has read the message but not released the buffer.
    Read,
}

/// Per-VM FF-A mailbox: one RX and one TX page, configured once, plus the
/// waiter bookkeeping for senders blocked on a full RX buffer.
pub struct Mailbox {
    pub state: MailboxState,
    /// Guest TX page; mapped read-only into the hypervisor's stage-1.
    pub send: Option<Paddr>,
    /// Guest RX page; mapped writable into the hypervisor's stage-1.
    pub recv: Option<Paddr>,
    pub recv_sender: u16,
    pub recv_size: u32,
    pub recv_func: u64,
    /// VMs waiting to be told this RX became writable, in arrival order.
    pub waiter_list: ArrayVec<u16, MAX_VMS>,
    /// Waiters that have been moved to "ready to notify".
    pub ready_list: ArrayVec<u16, MAX_VMS>,
}

impl Mailbox {
    pub const fn new() -> Self {
        Self {
            state: MailboxState::Empty,
            send: None,
            recv: None,
            recv_sender: 0,
            recv_size: 0,
            recv_func: 0,
            waiter_list: ArrayVec::new_const(),
            ready_list: ArrayVec::new_const(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.send.is_some() && self.recv.is_some()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// One physical interrupt assignment from the manifest.
#[derive(Clone, Copy, Debug)]
pub struct InterruptDescriptor {
    pub interrupt_id: u32,
    pub attributes: u32,
}

#[derive(Default)]
pub struct SmcWhitelist {
    pub smcs: ArrayVec<u32, MAX_SMCS>,
    pub permissive: bool,
}

impl SmcWhitelist {
    pub const fn new() -> Self {
        Self {
            smcs: ArrayVec::new_const(),
            permissive: false,
        }
    }
}

/// Immutable-after-init description of a VM, from the manifest.
pub struct VmConfig {
    pub uuid: Uuid,
    pub vcpu_count: u16,
    /// Physical CPU ids by vCPU index.
    pub cpus: ArrayVec<CpuId, MAX_VCPUS>,
    pub smc_whitelist: SmcWhitelist,
    pub security_services: ArrayVec<Uuid, MAX_SECURITY_SERVICES>,
    pub is_primary: bool,
    pub requires_identity_mapping: bool,
    pub ipa_mem_begin: Ipaddr,
    pub ipa_mem_end: Ipaddr,
    pub boot_order: u16,
}

impl VmConfig {
    pub const fn empty() -> Self {
        Self {
            uuid: Uuid::nil(),
            vcpu_count: 0,
            cpus: ArrayVec::new_const(),
            smc_whitelist: SmcWhitelist::new(),
            security_services: ArrayVec::new_const(),
            is_primary: false,
            requires_identity_mapping: false,
            ipa_mem_begin: Ipaddr::new(0),
            ipa_mem_end: Ipaddr::new(0),
            boot_order: 0,
        }
    }
}

/// Runtime state guarded by the VM lock. The stage-2 table is part of
/// this: holding the VM lock implies holding the page-table lock.
pub struct VmInner {
    pub ptable: Option<Ptable>,
    pub mailbox: Mailbox,
    pub vgic: Option<VirtGic>,
    pub interrupt_desc: ArrayVec<InterruptDescriptor, MAX_INTERRUPT_DESCS>,
    /// Next VM in the boot-order list, linked by id.
    pub next_boot: Option<u16>,
    /// Which pCPU last ran each vCPU of this VM, for the stale-TLB
    /// workaround on vCPU switch.
    pub last_vcpu_on_cpu: [Option<u16>; MAX_CPUS],
}

pub struct Vm {
    id: AtomicU16,
    aborting: AtomicBool,
    config: UnsafeCell<VmConfig>,
    inner: SpinLock<VmInner>,
    vcpus: [Vcpu; MAX_VCPUS],
}

// config is written only during single-threaded init (see `configure`);
// all later access is read-only.
unsafe impl Sync for Vm {}

impl Vm {
    pub const fn new() -> Self {
        Self {
            id: AtomicU16::new(0),
            aborting: AtomicBool::new(false),
            config: UnsafeCell::new(VmConfig::empty()),
            inner: SpinLock::new(VmInner {
                ptable: None,
                mailbox: Mailbox::new(),
                vgic: None,
                interrupt_desc: ArrayVec::new_const(),
                next_boot: None,
                last_vcpu_on_cpu: [None; MAX_CPUS],
            }),
            vcpus: [const { Vcpu::new() }; MAX_VCPUS],
        }
    }

    pub fn id(&self) -> u16 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn is_initialized(&self) -> bool {
        self.id() != 0
    }

    pub fn is_primary(&self) -> bool {
        self.config().is_primary
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Relaxed)
    }

    pub fn set_aborting(&self) {
        self.aborting.store(true, Ordering::Relaxed);
    }

    pub fn config(&self) -> &VmConfig {
        unsafe { &*self.config.get() }
    }

    /// Installs id and configuration. Must only be called from the
    /// single-threaded init path, before secondary CPUs are powered on.
    pub fn configure(&self, id: u16, config: VmConfig) {
        assert!(!self.is_initialized(), "VM {} configured twice", id);
        assert!(id >= VM_ID_OFFSET);
        unsafe { *self.config.get() = config };
        self.id.store(id, Ordering::Release);
    }

    pub fn vcpu_count(&self) -> u16 {
        self.config().vcpu_count
    }

    pub fn vcpu(&self, index: u16) -> Option<&Vcpu> {
        (index < self.vcpu_count()).then(|| &self.vcpus[index as usize])
    }

    /// vCPU index bound to the physical CPU `cpu_id`, if any.
    pub fn vcpu_index_of_cpu(&self, cpu_id: CpuId) -> Option<u16> {
        self.config()
            .cpus
            .iter()
            .position(|&c| c == cpu_id)
            .map(|i| i as u16)
    }

    pub fn lock(&self) -> SpinLockGuard<'_, VmInner> {
        self.inner.lock()
    }

    /// Locks two VMs in address order.
    pub fn lock_both<'a>(
        a: &'a Vm,
        b: &'a Vm,
    ) -> (SpinLockGuard<'a, VmInner>, SpinLockGuard<'a, VmInner>) {
        crate::sync::lock_both(&a.inner, &b.inner)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
