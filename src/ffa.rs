//! FF-A calling convention: function IDs, error codes and the eight-register
//! value block passed between partitions.

// ── Function IDs (SMC32) ────────────────────────────────────────────
pub const FFA_ERROR: u64 = 0x84000060;
pub const FFA_SUCCESS_32: u64 = 0x84000061;
pub const FFA_INTERRUPT_32: u64 = 0x84000062;
pub const FFA_VERSION: u64 = 0x84000063;
pub const FFA_FEATURES: u64 = 0x84000064;
pub const FFA_RX_RELEASE: u64 = 0x84000065;
pub const FFA_RXTX_MAP_32: u64 = 0x84000066;
pub const FFA_RXTX_UNMAP: u64 = 0x84000067;
pub const FFA_PARTITION_INFO_GET: u64 = 0x84000068;
pub const FFA_ID_GET: u64 = 0x84000069;
pub const FFA_MSG_WAIT: u64 = 0x8400006B;
pub const FFA_YIELD: u64 = 0x8400006C;
pub const FFA_RUN: u64 = 0x8400006D;
pub const FFA_MSG_SEND: u64 = 0x8400006E;
pub const FFA_MSG_SEND_DIRECT_REQ_32: u64 = 0x8400006F;
pub const FFA_MSG_SEND_DIRECT_RESP_32: u64 = 0x84000070;

// ── Function IDs (SMC64) ────────────────────────────────────────────
pub const FFA_RXTX_MAP_64: u64 = 0xC4000066;

// ── Version ─────────────────────────────────────────────────────────
pub const FFA_VERSION_1_1: u64 = 0x0001_0001;

// ── Error codes (x2 alongside FFA_ERROR in x0) ─────────────────────
pub const FFA_NOT_SUPPORTED: i64 = -1;
pub const FFA_INVALID_PARAMETERS: i64 = -2;
pub const FFA_NO_MEMORY: i64 = -3;
pub const FFA_BUSY: i64 = -4;
pub const FFA_INTERRUPTED: i64 = -5;
pub const FFA_DENIED: i64 = -6;
pub const FFA_RETRY: i64 = -7;
pub const FFA_ABORTED: i64 = -8;

// ── Hypervisor-internal call IDs ────────────────────────────────────
pub const MAILBOX_WRITABLE_GET: u64 = 0xff01;
pub const MAILBOX_WAITER_GET: u64 = 0xff02;
pub const INTERRUPT_ENABLE: u64 = 0xff03;
pub const INTERRUPT_GET: u64 = 0xff04;
pub const INTERRUPT_INJECT: u64 = 0xff05;

/// Returned to the primary when a vCPU enters wait-for-interrupt.
pub const RUN_WAIT_FOR_INTERRUPT: u64 = 0xff06;
/// Returned to the primary when another vCPU should be scheduled.
pub const RUN_WAKE_UP: u64 = 0xff07;

/// Sleep value reported when no timer deadline is pending.
pub const SLEEP_INDEFINITE: u64 = 0xffff_ffff;

// ── Virtual interrupt IDs ───────────────────────────────────────────
pub const MAILBOX_READABLE_INTID: u32 = 1;
pub const MAILBOX_WRITABLE_INTID: u32 = 2;
pub const VIRTUAL_TIMER_INTID: u32 = 3;
pub const MANAGED_EXIT_INTID: u32 = 4;

pub const INVALID_INTID: u32 = 0xffff_ffff;
/// Handed to a vCPU woken from a mailbox block by a physical interrupt.
pub const DEFERRED_INTID: u32 = 0xffff;

/// Size of each mailbox buffer.
pub const MAILBOX_SIZE: usize = 4096;

/// The SMCCC x0..x7 block used for arguments and return values of HVC,
/// SMC and FF-A exchanges.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct FfaValue {
    pub func: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
    pub arg5: u64,
    pub arg6: u64,
    pub arg7: u64,
}

impl FfaValue {
    pub const fn with_func(func: u64) -> Self {
        Self {
            func,
            arg1: 0,
            arg2: 0,
            arg3: 0,
            arg4: 0,
            arg5: 0,
            arg6: 0,
            arg7: 0,
        }
    }

    pub const fn success() -> Self {
        Self::with_func(FFA_SUCCESS_32)
    }

    pub const fn error(code: i64) -> Self {
        let mut v = Self::with_func(FFA_ERROR);
        v.arg2 = code as u64;
        v
    }

    /// A bare register result, as PSCI and legacy SMCs return.
    pub const fn psci_ret(x0: u64) -> Self {
        Self::with_func(x0)
    }
}

/// Packs (vm id, vcpu index) the way FFA_RUN and the RUN_* returns carry
/// them in arg1.
pub const fn vm_vcpu(vm_id: u16, vcpu_index: u16) -> u64 {
    ((vm_id as u64) << 16) | vcpu_index as u64
}

pub const fn vm_id_from_arg(arg: u64) -> u16 {
    (arg >> 16) as u16
}

pub const fn vcpu_index_from_arg(arg: u64) -> u16 {
    arg as u16
}
