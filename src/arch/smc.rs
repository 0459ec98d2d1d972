//! SMC trampoline to EL3.
//!
//! From EL2, `smc #0` goes straight to EL3; `HCR_EL2.TSC` only traps EL1
//! SMCs. Off-target the call is recorded and answered from a configurable
//! result so the forwarding policies can be tested without a secure
//! monitor.

use crate::ffa::FfaValue;

/// Forwards an SMC with the full SMCCC x0..x7 argument block and returns
/// x0..x7.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn forward(args: FfaValue) -> FfaValue {
    let (r0, r1, r2, r3, r4, r5, r6, r7): (u64, u64, u64, u64, u64, u64, u64, u64);
    unsafe {
        core::arch::asm!(
            "smc #0",
            inout("x0") args.func => r0,
            inout("x1") args.arg1 => r1,
            inout("x2") args.arg2 => r2,
            inout("x3") args.arg3 => r3,
            inout("x4") args.arg4 => r4,
            inout("x5") args.arg5 => r5,
            inout("x6") args.arg6 => r6,
            inout("x7") args.arg7 => r7,
            // x8-x17 may be clobbered by the callee per SMCCC.
            lateout("x8") _,
            lateout("x9") _,
            lateout("x10") _,
            lateout("x11") _,
            lateout("x12") _,
            lateout("x13") _,
            lateout("x14") _,
            lateout("x15") _,
            lateout("x16") _,
            lateout("x17") _,
            options(nomem, nostack),
        );
    }
    FfaValue {
        func: r0,
        arg1: r1,
        arg2: r2,
        arg3: r3,
        arg4: r4,
        arg5: r5,
        arg6: r6,
        arg7: r7,
    }
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn forward(args: FfaValue) -> FfaValue {
    fake::record(args)
}

/// 32-bit convention helper: upper argument bits are not meaningful.
pub fn smc32(func: u64, arg1: u64, arg2: u64, arg3: u64, caller_id: u64) -> FfaValue {
    forward(FfaValue {
        func,
        arg1,
        arg2,
        arg3,
        arg4: 0,
        arg5: 0,
        arg6: 0,
        arg7: caller_id,
    })
}

pub fn smc64(func: u64, arg1: u64, arg2: u64, arg3: u64, caller_id: u64) -> FfaValue {
    smc32(func, arg1, arg2, arg3, caller_id)
}

/// Recording fake monitor, mirroring the fake SMC layer the original test
/// builds linked in.
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub mod fake {
    use crate::ffa::FfaValue;
    use crate::sync::SpinLock;

    struct MonitorState {
        calls: [Option<FfaValue>; 16],
        count: usize,
        /// Results to hand out, consumed front to back; when exhausted the
        /// monitor answers 0 (success).
        results: [Option<FfaValue>; 16],
        next_result: usize,
        queued: usize,
    }

    static MONITOR: SpinLock<MonitorState> = SpinLock::new(MonitorState {
        calls: [None; 16],
        count: 0,
        results: [None; 16],
        next_result: 0,
        queued: 0,
    });

    pub(super) fn record(args: FfaValue) -> FfaValue {
        let mut m = MONITOR.lock();
        if m.count < m.calls.len() {
            let i = m.count;
            m.calls[i] = Some(args);
        }
        m.count += 1;
        if m.next_result < m.queued {
            let idx = m.next_result;
            let r = m.results[idx].take().unwrap();
            m.next_result += 1;
            r
        } else {
            FfaValue::psci_ret(0)
        }
    }

    /// Clears recorded calls and queued results.
    pub fn reset() {
        let mut m = MONITOR.lock();
        *m = MonitorState {
            calls: [None; 16],
            count: 0,
            results: [None; 16],
            next_result: 0,
            queued: 0,
        };
    }

    /// Queues the x0 value of the next response.
    pub fn queue_result(x0: u64) {
        let mut m = MONITOR.lock();
        let i = m.queued;
        assert!(i < m.results.len());
        m.results[i] = Some(FfaValue::psci_ret(x0));
        m.queued += 1;
    }

    /// Number of SMCs issued since the last reset.
    pub fn call_count() -> usize {
        MONITOR.lock().count
    }

    /// The `n`th recorded call.
    pub fn call(n: usize) -> Option<FfaValue> {
        MONITOR.lock().calls.get(n).copied().flatten()
    }
}
