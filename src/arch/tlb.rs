//! TLB maintenance.
//!
//! Small ranges are invalidated page by page; anything larger than
//! `MAX_TLBI_OPS` pages flushes the whole stage-scoped TLB. Every batch is
//! closed with a DSB; the ISB before the next guest entry is issued by the
//! world-switch path.

use crate::mm::{MAX_TLBI_OPS, PAGE_BITS, PAGE_SIZE};

/// Invalidates stage-1 entries for `[begin, end)` (hypervisor VA).
pub fn invalidate_stage1_range(begin: u64, end: u64) {
    let pages = ((end - begin) as usize + PAGE_SIZE - 1) / PAGE_SIZE;

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        use core::arch::asm;
        asm!("dsb ishst", options(nostack, nomem));
        if pages > MAX_TLBI_OPS {
            asm!("tlbi alle2is", options(nostack, nomem));
        } else {
            let mut addr = begin >> PAGE_BITS;
            for _ in 0..pages {
                asm!("tlbi vae2is, {}", in(reg) addr, options(nostack, nomem));
                addr += 1;
            }
        }
        asm!("dsb ish", options(nostack, nomem));
    }

    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        let _ = (begin, pages);
    }
}

/// Invalidates stage-2 entries for the IPA range `[begin, end)` of the
/// current VMID.
pub fn invalidate_stage2_range(begin: u64, end: u64) {
    let pages = ((end - begin) as usize + PAGE_SIZE - 1) / PAGE_SIZE;

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        use core::arch::asm;
        asm!("dsb ishst", options(nostack, nomem));
        if pages > MAX_TLBI_OPS {
            asm!("tlbi vmalls12e1is", options(nostack, nomem));
        } else {
            let mut addr = begin >> PAGE_BITS;
            for _ in 0..pages {
                asm!("tlbi ipas2e1is, {}", in(reg) addr, options(nostack, nomem));
                addr += 1;
            }
            // The IPAS2 ops only reach stage-2; complete the job for the
            // combined walks.
            asm!("dsb ish", options(nostack, nomem));
            asm!("tlbi vmalle1is", options(nostack, nomem));
        }
        asm!("dsb ish", options(nostack, nomem));
    }

    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        let _ = (begin, pages);
    }
}

/// Invalidates all stage-1 entries of the current VMID on this CPU.
/// Used when a pCPU switches between vCPUs of one VM, compensating for
/// guests that reuse ASIDs inconsistently across vCPUs.
pub fn invalidate_vm_tlb_current_cpu() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        use core::arch::asm;
        // The preceding VTTBR write must have taken effect first.
        asm!("isb", options(nostack, nomem));
        asm!("tlbi vmalle1", options(nostack, nomem));
        asm!("isb", options(nostack, nomem));
        // Non-shareable is enough: this TLB is local to the CPU.
        asm!("dsb nsh", options(nostack, nomem));
    }
}
