//! Trapped system-register access.
//!
//! Groups recognized by the MSR/MRS trap path: EL1 debug registers,
//! performance monitors, feature-ID registers and the GIC CPU-interface
//! registers (ICC_*, and the ICV_* aliases that share encodings). Debug
//! and perfmon registers are RAZ/WI towards guests; feature-ID registers
//! read the real values; ICC registers are passed through to the hardware
//! so guests acknowledge and complete interrupts in place.

use crate::arch::defs::*;

// GIC CPU-interface encodings.
pub const ICC_PMR_EL1: u64 = sysreg_encoding(3, 0, 4, 6, 0);
pub const ICC_IAR0_EL1: u64 = sysreg_encoding(3, 0, 12, 8, 0);
pub const ICC_EOIR0_EL1: u64 = sysreg_encoding(3, 0, 12, 8, 1);
pub const ICC_HPPIR0_EL1: u64 = sysreg_encoding(3, 0, 12, 8, 2);
pub const ICC_BPR0_EL1: u64 = sysreg_encoding(3, 0, 12, 8, 3);
pub const ICC_DIR_EL1: u64 = sysreg_encoding(3, 0, 12, 11, 1);
pub const ICC_RPR_EL1: u64 = sysreg_encoding(3, 0, 12, 11, 3);
pub const ICC_SGI1R_EL1: u64 = sysreg_encoding(3, 0, 12, 11, 5);
pub const ICC_ASGI1R_EL1: u64 = sysreg_encoding(3, 0, 12, 11, 6);
pub const ICC_SGI0R_EL1: u64 = sysreg_encoding(3, 0, 12, 11, 7);
pub const ICC_IAR1_EL1: u64 = sysreg_encoding(3, 0, 12, 12, 0);
pub const ICC_EOIR1_EL1: u64 = sysreg_encoding(3, 0, 12, 12, 1);
pub const ICC_HPPIR1_EL1: u64 = sysreg_encoding(3, 0, 12, 12, 2);
pub const ICC_BPR1_EL1: u64 = sysreg_encoding(3, 0, 12, 12, 3);
pub const ICC_CTLR_EL1: u64 = sysreg_encoding(3, 0, 12, 12, 4);
pub const ICC_SRE_EL1: u64 = sysreg_encoding(3, 0, 12, 12, 5);
pub const ICC_IGRPEN0_EL1: u64 = sysreg_encoding(3, 0, 12, 12, 6);
pub const ICC_IGRPEN1_EL1: u64 = sysreg_encoding(3, 0, 12, 12, 7);

/// True for ICC_*/ICV_* encodings: op0==3, op1==0, crn 12 crm 8..12, or
/// the PMR at crn 4 crm 6.
pub fn is_gic_access(esr: u64) -> bool {
    let op0 = iss_op0(esr);
    let op1 = iss_op1(esr);
    let crn = iss_crn(esr);
    let crm = iss_crm(esr);
    op0 == 3 && op1 == 0 && ((crn == 0xc && (0x8..=0xc).contains(&crm)) || (crn == 4 && crm == 6))
}

/// True for the EL1 debug register space (op0 == 2).
pub fn is_debug_access(esr: u64) -> bool {
    iss_op0(esr) == 2
}

/// True for the performance-monitor register space.
pub fn is_perfmon_access(esr: u64) -> bool {
    let op0 = iss_op0(esr);
    let op1 = iss_op1(esr);
    let crn = iss_crn(esr);
    op0 == 3 && op1 == 3 && (crn == 9 || crn == 14)
}

/// True for the feature-ID register space (op0==3, op1==0, crn==0).
pub fn is_feature_id_access(esr: u64) -> bool {
    iss_op0(esr) == 3 && iss_op1(esr) == 0 && iss_crn(esr) == 0 && (1..=7).contains(&iss_crm(esr))
}

/// Reads a feature-ID register. Unrecognized registers read as zero, which
/// reports the feature as not implemented.
pub fn read_feature_id(esr: u64) -> u64 {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        macro_rules! id_read {
            ($sreg:literal) => {{
                let v: u64;
                unsafe {
                    core::arch::asm!(concat!("mrs {}, ", $sreg), out(reg) v, options(nostack, nomem))
                };
                v
            }};
        }
        match (iss_crm(esr), iss_op2(esr)) {
            (4, 0) => id_read!("id_aa64pfr0_el1"),
            (4, 1) => id_read!("id_aa64pfr1_el1"),
            (5, 0) => id_read!("id_aa64dfr0_el1"),
            (6, 0) => id_read!("id_aa64isar0_el1"),
            (6, 1) => id_read!("id_aa64isar1_el1"),
            (7, 0) => id_read!("id_aa64mmfr0_el1"),
            (7, 1) => id_read!("id_aa64mmfr1_el1"),
            (7, 2) => id_read!("id_aa64mmfr2_el1"),
            _ => 0,
        }
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        let _ = esr;
        0
    }
}

macro_rules! gic_sysregs {
    ($( $enc:ident => $sreg:literal ),* $(,)?) => {
        /// Reads a GIC CPU-interface register by trap encoding.
        pub fn read_gic_register(enc: u64) -> Option<u64> {
            match enc {
                $( x if x == $enc => {
                    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
                    {
                        let v: u64;
                        unsafe {
                            core::arch::asm!(concat!("mrs {}, ", $sreg), out(reg) v,
                                options(nostack, nomem))
                        };
                        Some(v)
                    }
                    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
                    {
                        Some(fake::read(enc))
                    }
                } )*
                _ => None,
            }
        }

        /// Writes a GIC CPU-interface register by trap encoding.
        pub fn write_gic_register(enc: u64, value: u64) -> bool {
            match enc {
                $( x if x == $enc => {
                    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
                    unsafe {
                        core::arch::asm!(concat!("msr ", $sreg, ", {}"), in(reg) value,
                            options(nostack, nomem));
                        core::arch::asm!("isb", options(nostack, nomem));
                    }
                    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
                    {
                        fake::write(enc, value);
                    }
                    true
                } )*
                _ => false,
            }
        }
    };
}

gic_sysregs! {
    ICC_PMR_EL1 => "S3_0_C4_C6_0",
    ICC_IAR0_EL1 => "S3_0_C12_C8_0",
    ICC_EOIR0_EL1 => "S3_0_C12_C8_1",
    ICC_HPPIR0_EL1 => "S3_0_C12_C8_2",
    ICC_BPR0_EL1 => "S3_0_C12_C8_3",
    ICC_DIR_EL1 => "S3_0_C12_C11_1",
    ICC_RPR_EL1 => "S3_0_C12_C11_3",
    ICC_SGI1R_EL1 => "S3_0_C12_C11_5",
    ICC_ASGI1R_EL1 => "S3_0_C12_C11_6",
    ICC_SGI0R_EL1 => "S3_0_C12_C11_7",
    ICC_IAR1_EL1 => "S3_0_C12_C12_0",
    ICC_EOIR1_EL1 => "S3_0_C12_C12_1",
    ICC_HPPIR1_EL1 => "S3_0_C12_C12_2",
    ICC_BPR1_EL1 => "S3_0_C12_C12_3",
    ICC_CTLR_EL1 => "S3_0_C12_C12_4",
    ICC_SRE_EL1 => "S3_0_C12_C12_5",
    ICC_IGRPEN0_EL1 => "S3_0_C12_C12_6",
    ICC_IGRPEN1_EL1 => "S3_0_C12_C12_7",
}

/// The guest's EL1 vector base, needed to inject exceptions.
pub fn read_vbar_el1() -> u64 {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        let v: u64;
        unsafe { core::arch::asm!("mrs {}, vbar_el1", out(reg) v, options(nostack, nomem)) };
        v
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        fake::read(VBAR_EL1)
    }
}

/// Encoding used to key VBAR_EL1 in the fake register file.
pub const VBAR_EL1: u64 = sysreg_encoding(3, 0, 12, 0, 0);

/// Acknowledges and returns the highest-priority pending physical
/// interrupt (ICC_IAR1 read).
pub fn get_pending_interrupt_id() -> u32 {
    read_gic_register(ICC_IAR1_EL1).unwrap_or(crate::ffa::INVALID_INTID as u64) as u32
}

/// Sets the running priority mask; 0 blocks all further delivery.
pub fn set_priority_mask(mask: u8) {
    write_gic_register(ICC_PMR_EL1, mask as u64);
}

/// Host-side register file for the GIC CPU interface.
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub mod fake {
    use crate::sync::SpinLock;

    static REGS: SpinLock<[(u64, u64); 32]> = SpinLock::new([(0, 0); 32]);

    pub(super) fn read(enc: u64) -> u64 {
        let regs = REGS.lock();
        regs.iter().find(|(e, _)| *e == enc).map(|(_, v)| *v).unwrap_or(0)
    }

    pub(super) fn write(enc: u64, value: u64) {
        let mut regs = REGS.lock();
        if let Some(slot) = regs.iter_mut().find(|(e, _)| *e == enc) {
            slot.1 = value;
            return;
        }
        if let Some(slot) = regs.iter_mut().find(|(e, _)| *e == 0) {
            *slot = (enc, value);
        }
    }

    /// Test hook: primes a register with a value (e.g. a pending INTID in
    /// ICC_IAR1).
    pub fn prime(enc: u64, value: u64) {
        write(enc, value);
    }

    pub fn reset() {
        *REGS.lock() = [(0, 0); 32];
    }
}
