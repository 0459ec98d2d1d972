//! AArch64 register field definitions used by the trap paths.

// ── ESR_EL2 ─────────────────────────────────────────────────────────

pub const ESR_EC_OFFSET: u64 = 26;

#[inline]
pub const fn esr_ec(esr: u64) -> u64 {
    (esr >> ESR_EC_OFFSET) & 0x3f
}

#[inline]
pub const fn esr_iss(esr: u64) -> u64 {
    esr & 0x01ff_ffff
}

/// IL bit: 4-byte instruction when set.
#[inline]
pub const fn esr_il(esr: u64) -> u64 {
    esr & (1 << 25)
}

/// Length of the trapped instruction in bytes.
#[inline]
pub const fn next_pc_inc(esr: u64) -> u64 {
    if esr_il(esr) != 0 {
        4
    } else {
        2
    }
}

// Exception classes.
pub const EC_UNKNOWN: u64 = 0x00;
pub const EC_WFI_WFE: u64 = 0x01;
pub const EC_SVE_FP_SIMD: u64 = 0x07;
pub const EC_HVC: u64 = 0x16;
pub const EC_SMC: u64 = 0x17;
pub const EC_MSR: u64 = 0x18;
pub const EC_INSTRUCTION_ABORT_LOWER_EL: u64 = 0x20;
pub const EC_INSTRUCTION_ABORT_SAME_EL: u64 = 0x21;
pub const EC_DATA_ABORT_LOWER_EL: u64 = 0x24;
pub const EC_DATA_ABORT_SAME_EL: u64 = 0x25;

// Data/instruction abort ISS fields.

/// WnR: the faulting access was a write.
#[inline]
pub const fn iss_is_write(esr: u64) -> bool {
    esr & (1 << 6) != 0
}

/// FnV: FAR is not valid.
#[inline]
pub const fn iss_fnv(esr: u64) -> bool {
    esr & (1 << 10) != 0
}

/// ISV: the syndrome fields below are valid.
#[inline]
pub const fn iss_isv(esr: u64) -> bool {
    esr & (1 << 24) != 0
}

/// SAS: access size, log2 bytes.
#[inline]
pub const fn iss_sas(esr: u64) -> u64 {
    (esr >> 22) & 0x3
}

/// SSE: sign-extend the loaded value.
#[inline]
pub const fn iss_sse(esr: u64) -> bool {
    esr & (1 << 21) != 0
}

/// SRT: the register transferred.
#[inline]
pub const fn iss_srt(esr: u64) -> u64 {
    (esr >> 16) & 0x1f
}

/// SF: the register is 64 bits wide.
#[inline]
pub const fn iss_sf(esr: u64) -> bool {
    esr & (1 << 15) != 0
}

/// Fault status code (lowest 6 bits of the ISS).
#[inline]
pub const fn iss_fsc(esr: u64) -> u64 {
    esr & 0x3f
}

/// Translation fault, any level.
pub const FSC_TRANSLATION_FAULT_L0: u64 = 0x04;

// MSR/MRS trap ISS fields.

#[inline]
pub const fn iss_op0(esr: u64) -> u64 {
    (esr >> 20) & 0x3
}

#[inline]
pub const fn iss_op1(esr: u64) -> u64 {
    (esr >> 14) & 0x7
}

#[inline]
pub const fn iss_op2(esr: u64) -> u64 {
    (esr >> 17) & 0x7
}

#[inline]
pub const fn iss_crn(esr: u64) -> u64 {
    (esr >> 10) & 0xf
}

#[inline]
pub const fn iss_crm(esr: u64) -> u64 {
    (esr >> 1) & 0xf
}

#[inline]
pub const fn iss_rt(esr: u64) -> u64 {
    (esr >> 5) & 0x1f
}

#[inline]
pub const fn iss_is_read(esr: u64) -> bool {
    esr & 1 != 0
}

/// Normalized op0/op1/crn/crm/op2 key for matching trapped system
/// registers.
#[inline]
pub const fn iss_sysreg(esr: u64) -> u64 {
    sysreg_encoding(iss_op0(esr), iss_op1(esr), iss_crn(esr), iss_crm(esr), iss_op2(esr))
}

#[inline]
pub const fn sysreg_encoding(op0: u64, op1: u64, crn: u64, crm: u64, op2: u64) -> u64 {
    (op0 << 20) | (op2 << 17) | (op1 << 14) | (crn << 10) | (crm << 1)
}

// ── HPFAR_EL2 ───────────────────────────────────────────────────────

/// Faulting IPA bits [39:4], already shifted into place.
#[inline]
pub const fn hpfar_fipa(hpfar: u64) -> u64 {
    (hpfar & 0xffff_ffff_ff0) << 8
}

// ── HCR_EL2 ─────────────────────────────────────────────────────────

pub const HCR_EL2_VM: u64 = 1 << 0;
pub const HCR_EL2_VF: u64 = 1 << 6;
pub const HCR_EL2_VI: u64 = 1 << 7;
pub const HCR_EL2_TSC: u64 = 1 << 19;
pub const HCR_EL2_RW: u64 = 1 << 31;

// ── SPSR / PSTATE ───────────────────────────────────────────────────

pub const PSR_PE_MODE_MASK: u64 = 0xf;
pub const PSR_PE_MODE_EL0T: u64 = 0x0;
pub const PSR_PE_MODE_EL1H: u64 = 0x5;
pub const PSR_ARCH_MODE_32: u64 = 1 << 4;
pub const PSR_F: u64 = 1 << 6;
pub const PSR_I: u64 = 1 << 7;
pub const PSR_A: u64 = 1 << 8;
pub const PSR_D: u64 = 1 << 9;

/// EL1h with all interrupts masked: the state exceptions are injected in
/// and secondaries boot in.
pub const SPSR_EL1H_MASKED: u64 = PSR_D | PSR_A | PSR_I | PSR_F | PSR_PE_MODE_EL1H;

// ── EL1 vector offsets (ARM ARM D1.10.2) ────────────────────────────

pub const VECTOR_OFFSET_CURRENT_SPX: u64 = 0x200;
pub const VECTOR_OFFSET_LOWER_EL_64: u64 = 0x400;
pub const VECTOR_OFFSET_LOWER_EL_32: u64 = 0x600;

// ── SMCCC ───────────────────────────────────────────────────────────

pub const SMCCC_ERROR_UNKNOWN: u64 = u64::MAX; // -1
/// Bit 30 selects the 64-bit calling convention.
pub const SMCCC_CONVENTION_MASK: u64 = 0x4000_0000;
pub const SMCCC_STANDARD_SECURE_SERVICE_CALL: u64 = 0x8400_0000;
pub const SMCCC_SERVICE_CALL_MASK: u64 = 0xbf00_0000;
pub const SMCCC_CALLER_HYPERVISOR: u64 = 0;
/// Client ID field within X7 of an SMC64 call.
pub const SMCCC_CLIENT_ID_MASK: u64 = 0xffff;
