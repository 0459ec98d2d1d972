//! Clock controller: passthrough with write filtering.
//!
//! The real clock controller is identity-mapped by the hypervisor. Guest
//! accesses still trap so that writes which would disturb clocks shared
//! with other partitions can be blocked; everything else is forwarded
//! unchanged.

use super::{passthrough_access, MmioOp};

/// Offsets guests may not write: the root slice controlling the shared
/// bus clock and the CCGR gate of the always-on domain.
const BLOCKED_WRITE_OFFSETS: [u64; 2] = [0x44b0, 0xb000];

pub struct ClockCtrl;

impl ClockCtrl {
    pub const fn new() -> Self {
        Self
    }

    pub fn access(&mut self, base: u64, op: MmioOp) -> Option<u64> {
        if op.write && BLOCKED_WRITE_OFFSETS.contains(&op.offset) {
            log::debug!("blocked write to ccm[{:#x}]", op.offset);
            return None;
        }
        passthrough_access(base, op)
    }
}

impl Default for ClockCtrl {
    fn default() -> Self {
        Self::new()
    }
}
