//! Pin controller (iomux) emulation.
//!
//! Pad and mux configuration writes from guests are recorded but never
//! applied; the hypervisor owns the real pin setup. Reads return whatever
//! the guest last wrote so driver init sequences see their own state.

use super::MmioOp;

const MAX_REGS: usize = 64;

pub struct Iomux {
    regs: [(u64, u64); MAX_REGS],
    len: usize,
}

impl Iomux {
    pub const fn new() -> Self {
        Self {
            regs: [(0, 0); MAX_REGS],
            len: 0,
        }
    }

    pub fn access(&mut self, op: MmioOp) -> Option<u64> {
        if op.write {
            for slot in self.regs[..self.len].iter_mut() {
                if slot.0 == op.offset {
                    slot.1 = op.value;
                    return None;
                }
            }
            if self.len < MAX_REGS {
                self.regs[self.len] = (op.offset, op.value);
                self.len += 1;
            }
            None
        } else {
            Some(
                self.regs[..self.len]
                    .iter()
                    .find(|(o, _)| *o == op.offset)
                    .map(|(_, v)| *v)
                    .unwrap_or(0),
            )
        }
    }
}

impl Default for Iomux {
    fn default() -> Self {
        Self::new()
    }
}
