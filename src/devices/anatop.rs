//! Anatop (analog/power regulator block) emulation.
//!
//! Guests probe a handful of identification and PLL status registers
//! during early boot; the emulated block answers those from a sparse
//! register file and absorbs everything else. No access ever reaches real
//! hardware.

use super::MmioOp;

/// SoC digital program register: guests read the chip revision here.
const DIGPROG: u64 = 0x800;
const DIGPROG_VALUE: u64 = 0x0082_6010;

const MAX_REGS: usize = 32;

pub struct Anatop {
    regs: [(u64, u64); MAX_REGS],
    len: usize,
}

impl Anatop {
    pub const fn new() -> Self {
        let mut dev = Self {
            regs: [(0, 0); MAX_REGS],
            len: 0,
        };
        dev.regs[0] = (DIGPROG, DIGPROG_VALUE);
        dev.len = 1;
        dev
    }

    fn get(&self, offset: u64) -> u64 {
        self.regs[..self.len]
            .iter()
            .find(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    fn set(&mut self, offset: u64, value: u64) {
        for slot in self.regs[..self.len].iter_mut() {
            if slot.0 == offset {
                slot.1 = value;
                return;
            }
        }
        if self.len < MAX_REGS {
            self.regs[self.len] = (offset, value);
            self.len += 1;
        }
    }

    pub fn access(&mut self, op: MmioOp) -> Option<u64> {
        if op.write {
            // DIGPROG is read-only towards guests.
            if op.offset != DIGPROG {
                self.set(op.offset, op.value);
            }
            None
        } else {
            Some(self.get(op.offset))
        }
    }
}

impl Default for Anatop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digprog_reads_chip_id_and_ignores_writes() {
        let mut dev = Anatop::new();
        let read = MmioOp {
            offset: DIGPROG,
            sas: 2,
            write: false,
            value: 0,
        };
        assert_eq!(dev.access(read), Some(DIGPROG_VALUE));

        dev.access(MmioOp {
            offset: DIGPROG,
            sas: 2,
            write: true,
            value: 0xdead,
        });
        assert_eq!(dev.access(read), Some(DIGPROG_VALUE));
    }

    #[test]
    fn scratch_registers_hold_values() {
        let mut dev = Anatop::new();
        dev.access(MmioOp {
            offset: 0x270,
            sas: 2,
            write: true,
            value: 0x1234,
        });
        let read = MmioOp {
            offset: 0x270,
            sas: 2,
            write: false,
            value: 0,
        };
        assert_eq!(dev.access(read), Some(0x1234));
    }
}
