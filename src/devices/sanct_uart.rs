//! Sanctuary UART: a minimal paravirtual console.
//!
//! Registers, named from the VM's perspective:
//!   URX 0x00: received data (bits 7:0), CHR_RDY (bit 15)
//!   UTX 0x04: transmitted data (bits 7:0)
//!   UCR 0x08: control, TX_FLUSH (bit 0)
//!
//! Tx bytes are buffered and flushed to the real console on '\n', on a
//! full buffer, or when the guest sets TX_FLUSH. Each flushed line is
//! prefixed with a per-device tag so interleaved VM output stays
//! attributable.

use super::MmioOp;

const URX: u64 = 0x00;
const UTX: u64 = 0x04;
const UCR: u64 = 0x08;

const UCR_TX_FLUSH: u64 = 1 << 0;
const URX_CHR_RDY: u64 = 1 << 15;

/// Per-device Tx buffer size.
const TX_BUFF_SZ: usize = 2048;

pub struct SanctUart {
    rx: Option<u8>,
    tx_buff: [u8; TX_BUFF_SZ],
    tx_head: usize,
}

impl SanctUart {
    pub const fn new() -> Self {
        Self {
            rx: None,
            tx_buff: [0; TX_BUFF_SZ],
            tx_head: 0,
        }
    }

    /// Queues a received byte for the guest (console demux path).
    pub fn push_rx(&mut self, byte: u8) {
        self.rx = Some(byte);
    }

    fn flush(&mut self, minor: u16) {
        if self.tx_head == 0 {
            return;
        }
        crate::uart::print("VM");
        crate::uart::putchar(b'0' + (minor % 10) as u8);
        crate::uart::print("> ");
        for &b in &self.tx_buff[..self.tx_head] {
            crate::uart::putchar(b);
        }
        self.tx_head = 0;
    }

    pub fn access(&mut self, minor: u16, op: MmioOp) -> Option<u64> {
        if !op.write {
            return Some(match op.offset {
                URX => match self.rx.take() {
                    Some(b) => b as u64 | URX_CHR_RDY,
                    None => 0,
                },
                UTX | UCR => 0,
                _ => 0,
            });
        }

        match op.offset {
            UTX => {
                let byte = op.value as u8;
                self.tx_buff[self.tx_head] = byte;
                self.tx_head += 1;
                if self.tx_head == TX_BUFF_SZ || byte == b'\n' {
                    self.flush(minor);
                }
            }
            UCR => {
                if op.value & UCR_TX_FLUSH != 0 {
                    self.flush(minor);
                }
            }
            _ => {}
        }
        None
    }
}

impl Default for SanctUart {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dev: &mut SanctUart, offset: u64, value: u64) {
        dev.access(
            0,
            MmioOp {
                offset,
                sas: 2,
                write: true,
                value,
            },
        );
    }

    #[test]
    fn tx_buffers_until_newline() {
        let mut dev = SanctUart::new();
        write(&mut dev, UTX, b'h' as u64);
        write(&mut dev, UTX, b'i' as u64);
        assert_eq!(dev.tx_head, 2);
        write(&mut dev, UTX, b'\n' as u64);
        assert_eq!(dev.tx_head, 0);
    }

    #[test]
    fn flush_via_control_register() {
        let mut dev = SanctUart::new();
        write(&mut dev, UTX, b'x' as u64);
        write(&mut dev, UCR, UCR_TX_FLUSH);
        assert_eq!(dev.tx_head, 0);
    }

    #[test]
    fn rx_reads_once_with_ready_bit() {
        let mut dev = SanctUart::new();
        dev.push_rx(b'a');
        let op = MmioOp {
            offset: URX,
            sas: 2,
            write: false,
            value: 0,
        };
        assert_eq!(dev.access(0, op), Some(b'a' as u64 | URX_CHR_RDY));
        assert_eq!(dev.access(0, op), Some(0));
    }
}
