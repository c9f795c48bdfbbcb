//! 32-bit register access.
//!
//! [`RegisterIo`] is the seam between the capture layer and whatever actually
//! backs a register range: a memory-mapped window on real hardware, or
//! [`SimRegisters`] in tests and the simulator. All accessors take `&self`;
//! atomicity of a single read or write is the implementation's job, while
//! read-modify-write sequences are serialized by the caller (the owning
//! capture device for CSI registers, the PHY arbiter lock for the shared PHY
//! register).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::error::Result;

/// Access to one register range. Offsets are in bytes and 4-byte aligned.
pub trait RegisterIo: Send + Sync {
    /// Read the register at `offset`.
    fn read(&self, offset: usize) -> u32;

    /// Write `value` to the register at `offset`.
    fn write(&self, offset: usize, value: u32);

    /// Read-modify-write: clear `clear`, then set `set`. Returns the written value.
    ///
    /// Not atomic with respect to other writers of the same register.
    fn modify(&self, offset: usize, clear: u32, set: u32) -> u32 {
        let value = (self.read(offset) & !clear) | set;
        self.write(offset, value);
        value
    }
}

/// Shared handle to a register range.
pub type SharedRegisters = Arc<dyn RegisterIo>;

/// Platform hook that hands out the CSI register range of an instance.
pub trait RegisterMap: Send + Sync {
    /// Acquire the CSI register window of `instance`.
    ///
    /// Fails with `ResourceUnavailable` if the range cannot be mapped.
    fn map_csi(&self, instance: u32) -> Result<SharedRegisters>;
}

/// In-memory register range.
///
/// Registers listed with [`SimRegisters::with_write_one_to_clear`] behave like
/// hardware status registers: writing a 1 clears that bit, and bits are set
/// only through [`SimRegisters::raise`].
#[derive(Debug)]
pub struct SimRegisters {
    words: Vec<AtomicU32>,
    w1c: HashSet<usize>,
    writes: AtomicU64,
}

impl SimRegisters {
    /// Create a zeroed range of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            words: (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect(),
            w1c: HashSet::new(),
            writes: AtomicU64::new(0),
        }
    }

    /// Give the register at `offset` write-one-to-clear semantics.
    pub fn with_write_one_to_clear(mut self, offset: usize) -> Self {
        self.w1c.insert(offset);
        self
    }

    /// Set bits from the hardware side, as a status line would.
    pub fn raise(&self, offset: usize, bits: u32) {
        if let Some(word) = self.word(offset) {
            word.fetch_or(bits, Ordering::AcqRel);
        }
    }

    /// Total number of writes issued through [`RegisterIo`].
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    fn word(&self, offset: usize) -> Option<&AtomicU32> {
        if offset % 4 != 0 {
            warn!(offset, "Unaligned register access");
            return None;
        }
        let word = self.words.get(offset / 4);
        if word.is_none() {
            warn!(offset, size = self.words.len() * 4, "Register access out of range");
        }
        word
    }
}

impl RegisterIo for SimRegisters {
    fn read(&self, offset: usize) -> u32 {
        self.word(offset)
            .map(|word| word.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn write(&self, offset: usize, value: u32) {
        let Some(word) = self.word(offset) else {
            return;
        };
        self.writes.fetch_add(1, Ordering::AcqRel);
        if self.w1c.contains(&offset) {
            word.fetch_and(!value, Ordering::AcqRel);
        } else {
            word.store(value, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modify_preserves_other_bits() {
        let regs = SimRegisters::new(16);
        regs.write(4, 0xF0F0);
        assert_eq!(regs.modify(4, 0x00F0, 0x0003), 0xF003);
        assert_eq!(regs.read(4), 0xF003);
        assert_eq!(regs.write_count(), 2);
    }

    #[test]
    fn test_write_one_to_clear() {
        let regs = SimRegisters::new(16).with_write_one_to_clear(8);
        regs.raise(8, 0b111);
        regs.write(8, 0b010);
        assert_eq!(regs.read(8), 0b101);
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let regs = SimRegisters::new(8);
        regs.write(64, 1);
        assert_eq!(regs.read(64), 0);
        assert_eq!(regs.write_count(), 0);
    }
}
