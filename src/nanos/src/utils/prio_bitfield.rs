//! Provides `PrioBitfield`, the ready-level index of the scheduler.
use core::fmt;

use super::Init;

/// The maximum number of priority levels supported by [`PrioBitfield`].
pub const MAX_PRIORITY_LEVELS: usize = BYTES * 8;

const BYTES: usize = 8;

/// Maps a byte to the index of its most significant set bit. The entry for
/// `0` is never consulted.
static HIGHEST_BIT: [u8; 256] = highest_bit_table();

const fn highest_bit_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 1;
    while i < 256 {
        let mut bit = 7;
        while (i >> bit) & 1 == 0 {
            bit -= 1;
        }
        table[i] = bit as u8;
        i += 1;
    }
    table
}

/// One bit per priority level. Bit `n` is set iff level `n` has at least one
/// ready task.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PrioBitfield {
    bytes: [u8; BYTES],
}

impl Init for PrioBitfield {
    const INIT: Self = Self { bytes: [0; BYTES] };
}

impl fmt::Debug for PrioBitfield {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..MAX_PRIORITY_LEVELS).filter(|&i| self.get(i)))
            .finish()
    }
}

impl PrioBitfield {
    /// Get the bit at the specified position.
    pub fn get(&self, i: usize) -> bool {
        self.bytes[i / 8] & (1 << (i % 8)) != 0
    }

    /// Set the bit at the specified position.
    pub fn set(&mut self, i: usize) {
        self.bytes[i / 8] |= 1 << (i % 8);
    }

    /// Clear the bit at the specified position.
    pub fn clear(&mut self, i: usize) {
        self.bytes[i / 8] &= !(1 << (i % 8));
    }

    /// Get the position of the highest set bit.
    ///
    /// The scan visits at most one byte per eight priority levels.
    pub fn find_highest(&self) -> Option<usize> {
        self.bytes
            .iter()
            .enumerate()
            .rev()
            .find(|(_, &byte)| byte != 0)
            .map(|(i, &byte)| i * 8 + HIGHEST_BIT[byte as usize] as usize)
    }
}
