//! Per-second cell frames and their wire format
//!
//! A frame holds one value per cell and signal, interleaved the way the
//! host expects it:
//!
//! | index        | value              |
//! |--------------|--------------------|
//! | `2 * cell`   | voltage (mV)       |
//! | `2 * cell+1` | current (mA)       |
//!
//! Binary format (little-endian): 16 × u16 = 32 bytes. A field equal to
//! [`NO_DATA`] has never been recorded.

use serde::{Deserialize, Serialize};

use crate::config::NUM_CELLS;

/// Values per frame
pub const FRAME_LEN: usize = 2 * NUM_CELLS;

/// Encoded frame size in bytes
pub const FRAME_BYTES: usize = FRAME_LEN * 2;

/// Sentinel for "no data recorded in this field"
pub const NO_DATA: u16 = 0xFFFF;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellFrame(pub [u16; FRAME_LEN]);

impl Default for CellFrame {
    fn default() -> Self {
        Self::empty()
    }
}

impl CellFrame {
    /// A frame with every field unrecorded
    pub const fn empty() -> Self {
        Self([NO_DATA; FRAME_LEN])
    }

    pub fn from_cells(voltages: &[u16; NUM_CELLS], currents: &[u16; NUM_CELLS]) -> Self {
        let mut values = [0; FRAME_LEN];
        for cell in 0..NUM_CELLS {
            values[2 * cell] = voltages[cell];
            values[2 * cell + 1] = currents[cell];
        }
        Self(values)
    }

    pub fn voltage(&self, cell: usize) -> u16 {
        self.0[2 * cell]
    }

    pub fn current(&self, cell: usize) -> u16 {
        self.0[2 * cell + 1]
    }

    /// True when at least one field holds data
    pub fn is_recorded(&self) -> bool {
        self.0.iter().any(|&v| v != NO_DATA)
    }

    /// Converts the frame to its 32-byte wire representation.
    pub fn to_bytes(&self) -> [u8; FRAME_BYTES] {
        let mut bytes = [0u8; FRAME_BYTES];
        for (chunk, value) in bytes.chunks_exact_mut(2).zip(self.0.iter()) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Creates a frame from its wire representation.
    pub fn from_bytes(bytes: &[u8; FRAME_BYTES]) -> Self {
        let mut values = [0u16; FRAME_LEN];
        for (value, chunk) in values.iter_mut().zip(bytes.chunks_exact(2)) {
            *value = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
        Self(values)
    }
}
