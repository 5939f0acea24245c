//! Reordering of interleaved ADC bursts into per-cell sample groups
//!
//! The ADC samples its two inputs back to back while the multiplexer steps
//! through its eight positions, so each 16-sample window holds one value for
//! every (cell, signal) pair at offset `2 * mux_position + adc_input`. Which
//! offset belongs to which cell is fixed by the wiring harness of this board
//! revision.

use crate::config::{NUM_CELLS, SAMPLES_PER_BURST};
use crate::mux::MUX_POSITIONS;

/// One signed ADC reading
pub type RawSample = i16;

/// Samples in one window (one multiplexer cycle over both ADC inputs)
pub const WINDOW_LEN: usize = 2 * MUX_POSITIONS;

/// Samples in one burst
pub const BURST_LEN: usize = WINDOW_LEN * SAMPLES_PER_BURST;

/// Interleaved buffer produced by one acquisition burst
pub type RawBuffer = [RawSample; BURST_LEN];

/// The samples of one cell and one signal type across a burst
pub type SampleGroup = [RawSample; SAMPLES_PER_BURST];

/// Window offset of each cell's voltage sample
pub const VOLTAGE_OFFSETS: [usize; NUM_CELLS] = [0, 2, 4, 6, 9, 13, 11, 15];

/// Window offset of each cell's current sample
pub const CURRENT_OFFSETS: [usize; NUM_CELLS] = [8, 12, 10, 14, 1, 3, 5, 7];

const fn is_window_permutation(voltage: &[usize; NUM_CELLS], current: &[usize; NUM_CELLS]) -> bool {
    let mut used = [false; WINDOW_LEN];
    let mut i = 0;
    while i < NUM_CELLS {
        if voltage[i] >= WINDOW_LEN || used[voltage[i]] {
            return false;
        }
        used[voltage[i]] = true;
        if current[i] >= WINDOW_LEN || used[current[i]] {
            return false;
        }
        used[current[i]] = true;
        i += 1;
    }
    true
}

const _: () = assert!(is_window_permutation(&VOLTAGE_OFFSETS, &CURRENT_OFFSETS));

/// Voltage and current samples of one cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellSamples {
    pub voltage: SampleGroup,
    pub current: SampleGroup,
}

/// Split an interleaved burst into per-cell sample groups
pub fn deinterlace(buffer: &RawBuffer) -> [CellSamples; NUM_CELLS] {
    let mut cells = [CellSamples::default(); NUM_CELLS];

    for (repeat, window) in buffer.chunks_exact(WINDOW_LEN).enumerate() {
        for (cell, samples) in cells.iter_mut().enumerate() {
            samples.voltage[repeat] = window[VOLTAGE_OFFSETS[cell]];
            samples.current[repeat] = window[CURRENT_OFFSETS[cell]];
        }
    }

    cells
}

/// Inverse of [`deinterlace`]: lay per-cell samples out the way the ADC
/// would have produced them
pub fn interlace(cells: &[CellSamples; NUM_CELLS]) -> RawBuffer {
    let mut buffer = [0; BURST_LEN];

    for (repeat, window) in buffer.chunks_exact_mut(WINDOW_LEN).enumerate() {
        for (cell, samples) in cells.iter().enumerate() {
            window[VOLTAGE_OFFSETS[cell]] = samples.voltage[repeat];
            window[CURRENT_OFFSETS[cell]] = samples.current[repeat];
        }
    }

    buffer
}
