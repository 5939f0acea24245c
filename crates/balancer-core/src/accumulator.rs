//! Per-second accumulation of acquisition cycles
//!
//! Every acquisition cycle contributes its calibrated averages and
//! deviations. After [`CYCLES_PER_SECOND`] cycles (about one second at the
//! acquisition cadence, the only clock the device has) the accumulator is
//! committed into a [`CellSummary`] and starts over.
//!
//! ## Accumulation rules
//!
//! - **Averages**: summed per cell, divided by the cycle count on commit
//! - **Deviations**: one-directional ratchet, only raised, reset on commit

use crate::aggregate::CellMeasurement;
use crate::config::{CYCLES_PER_SECOND, NUM_CELLS};
use crate::frame::CellFrame;

/// Output of one commit: means and worst-case deviations in frame layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSummary {
    pub averages: CellFrame,
    pub deviations: CellFrame,
}

/// Running sums across acquisition cycles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellAccumulator {
    voltage_sum: [u32; NUM_CELLS],
    current_sum: [u32; NUM_CELLS],
    voltage_dev_max: [u16; NUM_CELLS],
    current_dev_max: [u16; NUM_CELLS],
    cycles: u16,
}

impl CellAccumulator {
    pub const fn new() -> Self {
        Self {
            voltage_sum: [0; NUM_CELLS],
            current_sum: [0; NUM_CELLS],
            voltage_dev_max: [0; NUM_CELLS],
            current_dev_max: [0; NUM_CELLS],
            cycles: 0,
        }
    }

    /// Fold one cycle's readings into the running state
    pub fn add(&mut self, measurements: &[CellMeasurement; NUM_CELLS]) {
        for (cell, m) in measurements.iter().enumerate() {
            self.voltage_sum[cell] += m.voltage.average as u32;
            self.current_sum[cell] += m.current.average as u32;
            self.voltage_dev_max[cell] = self.voltage_dev_max[cell].max(m.voltage.deviation);
            self.current_dev_max[cell] = self.current_dev_max[cell].max(m.current.deviation);
        }
        self.cycles = self.cycles.saturating_add(1);
    }

    pub fn cycles(&self) -> u16 {
        self.cycles
    }

    pub fn is_empty(&self) -> bool {
        self.cycles == 0
    }

    pub fn should_commit(&self) -> bool {
        self.cycles >= CYCLES_PER_SECOND
    }

    /// Produce the per-second summary and zero all state.
    ///
    /// Returns None if no cycle has been added since the last commit.
    pub fn commit(&mut self) -> Option<CellSummary> {
        if self.is_empty() {
            return None;
        }

        let cycles = self.cycles as u32;
        let mut voltages = [0u16; NUM_CELLS];
        let mut currents = [0u16; NUM_CELLS];
        for cell in 0..NUM_CELLS {
            voltages[cell] = (self.voltage_sum[cell] / cycles) as u16;
            currents[cell] = (self.current_sum[cell] / cycles) as u16;
        }

        let summary = CellSummary {
            averages: CellFrame::from_cells(&voltages, &currents),
            deviations: CellFrame::from_cells(&self.voltage_dev_max, &self.current_dev_max),
        };

        *self = Self::new();
        Some(summary)
    }
}
