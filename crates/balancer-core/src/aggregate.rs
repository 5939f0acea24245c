//! Reduction of per-cell sample groups to calibrated readings
//!
//! Each group of raw samples becomes an average and a deviation in
//! millivolts or milliamps. "Deviation" here is the peak-to-peak range of
//! the group (max - min), not a statistical deviation.

use crate::config::{ADC_FULL_SCALE, CURRENT_SCALE, NUM_CELLS, SAMPLES_PER_BURST, VOLTAGE_SCALE};
use crate::deinterlace::{CellSamples, RawSample, SampleGroup};

/// Largest raw code fed into a [`Scale`]. Twice the full scale leaves room
/// for a peak-to-peak range that straddles zero.
pub const MAX_SCALED_RAW: u32 = 2 * ADC_FULL_SCALE;

/// Linear conversion from raw ADC codes to milli-units:
/// `raw * numerator / (divisor * ADC_FULL_SCALE)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale {
    pub numerator: u32,
    pub divisor: u32,
}

impl Scale {
    pub const fn new(numerator: u32, divisor: u32) -> Self {
        Self { numerator, divisor }
    }

    /// Convert a raw code. Codes above [`MAX_SCALED_RAW`] are capped.
    pub const fn to_millis(self, raw: u32) -> u16 {
        let raw = if raw > MAX_SCALED_RAW { MAX_SCALED_RAW } else { raw };
        (raw * self.numerator / (self.divisor * ADC_FULL_SCALE)) as u16
    }

    /// Raw code for a value in milli-units (truncating)
    pub const fn from_millis(self, millis: u16) -> u32 {
        (millis as u64 * self.divisor as u64 * ADC_FULL_SCALE as u64 / self.numerator as u64) as u32
    }

    /// Whether the intermediate product stays within 32 bits
    const fn fits_u32(self) -> bool {
        (MAX_SCALED_RAW as u64) * (self.numerator as u64) <= u32::MAX as u64
    }
}

const _: () = assert!(VOLTAGE_SCALE.fits_u32());
const _: () = assert!(CURRENT_SCALE.fits_u32());

/// Sum and extrema of one sample group, in raw codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleStats {
    pub sum: i32,
    pub min: RawSample,
    pub max: RawSample,
}

impl SampleStats {
    pub fn of(group: &SampleGroup) -> Self {
        let mut stats = Self {
            sum: 0,
            min: RawSample::MAX,
            max: RawSample::MIN,
        };

        for &value in group {
            stats.sum += value as i32;
            stats.min = stats.min.min(value);
            stats.max = stats.max.max(value);
        }

        stats
    }

    /// Truncated mean. Negative sums are ADC noise around zero and count as zero.
    pub fn average_raw(&self) -> u32 {
        self.sum.max(0) as u32 / SAMPLES_PER_BURST as u32
    }

    /// Peak-to-peak range
    pub fn deviation_raw(&self) -> u32 {
        (self.max as i32 - self.min as i32) as u32
    }
}

/// Calibrated average and peak-to-peak deviation of one signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellReading {
    pub average: u16,
    pub deviation: u16,
}

impl CellReading {
    pub fn from_group(group: &SampleGroup, scale: Scale) -> Self {
        let stats = SampleStats::of(group);
        Self {
            average: scale.to_millis(stats.average_raw()),
            deviation: scale.to_millis(stats.deviation_raw()),
        }
    }
}

/// Voltage (mV) and current (mA) readings of one cell for one burst
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellMeasurement {
    pub voltage: CellReading,
    pub current: CellReading,
}

/// Aggregate every cell of a deinterlaced burst
pub fn aggregate(cells: &[CellSamples; NUM_CELLS]) -> [CellMeasurement; NUM_CELLS] {
    let mut measurements = [CellMeasurement::default(); NUM_CELLS];

    for (measurement, samples) in measurements.iter_mut().zip(cells.iter()) {
        measurement.voltage = CellReading::from_group(&samples.voltage, VOLTAGE_SCALE);
        measurement.current = CellReading::from_group(&samples.current, CURRENT_SCALE);
    }

    measurements
}

/// Per-cell voltage averages, as consumed by the balancing controller
pub fn cell_voltages(measurements: &[CellMeasurement; NUM_CELLS]) -> [u16; NUM_CELLS] {
    let mut voltages = [0; NUM_CELLS];
    for (voltage, measurement) in voltages.iter_mut().zip(measurements.iter()) {
        *voltage = measurement.voltage.average;
    }
    voltages
}
