//! Compile-time configuration of the balancer
//!
//! Everything that depends on the board (wiring, resistor dividers, ADC
//! resolution) or on the balancing strategy lives here. There is no runtime
//! configuration loading; [`BalancerConfig`] only exists so the controller
//! thresholds can be varied by tests and the simulator.

use serde::{Deserialize, Serialize};

use crate::aggregate::Scale;

/// Number of cells in the pack
pub const NUM_CELLS: usize = 8;

/// Samples per cell and signal in one acquisition burst
/// (the multiplexer cycles this many times per burst)
pub const SAMPLES_PER_BURST: usize = 8;

/// ADC resolution. More than 12 bits overflows the calibration arithmetic.
pub const ADC_RESOLUTION_BITS: u32 = 12;

/// Number of distinct ADC codes at the configured resolution
pub const ADC_FULL_SCALE: u32 = 1 << ADC_RESOLUTION_BITS;

/// Cell voltage: 0.825 V reference, 267/47 divider
pub const VOLTAGE_SCALE: Scale = Scale::new(825 * 267, 47);

/// Cell current: 0.825 V reference, 62/47 shunt amplifier gain
pub const CURRENT_SCALE: Scale = Scale::new(825 * 62, 47);

/// Acquisition cycles folded into one per-second summary
pub const CYCLES_PER_SECOND: u16 = 1000;

/// Slots per history ring
pub const HISTORY_CAPACITY: usize = 120;

/// Seconds between hourly history slots (fine slots per hourly slot)
pub const INTERVAL_1H: u16 = 30;

/// Seconds between half-day history slots
pub const INTERVAL_12H: u16 = 360;

/// Hourly slots folded into one half-day slot
pub const HOURLY_SLOTS_PER_HALF_DAY: usize = (INTERVAL_12H / INTERVAL_1H) as usize;

/// History frames packed into one bulk-export notification
pub const HISTORY_SLOTS_PER_CHUNK: usize = 6;

/// Full-scale balancing duty (the PWM counter top)
pub const PWM_TOP: u8 = 100;

/// Highest duty the controller will ever drive
pub const PWM_LIMIT: u8 = 75;

/// Termination voltage never exceeds this (mV)
pub const CHARGE_TERM_VOLT_MAX: u16 = 3600;

/// Termination voltage sits this far above the lowest cell (mV)
pub const CHARGE_TERM_RANGE: u16 = 20;

/// Dead band around the termination voltage (mV)
pub const CHARGE_TERM_HYSTERESIS: u16 = 10;

const _: () = assert!(INTERVAL_12H % INTERVAL_1H == 0);
const _: () = assert!(HOURLY_SLOTS_PER_HALF_DAY <= HISTORY_CAPACITY);
const _: () = assert!(INTERVAL_1H as usize <= HISTORY_CAPACITY);
const _: () = assert!(HISTORY_CAPACITY % HISTORY_SLOTS_PER_CHUNK == 0);
const _: () = assert!(PWM_LIMIT <= PWM_TOP);

/// Balancing controller thresholds
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancerConfig {
    /// Upper cap for every termination voltage (mV)
    pub charge_term_volt_max: u16,
    /// Offset above the lowest cell (mV)
    pub charge_term_range: u16,
    /// Dead band half-width (mV)
    pub hysteresis: u16,
    /// Duty ceiling, at most [`PWM_TOP`]
    pub pwm_limit: u8,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            charge_term_volt_max: CHARGE_TERM_VOLT_MAX,
            charge_term_range: CHARGE_TERM_RANGE,
            hysteresis: CHARGE_TERM_HYSTERESIS,
            pwm_limit: PWM_LIMIT,
        }
    }
}
