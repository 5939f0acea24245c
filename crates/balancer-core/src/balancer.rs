//! Closed-loop cell balancing
//!
//! A slow integral controller with a dead band. While balancing is active,
//! every cell gets a termination voltage a little above the lowest cell
//! (never above [`BalancerConfig::charge_term_volt_max`]); cells above their
//! termination voltage bleed harder one duty step per cycle, cells below it
//! back off one step per cycle.
//!
//! While balancing is inactive the termination voltages follow the pack so
//! enabling starts from the present state.

use log::info;

use crate::config::{BalancerConfig, NUM_CELLS, PWM_TOP};
use crate::error::BalancerError;

/// Per-cell bleed duty, 0..=100
pub type DutyVector = [u8; NUM_CELLS];

/// Sink for duty vectors (the bleed PWM peripheral)
pub trait DutyOutput {
    /// Drive all eight balancing channels at once
    fn apply(&mut self, duties: &DutyVector);
}

impl<T: DutyOutput + ?Sized> DutyOutput for &mut T {
    fn apply(&mut self, duties: &DutyVector) {
        (**self).apply(duties)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancingState {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct BalancingController {
    config: BalancerConfig,
    duties: DutyVector,
    termination: [u16; NUM_CELLS],
    active: bool,
}

impl Default for BalancingController {
    fn default() -> Self {
        Self::new(BalancerConfig::default())
    }
}

impl BalancingController {
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config,
            duties: [0; NUM_CELLS],
            termination: [config.charge_term_volt_max; NUM_CELLS],
            active: false,
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn duties(&self) -> &DutyVector {
        &self.duties
    }

    pub fn termination_voltages(&self) -> &[u16; NUM_CELLS] {
        &self.termination
    }

    /// Flip the global enable flag.
    ///
    /// Disabling zeroes every duty; the caller must write the new vector to
    /// the output before the next cycle runs.
    pub fn toggle(&mut self) -> BalancingState {
        if self.active {
            self.duties = [0; NUM_CELLS];
            self.active = false;
            info!("balancer disabled");
            BalancingState::Disabled
        } else {
            self.active = true;
            info!("balancer enabled");
            BalancingState::Enabled
        }
    }

    /// Run one control step on this cycle's cell voltages (mV).
    ///
    /// Returns true when any duty changed.
    pub fn update(&mut self, voltages: &[u16; NUM_CELLS]) -> bool {
        if !self.active {
            for (term, &v) in self.termination.iter_mut().zip(voltages.iter()) {
                *term = v.min(self.config.charge_term_volt_max);
            }
            return false;
        }

        self.raise_termination(voltages);

        let hyst = self.config.hysteresis;
        let mut changed = false;
        for cell in 0..NUM_CELLS {
            let v = voltages[cell];
            let term = self.termination[cell];
            let duty = &mut self.duties[cell];

            if v > term.saturating_add(hyst) && *duty < self.config.pwm_limit {
                *duty += 1;
                changed = true;
            } else if v < term.saturating_sub(hyst) && *duty > 0 {
                *duty -= 1;
                changed = true;
            }
        }

        changed
    }

    /// Ratchet every termination voltage up to the shared bound
    fn raise_termination(&mut self, voltages: &[u16; NUM_CELLS]) {
        let lowest = voltages.iter().copied().min().unwrap_or(0);
        let bound = lowest
            .saturating_add(self.config.charge_term_range)
            .min(self.config.charge_term_volt_max);

        for term in self.termination.iter_mut() {
            *term = (*term).max(bound);
        }
    }

    /// Replace the whole duty vector, e.g. from a transport write.
    ///
    /// Only accepted while balancing is active. Values above [`PWM_TOP`] reject
    /// the whole vector; values above the configured limit are clamped.
    pub fn override_duties(&mut self, duties: &DutyVector) -> Result<(), BalancerError> {
        if !self.active {
            return Err(BalancerError::BalancingInactive);
        }

        if let Some((cell, &duty)) = duties.iter().enumerate().find(|(_, d)| **d > PWM_TOP) {
            return Err(BalancerError::DutyOutOfRange {
                cell,
                duty: duty as u16,
            });
        }

        for (current, &requested) in self.duties.iter_mut().zip(duties.iter()) {
            *current = requested.min(self.config.pwm_limit);
        }
        Ok(())
    }
}
