//! Error types for the balancer core

use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerError {
    /// A peripheral driver reported a failure. Acquisition cannot continue.
    #[error("{peripheral} failed to {operation}")]
    Peripheral {
        peripheral: &'static str,
        operation: &'static str,
    },
    #[error("duty override rejected: balancing is not active")]
    BalancingInactive,
    #[error("invalid duty override: {details}")]
    InvalidDutyOverride { details: &'static str },
    #[error("duty {duty} for cell {cell} is above the PWM top")]
    DutyOutOfRange { cell: usize, duty: u16 },
}
