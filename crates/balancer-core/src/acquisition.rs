//! Acquisition state machine
//!
//! One burst fills a [`RawBuffer`]: the multiplexer steps through all eight
//! positions [`SAMPLES_PER_BURST`] times while both ADC inputs are sampled at
//! each position. The hardware reports progress through
//! [`AcquisitionEvent`]s, which [`Acquisition::dispatch`] turns into state
//! transitions.
//!
//! | From      | Input       | To        | Action                              |
//! |-----------|-------------|-----------|-------------------------------------|
//! | Idle      | `start`     | Acquiring | configure, calibrate offset, trigger|
//! | Acquiring | `Done`      | Idle      | buffer handed to the caller         |
//! | any       | `restart`   | Acquiring | release, configure, trigger         |
//! | any       | other event | unchanged | logged                              |
//!
//! The peripheral is torn down and configured again before every burst so
//! stale samples from an interrupted conversion never leak into the next
//! buffer.

use log::{debug, error, info, warn};

use crate::config::SAMPLES_PER_BURST;
use crate::deinterlace::{RawBuffer, RawSample, WINDOW_LEN};
use crate::error::BalancerError;
use crate::mux::{MUX_POSITIONS, MuxSequencer, SelectCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Acquiring,
}

/// Completion events reported by the ADC peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionEvent<'a> {
    /// A full burst is in the buffer
    Done(&'a RawBuffer),
    /// The peripheral wants the next buffer (double buffering)
    BufferRequest,
    /// Peripheral started
    Ready,
    /// Sampling stopped
    Finished,
    /// A channel crossed its limit
    Limit,
    /// Offset calibration completed
    CalibrateDone,
    /// Anything the driver could not map
    Unknown(u8),
}

/// Hardware side of the analog front end
pub trait AcquisitionDriver {
    /// Bring up the ADC and multiplexer for one burst
    fn configure(&mut self) -> Result<(), BalancerError>;

    /// Blocking offset calibration, only run once at startup
    fn calibrate_offset(&mut self) -> Result<(), BalancerError>;

    /// Start sampling the next burst
    fn trigger(&mut self) -> Result<(), BalancerError>;

    /// Tear the peripheral down, dropping anything in flight
    fn release(&mut self);
}

pub struct Acquisition<D: AcquisitionDriver> {
    driver: D,
    state: AcquisitionState,
    bursts: u32,
}

impl<D: AcquisitionDriver> Acquisition<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            state: AcquisitionState::Idle,
            bursts: 0,
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Completed bursts since power-up
    pub fn bursts(&self) -> u32 {
        self.bursts
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Initial bring-up including the one blocking calibration step
    pub fn start(&mut self) -> Result<(), BalancerError> {
        if self.state == AcquisitionState::Acquiring {
            warn!("acquisition already running");
            return Ok(());
        }

        self.driver.configure().inspect_err(log_fatal)?;
        self.driver.calibrate_offset().inspect_err(log_fatal)?;
        self.driver.trigger().inspect_err(log_fatal)?;
        self.state = AcquisitionState::Acquiring;
        info!("acquisition started");
        Ok(())
    }

    /// Reinitialise the peripheral and trigger the next burst.
    ///
    /// Called after every completed burst. From `Acquiring` this discards the
    /// burst in flight, which is how a desynchronised front end recovers.
    pub fn restart(&mut self) -> Result<(), BalancerError> {
        if self.state == AcquisitionState::Acquiring {
            debug!("restart drops the burst in flight");
        }

        self.driver.release();
        self.state = AcquisitionState::Idle;
        self.driver.configure().inspect_err(log_fatal)?;
        self.driver.trigger().inspect_err(log_fatal)?;
        self.state = AcquisitionState::Acquiring;
        Ok(())
    }

    /// Apply one hardware event. Returns the buffer when a burst completed.
    pub fn dispatch<'b>(&mut self, event: AcquisitionEvent<'b>) -> Option<&'b RawBuffer> {
        match event {
            AcquisitionEvent::Done(buffer) => match self.state {
                AcquisitionState::Acquiring => {
                    self.state = AcquisitionState::Idle;
                    self.bursts = self.bursts.wrapping_add(1);
                    Some(buffer)
                }
                AcquisitionState::Idle => {
                    warn!("burst completed while idle, ignored");
                    None
                }
            },
            AcquisitionEvent::Unknown(code) => {
                warn!("unmapped acquisition event {}", code);
                None
            }
            other => {
                debug!("acquisition event {:?}", other);
                None
            }
        }
    }
}

fn log_fatal(e: &BalancerError) {
    error!("acquisition: {}", e);
}

/// Fill a burst by stepping the multiplexer in software.
///
/// `read_pair` samples both ADC inputs (lower, upper) with the given select
/// code applied. Each window stores them at `2 * position` and
/// `2 * position + 1`.
pub fn sequence_burst<F>(
    mux: &mut MuxSequencer,
    buffer: &mut RawBuffer,
    mut read_pair: F,
) -> Result<(), BalancerError>
where
    F: FnMut(SelectCode) -> Result<(RawSample, RawSample), BalancerError>,
{
    mux.reset();
    for window in buffer.chunks_exact_mut(WINDOW_LEN).take(SAMPLES_PER_BURST) {
        for position in 0..MUX_POSITIONS {
            let (lower, upper) = read_pair(mux.current())?;
            window[2 * position] = lower;
            window[2 * position + 1] = upper;
            mux.advance();
        }
    }
    Ok(())
}
