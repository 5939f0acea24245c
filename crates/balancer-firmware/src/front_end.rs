//! Analog front end: two 8:1 multiplexers in front of two ADC1 inputs
//!
//! The ESP32-S3 has no hardware to step the multiplexer in lockstep with
//! the ADC, so the burst is sequenced in software: set the select lines,
//! let the multiplexer settle, sample both inputs, advance.
//!
//! Pins:
//! - GPIO4/5/6: select lines S0/S1/S2
//! - GPIO7: multiplexer enable (active low)
//! - GPIO1: lower multiplexer output (ADC1 channel 0)
//! - GPIO2: upper multiplexer output (ADC1 channel 1)

use balancer_core::BalancerError;
use balancer_core::acquisition::{AcquisitionDriver, sequence_burst};
use balancer_core::deinterlace::{BURST_LEN, RawBuffer, RawSample};
use balancer_core::mux::{MuxSequencer, SelectCode};
use esp_hal::Blocking;
use esp_hal::analog::adc::{Adc, AdcPin};
use esp_hal::delay::Delay;
use esp_hal::gpio::{Level, Output};
use esp_hal::peripherals::{ADC1, GPIO1, GPIO2};
use log::{debug, info};

/// Multiplexer settling time after a select change
const MUX_SETTLE_US: u32 = 2;

/// Samples averaged for the zero offset
const OFFSET_SAMPLES: i32 = 32;

pub type CellAdc<'d> = Adc<'d, ADC1<'d>, Blocking>;
pub type LowerInput<'d> = AdcPin<GPIO1<'d>, ADC1<'d>>;
pub type UpperInput<'d> = AdcPin<GPIO2<'d>, ADC1<'d>>;

/// Busy-wait for a oneshot conversion. The driver only ever reports
/// "not finished yet" as an error.
macro_rules! read_blocking {
    ($adc:expr, $pin:expr) => {
        loop {
            if let Ok(value) = $adc.read_oneshot($pin) {
                break value;
            }
        }
    };
}

pub struct AnalogFrontEnd<'d> {
    adc: CellAdc<'d>,
    lower: LowerInput<'d>,
    upper: UpperInput<'d>,
    select: [Output<'d>; 3],
    enable: Output<'d>,
    delay: Delay,
    mux: MuxSequencer,
    /// Zero offset of (lower, upper), subtracted from every sample
    offset: (i16, i16),
    buffer: RawBuffer,
    configured: bool,
}

impl<'d> AnalogFrontEnd<'d> {
    pub fn new(
        adc: CellAdc<'d>,
        lower: LowerInput<'d>,
        upper: UpperInput<'d>,
        select: [Output<'d>; 3],
        enable: Output<'d>,
    ) -> Self {
        Self {
            adc,
            lower,
            upper,
            select,
            enable,
            delay: Delay::new(),
            mux: MuxSequencer::new(),
            offset: (0, 0),
            buffer: [0; BURST_LEN],
            configured: false,
        }
    }

    /// The last completed burst
    pub fn buffer(&self) -> &RawBuffer {
        &self.buffer
    }

    fn apply_select(select: &mut [Output<'d>; 3], code: SelectCode) {
        for (line, level) in select.iter_mut().zip(code.lines()) {
            line.set_level(Level::from(level));
        }
    }

    fn not_configured() -> BalancerError {
        BalancerError::Peripheral {
            peripheral: "analog front end",
            operation: "sample before configuration",
        }
    }
}

impl AcquisitionDriver for AnalogFrontEnd<'_> {
    fn configure(&mut self) -> Result<(), BalancerError> {
        self.mux.reset();
        Self::apply_select(&mut self.select, self.mux.current());
        self.enable.set_low();
        self.delay.delay_micros(MUX_SETTLE_US);
        self.configured = true;
        Ok(())
    }

    /// Measures the zero offset with the multiplexers disabled. Their
    /// outputs are pulled to ground while disabled.
    fn calibrate_offset(&mut self) -> Result<(), BalancerError> {
        if !self.configured {
            return Err(Self::not_configured());
        }

        self.enable.set_high();
        self.delay.delay_micros(MUX_SETTLE_US);

        let mut lower_sum = 0i32;
        let mut upper_sum = 0i32;
        for _ in 0..OFFSET_SAMPLES {
            lower_sum += read_blocking!(self.adc, &mut self.lower) as i32;
            upper_sum += read_blocking!(self.adc, &mut self.upper) as i32;
        }
        self.offset = (
            (lower_sum / OFFSET_SAMPLES) as i16,
            (upper_sum / OFFSET_SAMPLES) as i16,
        );

        self.enable.set_low();
        info!("adc offset calibrated: {:?}", self.offset);
        Ok(())
    }

    /// Samples a complete burst before returning
    fn trigger(&mut self) -> Result<(), BalancerError> {
        if !self.configured {
            return Err(Self::not_configured());
        }

        let adc = &mut self.adc;
        let lower = &mut self.lower;
        let upper = &mut self.upper;
        let select = &mut self.select;
        let delay = &self.delay;
        let (lower_offset, upper_offset) = self.offset;

        sequence_burst(&mut self.mux, &mut self.buffer, |code| {
            Self::apply_select(select, code);
            delay.delay_micros(MUX_SETTLE_US);
            let low = read_blocking!(adc, &mut *lower) as RawSample - lower_offset;
            let high = read_blocking!(adc, &mut *upper) as RawSample - upper_offset;
            Ok((low, high))
        })
    }

    fn release(&mut self) {
        self.enable.set_high();
        self.mux.reset();
        self.configured = false;
        debug!("front end released");
    }
}
