//! Bleed resistor PWM on the LEDC peripheral
//!
//! Eight low-speed LEDC channels on GPIO8..GPIO15 share one 1 kHz timer.
//! Duties arrive on the 0..=100 scale and map straight onto LEDC percent.

use balancer_core::BalancerError;
use balancer_core::balancer::{DutyOutput, DutyVector};
use balancer_core::config::NUM_CELLS;
use esp_hal::gpio::DriveMode;
use esp_hal::ledc::channel::{self, ChannelIFace};
use esp_hal::ledc::timer::{self, TimerIFace};
use esp_hal::ledc::{LSGlobalClkSource, Ledc, LowSpeed};
use esp_hal::peripherals::{
    GPIO8, GPIO9, GPIO10, GPIO11, GPIO12, GPIO13, GPIO14, GPIO15, LEDC,
};
use esp_hal::time::Rate;
use log::warn;
use static_cell::StaticCell;

const BLEED_PWM_FREQUENCY_KHZ: u32 = 1;

static LEDC_DRIVER: StaticCell<Ledc<'static>> = StaticCell::new();
static BLEED_TIMER: StaticCell<timer::Timer<'static, LowSpeed>> = StaticCell::new();

/// Output pins, cell 0 first
pub struct BleedPins {
    pub cell0: GPIO8<'static>,
    pub cell1: GPIO9<'static>,
    pub cell2: GPIO10<'static>,
    pub cell3: GPIO11<'static>,
    pub cell4: GPIO12<'static>,
    pub cell5: GPIO13<'static>,
    pub cell6: GPIO14<'static>,
    pub cell7: GPIO15<'static>,
}

pub struct BleedPwm {
    channels: [channel::Channel<'static, LowSpeed>; NUM_CELLS],
}

impl BleedPwm {
    /// Set up the timer and all channels at 0 % duty. Can only be called once.
    pub fn new(ledc: LEDC<'static>, pins: BleedPins) -> Result<Self, BalancerError> {
        let ledc = LEDC_DRIVER.init(Ledc::new(ledc));
        ledc.set_global_slow_clock(LSGlobalClkSource::APBClk);

        let bleed_timer = BLEED_TIMER.init(ledc.timer::<LowSpeed>(timer::Number::Timer0));
        bleed_timer
            .configure(timer::config::Config {
                duty: timer::config::Duty::Duty10Bit,
                clock_source: timer::LSClockSource::APBClk,
                frequency: Rate::from_khz(BLEED_PWM_FREQUENCY_KHZ),
            })
            .map_err(|_| BalancerError::Peripheral {
                peripheral: "ledc timer",
                operation: "configure",
            })?;
        let bleed_timer: &'static timer::Timer<'static, LowSpeed> = bleed_timer;

        let mut channels = [
            ledc.channel(channel::Number::Channel0, pins.cell0),
            ledc.channel(channel::Number::Channel1, pins.cell1),
            ledc.channel(channel::Number::Channel2, pins.cell2),
            ledc.channel(channel::Number::Channel3, pins.cell3),
            ledc.channel(channel::Number::Channel4, pins.cell4),
            ledc.channel(channel::Number::Channel5, pins.cell5),
            ledc.channel(channel::Number::Channel6, pins.cell6),
            ledc.channel(channel::Number::Channel7, pins.cell7),
        ];

        for ch in channels.iter_mut() {
            ch.configure(channel::config::Config {
                timer: bleed_timer,
                duty_pct: 0,
                drive_mode: DriveMode::PushPull,
            })
            .map_err(|_| BalancerError::Peripheral {
                peripheral: "ledc channel",
                operation: "configure",
            })?;
        }

        Ok(Self { channels })
    }
}

impl DutyOutput for BleedPwm {
    fn apply(&mut self, duties: &DutyVector) {
        for (cell, (ch, &duty)) in self.channels.iter_mut().zip(duties.iter()).enumerate() {
            if let Err(e) = ch.set_duty(duty) {
                warn!("bleed channel {} rejected duty {}: {:?}", cell, duty, e);
            }
        }
    }
}
