//! Desktop simulator for the 8-cell balancer.
//!
//! Runs the real `balancer-core` pipeline against a synthetic pack: an
//! analog front end that answers the multiplexer the way the wiring harness
//! would, and bleed resistors that pull the pack down in proportion to the
//! duty the controller drives. Telemetry is printed to the console.
//!
//! # Timeline
//!
//! | Second | Event                                      |
//! |--------|--------------------------------------------|
//! | 5      | balancing enabled (button press)           |
//! | 200    | host writes a duty override                |
//! | 240    | balancing disabled                         |
//! | end    | host requests the 1h and 12h history rings |
//!
//! Run with `RUST_LOG=info` (or `debug` for ring writes). An optional first
//! argument sets the simulated duration in seconds.

use std::cell::Cell;
use std::rc::Rc;

use log::{info, warn};

use balancer_core::BalancerError;
use balancer_core::acquisition::{Acquisition, AcquisitionDriver, AcquisitionEvent, sequence_burst};
use balancer_core::balancer::{DutyOutput, DutyVector};
use balancer_core::config::{BalancerConfig, CURRENT_SCALE, NUM_CELLS, VOLTAGE_SCALE};
use balancer_core::deinterlace::{BURST_LEN, CURRENT_OFFSETS, RawBuffer, VOLTAGE_OFFSETS};
use balancer_core::frame::{CellFrame, FRAME_BYTES};
use balancer_core::history::{ExportRing, shared_history};
use balancer_core::mux::{MuxSequencer, SELECT_SEQUENCE, SelectCode};
use balancer_core::pipeline::{ControlChannel, ControlCommand, Pipeline};
use balancer_core::telemetry::{
    Characteristic, TelemetryChannel, TelemetryForwarder, Transport, parse_duty_text,
};

// ---------------------------------------------------------------------------
// Scenario constants
// ---------------------------------------------------------------------------

/// Default simulated duration
const DEFAULT_SECONDS: u32 = 400;

/// Acquisition cycles per simulated second
const CYCLES_PER_SECOND: u32 = balancer_core::config::CYCLES_PER_SECOND as u32;

/// Cell voltages at power-up (mV)
const INITIAL_VOLTAGES: [f64; NUM_CELLS] = [3700.0, 3650.0, 3690.0, 3680.0, 3660.0, 3670.0, 3640.0, 3695.0];

/// Charger current while the pack is below the taper voltage (mA)
const CHARGE_CURRENT_MA: f64 = 400.0;

/// Charging tapers off linearly between these voltages (mV)
const TAPER_START_MV: f64 = 3550.0;
const TAPER_END_MV: f64 = 3750.0;

/// Bleed current at 100 % duty (mA)
const BLEED_CURRENT_MA: f64 = 250.0;

/// Cell voltage change per mA and cycle (a very small pack)
const MV_PER_MA_CYCLE: f64 = 2.0e-5;

/// Peak measurement noise (mV)
const NOISE_MV: f64 = 1.5;

const ENABLE_AT: u32 = 5;
const OVERRIDE_AT: u32 = 200;
const DISABLE_AT: u32 = 240;
const OVERRIDE_TEXT: &[u8] = b" 10, 00, 10, 10, 00, 10, 00, 10";

// ---------------------------------------------------------------------------
// Synthetic pack
// ---------------------------------------------------------------------------

struct Pack {
    voltages: [f64; NUM_CELLS],
    currents: [f64; NUM_CELLS],
    cycle: u64,
}

impl Pack {
    fn new() -> Self {
        Self {
            voltages: INITIAL_VOLTAGES,
            currents: [0.0; NUM_CELLS],
            cycle: 0,
        }
    }

    /// Advance one acquisition cycle with the given bleed duties
    fn step(&mut self, duties: &DutyVector) {
        self.cycle += 1;
        for cell in 0..NUM_CELLS {
            let v = self.voltages[cell];
            let taper = ((TAPER_END_MV - v) / (TAPER_END_MV - TAPER_START_MV)).clamp(0.0, 1.0);
            let charge = CHARGE_CURRENT_MA * taper;
            let bleed = BLEED_CURRENT_MA * duties[cell] as f64 / 100.0;

            self.currents[cell] = charge + bleed;
            self.voltages[cell] += (charge - bleed) * MV_PER_MA_CYCLE;
        }
    }

    fn noise(&self, slot: usize) -> f64 {
        let t = self.cycle as f64;
        NOISE_MV * ((t * 0.37 + slot as f64 * 1.3).sin() * 0.7 + (t * 0.071 + slot as f64).cos() * 0.3)
    }

    /// Raw code seen on one window slot
    fn sample(&self, slot: usize) -> i16 {
        if let Some(cell) = VOLTAGE_OFFSETS.iter().position(|&o| o == slot) {
            let mv = (self.voltages[cell] + self.noise(slot)).max(0.0) as u16;
            return VOLTAGE_SCALE.from_millis(mv) as i16;
        }
        if let Some(cell) = CURRENT_OFFSETS.iter().position(|&o| o == slot) {
            let ma = (self.currents[cell] + self.noise(slot)).max(0.0) as u16;
            return CURRENT_SCALE.from_millis(ma) as i16;
        }
        0
    }
}

// ---------------------------------------------------------------------------
// Simulated hardware
// ---------------------------------------------------------------------------

/// Answers the multiplexer like the real harness: select code → position →
/// window slot of the lower and upper input
struct SimulatedFrontEnd {
    pack: Pack,
    duties: Rc<Cell<DutyVector>>,
    mux: MuxSequencer,
    buffer: RawBuffer,
    configured: bool,
}

impl SimulatedFrontEnd {
    fn new(duties: Rc<Cell<DutyVector>>) -> Self {
        Self {
            pack: Pack::new(),
            duties,
            mux: MuxSequencer::new(),
            buffer: [0; BURST_LEN],
            configured: false,
        }
    }

    fn buffer(&self) -> &RawBuffer {
        &self.buffer
    }

    fn position_of(code: SelectCode) -> usize {
        SELECT_SEQUENCE.iter().position(|&c| c == code).unwrap_or(0)
    }
}

impl AcquisitionDriver for SimulatedFrontEnd {
    fn configure(&mut self) -> Result<(), BalancerError> {
        self.mux.reset();
        self.configured = true;
        Ok(())
    }

    fn calibrate_offset(&mut self) -> Result<(), BalancerError> {
        info!("simulated front end: zero offset");
        Ok(())
    }

    fn trigger(&mut self) -> Result<(), BalancerError> {
        if !self.configured {
            return Err(BalancerError::Peripheral {
                peripheral: "simulated front end",
                operation: "sample before configuration",
            });
        }

        self.pack.step(&self.duties.get());
        let pack = &self.pack;
        sequence_burst(&mut self.mux, &mut self.buffer, |code| {
            let position = Self::position_of(code);
            Ok((pack.sample(2 * position), pack.sample(2 * position + 1)))
        })
    }

    fn release(&mut self) {
        self.configured = false;
    }
}

/// Bleed PWM stand-in: the pack reads back whatever was applied last
struct SimulatedBleed {
    duties: Rc<Cell<DutyVector>>,
}

impl DutyOutput for SimulatedBleed {
    fn apply(&mut self, duties: &DutyVector) {
        self.duties.set(*duties);
    }
}

/// Prints notifications the way a host tool would display them
struct ConsoleTransport;

impl Transport for ConsoleTransport {
    type Error = std::convert::Infallible;

    fn notify(&mut self, characteristic: Characteristic, payload: &[u8]) -> Result<(), Self::Error> {
        for frame in payload.chunks_exact(FRAME_BYTES) {
            let mut bytes = [0u8; FRAME_BYTES];
            bytes.copy_from_slice(frame);
            let frame = CellFrame::from_bytes(&bytes);
            if frame.is_recorded() {
                info!("[{:04X}] {:?}", characteristic.uuid(), frame.0);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();

    let seconds: u32 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_SECONDS);

    info!("Starting balancer simulator for {} s", seconds);

    let history = shared_history();
    let telemetry = TelemetryChannel::new();
    let commands = ControlChannel::new();

    let duties = Rc::new(Cell::new([0; NUM_CELLS]));
    let mut pipeline = Pipeline::new(
        BalancerConfig::default(),
        SimulatedBleed {
            duties: duties.clone(),
        },
        &history,
        telemetry.publisher().expect("publisher available"),
        &commands,
    );
    let mut subscriber = telemetry.subscriber().expect("subscriber available");
    let mut forwarder = TelemetryForwarder::new(ConsoleTransport, &history);

    let mut acquisition = Acquisition::new(SimulatedFrontEnd::new(duties.clone()));
    acquisition.start().expect("simulated front end starts");

    for cycle in 0..seconds * CYCLES_PER_SECOND {
        if cycle % CYCLES_PER_SECOND == 0 {
            let second = cycle / CYCLES_PER_SECOND;
            let command = match second {
                ENABLE_AT | DISABLE_AT => Some(ControlCommand::ToggleBalancing),
                OVERRIDE_AT => parse_duty_text(OVERRIDE_TEXT)
                    .ok()
                    .map(ControlCommand::OverrideDuties),
                _ => None,
            };
            if let Some(command) = command {
                info!("t={}s host/button: {:?}", second, command);
                if commands.try_send(command).is_err() {
                    warn!("control queue full, {:?} dropped", command);
                }
            }
        }

        let buffer = *acquisition.driver().buffer();
        pipeline
            .on_acquisition_event(&mut acquisition, AcquisitionEvent::Done(&buffer))
            .expect("simulated acquisition never fails");

        while let Some(event) = subscriber.try_next_message_pure() {
            forwarder.forward(&event);
        }
    }

    info!("final duties: {:?}", duties.get());

    for ring in [ExportRing::Hourly, ExportRing::HalfDay] {
        commands
            .try_send(ControlCommand::ExportHistory(ring))
            .expect("control queue has room");
    }
    pipeline.drain_commands();
    while let Some(event) = subscriber.try_next_message_pure() {
        forwarder.forward(&event);
    }

    info!(
        "Simulation finished after {} s ({} bursts)",
        pipeline.seconds(),
        acquisition.bursts()
    );
}
