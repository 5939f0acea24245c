//! Per-burst processing pipeline
//!
//! The pipeline is the single writer of all measurement and balancing state.
//! It runs synchronously for every completed burst:
//!
//! 1. drain queued control commands (button, transport)
//! 2. deinterlace and aggregate the burst
//! 3. run the balancing controller on this cycle's voltages
//! 4. accumulate, and once a second commit: log, record history, publish
//!
//! Other contexts never touch this state; they send a [`ControlCommand`]
//! and read telemetry from the pub-sub channel.
//!
//! The seconds counter is a `u16` and wraps after about 18 hours. After a
//! wrap the decimation schedule is no longer aligned with the time since
//! power-up. This is a known limitation and intentionally left as is.

use core::fmt::Write;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use heapless::String;
use log::{debug, info, warn};

use crate::accumulator::{CellAccumulator, CellSummary};
use crate::acquisition::{Acquisition, AcquisitionDriver, AcquisitionEvent};
use crate::aggregate::{aggregate, cell_voltages};
use crate::balancer::{BalancingController, BalancingState, DutyOutput, DutyVector};
use crate::config::{BalancerConfig, NUM_CELLS};
use crate::deinterlace::{RawBuffer, deinterlace};
use crate::error::BalancerError;
use crate::frame::CellFrame;
use crate::history::{ExportRing, SharedHistory};
use crate::telemetry::{TelemetryEvent, TelemetryPublisher};

/// Queue depth for control commands
pub const CONTROL_CHANNEL_CAPACITY: usize = 4;

/// Requests from outside the pipeline context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Button press: flip balancing on or off
    ToggleBalancing,
    /// Host wrote a duty vector
    OverrideDuties(DutyVector),
    /// Host asked for a full history ring
    ExportHistory(ExportRing),
}

pub type ControlChannel = Channel<CriticalSectionRawMutex, ControlCommand, CONTROL_CHANNEL_CAPACITY>;

pub struct Pipeline<'a, O: DutyOutput> {
    accumulator: CellAccumulator,
    controller: BalancingController,
    output: O,
    seconds: u16,
    history: &'a SharedHistory,
    telemetry: TelemetryPublisher<'a>,
    commands: &'a ControlChannel,
}

impl<'a, O: DutyOutput> Pipeline<'a, O> {
    pub fn new(
        config: BalancerConfig,
        mut output: O,
        history: &'a SharedHistory,
        telemetry: TelemetryPublisher<'a>,
        commands: &'a ControlChannel,
    ) -> Self {
        let controller = BalancingController::new(config);
        // outputs start at a known state
        output.apply(controller.duties());

        Self {
            accumulator: CellAccumulator::new(),
            controller,
            output,
            seconds: 0,
            history,
            telemetry,
            commands,
        }
    }

    /// Seconds since power-up, wrapping
    pub fn seconds(&self) -> u16 {
        self.seconds
    }

    pub fn controller(&self) -> &BalancingController {
        &self.controller
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    /// Feed one hardware event through the acquisition state machine. A
    /// completed burst is processed and the next one is triggered.
    pub fn on_acquisition_event<D: AcquisitionDriver>(
        &mut self,
        acquisition: &mut Acquisition<D>,
        event: AcquisitionEvent<'_>,
    ) -> Result<(), BalancerError> {
        if let Some(buffer) = acquisition.dispatch(event) {
            self.process_burst(buffer);
            acquisition.restart()?;
        }
        Ok(())
    }

    /// Run one acquisition cycle. Returns the summary if this burst completed
    /// a second.
    pub fn process_burst(&mut self, buffer: &RawBuffer) -> Option<CellSummary> {
        self.drain_commands();

        let measurements = aggregate(&deinterlace(buffer));

        if self.controller.update(&cell_voltages(&measurements)) {
            self.output.apply(self.controller.duties());
        }

        self.accumulator.add(&measurements);
        if !self.accumulator.should_commit() {
            return None;
        }

        let summary = self.accumulator.commit()?;
        self.on_second(&summary);
        Some(summary)
    }

    fn on_second(&mut self, summary: &CellSummary) {
        self.seconds = self.seconds.wrapping_add(1);

        let averages = &summary.averages;
        info!("V:{}", format_cells(averages, CellFrame::voltage));
        info!("I:{}", format_cells(averages, CellFrame::current));

        let seconds = self.seconds;
        let update = self
            .history
            .lock(|store| store.borrow_mut().record(summary.averages, seconds));

        self.telemetry
            .publish_immediate(TelemetryEvent::CellValues(summary.averages));
        self.telemetry
            .publish_immediate(TelemetryEvent::CellDeviations(summary.deviations));

        if let Some(slot) = update.hourly {
            self.telemetry.publish_immediate(TelemetryEvent::Hourly(slot));
        }
        if let Some(slot) = update.half_day {
            self.telemetry.publish_immediate(TelemetryEvent::HalfDay(slot));
        }
    }

    /// Apply every queued command. Rejected commands are logged and dropped.
    pub fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_receive() {
            if let Err(e) = self.handle_command(command) {
                warn!("{:?} rejected: {}", command, e);
            }
        }
    }

    pub fn handle_command(&mut self, command: ControlCommand) -> Result<(), BalancerError> {
        match command {
            ControlCommand::ToggleBalancing => {
                if self.controller.toggle() == BalancingState::Disabled {
                    // no bleed may stay on once balancing is off
                    self.output.apply(self.controller.duties());
                }
            }
            ControlCommand::OverrideDuties(duties) => {
                self.controller.override_duties(&duties)?;
                self.output.apply(self.controller.duties());
                debug!("duties overridden: {:?}", self.controller.duties());
            }
            ControlCommand::ExportHistory(ring) => {
                self.telemetry
                    .publish_immediate(TelemetryEvent::ExportRequested(ring));
            }
        }
        Ok(())
    }
}

/// One log line worth of per-cell values
fn format_cells(frame: &CellFrame, field: fn(&CellFrame, usize) -> u16) -> String<64> {
    let mut line = String::new();
    for cell in 0..NUM_CELLS {
        // 8 × " 65535" always fits
        let _ = write!(line, " {:5}", field(frame, cell));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CURRENT_SCALE, CYCLES_PER_SECOND, INTERVAL_1H, PWM_LIMIT, VOLTAGE_SCALE};
    use crate::deinterlace::{CellSamples, interlace};
    use crate::history::{Resolution, shared_history};
    use crate::telemetry::TelemetryChannel;

    extern crate std;
    use std::vec::Vec;

    #[derive(Default)]
    struct RecordingOutput {
        writes: Vec<DutyVector>,
    }

    impl DutyOutput for RecordingOutput {
        fn apply(&mut self, duties: &DutyVector) {
            self.writes.push(*duties);
        }
    }

    impl RecordingOutput {
        fn last(&self) -> DutyVector {
            *self.writes.last().unwrap()
        }
    }

    const SCENARIO: [u16; NUM_CELLS] = [3700, 3650, 3690, 3680, 3660, 3670, 3640, 3695];

    fn burst(voltages: &[u16; NUM_CELLS], currents: &[u16; NUM_CELLS]) -> RawBuffer {
        let mut cells = [CellSamples::default(); NUM_CELLS];
        for cell in 0..NUM_CELLS {
            cells[cell].voltage = [VOLTAGE_SCALE.from_millis(voltages[cell]) as i16; 8];
            cells[cell].current = [CURRENT_SCALE.from_millis(currents[cell]) as i16; 8];
        }
        interlace(&cells)
    }

    fn measured_voltage(mv: u16) -> u16 {
        VOLTAGE_SCALE.to_millis(VOLTAGE_SCALE.from_millis(mv))
    }

    #[test]
    fn test_one_second_publishes_summary() {
        let history = shared_history();
        let telemetry = TelemetryChannel::new();
        let commands = ControlChannel::new();
        let mut sub = telemetry.subscriber().unwrap();
        let mut pipeline = Pipeline::new(
            BalancerConfig::default(),
            RecordingOutput::default(),
            &history,
            telemetry.publisher().unwrap(),
            &commands,
        );

        let buffer = burst(&SCENARIO, &[120; NUM_CELLS]);
        for _ in 1..CYCLES_PER_SECOND {
            assert!(pipeline.process_burst(&buffer).is_none());
        }
        let summary = pipeline.process_burst(&buffer).unwrap();

        assert_eq!(pipeline.seconds(), 1);
        for cell in 0..NUM_CELLS {
            assert_eq!(summary.averages.voltage(cell), measured_voltage(SCENARIO[cell]));
            assert_eq!(summary.deviations.voltage(cell), 0);
        }

        assert_eq!(
            sub.try_next_message_pure(),
            Some(TelemetryEvent::CellValues(summary.averages))
        );
        assert_eq!(
            sub.try_next_message_pure(),
            Some(TelemetryEvent::CellDeviations(summary.deviations))
        );
        assert_eq!(sub.try_next_message_pure(), None);

        let latest = history.lock(|store| *store.borrow().latest(Resolution::Fine));
        assert_eq!(latest, summary.averages);

        // balancing is off: only the initial write happened
        assert_eq!(pipeline.output().writes, [[0; NUM_CELLS]]);
    }

    #[test]
    fn test_hourly_slot_after_thirty_seconds() {
        let history = shared_history();
        let telemetry = TelemetryChannel::new();
        let commands = ControlChannel::new();
        let mut sub = telemetry.subscriber().unwrap();
        let mut pipeline = Pipeline::new(
            BalancerConfig::default(),
            RecordingOutput::default(),
            &history,
            telemetry.publisher().unwrap(),
            &commands,
        );

        let buffer = burst(&[3500; NUM_CELLS], &[50; NUM_CELLS]);
        let mut hourly = Vec::new();
        for _ in 0..(INTERVAL_1H as u32 * CYCLES_PER_SECOND as u32) {
            pipeline.process_burst(&buffer);
            while let Some(event) = sub.try_next_message_pure() {
                if let TelemetryEvent::Hourly(slot) = event {
                    hourly.push(slot);
                }
            }
        }

        assert_eq!(pipeline.seconds(), INTERVAL_1H);
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].voltage(0), measured_voltage(3500));
    }

    #[test]
    fn test_toggle_drives_duties_each_cycle() {
        let history = shared_history();
        let telemetry = TelemetryChannel::new();
        let commands = ControlChannel::new();
        let mut pipeline = Pipeline::new(
            BalancerConfig::default(),
            RecordingOutput::default(),
            &history,
            telemetry.publisher().unwrap(),
            &commands,
        );

        commands.try_send(ControlCommand::ToggleBalancing).unwrap();
        let buffer = burst(&SCENARIO, &[0; NUM_CELLS]);

        for cycle in 1..=3u8 {
            pipeline.process_burst(&buffer);
            assert_eq!(pipeline.output().last(), [cycle; NUM_CELLS]);
        }

        for _ in 0..100 {
            pipeline.process_burst(&buffer);
        }
        assert_eq!(pipeline.output().last(), [PWM_LIMIT; NUM_CELLS]);

        // disabling writes zeros before the next cycle runs
        commands.try_send(ControlCommand::ToggleBalancing).unwrap();
        pipeline.drain_commands();
        assert_eq!(pipeline.output().last(), [0; NUM_CELLS]);
        assert!(!pipeline.controller().is_active());
    }

    #[test]
    fn test_override_applies_only_while_active() {
        let history = shared_history();
        let telemetry = TelemetryChannel::new();
        let commands = ControlChannel::new();
        let mut pipeline = Pipeline::new(
            BalancerConfig::default(),
            RecordingOutput::default(),
            &history,
            telemetry.publisher().unwrap(),
            &commands,
        );

        let request = ControlCommand::OverrideDuties([10, 20, 30, 40, 50, 60, 70, 90]);
        assert_eq!(
            pipeline.handle_command(request),
            Err(BalancerError::BalancingInactive)
        );
        assert_eq!(pipeline.output().writes.len(), 1);

        pipeline.handle_command(ControlCommand::ToggleBalancing).unwrap();
        pipeline.handle_command(request).unwrap();
        assert_eq!(pipeline.output().last(), [10, 20, 30, 40, 50, 60, 70, 75]);
    }

    #[test]
    fn test_export_request_is_published() {
        let history = shared_history();
        let telemetry = TelemetryChannel::new();
        let commands = ControlChannel::new();
        let mut sub = telemetry.subscriber().unwrap();
        let mut pipeline = Pipeline::new(
            BalancerConfig::default(),
            RecordingOutput::default(),
            &history,
            telemetry.publisher().unwrap(),
            &commands,
        );

        commands
            .try_send(ControlCommand::ExportHistory(ExportRing::HalfDay))
            .unwrap();
        pipeline.drain_commands();

        assert_eq!(
            sub.try_next_message_pure(),
            Some(TelemetryEvent::ExportRequested(ExportRing::HalfDay))
        );
    }

    mod with_acquisition {
        use super::*;
        use crate::acquisition::AcquisitionState;

        #[derive(Default)]
        struct CountingDriver {
            triggers: u32,
        }

        impl AcquisitionDriver for CountingDriver {
            fn configure(&mut self) -> Result<(), BalancerError> {
                Ok(())
            }

            fn calibrate_offset(&mut self) -> Result<(), BalancerError> {
                Ok(())
            }

            fn trigger(&mut self) -> Result<(), BalancerError> {
                self.triggers += 1;
                Ok(())
            }

            fn release(&mut self) {}
        }

        #[test]
        fn test_done_event_processes_and_rearms() {
            let history = shared_history();
            let telemetry = TelemetryChannel::new();
            let commands = ControlChannel::new();
            let mut pipeline = Pipeline::new(
                BalancerConfig::default(),
                RecordingOutput::default(),
                &history,
                telemetry.publisher().unwrap(),
                &commands,
            );
            let mut acquisition = Acquisition::new(CountingDriver::default());
            acquisition.start().unwrap();

            let buffer = burst(&SCENARIO, &[0; NUM_CELLS]);
            for _ in 0..CYCLES_PER_SECOND {
                pipeline
                    .on_acquisition_event(&mut acquisition, AcquisitionEvent::Done(&buffer))
                    .unwrap();
            }
            pipeline
                .on_acquisition_event(&mut acquisition, AcquisitionEvent::Ready)
                .unwrap();

            assert_eq!(pipeline.seconds(), 1);
            assert_eq!(acquisition.bursts(), CYCLES_PER_SECOND as u32);
            assert_eq!(acquisition.driver().triggers, CYCLES_PER_SECOND as u32 + 1);
            assert_eq!(acquisition.state(), AcquisitionState::Acquiring);
        }
    }
}
