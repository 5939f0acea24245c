//! Host link over the RTT debug probe
//!
//! Stands in for the wireless attribute table: notifications are written to
//! the log, host writes arrive as lines on RTT down channel 0.
//!
//! The link is line based, so only text is accepted; a binary duty vector
//! may contain `\n` and would be split. Host lines:
//! - `x1` / `x12`: export the 1h / 12h history ring
//! - anything else: text duty override, `" 00, 10, 00, 25, 00, 00, 00, 00"`

use balancer_core::BalancerError;
use balancer_core::frame::{CellFrame, FRAME_BYTES};
use balancer_core::history::ExportRing;
use balancer_core::pipeline::ControlCommand;
use balancer_core::telemetry::{Characteristic, Transport, parse_duty_text};
use heapless::Vec;
use log::{info, warn};

/// Longest accepted host line
pub const HOST_LINE_LEN: usize = 64;

/// Notifications rendered to the RTT log
pub struct RttTransport;

impl Transport for RttTransport {
    type Error = core::convert::Infallible;

    fn notify(&mut self, characteristic: Characteristic, payload: &[u8]) -> Result<(), Self::Error> {
        match <&[u8; FRAME_BYTES]>::try_from(payload) {
            Ok(bytes) => info!(
                "[{:04X}] {:?}",
                characteristic.uuid(),
                CellFrame::from_bytes(bytes).0
            ),
            Err(_) => info!(
                "[{:04X}] {} byte chunk",
                characteristic.uuid(),
                payload.len()
            ),
        }
        Ok(())
    }
}

/// Turn one host line into a pipeline command
pub fn decode_host_line(line: &[u8]) -> Result<ControlCommand, BalancerError> {
    match line.trim_ascii() {
        b"x1" => Ok(ControlCommand::ExportHistory(ExportRing::Hourly)),
        b"x12" => Ok(ControlCommand::ExportHistory(ExportRing::HalfDay)),
        other => parse_duty_text(other).map(ControlCommand::OverrideDuties),
    }
}

/// Splits the RTT byte stream into lines
#[derive(Default)]
pub struct LineBuffer {
    line: Vec<u8, HOST_LINE_LEN>,
    overflowed: bool,
}

impl LineBuffer {
    pub const fn new() -> Self {
        Self {
            line: Vec::new(),
            overflowed: false,
        }
    }

    /// Feed one byte. Returns true once a full line is ready in
    /// [`LineBuffer::line`]; over-long lines are discarded as a whole.
    pub fn push(&mut self, byte: u8) -> bool {
        if byte != b'\n' {
            if self.line.push(byte).is_err() {
                self.overflowed = true;
            }
            return false;
        }

        if core::mem::replace(&mut self.overflowed, false) {
            warn!("host line longer than {} bytes dropped", HOST_LINE_LEN);
            self.line.clear();
            return false;
        }
        true
    }

    pub fn line(&self) -> &[u8] {
        &self.line
    }

    pub fn clear(&mut self) {
        self.line.clear();
    }
}
