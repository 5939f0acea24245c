//! Wireless telemetry boundary
//!
//! The pipeline publishes [`TelemetryEvent`]s without blocking; a transport
//! task subscribes, encodes and notifies them through a [`Transport`]. Bulk
//! history export runs entirely on the transport side, from a snapshot of
//! the shared history.
//!
//! ## Attribute table
//!
//! | Characteristic | UUID     | Payload                          |
//! |----------------|----------|----------------------------------|
//! | `Values`       | `0xAB01` | per-second averages, 32 bytes    |
//! | `Deviations`   | `0xAB02` | per-second deviations, 32 bytes  |
//! | `History1h`    | `0xAB03` | 1h slot (32) or export chunk (192) |
//! | `History12h`   | `0xAB04` | 12h slot (32) or export chunk (192) |
//! | `DutySet`      | `0xAB05` | duty override, written by host   |

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pubsub::{PubSubChannel, Publisher, Subscriber};
use heapless::Vec;
use log::{debug, warn};

use crate::balancer::DutyVector;
use crate::config::{NUM_CELLS, PWM_TOP};
use crate::error::BalancerError;
use crate::frame::CellFrame;
use crate::history::{ExportRing, SharedHistory, export_ring, snapshot};

/// Primary service UUID (16-bit)
pub const SERVICE_UUID: u16 = 0xAB00;

/// Telemetry queue depth. History export bypasses the queue, so this only
/// has to absorb a second's values plus the occasional coarse slot.
pub const TELEMETRY_CHANNEL_CAPACITY: usize = 8;

/// Number of subscribers
/// - Subscriber 0: transport task
/// - Subscriber 1: console / diagnostics
pub const TELEMETRY_SUBSCRIBERS: usize = 2;

/// Number of publishers (just the pipeline)
pub const TELEMETRY_PUBLISHERS: usize = 1;

pub type TelemetryChannel = PubSubChannel<
    CriticalSectionRawMutex,
    TelemetryEvent,
    TELEMETRY_CHANNEL_CAPACITY,
    TELEMETRY_SUBSCRIBERS,
    TELEMETRY_PUBLISHERS,
>;

pub type TelemetryPublisher<'a> = Publisher<
    'a,
    CriticalSectionRawMutex,
    TelemetryEvent,
    TELEMETRY_CHANNEL_CAPACITY,
    TELEMETRY_SUBSCRIBERS,
    TELEMETRY_PUBLISHERS,
>;

pub type TelemetrySubscriber<'a> = Subscriber<
    'a,
    CriticalSectionRawMutex,
    TelemetryEvent,
    TELEMETRY_CHANNEL_CAPACITY,
    TELEMETRY_SUBSCRIBERS,
    TELEMETRY_PUBLISHERS,
>;

/// Attributes exposed under [`SERVICE_UUID`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristic {
    Values,
    Deviations,
    History1h,
    History12h,
    DutySet,
}

impl Characteristic {
    pub const ALL: [Characteristic; 5] = [
        Characteristic::Values,
        Characteristic::Deviations,
        Characteristic::History1h,
        Characteristic::History12h,
        Characteristic::DutySet,
    ];

    pub const fn uuid(&self) -> u16 {
        match self {
            Characteristic::Values => 0xAB01,
            Characteristic::Deviations => 0xAB02,
            Characteristic::History1h => 0xAB03,
            Characteristic::History12h => 0xAB04,
            Characteristic::DutySet => 0xAB05,
        }
    }

    /// Characteristic carrying a ring's slots and exports
    pub const fn for_history(ring: ExportRing) -> Characteristic {
        match ring {
            ExportRing::Hourly => Characteristic::History1h,
            ExportRing::HalfDay => Characteristic::History12h,
        }
    }
}

/// Events published by the pipeline to notify the transport of new data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// Per-second averages
    CellValues(CellFrame),
    /// Per-second worst-case deviations
    CellDeviations(CellFrame),
    /// A new 1h history slot was written
    Hourly(CellFrame),
    /// A new 12h history slot was written
    HalfDay(CellFrame),
    /// The host asked for a full ring
    ExportRequested(ExportRing),
}

/// Outbound side of the wireless link
pub trait Transport {
    type Error: core::fmt::Debug;

    fn notify(&mut self, characteristic: Characteristic, payload: &[u8]) -> Result<(), Self::Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    type Error = T::Error;

    fn notify(&mut self, characteristic: Characteristic, payload: &[u8]) -> Result<(), Self::Error> {
        (**self).notify(characteristic, payload)
    }
}

/// Hands telemetry events to a transport. Failed notifications are logged
/// and dropped; the next second brings fresh data.
pub struct TelemetryForwarder<'a, T: Transport> {
    transport: T,
    history: &'a SharedHistory,
}

impl<'a, T: Transport> TelemetryForwarder<'a, T> {
    pub fn new(transport: T, history: &'a SharedHistory) -> Self {
        Self { transport, history }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn forward(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::CellValues(frame) => self.send(Characteristic::Values, frame),
            TelemetryEvent::CellDeviations(frame) => self.send(Characteristic::Deviations, frame),
            TelemetryEvent::Hourly(frame) => self.send(Characteristic::History1h, frame),
            TelemetryEvent::HalfDay(frame) => self.send(Characteristic::History12h, frame),
            TelemetryEvent::ExportRequested(ring) => {
                self.export(*ring);
            }
        }
    }

    fn send(&mut self, characteristic: Characteristic, frame: &CellFrame) {
        if let Err(e) = self.transport.notify(characteristic, &frame.to_bytes()) {
            warn!("notify {:?} failed: {:?}", characteristic, e);
        }
    }

    /// Stream a full ring, oldest slot first. Returns the number of chunks sent.
    pub fn export(&mut self, ring: ExportRing) -> usize {
        let characteristic = Characteristic::for_history(ring);
        let slots = snapshot(self.history, ring.resolution());
        let mut sent = 0;
        for chunk in export_ring(&slots, ring) {
            if let Err(e) = self.transport.notify(characteristic, &chunk.payload) {
                warn!("export chunk {} failed: {:?}", chunk.index, e);
                return sent;
            }
            sent += 1;
        }
        debug!("exported {} history in {} chunks", ring.name(), sent);
        sent
    }
}

/// Decode a duty override written by the host.
///
/// Two forms are accepted:
/// - text, eight comma-separated decimal values (`" 00, 10, 00, 25, 00, 00, 00, 00"`)
/// - binary, exactly eight bytes, postcard-encoded `[u8; 8]`
///
/// Eight values of text need at least fifteen bytes, so an eight-byte
/// payload is always binary.
pub fn parse_duty_override(bytes: &[u8]) -> Result<DutyVector, BalancerError> {
    if bytes.len() == NUM_CELLS {
        let duties: DutyVector = postcard::from_bytes(bytes).map_err(|_| {
            BalancerError::InvalidDutyOverride {
                details: "malformed binary payload",
            }
        })?;
        return check_range(duties);
    }
    parse_duty_text(bytes)
}

/// Text form of [`parse_duty_override`], for links that carry lines rather
/// than framed writes
pub fn parse_duty_text(bytes: &[u8]) -> Result<DutyVector, BalancerError> {
    let text = core::str::from_utf8(bytes).map_err(|_| BalancerError::InvalidDutyOverride {
        details: "payload is not text",
    })?;

    let mut values: Vec<u8, NUM_CELLS> = Vec::new();
    for (cell, field) in text.trim().split(',').enumerate() {
        let duty: u16 = field
            .trim()
            .parse()
            .map_err(|_| BalancerError::InvalidDutyOverride {
                details: "value is not a decimal number",
            })?;
        if duty > PWM_TOP as u16 {
            return Err(BalancerError::DutyOutOfRange { cell, duty });
        }
        values
            .push(duty as u8)
            .map_err(|_| BalancerError::InvalidDutyOverride {
                details: "more than eight values",
            })?;
    }

    if values.len() != NUM_CELLS {
        return Err(BalancerError::InvalidDutyOverride {
            details: "fewer than eight values",
        });
    }

    let mut duties = [0u8; NUM_CELLS];
    duties.copy_from_slice(&values);
    Ok(duties)
}

fn check_range(duties: DutyVector) -> Result<DutyVector, BalancerError> {
    match duties.iter().position(|&d| d > PWM_TOP) {
        Some(cell) => Err(BalancerError::DutyOutOfRange {
            cell,
            duty: duties[cell] as u16,
        }),
        None => Ok(duties),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{CHUNK_BYTES, CHUNKS_PER_RING, shared_history};

    extern crate std;
    use std::vec::Vec as StdVec;

    #[derive(Default)]
    struct RecordingTransport {
        sent: StdVec<(Characteristic, usize)>,
        fail_after: Option<usize>,
    }

    impl Transport for RecordingTransport {
        type Error = &'static str;

        fn notify(&mut self, characteristic: Characteristic, payload: &[u8]) -> Result<(), Self::Error> {
            if self.fail_after == Some(self.sent.len()) {
                return Err("link dropped");
            }
            self.sent.push((characteristic, payload.len()));
            Ok(())
        }
    }

    #[test]
    fn test_uuids_are_sequential_under_service() {
        for (i, c) in Characteristic::ALL.iter().enumerate() {
            assert_eq!(c.uuid(), SERVICE_UUID + 1 + i as u16);
        }
    }

    #[test]
    fn test_parse_text_override() {
        let duties = parse_duty_override(b" 00, 10, 00, 25, 00, 00, 00, 100").unwrap();
        assert_eq!(duties, [0, 10, 0, 25, 0, 0, 0, 100]);

        // trailing newline from a terminal
        let duties = parse_duty_override(b"1,2,3,4,5,6,7,8\n").unwrap();
        assert_eq!(duties, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_parse_binary_override() {
        let duties = parse_duty_override(&[0, 5, 10, 15, 20, 25, 30, 35]).unwrap();
        assert_eq!(duties, [0, 5, 10, 15, 20, 25, 30, 35]);

        assert_eq!(
            parse_duty_override(&[0, 0, 0, 0, 0, 0, 0, 200]),
            Err(BalancerError::DutyOutOfRange { cell: 7, duty: 200 })
        );
    }

    #[test]
    fn test_parse_binary_override_with_separator_bytes() {
        // 44 is ',' and 10 is '\n' in ASCII
        assert_eq!(
            parse_duty_override(&[44, 0, 0, 0, 0, 0, 0, 0]),
            Ok([44, 0, 0, 0, 0, 0, 0, 0])
        );
        assert_eq!(
            parse_duty_override(&[44, 44, 10, 44, 0, 44, 75, 44]),
            Ok([44, 44, 10, 44, 0, 44, 75, 44])
        );
    }

    #[test]
    fn test_text_parser_never_reads_binary() {
        assert!(matches!(
            parse_duty_text(&[0, 5, 10, 15, 20, 25, 30, 35]),
            Err(BalancerError::InvalidDutyOverride { .. })
        ));
        assert_eq!(parse_duty_text(b"0,0,0,0,0,0,0,0"), Ok([0; NUM_CELLS]));
    }

    #[test]
    fn test_history_characteristics() {
        assert_eq!(
            Characteristic::for_history(ExportRing::Hourly),
            Characteristic::History1h
        );
        assert_eq!(
            Characteristic::for_history(ExportRing::HalfDay),
            Characteristic::History12h
        );
    }

    #[test]
    fn test_parse_rejects_malformed_text() {
        assert!(matches!(
            parse_duty_override(b"00, 10, 00"),
            Err(BalancerError::InvalidDutyOverride { .. })
        ));
        assert!(matches!(
            parse_duty_override(b"0,0,0,0,0,0,0,0,0"),
            Err(BalancerError::InvalidDutyOverride { .. })
        ));
        assert!(matches!(
            parse_duty_override(b"0, 0, x, 0, 0, 0, 0, 0"),
            Err(BalancerError::InvalidDutyOverride { .. })
        ));
        assert_eq!(
            parse_duty_override(b"0, 0, 0, 0, 0, 300, 0, 0"),
            Err(BalancerError::DutyOutOfRange { cell: 5, duty: 300 })
        );
    }

    #[test]
    fn test_forward_maps_events_to_characteristics() {
        let history = shared_history();
        let mut transport = RecordingTransport::default();
        let mut forwarder = TelemetryForwarder::new(&mut transport, &history);

        let frame = CellFrame::from_cells(&[3600; NUM_CELLS], &[100; NUM_CELLS]);
        forwarder.forward(&TelemetryEvent::CellValues(frame));
        forwarder.forward(&TelemetryEvent::CellDeviations(frame));
        forwarder.forward(&TelemetryEvent::HalfDay(frame));

        assert_eq!(
            transport.sent,
            [
                (Characteristic::Values, 32),
                (Characteristic::Deviations, 32),
                (Characteristic::History12h, 32),
            ]
        );
    }

    #[test]
    fn test_export_streams_full_ring() {
        let history = shared_history();
        let mut transport = RecordingTransport::default();
        let mut forwarder = TelemetryForwarder::new(&mut transport, &history);

        forwarder.forward(&TelemetryEvent::ExportRequested(ExportRing::Hourly));

        assert_eq!(transport.sent.len(), CHUNKS_PER_RING);
        assert!(
            transport
                .sent
                .iter()
                .all(|&s| s == (Characteristic::History1h, CHUNK_BYTES))
        );
    }

    #[test]
    fn test_export_stops_on_transport_error() {
        let history = shared_history();
        let mut transport = RecordingTransport {
            fail_after: Some(3),
            ..Default::default()
        };
        let mut forwarder = TelemetryForwarder::new(&mut transport, &history);

        assert_eq!(forwarder.export(ExportRing::HalfDay), 3);
    }

    #[test]
    fn test_events_reach_every_subscriber() {
        let channel = TelemetryChannel::new();
        let publisher = channel.publisher().unwrap();
        let mut transport_sub = channel.subscriber().unwrap();
        let mut console_sub = channel.subscriber().unwrap();

        let frame = CellFrame::from_cells(&[3300; NUM_CELLS], &[0; NUM_CELLS]);
        publisher.publish_immediate(TelemetryEvent::Hourly(frame));

        assert_eq!(
            transport_sub.try_next_message_pure(),
            Some(TelemetryEvent::Hourly(frame))
        );
        assert_eq!(
            console_sub.try_next_message_pure(),
            Some(TelemetryEvent::Hourly(frame))
        );
    }
}
