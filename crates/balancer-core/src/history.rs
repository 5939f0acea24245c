//! Multi-resolution history of per-second cell frames
//!
//! Three fixed rings at increasing time spans:
//!
//! - **Fine**: one slot per second (two minutes of history)
//! - **Hourly**: mean of the last [`INTERVAL_1H`] fine slots (one hour)
//! - **Half-day**: mean of the last [`HOURLY_SLOTS_PER_HALF_DAY`] hourly
//!   slots (twelve hours)
//!
//! Coarse slots are written when the seconds counter hits their interval and
//! are handed back to the caller for notification. Every slot starts at the
//! [`NO_DATA`] sentinel. Nothing here survives a reset.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{
    HISTORY_CAPACITY, HISTORY_SLOTS_PER_CHUNK, HOURLY_SLOTS_PER_HALF_DAY, INTERVAL_12H, INTERVAL_1H,
};
use crate::frame::{CellFrame, FRAME_BYTES, FRAME_LEN, NO_DATA};

/// Bytes in one bulk-export chunk
pub const CHUNK_BYTES: usize = HISTORY_SLOTS_PER_CHUNK * FRAME_BYTES;

/// Chunks needed to export one full ring
pub const CHUNKS_PER_RING: usize = HISTORY_CAPACITY / HISTORY_SLOTS_PER_CHUNK;

/// Fixed-capacity circular buffer of frames.
///
/// `head` is the most recently written slot. A push advances the head first,
/// then overwrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRing<const N: usize> {
    slots: [CellFrame; N],
    head: usize,
}

impl<const N: usize> Default for HistoryRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> HistoryRing<N> {
    pub const fn new() -> Self {
        Self {
            slots: [CellFrame::empty(); N],
            // the first push lands in slot 0
            head: N - 1,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn push(&mut self, frame: CellFrame) {
        self.head = (self.head + 1) % N;
        self.slots[self.head] = frame;
    }

    pub fn latest(&self) -> &CellFrame {
        &self.slots[self.head]
    }

    /// Slot written `back` pushes ago (0 is the latest)
    pub fn recent(&self, back: usize) -> &CellFrame {
        &self.slots[(self.head + N - back % N) % N]
    }

    /// Per-field mean of the `count` most recent slots, reading backwards
    /// from the head. Unrecorded fields are left out of the mean; a field
    /// with nothing recorded in the window stays [`NO_DATA`].
    pub fn mean_of_recent(&self, count: usize) -> CellFrame {
        let mut sums = [0u32; FRAME_LEN];
        let mut counts = [0u32; FRAME_LEN];

        for back in 0..count.min(N) {
            let slot = self.recent(back);
            for (i, &value) in slot.0.iter().enumerate() {
                if value != NO_DATA {
                    sums[i] += value as u32;
                    counts[i] += 1;
                }
            }
        }

        let mut mean = CellFrame::empty();
        for i in 0..FRAME_LEN {
            if counts[i] > 0 {
                mean.0[i] = (sums[i] / counts[i]) as u16;
            }
        }
        mean
    }

    /// Every slot from oldest (one past head) to newest (head)
    pub fn iter_chronological(&self) -> impl Iterator<Item = &CellFrame> + '_ {
        (1..=N).map(move |i| &self.slots[(self.head + i) % N])
    }
}

/// Time resolution of a history ring
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Fine,
    Hourly,
    HalfDay,
}

impl Resolution {
    pub const fn name(&self) -> &'static str {
        match self {
            Resolution::Fine => "fine",
            Resolution::Hourly => "1h",
            Resolution::HalfDay => "12h",
        }
    }
}

/// Rings the host can request in bulk. The fine ring only feeds decimation
/// and has no export path.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportRing {
    Hourly,
    HalfDay,
}

impl ExportRing {
    pub const fn resolution(&self) -> Resolution {
        match self {
            ExportRing::Hourly => Resolution::Hourly,
            ExportRing::HalfDay => Resolution::HalfDay,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.resolution().name()
    }
}

/// Coarse slots written by one [`HistoryStore::record`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryUpdate {
    pub hourly: Option<CellFrame>,
    pub half_day: Option<CellFrame>,
}

/// One bulk-export payload: [`HISTORY_SLOTS_PER_CHUNK`] frames back to back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryChunk {
    pub ring: ExportRing,
    /// Position of this chunk within the export, oldest first
    pub index: u8,
    pub payload: [u8; CHUNK_BYTES],
}

pub type Ring = HistoryRing<HISTORY_CAPACITY>;

/// The three decimating rings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryStore {
    fine: Ring,
    hourly: Ring,
    half_day: Ring,
}

impl HistoryStore {
    pub const fn new() -> Self {
        Self {
            fine: HistoryRing::new(),
            hourly: HistoryRing::new(),
            half_day: HistoryRing::new(),
        }
    }

    /// Store a per-second frame and run decimation for this second.
    ///
    /// A `seconds` value of 0 (after the counter wraps) triggers both
    /// decimations, same as any other multiple of the intervals.
    pub fn record(&mut self, frame: CellFrame, seconds: u16) -> HistoryUpdate {
        let mut update = HistoryUpdate::default();

        self.fine.push(frame);

        if seconds % INTERVAL_1H == 0 {
            let slot = self.fine.mean_of_recent(INTERVAL_1H as usize);
            self.hourly.push(slot);
            debug!("history: 1h slot {} written", self.hourly.head());
            update.hourly = Some(slot);
        }

        if seconds % INTERVAL_12H == 0 {
            let slot = self.hourly.mean_of_recent(HOURLY_SLOTS_PER_HALF_DAY);
            self.half_day.push(slot);
            debug!("history: 12h slot {} written", self.half_day.head());
            update.half_day = Some(slot);
        }

        update
    }

    pub fn ring(&self, resolution: Resolution) -> &Ring {
        match resolution {
            Resolution::Fine => &self.fine,
            Resolution::Hourly => &self.hourly,
            Resolution::HalfDay => &self.half_day,
        }
    }

    pub fn latest(&self, resolution: Resolution) -> &CellFrame {
        self.ring(resolution).latest()
    }

    /// The whole ring as transport chunks, oldest first
    pub fn export(&self, ring: ExportRing) -> impl Iterator<Item = HistoryChunk> + '_ {
        export_ring(self.ring(ring.resolution()), ring)
    }
}

/// Chunk a ring for bulk export, oldest slot first
pub fn export_ring(slots: &Ring, ring: ExportRing) -> impl Iterator<Item = HistoryChunk> + '_ {
    (0..CHUNKS_PER_RING).map(move |index| {
        let mut payload = [0u8; CHUNK_BYTES];
        let frames = slots
            .iter_chronological()
            .skip(index * HISTORY_SLOTS_PER_CHUNK)
            .take(HISTORY_SLOTS_PER_CHUNK);

        for (dest, frame) in payload.chunks_exact_mut(FRAME_BYTES).zip(frames) {
            dest.copy_from_slice(&frame.to_bytes());
        }

        HistoryChunk {
            ring,
            index: index as u8,
            payload,
        }
    })
}

/// History shared between the pipeline (writer) and the transport (reader)
pub type SharedHistory = Mutex<CriticalSectionRawMutex, RefCell<HistoryStore>>;

pub const fn shared_history() -> SharedHistory {
    Mutex::new(RefCell::new(HistoryStore::new()))
}

/// Copy one ring out under the lock so a long export never blocks the writer
pub fn snapshot(history: &SharedHistory, resolution: Resolution) -> Ring {
    history.lock(|store| store.borrow().ring(resolution).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NUM_CELLS;

    extern crate std;
    use std::vec::Vec;

    fn uniform(voltage: u16, current: u16) -> CellFrame {
        CellFrame::from_cells(&[voltage; NUM_CELLS], &[current; NUM_CELLS])
    }

    #[test]
    fn test_new_ring_is_all_sentinel() {
        let ring: HistoryRing<4> = HistoryRing::new();
        assert_eq!(ring.head(), 3);
        assert!(ring.iter_chronological().all(|f| !f.is_recorded()));
        assert_eq!(ring.mean_of_recent(4), CellFrame::empty());
    }

    #[test]
    fn test_hourly_slot_is_exact_mean_of_last_30() {
        let mut store = HistoryStore::new();
        let mut sum = 0u32;

        for second in 1..=INTERVAL_1H {
            let v = 3300 + second * 7;
            sum += v as u32;
            let update = store.record(uniform(v, second), second);
            if second < INTERVAL_1H {
                assert_eq!(update.hourly, None);
            }
        }

        let hourly = *store.latest(Resolution::Hourly);
        assert_eq!(hourly.voltage(0) as u32, sum / INTERVAL_1H as u32);
        // currents 1..=30: mean 15.5 truncates to 15
        assert_eq!(hourly.current(5), 15);
        assert!(!store.latest(Resolution::HalfDay).is_recorded());
    }

    #[test]
    fn test_half_day_slot_is_exact_mean_of_last_12_hourly() {
        let mut store = HistoryStore::new();
        let mut expected = Vec::new();

        for second in 1..=INTERVAL_12H {
            // constant within each hour, so each hourly slot is exact
            let hour = (second - 1) / INTERVAL_1H;
            let v = 3000 + hour * 11;
            let update = store.record(uniform(v, 100), second);
            if let Some(slot) = update.hourly {
                expected.push(slot.voltage(0) as u32);
            }
            if second < INTERVAL_12H {
                assert_eq!(update.half_day, None);
            } else {
                assert!(update.half_day.is_some());
            }
        }

        assert_eq!(expected.len(), HOURLY_SLOTS_PER_HALF_DAY);
        let mean = expected.iter().sum::<u32>() / expected.len() as u32;
        let half_day = store.latest(Resolution::HalfDay);
        assert_eq!(half_day.voltage(3) as u32, mean);
        assert_eq!(half_day.current(3), 100);
    }

    #[test]
    fn test_wrap_keeps_last_capacity_frames() {
        let mut ring = Ring::new();
        let total = HISTORY_CAPACITY + 5;

        for i in 0..total {
            ring.push(uniform(i as u16, 0));
        }

        assert_eq!(ring.head(), 4);
        assert_eq!(ring.latest().voltage(0) as usize, total - 1);

        let order: Vec<usize> = ring
            .iter_chronological()
            .map(|f| f.voltage(0) as usize)
            .collect();
        let expected: Vec<usize> = (5..total).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_cold_start_window_averages_recorded_slots_only() {
        let mut store = HistoryStore::new();
        // seconds 0 is a multiple of both intervals: a single fine slot
        let update = store.record(uniform(3500, 40), 0);

        let hourly = update.hourly.unwrap();
        assert_eq!(hourly.voltage(0), 3500);
        assert_eq!(hourly.current(0), 40);
        assert_eq!(update.half_day.unwrap().voltage(0), 3500);

        // older slots of every ring are still unrecorded
        assert!(!store.ring(Resolution::Fine).recent(1).is_recorded());
    }

    #[test]
    fn test_export_is_chronological_in_twenty_chunks() {
        let mut slots = Ring::new();
        for second in 1..=(HISTORY_CAPACITY as u16 + 3) {
            slots.push(uniform(second, second));
        }

        let chunks: Vec<HistoryChunk> = export_ring(&slots, ExportRing::Hourly).collect();
        assert_eq!(chunks.len(), CHUNKS_PER_RING);
        assert_eq!(chunks.len(), 20);

        let mut first = [0u8; FRAME_BYTES];
        first.copy_from_slice(&chunks[0].payload[..FRAME_BYTES]);
        // seconds 1..=3 were overwritten, 4 is the oldest left
        assert_eq!(CellFrame::from_bytes(&first).voltage(0), 4);

        let mut last = [0u8; FRAME_BYTES];
        last.copy_from_slice(&chunks[19].payload[CHUNK_BYTES - FRAME_BYTES..]);
        assert_eq!(
            CellFrame::from_bytes(&last).voltage(0),
            HISTORY_CAPACITY as u16 + 3
        );
        assert_eq!(chunks[19].index, 19);
        assert!(chunks.iter().all(|c| c.ring == ExportRing::Hourly));
    }

    #[test]
    fn test_store_export_reads_the_requested_ring() {
        let mut store = HistoryStore::new();
        store.record(uniform(3400, 20), 0);

        let chunks: Vec<HistoryChunk> = store.export(ExportRing::HalfDay).collect();
        let mut newest = [0u8; FRAME_BYTES];
        newest.copy_from_slice(&chunks[19].payload[CHUNK_BYTES - FRAME_BYTES..]);
        assert_eq!(CellFrame::from_bytes(&newest).voltage(0), 3400);
        assert_eq!(ExportRing::HalfDay.name(), "12h");
    }

    #[test]
    fn test_snapshot_copies_under_lock() {
        let history = shared_history();
        history.lock(|store| {
            store.borrow_mut().record(uniform(3650, 12), 1);
        });

        let ring = snapshot(&history, Resolution::Fine);
        assert_eq!(ring.latest().voltage(7), 3650);

        history.lock(|store| {
            store.borrow_mut().record(uniform(3000, 12), 2);
        });
        // the copy is unaffected by later writes
        assert_eq!(ring.latest().voltage(7), 3650);
    }
}
