//! Analog multiplexer select-line sequence
//!
//! Two 8:1 multiplexers share three select lines (S0..S2). Each select code
//! routes one cell-pair wiring position to the two ADC inputs. The order is
//! dictated by the harness routing, not by a binary count, so the sequence
//! below must not be "tidied up".

/// Positions in one multiplexer cycle
pub const MUX_POSITIONS: usize = 8;

/// A 3-bit select code. Bit 0 drives S0, bit 1 drives S1, bit 2 drives S2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectCode(u8);

impl SelectCode {
    pub const fn new(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Logic levels for `[S0, S1, S2]`
    pub const fn lines(self) -> [bool; 3] {
        [self.0 & 0b001 != 0, self.0 & 0b010 != 0, self.0 & 0b100 != 0]
    }
}

/// Select codes in playback order, one per wiring position
pub const SELECT_SEQUENCE: [SelectCode; MUX_POSITIONS] = [
    SelectCode::new(4),
    SelectCode::new(3),
    SelectCode::new(0),
    SelectCode::new(1),
    SelectCode::new(2),
    SelectCode::new(5),
    SelectCode::new(6),
    SelectCode::new(7),
];

/// Select-line levels for every step, for playback by a timing peripheral
/// that advances the multiplexer and triggers the ADC without software.
pub const fn waveform() -> [[bool; 3]; MUX_POSITIONS] {
    let mut table = [[false; 3]; MUX_POSITIONS];
    let mut i = 0;
    while i < MUX_POSITIONS {
        table[i] = SELECT_SEQUENCE[i].lines();
        i += 1;
    }
    table
}

/// Software sequencer, advanced once per sample pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MuxSequencer {
    position: usize,
}

impl MuxSequencer {
    pub const fn new() -> Self {
        Self { position: 0 }
    }

    /// Return to the first position. Used to resynchronise after an
    /// acquisition-finished event raced a mux advance.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn current(&self) -> SelectCode {
        SELECT_SEQUENCE[self.position]
    }

    /// Step to the next position and return its code
    pub fn advance(&mut self) -> SelectCode {
        self.position = (self.position + 1) % MUX_POSITIONS;
        self.current()
    }

    /// True when the sequencer sits at the start of a cycle
    pub fn at_cycle_start(&self) -> bool {
        self.position == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle_returns_to_initial_code() {
        let mut mux = MuxSequencer::new();
        let initial = mux.current();

        for _ in 0..MUX_POSITIONS {
            mux.advance();
        }

        assert_eq!(mux.current(), initial);
        assert!(mux.at_cycle_start());
    }

    #[test]
    fn test_cycle_visits_every_code_once() {
        let mut mux = MuxSequencer::new();
        let mut seen = [false; MUX_POSITIONS];

        for _ in 0..MUX_POSITIONS {
            let code = mux.current().bits() as usize;
            assert!(!seen[code], "code {} repeated within a cycle", code);
            seen[code] = true;
            mux.advance();
        }

        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_reset_mid_cycle() {
        let mut mux = MuxSequencer::new();
        mux.advance();
        mux.advance();
        mux.advance();
        assert_eq!(mux.position(), 3);

        mux.reset();
        assert_eq!(mux.current(), SELECT_SEQUENCE[0]);
    }

    #[test]
    fn test_waveform_matches_harness_levels() {
        let table = waveform();
        // position 0 selects input 8: only S2 high
        assert_eq!(table[0], [false, false, true]);
        // position 1 selects input 1: S0 and S1 high
        assert_eq!(table[1], [true, true, false]);
        assert_eq!(table[7], [true, true, true]);
    }
}
