//! LZMA probability models and the literal/match state machine.
//!
//! Probability tables are stored as flat arrays indexed by (state, position
//! state) pairs; all of them adapt through the range decoder. The model is
//! rebuilt on an LZMA2 properties change and refilled in place on a plain
//! state reset.

use crate::range::PROB_INIT;
use ruxz_core::error::{Error, Result};

/// Number of states in the LZMA state machine.
pub const NUM_STATES: usize = 12;

/// Maximum number of position states (pb ≤ 4).
pub const POS_STATES_MAX: usize = 1 << 4;

/// Minimum match length.
pub const MATCH_LEN_MIN: u32 = 2;

/// Number of distance slots.
pub const DIST_SLOTS: usize = 64;

/// Distance slots below this use the special (adaptive) bit trees.
pub const DIST_MODEL_END: u32 = 14;

/// Number of probabilities in the special distance trees.
pub const DIST_SPECIAL_SIZE: usize = 128 - DIST_MODEL_END as usize;

/// Number of distance alignment bits.
pub const ALIGN_BITS: u32 = 4;

/// lc/lp/pb literal and position context parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzmaProps {
    /// Literal context bits (0..=8).
    pub lc: u32,
    /// Literal position bits (0..=4).
    pub lp: u32,
    /// Position bits (0..=4).
    pub pb: u32,
}

impl LzmaProps {
    /// Decode the packed properties byte `(pb * 5 + lp) * 9 + lc`.
    pub fn from_byte(byte: u8) -> Result<Self> {
        let mut value = u32::from(byte);
        if value >= 225 {
            return Err(Error::data("invalid LZMA properties byte"));
        }

        let lc = value % 9;
        value /= 9;
        let lp = value % 5;
        let pb = value / 5;

        // The decoder allocates 0x300 << (lc + lp) literal probabilities;
        // the format caps the sum at four.
        if lc + lp > 4 {
            return Err(Error::data("LZMA properties lc + lp exceed 4"));
        }

        Ok(Self { lc, lp, pb })
    }

    /// Encode into the packed properties byte.
    pub fn to_byte(self) -> u8 {
        ((self.pb * 5 + self.lp) * 9 + self.lc) as u8
    }

    /// Bitmask selecting the position state.
    pub fn pos_mask(self) -> u32 {
        (1 << self.pb) - 1
    }

    /// Bitmask selecting the literal position context.
    pub fn literal_pos_mask(self) -> u32 {
        (1 << self.lp) - 1
    }
}

impl Default for LzmaProps {
    fn default() -> Self {
        Self { lc: 3, lp: 0, pb: 2 }
    }
}

/// The 12-state literal/match history automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LzmaState(u8);

impl LzmaState {
    /// Initial state.
    pub fn new() -> Self {
        Self(0)
    }

    /// Index into state-keyed probability tables.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// States below 7 most recently produced a literal.
    pub fn is_literal(self) -> bool {
        self.0 < 7
    }

    /// Transition after a literal.
    pub fn update_literal(&mut self) {
        self.0 = match self.0 {
            0..=3 => 0,
            4..=9 => self.0 - 3,
            _ => self.0 - 6,
        };
    }

    /// Transition after a match.
    pub fn update_match(&mut self) {
        self.0 = if self.0 < 7 { 7 } else { 10 };
    }

    /// Transition after a repeated match.
    pub fn update_rep(&mut self) {
        self.0 = if self.0 < 7 { 8 } else { 11 };
    }

    /// Transition after a short (length 1) repeat.
    pub fn update_short_rep(&mut self) {
        self.0 = if self.0 < 7 { 9 } else { 11 };
    }
}

/// Probabilities for one match-length coder.
#[derive(Debug, Clone)]
pub struct LenCoder {
    /// Low/mid/high range selector bits.
    pub choice: u16,
    /// Second selector bit.
    pub choice2: u16,
    /// 8 symbols per position state, lengths 2..=9.
    pub low: [u16; POS_STATES_MAX * 8],
    /// 8 symbols per position state, lengths 10..=17.
    pub mid: [u16; POS_STATES_MAX * 8],
    /// 256 shared symbols, lengths 18..=273.
    pub high: [u16; 256],
}

impl LenCoder {
    fn new() -> Self {
        Self {
            choice: PROB_INIT,
            choice2: PROB_INIT,
            low: [PROB_INIT; POS_STATES_MAX * 8],
            mid: [PROB_INIT; POS_STATES_MAX * 8],
            high: [PROB_INIT; 256],
        }
    }

    fn reset(&mut self) {
        self.choice = PROB_INIT;
        self.choice2 = PROB_INIT;
        self.low.fill(PROB_INIT);
        self.mid.fill(PROB_INIT);
        self.high.fill(PROB_INIT);
    }
}

/// All adaptive probabilities of one LZMA decoder.
#[derive(Debug, Clone)]
pub struct LzmaModel {
    /// Active properties.
    pub props: LzmaProps,
    /// Is-match bits, indexed `state * POS_STATES_MAX + pos_state`.
    pub is_match: [u16; NUM_STATES * POS_STATES_MAX],
    /// Is-rep bits per state.
    pub is_rep: [u16; NUM_STATES],
    /// Is-rep0 bits per state.
    pub is_rep0: [u16; NUM_STATES],
    /// Is-rep1 bits per state.
    pub is_rep1: [u16; NUM_STATES],
    /// Is-rep2 bits per state.
    pub is_rep2: [u16; NUM_STATES],
    /// Is-rep0-long bits, indexed like `is_match`.
    pub is_rep0_long: [u16; NUM_STATES * POS_STATES_MAX],
    /// Match length coder.
    pub match_len: LenCoder,
    /// Repeat length coder.
    pub rep_len: LenCoder,
    /// Literal trees: `0x300 << (lc + lp)` probabilities.
    pub literal: Vec<u16>,
    /// Distance slot trees, 64 per length state.
    pub dist_slot: [u16; 4 * DIST_SLOTS],
    /// Special distance trees for slots 4..14.
    pub dist_special: [u16; DIST_SPECIAL_SIZE],
    /// Alignment tree for large distances.
    pub dist_align: [u16; 1 << ALIGN_BITS],
}

impl LzmaModel {
    /// Fresh model for `props`.
    pub fn new(props: LzmaProps) -> Self {
        Self {
            props,
            is_match: [PROB_INIT; NUM_STATES * POS_STATES_MAX],
            is_rep: [PROB_INIT; NUM_STATES],
            is_rep0: [PROB_INIT; NUM_STATES],
            is_rep1: [PROB_INIT; NUM_STATES],
            is_rep2: [PROB_INIT; NUM_STATES],
            is_rep0_long: [PROB_INIT; NUM_STATES * POS_STATES_MAX],
            match_len: LenCoder::new(),
            rep_len: LenCoder::new(),
            literal: vec![PROB_INIT; 0x300 << (props.lc + props.lp)],
            dist_slot: [PROB_INIT; 4 * DIST_SLOTS],
            dist_special: [PROB_INIT; DIST_SPECIAL_SIZE],
            dist_align: [PROB_INIT; 1 << ALIGN_BITS],
        }
    }

    /// Refill every probability in place (state reset, same properties).
    pub fn reset(&mut self) {
        self.is_match.fill(PROB_INIT);
        self.is_rep.fill(PROB_INIT);
        self.is_rep0.fill(PROB_INIT);
        self.is_rep1.fill(PROB_INIT);
        self.is_rep2.fill(PROB_INIT);
        self.is_rep0_long.fill(PROB_INIT);
        self.match_len.reset();
        self.rep_len.reset();
        self.literal.fill(PROB_INIT);
        self.dist_slot.fill(PROB_INIT);
        self.dist_special.fill(PROB_INIT);
        self.dist_align.fill(PROB_INIT);
    }

    /// Offset of the literal tree for the given position and previous byte.
    pub fn literal_offset(&self, position: u64, prev_byte: u8) -> usize {
        let low = (position as u32) & self.props.literal_pos_mask();
        let high = u32::from(prev_byte) >> (8 - self.props.lc);
        0x300 * ((low << self.props.lc) + high) as usize
    }
}
