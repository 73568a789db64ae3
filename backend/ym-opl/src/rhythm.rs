//! Percussion voices shared by the OPL2 and OPLL rhythm modes
//!
//! In rhythm mode the last three channels stop producing melodic output. Channel 6 plays the bass
//! drum as a normal two-operator voice; channels 7 and 8 have each operator state driven as an
//! independent voice:
//!
//! | Channel | Modulator state | Carrier state |
//! |---------|-----------------|---------------|
//! | 7       | high-hat        | snare drum    |
//! | 8       | tom-tom         | top cymbal    |
//!
//! The snare drum and high-hat are additionally scrambled by a 24-bit noise LFSR that both chips
//! clock once per melodic channel update.

use crate::channel::{Channel, FeedbackFn, OperatorSlot};
use crate::operator::{Operator, OperatorOverrides};
use bincode::{Decode, Encode};
use opl_common::num::GetBit;

// Fixed phase offsets, in 10-bit waveform phase units
const SNARE_DRUM_PHASE_OFFSET: i32 = 0x100;
const HIGH_HAT_PHASE_OFFSET: i32 = 0x100;
const TOP_CYMBAL_PHASE_OFFSET: i32 = 0x200;
// Half a waveform period; inverts the voice's output
const NOISE_PHASE_OFFSET: i32 = 0x200;

// Taps for the noise LFSR; see http://forums.submarine.org.uk/phpBB/viewtopic.php?f=9&t=16
const NOISE_POLYNOMIAL: u32 = 0x800302;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct NoiseGenerator {
    lfsr: u32,
}

impl Default for NoiseGenerator {
    fn default() -> Self {
        Self { lfsr: 1 }
    }
}

impl NoiseGenerator {
    pub fn clock(&mut self) {
        let xor_operand = if self.lfsr.bit(0) { NOISE_POLYNOMIAL } else { 0 };
        self.lfsr = (self.lfsr >> 1) ^ xor_operand;
    }

    #[must_use]
    pub fn output(&self) -> bool {
        self.lfsr.bit(0)
    }

    #[must_use]
    pub fn lfsr(&self) -> u32 {
        self.lfsr
    }
}

fn noise_offset(noise: bool) -> i32 {
    if noise { NOISE_PHASE_OFFSET } else { 0 }
}

/// Rhythm control register layout, shared by OPL2 $BD and OPLL $0E
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct RhythmControl {
    pub enabled: bool,
    pub bass_drum: bool,
    pub snare_drum: bool,
    pub tom_tom: bool,
    pub top_cymbal: bool,
    pub high_hat: bool,
}

impl RhythmControl {
    #[must_use]
    pub fn from_register(value: u8) -> Self {
        Self {
            enabled: value.bit(5),
            bass_drum: value.bit(4),
            snare_drum: value.bit(3),
            tom_tom: value.bit(2),
            top_cymbal: value.bit(1),
            high_hat: value.bit(0),
        }
    }
}

/// Operator configurations for each percussion voice, borrowed from the chip's flat operator
/// array
#[derive(Debug, Clone, Copy)]
pub struct RhythmOperators<'a> {
    pub bass_drum_modulator: &'a Operator,
    pub bass_drum_carrier: &'a Operator,
    pub high_hat: &'a Operator,
    pub snare_drum: &'a Operator,
    pub tom_tom: &'a Operator,
    pub top_cymbal: &'a Operator,
}

/// Per-voice volume overrides (OPLL only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct RhythmOverrides {
    pub bass_drum: OperatorOverrides,
    pub high_hat: OperatorOverrides,
    pub snare_drum: OperatorOverrides,
    pub tom_tom: OperatorOverrides,
    pub top_cymbal: OperatorOverrides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RhythmLevels {
    pub bass_drum: i32,
    pub snare_drum: i32,
    pub tom_tom: i32,
    pub top_cymbal: i32,
    pub high_hat: i32,
}

impl RhythmLevels {
    #[must_use]
    pub fn sum(&self) -> i32 {
        self.bass_drum + self.snare_drum + self.tom_tom + self.top_cymbal + self.high_hat
    }
}

/// Advance all five percussion voices by one tick.
pub fn update(
    [bass_drum, high_hat_snare, tom_tom_cymbal]: [&mut Channel; 3],
    operators: RhythmOperators<'_>,
    overrides: Option<&RhythmOverrides>,
    control: RhythmControl,
    noise: bool,
    feedback: FeedbackFn,
) {
    // The high-hat and cymbal each take their phase offset from the other's operator, sampled
    // before either advances
    let high_hat_offset = tom_tom_cymbal.state(OperatorSlot::Carrier).phase()
        + HIGH_HAT_PHASE_OFFSET
        + noise_offset(noise);
    let top_cymbal_offset =
        high_hat_snare.state(OperatorSlot::Modulator).phase() + TOP_CYMBAL_PHASE_OFFSET;

    bass_drum.update_pair(
        operators.bass_drum_modulator,
        operators.bass_drum_carrier,
        control.bass_drum,
        overrides.map(|overrides| &overrides.bass_drum),
        feedback,
    );

    high_hat_snare.update_operator(
        OperatorSlot::Modulator,
        operators.high_hat,
        control.high_hat,
        high_hat_offset,
        overrides.map(|overrides| &overrides.high_hat),
    );
    high_hat_snare.update_operator(
        OperatorSlot::Carrier,
        operators.snare_drum,
        control.snare_drum,
        SNARE_DRUM_PHASE_OFFSET + noise_offset(noise),
        overrides.map(|overrides| &overrides.snare_drum),
    );

    tom_tom_cymbal.update_operator(
        OperatorSlot::Modulator,
        operators.tom_tom,
        control.tom_tom,
        0,
        overrides.map(|overrides| &overrides.tom_tom),
    );
    tom_tom_cymbal.update_operator(
        OperatorSlot::Carrier,
        operators.top_cymbal,
        control.top_cymbal,
        top_cymbal_offset,
        overrides.map(|overrides| &overrides.top_cymbal),
    );
}

#[must_use]
pub fn levels([bass_drum, high_hat_snare, tom_tom_cymbal]: [&Channel; 3]) -> RhythmLevels {
    RhythmLevels {
        bass_drum: bass_drum.melodic_output(),
        snare_drum: high_hat_snare.level(OperatorSlot::Carrier),
        tom_tom: tom_tom_cymbal.level(OperatorSlot::Modulator),
        top_cymbal: tom_tom_cymbal.level(OperatorSlot::Carrier),
        high_hat: high_hat_snare.level(OperatorSlot::Modulator),
    }
}

/// Broadphase audibility test across all five voices
#[must_use]
pub fn is_audible(
    [bass_drum, high_hat_snare, tom_tom_cymbal]: [&Channel; 3],
    operators: RhythmOperators<'_>,
    overrides: Option<&RhythmOverrides>,
) -> bool {
    let audible = |channel: &Channel, slot, operator: &Operator, overrides| {
        operator.is_audible(channel.state(slot), overrides)
    };

    bass_drum.is_audible(operators.bass_drum_carrier, overrides.map(|o| &o.bass_drum))
        || audible(
            high_hat_snare,
            OperatorSlot::Modulator,
            operators.high_hat,
            overrides.map(|o| &o.high_hat),
        )
        || audible(
            high_hat_snare,
            OperatorSlot::Carrier,
            operators.snare_drum,
            overrides.map(|o| &o.snare_drum),
        )
        || audible(
            tom_tom_cymbal,
            OperatorSlot::Modulator,
            operators.tom_tom,
            overrides.map(|o| &o.tom_tom),
        )
        || audible(
            tom_tom_cymbal,
            OperatorSlot::Carrier,
            operators.top_cymbal,
            overrides.map(|o| &o.top_cymbal),
        )
}
