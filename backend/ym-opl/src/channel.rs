//! Channel: a modulator/carrier operator pair and its frequency state

use crate::operator::{Operator, OperatorOverrides, OperatorState};
use bincode::{Decode, Encode};
use opl_common::num::{GetBit, U16Ext};

/// Inputs to the modulator self-feedback network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackInput {
    /// Feedback strength from the channel's feedback register, 0-7; 0 means no feedback
    pub strength: u8,
    /// Modulator output level from the most recent update
    pub current_level: i32,
    /// Modulator output level from the update before that
    pub previous_level: i32,
}

/// Produces the phase offset applied to a modulator from its own recent output.
///
/// Chips take this as a plain function pointer so that the feedback network can be swapped out
/// without touching the rest of the synthesis path.
pub type FeedbackFn = fn(FeedbackInput) -> i32;

/// Default feedback network: modulators are never offset by their own output.
#[must_use]
pub fn no_feedback(_input: FeedbackInput) -> i32 {
    0
}

/// Phase offset applied to a carrier for a given modulator output level
#[inline]
#[must_use]
pub fn modulation_phase_offset(modulator_level: i32) -> i32 {
    modulator_level
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorSlot {
    Modulator,
    Carrier,
}

impl OperatorSlot {
    fn index(self) -> usize {
        match self {
            Self::Modulator => 0,
            Self::Carrier => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
pub struct Channel {
    period: u16,
    octave: u8,
    key_on: bool,
    // 9-bit OPLL frequencies are shifted up to line up with the OPL2's 10-bit frequencies
    frequency_shift: u8,
    feedback_strength: u8,
    additive: bool,
    states: [OperatorState; 2],
    previous_modulator_level: i32,
}

impl Channel {
    pub fn set_frequency_low(&mut self, value: u8) {
        self.period.set_lsb(value);
    }

    /// OPL2 registers $B0-$B8: bits 0-1 frequency high, bits 2-4 octave, bit 5 key on
    pub fn set_10bit_frequency_octave_key_on(&mut self, value: u8) {
        self.period.set_msb(value & 0x03);
        self.octave = value.bits(2..=4);
        self.key_on = value.bit(5);
        self.frequency_shift = 0;

        log::trace!(
            "Period: {:03X}, Octave: {}, Key on: {}",
            self.period,
            self.octave,
            self.key_on
        );
    }

    /// OPLL registers $20-$28: bit 0 frequency high, bits 1-3 octave, bit 4 key on. Bit 5 (sustain)
    /// belongs to the channel's overrides and is decoded by the chip.
    pub fn set_9bit_frequency_octave_key_on(&mut self, value: u8) {
        self.period.set_msb(value & 0x01);
        self.octave = value.bits(1..=3);
        self.key_on = value.bit(4);
        self.frequency_shift = 1;

        log::trace!(
            "Period: {:03X}, Octave: {}, Key on: {}",
            self.period,
            self.octave,
            self.key_on
        );
    }

    /// OPL2 registers $C0-$C8: bits 1-3 feedback strength, bit 0 selects additive output
    pub fn set_feedback_mode(&mut self, value: u8) {
        self.feedback_strength = value.bits(1..=3);
        self.additive = value.bit(0);
    }

    #[must_use]
    pub fn period(&self) -> u16 {
        self.period
    }

    #[must_use]
    pub fn octave(&self) -> u8 {
        self.octave
    }

    #[must_use]
    pub fn key_on(&self) -> bool {
        self.key_on
    }

    #[must_use]
    pub fn feedback_strength(&self) -> u8 {
        self.feedback_strength
    }

    #[must_use]
    pub fn is_additive(&self) -> bool {
        self.additive
    }

    #[must_use]
    pub fn state(&self, slot: OperatorSlot) -> &OperatorState {
        &self.states[slot.index()]
    }

    #[must_use]
    pub fn level(&self, slot: OperatorSlot) -> i32 {
        self.states[slot.index()].level()
    }

    fn effective_period(&self) -> i32 {
        i32::from(self.period) << self.frequency_shift
    }

    /// Advance a standard two-operator voice by one tick. Overrides, if any, apply to the carrier.
    pub fn update_melodic(
        &mut self,
        modulator: &Operator,
        carrier: &Operator,
        overrides: Option<&OperatorOverrides>,
        feedback: FeedbackFn,
    ) {
        self.update_pair(modulator, carrier, false, overrides, feedback);
    }

    pub(crate) fn update_pair(
        &mut self,
        modulator: &Operator,
        carrier: &Operator,
        force_key_on: bool,
        overrides: Option<&OperatorOverrides>,
        feedback: FeedbackFn,
    ) {
        let current_level = self.states[0].level();
        let feedback_offset = feedback(FeedbackInput {
            strength: self.feedback_strength,
            current_level,
            previous_level: self.previous_modulator_level,
        });
        self.previous_modulator_level = current_level;

        self.update_operator(OperatorSlot::Modulator, modulator, force_key_on, feedback_offset, None);

        let carrier_offset =
            if self.additive { 0 } else { modulation_phase_offset(self.states[0].level()) };
        self.update_operator(OperatorSlot::Carrier, carrier, force_key_on, carrier_offset, overrides);
    }

    /// Advance one of this channel's operator states with an explicit phase offset; used for
    /// rhythm voices that do not follow the melodic modulator -> carrier path.
    pub fn update_operator(
        &mut self,
        slot: OperatorSlot,
        operator: &Operator,
        force_key_on: bool,
        phase_offset: i32,
        overrides: Option<&OperatorOverrides>,
    ) {
        let period = self.effective_period();
        operator.update(
            &mut self.states[slot.index()],
            self.key_on || force_key_on,
            period,
            self.octave,
            phase_offset,
            overrides,
        );
    }

    /// Standard two-operator output: the carrier alone for FM, or the average of both operators
    /// in additive mode
    #[must_use]
    pub fn melodic_output(&self) -> i32 {
        let carrier = self.states[1].level();
        if self.additive { (self.states[0].level() + carrier) >> 1 } else { carrier }
    }

    #[must_use]
    pub fn is_audible(&self, carrier: &Operator, overrides: Option<&OperatorOverrides>) -> bool {
        carrier.is_audible(&self.states[1], overrides)
    }
}
