//! Operator: one phase generator and one envelope generator
//!
//! An [`Operator`] holds only the register-decoded configuration; everything that changes per
//! tick lives in an [`OperatorState`]. The OPLL shares one operator configuration between every
//! channel playing the same instrument, so the two must stay separate.

use crate::tables::{self, LogSign};
use bincode::{Decode, Encode};
use opl_common::num::GetBit;
use std::cmp;

// MUL -> multiple table, multiplied by two so that MUL=0 (x0.5) stays integral
const MULTIPLIERS: [u32; 16] = [1, 2, 4, 6, 8, 10, 12, 14, 16, 18, 20, 20, 24, 24, 30, 30];

// Phase masks per quadrant (phase bits 8-9), indexed by waveform
#[rustfmt::skip]
const WAVEFORM_MASKS: [[i32; 4]; 4] = [
    [1023, 1023, 1023, 1023],
    [511, 511, 0, 0],
    [511, 511, 511, 511],
    [255, 0, 255, 0],
];

// The accumulator keeps 12 bits of fraction below the 10-bit waveform phase
const PHASE_FRACTION_BITS: u32 = 12;

pub const MAX_ENVELOPE_ATTENUATION: i32 = 511;
pub const MAX_STATIC_ATTENUATION: u8 = 0x3F;
pub const MAX_OVERRIDE_ATTENUATION: u8 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum Waveform {
    #[default]
    Sine,
    HalfSine,
    AbsSine,
    PulseSine,
}

impl Waveform {
    #[must_use]
    pub fn from_register(value: u8) -> Self {
        match value & 0x03 {
            0x00 => Self::Sine,
            0x01 => Self::HalfSine,
            0x02 => Self::AbsSine,
            0x03 => Self::PulseSine,
            _ => unreachable!("value & 0x03 is always <= 3"),
        }
    }
}

/// Apply the waveform's quadrant mask to a 10-bit phase (bits above 9 are carried through the
/// quadrant lookup only).
#[must_use]
pub fn fold_phase(waveform: Waveform, phase: i32) -> i32 {
    let quadrant = ((phase >> 8) & 0x03) as usize;
    phase & WAVEFORM_MASKS[waveform as usize][quadrant]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum EnvelopePhase {
    Attack,
    Decay,
    Sustain,
    #[default]
    Release,
}

/// Per-channel settings that replace an operator's own attenuation and sustain flag; only the
/// OPLL supplies these
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct OperatorOverrides {
    /// 0-15, in steps of 3dB
    pub attenuation: u8,
    pub use_sustain_level: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct OperatorState {
    raw_phase: u32,
    envelope_phase: EnvelopePhase,
    envelope_attenuation: i32,
    output: LogSign,
    time_in_phase: u32,
    last_key_on: bool,
}

impl Default for OperatorState {
    fn default() -> Self {
        Self {
            raw_phase: 0,
            envelope_phase: EnvelopePhase::Release,
            envelope_attenuation: MAX_ENVELOPE_ATTENUATION,
            output: LogSign::default(),
            time_in_phase: 0,
            last_key_on: false,
        }
    }
}

impl OperatorState {
    /// Signed linear output level as of the most recent update. A fully attenuated envelope
    /// always outputs exactly 0.
    #[must_use]
    pub fn level(&self) -> i32 {
        if self.envelope_attenuation >= MAX_ENVELOPE_ATTENUATION {
            return 0;
        }

        self.output.level()
    }

    /// Current 10-bit waveform phase, before any phase offset or waveform masking
    #[must_use]
    pub fn phase(&self) -> i32 {
        ((self.raw_phase >> PHASE_FRACTION_BITS) & 0x3FF) as i32
    }

    #[must_use]
    pub fn raw_phase(&self) -> u32 {
        self.raw_phase
    }

    #[must_use]
    pub fn envelope_phase(&self) -> EnvelopePhase {
        self.envelope_phase
    }

    #[must_use]
    pub fn envelope_attenuation(&self) -> i32 {
        self.envelope_attenuation
    }

    #[must_use]
    pub fn output(&self) -> LogSign {
        self.output
    }

    #[must_use]
    pub fn time_in_phase(&self) -> u32 {
        self.time_in_phase
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct Operator {
    // Attack/decay/release rates are stored as 4 * register value, 0-60
    attack_rate: u8,
    decay_rate: u8,
    sustain_level: u8,
    release_rate: u8,
    key_scale_level: u8,
    attenuation: u8,
    waveform: Waveform,
    amplitude_modulation: bool,
    vibrato: bool,
    use_sustain_level: bool,
    key_scale_rate: bool,
    frequency_multiple: u8,
}

impl Operator {
    pub fn set_attack_decay(&mut self, value: u8) {
        self.attack_rate = (value & 0xF0) >> 2;
        self.decay_rate = (value & 0x0F) << 2;
    }

    pub fn set_sustain_release(&mut self, value: u8) {
        self.sustain_level = value >> 4;
        self.release_rate = (value & 0x0F) << 2;
    }

    pub fn set_scaling_output(&mut self, value: u8) {
        self.key_scale_level = value >> 6;
        self.attenuation = value & 0x3F;
    }

    pub fn set_waveform(&mut self, value: u8) {
        self.waveform = Waveform::from_register(value);
    }

    pub fn set_mode(&mut self, value: u8) {
        self.amplitude_modulation = value.bit(7);
        self.vibrato = value.bit(6);
        self.use_sustain_level = value.bit(5);
        self.key_scale_rate = value.bit(4);
        self.frequency_multiple = value & 0x0F;
    }

    #[must_use]
    pub fn attack_rate(&self) -> u8 {
        self.attack_rate
    }

    #[must_use]
    pub fn decay_rate(&self) -> u8 {
        self.decay_rate
    }

    #[must_use]
    pub fn sustain_level(&self) -> u8 {
        self.sustain_level
    }

    #[must_use]
    pub fn release_rate(&self) -> u8 {
        self.release_rate
    }

    #[must_use]
    pub fn key_scale_level(&self) -> u8 {
        self.key_scale_level
    }

    #[must_use]
    pub fn attenuation(&self) -> u8 {
        self.attenuation
    }

    #[must_use]
    pub fn waveform(&self) -> Waveform {
        self.waveform
    }

    #[must_use]
    pub fn amplitude_modulation(&self) -> bool {
        self.amplitude_modulation
    }

    #[must_use]
    pub fn vibrato(&self) -> bool {
        self.vibrato
    }

    #[must_use]
    pub fn use_sustain_level(&self) -> bool {
        self.use_sustain_level
    }

    #[must_use]
    pub fn key_scale_rate(&self) -> bool {
        self.key_scale_rate
    }

    #[must_use]
    pub fn frequency_multiple(&self) -> u8 {
        self.frequency_multiple
    }

    /// Broadphase mute test; a `true` result does not guarantee non-zero output.
    #[must_use]
    pub fn is_audible(&self, state: &OperatorState, overrides: Option<&OperatorOverrides>) -> bool {
        if state.envelope_phase == EnvelopePhase::Release {
            let muted = match overrides {
                Some(overrides) => overrides.attenuation == MAX_OVERRIDE_ATTENUATION,
                None => self.attenuation == MAX_STATIC_ATTENUATION,
            };
            if muted {
                return false;
            }
        }

        state.envelope_attenuation != MAX_ENVELOPE_ATTENUATION
    }

    /// Advance `state` by one tick.
    pub fn update(
        &self,
        state: &mut OperatorState,
        key_on: bool,
        channel_period: i32,
        channel_octave: u8,
        phase_offset: i32,
        overrides: Option<&OperatorOverrides>,
    ) {
        let phase_delta =
            (MULTIPLIERS[self.frequency_multiple as usize] * channel_period as u32) << channel_octave;
        state.raw_phase = state.raw_phase.wrapping_add(phase_delta);

        let phase = ((state.raw_phase >> PHASE_FRACTION_BITS) as i32).wrapping_add(phase_offset);
        let waveform_output = tables::negative_log_sin(fold_phase(self.waveform, phase));

        // Any time key on is false the envelope is releasing; its leading edge restarts the attack
        if !key_on {
            state.envelope_phase = EnvelopePhase::Release;
            state.time_in_phase = 0;
        } else if !state.last_key_on {
            state.envelope_phase = EnvelopePhase::Attack;
            state.time_in_phase = 0;
        }
        state.last_key_on = key_on;

        // Envelope behavior from http://forums.submarine.org.uk/phpBB/viewtopic.php?f=9&t=16
        let current_phase = state.envelope_phase;
        match current_phase {
            EnvelopePhase::Attack => self.attack_step(state),
            EnvelopePhase::Decay => self.decrease_step(state, self.decay_rate, overrides),
            EnvelopePhase::Release => self.decrease_step(state, self.release_rate, overrides),
            EnvelopePhase::Sustain => {}
        }

        if state.envelope_phase == current_phase {
            state.time_in_phase = state.time_in_phase.wrapping_add(1);
        } else {
            state.time_in_phase = 0;
        }

        // Envelope attenuation is always in 0..=511 here
        let envelope_attenuation = state.envelope_attenuation as u16;
        let attenuation = match overrides {
            // OPLL channel volume: 3dB per step against a 0.375dB envelope step
            Some(overrides) => {
                waveform_output.attenuation
                    + envelope_attenuation
                    + (u16::from(overrides.attenuation) << 4)
            }
            // OPL2 total level: 0.75dB per step
            None => {
                waveform_output.attenuation
                    + (envelope_attenuation << 3)
                    + (u16::from(self.attenuation) << 5)
            }
        };
        state.output = LogSign { attenuation, sign: waveform_output.sign };
    }

    fn attack_step(&self, state: &mut OperatorState) {
        // A rate of 13 has 32 steps in the attack phase, 12 has the same 32 steps over 64 ticks,
        // and so on down; 14 and 15 use a divide by four per tick
        let attack_rate = u32::from(self.attack_rate);
        let attenuation = &mut state.envelope_attenuation;

        if attack_rate >= 56 {
            *attenuation -= (*attenuation >> 2) + 1;
        } else {
            let sample_length = 1_u32 << (14 - (attack_rate >> 2));
            if state.time_in_phase % sample_length == 0 {
                *attenuation -= (*attenuation >> 3) + 1;
            }
        }

        if attack_rate > 60 || *attenuation <= 0 {
            *attenuation = 0;
            state.envelope_phase = EnvelopePhase::Decay;
        }
    }

    fn decrease_step(
        &self,
        state: &mut OperatorState,
        rate: u8,
        overrides: Option<&OperatorOverrides>,
    ) {
        if rate != 0 {
            match rate >> 2 {
                1 => state.envelope_attenuation += 4,
                2 => state.envelope_attenuation += 2,
                step => {
                    let sample_length = 1_u32 << step.saturating_sub(4);
                    if state.time_in_phase % sample_length == 0 {
                        state.envelope_attenuation += 1;
                    }
                }
            }
        }

        state.envelope_attenuation = cmp::min(state.envelope_attenuation, MAX_ENVELOPE_ATTENUATION);

        let sustain_attenuation = i32::from(self.sustain_level) << 5;
        if state.envelope_phase == EnvelopePhase::Decay
            && state.envelope_attenuation >= sustain_attenuation
        {
            state.envelope_attenuation = sustain_attenuation;

            let hold = overrides.is_some_and(|overrides| overrides.use_sustain_level)
                || self.use_sustain_level;
            state.envelope_phase = if hold { EnvelopePhase::Sustain } else { EnvelopePhase::Release };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn operator(mode: u8, attack_decay: u8, sustain_release: u8, scaling_output: u8) -> Operator {
        let mut operator = Operator::default();
        operator.set_mode(mode);
        operator.set_attack_decay(attack_decay);
        operator.set_sustain_release(sustain_release);
        operator.set_scaling_output(scaling_output);
        operator
    }

    fn tick(operator: &Operator, state: &mut OperatorState, key_on: bool) {
        operator.update(state, key_on, 0, 0, 0, None);
    }

    #[test]
    fn register_decoding() {
        let operator = operator(0b1011_0101, 0xA3, 0x7C, 0b1001_0110);

        assert!(operator.amplitude_modulation());
        assert!(!operator.vibrato());
        assert!(operator.use_sustain_level());
        assert!(operator.key_scale_rate());
        assert_eq!(operator.frequency_multiple(), 5);
        assert_eq!(operator.attack_rate(), 40);
        assert_eq!(operator.decay_rate(), 12);
        assert_eq!(operator.sustain_level(), 7);
        assert_eq!(operator.release_rate(), 48);
        assert_eq!(operator.key_scale_level(), 2);
        assert_eq!(operator.attenuation(), 0x16);

        let mut operator = operator;
        operator.set_waveform(0xFE);
        assert_eq!(operator.waveform(), Waveform::AbsSine);
    }

    #[test]
    fn envelope_always_in_range() {
        for attack_decay in [0x00, 0x11, 0x5A, 0xC3, 0xEF, 0xFF] {
            for sustain_release in [0x00, 0x0F, 0x31, 0x88, 0xF4] {
                let operator = operator(0x20, attack_decay, sustain_release, 0);
                let mut state = OperatorState::default();

                for i in 0..3000 {
                    // Hold the key for a while, release it, then retrigger
                    let key_on = !(1200..1800).contains(&i);
                    tick(&operator, &mut state, key_on);

                    let attenuation = state.envelope_attenuation();
                    assert!(
                        (0..=MAX_ENVELOPE_ATTENUATION).contains(&attenuation),
                        "attenuation {attenuation} out of range (AD={attack_decay:02X}, SR={sustain_release:02X})"
                    );
                }
            }
        }
    }

    #[test]
    fn attack_reaches_zero_then_decays() {
        // AR=13, DR=0
        let operator = operator(0x20, 0xD0, 0x00, 0);
        let mut state = OperatorState::default();

        let mut previous = state.envelope_attenuation();
        let mut ticks = 0;
        loop {
            tick(&operator, &mut state, true);
            ticks += 1;
            assert!(ticks < 10000, "attack never completed");

            if state.envelope_phase() != EnvelopePhase::Attack {
                break;
            }

            assert!(state.envelope_attenuation() <= previous);
            previous = state.envelope_attenuation();
        }

        assert_eq!(state.envelope_phase(), EnvelopePhase::Decay);
        assert_eq!(state.envelope_attenuation(), 0);
        assert_eq!(state.time_in_phase(), 0);
    }

    #[test]
    fn fast_attack_steps_every_tick() {
        // AR=14
        let operator = operator(0x20, 0xE0, 0x00, 0);
        let mut state = OperatorState::default();

        tick(&operator, &mut state, true);
        assert_eq!(state.envelope_phase(), EnvelopePhase::Attack);
        assert_eq!(state.envelope_attenuation(), 511 - (511 >> 2) - 1);

        tick(&operator, &mut state, true);
        assert_eq!(state.envelope_attenuation(), 383 - (383 >> 2) - 1);
    }

    #[test]
    fn gated_attack_step_timing() {
        // AR=12 steps once every 4 ticks, starting on the first tick of the phase
        let attack = operator(0x20, 0xC0, 0x00, 0);
        let mut state = OperatorState::default();

        let attenuations: Vec<_> = (0..9)
            .map(|_| {
                tick(&attack, &mut state, true);
                state.envelope_attenuation()
            })
            .collect();
        assert_eq!(attenuations, vec![447, 447, 447, 447, 391, 391, 391, 391, 342]);
        assert_eq!(state.envelope_phase(), EnvelopePhase::Attack);
    }

    fn decaying_state() -> OperatorState {
        OperatorState {
            envelope_phase: EnvelopePhase::Decay,
            envelope_attenuation: 0,
            last_key_on: true,
            ..OperatorState::default()
        }
    }

    #[test]
    fn gated_decay_step_timing() {
        // DR=5 steps every other tick; SL=15 keeps the envelope in decay
        let slow = operator(0x20, 0x05, 0xF0, 0);
        let mut state = decaying_state();

        let attenuations: Vec<_> = (0..8)
            .map(|_| {
                tick(&slow, &mut state, true);
                state.envelope_attenuation()
            })
            .collect();
        assert_eq!(attenuations, vec![1, 1, 2, 2, 3, 3, 4, 4]);

        // DR=8 steps every 16 ticks
        let slower = operator(0x20, 0x08, 0xF0, 0);
        let mut state = decaying_state();

        for ticks in 1..=48 {
            tick(&slower, &mut state, true);
            assert_eq!(state.envelope_attenuation(), (ticks - 1) / 16 + 1, "after {ticks} ticks");
            assert_eq!(state.envelope_phase(), EnvelopePhase::Decay);
        }
    }

    #[test]
    fn zero_rate_never_moves() {
        // AR=15 reaches 0 quickly; DR=0 should then hold forever
        let operator = operator(0x00, 0xF0, 0x50, 0);
        let mut state = OperatorState::default();

        while state.envelope_phase() != EnvelopePhase::Decay {
            tick(&operator, &mut state, true);
        }

        for _ in 0..5000 {
            tick(&operator, &mut state, true);
            assert_eq!(state.envelope_attenuation(), 0);
            assert_eq!(state.envelope_phase(), EnvelopePhase::Decay);
        }
    }

    #[test]
    fn decay_clamps_at_sustain_level() {
        for (mode, expected_phase) in [(0x20, EnvelopePhase::Sustain), (0x00, EnvelopePhase::Release)]
        {
            // AR=15, DR=1 (+4 per tick), SL=3
            let operator = operator(mode, 0xF1, 0x30, 0);
            let mut state = OperatorState::default();

            while state.envelope_phase() != EnvelopePhase::Decay {
                tick(&operator, &mut state, true);
            }

            let mut previous = state.envelope_attenuation();
            while state.envelope_phase() == EnvelopePhase::Decay {
                tick(&operator, &mut state, true);
                assert!(state.envelope_attenuation() >= previous);
                previous = state.envelope_attenuation();
            }

            assert_eq!(state.envelope_phase(), expected_phase);
            assert_eq!(state.envelope_attenuation(), 3 << 5);
            assert_eq!(state.time_in_phase(), 0);
        }
    }

    #[test]
    fn override_sustain_flag_holds() {
        let operator = operator(0x00, 0xF1, 0x30, 0);
        let overrides = OperatorOverrides { attenuation: 0, use_sustain_level: true };
        let mut state = OperatorState::default();

        for _ in 0..100 {
            operator.update(&mut state, true, 0, 0, 0, Some(&overrides));
        }

        assert_eq!(state.envelope_phase(), EnvelopePhase::Sustain);
        assert_eq!(state.envelope_attenuation(), 3 << 5);
    }

    #[test]
    fn release_never_decreases() {
        // RR=3 (+1 per tick)
        let operator = operator(0x20, 0xF0, 0x03, 0);
        let mut state = OperatorState::default();

        for _ in 0..30 {
            tick(&operator, &mut state, true);
        }
        assert_eq!(state.envelope_phase(), EnvelopePhase::Sustain);

        let mut previous = state.envelope_attenuation();
        for _ in 0..600 {
            tick(&operator, &mut state, false);
            assert_eq!(state.envelope_phase(), EnvelopePhase::Release);
            assert!(state.envelope_attenuation() >= previous);
            previous = state.envelope_attenuation();
        }
        assert_eq!(state.envelope_attenuation(), MAX_ENVELOPE_ATTENUATION);
        assert!(!operator.is_audible(&state, None));
    }

    #[test]
    fn key_on_edges() {
        let operator = operator(0x20, 0x40, 0x00, 0);
        let mut state = OperatorState::default();

        for _ in 0..20 {
            tick(&operator, &mut state, true);
        }
        assert_eq!(state.envelope_phase(), EnvelopePhase::Attack);
        assert_eq!(state.time_in_phase(), 20);

        // Key off always forces release
        tick(&operator, &mut state, false);
        assert_eq!(state.envelope_phase(), EnvelopePhase::Release);
        assert_eq!(state.time_in_phase(), 1);

        // Leading edge restarts the attack with a fresh tick count
        tick(&operator, &mut state, true);
        assert_eq!(state.envelope_phase(), EnvelopePhase::Attack);
        assert_eq!(state.time_in_phase(), 1);

        // Holding key on does not restart the attack
        tick(&operator, &mut state, true);
        assert_eq!(state.time_in_phase(), 2);
    }

    #[test]
    fn phase_delta_is_linear_in_period() {
        for multiple in 0..16 {
            let operator = operator(multiple, 0, 0, 0);

            for octave in 0..8 {
                let mut single = OperatorState::default();
                let mut double = OperatorState::default();
                operator.update(&mut single, false, 0x123, octave, 0, None);
                operator.update(&mut double, false, 0x246, octave, 0, None);

                assert_eq!(double.raw_phase(), single.raw_phase().wrapping_mul(2));
                assert_eq!(single.raw_phase(), (MULTIPLIERS[multiple as usize] * 0x123) << octave);
            }
        }
    }

    #[test]
    fn waveform_quadrant_masks() {
        let expected = [
            (Waveform::Sine, [0, 256, 512, 768]),
            (Waveform::HalfSine, [0, 256, 0, 0]),
            (Waveform::AbsSine, [0, 256, 0, 256]),
            (Waveform::PulseSine, [0, 0, 0, 0]),
        ];

        for (waveform, folded) in expected {
            for (quadrant, expected_phase) in folded.into_iter().enumerate() {
                let phase = 256 * quadrant as i32;
                assert_eq!(fold_phase(waveform, phase), expected_phase, "{waveform:?} {phase}");
            }
        }

        // Pulse sine repeats the first quarter in quadrant 2, and is locked to 0 in 1 and 3
        assert_eq!(fold_phase(Waveform::PulseSine, 0x2A5), 0xA5);
        assert_eq!(fold_phase(Waveform::PulseSine, 0x1A5), 0);
        assert_eq!(fold_phase(Waveform::PulseSine, 0x3A5), 0);
        // Abs sine folds the negative half onto the positive half
        assert_eq!(fold_phase(Waveform::AbsSine, 0x3A5), 0x1A5);
        // Half sine keeps the positive half intact
        assert_eq!(fold_phase(Waveform::HalfSine, 0x1A5), 0x1A5);
        assert_eq!(fold_phase(Waveform::HalfSine, 0x2A5), 0);
    }

    #[test]
    fn output_combination_laws() {
        let operator = operator(0x00, 0x00, 0x00, 0x25);
        let zero_phase = tables::negative_log_sin(0).attenuation;

        let mut state = OperatorState::default();
        operator.update(&mut state, false, 0, 0, 0, None);
        assert_eq!(state.output().attenuation, zero_phase + (511 << 3) + (0x25 << 5));

        let overrides = OperatorOverrides { attenuation: 9, use_sustain_level: false };
        let mut state = OperatorState::default();
        operator.update(&mut state, false, 0, 0, 0, Some(&overrides));
        assert_eq!(state.output().attenuation, zero_phase + 511 + (9 << 4));

        // Fully attenuated envelopes are silent regardless of the combination law
        assert_eq!(state.level(), 0);
    }

    #[test]
    fn audibility() {
        let quiet = operator(0x00, 0xF0, 0x0F, MAX_STATIC_ATTENUATION);
        let mut state = OperatorState::default();
        assert!(!quiet.is_audible(&state, None));

        tick(&quiet, &mut state, true);
        assert!(quiet.is_audible(&state, None));

        // Released with maximum static attenuation
        tick(&quiet, &mut state, false);
        assert!(!quiet.is_audible(&state, None));

        // Overrides replace the static attenuation in the test
        let overrides = OperatorOverrides { attenuation: 3, use_sustain_level: false };
        assert!(quiet.is_audible(&state, Some(&overrides)));
    }
}
