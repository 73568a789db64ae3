//! Yamaha YM2413 (OPLL) and the Konami VRC7 derivative
//!
//! The OPLL has no per-operator registers. Instead each channel selects one of 15 fixed
//! instruments or the single custom instrument, so operator configurations are stored once per
//! instrument and shared by every channel playing it:
//!
//! | Operators | Instrument                            |
//! |-----------|---------------------------------------|
//! | 0-1       | custom instrument (registers $00-$07) |
//! | 2-31      | fixed instruments 1-15                |
//! | 32-33     | bass drum                             |
//! | 34-35     | high-hat, snare drum                  |
//! | 36-37     | tom-tom, top cymbal                   |
//!
//! Rather than mixing, the chip time-division-multiplexes its output: each update cycle exposes
//! 18 output slots in turn, one voice per slot.

mod patches;

use crate::channel::{Channel, FeedbackFn, no_feedback};
use crate::operator::{Operator, OperatorOverrides};
use crate::port::{self, CommandQueue, Personality, RegisterPort};
use crate::rhythm::{self, NoiseGenerator, RhythmControl, RhythmOperators, RhythmOverrides};
use crate::{FmChip, scale_sample};
use bincode::{Decode, Encode};
use opl_common::num::GetBit;
use opl_config::OpllConfig;
use std::array;

pub use patches::{FixedPatches, RHYTHM_PATCHES, fixed_patches};

const OPERATORS: usize = 38;
const CHANNELS: usize = 9;
const RHYTHM_CHANNEL_START: usize = 6;
const FIRST_RHYTHM_INSTRUMENT: usize = 16;

const OUTPUT_SLOTS: usize = 18;
// Input clocks per update cycle, and per output slot
const CLOCKS_PER_UPDATE: usize = 72;
const CLOCKS_PER_SLOT: usize = 4;

// Output slots for melodic channels 0-5, which are the same in both modes
const MELODIC_SLOTS: [usize; RHYTHM_CHANNEL_START] = [3, 4, 5, 9, 10, 11];
const SILENT_SLOTS: [usize; 2] = [8, 12];

fn load_patch(operators: &mut [Operator; OPERATORS], instrument: usize, patch: &[u8; 8]) {
    let modulator = &mut operators[2 * instrument];
    modulator.set_mode(patch[0]);
    modulator.set_scaling_output(patch[2]);
    // Only sine and half-sine are available
    modulator.set_waveform((patch[3] >> 3) & 1);
    modulator.set_attack_decay(patch[4]);
    modulator.set_sustain_release(patch[6]);

    // Byte 3 bits 0-2 (modulator feedback) and bits 6-7 (carrier key scale level) are not
    // emulated
    let carrier = &mut operators[2 * instrument + 1];
    carrier.set_mode(patch[1]);
    carrier.set_waveform((patch[3] >> 4) & 1);
    carrier.set_attack_decay(patch[5]);
    carrier.set_sustain_release(patch[7]);
}

fn rhythm_operators(operators: &[Operator; OPERATORS]) -> RhythmOperators<'_> {
    RhythmOperators {
        bass_drum_modulator: &operators[32],
        bass_drum_carrier: &operators[33],
        high_hat: &operators[34],
        snare_drum: &operators[35],
        tom_tom: &operators[36],
        top_cymbal: &operators[37],
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct OpllState {
    operators: [Operator; OPERATORS],
    channels: [Channel; CHANNELS],
    instruments: [u8; CHANNELS],
    overrides: [OperatorOverrides; CHANNELS],
    rhythm_overrides: RhythmOverrides,
    rhythm_control: RhythmControl,
    noise: NoiseGenerator,
    custom_instrument: [u8; 8],
    output_levels: [i16; OUTPUT_SLOTS],
    audio_offset: usize,
}

impl OpllState {
    fn new(config: OpllConfig) -> Self {
        let mut operators = array::from_fn(|_| Operator::default());
        for (i, patch) in fixed_patches(config.variant).iter().enumerate() {
            load_patch(&mut operators, i + 1, patch);
        }
        for (i, patch) in RHYTHM_PATCHES.iter().enumerate() {
            load_patch(&mut operators, FIRST_RHYTHM_INSTRUMENT + i, patch);
        }

        Self {
            operators,
            channels: array::from_fn(|_| Channel::default()),
            instruments: [0; CHANNELS],
            overrides: [OperatorOverrides::default(); CHANNELS],
            rhythm_overrides: RhythmOverrides::default(),
            rhythm_control: RhythmControl::default(),
            noise: NoiseGenerator::default(),
            custom_instrument: [0; 8],
            output_levels: [0; OUTPUT_SLOTS],
            audio_offset: 0,
        }
    }

    #[must_use]
    pub fn operator(&self, index: usize) -> &Operator {
        &self.operators[index]
    }

    #[must_use]
    pub fn channel(&self, index: usize) -> &Channel {
        &self.channels[index]
    }

    #[must_use]
    pub fn instrument(&self, channel: usize) -> u8 {
        self.instruments[channel]
    }

    #[must_use]
    pub fn overrides(&self, channel: usize) -> OperatorOverrides {
        self.overrides[channel]
    }

    #[must_use]
    pub fn rhythm_overrides(&self) -> RhythmOverrides {
        self.rhythm_overrides
    }

    #[must_use]
    pub fn rhythm_control(&self) -> RhythmControl {
        self.rhythm_control
    }

    #[must_use]
    pub fn noise(&self) -> NoiseGenerator {
        self.noise
    }

    #[must_use]
    pub fn audio_offset(&self) -> usize {
        self.audio_offset
    }

    fn write_register(&mut self, register: u8, value: u8) {
        match register {
            0x00..=0x07 => {
                self.custom_instrument[usize::from(register)] = value;
                load_patch(&mut self.operators, 0, &self.custom_instrument);
            }
            0x0E => {
                self.rhythm_control = RhythmControl::from_register(value & 0x3F);

                log::trace!("Rhythm control: {:?}", self.rhythm_control);
            }
            0x10..=0x18 => {
                self.channels[usize::from(register & 0x0F)].set_frequency_low(value);
            }
            0x20..=0x28 => {
                let channel = usize::from(register & 0x0F);
                self.channels[channel].set_9bit_frequency_octave_key_on(value);
                self.overrides[channel].use_sustain_level = value.bit(5);
            }
            0x30..=0x38 => {
                let channel = usize::from(register & 0x0F);
                let instrument = value >> 4;
                let volume = value & 0x0F;
                self.instruments[channel] = instrument;
                self.overrides[channel].attenuation = volume;

                // Rhythm volumes share the instrument/volume registers of channels 6-8
                match channel {
                    6 => self.rhythm_overrides.bass_drum.attenuation = volume,
                    7 => {
                        self.rhythm_overrides.high_hat.attenuation = instrument;
                        self.rhythm_overrides.snare_drum.attenuation = volume;
                    }
                    8 => {
                        self.rhythm_overrides.tom_tom.attenuation = instrument;
                        self.rhythm_overrides.top_cymbal.attenuation = volume;
                    }
                    _ => {}
                }

                log::trace!("Channel {channel}: instrument {instrument}, volume {volume}");
            }
            _ => {
                log::debug!("Unexpected OPLL register write: {register:02X} {value:02X}");
            }
        }
    }

    fn update_all_channels(&mut self, feedback: FeedbackFn, range: i16) {
        let rhythm_enabled = self.rhythm_control.enabled;
        let melodic_channels = if rhythm_enabled { RHYTHM_CHANNEL_START } else { CHANNELS };

        for ((channel, &instrument), overrides) in self.channels[..melodic_channels]
            .iter_mut()
            .zip(&self.instruments)
            .zip(&self.overrides)
        {
            let instrument = usize::from(instrument);
            channel.update_melodic(
                &self.operators[2 * instrument],
                &self.operators[2 * instrument + 1],
                Some(overrides),
                feedback,
            );
            self.noise.clock();
        }

        let levels = &mut self.output_levels;
        for &slot in &SILENT_SLOTS {
            levels[slot] = 0;
        }
        for (&slot, channel) in MELODIC_SLOTS.iter().zip(&self.channels) {
            levels[slot] = scale_sample(channel.melodic_output(), range);
        }

        if rhythm_enabled {
            let operators = rhythm_operators(&self.operators);
            let [.., bass_drum, high_hat_snare, tom_tom_cymbal] = &mut self.channels;
            rhythm::update(
                [bass_drum, high_hat_snare, tom_tom_cymbal],
                operators,
                Some(&self.rhythm_overrides),
                self.rhythm_control,
                self.noise.output(),
                feedback,
            );

            let [.., bass_drum, high_hat_snare, tom_tom_cymbal] = &self.channels;
            let rhythm_levels = rhythm::levels([bass_drum, high_hat_snare, tom_tom_cymbal]);

            // Each percussion voice is output twice per cycle
            for (slots, level) in [
                ([2, 15], rhythm_levels.bass_drum),
                ([6, 16], rhythm_levels.snare_drum),
                ([1, 14], rhythm_levels.tom_tom),
                ([7, 17], rhythm_levels.top_cymbal),
                ([0, 13], rhythm_levels.high_hat),
            ] {
                let level = scale_sample(level, range);
                for slot in slots {
                    levels[slot] = level;
                }
            }
        } else {
            for slot in [0, 1, 2, 6, 7, 13, 14] {
                levels[slot] = 0;
            }
            for (slot, channel) in (15..).zip(&self.channels[RHYTHM_CHANNEL_START..]) {
                levels[slot] = scale_sample(channel.melodic_output(), range);
            }
        }
    }

    fn next_sample(&mut self, audio_divider: usize, feedback: FeedbackFn, range: i16) -> i16 {
        if self.audio_offset == 0 {
            self.update_all_channels(feedback, range);
        }

        let sample = self.output_levels[self.audio_offset * audio_divider / CLOCKS_PER_SLOT];
        self.audio_offset = (self.audio_offset + 1) % samples_per_update(audio_divider);
        sample
    }
}

fn samples_per_update(audio_divider: usize) -> usize {
    CLOCKS_PER_UPDATE / audio_divider
}

#[derive(Debug)]
pub struct Opll {
    state: OpllState,
    // Validated at construction and not part of the snapshot
    audio_divider: usize,
    port: RegisterPort,
    queue: CommandQueue,
    feedback: FeedbackFn,
}

impl Opll {
    /// # Panics
    ///
    /// Panics if the config's audio divider is 0 or larger than
    /// [`MAX_OPLL_AUDIO_DIVIDER`](opl_config::MAX_OPLL_AUDIO_DIVIDER).
    #[must_use]
    pub fn new(config: OpllConfig) -> Self {
        Self::with_feedback(config, no_feedback)
    }

    /// # Panics
    ///
    /// Panics if the config's audio divider is 0 or larger than
    /// [`MAX_OPLL_AUDIO_DIVIDER`](opl_config::MAX_OPLL_AUDIO_DIVIDER).
    #[must_use]
    pub fn with_feedback(config: OpllConfig, feedback: FeedbackFn) -> Self {
        // The output slot mapping assumes at least one sample per slot
        if let Err(err) = config.validate() {
            panic!("Invalid OPLL config: {err}");
        }

        log::debug!(
            "Creating {} with audio divider {}",
            config.variant,
            config.audio_divider
        );

        let (port, queue) = port::new_queue(Personality::Opll);
        Self {
            state: OpllState::new(config),
            audio_divider: config.audio_divider.into(),
            port,
            queue,
            feedback,
        }
    }

    #[must_use]
    pub fn port(&self) -> RegisterPort {
        self.port.clone()
    }

    #[must_use]
    pub fn state(&self) -> &OpllState {
        &self.state
    }

    /// The audio divider is kept from this chip's config. A snapshot taken mid-cycle under a
    /// smaller divider restarts the output cycle on the next sample.
    pub fn restore_state(&mut self, mut state: OpllState) {
        if state.audio_offset >= samples_per_update(self.audio_divider) {
            log::debug!(
                "Restored OPLL audio offset {} is past the end of the cycle, restarting",
                state.audio_offset
            );
            state.audio_offset = 0;
        }
        self.state = state;
    }

    fn apply_pending_writes(&mut self) {
        let Self { state, queue, .. } = self;
        queue.drain(|write| state.write_register(write.register, write.value));
    }
}

impl FmChip for Opll {
    fn write(&mut self, address: u16, value: u8) {
        self.port.write(address, value);
    }

    fn read(&self, address: u16) -> u8 {
        self.port.read(address)
    }

    fn render(&mut self, output: &mut [i16]) {
        self.apply_pending_writes();

        let range = self.queue.shared().output_range();
        for sample in output {
            *sample = self.state.next_sample(self.audio_divider, self.feedback, range);
        }
    }

    fn set_output_scale(&self, range: i16) {
        self.port.set_output_scale(range);
    }

    // TODO: check channel and rhythm audibility the way the OPL2 does; needs the channel's
    // instrument operators to be looked up per channel
    fn is_silent(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opl_config::OpllVariant;
    use test_log::test;

    fn new_chip(variant: OpllVariant) -> Opll {
        // Divider 4 gives exactly one sample per output slot
        Opll::new(OpllConfig { variant, audio_divider: 4 })
    }

    fn write(chip: &mut Opll, register: u8, value: u8) {
        chip.write(0, register);
        chip.write(1, value);
    }

    fn key_on(chip: &mut Opll, channel: u8, instrument: u8) {
        write(chip, 0x30 + channel, instrument << 4);
        write(chip, 0x10 + channel, 0xAB);
        write(chip, 0x20 + channel, 0x19);
    }

    fn render_cycles(chip: &mut Opll, cycles: usize) -> Vec<[i16; OUTPUT_SLOTS]> {
        let mut output = vec![0; cycles * OUTPUT_SLOTS];
        chip.render(&mut output);
        output
            .chunks_exact(OUTPUT_SLOTS)
            .map(|chunk| array::from_fn(|slot| chunk[slot]))
            .collect()
    }

    #[test]
    fn fixed_instruments_loaded() {
        let chip = new_chip(OpllVariant::Ym2413);
        // Instrument 3, byte 2 = 0x99
        assert_eq!(chip.state().operator(6).key_scale_level(), 2);
        assert_eq!(chip.state().operator(6).attenuation(), 0x19);
        // Bass drum carrier, byte 5 = 0xF8
        assert_eq!(chip.state().operator(33).attack_rate(), 60);

        let vrc7 = new_chip(OpllVariant::Vrc7);
        // VRC7 instrument 1, byte 0 = 0x03
        assert_eq!(vrc7.state().operator(2).frequency_multiple(), 3);
        assert_eq!(chip.state().operator(2).frequency_multiple(), 1);
    }

    #[test]
    fn channel_register_decoding() {
        let mut chip = new_chip(OpllVariant::Ym2413);
        write(&mut chip, 0x12, 0x34);
        write(&mut chip, 0x22, 0x3B);
        write(&mut chip, 0x32, 0x7C);
        write(&mut chip, 0x37, 0xA5);
        write(&mut chip, 0x38, 0x3E);
        write(&mut chip, 0x36, 0x92);
        chip.render(&mut []);

        let state = chip.state();
        assert_eq!(state.channel(2).period(), 0x134);
        assert_eq!(state.channel(2).octave(), 5);
        assert!(state.channel(2).key_on());
        assert!(state.overrides(2).use_sustain_level);
        assert_eq!(state.instrument(2), 7);
        assert_eq!(state.overrides(2).attenuation, 0x0C);

        let rhythm_overrides = state.rhythm_overrides();
        assert_eq!(rhythm_overrides.bass_drum.attenuation, 0x02);
        assert_eq!(rhythm_overrides.high_hat.attenuation, 0x0A);
        assert_eq!(rhythm_overrides.snare_drum.attenuation, 0x05);
        assert_eq!(rhythm_overrides.tom_tom.attenuation, 0x03);
        assert_eq!(rhythm_overrides.top_cymbal.attenuation, 0x0E);
    }

    #[test]
    fn rhythm_control_masks_upper_bits() {
        let mut chip = new_chip(OpllVariant::Ym2413);
        write(&mut chip, 0x0E, 0xDF);
        chip.render(&mut []);

        assert_eq!(chip.state().rhythm_control(), RhythmControl::from_register(0x1F));
        assert!(!chip.state().rhythm_control().enabled);
    }

    #[test]
    fn never_keyed_channels_render_silence() {
        for variant in [OpllVariant::Ym2413, OpllVariant::Vrc7] {
            let mut chip = new_chip(variant);
            for channel in 0..9 {
                write(&mut chip, 0x30 + channel, (channel + 1) << 4);
                write(&mut chip, 0x10 + channel, 0x80);
                write(&mut chip, 0x20 + channel, 0x08);
            }

            let mut output = vec![0; 10_000];
            chip.render(&mut output);
            assert!(output.iter().all(|&sample| sample == 0));
        }
    }

    #[test]
    fn custom_instrument_matches_fixed_instrument() {
        for variant in [OpllVariant::Ym2413, OpllVariant::Vrc7] {
            for instrument in 1..=15_u8 {
                let mut chip = new_chip(variant);
                let patch = fixed_patches(variant)[usize::from(instrument - 1)];
                for (register, &value) in patch.iter().enumerate() {
                    write(&mut chip, register as u8, value);
                }

                key_on(&mut chip, 0, 0);
                key_on(&mut chip, 1, instrument);

                let mut any_output = false;
                for cycle in render_cycles(&mut chip, 500) {
                    // Channels 0 and 1 are output in slots 3 and 4
                    assert_eq!(cycle[3], cycle[4], "{variant} instrument {instrument}");
                    any_output |= cycle[4] != 0;
                }
                assert!(any_output, "{variant} instrument {instrument} never sounded");
            }
        }
    }

    #[test]
    fn custom_instrument_writes_leave_fixed_instruments_unchanged() {
        let mut reference = new_chip(OpllVariant::Ym2413);
        let mut modified = new_chip(OpllVariant::Ym2413);

        for (register, value) in (0..8).zip([0xFF, 0x12, 0x3F, 0x1F, 0x00, 0xFF, 0x0F, 0xF0]) {
            write(&mut modified, register, value);
        }
        for chip in [&mut reference, &mut modified] {
            key_on(chip, 4, 3);
        }

        let reference_output = render_cycles(&mut reference, 300);
        let modified_output = render_cycles(&mut modified, 300);
        for (reference_cycle, modified_cycle) in reference_output.iter().zip(&modified_output) {
            // Channel 4 is output in slot 10
            assert_eq!(reference_cycle[10], modified_cycle[10]);
        }

        for operator in 2..OPERATORS {
            assert_eq!(reference.state().operator(operator), modified.state().operator(operator));
        }
        assert_ne!(reference.state().operator(0), modified.state().operator(0));
    }

    #[test]
    fn melodic_mode_slot_layout() {
        let mut chip = new_chip(OpllVariant::Ym2413);
        for channel in 0..9 {
            key_on(&mut chip, channel, 1 + channel);
        }

        let mut sounded = [false; OUTPUT_SLOTS];
        for cycle in render_cycles(&mut chip, 500) {
            for slot in [0, 1, 2, 6, 7, 8, 12, 13, 14] {
                assert_eq!(cycle[slot], 0, "slot {slot}");
            }
            for (slot, &sample) in cycle.iter().enumerate() {
                sounded[slot] |= sample != 0;
            }
        }

        for slot in [3, 4, 5, 9, 10, 11, 15, 16, 17] {
            assert!(sounded[slot], "slot {slot} never sounded");
        }
    }

    #[test]
    fn rhythm_mode_slot_layout() {
        let mut chip = new_chip(OpllVariant::Ym2413);
        for channel in 6..9 {
            write(&mut chip, 0x10 + channel, 0x80);
            write(&mut chip, 0x20 + channel, 0x08);
        }
        // All five drums
        write(&mut chip, 0x0E, 0x3F);

        let mut sounded = [false; OUTPUT_SLOTS];
        for cycle in render_cycles(&mut chip, 500) {
            assert_eq!(cycle[8], 0);
            assert_eq!(cycle[12], 0);
            for (first, second) in [(2, 15), (6, 16), (1, 14), (7, 17), (0, 13)] {
                assert_eq!(cycle[first], cycle[second], "slots {first} and {second}");
            }
            for (slot, &sample) in cycle.iter().enumerate() {
                sounded[slot] |= sample != 0;
            }
        }

        for slot in [0, 1, 2, 6, 7] {
            assert!(sounded[slot], "slot {slot} never sounded");
        }
    }

    #[test]
    fn leaving_rhythm_mode_silences_percussion_slots() {
        let mut chip = new_chip(OpllVariant::Ym2413);
        write(&mut chip, 0x0E, 0x3F);
        render_cycles(&mut chip, 100);

        write(&mut chip, 0x0E, 0x00);
        for cycle in render_cycles(&mut chip, 100) {
            for slot in [0, 1, 2, 6, 7, 8, 12, 13, 14] {
                assert_eq!(cycle[slot], 0, "slot {slot}");
            }
        }
    }

    #[test]
    fn audio_divider_sample_mapping() {
        for audio_divider in 1..=4 {
            let mut chip = Opll::new(OpllConfig { variant: OpllVariant::Ym2413, audio_divider });
            key_on(&mut chip, 0, 1);

            let samples_per_cycle = CLOCKS_PER_UPDATE / usize::from(audio_divider);
            let mut output = vec![0; samples_per_cycle * 200];
            chip.render(&mut output);

            let mut reference = new_chip(OpllVariant::Ym2413);
            key_on(&mut reference, 0, 1);
            let reference_output = render_cycles(&mut reference, 200);

            for (cycle, reference_cycle) in
                output.chunks_exact(samples_per_cycle).zip(&reference_output)
            {
                for (i, &sample) in cycle.iter().enumerate() {
                    let slot = i * usize::from(audio_divider) / CLOCKS_PER_SLOT;
                    assert_eq!(sample, reference_cycle[slot], "divider {audio_divider} sample {i}");
                }
            }
        }
    }

    #[test]
    fn render_continues_mid_cycle() {
        let mut split = new_chip(OpllVariant::Ym2413);
        let mut whole = new_chip(OpllVariant::Ym2413);
        for chip in [&mut split, &mut whole] {
            key_on(chip, 2, 5);
        }

        let mut whole_output = vec![0; 1000];
        whole.render(&mut whole_output);

        let mut split_output = vec![0; 1000];
        let (first, second) = split_output.split_at_mut(7);
        split.render(first);
        split.render(second);

        assert_eq!(split_output, whole_output);
    }

    #[test]
    fn restored_state_keeps_audio_divider() {
        let mut source = Opll::new(OpllConfig { variant: OpllVariant::Ym2413, audio_divider: 1 });
        key_on(&mut source, 0, 1);
        let mut output = vec![0; 50];
        source.render(&mut output);
        let snapshot = source.state().clone();
        assert_eq!(snapshot.audio_offset(), 50);

        // Same divider: the cycle position carries over
        let mut same = Opll::new(OpllConfig { variant: OpllVariant::Ym2413, audio_divider: 1 });
        same.restore_state(snapshot.clone());
        assert_eq!(same.state().audio_offset(), 50);

        // Divider 4 only has 18 samples per cycle
        let mut coarse = new_chip(OpllVariant::Ym2413);
        coarse.restore_state(snapshot);
        assert_eq!(coarse.state().audio_offset(), 0);

        let mut output = vec![0; 100];
        coarse.render(&mut output);
        assert_eq!(coarse.state().audio_offset(), 100 % 18);
    }

    #[test]
    fn noise_clocks_once_per_melodic_channel() {
        let mut chip = new_chip(OpllVariant::Ym2413);
        let mut expected = NoiseGenerator::default();

        render_cycles(&mut chip, 1);
        for _ in 0..9 {
            expected.clock();
        }
        assert_eq!(chip.state().noise(), expected);

        // Channels 6-8 are percussion in rhythm mode
        write(&mut chip, 0x0E, 0x20);
        render_cycles(&mut chip, 1);
        for _ in 0..6 {
            expected.clock();
        }
        assert_eq!(chip.state().noise(), expected);
    }

    #[test]
    fn reads_return_placeholder() {
        let chip = new_chip(OpllVariant::Vrc7);
        assert_eq!(chip.read(0), 0xFF);
        assert!(!chip.is_silent());
    }

    #[test]
    #[should_panic(expected = "Invalid OPLL config")]
    fn audio_divider_above_four_panics() {
        let _ = Opll::new(OpllConfig { variant: OpllVariant::Ym2413, audio_divider: 5 });
    }

    #[test]
    #[should_panic(expected = "Invalid OPLL config")]
    fn audio_divider_zero_panics() {
        let _ = Opll::new(OpllConfig { variant: OpllVariant::Ym2413, audio_divider: 0 });
    }
}
