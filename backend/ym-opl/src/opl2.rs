//! Yamaha YM3812 (OPL2): 9 two-operator channels over 18 directly addressed operators, with an
//! optional rhythm mode that turns channels 6-8 into five percussion voices

use crate::channel::{Channel, FeedbackFn, no_feedback};
use crate::operator::Operator;
use crate::port::{self, CommandQueue, Personality, RegisterPort};
use crate::rhythm::{self, NoiseGenerator, RhythmControl, RhythmOperators};
use crate::{FmChip, scale_sample};
use bincode::{Decode, Encode};
use opl_common::num::GetBit;
use std::array;

const OPERATORS: usize = 18;
const CHANNELS: usize = 9;
const RHYTHM_CHANNEL_START: usize = 6;

// (modulator, carrier) operator indices per channel
const CHANNEL_OPERATORS: [(usize, usize); CHANNELS] =
    [(0, 3), (1, 4), (2, 5), (6, 9), (7, 10), (8, 11), (12, 15), (13, 16), (14, 17)];

// The 18 operators are spread over 22 addresses: three groups of six, each group framed in 8 bytes
fn operator_index(register: u8) -> Option<usize> {
    let offset = register & 0x1F;
    let group = offset >> 3;
    let slot = offset & 0x07;
    (group < 3 && slot < 6).then(|| usize::from(group * 6 + slot))
}

fn rhythm_operators(operators: &[Operator; OPERATORS]) -> RhythmOperators<'_> {
    RhythmOperators {
        bass_drum_modulator: &operators[12],
        bass_drum_carrier: &operators[15],
        high_hat: &operators[13],
        snare_drum: &operators[16],
        tom_tom: &operators[14],
        top_cymbal: &operators[17],
    }
}

/// Everything the render side mutates; snapshot-friendly
#[derive(Debug, Clone, Encode, Decode)]
pub struct Opl2State {
    operators: [Operator; OPERATORS],
    channels: [Channel; CHANNELS],
    waveform_enable: bool,
    // Last value written to each $E0-$F5 register, re-applied when the waveform gate opens
    waveform_select: [u8; OPERATORS],
    rhythm_control: RhythmControl,
    // $BD bits 7 and 6; stored only, since tremolo and vibrato are not emulated
    deep_tremolo: bool,
    deep_vibrato: bool,
    csm_keyboard_split: u8,
    noise: NoiseGenerator,
}

impl Default for Opl2State {
    fn default() -> Self {
        Self {
            operators: array::from_fn(|_| Operator::default()),
            channels: array::from_fn(|_| Channel::default()),
            waveform_enable: false,
            waveform_select: [0; OPERATORS],
            rhythm_control: RhythmControl::default(),
            deep_tremolo: false,
            deep_vibrato: false,
            csm_keyboard_split: 0,
            noise: NoiseGenerator::default(),
        }
    }
}

impl Opl2State {
    #[must_use]
    pub fn operator(&self, index: usize) -> &Operator {
        &self.operators[index]
    }

    #[must_use]
    pub fn channel(&self, index: usize) -> &Channel {
        &self.channels[index]
    }

    #[must_use]
    pub fn waveform_enabled(&self) -> bool {
        self.waveform_enable
    }

    #[must_use]
    pub fn rhythm_control(&self) -> RhythmControl {
        self.rhythm_control
    }

    #[must_use]
    pub fn deep_tremolo(&self) -> bool {
        self.deep_tremolo
    }

    #[must_use]
    pub fn deep_vibrato(&self) -> bool {
        self.deep_vibrato
    }

    #[must_use]
    pub fn noise(&self) -> NoiseGenerator {
        self.noise
    }

    fn write_register(&mut self, register: u8, value: u8) {
        match register {
            0x01 => {
                self.waveform_enable = value.bit(5);
                for (operator, &waveform) in self.operators.iter_mut().zip(&self.waveform_select) {
                    operator.set_waveform(if self.waveform_enable { waveform } else { 0 });
                }

                log::trace!("Waveform select enabled: {}", self.waveform_enable);
            }
            0x08 => {
                // CSM and keyboard split are not emulated
                self.csm_keyboard_split = value;
            }
            0xBD => {
                self.deep_tremolo = value.bit(7);
                self.deep_vibrato = value.bit(6);
                self.rhythm_control = RhythmControl::from_register(value);

                log::trace!(
                    "Rhythm control: {:?}, deep tremolo: {}, deep vibrato: {}",
                    self.rhythm_control,
                    self.deep_tremolo,
                    self.deep_vibrato
                );
            }
            0x20..=0x9F | 0xE0..=0xFF => self.write_operator_register(register, value),
            0xA0..=0xA8 => {
                self.channels[usize::from(register & 0x0F)].set_frequency_low(value);
            }
            0xB0..=0xB8 => {
                self.channels[usize::from(register & 0x0F)].set_10bit_frequency_octave_key_on(value);
            }
            0xC0..=0xC8 => {
                self.channels[usize::from(register & 0x0F)].set_feedback_mode(value);
            }
            _ => {
                log::debug!("Unexpected OPL2 register write: {register:02X} {value:02X}");
            }
        }
    }

    fn write_operator_register(&mut self, register: u8, value: u8) {
        let Some(index) = operator_index(register) else {
            log::debug!("Write to unmapped OPL2 operator address: {register:02X} {value:02X}");
            return;
        };

        let operator = &mut self.operators[index];
        match register & 0xE0 {
            0x20 => operator.set_mode(value),
            0x40 => operator.set_scaling_output(value),
            0x60 => operator.set_attack_decay(value),
            0x80 => operator.set_sustain_release(value),
            0xE0 => {
                self.waveform_select[index] = value;
                if self.waveform_enable {
                    operator.set_waveform(value);
                }
            }
            _ => unreachable!("register is in $20-$9F or $E0-$FF"),
        }
    }

    fn tick(&mut self, feedback: FeedbackFn) -> i32 {
        let rhythm_enabled = self.rhythm_control.enabled;
        let melodic_channels = if rhythm_enabled { RHYTHM_CHANNEL_START } else { CHANNELS };

        let mut sum = 0;
        for (channel, &(modulator, carrier)) in
            self.channels[..melodic_channels].iter_mut().zip(&CHANNEL_OPERATORS)
        {
            channel.update_melodic(
                &self.operators[modulator],
                &self.operators[carrier],
                None,
                feedback,
            );
            sum += channel.melodic_output();
            self.noise.clock();
        }

        if rhythm_enabled {
            let operators = rhythm_operators(&self.operators);
            let [.., bass_drum, high_hat_snare, tom_tom_cymbal] = &mut self.channels;
            rhythm::update(
                [bass_drum, high_hat_snare, tom_tom_cymbal],
                operators,
                None,
                self.rhythm_control,
                self.noise.output(),
                feedback,
            );

            let [.., bass_drum, high_hat_snare, tom_tom_cymbal] = &self.channels;
            sum += rhythm::levels([bass_drum, high_hat_snare, tom_tom_cymbal]).sum();
        }

        sum
    }

    fn is_audible(&self) -> bool {
        let rhythm_enabled = self.rhythm_control.enabled;
        let melodic_channels = if rhythm_enabled { RHYTHM_CHANNEL_START } else { CHANNELS };

        let melodic_audible = self.channels[..melodic_channels]
            .iter()
            .zip(&CHANNEL_OPERATORS)
            .any(|(channel, &(_, carrier))| channel.is_audible(&self.operators[carrier], None));
        if melodic_audible {
            return true;
        }

        if rhythm_enabled {
            let [.., bass_drum, high_hat_snare, tom_tom_cymbal] = &self.channels;
            return rhythm::is_audible(
                [bass_drum, high_hat_snare, tom_tom_cymbal],
                rhythm_operators(&self.operators),
                None,
            );
        }

        false
    }
}

#[derive(Debug)]
pub struct Opl2 {
    state: Opl2State,
    port: RegisterPort,
    queue: CommandQueue,
    feedback: FeedbackFn,
}

impl Opl2 {
    #[must_use]
    pub fn new() -> Self {
        Self::with_feedback(no_feedback)
    }

    #[must_use]
    pub fn with_feedback(feedback: FeedbackFn) -> Self {
        let (port, queue) = port::new_queue(Personality::Opl2);
        Self { state: Opl2State::default(), port, queue, feedback }
    }

    /// A control-side handle that can be moved to another thread. Writes through it are applied
    /// at the start of the next [`FmChip::render`] call.
    #[must_use]
    pub fn port(&self) -> RegisterPort {
        self.port.clone()
    }

    #[must_use]
    pub fn state(&self) -> &Opl2State {
        &self.state
    }

    /// Replace the render-side state, e.g. when loading a snapshot. Queued writes are kept and
    /// will apply on top of the new state.
    pub fn restore_state(&mut self, state: Opl2State) {
        self.state = state;
    }

    fn apply_pending_writes(&mut self) {
        let Self { state, queue, .. } = self;
        queue.drain(|write| state.write_register(write.register, write.value));
    }
}

impl Default for Opl2 {
    fn default() -> Self {
        Self::new()
    }
}

impl FmChip for Opl2 {
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
            let level = self.state.tick(self.feedback);
            *sample = scale_sample(level, range);
        }
    }

    fn set_output_scale(&self, range: i16) {
        self.port.set_output_scale(range);
    }

    fn is_silent(&self) -> bool {
        !self.queue.shared().has_pending_writes() && !self.state.is_audible()
    }
}
