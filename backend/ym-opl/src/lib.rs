//! Yamaha OPL2 (YM3812) and OPLL (YM2413 / VRC7) FM synthesis sound chips
//!
//! Both chips share the same operator model: a phase generator feeding a log-sin lookup, and an
//! ADSR envelope generator whose attenuation is added to the waveform in the log domain before
//! converting back to a linear level. They differ in register layout, instrument storage and in
//! how channel outputs are combined.
//!
//! Register writes go through a [`RegisterPort`], which may live on a different thread than the
//! chip. Audio-affecting writes are queued and applied at the start of the next
//! [`FmChip::render`] call.

pub mod channel;
pub mod operator;
pub mod opl2;
pub mod opll;
pub mod port;
pub mod rhythm;
pub mod tables;

pub use channel::{FeedbackFn, FeedbackInput, no_feedback};
pub use opl2::{Opl2, Opl2State};
pub use opll::{Opll, OpllState};
pub use port::{DEFAULT_OUTPUT_RANGE, RegisterPort, RegisterWrite};

pub trait FmChip {
    /// Even addresses select a register, odd addresses write to the selected register. Never
    /// fails; writes to unknown registers are ignored.
    fn write(&mut self, address: u16, value: u8);

    /// Status registers are not emulated; always returns a fixed placeholder.
    fn read(&self, address: u16) -> u8;

    /// Apply all queued register writes, then fill `output` with mono samples.
    fn render(&mut self, output: &mut [i16]);

    /// Every rendered sample is `level * range >> 12`; defaults to [`DEFAULT_OUTPUT_RANGE`].
    fn set_output_scale(&self, range: i16);

    /// Broadphase silence test. `false` does not imply that output is non-zero.
    fn is_silent(&self) -> bool;
}

pub(crate) fn scale_sample(level: i32, range: i16) -> i16 {
    let scaled = (i64::from(level) * i64::from(range)) >> 12;
    scaled.clamp(i16::MIN.into(), i16::MAX.into()) as i16
}
