//! Log-sin and exponential lookup tables shared by every operator
//!
//! Operators work in the log domain: a waveform magnitude and an envelope attenuation are
//! combined by addition, and only the final sum is converted back to a linear level.

use bincode::{Decode, Encode};
use opl_common::num::GetBit;
use std::array;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum Sign {
    #[default]
    Positive,
    Negative,
}

/// An attenuation in 4.8 fixed-point log2 units, plus the sign to apply after conversion back to
/// a linear level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct LogSign {
    pub attenuation: u16,
    pub sign: Sign,
}

impl LogSign {
    /// Signed linear level for this attenuation; magnitude is at most 4090
    #[must_use]
    pub fn level(self) -> i32 {
        let magnitude = i32::from(power_two(self.attenuation));
        match self.sign {
            Sign::Positive => magnitude,
            Sign::Negative => -magnitude,
        }
    }
}

// log-sin[i] = -log2(sin((i + 0.5) / 256 * PI/2)) * 256
// Output range is 0..=2137
static LOG_SIN_TABLE: LazyLock<[u16; 256]> = LazyLock::new(|| {
    array::from_fn(|i| {
        let sine = ((i as f64 + 0.5) / 256.0 * std::f64::consts::PI / 2.0).sin();
        (-sine.log2() * 256.0).round() as u16
    })
});

// 2^((255 - i) / 256), scaled to 10 bits with the implicit leading 1 removed
static EXP_TABLE: LazyLock<[u16; 256]> = LazyLock::new(|| {
    array::from_fn(|i| (2.0_f64.powf((255 - i) as f64 / 256.0) * 1024.0).round() as u16 - 1024)
});

/// Look up the negative log-sine of a 10-bit phase.
///
/// Bit 8 mirrors the quarter-wave table, bit 9 selects the sign; higher bits are ignored.
#[must_use]
pub fn negative_log_sin(phase: i32) -> LogSign {
    let phase = (phase & 0x3FF) as usize;
    let quarter_index = if phase.bit(8) { 0xFF - (phase & 0xFF) } else { phase & 0xFF };
    let sign = if phase.bit(9) { Sign::Negative } else { Sign::Positive };

    LogSign { attenuation: LOG_SIN_TABLE[quarter_index], sign }
}

/// Convert a log2-domain attenuation back to an unsigned linear magnitude in 0..=4090.
#[must_use]
pub fn power_two(attenuation: u16) -> u16 {
    let [fraction, integer] = attenuation.to_le_bytes();
    if integer >= 16 {
        return 0;
    }

    ((EXP_TABLE[fraction as usize] + 1024) << 1) >> integer
}
