use bincode::{Decode, Encode};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// The OPLL time-division-multiplexes 18 output slots over 72 input clocks, 4 clocks per slot;
/// dividing that by more than 4 would leave slots with no output samples
pub const MAX_OPLL_AUDIO_DIVIDER: u8 = 4;

/// Which fixed instrument ROM an OPLL is built with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum OpllVariant {
    /// Standalone YM2413, as used in the Master System FM unit
    #[default]
    Ym2413,
    /// Konami VRC7 expansion audio; different patch set, no rhythm usage in practice
    Vrc7,
}

impl Display for OpllVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ym2413 => write!(f, "YM2413"),
            Self::Vrc7 => write!(f, "VRC7"),
        }
    }
}

/// Chip personality selection for frontends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ChipKind {
    #[default]
    Opl2,
    Ym2413,
    Vrc7,
}

impl ChipKind {
    #[must_use]
    pub fn opll_variant(self) -> Option<OpllVariant> {
        match self {
            Self::Opl2 => None,
            Self::Ym2413 => Some(OpllVariant::Ym2413),
            Self::Vrc7 => Some(OpllVariant::Vrc7),
        }
    }
}

impl Display for ChipKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opl2 => write!(f, "OPL2"),
            Self::Ym2413 => write!(f, "YM2413"),
            Self::Vrc7 => write!(f, "VRC7"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("OPLL audio divider must be between 1 and {MAX_OPLL_AUDIO_DIVIDER}, was {0}")]
    InvalidAudioDivider(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OpllConfig {
    pub variant: OpllVariant,
    /// Input clocks per output sample; 4 means exactly one sample per OPLL output slot
    pub audio_divider: u8,
}

impl OpllConfig {
    /// # Errors
    ///
    /// Returns an error if the audio divider is 0 or larger than [`MAX_OPLL_AUDIO_DIVIDER`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_OPLL_AUDIO_DIVIDER).contains(&self.audio_divider) {
            return Err(ConfigError::InvalidAudioDivider(self.audio_divider));
        }

        Ok(())
    }
}

impl Default for OpllConfig {
    fn default() -> Self {
        Self { variant: OpllVariant::default(), audio_divider: 1 }
    }
}
