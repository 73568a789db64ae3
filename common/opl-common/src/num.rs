//! Bit-level helpers for decoding chip register bytes

use std::ops::RangeInclusive;

pub trait GetBit {
    #[must_use]
    fn bit(self, i: u8) -> bool;

    /// Extract an inclusive bit range, shifted down to bit 0.
    #[must_use]
    fn bits(self, range: RangeInclusive<u8>) -> Self;
}

macro_rules! impl_get_bit {
    ($($t:ty),* $(,)?) => {
        $(
            impl GetBit for $t {
                #[inline]
                fn bit(self, i: u8) -> bool {
                    debug_assert!(u32::from(i) < <$t>::BITS);
                    self & (1 << i) != 0
                }

                #[inline]
                fn bits(self, range: RangeInclusive<u8>) -> Self {
                    let start = *range.start();
                    let end = *range.end();
                    debug_assert!(start <= end && u32::from(end) < <$t>::BITS);

                    let width = end - start + 1;
                    if u32::from(width) == <$t>::BITS {
                        return self;
                    }
                    (self >> start) & ((1 << width) - 1)
                }
            }
        )*
    };
}

impl_get_bit!(u8, u16, u32, usize, i32);

/// Byte-wise access to 16-bit registers that are written one half at a time, such as the
/// F-number registers split across two addresses.
pub trait U16Ext {
    fn lsb(self) -> u8;

    fn msb(self) -> u8;

    fn set_lsb(&mut self, value: u8);

    fn set_msb(&mut self, value: u8);
}

impl U16Ext for u16 {
    #[inline(always)]
    fn lsb(self) -> u8 {
        self as u8
    }

    #[inline(always)]
    fn msb(self) -> u8 {
        (self >> 8) as u8
    }

    #[inline(always)]
    fn set_lsb(&mut self, value: u8) {
        *self = (*self & 0xFF00) | u16::from(value);
    }

    #[inline(always)]
    fn set_msb(&mut self, value: u8) {
        *self = (*self & 0x00FF) | (u16::from(value) << 8);
    }
}
