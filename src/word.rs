//! Storage-word abstraction for the packed codec.
//!
//! The codec is generic over the machine word holding packed symbols
//! (both the k-mer storage word and the input-stream word), so the same
//! shift/mask arithmetic serves u8 through u64.

use num_traits::{PrimInt, Unsigned};

pub trait Word:
    PrimInt + Unsigned + Default + Send + Sync + std::fmt::Debug + 'static
{
    const BITS: u32;

    /// Truncating conversion from the low bits of a u64.
    fn from_u64(v: u64) -> Self;

    fn to_u64(self) -> u64;

    /// A mask covering the low `bits` bits (saturating at the word width).
    #[inline]
    fn low_mask(bits: u32) -> Self {
        if bits >= Self::BITS {
            Self::max_value()
        } else {
            (Self::one() << bits as usize) - Self::one()
        }
    }
}

macro_rules! impl_word {
    ($($t:ty),*) => {
        $(
            impl Word for $t {
                const BITS: u32 = <$t>::BITS;

                #[inline]
                fn from_u64(v: u64) -> Self {
                    v as $t
                }

                #[inline]
                fn to_u64(self) -> u64 {
                    self as u64
                }
            }
        )*
    };
}

impl_word!(u8, u16, u32, u64);

/// u64-domain variant of [`Word::low_mask`] for cross-word extraction.
#[inline]
pub fn low_mask_u64(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}
