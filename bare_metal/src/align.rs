/// Rounding of addresses and sizes to power-of-two boundaries.
///
/// An alignment of zero means "no alignment" and leaves the value untouched.
pub trait Alignable: Sized {
    type Alignment;

    /// The smallest multiple of `alignment` that is not below `self`.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two, or if the result does not fit the type.
    fn align_up(self, alignment: Self::Alignment) -> Self;

    /// The largest multiple of `alignment` that is not above `self`.
    fn align_down(self, alignment: Self::Alignment) -> Self;

    fn is_aligned(self, alignment: Self::Alignment) -> bool;
}

macro_rules! align_impl {
    ($numtype:ty) => {
        impl Alignable for $numtype {
            type Alignment = $numtype;

            fn align_up(self, alignment: $numtype) -> $numtype {
                match low_bits(alignment) {
                    Some(mask) => (self + mask) & !mask,
                    None => self,
                }
            }

            fn align_down(self, alignment: $numtype) -> $numtype {
                match low_bits(alignment) {
                    Some(mask) => self & !mask,
                    None => self,
                }
            }

            fn is_aligned(self, alignment: $numtype) -> bool {
                match low_bits(alignment) {
                    Some(mask) => self & mask == 0,
                    None => true,
                }
            }
        }

        impl LowBits for $numtype {
            fn low_bits(self) -> Option<$numtype> {
                if self == 0 {
                    return None;
                }
                assert!(self.is_power_of_two(), "alignment must be power of two, got {:#x}", self);
                Some(self - 1)
            }
        }
    };
}

/// Mask of the bits below a power-of-two alignment, `None` for alignment zero.
trait LowBits: Sized {
    fn low_bits(self) -> Option<Self>;
}

fn low_bits<T: LowBits>(alignment: T) -> Option<T> {
    alignment.low_bits()
}

align_impl!(usize);
align_impl!(u64);
align_impl!(u32);
