//! Element types that can live behind a remote proxy.

use std::fmt::Debug;

use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Plain-old-data value transferable as raw bytes.
///
/// Anything zerocopy can view as bytes in both directions qualifies,
/// including `#[derive(FromBytes, IntoBytes, Immutable)]` structs.
pub trait Pod: FromBytes + IntoBytes + Immutable + Copy {}

impl<T: FromBytes + IntoBytes + Immutable + Copy> Pod for T {}

/// Arithmetic used by the read-modify-write operations.
///
/// Integer operations wrap on overflow. Division by zero is rejected by
/// the caller before `div` is reached.
pub trait Numeric: Pod + PartialEq + Debug {
    const ZERO: Self;
    const ONE: Self;

    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    fn div(self, rhs: Self) -> Self;

    fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

macro_rules! impl_numeric_int {
    ($($t:ty),*) => {
        $(
            impl Numeric for $t {
                const ZERO: Self = 0;
                const ONE: Self = 1;

                #[inline]
                fn add(self, rhs: Self) -> Self {
                    self.wrapping_add(rhs)
                }
                #[inline]
                fn sub(self, rhs: Self) -> Self {
                    self.wrapping_sub(rhs)
                }
                #[inline]
                fn mul(self, rhs: Self) -> Self {
                    self.wrapping_mul(rhs)
                }
                #[inline]
                fn div(self, rhs: Self) -> Self {
                    self.wrapping_div(rhs)
                }
            }
        )*
    };
}

macro_rules! impl_numeric_float {
    ($($t:ty),*) => {
        $(
            impl Numeric for $t {
                const ZERO: Self = 0.0;
                const ONE: Self = 1.0;

                #[inline]
                fn add(self, rhs: Self) -> Self {
                    self + rhs
                }
                #[inline]
                fn sub(self, rhs: Self) -> Self {
                    self - rhs
                }
                #[inline]
                fn mul(self, rhs: Self) -> Self {
                    self * rhs
                }
                #[inline]
                fn div(self, rhs: Self) -> Self {
                    self / rhs
                }
            }
        )*
    };
}

impl_numeric_int!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);
impl_numeric_float!(f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_wrap() {
        assert_eq!(Numeric::add(i32::MAX, 1), i32::MIN);
        assert_eq!(Numeric::sub(0u8, 1), u8::MAX);
        assert_eq!(Numeric::div(i64::MIN, -1), i64::MIN);
        assert_eq!(Numeric::mul(7u16, 6), 42);
    }

    #[test]
    fn zero_detection() {
        assert!(0i32.is_zero());
        assert!((-0.0f64).is_zero());
        assert!(!f32::MIN_POSITIVE.is_zero());
    }
}
