//! Numeric element types shared by grids and resamplers.
use std::fmt::Debug;

use crate::{
    ndarray::{Array2, Array4},
    num_traits::{Float, NumAssign},
    Complex,
};

/// The floating point type a grid accumulates in.
///
/// A session picks one of `f32` or `f64` once, and everything touching the
/// grid is monomorphized for it. Positions, phases and weights are always
/// computed in double precision and narrowed on deposit.
pub trait GridFloat: Float + NumAssign + Default + Debug + Send + Sync + 'static {
    /// Narrow (or pass through) a double precision value.
    fn from_double(value: f64) -> Self;
    /// Widen (or pass through) to double precision.
    fn to_double(self) -> f64;
}

impl GridFloat for f32 {
    #[inline]
    fn from_double(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn to_double(self) -> f64 {
        self as f64
    }
}

impl GridFloat for f64 {
    #[inline]
    fn from_double(value: f64) -> Self {
        value
    }

    #[inline]
    fn to_double(self) -> f64 {
        self
    }
}

/// A spatial frequency grid, `[nx, ny, pol, chan]`.
pub type Grid<F> = Array4<Complex<F>>;

/// Sum of deposited weights, `[pol, chan]`.
pub type SumWeights = Array2<f64>;

#[inline]
pub(crate) fn complex_from_f64<F: GridFloat>(value: Complex<f64>) -> Complex<F> {
    Complex::new(F::from_double(value.re), F::from_double(value.im))
}

#[inline]
pub(crate) fn complex_to_f64<F: GridFloat>(value: Complex<F>) -> Complex<f64> {
    Complex::new(value.re.to_double(), value.im.to_double())
}
