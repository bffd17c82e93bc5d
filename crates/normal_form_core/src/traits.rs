use num_traits::{FromPrimitive, Num};
use std::fmt::Debug;
use std::ops::Neg;

/// A trait for types that can carry the free parameters of a fit.
/// `f64` for plain residual evaluation, `Dual` when differentiating.
/// Only ring operations are required so that `Complex<T>` arithmetic works.
pub trait Scalar:
    Num + Copy + FromPrimitive + From<f64> + Neg<Output = Self> + Debug + 'static
{
}

impl<T> Scalar for T where
    T: Num + Copy + FromPrimitive + From<f64> + Neg<Output = T> + Debug + 'static
{
}
