use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Arithmetic capabilities a blueprint body may use.
///
/// A body is written once against this trait and executed with two scalar types: `f64` for
/// plain evaluation and [`Traced`](crate::ad::Traced) for recording the computational
/// graph. There are deliberately no comparison operators, so a body cannot branch on the
/// value of a traced scalar.
///
/// Binary operators accept another scalar or an `f64` on the right-hand side, e.g.
/// `x.clone() * 2.0`.
pub trait Scalar:
    Clone
    + Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
{
    /// Lifts a constant into the scalar type.
    fn from_f64(value: f64) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }

    fn sin(&self) -> Self;
    fn cos(&self) -> Self;
    fn exp(&self) -> Self;
    /// Natural logarithm
    fn ln(&self) -> Self;
    fn sqrt(&self) -> Self;
    fn abs(&self) -> Self;
    /// Integer power
    fn powi(&self, exponent: i32) -> Self;
    /// Power with a constant floating point exponent
    fn powf(&self, exponent: f64) -> Self;

    fn tan(&self) -> Self {
        self.sin() / self.cos()
    }
}

impl Scalar for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }

    fn sin(&self) -> Self {
        f64::sin(*self)
    }

    fn cos(&self) -> Self {
        f64::cos(*self)
    }

    fn exp(&self) -> Self {
        f64::exp(*self)
    }

    fn ln(&self) -> Self {
        f64::ln(*self)
    }

    fn sqrt(&self) -> Self {
        f64::sqrt(*self)
    }

    fn abs(&self) -> Self {
        f64::abs(*self)
    }

    fn powi(&self, exponent: i32) -> Self {
        f64::powi(*self, exponent)
    }

    fn powf(&self, exponent: f64) -> Self {
        f64::powf(*self, exponent)
    }

    fn tan(&self) -> Self {
        f64::tan(*self)
    }
}

/// Sum of all entries; zero for an empty slice.
pub fn sum<S: Scalar>(values: &[S]) -> S {
    values
        .iter()
        .cloned()
        .reduce(|acc, v| acc + v)
        .unwrap_or_else(S::zero)
}

/// Dot product of two equally long slices.
///
/// # Panics
/// Panics if the slices differ in length.
pub fn dot<S: Scalar>(a: &[S], b: &[S]) -> S {
    assert_eq!(a.len(), b.len(), "dot product of slices with different lengths");
    a.iter()
        .zip(b)
        .map(|(x, y)| x.clone() * y.clone())
        .reduce(|acc, v| acc + v)
        .unwrap_or_else(S::zero)
}

/// Squared Euclidean norm.
pub fn squared_norm<S: Scalar>(values: &[S]) -> S {
    dot(values, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polynomial<S: Scalar>(x: S) -> S {
        x.clone() * x.clone() * 3.0 - x + 1.0
    }

    #[test]
    fn test_f64_scalar() {
        assert_eq!(polynomial(2.0_f64), 11.0);
        assert_eq!(<f64 as Scalar>::powi(&2.0, 3), 8.0);
        assert_eq!(<f64 as Scalar>::zero(), 0.0);
        assert_eq!(<f64 as Scalar>::one(), 1.0);
    }

    #[test]
    fn test_helpers() {
        assert_eq!(sum::<f64>(&[]), 0.0);
        assert_eq!(sum(&[1.0, 2.0, 3.0]), 6.0);
        assert_eq!(dot(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
        assert_eq!(squared_norm(&[1.0, 2.0, 2.0]), 9.0);
    }
}
