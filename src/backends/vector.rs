/// Output vectors of [`Function::eval_vector`](crate::Function::eval_vector).
///
/// The compiled primal writes into [`as_mut_slice`](Vector::as_mut_slice), so
/// implementations must expose contiguous storage.
///
/// # Examples
///
/// ```rust
/// use autodiff_jit::prelude::Vector;
///
/// let mut vec: Vec<f64> = Vector::zeros(3);
/// vec.as_mut_slice()[0] = 1.0;
/// assert_eq!(Vector::as_slice(&vec), &[1.0, 0.0, 0.0]);
/// ```
pub trait Vector {
    /// The elements as a slice.
    fn as_slice(&self) -> &[f64];

    /// The elements as a mutable slice.
    fn as_mut_slice(&mut self) -> &mut [f64];

    /// A vector of `len` zeros.
    fn zeros(len: usize) -> Self;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Vector for Vec<f64> {
    fn as_slice(&self) -> &[f64] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        self
    }

    fn zeros(len: usize) -> Self {
        vec![0.0; len]
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }
}

/// `Array1` created by [`Vector::zeros`] is always contiguous; arrays built from
/// strided views are not supported and panic on access.
#[cfg(feature = "ndarray")]
impl Vector for ndarray::Array1<f64> {
    fn as_slice(&self) -> &[f64] {
        ndarray::Array1::as_slice(self).expect("Array1 must be contiguous")
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        self.as_slice_mut().expect("Array1 must be contiguous")
    }

    fn zeros(len: usize) -> Self {
        ndarray::Array1::zeros(len)
    }

    fn len(&self) -> usize {
        ndarray::Array1::len(self)
    }
}

#[cfg(feature = "nalgebra")]
impl Vector for nalgebra::DVector<f64> {
    fn as_slice(&self) -> &[f64] {
        nalgebra::DVector::as_slice(self)
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        nalgebra::DVector::as_mut_slice(self)
    }

    fn zeros(len: usize) -> Self {
        nalgebra::DVector::zeros(len)
    }

    fn len(&self) -> usize {
        nalgebra::DVector::len(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill<V: Vector>(len: usize) -> V {
        let mut v = V::zeros(len);
        for (i, x) in v.as_mut_slice().iter_mut().enumerate() {
            *x = i as f64;
        }
        v
    }

    #[test]
    fn test_vec() {
        let v: Vec<f64> = fill(3);
        assert_eq!(v, vec![0.0, 1.0, 2.0]);
        assert!(!Vector::is_empty(&v));
        assert!(Vector::is_empty(&<Vec<f64> as Vector>::zeros(0)));
    }

    #[cfg(feature = "nalgebra")]
    #[test]
    fn test_nalgebra() {
        let v: nalgebra::DVector<f64> = fill(3);
        assert_eq!(v, nalgebra::DVector::from_vec(vec![0.0, 1.0, 2.0]));
        assert_eq!(Vector::len(&v), 3);
    }

    #[cfg(feature = "ndarray")]
    #[test]
    fn test_ndarray() {
        let v: ndarray::Array1<f64> = fill(3);
        assert_eq!(v, ndarray::arr1(&[0.0, 1.0, 2.0]));
        assert_eq!(Vector::as_slice(&v), &[0.0, 1.0, 2.0]);
    }
}
