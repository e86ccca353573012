/// Matrices returned by [`Function::jacobian`](crate::Function::jacobian) and
/// [`Function::hessian`](crate::Function::hessian).
///
/// Compiled derivatives are row-major: element `(i, j)` of an `m × n` result is at
/// index `i * n + j` of the flat buffer. Implementations copy out of that buffer, so the
/// storage order of the target type does not matter.
///
/// # Examples
///
/// ```rust
/// use autodiff_jit::prelude::Matrix;
///
/// let m: Vec<Vec<f64>> = Matrix::from_row_major(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
/// assert_eq!(m.dims(), (2, 3));
/// assert_eq!(m.get(1, 0), 4.0);
/// ```
pub trait Matrix: Sized {
    /// Builds a `rows × cols` matrix from `data` in row-major order.
    ///
    /// # Panics
    /// If `data.len() != rows * cols`.
    fn from_row_major(rows: usize, cols: usize, data: &[f64]) -> Self;

    /// `(rows, columns)`.
    fn dims(&self) -> (usize, usize);

    /// Element in row `row` and column `col`.
    fn get(&self, row: usize, col: usize) -> f64;
}

impl Matrix for Vec<Vec<f64>> {
    fn from_row_major(rows: usize, cols: usize, data: &[f64]) -> Self {
        assert_eq!(data.len(), rows * cols);
        if cols == 0 {
            return vec![Vec::new(); rows];
        }
        data.chunks(cols).map(<[f64]>::to_vec).collect()
    }

    fn dims(&self) -> (usize, usize) {
        (self.len(), self.first().map_or(0, Vec::len))
    }

    fn get(&self, row: usize, col: usize) -> f64 {
        self[row][col]
    }
}

#[cfg(feature = "nalgebra")]
impl Matrix for nalgebra::DMatrix<f64> {
    fn from_row_major(rows: usize, cols: usize, data: &[f64]) -> Self {
        nalgebra::DMatrix::from_row_slice(rows, cols, data)
    }

    fn dims(&self) -> (usize, usize) {
        (self.nrows(), self.ncols())
    }

    fn get(&self, row: usize, col: usize) -> f64 {
        self[(row, col)]
    }
}

#[cfg(feature = "ndarray")]
impl Matrix for ndarray::Array2<f64> {
    fn from_row_major(rows: usize, cols: usize, data: &[f64]) -> Self {
        assert_eq!(data.len(), rows * cols);
        ndarray::Array2::from_shape_fn((rows, cols), |(i, j)| data[i * cols + j])
    }

    fn dims(&self) -> (usize, usize) {
        (self.nrows(), self.ncols())
    }

    fn get(&self, row: usize, col: usize) -> f64 {
        self[[row, col]]
    }
}
