//! Splitting a flat input into its variable and parameter segments.
//!
//! Every compiled function takes one flat input vector laid out as
//! `[variables..., parameters...]`. Bodies use [`decompose`] to get the two halves back and
//! callers use [`compose`] to build the flat vector.
//!
//! # Example
//!
//! ```
//! use autodiff_jit::split::{compose, decompose};
//!
//! let xp = compose(&[1.0, 2.0, 3.0], &[0.5]);
//! let (x, p) = decompose(&xp, 3);
//! assert_eq!(x, &[1.0, 2.0, 3.0]);
//! assert_eq!(p, &[0.5]);
//! ```

use crate::errors::FunctionError;

/// Splits `input` into `(variables, parameters)` where the first `variable_size` entries are
/// the variables.
///
/// # Panics
/// Panics if `variable_size > input.len()`. Inside a blueprint body the panic is caught
/// and reported as a tracing error.
pub fn decompose<T>(input: &[T], variable_size: usize) -> (&[T], &[T]) {
    input.split_at(variable_size)
}

/// Fallible variant of [`decompose`] that also checks the parameter segment length.
pub fn try_decompose<T>(
    input: &[T],
    variable_size: usize,
    parameter_size: usize,
) -> Result<(&[T], &[T]), FunctionError> {
    let expected = variable_size + parameter_size;
    if input.len() != expected {
        return Err(FunctionError::DimensionMismatch {
            expected,
            got: input.len(),
        });
    }
    Ok(input.split_at(variable_size))
}

/// Concatenates variables and parameters into one flat input.
pub fn compose<T: Clone>(variables: &[T], parameters: &[T]) -> Vec<T> {
    let mut flat = Vec::with_capacity(variables.len() + parameters.len());
    flat.extend_from_slice(variables);
    flat.extend_from_slice(parameters);
    flat
}
