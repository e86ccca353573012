//! Loaded, callable functions.
//!
//! A [`Function`] is produced by [`FunctionFactory::make`](crate::FunctionFactory::make)
//! and owns the library handle of its artifact. All evaluations go through native code:
//! the primal, the Jacobian (`output_size × variable_size`) and the Hessian
//! (`variable_size × variable_size`), each available only if it was enabled in the
//! blueprint.
//!
//! The generated code is pure, so a `Function` can be shared between threads and
//! evaluated concurrently. Results are bit-identical for identical inputs.

use std::fmt;
use std::path::Path;

use colored::Colorize;
use rayon::prelude::*;

use crate::artifact::{EntryPoint, Layout, LoadedArtifact};
use crate::backends::matrix::Matrix;
use crate::backends::vector::Vector;
use crate::blueprint::{EnabledDerivatives, Fingerprint};
use crate::errors::FunctionError;
use crate::testing::ConsistencyTester;

/// A compiled function with its enabled derivatives.
pub struct Function {
    name: String,
    fingerprint: Fingerprint,
    enabled: EnabledDerivatives,
    layout: Layout,
    artifact: LoadedArtifact,
}

impl Function {
    pub(crate) fn new(
        artifact: LoadedArtifact,
        name: &str,
        fingerprint: Fingerprint,
        enabled: EnabledDerivatives,
    ) -> Self {
        Self {
            name: name.to_string(),
            fingerprint,
            enabled,
            layout: artifact.layout(),
            artifact,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn variable_size(&self) -> usize {
        self.layout.variable_size
    }

    pub fn parameter_size(&self) -> usize {
        self.layout.parameter_size
    }

    /// `variable_size + parameter_size`
    pub fn input_size(&self) -> usize {
        self.layout.input_size()
    }

    pub fn output_size(&self) -> usize {
        self.layout.output_size
    }

    pub fn enabled_derivatives(&self) -> EnabledDerivatives {
        self.enabled
    }

    /// Path of the loaded shared library.
    pub fn artifact_path(&self) -> &Path {
        self.artifact.path()
    }

    /// Evaluates the function.
    ///
    /// # Arguments
    /// * `input` - Variables followed by parameters
    ///
    /// # Returns
    /// The `output_size` output values
    ///
    /// # Errors
    /// Returns `FunctionError::DimensionMismatch` if `input` does not have `input_size`
    /// values.
    ///
    /// # Example
    /// ```no_run
    /// # use autodiff_jit::prelude::*;
    /// # struct Scale;
    /// # impl Body for Scale {
    /// #     fn eval<S: Scalar>(&self, x: &[S]) -> Vec<S> { vec![x[0].clone() * x[1].clone()] }
    /// # }
    /// let blueprint = Blueprint::new(Scale, 1, 1, "scale", EnabledDerivatives::NONE).unwrap();
    /// let function = autodiff_jit::make(&blueprint, false).unwrap();
    /// assert_eq!(function.eval(&[3.0, 2.0]).unwrap(), vec![6.0]);
    /// ```
    pub fn eval(&self, input: &[f64]) -> Result<Vec<f64>, FunctionError> {
        let mut output = vec![0.0; self.output_size()];
        self.eval_into(input, &mut output)?;
        Ok(output)
    }

    /// Evaluates the function into a caller-provided buffer of `output_size` values.
    pub fn eval_into(&self, input: &[f64], output: &mut [f64]) -> Result<(), FunctionError> {
        self.artifact.call(EntryPoint::Primal, input, output)
    }

    /// Evaluates the function into a new vector of any supported backend.
    pub fn eval_vector<V: Vector>(&self, input: &[f64]) -> Result<V, FunctionError> {
        let mut output = V::zeros(self.output_size());
        self.eval_into(input, output.as_mut_slice())?;
        Ok(output)
    }

    /// Evaluates the function for many inputs in parallel.
    ///
    /// Results are returned in input order.
    ///
    /// # Errors
    /// Returns `FunctionError::DimensionMismatch` if any input has the wrong length.
    pub fn eval_parallel(&self, input_sets: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, FunctionError> {
        let num_threads = rayon::current_num_threads();
        let chunk_size = (input_sets.len() / (num_threads * 4)).max(1);

        input_sets
            .par_chunks(chunk_size)
            .flat_map_iter(|chunk| chunk.iter().map(|input| self.eval(input)))
            .collect()
    }

    /// Jacobian of the outputs with respect to the variables.
    ///
    /// # Returns
    /// An `output_size × variable_size` matrix
    ///
    /// # Errors
    /// - `FunctionError::DerivativeUnavailable` unless JACOBIAN or HESSIAN was enabled
    /// - `FunctionError::DimensionMismatch` if `input` has the wrong length
    pub fn jacobian<M: Matrix>(&self, input: &[f64]) -> Result<M, FunctionError> {
        let (rows, cols) = (self.output_size(), self.variable_size());
        let mut flat = vec![0.0; rows * cols];
        self.jacobian_into(input, &mut flat)?;
        Ok(M::from_row_major(rows, cols, &flat))
    }

    /// Writes the Jacobian row-major into `output` (`output_size * variable_size` values).
    pub fn jacobian_into(&self, input: &[f64], output: &mut [f64]) -> Result<(), FunctionError> {
        self.artifact.call(EntryPoint::Jacobian, input, output)
    }

    /// Hessian of the scalar output with respect to the variables.
    ///
    /// The result is exactly symmetric.
    ///
    /// # Returns
    /// A `variable_size × variable_size` matrix
    ///
    /// # Errors
    /// - `FunctionError::DerivativeUnavailable` unless HESSIAN was enabled
    /// - `FunctionError::DimensionMismatch` if `input` has the wrong length
    pub fn hessian<M: Matrix>(&self, input: &[f64]) -> Result<M, FunctionError> {
        let n = self.variable_size();
        let mut flat = vec![0.0; n * n];
        self.hessian_into(input, &mut flat)?;
        Ok(M::from_row_major(n, n, &flat))
    }

    /// Writes the Hessian row-major into `output` (`variable_size²` values).
    pub fn hessian_into(&self, input: &[f64], output: &mut [f64]) -> Result<(), FunctionError> {
        self.artifact.call(EntryPoint::Hessian, input, output)
    }

    /// Compares the compiled function with `reference` at `input`.
    ///
    /// Never fails: a mismatch, a wrong input length or a reference with the wrong output
    /// length all return `false`, with the reason logged as a warning.
    pub fn test_function(&self, input: &[f64], reference: impl Fn(&[f64]) -> Vec<f64>) -> bool {
        let tester = ConsistencyTester::new(self);
        if let Err(failure) = tester.check_shapes(input) {
            return report(&self.name, Err(failure));
        }
        report(&self.name, tester.check_outputs(input, &reference(input)))
    }

    /// Compares the compiled Jacobian with central finite differences of the function at
    /// `input`. Returns `false` if they disagree or the Jacobian is unavailable.
    pub fn test_jacobian(&self, input: &[f64]) -> bool {
        report(&self.name, ConsistencyTester::new(self).check_jacobian(input))
    }

    /// Compares the compiled Hessian with central finite differences of the compiled
    /// Jacobian at `input` and checks its symmetry. Returns `false` on any failure.
    pub fn test_hessian(&self, input: &[f64]) -> bool {
        report(&self.name, ConsistencyTester::new(self).check_hessian(input))
    }
}

fn report<E: fmt::Display>(name: &str, result: Result<(), E>) -> bool {
    match result {
        Ok(()) => true,
        Err(failure) => {
            log::warn!("self test of `{name}` failed: {failure}");
            false
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint.short())
            .field("layout", &self.layout)
            .field("enabled", &self.enabled)
            .field("artifact", &self.artifact.path())
            .finish()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{{")?;
        writeln!(f, "    {}: {}", "Function".cyan(), self.name)?;
        writeln!(f, "    {}: {}", "Fingerprint".cyan(), self.fingerprint.short())?;
        writeln!(
            f,
            "    {}: {} + {} -> {}",
            "Shape".cyan(),
            self.variable_size(),
            self.parameter_size(),
            self.output_size()
        )?;
        writeln!(f, "    {}: {}", "Derivatives".cyan(), self.enabled)?;
        writeln!(f, "    {}: {}", "Artifact".cyan(), self.artifact_path().display())?;
        write!(f, "}}")
    }
}
