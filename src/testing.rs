//! Self tests for compiled functions.
//!
//! [`ConsistencyTester`] checks a [`Function`] against independent oracles:
//!
//! - the primal against a caller-provided `f64` reference
//! - the Jacobian against central finite differences of the compiled primal
//! - the Hessian against central finite differences of the compiled Jacobian, and for
//!   symmetry
//! - repeated evaluation for bit-identical results, and all buffers for their shapes
//!
//! Checks return `Result<(), Failure>`; [`ConsistencyTester::run`] and
//! [`ConsistencyTester::run_random`] collect them into a [`ConsistencyReport`].

use std::fmt;

use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

use crate::artifact::EntryPoint;
use crate::errors::FunctionError;
use crate::function::Function;

/// Combined relative and absolute tolerance on the Euclidean norm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub relative: f64,
    pub absolute: f64,
}

impl Tolerance {
    /// For comparing the compiled primal with a reference evaluation.
    pub const FUNCTION: Self = Self {
        relative: 1e-9,
        absolute: 1e-12,
    };

    /// For comparing derivatives with finite differences.
    pub const DERIVATIVE: Self = Self {
        relative: 1e-5,
        absolute: 1e-6,
    };

    pub fn new(relative: f64, absolute: f64) -> Self {
        Self { relative, absolute }
    }

    /// `‖a − b‖ ≤ relative · max(‖a‖, ‖b‖) + absolute`.
    ///
    /// False if the lengths differ or any value is NaN.
    pub fn approx_eq(&self, a: &[f64], b: &[f64]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        let difference = a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt();
        let scale = norm(a).max(norm(b));
        difference.is_finite() && difference <= self.relative * scale + self.absolute
    }
}

fn norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Central finite-difference Jacobian of `f` with respect to the first `variable_size`
/// components of `input`, row-major `output_size × variable_size`.
///
/// The step for component `j` is `cbrt(ε) · max(1, |x_j|)`. Parameters are never
/// perturbed. Missing output components read as NaN.
pub fn finite_difference_jacobian(
    f: impl Fn(&[f64]) -> Vec<f64>,
    input: &[f64],
    variable_size: usize,
    output_size: usize,
) -> Vec<f64> {
    let mut jacobian = vec![0.0; output_size * variable_size];
    let mut point = input.to_vec();

    for j in 0..variable_size {
        let x = input[j];
        let h = f64::EPSILON.cbrt() * x.abs().max(1.0);
        point[j] = x + h;
        let forward = f(&point);
        point[j] = x - h;
        let backward = f(&point);
        point[j] = x;

        // the representable step, not the nominal one
        let step = (x + h) - (x - h);
        for i in 0..output_size {
            let fw = forward.get(i).copied().unwrap_or(f64::NAN);
            let bw = backward.get(i).copied().unwrap_or(f64::NAN);
            jacobian[i * variable_size + j] = (fw - bw) / step;
        }
    }
    jacobian
}

/// The kind of a self test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Check {
    Shapes,
    Determinism,
    Function,
    Jacobian,
    Hessian,
    Symmetry,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Check::Shapes => "shape",
            Check::Determinism => "determinism",
            Check::Function => "function",
            Check::Jacobian => "jacobian",
            Check::Hessian => "hessian",
            Check::Symmetry => "symmetry",
        };
        f.write_str(name)
    }
}

/// A failed self test.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{check} check failed at {input:?}: {reason}")]
pub struct Failure {
    pub check: Check,
    pub input: Vec<f64>,
    pub reason: String,
}

impl Failure {
    fn new(check: Check, input: &[f64], reason: impl Into<String>) -> Self {
        Self {
            check,
            input: input.to_vec(),
            reason: reason.into(),
        }
    }

    fn from_error(check: Check, input: &[f64], error: FunctionError) -> Self {
        Self::new(check, input, error.to_string())
    }
}

/// Outcome of a batch of self tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsistencyReport {
    /// Inputs tested
    pub samples: usize,
    /// Checks executed over all inputs
    pub checks: usize,
    pub failures: Vec<Failure>,
}

impl ConsistencyReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, result: Result<(), Failure>) {
        self.checks += 1;
        if let Err(failure) = result {
            self.failures.push(failure);
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.samples += other.samples;
        self.checks += other.checks;
        self.failures.extend(other.failures);
        self
    }
}

impl fmt::Display for ConsistencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} samples, {} checks, {} failures",
            self.samples,
            self.checks,
            self.failures.len()
        )?;
        for failure in self.failures.iter().take(5) {
            write!(f, "\n  {failure}")?;
        }
        if self.failures.len() > 5 {
            write!(f, "\n  ...")?;
        }
        Ok(())
    }
}

type Reference<'f> = Box<dyn Fn(&[f64]) -> Vec<f64> + Send + Sync + 'f>;

/// Self tests of one [`Function`].
///
/// # Example
/// ```no_run
/// use autodiff_jit::prelude::*;
///
/// struct Norm;
///
/// impl Body for Norm {
///     fn eval<S: Scalar>(&self, x: &[S]) -> Vec<S> {
///         vec![squared_norm(x)]
///     }
/// }
///
/// let blueprint = Blueprint::new(Norm, 3, 0, "norm", EnabledDerivatives::HESSIAN).unwrap();
/// let function = autodiff_jit::make(&blueprint, false).unwrap();
/// let report = ConsistencyTester::new(&function)
///     .with_reference(|x| vec![x.iter().map(|v| v * v).sum()])
///     .run_random(1024, 42);
/// assert!(report.passed(), "{report}");
/// ```
pub struct ConsistencyTester<'f> {
    function: &'f Function,
    function_tolerance: Tolerance,
    derivative_tolerance: Tolerance,
    reference: Option<Reference<'f>>,
    repetitions: usize,
}

impl<'f> ConsistencyTester<'f> {
    pub fn new(function: &'f Function) -> Self {
        Self {
            function,
            function_tolerance: Tolerance::FUNCTION,
            derivative_tolerance: Tolerance::DERIVATIVE,
            reference: None,
            repetitions: 3,
        }
    }

    /// Tolerance of the derivative checks.
    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.derivative_tolerance = tolerance;
        self
    }

    /// Tolerance of the reference check.
    pub fn with_function_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.function_tolerance = tolerance;
        self
    }

    /// Plain `f64` implementation the compiled primal is compared with.
    pub fn with_reference(
        mut self,
        reference: impl Fn(&[f64]) -> Vec<f64> + Send + Sync + 'f,
    ) -> Self {
        self.reference = Some(Box::new(reference));
        self
    }

    /// Number of evaluations compared by the determinism check.
    pub fn with_repetitions(mut self, repetitions: usize) -> Self {
        self.repetitions = repetitions.max(2);
        self
    }

    /// Checks that every buffer has the documented shape at `input`.
    ///
    /// Enabled entry points must succeed with the right lengths, disabled derivatives must
    /// report `DerivativeUnavailable`.
    pub fn check_shapes(&self, input: &[f64]) -> Result<(), Failure> {
        let f = self.function;
        if input.len() != f.input_size() {
            return Err(Failure::new(
                Check::Shapes,
                input,
                format!("expected {} inputs, got {}", f.input_size(), input.len()),
            ));
        }

        let output = f
            .eval(input)
            .map_err(|e| Failure::from_error(Check::Shapes, input, e))?;
        if output.len() != f.output_size() {
            return Err(Failure::new(
                Check::Shapes,
                input,
                format!("{} outputs instead of {}", output.len(), f.output_size()),
            ));
        }

        let enabled = f.enabled_derivatives();
        let derivatives = [
            (EntryPoint::Jacobian, enabled.has_jacobian(), f.output_size()),
            (EntryPoint::Hessian, enabled.has_hessian(), f.variable_size()),
        ];
        for (entry, available, rows) in derivatives {
            let result: Result<Vec<Vec<f64>>, _> = match entry {
                EntryPoint::Hessian => f.hessian(input),
                _ => f.jacobian(input),
            };
            match (available, result) {
                (true, Ok(matrix)) => {
                    let cols = f.variable_size();
                    if matrix.len() != rows || matrix.iter().any(|row| row.len() != cols) {
                        return Err(Failure::new(
                            Check::Shapes,
                            input,
                            format!("{entry} is not {rows} × {cols}"),
                        ));
                    }
                }
                (false, Err(FunctionError::DerivativeUnavailable(_))) => {}
                (true, Err(e)) => return Err(Failure::from_error(Check::Shapes, input, e)),
                (false, other) => {
                    return Err(Failure::new(
                        Check::Shapes,
                        input,
                        format!("disabled {entry} answered with {other:?}"),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Checks that `repetitions` evaluations of every entry point are bit-identical.
    pub fn check_determinism(&self, input: &[f64], repetitions: usize) -> Result<(), Failure> {
        let f = self.function;
        let enabled = f.enabled_derivatives();
        let mut entries: Vec<(EntryPoint, usize)> = vec![(EntryPoint::Primal, f.output_size())];
        if enabled.has_jacobian() {
            entries.push((EntryPoint::Jacobian, f.output_size() * f.variable_size()));
        }
        if enabled.has_hessian() {
            entries.push((EntryPoint::Hessian, f.variable_size() * f.variable_size()));
        }

        for (entry, len) in entries {
            let evaluate = || -> Result<Vec<u64>, Failure> {
                let mut out = vec![0.0; len];
                let result = match entry {
                    EntryPoint::Primal => f.eval_into(input, &mut out),
                    EntryPoint::Jacobian => f.jacobian_into(input, &mut out),
                    EntryPoint::Hessian => f.hessian_into(input, &mut out),
                };
                result.map_err(|e| Failure::from_error(Check::Determinism, input, e))?;
                Ok(out.iter().map(|v| v.to_bits()).collect())
            };
            let first = evaluate()?;
            for _ in 1..repetitions {
                if evaluate()? != first {
                    return Err(Failure::new(
                        Check::Determinism,
                        input,
                        format!("{entry} differs between calls"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Compares the compiled primal at `input` with `expected`.
    pub fn check_outputs(&self, input: &[f64], expected: &[f64]) -> Result<(), Failure> {
        let actual = self
            .function
            .eval(input)
            .map_err(|e| Failure::from_error(Check::Function, input, e))?;
        if !self.function_tolerance.approx_eq(&actual, expected) {
            return Err(Failure::new(
                Check::Function,
                input,
                format!("compiled {actual:?} vs reference {expected:?}"),
            ));
        }
        Ok(())
    }

    /// Compares the compiled primal with the reference at `input`.
    pub fn check_function(&self, input: &[f64]) -> Result<(), Failure> {
        let reference = self
            .reference
            .as_ref()
            .ok_or_else(|| Failure::new(Check::Function, input, "no reference function"))?;
        if input.len() != self.function.input_size() {
            self.check_shapes(input)?;
        }
        self.check_outputs(input, &reference(input))
    }

    /// Compares the compiled Jacobian with central finite differences of the primal.
    pub fn check_jacobian(&self, input: &[f64]) -> Result<(), Failure> {
        let f = self.function;
        let (m, n) = (f.output_size(), f.variable_size());
        let mut compiled = vec![0.0; m * n];
        f.jacobian_into(input, &mut compiled)
            .map_err(|e| Failure::from_error(Check::Jacobian, input, e))?;

        let numeric = finite_difference_jacobian(
            |x| f.eval(x).unwrap_or_else(|_| vec![f64::NAN; m]),
            input,
            n,
            m,
        );
        if !self.derivative_tolerance.approx_eq(&compiled, &numeric) {
            return Err(Failure::new(
                Check::Jacobian,
                input,
                format!("compiled {compiled:?} vs finite differences {numeric:?}"),
            ));
        }
        Ok(())
    }

    /// Compares the compiled Hessian with central finite differences of the compiled
    /// Jacobian, and checks that it is symmetric.
    pub fn check_hessian(&self, input: &[f64]) -> Result<(), Failure> {
        let f = self.function;
        let n = f.variable_size();
        let mut compiled = vec![0.0; n * n];
        f.hessian_into(input, &mut compiled)
            .map_err(|e| Failure::from_error(Check::Hessian, input, e))?;

        if let Some((i, j)) = (0..n)
            .tuple_combinations()
            .find(|&(i, j)| compiled[i * n + j] != compiled[j * n + i])
        {
            return Err(Failure::new(
                Check::Symmetry,
                input,
                format!(
                    "H[{i}][{j}] = {} but H[{j}][{i}] = {}",
                    compiled[i * n + j],
                    compiled[j * n + i]
                ),
            ));
        }

        let numeric = finite_difference_jacobian(
            |x| {
                let mut gradient = vec![f64::NAN; n];
                match f.jacobian_into(x, &mut gradient) {
                    Ok(()) => gradient,
                    Err(_) => vec![f64::NAN; n],
                }
            },
            input,
            n,
            n,
        );
        if !self.derivative_tolerance.approx_eq(&compiled, &numeric) {
            return Err(Failure::new(
                Check::Hessian,
                input,
                format!("compiled {compiled:?} vs finite differences {numeric:?}"),
            ));
        }
        Ok(())
    }

    /// Runs every applicable check at `input`.
    ///
    /// The other checks are skipped when the shape check fails.
    pub fn run(&self, input: &[f64]) -> ConsistencyReport {
        let enabled = self.function.enabled_derivatives();
        let mut report = ConsistencyReport {
            samples: 1,
            ..Default::default()
        };

        let shapes = self.check_shapes(input);
        let shapes_ok = shapes.is_ok();
        report.record(shapes);
        if !shapes_ok {
            return report;
        }

        report.record(self.check_determinism(input, self.repetitions));
        if self.reference.is_some() {
            report.record(self.check_function(input));
        }
        if enabled.has_jacobian() {
            report.record(self.check_jacobian(input));
        }
        if enabled.has_hessian() {
            report.record(self.check_hessian(input));
        }
        report
    }

    /// Runs every applicable check at `samples` inputs drawn uniformly from `[-1, 1]`.
    ///
    /// The inputs depend only on `seed`; the checks run in parallel and failures are
    /// reported in sample order.
    pub fn run_random(&self, samples: usize, seed: u64) -> ConsistencyReport {
        let inputs = random_inputs(self.function.input_size(), samples, seed);
        let reports: Vec<ConsistencyReport> = inputs.par_iter().map(|x| self.run(x)).collect();
        let report = reports
            .into_iter()
            .fold(ConsistencyReport::default(), ConsistencyReport::merge);

        if report.passed() {
            log::debug!("`{}`: {report}", self.function.name());
        } else {
            log::warn!("`{}`: {report}", self.function.name());
        }
        report
    }
}

/// `samples` inputs of `input_size` components drawn uniformly from `[-1, 1]`.
pub fn random_inputs(input_size: usize, samples: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..samples)
        .map(|_| (0..input_size).map(|_| rng.gen_range(-1.0..=1.0)).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::{squared_norm, Scalar};
    use crate::blueprint::{Blueprint, Body, EnabledDerivatives};
    use crate::config::FactoryConfig;
    use crate::factory::FunctionFactory;

    #[test]
    fn test_tolerance() {
        let tol = Tolerance::new(1e-6, 0.0);
        assert!(tol.approx_eq(&[1.0, 2.0], &[1.0, 2.0 + 1e-7]));
        assert!(!tol.approx_eq(&[1.0, 2.0], &[1.0, 2.1]));
        assert!(!tol.approx_eq(&[1.0], &[1.0, 0.0]));
        assert!(!tol.approx_eq(&[f64::NAN], &[f64::NAN]));
        assert!(Tolerance::new(0.0, 1e-3).approx_eq(&[0.0], &[1e-4]));
        assert!(tol.approx_eq(&[], &[]));
    }

    #[test]
    fn test_finite_differences() {
        // f(x, y; p) = [p x², x y]
        let f = |v: &[f64]| vec![v[2] * v[0] * v[0], v[0] * v[1]];
        let jacobian = finite_difference_jacobian(f, &[1.5, -2.0, 3.0], 2, 2);
        let expected = [9.0, 0.0, -2.0, 1.5];
        assert!(Tolerance::DERIVATIVE.approx_eq(&jacobian, &expected), "{jacobian:?}");
    }

    #[test]
    fn test_random_inputs_are_reproducible() {
        let a = random_inputs(3, 10, 7);
        assert_eq!(a, random_inputs(3, 10, 7));
        assert_ne!(a, random_inputs(3, 10, 8));
        assert!(a.iter().flatten().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_report() {
        let mut report = ConsistencyReport::default();
        report.record(Ok(()));
        assert!(report.passed());
        report.record(Err(Failure::new(Check::Jacobian, &[0.0], "off")));
        assert!(!report.passed());
        assert_eq!(report.checks, 2);
        assert!(report.to_string().contains("jacobian check failed"));
    }

    struct Energy;

    impl Body for Energy {
        fn eval<S: Scalar>(&self, x: &[S]) -> Vec<S> {
            vec![squared_norm(x) * 0.5 + x[0].sin() * x[1].cos()]
        }
    }

    #[test]
    fn test_run_random_on_compiled_function() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FunctionFactory::new(FactoryConfig::default().with_cache_dir(dir.path()));
        let blueprint =
            Blueprint::new(Energy, 2, 0, "energy", EnabledDerivatives::HESSIAN).unwrap();
        let function = factory.make(&blueprint, false).unwrap();

        let report = ConsistencyTester::new(&function)
            .with_reference(|x| vec![0.5 * (x[0] * x[0] + x[1] * x[1]) + x[0].sin() * x[1].cos()])
            .run_random(64, 1);
        assert!(report.passed(), "{report}");
        assert_eq!(report.samples, 64);
        // shapes, determinism, function, jacobian, hessian
        assert_eq!(report.checks, 64 * 5);

        let wrong = ConsistencyTester::new(&function)
            .with_reference(|x| vec![x[0]])
            .run(&[0.5, 0.5]);
        assert_eq!(wrong.failures.len(), 1);
        assert_eq!(wrong.failures[0].check, Check::Function);
    }
}
