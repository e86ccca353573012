//! Ahead-of-time compiled functions with automatic derivatives.
//!
//! A [`Blueprint`] describes a vector function `f(x; p)` of `n` variables and `p`
//! parameters through a generic [`Body`]. A [`FunctionFactory`] traces the body once,
//! derives the requested Jacobian and Hessian by reverse-mode source transformation,
//! lowers everything to native code with [Cranelift](https://cranelift.dev), links a
//! shared library and loads it as a [`Function`]. Libraries are cached on disk and reused
//! by later processes.
//!
//! # Features
//!
//! - One body definition for primal and derivatives
//! - Persistent, fingerprinted compilation cache
//! - Self tests against finite differences with [`ConsistencyTester`]
//! - Optional `nalgebra` and `ndarray` output types
//!
//! # Example
//!
//! ```rust,no_run
//! use autodiff_jit::prelude::*;
//!
//! /// f(x; p) = [p · x0 · x1, x0 + x1]
//! struct Scaled;
//!
//! impl Body for Scaled {
//!     fn eval<S: Scalar>(&self, input: &[S]) -> Vec<S> {
//!         let (x, p) = decompose(input, 2);
//!         vec![
//!             p[0].clone() * x[0].clone() * x[1].clone(),
//!             x[0].clone() + x[1].clone(),
//!         ]
//!     }
//! }
//!
//! let blueprint = Blueprint::new(Scaled, 2, 1, "scaled", EnabledDerivatives::JACOBIAN).unwrap();
//! let function = make(&blueprint, false).unwrap();
//!
//! assert_eq!(function.eval(&[2.0, 3.0, 0.5]).unwrap(), vec![3.0, 5.0]);
//! let jacobian: Vec<Vec<f64>> = function.jacobian(&[2.0, 3.0, 0.5]).unwrap();
//! assert_eq!(jacobian, vec![vec![1.5, 1.0], vec![1.0, 1.0]]);
//! ```

pub use ad::{Scalar, Traced};
pub use blueprint::{Blueprint, Body, EnabledDerivatives, Fingerprint};
pub use config::FactoryConfig;
pub use errors::FunctionError;
pub use factory::{default_factory, make, FactoryStats, FunctionFactory};
pub use function::Function;
pub use split::{compose, decompose};
pub use testing::{ConsistencyReport, ConsistencyTester, Tolerance};

pub mod prelude {
    pub use crate::ad::{dot, squared_norm, sum, Scalar};
    pub use crate::backends::matrix::Matrix;
    pub use crate::backends::vector::Vector;
    pub use crate::blueprint::{Blueprint, Body, EnabledDerivatives};
    pub use crate::factory::{make, FunctionFactory};
    pub use crate::function::Function;
    pub use crate::split::{compose, decompose};
    pub use crate::testing::{ConsistencyTester, Tolerance};
}

/// Tracing, expression graphs and reverse-mode differentiation
pub mod ad;
/// Loading compiled libraries and their entry points
pub mod artifact;
/// Output vector and matrix types
pub mod backends;
/// Function descriptions
pub mod blueprint;
/// Persistent compilation cache
pub mod cache;
/// Lowering expression graphs to Cranelift IR
pub mod codegen;
/// Object emission and linking
pub mod compiler;
/// Factory configuration
pub mod config;
/// Error types for the various failure modes
pub mod errors;
/// Compile-or-load orchestration
pub mod factory;
/// Loaded functions
pub mod function;
/// Imported libm functions
pub(crate) mod operators;
/// Splitting inputs into variables and parameters
pub mod split;
/// Self tests against finite differences
pub mod testing;
/// Signatures of the generated entry points
pub mod types;
