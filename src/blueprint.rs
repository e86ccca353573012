//! Immutable description of a function to compile.
//!
//! A [`Blueprint`] bundles the scalar-generic body with its input layout, a unique name and
//! the set of derivatives to generate. It is pure configuration: validation happens once in
//! [`Blueprint::new`] and the factory never mutates it.
//!
//! # Example
//!
//! ```
//! use autodiff_jit::prelude::*;
//!
//! struct Norm;
//!
//! impl Body for Norm {
//!     fn eval<S: Scalar>(&self, x: &[S]) -> Vec<S> {
//!         vec![squared_norm(x)]
//!     }
//! }
//!
//! let blueprint = Blueprint::new(Norm, 3, 0, "norm", EnabledDerivatives::JACOBIAN).unwrap();
//! assert_eq!(blueprint.input_size(), 3);
//! ```

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use sha2::{Digest, Sha256};

use crate::ad::Scalar;
use crate::artifact::{EntryPoint, EntryPoints, FORMAT_VERSION};
use crate::errors::FunctionError;

/// A function body written once for every [`Scalar`] type.
///
/// The body must be pure and must run the same arithmetic for `f64` and for the tracing
/// scalar. The input holds the variables followed by the parameters, see
/// [`decompose`](crate::split::decompose).
pub trait Body: Send + Sync {
    fn eval<S: Scalar>(&self, input: &[S]) -> Vec<S>;
}

/// Set of derivatives to generate, combinable with `|`.
///
/// `HESSIAN` implies that the Jacobian entry point is generated as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EnabledDerivatives(u8);

impl EnabledDerivatives {
    pub const NONE: Self = Self(0);
    pub const JACOBIAN: Self = Self(1);
    pub const HESSIAN: Self = Self(2);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn has_jacobian(self) -> bool {
        self.contains(Self::JACOBIAN) || self.contains(Self::HESSIAN)
    }

    pub fn has_hessian(self) -> bool {
        self.contains(Self::HESSIAN)
    }

    /// Entry points an artifact built for this set must export.
    pub fn entry_points(self) -> EntryPoints {
        let mut points = EntryPoints::from(EntryPoint::Primal);
        if self.has_jacobian() {
            points.insert(EntryPoint::Jacobian);
        }
        if self.has_hessian() {
            points.insert(EntryPoint::Hessian);
        }
        points
    }
}

impl BitOr for EnabledDerivatives {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EnabledDerivatives {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EnabledDerivatives {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Self::JACOBIAN), self.contains(Self::HESSIAN)) {
            (false, false) => write!(f, "NONE"),
            (true, false) => write!(f, "JACOBIAN"),
            (false, true) => write!(f, "HESSIAN"),
            (true, true) => write!(f, "JACOBIAN | HESSIAN"),
        }
    }
}

/// Structural identity of a blueprint, used as the cache key.
///
/// Hex-encoded SHA-256 over the artifact format version, the host target, the name, both
/// sizes and the enabled derivatives. Stable across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(
        name: &str,
        variable_size: usize,
        parameter_size: usize,
        enabled: EnabledDerivatives,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FORMAT_VERSION.to_le_bytes());
        hasher.update(target_lexicon::HOST.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update((variable_size as u64).to_le_bytes());
        hasher.update((parameter_size as u64).to_le_bytes());
        hasher.update([enabled.bits()]);
        let digest = hasher.finalize();
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex digits, enough to tell builds apart in file names and logs.
    pub fn short(&self) -> &str {
        &self.0[..16]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable description of a function to compile.
pub struct Blueprint<B: Body> {
    body: B,
    variable_size: usize,
    parameter_size: usize,
    name: String,
    enabled: EnabledDerivatives,
}

impl<B: Body> Blueprint<B> {
    /// Creates a blueprint.
    ///
    /// # Errors
    /// Returns `FunctionError::InvalidBlueprint` if:
    /// - `name` is empty or contains characters other than ASCII letters, digits, `_` and `-`
    ///   (it becomes a directory and a file stem)
    /// - a derivative is enabled while `variable_size` is zero
    pub fn new(
        body: B,
        variable_size: usize,
        parameter_size: usize,
        name: impl Into<String>,
        enabled: EnabledDerivatives,
    ) -> Result<Self, FunctionError> {
        let name = name.into();
        validate_name(&name)?;
        if !enabled.is_none() && variable_size == 0 {
            return Err(FunctionError::InvalidBlueprint(format!(
                "`{name}` enables {enabled} but has no variables"
            )));
        }

        Ok(Self {
            body,
            variable_size,
            parameter_size,
            name,
            enabled,
        })
    }

    pub fn body(&self) -> &B {
        &self.body
    }

    pub fn variable_size(&self) -> usize {
        self.variable_size
    }

    pub fn parameter_size(&self) -> usize {
        self.parameter_size
    }

    pub fn input_size(&self) -> usize {
        self.variable_size + self.parameter_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled_derivatives(&self) -> EnabledDerivatives {
        self.enabled
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(
            &self.name,
            self.variable_size,
            self.parameter_size,
            self.enabled,
        )
    }
}

impl<B: Body> fmt::Debug for Blueprint<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blueprint")
            .field("name", &self.name)
            .field("variable_size", &self.variable_size)
            .field("parameter_size", &self.parameter_size)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> Result<(), FunctionError> {
    if name.is_empty() {
        return Err(FunctionError::InvalidBlueprint(
            "name must not be empty".to_string(),
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(FunctionError::InvalidBlueprint(format!(
            "name `{name}` contains invalid character {c:?}"
        )));
    }
    Ok(())
}
