//! Automatic differentiation by tracing.
//!
//! A blueprint body is executed once with [`Traced`] scalars, which records a hash-consed
//! [`Graph`] of the arithmetic it performs. Derivatives are then produced by
//! [`reverse`], which appends the adjoint computation to the same graph, so primal and
//! derivative outputs are lowered to native code the same way.

pub mod graph;
pub mod reverse;
pub mod scalar;
pub mod traced;

pub use graph::{Graph, NodeId, Op};
pub use scalar::{dot, squared_norm, sum, Scalar};
pub use traced::{cross_check, probe_point, trace, Trace, Traced};
