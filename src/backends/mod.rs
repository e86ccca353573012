//! Vector and matrix types accepted for outputs.

pub mod matrix;
pub mod vector;
