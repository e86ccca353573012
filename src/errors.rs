//! Error types for the autodiff-jit crate.
//!
//! The pipeline is layered and so are the errors. Each stage has its own error type and
//! the top-level [`FunctionError`] wraps them:
//!
//! - `TraceError`: recording the body with the differentiable scalar failed
//! - `BuilderError`: lowering the recorded graph to Cranelift IR failed
//! - `CompileError`: emitting the object file or linking the shared library failed
//! - `CacheError`: reading or publishing a cache entry failed
//! - `FunctionError`: everything a caller of `make` or of a `Function` can observe
//!
//! None of these errors is retried internally. Every failure points at a deterministic
//! defect (bad blueprint, bad toolchain, bad cache entry) rather than a transient condition.

use std::path::PathBuf;

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use thiserror::Error;

use crate::artifact::EntryPoint;

/// Errors raised while tracing a blueprint body.
#[derive(Error, Debug)]
pub enum TraceError {
    /// The body panicked while running with traced or plain scalars
    #[error("body panicked while tracing: {0}")]
    Panicked(String),
    /// The body returned an empty output vector
    #[error("body produced an empty output")]
    EmptyOutput,
    /// The body combined values recorded on a different trace
    #[error("body mixed values from a foreign trace")]
    ForeignTrace,
    /// Plain and traced evaluation disagree on the output length
    #[error("output length diverges between scalar types: f64 gave {plain}, traced gave {traced}")]
    OutputLengthDivergence { plain: usize, traced: usize },
    /// Plain and traced evaluation disagree on an output value
    #[error("output {index} diverges between scalar types: f64 gave {plain}, traced gave {traced}")]
    ValueDivergence {
        index: usize,
        plain: f64,
        traced: f64,
    },
}

/// Errors that can occur while generating Cranelift IR for the entry points.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error when a Cranelift setting is rejected
    #[error("invalid codegen setting: {0}")]
    Setting(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(#[from] CodegenError),
    /// Error in the Cranelift object module
    #[error("module error: {0}")]
    ModuleError(#[from] ModuleError),
    /// Error when declaring an imported math routine
    #[error("failed to link `{symbol}`: {reason}")]
    LinkError { symbol: &'static str, reason: String },
    /// A buffer index does not fit a 32-bit memory offset
    #[error("buffer index {0} exceeds the addressable offset range")]
    OffsetOverflow(usize),
}

/// Errors raised by the native toolchain.
#[derive(Error, Debug)]
pub enum CompileError {
    /// The object file could not be produced
    #[error("object emission failed: {0}")]
    ObjectEmission(String),
    /// The linker executable could not be spawned
    #[error("linker `{0}` not found")]
    LinkerMissing(String),
    /// The linker ran and failed; its diagnostics are kept verbatim
    #[error("linker `{linker}` failed with {status}: {stderr}")]
    LinkerFailed {
        linker: String,
        status: String,
        stderr: String,
    },
    /// Filesystem failure while writing build products
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the persistent compilation cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Filesystem failure
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// The manifest could not be written or parsed
    #[error("manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    /// Atomic publication of a file failed
    #[error("failed to publish {path}: {reason}")]
    Publish { path: PathBuf, reason: String },
}

/// Errors observable through `FunctionFactory::make` and `Function` operations.
#[derive(Debug, Error)]
pub enum FunctionError {
    /// The blueprint configuration is malformed
    #[error("invalid blueprint: {0}")]
    InvalidBlueprint(String),
    /// The body cannot be traced with the differentiable scalar
    #[error("tracing failed")]
    TracingError(#[from] TraceError),
    /// Cranelift IR generation failed
    #[error("code generation failed")]
    CodeGenError(#[from] BuilderError),
    /// Object emission or linking failed
    #[error("compilation failed")]
    CompilationError(#[from] CompileError),
    /// The cache could not be read or written
    #[error("compilation cache failure")]
    Cache(#[from] CacheError),
    /// A cached artifact does not match the blueprint; force a rebuild to recover
    #[error("artifact mismatch: {0}")]
    ArtifactMismatch(String),
    /// The shared library could not be loaded
    #[error("failed to load {path}: {reason}")]
    LoadError { path: PathBuf, reason: String },
    /// An input or output buffer has the wrong length
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    /// The requested derivative was not enabled in the blueprint
    #[error("derivative unavailable: {0} was not compiled")]
    DerivativeUnavailable(EntryPoint),
}
