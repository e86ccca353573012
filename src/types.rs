/// C-ABI signature of a generated entry point.
///
/// The function:
/// - Reads `variable_size + parameter_size` values from `input`
/// - Writes its result (outputs, Jacobian or Hessian, row-major) into `output`
/// - Touches no other memory, so concurrent calls are safe
pub type EntryPointFn = unsafe extern "C" fn(input: *const f64, output: *mut f64);

/// C-ABI signature of the layout query exported by every artifact.
///
/// Writes `[format_version, variable_size, parameter_size, output_size]` into `out`.
pub type LayoutFn = unsafe extern "C" fn(out: *mut i64);
