//! Linking and calling libm routines from generated code.
//!
//! Arithmetic, `sqrt`, `abs` and integer powers lower to native Cranelift instructions.
//! Everything else is an imported C symbol that the system linker resolves against libm
//! when the shared library is built.

use std::collections::HashMap;

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::types::F64;
use cranelift_codegen::ir::{AbiParam, FuncRef, InstBuilder, Value};
use cranelift_module::{FuncId, Linkage, Module};

use crate::errors::BuilderError;

/// An imported libm routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathFunction {
    Sin,
    Cos,
    Exp,
    Ln,
    Pow,
}

impl MathFunction {
    /// C symbol name.
    pub fn symbol(self) -> &'static str {
        match self {
            MathFunction::Sin => "sin",
            MathFunction::Cos => "cos",
            MathFunction::Exp => "exp",
            MathFunction::Ln => "log",
            MathFunction::Pow => "pow",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            MathFunction::Pow => 2,
            _ => 1,
        }
    }
}

/// Declares a libm routine as an import of `module`.
///
/// The signature is `f64 -> f64`, or `(f64, f64) -> f64` for `pow`.
///
/// # Errors
/// Returns `BuilderError::LinkError` if the module rejects the declaration.
pub fn link(module: &mut dyn Module, function: MathFunction) -> Result<FuncId, BuilderError> {
    let mut sig = module.make_signature();
    for _ in 0..function.arity() {
        sig.params.push(AbiParam::new(F64));
    }
    sig.returns.push(AbiParam::new(F64));

    module
        .declare_function(function.symbol(), Linkage::Import, &sig)
        .map_err(|e| BuilderError::LinkError {
            symbol: function.symbol(),
            reason: e.to_string(),
        })
}

/// Imported libm routines of one function being built.
///
/// Each routine is declared in the module at most once and referenced in the function at
/// most once, however often the graph uses it.
#[derive(Default)]
pub struct Imports {
    ids: HashMap<MathFunction, FuncId>,
    refs: HashMap<MathFunction, FuncRef>,
}

impl Imports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the per-function references. Call before building the next function.
    pub fn reset_function(&mut self) {
        self.refs.clear();
    }

    /// Emits a call to `function` with `args` and returns the result.
    pub fn call(
        &mut self,
        builder: &mut FunctionBuilder,
        module: &mut dyn Module,
        function: MathFunction,
        args: &[Value],
    ) -> Result<Value, BuilderError> {
        debug_assert_eq!(args.len(), function.arity());
        let func_ref = match self.refs.get(&function) {
            Some(&func_ref) => func_ref,
            None => {
                let func_id = match self.ids.get(&function) {
                    Some(&id) => id,
                    None => {
                        let id = link(module, function)?;
                        self.ids.insert(function, id);
                        id
                    }
                };
                let func_ref = module.declare_func_in_func(func_id, builder.func);
                self.refs.insert(function, func_ref);
                func_ref
            }
        };
        let call = builder.ins().call(func_ref, args);
        Ok(builder.inst_results(call)[0])
    }
}
