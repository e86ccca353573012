//! Lowering of computational graphs to Cranelift IR.
//!
//! Every entry point becomes one exported function `fn(input: *const f64, output: *mut f64)`
//! in a Cranelift object module. Only the nodes live for the entry point's roots are
//! emitted, in graph order, so every operand is lowered before its users. Shared
//! subexpressions are lowered once per function since the graph is hash-consed.
//!
//! The textual CLIF of each function is returned alongside, and the cache keeps it next to
//! the shared library as the artifact's generated source.

use cranelift::prelude::*;
use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::Context;
use cranelift_module::{Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};

use crate::ad::{Graph, NodeId, Op};
use crate::artifact::{EntryPoint, Layout, LAYOUT_SYMBOL};
use crate::errors::BuilderError;
use crate::operators::{Imports, MathFunction};

/// Generated source of one exported function.
#[derive(Debug, Clone)]
pub struct FunctionSource {
    /// `layout` or the entry point label
    pub label: &'static str,
    pub symbol: &'static str,
    pub clif: String,
}

/// Creates an Instruction Set Architecture (ISA) target for the host machine.
///
/// Code is position independent so it can be linked into a shared library.
///
/// # Errors
/// Returns a BuilderError if:
/// - The host machine architecture is not supported
/// - A Cranelift setting is rejected
pub(crate) fn create_isa() -> Result<OwnedTargetIsa, BuilderError> {
    let mut flag_builder = settings::builder();
    let mut set = |name: &str, value: &str| {
        flag_builder
            .set(name, value)
            .map_err(|e| BuilderError::Setting(format!("{name}={value}: {e}")))
    };
    set("is_pic", "true")?;
    set("opt_level", "speed")?;
    #[cfg(debug_assertions)]
    set("enable_verifier", "true")?;

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| BuilderError::HostMachineNotSupported(msg.to_string()))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

/// Creates an empty object module for the host machine.
pub fn create_object_module(name: &str) -> Result<ObjectModule, BuilderError> {
    let isa = create_isa()?;
    let builder = ObjectBuilder::new(isa, name, cranelift_module::default_libcall_names())?;
    Ok(ObjectModule::new(builder))
}

/// Emits the layout query and one function per entry point into `module`.
///
/// `entry_points` pairs each entry point with its root nodes in output order (row-major
/// for the derivative matrices).
///
/// # Errors
/// Returns a BuilderError if a function cannot be declared, verified or defined.
pub fn emit_entry_points(
    module: &mut ObjectModule,
    graph: &Graph,
    entry_points: &[(EntryPoint, Vec<NodeId>)],
    layout: &Layout,
) -> Result<Vec<FunctionSource>, BuilderError> {
    let mut ctx = module.make_context();
    let mut builder_ctx = FunctionBuilderContext::new();
    let mut imports = Imports::new();

    let mut sources = Vec::with_capacity(entry_points.len() + 1);
    sources.push(FunctionSource {
        label: "layout",
        symbol: LAYOUT_SYMBOL,
        clif: emit_layout(module, &mut ctx, &mut builder_ctx, layout)?,
    });

    for (entry, roots) in entry_points {
        imports.reset_function();
        let clif = emit_function(
            module,
            &mut ctx,
            &mut builder_ctx,
            &mut imports,
            graph,
            entry.symbol(),
            roots,
        )?;
        log::trace!(
            "lowered {} with {} roots to {} bytes of CLIF",
            entry.symbol(),
            roots.len(),
            clif.len()
        );
        sources.push(FunctionSource {
            label: entry.label(),
            symbol: entry.symbol(),
            clif,
        });
    }

    Ok(sources)
}

fn emit_layout(
    module: &mut ObjectModule,
    ctx: &mut Context,
    builder_ctx: &mut FunctionBuilderContext,
    layout: &Layout,
) -> Result<String, BuilderError> {
    let mut sig = module.make_signature();
    sig.params
        .push(AbiParam::new(module.target_config().pointer_type()));
    let func_id = module.declare_function(LAYOUT_SYMBOL, Linkage::Export, &sig)?;
    ctx.func.signature = sig;

    let mut builder = FunctionBuilder::new(&mut ctx.func, builder_ctx);
    let block = builder.create_block();
    builder.append_block_params_for_function_params(block);
    builder.switch_to_block(block);
    builder.seal_block(block);
    let out = builder.block_params(block)[0];

    for (i, value) in layout.to_raw().into_iter().enumerate() {
        let value = builder.ins().iconst(types::I64, value);
        builder.ins().store(MemFlags::trusted(), value, out, offset(i)?);
    }
    builder.ins().return_(&[]);
    builder.finalize();

    define(module, ctx, func_id)
}

fn emit_function(
    module: &mut ObjectModule,
    ctx: &mut Context,
    builder_ctx: &mut FunctionBuilderContext,
    imports: &mut Imports,
    graph: &Graph,
    symbol: &str,
    roots: &[NodeId],
) -> Result<String, BuilderError> {
    let pointer = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(pointer)); // input
    sig.params.push(AbiParam::new(pointer)); // output
    let func_id = module.declare_function(symbol, Linkage::Export, &sig)?;
    ctx.func.signature = sig;

    let mut builder = FunctionBuilder::new(&mut ctx.func, builder_ctx);
    let block = builder.create_block();
    builder.append_block_params_for_function_params(block);
    builder.switch_to_block(block);
    builder.seal_block(block);
    let input = builder.block_params(block)[0];
    let output = builder.block_params(block)[1];

    let values = lower_graph(&mut builder, module, imports, graph, roots, input)?;
    for (i, &root) in roots.iter().enumerate() {
        builder
            .ins()
            .store(MemFlags::trusted(), lowered(&values, root), output, offset(i)?);
    }
    builder.ins().return_(&[]);
    builder.finalize();

    define(module, ctx, func_id)
}

fn define(
    module: &mut ObjectModule,
    ctx: &mut Context,
    func_id: cranelift_module::FuncId,
) -> Result<String, BuilderError> {
    let clif = ctx.func.display().to_string();
    module.define_function(func_id, ctx)?;
    module.clear_context(ctx);
    Ok(clif)
}

/// Emits the nodes live for `roots` and returns the IR value of every lowered node.
fn lower_graph(
    builder: &mut FunctionBuilder,
    module: &mut ObjectModule,
    imports: &mut Imports,
    graph: &Graph,
    roots: &[NodeId],
    input: Value,
) -> Result<Vec<Option<Value>>, BuilderError> {
    let live = graph.live(roots);
    let mut values: Vec<Option<Value>> = vec![None; graph.len()];

    for (id, &op) in graph.ops().iter().enumerate() {
        if !live[id] {
            continue;
        }
        let v = |n: NodeId| lowered(&values, n);
        let value = match op {
            Op::Input(i) => {
                let flags = MemFlags::trusted().with_readonly();
                builder.ins().load(types::F64, flags, input, offset(i)?)
            }
            Op::Const(c) => builder.ins().f64const(c),
            Op::Add(a, b) => builder.ins().fadd(v(a), v(b)),
            Op::Sub(a, b) => builder.ins().fsub(v(a), v(b)),
            Op::Mul(a, b) => builder.ins().fmul(v(a), v(b)),
            Op::Div(a, b) => builder.ins().fdiv(v(a), v(b)),
            Op::Neg(a) => builder.ins().fneg(v(a)),
            Op::Abs(a) => builder.ins().fabs(v(a)),
            Op::Sign(a) => {
                let one = builder.ins().f64const(1.0);
                builder.ins().fcopysign(one, v(a))
            }
            Op::Sqrt(a) => builder.ins().sqrt(v(a)),
            Op::Exp(a) => imports.call(builder, module, MathFunction::Exp, &[v(a)])?,
            Op::Ln(a) => imports.call(builder, module, MathFunction::Ln, &[v(a)])?,
            Op::Sin(a) => imports.call(builder, module, MathFunction::Sin, &[v(a)])?,
            Op::Cos(a) => imports.call(builder, module, MathFunction::Cos, &[v(a)])?,
            Op::Powi(a, n) => lower_powi(builder, v(a), n),
            Op::Powf(a, e) => {
                let exponent = builder.ins().f64const(e);
                imports.call(builder, module, MathFunction::Pow, &[v(a), exponent])?
            }
        };
        values[id] = Some(value);
    }

    Ok(values)
}

fn lowered(values: &[Option<Value>], id: NodeId) -> Value {
    values[id].expect("operands are lowered before their users")
}

fn offset(index: usize) -> Result<i32, BuilderError> {
    index
        .checked_mul(8)
        .and_then(|bytes| i32::try_from(bytes).ok())
        .ok_or(BuilderError::OffsetOverflow(index))
}

/// Integer power by repeated squaring; a negative exponent takes the reciprocal at the end.
fn lower_powi(builder: &mut FunctionBuilder, base: Value, exponent: i32) -> Value {
    let mut remaining = exponent.unsigned_abs();
    let mut square = base;
    let mut product: Option<Value> = None;

    while remaining > 0 {
        if remaining & 1 == 1 {
            product = Some(match product {
                Some(acc) => builder.ins().fmul(acc, square),
                None => square,
            });
        }
        remaining >>= 1;
        if remaining > 0 {
            square = builder.ins().fmul(square, square);
        }
    }

    let magnitude = match product {
        Some(value) => value,
        None => builder.ins().f64const(1.0),
    };
    if exponent < 0 {
        let one = builder.ins().f64const(1.0);
        builder.ins().fdiv(one, magnitude)
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::{reverse, trace, Scalar};
    use crate::blueprint::Body;

    struct Wave;

    impl Body for Wave {
        fn eval<S: Scalar>(&self, x: &[S]) -> Vec<S> {
            vec![
                x[0].sin() * x[1].exp() + x[0].powi(-3),
                (x[1].clone() * x[1].clone()).ln() - x[0].powf(0.5),
            ]
        }
    }

    fn lower(body: &impl Body, input_size: usize) -> Vec<FunctionSource> {
        let mut trace = trace(body, input_size).unwrap();
        let jacobian = reverse::jacobian(&mut trace.graph, &trace.outputs, input_size);
        let layout = Layout {
            variable_size: input_size,
            parameter_size: 0,
            output_size: trace.outputs.len(),
        };
        let mut module = create_object_module("wave").unwrap();
        emit_entry_points(
            &mut module,
            &trace.graph,
            &[
                (EntryPoint::Primal, trace.outputs.clone()),
                (EntryPoint::Jacobian, jacobian),
            ],
            &layout,
        )
        .unwrap()
    }

    #[test]
    fn test_emits_layout_and_entry_points() {
        let sources = lower(&Wave, 2);
        let labels: Vec<_> = sources.iter().map(|s| s.label).collect();
        assert_eq!(labels, vec!["layout", "primal", "jacobian"]);
        assert!(sources.iter().all(|s| s.clif.starts_with("function")));
    }

    #[test]
    fn test_libm_calls_are_imported() {
        let sources = lower(&Wave, 2);
        let primal = &sources[1].clif;
        // sin, exp, log and pow, each declared once however often it is called
        let imports = primal
            .lines()
            .filter(|line| line.trim_start().starts_with("fn") && line.contains(" = "))
            .count();
        assert_eq!(imports, 4, "unexpected imports in\n{primal}");
        assert!(primal.contains("fdiv"));
        assert!(!sources[0].clif.contains("call"));
    }

    #[test]
    fn test_offset() {
        assert_eq!(offset(0).unwrap(), 0);
        assert_eq!(offset(3).unwrap(), 24);
        assert!(matches!(
            offset(usize::MAX),
            Err(BuilderError::OffsetOverflow(_))
        ));
    }
}
