//! The recording scalar and the tracing entry point.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::ad::graph::{evaluate, Graph, NodeId, Op};
use crate::ad::scalar::Scalar;
use crate::blueprint::Body;
use crate::errors::TraceError;

type Tape = Rc<RefCell<Graph>>;

const FOREIGN_TRACE: &str = "operands were recorded on different traces";

/// Differentiable scalar that records every operation applied to it.
///
/// A `Traced` value is either a plain constant (anything that does not depend on an input)
/// or a node of the graph being recorded. Constants fold eagerly, so constant
/// subexpressions never reach the graph.
#[derive(Clone)]
pub struct Traced {
    repr: Repr,
}

#[derive(Clone)]
enum Repr {
    Constant(f64),
    Recorded { tape: Tape, id: NodeId },
}

impl Traced {
    fn recorded(tape: Tape, id: NodeId) -> Self {
        Self {
            repr: Repr::Recorded { tape, id },
        }
    }

    fn unary(&self, make: impl FnOnce(NodeId) -> Op) -> Self {
        match &self.repr {
            Repr::Constant(v) => Self::from_f64(evaluate(make(0), |_| *v)),
            Repr::Recorded { tape, id } => {
                let node = tape.borrow_mut().push(make(*id));
                Self::recorded(Rc::clone(tape), node)
            }
        }
    }

    fn binary(lhs: Self, rhs: Self, make: fn(NodeId, NodeId) -> Op) -> Self {
        match (lhs.repr, rhs.repr) {
            (Repr::Constant(a), Repr::Constant(b)) => {
                Self::from_f64(evaluate(make(0, 1), |n| if n == 0 { a } else { b }))
            }
            (Repr::Recorded { tape, id }, Repr::Constant(b)) => {
                let node = {
                    let mut graph = tape.borrow_mut();
                    let b = graph.constant(b);
                    graph.push(make(id, b))
                };
                Self::recorded(tape, node)
            }
            (Repr::Constant(a), Repr::Recorded { tape, id }) => {
                let node = {
                    let mut graph = tape.borrow_mut();
                    let a = graph.constant(a);
                    graph.push(make(a, id))
                };
                Self::recorded(tape, node)
            }
            (Repr::Recorded { tape, id: a }, Repr::Recorded { tape: other, id: b }) => {
                if !Rc::ptr_eq(&tape, &other) {
                    panic!("{FOREIGN_TRACE}");
                }
                let node = tape.borrow_mut().push(make(a, b));
                Self::recorded(tape, node)
            }
        }
    }
}

impl fmt::Debug for Traced {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Constant(v) => write!(f, "Traced::Constant({v})"),
            Repr::Recorded { id, .. } => write!(f, "Traced::Node({id})"),
        }
    }
}

macro_rules! binary_operator {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl $trait for Traced {
            type Output = Traced;

            fn $method(self, rhs: Traced) -> Traced {
                Traced::binary(self, rhs, Op::$variant)
            }
        }

        impl $trait<f64> for Traced {
            type Output = Traced;

            fn $method(self, rhs: f64) -> Traced {
                Traced::binary(self, Traced::from_f64(rhs), Op::$variant)
            }
        }

        impl $trait<Traced> for f64 {
            type Output = Traced;

            fn $method(self, rhs: Traced) -> Traced {
                Traced::binary(Traced::from_f64(self), rhs, Op::$variant)
            }
        }
    };
}

binary_operator!(Add, add, Add);
binary_operator!(Sub, sub, Sub);
binary_operator!(Mul, mul, Mul);
binary_operator!(Div, div, Div);

impl Neg for Traced {
    type Output = Traced;

    fn neg(self) -> Traced {
        self.unary(Op::Neg)
    }
}

impl Scalar for Traced {
    fn from_f64(value: f64) -> Self {
        Self {
            repr: Repr::Constant(value),
        }
    }

    fn sin(&self) -> Self {
        self.unary(Op::Sin)
    }

    fn cos(&self) -> Self {
        self.unary(Op::Cos)
    }

    fn exp(&self) -> Self {
        self.unary(Op::Exp)
    }

    fn ln(&self) -> Self {
        self.unary(Op::Ln)
    }

    fn sqrt(&self) -> Self {
        self.unary(Op::Sqrt)
    }

    fn abs(&self) -> Self {
        self.unary(Op::Abs)
    }

    fn powi(&self, exponent: i32) -> Self {
        self.unary(|a| Op::Powi(a, exponent))
    }

    fn powf(&self, exponent: f64) -> Self {
        self.unary(|a| Op::Powf(a, exponent))
    }
}

/// Result of tracing a body: the recorded graph and the node of each output component.
#[derive(Debug, Clone)]
pub struct Trace {
    pub graph: Graph,
    pub outputs: Vec<NodeId>,
}

impl Trace {
    pub fn input_size(&self) -> usize {
        self.graph.input_size()
    }

    pub fn output_size(&self) -> usize {
        self.outputs.len()
    }
}

/// Runs `body` once on `input_size` traced inputs and records its graph.
pub fn trace<B: Body>(body: &B, input_size: usize) -> Result<Trace, TraceError> {
    let tape: Tape = Rc::new(RefCell::new(Graph::new(input_size)));
    let inputs: Vec<Traced> = (0..input_size)
        .map(|i| {
            let id = tape.borrow().input(i);
            Traced::recorded(Rc::clone(&tape), id)
        })
        .collect();

    let values = panic::catch_unwind(AssertUnwindSafe(|| body.eval(&inputs)))
        .map_err(|payload| panic_to_error(payload.as_ref()))?;
    drop(inputs);

    if values.is_empty() {
        return Err(TraceError::EmptyOutput);
    }

    let mut outputs = Vec::with_capacity(values.len());
    for value in values {
        match value.repr {
            Repr::Constant(v) => outputs.push(tape.borrow_mut().constant(v)),
            Repr::Recorded { tape: owner, id } => {
                if !Rc::ptr_eq(&owner, &tape) {
                    return Err(TraceError::ForeignTrace);
                }
                outputs.push(id);
            }
        }
    }

    // A body may keep traced values alive past its return; fall back to copying the graph.
    let graph = Rc::try_unwrap(tape)
        .map(RefCell::into_inner)
        .unwrap_or_else(|shared| {
            let graph = shared.borrow().clone();
            graph
        });
    log::trace!(
        "traced {} inputs into {} nodes and {} outputs",
        input_size,
        graph.len(),
        outputs.len()
    );

    Ok(Trace { graph, outputs })
}

/// Deterministic input used to cross-check the plain and traced instantiations.
///
/// Components lie in `(0.25, 0.75)` to stay inside the domain of `ln` and `sqrt`.
pub fn probe_point(input_size: usize) -> Vec<f64> {
    const GOLDEN: f64 = 0.618_033_988_749_895;
    (0..input_size)
        .map(|i| 0.25 + 0.5 * ((i as f64 + 1.0) * GOLDEN).fract())
        .collect()
}

/// Checks that `body` evaluated with `f64` agrees with the recorded graph at `probe`.
///
/// Components where the plain evaluation is not finite are skipped, since folding `x * 0`
/// while recording legitimately turns `0 * NaN` into `0`.
pub fn cross_check<B: Body>(body: &B, trace: &Trace, probe: &[f64]) -> Result<(), TraceError> {
    let plain = panic::catch_unwind(AssertUnwindSafe(|| body.eval::<f64>(probe)))
        .map_err(|payload| panic_to_error(payload.as_ref()))?;
    let traced = trace.graph.eval(probe, &trace.outputs);

    if plain.len() != traced.len() {
        return Err(TraceError::OutputLengthDivergence {
            plain: plain.len(),
            traced: traced.len(),
        });
    }

    for (index, (&p, &t)) in plain.iter().zip(&traced).enumerate() {
        if !p.is_finite() {
            continue;
        }
        let scale = 1.0_f64.max(p.abs()).max(t.abs());
        if !t.is_finite() || (p - t).abs() > 1e-8 * scale {
            return Err(TraceError::ValueDivergence {
                index,
                plain: p,
                traced: t,
            });
        }
    }
    Ok(())
}

fn panic_to_error(payload: &(dyn std::any::Any + Send)) -> TraceError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    if message == FOREIGN_TRACE {
        TraceError::ForeignTrace
    } else {
        TraceError::Panicked(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::scalar::squared_norm;
    use crate::split::decompose;

    struct Quadratic;

    impl Body for Quadratic {
        fn eval<S: Scalar>(&self, input: &[S]) -> Vec<S> {
            let (x, p) = decompose(input, 2);
            vec![p[0].clone() * squared_norm(x), x[0].clone() * 2.0 + 1.0]
        }
    }

    struct Constant;

    impl Body for Constant {
        fn eval<S: Scalar>(&self, _input: &[S]) -> Vec<S> {
            vec![S::from_f64(2.0).sqrt()]
        }
    }

    struct Empty;

    impl Body for Empty {
        fn eval<S: Scalar>(&self, _input: &[S]) -> Vec<S> {
            Vec::new()
        }
    }

    struct TooShort;

    impl Body for TooShort {
        fn eval<S: Scalar>(&self, input: &[S]) -> Vec<S> {
            let (x, _) = decompose(input, 10);
            x.to_vec()
        }
    }

    struct Foreign;

    impl Body for Foreign {
        fn eval<S: Scalar>(&self, input: &[S]) -> Vec<S> {
            let a = Traced::recorded(Rc::new(RefCell::new(Graph::new(1))), 0);
            let b = Traced::recorded(Rc::new(RefCell::new(Graph::new(1))), 0);
            let _ = a + b;
            input.to_vec()
        }
    }

    #[test]
    fn test_trace_records_graph() {
        let trace = trace(&Quadratic, 3).unwrap();
        assert_eq!(trace.input_size(), 3);
        assert_eq!(trace.output_size(), 2);
        let values = trace.graph.eval(&[1.0, 2.0, 0.5], &trace.outputs);
        assert_eq!(values, vec![2.5, 3.0]);
    }

    #[test]
    fn test_constant_output() {
        let trace = trace(&Constant, 2).unwrap();
        assert_eq!(
            trace.graph.const_value(trace.outputs[0]),
            Some(2.0_f64.sqrt())
        );
    }

    #[test]
    fn test_empty_output_is_rejected() {
        assert!(matches!(trace(&Empty, 1), Err(TraceError::EmptyOutput)));
    }

    #[test]
    fn test_panicking_body_is_rejected() {
        assert!(matches!(trace(&TooShort, 3), Err(TraceError::Panicked(_))));
    }

    #[test]
    fn test_foreign_trace_is_rejected() {
        assert!(matches!(trace(&Foreign, 1), Err(TraceError::ForeignTrace)));
    }

    #[test]
    fn test_cross_check() {
        let trace = trace(&Quadratic, 3).unwrap();
        let probe = probe_point(3);
        assert!(probe.iter().all(|&v| v > 0.25 && v < 0.75));
        assert!(cross_check(&Quadratic, &trace, &probe).is_ok());
    }

    #[test]
    fn test_cross_check_detects_divergence() {
        let mut trace = trace(&Quadratic, 3).unwrap();
        trace.outputs.swap(0, 1);
        assert!(matches!(
            cross_check(&Quadratic, &trace, &probe_point(3)),
            Err(TraceError::ValueDivergence { index: 0, .. })
        ));
        trace.outputs.pop();
        assert!(matches!(
            cross_check(&Quadratic, &trace, &probe_point(3)),
            Err(TraceError::OutputLengthDivergence {
                plain: 2,
                traced: 1
            })
        ));
    }
}
