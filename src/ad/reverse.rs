//! Reverse-mode differentiation as a graph-to-graph transformation.
//!
//! A reverse sweep walks the live nodes of an output from the output back to the inputs
//! and records the adjoint of every node as new nodes of the same graph. The resulting
//! derivative nodes can be lowered to native code exactly like the primal outputs, and
//! since they live in the same graph a second sweep over a gradient component yields a
//! row of the Hessian.

use std::ops::Range;

use crate::ad::graph::{Graph, NodeId, Op};

/// Appends the reverse sweep of `output` and returns `∂output/∂input_j` for `j` in `wrt`.
///
/// Inputs that `output` does not depend on get a constant zero node.
pub fn gradient(graph: &mut Graph, output: NodeId, wrt: Range<usize>) -> Vec<NodeId> {
    let live = graph.live(&[output]);
    let mut adjoints: Vec<Option<NodeId>> = vec![None; output + 1];
    adjoints[output] = Some(graph.constant(1.0));

    for id in (0..=output).rev() {
        if !live[id] {
            continue;
        }
        let Some(bar) = adjoints[id] else {
            continue;
        };

        match graph.op(id) {
            Op::Input(_) | Op::Const(_) | Op::Sign(_) => {}
            Op::Add(a, b) => {
                accumulate(graph, &mut adjoints, a, bar);
                accumulate(graph, &mut adjoints, b, bar);
            }
            Op::Sub(a, b) => {
                accumulate(graph, &mut adjoints, a, bar);
                let minus = graph.neg(bar);
                accumulate(graph, &mut adjoints, b, minus);
            }
            Op::Mul(a, b) => {
                let da = graph.mul(bar, b);
                accumulate(graph, &mut adjoints, a, da);
                let db = graph.mul(bar, a);
                accumulate(graph, &mut adjoints, b, db);
            }
            Op::Div(a, b) => {
                // d(a/b) = da / b - (a/b) db / b
                let da = graph.div(bar, b);
                accumulate(graph, &mut adjoints, a, da);
                let scaled = graph.mul(bar, id);
                let quotient = graph.div(scaled, b);
                let db = graph.neg(quotient);
                accumulate(graph, &mut adjoints, b, db);
            }
            Op::Neg(a) => {
                let da = graph.neg(bar);
                accumulate(graph, &mut adjoints, a, da);
            }
            Op::Abs(a) => {
                let sign = graph.push(Op::Sign(a));
                let da = graph.mul(bar, sign);
                accumulate(graph, &mut adjoints, a, da);
            }
            Op::Sqrt(a) => {
                let two = graph.constant(2.0);
                let denominator = graph.mul(two, id);
                let da = graph.div(bar, denominator);
                accumulate(graph, &mut adjoints, a, da);
            }
            Op::Exp(a) => {
                let da = graph.mul(bar, id);
                accumulate(graph, &mut adjoints, a, da);
            }
            Op::Ln(a) => {
                let da = graph.div(bar, a);
                accumulate(graph, &mut adjoints, a, da);
            }
            Op::Sin(a) => {
                let cos = graph.push(Op::Cos(a));
                let da = graph.mul(bar, cos);
                accumulate(graph, &mut adjoints, a, da);
            }
            Op::Cos(a) => {
                let sin = graph.push(Op::Sin(a));
                let scaled = graph.mul(bar, sin);
                let da = graph.neg(scaled);
                accumulate(graph, &mut adjoints, a, da);
            }
            Op::Powi(a, n) => {
                let power = match n.checked_sub(1) {
                    Some(m) => graph.push(Op::Powi(a, m)),
                    None => graph.push(Op::Powf(a, n as f64 - 1.0)),
                };
                let factor = graph.constant(n as f64);
                let slope = graph.mul(factor, power);
                let da = graph.mul(bar, slope);
                accumulate(graph, &mut adjoints, a, da);
            }
            Op::Powf(a, e) => {
                let power = graph.push(Op::Powf(a, e - 1.0));
                let factor = graph.constant(e);
                let slope = graph.mul(factor, power);
                let da = graph.mul(bar, slope);
                accumulate(graph, &mut adjoints, a, da);
            }
        }
    }

    wrt.map(|j| {
        let input = graph.input(j);
        adjoints
            .get(input)
            .copied()
            .flatten()
            .unwrap_or_else(|| graph.constant(0.0))
    })
    .collect()
}

fn accumulate(
    graph: &mut Graph,
    adjoints: &mut [Option<NodeId>],
    target: NodeId,
    contribution: NodeId,
) {
    adjoints[target] = Some(match adjoints[target] {
        Some(previous) => graph.add(previous, contribution),
        None => contribution,
    });
}

/// Jacobian of `outputs` with respect to the first `variable_size` inputs, row-major.
pub fn jacobian(graph: &mut Graph, outputs: &[NodeId], variable_size: usize) -> Vec<NodeId> {
    outputs
        .iter()
        .flat_map(|&output| gradient(graph, output, 0..variable_size))
        .collect()
}

/// Hessian of the scalar `output` with respect to the first `variable_size` inputs,
/// row-major.
///
/// Each row is the gradient of one gradient component. Only the upper triangle is kept and
/// mirrored, so the result is exactly symmetric.
pub fn hessian(graph: &mut Graph, output: NodeId, variable_size: usize) -> Vec<NodeId> {
    let first = gradient(graph, output, 0..variable_size);
    let mut nodes = vec![0; variable_size * variable_size];
    for (row, &component) in first.iter().enumerate() {
        let second = gradient(graph, component, row..variable_size);
        for (offset, &node) in second.iter().enumerate() {
            let col = row + offset;
            nodes[row * variable_size + col] = node;
            nodes[col * variable_size + row] = node;
        }
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::scalar::{squared_norm, Scalar};
    use crate::ad::traced::trace;
    use crate::blueprint::Body;
    use crate::split::decompose;

    struct Mixed;

    impl Body for Mixed {
        fn eval<S: Scalar>(&self, input: &[S]) -> Vec<S> {
            let (x, p) = decompose(input, 4);
            vec![
                p[0].clone() * squared_norm(x),
                x[0].clone().powi(2) * 2.0,
            ]
        }
    }

    struct Transcendental;

    impl Body for Transcendental {
        fn eval<S: Scalar>(&self, x: &[S]) -> Vec<S> {
            let a = x[0].sin() * x[1].exp();
            let b = (x[0].clone() * x[1].clone()).ln() / x[1].sqrt();
            let c = x[0].cos().abs() - x[1].powf(1.5);
            vec![a + b + c]
        }
    }

    fn transcendental_gradient(x: f64, y: f64) -> [f64; 2] {
        let dx = x.cos() * y.exp() + 1.0 / (x * y.sqrt()) - x.sin() * x.cos().signum();
        let dy = x.sin() * y.exp() + (1.0 - 0.5 * (x * y).ln()) / y.powf(1.5)
            - 1.5 * y.sqrt();
        [dx, dy]
    }

    #[test]
    fn test_jacobian_of_mixed_body() {
        let mut trace = trace(&Mixed, 5).unwrap();
        let nodes = jacobian(&mut trace.graph, &trace.outputs, 4);
        assert_eq!(nodes.len(), 8);

        let (x, p) = ([0.5, -1.0, 2.0, 0.25], 3.0);
        let values = trace
            .graph
            .eval(&[x[0], x[1], x[2], x[3], p], &nodes);
        let expected = [
            2.0 * p * x[0],
            2.0 * p * x[1],
            2.0 * p * x[2],
            2.0 * p * x[3],
            4.0 * x[0],
            0.0,
            0.0,
            0.0,
        ];
        for (v, e) in values.iter().zip(expected) {
            assert!((v - e).abs() < 1e-12, "{v} != {e}");
        }
    }

    #[test]
    fn test_parameters_are_not_differentiated() {
        let mut trace = trace(&Mixed, 5).unwrap();
        let nodes = gradient(&mut trace.graph, trace.outputs[1], 0..4);
        assert_eq!(nodes.len(), 4);
        for &node in &nodes[1..] {
            assert_eq!(trace.graph.const_value(node), Some(0.0));
        }
    }

    #[test]
    fn test_hessian_is_symmetric() {
        let mut trace = trace(&Mixed, 5).unwrap();
        let nodes = hessian(&mut trace.graph, trace.outputs[0], 4);
        let p = -0.75;
        let values = trace.graph.eval(&[0.1, 0.2, 0.3, 0.4, p], &nodes);
        for row in 0..4 {
            for col in 0..4 {
                let expected = if row == col { 2.0 * p } else { 0.0 };
                assert_eq!(values[row * 4 + col], expected);
                assert_eq!(nodes[row * 4 + col], nodes[col * 4 + row]);
            }
        }
    }

    #[test]
    fn test_transcendental_gradient() {
        let mut trace = trace(&Transcendental, 2).unwrap();
        let nodes = gradient(&mut trace.graph, trace.outputs[0], 0..2);
        for &(x, y) in &[(0.3, 0.7), (1.2, 2.5), (2.0, 0.4)] {
            let values = trace.graph.eval(&[x, y], &nodes);
            let expected = transcendental_gradient(x, y);
            for (v, e) in values.iter().zip(expected) {
                assert!((v - e).abs() < 1e-10, "{v} != {e} at ({x}, {y})");
            }
        }
    }

    struct Reciprocal;

    impl Body for Reciprocal {
        fn eval<S: Scalar>(&self, x: &[S]) -> Vec<S> {
            vec![x[0].powi(i32::MIN)]
        }
    }

    #[test]
    fn test_gradient_of_smallest_integer_power() {
        let mut trace = trace(&Reciprocal, 1).unwrap();
        let output = trace.outputs[0];
        let grad = gradient(&mut trace.graph, output, 0..1);
        let hess = hessian(&mut trace.graph, output, 1);

        // d/dx x^n = n x^(n-1), exact at x = 1
        let n = i32::MIN as f64;
        assert_eq!(trace.graph.eval(&[1.0], &grad), vec![n]);
        assert_eq!(trace.graph.eval(&[1.0], &hess), vec![n * (n - 1.0)]);
        assert!(matches!(trace.graph.op(grad[0]), Op::Mul(..)));
    }

    #[test]
    fn test_gradient_of_input_itself() {
        let mut graph = Graph::new(3);
        let nodes = gradient(&mut graph, 0, 0..3);
        assert_eq!(graph.const_value(nodes[0]), Some(1.0));
        assert_eq!(graph.const_value(nodes[1]), Some(0.0));
        assert_eq!(graph.const_value(nodes[2]), Some(0.0));
    }
}
