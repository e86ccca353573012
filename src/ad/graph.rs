//! Recorded computational graph.
//!
//! The graph is an append-only list of operations in topological order: every operand id
//! is smaller than the id of the node using it. Nodes are hash-consed, so recording the
//! same operation on the same operands twice yields the same node, and operations on
//! constants are folded while recording. Only neutral elements are eliminated (`x + 0`,
//! `x - 0`, `0 - x`, `x * 1`, `x * -1`, `x * 0`, `0 / x`, `x / 1`, `-(-x)`, `x^0`, `x^1`);
//! there is no algebraic rewriting beyond that, so `x - x` stays a subtraction.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Index of a node in a [`Graph`].
pub type NodeId = usize;

/// A single recorded operation.
#[derive(Debug, Clone, Copy)]
pub enum Op {
    /// Component of the flat input vector
    Input(usize),
    Const(f64),
    Add(NodeId, NodeId),
    Sub(NodeId, NodeId),
    Mul(NodeId, NodeId),
    Div(NodeId, NodeId),
    Neg(NodeId),
    Abs(NodeId),
    /// `copysign(1, x)`; only produced by differentiating `Abs`
    Sign(NodeId),
    Sqrt(NodeId),
    Exp(NodeId),
    Ln(NodeId),
    Sin(NodeId),
    Cos(NodeId),
    Powi(NodeId, i32),
    Powf(NodeId, f64),
}

impl Op {
    /// Operand ids, at most two.
    pub fn operands(&self) -> [Option<NodeId>; 2] {
        match *self {
            Op::Input(_) | Op::Const(_) => [None, None],
            Op::Add(a, b) | Op::Sub(a, b) | Op::Mul(a, b) | Op::Div(a, b) => [Some(a), Some(b)],
            Op::Neg(a)
            | Op::Abs(a)
            | Op::Sign(a)
            | Op::Sqrt(a)
            | Op::Exp(a)
            | Op::Ln(a)
            | Op::Sin(a)
            | Op::Cos(a)
            | Op::Powi(a, _)
            | Op::Powf(a, _) => [Some(a), None],
        }
    }

    fn key(&self) -> (u8, usize, usize, u64) {
        match *self {
            Op::Input(i) => (0, i, 0, 0),
            Op::Const(v) => (1, 0, 0, v.to_bits()),
            Op::Add(a, b) => (2, a, b, 0),
            Op::Sub(a, b) => (3, a, b, 0),
            Op::Mul(a, b) => (4, a, b, 0),
            Op::Div(a, b) => (5, a, b, 0),
            Op::Neg(a) => (6, a, 0, 0),
            Op::Abs(a) => (7, a, 0, 0),
            Op::Sign(a) => (8, a, 0, 0),
            Op::Sqrt(a) => (9, a, 0, 0),
            Op::Exp(a) => (10, a, 0, 0),
            Op::Ln(a) => (11, a, 0, 0),
            Op::Sin(a) => (12, a, 0, 0),
            Op::Cos(a) => (13, a, 0, 0),
            Op::Powi(a, n) => (14, a, 0, n as u64),
            Op::Powf(a, e) => (15, a, 0, e.to_bits()),
        }
    }
}

impl PartialEq for Op {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Op {}

impl Hash for Op {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Evaluates a single operation given the values of its operands.
///
/// `Input` nodes have no intrinsic value and evaluate to NaN; callers substitute inputs.
pub(crate) fn evaluate(op: Op, value: impl Fn(NodeId) -> f64) -> f64 {
    match op {
        Op::Input(_) => f64::NAN,
        Op::Const(v) => v,
        Op::Add(a, b) => value(a) + value(b),
        Op::Sub(a, b) => value(a) - value(b),
        Op::Mul(a, b) => value(a) * value(b),
        Op::Div(a, b) => value(a) / value(b),
        Op::Neg(a) => -value(a),
        Op::Abs(a) => value(a).abs(),
        Op::Sign(a) => 1.0_f64.copysign(value(a)),
        Op::Sqrt(a) => value(a).sqrt(),
        Op::Exp(a) => value(a).exp(),
        Op::Ln(a) => value(a).ln(),
        Op::Sin(a) => value(a).sin(),
        Op::Cos(a) => value(a).cos(),
        Op::Powi(a, n) => value(a).powi(n),
        Op::Powf(a, e) => value(a).powf(e),
    }
}

/// Append-only, hash-consed computational graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    ops: Vec<Op>,
    interned: HashMap<Op, NodeId>,
    inputs: Vec<NodeId>,
}

impl Graph {
    /// Creates a graph with `input_size` input nodes, ids `0..input_size`.
    pub fn new(input_size: usize) -> Self {
        let mut graph = Self::default();
        graph.inputs = (0..input_size).map(|i| graph.intern(Op::Input(i))).collect();
        graph
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn input_size(&self) -> usize {
        self.inputs.len()
    }

    /// Node id of input component `index`.
    pub fn input(&self, index: usize) -> NodeId {
        self.inputs[index]
    }

    pub fn op(&self, id: NodeId) -> Op {
        self.ops[id]
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Value of `id` when it is a constant node.
    pub fn const_value(&self, id: NodeId) -> Option<f64> {
        match self.ops[id] {
            Op::Const(v) => Some(v),
            _ => None,
        }
    }

    fn is_const(&self, id: NodeId, value: f64) -> bool {
        self.const_value(id) == Some(value)
    }

    pub fn constant(&mut self, value: f64) -> NodeId {
        self.intern(Op::Const(value))
    }

    /// Records `op`, folding constants and neutral elements first.
    pub fn push(&mut self, op: Op) -> NodeId {
        match self.fold(op) {
            Some(id) => id,
            None => self.intern(op),
        }
    }

    fn intern(&mut self, op: Op) -> NodeId {
        if let Some(&id) = self.interned.get(&op) {
            return id;
        }
        let id = self.ops.len();
        self.ops.push(op);
        self.interned.insert(op, id);
        id
    }

    fn fold(&mut self, op: Op) -> Option<NodeId> {
        let operands = op.operands();
        let has_operands = operands[0].is_some();
        if has_operands
            && operands
                .iter()
                .flatten()
                .all(|&id| self.const_value(id).is_some())
        {
            let value = evaluate(op, |id| self.const_value(id).unwrap_or(f64::NAN));
            return Some(self.constant(value));
        }

        match op {
            Op::Add(a, b) if self.is_const(a, 0.0) => Some(b),
            Op::Add(a, b) if self.is_const(b, 0.0) => Some(a),
            Op::Sub(a, b) if self.is_const(b, 0.0) => Some(a),
            Op::Sub(a, b) if self.is_const(a, 0.0) => Some(self.neg(b)),
            Op::Mul(a, b) if self.is_const(a, 0.0) || self.is_const(b, 0.0) => {
                Some(self.constant(0.0))
            }
            Op::Mul(a, b) if self.is_const(a, 1.0) => Some(b),
            Op::Mul(a, b) if self.is_const(b, 1.0) => Some(a),
            Op::Mul(a, b) if self.is_const(a, -1.0) => Some(self.neg(b)),
            Op::Mul(a, b) if self.is_const(b, -1.0) => Some(self.neg(a)),
            Op::Div(a, _) if self.is_const(a, 0.0) => Some(self.constant(0.0)),
            Op::Div(a, b) if self.is_const(b, 1.0) => Some(a),
            Op::Neg(a) => match self.ops[a] {
                Op::Neg(inner) => Some(inner),
                _ => None,
            },
            Op::Powi(_, 0) => Some(self.constant(1.0)),
            Op::Powi(a, 1) => Some(a),
            Op::Powf(_, e) if e == 0.0 => Some(self.constant(1.0)),
            Op::Powf(a, e) if e == 1.0 => Some(a),
            Op::Powf(a, e) if e.fract() == 0.0 && e.abs() <= i32::MAX as f64 => {
                Some(self.push(Op::Powi(a, e as i32)))
            }
            _ => None,
        }
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.push(Op::Add(a, b))
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.push(Op::Sub(a, b))
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.push(Op::Mul(a, b))
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.push(Op::Div(a, b))
    }

    pub fn neg(&mut self, a: NodeId) -> NodeId {
        self.push(Op::Neg(a))
    }

    /// Marks every node reachable from `roots`.
    pub fn live(&self, roots: &[NodeId]) -> Vec<bool> {
        let mut live = vec![false; self.ops.len()];
        for &root in roots {
            live[root] = true;
        }
        for id in (0..self.ops.len()).rev() {
            if live[id] {
                for operand in self.ops[id].operands().into_iter().flatten() {
                    live[operand] = true;
                }
            }
        }
        live
    }

    /// Interprets the graph at `inputs` and returns the values of `roots`.
    ///
    /// Missing input components read as NaN.
    pub fn eval(&self, inputs: &[f64], roots: &[NodeId]) -> Vec<f64> {
        let mut values = vec![0.0; self.ops.len()];
        for (id, op) in self.ops.iter().enumerate() {
            let value = match *op {
                Op::Input(i) => inputs.get(i).copied().unwrap_or(f64::NAN),
                other => evaluate(other, |n| values[n]),
            };
            values[id] = value;
        }
        roots.iter().map(|&r| values[r]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inputs_come_first() {
        let graph = Graph::new(3);
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.input(2), 2);
        assert!(matches!(graph.op(1), Op::Input(1)));
    }

    #[test]
    fn test_hash_consing() {
        let mut graph = Graph::new(2);
        let a = graph.mul(0, 1);
        let b = graph.mul(0, 1);
        assert_eq!(a, b);
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_constant_folding() {
        let mut graph = Graph::new(1);
        let two = graph.constant(2.0);
        let three = graph.constant(3.0);
        let six = graph.mul(two, three);
        assert_eq!(graph.const_value(six), Some(6.0));
        let s = graph.push(Op::Sin(six));
        assert_eq!(graph.const_value(s), Some(6.0_f64.sin()));
    }

    #[test]
    fn test_neutral_elements() {
        let mut graph = Graph::new(1);
        let x = graph.input(0);
        let zero = graph.constant(0.0);
        let one = graph.constant(1.0);
        assert_eq!(graph.add(x, zero), x);
        assert_eq!(graph.mul(one, x), x);
        assert_eq!(graph.mul(x, zero), zero);
        assert_eq!(graph.div(x, one), x);
        let minus = graph.neg(x);
        assert_eq!(graph.neg(minus), x);
        assert_eq!(graph.push(Op::Powi(x, 1)), x);
        let p = graph.push(Op::Powf(x, 2.0));
        assert!(matches!(graph.op(p), Op::Powi(_, 2)));
    }

    #[test]
    fn test_eval() {
        // (x0 + x1) * x1
        let mut graph = Graph::new(2);
        let s = graph.add(0, 1);
        let y = graph.mul(s, 1);
        assert_eq!(graph.eval(&[2.0, 3.0], &[y, s]), vec![15.0, 5.0]);
    }

    #[test]
    fn test_self_subtraction_is_kept() {
        let mut graph = Graph::new(1);
        let d = graph.sub(0, 0);
        assert!(matches!(graph.op(d), Op::Sub(0, 0)));
        assert!(graph.eval(&[f64::INFINITY], &[d])[0].is_nan());
        assert_eq!(graph.eval(&[2.5], &[d]), vec![0.0]);
    }

    #[test]
    fn test_live_set() {
        let mut graph = Graph::new(3);
        let used = graph.add(0, 1);
        let unused = graph.push(Op::Exp(2));
        let live = graph.live(&[used]);
        assert!(live[0] && live[1] && live[used]);
        assert!(!live[2] && !live[unused]);
    }
}
