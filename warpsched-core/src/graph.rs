use std::fmt;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{Error, Model, Result, TensorId};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub(crate) usize);

impl OpId {
    pub fn get(&self) -> usize {
        self.0
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Add,
    Mul,
    Scale,
    Relu,
    Matmul,
    Transpose,
    Send,
    Recv,
    /// Tombstone left behind by graph optimization; never scheduled.
    Nop,
}

impl Opcode {
    pub fn is_elementwise(&self) -> bool {
        matches!(self, Opcode::Add | Opcode::Mul | Opcode::Scale | Opcode::Relu)
    }

    /// Single-input elementwise ops, the ones that fold into a producer's
    /// fused stage list.
    pub fn is_unary_elementwise(&self) -> bool {
        matches!(self, Opcode::Scale | Opcode::Relu)
    }

    pub fn is_comm(&self) -> bool {
        matches!(self, Opcode::Send | Opcode::Recv)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpConfig {
    None,
    /// Scalar constant, e.g. the multiplier of a scale.
    Scalar(f64),
    /// Axis permutation of a transpose.
    Permute(Vec<usize>),
    /// Matmul tile sizes.
    Tile { tm: usize, tn: usize, tk: usize },
    /// Remote peer of a send/recv, plus the sid tag the pair rendezvous on.
    Peer { rank: usize, tag: i32 },
}

/// Execution cost estimate; symbolic until a profiler measurement lands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCost {
    Symbolic,
    Measured(u64),
}

/// Elementwise stage folded into a producer op by graph optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedStage {
    pub opcode: Opcode,
    pub scalar: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Op {
    pub(crate) id: OpId,
    pub(crate) opcode: Opcode,
    pub(crate) inputs: Vec<TensorId>,
    pub(crate) outputs: Vec<TensorId>,
    pub(crate) config: OpConfig,
    pub(crate) cost: OpCost,
    pub(crate) fused: Vec<FusedStage>,
}

impl Op {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn config(&self) -> &OpConfig {
        &self.config
    }

    pub fn cost(&self) -> OpCost {
        self.cost
    }

    pub fn fused(&self) -> &[FusedStage] {
        &self.fused
    }
}

/// Dependency DAG over a model's ops, layered by longest path from sources.
///
/// Edge A -> B exists iff an output of A is an input of B. Send/recv ops are
/// split out of mixed layers so each communication layer forms its own
/// barrier depth.
#[derive(Debug)]
pub struct OpGraph {
    depth_ops: Vec<Vec<usize>>,
    depths: Vec<Option<usize>>,
    send_recv_ops: Vec<OpId>,
}

impl OpGraph {
    pub fn build(model: &Model) -> Result<Self> {
        let ops = model.ops();

        // Producers per tensor, in declaration order.
        let mut producers: FxHashMap<TensorId, Vec<usize>> = FxHashMap::default();
        for (idx, op) in ops.iter().enumerate() {
            if op.opcode == Opcode::Nop {
                continue;
            }
            for &out in &op.outputs {
                producers.entry(out).or_default().push(idx);
            }
        }

        let mut dep_graph = DiGraphMap::<usize, ()>::new();
        for (idx, op) in ops.iter().enumerate() {
            if op.opcode != Opcode::Nop {
                dep_graph.add_node(idx);
            }
        }
        for (idx, op) in ops.iter().enumerate() {
            if op.opcode == Opcode::Nop {
                continue;
            }
            for inp in &op.inputs {
                for &src in producers.get(inp).map(Vec::as_slice).unwrap_or(&[]) {
                    if src != idx {
                        dep_graph.add_edge(src, idx, ());
                    }
                }
            }
        }

        let order = toposort(&dep_graph, None).map_err(|cycle| {
            let idx = cycle.node_id();
            Error::CyclicGraph {
                op_id: idx,
                opcode: ops[idx].opcode,
            }
            .bt()
        })?;

        // Longest path from sources; sources sit at depth 0.
        let mut raw_depth = vec![0usize; ops.len()];
        let mut max_raw = 0;
        for &idx in &order {
            let d = dep_graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|p| raw_depth[p] + 1)
                .max()
                .unwrap_or(0);
            raw_depth[idx] = d;
            max_raw = max_raw.max(d);
        }

        // Layer membership in declaration order, then hoist comm ops out of
        // mixed layers into a dedicated depth right after their compute peers.
        let mut depth_ops: Vec<Vec<usize>> = Vec::new();
        let mut depths = vec![None; ops.len()];
        let mut send_recv_ops = Vec::new();
        for raw in 0..=max_raw {
            let mut compute = Vec::new();
            let mut comm = Vec::new();
            for (idx, op) in ops.iter().enumerate() {
                if op.opcode == Opcode::Nop || raw_depth[idx] != raw {
                    continue;
                }
                if op.opcode.is_comm() {
                    comm.push(idx);
                } else {
                    compute.push(idx);
                }
            }
            for layer in [compute, comm] {
                if layer.is_empty() {
                    continue;
                }
                let d = depth_ops.len();
                for &idx in &layer {
                    depths[idx] = Some(d);
                    if ops[idx].opcode.is_comm() {
                        send_recv_ops.push(OpId(idx));
                    }
                }
                depth_ops.push(layer);
            }
        }

        debug!(
            depths = depth_ops.len(),
            ops = order.len(),
            comm_ops = send_recv_ops.len(),
            "op graph layered"
        );

        Ok(Self {
            depth_ops,
            depths,
            send_recv_ops,
        })
    }

    pub fn num_depths(&self) -> usize {
        self.depth_ops.len()
    }

    pub fn max_depth(&self) -> usize {
        self.depth_ops.len().saturating_sub(1)
    }

    /// Op indices at `depth`, in declaration order.
    pub fn ops_at(&self, depth: usize) -> &[usize] {
        &self.depth_ops[depth]
    }

    pub fn depth(&self, op: OpId) -> Option<usize> {
        self.depths.get(op.0).copied().flatten()
    }

    /// Send/recv ops hoisted into dedicated depths, declaration order.
    pub fn send_recv_ops(&self) -> &[OpId] {
        &self.send_recv_ops
    }

    pub fn is_comm_depth(&self, depth: usize, model: &Model) -> bool {
        self.depth_ops[depth]
            .iter()
            .any(|&idx| model.ops()[idx].opcode.is_comm())
    }
}

/// Rewrite the model in place: elide identity transposes, fold unary
/// elementwise followers into their producers. Tensors that are exported or
/// observed by the executor (graph outputs) are never eliminated.
pub fn optimize_model(model: &mut Model) {
    elide_identity_transposes(model);
    coalesce_elementwise(model);
}

fn consumer_counts(model: &Model) -> FxHashMap<TensorId, usize> {
    let mut counts: FxHashMap<TensorId, usize> = FxHashMap::default();
    for op in model.ops() {
        if op.opcode == Opcode::Nop {
            continue;
        }
        for &inp in &op.inputs {
            *counts.entry(inp).or_insert(0) += 1;
        }
    }
    counts
}

fn elide_identity_transposes(model: &mut Model) {
    let counts = consumer_counts(model);
    let mut elide: Vec<(usize, TensorId, TensorId)> = Vec::new();
    for (idx, op) in model.ops().iter().enumerate() {
        if op.opcode != Opcode::Transpose {
            continue;
        }
        let OpConfig::Permute(ref perm) = op.config else {
            continue;
        };
        if !perm.iter().enumerate().all(|(i, &p)| i == p) {
            continue;
        }
        let out = op.outputs[0];
        // A transpose whose result leaves the graph stays put.
        if model.get(out).exported() || counts.get(&out).copied().unwrap_or(0) == 0 {
            continue;
        }
        elide.push((idx, out, op.inputs[0]));
    }
    for (idx, from, to) in elide {
        let ops = model.ops_mut();
        ops[idx].opcode = Opcode::Nop;
        for op in ops.iter_mut() {
            if op.opcode == Opcode::Nop {
                continue;
            }
            for inp in op.inputs.iter_mut() {
                if *inp == from {
                    *inp = to;
                }
            }
        }
        debug!(elided = idx, ?from, ?to, "identity transpose removed");
    }
}

fn coalesce_elementwise(model: &mut Model) {
    let counts = consumer_counts(model);
    // Declaration-order scan; a producer may accumulate several stages as
    // successive followers fold into it.
    for idx in 0..model.ops().len() {
        let op = &model.ops()[idx];
        if !op.opcode.is_unary_elementwise() {
            continue;
        }
        let input = op.inputs[0];
        if counts.get(&input).copied().unwrap_or(0) != 1 || model.get(input).exported() {
            continue;
        }
        let Some(prod_idx) = (0..idx).find(|&p| {
            let prod = &model.ops()[p];
            prod.opcode != Opcode::Nop && prod.outputs.contains(&input)
        }) else {
            continue;
        };
        if !model.ops()[prod_idx].opcode.is_elementwise() {
            continue;
        }
        let shapes_agree = model.get(model.ops()[prod_idx].outputs[0]).shape()
            == model.get(op.outputs[0]).shape();
        if !shapes_agree {
            continue;
        }

        let stage = FusedStage {
            opcode: op.opcode,
            scalar: match op.config {
                OpConfig::Scalar(s) => Some(s),
                _ => None,
            },
        };
        let outputs = op.outputs.clone();
        let ops = model.ops_mut();
        ops[idx].opcode = Opcode::Nop;
        ops[prod_idx].fused.push(stage);
        ops[prod_idx].outputs = outputs;
        debug!(folded = idx, into = prod_idx, "coalesced elementwise chain");
    }
}
