use std::hash::{DefaultHasher, Hash, Hasher};

use tracing::debug;

use crate::catalog::{KernelCatalog, SeqKernelOp};
use crate::device::DeviceInfo;
use crate::graph::{Op, OpConfig, OpId};
use crate::tensor::TensorBufId;
use crate::{Error, Model, OpGraph, Result};

use super::planner::BufferPlan;

/// A scheduled op: resolved addresses plus its slot bookkeeping.
#[derive(Debug, Clone)]
pub struct SchedOp {
    pub op: OpId,
    pub ins: Vec<u64>,
    pub outs: Vec<u64>,
    pub warps: u32,
    /// Preferred SM, `None` when unconstrained. The default templates leave
    /// placement to the hardware scheduler.
    pub sm_affinity: Option<u32>,
    pub ordinal: u32,
}

/// An ordered run of ops sharing one kernel launch.
#[derive(Debug, Clone)]
pub struct SchedOpSeq {
    /// Number within its depth, declaration order.
    pub id: usize,
    pub depth: usize,
    pub ops: Vec<SchedOp>,
    pub warps: u32,
    pub sm_demand: u32,
    /// Signature hash; equal hashes share one generated kernel.
    pub sig: u64,
    /// Buffers the sequence touches, sorted, deduplicated.
    pub bufs: Vec<TensorBufId>,
    pub comm: bool,
}

fn resolved_addr(model: &Model, plan: &BufferPlan, t: crate::TensorId) -> u64 {
    let tensor = model.get(t);
    let base = plan.buf_trans.get(&tensor.buf()).copied().unwrap_or(0);
    base + tensor.byte_origin()
}

fn hash_op(h: &mut DefaultHasher, model: &Model, op: &Op) {
    op.opcode().hash(h);
    for stage in op.fused() {
        stage.opcode.hash(h);
        stage.scalar.unwrap_or(0.0).to_bits().hash(h);
    }
    match op.config() {
        OpConfig::Scalar(s) => s.to_bits().hash(h),
        OpConfig::Permute(p) => p.hash(h),
        OpConfig::Tile { tm, tn, tk } => (tm, tn, tk).hash(h),
        OpConfig::Peer { rank, tag } => (rank, tag).hash(h),
        OpConfig::None => {}
    }
    for &t in op.inputs().iter().chain(op.outputs().iter()) {
        let tensor = model.get(t);
        tensor.shape().as_slice().hash(h);
        tensor.ldims().as_slice().hash(h);
        tensor.dtype().hash(h);
    }
}

fn seq_signature(model: &Model, ops: &[&Op]) -> u64 {
    let mut h = DefaultHasher::new();
    for op in ops {
        hash_op(&mut h, model, op);
    }
    h.finish()
}

fn kernel_view<'a>(model: &'a Model, op: &'a Op) -> SeqKernelOp<'a> {
    SeqKernelOp {
        op,
        inputs: op.inputs().iter().map(|&t| model.get(t)).collect(),
        outputs: op.outputs().iter().map(|&t| model.get(t)).collect(),
    }
}

/// Does `b` read only what `a` wrote?
fn consumes_only(a: &Op, b: &Op) -> bool {
    !b.inputs().is_empty() && b.inputs().iter().all(|t| a.outputs().contains(t))
}

/// Data-parallel siblings: same canonical output shape, writes to disjoint
/// buffers.
fn siblings(model: &Model, a: &Op, b: &Op) -> bool {
    let (Some(&ao), Some(&bo)) = (a.outputs().first(), b.outputs().first()) else {
        return false;
    };
    if model.get(ao).shape() != model.get(bo).shape() {
        return false;
    }
    let a_bufs: Vec<TensorBufId> = a.outputs().iter().map(|&t| model.get(t).buf()).collect();
    b.outputs()
        .iter()
        .all(|&t| !a_bufs.contains(&model.get(t).buf()))
}

/// Merge each depth's ops into launch-sharing sequences under the per-seq
/// warp cap.
pub(crate) fn build_sequences<C: KernelCatalog>(
    model: &Model,
    graph: &OpGraph,
    plan: &BufferPlan,
    catalog: &C,
    device: &DeviceInfo,
    wps: u32,
) -> Result<Vec<Vec<SchedOpSeq>>> {
    let mut per_depth = Vec::with_capacity(graph.num_depths());
    for depth in 0..graph.num_depths() {
        let mut seqs: Vec<SchedOpSeq> = Vec::new();
        let mut current: Vec<usize> = Vec::new();

        let flush =
            |current: &mut Vec<usize>, seqs: &mut Vec<SchedOpSeq>| {
                if current.is_empty() {
                    return;
                }
                let ops: Vec<&Op> = current.iter().map(|&i| &model.ops()[i]).collect();
                let sig = seq_signature(model, &ops);
                let mut sched_ops = Vec::with_capacity(ops.len());
                let mut warps = 0u32;
                let mut bufs: Vec<TensorBufId> = Vec::new();
                for (ordinal, &op) in ops.iter().enumerate() {
                    let view = kernel_view(model, op);
                    let w = catalog.warps_for(&view);
                    warps += w;
                    for &t in op.inputs().iter().chain(op.outputs().iter()) {
                        bufs.push(model.get(t).buf());
                    }
                    sched_ops.push(SchedOp {
                        op: op.id(),
                        ins: op.inputs().iter().map(|&t| resolved_addr(model, plan, t)).collect(),
                        outs: op
                            .outputs()
                            .iter()
                            .map(|&t| resolved_addr(model, plan, t))
                            .collect(),
                        warps: w,
                        sm_affinity: None,
                        ordinal: ordinal as u32,
                    });
                }
                bufs.sort_unstable();
                bufs.dedup();
                let comm = ops.iter().any(|o| o.opcode().is_comm());
                seqs.push(SchedOpSeq {
                    id: seqs.len(),
                    depth,
                    ops: sched_ops,
                    warps,
                    sm_demand: warps.div_ceil(device.warps_per_sm.max(1)),
                    sig,
                    bufs,
                    comm,
                });
                current.clear();
            };

        for &idx in graph.ops_at(depth) {
            let op = &model.ops()[idx];

            // Every op must have a template accepting its dtype.
            let dtype = op
                .outputs()
                .first()
                .or(op.inputs().first())
                .map(|&t| model.get(t).dtype())
                .unwrap_or(crate::DType::U8);
            let sig = catalog
                .signature(op.opcode())
                .ok_or_else(|| Error::CodegenUnsupported {
                    opcode: op.opcode(),
                    dtype,
                }.bt())?;
            let arity_ok =
                op.inputs().len() == sig.in_arity && op.outputs().len() == sig.out_arity;
            if !arity_ok || !sig.dtypes.contains(&dtype) {
                return Err(Error::CodegenUnsupported {
                    opcode: op.opcode(),
                    dtype,
                }
                .bt());
            }

            let fuse = match current.last() {
                None => true,
                Some(&prev_idx) => {
                    let prev = &model.ops()[prev_idx];
                    let view = kernel_view(model, op);
                    let combined: u32 = current
                        .iter()
                        .map(|&i| catalog.warps_for(&kernel_view(model, &model.ops()[i])))
                        .sum::<u32>()
                        + catalog.warps_for(&view);
                    (consumes_only(prev, op) || siblings(model, prev, op))
                        && combined <= wps
                        && catalog.sequence_compatible(prev.opcode(), op.opcode())
                }
            };
            if !fuse {
                flush(&mut current, &mut seqs);
            }
            current.push(idx);
        }
        flush(&mut current, &mut seqs);

        debug!(depth, seqs = seqs.len(), "sequences built");
        per_depth.push(seqs);
    }
    Ok(per_depth)
}
