use tracing::debug;

use crate::graph::{Op, OpConfig, OpCost, OpId, Opcode};
use crate::shape::Dims;
use crate::tensor::{Tensor, TensorBuf, TensorBufId, TensorId};
use crate::{DType, Error, Result};

/// Default matmul tile sizes; operand leading dims get padded to these.
pub const MATMUL_TILE: (usize, usize, usize) = (32, 32, 32);

/// A user-declared computation: the ops in declaration order plus exclusive
/// ownership of every tensor and backing buffer. A model is consumed by
/// `Scheduler::schedule`, which makes re-scheduling a fresh-instance affair.
pub struct Model {
    name: String,
    ops: Vec<Op>,
    tensors: Vec<Tensor>,
    bufs: Vec<TensorBuf>,
}

impl Model {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ops: Vec::new(),
            tensors: Vec::new(),
            bufs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub(crate) fn ops_mut(&mut self) -> &mut Vec<Op> {
        &mut self.ops
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn bufs(&self) -> &[TensorBuf] {
        &self.bufs
    }

    pub fn get(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.0]
    }

    pub fn get_buf(&self, id: TensorBufId) -> &TensorBuf {
        &self.bufs[id.0]
    }

    fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id.0]
    }

    fn buf_mut(&mut self, id: TensorBufId) -> &mut TensorBuf {
        &mut self.bufs[id.0]
    }

    /// Declare a fresh dense tensor with its own backing buffer.
    pub fn tensor(&mut self, name: &str, shape: &[usize], dtype: DType) -> Result<TensorId> {
        let dims = Dims::try_from(shape)?;
        let ones = Dims::new(vec![1; dims.ndims()])?;
        let offs = Dims::zeros(dims.ndims());
        let tid = TensorId(self.tensors.len());
        let bid = TensorBufId(self.bufs.len());
        let t = Tensor::new(tid, name, bid, dims.clone(), dims, offs, ones, dtype)?;
        self.bufs.push(TensorBuf::new(bid, t.span_bytes()));
        self.tensors.push(t);
        Ok(tid)
    }

    /// Declare a tensor whose buffer lives on `rank` and is published there
    /// under `sid`.
    pub fn import(
        &mut self,
        name: &str,
        shape: &[usize],
        dtype: DType,
        rank: usize,
        sid: i32,
    ) -> Result<TensorId> {
        let tid = self.tensor(name, shape, dtype)?;
        self.tensor_mut(tid).set_imported_rank(rank as i32);
        let bid = self.get(tid).buf();
        self.buf_mut(bid).set_sid(sid);
        Ok(tid)
    }

    /// Publish a local tensor's buffer to other ranks under `sid`.
    pub fn export(&mut self, t: TensorId, sid: i32) -> Result<()> {
        let bid = self.get(t).buf();
        self.tensor_mut(t).set_exported();
        self.buf_mut(bid).set_sid(sid);
        debug!(tensor = ?t, sid, "tensor exported");
        Ok(())
    }

    /// Alias a rectangle of an existing tensor's buffer. A view may nest
    /// inside its parent, but sibling views of one buffer must keep their
    /// rectangles disjoint unless the planner marks the pair in-place.
    pub fn view(&mut self, src: TensorId, shape: &[usize], offs: &[usize]) -> Result<TensorId> {
        let (bid, ldims, pads, dtype, src_name) = {
            let s = self.get(src);
            (
                s.buf(),
                s.ldims().clone(),
                s.pads().clone(),
                s.dtype(),
                s.name().to_string(),
            )
        };
        let dims = Dims::try_from(shape)?;
        let offs = Dims::offsets(offs.to_vec())?;
        let tid = TensorId(self.tensors.len());
        let name = format!("{src_name}.v{}", tid.0);
        let t = Tensor::new(tid, &name, bid, dims, ldims, offs, pads, dtype)?;
        for other in self.tensors.iter().filter(|o| o.buf() == bid) {
            if rect_contains(other, &t) || rect_contains(&t, other) {
                continue;
            }
            if rects_overlap(&t, other) {
                return Err(Error::ShapeInvalid {
                    what: format!("view {name}"),
                    dims: t.shape().as_slice().to_vec(),
                    reason: format!("overlaps sibling view {}", other.name()),
                }
                .bt());
            }
        }
        self.tensors.push(t);
        Ok(tid)
    }

    fn push_op(
        &mut self,
        opcode: Opcode,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
        config: OpConfig,
    ) -> OpId {
        let id = OpId(self.ops.len());
        for &out in &outputs {
            self.tensor_mut(out).set_producer(id);
        }
        self.ops.push(Op {
            id,
            opcode,
            inputs,
            outputs,
            config,
            cost: OpCost::Symbolic,
            fused: Vec::new(),
        });
        id
    }

    fn binary_elementwise(
        &mut self,
        opcode: Opcode,
        name: &str,
        a: TensorId,
        b: TensorId,
    ) -> Result<TensorId> {
        let (ash, adt) = (self.get(a).shape().clone(), self.get(a).dtype());
        let (bsh, bdt) = (self.get(b).shape().clone(), self.get(b).dtype());
        if ash != bsh || adt != bdt {
            return Err(Error::ShapeInvalid {
                what: format!("inputs of {opcode:?} {name}"),
                dims: bsh.as_slice().to_vec(),
                reason: format!("operands disagree: {ash:?}/{adt} vs {bsh:?}/{bdt}"),
            }
            .bt());
        }
        let out = self.tensor(name, ash.as_slice(), adt)?;
        self.push_op(opcode, vec![a, b], vec![out], OpConfig::None);
        Ok(out)
    }

    pub fn add(&mut self, name: &str, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.binary_elementwise(Opcode::Add, name, a, b)
    }

    pub fn mul(&mut self, name: &str, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.binary_elementwise(Opcode::Mul, name, a, b)
    }

    pub fn scale(&mut self, name: &str, a: TensorId, factor: f64) -> Result<TensorId> {
        let (shape, dtype) = (self.get(a).shape().clone(), self.get(a).dtype());
        let out = self.tensor(name, shape.as_slice(), dtype)?;
        self.push_op(Opcode::Scale, vec![a], vec![out], OpConfig::Scalar(factor));
        Ok(out)
    }

    pub fn relu(&mut self, name: &str, a: TensorId) -> Result<TensorId> {
        let (shape, dtype) = (self.get(a).shape().clone(), self.get(a).dtype());
        let out = self.tensor(name, shape.as_slice(), dtype)?;
        self.push_op(Opcode::Relu, vec![a], vec![out], OpConfig::None);
        Ok(out)
    }

    /// 2-D matrix product. Pads both operands' leading dims to the kernel
    /// tile so the emitted tiled loads stay aligned.
    pub fn matmul(&mut self, name: &str, a: TensorId, b: TensorId) -> Result<TensorId> {
        let (ash, adt) = (self.get(a).shape().clone(), self.get(a).dtype());
        let (bsh, bdt) = (self.get(b).shape().clone(), self.get(b).dtype());
        if ash.ndims() != 2 || bsh.ndims() != 2 || ash[1] != bsh[0] || adt != bdt {
            return Err(Error::ShapeInvalid {
                what: format!("inputs of matmul {name}"),
                dims: ash.as_slice().to_vec(),
                reason: format!("need (m,k)x(k,n) of one dtype, got {ash:?}/{adt} x {bsh:?}/{bdt}"),
            }
            .bt());
        }
        let (tm, tn, tk) = MATMUL_TILE;
        self.update_pads(a, &[tm, tk])?;
        self.update_pads(b, &[tk, tn])?;
        let out = self.tensor(name, &[ash[0], bsh[1]], adt)?;
        self.update_pads(out, &[tm, tn])?;
        self.push_op(
            Opcode::Matmul,
            vec![a, b],
            vec![out],
            OpConfig::Tile { tm, tn, tk },
        );
        Ok(out)
    }

    pub fn transpose(&mut self, name: &str, a: TensorId, perm: &[usize]) -> Result<TensorId> {
        let (shape, dtype) = (self.get(a).shape().clone(), self.get(a).dtype());
        let n = shape.ndims();
        let mut seen = vec![false; n];
        let valid =
            perm.len() == n && perm.iter().all(|&p| p < n && !std::mem::replace(&mut seen[p], true));
        if !valid {
            return Err(Error::ShapeInvalid {
                what: format!("perm of transpose {name}"),
                dims: perm.to_vec(),
                reason: format!("not a permutation of 0..{n}"),
            }
            .bt());
        }
        let out_shape: Vec<usize> = perm.iter().map(|&p| shape[p]).collect();
        let out = self.tensor(name, &out_shape, dtype)?;
        self.push_op(
            Opcode::Transpose,
            vec![a],
            vec![out],
            OpConfig::Permute(perm.to_vec()),
        );
        Ok(out)
    }

    /// Ship `t` to `peer`. The destination is the buffer `peer` declared with
    /// `recv` under the same `tag`; it appears here as an imported tensor.
    pub fn send(&mut self, t: TensorId, peer: usize, tag: i32) -> Result<TensorId> {
        let (shape, dtype, name) = {
            let s = self.get(t);
            (s.shape().clone(), s.dtype(), format!("{}.send{tag}", s.name()))
        };
        let dst = self.import(&name, shape.as_slice(), dtype, peer, tag)?;
        self.push_op(
            Opcode::Send,
            vec![t],
            vec![dst],
            OpConfig::Peer { rank: peer, tag },
        );
        Ok(dst)
    }

    /// Declare the landing buffer for a `send` issued on `peer` with the same
    /// `tag`. The buffer is exported so the sender can resolve it.
    pub fn recv(
        &mut self,
        name: &str,
        shape: &[usize],
        dtype: DType,
        peer: usize,
        tag: i32,
    ) -> Result<TensorId> {
        let out = self.tensor(name, shape, dtype)?;
        self.export(out, tag)?;
        self.push_op(
            Opcode::Recv,
            vec![],
            vec![out],
            OpConfig::Peer { rank: peer, tag },
        );
        Ok(out)
    }

    /// Low-level op constructor writing into already-declared tensors. The
    /// plumbing behind the typed constructors, public for executors that
    /// build graphs from a wire format.
    pub fn op_into(
        &mut self,
        opcode: Opcode,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
        config: OpConfig,
    ) -> Result<OpId> {
        for &t in inputs.iter().chain(outputs.iter()) {
            if t.0 >= self.tensors.len() {
                return Err(Error::ShapeInvalid {
                    what: format!("operand of {opcode:?}"),
                    dims: vec![t.0],
                    reason: "unknown tensor id".to_string(),
                }
                .bt());
            }
        }
        Ok(self.push_op(opcode, inputs, outputs, config))
    }

    /// Grow a tensor's pads (and leading dims), then its buffer to match.
    pub fn update_pads(&mut self, t: TensorId, p: &[usize]) -> Result<()> {
        self.tensor_mut(t).update_pads(p)?;
        let (bid, span) = {
            let t = self.get(t);
            (t.buf(), t.span_bytes())
        };
        self.buf_mut(bid).grow_to(span);
        Ok(())
    }
}

fn rect_contains(outer: &Tensor, inner: &Tensor) -> bool {
    if outer.shape().ndims() != inner.shape().ndims() {
        return false;
    }
    (0..outer.shape().ndims()).all(|i| {
        outer.offs()[i] <= inner.offs()[i]
            && inner.offs()[i] + inner.shape()[i] <= outer.offs()[i] + outer.shape()[i]
    })
}

fn rects_overlap(a: &Tensor, b: &Tensor) -> bool {
    if a.shape().ndims() != b.shape().ndims() {
        return false;
    }
    (0..a.shape().ndims()).all(|i| {
        let (a0, a1) = (a.offs()[i], a.offs()[i] + a.shape()[i]);
        let (b0, b1) = (b.offs()[i], b.offs()[i] + b.shape()[i]);
        a0 < b1 && b0 < a1
    })
}
