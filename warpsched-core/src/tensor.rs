use std::fmt;

use crate::shape::{lcm, pad, Dims};
use crate::{DType, Error, OpId, Result};

/// Rank id meaning "not imported": the buffer lives on this rank.
pub const LOCAL_RANK: i32 = -1;
/// Stream id meaning "local-only": the buffer is never shared across ranks.
pub const NO_SID: i32 = -1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorBufId(pub(crate) usize);

impl TensorBufId {
    pub fn get(&self) -> usize {
        self.0
    }
}

impl fmt::Debug for TensorBufId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) usize);

impl TensorId {
    pub fn get(&self) -> usize {
        self.0
    }
}

impl fmt::Debug for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Logical memory region backing one or more tensor views. Owned by the
/// `Model`; everything else refers to it by id.
#[derive(Debug, Clone)]
pub struct TensorBuf {
    id: TensorBufId,
    bytes: u64,
    sid: i32,
}

impl TensorBuf {
    pub(crate) fn new(id: TensorBufId, bytes: u64) -> Self {
        Self {
            id,
            bytes,
            sid: NO_SID,
        }
    }

    pub fn id(&self) -> TensorBufId {
        self.id
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Import/export key; `NO_SID` when the buffer is local-only.
    pub fn sid(&self) -> i32 {
        self.sid
    }

    pub(crate) fn set_sid(&mut self, sid: i32) {
        self.sid = sid;
    }

    pub(crate) fn grow_to(&mut self, bytes: u64) {
        if bytes > self.bytes {
            self.bytes = bytes;
        }
    }
}

/// A view over a [`TensorBuf`].
///
/// `ldims` is the physical stride skeleton, `offs` the per-axis origin of
/// the view inside the buffer, `pads` the per-axis alignment each leading
/// dimension is kept a multiple of.
#[derive(Debug, Clone)]
pub struct Tensor {
    id: TensorId,
    name: String,
    buf: TensorBufId,
    shape: Dims,
    ldims: Dims,
    offs: Dims,
    pads: Dims,
    dtype: DType,
    exported: bool,
    imported_rank: i32,
    producer: Option<OpId>,
}

impl Tensor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TensorId,
        name: &str,
        buf: TensorBufId,
        shape: Dims,
        ldims: Dims,
        offs: Dims,
        pads: Dims,
        dtype: DType,
    ) -> Result<Self> {
        let t = Self {
            id,
            name: name.to_string(),
            buf,
            shape,
            ldims,
            offs,
            pads,
            dtype,
            exported: false,
            imported_rank: LOCAL_RANK,
            producer: None,
        };
        t.validate()?;
        Ok(t)
    }

    fn validate(&self) -> Result<()> {
        let n = self.shape.ndims();
        if self.shape.is_none() {
            return Err(self.invalid("shape", &self.shape, "no-dim sentinel"));
        }
        for (field, dims) in [
            ("ldims", &self.ldims),
            ("offs", &self.offs),
            ("pads", &self.pads),
        ] {
            if dims.ndims() != n {
                return Err(self.invalid(field, dims, &format!("rank mismatch with shape rank {n}")));
            }
        }
        for i in 0..n {
            if self.ldims[i] < self.shape[i] + self.offs[i] {
                return Err(self.invalid(
                    "ldims",
                    &self.ldims,
                    &format!(
                        "ldims[{i}]={} < shape[{i}]={} + offs[{i}]={}",
                        self.ldims[i], self.shape[i], self.offs[i]
                    ),
                ));
            }
            if self.ldims[i] % self.pads[i] != 0 {
                return Err(self.invalid(
                    "pads",
                    &self.pads,
                    &format!("ldims[{i}]={} not a multiple of pads[{i}]={}", self.ldims[i], self.pads[i]),
                ));
            }
        }
        Ok(())
    }

    fn invalid(&self, field: &str, dims: &Dims, reason: &str) -> Error {
        Error::ShapeInvalid {
            what: format!("{} of tensor {}", field, self.name),
            dims: dims.as_slice().to_vec(),
            reason: reason.to_string(),
        }
        .bt()
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buf(&self) -> TensorBufId {
        self.buf
    }

    pub fn shape(&self) -> &Dims {
        &self.shape
    }

    pub fn ldims(&self) -> &Dims {
        &self.ldims
    }

    pub fn offs(&self) -> &Dims {
        &self.offs
    }

    pub fn pads(&self) -> &Dims {
        &self.pads
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn exported(&self) -> bool {
        self.exported
    }

    /// Owning rank when the backing buffer lives remotely, `LOCAL_RANK`
    /// otherwise.
    pub fn imported_rank(&self) -> i32 {
        self.imported_rank
    }

    pub fn producer(&self) -> Option<OpId> {
        self.producer
    }

    pub(crate) fn set_exported(&mut self) {
        self.exported = true;
    }

    pub(crate) fn set_imported_rank(&mut self, rank: i32) {
        self.imported_rank = rank;
    }

    pub(crate) fn set_producer(&mut self, op: OpId) {
        self.producer = Some(op);
    }

    /// Element stride of axis `i`: the product of all trailing leading dims.
    pub fn stride(&self, i: usize) -> usize {
        self.ldims.as_slice()[i + 1..].iter().product()
    }

    /// Element offset of `idx` inside the buffer, per the offset law
    /// `sum((offs[i] + idx[i]) * stride(i))`.
    pub fn offset_of(&self, idx: &[usize]) -> usize {
        assert_eq!(idx.len(), self.shape.ndims());
        (0..self.shape.ndims())
            .map(|i| (self.offs[i] + idx[i]) * self.stride(i))
            .sum()
    }

    /// Byte offset of the view origin inside the buffer.
    pub fn byte_origin(&self) -> u64 {
        let origin: usize = (0..self.shape.ndims())
            .map(|i| self.offs[i] * self.stride(i))
            .sum();
        (origin * self.dtype.size_in_bytes()) as u64
    }

    /// Element capacity of the whole stride skeleton.
    pub fn ldims_nelems(&self) -> usize {
        self.ldims.nelems()
    }

    /// Bytes the stride skeleton spans.
    pub fn span_bytes(&self) -> u64 {
        (self.ldims_nelems() * self.dtype.size_in_bytes()) as u64
    }

    /// Grow `pads` to the lcm with `p` and round every leading dim up to a
    /// multiple of the new pad. Monotonic: pads and ldims only grow.
    pub(crate) fn update_pads(&mut self, p: &[usize]) -> Result<()> {
        if p.len() != self.shape.ndims() {
            return Err(self.invalid("pads", &self.pads, "pad update rank mismatch"));
        }
        if p.iter().any(|&u| u == 0) {
            return Err(self.invalid("pads", &self.pads, "pad unit must be > 0"));
        }
        for i in 0..self.shape.ndims() {
            let np = lcm(self.pads[i], p[i]);
            self.pads.set(i, np);
            self.ldims.set(i, pad(self.ldims[i], np));
        }
        self.validate()
    }
}
