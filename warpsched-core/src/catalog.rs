use std::fmt::Write as _;

use crate::graph::{Op, OpConfig, Opcode};
use crate::tensor::Tensor;
use crate::{DType, Error, Result};

/// Threads in one warp, the unit every budget in the plan is expressed in.
pub const WARP_THREADS: usize = 32;
/// Elements one warp covers per elementwise/transpose kernel.
pub const ELEMS_PER_WARP: usize = 2048;
/// Hard cap on warps a single op can occupy.
pub const MAX_OP_WARPS: u32 = 32;

/// Static shape of a kernel template.
#[derive(Debug, Clone)]
pub struct KernelSignature {
    pub in_arity: usize,
    pub out_arity: usize,
    pub dtypes: Vec<DType>,
    /// Work granularity used to size warp counts; 0 for templates sized by
    /// tiles or fixed cost.
    pub elems_per_warp: usize,
}

/// One emitted device function, keyed by sequence signature hash.
#[derive(Debug, Clone)]
pub struct KernelSourceUnit {
    pub symbol: String,
    pub source: String,
}

/// An op of a sequence with its tensors resolved, as the emitter sees it.
pub struct SeqKernelOp<'a> {
    pub op: &'a Op,
    pub inputs: Vec<&'a Tensor>,
    pub outputs: Vec<&'a Tensor>,
}

/// The kernel template library. Decides which opcodes exist, how many warps
/// they want, which pairs may share a launch, and what their device code
/// looks like.
pub trait KernelCatalog {
    /// `None` when no template exists for the opcode.
    fn signature(&self, opcode: Opcode) -> Option<KernelSignature>;

    fn sequence_compatible(&self, a: Opcode, b: Opcode) -> bool;

    fn warps_for(&self, op: &SeqKernelOp) -> u32;

    fn emit(&self, sig: u64, ops: &[SeqKernelOp]) -> Result<KernelSourceUnit>;
}

/// Emits CUDA C. Shape-specialized: extents and strides are baked into the
/// source as literals, pointers and warp counts stay parameters so equal
/// signatures share one function.
pub struct CudaCatalog;

impl CudaCatalog {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CudaCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn all_dtypes() -> Vec<DType> {
    vec![DType::U8, DType::I32, DType::F16, DType::F32]
}

fn float_dtypes() -> Vec<DType> {
    vec![DType::F16, DType::F32]
}

/// `c0*S0 + c1*S1 + ...` over a tensor's strides; axis `j` of the loop maps
/// to tensor axis `axis(j)`.
fn index_expr(t: &Tensor, axis: impl Fn(usize) -> usize) -> String {
    let n = t.shape().ndims();
    let mut terms = Vec::with_capacity(n);
    for j in 0..n {
        let stride = t.stride(axis(j));
        if stride == 1 {
            terms.push(format!("c{j}"));
        } else {
            terms.push(format!("c{j} * {stride}"));
        }
    }
    terms.join(" + ")
}

/// Decompose the flat loop index into per-axis coordinates of `shape`.
fn coord_decomp(shape: &[usize]) -> String {
    let n = shape.len();
    let mut s = String::from("      long r = idx;\n");
    for j in 0..n {
        let inner: usize = shape[j + 1..].iter().product();
        if j + 1 == n {
            let _ = writeln!(s, "      const long c{j} = r;");
        } else {
            let _ = writeln!(s, "      const long c{j} = r / {inner}; r = r % {inner};");
        }
    }
    s
}

fn zero_const(dtype: DType) -> String {
    dtype.format_const(0.0)
}

fn apply_stages(body: &mut String, op: &Op, dtype: DType) {
    for stage in op.fused() {
        match stage.opcode {
            Opcode::Relu => {
                let zero = zero_const(dtype);
                let _ = writeln!(body, "      v = (v > {zero} ? v : {zero});");
            }
            Opcode::Scale => {
                let c = dtype.format_const(stage.scalar.unwrap_or(1.0));
                let _ = writeln!(body, "      v = v * {c};");
            }
            _ => {}
        }
    }
}

impl KernelCatalog for CudaCatalog {
    fn signature(&self, opcode: Opcode) -> Option<KernelSignature> {
        let sig = match opcode {
            Opcode::Add | Opcode::Mul => KernelSignature {
                in_arity: 2,
                out_arity: 1,
                dtypes: all_dtypes(),
                elems_per_warp: ELEMS_PER_WARP,
            },
            Opcode::Scale | Opcode::Relu => KernelSignature {
                in_arity: 1,
                out_arity: 1,
                dtypes: all_dtypes(),
                elems_per_warp: ELEMS_PER_WARP,
            },
            Opcode::Matmul => KernelSignature {
                in_arity: 2,
                out_arity: 1,
                dtypes: float_dtypes(),
                elems_per_warp: 0,
            },
            Opcode::Transpose => KernelSignature {
                in_arity: 1,
                out_arity: 1,
                dtypes: all_dtypes(),
                elems_per_warp: ELEMS_PER_WARP,
            },
            Opcode::Send => KernelSignature {
                in_arity: 1,
                out_arity: 1,
                dtypes: all_dtypes(),
                elems_per_warp: 0,
            },
            Opcode::Recv => KernelSignature {
                in_arity: 0,
                out_arity: 1,
                dtypes: all_dtypes(),
                elems_per_warp: 0,
            },
            Opcode::Nop => return None,
        };
        Some(sig)
    }

    fn sequence_compatible(&self, a: Opcode, b: Opcode) -> bool {
        if a.is_comm() || b.is_comm() {
            return false;
        }
        // Tiled matmul owns its launch; everything else mixes freely.
        a != Opcode::Matmul && b != Opcode::Matmul
    }

    fn warps_for(&self, op: &SeqKernelOp) -> u32 {
        match op.op.opcode() {
            Opcode::Matmul => {
                let OpConfig::Tile { tm, tn, .. } = *op.op.config() else {
                    return 1;
                };
                let out = op.outputs[0].shape();
                let tiles = out[0].div_ceil(tm) * out[1].div_ceil(tn);
                (tiles as u32).clamp(1, MAX_OP_WARPS)
            }
            Opcode::Send | Opcode::Recv => 1,
            _ => {
                let nelems = op.outputs[0].shape().nelems();
                (nelems.div_ceil(ELEMS_PER_WARP) as u32).clamp(1, MAX_OP_WARPS)
            }
        }
    }

    fn emit(&self, sig: u64, ops: &[SeqKernelOp]) -> Result<KernelSourceUnit> {
        let symbol = format!("sq_{sig:016x}");
        let mut params = Vec::new();
        for (j, sop) in ops.iter().enumerate() {
            for (k, t) in sop.inputs.iter().enumerate() {
                params.push(format!("const {}* i{j}_{k}", t.dtype().c_name()));
            }
            for (k, t) in sop.outputs.iter().enumerate() {
                params.push(format!("{}* o{j}_{k}", t.dtype().c_name()));
            }
        }

        let mut body = String::new();
        for (j, sop) in ops.iter().enumerate() {
            let opcode = sop.op.opcode();
            let dtype = sop
                .outputs
                .first()
                .or(sop.inputs.first())
                .map(|t| t.dtype())
                .ok_or_else(|| {
                    Error::CodegenUnsupported {
                        opcode,
                        dtype: DType::U8,
                    }
                    .bt()
                })?;
            match opcode {
                Opcode::Add | Opcode::Mul | Opcode::Scale | Opcode::Relu => {
                    emit_elementwise(&mut body, j, sop, dtype)?;
                }
                Opcode::Transpose => emit_transpose(&mut body, j, sop, dtype)?,
                Opcode::Matmul => emit_matmul(&mut body, j, sop, dtype)?,
                Opcode::Send | Opcode::Recv => {
                    let _ = writeln!(
                        body,
                        "  // op{j}: {opcode:?} moved by the transport layer; no device code"
                    );
                }
                Opcode::Nop => {
                    return Err(Error::CodegenUnsupported { opcode, dtype }.bt());
                }
            }
        }

        let source = format!(
            "__device__ void {symbol}(int w, int nw, int lane, {}) {{\n{body}}}\n",
            params.join(", "),
        );
        Ok(KernelSourceUnit { symbol, source })
    }
}

fn emit_elementwise(body: &mut String, j: usize, sop: &SeqKernelOp, dtype: DType) -> Result<()> {
    let out = sop.outputs[0];
    let shape = out.shape().as_slice();
    let nelems = out.shape().nelems();
    let _ = writeln!(
        body,
        "  // op{j}: {:?} {:?} {}",
        sop.op.opcode(),
        shape,
        dtype
    );
    let _ = writeln!(body, "  {{");
    let _ = writeln!(
        body,
        "    for (long idx = (long)w * {WARP_THREADS} + lane; idx < {nelems}; idx += (long)nw * {WARP_THREADS}) {{"
    );
    body.push_str(&coord_decomp(shape));
    let rhs = match sop.op.opcode() {
        Opcode::Add => format!(
            "i{j}_0[{}] + i{j}_1[{}]",
            index_expr(sop.inputs[0], |a| a),
            index_expr(sop.inputs[1], |a| a)
        ),
        Opcode::Mul => format!(
            "i{j}_0[{}] * i{j}_1[{}]",
            index_expr(sop.inputs[0], |a| a),
            index_expr(sop.inputs[1], |a| a)
        ),
        Opcode::Scale => {
            let c = match *sop.op.config() {
                OpConfig::Scalar(s) => dtype.format_const(s),
                _ => dtype.format_const(1.0),
            };
            format!("i{j}_0[{}] * {c}", index_expr(sop.inputs[0], |a| a))
        }
        Opcode::Relu => {
            let zero = zero_const(dtype);
            let e = index_expr(sop.inputs[0], |a| a);
            format!("(i{j}_0[{e}] > {zero} ? i{j}_0[{e}] : {zero})")
        }
        opcode => return Err(Error::CodegenUnsupported { opcode, dtype }.bt()),
    };
    let _ = writeln!(body, "      {} v = {rhs};", dtype.c_name());
    apply_stages(body, sop.op, dtype);
    let _ = writeln!(body, "      o{j}_0[{}] = v;", index_expr(out, |a| a));
    let _ = writeln!(body, "    }}");
    let _ = writeln!(body, "  }}");
    Ok(())
}

fn emit_transpose(body: &mut String, j: usize, sop: &SeqKernelOp, dtype: DType) -> Result<()> {
    let out = sop.outputs[0];
    let inp = sop.inputs[0];
    let OpConfig::Permute(ref perm) = *sop.op.config() else {
        return Err(Error::CodegenUnsupported {
            opcode: Opcode::Transpose,
            dtype,
        }
        .bt());
    };
    let shape = out.shape().as_slice();
    let nelems = out.shape().nelems();
    let _ = writeln!(
        body,
        "  // op{j}: Transpose {:?} perm {:?} {}",
        inp.shape().as_slice(),
        perm,
        dtype
    );
    let _ = writeln!(body, "  {{");
    let _ = writeln!(
        body,
        "    for (long idx = (long)w * {WARP_THREADS} + lane; idx < {nelems}; idx += (long)nw * {WARP_THREADS}) {{"
    );
    body.push_str(&coord_decomp(shape));
    let in_expr = index_expr(inp, |a| perm[a]);
    let out_expr = index_expr(out, |a| a);
    let _ = writeln!(body, "      o{j}_0[{out_expr}] = i{j}_0[{in_expr}];");
    let _ = writeln!(body, "    }}");
    let _ = writeln!(body, "  }}");
    Ok(())
}

fn emit_matmul(body: &mut String, j: usize, sop: &SeqKernelOp, dtype: DType) -> Result<()> {
    let OpConfig::Tile { tm, tn, .. } = *sop.op.config() else {
        return Err(Error::CodegenUnsupported {
            opcode: Opcode::Matmul,
            dtype,
        }
        .bt());
    };
    let (a, b, o) = (sop.inputs[0], sop.inputs[1], sop.outputs[0]);
    let (m, k, n) = (a.shape()[0], a.shape()[1], b.shape()[1]);
    let (lda, ldb, ldo) = (a.stride(0), b.stride(0), o.stride(0));
    let tiles_m = m.div_ceil(tm);
    let tiles_n = n.div_ceil(tn);
    let zero = zero_const(dtype);
    let ct = dtype.c_name();
    let _ = writeln!(body, "  // op{j}: Matmul ({m}x{k})x({k}x{n}) tiles {tm}x{tn}");
    let _ = writeln!(body, "  {{");
    let _ = writeln!(
        body,
        "    for (long t = w; t < {}; t += nw) {{",
        tiles_m * tiles_n
    );
    let _ = writeln!(body, "      const long ti = t / {tiles_n}, tj = t % {tiles_n};");
    let _ = writeln!(
        body,
        "      for (long e = lane; e < {}; e += {WARP_THREADS}) {{",
        tm * tn
    );
    let _ = writeln!(
        body,
        "        const long i = ti * {tm} + e / {tn}, jj = tj * {tn} + e % {tn};"
    );
    let _ = writeln!(body, "        if (i < {m} && jj < {n}) {{");
    let _ = writeln!(body, "          {ct} acc = {zero};");
    let _ = writeln!(
        body,
        "          for (long p = 0; p < {k}; ++p) acc = acc + i{j}_0[i * {lda} + p] * i{j}_1[p * {ldb} + jj];"
    );
    let _ = writeln!(body, "          o{j}_0[i * {ldo} + jj] = acc;");
    let _ = writeln!(body, "        }}");
    let _ = writeln!(body, "      }}");
    let _ = writeln!(body, "    }}");
    let _ = writeln!(body, "  }}");
    Ok(())
}
