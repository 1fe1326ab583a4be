use std::fmt::Write as _;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::catalog::{KernelCatalog, SeqKernelOp};
use crate::tensor::TensorBufId;
use crate::{DType, Model, Result};

use super::packer::Sched;
use super::planner::BufferPlan;

/// Emit one translation unit per depth and fill in each entry's kernel
/// symbol and launch arguments. Output text is a pure function of the model
/// and plan: stable ordering everywhere, no timestamps, no addresses.
pub(crate) fn emit_depths<C: KernelCatalog>(
    model: &Model,
    launches: &mut [Vec<Sched>],
    plan: &BufferPlan,
    catalog: &C,
) -> Result<Vec<String>> {
    // Device functions are shared by signature across the whole plan.
    let mut unit_cache: FxHashMap<u64, (String, String)> = FxHashMap::default();
    let mut sources = Vec::with_capacity(launches.len());

    for entries in launches.iter_mut() {
        let mut fns: Vec<u64> = Vec::new();
        let mut kernels = String::new();

        for (e, entry) in entries.iter_mut().enumerate() {
            // Kernel parameters: the entry's buffers in id order.
            let mut bufs: Vec<TensorBufId> =
                entry.seqs.iter().flat_map(|s| s.bufs.iter().copied()).collect();
            bufs.sort_unstable();
            bufs.dedup();

            let mut dispatch = String::new();
            let mut base = 0u32;
            let mut combined = 0u64;
            for seq in &entry.seqs {
                let ops: Vec<SeqKernelOp> = seq
                    .ops
                    .iter()
                    .map(|so| {
                        let op = &model.ops()[so.op.get()];
                        SeqKernelOp {
                            op,
                            inputs: op.inputs().iter().map(|&t| model.get(t)).collect(),
                            outputs: op.outputs().iter().map(|&t| model.get(t)).collect(),
                        }
                    })
                    .collect();
                if !unit_cache.contains_key(&seq.sig) {
                    let unit = catalog.emit(seq.sig, &ops)?;
                    unit_cache.insert(seq.sig, (unit.symbol, unit.source));
                }
                if !fns.contains(&seq.sig) {
                    fns.push(seq.sig);
                }
                let symbol = &unit_cache[&seq.sig].0;

                // Arguments mirror the device function parameter order: per
                // op, inputs then outputs, each cast off its buffer base.
                let mut call_args = vec![
                    format!("w - {base}"),
                    format!("{}", seq.warps),
                    "lane".to_string(),
                ];
                for sop in &ops {
                    for t in sop.inputs.iter() {
                        call_args.push(format!(
                            "(const {}*)(buf{} + {})",
                            t.dtype().c_name(),
                            t.buf().get(),
                            t.byte_origin()
                        ));
                    }
                    for t in sop.outputs.iter() {
                        call_args.push(format!(
                            "({}*)(buf{} + {})",
                            t.dtype().c_name(),
                            t.buf().get(),
                            t.byte_origin()
                        ));
                    }
                }
                let upper = base + seq.warps;
                let _ = writeln!(
                    dispatch,
                    "  if (w < {upper}) {{ {symbol}({}); return; }}",
                    call_args.join(", ")
                );
                base = upper;
                combined = combined.rotate_left(7) ^ seq.sig;
            }

            let symbol = format!("wsq_d{}_e{e}_{combined:08x}", entry.depth);
            let params: Vec<String> = bufs
                .iter()
                .map(|b| format!("unsigned char* buf{}", b.get()))
                .collect();
            let _ = writeln!(
                kernels,
                "extern \"C\" __global__ void {symbol}({}) {{\n  const int lane = threadIdx.x;\n  const int w = blockIdx.x;\n{dispatch}}}\n",
                params.join(", ")
            );

            entry.kernel = symbol;
            entry.args = bufs
                .iter()
                .map(|b| plan.buf_trans.get(b).copied().unwrap_or(0))
                .collect();
        }

        // Preamble, shared device functions in first-use order, then the
        // entry kernels.
        let mut unit = String::new();
        unit.push_str("// generated by warpsched; do not edit\n");
        unit.push_str("typedef unsigned char uint8_t;\ntypedef unsigned int uint32_t;\ntypedef long long int int64_t;\n");
        let needs_f16 = entries.iter().any(|entry| {
            entry.seqs.iter().any(|seq| {
                seq.ops.iter().any(|so| {
                    let op = &model.ops()[so.op.get()];
                    op.inputs()
                        .iter()
                        .chain(op.outputs().iter())
                        .any(|&t| model.get(t).dtype() == DType::F16)
                })
            })
        });
        if needs_f16 {
            if let Some(dep) = DType::F16.c_dep() {
                unit.push_str(dep);
                unit.push('\n');
            }
        }
        unit.push('\n');
        for sig in &fns {
            unit.push_str(&unit_cache[sig].1);
            unit.push('\n');
        }
        unit.push_str(&kernels);
        sources.push(unit);
    }

    debug!(depths = sources.len(), "kernel sources emitted");
    Ok(sources)
}
