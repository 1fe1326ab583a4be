use std::fmt::Write as _;

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::catalog::KernelCatalog;
use crate::device::DeviceManager;
use crate::graph::optimize_model;
use crate::ipc::IpcTransport;
use crate::tensor::TensorId;
use crate::{Error, Model, OpGraph, Result};

pub mod codegen;
pub mod packer;
pub mod planner;
pub mod profiler;
pub mod sequence;

pub use packer::{FirstFitPacker, Packer, PartitionedPacker, Sched};
pub use planner::{BufInfo, BufferPlan};
pub use profiler::{KernelTimer, Profiler};
pub use sequence::{SchedOp, SchedOpSeq};

/// Which depth packer drives entry formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackerKind {
    FirstFit,
    Partitioned,
}

/// Arena placement policy; `NoReuse` is a debugging aid that gives every
/// buffer private bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaStrategy {
    ReuseDisjoint,
    NoReuse,
}

#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    /// Max warps per sequence.
    pub wps: u32,
    pub packer: PackerKind,
    pub import_deadline_ms: u64,
    pub arena_strategy: ArenaStrategy,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            wps: 16,
            packer: PackerKind::FirstFit,
            import_deadline_ms: 30_000,
            arena_strategy: ArenaStrategy::ReuseDisjoint,
        }
    }
}

/// Everything the executor needs: per-depth kernel source, the launch
/// entries in execution order, buffer placements, and a tensor resolver.
#[derive(Debug)]
pub struct KernelPlan {
    pub kernel_sources: Vec<String>,
    pub launches: Vec<Vec<Sched>>,
    pub buf_infos: Vec<BufInfo>,
    pub arena_base: u64,
    pub arena_bytes: u64,
    tensor_addrs: FxHashMap<TensorId, u64>,
}

impl KernelPlan {
    pub fn num_depths(&self) -> usize {
        self.launches.len()
    }

    /// Physical address of a tensor's view origin.
    pub fn resolve(&self, t: TensorId) -> Option<u64> {
        self.tensor_addrs.get(&t).copied()
    }

    /// Human-readable per-depth table for logs.
    pub fn summary(&self) -> String {
        let mut s = String::new();
        for (d, entries) in self.launches.iter().enumerate() {
            let _ = writeln!(s, "depth {d}: {} entries", entries.len());
            for e in entries {
                let warps: u32 = e.seqs.iter().map(|q| q.warps).sum();
                let _ = writeln!(
                    s,
                    "  {} seqs={} warps={} grid=({},{},{})",
                    e.kernel,
                    e.seqs.len(),
                    warps,
                    e.grid[0],
                    e.grid[1],
                    e.grid[2]
                );
            }
        }
        s
    }
}

/// The offline scheduler. One instance plans one model; a second call is
/// rejected, re-scheduling takes a fresh instance.
pub struct Scheduler<D, T, C> {
    device: D,
    transport: T,
    catalog: C,
    opts: ScheduleOptions,
    packer: Box<dyn Packer>,
    num_depths: usize,
    scheduled: bool,
}

impl<D: DeviceManager, T: IpcTransport, C: KernelCatalog> Scheduler<D, T, C> {
    pub fn new(device: D, transport: T, catalog: C, opts: ScheduleOptions) -> Self {
        let packer: Box<dyn Packer> = match opts.packer {
            PackerKind::FirstFit => Box::new(FirstFitPacker),
            PackerKind::Partitioned => Box::new(PartitionedPacker::new(Profiler::new())),
        };
        Self {
            device,
            transport,
            catalog,
            opts,
            packer,
            num_depths: 0,
            scheduled: false,
        }
    }

    /// Swap in a packer built by hand, e.g. a partitioned packer around an
    /// in-memory profiler.
    pub fn with_packer(mut self, packer: Box<dyn Packer>) -> Self {
        self.packer = packer;
        self
    }

    /// Depth count of the planned schedule; 0 before `schedule` ran.
    pub fn num_depths(&self) -> usize {
        self.num_depths
    }

    /// Lower the model to a complete launch plan: optimize, layer, place
    /// buffers, form sequences, pack depths, emit source.
    pub fn schedule(
        &mut self,
        mut model: Model,
        gpu_id: usize,
        rank: usize,
        world_size: usize,
    ) -> Result<KernelPlan> {
        if self.scheduled {
            return Err(Error::AlreadyScheduled.bt());
        }
        self.scheduled = true;
        info!(model = model.name(), gpu_id, rank, world_size, "scheduling");

        optimize_model(&mut model);
        let graph = OpGraph::build(&model)?;

        let plan = planner::plan(
            &model,
            &graph,
            gpu_id,
            rank,
            world_size,
            &mut self.device,
            &self.transport,
            &self.opts,
        )?;

        let device_info = self.device.device_info();
        let seqs = sequence::build_sequences(
            &model,
            &graph,
            &plan,
            &self.catalog,
            &device_info,
            self.opts.wps,
        )?;

        let mut launches: Vec<Vec<Sched>> = Vec::with_capacity(seqs.len());
        for (depth, depth_seqs) in seqs.into_iter().enumerate() {
            let entries = if graph.is_comm_depth(depth, &model) {
                // Comm depths start from one entry boundary so the transport
                // sees a synchronous barrier.
                let warps: u32 = depth_seqs.iter().map(|s| s.warps).sum();
                if warps > device_info.warp_budget() {
                    return Err(Error::PackerInfeasible {
                        depth,
                        warps,
                        budget: device_info.warp_budget(),
                    }
                    .bt());
                }
                vec![packer::entry_from(depth, depth_seqs)]
            } else {
                self.packer.pack(depth, depth_seqs, &device_info)?
            };
            debug!(depth, entries = entries.len(), "depth packed");
            launches.push(entries);
        }

        let kernel_sources =
            codegen::emit_depths(&model, &mut launches, &plan, &self.catalog)?;

        let mut tensor_addrs = FxHashMap::default();
        for t in model.tensors() {
            if let Some(&base) = plan.buf_trans.get(&t.buf()) {
                tensor_addrs.insert(t.id(), base + t.byte_origin());
            }
        }

        self.num_depths = launches.len();
        info!(depths = self.num_depths, "schedule complete");
        Ok(KernelPlan {
            kernel_sources,
            launches,
            buf_infos: plan.infos,
            arena_base: plan.arena_base,
            arena_bytes: plan.arena_bytes,
            tensor_addrs,
        })
    }
}
