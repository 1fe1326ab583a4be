use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::catalog::WARP_THREADS;
use crate::device::DeviceInfo;
use crate::{Error, Result};

use super::profiler::{Profiler, WARP_CANDIDATES};
use super::sequence::SchedOpSeq;

/// One launch entry: sequences running concurrently at a depth.
#[derive(Debug, Clone)]
pub struct Sched {
    pub depth: usize,
    pub seqs: Vec<SchedOpSeq>,
    pub grid: [u32; 3],
    pub block: [u32; 3],
    /// Generated kernel symbol; filled in by codegen.
    pub kernel: String,
    /// Launch arguments: buffer base addresses in kernel parameter order;
    /// filled in by codegen.
    pub args: Vec<u64>,
}

pub(crate) fn entry_from(depth: usize, seqs: Vec<SchedOpSeq>) -> Sched {
    let total_warps: u32 = seqs.iter().map(|s| s.warps).sum();
    Sched {
        depth,
        seqs,
        grid: [total_warps.max(1), 1, 1],
        block: [WARP_THREADS as u32, 1, 1],
        kernel: String::new(),
        args: Vec::new(),
    }
}

/// Packs one depth's sequences into launch entries under the device warp
/// budget. Every sequence runs exactly once; entry order is deterministic.
pub trait Packer {
    fn pack(&mut self, depth: usize, seqs: Vec<SchedOpSeq>, device: &DeviceInfo)
        -> Result<Vec<Sched>>;
}

/// Greedy first-fit, descending by warp count, ties by sequence id. A
/// sequence that does not fit the open entry closes it and starts the next.
pub struct FirstFitPacker;

impl Packer for FirstFitPacker {
    fn pack(
        &mut self,
        depth: usize,
        mut seqs: Vec<SchedOpSeq>,
        device: &DeviceInfo,
    ) -> Result<Vec<Sched>> {
        let budget = device.warp_budget();
        seqs.sort_by_key(|s| (std::cmp::Reverse(s.warps), s.id));
        if let Some(s) = seqs.first() {
            if s.warps > budget {
                return Err(Error::PackerInfeasible {
                    depth,
                    warps: s.warps,
                    budget,
                }
                .bt());
            }
        }

        let mut entries: Vec<Vec<SchedOpSeq>> = Vec::new();
        let mut open: Vec<SchedOpSeq> = Vec::new();
        let mut open_warps = 0u32;
        for s in seqs {
            if open_warps + s.warps > budget && !open.is_empty() {
                entries.push(std::mem::take(&mut open));
                open_warps = 0;
            }
            open_warps += s.warps;
            open.push(s);
        }
        if !open.is_empty() {
            entries.push(open);
        }

        debug!(depth, entries = entries.len(), "first-fit packed");
        Ok(entries.into_iter().map(|e| entry_from(depth, e)).collect())
    }
}

/// Partition-based packer: grows warp-capped partitions by shared-buffer
/// affinity, cost-weighted through the profiler, then merges adjacent
/// partitions that still fit. Falls back to first-fit when the time budget
/// runs out.
pub struct PartitionedPacker {
    profiler: Profiler,
    time_budget: Duration,
}

impl PartitionedPacker {
    pub fn new(profiler: Profiler) -> Self {
        Self {
            profiler,
            time_budget: Duration::from_millis(50),
        }
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }

    /// Work the sequence represents, in output elements.
    fn seq_work(seq: &SchedOpSeq) -> usize {
        // Warps were sized from the work, so invert the sizing grain.
        seq.warps as usize * crate::catalog::ELEMS_PER_WARP
    }

    fn pick_warps(&mut self, seq: &mut SchedOpSeq, cap: u32, warps_per_sm: u32) {
        let work = Self::seq_work(seq);
        let mut best = (u64::MAX, seq.warps);
        for &w in WARP_CANDIDATES.iter().filter(|&&w| w <= cap) {
            let cycles = self.profiler.cost(seq.sig, w, work);
            if cycles < best.0 || (cycles == best.0 && w < best.1) {
                best = (cycles, w);
            }
        }
        if best.1 != seq.warps {
            seq.warps = best.1;
            seq.sm_demand = best.1.div_ceil(warps_per_sm.max(1));
        }
    }
}

impl Packer for PartitionedPacker {
    fn pack(
        &mut self,
        depth: usize,
        mut seqs: Vec<SchedOpSeq>,
        device: &DeviceInfo,
    ) -> Result<Vec<Sched>> {
        let started = Instant::now();
        let budget = device.warp_budget();
        let fallback = |seqs: Vec<SchedOpSeq>| FirstFitPacker.pack(depth, seqs, device);

        if seqs.iter().any(|s| s.warps > budget) {
            // A single oversized sequence is first-fit's call to make.
            return fallback(seqs);
        }

        for s in seqs.iter_mut() {
            self.pick_warps(s, budget.min(crate::catalog::MAX_OP_WARPS), device.warps_per_sm);
        }

        // Order by measured cost, heaviest first, ties by id.
        let mut order: Vec<usize> = (0..seqs.len()).collect();
        let costs: Vec<u64> = seqs
            .iter()
            .map(|s| self.profiler.cost(s.sig, s.warps, Self::seq_work(s)))
            .collect();
        order.sort_by_key(|&i| (std::cmp::Reverse(costs[i]), seqs[i].id));

        // Partitions are hyperedge-greedy: place each sequence where it
        // shares the most buffers, within the warp cap.
        let mut parts: Vec<Vec<usize>> = Vec::new();
        let mut part_warps: Vec<u32> = Vec::new();
        for &i in &order {
            if started.elapsed() > self.time_budget {
                warn!(depth, "partitioner over time budget, falling back");
                return fallback(seqs);
            }
            let w = seqs[i].warps;
            let mut best: Option<(usize, usize)> = None;
            for (p, members) in parts.iter().enumerate() {
                if part_warps[p] + w > budget {
                    continue;
                }
                let shared: usize = members
                    .iter()
                    .map(|&m| {
                        seqs[i]
                            .bufs
                            .iter()
                            .filter(|b| seqs[m].bufs.contains(b))
                            .count()
                    })
                    .sum();
                if best.map_or(true, |(bs, _)| shared > bs) {
                    best = Some((shared, p));
                }
            }
            match best {
                Some((_, p)) => {
                    parts[p].push(i);
                    part_warps[p] += w;
                }
                None => {
                    parts.push(vec![i]);
                    part_warps.push(w);
                }
            }
        }

        // Simplify: merge adjacent partitions that still fit together.
        let mut merged: Vec<Vec<usize>> = Vec::new();
        let mut merged_warps: Vec<u32> = Vec::new();
        for (p, members) in parts.into_iter().enumerate() {
            let w = part_warps[p];
            match merged_warps.last_mut() {
                Some(lw) if *lw + w <= budget => {
                    *lw += w;
                    merged.last_mut().unwrap().extend(members);
                }
                _ => {
                    merged.push(members);
                    merged_warps.push(w);
                }
            }
        }

        // Deterministic emission: members by sequence id within each entry.
        let mut taken: Vec<Option<SchedOpSeq>> = seqs.into_iter().map(Some).collect();
        let entries = merged
            .into_iter()
            .map(|mut members| {
                members.sort_by_key(|&i| taken[i].as_ref().map(|s| s.id).unwrap_or(usize::MAX));
                let group: Vec<SchedOpSeq> =
                    members.iter().map(|&i| taken[i].take().unwrap()).collect();
                entry_from(depth, group)
            })
            .collect();

        debug!(depth, "partitioned pack complete");
        Ok(entries)
    }
}
