use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::device::DeviceManager;
use crate::ipc::IpcTransport;
use crate::tensor::{TensorBufId, NO_SID};
use crate::{Error, Model, OpGraph, Result};

use super::{ArenaStrategy, ScheduleOptions};

/// Arena sub-allocations are aligned to this many bytes.
pub const ARENA_ALIGN: u64 = 256;

/// Planning record for one TensorBuf.
#[derive(Debug, Clone)]
pub struct BufInfo {
    /// Owning gpu: our own id for local buffers, the exporter's rank for
    /// imported ones.
    pub gpu_id: usize,
    pub bytes: u64,
    pub tbuf: TensorBufId,
    pub sid: i32,
    /// Byte offset inside the owning arena; 0 for imports.
    pub offset: u64,
}

/// Physical placement of every buffer the schedule touches.
pub struct BufferPlan {
    pub infos: Vec<BufInfo>,
    /// TensorBuf id to resolved device base address.
    pub buf_trans: FxHashMap<TensorBufId, u64>,
    pub arena_bytes: u64,
    pub arena_base: u64,
}

impl BufferPlan {
    pub fn info_for(&self, buf: TensorBufId) -> Option<&BufInfo> {
        self.infos.iter().find(|i| i.tbuf == buf)
    }
}

struct Liveness {
    first: usize,
    last: usize,
}

struct Placed {
    offset: u64,
    bytes: u64,
    first: usize,
    last: usize,
    pinned: bool,
}

/// Assign physical memory to every live TensorBuf: a single local arena with
/// disjoint-liveness reuse, exports registered and published, imports
/// resolved against the transport under the configured deadline.
pub(crate) fn plan<D: DeviceManager, T: IpcTransport>(
    model: &Model,
    graph: &OpGraph,
    gpu_id: usize,
    rank: usize,
    world_size: usize,
    device: &mut D,
    transport: &T,
    opts: &ScheduleOptions,
) -> Result<BufferPlan> {
    let max_depth = graph.max_depth();

    // Buffer classification off the tensors referencing it.
    let nbufs = model.bufs().len();
    let mut exported = vec![false; nbufs];
    let mut owner_rank: Vec<Option<usize>> = vec![None; nbufs];
    for t in model.tensors() {
        let b = t.buf().get();
        if t.exported() {
            exported[b] = true;
        }
        if t.imported_rank() >= 0 {
            owner_rank[b] = Some(t.imported_rank() as usize);
        }
    }

    // Liveness per buffer over op depths. Shared buffers (exports, imports)
    // stay live to the last depth regardless of local use.
    let mut live: FxHashMap<usize, Liveness> = FxHashMap::default();
    for depth in 0..graph.num_depths() {
        for &idx in graph.ops_at(depth) {
            let op = &model.ops()[idx];
            for &t in op.inputs().iter().chain(op.outputs().iter()) {
                let b = model.get(t).buf().get();
                let entry = live.entry(b).or_insert(Liveness {
                    first: depth,
                    last: depth,
                });
                entry.first = entry.first.min(depth);
                entry.last = entry.last.max(depth);
            }
        }
    }
    for b in 0..nbufs {
        let shared = exported[b] || owner_rank[b].is_some();
        if shared {
            let entry = live.entry(b).or_insert(Liveness { first: 0, last: 0 });
            entry.last = max_depth;
        }
    }

    // Local buffers in decreasing size, ties by id.
    let mut local: Vec<usize> = (0..nbufs)
        .filter(|&b| owner_rank[b].is_none() && live.contains_key(&b))
        .collect();
    local.sort_by_key(|&b| (std::cmp::Reverse(model.bufs()[b].bytes()), b));

    let mut placed: FxHashMap<usize, Placed> = FxHashMap::default();
    let mut order_placed: Vec<usize> = Vec::new();
    let mut arena_bytes = 0u64;
    for &b in &local {
        let bytes = model.bufs()[b].bytes().max(1);
        let lv = &live[&b];
        let pinned = exported[b];
        let offset = match opts.arena_strategy {
            ArenaStrategy::NoReuse => arena_bytes,
            ArenaStrategy::ReuseDisjoint => {
                // First-fit against every placed block whose lifetime (or
                // export pin) collides with ours.
                let mut conflicts: Vec<(u64, u64)> = order_placed
                    .iter()
                    .map(|o| &placed[o])
                    .filter(|p| {
                        pinned || p.pinned || (lv.first <= p.last && p.first <= lv.last)
                    })
                    .map(|p| (p.offset, p.bytes))
                    .collect();
                conflicts.sort_unstable();
                let mut cursor = 0u64;
                for (off, sz) in conflicts {
                    if cursor + bytes <= off {
                        break;
                    }
                    cursor = cursor.max(off + sz).next_multiple_of(ARENA_ALIGN);
                }
                cursor
            }
        };
        arena_bytes = arena_bytes.max(offset + bytes).next_multiple_of(ARENA_ALIGN);
        placed.insert(
            b,
            Placed {
                offset,
                bytes,
                first: lv.first,
                last: lv.last,
                pinned,
            },
        );
        order_placed.push(b);
    }

    let available = device.device_info().bytes_free;
    if arena_bytes > available {
        return Err(Error::OutOfDeviceMemory {
            planned: arena_bytes,
            available,
        }
        .bt());
    }
    let arena_base = if arena_bytes > 0 {
        device.allocate_arena(arena_bytes)?.0
    } else {
        0
    };
    info!(rank, arena_bytes, arena_base, local = local.len(), "arena planned");

    let mut buf_trans: FxHashMap<TensorBufId, u64> = FxHashMap::default();
    let mut infos: Vec<BufInfo> = Vec::new();

    // Exports first so a peer scheduling after us resolves immediately.
    let mut seen_sids: FxHashMap<i32, usize> = FxHashMap::default();
    for &b in &local {
        let p = &placed[&b];
        let sid = model.bufs()[b].sid();
        let addr = arena_base + p.offset;
        buf_trans.insert(TensorBufId(b), addr);
        if exported[b] && sid != NO_SID {
            if let Some(&first) = seen_sids.get(&sid) {
                return Err(Error::ExportConflict {
                    sid,
                    first,
                    second: b,
                }
                .bt());
            }
            seen_sids.insert(sid, b);
            let handle =
                device.register_export(sid, crate::device::DeviceAddress(addr), p.bytes)?;
            transport.publish(sid, handle)?;
            debug!(buf = b, sid, addr, "export published");
        }
    }

    // Imports, bounded by the configured deadline across all of them.
    let deadline = Duration::from_millis(opts.import_deadline_ms);
    let started = Instant::now();
    let mut remote: Vec<usize> = (0..nbufs).filter(|&b| owner_rank[b].is_some()).collect();
    remote.sort_unstable();
    for &b in &remote {
        let peer = owner_rank[b].unwrap();
        let sid = model.bufs()[b].sid();
        if peer >= world_size {
            return Err(Error::ImportUnresolved {
                rank: peer,
                sid,
                waited_ms: 0,
            }
            .bt());
        }
        let remaining = deadline.saturating_sub(started.elapsed());
        let handle = transport.lookup(peer, sid, remaining).ok_or_else(|| {
            Error::ImportUnresolved {
                rank: peer,
                sid,
                waited_ms: started.elapsed().as_millis() as u64,
            }
            .bt()
        })?;
        let addr = device.resolve_import(peer, handle)?;
        buf_trans.insert(TensorBufId(b), addr.0);
        debug!(buf = b, peer, sid, addr = addr.0, "import resolved");
    }

    // BufInfo records in buffer id order.
    for b in 0..nbufs {
        if !live.contains_key(&b) {
            continue;
        }
        let sid = model.bufs()[b].sid();
        match owner_rank[b] {
            Some(peer) => infos.push(BufInfo {
                gpu_id: peer,
                bytes: model.bufs()[b].bytes(),
                tbuf: TensorBufId(b),
                sid,
                offset: 0,
            }),
            None => infos.push(BufInfo {
                gpu_id,
                bytes: placed[&b].bytes,
                tbuf: TensorBufId(b),
                sid,
                offset: placed[&b].offset,
            }),
        }
    }

    Ok(BufferPlan {
        infos,
        buf_trans,
        arena_bytes,
        arena_base,
    })
}
