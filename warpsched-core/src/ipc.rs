use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::device::ExportHandle;
use crate::Result;

/// Cross-rank handle exchange. `lookup` blocks up to `timeout` waiting for
/// the owning rank to publish; the planner retries until its import
/// deadline before giving up.
pub trait IpcTransport {
    fn publish(&self, sid: i32, handle: ExportHandle) -> Result<()>;

    fn lookup(&self, rank: usize, sid: i32, timeout: Duration) -> Option<ExportHandle>;
}

type Registry = Arc<RwLock<FxHashMap<(usize, i32), ExportHandle>>>;

/// In-process transport: all ranks share one registry keyed by
/// `(rank, sid)`. Serves tests and single-host multi-rank runs.
#[derive(Clone)]
pub struct LocalTransport {
    rank: usize,
    registry: Registry,
}

impl LocalTransport {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            registry: Arc::new(RwLock::new(FxHashMap::default())),
        }
    }

    /// A transport for `rank` sharing `other`'s registry.
    pub fn for_rank(&self, rank: usize) -> Self {
        Self {
            rank,
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
}

impl IpcTransport for LocalTransport {
    fn publish(&self, sid: i32, handle: ExportHandle) -> Result<()> {
        trace!(rank = self.rank, sid, "publish export");
        self.registry.write().unwrap().insert((self.rank, sid), handle);
        Ok(())
    }

    fn lookup(&self, rank: usize, sid: i32, timeout: Duration) -> Option<ExportHandle> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(handle) = self.registry.read().unwrap().get(&(rank, sid)) {
                return Some(*handle);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
