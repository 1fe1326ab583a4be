use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::catalog::WARP_THREADS;

/// Warp counts the profiler measures a sequence under.
pub const WARP_CANDIDATES: [u32; 6] = [1, 2, 4, 8, 16, 32];

/// Wall-clock allowance for one micro-measurement before it is skipped.
pub const MEASURE_TIMEOUT: Duration = Duration::from_millis(200);

/// Executor-provided hook that times one compiled micro-kernel and reports
/// device cycles. `None` means the measurement timed out or failed; the
/// profiler then stays on its heuristic.
pub trait KernelTimer {
    fn time(&mut self, source: &str, symbol: &str, warps: u32) -> Option<u64>;
}

/// Cost oracle for the partitioned packer: measured `(sig, warps) -> cycles`
/// where available, a work/warps heuristic elsewhere. Measurements persist
/// across runs in a plain-text cache under the user cache dir.
pub struct Profiler {
    cache: FxHashMap<(u64, u32), u64>,
    timer: Option<Box<dyn KernelTimer>>,
    cache_path: Option<PathBuf>,
}

impl Profiler {
    pub fn new() -> Self {
        let cache_path = dirs::home_dir().map(|h| h.join(".cache/warpsched/profile"));
        let mut p = Self {
            cache: FxHashMap::default(),
            timer: None,
            cache_path,
        };
        p.load();
        p
    }

    /// A profiler that never touches the filesystem; used by tests.
    pub fn in_memory() -> Self {
        Self {
            cache: FxHashMap::default(),
            timer: None,
            cache_path: None,
        }
    }

    pub fn with_timer(mut self, timer: Box<dyn KernelTimer>) -> Self {
        self.timer = Some(timer);
        self
    }

    fn load(&mut self) {
        let Some(path) = &self.cache_path else {
            return;
        };
        let Ok(text) = fs::read_to_string(path) else {
            return;
        };
        for line in text.lines() {
            let mut it = line.split_whitespace();
            if let (Some(sig), Some(warps), Some(cycles)) = (it.next(), it.next(), it.next()) {
                if let (Ok(sig), Ok(warps), Ok(cycles)) =
                    (u64::from_str_radix(sig, 16), warps.parse(), cycles.parse())
                {
                    self.cache.insert((sig, warps), cycles);
                }
            }
        }
        debug!(entries = self.cache.len(), "profile cache loaded");
    }

    /// Best-effort write-back; a failed persist never fails a schedule.
    pub fn persist(&self) {
        let Some(path) = &self.cache_path else {
            return;
        };
        let mut entries: Vec<_> = self.cache.iter().collect();
        entries.sort_unstable();
        let text: String = entries
            .iter()
            .map(|(&(sig, warps), &cycles)| format!("{sig:016x} {warps} {cycles}\n"))
            .collect();
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(err) = fs::write(path, text) {
            warn!(%err, "profile cache not persisted");
        }
    }

    /// Measure one sequence kernel under every candidate warp count, caching
    /// what the timer returns. A timed-out candidate is skipped, not fatal.
    pub fn measure(&mut self, sig: u64, source: &str, symbol: &str) {
        let Some(timer) = self.timer.as_mut() else {
            return;
        };
        for &warps in WARP_CANDIDATES.iter() {
            if self.cache.contains_key(&(sig, warps)) {
                continue;
            }
            let started = Instant::now();
            match timer.time(source, symbol, warps) {
                Some(cycles) => {
                    self.cache.insert((sig, warps), cycles);
                }
                None => {
                    warn!(sig, warps, "profiler measurement timed out, keeping heuristic");
                }
            }
            if started.elapsed() > MEASURE_TIMEOUT {
                warn!(sig, "profiler over measurement budget");
                break;
            }
        }
    }

    /// Cycles for running `sig` with `warps`; measured when known, else the
    /// heuristic `ceil(work / threads)` with threads = warps * lanes.
    pub fn cost(&mut self, sig: u64, warps: u32, work_elems: usize) -> u64 {
        if let Some(&cycles) = self.cache.get(&(sig, warps)) {
            return cycles;
        }
        let threads = warps as usize * WARP_THREADS * 2;
        work_elems.div_ceil(threads).max(1) as u64
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}
