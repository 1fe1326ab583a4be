use crate::{DType, Opcode};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid dims {dims:?} for {what}: {reason}")]
    ShapeInvalid {
        what: String,
        dims: Vec<usize>,
        reason: String,
    },

    #[error("cycle in op graph through op {op_id} ({opcode:?})")]
    CyclicGraph { op_id: usize, opcode: Opcode },

    #[error("arena needs {planned} bytes but device has {available} bytes free")]
    OutOfDeviceMemory { planned: u64, available: u64 },

    #[error("import (rank {rank}, sid {sid}) unresolved after {waited_ms}ms")]
    ImportUnresolved {
        rank: usize,
        sid: i32,
        waited_ms: u64,
    },

    #[error("sid {sid} exported by both buf {first} and buf {second}")]
    ExportConflict {
        sid: i32,
        first: usize,
        second: usize,
    },

    #[error("sequence of {warps} warps at depth {depth} exceeds device budget of {budget} warps")]
    PackerInfeasible { depth: usize, warps: u32, budget: u32 },

    #[error("no kernel template for {opcode:?} over {dtype:?}")]
    CodegenUnsupported { opcode: Opcode, dtype: DType },

    #[error("scheduler instance was already used; scheduling is single-shot")]
    AlreadyScheduled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "cuda")]
    #[error(transparent)]
    Cuda(Box<dyn std::error::Error + Send + Sync>),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }
}
