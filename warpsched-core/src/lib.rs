mod catalog;
#[cfg(feature = "cuda")]
mod cuda_device;
mod device;
mod dtype;
mod error;
mod graph;
mod ipc;
mod model;
mod sched;
mod shape;
mod tensor;

pub use catalog::{
    CudaCatalog, KernelCatalog, KernelSignature, KernelSourceUnit, SeqKernelOp, ELEMS_PER_WARP,
    MAX_OP_WARPS, WARP_THREADS,
};
#[cfg(feature = "cuda")]
pub use cuda_device::CudaDevice;
pub use device::{DeviceAddress, DeviceInfo, DeviceManager, ExportHandle, HostDevice};
pub use dtype::DType;
pub use error::{Error, Result};
pub use graph::{optimize_model, FusedStage, Op, OpConfig, OpCost, OpGraph, OpId, Opcode};
pub use ipc::{IpcTransport, LocalTransport};
pub use model::{Model, MATMUL_TILE};
pub use sched::{
    ArenaStrategy, BufInfo, BufferPlan, FirstFitPacker, KernelPlan, KernelTimer, Packer,
    PackerKind, PartitionedPacker, Profiler, Sched, SchedOp, SchedOpSeq, ScheduleOptions,
    Scheduler,
};
pub use shape::{lcm, pad, Dims, MAX_DIMS};
pub use tensor::{Tensor, TensorBuf, TensorBufId, TensorId, LOCAL_RANK, NO_SID};
