use std::sync::Arc;

use cudarc::driver::sys::CUdevice_attribute;
use cudarc::driver::{CudaSlice, DevicePtr};

mod error;
use error::WrapErr;

use crate::device::{DeviceAddress, DeviceInfo, DeviceManager, ExportHandle};
use crate::catalog::WARP_THREADS;
use crate::Result;

/// `DeviceManager` over a live CUDA context. Arenas are plain device
/// allocations kept alive for the scheduler's lifetime; exports rely on
/// unified addressing between peer contexts of one process, so the handle is
/// the device pointer itself.
pub struct CudaDevice {
    context: Arc<cudarc::driver::CudaContext>,
    stream: Arc<cudarc::driver::CudaStream>,
    arenas: Vec<CudaSlice<u8>>,
}

impl CudaDevice {
    pub fn new(ordinal: usize) -> Result<Self> {
        let context = cudarc::driver::CudaContext::new(ordinal).w()?;
        let stream = context.new_stream().w()?;
        Ok(Self {
            context,
            stream,
            arenas: Vec::new(),
        })
    }

    pub fn stream(&self) -> Arc<cudarc::driver::CudaStream> {
        self.stream.clone()
    }
}

impl DeviceManager for CudaDevice {
    fn device_info(&self) -> DeviceInfo {
        let sm_count = self
            .context
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)
            .unwrap_or(1) as u32;
        let threads_per_sm = self
            .context
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_MULTIPROCESSOR)
            .unwrap_or(WARP_THREADS as i32) as u32;
        let bytes_free = cudarc::driver::result::mem_get_info()
            .map(|(free, _total)| free as u64)
            .unwrap_or(0);
        DeviceInfo {
            sm_count,
            warps_per_sm: threads_per_sm / WARP_THREADS as u32,
            bytes_free,
        }
    }

    fn allocate_arena(&mut self, bytes: u64) -> Result<DeviceAddress> {
        let slice = self.stream.alloc_zeros::<u8>(bytes as usize).w()?;
        let addr = {
            let (ptr, _sync) = slice.device_ptr(&self.stream);
            ptr
        };
        self.arenas.push(slice);
        Ok(DeviceAddress(addr))
    }

    fn register_export(
        &mut self,
        _sid: i32,
        addr: DeviceAddress,
        bytes: u64,
    ) -> Result<ExportHandle> {
        Ok(ExportHandle { raw: addr.0, bytes })
    }

    fn resolve_import(&mut self, _remote_rank: usize, handle: ExportHandle) -> Result<DeviceAddress> {
        Ok(DeviceAddress(handle.raw))
    }
}
