use crate::{Error, Result};

/// Compute and memory budget of one GPU, as the packer sees it.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub sm_count: u32,
    pub warps_per_sm: u32,
    pub bytes_free: u64,
}

impl DeviceInfo {
    /// Concurrent warp budget for one launch entry.
    pub fn warp_budget(&self) -> u32 {
        self.sm_count * self.warps_per_sm
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress(pub u64);

/// Shareable token for an exported device region; the transport moves it
/// between ranks, `resolve_import` maps it back into an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportHandle {
    pub raw: u64,
    pub bytes: u64,
}

/// Driver-side surface the scheduler plans against.
pub trait DeviceManager {
    fn device_info(&self) -> DeviceInfo;

    /// Carve one contiguous arena; the planner subdivides it itself.
    fn allocate_arena(&mut self, bytes: u64) -> Result<DeviceAddress>;

    fn register_export(&mut self, sid: i32, addr: DeviceAddress, bytes: u64)
        -> Result<ExportHandle>;

    fn resolve_import(&mut self, remote_rank: usize, handle: ExportHandle)
        -> Result<DeviceAddress>;
}

/// Address-space-only device used by tests and dry-run planning. Hands out
/// synthetic addresses and keeps the export registry in a vec; no bytes are
/// ever touched.
pub struct HostDevice {
    info: DeviceInfo,
    next_base: u64,
    allocated: u64,
    exports: Vec<(i32, ExportHandle)>,
}

impl HostDevice {
    pub fn new(sm_count: u32, warps_per_sm: u32, bytes_free: u64) -> Self {
        Self {
            info: DeviceInfo {
                sm_count,
                warps_per_sm,
                bytes_free,
            },
            next_base: 0x1000_0000,
            allocated: 0,
            exports: Vec::new(),
        }
    }

    pub fn exports(&self) -> &[(i32, ExportHandle)] {
        &self.exports
    }
}

impl DeviceManager for HostDevice {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            bytes_free: self.info.bytes_free - self.allocated,
            ..self.info
        }
    }

    fn allocate_arena(&mut self, bytes: u64) -> Result<DeviceAddress> {
        if bytes > self.info.bytes_free - self.allocated {
            return Err(Error::OutOfDeviceMemory {
                planned: bytes,
                available: self.info.bytes_free - self.allocated,
            }
            .bt());
        }
        let base = self.next_base;
        self.next_base += bytes.max(1).next_multiple_of(0x1000);
        self.allocated += bytes;
        Ok(DeviceAddress(base))
    }

    fn register_export(
        &mut self,
        sid: i32,
        addr: DeviceAddress,
        bytes: u64,
    ) -> Result<ExportHandle> {
        let handle = ExportHandle { raw: addr.0, bytes };
        self.exports.push((sid, handle));
        Ok(handle)
    }

    fn resolve_import(&mut self, _remote_rank: usize, handle: ExportHandle) -> Result<DeviceAddress> {
        Ok(DeviceAddress(handle.raw))
    }
}
