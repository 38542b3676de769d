//! Device-resident transport buffers (CUDA)

use crate::{Error, Result};
use cudarc::driver::{CudaDevice, CudaSlice};
use std::sync::Arc;

/// Device buffer of storage words
pub struct CudaBuffer {
    device: Arc<CudaDevice>,
    slice: CudaSlice<u64>,
    words: usize,
}

impl CudaBuffer {
    /// Open the device used by a device arena
    pub fn open_device(device_id: usize) -> Result<Arc<CudaDevice>> {
        CudaDevice::new(device_id).map_err(|e| Error::Cuda(e.to_string()))
    }

    /// Allocate a zero-filled device buffer
    pub fn alloc(device: &Arc<CudaDevice>, words: usize) -> Result<Self> {
        let slice: CudaSlice<u64> = device
            .alloc_zeros(words)
            .map_err(|e| Error::Cuda(e.to_string()))?;

        Ok(Self {
            device: Arc::clone(device),
            slice,
            words,
        })
    }

    /// Get size in storage words
    pub fn words(&self) -> usize {
        self.words
    }

    /// Copy host words into the buffer starting at `offset`
    pub fn copy_in(&mut self, offset: usize, src: &[u64]) -> Result<()> {
        let mut view = self.slice.slice_mut(offset..offset + src.len());
        self.device
            .htod_sync_copy_into(src, &mut view)
            .map_err(|e| Error::Cuda(e.to_string()))
    }

    /// Copy words starting at `offset` out to the host
    pub fn copy_out(&self, offset: usize, dst: &mut [u64]) -> Result<()> {
        let view = self.slice.slice(offset..offset + dst.len());
        self.device
            .dtoh_sync_copy_into(&view, dst)
            .map_err(|e| Error::Cuda(e.to_string()))
    }

    /// Stage the whole buffer on the host
    pub fn to_host(&self) -> Result<Vec<u64>> {
        self.device
            .dtoh_sync_copy(&self.slice)
            .map_err(|e| Error::Cuda(e.to_string()))
    }

    /// Block until all copies queued on the device stream are done
    pub fn synchronize(&self) -> Result<()> {
        self.device
            .synchronize()
            .map_err(|e| Error::Cuda(e.to_string()))
    }
}
