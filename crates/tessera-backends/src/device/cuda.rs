//! CUDA device memory through cudarc
//!
//! Buffers are real device allocations. Element-wise launches are staged
//! through the host: inputs are read back, evaluated with rayon and the
//! result uploaded, all in stream order at [`Device::synchronize`].

#[cfg(feature = "cuda")]
use std::collections::{HashMap, VecDeque};
#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaDevice as DriverDevice, CudaSlice};
#[cfg(feature = "cuda")]
use parking_lot::{Mutex, RwLock};

#[cfg(feature = "cuda")]
use super::{check_launch_shape, ElementwiseLaunch};
use super::{BufferHandle, Device};
use crate::error::{BackendError, Result};
#[cfg(feature = "cuda")]
use crate::kernel::math::{bytes_to_f32, f32_to_bytes};

#[cfg(feature = "cuda")]
struct CudaMemory {
    buffers: HashMap<u64, (CudaSlice<u8>, usize)>,
    next_buffer_handle: u64,
}

/// NVIDIA GPU selected by ordinal.
#[cfg(feature = "cuda")]
pub struct CudaDevice {
    name: String,
    device: Arc<DriverDevice>,
    memory: RwLock<CudaMemory>,
    stream: Mutex<VecDeque<ElementwiseLaunch>>,
}

#[cfg(feature = "cuda")]
impl CudaDevice {
    /// Open the GPU with the given ordinal.
    pub fn new(ordinal: usize) -> Result<Self> {
        let device = DriverDevice::new(ordinal)
            .map_err(|e| BackendError::Device(format!("CUDA device {ordinal} unavailable: {e}")))?;
        Ok(Self {
            name: format!("cuda:{ordinal}"),
            device,
            memory: RwLock::new(CudaMemory {
                buffers: HashMap::new(),
                next_buffer_handle: 1,
            }),
            stream: Mutex::new(VecDeque::new()),
        })
    }

    pub fn is_available() -> bool {
        DriverDevice::new(0).is_ok()
    }

    fn read_back(&self, handle: BufferHandle, data: &mut [u8]) -> Result<()> {
        let memory = self.memory.read();
        let (slice, size) = memory
            .buffers
            .get(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        if data.len() > *size {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: data.len(),
                buffer_size: *size,
            });
        }
        let view = slice.slice(0..data.len());
        self.device
            .dtoh_sync_copy_into(&view, data)
            .map_err(|e| BackendError::Device(format!("CUDA device-to-host copy failed: {e}")))
    }

    fn write(&self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let mut memory = self.memory.write();
        let (slice, size) = memory
            .buffers
            .get_mut(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        if data.len() > *size {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: data.len(),
                buffer_size: *size,
            });
        }
        let mut view = slice.slice_mut(0..data.len());
        self.device
            .htod_sync_copy_into(data, &mut view)
            .map_err(|e| BackendError::Device(format!("CUDA host-to-device copy failed: {e}")))
    }

    fn drain(&self) -> Result<()> {
        let launches: Vec<ElementwiseLaunch> = self.stream.lock().drain(..).collect();
        for launch in launches {
            let mut inputs = Vec::with_capacity(launch.inputs.len());
            for (&handle, &count) in launch.inputs.iter().zip(&launch.input_elements) {
                let mut bytes = vec![0u8; count * 4];
                self.read_back(handle, &mut bytes)?;
                inputs.push(bytes_to_f32(&bytes));
            }
            let views: Vec<&[f32]> = inputs.iter().map(Vec::as_slice).collect();
            let mut output = vec![0f32; launch.elements];
            launch.op.evaluate(&views, &mut output)?;
            self.write(launch.output, &f32_to_bytes(&output))?;
        }
        self.device
            .synchronize()
            .map_err(|e| BackendError::Device(format!("CUDA synchronize failed: {e}")))
    }
}

#[cfg(feature = "cuda")]
impl Device for CudaDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, size: usize) -> Result<BufferHandle> {
        // zero-length allocations are rejected by the driver
        let slice = self
            .device
            .alloc_zeros::<u8>(size.max(1))
            .map_err(|e| BackendError::Device(format!("CUDA buffer allocation failed: {e}")))?;
        let mut memory = self.memory.write();
        let handle = BufferHandle::new(memory.next_buffer_handle);
        memory.next_buffer_handle += 1;
        memory.buffers.insert(handle.id(), (slice, size));
        Ok(handle)
    }

    fn free(&self, handle: BufferHandle) -> Result<()> {
        self.drain()?;
        self.memory
            .write()
            .buffers
            .remove(&handle.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.memory
            .read()
            .buffers
            .get(&handle.id())
            .map(|(_, size)| *size)
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    fn copy_to_device(&self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        self.drain()?;
        self.write(handle, data)
    }

    fn copy_to_host(&self, handle: BufferHandle, data: &mut [u8]) -> Result<()> {
        self.drain()?;
        self.read_back(handle, data)
    }

    fn launch(&self, launch: ElementwiseLaunch) -> Result<()> {
        check_launch_shape(&launch)?;
        self.stream.lock().push_back(launch);
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.drain()
    }
}

// Stub when the `cuda` feature is disabled
#[cfg(not(feature = "cuda"))]
pub struct CudaDevice;

#[cfg(not(feature = "cuda"))]
impl CudaDevice {
    pub fn new(_ordinal: usize) -> Result<Self> {
        Err(BackendError::unsupported("CUDA device requires the 'cuda' feature"))
    }

    pub fn is_available() -> bool {
        false
    }
}

#[cfg(not(feature = "cuda"))]
impl Device for CudaDevice {
    fn name(&self) -> &str {
        "cuda:disabled"
    }

    fn allocate(&self, _size: usize) -> Result<BufferHandle> {
        Err(BackendError::unsupported("CUDA device requires the 'cuda' feature"))
    }

    fn free(&self, handle: BufferHandle) -> Result<()> {
        Err(BackendError::InvalidBufferHandle(handle.id()))
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        Err(BackendError::InvalidBufferHandle(handle.id()))
    }

    fn copy_to_device(&self, handle: BufferHandle, _data: &[u8]) -> Result<()> {
        Err(BackendError::InvalidBufferHandle(handle.id()))
    }

    fn copy_to_host(&self, handle: BufferHandle, _data: &mut [u8]) -> Result<()> {
        Err(BackendError::InvalidBufferHandle(handle.id()))
    }

    fn launch(&self, _launch: super::ElementwiseLaunch) -> Result<()> {
        Err(BackendError::unsupported("CUDA device requires the 'cuda' feature"))
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}
