//! Device emulated in host memory
//!
//! Buffers live in a [`MemoryManager`]; launches are queued on an in-order
//! stream and executed with rayon when the stream is drained. Every memory
//! operation drains the stream first, so copies and frees observe all
//! earlier launches.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tessera_tracing::performance::{record_kernel, record_transfer};

use super::{check_launch_shape, BufferHandle, Device, ElementwiseLaunch, MemoryManager};
use crate::error::{BackendError, Result};
use crate::kernel::math::{bytes_to_f32, f32_to_bytes};

/// Host-memory device with an asynchronous launch stream.
pub struct EmulatedDevice {
    name: String,
    memory: Arc<RwLock<MemoryManager>>,
    stream: Mutex<VecDeque<ElementwiseLaunch>>,
    completed_launches: AtomicU64,
    synchronizations: AtomicU64,
}

impl EmulatedDevice {
    pub fn new() -> Self {
        Self::with_name("emulated")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory: Arc::new(RwLock::new(MemoryManager::new())),
            stream: Mutex::new(VecDeque::new()),
            completed_launches: AtomicU64::new(0),
            synchronizations: AtomicU64::new(0),
        }
    }

    /// Launches queued but not yet executed.
    pub fn pending_launches(&self) -> usize {
        self.stream.lock().len()
    }

    /// Launches executed so far.
    pub fn completed_launches(&self) -> u64 {
        self.completed_launches.load(Ordering::Relaxed)
    }

    /// Explicit [`Device::synchronize`] calls so far.
    pub fn synchronizations(&self) -> u64 {
        self.synchronizations.load(Ordering::Relaxed)
    }

    /// Buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.memory.read().buffer_count()
    }

    fn drain(&self) -> Result<()> {
        let launches: Vec<ElementwiseLaunch> = self.stream.lock().drain(..).collect();
        if launches.is_empty() {
            return Ok(());
        }
        let mut memory = self.memory.write();
        for launch in launches {
            let start = Instant::now();
            run_launch(&mut memory, &launch)?;
            self.completed_launches.fetch_add(1, Ordering::Relaxed);
            record_kernel(launch.op.name(), launch.elements, start.elapsed().as_micros() as u64);
        }
        Ok(())
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for EmulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, size: usize) -> Result<BufferHandle> {
        self.memory.write().allocate_buffer(size)
    }

    fn free(&self, handle: BufferHandle) -> Result<()> {
        self.drain()?;
        self.memory.write().free_buffer(handle)
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.memory.read().buffer_size(handle)
    }

    fn copy_to_device(&self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        self.drain()?;
        let start = Instant::now();
        self.memory.write().copy_to_buffer(handle, data)?;
        record_transfer(data.len(), "H2D", start.elapsed().as_micros() as u64);
        Ok(())
    }

    fn copy_to_host(&self, handle: BufferHandle, data: &mut [u8]) -> Result<()> {
        self.drain()?;
        let start = Instant::now();
        self.memory.read().copy_from_buffer(handle, data)?;
        record_transfer(data.len(), "D2H", start.elapsed().as_micros() as u64);
        Ok(())
    }

    fn launch(&self, launch: ElementwiseLaunch) -> Result<()> {
        check_launch_shape(&launch)?;
        self.stream.lock().push_back(launch);
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.synchronizations.fetch_add(1, Ordering::Relaxed);
        self.drain()
    }
}

fn run_launch(memory: &mut MemoryManager, launch: &ElementwiseLaunch) -> Result<()> {
    let mut inputs = Vec::with_capacity(launch.inputs.len());
    for (&handle, &count) in launch.inputs.iter().zip(&launch.input_elements) {
        let bytes = memory.buffer(handle)?;
        let needed = count * 4;
        if bytes.len() < needed {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: needed,
                buffer_size: bytes.len(),
            });
        }
        inputs.push(bytes_to_f32(&bytes[..needed]));
    }
    let views: Vec<&[f32]> = inputs.iter().map(Vec::as_slice).collect();
    let mut output = vec![0f32; launch.elements];
    launch.op.evaluate(&views, &mut output)?;
    memory.copy_to_buffer(launch.output, &f32_to_bytes(&output))
}
