//! Device memory and kernel launch abstraction
//!
//! A [`Device`] owns buffers addressed by [`BufferHandle`] and runs
//! element-wise launches on an ordered stream:
//!
//! ```text
//! Tensor (device resident)
//!   ↓ holds
//! BufferHandle ──► Device::{allocate, copy_to_device, copy_to_host, free}
//!                  Device::launch ──► stream ──► Device::synchronize
//! ```
//!
//! Launches are asynchronous. Copies back to the host wait for every
//! launch queued before them, the same ordering a single device stream
//! gives.

mod cuda;
mod emulated;
mod memory;

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::kernel::math::ElementwiseOp;

pub use cuda::CudaDevice;
pub use emulated::EmulatedDevice;
pub use memory::MemoryManager;

/// Handle to an allocated device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

impl BufferHandle {
    /// Create a new buffer handle
    pub const fn new(id: u64) -> Self {
        BufferHandle(id)
    }

    /// Get the internal ID
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// One element-wise kernel launch over float32 buffers.
///
/// A binary input holding a single element is broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementwiseLaunch {
    pub op: ElementwiseOp,
    pub inputs: Vec<BufferHandle>,
    /// Element count of each input, parallel to `inputs`.
    pub input_elements: Vec<usize>,
    pub output: BufferHandle,
    pub elements: usize,
}

/// Device memory plus an ordered launch stream.
///
/// Implementations use interior mutability so one device can be shared by
/// every tensor placed on it.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    // ============================================================================================
    // Memory
    // ============================================================================================

    /// Allocate a zeroed buffer of `size` bytes.
    fn allocate(&self, size: usize) -> Result<BufferHandle>;

    fn free(&self, handle: BufferHandle) -> Result<()>;

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize>;

    /// Copy `data` into the front of the buffer.
    fn copy_to_device(&self, handle: BufferHandle, data: &[u8]) -> Result<()>;

    /// Fill `data` from the front of the buffer, after all queued launches.
    fn copy_to_host(&self, handle: BufferHandle, data: &mut [u8]) -> Result<()>;

    // ============================================================================================
    // Execution
    // ============================================================================================

    /// Queue a launch on the stream.
    fn launch(&self, launch: ElementwiseLaunch) -> Result<()>;

    /// Block until every queued launch has finished.
    fn synchronize(&self) -> Result<()>;
}

/// Whether two handles refer to the same device instance.
pub fn same_device(a: &Arc<dyn Device>, b: &Arc<dyn Device>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn check_launch_shape(launch: &ElementwiseLaunch) -> Result<()> {
    use crate::error::BackendError;

    if launch.inputs.len() != launch.op.arity() || launch.input_elements.len() != launch.inputs.len() {
        return Err(BackendError::execution_error(format!(
            "{:?} launch expects {} inputs, got {}",
            launch.op,
            launch.op.arity(),
            launch.inputs.len()
        )));
    }
    for &count in &launch.input_elements {
        if count != launch.elements && count != 1 {
            return Err(BackendError::ShapeMismatch(format!(
                "input of {count} elements cannot broadcast to {}",
                launch.elements
            )));
        }
    }
    Ok(())
}
