//! Resizable typed tensors with host- or device-resident storage.
//!
//! Storage is allocated lazily by [`Tensor::resize`]. Device storage only
//! grows: shrinking keeps the existing buffer, so a tensor first sized to
//! its worst-case shape can be reshaped in place afterwards.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tessera_ir::{element_count, Precision};
use tessera_tracing::performance::record_transfer;

use crate::device::{same_device, BufferHandle, Device};
use crate::error::{BackendError, Result};
use crate::kernel::math::{decode_floats, encode_floats};

/// Shared handle used wherever a tensor crosses a component boundary.
pub type TensorRef = Arc<RwLock<Tensor>>;

/// Where a tensor's bytes live once allocated.
#[derive(Clone)]
pub enum Placement {
    Host,
    Device(Arc<dyn Device>),
}

impl fmt::Debug for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Host => f.write_str("Host"),
            Placement::Device(device) => write!(f, "Device({})", device.name()),
        }
    }
}

struct DeviceBuffer {
    device: Arc<dyn Device>,
    handle: BufferHandle,
    capacity: usize,
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.free(self.handle) {
            tracing::warn!(handle = %self.handle, error = %err, "device_buffer_free_failed");
        }
    }
}

enum Storage {
    Unallocated,
    Host(Vec<u8>),
    Device(DeviceBuffer),
}

pub struct Tensor {
    precision: Precision,
    dims: Vec<i32>,
    placement: Placement,
    storage: Storage,
}

impl Tensor {
    pub fn new(placement: Placement) -> Self {
        Self {
            precision: Precision::Float32,
            dims: Vec::new(),
            placement,
            storage: Storage::Unallocated,
        }
    }

    pub fn host() -> Self {
        Self::new(Placement::Host)
    }

    pub fn on_device(device: Arc<dyn Device>) -> Self {
        Self::new(Placement::Device(device))
    }

    /// Wrap in a [`TensorRef`].
    pub fn shared(self) -> TensorRef {
        Arc::new(RwLock::new(self))
    }

    /// Host tensor holding float32 `values`.
    pub fn from_f32(dims: &[i32], values: &[f32]) -> Result<Self> {
        let mut tensor = Self::host();
        tensor.write_f32(dims, values)?;
        Ok(tensor)
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Change the element type. Existing bytes are kept as they are.
    pub fn set_precision(&mut self, precision: Precision) {
        self.precision = precision;
    }

    pub fn dims(&self) -> &[i32] {
        &self.dims
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn element_count(&self) -> usize {
        element_count(&self.dims).unwrap_or(0)
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.precision.byte_size()
    }

    pub fn is_allocated(&self) -> bool {
        !matches!(self.storage, Storage::Unallocated)
    }

    pub fn is_device_resident(&self) -> bool {
        matches!(self.storage, Storage::Device(_))
    }

    /// Device buffer backing this tensor, if device resident.
    pub fn device_handle(&self) -> Option<BufferHandle> {
        match &self.storage {
            Storage::Device(buffer) => Some(buffer.handle),
            _ => None,
        }
    }

    /// Set the shape and make sure storage can hold it.
    pub fn resize(&mut self, dims: &[i32]) -> Result<()> {
        let len = element_count(dims)? * self.precision.byte_size();
        self.dims = dims.to_vec();
        let needs_allocation = match &mut self.storage {
            Storage::Unallocated => true,
            Storage::Host(bytes) => {
                bytes.resize(len, 0);
                false
            }
            Storage::Device(buffer) => buffer.capacity < len,
        };
        if needs_allocation {
            self.storage = match &self.placement {
                Placement::Host => Storage::Host(vec![0u8; len]),
                Placement::Device(device) => Storage::Device(DeviceBuffer {
                    handle: device.allocate(len)?,
                    device: Arc::clone(device),
                    capacity: len,
                }),
            };
        }
        Ok(())
    }

    /// Overwrite the contents. `data` must be exactly [`Tensor::byte_len`] bytes.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.byte_len() {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: data.len(),
                buffer_size: self.byte_len(),
            });
        }
        match &mut self.storage {
            Storage::Unallocated => Err(BackendError::Unallocated),
            Storage::Host(bytes) => {
                bytes[..data.len()].copy_from_slice(data);
                Ok(())
            }
            Storage::Device(buffer) => {
                let start = Instant::now();
                buffer.device.copy_to_device(buffer.handle, data)?;
                record_transfer(data.len(), "H2D", start.elapsed().as_micros() as u64);
                Ok(())
            }
        }
    }

    /// Copy the contents into the front of `out`, which must hold at least
    /// [`Tensor::byte_len`] bytes.
    pub fn read_bytes_into(&self, out: &mut [u8]) -> Result<()> {
        let len = self.byte_len();
        if out.len() < len {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: len,
                buffer_size: out.len(),
            });
        }
        match &self.storage {
            Storage::Unallocated => Err(BackendError::Unallocated),
            Storage::Host(bytes) => {
                out[..len].copy_from_slice(&bytes[..len]);
                Ok(())
            }
            Storage::Device(buffer) => {
                let start = Instant::now();
                buffer.device.copy_to_host(buffer.handle, &mut out[..len])?;
                record_transfer(len, "D2H", start.elapsed().as_micros() as u64);
                Ok(())
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.byte_len()];
        self.read_bytes_into(&mut out)?;
        Ok(out)
    }

    /// Contents as float32, converting from the tensor's float precision.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        decode_floats(&self.to_bytes()?, self.precision)
    }

    /// Resize to `dims` and store `values` in the tensor's precision.
    pub fn write_f32(&mut self, dims: &[i32], values: &[f32]) -> Result<()> {
        if element_count(dims)? != values.len() {
            return Err(BackendError::ShapeMismatch(format!(
                "{} values do not fill shape {dims:?}",
                values.len()
            )));
        }
        self.resize(dims)?;
        let bytes = encode_floats(values, self.precision)?;
        self.write_bytes(&bytes)
    }

    /// Move storage onto `device`, preserving contents. No-op when already
    /// placed there.
    pub fn move_to_device(&mut self, device: &Arc<dyn Device>) -> Result<()> {
        if let Placement::Device(current) = &self.placement {
            if same_device(current, device) {
                return Ok(());
            }
        }
        let contents = if self.is_allocated() { Some(self.to_bytes()?) } else { None };
        self.placement = Placement::Device(Arc::clone(device));
        self.storage = Storage::Unallocated;
        if let Some(bytes) = contents {
            let dims = self.dims.clone();
            self.resize(&dims)?;
            self.write_bytes(&bytes)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("precision", &self.precision)
            .field("dims", &self.dims)
            .field("placement", &self.placement)
            .field("allocated", &self.is_allocated())
            .finish()
    }
}
