//! Host-memory buffer storage behind the emulated device

use std::collections::HashMap;

use super::BufferHandle;
use crate::error::{BackendError, Result};

/// Buffers keyed by handle id, allocated from the heap.
#[derive(Debug)]
pub struct MemoryManager {
    buffers: HashMap<u64, Vec<u8>>,
    next_buffer_id: u64,
    allocated_bytes: usize,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            next_buffer_id: 1,
            allocated_bytes: 0,
        }
    }

    // ============================================================================================
    // Buffer Management
    // ============================================================================================

    /// Allocate a zeroed buffer
    pub fn allocate_buffer(&mut self, size: usize) -> Result<BufferHandle> {
        let id = self.next_buffer_id;
        self.next_buffer_id += 1;

        self.buffers.insert(id, vec![0u8; size]);
        self.allocated_bytes += size;

        Ok(BufferHandle::new(id))
    }

    /// Free a buffer
    pub fn free_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let buffer = self
            .buffers
            .remove(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        self.allocated_bytes -= buffer.len();
        Ok(())
    }

    /// Copy data into the front of a buffer
    pub fn copy_to_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let buffer = self.buffer_mut(handle)?;

        if data.len() > buffer.len() {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: data.len(),
                buffer_size: buffer.len(),
            });
        }

        buffer[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy data out of the front of a buffer
    pub fn copy_from_buffer(&self, handle: BufferHandle, data: &mut [u8]) -> Result<()> {
        let buffer = self.buffer(handle)?;

        if data.len() > buffer.len() {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: data.len(),
                buffer_size: buffer.len(),
            });
        }

        data.copy_from_slice(&buffer[..data.len()]);
        Ok(())
    }

    pub fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.buffer(handle).map(Vec::len)
    }

    pub fn buffer(&self, handle: BufferHandle) -> Result<&Vec<u8>> {
        self.buffers
            .get(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    pub fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut Vec<u8>> {
        self.buffers
            .get_mut(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    /// Number of live buffers
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Bytes held by live buffers
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}
