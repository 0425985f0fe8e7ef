//! Execution backends for tessera programs
//!
//! This crate provides:
//! - **Tensors**: resizable typed buffers on the host or a [`Device`]
//! - **Devices**: buffer management and element-wise launches
//!   ([`EmulatedDevice`], [`CudaDevice`] behind the `cuda` feature)
//! - **Kernels**: per-operation host and GPU kernels behind a [`KernelRegistry`]
//! - **Accelerator runtime**: graph conversion into a [`Network`], plan
//!   compilation and engines ([`ReferenceAccelerator`])
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!                    │       tessera-core Program    │
//!                    └──────┬───────────┬───────────┘
//!                           │           │
//!              ┌────────────▼───┐   ┌───▼──────────────────────┐
//!              │ KernelRegistry │   │ ConverterRegistry        │
//!              │  host │ gpu    │   │ Accelerator ─► Engine    │
//!              └───┬───────┬────┘   │   ExecutionContext       │
//!                  │       │        └───────────┬──────────────┘
//!                  │       ▼                    │
//!                  │   Device (launch, sync)    │
//!                  ▼       ▼                    ▼
//!              ┌──────────────────────────────────────────────┐
//!              │           Tensor (Arc<RwLock<_>>)             │
//!              └──────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tessera_backends::{Device, EmulatedDevice, KernelContext, KernelRegistry, KernelTarget, Tensor, TensorMap};
//! use tessera_ir::{OperandId, Operation, OperationId, OperationType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device: Arc<dyn Device> = Arc::new(EmulatedDevice::new());
//! let output = Tensor::host().shared();
//! let mut tensors = TensorMap::new();
//! tensors.insert(OperandId(0), Tensor::from_f32(&[2], &[-1.0, 1.0])?.shared());
//! tensors.insert(OperandId(1), output.clone());
//!
//! let relu = Operation {
//!     id: OperationId(0),
//!     op_type: OperationType::Relu,
//!     inputs: vec![OperandId(0)],
//!     outputs: vec![OperandId(1)],
//! };
//! let mut kernel = KernelRegistry::with_defaults().create(KernelTarget::Gpu, OperationType::Relu)?;
//! kernel.execute(&relu, &tensors, &KernelContext::with_device(device.clone()))?;
//! device.synchronize()?;
//!
//! assert_eq!(output.read().to_f32_vec()?, vec![0.0, 1.0]);
//! # Ok(())
//! # }
//! ```

pub mod accelerator;
pub mod device;
pub mod error;
pub mod kernel;
pub mod tensor;

// Re-export public API
pub use accelerator::{
    Accelerator, BuilderConfig, ConverterRegistry, DeviceKind, Engine, ExecutionContext, Int8Calibrator, Network,
    OptimizationProfile, PrecisionMode, ReferenceAccelerator,
};
pub use device::{BufferHandle, CudaDevice, Device, ElementwiseLaunch, EmulatedDevice, MemoryManager};
pub use error::{BackendError, Result};
pub use kernel::{Kernel, KernelContext, KernelFactory, KernelRegistry, KernelTarget, TensorMap};
pub use tensor::{Placement, Tensor, TensorRef};
