//! Kernels and the registry that instantiates them
//!
//! A kernel executes one operation over tensors looked up by operand id.
//! Kernel sub-programs ask the [`KernelRegistry`] for one fresh kernel
//! instance per operation when they are built.
//!
//! ```text
//! (KernelTarget, OperationType) ──► KernelFactory ──► Box<dyn Kernel>
//! ```

pub mod gpu;
pub mod host;
pub mod math;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tessera_ir::{OperandId, Operation, OperationType};

use crate::device::Device;
use crate::error::{BackendError, Result};
use crate::tensor::TensorRef;

/// Operand-to-tensor map a kernel reads from and writes to.
pub type TensorMap = HashMap<OperandId, TensorRef>;

/// Zero-argument constructor for a kernel instance.
pub type KernelFactory = Arc<dyn Fn() -> Box<dyn Kernel> + Send + Sync>;

/// Backend a kernel runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelTarget {
    Gpu,
    Host,
}

impl fmt::Display for KernelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelTarget::Gpu => f.write_str("gpu"),
            KernelTarget::Host => f.write_str("host"),
        }
    }
}

/// Resources available to a running kernel.
#[derive(Clone, Default)]
pub struct KernelContext {
    pub device: Option<Arc<dyn Device>>,
}

impl KernelContext {
    pub fn host() -> Self {
        Self { device: None }
    }

    pub fn with_device(device: Arc<dyn Device>) -> Self {
        Self { device: Some(device) }
    }

    /// The device, or an error naming the kernel that needed it.
    pub fn require_device(&self, kernel: &str) -> Result<&Arc<dyn Device>> {
        self.device
            .as_ref()
            .ok_or_else(|| BackendError::execution_error(format!("{kernel} needs a device but none is configured")))
    }
}

/// Executes one operation.
///
/// Kernels resize their output tensors. Input and output tensors are
/// distinct, so a kernel may read an input guard, drop it, then write.
pub trait Kernel: Send {
    fn name(&self) -> &'static str;

    fn execute(&mut self, operation: &Operation, tensors: &TensorMap, context: &KernelContext) -> Result<()>;
}

/// Fetch the tensor mapped to `id`.
pub fn tensor_for<'a>(tensors: &'a TensorMap, id: &OperandId) -> Result<&'a TensorRef> {
    tensors
        .get(id)
        .ok_or_else(|| BackendError::execution_error(format!("no tensor bound to operand {id}")))
}

/// Kernel factories keyed by target and operation type.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    factories: HashMap<(KernelTarget, OperationType), KernelFactory>,
}

impl KernelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in host and GPU kernel.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        host::register(&mut registry);
        gpu::register(&mut registry);
        registry
    }

    /// Register `factory`, replacing any previous entry for the pair.
    pub fn register<F>(&mut self, target: KernelTarget, op_type: OperationType, factory: F)
    where
        F: Fn() -> Box<dyn Kernel> + Send + Sync + 'static,
    {
        self.factories.insert((target, op_type), Arc::new(factory));
    }

    pub fn contains(&self, target: KernelTarget, op_type: OperationType) -> bool {
        self.factories.contains_key(&(target, op_type))
    }

    /// Instantiate a fresh kernel.
    pub fn create(&self, target: KernelTarget, op_type: OperationType) -> Result<Box<dyn Kernel>> {
        self.factories
            .get(&(target, op_type))
            .map(|factory| factory())
            .ok_or(BackendError::KernelNotRegistered { target, op_type })
    }

    /// Operation types served for `target`, sorted.
    pub fn operations(&self, target: KernelTarget) -> Vec<OperationType> {
        let mut ops: Vec<OperationType> = self
            .factories
            .keys()
            .filter(|(t, _)| *t == target)
            .map(|(_, op)| *op)
            .collect();
        ops.sort();
        ops
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("host", &self.operations(KernelTarget::Host))
            .field("gpu", &self.operations(KernelTarget::Gpu))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Kernel for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }

        fn execute(&mut self, _: &Operation, _: &TensorMap, _: &KernelContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn defaults_cover_host_and_gpu() {
        let registry = KernelRegistry::with_defaults();
        assert!(registry.contains(KernelTarget::Host, OperationType::Softmax));
        assert!(registry.contains(KernelTarget::Host, OperationType::Quantize));
        assert!(registry.contains(KernelTarget::Gpu, OperationType::Add));
        assert!(!registry.contains(KernelTarget::Gpu, OperationType::Softmax));
    }

    #[test]
    fn create_reports_missing_kernel() {
        let registry = KernelRegistry::new();
        let err = registry
            .create(KernelTarget::Gpu, OperationType::Relu)
            .err()
            .map(|e| e.to_string());
        assert_eq!(err.as_deref(), Some("no gpu kernel registered for RELU"));
    }

    #[test]
    fn register_replaces_factory() {
        let mut registry = KernelRegistry::with_defaults();
        registry.register(KernelTarget::Host, OperationType::Relu, || Box::new(Noop));
        let kernel = registry.create(KernelTarget::Host, OperationType::Relu).unwrap();
        assert_eq!(kernel.name(), "noop");
    }
}
