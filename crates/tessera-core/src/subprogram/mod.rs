//! Backend-specific executors for single sub-models
//!
//! ```text
//! BackendKind::Accelerator ──► AcceleratorSubProgram  (network ─► plan ─► engine)
//! BackendKind::GpuKernels  ──► KernelSubProgram(Gpu)  (kernel per operation + device barrier)
//! BackendKind::HostKernels ──► KernelSubProgram(Host) (kernel per operation)
//! ```

mod accelerator;
mod kernel;

use std::sync::Arc;

use futures::future::LocalBoxFuture;
use tessera_backends::{KernelTarget, TensorRef};
use tessera_ir::Graph;

pub use accelerator::AcceleratorSubProgram;
pub use kernel::KernelSubProgram;

use crate::config::Context;
use crate::error::Result;
use crate::partition::BackendKind;

/// Executes one sub-model's graph on one backend.
///
/// `inputs` and `outputs` are parallel to the sub-graph's input and output
/// operands. Building again discards whatever the previous build produced.
pub trait SubProgram {
    fn backend(&self) -> BackendKind;

    /// Compile `graph` from scratch.
    fn build(&mut self, graph: &Arc<Graph>) -> Result<()>;

    /// Restore from a blob previously returned by [`SubProgram::cache_blob`].
    fn build_from_cache(&mut self, graph: &Arc<Graph>, blob: &[u8]) -> Result<()>;

    /// Backend-specific bytes to store in the program cache.
    fn cache_blob(&self) -> &[u8];

    fn execute<'a>(&'a mut self, inputs: &'a [TensorRef], outputs: &'a [TensorRef]) -> LocalBoxFuture<'a, Result<()>>;
}

/// Instantiate the sub-program serving `backend`.
pub fn create(backend: BackendKind, context: Arc<Context>) -> Box<dyn SubProgram> {
    match backend {
        BackendKind::Accelerator => Box::new(AcceleratorSubProgram::new(context)),
        BackendKind::GpuKernels => Box::new(KernelSubProgram::new(KernelTarget::Gpu, context)),
        BackendKind::HostKernels => Box::new(KernelSubProgram::new(KernelTarget::Host, context)),
    }
}
