//! Kernel-per-operation sub-program for the GPU and host backends

use std::sync::Arc;
use std::time::Instant;

use futures::future::{FutureExt, LocalBoxFuture};
use tessera_backends::{Kernel, KernelContext, KernelTarget, Tensor, TensorMap, TensorRef};
use tessera_ir::{Graph, Operand, OperationDag};

use super::SubProgram;
use crate::config::Context;
use crate::error::{Error, Result};
use crate::partition::BackendKind;

/// Runs one registered kernel per operation in topological order.
///
/// Operand tensors are created on first execution and kept until the next
/// build. The GPU flavor keeps them on the context device and waits for the
/// device after every kernel.
pub struct KernelSubProgram {
    target: KernelTarget,
    context: Arc<Context>,
    graph: Option<Arc<Graph>>,
    order: Vec<usize>,
    kernels: Vec<Box<dyn Kernel>>,
    tensors: TensorMap,
    kernel_context: KernelContext,
}

impl KernelSubProgram {
    pub fn new(target: KernelTarget, context: Arc<Context>) -> Self {
        Self {
            target,
            context,
            graph: None,
            order: Vec::new(),
            kernels: Vec::new(),
            tensors: TensorMap::new(),
            kernel_context: KernelContext::host(),
        }
    }

    pub fn target(&self) -> KernelTarget {
        self.target
    }

    /// Kernels in execution order, by name.
    pub fn kernel_names(&self) -> Vec<&'static str> {
        self.kernels.iter().map(|kernel| kernel.name()).collect()
    }

    fn reset(&mut self) {
        self.graph = None;
        self.order.clear();
        self.kernels.clear();
        self.tensors.clear();
    }

    fn new_tensor(&self) -> Tensor {
        match (&self.target, &self.kernel_context.device) {
            (KernelTarget::Gpu, Some(device)) => Tensor::on_device(Arc::clone(device)),
            _ => Tensor::host(),
        }
    }

    fn materialize(&self, operand: &Operand) -> Result<TensorRef> {
        let mut tensor = self.new_tensor();
        tensor.set_precision(operand.ty.precision);
        if let Some(value) = &operand.value {
            tensor.resize(&operand.ty.dims)?;
            tensor.write_bytes(value)?;
        }
        Ok(tensor.shared())
    }

    fn run(&mut self, inputs: &[TensorRef], outputs: &[TensorRef]) -> Result<()> {
        let start = Instant::now();
        let graph = Arc::clone(self.graph.as_ref().ok_or(Error::NotBuilt)?);
        if inputs.len() != graph.input_operands().len() || outputs.len() != graph.output_operands().len() {
            return Err(Error::InvalidArgument(format!(
                "{} sub-program takes {} inputs and {} outputs, got {} and {}",
                self.target,
                graph.input_operands().len(),
                graph.output_operands().len(),
                inputs.len(),
                outputs.len()
            )));
        }

        for (id, tensor) in graph.input_operands().iter().zip(inputs) {
            self.tensors.insert(*id, Arc::clone(tensor));
        }
        for (id, tensor) in graph.output_operands().iter().zip(outputs) {
            self.tensors.insert(*id, Arc::clone(tensor));
        }
        for operand in graph.operands() {
            if !self.tensors.contains_key(&operand.id) {
                let tensor = self.materialize(operand)?;
                self.tensors.insert(operand.id, tensor);
            }
        }

        let device = match self.target {
            KernelTarget::Gpu => Some(Arc::clone(self.kernel_context.require_device("gpu sub-program")?)),
            KernelTarget::Host => None,
        };
        for (kernel, &index) in self.kernels.iter_mut().zip(&self.order) {
            let operation = &graph.operations()[index];
            kernel.execute(operation, &self.tensors, &self.kernel_context)?;
            if let Some(device) = &device {
                device.synchronize()?;
            }
        }
        tracing::debug!(
            target_backend = %self.target,
            kernels = self.kernels.len(),
            duration_us = start.elapsed().as_micros() as u64,
            "kernel_sub_program_executed"
        );
        Ok(())
    }
}

impl SubProgram for KernelSubProgram {
    fn backend(&self) -> BackendKind {
        match self.target {
            KernelTarget::Gpu => BackendKind::GpuKernels,
            KernelTarget::Host => BackendKind::HostKernels,
        }
    }

    #[tracing::instrument(skip_all, fields(kernel_target = %self.target, operations = graph.operations().len()))]
    fn build(&mut self, graph: &Arc<Graph>) -> Result<()> {
        let start = Instant::now();
        self.reset();
        self.kernel_context = match self.target {
            KernelTarget::Gpu => {
                let device = self
                    .context
                    .device
                    .as_ref()
                    .ok_or_else(|| Error::invalid_config("GPU kernel sub-program needs a device"))?;
                KernelContext::with_device(Arc::clone(device))
            }
            KernelTarget::Host => KernelContext::host(),
        };

        let order = OperationDag::new(graph).order()?;
        let kernels = order
            .iter()
            .map(|&index| self.context.kernels.create(self.target, graph.operations()[index].op_type))
            .collect::<tessera_backends::Result<Vec<_>>>()?;

        self.order = order;
        self.kernels = kernels;
        self.graph = Some(Arc::clone(graph));
        tracing::debug!(
            kernels = self.kernels.len(),
            duration_us = start.elapsed().as_micros() as u64,
            "kernel_sub_program_built"
        );
        Ok(())
    }

    fn build_from_cache(&mut self, graph: &Arc<Graph>, blob: &[u8]) -> Result<()> {
        if !blob.is_empty() {
            return Err(Error::corrupt_cache(format!(
                "{} kernel sub-program has no cached state, found {} bytes",
                self.target,
                blob.len()
            )));
        }
        self.build(graph)
    }

    fn cache_blob(&self) -> &[u8] {
        &[]
    }

    fn execute<'a>(&'a mut self, inputs: &'a [TensorRef], outputs: &'a [TensorRef]) -> LocalBoxFuture<'a, Result<()>> {
        async move { self.run(inputs, outputs) }.boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use tessera_backends::{Device, EmulatedDevice};
    use tessera_ir::{OperandType, OperationType};

    use crate::config::ProgramConfig;

    fn relu_then_add_one() -> Arc<Graph> {
        let mut graph = Graph::new();
        let x = graph.add_input(OperandType::float32([3]));
        let one = graph.add_f32_constant([1], &[1.0]).unwrap();
        let t = graph.add_operand(OperandType::float32([3]));
        let y = graph.add_operand(OperandType::float32([3]));
        graph.add_operation(OperationType::Add, [t, one], [y]).unwrap();
        graph.add_operation(OperationType::Relu, [x], [t]).unwrap();
        graph.mark_output(y).unwrap();
        Arc::new(graph)
    }

    fn run(sub_program: &mut KernelSubProgram, values: &[f32]) -> Vec<f32> {
        let input = Tensor::from_f32(&[3], values).unwrap().shared();
        let output = Tensor::host().shared();
        block_on(sub_program.execute(&[input], &[output.clone()])).unwrap();
        let values = output.read().to_f32_vec().unwrap();
        values
    }

    #[test]
    fn host_kernels_run_in_dependency_order() {
        let context = Arc::new(Context::new(ProgramConfig::default()));
        let mut sub_program = KernelSubProgram::new(KernelTarget::Host, context);
        sub_program.build(&relu_then_add_one()).unwrap();

        assert_eq!(sub_program.kernel_names(), vec!["relu", "add"]);
        assert_eq!(run(&mut sub_program, &[-1.0, 0.0, 2.0]), vec![1.0, 1.0, 3.0]);
        assert_eq!(run(&mut sub_program, &[4.0, -4.0, 0.5]), vec![5.0, 1.0, 1.5]);
    }

    #[test]
    fn gpu_flavor_synchronizes_after_every_kernel() {
        let device = Arc::new(EmulatedDevice::new());
        let shared: Arc<dyn Device> = device.clone();
        let context = Arc::new(Context::new(ProgramConfig::default()).with_device(Some(shared)));
        let mut sub_program = KernelSubProgram::new(KernelTarget::Gpu, context);
        sub_program.build(&relu_then_add_one()).unwrap();

        assert_eq!(run(&mut sub_program, &[-1.0, 0.0, 2.0]), vec![1.0, 1.0, 3.0]);
        assert_eq!(device.synchronizations(), 2);
        assert_eq!(device.pending_launches(), 0);
    }

    #[test]
    fn gpu_flavor_needs_a_device() {
        let context = Arc::new(Context::new(ProgramConfig::default()).with_device(None));
        let mut sub_program = KernelSubProgram::new(KernelTarget::Gpu, context);
        let err = sub_program.build(&relu_then_add_one()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn unregistered_operation_fails_the_build() {
        let mut graph = Graph::new();
        let x = graph.add_input(OperandType::float32([2]));
        let y = graph.add_operand(OperandType::float32([2]));
        graph.add_operation(OperationType::Softmax, [x], [y]).unwrap();
        graph.mark_output(y).unwrap();

        let context = Arc::new(Context::new(ProgramConfig::default()));
        let mut sub_program = KernelSubProgram::new(KernelTarget::Gpu, context);
        assert!(sub_program.build(&Arc::new(graph)).is_err());
    }

    #[test]
    fn quantize_reports_feature_not_supported() {
        let mut graph = Graph::new();
        let x = graph.add_input(OperandType::float32([2]));
        let y = graph.add_operand(OperandType::float32([2]));
        graph.add_operation(OperationType::Quantize, [x], [y]).unwrap();
        graph.mark_output(y).unwrap();

        let context = Arc::new(Context::new(ProgramConfig::default()));
        let mut sub_program = KernelSubProgram::new(KernelTarget::Host, context);
        sub_program.build(&Arc::new(graph)).unwrap();

        let input = Tensor::from_f32(&[2], &[1.0, 2.0]).unwrap().shared();
        let output = Tensor::host().shared();
        let err = block_on(sub_program.execute(&[input], &[output])).unwrap_err();
        assert!(matches!(err, Error::FeatureNotSupported(_)));
    }

    #[test]
    fn failing_kernel_stops_the_rest() {
        // x ─► QUANTIZE ─► q ─► RELU ─► y
        let mut graph = Graph::new();
        let x = graph.add_input(OperandType::float32([2]));
        let q = graph.add_operand(OperandType::float32([2]));
        let y = graph.add_operand(OperandType::float32([2]));
        graph.add_operation(OperationType::Quantize, [x], [q]).unwrap();
        graph.add_operation(OperationType::Relu, [q], [y]).unwrap();
        graph.mark_output(y).unwrap();

        let context = Arc::new(Context::new(ProgramConfig::default()));
        let mut sub_program = KernelSubProgram::new(KernelTarget::Host, context);
        sub_program.build(&Arc::new(graph)).unwrap();
        assert_eq!(sub_program.kernel_names(), vec!["quantize", "relu"]);

        let input = Tensor::from_f32(&[2], &[-1.0, 2.0]).unwrap().shared();
        let output = Tensor::host().shared();
        let err = block_on(sub_program.execute(&[input], &[output.clone()])).unwrap_err();
        assert!(matches!(err, Error::FeatureNotSupported(_)));
        assert!(!output.read().is_allocated());
    }

    #[test]
    fn cached_blob_must_be_empty() {
        let context = Arc::new(Context::new(ProgramConfig::default()));
        let mut sub_program = KernelSubProgram::new(KernelTarget::Host, context);
        let err = sub_program.build_from_cache(&relu_then_add_one(), &[1]).unwrap_err();
        assert!(matches!(err, Error::CorruptCache(_)));
        sub_program.build_from_cache(&relu_then_add_one(), &[]).unwrap();
        assert!(sub_program.cache_blob().is_empty());
    }
}
