//! GPU kernels: element-wise launches on the configured [`Device`](crate::device::Device).
//!
//! Launches are queued; the caller synchronizes the device after each
//! kernel.

use tessera_ir::{element_count, Operation, OperationType, Precision};

use super::math::{broadcast_dims, ElementwiseOp};
use super::{tensor_for, Kernel, KernelContext, KernelRegistry, KernelTarget, TensorMap};
use crate::device::ElementwiseLaunch;
use crate::error::{BackendError, Result};

/// Register every GPU kernel.
pub fn register(registry: &mut KernelRegistry) {
    for op_type in OperationType::ALL {
        if let Some(op) = ElementwiseOp::from_operation(op_type) {
            registry.register(KernelTarget::Gpu, op_type, move || Box::new(GpuElementwise { op }));
        }
    }
}

struct GpuElementwise {
    op: ElementwiseOp,
}

impl Kernel for GpuElementwise {
    fn name(&self) -> &'static str {
        self.op.name()
    }

    fn execute(&mut self, operation: &Operation, tensors: &TensorMap, context: &KernelContext) -> Result<()> {
        let device = context.require_device(self.name())?;
        if operation.inputs.len() != self.op.arity() || operation.outputs.len() != 1 {
            return Err(BackendError::execution_error(format!(
                "{} expects {} inputs and one output",
                operation.op_type,
                self.op.arity()
            )));
        }

        let mut inputs = Vec::with_capacity(operation.inputs.len());
        let mut input_elements = Vec::with_capacity(operation.inputs.len());
        let mut shapes = Vec::with_capacity(operation.inputs.len());
        for id in &operation.inputs {
            let mut tensor = tensor_for(tensors, id)?.write();
            if tensor.precision() != Precision::Float32 {
                return Err(BackendError::type_mismatch(Precision::Float32, tensor.precision()));
            }
            tensor.move_to_device(device)?;
            inputs.push(tensor.device_handle().ok_or(BackendError::Unallocated)?);
            input_elements.push(tensor.element_count());
            shapes.push(tensor.dims().to_vec());
        }

        let dims = match shapes.as_slice() {
            [a, b] => broadcast_dims(a, b)?,
            [x] => x.clone(),
            _ => Vec::new(),
        };
        let elements = element_count(&dims)?;

        let mut output = tensor_for(tensors, &operation.outputs[0])?.write();
        output.set_precision(Precision::Float32);
        output.move_to_device(device)?;
        output.resize(&dims)?;
        let output = output.device_handle().ok_or(BackendError::Unallocated)?;

        device.launch(ElementwiseLaunch {
            op: self.op,
            inputs,
            input_elements,
            output,
            elements,
        })
    }
}
