//! Host (CPU) kernels

use std::time::Instant;

use tessera_ir::{element_count, Operation, OperationType, Precision};
use tessera_tracing::performance::record_kernel;

use super::math::{broadcast_dims, decode_i32, softmax, ElementwiseOp};
use super::{tensor_for, Kernel, KernelContext, KernelRegistry, KernelTarget, TensorMap};
use crate::error::{BackendError, Result};

/// Register every host kernel.
pub fn register(registry: &mut KernelRegistry) {
    for op_type in OperationType::ALL {
        if let Some(op) = ElementwiseOp::from_operation(op_type) {
            registry.register(KernelTarget::Host, op_type, move || Box::new(HostElementwise { op }));
        }
    }
    registry.register(KernelTarget::Host, OperationType::Softmax, || Box::new(HostSoftmax));
    registry.register(KernelTarget::Host, OperationType::Quantize, || Box::new(HostQuantize));
}

struct Input {
    dims: Vec<i32>,
    precision: Precision,
    values: Vec<f32>,
}

fn read_input(tensors: &TensorMap, operation: &Operation, index: usize) -> Result<Input> {
    let id = operation.inputs.get(index).ok_or_else(|| {
        BackendError::execution_error(format!("{} is missing input {index}", operation.op_type))
    })?;
    let tensor = tensor_for(tensors, id)?.read();
    Ok(Input {
        dims: tensor.dims().to_vec(),
        precision: tensor.precision(),
        values: tensor.to_f32_vec()?,
    })
}

fn write_output(
    tensors: &TensorMap,
    operation: &Operation,
    precision: Precision,
    dims: &[i32],
    values: &[f32],
) -> Result<()> {
    let [id] = operation.outputs.as_slice() else {
        return Err(BackendError::execution_error(format!(
            "{} expects one output, got {}",
            operation.op_type,
            operation.outputs.len()
        )));
    };
    let mut tensor = tensor_for(tensors, id)?.write();
    tensor.set_precision(precision);
    tensor.write_f32(dims, values)
}

struct HostElementwise {
    op: ElementwiseOp,
}

impl Kernel for HostElementwise {
    fn name(&self) -> &'static str {
        self.op.name()
    }

    fn execute(&mut self, operation: &Operation, tensors: &TensorMap, _context: &KernelContext) -> Result<()> {
        let start = Instant::now();
        let inputs = (0..self.op.arity())
            .map(|index| read_input(tensors, operation, index))
            .collect::<Result<Vec<_>>>()?;
        let dims = match inputs.as_slice() {
            [a, b] => broadcast_dims(&a.dims, &b.dims)?,
            [x] => x.dims.clone(),
            _ => Vec::new(),
        };
        let count = element_count(&dims)?;
        let views: Vec<&[f32]> = inputs.iter().map(|input| input.values.as_slice()).collect();
        let mut output = vec![0f32; count];
        self.op.evaluate(&views, &mut output)?;
        write_output(tensors, operation, inputs[0].precision, &dims, &output)?;
        record_kernel(self.op.name(), count, start.elapsed().as_micros() as u64);
        Ok(())
    }
}

/// Softmax over an axis given by an optional int32 constant (default last).
struct HostSoftmax;

impl Kernel for HostSoftmax {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn execute(&mut self, operation: &Operation, tensors: &TensorMap, _context: &KernelContext) -> Result<()> {
        let input = read_input(tensors, operation, 0)?;
        let axis = match operation.inputs.get(1) {
            Some(id) => {
                let tensor = tensor_for(tensors, id)?.read();
                if tensor.precision() != Precision::Int32 {
                    return Err(BackendError::type_mismatch(Precision::Int32, tensor.precision()));
                }
                decode_i32(&tensor.to_bytes()?)
                    .first()
                    .copied()
                    .ok_or_else(|| BackendError::execution_error("softmax axis operand is empty"))?
            }
            None => -1,
        };
        let mut values = input.values;
        softmax(&mut values, &input.dims, axis)?;
        write_output(tensors, operation, input.precision, &input.dims, &values)
    }
}

/// Quantization is only meaningful fused into an accelerator plan.
struct HostQuantize;

impl Kernel for HostQuantize {
    fn name(&self) -> &'static str {
        "quantize"
    }

    fn execute(&mut self, operation: &Operation, _tensors: &TensorMap, _context: &KernelContext) -> Result<()> {
        Err(BackendError::FeatureNotSupported(format!(
            "{} ({}) cannot run as a standalone host kernel",
            operation.op_type, operation.id
        )))
    }
}
