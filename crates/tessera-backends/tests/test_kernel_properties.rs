//! Property tests: host kernels and GPU launches agree element for element.

use std::sync::Arc;

use proptest::prelude::*;
use tessera_backends::{Device, EmulatedDevice, KernelContext, KernelRegistry, KernelTarget, Tensor, TensorMap};
use tessera_ir::{OperandId, Operation, OperationId, OperationType};

const BINARY: [OperationType; 6] = [
    OperationType::Add,
    OperationType::Sub,
    OperationType::Mul,
    OperationType::Div,
    OperationType::Max,
    OperationType::Min,
];

fn run(target: KernelTarget, op_type: OperationType, a: &[f32], b: &[f32]) -> Vec<f32> {
    let device: Arc<dyn Device> = Arc::new(EmulatedDevice::new());
    let context = match target {
        KernelTarget::Gpu => KernelContext::with_device(device.clone()),
        KernelTarget::Host => KernelContext::host(),
    };
    let output = Tensor::host().shared();
    let mut tensors = TensorMap::new();
    tensors.insert(OperandId(0), Tensor::from_f32(&[a.len() as i32], a).unwrap().shared());
    tensors.insert(OperandId(1), Tensor::from_f32(&[b.len() as i32], b).unwrap().shared());
    tensors.insert(OperandId(2), output.clone());

    let operation = Operation {
        id: OperationId(0),
        op_type,
        inputs: vec![OperandId(0), OperandId(1)],
        outputs: vec![OperandId(2)],
    };
    let mut kernel = KernelRegistry::with_defaults().create(target, op_type).unwrap();
    kernel.execute(&operation, &tensors, &context).unwrap();
    device.synchronize().unwrap();
    let values = output.read().to_f32_vec().unwrap();
    values
}

proptest! {
    #[test]
    fn test_host_and_gpu_binary_kernels_agree(
        op in 0..BINARY.len(),
        pairs in prop::collection::vec((-100.0f32..100.0, 0.5f32..100.0), 1..64),
    ) {
        let (a, b): (Vec<f32>, Vec<f32>) = pairs.into_iter().unzip();
        let host = run(KernelTarget::Host, BINARY[op], &a, &b);
        let gpu = run(KernelTarget::Gpu, BINARY[op], &a, &b);
        prop_assert_eq!(host, gpu);
    }

    #[test]
    fn test_scalar_operand_broadcasts(
        a in prop::collection::vec(-10.0f32..10.0, 1..32),
        scalar in 1.0f32..4.0,
    ) {
        let host = run(KernelTarget::Host, OperationType::Mul, &a, &[scalar]);
        let expected: Vec<f32> = a.iter().map(|v| v * scalar).collect();
        prop_assert_eq!(host, expected);
    }
}
