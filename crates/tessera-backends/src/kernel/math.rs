//! Float math shared by host kernels, device launches and the reference
//! accelerator.

use half::f16;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tessera_ir::{element_count, OperationType, Precision};

use crate::error::{BackendError, Result};

/// Below this many elements the sequential loop beats rayon's fork cost.
const PARALLEL_THRESHOLD: usize = 4096;

/// Element-wise operator with one or two inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseOp {
    Identity,
    Relu,
    Sigmoid,
    Tanh,
    Abs,
    Neg,
    Exp,
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

impl ElementwiseOp {
    pub fn from_operation(op_type: OperationType) -> Option<Self> {
        let op = match op_type {
            OperationType::Identity => Self::Identity,
            OperationType::Relu => Self::Relu,
            OperationType::Sigmoid => Self::Sigmoid,
            OperationType::Tanh => Self::Tanh,
            OperationType::Abs => Self::Abs,
            OperationType::Neg => Self::Neg,
            OperationType::Exp => Self::Exp,
            OperationType::Add => Self::Add,
            OperationType::Sub => Self::Sub,
            OperationType::Mul => Self::Mul,
            OperationType::Div => Self::Div,
            OperationType::Max => Self::Max,
            OperationType::Min => Self::Min,
            OperationType::Softmax | OperationType::Quantize => return None,
        };
        Some(op)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Abs => "abs",
            Self::Neg => "neg",
            Self::Exp => "exp",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Max => "max",
            Self::Min => "min",
        }
    }

    pub const fn arity(self) -> usize {
        match self {
            Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Max | Self::Min => 2,
            _ => 1,
        }
    }

    #[inline]
    fn unary(self, x: f32) -> f32 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
            Self::Abs => x.abs(),
            Self::Neg => -x,
            Self::Exp => x.exp(),
            _ => x,
        }
    }

    #[inline]
    fn binary(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Max => a.max(b),
            Self::Min => a.min(b),
            _ => a,
        }
    }

    /// Evaluate over `out.len()` elements. Inputs hold either that many
    /// elements or exactly one, which is broadcast.
    pub fn evaluate(self, inputs: &[&[f32]], out: &mut [f32]) -> Result<()> {
        if inputs.len() != self.arity() {
            return Err(BackendError::execution_error(format!(
                "{} takes {} inputs, got {}",
                self.name(),
                self.arity(),
                inputs.len()
            )));
        }
        for input in inputs {
            if input.len() != out.len() && input.len() != 1 {
                return Err(BackendError::ShapeMismatch(format!(
                    "{} input of {} elements does not match output of {}",
                    self.name(),
                    input.len(),
                    out.len()
                )));
            }
        }
        let at = |input: &[f32], i: usize| if input.len() == 1 { input[0] } else { input[i] };
        let parallel = out.len() >= PARALLEL_THRESHOLD;
        match inputs {
            [x] => {
                let body = |(i, o): (usize, &mut f32)| *o = self.unary(at(x, i));
                if parallel {
                    out.par_iter_mut().enumerate().for_each(body);
                } else {
                    out.iter_mut().enumerate().for_each(body);
                }
            }
            [a, b] => {
                let body = |(i, o): (usize, &mut f32)| *o = self.binary(at(a, i), at(b, i));
                if parallel {
                    out.par_iter_mut().enumerate().for_each(body);
                } else {
                    out.iter_mut().enumerate().for_each(body);
                }
            }
            _ => {
                return Err(BackendError::execution_error(format!(
                    "{} supports at most two inputs",
                    self.name()
                )))
            }
        }
        Ok(())
    }
}

/// Output shape of a binary element-wise operation: equal shapes, or one
/// side holding a single element.
pub fn broadcast_dims(a: &[i32], b: &[i32]) -> Result<Vec<i32>> {
    if a == b {
        return Ok(a.to_vec());
    }
    if element_count(b).ok() == Some(1) {
        return Ok(a.to_vec());
    }
    if element_count(a).ok() == Some(1) {
        return Ok(b.to_vec());
    }
    Err(BackendError::ShapeMismatch(format!("cannot broadcast {a:?} with {b:?}")))
}

/// Numerically stable softmax along `axis` (negative counts from the end).
pub fn softmax(data: &mut [f32], dims: &[i32], axis: i32) -> Result<()> {
    let rank = dims.len() as i32;
    let axis = if axis < 0 { axis + rank } else { axis };
    if rank == 0 || axis < 0 || axis >= rank {
        return Err(BackendError::ShapeMismatch(format!(
            "softmax axis out of range for shape {dims:?}"
        )));
    }
    let axis = axis as usize;
    let extent = dims[axis] as usize;
    let inner: usize = dims[axis + 1..].iter().map(|&d| d as usize).product();
    let outer: usize = dims[..axis].iter().map(|&d| d as usize).product();
    if outer * extent * inner != data.len() {
        return Err(BackendError::ShapeMismatch(format!(
            "softmax over {} elements does not match shape {dims:?}",
            data.len()
        )));
    }
    for o in 0..outer {
        for i in 0..inner {
            let index = |k: usize| (o * extent + k) * inner + i;
            let max = (0..extent).map(|k| data[index(k)]).fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for k in 0..extent {
                let e = (data[index(k)] - max).exp();
                data[index(k)] = e;
                sum += e;
            }
            for k in 0..extent {
                data[index(k)] /= sum;
            }
        }
    }
    Ok(())
}

/// Reinterpret little-endian bytes as float32, regardless of alignment.
pub fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytemuck::pod_collect_to_vec(bytes)
}

pub fn f32_to_bytes(values: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

/// Decode a float tensor payload into float32 values.
pub fn decode_floats(bytes: &[u8], precision: Precision) -> Result<Vec<f32>> {
    match precision {
        Precision::Float32 => Ok(bytes_to_f32(bytes)),
        Precision::Float16 => {
            let halves: Vec<f16> = bytemuck::pod_collect_to_vec(bytes);
            Ok(halves.into_iter().map(f16::to_f32).collect())
        }
        Precision::Float64 => {
            let doubles: Vec<f64> = bytemuck::pod_collect_to_vec(bytes);
            Ok(doubles.into_iter().map(|v| v as f32).collect())
        }
        other => Err(BackendError::type_mismatch("a float precision", other)),
    }
}

/// Encode float32 values in `precision`.
pub fn encode_floats(values: &[f32], precision: Precision) -> Result<Vec<u8>> {
    match precision {
        Precision::Float32 => Ok(f32_to_bytes(values)),
        Precision::Float16 => {
            let halves: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
            Ok(bytemuck::cast_slice(&halves).to_vec())
        }
        Precision::Float64 => {
            let doubles: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();
            Ok(bytemuck::cast_slice(&doubles).to_vec())
        }
        other => Err(BackendError::type_mismatch("a float precision", other)),
    }
}

/// Decode an int32 payload, used for scalar parameters such as axes.
pub fn decode_i32(bytes: &[u8]) -> Vec<i32> {
    bytemuck::pod_collect_to_vec(bytes)
}

/// Round every value through float16.
pub fn round_to_f16(values: &mut [f32]) {
    for v in values {
        *v = f16::from_f32(*v).to_f32();
    }
}

/// Symmetric int8 fake quantization with the given scale.
pub fn fake_quantize_i8(values: &mut [f32], scale: f32) {
    if scale <= 0.0 {
        return;
    }
    for v in values {
        *v = (*v / scale).round().clamp(-127.0, 127.0) * scale;
    }
}
