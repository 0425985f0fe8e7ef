//! Layer network handed to an [`Accelerator`](super::Accelerator) for
//! plan compilation.
//!
//! A network is a flat list of named tensors and the layers that produce
//! them, in execution order. Inputs and outputs carry the binding names
//! the engine exposes (`input{i}`, `output{i}`).

use serde::{Deserialize, Serialize};
use tessera_ir::{Precision, ShapeRange};

use crate::error::{BackendError, Result};
use crate::kernel::math::{broadcast_dims, ElementwiseOp};

/// Position of a tensor in its network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorId(pub usize);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTensor {
    pub name: String,
    pub precision: Precision,
    /// Declared dimensions, `-1` where only known at execution time.
    pub dims: Vec<i32>,
    /// Range of the dynamic dimensions, inherited from the inputs.
    pub range: Option<ShapeRange>,
    /// Weights, for constant tensors.
    pub constant: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LayerKind {
    Elementwise(ElementwiseOp),
    Softmax { axis: i32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub inputs: Vec<TensorId>,
    pub output: TensorId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    tensors: Vec<NetworkTensor>,
    layers: Vec<Layer>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    explicit_batch: bool,
}

impl Network {
    /// Empty network. Implicit-batch networks treat the leading dimension
    /// as the batch; the reference runtime records the flag only.
    pub fn new(explicit_batch: bool) -> Self {
        Self {
            explicit_batch,
            ..Self::default()
        }
    }

    pub fn explicit_batch(&self) -> bool {
        self.explicit_batch
    }

    pub fn add_input(
        &mut self,
        name: impl Into<String>,
        precision: Precision,
        dims: Vec<i32>,
        range: Option<ShapeRange>,
    ) -> TensorId {
        let id = self.push(NetworkTensor {
            name: name.into(),
            precision,
            dims,
            range,
            constant: None,
        });
        self.inputs.push(id);
        id
    }

    pub fn add_constant(&mut self, name: impl Into<String>, dims: Vec<i32>, values: Vec<f32>) -> Result<TensorId> {
        let expected = tessera_ir::element_count(&dims)?;
        if expected != values.len() {
            return Err(BackendError::ShapeMismatch(format!(
                "constant with {} values declared as {dims:?}",
                values.len()
            )));
        }
        Ok(self.push(NetworkTensor {
            name: name.into(),
            precision: Precision::Float32,
            dims,
            range: None,
            constant: Some(values),
        }))
    }

    /// Append a layer and return its output tensor. The output shape and
    /// precision follow the inputs.
    pub fn add_layer(&mut self, kind: LayerKind, inputs: &[TensorId]) -> Result<TensorId> {
        let sources = inputs
            .iter()
            .map(|&id| self.tensor(id).cloned())
            .collect::<Result<Vec<_>>>()?;
        let arity = match kind {
            LayerKind::Elementwise(op) => op.arity(),
            LayerKind::Softmax { .. } => 1,
        };
        if sources.len() != arity {
            return Err(BackendError::execution_error(format!(
                "{kind:?} layer takes {arity} inputs, got {}",
                sources.len()
            )));
        }
        let (dims, range) = match sources.as_slice() {
            [a, b] => {
                let dims = broadcast_dims(&a.dims, &b.dims)?;
                let range = if dims == a.dims { a.range.clone() } else { b.range.clone() };
                (dims, range)
            }
            [x] => (x.dims.clone(), x.range.clone()),
            _ => (Vec::new(), None),
        };
        let name = format!("layer{}", self.layers.len());
        let output = self.push(NetworkTensor {
            name: format!("{name}_out"),
            precision: sources[0].precision,
            dims,
            range,
            constant: None,
        });
        self.layers.push(Layer {
            name,
            kind,
            inputs: inputs.to_vec(),
            output,
        });
        Ok(output)
    }

    /// Expose `id` as a network output under `name`.
    pub fn mark_output(&mut self, id: TensorId, name: impl Into<String>) -> Result<()> {
        if self.outputs.contains(&id) || self.inputs.contains(&id) {
            return Err(BackendError::binding(format!(
                "tensor {} is already bound",
                self.tensor(id)?.name
            )));
        }
        self.tensors[id.0].name = name.into();
        self.outputs.push(id);
        Ok(())
    }

    pub fn tensor(&self, id: TensorId) -> Result<&NetworkTensor> {
        self.tensors
            .get(id.0)
            .ok_or_else(|| BackendError::InvalidPlan(format!("tensor {} does not exist", id.0)))
    }

    pub fn tensors(&self) -> &[NetworkTensor] {
        &self.tensors
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn is_dynamic(&self) -> bool {
        self.inputs
            .iter()
            .any(|id| self.tensors[id.0].dims.contains(&tessera_ir::DYNAMIC_DIM))
    }

    /// Check that every layer reads tensors defined before it.
    pub fn validate(&self) -> Result<()> {
        let mut defined = vec![false; self.tensors.len()];
        for id in &self.inputs {
            *defined.get_mut(id.0).ok_or_else(|| invalid_tensor(*id))? = true;
        }
        for (index, tensor) in self.tensors.iter().enumerate() {
            if tensor.constant.is_some() {
                defined[index] = true;
            }
        }
        for layer in &self.layers {
            for id in &layer.inputs {
                if !defined.get(id.0).copied().unwrap_or(false) {
                    return Err(BackendError::InvalidPlan(format!(
                        "{} reads tensor {} before it is produced",
                        layer.name, id.0
                    )));
                }
            }
            *defined.get_mut(layer.output.0).ok_or_else(|| invalid_tensor(layer.output))? = true;
        }
        for id in &self.outputs {
            if !defined.get(id.0).copied().unwrap_or(false) {
                return Err(invalid_tensor(*id));
            }
        }
        Ok(())
    }

    /// Concrete dimensions of every tensor for the given input shapes.
    pub fn resolve_dims(&self, input_dims: &[Vec<i32>]) -> Result<Vec<Vec<i32>>> {
        if input_dims.len() != self.inputs.len() {
            return Err(BackendError::binding(format!(
                "{} input shapes for {} inputs",
                input_dims.len(),
                self.inputs.len()
            )));
        }
        let mut dims: Vec<Vec<i32>> = self.tensors.iter().map(|tensor| tensor.dims.clone()).collect();
        for (id, shape) in self.inputs.iter().zip(input_dims) {
            dims[id.0] = shape.clone();
        }
        for layer in &self.layers {
            dims[layer.output.0] = match layer.inputs.as_slice() {
                [a, b] if matches!(layer.kind, LayerKind::Elementwise(_)) => broadcast_dims(&dims[a.0], &dims[b.0])?,
                [x, ..] => dims[x.0].clone(),
                [] => Vec::new(),
            };
        }
        Ok(dims)
    }

    fn push(&mut self, tensor: NetworkTensor) -> TensorId {
        self.tensors.push(tensor);
        TensorId(self.tensors.len() - 1)
    }
}

fn invalid_tensor(id: TensorId) -> BackendError {
    BackendError::InvalidPlan(format!("tensor {} does not exist", id.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_inherits_input_range() {
        let range = ShapeRange::new(vec![1, 3], vec![1, 1], vec![1, 5]).unwrap();
        let mut network = Network::new(true);
        let x = network.add_input("input0", Precision::Float32, vec![1, -1], Some(range.clone()));
        let c = network.add_constant("c", vec![1], vec![2.0]).unwrap();
        let y = network.add_layer(LayerKind::Elementwise(ElementwiseOp::Mul), &[x, c]).unwrap();
        network.mark_output(y, "output0").unwrap();

        let out = network.tensor(y).unwrap();
        assert_eq!(out.name, "output0");
        assert_eq!(out.dims, vec![1, -1]);
        assert_eq!(out.range.as_ref(), Some(&range));
        assert!(network.is_dynamic());
        network.validate().unwrap();

        let dims = network.resolve_dims(&[vec![1, 4]]).unwrap();
        assert_eq!(dims[y.0], vec![1, 4]);
    }

    #[test]
    fn rejects_wrong_arity_and_double_binding() {
        let mut network = Network::new(true);
        let x = network.add_input("input0", Precision::Float32, vec![2], None);
        assert!(network.add_layer(LayerKind::Elementwise(ElementwiseOp::Add), &[x]).is_err());
        assert!(network.mark_output(x, "output0").is_err());
    }
}
