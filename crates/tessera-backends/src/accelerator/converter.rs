//! Graph to [`Network`] conversion
//!
//! Each operation type maps to a [`ConvertFn`] that appends layers for one
//! operation. Constant operands become network weights on first use.

use std::collections::HashMap;
use std::fmt;

use tessera_ir::{sort_operations_in_topological_order, Graph, OperandId, Operation, OperationType, Precision};

use super::network::{LayerKind, Network, TensorId};
use crate::error::{BackendError, Result};
use crate::kernel::math::{decode_floats, decode_i32, ElementwiseOp};

/// Appends the layers for one operation.
pub type ConvertFn = fn(&mut Converter<'_>, &Operation) -> Result<()>;

/// Conversion state for one graph: the network being built and the
/// operand-to-tensor mapping.
pub struct Converter<'a> {
    graph: &'a Graph,
    network: &'a mut Network,
    tensors: HashMap<OperandId, TensorId>,
}

impl<'a> Converter<'a> {
    pub fn new(graph: &'a Graph, network: &'a mut Network) -> Self {
        Self {
            graph,
            network,
            tensors: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    pub fn network(&mut self) -> &mut Network {
        &mut *self.network
    }

    /// Network tensor holding `id`, adding constants as weights.
    pub fn tensor(&mut self, id: OperandId) -> Result<TensorId> {
        if let Some(&tensor) = self.tensors.get(&id) {
            return Ok(tensor);
        }
        let graph = self.graph;
        let operand = graph.operand(id)?;
        let Some(value) = operand.value.as_deref().filter(|_| operand.is_constant()) else {
            return Err(BackendError::unsupported(format!("operand {id} is read before it is produced")));
        };
        let values = decode_floats(value, operand.ty.precision)?;
        let tensor = self
            .network
            .add_constant(format!("const{}", id.0), operand.ty.dims.clone(), values)?;
        self.tensors.insert(id, tensor);
        Ok(tensor)
    }

    /// Record that `tensor` holds operand `id`.
    pub fn define(&mut self, id: OperandId, tensor: TensorId) {
        self.tensors.insert(id, tensor);
    }

    /// Scalar int32 constant, or `None` when the operand is absent.
    pub fn scalar_i32(&self, id: Option<&OperandId>) -> Result<Option<i32>> {
        let Some(&id) = id else {
            return Ok(None);
        };
        let operand = self.graph.operand(id)?;
        match (&operand.value, operand.ty.precision) {
            (Some(bytes), Precision::Int32) => Ok(decode_i32(bytes).first().copied()),
            (_, precision) => Err(BackendError::type_mismatch("an int32 constant", precision)),
        }
    }
}

/// Converters keyed by operation type.
#[derive(Clone, Default)]
pub struct ConverterRegistry {
    converters: HashMap<OperationType, ConvertFn>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Element-wise operations and softmax. `Quantize` has no converter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for op_type in OperationType::ALL {
            if ElementwiseOp::from_operation(op_type).is_some() {
                registry.register(op_type, convert_elementwise);
            }
        }
        registry.register(OperationType::Softmax, convert_softmax);
        registry
    }

    pub fn register(&mut self, op_type: OperationType, convert: ConvertFn) {
        self.converters.insert(op_type, convert);
    }

    pub fn supports(&self, op_type: OperationType) -> bool {
        self.converters.contains_key(&op_type)
    }

    /// Append `graph` to `network`: inputs named `input{i}`, operations in
    /// topological order, outputs named `output{i}`.
    pub fn convert(&self, graph: &Graph, network: &mut Network) -> Result<()> {
        let mut converter = Converter::new(graph, network);
        for (i, &id) in graph.input_operands().iter().enumerate() {
            let ty = &graph.operand(id)?.ty;
            let tensor = converter.network().add_input(
                format!("input{i}"),
                ty.precision,
                ty.dims.clone(),
                ty.shape_range().cloned(),
            );
            converter.define(id, tensor);
        }
        for operation in sort_operations_in_topological_order(graph)? {
            let convert = self.converters.get(&operation.op_type).ok_or_else(|| {
                BackendError::unsupported(format!("no converter for {}", operation.op_type))
            })?;
            convert(&mut converter, operation)?;
        }
        for (i, &id) in graph.output_operands().iter().enumerate() {
            let tensor = converter.tensor(id)?;
            converter.network().mark_output(tensor, format!("output{i}"))?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ops: Vec<_> = self.converters.keys().collect();
        ops.sort();
        f.debug_struct("ConverterRegistry").field("operations", &ops).finish()
    }
}

fn single_output(operation: &Operation) -> Result<OperandId> {
    match operation.outputs.as_slice() {
        [id] => Ok(*id),
        outputs => Err(BackendError::unsupported(format!(
            "{} with {} outputs",
            operation.op_type,
            outputs.len()
        ))),
    }
}

fn convert_elementwise(converter: &mut Converter<'_>, operation: &Operation) -> Result<()> {
    let op = ElementwiseOp::from_operation(operation.op_type)
        .ok_or_else(|| BackendError::unsupported(format!("{} is not element-wise", operation.op_type)))?;
    let inputs = operation
        .inputs
        .iter()
        .map(|&id| converter.tensor(id))
        .collect::<Result<Vec<_>>>()?;
    let output = converter.network().add_layer(LayerKind::Elementwise(op), &inputs)?;
    converter.define(single_output(operation)?, output);
    Ok(())
}

fn convert_softmax(converter: &mut Converter<'_>, operation: &Operation) -> Result<()> {
    let input = operation
        .inputs
        .first()
        .ok_or_else(|| BackendError::unsupported("softmax without input"))?;
    let input = converter.tensor(*input)?;
    let axis = converter.scalar_i32(operation.inputs.get(1))?.unwrap_or(-1);
    let output = converter
        .network()
        .add_layer(LayerKind::Softmax { axis }, &[input])?;
    converter.define(single_output(operation)?, output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_ir::OperandType;

    #[test]
    fn converts_with_binding_names() {
        let mut graph = Graph::new();
        let x = graph.add_input(OperandType::float32([2, 3]));
        let c = graph.add_f32_constant([1], &[0.5]).unwrap();
        let axis = graph.add_i32_constant([1], &[1]).unwrap();
        let t = graph.add_operand(OperandType::float32([2, 3]));
        let y = graph.add_operand(OperandType::float32([2, 3]));
        graph.add_operation(OperationType::Add, [x, c], [t]).unwrap();
        graph.add_operation(OperationType::Softmax, [t, axis], [y]).unwrap();
        graph.mark_output(y).unwrap();

        let mut network = Network::new(true);
        ConverterRegistry::with_defaults().convert(&graph, &mut network).unwrap();

        assert_eq!(network.layers().len(), 2);
        assert_eq!(network.layers()[1].kind, LayerKind::Softmax { axis: 1 });
        let input = network.tensor(network.inputs()[0]).unwrap();
        let output = network.tensor(network.outputs()[0]).unwrap();
        assert_eq!(input.name, "input0");
        assert_eq!(output.name, "output0");
        assert_eq!(output.dims, vec![2, 3]);
        network.validate().unwrap();
    }

    #[test]
    fn quantize_has_no_converter() {
        let mut graph = Graph::new();
        let x = graph.add_input(OperandType::float32([4]));
        let scale = graph.add_f32_constant([1], &[0.1]).unwrap();
        let y = graph.add_operand(OperandType::float32([4]));
        graph.add_operation(OperationType::Quantize, [x, scale], [y]).unwrap();
        graph.mark_output(y).unwrap();

        let registry = ConverterRegistry::with_defaults();
        assert!(!registry.supports(OperationType::Quantize));
        let err = registry.convert(&graph, &mut Network::new(true)).unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedOperation(_)));
    }
}
