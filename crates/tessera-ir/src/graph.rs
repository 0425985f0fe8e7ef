//! Computation graph: operands keyed by id plus an ordered operation list.
//!
//! ```text
//!   input x ──► RELU ──► t0 ──► ADD ──► output y
//!                                ▲
//!               constant c ──────┘
//! ```
//!
//! Sub-graphs produced by partitioning keep the operand and operation ids of
//! the graph they were cut from, so ids stay meaningful across partitions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{IrError, Result};
use crate::operation::{Operation, OperationId, OperationType};
use crate::types::{OperandType, Precision};

/// Stable identifier of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperandId(pub u32);

impl fmt::Display for OperandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Role of an operand in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperandLifetime {
    Temporary,
    Input,
    Output,
    Constant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    pub id: OperandId,
    pub ty: OperandType,
    pub lifetime: OperandLifetime,
    /// Little-endian payload of a constant.
    pub value: Option<Vec<u8>>,
}

impl Operand {
    pub fn is_constant(&self) -> bool {
        self.lifetime == OperandLifetime::Constant
    }
}

/// A computation graph with an explicit input/output contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    operands: BTreeMap<OperandId, Operand>,
    operations: Vec<Operation>,
    input_operands: Vec<OperandId>,
    output_operands: Vec<OperandId>,
    next_operand: u32,
    next_operation: u32,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // ============================================================================================
    // Construction
    // ============================================================================================

    /// Add an intermediate operand.
    pub fn add_operand(&mut self, ty: OperandType) -> OperandId {
        self.insert_new(ty, OperandLifetime::Temporary, None)
    }

    /// Add an operand and append it to the graph inputs.
    pub fn add_input(&mut self, ty: OperandType) -> OperandId {
        let id = self.insert_new(ty, OperandLifetime::Input, None);
        self.input_operands.push(id);
        id
    }

    /// Add a constant with a raw little-endian payload.
    pub fn add_constant(&mut self, ty: OperandType, value: Vec<u8>) -> Result<OperandId> {
        let expected = ty.byte_len()?;
        let id = OperandId(self.next_operand);
        if value.len() != expected {
            return Err(IrError::ConstantSizeMismatch {
                id,
                expected,
                actual: value.len(),
            });
        }
        Ok(self.insert_new(ty, OperandLifetime::Constant, Some(value)))
    }

    pub fn add_f32_constant(&mut self, dims: impl Into<Vec<i32>>, values: &[f32]) -> Result<OperandId> {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.add_constant(OperandType::new(Precision::Float32, dims), bytes)
    }

    pub fn add_i32_constant(&mut self, dims: impl Into<Vec<i32>>, values: &[i32]) -> Result<OperandId> {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.add_constant(OperandType::new(Precision::Int32, dims), bytes)
    }

    /// Append an operation. Every referenced operand must already exist,
    /// and an output may not be an input, a constant, or produced twice.
    pub fn add_operation(
        &mut self,
        op_type: OperationType,
        inputs: impl Into<Vec<OperandId>>,
        outputs: impl Into<Vec<OperandId>>,
    ) -> Result<OperationId> {
        let inputs = inputs.into();
        let outputs = outputs.into();
        for id in inputs.iter().chain(&outputs) {
            if !self.operands.contains_key(id) {
                return Err(IrError::UnknownOperand(*id));
            }
        }
        for id in &outputs {
            match self.operands[id].lifetime {
                OperandLifetime::Input | OperandLifetime::Constant => return Err(IrError::ProducedInput(*id)),
                _ => {}
            }
            if self.producer_of(*id).is_some() {
                return Err(IrError::DuplicateProducer(*id));
            }
        }
        let id = OperationId(self.next_operation);
        self.next_operation += 1;
        self.operations.push(Operation {
            id,
            op_type,
            inputs,
            outputs,
        });
        Ok(id)
    }

    /// Append `id` to the graph outputs.
    pub fn mark_output(&mut self, id: OperandId) -> Result<()> {
        let operand = self.operands.get_mut(&id).ok_or(IrError::UnknownOperand(id))?;
        if operand.lifetime == OperandLifetime::Temporary {
            operand.lifetime = OperandLifetime::Output;
        }
        self.output_operands.push(id);
        Ok(())
    }

    /// Copy an operand from another graph, keeping its id.
    pub fn insert_operand(&mut self, operand: Operand) {
        self.next_operand = self.next_operand.max(operand.id.0 + 1);
        self.operands.insert(operand.id, operand);
    }

    /// Copy an operation from another graph, keeping its id.
    pub fn insert_operation(&mut self, operation: Operation) {
        self.next_operation = self.next_operation.max(operation.id.0 + 1);
        self.operations.push(operation);
    }

    /// Replace the input/output contract, updating operand lifetimes.
    pub fn set_inputs_and_outputs(&mut self, inputs: Vec<OperandId>, outputs: Vec<OperandId>) -> Result<()> {
        for id in inputs.iter().chain(&outputs) {
            if !self.operands.contains_key(id) {
                return Err(IrError::UnknownOperand(*id));
            }
        }
        for operand in self.operands.values_mut() {
            if matches!(operand.lifetime, OperandLifetime::Input | OperandLifetime::Output) {
                operand.lifetime = OperandLifetime::Temporary;
            }
        }
        for id in &inputs {
            if let Some(operand) = self.operands.get_mut(id) {
                operand.lifetime = OperandLifetime::Input;
            }
        }
        for id in &outputs {
            if let Some(operand) = self.operands.get_mut(id) {
                if operand.lifetime == OperandLifetime::Temporary {
                    operand.lifetime = OperandLifetime::Output;
                }
            }
        }
        self.input_operands = inputs;
        self.output_operands = outputs;
        Ok(())
    }

    // ============================================================================================
    // Queries
    // ============================================================================================

    pub fn operand(&self, id: OperandId) -> Result<&Operand> {
        self.operands.get(&id).ok_or(IrError::UnknownOperand(id))
    }

    pub fn operand_mut(&mut self, id: OperandId) -> Result<&mut Operand> {
        self.operands.get_mut(&id).ok_or(IrError::UnknownOperand(id))
    }

    pub fn operands(&self) -> impl Iterator<Item = &Operand> {
        self.operands.values()
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Mutable access for graph passes.
    pub fn operations_mut(&mut self) -> &mut Vec<Operation> {
        &mut self.operations
    }

    pub fn input_operands(&self) -> &[OperandId] {
        &self.input_operands
    }

    pub fn output_operands(&self) -> &[OperandId] {
        &self.output_operands
    }

    pub fn input_types(&self) -> Result<Vec<OperandType>> {
        self.input_operands
            .iter()
            .map(|id| self.operand(*id).map(|operand| operand.ty.clone()))
            .collect()
    }

    pub fn output_types(&self) -> Result<Vec<OperandType>> {
        self.output_operands
            .iter()
            .map(|id| self.operand(*id).map(|operand| operand.ty.clone()))
            .collect()
    }

    /// Index of the operation writing `id`, if any.
    pub fn producer_of(&self, id: OperandId) -> Option<usize> {
        self.operations.iter().position(|op| op.outputs.contains(&id))
    }

    /// Map from every produced operand to the index of its producer.
    pub fn producers(&self) -> HashMap<OperandId, usize> {
        let mut producers = HashMap::new();
        for (index, op) in self.operations.iter().enumerate() {
            for output in &op.outputs {
                producers.insert(*output, index);
            }
        }
        producers
    }

    /// Drop operands no operation or contract entry refers to.
    pub fn remove_unused_operands(&mut self) -> usize {
        let mut used: Vec<OperandId> = self.input_operands.clone();
        used.extend(&self.output_operands);
        for op in &self.operations {
            used.extend(&op.inputs);
            used.extend(&op.outputs);
        }
        let before = self.operands.len();
        self.operands.retain(|id, _| used.contains(id));
        before - self.operands.len()
    }

    // ============================================================================================
    // Encoding
    // ============================================================================================

    /// Encode the graph as a bincode blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a blob produced by [`Graph::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn insert_new(&mut self, ty: OperandType, lifetime: OperandLifetime, value: Option<Vec<u8>>) -> OperandId {
        let id = OperandId(self.next_operand);
        self.next_operand += 1;
        self.operands.insert(
            id,
            Operand {
                id,
                ty,
                lifetime,
                value,
            },
        );
        id
    }
}

/// Multi-line dump used by debug logging.
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "graph inputs={:?} outputs={:?}",
            self.input_operands.iter().map(|id| id.0).collect::<Vec<_>>(),
            self.output_operands.iter().map(|id| id.0).collect::<Vec<_>>()
        )?;
        for operand in self.operands.values() {
            writeln!(f, "  {} {:?} {}", operand.id, operand.lifetime, operand.ty)?;
        }
        for op in &self.operations {
            let inputs = op.inputs.iter().map(ToString::to_string).collect::<Vec<_>>();
            let outputs = op.outputs.iter().map(ToString::to_string).collect::<Vec<_>>();
            writeln!(f, "  {}: {} = {}({})", op.id, outputs.join(", "), op.op_type, inputs.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relu_add() -> (Graph, OperandId, OperandId) {
        let mut graph = Graph::new();
        let x = graph.add_input(OperandType::float32([2]));
        let t = graph.add_operand(OperandType::float32([2]));
        let c = graph.add_f32_constant([2], &[1.0, 2.0]).unwrap();
        let y = graph.add_operand(OperandType::float32([2]));
        graph.add_operation(OperationType::Relu, [x], [t]).unwrap();
        graph.add_operation(OperationType::Add, [t, c], [y]).unwrap();
        graph.mark_output(y).unwrap();
        (graph, x, y)
    }

    #[test]
    fn builds_contract() {
        let (graph, x, y) = relu_add();
        assert_eq!(graph.input_operands(), &[x]);
        assert_eq!(graph.output_operands(), &[y]);
        assert_eq!(graph.operand(y).unwrap().lifetime, OperandLifetime::Output);
        assert_eq!(graph.operations().len(), 2);
        assert_eq!(graph.producer_of(y), Some(1));
    }

    #[test]
    fn rejects_second_producer() {
        let (mut graph, x, y) = relu_add();
        let err = graph.add_operation(OperationType::Abs, [x], [y]).unwrap_err();
        assert!(matches!(err, IrError::DuplicateProducer(id) if id == y));
    }

    #[test]
    fn rejects_writing_an_input() {
        let (mut graph, x, _) = relu_add();
        let err = graph.add_operation(OperationType::Abs, [x], [x]).unwrap_err();
        assert!(matches!(err, IrError::ProducedInput(_)));
    }

    #[test]
    fn rejects_unknown_operand() {
        let mut graph = Graph::new();
        let x = graph.add_input(OperandType::float32([1]));
        let err = graph.add_operation(OperationType::Relu, [x], [OperandId(42)]).unwrap_err();
        assert!(matches!(err, IrError::UnknownOperand(OperandId(42))));
    }

    #[test]
    fn constant_size_is_checked() {
        let mut graph = Graph::new();
        let err = graph
            .add_constant(OperandType::float32([2]), vec![0u8; 4])
            .unwrap_err();
        assert!(matches!(err, IrError::ConstantSizeMismatch { expected: 8, actual: 4, .. }));
    }

    #[test]
    fn blob_round_trip() {
        let (graph, _, _) = relu_add();
        let bytes = graph.to_bytes().unwrap();
        assert_eq!(Graph::from_bytes(&bytes).unwrap(), graph);
        assert!(Graph::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn display_lists_operations() {
        let (graph, _, _) = relu_add();
        let dump = graph.to_string();
        assert!(dump.contains("RELU"));
        assert!(dump.contains("ADD"));
    }
}
