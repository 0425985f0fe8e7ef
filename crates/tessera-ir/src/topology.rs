//! Operation dependency DAG and topological ordering.

use std::collections::BTreeSet;

use crate::error::{IrError, Result};
use crate::graph::Graph;
use crate::operation::Operation;

/// Producer/consumer edges between the operations of one graph, by
/// operation position.
#[derive(Debug, Clone)]
pub struct OperationDag {
    predecessors: Vec<BTreeSet<usize>>,
    successors: Vec<BTreeSet<usize>>,
}

impl OperationDag {
    pub fn new(graph: &Graph) -> Self {
        let count = graph.operations().len();
        let producers = graph.producers();
        let mut predecessors = vec![BTreeSet::new(); count];
        let mut successors = vec![BTreeSet::new(); count];
        for (index, op) in graph.operations().iter().enumerate() {
            for input in &op.inputs {
                if let Some(&producer) = producers.get(input) {
                    if producer != index {
                        predecessors[index].insert(producer);
                        successors[producer].insert(index);
                    }
                }
            }
        }
        Self {
            predecessors,
            successors,
        }
    }

    pub fn len(&self) -> usize {
        self.predecessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predecessors.is_empty()
    }

    pub fn predecessors(&self, index: usize) -> &BTreeSet<usize> {
        &self.predecessors[index]
    }

    pub fn successors(&self, index: usize) -> &BTreeSet<usize> {
        &self.successors[index]
    }

    /// Kahn's algorithm where `pick` chooses the next operation among the
    /// ready set. `pick` must return a member of the set it is given.
    pub fn order_with<F>(&self, mut pick: F) -> Result<Vec<usize>>
    where
        F: FnMut(&BTreeSet<usize>) -> usize,
    {
        let mut indegree: Vec<usize> = self.predecessors.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());
        while !ready.is_empty() {
            let next = pick(&ready);
            if !ready.remove(&next) {
                return Err(IrError::Cycle {
                    remaining: self.len() - order.len(),
                });
            }
            order.push(next);
            for &successor in &self.successors[next] {
                indegree[successor] -= 1;
                if indegree[successor] == 0 {
                    ready.insert(successor);
                }
            }
        }
        if order.len() != self.len() {
            return Err(IrError::Cycle {
                remaining: self.len() - order.len(),
            });
        }
        Ok(order)
    }

    /// Topological order preferring the earliest declared operation.
    pub fn order(&self) -> Result<Vec<usize>> {
        self.order_with(|ready| ready.first().copied().unwrap_or_default())
    }
}

/// Operations of `graph` in a dependency-respecting order. Ties keep
/// declaration order, so an already sorted graph is returned unchanged.
pub fn sort_operations_in_topological_order(graph: &Graph) -> Result<Vec<&Operation>> {
    let order = OperationDag::new(graph).order()?;
    Ok(order.into_iter().map(|index| &graph.operations()[index]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OperandId;
    use crate::operation::{OperationId, OperationType};
    use crate::types::OperandType;

    #[test]
    fn orders_reversed_declarations() {
        let mut graph = Graph::new();
        let x = graph.add_input(OperandType::float32([4]));
        let a = graph.add_operand(OperandType::float32([4]));
        let b = graph.add_operand(OperandType::float32([4]));
        // declared consumer-first
        graph.add_operation(OperationType::Tanh, [a], [b]).unwrap();
        graph.add_operation(OperationType::Relu, [x], [a]).unwrap();
        graph.mark_output(b).unwrap();

        let ids: Vec<OperationId> = sort_operations_in_topological_order(&graph)
            .unwrap()
            .iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(ids, vec![OperationId(1), OperationId(0)]);
    }

    #[test]
    fn detects_cycles() {
        let mut graph = Graph::new();
        let a = graph.add_operand(OperandType::float32([1]));
        let b = graph.add_operand(OperandType::float32([1]));
        graph.insert_operation(Operation {
            id: OperationId(0),
            op_type: OperationType::Relu,
            inputs: vec![a],
            outputs: vec![b],
        });
        graph.insert_operation(Operation {
            id: OperationId(1),
            op_type: OperationType::Relu,
            inputs: vec![b],
            outputs: vec![a],
        });
        assert!(matches!(
            sort_operations_in_topological_order(&graph),
            Err(IrError::Cycle { remaining: 2 })
        ));
    }

    #[test]
    fn custom_pick_is_respected() {
        let mut graph = Graph::new();
        let x = graph.add_input(OperandType::float32([1]));
        let outs: Vec<OperandId> = (0..3).map(|_| graph.add_operand(OperandType::float32([1]))).collect();
        for out in &outs {
            graph.add_operation(OperationType::Abs, [x], [*out]).unwrap();
        }
        let dag = OperationDag::new(&graph);
        let order = dag
            .order_with(|ready| ready.last().copied().unwrap_or_default())
            .unwrap();
        assert_eq!(order, vec![2, 1, 0]);
    }
}
