//! Property tests for operation ordering.

use proptest::prelude::*;
use tessera_ir::{sort_operations_in_topological_order, Graph, OperandId, OperandType, OperationType};

/// Random DAG declared in reverse: operation `i` reads the input or the
/// outputs of any operation declared before it in the final ordering.
fn shuffled_graph(width: usize, picks: &[(usize, usize)]) -> Graph {
    let mut graph = Graph::new();
    let x = graph.add_input(OperandType::float32([width as i32]));
    let outputs: Vec<OperandId> = picks
        .iter()
        .map(|_| graph.add_operand(OperandType::float32([width as i32])))
        .collect();

    // Declare operations last-to-first so declaration order is never topological.
    for (i, &(a, b)) in picks.iter().enumerate().rev() {
        let source = |pick: usize| if i == 0 { x } else { outputs[pick % i] };
        graph
            .add_operation(OperationType::Add, [source(a), source(b)], [outputs[i]])
            .unwrap();
    }
    if let Some(&last) = outputs.last() {
        graph.mark_output(last).unwrap();
    }
    graph
}

proptest! {
    #[test]
    fn test_order_respects_every_edge(
        width in 1usize..8,
        picks in prop::collection::vec((0usize..64, 0usize..64), 1..24),
    ) {
        let graph = shuffled_graph(width, &picks);
        let order = sort_operations_in_topological_order(&graph).unwrap();
        prop_assert_eq!(order.len(), graph.operations().len());

        let mut written: Vec<OperandId> = graph.input_operands().to_vec();
        for operation in order {
            for input in &operation.inputs {
                prop_assert!(written.contains(input), "{} read before it was written", input);
            }
            written.extend(&operation.outputs);
        }
    }
}
