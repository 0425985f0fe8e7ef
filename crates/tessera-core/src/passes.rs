//! Graph passes run on accelerator sub-graphs before conversion.

use tessera_ir::Graph;

use crate::error::Result;

/// In-place rewrite of a sub-graph. A pass must keep the graph's
/// input/output contract unchanged.
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, graph: &mut Graph) -> Result<()>;
}

/// Run `passes` in order, dumping the graph before and after at trace level.
pub fn run_passes(passes: &[std::sync::Arc<dyn GraphPass>], graph: &mut Graph) -> Result<()> {
    if passes.is_empty() {
        return Ok(());
    }
    tracing::trace!(graph = %graph, "graph_before_passes");
    for pass in passes {
        let operations = graph.operations().len();
        pass.run(graph)?;
        tracing::debug!(
            pass = pass.name(),
            operations_before = operations,
            operations_after = graph.operations().len(),
            "graph_pass_complete"
        );
    }
    tracing::trace!(graph = %graph, "graph_after_passes");
    Ok(())
}

/// Removes `IDENTITY` operations whose output is not part of the contract,
/// rewiring their consumers to the identity's input.
#[derive(Debug, Default, Clone, Copy)]
pub struct EliminateIdentity;

impl GraphPass for EliminateIdentity {
    fn name(&self) -> &str {
        "eliminate_identity"
    }

    fn run(&self, graph: &mut Graph) -> Result<()> {
        let outputs = graph.output_operands().to_vec();
        let mut forwarded = Vec::new();
        graph.operations_mut().retain(|operation| {
            let removable = operation.op_type == tessera_ir::OperationType::Identity
                && operation.inputs.len() == 1
                && operation.outputs.len() == 1
                && !outputs.contains(&operation.outputs[0]);
            if removable {
                forwarded.push((operation.outputs[0], operation.inputs[0]));
            }
            !removable
        });
        for operation in graph.operations_mut() {
            for input in &mut operation.inputs {
                // Follow chains of removed identities.
                while let Some(&(_, source)) = forwarded.iter().find(|(from, _)| from == input) {
                    *input = source;
                }
            }
        }
        graph.remove_unused_operands();
        Ok(())
    }
}
