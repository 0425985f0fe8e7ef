//! Backend assignment and graph splitting
//!
//! Every operation goes to the GPU kernels if the GPU table lists it, else
//! to the host kernels if the host table lists it, else to the accelerator.
//! Operations are then ordered so that runs of one backend stay together,
//! and each maximal run becomes one [`SubModel`]:
//!
//! ```text
//!  x ─► IDENTITY(host) ─► t0 ─► IDENTITY(host) ─► t1 ─► RELU(accelerator) ─► y
//!       └──────────── sub-model 0 (host) ───────────┘    └── sub-model 1 ──┘
//!       inputs [External(0)]  outputs [Internal(0)]      inputs [Internal(0)]
//!                                                        outputs [External(0)]
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tessera_ir::{Graph, OperandId, OperationDag, OperationType};

use crate::error::{Error, Result};

/// Backend a sub-model runs on. The discriminant is the cache tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Accelerator = 0,
    GpuKernels = 1,
    HostKernels = 2,
}

impl BackendKind {
    pub const fn tag(self) -> i32 {
        self as i32
    }

    pub fn from_tag(tag: i32) -> Result<Self> {
        match tag {
            0 => Ok(Self::Accelerator),
            1 => Ok(Self::GpuKernels),
            2 => Ok(Self::HostKernels),
            other => Err(Error::UnsupportedBackend(other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accelerator => f.write_str("accelerator"),
            Self::GpuKernels => f.write_str("gpu"),
            Self::HostKernels => f.write_str("host"),
        }
    }
}

/// Where a sub-model reads or writes one of its tensors.
///
/// `External` addresses a program input slot in an input list and a
/// program output slot in an output list. `Internal` addresses the pool of
/// temporaries passed between sub-models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorIndex {
    External(u32),
    Internal(u32),
}

impl TensorIndex {
    /// Signed wire form: `-slot - 1` for external slots.
    pub fn encode(self) -> i32 {
        match self {
            Self::External(slot) => -(slot as i32) - 1,
            Self::Internal(index) => index as i32,
        }
    }

    pub fn decode(value: i32) -> Self {
        if value < 0 {
            Self::External((-(value + 1)) as u32)
        } else {
            Self::Internal(value as u32)
        }
    }
}

// ================================================================================================
// Graph arena
// ================================================================================================

/// Handle to a graph held by a [`GraphArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(usize);

enum GraphSlot {
    /// Cut by the partitioner or decoded from a cache.
    Owned(Arc<Graph>),
    /// The caller's graph, used whole.
    Shared(Arc<Graph>),
}

/// Graphs referenced by a program's sub-models. Clearing the arena drops
/// owned graphs; shared slots only release their reference.
#[derive(Default)]
pub struct GraphArena {
    slots: Vec<GraphSlot>,
}

impl GraphArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_owned(&mut self, graph: Graph) -> GraphId {
        self.slots.push(GraphSlot::Owned(Arc::new(graph)));
        GraphId(self.slots.len() - 1)
    }

    pub fn insert_shared(&mut self, graph: Arc<Graph>) -> GraphId {
        self.slots.push(GraphSlot::Shared(graph));
        GraphId(self.slots.len() - 1)
    }

    pub fn get(&self, id: GraphId) -> Result<&Arc<Graph>> {
        match self.slots.get(id.0) {
            Some(GraphSlot::Owned(graph) | GraphSlot::Shared(graph)) => Ok(graph),
            None => Err(Error::Partition(format!("graph slot {} is empty", id.0))),
        }
    }

    pub fn owns(&self, id: GraphId) -> bool {
        matches!(self.slots.get(id.0), Some(GraphSlot::Owned(_)))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn owned_count(&self) -> usize {
        self.slots.iter().filter(|slot| matches!(slot, GraphSlot::Owned(_))).count()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

impl fmt::Debug for GraphArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphArena")
            .field("slots", &self.slots.len())
            .field("owned", &self.owned_count())
            .finish()
    }
}

// ================================================================================================
// Partitioning
// ================================================================================================

/// One backend-homogeneous piece of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubModel {
    pub backend: BackendKind,
    pub graph: GraphId,
    pub owns_subgraph: bool,
    /// Parallel to the sub-graph's input operands.
    pub inputs: Vec<TensorIndex>,
    /// Parallel to the sub-graph's output operands.
    pub outputs: Vec<TensorIndex>,
    pub from_cache: bool,
}

/// Operations the GPU and host kernel backends accept, in priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupportTables {
    pub gpu: Vec<OperationType>,
    pub host: Vec<OperationType>,
}

impl SupportTables {
    pub fn classify(&self, op_type: OperationType) -> BackendKind {
        if self.gpu.contains(&op_type) {
            BackendKind::GpuKernels
        } else if self.host.contains(&op_type) {
            BackendKind::HostKernels
        } else {
            BackendKind::Accelerator
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphPartitioner {
    tables: SupportTables,
}

impl GraphPartitioner {
    pub fn new(tables: SupportTables) -> Self {
        Self { tables }
    }

    /// Split `graph` into sub-models in execution order. Sub-graphs are
    /// stored in `arena`.
    #[tracing::instrument(skip_all, fields(operations = graph.operations().len()))]
    pub fn partition(&self, graph: &Arc<Graph>, arena: &mut GraphArena) -> Result<Vec<SubModel>> {
        let start = Instant::now();
        if graph.operations().is_empty() {
            return Err(Error::Partition("graph has no operations".into()));
        }
        let producers = graph.producers();
        for (slot, id) in graph.output_operands().iter().enumerate() {
            if !producers.contains_key(id) {
                return Err(Error::Partition(format!(
                    "output {slot} ({id}) is not produced by any operation"
                )));
            }
        }

        let kinds: Vec<BackendKind> = graph
            .operations()
            .iter()
            .map(|operation| self.tables.classify(operation.op_type))
            .collect();
        let runs = backend_runs(graph, &kinds)?;

        let sub_models = match runs.as_slice() {
            [(backend, _)] => vec![SubModel {
                backend: *backend,
                graph: arena.insert_shared(Arc::clone(graph)),
                owns_subgraph: false,
                inputs: (0..graph.input_operands().len() as u32).map(TensorIndex::External).collect(),
                outputs: (0..graph.output_operands().len() as u32).map(TensorIndex::External).collect(),
                from_cache: false,
            }],
            _ => split_runs(graph, &runs, arena)?,
        };
        if sub_models.is_empty() {
            return Err(Error::Partition("no sub-model was produced".into()));
        }

        for (index, (sub_model, (_, operations))) in sub_models.iter().zip(&runs).enumerate() {
            tracing::debug!(
                index,
                backend = %sub_model.backend,
                operations = operations.len(),
                inputs = sub_model.inputs.len(),
                outputs = sub_model.outputs.len(),
                "sub_model_created"
            );
        }
        tracing::debug!(
            sub_models = sub_models.len(),
            duration_us = start.elapsed().as_micros() as u64,
            "graph_partitioned"
        );
        Ok(sub_models)
    }
}

/// Topological order that keeps picking the current backend while it has
/// ready operations, cut into maximal single-backend runs.
fn backend_runs(graph: &Graph, kinds: &[BackendKind]) -> Result<Vec<(BackendKind, Vec<usize>)>> {
    let mut current = None;
    let order = OperationDag::new(graph).order_with(|ready| {
        let next = ready
            .iter()
            .copied()
            .find(|&index| Some(kinds[index]) == current)
            .or_else(|| ready.first().copied())
            .unwrap_or_default();
        current = Some(kinds[next]);
        next
    })?;

    let mut runs: Vec<(BackendKind, Vec<usize>)> = Vec::new();
    for index in order {
        match runs.last_mut() {
            Some((kind, operations)) if *kind == kinds[index] => operations.push(index),
            _ => runs.push((kinds[index], vec![index])),
        }
    }
    Ok(runs)
}

fn split_runs(graph: &Graph, runs: &[(BackendKind, Vec<usize>)], arena: &mut GraphArena) -> Result<Vec<SubModel>> {
    let operations = graph.operations();
    let mut run_of = vec![0usize; operations.len()];
    for (run, (_, members)) in runs.iter().enumerate() {
        for &index in members {
            run_of[index] = run;
        }
    }
    let input_slots: HashMap<OperandId, u32> = graph
        .input_operands()
        .iter()
        .enumerate()
        .map(|(slot, id)| (*id, slot as u32))
        .collect();
    let output_slots: HashMap<OperandId, u32> = graph
        .output_operands()
        .iter()
        .enumerate()
        .map(|(slot, id)| (*id, slot as u32))
        .collect();
    let mut consumer_runs: HashMap<OperandId, BTreeSet<usize>> = HashMap::new();
    for (index, operation) in operations.iter().enumerate() {
        for input in &operation.inputs {
            consumer_runs.entry(*input).or_default().insert(run_of[index]);
        }
    }

    let mut internal: HashMap<OperandId, u32> = HashMap::new();
    let mut sub_models = Vec::with_capacity(runs.len());
    for (run, (backend, members)) in runs.iter().enumerate() {
        let produced: HashSet<OperandId> = members
            .iter()
            .flat_map(|&index| operations[index].outputs.iter().copied())
            .collect();

        let mut inputs = Vec::new();
        let mut input_indices = Vec::new();
        for &index in members {
            for &id in &operations[index].inputs {
                if produced.contains(&id) || inputs.contains(&id) || graph.operand(id)?.is_constant() {
                    continue;
                }
                let tensor_index = if let Some(&slot) = input_slots.get(&id) {
                    TensorIndex::External(slot)
                } else if let Some(&temporary) = internal.get(&id) {
                    TensorIndex::Internal(temporary)
                } else {
                    return Err(Error::Partition(format!("operand {id} is read but never written")));
                };
                inputs.push(id);
                input_indices.push(tensor_index);
            }
        }

        let mut outputs = Vec::new();
        let mut output_indices = Vec::new();
        for &index in members {
            for &id in &operations[index].outputs {
                let escapes = consumer_runs
                    .get(&id)
                    .is_some_and(|consumers| consumers.iter().any(|&consumer| consumer != run));
                if let Some(&slot) = output_slots.get(&id) {
                    if escapes {
                        return Err(Error::Partition(format!(
                            "output {slot} ({id}) is consumed across a partition boundary"
                        )));
                    }
                    outputs.push(id);
                    output_indices.push(TensorIndex::External(slot));
                } else if escapes {
                    let temporary = internal.len() as u32;
                    internal.insert(id, temporary);
                    outputs.push(id);
                    output_indices.push(TensorIndex::Internal(temporary));
                }
            }
        }
        if outputs.is_empty() {
            // Dead run: expose its unread results as temporaries.
            for &index in members {
                for &id in &operations[index].outputs {
                    if !consumer_runs.contains_key(&id) {
                        let temporary = internal.len() as u32;
                        internal.insert(id, temporary);
                        outputs.push(id);
                        output_indices.push(TensorIndex::Internal(temporary));
                    }
                }
            }
        }

        let mut sub_graph = Graph::new();
        for &index in members {
            let operation = &operations[index];
            for &id in operation.inputs.iter().chain(&operation.outputs) {
                if sub_graph.operand(id).is_err() {
                    sub_graph.insert_operand(graph.operand(id)?.clone());
                }
            }
            sub_graph.insert_operation(operation.clone());
        }
        sub_graph.set_inputs_and_outputs(inputs, outputs)?;

        sub_models.push(SubModel {
            backend: *backend,
            graph: arena.insert_owned(sub_graph),
            owns_subgraph: true,
            inputs: input_indices,
            outputs: output_indices,
            from_cache: false,
        });
    }
    Ok(sub_models)
}
