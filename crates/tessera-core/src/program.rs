//! Program: partitioned, cached and executable form of a graph
//!
//! ```text
//! build(graph, cache)
//!   cache empty ─► GraphPartitioner ─► SubProgram::build ─► ProgramCache::serialize ─► cache
//!   cache full  ─► ProgramCache::deserialize ─► SubProgram::build_from_cache
//!
//! execute(inputs, outputs)
//!   check shapes ─► copy inputs into slot tensors ─► sub-programs in order ─► copy outputs out
//! ```
//!
//! Sub-programs exchange data through three tensor pools: program input
//! slots, program output slots and internal temporaries, addressed by each
//! sub-model's [`TensorIndex`] tables.

use std::sync::Arc;

use futures::executor::block_on;
use tessera_backends::{Tensor, TensorRef};
use tessera_ir::{Graph, OperandType, Precision};
use tessera_tracing::perf_span;

use crate::cache::{Cache, ProgramCache};
use crate::config::Context;
use crate::error::{Error, ErrorCategory, Result};
use crate::partition::{GraphArena, GraphPartitioner, SubModel, TensorIndex};
use crate::subprogram::{self, SubProgram};

// ================================================================================================
// Caller arguments
// ================================================================================================

/// Caller memory for one program input or output.
pub trait ArgumentAccess {
    /// Inputs write their actual shape and precision into `ty` and return
    /// their bytes. Outputs receive the produced type in `ty` and return a
    /// buffer of at least its byte length.
    fn access(&mut self, ty: &mut OperandType) -> Option<&mut [u8]>;
}

/// One argument bound to the input or output slot `index`.
pub struct Argument<'a> {
    pub index: usize,
    pub memory: &'a mut dyn ArgumentAccess,
}

impl<'a> Argument<'a> {
    pub fn new(index: usize, memory: &'a mut dyn ArgumentAccess) -> Self {
        Self { index, memory }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Input,
    /// `fixed` buffers keep their capacity instead of growing.
    Output { fixed: bool },
}

/// Host-memory [`ArgumentAccess`].
#[derive(Debug, Clone)]
pub struct HostBuffer {
    role: Role,
    precision: Precision,
    dims: Vec<i32>,
    bytes: Vec<u8>,
}

impl HostBuffer {
    /// Input holding raw little-endian bytes.
    pub fn input(precision: Precision, dims: impl Into<Vec<i32>>, bytes: Vec<u8>) -> Self {
        Self {
            role: Role::Input,
            precision,
            dims: dims.into(),
            bytes,
        }
    }

    pub fn from_f32(dims: impl Into<Vec<i32>>, values: &[f32]) -> Self {
        Self::input(Precision::Float32, dims, values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    /// Output that takes whatever shape the program produces.
    pub fn output() -> Self {
        Self {
            role: Role::Output { fixed: false },
            precision: Precision::Float32,
            dims: Vec::new(),
            bytes: Vec::new(),
        }
    }

    /// Output with a fixed capacity in bytes.
    pub fn output_with_capacity(bytes: usize) -> Self {
        Self {
            role: Role::Output { fixed: true },
            bytes: vec![0; bytes],
            ..Self::output()
        }
    }

    pub fn dims(&self) -> &[i32] {
        &self.dims
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if self.precision != Precision::Float32 {
            return Err(Error::InvalidArgument(format!("buffer holds {} values", self.precision)));
        }
        Ok(tessera_backends::kernel::math::bytes_to_f32(&self.bytes))
    }
}

impl ArgumentAccess for HostBuffer {
    fn access(&mut self, ty: &mut OperandType) -> Option<&mut [u8]> {
        match self.role {
            Role::Input => {
                ty.dims = self.dims.clone();
                ty.precision = self.precision;
            }
            Role::Output { fixed } => {
                self.dims = ty.dims.clone();
                self.precision = ty.precision;
                if !fixed {
                    self.bytes.resize(ty.byte_len().ok()?, 0);
                }
            }
        }
        Some(&mut self.bytes)
    }
}

// ================================================================================================
// Program
// ================================================================================================

pub struct Program {
    context: Arc<Context>,
    arena: GraphArena,
    sub_models: Vec<SubModel>,
    sub_caches: Vec<Vec<u8>>,
    sub_programs: Vec<Box<dyn SubProgram>>,
    input_types: Vec<OperandType>,
    output_types: Vec<OperandType>,
    inputs: Vec<TensorRef>,
    outputs: Vec<TensorRef>,
    temporaries: Vec<TensorRef>,
}

impl Program {
    pub fn new(context: Arc<Context>) -> Self {
        Self {
            context,
            arena: GraphArena::new(),
            sub_models: Vec::new(),
            sub_caches: Vec::new(),
            sub_programs: Vec::new(),
            input_types: Vec::new(),
            output_types: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            temporaries: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn is_built(&self) -> bool {
        !self.sub_programs.is_empty()
    }

    pub fn sub_models(&self) -> &[SubModel] {
        &self.sub_models
    }

    /// Sub-graph of a sub-model, as stored in the program's arena.
    pub fn sub_graph(&self, sub_model: &SubModel) -> Result<&Arc<Graph>> {
        self.arena.get(sub_model.graph)
    }

    /// Sub-graphs the program built or decoded itself and releases on rebuild.
    pub fn owned_sub_graphs(&self) -> usize {
        self.arena.owned_count()
    }

    /// Canonical declared input types.
    pub fn input_types(&self) -> &[OperandType] {
        &self.input_types
    }

    pub fn output_types(&self) -> &[OperandType] {
        &self.output_types
    }

    /// Build from `graph`, or from `cache` when it is not empty. A fresh
    /// build fills `cache`. On failure the program is left cleared.
    #[tracing::instrument(skip_all, fields(operations = graph.operations().len(), cached = !cache.is_empty()))]
    pub fn build(&mut self, graph: &Arc<Graph>, cache: &mut Cache) -> Result<()> {
        self.clear();
        let _span = perf_span!("program_build", cached = !cache.is_empty());
        match self.build_inner(graph, cache) {
            Ok(()) => {
                tracing::debug!(
                    sub_models = self.sub_models.len(),
                    temporaries = self.temporaries.len(),
                    cache_bytes = cache.buffer.len(),
                    "program_built"
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "program_build_failed");
                self.clear();
                Err(err)
            }
        }
    }

    fn build_inner(&mut self, graph: &Arc<Graph>, cache: &mut Cache) -> Result<()> {
        self.context.validate()?;

        if cache.is_empty() {
            let partitioner = GraphPartitioner::new(self.context.config.support_tables());
            self.sub_models = partitioner.partition(graph, &mut self.arena)?;
            for (index, sub_model) in self.sub_models.iter().enumerate() {
                let _span = perf_span!("sub_program_build", index = index, backend = sub_model.backend.tag());
                let sub_graph = self.arena.get(sub_model.graph)?;
                let mut sub_program = subprogram::create(sub_model.backend, Arc::clone(&self.context));
                sub_program.build(sub_graph)?;
                self.sub_caches.push(sub_program.cache_blob().to_vec());
                self.sub_programs.push(sub_program);
            }
            cache.buffer = ProgramCache::serialize(&self.sub_models, &self.sub_caches, &self.arena)?;
            cache.input_types = graph.input_types()?;
            cache.output_types = graph.output_types()?;
            self.input_types = cache.input_types.clone();
            self.output_types = cache.output_types.clone();
        } else {
            let (sub_models, sub_caches) = ProgramCache::deserialize(&cache.buffer, &mut self.arena)?;
            self.sub_models = sub_models;
            self.sub_caches = sub_caches;
            for (index, (sub_model, blob)) in self.sub_models.iter().zip(&self.sub_caches).enumerate() {
                let _span = perf_span!("sub_program_load", index = index, backend = sub_model.backend.tag());
                let sub_graph = self.arena.get(sub_model.graph)?;
                let mut sub_program = subprogram::create(sub_model.backend, Arc::clone(&self.context));
                sub_program.build_from_cache(sub_graph, blob)?;
                self.sub_programs.push(sub_program);
            }
            self.input_types = cache.input_types.clone();
            self.output_types = cache.output_types.clone();
        }

        for ty in self.input_types.iter_mut().chain(self.output_types.iter_mut()) {
            ty.canonicalize()?;
        }
        self.allocate_tensors()
    }

    fn allocate_tensors(&mut self) -> Result<()> {
        let mut temporaries = 0usize;
        let mut input_slots = 0usize;
        let mut output_slots = 0usize;
        for sub_model in &self.sub_models {
            for index in &sub_model.inputs {
                match *index {
                    TensorIndex::External(slot) => input_slots = input_slots.max(slot as usize + 1),
                    TensorIndex::Internal(temporary) => temporaries = temporaries.max(temporary as usize + 1),
                }
            }
            for index in &sub_model.outputs {
                match *index {
                    TensorIndex::External(slot) => output_slots = output_slots.max(slot as usize + 1),
                    TensorIndex::Internal(temporary) => temporaries = temporaries.max(temporary as usize + 1),
                }
            }
        }
        if input_slots > self.input_types.len() || output_slots > self.output_types.len() {
            return Err(Error::corrupt_cache(format!(
                "sub-models address {input_slots} inputs and {output_slots} outputs, program declares {} and {}",
                self.input_types.len(),
                self.output_types.len()
            )));
        }
        self.inputs = (0..self.input_types.len()).map(|_| Tensor::host().shared()).collect();
        self.outputs = (0..self.output_types.len()).map(|_| Tensor::host().shared()).collect();
        self.temporaries = (0..temporaries).map(|_| Tensor::host().shared()).collect();
        Ok(())
    }

    /// Release sub-programs, tensors and owned sub-graphs.
    pub fn clear(&mut self) {
        self.sub_programs.clear();
        self.sub_models.clear();
        self.sub_caches.clear();
        self.arena.clear();
        self.input_types.clear();
        self.output_types.clear();
        self.inputs.clear();
        self.outputs.clear();
        self.temporaries.clear();
    }

    /// Validate caller shapes against the declared types without moving data.
    pub fn check_inputs_and_outputs(&self, inputs: &mut [Argument<'_>], outputs: &mut [Argument<'_>]) -> Result<()> {
        check_slots("input", inputs, self.input_types.len())?;
        check_slots("output", outputs, self.output_types.len())?;
        for argument in inputs.iter_mut() {
            let declared = &self.input_types[argument.index];
            let mut actual = declared.clone();
            let bytes = argument
                .memory
                .access(&mut actual)
                .ok_or_else(|| Error::InvalidArgument(format!("input {} has no memory", argument.index)))?;
            let available = bytes.len();
            check_shape(argument.index, declared, &actual.dims)?;
            let required = actual.byte_len()?;
            if available < required {
                return Err(Error::ArgumentTooSmall {
                    required,
                    actual: available,
                });
            }
        }
        Ok(())
    }

    /// Run the program to completion on the calling thread.
    pub fn execute(&mut self, inputs: &mut [Argument<'_>], outputs: &mut [Argument<'_>]) -> Result<()> {
        block_on(self.execute_async(inputs, outputs))
    }

    pub async fn execute_async(&mut self, inputs: &mut [Argument<'_>], outputs: &mut [Argument<'_>]) -> Result<()> {
        if !self.is_built() {
            return Err(Error::NotBuilt);
        }
        let _span = perf_span!("program_execute", sub_programs = self.sub_programs.len());
        self.check_inputs_and_outputs(inputs, outputs)?;

        for argument in inputs.iter_mut() {
            let mut actual = self.input_types[argument.index].clone();
            let bytes = argument
                .memory
                .access(&mut actual)
                .ok_or_else(|| Error::InvalidArgument(format!("input {} has no memory", argument.index)))?;
            let len = actual.byte_len()?;
            let mut tensor = self.inputs[argument.index].write();
            tensor.set_precision(actual.precision);
            tensor.resize(&actual.dims)?;
            tensor.write_bytes(&bytes[..len])?;
        }

        match self.run_sub_programs().await {
            Ok(()) => {}
            Err(err) => {
                if err.category() == ErrorCategory::Fatal {
                    tracing::error!(error = %err, "program_execute_failed");
                }
                return Err(err);
            }
        }

        for argument in outputs.iter_mut() {
            let tensor = self.outputs[argument.index].read();
            let mut produced = OperandType::new(tensor.precision(), tensor.dims());
            let required = produced.byte_len()?;
            let buffer = argument
                .memory
                .access(&mut produced)
                .ok_or_else(|| Error::InvalidArgument(format!("output {} has no memory", argument.index)))?;
            if buffer.len() < required {
                return Err(Error::ArgumentTooSmall {
                    required,
                    actual: buffer.len(),
                });
            }
            tensor.read_bytes_into(buffer)?;
        }
        Ok(())
    }

    async fn run_sub_programs(&mut self) -> Result<()> {
        for (index, (sub_program, sub_model)) in self.sub_programs.iter_mut().zip(&self.sub_models).enumerate() {
            let inputs = resolve(&sub_model.inputs, &self.inputs, &self.temporaries)?;
            let outputs = resolve(&sub_model.outputs, &self.outputs, &self.temporaries)?;
            let span = perf_span!("sub_program_execute", index = index, backend = sub_model.backend.tag());
            sub_program.execute(&inputs, &outputs).await?;
            tracing::trace!(index, duration_us = span.elapsed_us(), "sub_program_done");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("sub_models", &self.sub_models)
            .field("arena", &self.arena)
            .field("input_types", &self.input_types)
            .field("output_types", &self.output_types)
            .field("temporaries", &self.temporaries.len())
            .finish()
    }
}

fn resolve(indices: &[TensorIndex], external: &[TensorRef], temporaries: &[TensorRef]) -> Result<Vec<TensorRef>> {
    indices
        .iter()
        .map(|index| {
            let tensor = match *index {
                TensorIndex::External(slot) => external.get(slot as usize),
                TensorIndex::Internal(temporary) => temporaries.get(temporary as usize),
            };
            tensor
                .map(Arc::clone)
                .ok_or_else(|| Error::Partition(format!("tensor index {index:?} has no tensor")))
        })
        .collect()
}

/// Every declared slot must be bound exactly once.
fn check_slots(kind: &str, arguments: &[Argument<'_>], declared: usize) -> Result<()> {
    let mut seen = vec![false; declared];
    for argument in arguments {
        let slot = seen
            .get_mut(argument.index)
            .ok_or_else(|| Error::InvalidArgument(format!("{kind} {} does not exist", argument.index)))?;
        if *slot {
            return Err(Error::InvalidArgument(format!("{kind} {} given twice", argument.index)));
        }
        *slot = true;
    }
    if let Some(missing) = seen.iter().position(|seen| !seen) {
        return Err(Error::InvalidArgument(format!("{kind} {missing} is missing")));
    }
    Ok(())
}

/// Rank must match; an exact match passes; otherwise every dimension must
/// lie in the declared range.
fn check_shape(slot: usize, declared: &OperandType, actual: &[i32]) -> Result<()> {
    if declared.rank() != actual.len() {
        return Err(Error::invalid_dimensions(format!(
            "input {slot} has rank {}, expected {}",
            actual.len(),
            declared.rank()
        )));
    }
    if actual.iter().any(|&dim| dim < 0) {
        return Err(Error::invalid_dimensions(format!("input {slot} has unresolved shape {actual:?}")));
    }
    if declared.dims == actual {
        return Ok(());
    }
    let range = declared.shape_range().ok_or_else(|| {
        Error::invalid_dimensions(format!("input {slot} has shape {actual:?}, expected {:?}", declared.dims))
    })?;
    if !range.contains(actual) {
        return Err(Error::invalid_dimensions(format!(
            "input {slot} has shape {actual:?}, outside [{:?}, {:?}]",
            range.min, range.max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use tessera_ir::{ShapeRange, DYNAMIC_DIM};

    fn ranged() -> OperandType {
        OperandType::float32([1, 3]).with_range(ShapeRange::new(vec![1, 3], vec![1, 1], vec![1, 5]).unwrap())
    }

    #[test]
    fn shape_check_follows_rank_then_range() {
        let declared = ranged();
        assert!(check_shape(0, &declared, &[1, 3]).is_ok());
        assert!(check_shape(0, &declared, &[1, 5]).is_ok());
        assert!(matches!(check_shape(0, &declared, &[1, 6]), Err(Error::InvalidDimensions(_))));
        assert!(matches!(check_shape(0, &declared, &[1, 3, 3]), Err(Error::InvalidDimensions(_))));

        let dynamic = OperandType::float32([1, DYNAMIC_DIM])
            .with_range(ShapeRange::new(vec![1, 3], vec![1, 1], vec![1, 5]).unwrap());
        let repeated = check_shape(0, &dynamic, &[1, DYNAMIC_DIM]);
        assert!(matches!(repeated, Err(Error::InvalidDimensions(_))));
        assert_eq!(repeated.unwrap_err().category(), ErrorCategory::Request);

        let fixed = OperandType::float32([2, 2]);
        assert!(check_shape(0, &fixed, &[2, 2]).is_ok());
        assert!(matches!(check_shape(0, &fixed, &[2, 3]), Err(Error::InvalidDimensions(_))));
    }

    #[test]
    fn slots_must_be_bound_exactly_once() {
        let mut a = HostBuffer::from_f32([1], &[0.0]);
        let mut b = HostBuffer::from_f32([1], &[0.0]);
        let twice = [Argument::new(0, &mut a), Argument::new(0, &mut b)];
        assert!(check_slots("input", &twice, 2).is_err());

        let mut c = HostBuffer::from_f32([1], &[0.0]);
        let out_of_range = [Argument::new(2, &mut c)];
        assert!(check_slots("input", &out_of_range, 2).is_err());

        assert!(check_slots("input", &[], 1).is_err());
        assert!(check_slots("input", &[], 0).is_ok());
    }

    #[test]
    fn host_buffer_roles() {
        let mut input = HostBuffer::from_f32([2], &[1.0, 2.0]);
        let mut ty = OperandType::float32([5]);
        assert_eq!(input.access(&mut ty).map(|bytes| bytes.len()), Some(8));
        assert_eq!(ty.dims, vec![2]);

        let mut output = HostBuffer::output();
        let mut produced = OperandType::float32([3]);
        assert_eq!(output.access(&mut produced).map(|bytes| bytes.len()), Some(12));
        assert_eq!(output.dims(), &[3]);
    }

    #[test]
    fn resolve_reports_missing_tensors() {
        let external = vec![Tensor::host().shared()];
        assert!(resolve(&[TensorIndex::External(0)], &external, &[]).is_ok());
        assert!(resolve(&[TensorIndex::Internal(0)], &external, &[]).is_err());
    }
}
