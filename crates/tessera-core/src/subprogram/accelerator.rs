//! Accelerator sub-program: graph ─► network ─► serialized plan ─► engine
//!
//! Bindings are named `input{i}` and `output{i}` after the sub-graph's
//! input and output positions. The serialized plan is the cache blob, so a
//! cached build only loads the engine.

use std::sync::Arc;
use std::time::Instant;

use futures::future::{FutureExt, LocalBoxFuture};
use tessera_backends::{
    BackendError, BuilderConfig, DeviceKind, Engine, ExecutionContext, Int8Calibrator, Network, OptimizationProfile,
    PrecisionMode, TensorRef,
};
use tessera_ir::{Graph, OperandType};

use super::SubProgram;
use crate::config::Context;
use crate::error::{Error, Result};
use crate::partition::BackendKind;
use crate::passes::run_passes;

pub struct AcceleratorSubProgram {
    context: Arc<Context>,
    plan: Vec<u8>,
    engine: Option<Box<dyn Engine>>,
    execution: Option<Box<dyn ExecutionContext>>,
    input_types: Vec<OperandType>,
    output_types: Vec<OperandType>,
    input_bindings: Vec<usize>,
    output_bindings: Vec<usize>,
}

impl AcceleratorSubProgram {
    pub fn new(context: Arc<Context>) -> Self {
        Self {
            context,
            plan: Vec::new(),
            engine: None,
            execution: None,
            input_types: Vec::new(),
            output_types: Vec::new(),
            input_bindings: Vec::new(),
            output_bindings: Vec::new(),
        }
    }

    /// Binding indices resolved for the sub-graph inputs.
    pub fn input_bindings(&self) -> &[usize] {
        &self.input_bindings
    }

    pub fn output_bindings(&self) -> &[usize] {
        &self.output_bindings
    }

    fn reset(&mut self) {
        self.execution = None;
        self.engine = None;
        self.plan.clear();
        self.input_types.clear();
        self.output_types.clear();
        self.input_bindings.clear();
        self.output_bindings.clear();
    }

    fn builder_config(&self, input_types: &[OperandType]) -> Result<BuilderConfig> {
        let config = &self.context.config;
        let mut builder = BuilderConfig {
            device: config.device_type,
            precision: config.precision,
            gpu_fallback: config.gpu_fallback,
            ..BuilderConfig::default()
        };

        if config.device_type == DeviceKind::Dla {
            let cores = self.context.accelerator.num_dla_cores();
            if config.device_id < cores {
                builder.dla_core = Some(config.device_id);
            } else {
                tracing::warn!(
                    requested = config.device_id,
                    available = cores,
                    "dla_core_unavailable_using_default"
                );
            }
            if builder.precision == PrecisionMode::Float32 {
                tracing::warn!("dla_does_not_run_fp32_using_fp16");
                builder.precision = PrecisionMode::Float16;
            }
        }

        for (index, ty) in input_types.iter().enumerate() {
            if !ty.is_dynamic() {
                continue;
            }
            let range = ty
                .shape_range()
                .ok_or_else(|| Error::invalid_config(format!("dynamic input {index} has no shape range")))?;
            range.validate()?;
            builder.profiles.push(OptimizationProfile {
                input: format!("input{index}"),
                range: range.clone(),
            });
        }

        if builder.precision == PrecisionMode::Int8 {
            builder.calibrator = Some(Int8Calibrator {
                batch_size: 1,
                dataset_path: config.calibration_dataset_path.clone(),
                table_path: config.calibration_table_path.clone(),
            });
        }
        Ok(builder)
    }

    /// Load an engine from `plan` and resolve the bindings of `graph`.
    fn load(&mut self, graph: &Graph, plan: Vec<u8>) -> Result<()> {
        let engine = self.context.accelerator.deserialize_engine(&plan)?;

        let mut input_types = graph.input_types()?;
        let mut output_types = graph.output_types()?;
        for ty in input_types.iter_mut().chain(output_types.iter_mut()) {
            ty.canonicalize()?;
        }

        let expected = input_types.len() + output_types.len();
        if engine.num_bindings() != expected {
            return Err(BackendError::binding(format!(
                "engine has {} bindings, sub-graph needs {expected}",
                engine.num_bindings()
            ))
            .into());
        }
        let resolve = |name: String| {
            engine
                .binding_index(&name)
                .ok_or_else(|| Error::from(BackendError::binding(format!("engine has no binding {name}"))))
        };
        let input_bindings = (0..input_types.len())
            .map(|i| resolve(format!("input{i}")))
            .collect::<Result<Vec<_>>>()?;
        let output_bindings = (0..output_types.len())
            .map(|i| resolve(format!("output{i}")))
            .collect::<Result<Vec<_>>>()?;
        if let Some(&index) = input_bindings.iter().find(|&&index| !engine.binding_is_input(index)) {
            return Err(BackendError::binding(format!("binding {index} is not an input")).into());
        }

        self.execution = Some(engine.create_execution_context()?);
        self.engine = Some(engine);
        self.plan = plan;
        self.input_types = input_types;
        self.output_types = output_types;
        self.input_bindings = input_bindings;
        self.output_bindings = output_bindings;
        Ok(())
    }

    async fn run(&mut self, inputs: &[TensorRef], outputs: &[TensorRef]) -> Result<()> {
        let start = Instant::now();
        let execution = self.execution.as_mut().ok_or(Error::NotBuilt)?;
        if inputs.len() != self.input_types.len() || outputs.len() != self.output_types.len() {
            return Err(Error::InvalidArgument(format!(
                "accelerator sub-program takes {} inputs and {} outputs, got {} and {}",
                self.input_types.len(),
                self.output_types.len(),
                inputs.len(),
                outputs.len()
            )));
        }

        for (tensor, ty) in outputs.iter().zip(&self.output_types) {
            let mut tensor = tensor.write();
            tensor.set_precision(ty.precision);
            tensor.resize(&ty.max_dims()?)?;
        }

        let mut slots: Vec<Option<TensorRef>> = vec![None; self.input_bindings.len() + self.output_bindings.len()];
        for (tensor, &index) in inputs
            .iter()
            .zip(&self.input_bindings)
            .chain(outputs.iter().zip(&self.output_bindings))
        {
            let slot = slots
                .get_mut(index)
                .ok_or_else(|| BackendError::binding(format!("binding {index} is out of range")))?;
            *slot = Some(Arc::clone(tensor));
        }
        let mut bindings = Vec::with_capacity(slots.len());
        for (index, slot) in slots.into_iter().enumerate() {
            let tensor = slot.ok_or_else(|| BackendError::binding(format!("binding {index} has no tensor")))?;
            if !tensor.read().is_allocated() {
                return Err(BackendError::binding(format!("binding {index} is not allocated")).into());
            }
            bindings.push(tensor);
        }

        for (tensor, &index) in inputs.iter().zip(&self.input_bindings) {
            let dims = tensor.read().dims().to_vec();
            execution.set_binding_dimensions(index, &dims)?;
        }
        if !execution.all_input_dimensions_specified() {
            return Err(BackendError::binding("not every input dimension is specified").into());
        }

        execution.enqueue(&bindings).await?;

        for (tensor, &index) in outputs.iter().zip(&self.output_bindings) {
            let dims = execution.binding_dimensions(index)?;
            tensor.write().resize(&dims)?;
        }
        tracing::debug!(
            bindings = bindings.len(),
            duration_us = start.elapsed().as_micros() as u64,
            "accelerator_sub_program_executed"
        );
        Ok(())
    }
}

impl SubProgram for AcceleratorSubProgram {
    fn backend(&self) -> BackendKind {
        BackendKind::Accelerator
    }

    #[tracing::instrument(skip_all, fields(operations = graph.operations().len()))]
    fn build(&mut self, graph: &Arc<Graph>) -> Result<()> {
        let start = Instant::now();
        self.reset();
        let precision = self.context.config.precision;

        let mut input_types = graph.input_types()?;
        for ty in &mut input_types {
            ty.canonicalize()?;
        }
        let dynamic = input_types.iter().any(OperandType::is_dynamic);
        if dynamic && precision == PrecisionMode::Int8 {
            return Err(Error::invalid_config(
                "INT8 calibration cannot be combined with dynamic input shapes",
            ));
        }

        let graph = if self.context.passes.is_empty() {
            Arc::clone(graph)
        } else {
            let mut optimized = Graph::clone(graph);
            run_passes(&self.context.passes, &mut optimized)?;
            Arc::new(optimized)
        };

        let mut network = Network::new(precision != PrecisionMode::Int8);
        self.context.converters.convert(&graph, &mut network)?;
        let builder = self.builder_config(&input_types)?;
        let plan = self
            .context
            .accelerator
            .build_serialized_network(&network, &builder)?;
        tracing::debug!(
            layers = network.layers().len(),
            dynamic,
            precision = %builder.precision,
            plan_bytes = plan.len(),
            duration_us = start.elapsed().as_micros() as u64,
            "accelerator_plan_built"
        );
        self.load(&graph, plan)
    }

    fn build_from_cache(&mut self, graph: &Arc<Graph>, blob: &[u8]) -> Result<()> {
        self.reset();
        if blob.is_empty() {
            return Err(Error::corrupt_cache("accelerator sub-model has no cached plan"));
        }
        self.load(graph, blob.to_vec())
    }

    fn cache_blob(&self) -> &[u8] {
        &self.plan
    }

    fn execute<'a>(&'a mut self, inputs: &'a [TensorRef], outputs: &'a [TensorRef]) -> LocalBoxFuture<'a, Result<()>> {
        self.run(inputs, outputs).boxed_local()
    }
}
