//! In-process accelerator that compiles networks into [`Plan`]s and runs
//! them on the host thread pool.
//!
//! Numeric modes are emulated: float16 plans round every tensor through
//! `half::f16`, int8 plans fake-quantize every tensor that has a
//! calibration scale.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt};
use tessera_ir::{element_count, DYNAMIC_DIM};

use super::network::Network;
use super::plan::{Plan, PLAN_VERSION};
use super::{Accelerator, BuilderConfig, DeviceKind, Engine, ExecutionContext, Int8Calibrator, LayerKind, PrecisionMode};
use crate::error::{BackendError, Result};
use crate::kernel::math::{fake_quantize_i8, round_to_f16, softmax};
use crate::tensor::TensorRef;

/// Largest magnitude representable by a symmetric int8 scale.
const INT8_MAX: f32 = 127.0;

pub struct ReferenceAccelerator {
    name: String,
    dla_cores: u32,
    builds: AtomicUsize,
    loads: AtomicUsize,
}

impl ReferenceAccelerator {
    pub fn new() -> Self {
        Self {
            name: "reference".to_string(),
            dla_cores: 0,
            builds: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
        }
    }

    /// Report `count` dedicated deep-learning cores.
    pub fn with_dla_cores(mut self, count: u32) -> Self {
        self.dla_cores = count;
        self
    }

    /// Plans compiled so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    /// Engines loaded so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    fn check_device(&self, config: &BuilderConfig) -> Result<()> {
        if config.device != DeviceKind::Dla {
            return Ok(());
        }
        if let Some(core) = config.dla_core {
            if core >= self.dla_cores {
                return Err(BackendError::invalid_config(format!(
                    "DLA core {core} requested but the device has {}",
                    self.dla_cores
                )));
            }
        }
        if self.dla_cores == 0 && !config.gpu_fallback {
            return Err(BackendError::invalid_config(
                "device has no DLA cores and GPU fallback is disabled",
            ));
        }
        if config.precision == PrecisionMode::Float32 {
            return Err(BackendError::invalid_config("DLA cores do not run FP32 plans"));
        }
        Ok(())
    }
}

impl Default for ReferenceAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accelerator for ReferenceAccelerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_dla_cores(&self) -> u32 {
        self.dla_cores
    }

    #[tracing::instrument(skip_all, fields(layers = network.layers().len(), precision = %config.precision))]
    fn build_serialized_network(&self, network: &Network, config: &BuilderConfig) -> Result<Vec<u8>> {
        let start = Instant::now();
        network.validate()?;
        if network.outputs().is_empty() {
            return Err(BackendError::invalid_config("network has no outputs"));
        }
        self.check_device(config)?;

        let dynamic = network.is_dynamic();
        if dynamic && config.precision == PrecisionMode::Int8 {
            return Err(BackendError::invalid_config(
                "int8 calibration cannot be combined with dynamic shapes",
            ));
        }
        for id in network.inputs() {
            let tensor = network.tensor(*id)?;
            if !tensor.dims.contains(&DYNAMIC_DIM) {
                continue;
            }
            let profile = config.profile(&tensor.name).ok_or_else(|| {
                BackendError::invalid_config(format!("dynamic input {} has no optimization profile", tensor.name))
            })?;
            profile.range.validate()?;
            if profile.range.rank() != tensor.dims.len() {
                return Err(BackendError::invalid_config(format!(
                    "profile for {} has rank {}, input has rank {}",
                    tensor.name,
                    profile.range.rank(),
                    tensor.dims.len()
                )));
            }
        }

        let scales = if config.precision == PrecisionMode::Int8 {
            let calibrator = config
                .calibrator
                .as_ref()
                .ok_or_else(|| BackendError::invalid_config("int8 plans need a calibrator"))?;
            calibrate(network, calibrator)?
        } else {
            BTreeMap::new()
        };

        let plan = Plan {
            version: PLAN_VERSION,
            network: network.clone(),
            device: config.device,
            dla_core: config.dla_core,
            precision: config.precision,
            gpu_fallback: config.gpu_fallback,
            profiles: config.profiles.clone(),
            scales,
        };
        let bytes = plan.to_bytes()?;
        self.builds.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            bytes = bytes.len(),
            dynamic,
            device = %config.device,
            duration_us = start.elapsed().as_micros() as u64,
            "plan_built"
        );
        Ok(bytes)
    }

    fn deserialize_engine(&self, plan: &[u8]) -> Result<Box<dyn Engine>> {
        let plan = Plan::from_bytes(plan)?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            bindings = plan.network.inputs().len() + plan.network.outputs().len(),
            precision = %plan.precision,
            "engine_loaded"
        );
        Ok(Box::new(ReferenceEngine { plan: Arc::new(plan) }))
    }
}

// ================================================================================================
// Engine and execution context
// ================================================================================================

struct ReferenceEngine {
    plan: Arc<Plan>,
}

impl Engine for ReferenceEngine {
    fn num_bindings(&self) -> usize {
        self.plan.network.inputs().len() + self.plan.network.outputs().len()
    }

    fn binding_index(&self, name: &str) -> Option<usize> {
        let network = &self.plan.network;
        network
            .inputs()
            .iter()
            .chain(network.outputs())
            .position(|id| network.tensors()[id.0].name == name)
    }

    fn binding_is_input(&self, index: usize) -> bool {
        index < self.plan.network.inputs().len()
    }

    fn create_execution_context(&self) -> Result<Box<dyn ExecutionContext>> {
        let network = &self.plan.network;
        let input_dims = network
            .inputs()
            .iter()
            .map(|id| {
                let dims = &network.tensors()[id.0].dims;
                (!dims.contains(&DYNAMIC_DIM)).then(|| dims.clone())
            })
            .collect();
        Ok(Box::new(ReferenceContext {
            plan: Arc::clone(&self.plan),
            input_dims,
        }))
    }
}

struct ReferenceContext {
    plan: Arc<Plan>,
    /// Concrete shape per input binding; static inputs start out set.
    input_dims: Vec<Option<Vec<i32>>>,
}

impl ReferenceContext {
    fn specified_inputs(&self) -> Result<Vec<Vec<i32>>> {
        self.input_dims
            .iter()
            .enumerate()
            .map(|(index, dims)| {
                dims.clone()
                    .ok_or_else(|| BackendError::binding(format!("shape of input binding {index} is not specified")))
            })
            .collect()
    }
}

impl ExecutionContext for ReferenceContext {
    fn set_binding_dimensions(&mut self, index: usize, dims: &[i32]) -> Result<()> {
        let network = &self.plan.network;
        let id = network
            .inputs()
            .get(index)
            .ok_or_else(|| BackendError::binding(format!("binding {index} is not an input")))?;
        let tensor = network.tensor(*id)?;
        let accepted = match self.plan.profile(&tensor.name) {
            Some(profile) => profile.range.contains(dims),
            None => dims == tensor.dims.as_slice(),
        };
        if !accepted {
            return Err(BackendError::binding(format!(
                "shape {dims:?} is outside the profile of {}",
                tensor.name
            )));
        }
        self.input_dims[index] = Some(dims.to_vec());
        Ok(())
    }

    fn all_input_dimensions_specified(&self) -> bool {
        self.input_dims.iter().all(Option::is_some)
    }

    fn binding_dimensions(&self, index: usize) -> Result<Vec<i32>> {
        let network = &self.plan.network;
        let inputs = network.inputs().len();
        if let Some(dims) = self.input_dims.get(index) {
            return Ok(dims
                .clone()
                .unwrap_or_else(|| network.tensors()[network.inputs()[index].0].dims.clone()));
        }
        let id = network
            .outputs()
            .get(index - inputs)
            .ok_or_else(|| BackendError::binding(format!("binding {index} does not exist")))?;
        let resolved = network.resolve_dims(&self.specified_inputs()?)?;
        Ok(resolved[id.0].clone())
    }

    fn enqueue(&mut self, bindings: &[TensorRef]) -> BoxFuture<'static, Result<()>> {
        let expected = self.plan.network.inputs().len() + self.plan.network.outputs().len();
        if bindings.len() != expected {
            let err = BackendError::binding(format!("{} bindings given, engine has {expected}", bindings.len()));
            return future::ready(Err(err)).boxed();
        }
        let input_dims = match self.specified_inputs() {
            Ok(dims) => dims,
            Err(err) => return future::ready(Err(err)).boxed(),
        };
        let plan = Arc::clone(&self.plan);
        let bindings = bindings.to_vec();
        let (sender, receiver) = oneshot::channel();
        rayon::spawn(move || {
            let _ = sender.send(run_plan(&plan, &input_dims, &bindings));
        });
        async move {
            receiver
                .await
                .map_err(|_| BackendError::execution_error("accelerator run was dropped"))?
        }
        .boxed()
    }
}

// ================================================================================================
// Evaluation
// ================================================================================================

struct Numerics<'a> {
    precision: PrecisionMode,
    scales: &'a BTreeMap<String, f32>,
}

impl Numerics<'_> {
    fn apply(&self, name: &str, values: &mut [f32]) {
        match self.precision {
            PrecisionMode::Float32 => {}
            PrecisionMode::Float16 => round_to_f16(values),
            PrecisionMode::Int8 => {
                if let Some(&scale) = self.scales.get(name) {
                    fake_quantize_i8(values, scale);
                }
            }
        }
    }
}

/// Values of every tensor after running the network once.
fn evaluate(
    network: &Network,
    numerics: &Numerics<'_>,
    inputs: Vec<Vec<f32>>,
    dims: &[Vec<i32>],
) -> Result<Vec<Option<Vec<f32>>>> {
    let tensors = network.tensors();
    let mut values: Vec<Option<Vec<f32>>> = tensors.iter().map(|tensor| tensor.constant.clone()).collect();
    for (id, data) in network.inputs().iter().zip(inputs) {
        values[id.0] = Some(data);
    }
    for (index, value) in values.iter_mut().enumerate() {
        if let Some(value) = value {
            numerics.apply(&tensors[index].name, value);
        }
    }

    for layer in network.layers() {
        let out_dims = &dims[layer.output.0];
        let sources = layer
            .inputs
            .iter()
            .map(|id| {
                values[id.0]
                    .as_deref()
                    .ok_or_else(|| BackendError::execution_error(format!("{} input {} is empty", layer.name, id.0)))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut out = match layer.kind {
            LayerKind::Elementwise(op) => {
                let mut out = vec![0f32; element_count(out_dims)?];
                op.evaluate(&sources, &mut out)?;
                out
            }
            LayerKind::Softmax { axis } => {
                let mut out = sources
                    .first()
                    .map(|source| source.to_vec())
                    .ok_or_else(|| BackendError::execution_error(format!("{} has no input", layer.name)))?;
                softmax(&mut out, out_dims, axis)?;
                out
            }
        };
        numerics.apply(&tensors[layer.output.0].name, &mut out);
        values[layer.output.0] = Some(out);
    }
    Ok(values)
}

fn run_plan(plan: &Plan, input_dims: &[Vec<i32>], bindings: &[TensorRef]) -> Result<()> {
    let start = Instant::now();
    let network = &plan.network;
    let mut inputs = Vec::with_capacity(input_dims.len());
    for (index, dims) in input_dims.iter().enumerate() {
        let tensor = bindings[index].read();
        if tensor.dims() != dims.as_slice() {
            return Err(BackendError::binding(format!(
                "input binding {index} holds {:?}, context expects {dims:?}",
                tensor.dims()
            )));
        }
        inputs.push(tensor.to_f32_vec()?);
    }

    let dims = network.resolve_dims(input_dims)?;
    let numerics = Numerics {
        precision: plan.precision,
        scales: &plan.scales,
    };
    let values = evaluate(network, &numerics, inputs, &dims)?;

    let first_output = input_dims.len();
    for (j, id) in network.outputs().iter().enumerate() {
        let data = values[id.0]
            .as_deref()
            .ok_or_else(|| BackendError::execution_error(format!("output{j} was not computed")))?;
        let mut tensor = bindings[first_output + j].write();
        if !tensor.is_allocated() {
            return Err(BackendError::binding(format!("output binding {j} is not allocated")));
        }
        tensor.set_precision(network.tensor(*id)?.precision);
        tensor.write_f32(&dims[id.0], data)?;
    }
    tracing::trace!(
        layers = network.layers().len(),
        duration_us = start.elapsed().as_micros() as u64,
        "plan_executed"
    );
    Ok(())
}

// ================================================================================================
// Int8 calibration
// ================================================================================================

fn calibrate(network: &Network, calibrator: &Int8Calibrator) -> Result<BTreeMap<String, f32>> {
    if let Some(table) = calibrator.table_path.as_deref().filter(|path| path.exists()) {
        let scales = read_table(table)?;
        tracing::debug!(path = %table.display(), tensors = scales.len(), "calibration_table_loaded");
        return Ok(scales);
    }
    let dataset = calibrator
        .dataset_path
        .as_deref()
        .ok_or_else(|| BackendError::Calibration("neither a calibration table nor a dataset is available".into()))?;
    let text = fs::read_to_string(dataset)?;

    let input_dims = network
        .inputs()
        .iter()
        .map(|id| network.tensor(*id).map(|tensor| tensor.dims.clone()))
        .collect::<Result<Vec<_>>>()?;
    let sizes = input_dims
        .iter()
        .map(|dims| element_count(dims))
        .collect::<tessera_ir::Result<Vec<_>>>()?;
    let sample_len: usize = sizes.iter().sum();
    let dims = network.resolve_dims(&input_dims)?;
    let empty = BTreeMap::new();
    let exact = Numerics {
        precision: PrecisionMode::Float32,
        scales: &empty,
    };

    let mut max_abs = vec![0f32; network.tensors().len()];
    let mut samples = 0usize;
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let values = line
            .split_whitespace()
            .map(|value| {
                value
                    .parse::<f32>()
                    .map_err(|err| BackendError::Calibration(format!("line {}: {err}", line_no + 1)))
            })
            .collect::<Result<Vec<_>>>()?;
        if values.len() != sample_len {
            return Err(BackendError::Calibration(format!(
                "line {} holds {} values, a sample needs {sample_len}",
                line_no + 1,
                values.len()
            )));
        }
        let mut offset = 0;
        let inputs = sizes
            .iter()
            .map(|&size| {
                let chunk = values[offset..offset + size].to_vec();
                offset += size;
                chunk
            })
            .collect();
        for (index, value) in evaluate(network, &exact, inputs, &dims)?.iter().enumerate() {
            if let Some(value) = value {
                let peak = value.iter().fold(0f32, |peak, v| peak.max(v.abs()));
                max_abs[index] = max_abs[index].max(peak);
            }
        }
        samples += 1;
    }
    if samples == 0 {
        return Err(BackendError::Calibration(format!("{} holds no samples", dataset.display())));
    }

    let scales: BTreeMap<String, f32> = network
        .tensors()
        .iter()
        .zip(&max_abs)
        .filter(|(_, peak)| **peak > 0.0)
        .map(|(tensor, &peak)| (tensor.name.clone(), peak / INT8_MAX))
        .collect();
    let batch_size = calibrator.batch_size.max(1) as usize;
    tracing::debug!(
        samples,
        batches = samples.div_ceil(batch_size),
        tensors = scales.len(),
        "calibration_complete"
    );
    if let Some(table) = &calibrator.table_path {
        write_table(table, &scales)?;
    }
    Ok(scales)
}

/// Calibration table: one `name: scale` pair per line.
fn read_table(path: &Path) -> Result<BTreeMap<String, f32>> {
    let text = fs::read_to_string(path)?;
    let mut scales = BTreeMap::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, scale) = line
            .split_once(':')
            .ok_or_else(|| BackendError::Calibration(format!("{}:{} is not 'name: scale'", path.display(), line_no + 1)))?;
        let scale = scale
            .trim()
            .parse::<f32>()
            .map_err(|err| BackendError::Calibration(format!("{}:{}: {err}", path.display(), line_no + 1)))?;
        scales.insert(name.trim().to_string(), scale);
    }
    Ok(scales)
}

fn write_table(path: &Path, scales: &BTreeMap<String, f32>) -> Result<()> {
    let text: String = scales.iter().map(|(name, scale)| format!("{name}: {scale}\n")).collect();
    fs::write(path, text)?;
    tracing::debug!(path = %path.display(), tensors = scales.len(), "calibration_table_written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::OptimizationProfile;
    use crate::kernel::math::ElementwiseOp;
    use crate::tensor::Tensor;
    use futures::executor::block_on;
    use tessera_ir::{Precision, ShapeRange};

    fn scale_network(dims: Vec<i32>, range: Option<ShapeRange>) -> Network {
        let mut network = Network::new(true);
        let x = network.add_input("input0", Precision::Float32, dims, range);
        let c = network.add_constant("const0", vec![1], vec![2.0]).unwrap();
        let y = network.add_layer(LayerKind::Elementwise(ElementwiseOp::Mul), &[x, c]).unwrap();
        network.mark_output(y, "output0").unwrap();
        network
    }

    fn output_tensor() -> TensorRef {
        let mut tensor = Tensor::host();
        tensor.resize(&[1]).unwrap();
        tensor.shared()
    }

    #[test]
    fn static_plan_runs() {
        let accelerator = ReferenceAccelerator::new();
        let plan = accelerator
            .build_serialized_network(&scale_network(vec![3], None), &BuilderConfig::default())
            .unwrap();
        let engine = accelerator.deserialize_engine(&plan).unwrap();
        assert_eq!(engine.num_bindings(), 2);
        assert_eq!(engine.binding_index("output0"), Some(1));
        assert!(engine.binding_is_input(0));

        let mut context = engine.create_execution_context().unwrap();
        assert!(context.all_input_dimensions_specified());
        let input = Tensor::from_f32(&[3], &[1.0, 2.0, 3.0]).unwrap().shared();
        let output = output_tensor();
        block_on(context.enqueue(&[input, output.clone()])).unwrap();
        assert_eq!(output.read().to_f32_vec().unwrap(), vec![2.0, 4.0, 6.0]);
        assert_eq!(accelerator.builds(), 1);
        assert_eq!(accelerator.loads(), 1);
    }

    #[test]
    fn dynamic_inputs_follow_their_profile() {
        let range = ShapeRange::new(vec![1, 3], vec![1, 1], vec![1, 5]).unwrap();
        let network = scale_network(vec![1, -1], Some(range.clone()));
        let accelerator = ReferenceAccelerator::new();

        let err = accelerator
            .build_serialized_network(&network, &BuilderConfig::default())
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(_)));

        let config = BuilderConfig {
            profiles: vec![OptimizationProfile {
                input: "input0".into(),
                range,
            }],
            ..BuilderConfig::default()
        };
        let plan = accelerator.build_serialized_network(&network, &config).unwrap();
        let mut context = accelerator
            .deserialize_engine(&plan)
            .unwrap()
            .create_execution_context()
            .unwrap();
        assert!(!context.all_input_dimensions_specified());
        assert!(context.set_binding_dimensions(0, &[1, 6]).is_err());
        context.set_binding_dimensions(0, &[1, 4]).unwrap();
        assert_eq!(context.binding_dimensions(1).unwrap(), vec![1, 4]);

        let input = Tensor::from_f32(&[1, 4], &[1.0, -1.0, 0.5, 0.0]).unwrap().shared();
        let output = output_tensor();
        block_on(context.enqueue(&[input, output.clone()])).unwrap();
        let output = output.read();
        assert_eq!(output.dims(), &[1, 4]);
        assert_eq!(output.to_f32_vec().unwrap(), vec![2.0, -2.0, 1.0, 0.0]);
    }

    #[test]
    fn int8_rejects_dynamic_shapes() {
        let range = ShapeRange::new(vec![2], vec![1], vec![4]).unwrap();
        let config = BuilderConfig {
            precision: PrecisionMode::Int8,
            profiles: vec![OptimizationProfile {
                input: "input0".into(),
                range: range.clone(),
            }],
            ..BuilderConfig::default()
        };
        let err = ReferenceAccelerator::new()
            .build_serialized_network(&scale_network(vec![-1], Some(range)), &config)
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(_)));
    }

    #[test]
    fn int8_calibrates_and_writes_table() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("samples.txt");
        let table = dir.path().join("calibration.table");
        fs::write(&dataset, "1.0 -2.0\n# comment\n0.5 1.5\n").unwrap();
        let config = BuilderConfig {
            precision: PrecisionMode::Int8,
            calibrator: Some(Int8Calibrator {
                batch_size: 1,
                dataset_path: Some(dataset),
                table_path: Some(table.clone()),
            }),
            ..BuilderConfig::default()
        };
        let accelerator = ReferenceAccelerator::new();
        let bytes = accelerator
            .build_serialized_network(&scale_network(vec![2], None), &config)
            .unwrap();
        let plan = Plan::from_bytes(&bytes).unwrap();
        assert_eq!(plan.scales.get("input0"), Some(&(2.0 / INT8_MAX)));
        assert_eq!(plan.scales.get("output0"), Some(&(4.0 / INT8_MAX)));

        let written = read_table(&table).unwrap();
        assert_eq!(written, plan.scales);

        // The table alone is enough for a rebuild.
        let config = BuilderConfig {
            calibrator: Some(Int8Calibrator {
                batch_size: 1,
                dataset_path: None,
                table_path: Some(table),
            }),
            ..config
        };
        let rebuilt = accelerator
            .build_serialized_network(&scale_network(vec![2], None), &config)
            .unwrap();
        assert_eq!(Plan::from_bytes(&rebuilt).unwrap().scales, plan.scales);
    }

    #[test]
    fn float16_rounds_values() {
        let accelerator = ReferenceAccelerator::new();
        let config = BuilderConfig {
            precision: PrecisionMode::Float16,
            ..BuilderConfig::default()
        };
        let plan = accelerator
            .build_serialized_network(&scale_network(vec![1], None), &config)
            .unwrap();
        let mut context = accelerator
            .deserialize_engine(&plan)
            .unwrap()
            .create_execution_context()
            .unwrap();
        let input = Tensor::from_f32(&[1], &[1.0001]).unwrap().shared();
        let output = output_tensor();
        block_on(context.enqueue(&[input, output.clone()])).unwrap();
        assert_eq!(output.read().to_f32_vec().unwrap(), vec![2.0]);
    }

    #[test]
    fn dla_core_must_exist() {
        let config = BuilderConfig {
            device: DeviceKind::Dla,
            dla_core: Some(1),
            precision: PrecisionMode::Float16,
            ..BuilderConfig::default()
        };
        let network = scale_network(vec![2], None);
        assert!(ReferenceAccelerator::new()
            .with_dla_cores(1)
            .build_serialized_network(&network, &config)
            .is_err());
        assert!(ReferenceAccelerator::new()
            .with_dla_cores(2)
            .build_serialized_network(&network, &config)
            .is_ok());
    }
}
