//! Ahead-of-time accelerator runtime
//!
//! An accelerator compiles a [`Network`] into an opaque serialized plan,
//! then loads that plan into an [`Engine`] whose [`ExecutionContext`]s
//! run it over bound tensors.
//!
//! ```text
//! Graph ──ConverterRegistry──► Network ──Accelerator::build_serialized_network──► plan bytes
//!                                                                                   │
//!          ExecutionContext ◄── Engine::create_execution_context ◄── deserialize_engine
//! ```
//!
//! Engine bindings are addressed by index. Names follow the converter's
//! convention: `input{i}` for network inputs, `output{i}` for outputs.

pub mod converter;
pub mod network;
pub mod plan;
pub mod reference;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tessera_ir::ShapeRange;

use crate::error::{BackendError, Result};
use crate::tensor::TensorRef;

pub use converter::{ConvertFn, Converter, ConverterRegistry};
pub use network::{Layer, LayerKind, Network, NetworkTensor, TensorId};
pub use plan::{Plan, PLAN_VERSION};
pub use reference::ReferenceAccelerator;

/// Device class a plan is compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceKind {
    #[default]
    Gpu,
    /// Dedicated deep-learning core.
    Dla,
}

impl FromStr for DeviceKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GPU" => Ok(Self::Gpu),
            "DLA" => Ok(Self::Dla),
            other => Err(BackendError::invalid_config(format!("unknown device type '{other}'"))),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => f.write_str("GPU"),
            Self::Dla => f.write_str("DLA"),
        }
    }
}

/// Numeric mode a plan is compiled in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrecisionMode {
    #[default]
    Float32,
    Float16,
    Int8,
}

impl FromStr for PrecisionMode {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FP32" | "FLOAT32" => Ok(Self::Float32),
            "FP16" | "FLOAT16" => Ok(Self::Float16),
            "INT8" => Ok(Self::Int8),
            other => Err(BackendError::invalid_config(format!("unknown precision '{other}'"))),
        }
    }
}

impl fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float32 => f.write_str("FP32"),
            Self::Float16 => f.write_str("FP16"),
            Self::Int8 => f.write_str("INT8"),
        }
    }
}

/// Shape range one dynamic input is tuned for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationProfile {
    /// Binding name of the input.
    pub input: String,
    pub range: ShapeRange,
}

/// Calibration source for int8 plans.
///
/// A readable table is used as is. Otherwise scales are measured from the
/// dataset and written to the table path when one is given.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Int8Calibrator {
    pub batch_size: u32,
    pub dataset_path: Option<PathBuf>,
    pub table_path: Option<PathBuf>,
}

/// Plan build options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuilderConfig {
    pub device: DeviceKind,
    /// Dedicated core to compile for; `None` keeps the default core.
    pub dla_core: Option<u32>,
    pub precision: PrecisionMode,
    /// Let layers a dedicated core cannot run fall back to the GPU.
    pub gpu_fallback: bool,
    pub profiles: Vec<OptimizationProfile>,
    pub calibrator: Option<Int8Calibrator>,
}

impl BuilderConfig {
    pub fn profile(&self, input: &str) -> Option<&OptimizationProfile> {
        self.profiles.iter().find(|profile| profile.input == input)
    }
}

// ================================================================================================
// Runtime traits
// ================================================================================================

/// Plan compiler and loader.
pub trait Accelerator: Send + Sync {
    fn name(&self) -> &str;

    /// Number of dedicated deep-learning cores on the device.
    fn num_dla_cores(&self) -> u32;

    /// Compile `network` into serialized plan bytes.
    fn build_serialized_network(&self, network: &Network, config: &BuilderConfig) -> Result<Vec<u8>>;

    /// Load an engine from plan bytes produced by
    /// [`Accelerator::build_serialized_network`].
    fn deserialize_engine(&self, plan: &[u8]) -> Result<Box<dyn Engine>>;
}

/// A loaded plan.
pub trait Engine: Send {
    /// Inputs followed by outputs.
    fn num_bindings(&self) -> usize;

    fn binding_index(&self, name: &str) -> Option<usize>;

    fn binding_is_input(&self, index: usize) -> bool;

    fn create_execution_context(&self) -> Result<Box<dyn ExecutionContext>>;
}

/// Per-run state of an engine: concrete input shapes and the launch.
pub trait ExecutionContext: Send {
    /// Set the concrete shape of input binding `index`.
    fn set_binding_dimensions(&mut self, index: usize, dims: &[i32]) -> Result<()>;

    fn all_input_dimensions_specified(&self) -> bool;

    /// Shape of binding `index` under the current input shapes.
    fn binding_dimensions(&self, index: usize) -> Result<Vec<i32>>;

    /// Start a run over `bindings` (one tensor per binding, by index). The
    /// future resolves once every output tensor has been written.
    fn enqueue(&mut self, bindings: &[TensorRef]) -> BoxFuture<'static, Result<()>>;
}
