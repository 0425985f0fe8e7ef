//! Program configuration and the shared build context
//!
//! Configuration comes from a `KEY=VALUE;KEY=VALUE` property string. Keys
//! missing from the string fall back to environment variables of the same
//! name:
//!
//! | Key                                | Value                          | Default |
//! |------------------------------------|--------------------------------|---------|
//! | `TESSERA_DEVICE_TYPE`              | `GPU` or `DLA`                 | `GPU`   |
//! | `TESSERA_DEVICE_ID`                | dedicated core index           | `0`     |
//! | `TESSERA_PRECISION`                | `FP32`, `FP16` or `INT8`       | `FP32`  |
//! | `TESSERA_GPU_FALLBACK`             | `1`/`true`/`yes`               | off     |
//! | `TESSERA_CALIBRATION_DATASET_PATH` | int8 calibration samples       | none    |
//! | `TESSERA_CALIBRATION_TABLE_PATH`   | int8 calibration table         | none    |
//! | `TESSERA_GPU_OPERATIONS_LIST`      | operations run as GPU kernels  | none    |
//! | `TESSERA_HOST_OPERATIONS_LIST`     | operations run as host kernels | none    |
//!
//! Operation lists are separated by commas or whitespace and use the
//! upper-case operation names (`RELU,ADD`).

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tessera_backends::{
    Accelerator, BackendError, ConverterRegistry, Device, DeviceKind, EmulatedDevice, KernelRegistry, KernelTarget,
    PrecisionMode, ReferenceAccelerator,
};
use tessera_ir::OperationType;
use tessera_tracing::parse_flag;

use crate::error::{Error, Result};
use crate::partition::SupportTables;
use crate::passes::GraphPass;

pub const DEVICE_TYPE: &str = "TESSERA_DEVICE_TYPE";
pub const DEVICE_ID: &str = "TESSERA_DEVICE_ID";
pub const PRECISION: &str = "TESSERA_PRECISION";
pub const GPU_FALLBACK: &str = "TESSERA_GPU_FALLBACK";
pub const CALIBRATION_DATASET_PATH: &str = "TESSERA_CALIBRATION_DATASET_PATH";
pub const CALIBRATION_TABLE_PATH: &str = "TESSERA_CALIBRATION_TABLE_PATH";
pub const GPU_OPERATIONS_LIST: &str = "TESSERA_GPU_OPERATIONS_LIST";
pub const HOST_OPERATIONS_LIST: &str = "TESSERA_HOST_OPERATIONS_LIST";

const KEYS: [&str; 8] = [
    DEVICE_TYPE,
    DEVICE_ID,
    PRECISION,
    GPU_FALLBACK,
    CALIBRATION_DATASET_PATH,
    CALIBRATION_TABLE_PATH,
    GPU_OPERATIONS_LIST,
    HOST_OPERATIONS_LIST,
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramConfig {
    pub device_type: DeviceKind,
    /// Dedicated core used when `device_type` is [`DeviceKind::Dla`].
    pub device_id: u32,
    pub precision: PrecisionMode,
    pub gpu_fallback: bool,
    pub calibration_dataset_path: Option<PathBuf>,
    pub calibration_table_path: Option<PathBuf>,
    pub gpu_operations: Vec<OperationType>,
    pub host_operations: Vec<OperationType>,
}

impl ProgramConfig {
    /// Parse a property string, falling back to the environment.
    pub fn from_properties(properties: &str) -> Result<Self> {
        Self::from_sources(properties, |key| env::var(key).ok())
    }

    /// Configuration from the environment alone.
    pub fn from_env() -> Result<Self> {
        Self::from_properties("")
    }

    fn from_sources(properties: &str, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut values = HashMap::new();
        for entry in properties.split(';').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| Error::invalid_config(format!("property '{entry}' is not KEY=VALUE")))?;
            let key = key.trim();
            if !KEYS.contains(&key) {
                tracing::warn!(key, "unknown_property_ignored");
                continue;
            }
            values.insert(key.to_string(), value.trim().to_string());
        }
        let lookup = |key: &str| values.get(key).cloned().or_else(|| env(key));

        let mut config = Self::default();
        if let Some(value) = lookup(DEVICE_TYPE) {
            config.device_type = value.parse()?;
        }
        if let Some(value) = lookup(DEVICE_ID) {
            config.device_id = value
                .trim()
                .parse()
                .map_err(|_| Error::invalid_config(format!("{DEVICE_ID} '{value}' is not a core index")))?;
        }
        if let Some(value) = lookup(PRECISION) {
            config.precision = value.parse()?;
        }
        if let Some(value) = lookup(GPU_FALLBACK) {
            config.gpu_fallback = parse_flag(&value);
        }
        config.calibration_dataset_path = lookup(CALIBRATION_DATASET_PATH)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        config.calibration_table_path = lookup(CALIBRATION_TABLE_PATH)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        if let Some(value) = lookup(GPU_OPERATIONS_LIST) {
            config.gpu_operations = parse_operation_list(&value)?;
        }
        if let Some(value) = lookup(HOST_OPERATIONS_LIST) {
            config.host_operations = parse_operation_list(&value)?;
        }
        config.validate()?;
        tracing::debug!(
            device = %config.device_type,
            device_id = config.device_id,
            precision = %config.precision,
            gpu_fallback = config.gpu_fallback,
            gpu_operations = config.gpu_operations.len(),
            host_operations = config.host_operations.len(),
            "program_config_loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.precision == PrecisionMode::Int8
            && self.calibration_dataset_path.is_none()
            && self.calibration_table_path.is_none()
        {
            return Err(Error::invalid_config(format!(
                "INT8 needs {CALIBRATION_DATASET_PATH} or {CALIBRATION_TABLE_PATH}"
            )));
        }
        Ok(())
    }

    pub fn support_tables(&self) -> SupportTables {
        SupportTables {
            gpu: self.gpu_operations.clone(),
            host: self.host_operations.clone(),
        }
    }
}

/// Parse `RELU, ADD` style lists.
pub fn parse_operation_list(value: &str) -> Result<Vec<OperationType>> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|name| !name.is_empty())
        .map(|name| name.parse::<OperationType>().map_err(Error::from))
        .collect()
}

/// Everything sub-programs need besides their sub-graph.
#[derive(Clone)]
pub struct Context {
    pub config: ProgramConfig,
    pub kernels: Arc<KernelRegistry>,
    pub converters: Arc<ConverterRegistry>,
    pub accelerator: Arc<dyn Accelerator>,
    /// Device for GPU kernel sub-programs.
    pub device: Option<Arc<dyn Device>>,
    /// Passes run on accelerator sub-graphs before conversion.
    pub passes: Vec<Arc<dyn GraphPass>>,
}

impl Context {
    /// Built-in registries, the reference accelerator and an emulated device.
    pub fn new(config: ProgramConfig) -> Self {
        Self {
            config,
            kernels: Arc::new(KernelRegistry::with_defaults()),
            converters: Arc::new(ConverterRegistry::with_defaults()),
            accelerator: Arc::new(ReferenceAccelerator::new()),
            device: Some(Arc::new(EmulatedDevice::new())),
            passes: Vec::new(),
        }
    }

    pub fn with_kernels(mut self, kernels: KernelRegistry) -> Self {
        self.kernels = Arc::new(kernels);
        self
    }

    pub fn with_converters(mut self, converters: ConverterRegistry) -> Self {
        self.converters = Arc::new(converters);
        self
    }

    pub fn with_accelerator(mut self, accelerator: Arc<dyn Accelerator>) -> Self {
        self.accelerator = accelerator;
        self
    }

    pub fn with_device(mut self, device: Option<Arc<dyn Device>>) -> Self {
        self.device = device;
        self
    }

    pub fn with_pass(mut self, pass: Arc<dyn GraphPass>) -> Self {
        self.passes.push(pass);
        self
    }

    /// Check the support tables against the kernel registry.
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        for (target, operations) in [
            (KernelTarget::Gpu, &self.config.gpu_operations),
            (KernelTarget::Host, &self.config.host_operations),
        ] {
            for &op_type in operations {
                if !self.kernels.contains(target, op_type) {
                    return Err(BackendError::KernelNotRegistered { target, op_type }.into());
                }
            }
        }
        if !self.config.gpu_operations.is_empty() && self.device.is_none() {
            return Err(Error::invalid_config("GPU operations are listed but no device is configured"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("kernels", &self.kernels)
            .field("converters", &self.converters)
            .field("accelerator", &self.accelerator.name())
            .field("device", &self.device.as_ref().map(|device| device.name().to_string()))
            .field("passes", &self.passes.iter().map(|pass| pass.name().to_string()).collect::<Vec<_>>())
            .finish()
    }
}
