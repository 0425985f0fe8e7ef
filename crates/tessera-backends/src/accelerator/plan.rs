//! Serialized execution plan of the reference accelerator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::network::Network;
use super::{DeviceKind, OptimizationProfile, PrecisionMode};
use crate::error::{BackendError, Result};

/// Bumped whenever the plan layout changes.
pub const PLAN_VERSION: u32 = 1;

/// A compiled network together with the build decisions baked into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub version: u32,
    pub network: Network,
    pub device: DeviceKind,
    pub dla_core: Option<u32>,
    pub precision: PrecisionMode,
    pub gpu_fallback: bool,
    pub profiles: Vec<OptimizationProfile>,
    /// Int8 scale per tensor name.
    pub scales: BTreeMap<String, f32>,
}

impl Plan {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode and validate plan bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let plan: Plan = bincode::deserialize(bytes)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != PLAN_VERSION {
            return Err(BackendError::InvalidPlan(format!(
                "plan version {} is not supported (expected {PLAN_VERSION})",
                self.version
            )));
        }
        self.network.validate()?;
        for profile in &self.profiles {
            profile.range.validate()?;
        }
        Ok(())
    }

    pub fn profile(&self, input: &str) -> Option<&OptimizationProfile> {
        self.profiles.iter().find(|profile| profile.input == input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_ir::Precision;

    fn plan() -> Plan {
        let mut network = Network::new(true);
        network.add_input("input0", Precision::Float32, vec![2], None);
        Plan {
            version: PLAN_VERSION,
            network,
            device: DeviceKind::Gpu,
            dla_core: None,
            precision: PrecisionMode::Float32,
            gpu_fallback: false,
            profiles: Vec::new(),
            scales: BTreeMap::new(),
        }
    }

    #[test]
    fn bytes_load_back() {
        let plan = plan();
        assert_eq!(Plan::from_bytes(&plan.to_bytes().unwrap()).unwrap(), plan);
    }

    #[test]
    fn rejects_foreign_versions_and_garbage() {
        let mut plan = plan();
        plan.version = PLAN_VERSION + 1;
        let err = Plan::from_bytes(&plan.to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, BackendError::InvalidPlan(_)));
        assert!(Plan::from_bytes(&[1, 2, 3]).is_err());
    }
}
