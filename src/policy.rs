// Engine policy
// Host-tunable validation knobs, loaded once at startup. Defaults are
// permissive; the strict profile is opt-in.

use crate::call::ContractError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Amount-handling policy applied at the module boundary.
///
/// Zero amounts are accepted by default: a free listing or a zero-point
/// recycling drop is well-formed, it just moves nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginePolicy {
    /// Reject zero prices, amounts and point grants as InvalidAmount.
    #[serde(default)]
    pub reject_zero_amounts: bool,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        EnginePolicy {
            reject_zero_amounts: false,
        }
    }
}

impl EnginePolicy {
    /// Strict profile for hosts that treat zero-value flows as operator error.
    pub fn strict() -> Self {
        EnginePolicy {
            reject_zero_amounts: true,
        }
    }

    /// Load a policy from a JSON file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy file {}", path.display()))?;

        let policy: EnginePolicy = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse policy file {}", path.display()))?;

        Ok(policy)
    }

    /// Check one amount argument under this policy.
    pub fn check_amount(&self, amount: u64, what: &str) -> Result<(), ContractError> {
        if self.reject_zero_amounts && amount == 0 {
            return Err(ContractError::InvalidAmount(format!(
                "{} must be greater than zero",
                what
            )));
        }
        Ok(())
    }
}
